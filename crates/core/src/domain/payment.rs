use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::connection::UserId;
use crate::domain::metadata;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentId(pub i64);

impl std::fmt::Display for PaymentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Paid => "PAID",
            Self::Failed => "FAILED",
            Self::Refunded => "REFUNDED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "PAID" => Some(Self::Paid),
            "FAILED" => Some(Self::Failed),
            "REFUNDED" => Some(Self::Refunded),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Monotonic transition rule. The only exit from a terminal state is a refund of a
    /// paid payment.
    pub fn transition(self, next: PaymentStatus) -> StatusTransition<PaymentStatus> {
        if self == next {
            return StatusTransition::Unchanged;
        }

        let allowed = matches!(
            (self, next),
            (Self::Pending, Self::Paid)
                | (Self::Pending, Self::Failed)
                | (Self::Pending, Self::Expired)
                | (Self::Paid, Self::Refunded)
        );

        if allowed {
            StatusTransition::Applied { from: self, to: next }
        } else {
            StatusTransition::Rejected { from: self, to: next }
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of asking a status machine to move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusTransition<S> {
    Applied { from: S, to: S },
    Unchanged,
    Rejected { from: S, to: S },
}

impl<S> StatusTransition<S> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Payin,
    Payout,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Payin => "PAYIN",
            Self::Payout => "PAYOUT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PAYIN" => Some(Self::Payin),
            "PAYOUT" => Some(Self::Payout),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub user_id: UserId,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub method: String,
    pub description: Option<String>,
    pub external_id: Option<String>,
    pub order_id: String,
    pub transaction_type: TransactionType,
    pub telegapay_status: Option<String>,
    pub metadata: Value,
    /// Optimistic concurrency token, bumped on every persisted write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn plan_transition(&self, next: PaymentStatus) -> StatusTransition<PaymentStatus> {
        self.status.transition(next)
    }

    /// Moves to `next` when the state machine allows it. Rejected moves leave the row as is
    /// and are reported to the caller instead of failing the whole write.
    pub fn transition_to(&mut self, next: PaymentStatus) -> StatusTransition<PaymentStatus> {
        let transition = self.plan_transition(next);
        if let StatusTransition::Applied { to, .. } = transition {
            self.status = to;
        }
        transition
    }

    /// Additive metadata write; existing audit entries are never dropped.
    pub fn merge_metadata(&mut self, patch: Value) {
        metadata::merge(&mut self.metadata, patch);
    }

    pub fn append_metadata(&mut self, key: &str, entry: Value) {
        metadata::append(&mut self.metadata, key, entry);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewPayment {
    pub user_id: UserId,
    pub amount: Decimal,
    pub currency: String,
    pub method: String,
    pub description: Option<String>,
    pub order_id: String,
    pub transaction_type: TransactionType,
    pub metadata: Value,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::{Payment, PaymentId, PaymentStatus, StatusTransition, TransactionType};
    use crate::domain::connection::UserId;

    fn payment(status: PaymentStatus) -> Payment {
        Payment {
            id: PaymentId(1),
            user_id: UserId(1),
            amount: Decimal::new(1000, 0),
            currency: "RUB".to_string(),
            status,
            method: "TELEGRAM_PAY".to_string(),
            description: None,
            external_id: Some("tx1".to_string()),
            order_id: "paylink_1000".to_string(),
            transaction_type: TransactionType::Payin,
            telegapay_status: None,
            metadata: json!({}),
            version: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn status_storage_encoding_round_trips() {
        for status in [
            PaymentStatus::Pending,
            PaymentStatus::Paid,
            PaymentStatus::Failed,
            PaymentStatus::Refunded,
            PaymentStatus::Expired,
        ] {
            assert_eq!(PaymentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TransactionType::parse("payout"), Some(TransactionType::Payout));
    }

    #[test]
    fn pending_moves_to_any_settlement() {
        for next in [PaymentStatus::Paid, PaymentStatus::Failed, PaymentStatus::Expired] {
            let mut p = payment(PaymentStatus::Pending);
            assert_eq!(
                p.transition_to(next),
                StatusTransition::Applied { from: PaymentStatus::Pending, to: next }
            );
            assert_eq!(p.status, next);
        }
    }

    #[test]
    fn terminal_states_do_not_move_except_refund() {
        let terminals = [
            PaymentStatus::Paid,
            PaymentStatus::Failed,
            PaymentStatus::Refunded,
            PaymentStatus::Expired,
        ];
        for from in terminals {
            for to in terminals.iter().copied().chain([PaymentStatus::Pending]) {
                let outcome = from.transition(to);
                if from == to {
                    assert_eq!(outcome, StatusTransition::Unchanged);
                } else if from == PaymentStatus::Paid && to == PaymentStatus::Refunded {
                    assert!(outcome.is_applied());
                } else {
                    assert_eq!(outcome, StatusTransition::Rejected { from, to });
                }
            }
        }
    }

    #[test]
    fn rejected_transition_leaves_status_alone() {
        let mut p = payment(PaymentStatus::Failed);
        assert_eq!(
            p.transition_to(PaymentStatus::Paid),
            StatusTransition::Rejected { from: PaymentStatus::Failed, to: PaymentStatus::Paid }
        );
        assert_eq!(p.status, PaymentStatus::Failed);
        assert_eq!(p.transition_to(PaymentStatus::Failed), StatusTransition::Unchanged);
    }

    #[test]
    fn pending_cannot_be_refunded() {
        assert!(matches!(
            PaymentStatus::Pending.transition(PaymentStatus::Refunded),
            StatusTransition::Rejected { .. }
        ));
    }

    #[test]
    fn metadata_updates_accumulate() {
        let mut p = payment(PaymentStatus::Pending);
        p.merge_metadata(json!({"payment_method": "BANK_SBER"}));
        p.append_metadata("webhooks", json!({"status": "pending"}));
        p.append_metadata("webhooks", json!({"status": "paid"}));
        p.merge_metadata(json!({"gateway": {"status": "awaiting"}}));

        assert_eq!(p.metadata["payment_method"], "BANK_SBER");
        assert_eq!(p.metadata["webhooks"].as_array().map(Vec::len), Some(2));
        assert_eq!(p.metadata["gateway"]["status"], "awaiting");
    }
}
