use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::connection::UserId;
use crate::domain::payment::{PaymentId, StatusTransition};
use crate::errors::DomainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub i64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Pending,
    Paid,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Paid => "PAID",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "PAID" => Some(Self::Paid),
            "CANCELLED" => Some(Self::Cancelled),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn transition(self, next: SubscriptionStatus) -> StatusTransition<SubscriptionStatus> {
        if self == next {
            return StatusTransition::Unchanged;
        }

        let allowed = matches!(
            (self, next),
            (Self::Pending, Self::Paid)
                | (Self::Pending, Self::Cancelled)
                | (Self::Pending, Self::Expired)
                | (Self::Paid, Self::Cancelled)
                | (Self::Paid, Self::Expired)
        );

        if allowed {
            StatusTransition::Applied { from: self, to: next }
        } else {
            StatusTransition::Rejected { from: self, to: next }
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionPlan {
    Basic,
    Premium,
    Enterprise,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlanFeature {
    pub name: &'static str,
    pub value: &'static str,
    pub description: &'static str,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlanDetails {
    pub id: SubscriptionPlan,
    pub name: &'static str,
    pub description: &'static str,
    pub price: Decimal,
    pub currency: &'static str,
    pub duration_days: u32,
    pub features: Vec<PlanFeature>,
}

const BASE_FEATURES: &[PlanFeature] = &[
    PlanFeature { name: "VPN access", value: "true", description: "Access to the VPN network" },
    PlanFeature { name: "Devices", value: "1", description: "Simultaneously connected devices" },
    PlanFeature { name: "Support", value: "email", description: "Support over email" },
];

const PREMIUM_FEATURES: &[PlanFeature] = &[
    PlanFeature { name: "Devices", value: "5", description: "Simultaneously connected devices" },
    PlanFeature { name: "Premium support", value: "true", description: "Priority support" },
    PlanFeature {
        name: "Priority access",
        value: "true",
        description: "Get priority access to new features",
    },
    PlanFeature {
        name: "Advanced analytics",
        value: "true",
        description: "Access to advanced analytics",
    },
];

const ENTERPRISE_FEATURES: &[PlanFeature] = &[
    PlanFeature {
        name: "Custom integrations",
        value: "true",
        description: "Integrations built for your workflow",
    },
    PlanFeature {
        name: "Dedicated account manager",
        value: "true",
        description: "A named contact for your account",
    },
    PlanFeature { name: "SLA 99.9%", value: "true", description: "Guaranteed availability" },
];

impl SubscriptionPlan {
    pub const ALL: [SubscriptionPlan; 3] = [Self::Basic, Self::Premium, Self::Enterprise];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "BASIC",
            Self::Premium => "PREMIUM",
            Self::Enterprise => "ENTERPRISE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "BASIC" => Some(Self::Basic),
            "PREMIUM" => Some(Self::Premium),
            "ENTERPRISE" => Some(Self::Enterprise),
            _ => None,
        }
    }

    pub fn price(&self) -> Decimal {
        match self {
            Self::Basic => Decimal::new(1000, 0),
            Self::Premium => Decimal::new(3000, 0),
            Self::Enterprise => Decimal::new(5000, 0),
        }
    }

    pub fn details(&self, duration_days: u32) -> PlanDetails {
        let (name, description, tiers): (_, _, &[&[PlanFeature]]) = match self {
            Self::Basic => {
                ("Basic", "Basic subscription plan with essential features", &[BASE_FEATURES])
            }
            Self::Premium => (
                "Premium",
                "Premium subscription with all features",
                &[BASE_FEATURES, PREMIUM_FEATURES],
            ),
            Self::Enterprise => (
                "Enterprise",
                "Enterprise subscription with custom features",
                &[BASE_FEATURES, PREMIUM_FEATURES, ENTERPRISE_FEATURES],
            ),
        };

        PlanDetails {
            id: *self,
            name,
            description,
            price: self.price(),
            currency: "RUB",
            duration_days,
            features: tiers.iter().flat_map(|tier| tier.iter().cloned()).collect(),
        }
    }

    pub fn catalog(duration_days: u32) -> Vec<PlanDetails> {
        Self::ALL.iter().map(|plan| plan.details(duration_days)).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub user_id: UserId,
    pub bot_id: i64,
    pub plan: SubscriptionPlan,
    pub status: SubscriptionStatus,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub payment_id: Option<PaymentId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Opens the paid period `[now, now + duration_days)`.
    pub fn activate(
        &mut self,
        now: DateTime<Utc>,
        duration_days: u32,
    ) -> Result<bool, DomainError> {
        let changed = self.move_to(SubscriptionStatus::Paid)?;
        if changed {
            self.period_start = Some(now);
            self.period_end = Some(now + Duration::days(i64::from(duration_days)));
        }
        Ok(changed)
    }

    pub fn cancel(&mut self) -> Result<bool, DomainError> {
        self.move_to(SubscriptionStatus::Cancelled)
    }

    fn move_to(&mut self, next: SubscriptionStatus) -> Result<bool, DomainError> {
        match self.status.transition(next) {
            StatusTransition::Applied { to, .. } => {
                self.status = to;
                Ok(true)
            }
            StatusTransition::Unchanged => Ok(false),
            StatusTransition::Rejected { from, to } => {
                Err(DomainError::InvalidSubscriptionTransition { from, to })
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewSubscription {
    pub user_id: UserId,
    pub bot_id: i64,
    pub plan: SubscriptionPlan,
    pub payment_id: Option<PaymentId>,
}
