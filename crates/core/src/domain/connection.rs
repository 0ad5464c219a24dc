use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ApplicationError;

/// Authenticated owner id handed to the core by the surrounding auth layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl UserId {
    /// Strict parse. Malformed or non-positive ids are rejected, never coerced.
    pub fn parse(raw: &str) -> Result<Self, ApplicationError> {
        let trimmed = raw.trim();
        let value = trimmed
            .parse::<i64>()
            .map_err(|_| ApplicationError::Validation(format!("malformed user id `{trimmed}`")))?;
        Self::new(value)
    }

    pub fn new(value: i64) -> Result<Self, ApplicationError> {
        if value <= 0 {
            return Err(ApplicationError::Validation(format!(
                "user id must be positive, got {value}"
            )));
        }
        Ok(Self(value))
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrmConnectionId(pub i64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrmProvider {
    #[serde(rename = "AMOCRM")]
    AmoCrm,
    #[serde(rename = "BITRIX24")]
    Bitrix24,
    #[serde(rename = "TELEGA_VPN")]
    TelegaVpn,
}

impl CrmProvider {
    pub const ALL: [CrmProvider; 3] = [Self::AmoCrm, Self::Bitrix24, Self::TelegaVpn];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AmoCrm => "AMOCRM",
            Self::Bitrix24 => "BITRIX24",
            Self::TelegaVpn => "TELEGA_VPN",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "AMOCRM" | "AMO_CRM" => Some(Self::AmoCrm),
            "BITRIX24" | "BITRIX_24" => Some(Self::Bitrix24),
            "TELEGA_VPN" | "TELEGAVPN" => Some(Self::TelegaVpn),
            _ => None,
        }
    }
}

impl std::fmt::Display for CrmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CrmProvider {
    type Err = ApplicationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| ApplicationError::UnsupportedProvider(value.to_string()))
    }
}

/// Decrypted view of a stored connection. Only ever materialized at read time.
#[derive(Clone, Debug)]
pub struct CrmConnection {
    pub id: CrmConnectionId,
    pub user_id: UserId,
    pub provider: CrmProvider,
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub domain: Option<String>,
    pub other_data: Option<Value>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CrmConnection {
    pub fn ensure_provider(&self, requested: CrmProvider) -> Result<(), ApplicationError> {
        if self.provider != requested {
            return Err(ApplicationError::ProviderMismatch {
                expected: requested,
                actual: self.provider,
            });
        }
        Ok(())
    }

    /// Provider is fixed for the lifetime of a connection.
    pub fn ensure_provider_unchanged(
        &self,
        requested: CrmProvider,
    ) -> Result<(), ApplicationError> {
        if self.provider != requested {
            return Err(ApplicationError::Validation(format!(
                "connection provider is immutable ({} -> {}); delete the connection first",
                self.provider, requested
            )));
        }
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|expires_at| expires_at <= now).unwrap_or(false)
    }
}

#[derive(Clone, Debug)]
pub struct NewCrmConnection {
    pub user_id: UserId,
    pub provider: CrmProvider,
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub domain: Option<String>,
    pub other_data: Option<Value>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default)]
pub struct CrmConnectionPatch {
    pub provider: Option<CrmProvider>,
    pub access_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub domain: Option<String>,
    pub other_data: Option<Value>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: Option<bool>,
}

/// Local shadow of a contact created in an external CRM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmUser {
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub bot_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
