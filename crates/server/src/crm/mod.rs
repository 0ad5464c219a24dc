//! CRM provider adapters, provider dispatch and connection management.

mod amocrm;
mod bitrix24;
pub mod connections;
mod http;
pub mod routes;
mod telegavpn;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use tgdesk_core::config::CrmConfig;
use tgdesk_core::crm::{ContactInput, CrmAdapter, CrmContact};
use tgdesk_core::{ApplicationError, CrmConnection, CrmProvider, CrmUser};
use tgdesk_db::repositories::CrmUserRepository;

pub use amocrm::AmoCrmAdapter;
pub use bitrix24::Bitrix24Adapter;
pub use connections::ConnectionService;
pub use telegavpn::TelegaVpnAdapter;

/// Selects the adapter for a connection's provider. Holds no state beyond the adapters.
pub struct CrmDispatcher {
    amocrm: Arc<dyn CrmAdapter>,
    bitrix24: Arc<dyn CrmAdapter>,
    telegavpn: Arc<dyn CrmAdapter>,
    crm_users: Arc<dyn CrmUserRepository>,
}

impl CrmDispatcher {
    pub fn new(
        amocrm: Arc<dyn CrmAdapter>,
        bitrix24: Arc<dyn CrmAdapter>,
        telegavpn: Arc<dyn CrmAdapter>,
        crm_users: Arc<dyn CrmUserRepository>,
    ) -> Result<Self, ApplicationError> {
        let wired = [
            (CrmProvider::AmoCrm, &amocrm),
            (CrmProvider::Bitrix24, &bitrix24),
            (CrmProvider::TelegaVpn, &telegavpn),
        ];
        for (slot, adapter) in wired {
            if adapter.provider() != slot {
                return Err(ApplicationError::Configuration(format!(
                    "{} adapter wired into the {slot} slot",
                    adapter.provider()
                )));
            }
        }
        Ok(Self { amocrm, bitrix24, telegavpn, crm_users })
    }

    /// Builds the production adapters from configuration.
    pub fn from_config(
        config: &CrmConfig,
        crm_users: Arc<dyn CrmUserRepository>,
    ) -> Result<Self, ApplicationError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        Self::new(
            Arc::new(AmoCrmAdapter::new(timeout)?),
            Arc::new(Bitrix24Adapter::new(timeout)?),
            Arc::new(TelegaVpnAdapter::new(&config.telegavpn_base_url, timeout)?),
            crm_users,
        )
    }

    pub fn adapter(&self, provider: CrmProvider) -> &dyn CrmAdapter {
        match provider {
            CrmProvider::AmoCrm => self.amocrm.as_ref(),
            CrmProvider::Bitrix24 => self.bitrix24.as_ref(),
            CrmProvider::TelegaVpn => self.telegavpn.as_ref(),
        }
    }

    /// Adapter for `connection`. When the caller names a provider, a connection for a
    /// different provider is rejected before any adapter sees it.
    pub fn route(
        &self,
        connection: &CrmConnection,
        expected: Option<CrmProvider>,
    ) -> Result<&dyn CrmAdapter, ApplicationError> {
        if let Some(expected) = expected {
            connection.ensure_provider(expected)?;
        }
        Ok(self.adapter(connection.provider))
    }

    /// Creates the contact remotely, then records the local shadow user when the input
    /// identifies a Telegram user and bot. The shadow write never fails the call.
    pub async fn create_contact(
        &self,
        connection: &CrmConnection,
        expected: Option<CrmProvider>,
        input: &ContactInput,
    ) -> Result<CrmContact, ApplicationError> {
        let contact = self.route(connection, expected)?.create_contact(connection, input).await?;
        self.record_shadow_user(connection, input).await;
        Ok(contact)
    }

    async fn record_shadow_user(&self, connection: &CrmConnection, input: &ContactInput) {
        let (Some(telegram_id), Some(bot_id)) = (input.telegram_id, input.bot_id) else {
            return;
        };

        let now = Utc::now();
        let user = CrmUser {
            telegram_id,
            username: input.telegram_username.clone().or_else(|| input.name.clone()),
            first_name: input.first_name.clone().or_else(|| input.name.clone()),
            last_name: input.last_name.clone(),
            bot_id,
            created_at: now,
            updated_at: now,
        };

        match self.crm_users.upsert(user).await {
            Ok(()) => info!(
                event_name = "crm.shadow_user.upserted",
                provider = %connection.provider,
                telegram_id,
                bot_id,
                "local crm user recorded"
            ),
            Err(error) => warn!(
                event_name = "crm.shadow_user.failed",
                provider = %connection.provider,
                telegram_id,
                bot_id,
                error = %error,
                "local crm user upsert failed; remote contact kept"
            ),
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use async_trait::async_trait;

    use tgdesk_core::crm::ContactInput;
    use tgdesk_core::{ApplicationError, CrmProvider, CrmUser};
    use tgdesk_db::repositories::{CrmUserRepository, InMemoryCrmUserRepository, RepositoryError};

    use super::test_support::{stub_dispatcher, stub_dispatcher_with, StubAdapter};
    use super::CrmDispatcher;
    use crate::crm::http::test_support::connection;

    #[tokio::test]
    async fn each_provider_routes_to_its_own_adapter() {
        let stubs = stub_dispatcher();

        for (index, provider) in CrmProvider::ALL.into_iter().enumerate() {
            let conn = connection(provider, None);
            let contact = stubs
                .dispatcher
                .route(&conn, None)
                .expect("route")
                .get_contact_info(&conn, "1")
                .await
                .expect("contact");

            assert_eq!(contact.raw["provider"], provider.as_str());
            assert_eq!(stubs.adapters[index].calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn mismatched_connection_never_reaches_an_adapter() {
        let stubs = stub_dispatcher();
        let conn = connection(CrmProvider::Bitrix24, None);

        for expected in [CrmProvider::AmoCrm, CrmProvider::TelegaVpn] {
            let result = stubs.dispatcher.route(&conn, Some(expected)).map(|_| ());
            assert_eq!(
                result,
                Err(ApplicationError::ProviderMismatch { expected, actual: CrmProvider::Bitrix24 })
            );
        }
        let rejected = stubs
            .dispatcher
            .create_contact(&conn, Some(CrmProvider::AmoCrm), &ContactInput::default())
            .await;

        assert!(matches!(rejected, Err(ApplicationError::ProviderMismatch { .. })));
        assert!(stubs.adapters.iter().all(|adapter| adapter.calls.load(Ordering::SeqCst) == 0));
    }

    #[test]
    fn miswired_adapter_is_a_configuration_error() {
        let users: Arc<dyn CrmUserRepository> = Arc::new(InMemoryCrmUserRepository::default());
        let result = CrmDispatcher::new(
            Arc::new(StubAdapter::new(CrmProvider::Bitrix24)),
            Arc::new(StubAdapter::new(CrmProvider::Bitrix24)),
            Arc::new(StubAdapter::new(CrmProvider::TelegaVpn)),
            users,
        );

        assert!(matches!(result, Err(ApplicationError::Configuration(_))));
    }

    #[tokio::test]
    async fn create_contact_records_shadow_user_for_every_provider() {
        let crm_users = Arc::new(InMemoryCrmUserRepository::default());
        let stubs = stub_dispatcher_with(crm_users.clone());
        let input = ContactInput {
            name: Some("Masha".to_string()),
            telegram_username: Some("masha_tg".to_string()),
            telegram_id: Some(1001),
            bot_id: Some(5),
            ..ContactInput::default()
        };

        for provider in CrmProvider::ALL {
            stubs
                .dispatcher
                .create_contact(&connection(provider, None), None, &input)
                .await
                .expect("contact");
        }

        let shadow = crm_users.find_by_telegram_id(1001).await.expect("lookup").expect("shadow");
        assert_eq!(shadow.username.as_deref(), Some("masha_tg"));
        assert_eq!(shadow.first_name.as_deref(), Some("Masha"));
        assert_eq!(shadow.bot_id, 5);
    }

    #[tokio::test]
    async fn contact_without_bot_id_skips_shadow_user() {
        let crm_users = Arc::new(InMemoryCrmUserRepository::default());
        let stubs = stub_dispatcher_with(crm_users.clone());
        let input = ContactInput { telegram_id: Some(2002), ..ContactInput::default() };

        stubs
            .dispatcher
            .create_contact(&connection(CrmProvider::AmoCrm, None), None, &input)
            .await
            .expect("contact");

        assert_eq!(crm_users.find_by_telegram_id(2002).await.expect("lookup"), None);
    }

    struct BrokenUsers;

    #[async_trait]
    impl CrmUserRepository for BrokenUsers {
        async fn upsert(&self, _user: CrmUser) -> Result<(), RepositoryError> {
            Err(RepositoryError::Decode("disk full".to_string()))
        }

        async fn find_by_telegram_id(
            &self,
            _telegram_id: i64,
        ) -> Result<Option<CrmUser>, RepositoryError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn shadow_user_failure_keeps_remote_contact() {
        let dispatcher = CrmDispatcher::new(
            Arc::new(StubAdapter::new(CrmProvider::AmoCrm)),
            Arc::new(StubAdapter::new(CrmProvider::Bitrix24)),
            Arc::new(StubAdapter::new(CrmProvider::TelegaVpn)),
            Arc::new(BrokenUsers),
        )
        .expect("dispatcher");
        let input =
            ContactInput { telegram_id: Some(1), bot_id: Some(1), ..ContactInput::default() };

        let contact = dispatcher
            .create_contact(&connection(CrmProvider::AmoCrm, None), None, &input)
            .await
            .expect("remote success survives local failure");

        assert_eq!(contact.id.as_deref(), Some("new"));
    }
}
