//! Application state

use std::sync::Arc;

use clinicore_billing::BillingService;
use sqlx::PgPool;

use crate::auth::ApiKeyManager;
use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
    pub api_keys: ApiKeyManager,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let billing = Arc::new(BillingService::from_env(pool.clone()));
        let api_keys = ApiKeyManager::new(&config.api_key_hmac_secret);
        tracing::info!("Billing service initialized");

        Self {
            pool,
            config,
            billing,
            api_keys,
        }
    }
}
