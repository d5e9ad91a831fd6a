//! Tenant gateway configuration
//!
//! Each tenant holds one or more gateway configs (for example one per
//! currency region); at most one is the default per tenant per currency,
//! enforced by a partial unique index. The webhook token is an unguessable
//! 256-bit value embedded in the callback URL, acting as a coarse
//! authentication layer ahead of signature verification.
//!
//! Config resolution is cached behind an explicit cache with an injected
//! time source and an `invalidate` API. Coordination across instances stays
//! in the database; the cache only short-circuits repeated token lookups.

use std::collections::HashMap;
use std::sync::Arc;

use rand::RngCore;
use serde::Serialize;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::GatewayKind;

/// Injected time source so cache expiry is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Tenant-scoped gateway credentials.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct GatewayConfig {
    pub id: Uuid,
    pub org_id: Uuid,
    pub provider: String,
    pub currency: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    #[serde(skip_serializing)]
    pub api_secret: String,
    #[serde(skip_serializing)]
    pub webhook_secret: String,
    #[serde(skip_serializing)]
    pub webhook_token: String,
    pub is_default: bool,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl GatewayConfig {
    pub fn kind(&self) -> BillingResult<GatewayKind> {
        GatewayKind::parse(&self.provider)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(kind: GatewayKind) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            provider: kind.as_str().to_string(),
            currency: "INR".to_string(),
            api_key: "key_test".to_string(),
            api_secret: "secret_test".to_string(),
            webhook_secret: "whsec_test".to_string(),
            webhook_token: generate_webhook_token(),
            is_default: true,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Generate a fresh 256-bit webhook token, 64 hex characters.
pub fn generate_webhook_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Webhook tokens are exactly 64 lowercase hex characters. Anything else is
/// rejected before touching the database.
pub fn is_well_formed_webhook_token(token: &str) -> bool {
    token.len() == 64 && token.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Scope selector for cache invalidation.
#[derive(Debug, Clone)]
pub enum CacheScope {
    Org(Uuid),
    Token(String),
    All,
}

struct CacheEntry {
    config: GatewayConfig,
    expires_at: OffsetDateTime,
}

/// Token -> config cache with explicit TTL and invalidation. Multi-instance
/// deployments invalidate on config mutation; stale entries age out on TTL.
pub struct ConfigCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl ConfigCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    pub async fn get(&self, token: &str) -> Option<GatewayConfig> {
        let entries = self.entries.read().await;
        let entry = entries.get(token)?;
        if entry.expires_at <= self.clock.now() {
            return None;
        }
        Some(entry.config.clone())
    }

    pub async fn put(&self, config: GatewayConfig) {
        let expires_at = self.clock.now() + self.ttl;
        let mut entries = self.entries.write().await;
        entries.insert(
            config.webhook_token.clone(),
            CacheEntry { config, expires_at },
        );
    }

    pub async fn invalidate(&self, scope: CacheScope) {
        let mut entries = self.entries.write().await;
        match scope {
            CacheScope::Org(org_id) => {
                entries.retain(|_, e| e.config.org_id != org_id);
            }
            CacheScope::Token(token) => {
                entries.remove(&token);
            }
            CacheScope::All => entries.clear(),
        }
    }
}

/// Store for tenant gateway configs.
#[derive(Clone)]
pub struct GatewayConfigStore {
    pool: PgPool,
    cache: Arc<ConfigCache>,
}

impl GatewayConfigStore {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            cache: Arc::new(ConfigCache::new(Duration::minutes(5), clock)),
        }
    }

    /// Resolve a config by its webhook token. Malformed and unknown tokens
    /// both resolve to `None` so the caller can answer 404 without leaking
    /// which of the two it was.
    pub async fn resolve_by_token(&self, token: &str) -> BillingResult<Option<GatewayConfig>> {
        if !is_well_formed_webhook_token(token) {
            return Ok(None);
        }

        if let Some(config) = self.cache.get(token).await {
            return Ok(Some(config));
        }

        let config: Option<GatewayConfig> = sqlx::query_as(
            r#"
            SELECT id, org_id, provider, currency, api_key, api_secret,
                   webhook_secret, webhook_token, is_default, is_active,
                   created_at, updated_at
            FROM payment_gateway_configs
            WHERE webhook_token = $1 AND is_active
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(config) = &config {
            self.cache.put(config.clone()).await;
        }

        Ok(config)
    }

    /// The tenant's default active config, optionally narrowed to a currency.
    pub async fn default_for_org(
        &self,
        org_id: Uuid,
        currency: Option<&str>,
    ) -> BillingResult<GatewayConfig> {
        let config: Option<GatewayConfig> = sqlx::query_as(
            r#"
            SELECT id, org_id, provider, currency, api_key, api_secret,
                   webhook_secret, webhook_token, is_default, is_active,
                   created_at, updated_at
            FROM payment_gateway_configs
            WHERE org_id = $1
              AND is_default AND is_active
              AND ($2::TEXT IS NULL OR currency = $2)
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(org_id)
        .bind(currency)
        .fetch_optional(&self.pool)
        .await?;

        config.ok_or(BillingError::NoGatewayConfigured)
    }

    /// The tenant's active config for a specific provider, preferring the
    /// default when several exist.
    pub async fn for_provider(
        &self,
        org_id: Uuid,
        provider: GatewayKind,
    ) -> BillingResult<GatewayConfig> {
        let config: Option<GatewayConfig> = sqlx::query_as(
            r#"
            SELECT id, org_id, provider, currency, api_key, api_secret,
                   webhook_secret, webhook_token, is_default, is_active,
                   created_at, updated_at
            FROM payment_gateway_configs
            WHERE org_id = $1 AND provider = $2 AND is_active
            ORDER BY is_default DESC, updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(org_id)
        .bind(provider.as_str())
        .fetch_optional(&self.pool)
        .await?;

        config.ok_or(BillingError::NoGatewayConfigured)
    }

    /// Create a config with a freshly generated webhook token. When marked
    /// default, the previous default for the same tenant+currency is cleared
    /// in the same transaction so the partial unique index never trips.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_config(
        &self,
        org_id: Uuid,
        provider: GatewayKind,
        currency: &str,
        api_key: &str,
        api_secret: &str,
        webhook_secret: &str,
        is_default: bool,
    ) -> BillingResult<GatewayConfig> {
        let token = generate_webhook_token();
        let mut tx = self.pool.begin().await?;

        if is_default {
            sqlx::query(
                r#"
                UPDATE payment_gateway_configs
                SET is_default = FALSE, updated_at = NOW()
                WHERE org_id = $1 AND currency = $2 AND is_default
                "#,
            )
            .bind(org_id)
            .bind(currency)
            .execute(&mut *tx)
            .await?;
        }

        let config: GatewayConfig = sqlx::query_as(
            r#"
            INSERT INTO payment_gateway_configs
                (org_id, provider, currency, api_key, api_secret,
                 webhook_secret, webhook_token, is_default)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, org_id, provider, currency, api_key, api_secret,
                      webhook_secret, webhook_token, is_default, is_active,
                      created_at, updated_at
            "#,
        )
        .bind(org_id)
        .bind(provider.as_str())
        .bind(currency)
        .bind(api_key)
        .bind(api_secret)
        .bind(webhook_secret)
        .bind(&token)
        .bind(is_default)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        self.cache.invalidate(CacheScope::Org(org_id)).await;

        tracing::info!(
            org_id = %org_id,
            provider = %provider,
            currency = %currency,
            is_default = is_default,
            "Created gateway config"
        );

        Ok(config)
    }

    /// Deactivate a config and drop it from the cache. Returns whether a
    /// row was actually deactivated; an unknown or foreign id is `false`.
    pub async fn deactivate(&self, org_id: Uuid, config_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payment_gateway_configs
            SET is_active = FALSE, is_default = FALSE, updated_at = NOW()
            WHERE id = $1 AND org_id = $2
            "#,
        )
        .bind(config_id)
        .bind(org_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        self.cache.invalidate(CacheScope::Org(org_id)).await;
        Ok(true)
    }

    pub fn cache(&self) -> &Arc<ConfigCache> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClock(std::sync::Mutex<OffsetDateTime>);

    impl FixedClock {
        fn new(start: OffsetDateTime) -> Self {
            Self(std::sync::Mutex::new(start))
        }
        fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> OffsetDateTime {
            *self.0.lock().unwrap()
        }
    }

    #[test]
    fn generated_tokens_are_well_formed_and_distinct() {
        let a = generate_webhook_token();
        let b = generate_webhook_token();
        assert!(is_well_formed_webhook_token(&a));
        assert!(is_well_formed_webhook_token(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(!is_well_formed_webhook_token(""));
        assert!(!is_well_formed_webhook_token("abc123"));
        assert!(!is_well_formed_webhook_token(&"g".repeat(64)));
        assert!(!is_well_formed_webhook_token(&"a".repeat(63)));
        assert!(!is_well_formed_webhook_token(&"a".repeat(65)));
    }

    #[tokio::test]
    async fn cache_expires_on_ttl_and_honors_invalidation() {
        let start = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let clock = Arc::new(FixedClock::new(start));
        let cache = ConfigCache::new(Duration::minutes(5), clock.clone());

        let config = GatewayConfig::for_tests(GatewayKind::Stripe);
        let token = config.webhook_token.clone();
        let org_id = config.org_id;
        cache.put(config).await;

        assert!(cache.get(&token).await.is_some());

        // TTL expiry under the injected clock
        clock.advance(Duration::minutes(6));
        assert!(cache.get(&token).await.is_none());

        // Explicit invalidation by org scope
        let config = GatewayConfig::for_tests(GatewayKind::Stripe);
        let token = config.webhook_token.clone();
        let config = GatewayConfig { org_id, ..config };
        cache.put(config).await;
        cache.invalidate(CacheScope::Org(org_id)).await;
        assert!(cache.get(&token).await.is_none());
    }
}
