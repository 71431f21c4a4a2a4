use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::info;

use super::models::WalletEntry;
use crate::error::{AppError, AppResult};
use crate::execution::builder::parse_address;

/// Append-only list of wallets whose fees get settled
#[async_trait]
pub trait WalletRegistry: Send + Sync {
    async fn list_wallets(&self) -> AppResult<Vec<WalletEntry>>;

    async fn get_wallet(&self, public_key: &str) -> AppResult<Option<WalletEntry>>;

    /// Record a provisioned wallet. Registering a known key keeps the first entry.
    async fn register(&self, public_key: &str, address: &str) -> AppResult<WalletEntry>;
}

fn validate_entry(public_key: &str, address: &str) -> AppResult<()> {
    let key = public_key.trim_start_matches("0x");
    if key.is_empty() || hex::decode(key).is_err() {
        return Err(AppError::InvalidAddress(format!(
            "public key must be hex encoded: {}",
            public_key
        )));
    }
    parse_address(address)?;
    Ok(())
}

// ========== POSTGRES ==========

pub struct PgWalletRegistry {
    pool: PgPool,
}

impl PgWalletRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WalletRegistry for PgWalletRegistry {
    async fn list_wallets(&self) -> AppResult<Vec<WalletEntry>> {
        let wallets = sqlx::query_as::<_, WalletEntry>(
            r#"
            SELECT public_key, address, created_at
            FROM wallets
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(wallets)
    }

    async fn get_wallet(&self, public_key: &str) -> AppResult<Option<WalletEntry>> {
        let wallet = sqlx::query_as::<_, WalletEntry>(
            r#"
            SELECT public_key, address, created_at
            FROM wallets
            WHERE public_key = $1
            "#,
        )
        .bind(public_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(wallet)
    }

    async fn register(&self, public_key: &str, address: &str) -> AppResult<WalletEntry> {
        validate_entry(public_key, address)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO wallets (public_key, address)
            VALUES ($1, $2)
            ON CONFLICT (public_key) DO NOTHING
            "#,
        )
        .bind(public_key)
        .bind(address)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            info!(wallet = %public_key, "👛 Registered wallet");
        }

        self.get_wallet(public_key)
            .await?
            .ok_or_else(|| AppError::Internal(format!("wallet {} vanished after insert", public_key)))
    }
}

// ========== IN MEMORY ==========

#[derive(Default)]
pub struct MemoryWalletRegistry {
    wallets: tokio::sync::RwLock<HashMap<String, WalletEntry>>,
}

impl MemoryWalletRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WalletRegistry for MemoryWalletRegistry {
    async fn list_wallets(&self) -> AppResult<Vec<WalletEntry>> {
        let wallets = self.wallets.read().await;
        let mut entries: Vec<WalletEntry> = wallets.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.public_key.cmp(&b.public_key))
        });
        Ok(entries)
    }

    async fn get_wallet(&self, public_key: &str) -> AppResult<Option<WalletEntry>> {
        Ok(self.wallets.read().await.get(public_key).cloned())
    }

    async fn register(&self, public_key: &str, address: &str) -> AppResult<WalletEntry> {
        validate_entry(public_key, address)?;

        let mut wallets = self.wallets.write().await;
        let entry = wallets
            .entry(public_key.to_string())
            .or_insert_with(|| WalletEntry {
                public_key: public_key.to_string(),
                address: address.to_string(),
                created_at: Utc::now(),
            });

        Ok(entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESS: &str = "0x1111111111111111111111111111111111111111";

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let registry = MemoryWalletRegistry::new();

        let first = registry.register("02aa", ADDRESS).await.unwrap();
        let second = registry
            .register("02aa", "0x2222222222222222222222222222222222222222")
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(registry.list_wallets().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_rejects_bad_input() {
        let registry = MemoryWalletRegistry::new();

        assert!(registry.register("not-hex", ADDRESS).await.is_err());
        assert!(registry.register("02aa", "0x1234").await.is_err());
        assert!(registry.list_wallets().await.unwrap().is_empty());
    }
}
