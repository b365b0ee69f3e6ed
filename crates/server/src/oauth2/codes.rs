//! Authorization code storage.
//!
//! Codes are single use: [`CodeStore::find_and_delete`] is the only way to read
//! one back and it never hands the same record to two callers. Expired records
//! behave exactly like missing ones.

use crate::entity::authorization_code;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, IntoActiveModel,
    QueryFilter, SqlErr, TransactionTrait,
};
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;

pub type AuthorizationCode = authorization_code::Model;

#[derive(Debug, Error)]
pub enum CodeStoreError {
    #[error("authorization code already exists")]
    Conflict,
    #[error("authorization code not found")]
    NotFound,
    #[error("storage error: {0}")]
    Storage(#[from] DbErr),
}

#[async_trait]
pub trait CodeStore: Send + Sync {
    /// Persist a new code. Never overwrites an existing one.
    async fn put(&self, record: AuthorizationCode) -> Result<(), CodeStoreError>;

    /// Atomically remove and return the record for `code`.
    async fn find_and_delete(&self, code: &str) -> Result<AuthorizationCode, CodeStoreError>;

    /// Drop every expired record, returning how many were removed.
    async fn purge_expired(&self) -> Result<u64, CodeStoreError>;
}

/// Generate an opaque code from 32 random bytes, hex-encoded.
pub fn generate_code() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; 32];
    getrandom::fill(&mut bytes)?;
    Ok(hex::encode(bytes))
}

/// SeaORM-backed store.
#[derive(Clone)]
pub struct DbCodeStore {
    db: Arc<DatabaseConnection>,
}

impl DbCodeStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CodeStore for DbCodeStore {
    async fn put(&self, record: AuthorizationCode) -> Result<(), CodeStoreError> {
        match record.into_active_model().insert(self.db.as_ref()).await {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                Err(CodeStoreError::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_and_delete(&self, code: &str) -> Result<AuthorizationCode, CodeStoreError> {
        let txn = self.db.begin().await?;

        let Some(record) = authorization_code::Entity::find_by_id(code)
            .one(&txn)
            .await?
        else {
            txn.rollback().await?;
            return Err(CodeStoreError::NotFound);
        };

        // Only the caller whose delete removes the row may use it; a racing
        // exchange sees zero affected rows.
        let deleted = authorization_code::Entity::delete_many()
            .filter(authorization_code::Column::Code.eq(code))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        if deleted.rows_affected != 1 || record.is_expired() {
            return Err(CodeStoreError::NotFound);
        }
        Ok(record)
    }

    async fn purge_expired(&self) -> Result<u64, CodeStoreError> {
        let result = authorization_code::Entity::delete_many()
            .filter(authorization_code::Column::ExpiresAt.lte(OffsetDateTime::now_utc()))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected)
    }
}

/// In-process store, selected with `oauth2.code_store.kind: memory`. Only
/// suitable when a single instance serves both authorize and token requests.
#[derive(Clone, Default)]
pub struct MemoryCodeStore {
    codes: Arc<DashMap<String, AuthorizationCode>>,
}

impl MemoryCodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

#[async_trait]
impl CodeStore for MemoryCodeStore {
    async fn put(&self, record: AuthorizationCode) -> Result<(), CodeStoreError> {
        match self.codes.entry(record.code.clone()) {
            Entry::Occupied(mut existing) => {
                // A lingering expired record does not count as a live code
                if existing.get().is_expired() {
                    existing.insert(record);
                    Ok(())
                } else {
                    Err(CodeStoreError::Conflict)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn find_and_delete(&self, code: &str) -> Result<AuthorizationCode, CodeStoreError> {
        match self.codes.remove(code) {
            Some((_, record)) if !record.is_expired() => Ok(record),
            _ => Err(CodeStoreError::NotFound),
        }
    }

    async fn purge_expired(&self) -> Result<u64, CodeStoreError> {
        let now = OffsetDateTime::now_utc();
        let mut purged = 0u64;
        self.codes.retain(|_, record| {
            let keep = !record.is_expired_at(now);
            if !keep {
                purged += 1;
            }
            keep
        });
        Ok(purged)
    }
}
