use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rand::{distributions::Alphanumeric, Rng};

use crate::flags::{
    flag_models::{EvaluationContext, FlagRecord, Role, Targeting},
    flag_store::{FlagStore, StoreError},
};

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

/// Fixed clock for model tests.
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn flag_with_targeting(key: &str, enabled: bool, targeting: Targeting) -> FlagRecord {
    FlagRecord {
        key: key.to_string(),
        name: format!("Flag {}", key),
        description: String::new(),
        enabled,
        targeting,
        created_by: Some("admin-1".to_string()),
        updated_by: Some("admin-1".to_string()),
        last_toggled_at: None,
        created_at: now(),
        updated_at: now(),
    }
}

pub fn user_context(id: &str, role: Role) -> EvaluationContext {
    EvaluationContext {
        id: Some(id.to_string()),
        email: None,
        role: Some(role),
    }
}

/// A store that is always down.
pub struct FailingFlagStore;

fn down() -> StoreError {
    StoreError::Unavailable("connection refused".to_string())
}

#[async_trait]
impl FlagStore for FailingFlagStore {
    async fn list(&self) -> Result<Vec<FlagRecord>, StoreError> {
        Err(down())
    }

    async fn get(&self, _key: &str) -> Result<Option<FlagRecord>, StoreError> {
        Err(down())
    }

    async fn insert(&self, _flag: FlagRecord) -> Result<FlagRecord, StoreError> {
        Err(down())
    }

    async fn replace(&self, _flag: FlagRecord) -> Result<Option<FlagRecord>, StoreError> {
        Err(down())
    }

    async fn delete(&self, _key: &str) -> Result<Option<FlagRecord>, StoreError> {
        Err(down())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Err(down())
    }
}
