use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::instrument;

use crate::{
    api::errors::FlagError,
    flags::{
        flag_matching::is_active,
        flag_models::{
            normalize_key, EvaluationContext, FlagPatch, FlagRecord, NewFlag, WhitelistChange,
        },
        flag_store::FlagStore,
    },
    metrics::consts::{
        FLAG_EVALUATION_COUNTER, FLAG_EVALUATION_ERROR_COUNTER, FLAG_MUTATION_COUNTER,
    },
};

/// Registry of feature flags: admin CRUD plus evaluation for a caller.
///
/// Every call goes to the store; there is no in-process cache, and concurrent
/// writes to the same flag are last-write-wins.
#[derive(Clone)]
pub struct FlagService {
    store: Arc<dyn FlagStore + Send + Sync>,
}

impl FlagService {
    pub fn new(store: Arc<dyn FlagStore + Send + Sync>) -> Self {
        Self { store }
    }

    pub async fn get_all(&self) -> Result<Vec<FlagRecord>, FlagError> {
        Ok(self.store.list().await?)
    }

    pub async fn get_by_key(&self, key: &str) -> Result<FlagRecord, FlagError> {
        let key = normalize_key(key);
        self.store
            .get(&key)
            .await?
            .ok_or(FlagError::FlagNotFound(key))
    }

    #[instrument(skip_all, fields(key = %new.key, actor = %actor))]
    pub async fn create(&self, new: NewFlag, actor: &str) -> Result<FlagRecord, FlagError> {
        let flag = FlagRecord::from_new(new, actor, Utc::now())?;
        let created = self.store.insert(flag).await?;

        tracing::info!(enabled = created.enabled, "feature flag created");
        record_mutation("create");
        Ok(created)
    }

    #[instrument(skip_all, fields(key = %key, actor = %actor))]
    pub async fn update(
        &self,
        key: &str,
        patch: FlagPatch,
        actor: &str,
    ) -> Result<FlagRecord, FlagError> {
        let current = self.get_by_key(key).await?;
        let updated = current.merge(patch, actor, Utc::now())?;
        let saved = self.save(updated).await?;

        tracing::info!(enabled = saved.enabled, "feature flag updated");
        record_mutation("update");
        Ok(saved)
    }

    #[instrument(skip_all, fields(key = %key, actor = %actor))]
    pub async fn toggle(&self, key: &str, actor: &str) -> Result<FlagRecord, FlagError> {
        let current = self.get_by_key(key).await?;
        let saved = self.save(current.toggled(actor, Utc::now())).await?;

        tracing::info!(enabled = saved.enabled, "feature flag toggled");
        record_mutation("toggle");
        Ok(saved)
    }

    #[instrument(skip_all, fields(key = %key))]
    pub async fn delete(&self, key: &str) -> Result<FlagRecord, FlagError> {
        let key = normalize_key(key);
        let deleted = self
            .store
            .delete(&key)
            .await?
            .ok_or(FlagError::FlagNotFound(key))?;

        tracing::info!("feature flag deleted");
        record_mutation("delete");
        Ok(deleted)
    }

    /// Adds emails and user ids to the flag's targeting. Entries already present are left as is.
    #[instrument(skip_all, fields(key = %key, actor = %actor))]
    pub async fn add_to_whitelist(
        &self,
        key: &str,
        change: WhitelistChange,
        actor: &str,
    ) -> Result<FlagRecord, FlagError> {
        let current = self.get_by_key(key).await?;
        let saved = self
            .save(current.with_whitelisted(&change, actor, Utc::now()))
            .await?;

        tracing::info!(
            emails = change.emails.len(),
            user_ids = change.user_ids.len(),
            "whitelist entries added"
        );
        record_mutation("whitelist_add");
        Ok(saved)
    }

    /// Removes emails and user ids from the flag's targeting. Missing entries are ignored.
    #[instrument(skip_all, fields(key = %key, actor = %actor))]
    pub async fn remove_from_whitelist(
        &self,
        key: &str,
        change: WhitelistChange,
        actor: &str,
    ) -> Result<FlagRecord, FlagError> {
        let current = self.get_by_key(key).await?;
        let saved = self
            .save(current.without_whitelisted(&change, actor, Utc::now()))
            .await?;

        tracing::info!(
            emails = change.emails.len(),
            user_ids = change.user_ids.len(),
            "whitelist entries removed"
        );
        record_mutation("whitelist_remove");
        Ok(saved)
    }

    /// Evaluates a flag for `ctx`, surfacing store failures to the caller.
    /// An unknown key evaluates to `false`.
    pub async fn try_is_enabled(
        &self,
        key: &str,
        ctx: Option<&EvaluationContext>,
    ) -> Result<bool, FlagError> {
        let enabled = match self.store.get(&normalize_key(key)).await? {
            Some(flag) => is_active(&flag, ctx),
            None => false,
        };

        metrics::counter!(
            FLAG_EVALUATION_COUNTER,
            &[("enabled", enabled.to_string())]
        )
        .increment(1);
        Ok(enabled)
    }

    /// Evaluates a flag for `ctx`. Never fails: an unknown flag or any error
    /// while reading it evaluates to `false`.
    pub async fn is_enabled(&self, key: &str, ctx: Option<&EvaluationContext>) -> bool {
        match self.try_is_enabled(key, ctx).await {
            Ok(enabled) => enabled,
            Err(e) => {
                tracing::error!(
                    key,
                    error = %e,
                    "failed to evaluate feature flag, treating as disabled"
                );
                metrics::counter!(
                    FLAG_EVALUATION_ERROR_COUNTER,
                    &[("reason", e.error_code().to_string())]
                )
                .increment(1);
                false
            }
        }
    }

    /// Evaluates every stored flag for `ctx`.
    pub async fn get_all_flags_for_user(
        &self,
        ctx: Option<&EvaluationContext>,
    ) -> Result<HashMap<String, bool>, FlagError> {
        let flags = self.store.list().await?;
        Ok(flags
            .iter()
            .map(|flag| (flag.key.clone(), is_active(flag, ctx)))
            .collect())
    }

    pub async fn ping(&self) -> Result<(), FlagError> {
        Ok(self.store.ping().await?)
    }

    async fn save(&self, flag: FlagRecord) -> Result<FlagRecord, FlagError> {
        let key = flag.key.clone();
        // the record can disappear between our read and this write
        self.store
            .replace(flag)
            .await?
            .ok_or(FlagError::FlagNotFound(key))
    }
}

fn record_mutation(operation: &'static str) {
    metrics::counter!(
        FLAG_MUTATION_COUNTER,
        &[("operation", operation.to_string())]
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::flags::flag_models::{Role, Targeting, TargetingPatch};
    use crate::flags::flag_store::MemoryFlagStore;
    use crate::test_utils::{flag_with_targeting, user_context, FailingFlagStore};

    fn service_with(flags: Vec<FlagRecord>) -> FlagService {
        FlagService::new(Arc::new(MemoryFlagStore::with_flags(flags)))
    }

    fn new_flag(key: &str) -> NewFlag {
        NewFlag {
            key: key.to_string(),
            name: "Beta search".to_string(),
            description: "New search experience".to_string(),
            enabled: false,
            targeting: Targeting::default(),
        }
    }

    #[tokio::test]
    async fn test_create_stamps_audit_fields() {
        let service = service_with(vec![]);
        let flag = service
            .create(new_flag("beta-search"), "admin-1")
            .await
            .unwrap();

        assert_eq!(flag.created_by.as_deref(), Some("admin-1"));
        assert_eq!(flag.updated_by.as_deref(), Some("admin-1"));
        assert!(!flag.enabled);
        assert_eq!(service.get_by_key("beta-search").await.unwrap(), flag);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_and_invalid_keys() {
        let service = service_with(vec![]);
        service
            .create(new_flag("beta-search"), "admin-1")
            .await
            .unwrap();

        match service.create(new_flag("BETA-SEARCH"), "admin-1").await {
            Err(FlagError::FlagAlreadyExists(key)) => assert_eq!(key, "beta-search"),
            other => panic!("Expected FlagAlreadyExists, got {:?}", other),
        }
        assert!(matches!(
            service.create(new_flag("beta search"), "admin-1").await,
            Err(FlagError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_update_merges_targeting_and_restamps() {
        let flag = flag_with_targeting(
            "beta-search",
            true,
            Targeting {
                roles: BTreeSet::from([Role::Admin]),
                emails: BTreeSet::from(["a@b.com".to_string()]),
                ..Default::default()
            },
        );
        let service = service_with(vec![flag]);

        let patch = FlagPatch {
            description: Some("now with maps".to_string()),
            targeting: Some(TargetingPatch {
                percentage: Some(25),
                ..Default::default()
            }),
            ..Default::default()
        };
        let updated = service
            .update("beta-search", patch, "admin-2")
            .await
            .unwrap();

        assert_eq!(updated.description, "now with maps");
        assert_eq!(updated.targeting.percentage, 25);
        assert_eq!(updated.targeting.roles, BTreeSet::from([Role::Admin]));
        assert_eq!(updated.targeting.emails.len(), 1);
        assert_eq!(updated.updated_by.as_deref(), Some("admin-2"));
        assert!(updated.last_toggled_at.is_none());
    }

    #[tokio::test]
    async fn test_mutations_on_unknown_flag_are_not_found() {
        let service = service_with(vec![]);

        assert!(matches!(
            service.toggle("nope", "admin-1").await,
            Err(FlagError::FlagNotFound(_))
        ));
        assert!(matches!(
            service.update("nope", FlagPatch::default(), "admin-1").await,
            Err(FlagError::FlagNotFound(_))
        ));
        assert!(matches!(
            service.delete("nope").await,
            Err(FlagError::FlagNotFound(_))
        ));
        assert!(matches!(
            service
                .add_to_whitelist("nope", WhitelistChange::default(), "admin-1")
                .await,
            Err(FlagError::FlagNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_toggle_flips_and_stamps() {
        let service = service_with(vec![flag_with_targeting(
            "beta-search",
            false,
            Targeting::default(),
        )]);

        let toggled = service.toggle("beta-search", "admin-9").await.unwrap();
        assert!(toggled.enabled);
        assert!(toggled.last_toggled_at.is_some());
        assert_eq!(toggled.updated_by.as_deref(), Some("admin-9"));

        let back = service.toggle("beta-search", "admin-9").await.unwrap();
        assert!(!back.enabled);
        assert!(back.last_toggled_at >= toggled.last_toggled_at);
    }

    #[tokio::test]
    async fn test_delete_returns_record() {
        let service = service_with(vec![flag_with_targeting(
            "old-flag",
            true,
            Targeting::default(),
        )]);

        let deleted = service.delete("old-flag").await.unwrap();
        assert_eq!(deleted.key, "old-flag");
        assert!(service.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_whitelist_is_idempotent() {
        let service = service_with(vec![flag_with_targeting(
            "beta-search",
            true,
            Targeting {
                percentage: 1,
                ..Default::default()
            },
        )]);
        let change = WhitelistChange {
            emails: vec!["Jane@Example.com".to_string()],
            user_ids: vec!["u-7".to_string()],
        };

        let first = service
            .add_to_whitelist("beta-search", change.clone(), "admin-1")
            .await
            .unwrap();
        let second = service
            .add_to_whitelist("beta-search", change.clone(), "admin-1")
            .await
            .unwrap();
        assert_eq!(first.targeting, second.targeting);
        assert!(second.targeting.emails.contains("jane@example.com"));

        let ctx = EvaluationContext {
            email: Some("jane@example.com".to_string()),
            ..Default::default()
        };
        assert!(service.is_enabled("beta-search", Some(&ctx)).await);

        let removed = service
            .remove_from_whitelist("beta-search", change.clone(), "admin-2")
            .await
            .unwrap();
        assert!(removed.targeting.emails.is_empty());
        assert!(removed.targeting.user_ids.is_empty());
        assert_eq!(removed.targeting.percentage, 1);
        assert_eq!(removed.updated_by.as_deref(), Some("admin-2"));

        let removed_again = service
            .remove_from_whitelist("beta-search", change, "admin-2")
            .await
            .unwrap();
        assert_eq!(removed_again.targeting, removed.targeting);
    }

    #[tokio::test]
    async fn test_unknown_flag_is_disabled() {
        let service = service_with(vec![]);
        assert!(!service.is_enabled("does-not-exist", None).await);
        assert!(
            !service
                .is_enabled("does-not-exist", Some(&user_context("u-1", Role::Admin)))
                .await
        );
        assert!(!service.try_is_enabled("does-not-exist", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_is_enabled_fails_closed() {
        let service = FlagService::new(Arc::new(FailingFlagStore));

        assert!(!service.is_enabled("beta-search", None).await);
        assert!(service.try_is_enabled("beta-search", None).await.is_err());
        assert!(service.get_all_flags_for_user(None).await.is_err());
        assert!(service.get_all().await.is_err());
    }

    #[tokio::test]
    async fn test_all_flags_for_user() {
        let service = service_with(vec![
            flag_with_targeting("open-to-all", true, Targeting::default()),
            flag_with_targeting("switched-off", false, Targeting::default()),
            flag_with_targeting(
                "admin-panel",
                true,
                Targeting {
                    roles: BTreeSet::from([Role::Admin]),
                    ..Default::default()
                },
            ),
        ]);

        let for_user = service
            .get_all_flags_for_user(Some(&user_context("u-1", Role::User)))
            .await
            .unwrap();
        assert_eq!(
            for_user,
            HashMap::from([
                ("open-to-all".to_string(), true),
                ("switched-off".to_string(), false),
                ("admin-panel".to_string(), false),
            ])
        );

        let for_admin = service
            .get_all_flags_for_user(Some(&user_context("u-2", Role::Admin)))
            .await
            .unwrap();
        assert_eq!(for_admin.get("admin-panel"), Some(&true));

        let anonymous = service.get_all_flags_for_user(None).await.unwrap();
        assert_eq!(anonymous.get("open-to-all"), Some(&true));
        assert_eq!(anonymous.get("admin-panel"), Some(&false));
    }
}
