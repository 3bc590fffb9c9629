use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::api::errors::FlagError;

static FLAG_KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9\-_]+$").expect("flag key pattern is a valid regex"));

pub const MAX_PERCENTAGE: u8 = 100;

/// Keys that collide with static routes under `/flags/`.
pub const RESERVED_KEYS: &[&str] = &["my-flags"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
    Moderator,
}

impl Role {
    /// Lenient parse used for identities forwarded by the auth layer.
    pub fn parse(value: &str) -> Option<Role> {
        match value.trim().to_lowercase().as_str() {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            "moderator" => Some(Role::Moderator),
            _ => None,
        }
    }
}

/// Who sees an enabled flag. Rules are OR-ed together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Targeting {
    #[serde(default)]
    pub user_ids: BTreeSet<String>,
    #[serde(default)]
    pub emails: BTreeSet<String>,
    #[serde(default)]
    pub roles: BTreeSet<Role>,
    #[serde(default)]
    pub percentage: u8,
}

impl Targeting {
    /// No rules at all means the flag is open to everyone.
    pub fn is_empty(&self) -> bool {
        self.user_ids.is_empty()
            && self.emails.is_empty()
            && self.roles.is_empty()
            && self.percentage == 0
    }

    fn normalized(mut self) -> Self {
        self.emails = self.emails.iter().map(|e| normalize_email(e)).collect();
        self
    }
}

/// Field-wise patch for [`Targeting`]. Absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetingPatch {
    pub user_ids: Option<BTreeSet<String>>,
    pub emails: Option<BTreeSet<String>>,
    pub roles: Option<BTreeSet<Role>>,
    pub percentage: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRecord {
    pub key: String,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub targeting: Targeting,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub last_toggled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating a flag.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFlag {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub targeting: Targeting,
}

/// Partial update for a flag. `key` is accepted only if it is unchanged.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagPatch {
    pub key: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub targeting: Option<TargetingPatch>,
}

/// Identity entries to add to or remove from a flag's whitelist.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WhitelistChange {
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub user_ids: Vec<String>,
}

/// The identity a flag is evaluated against. A missing context is anonymous.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct EvaluationContext {
    pub id: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
}

pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn validate_key(key: &str) -> Result<(), FlagError> {
    if !FLAG_KEY_PATTERN.is_match(key) {
        return Err(FlagError::InvalidKey(key.to_string()));
    }
    if RESERVED_KEYS.contains(&key) {
        return Err(FlagError::ReservedKey(key.to_string()));
    }
    Ok(())
}

pub fn validate_targeting(targeting: &Targeting) -> Result<(), FlagError> {
    if targeting.percentage > MAX_PERCENTAGE {
        return Err(FlagError::InvalidPercentage(targeting.percentage));
    }
    Ok(())
}

impl FlagRecord {
    /// Builds a validated record from a creation payload, stamped with `actor`.
    pub fn from_new(
        new: NewFlag,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<FlagRecord, FlagError> {
        let key = normalize_key(&new.key);
        validate_key(&key)?;

        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(FlagError::InvalidName);
        }

        let targeting = new.targeting.normalized();
        validate_targeting(&targeting)?;

        Ok(FlagRecord {
            key,
            name,
            description: new.description,
            enabled: new.enabled,
            targeting,
            created_by: Some(actor.to_string()),
            updated_by: Some(actor.to_string()),
            last_toggled_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Applies a partial update and returns the resulting record.
    ///
    /// Targeting is merged field by field: a patch that only sets `percentage`
    /// keeps the existing ids, emails and roles. `lastToggledAt` is left alone,
    /// only [`FlagRecord::toggled`] moves it.
    pub fn merge(
        &self,
        patch: FlagPatch,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<FlagRecord, FlagError> {
        if let Some(key) = patch.key {
            if normalize_key(&key) != self.key {
                return Err(FlagError::ImmutableKey(self.key.clone()));
            }
        }

        let mut merged = self.clone();

        if let Some(name) = patch.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(FlagError::InvalidName);
            }
            merged.name = name;
        }
        if let Some(description) = patch.description {
            merged.description = description;
        }
        if let Some(enabled) = patch.enabled {
            merged.enabled = enabled;
        }
        if let Some(targeting) = patch.targeting {
            if let Some(user_ids) = targeting.user_ids {
                merged.targeting.user_ids = user_ids;
            }
            if let Some(emails) = targeting.emails {
                merged.targeting.emails = emails.iter().map(|e| normalize_email(e)).collect();
            }
            if let Some(roles) = targeting.roles {
                merged.targeting.roles = roles;
            }
            if let Some(percentage) = targeting.percentage {
                merged.targeting.percentage = percentage;
            }
        }
        validate_targeting(&merged.targeting)?;

        merged.updated_by = Some(actor.to_string());
        merged.updated_at = now;
        Ok(merged)
    }

    pub fn toggled(&self, actor: &str, now: DateTime<Utc>) -> FlagRecord {
        let mut toggled = self.clone();
        toggled.enabled = !self.enabled;
        toggled.last_toggled_at = Some(now);
        toggled.updated_by = Some(actor.to_string());
        toggled.updated_at = now;
        toggled
    }

    pub fn with_whitelisted(
        &self,
        change: &WhitelistChange,
        actor: &str,
        now: DateTime<Utc>,
    ) -> FlagRecord {
        let mut updated = self.clone();
        updated
            .targeting
            .emails
            .extend(change.emails.iter().map(|e| normalize_email(e)));
        updated
            .targeting
            .user_ids
            .extend(change.user_ids.iter().cloned());
        updated.updated_by = Some(actor.to_string());
        updated.updated_at = now;
        updated
    }

    pub fn without_whitelisted(
        &self,
        change: &WhitelistChange,
        actor: &str,
        now: DateTime<Utc>,
    ) -> FlagRecord {
        let mut updated = self.clone();
        for email in &change.emails {
            updated.targeting.emails.remove(&normalize_email(email));
        }
        for user_id in &change.user_ids {
            updated.targeting.user_ids.remove(user_id);
        }
        updated.updated_by = Some(actor.to_string());
        updated.updated_at = now;
        updated
    }
}
