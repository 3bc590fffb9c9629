use sha1::{Digest, Sha1};
use std::fmt::Write;

use crate::flags::flag_models::{normalize_email, EvaluationContext, FlagRecord};

const LONG_SCALE: u64 = 0xfffffffffffffff;

/// Decides whether `flag` is active for `ctx`. `None` is an anonymous caller.
///
/// Rules are checked in a fixed order: the kill-switch first, then the
/// "no targeting means everyone" default, then identity rules, and finally the
/// percentage rollout.
pub fn is_active(flag: &FlagRecord, ctx: Option<&EvaluationContext>) -> bool {
    if !flag.enabled {
        return false;
    }

    let targeting = &flag.targeting;
    if targeting.is_empty() {
        return true;
    }

    let Some(ctx) = ctx else {
        return false;
    };

    if let Some(id) = ctx.id.as_deref() {
        if targeting.user_ids.contains(id) {
            return true;
        }
    }

    if let Some(email) = ctx.email.as_deref() {
        if targeting.emails.contains(&normalize_email(email)) {
            return true;
        }
    }

    if let Some(role) = ctx.role {
        if targeting.roles.contains(&role) {
            return true;
        }
    }

    match (targeting.percentage, ctx.id.as_deref()) {
        (0, _) | (_, None) => false,
        (percentage, Some(id)) => rollout_bucket(&flag.key, id) < percentage,
    }
}

/// Maps an identity onto `0..100` for a given flag.
///
/// The flag key salts the hash, so two flags at the same percentage admit
/// different cohorts. A bucket is fixed for a `(key, id)` pair, which makes
/// raising the percentage only ever add identities.
pub fn rollout_bucket(flag_key: &str, id: &str) -> u8 {
    let bucket = (get_hash(flag_key, id) * 100.0).floor() as u8;
    // float rounding can land the hash on exactly 1.0
    bucket.min(99)
}

/// Takes a flag key and an identifier and returns a float in [0, 1).
/// Given the same inputs it'll always return the same float, and the floats
/// are uniformly distributed.
pub fn get_hash(flag_key: &str, id: &str) -> f64 {
    let hash_key = format!("{}.{}", flag_key, id);
    let mut hasher = Sha1::new();
    hasher.update(hash_key.as_bytes());
    let result = hasher.finalize();
    // :TRICKY: only the first 15 hex characters are used, so the value fits in a u64
    let hex_str: String = result.iter().fold(String::new(), |mut acc, byte| {
        let _ = write!(acc, "{:02x}", byte);
        acc
    });
    let hash_val = u64::from_str_radix(&hex_str[..15], 16).unwrap_or(0);

    hash_val as f64 / (LONG_SCALE as f64 + 1.0)
}
