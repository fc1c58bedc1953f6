//! Cache key derivation.
//!
//! A key is `<options_hash>-<source_digest>`: the SHA-256 of the canonical
//! option set (with the profile name folded in under [`PROFILE_KEY`]) first,
//! then the source content digest. Equal inputs always give equal keys; a
//! hash collision between distinct inputs silently reuses the older artifact.

use crate::options::{OptionSet, PROFILE_KEY};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Error type for key derivation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    /// The source has no content digest to combine with
    #[error("Source has no content digest")]
    MissingDigest,

    /// The profile name is empty
    #[error("Profile name is empty")]
    MissingProfile,

    /// Text that is not `<options_hash>-<source_digest>`
    #[error("Malformed cache key '{0}'")]
    Malformed(String),
}

/// Deterministic artifact identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The option-hash half of the key.
    pub fn options_hash(&self) -> &str {
        self.0.split_once('-').map(|(h, _)| h).unwrap_or(&self.0)
    }

    /// The source-digest half of the key.
    pub fn source_digest(&self) -> &str {
        self.0.split_once('-').map(|(_, d)| d).unwrap_or("")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for CacheKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once('-') {
            Some((hash, digest))
                if !hash.is_empty()
                    && !digest.is_empty()
                    && hash.chars().all(|c| c.is_ascii_hexdigit()) =>
            {
                Ok(CacheKey(s.to_string()))
            }
            _ => Err(KeyError::Malformed(s.to_string())),
        }
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// SHA-256 hex of the canonical option set extended with the profile name.
pub fn options_hash(profile: &str, options: &OptionSet) -> String {
    let keyed = options.clone().with(PROFILE_KEY, profile);
    hex::encode(Sha256::digest(keyed.canonical_json().as_bytes()))
}

/// Derive the cache key for a (source, profile, options) triple.
pub fn derive_key(
    source_digest: &str,
    profile: &str,
    options: &OptionSet,
) -> Result<CacheKey, KeyError> {
    let source_digest = source_digest.trim();
    if source_digest.is_empty() {
        return Err(KeyError::MissingDigest);
    }
    if profile.trim().is_empty() {
        return Err(KeyError::MissingProfile);
    }

    Ok(CacheKey(format!(
        "{}-{}",
        options_hash(profile, options),
        source_digest
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn digest_strategy() -> impl Strategy<Value = String> {
        "[0-9a-f]{64}"
    }

    // *For any* option map, building the set in two different insertion
    // orders produces identical cache keys.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_key_is_insertion_order_independent(
            digest in digest_strategy(),
            entries in proptest::collection::btree_map("[a-zA-Z]{1,12}", "[a-z0-9]{0,8}", 1..10),
        ) {
            let forward: OptionSet = entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            let backward: OptionSet = entries.iter().rev().map(|(k, v)| (k.clone(), v.clone())).collect();

            let a = derive_key(&digest, "h264", &forward).unwrap();
            let b = derive_key(&digest, "h264", &backward).unwrap();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_key_changes_with_any_component(
            digest in digest_strategy(),
            other_digest in digest_strategy(),
            width in 1u32..4000,
        ) {
            prop_assume!(digest != other_digest);
            let options = OptionSet::new().with("maxWidth", width);

            let base = derive_key(&digest, "h264", &options).unwrap();
            prop_assert_ne!(&base, &derive_key(&other_digest, "h264", &options).unwrap());
            prop_assert_ne!(&base, &derive_key(&digest, "vp9", &options).unwrap());
            prop_assert_ne!(
                &base,
                &derive_key(&digest, "h264", &OptionSet::new().with("maxWidth", width + 1)).unwrap()
            );
        }
    }

    #[test]
    fn test_key_layout_is_options_then_digest() {
        let digest = "ab".repeat(32);
        let options = OptionSet::new().with("fps", 4);
        let key = derive_key(&digest, "gif", &options).unwrap();

        assert_eq!(key.source_digest(), digest);
        assert_eq!(key.options_hash(), options_hash("gif", &options));
        assert_eq!(key.options_hash().len(), 64);
        assert_eq!(key.as_str(), format!("{}-{}", options_hash("gif", &options), digest));
    }

    #[test]
    fn test_missing_identity_fields_fail() {
        let options = OptionSet::new();
        assert_eq!(derive_key("", "h264", &options), Err(KeyError::MissingDigest));
        assert_eq!(derive_key("  ", "h264", &options), Err(KeyError::MissingDigest));
        assert_eq!(derive_key("abc", "", &options), Err(KeyError::MissingProfile));
    }

    #[test]
    fn test_parse_round_trips_derived_keys() {
        let key = derive_key("abc123", "vp9", &OptionSet::new()).unwrap();
        let parsed: CacheKey = key.as_str().parse().unwrap();
        assert_eq!(parsed, key);

        assert!(matches!("nodash".parse::<CacheKey>(), Err(KeyError::Malformed(_))));
        assert!(matches!("zz-abc".parse::<CacheKey>(), Err(KeyError::Malformed(_))));
        assert!(matches!("abc-".parse::<CacheKey>(), Err(KeyError::Malformed(_))));
    }
}
