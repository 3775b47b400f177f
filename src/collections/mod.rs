pub mod events;
pub mod manifest;
pub mod vbucket;

use crate::error::EpkvError;
use serde::{Deserialize, Serialize};

/// Maximum accepted length for scope and collection names.
pub const MAX_NAME_SIZE: usize = 30;

/// Identifier of a scope within the bucket namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeId(pub u32);

impl ScopeId {
    pub const DEFAULT: ScopeId = ScopeId(0);

    pub fn is_default(self) -> bool {
        self == Self::DEFAULT
    }
}

/// Identifier of a collection within the bucket namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionId(pub u32);

impl CollectionId {
    pub const DEFAULT: CollectionId = CollectionId(0);
    /// Reserved for internally generated system events; forbidden in any
    /// input manifest.
    pub const SYSTEM: CollectionId = CollectionId(1);

    pub fn is_default(self) -> bool {
        self == Self::DEFAULT
    }

    pub fn is_system(self) -> bool {
        self == Self::SYSTEM
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl std::fmt::Display for CollectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Parse a hex id string as found in manifest JSON (no `0x` prefix).
pub fn parse_hex_id(raw: &str) -> Result<u32, EpkvError> {
    if raw.is_empty() {
        return Err(EpkvError::InvalidManifest("empty id string".into()));
    }
    u32::from_str_radix(raw, 16)
        .map_err(|e| EpkvError::InvalidManifest(format!("bad hex id '{raw}': {e}")))
}

pub fn format_hex_id(id: u32) -> String {
    format!("{id:x}")
}

/// Manifest uids are 64-bit and must only ever move forward.
pub fn parse_manifest_uid(raw: &str) -> Result<u64, EpkvError> {
    if raw.is_empty() {
        return Err(EpkvError::InvalidManifest("empty manifest uid".into()));
    }
    u64::from_str_radix(raw, 16)
        .map_err(|e| EpkvError::InvalidManifest(format!("bad manifest uid '{raw}': {e}")))
}

/// Check a scope or collection name against the accepted grammar:
/// `[A-Za-z0-9_\-%$]+`, length-bounded, not `$`-prefixed.
pub fn valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_SIZE || name.starts_with('$') {
        return false;
    }
    name.bytes()
        .all(|c| c.is_ascii_alphanumeric() || c == b'_' || c == b'-' || c == b'%' || c == b'$')
}

#[cfg(test)]
mod tests {
    use super::{CollectionId, ScopeId, parse_hex_id, parse_manifest_uid, valid_name};

    #[test]
    fn name_grammar() {
        assert!(valid_name("_default"));
        assert!(valid_name("beer-sample%1"));
        assert!(valid_name("a$b"));
        assert!(!valid_name("$starts_reserved"));
        assert!(!valid_name(""));
        assert!(!valid_name("has space"));
        assert!(!valid_name(&"x".repeat(31)));
        assert!(valid_name(&"x".repeat(30)));
    }

    #[test]
    fn hex_ids_round_trip() {
        assert_eq!(parse_hex_id("1f").unwrap(), 0x1f);
        assert_eq!(parse_manifest_uid("ABCDEF0123").unwrap(), 0xabcdef0123);
        assert!(parse_hex_id("").is_err());
        assert!(parse_hex_id("zz").is_err());
    }

    #[test]
    fn reserved_ids() {
        assert!(ScopeId::DEFAULT.is_default());
        assert!(CollectionId::SYSTEM.is_system());
        assert!(!CollectionId::DEFAULT.is_system());
    }
}
