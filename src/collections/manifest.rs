use crate::collections::{
    CollectionId, ScopeId, format_hex_id, parse_hex_id, parse_manifest_uid, valid_name,
};
use crate::error::EpkvError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Raw wire form of the bucket manifest document.
#[derive(Debug, Serialize, Deserialize)]
struct ManifestDoc {
    uid: String,
    scopes: Vec<ScopeDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ScopeDoc {
    uid: String,
    name: String,
    collections: Vec<CollectionDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CollectionDoc {
    uid: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_ttl: Option<u64>,
}

/// A collection as known to the bucket manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionEntry {
    pub id: CollectionId,
    pub name: String,
    pub scope: ScopeId,
    /// Maximum TTL in seconds applied to items without an explicit expiry.
    pub max_ttl: Option<u32>,
}

/// A scope as known to the bucket manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub id: ScopeId,
    pub name: String,
    pub collections: Vec<CollectionId>,
}

/// The authoritative bucket-wide namespace: scopes and collections with
/// their ids and names. Parsed from (and encoded back to) the manifest
/// JSON document the control plane distributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    uid: u64,
    scopes: BTreeMap<ScopeId, Scope>,
    collections: BTreeMap<CollectionId, CollectionEntry>,
}

impl Manifest {
    /// A manifest holding only the default scope and collection; the state
    /// of a bucket that has never seen a manifest update.
    pub fn epoch() -> Self {
        let mut scopes = BTreeMap::new();
        scopes.insert(
            ScopeId::DEFAULT,
            Scope {
                id: ScopeId::DEFAULT,
                name: "_default".into(),
                collections: vec![CollectionId::DEFAULT],
            },
        );
        let mut collections = BTreeMap::new();
        collections.insert(
            CollectionId::DEFAULT,
            CollectionEntry {
                id: CollectionId::DEFAULT,
                name: "_default".into(),
                scope: ScopeId::DEFAULT,
                max_ttl: None,
            },
        );
        Self {
            uid: 0,
            scopes,
            collections,
        }
    }

    pub fn parse(
        json: &str,
        max_scopes: usize,
        max_collections: usize,
    ) -> Result<Self, EpkvError> {
        let doc: ManifestDoc = serde_json::from_str(json)
            .map_err(|e| EpkvError::InvalidManifest(format!("cannot parse json: {e}")))?;
        let uid = parse_manifest_uid(&doc.uid)?;

        if doc.scopes.is_empty() {
            return Err(EpkvError::InvalidManifest("no scopes defined".into()));
        }
        if doc.scopes.len() > max_scopes {
            return Err(EpkvError::InvalidManifest(format!(
                "too many scopes: {}",
                doc.scopes.len()
            )));
        }

        let mut scopes: BTreeMap<ScopeId, Scope> = BTreeMap::new();
        let mut collections: BTreeMap<CollectionId, CollectionEntry> = BTreeMap::new();
        for scope_doc in &doc.scopes {
            if !valid_name(&scope_doc.name) {
                return Err(EpkvError::InvalidManifest(format!(
                    "invalid scope name '{}'",
                    scope_doc.name
                )));
            }
            let scope_id = ScopeId(parse_hex_id(&scope_doc.uid)?);
            if scopes.contains_key(&scope_id) {
                return Err(EpkvError::InvalidManifest(format!(
                    "duplicate scope uid {scope_id}"
                )));
            }
            if scopes.values().any(|s| s.name == scope_doc.name) {
                return Err(EpkvError::InvalidManifest(format!(
                    "duplicate scope name '{}'",
                    scope_doc.name
                )));
            }

            if collections.len() + scope_doc.collections.len() > max_collections {
                return Err(EpkvError::InvalidManifest(format!(
                    "too many collections: {}",
                    collections.len() + scope_doc.collections.len()
                )));
            }

            let mut scope_collections = Vec::with_capacity(scope_doc.collections.len());
            for collection_doc in &scope_doc.collections {
                if !valid_name(&collection_doc.name) {
                    return Err(EpkvError::InvalidManifest(format!(
                        "invalid collection name '{}'",
                        collection_doc.name
                    )));
                }
                let collection_id = CollectionId(parse_hex_id(&collection_doc.uid)?);
                if collection_id.is_system() {
                    return Err(EpkvError::InvalidManifest(format!(
                        "collection uid {collection_id} is reserved"
                    )));
                }
                if collections.contains_key(&collection_id) {
                    return Err(EpkvError::InvalidManifest(format!(
                        "duplicate collection uid {collection_id}"
                    )));
                }
                let name_clash = scope_collections
                    .iter()
                    .any(|cid| collections[cid].name == collection_doc.name);
                if name_clash {
                    return Err(EpkvError::InvalidManifest(format!(
                        "duplicate collection name '{}' in scope '{}'",
                        collection_doc.name, scope_doc.name
                    )));
                }
                if collection_id.is_default() && !scope_id.is_default() {
                    return Err(EpkvError::InvalidManifest(
                        "the default collection must live in the default scope".into(),
                    ));
                }
                let max_ttl = match collection_doc.max_ttl {
                    Some(v) if v > u64::from(u32::MAX) => {
                        return Err(EpkvError::InvalidManifest(format!("max_ttl too large: {v}")));
                    }
                    Some(v) => Some(v as u32),
                    None => None,
                };
                collections.insert(
                    collection_id,
                    CollectionEntry {
                        id: collection_id,
                        name: collection_doc.name.clone(),
                        scope: scope_id,
                        max_ttl,
                    },
                );
                scope_collections.push(collection_id);
            }

            scopes.insert(
                scope_id,
                Scope {
                    id: scope_id,
                    name: scope_doc.name.clone(),
                    collections: scope_collections,
                },
            );
        }

        if !scopes.contains_key(&ScopeId::DEFAULT) {
            return Err(EpkvError::InvalidManifest(
                "the default scope was not defined".into(),
            ));
        }

        Ok(Self {
            uid,
            scopes,
            collections,
        })
    }

    pub fn to_json(&self) -> String {
        let doc = ManifestDoc {
            uid: format!("{:x}", self.uid),
            scopes: self
                .scopes
                .values()
                .map(|scope| ScopeDoc {
                    uid: format_hex_id(scope.id.0),
                    name: scope.name.clone(),
                    collections: scope
                        .collections
                        .iter()
                        .map(|cid| {
                            let entry = &self.collections[cid];
                            CollectionDoc {
                                uid: format_hex_id(entry.id.0),
                                name: entry.name.clone(),
                                max_ttl: entry.max_ttl.map(u64::from),
                            }
                        })
                        .collect(),
                })
                .collect(),
        };
        serde_json::to_string(&doc).expect("manifest doc always serializes")
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn scopes(&self) -> impl Iterator<Item = &Scope> {
        self.scopes.values()
    }

    pub fn collections(&self) -> impl Iterator<Item = &CollectionEntry> {
        self.collections.values()
    }

    pub fn scope(&self, id: ScopeId) -> Option<&Scope> {
        self.scopes.get(&id)
    }

    pub fn collection(&self, id: CollectionId) -> Option<&CollectionEntry> {
        self.collections.get(&id)
    }

    pub fn default_collection_exists(&self) -> bool {
        self.collections.contains_key(&CollectionId::DEFAULT)
    }

    /// Resolve `scope.collection` names to a collection id.
    pub fn collection_id_by_name(&self, scope: &str, collection: &str) -> Option<CollectionId> {
        let scope = self.scopes.values().find(|s| s.name == scope)?;
        scope
            .collections
            .iter()
            .copied()
            .find(|cid| self.collections[cid].name == collection)
    }
}

#[cfg(test)]
mod tests {
    use super::Manifest;
    use crate::collections::{CollectionId, ScopeId};

    const MAX: usize = 100;

    fn parse(json: &str) -> Result<Manifest, crate::error::EpkvError> {
        Manifest::parse(json, MAX, MAX)
    }

    #[test]
    fn parses_a_full_manifest() {
        let m = parse(
            r#"{"uid":"a1","scopes":[
                {"uid":"0","name":"_default","collections":[
                    {"uid":"0","name":"_default"},
                    {"uid":"8","name":"vegetable","max_ttl":120}]},
                {"uid":"9","name":"shop","collections":[
                    {"uid":"a","name":"orders"}]}]}"#,
        )
        .unwrap();
        assert_eq!(m.uid(), 0xa1);
        assert!(m.default_collection_exists());
        let veg = m.collection(CollectionId(8)).unwrap();
        assert_eq!(veg.name, "vegetable");
        assert_eq!(veg.max_ttl, Some(120));
        assert_eq!(veg.scope, ScopeId::DEFAULT);
        assert_eq!(
            m.collection_id_by_name("shop", "orders"),
            Some(CollectionId(0xa))
        );
        assert_eq!(m.collection_id_by_name("shop", "nope"), None);
    }

    #[test]
    fn round_trips_through_json() {
        let original = parse(
            r#"{"uid":"1f","scopes":[
                {"uid":"0","name":"_default","collections":[{"uid":"0","name":"_default"}]},
                {"uid":"2","name":"app","collections":[
                    {"uid":"c","name":"events","max_ttl":3600},
                    {"uid":"d","name":"users"}]}]}"#,
        )
        .unwrap();
        let round_tripped = parse(&original.to_json()).unwrap();
        assert_eq!(original, round_tripped);
    }

    #[test]
    fn rejects_structural_violations() {
        // No scopes.
        assert!(parse(r#"{"uid":"1","scopes":[]}"#).is_err());
        // Missing default scope.
        assert!(
            parse(r#"{"uid":"1","scopes":[{"uid":"8","name":"s","collections":[]}]}"#).is_err()
        );
        // Default collection outside the default scope.
        assert!(
            parse(
                r#"{"uid":"1","scopes":[
                {"uid":"0","name":"_default","collections":[]},
                {"uid":"8","name":"s","collections":[{"uid":"0","name":"_default"}]}]}"#
            )
            .is_err()
        );
        // Reserved system collection id.
        assert!(
            parse(
                r#"{"uid":"1","scopes":[
                {"uid":"0","name":"_default","collections":[{"uid":"1","name":"sneaky"}]}]}"#
            )
            .is_err()
        );
    }

    #[test]
    fn rejects_duplicates() {
        // Duplicate scope uid.
        assert!(
            parse(
                r#"{"uid":"1","scopes":[
                {"uid":"0","name":"_default","collections":[]},
                {"uid":"0","name":"other","collections":[]}]}"#
            )
            .is_err()
        );
        // Duplicate collection uid across scopes.
        assert!(
            parse(
                r#"{"uid":"1","scopes":[
                {"uid":"0","name":"_default","collections":[{"uid":"8","name":"a"}]},
                {"uid":"9","name":"s","collections":[{"uid":"8","name":"b"}]}]}"#
            )
            .is_err()
        );
        // Duplicate collection name within a scope.
        assert!(
            parse(
                r#"{"uid":"1","scopes":[
                {"uid":"0","name":"_default","collections":[
                    {"uid":"8","name":"same"},{"uid":"9","name":"same"}]}]}"#
            )
            .is_err()
        );
        // Same name in different scopes is fine.
        assert!(
            parse(
                r#"{"uid":"1","scopes":[
                {"uid":"0","name":"_default","collections":[{"uid":"8","name":"same"}]},
                {"uid":"9","name":"s","collections":[{"uid":"a","name":"same"}]}]}"#
            )
            .is_ok()
        );
    }

    #[test]
    fn rejects_bad_names_and_ttls() {
        assert!(
            parse(
                r#"{"uid":"1","scopes":[
                {"uid":"0","name":"_default","collections":[{"uid":"8","name":"$bad"}]}]}"#
            )
            .is_err()
        );
        assert!(
            parse(
                r#"{"uid":"1","scopes":[
                {"uid":"0","name":"_default","collections":[
                    {"uid":"8","name":"c","max_ttl":4294967296}]}]}"#
            )
            .is_err()
        );
    }

    #[test]
    fn scope_count_limit_is_enforced() {
        let scopes: Vec<String> = (0..4)
            .map(|i| {
                format!(
                    r#"{{"uid":"{:x}","name":"s{i}","collections":[]}}"#,
                    if i == 0 { 0 } else { i + 7 }
                )
            })
            .collect();
        let json = format!(r#"{{"uid":"1","scopes":[{}]}}"#, scopes.join(","));
        assert!(Manifest::parse(&json, 3, 100).is_err());
    }
}
