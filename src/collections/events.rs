use crate::collections::{CollectionId, ScopeId};
use crate::error::EpkvError;

const TAG_CREATE_COLLECTION: u8 = 0;
const TAG_DROP_COLLECTION: u8 = 1;
const TAG_CREATE_SCOPE: u8 = 2;
const TAG_DROP_SCOPE: u8 = 3;

/// Payload of a collections system event as it travels in the seqno
/// stream. Consumers reconstruct manifest state from these, in seqno
/// order.
///
/// Binary layout: one tag byte, the manifest uid, then the fields of the
/// variant, fixed-width little endian, with any name as trailing bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemEventData {
    CreateCollection {
        manifest_uid: u64,
        scope: ScopeId,
        collection: CollectionId,
        name: String,
        max_ttl: Option<u32>,
    },
    DropCollection {
        manifest_uid: u64,
        collection: CollectionId,
    },
    CreateScope {
        manifest_uid: u64,
        scope: ScopeId,
        name: String,
    },
    DropScope {
        manifest_uid: u64,
        scope: ScopeId,
    },
}

impl SystemEventData {
    pub fn manifest_uid(&self) -> u64 {
        match self {
            SystemEventData::CreateCollection { manifest_uid, .. }
            | SystemEventData::DropCollection { manifest_uid, .. }
            | SystemEventData::CreateScope { manifest_uid, .. }
            | SystemEventData::DropScope { manifest_uid, .. } => *manifest_uid,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        match self {
            SystemEventData::CreateCollection {
                manifest_uid,
                scope,
                collection,
                name,
                max_ttl,
            } => {
                out.push(TAG_CREATE_COLLECTION);
                out.extend_from_slice(&manifest_uid.to_le_bytes());
                out.extend_from_slice(&scope.0.to_le_bytes());
                out.extend_from_slice(&collection.0.to_le_bytes());
                match max_ttl {
                    Some(ttl) => {
                        out.push(1);
                        out.extend_from_slice(&ttl.to_le_bytes());
                    }
                    None => {
                        out.push(0);
                        out.extend_from_slice(&0u32.to_le_bytes());
                    }
                }
                out.extend_from_slice(name.as_bytes());
            }
            SystemEventData::DropCollection {
                manifest_uid,
                collection,
            } => {
                out.push(TAG_DROP_COLLECTION);
                out.extend_from_slice(&manifest_uid.to_le_bytes());
                out.extend_from_slice(&collection.0.to_le_bytes());
            }
            SystemEventData::CreateScope {
                manifest_uid,
                scope,
                name,
            } => {
                out.push(TAG_CREATE_SCOPE);
                out.extend_from_slice(&manifest_uid.to_le_bytes());
                out.extend_from_slice(&scope.0.to_le_bytes());
                out.extend_from_slice(name.as_bytes());
            }
            SystemEventData::DropScope {
                manifest_uid,
                scope,
            } => {
                out.push(TAG_DROP_SCOPE);
                out.extend_from_slice(&manifest_uid.to_le_bytes());
                out.extend_from_slice(&scope.0.to_le_bytes());
            }
        }
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self, EpkvError> {
        let mut reader = Reader::new(raw);
        let tag = reader.u8()?;
        let manifest_uid = reader.u64()?;
        match tag {
            TAG_CREATE_COLLECTION => {
                let scope = ScopeId(reader.u32()?);
                let collection = CollectionId(reader.u32()?);
                let has_ttl = reader.u8()? != 0;
                let ttl = reader.u32()?;
                let name = reader.rest_utf8()?;
                Ok(SystemEventData::CreateCollection {
                    manifest_uid,
                    scope,
                    collection,
                    name,
                    max_ttl: has_ttl.then_some(ttl),
                })
            }
            TAG_DROP_COLLECTION => Ok(SystemEventData::DropCollection {
                manifest_uid,
                collection: CollectionId(reader.u32()?),
            }),
            TAG_CREATE_SCOPE => {
                let scope = ScopeId(reader.u32()?);
                let name = reader.rest_utf8()?;
                Ok(SystemEventData::CreateScope {
                    manifest_uid,
                    scope,
                    name,
                })
            }
            TAG_DROP_SCOPE => Ok(SystemEventData::DropScope {
                manifest_uid,
                scope: ScopeId(reader.u32()?),
            }),
            other => Err(EpkvError::Decode(format!(
                "unknown system event tag {other}"
            ))),
        }
    }
}

struct Reader<'a> {
    raw: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(raw: &'a [u8]) -> Self {
        Self { raw, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], EpkvError> {
        let end = self.offset + n;
        if end > self.raw.len() {
            return Err(EpkvError::Decode(format!(
                "system event truncated at offset {}",
                self.offset
            )));
        }
        let slice = &self.raw[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, EpkvError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, EpkvError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("len 4")))
    }

    fn u64(&mut self) -> Result<u64, EpkvError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("len 8")))
    }

    fn rest_utf8(&mut self) -> Result<String, EpkvError> {
        let rest = &self.raw[self.offset..];
        self.offset = self.raw.len();
        String::from_utf8(rest.to_vec())
            .map_err(|e| EpkvError::Decode(format!("system event name not utf8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::SystemEventData;
    use crate::collections::{CollectionId, ScopeId};
    use crate::error::EpkvError;

    #[test]
    fn all_variants_round_trip() {
        let events = [
            SystemEventData::CreateCollection {
                manifest_uid: 0xabc,
                scope: ScopeId(0),
                collection: CollectionId(8),
                name: "vegetable".into(),
                max_ttl: Some(120),
            },
            SystemEventData::CreateCollection {
                manifest_uid: 1,
                scope: ScopeId(2),
                collection: CollectionId(9),
                name: "no-ttl".into(),
                max_ttl: None,
            },
            SystemEventData::DropCollection {
                manifest_uid: 0xdef,
                collection: CollectionId(8),
            },
            SystemEventData::CreateScope {
                manifest_uid: 2,
                scope: ScopeId(9),
                name: "shop".into(),
            },
            SystemEventData::DropScope {
                manifest_uid: 3,
                scope: ScopeId(9),
            },
        ];
        for event in events {
            let decoded = SystemEventData::decode(&event.encode()).unwrap();
            assert_eq!(event, decoded);
        }
    }

    #[test]
    fn truncated_payloads_fail_to_decode() {
        let full = SystemEventData::DropCollection {
            manifest_uid: 1,
            collection: CollectionId(8),
        }
        .encode();
        for len in 0..full.len() {
            assert!(matches!(
                SystemEventData::decode(&full[..len]),
                Err(EpkvError::Decode(_))
            ));
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut raw = vec![9u8];
        raw.extend_from_slice(&1u64.to_le_bytes());
        assert!(SystemEventData::decode(&raw).is_err());
    }
}
