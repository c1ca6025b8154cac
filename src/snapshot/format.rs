//! On-disk layout of a snapshot container.
//!
//! ```text
//! <root>/manifest.json
//! <root>/entities/<type>.<json|msgpack>
//! <root>/associations/<type>.<json|msgpack>
//! ```
//!
//! Sections hold arrays of records. Foreign keys never carry source ids:
//! every reference is either a `(type, naturalKey)` pair or an explicit
//! `unresolved` marker.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::core::{BackupError, FieldMap, LocalId, NaturalKey, Result, Value};

pub const SNAPSHOT_FORMAT: &str = "natkey-snapshot";
/// Newest container version this engine reads and the one it writes.
pub const SCHEMA_VERSION: u32 = 1;
pub const MANIFEST_FILE: &str = "manifest.json";
pub const ENTITIES_DIR: &str = "entities";
pub const ASSOCIATIONS_DIR: &str = "associations";

/// What the writer does with a reference to a type outside the export set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportMode {
    /// Fail the whole export.
    #[default]
    Strict,
    /// Encode the reference as `unresolved`.
    Permissive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SectionEncoding {
    #[default]
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "msgpack")]
    MessagePack,
}

impl SectionEncoding {
    pub fn extension(&self) -> &'static str {
        match self {
            SectionEncoding::Json => "json",
            SectionEncoding::MessagePack => "msgpack",
        }
    }

    /// JSON has no NaN or infinity; `serde_json` would write them as `null`.
    pub fn can_represent(&self, value: &Value) -> bool {
        match (self, value) {
            (SectionEncoding::Json, Value::Float(f)) => f.is_finite(),
            _ => true,
        }
    }

    pub fn encode<T: Serialize>(&self, records: &[T]) -> Result<Vec<u8>> {
        match self {
            SectionEncoding::Json => Ok(serde_json::to_vec_pretty(records)?),
            // Named encoding keeps struct fields as map keys, which the
            // tagged reference enum needs to decode.
            SectionEncoding::MessagePack => Ok(rmp_serde::to_vec_named(records)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<Vec<T>> {
        match self {
            SectionEncoding::Json => Ok(serde_json::from_slice(bytes)?),
            SectionEncoding::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Entity,
    Association,
}

impl SectionKind {
    pub fn dir(&self) -> &'static str {
        match self {
            SectionKind::Entity => ENTITIES_DIR,
            SectionKind::Association => ASSOCIATIONS_DIR,
        }
    }
}

/// Manifest line for one data section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionEntry {
    pub name: String,
    pub expected_count: usize,
    /// Lowercase hex SHA-256 of the section file.
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotManifest {
    pub format: String,
    pub schema_version: u32,
    pub snapshot_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub mode: ExportMode,
    pub encoding: SectionEncoding,
    /// Dependency order of the source registry.
    pub entity_types: Vec<SectionEntry>,
    pub association_types: Vec<SectionEntry>,
    pub content_checksum: String,
}

impl SnapshotManifest {
    /// Every section with its kind, entities first, in manifest order.
    pub fn sections(&self) -> impl Iterator<Item = (SectionKind, &SectionEntry)> {
        self.entity_types
            .iter()
            .map(|entry| (SectionKind::Entity, entry))
            .chain(
                self.association_types
                    .iter()
                    .map(|entry| (SectionKind::Association, entry)),
            )
    }

    pub fn section(&self, name: &str) -> Option<(SectionKind, &SectionEntry)> {
        self.sections().find(|(_, entry)| entry.name == name)
    }

    pub fn expected_count(&self, name: &str) -> Option<usize> {
        self.section(name).map(|(_, entry)| entry.expected_count)
    }

    pub fn total_records(&self) -> usize {
        self.sections().map(|(_, entry)| entry.expected_count).sum()
    }

    /// SHA-256 over the section checksums, in manifest order.
    pub fn compute_content_checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for (_, entry) in self.sections() {
            hasher.update(entry.checksum.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// One encoded foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ForeignKeyRef {
    Resolved {
        #[serde(rename = "type")]
        target: String,
        #[serde(rename = "naturalKey")]
        natural_key: NaturalKey,
    },
    Unresolved {
        #[serde(rename = "type")]
        target: String,
        reason: String,
    },
}

impl ForeignKeyRef {
    pub fn resolved(target: impl Into<String>, natural_key: NaturalKey) -> Self {
        ForeignKeyRef::Resolved {
            target: target.into(),
            natural_key,
        }
    }

    pub fn unresolved(target: impl Into<String>, reason: impl Into<String>) -> Self {
        ForeignKeyRef::Unresolved {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn target(&self) -> &str {
        match self {
            ForeignKeyRef::Resolved { target, .. } | ForeignKeyRef::Unresolved { target, .. } => {
                target
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub natural_key: NaturalKey,
    /// Present only for types that preserve ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<LocalId>,
    /// Plain fields; foreign-key fields live in `foreign_keys`.
    pub fields: FieldMap,
    #[serde(default)]
    pub foreign_keys: BTreeMap<String, ForeignKeyRef>,
}

/// Join row keyed by the natural keys of both endpoints.
///
/// An endpoint key is `None` when the writer could not encode it
/// (permissive export of a type outside the export set).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociationRecord {
    pub from_type: String,
    pub from_natural_key: Option<NaturalKey>,
    pub to_type: String,
    pub to_natural_key: Option<NaturalKey>,
    #[serde(default)]
    pub fields: FieldMap,
}

impl AssociationRecord {
    pub fn describe(&self) -> String {
        fn side(key: &Option<NaturalKey>) -> String {
            key.as_ref()
                .map(|k| k.to_string())
                .unwrap_or_else(|| "?".to_string())
        }
        format!(
            "{}:{} -> {}:{}",
            self.from_type,
            side(&self.from_natural_key),
            self.to_type,
            side(&self.to_natural_key)
        )
    }
}

/// Location of a snapshot container on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle {
    root: PathBuf,
}

impl SnapshotHandle {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn section_path(
        &self,
        kind: SectionKind,
        name: &str,
        encoding: SectionEncoding,
    ) -> PathBuf {
        self.root
            .join(kind.dir())
            .join(format!("{}.{}", name, encoding.extension()))
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub(crate) fn corrupt(section: &str, err: BackupError) -> BackupError {
    BackupError::SnapshotCorrupt(format!("section '{}': {}", section, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> EntityRecord {
        let mut fields = FieldMap::new();
        fields.insert("title".into(), Value::from("Quality manual"));
        fields.insert("revision".into(), Value::Integer(3));
        let mut foreign_keys = BTreeMap::new();
        foreign_keys.insert(
            "author_id".to_string(),
            ForeignKeyRef::resolved("user", NaturalKey::from("alice")),
        );
        foreign_keys.insert(
            "reviewer_id".to_string(),
            ForeignKeyRef::unresolved("auditor", "type not exported"),
        );
        EntityRecord {
            natural_key: NaturalKey::from("DOC-1"),
            source_id: None,
            fields,
            foreign_keys,
        }
    }

    #[test]
    fn test_record_json_shape() {
        let json = serde_json::to_value(record()).unwrap();
        assert_eq!(json["naturalKey"], serde_json::json!(["DOC-1"]));
        assert_eq!(json["fields"]["revision"], serde_json::json!(3));
        assert_eq!(
            json["foreignKeys"]["author_id"],
            serde_json::json!({"status": "resolved", "type": "user", "naturalKey": ["alice"]})
        );
        assert_eq!(json["foreignKeys"]["reviewer_id"]["status"], "unresolved");
        assert!(json.get("sourceId").is_none());
    }

    #[test]
    fn test_msgpack_section_decodes() {
        let encoding = SectionEncoding::MessagePack;
        let bytes = encoding.encode(&[record()]).unwrap();
        let decoded: Vec<EntityRecord> = encoding.decode(&bytes).unwrap();
        assert_eq!(decoded, vec![record()]);
    }

    #[test]
    fn test_json_cannot_carry_non_finite_floats() {
        assert!(!SectionEncoding::Json.can_represent(&Value::Float(f64::NAN)));
        assert!(!SectionEncoding::Json.can_represent(&Value::Float(f64::NEG_INFINITY)));
        assert!(SectionEncoding::Json.can_represent(&Value::Float(2.5)));
        assert!(SectionEncoding::MessagePack.can_represent(&Value::Float(f64::NAN)));
    }

    #[test]
    fn test_content_checksum_depends_on_order() {
        let entry = |name: &str, checksum: &str| SectionEntry {
            name: name.to_string(),
            expected_count: 1,
            checksum: checksum.to_string(),
        };
        let mut manifest = SnapshotManifest {
            format: SNAPSHOT_FORMAT.to_string(),
            schema_version: SCHEMA_VERSION,
            snapshot_id: Uuid::new_v4(),
            created_at: Utc::now(),
            mode: ExportMode::Strict,
            encoding: SectionEncoding::Json,
            entity_types: vec![entry("user", "aa"), entry("document", "bb")],
            association_types: vec![],
            content_checksum: String::new(),
        };
        let before = manifest.compute_content_checksum();
        manifest.entity_types.reverse();
        assert_ne!(before, manifest.compute_content_checksum());
        assert_eq!(manifest.total_records(), 2);
    }

    #[test]
    fn test_section_paths() {
        let handle = SnapshotHandle::new("/tmp/snap");
        assert_eq!(
            handle.section_path(
                SectionKind::Association,
                "membership",
                SectionEncoding::MessagePack
            ),
            PathBuf::from("/tmp/snap/associations/membership.msgpack")
        );
        assert_eq!(sha256_hex(b"").len(), 64);
    }
}
