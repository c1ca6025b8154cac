use std::fmt;

use futures::stream::{self, Stream, StreamExt};
use tokio::fs;
use tracing::{Level, event};

use super::format::{
    AssociationRecord, EntityRecord, SCHEMA_VERSION, SNAPSHOT_FORMAT, SectionEntry, SectionKind,
    SnapshotHandle, SnapshotManifest, corrupt, sha256_hex,
};
use crate::core::{BackupError, Result};

/// A problem found while verifying a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityIssue {
    MissingSection { section: String },
    ChecksumMismatch { section: String, expected: String, actual: String },
    CountMismatch { section: String, expected: usize, actual: usize },
    Undecodable { section: String, detail: String },
    ContentChecksumMismatch { expected: String, actual: String },
}

impl IntegrityIssue {
    /// Issues that still leave the section readable.
    pub fn is_readable(&self) -> bool {
        !matches!(
            self,
            IntegrityIssue::MissingSection { .. } | IntegrityIssue::Undecodable { .. }
        )
    }
}

impl fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityIssue::MissingSection { section } => {
                write!(f, "section '{}' is missing", section)
            }
            IntegrityIssue::ChecksumMismatch {
                section,
                expected,
                actual,
            } => write!(
                f,
                "section '{}' checksum {} does not match manifest {}",
                section, actual, expected
            ),
            IntegrityIssue::CountMismatch {
                section,
                expected,
                actual,
            } => write!(
                f,
                "section '{}' holds {} records, manifest says {}",
                section, actual, expected
            ),
            IntegrityIssue::Undecodable { section, detail } => {
                write!(f, "section '{}' cannot be decoded: {}", section, detail)
            }
            IntegrityIssue::ContentChecksumMismatch { expected, actual } => write!(
                f,
                "content checksum {} does not match manifest {}",
                actual, expected
            ),
        }
    }
}

/// Decoded records of one section.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBatch {
    Entities {
        entity_type: String,
        records: Vec<EntityRecord>,
    },
    Associations {
        entity_type: String,
        records: Vec<AssociationRecord>,
    },
}

impl RecordBatch {
    pub fn entity_type(&self) -> &str {
        match self {
            RecordBatch::Entities { entity_type, .. }
            | RecordBatch::Associations { entity_type, .. } => entity_type,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RecordBatch::Entities { records, .. } => records.len(),
            RecordBatch::Associations { records, .. } => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opens a container, verifies it and streams its sections back.
///
/// The reader never interprets foreign keys; it hands natural-key encoded
/// records to the caller as they are stored.
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    handle: SnapshotHandle,
    manifest: SnapshotManifest,
}

impl SnapshotReader {
    /// Loads the manifest and checks format and schema version.
    pub async fn open(handle: &SnapshotHandle) -> Result<Self> {
        let path = handle.manifest_path();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackupError::SnapshotCorrupt(format!(
                    "no manifest at '{}'",
                    path.display()
                )));
            }
            Err(err) => return Err(err.into()),
        };
        let manifest: SnapshotManifest = serde_json::from_slice(&bytes)
            .map_err(|err| BackupError::SnapshotCorrupt(format!("unreadable manifest: {}", err)))?;

        if manifest.format != SNAPSHOT_FORMAT {
            return Err(BackupError::SnapshotCorrupt(format!(
                "unknown container format '{}'",
                manifest.format
            )));
        }
        if manifest.schema_version == 0 || manifest.schema_version > SCHEMA_VERSION {
            return Err(BackupError::UnsupportedSchemaVersion {
                found: manifest.schema_version,
                supported: SCHEMA_VERSION,
            });
        }

        Ok(Self {
            handle: handle.clone(),
            manifest,
        })
    }

    pub fn manifest(&self) -> &SnapshotManifest {
        &self.manifest
    }

    pub fn handle(&self) -> &SnapshotHandle {
        &self.handle
    }

    /// True when every checksum and count matches.
    pub async fn verify(&self) -> Result<bool> {
        Ok(self.verify_report().await?.is_empty())
    }

    /// Every integrity problem of the container; empty when it is intact.
    pub async fn verify_report(&self) -> Result<Vec<IntegrityIssue>> {
        let mut issues = Vec::new();

        let content = self.manifest.compute_content_checksum();
        if content != self.manifest.content_checksum {
            issues.push(IntegrityIssue::ContentChecksumMismatch {
                expected: self.manifest.content_checksum.clone(),
                actual: content,
            });
        }

        for (kind, entry) in self.manifest.sections() {
            let Some(bytes) = self.section_bytes(kind, entry).await? else {
                issues.push(IntegrityIssue::MissingSection {
                    section: entry.name.clone(),
                });
                continue;
            };

            let actual = sha256_hex(&bytes);
            if actual != entry.checksum {
                issues.push(IntegrityIssue::ChecksumMismatch {
                    section: entry.name.clone(),
                    expected: entry.checksum.clone(),
                    actual,
                });
            }

            match self.decode(kind, entry, &bytes) {
                Ok(batch) if batch.len() != entry.expected_count => {
                    issues.push(IntegrityIssue::CountMismatch {
                        section: entry.name.clone(),
                        expected: entry.expected_count,
                        actual: batch.len(),
                    });
                }
                Ok(_) => {}
                Err(err) => issues.push(IntegrityIssue::Undecodable {
                    section: entry.name.clone(),
                    detail: err.to_string(),
                }),
            }
        }

        if !issues.is_empty() {
            event!(
                Level::WARN,
                snapshot_id = %self.manifest.snapshot_id,
                issues = issues.len(),
                "snapshot verification failed"
            );
        }
        Ok(issues)
    }

    pub async fn read_entities(&self, name: &str) -> Result<Vec<EntityRecord>> {
        match self.read_section(name).await? {
            RecordBatch::Entities { records, .. } => Ok(records),
            RecordBatch::Associations { .. } => Err(BackupError::SnapshotCorrupt(format!(
                "'{}' is an association section",
                name
            ))),
        }
    }

    pub async fn read_associations(&self, name: &str) -> Result<Vec<AssociationRecord>> {
        match self.read_section(name).await? {
            RecordBatch::Associations { records, .. } => Ok(records),
            RecordBatch::Entities { .. } => Err(BackupError::SnapshotCorrupt(format!(
                "'{}' is an entity section",
                name
            ))),
        }
    }

    /// Decodes every section lazily, in manifest order.
    pub fn batches(&self) -> impl Stream<Item = Result<RecordBatch>> + '_ {
        let sections: Vec<(SectionKind, SectionEntry)> = self
            .manifest
            .sections()
            .map(|(kind, entry)| (kind, entry.clone()))
            .collect();
        stream::iter(sections).then(move |(kind, entry)| async move {
            self.load(kind, &entry).await
        })
    }

    async fn read_section(&self, name: &str) -> Result<RecordBatch> {
        let (kind, entry) = self.manifest.section(name).ok_or_else(|| {
            BackupError::SnapshotCorrupt(format!("snapshot has no section '{}'", name))
        })?;
        self.load(kind, entry).await
    }

    async fn load(&self, kind: SectionKind, entry: &SectionEntry) -> Result<RecordBatch> {
        let bytes = self.section_bytes(kind, entry).await?.ok_or_else(|| {
            BackupError::SnapshotCorrupt(format!("section '{}' is missing", entry.name))
        })?;
        self.decode(kind, entry, &bytes)
            .map_err(|err| corrupt(&entry.name, err))
    }

    async fn section_bytes(
        &self,
        kind: SectionKind,
        entry: &SectionEntry,
    ) -> Result<Option<Vec<u8>>> {
        let path = self
            .handle
            .section_path(kind, &entry.name, self.manifest.encoding);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn decode(&self, kind: SectionKind, entry: &SectionEntry, bytes: &[u8]) -> Result<RecordBatch> {
        let encoding = self.manifest.encoding;
        Ok(match kind {
            SectionKind::Entity => RecordBatch::Entities {
                entity_type: entry.name.clone(),
                records: encoding.decode(bytes)?,
            },
            SectionKind::Association => RecordBatch::Associations {
                entity_type: entry.name.clone(),
                records: encoding.decode(bytes)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FieldMap, NaturalKey, Value};
    use crate::schema::{EntityRegistry, EntityType};
    use crate::snapshot::{ExportOptions, SnapshotWriter};
    use crate::storage::MemoryStore;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    async fn written() -> (TempDir, SnapshotHandle) {
        let registry = EntityRegistry::builder()
            .entity(EntityType::new("user").text_field("username").natural_key(&["username"]))
            .entity(EntityType::new("group").text_field("name").natural_key(&["name"]))
            .build()
            .unwrap();
        let store = MemoryStore::for_registry(&registry).await;
        for name in ["alice", "bob"] {
            let mut fields = FieldMap::new();
            fields.insert("username".into(), Value::from(name));
            store.insert_row("user", fields).await.unwrap();
        }
        let dir = TempDir::new().unwrap();
        SnapshotWriter::new(&registry, ExportOptions::default())
            .write(&store, &[], dir.path())
            .await
            .unwrap();
        let handle = SnapshotHandle::new(dir.path());
        (dir, handle)
    }

    #[tokio::test]
    async fn test_batches_follow_manifest_order() {
        let (_dir, handle) = written().await;
        let reader = SnapshotReader::open(&handle).await.unwrap();
        assert!(reader.verify().await.unwrap());

        let batches: Vec<RecordBatch> = reader.batches().try_collect().await.unwrap();
        let names: Vec<&str> = batches.iter().map(|b| b.entity_type()).collect();
        assert_eq!(names, vec!["group", "user"]);
        assert!(batches[0].is_empty());

        let users = reader.read_entities("user").await.unwrap();
        assert_eq!(users[0].natural_key, NaturalKey::from("alice"));
    }

    #[tokio::test]
    async fn test_tampered_section_detected() {
        let (dir, handle) = written().await;
        let path = dir.path().join("entities/user.json");
        let text = std::fs::read_to_string(&path).unwrap().replace("bob", "bob2");
        std::fs::write(&path, text).unwrap();

        let reader = SnapshotReader::open(&handle).await.unwrap();
        let issues = reader.verify_report().await.unwrap();
        assert_eq!(issues.len(), 1);
        assert!(matches!(issues[0], IntegrityIssue::ChecksumMismatch { .. }));
        assert!(issues[0].is_readable());
    }

    #[tokio::test]
    async fn test_truncated_section_is_corrupt() {
        let (dir, handle) = written().await;
        let path = dir.path().join("entities/user.json");
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        let reader = SnapshotReader::open(&handle).await.unwrap();
        assert!(!reader.verify().await.unwrap());
        assert!(matches!(
            reader.read_entities("user").await,
            Err(BackupError::SnapshotCorrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_manifest() {
        let dir = TempDir::new().unwrap();
        let err = SnapshotReader::open(&SnapshotHandle::new(dir.path()))
            .await
            .unwrap_err();
        assert!(err.is_snapshot_error());
    }
}
