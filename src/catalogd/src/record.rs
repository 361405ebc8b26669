//! Desired-state records for catalogs and the store the reconciler reads
//! them from. The store itself is an external collaborator; this module
//! defines the wire schema, the condition bookkeeping, and the trait the
//! reconciler depends on, plus an in-process implementation used by the
//! daemon wiring and the tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::{duration_string_opt, CATALOG_FINALIZER, METADATA_NAME_LABEL};
use crate::error::{Error, Result};

pub const TYPE_UNPACKED: &str = "Unpacked";
pub const TYPE_DELETE: &str = "Delete";

pub const REASON_UNPACK_PENDING: &str = "UnpackPending";
pub const REASON_UNPACKING: &str = "Unpacking";
pub const REASON_UNPACK_SUCCESSFUL: &str = "UnpackSuccessful";
pub const REASON_UNPACK_FAILED: &str = "UnpackFailed";
pub const REASON_STORAGE_FAILED: &str = "FailedToStore";
pub const REASON_STORAGE_DELETE_FAILED: &str = "FailedToDelete";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// One observation about the record, in the usual type/status/reason shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default)]
    pub observed_generation: i64,
}

/// Upsert a condition. The transition time only advances when the status
/// value actually flips.
pub fn set_condition(conditions: &mut Vec<Condition>, mut new: Condition) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == new.condition_type)
    {
        Some(existing) => {
            if existing.status == new.status {
                new.last_transition_time = existing.last_transition_time;
            }
            *existing = new;
        }
        None => conditions.push(new),
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

/// A catalog desired-state record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub metadata: Metadata,
    pub spec: CatalogSpec,
    #[serde(default)]
    pub status: CatalogStatus,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSpec {
    pub source: CatalogSource,
    #[serde(default)]
    pub priority: i32,
}

/// Source of catalog content. A closed sum: every variant carries its own
/// fields and the discriminator is the serialized `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CatalogSource {
    Image { image: ImageSource },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    /// Image reference, `registry/repo:tag` or `registry/repo@sha256:…`.
    #[serde(rename = "ref")]
    pub reference: String,
    /// How often to re-resolve a tag. Disallowed with digest references.
    #[serde(
        default,
        with = "duration_string_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub poll_interval: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_source: Option<ResolvedSource>,
    #[serde(rename = "contentURL", default, skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_unpacked: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResolvedSource {
    Image { image: ResolvedImageSource },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedImageSource {
    /// Reference the user asked for.
    #[serde(rename = "ref")]
    pub reference: String,
    /// Canonical `registry/repo@sha256:…` the reference resolved to.
    #[serde(rename = "resolvedRef")]
    pub resolved_reference: String,
    /// When the source was last polled. Advances on every real pull
    /// attempt, success or not.
    pub last_poll_attempt: DateTime<Utc>,
    /// When content was last successfully unpacked. Independent of
    /// `last_poll_attempt`; the two are never folded.
    pub last_unpacked: DateTime<Utc>,
}

impl CatalogRecord {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// The image source of this record. There is exactly one source variant
    /// today; the match stays exhaustive so adding a variant forces every
    /// caller to decide.
    pub fn image_source(&self) -> &ImageSource {
        match &self.spec.source {
            CatalogSource::Image { image } => image,
        }
    }

    pub fn being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

/// Admission defaulting: the metadata-name label always equals the record
/// name, overwriting whatever the user supplied.
pub fn default_record(record: &mut CatalogRecord) {
    record
        .metadata
        .labels
        .insert(METADATA_NAME_LABEL.to_string(), record.metadata.name.clone());
}

/// Admission validation: a digest-pinned reference may not poll.
pub fn validate_record(record: &CatalogRecord) -> Result<()> {
    let image = record.image_source();
    if image.poll_interval.is_some() && image.reference.contains("@sha256:") {
        return Err(Error::Unrecoverable(format!(
            "catalog {}: pollInterval is not allowed with a digest-based reference",
            record.name()
        )));
    }
    Ok(())
}

/// A change notification from the record store. Carries only the key; the
/// reconciler re-reads the record itself.
#[derive(Debug, Clone)]
pub struct RecordEvent {
    pub name: String,
}

/// The desired-state store the reconciler works against. The real store is
/// an external collaborator; everything the reconciler needs is behind this
/// trait.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    async fn list(&self) -> Result<Vec<CatalogRecord>>;

    async fn get(&self, name: &str) -> Result<Option<CatalogRecord>>;

    /// Replace the status subresource. Must not touch spec or metadata.
    async fn update_status(&self, name: &str, status: CatalogStatus) -> Result<()>;

    /// Main-object mutation: make sure the cleanup finalizer is present.
    async fn ensure_finalizer(&self, name: &str) -> Result<()>;

    /// Main-object mutation: drop the cleanup finalizer. If the record is
    /// being deleted and no finalizers remain, the record goes away.
    async fn remove_finalizer(&self, name: &str) -> Result<()>;

    /// Subscribe to change notifications.
    fn watch(&self) -> broadcast::Receiver<RecordEvent>;
}

/// In-process record store backing the daemon wiring and the tests.
pub struct InMemoryRecordStore {
    records: Mutex<HashMap<String, CatalogRecord>>,
    events: broadcast::Sender<RecordEvent>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        InMemoryRecordStore {
            records: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn notify(&self, name: &str) {
        let _ = self.events.send(RecordEvent {
            name: name.to_string(),
        });
    }

    /// Create or update a record the way the API server would: defaulting
    /// and admission validation run, and the generation bumps when the spec
    /// changes.
    pub fn apply(&self, mut record: CatalogRecord) -> Result<()> {
        default_record(&mut record);
        validate_record(&record)?;
        let mut records = self.records.lock().unwrap();
        match records.get(&record.metadata.name) {
            Some(existing) => {
                record.metadata.generation = if existing.spec == record.spec {
                    existing.metadata.generation
                } else {
                    existing.metadata.generation + 1
                };
                record.metadata.finalizers = existing.metadata.finalizers.clone();
                record.metadata.deletion_timestamp = existing.metadata.deletion_timestamp;
                record.status = existing.status.clone();
            }
            None => record.metadata.generation = 1,
        }
        let name = record.metadata.name.clone();
        records.insert(name.clone(), record);
        drop(records);
        self.notify(&name);
        Ok(())
    }

    /// Delete a record. With finalizers present this only sets the deletion
    /// timestamp; the record disappears once they are removed.
    pub fn delete(&self, name: &str) {
        let mut records = self.records.lock().unwrap();
        let mut found = false;
        let mut remove = false;
        if let Some(record) = records.get_mut(name) {
            found = true;
            if record.metadata.finalizers.is_empty() {
                remove = true;
            } else if record.metadata.deletion_timestamp.is_none() {
                record.metadata.deletion_timestamp = Some(Utc::now());
            }
        }
        if remove {
            records.remove(name);
        }
        drop(records);
        if found {
            self.notify(name);
        }
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn list(&self) -> Result<Vec<CatalogRecord>> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<Option<CatalogRecord>> {
        Ok(self.records.lock().unwrap().get(name).cloned())
    }

    async fn update_status(&self, name: &str, status: CatalogStatus) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        match records.get_mut(name) {
            Some(record) => {
                record.status = status;
                Ok(())
            }
            None => Err(Error::Cache(format!("record {} not found", name))),
        }
    }

    async fn ensure_finalizer(&self, name: &str) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(name) {
            let finalizer = CATALOG_FINALIZER.to_string();
            if !record.metadata.finalizers.contains(&finalizer) {
                record.metadata.finalizers.push(finalizer);
            }
        }
        Ok(())
    }

    async fn remove_finalizer(&self, name: &str) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        let mut remove = false;
        if let Some(record) = records.get_mut(name) {
            record.metadata.finalizers.retain(|f| f != CATALOG_FINALIZER);
            remove = record.being_deleted() && record.metadata.finalizers.is_empty();
        }
        if remove {
            records.remove(name);
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<RecordEvent> {
        self.events.subscribe()
    }
}
