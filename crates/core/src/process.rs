//! In-memory process records and the store that owns them.
//!
//! Records are never evicted; the map grows for the lifetime of the service.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Queued,
    Processing,
    Done,
}

impl ProcessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::Queued => "queued",
            ProcessStatus::Processing => "processing",
            ProcessStatus::Done => "done",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the submitted video came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoSource {
    File(PathBuf),
    Url(Url),
}

impl VideoSource {
    pub fn kind(&self) -> &'static str {
        match self {
            VideoSource::File(_) => "file",
            VideoSource::Url(_) => "url",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub id: String,
    pub status: ProcessStatus,
    pub tags: Option<Vec<String>>,
    pub source: VideoSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessRecord {
    /// Tags are only visible once the record is done.
    pub fn visible_tags(&self) -> Option<&[String]> {
        match self.status {
            ProcessStatus::Done => self.tags.as_deref(),
            ProcessStatus::Queued | ProcessStatus::Processing => None,
        }
    }
}

/// Shared map from process id to record. Cloning is cheap and every clone
/// sees the same records.
#[derive(Debug, Clone, Default)]
pub struct ProcessStore {
    records: Arc<DashMap<String, ProcessRecord>>,
}

impl ProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Inserts a fresh `queued` record under `id`. Returns `false` without
    /// touching the existing entry if the id is already taken.
    pub fn insert_queued(&self, id: &str, source: VideoSource) -> bool {
        let now = Utc::now();
        match self.records.entry(id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ProcessRecord {
                    id: id.to_string(),
                    status: ProcessStatus::Queued,
                    tags: None,
                    source,
                    created_at: now,
                    updated_at: now,
                });
                true
            }
        }
    }

    /// Snapshot of the record; the map guard is released before returning.
    pub fn get(&self, id: &str) -> Option<ProcessRecord> {
        self.records.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn mark_processing(&self, id: &str) -> bool {
        self.update(id, |record| {
            record.status = ProcessStatus::Processing;
        })
    }

    pub fn mark_done(&self, id: &str, tags: Vec<String>) -> bool {
        self.update(id, |record| {
            record.status = ProcessStatus::Done;
            record.tags = Some(tags);
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn update(&self, id: &str, apply: impl FnOnce(&mut ProcessRecord)) -> bool {
        match self.records.get_mut(id) {
            Some(mut record) => {
                apply(record.value_mut());
                record.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }
}
