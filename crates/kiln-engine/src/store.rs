//! Artifact records and the generation store that persists them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::fingerprint::Fingerprint;
use crate::slot::{ArtifactSlot, Registry, SlotId};
use crate::task::TaskId;

/// One produced (or externally supplied) artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub slot: SlotId,
    pub locations: Vec<PathBuf>,
    /// Content fingerprint of `locations`.
    pub fingerprint: Fingerprint,
    /// Input fingerprint of the producing run. `None` for external sources.
    pub input_fingerprint: Option<Fingerprint>,
    /// `None` for external sources.
    pub producer: Option<TaskId>,
    /// Epoch seconds.
    pub created_at: u64,
}

/// The records of one build session, keyed by slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub number: u64,
    pub records: BTreeMap<SlotId, Vec<ArtifactRecord>>,
}

impl Generation {
    /// Records in `slot`, ordered by producer and then by location so the
    /// result does not depend on completion order.
    pub fn records_in(&self, slot: &SlotId) -> Vec<ArtifactRecord> {
        let mut records = self.records.get(slot).cloned().unwrap_or_default();
        records.sort_by(|a, b| {
            a.producer
                .cmp(&b.producer)
                .then_with(|| a.locations.cmp(&b.locations))
        });
        records
    }

    pub fn record_count(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }
}

/// Holds the previous generation read from disk and the current generation
/// being written by a session.
///
/// Writes go through a mutex, so a store can be shared with worker threads.
#[derive(Debug)]
pub struct ArtifactStore {
    path: PathBuf,
    previous: Generation,
    current: Mutex<Generation>,
}

impl ArtifactStore {
    /// A store with no history that will persist to `path`.
    pub fn empty(path: &Path) -> Self {
        Self::with_previous(path, Generation::default())
    }

    /// Read the previous generation from `path`. A missing file means no history.
    ///
    /// # Errors
    /// Returns [`EngineError::StoreIoFailure`] if the file cannot be read, or
    /// [`EngineError::StoreFormat`] if it does not hold a generation.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        if !path.exists() {
            return Ok(Self::empty(path));
        }
        let content = std::fs::read(path).map_err(|e| EngineError::StoreIoFailure {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let previous: Generation =
            serde_json::from_slice(&content).map_err(|source| EngineError::StoreFormat {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self::with_previous(path, previous))
    }

    /// Like [`ArtifactStore::load`], but an unreadable state file is logged
    /// and treated as no history, so every task reruns.
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(store) => store,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring unreadable build state; rebuilding everything");
                Self::empty(path)
            }
        }
    }

    fn with_previous(path: &Path, previous: Generation) -> Self {
        let current = Generation {
            number: previous.number.saturating_add(1),
            records: BTreeMap::new(),
        };
        Self {
            path: path.to_path_buf(),
            previous,
            current: Mutex::new(current),
        }
    }

    /// Copy the previous-generation records of `producer` into the current
    /// generation, for tasks that were not attempted this session.
    ///
    /// A record is skipped when its slot is no longer registered, when the
    /// producer already wrote to the slot in this generation, or when a
    /// non-appendable slot already holds a record. Returns how many records
    /// were carried.
    pub fn carry_forward(&self, registry: &Registry, producer: &TaskId) -> usize {
        let mut current = self.lock();
        let mut carried = 0;
        for (slot_id, records) in &self.previous.records {
            let Ok(slot) = registry.lookup(slot_id) else {
                continue;
            };
            for record in records {
                if record.producer.as_ref() != Some(producer) {
                    continue;
                }
                let entries = current.records.entry(slot_id.clone()).or_default();
                let occupied = if slot.is_appendable() {
                    entries.iter().any(|e| e.producer == record.producer)
                } else {
                    !entries.is_empty()
                };
                if !occupied {
                    entries.push(record.clone());
                    carried += 1;
                }
            }
        }
        current.records.retain(|_, entries| !entries.is_empty());
        carried
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn previous(&self) -> &Generation {
        &self.previous
    }

    /// Number of the generation being written.
    pub fn generation(&self) -> u64 {
        self.lock().number
    }

    /// Records `producer` wrote to `slot` in the previous generation.
    /// `None` selects external sources.
    pub fn previous_records(&self, slot: &SlotId, producer: Option<&TaskId>) -> Vec<ArtifactRecord> {
        self.previous
            .records_in(slot)
            .into_iter()
            .filter(|record| record.producer.as_ref() == producer)
            .collect()
    }

    /// Records written to `slot` so far in the current generation.
    pub fn current_records(&self, slot: &SlotId) -> Vec<ArtifactRecord> {
        self.lock().records_in(slot)
    }

    /// Bind `record` to `slot` in the current generation.
    ///
    /// Appendable slots accumulate records; a record from a producer that
    /// already wrote to the slot replaces that producer's earlier one. Any
    /// other slot keeps only the latest record.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidSlot`] if `record` names another slot.
    pub fn record(&self, slot: &ArtifactSlot, record: ArtifactRecord) -> Result<(), EngineError> {
        if &record.slot != slot.id() {
            return Err(EngineError::InvalidSlot {
                id: slot.id().clone(),
                reason: format!("record belongs to slot `{}`", record.slot),
            });
        }
        let mut current = self.lock();
        let entries = current.records.entry(slot.id().clone()).or_default();
        if slot.is_appendable() {
            entries.retain(|existing| existing.producer != record.producer);
            entries.push(record);
        } else {
            *entries = vec![record];
        }
        Ok(())
    }

    /// A copy of the current generation.
    pub fn snapshot(&self) -> Generation {
        self.lock().clone()
    }

    /// Atomically persist the current generation to the store path.
    ///
    /// # Errors
    /// Returns [`EngineError::StoreIoFailure`] if serialization or the write fails.
    pub fn flush(&self) -> Result<(), EngineError> {
        let snapshot = self.snapshot();
        let json = serde_json::to_vec_pretty(&snapshot).map_err(|e| EngineError::StoreIoFailure {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })?;
        kiln_util::fs::write_atomic(&self.path, &json).map_err(|e| {
            EngineError::StoreIoFailure {
                path: self.path.display().to_string(),
                message: e.to_string(),
            }
        })?;
        tracing::debug!(
            path = %self.path.display(),
            generation = snapshot.number,
            records = snapshot.record_count(),
            "flushed build state"
        );
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Generation> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Current time as epoch seconds.
pub fn now_epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
