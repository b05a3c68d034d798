//! Content and input fingerprints.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::store::ArtifactRecord;
use crate::task::TaskNode;

/// A SHA-256 hex digest identifying artifact content or task inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint the content at `locations`.
    ///
    /// Each location contributes its path and content digest. The result does
    /// not depend on the order of `locations`.
    ///
    /// # Errors
    /// Returns an error if a location is missing or cannot be read.
    pub fn of_locations(locations: &[PathBuf]) -> Result<Self, kiln_util::error::UtilError> {
        let mut parts = Vec::with_capacity(locations.len());
        for location in locations {
            let digest = kiln_util::hash::sha256_location(location)?;
            let path = location.display().to_string();
            parts.push(kiln_util::hash::sha256_parts(&[&path, &digest]));
        }
        Ok(Self(kiln_util::hash::sha256_unordered(&parts)))
    }

    /// Compute the input fingerprint of a task.
    pub fn compute(inputs: &FingerprintInputs<'_>) -> Self {
        let records = kiln_util::hash::sha256_unordered(&inputs.record_digests);
        Self(kiln_util::hash::sha256_parts(&[
            "kiln-inputs-v1",
            inputs.task,
            inputs.config_fingerprint,
            &records,
        ]))
    }

    /// The input fingerprint of `task` given the records bound to its inputs.
    ///
    /// Each record contributes its content fingerprint and the input
    /// fingerprint of the run that produced it, so a change upstream reaches
    /// every transitive dependent even when the produced bytes are identical.
    /// Records in slots excluded by the task's fingerprint policy are ignored.
    /// Order of `records` does not matter.
    pub fn for_task(task: &TaskNode, records: &[ArtifactRecord]) -> Self {
        let policy = task.fingerprint_policy();
        let record_digests = records
            .iter()
            .filter(|record| policy.includes(&record.slot))
            .map(|record| {
                let upstream = record.input_fingerprint.as_ref().map_or("", Fingerprint::as_hex);
                kiln_util::hash::sha256_parts(&[
                    record.slot.as_str(),
                    record.fingerprint.as_hex(),
                    upstream,
                ])
            })
            .collect();
        Self::compute(&FingerprintInputs {
            task: task.id().as_str(),
            config_fingerprint: task.config_fingerprint(),
            record_digests,
        })
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything that contributes to a task's input fingerprint.
#[derive(Debug)]
pub struct FingerprintInputs<'a> {
    pub task: &'a str,
    pub config_fingerprint: &'a str,
    /// One digest per input record, in any order.
    pub record_digests: Vec<String>,
}
