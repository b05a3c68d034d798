use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// The `kiln.toml` project manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Manifest {
    #[serde(default)]
    pub build: BuildSettings,
    /// Project-specific artifact slots, declared in addition to the well-known ones.
    #[serde(default, rename = "slot", skip_serializing_if = "Vec::is_empty")]
    pub slots: Vec<SlotDecl>,
    /// Slots whose contents are supplied from the file system rather than a task.
    #[serde(default, rename = "source", skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceDecl>,
    #[serde(default, rename = "task", skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskDecl>,
}

/// The `[build]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSettings {
    /// Worker bound; `None` means one worker per available CPU.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallelism: Option<usize>,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub force_rebuild_all: bool,
    /// Directory (relative to the project root) holding persisted build state.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            max_parallelism: None,
            fail_fast: false,
            force_rebuild_all: false,
            state_dir: default_state_dir(),
        }
    }
}

fn default_state_dir() -> String {
    ".kiln".to_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindDecl {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CardinalityDecl {
    #[default]
    Single,
    Multiple,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CategoryDecl {
    Sources,
    #[default]
    Intermediates,
    Outputs,
}

/// A `[[slot]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDecl {
    pub id: String,
    pub kind: KindDecl,
    #[serde(default)]
    pub cardinality: CardinalityDecl,
    #[serde(default)]
    pub category: CategoryDecl,
    #[serde(default)]
    pub appendable: bool,
}

/// A `[[source]]` entry: paths supplied for a slot before any task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDecl {
    pub slot: String,
    pub paths: Vec<String>,
}

/// One output of a task: the slot it fills and the paths the command writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDecl {
    pub slot: String,
    pub paths: Vec<String>,
}

/// A `[[task]]` entry backed by an external command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDecl {
    pub id: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<OutputDecl>,
    /// Program and arguments, run from the project root.
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Free-form settings; only their content matters, through the config fingerprint.
    #[serde(default, skip_serializing_if = "toml::Table::is_empty")]
    pub config: toml::Table,
    /// Restrict which inputs invalidate this task. `None` means all of them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint_inputs: Option<Vec<String>>,
}

impl TaskDecl {
    /// Canonical text of everything about this task that should invalidate its
    /// outputs when edited: the command line and its environment, where the
    /// outputs are written, and `config`.
    ///
    /// # Errors
    /// Returns an error if the declaration cannot be serialized.
    pub fn config_source(&self) -> Result<String, ManifestError> {
        #[derive(Serialize)]
        struct Canonical<'a> {
            command: &'a [String],
            env: &'a BTreeMap<String, String>,
            outputs: &'a [OutputDecl],
            config: &'a toml::Table,
        }

        toml::to_string(&Canonical {
            command: &self.command,
            env: &self.env,
            outputs: &self.outputs,
            config: &self.config,
        })
        .map_err(|source| ManifestError::Serialize { source })
    }
}

impl Manifest {
    /// Read, parse, and validate a `kiln.toml` from the given path.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, contains invalid TOML, or
    /// fails validation.
    pub fn from_path(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|e| ManifestError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&content, &path.display().to_string())
    }

    /// Parse and validate manifest text. `origin` names the source in errors.
    ///
    /// # Errors
    /// Returns an error if the text is invalid TOML or fails validation.
    pub fn parse(content: &str, origin: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = toml::from_str(content).map_err(|e| ManifestError::Parse {
            path: origin.to_owned(),
            source: e,
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Serialize the manifest to human-readable TOML.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ManifestError> {
        toml::to_string_pretty(self).map_err(|source| ManifestError::Serialize { source })
    }

    /// Check the structural rules that do not need the artifact registry.
    ///
    /// Slot references, producer conflicts and cycles are checked later, when
    /// the build graph is assembled.
    ///
    /// # Errors
    /// Returns [`ManifestError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.build.max_parallelism == Some(0) {
            return Err(invalid("[build] max_parallelism must be at least 1"));
        }
        if self.build.state_dir.trim().is_empty() {
            return Err(invalid("[build] state_dir must not be empty"));
        }

        let mut task_ids = BTreeSet::new();
        for task in &self.tasks {
            if task.id.trim().is_empty() {
                return Err(invalid("task id must not be empty"));
            }
            if !task_ids.insert(task.id.as_str()) {
                return Err(invalid(&format!("task `{}` is declared twice", task.id)));
            }
            if task.command.is_empty() {
                return Err(invalid(&format!("task `{}` has an empty command", task.id)));
            }
            if task.outputs.is_empty() {
                return Err(invalid(&format!("task `{}` declares no outputs", task.id)));
            }
            if let Some(output) = task.outputs.iter().find(|o| o.paths.is_empty()) {
                return Err(invalid(&format!(
                    "task `{}` output `{}` lists no paths",
                    task.id, output.slot
                )));
            }
        }

        for source in &self.sources {
            if source.paths.is_empty() {
                return Err(invalid(&format!(
                    "source for slot `{}` lists no paths",
                    source.slot
                )));
            }
        }

        Ok(())
    }
}

fn invalid(message: &str) -> ManifestError {
    ManifestError::Invalid {
        message: message.to_owned(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid kiln.toml at {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("cannot serialize manifest: {source}")]
    Serialize { source: toml::ser::Error },
    #[error("invalid kiln.toml: {message}")]
    Invalid { message: String },
}
