//! Artifact slots and the registry that declares them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Identifier of an artifact slot, unique within a [`Registry`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(String);

impl SlotId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SlotId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// How many artifacts a slot may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    Single,
    Multiple,
}

/// Whether each artifact location is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    File,
    Directory,
}

/// Broad classification used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Sources,
    Intermediates,
    Outputs,
}

/// A named, typed slot for build artifacts.
///
/// Slots are immutable once declared. Only `Multiple` slots may be appendable;
/// an appendable slot accumulates the records of every producer, any other
/// slot keeps only the latest one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSlot {
    id: SlotId,
    cardinality: Cardinality,
    kind: SlotKind,
    category: Category,
    appendable: bool,
}

impl ArtifactSlot {
    /// A slot holding exactly one artifact.
    pub fn single(id: impl Into<String>, kind: SlotKind, category: Category) -> Self {
        Self {
            id: SlotId::new(id),
            cardinality: Cardinality::Single,
            kind,
            category,
            appendable: false,
        }
    }

    /// A slot holding any number of artifacts, replaced as a whole on each write.
    pub fn multiple(id: impl Into<String>, kind: SlotKind, category: Category) -> Self {
        Self {
            cardinality: Cardinality::Multiple,
            ..Self::single(id, kind, category)
        }
    }

    /// A `Multiple` slot that several tasks may contribute to.
    pub fn appendable(id: impl Into<String>, kind: SlotKind, category: Category) -> Self {
        Self {
            appendable: true,
            ..Self::multiple(id, kind, category)
        }
    }

    /// Build a slot from its raw parts. The registry rejects the invalid
    /// combination of `Single` and appendable.
    pub fn from_parts(
        id: impl Into<String>,
        cardinality: Cardinality,
        kind: SlotKind,
        category: Category,
        appendable: bool,
    ) -> Self {
        Self {
            id: SlotId::new(id),
            cardinality,
            kind,
            category,
            appendable,
        }
    }

    pub fn id(&self) -> &SlotId {
        &self.id
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    pub fn kind(&self) -> SlotKind {
        self.kind
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn is_appendable(&self) -> bool {
        self.appendable
    }
}

/// Receipt for a successful declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotHandle(SlotId);

impl SlotHandle {
    pub fn id(&self) -> &SlotId {
        &self.0
    }
}

/// Slots every Android-style build pipeline shares. They are all appendable
/// directory slots, so several tasks can contribute to each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WellKnownSlot {
    Dex,
    ExternalLibsDex,
    PartialRFiles,
    ResCompiledFlatFiles,
}

impl WellKnownSlot {
    pub const ALL: [Self; 4] = [
        Self::Dex,
        Self::ExternalLibsDex,
        Self::PartialRFiles,
        Self::ResCompiledFlatFiles,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Self::Dex => "dex",
            Self::ExternalLibsDex => "external-libs-dex",
            Self::PartialRFiles => "partial-r-files",
            Self::ResCompiledFlatFiles => "res-compiled-flat-files",
        }
    }

    pub fn slot(self) -> ArtifactSlot {
        ArtifactSlot::appendable(self.id(), SlotKind::Directory, Category::Intermediates)
    }
}

/// The set of declared slots, in declaration order.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    slots: Vec<ArtifactSlot>,
    index: BTreeMap<SlotId, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every [`WellKnownSlot`] already declared.
    pub fn with_well_known() -> Self {
        let mut registry = Self::new();
        for known in WellKnownSlot::ALL {
            registry.insert(known.slot());
        }
        registry
    }

    /// Declare a new slot.
    ///
    /// # Errors
    /// Returns [`EngineError::DuplicateSlot`] if the id is taken, or
    /// [`EngineError::InvalidSlot`] for an appendable `Single` slot.
    pub fn declare(&mut self, slot: ArtifactSlot) -> Result<SlotHandle, EngineError> {
        if self.index.contains_key(slot.id()) {
            return Err(EngineError::DuplicateSlot {
                id: slot.id().clone(),
            });
        }
        if slot.is_appendable() && slot.cardinality() == Cardinality::Single {
            return Err(EngineError::InvalidSlot {
                id: slot.id().clone(),
                reason: "only slots with multiple cardinality can be appendable".to_owned(),
            });
        }
        if slot.id().as_str().is_empty() {
            return Err(EngineError::InvalidSlot {
                id: slot.id().clone(),
                reason: "slot id must not be empty".to_owned(),
            });
        }
        let handle = SlotHandle(slot.id().clone());
        self.insert(slot);
        Ok(handle)
    }

    /// Look up a declared slot.
    ///
    /// # Errors
    /// Returns [`EngineError::UnknownSlot`] if `id` was never declared.
    pub fn lookup(&self, id: &SlotId) -> Result<&ArtifactSlot, EngineError> {
        self.index
            .get(id)
            .and_then(|&i| self.slots.get(i))
            .ok_or_else(|| EngineError::UnknownSlot { id: id.clone() })
    }

    pub fn contains(&self, id: &SlotId) -> bool {
        self.index.contains_key(id)
    }

    /// Iterate slots in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &ArtifactSlot> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn insert(&mut self, slot: ArtifactSlot) {
        self.index.insert(slot.id().clone(), self.slots.len());
        self.slots.push(slot);
    }
}
