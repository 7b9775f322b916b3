//! Object identity: stable UIDs, volatile handles and element-index remaps.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Index of a registered concrete object type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TypeTag(pub u16);

impl TypeTag {
    /// Position of the type in the resource manager's container table.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Stable identity of a simulation object for its whole lifetime.
///
/// Serials are issued monotonically by the resource manager and never reused,
/// not even after [`crate::ResourceManager::clear`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Uid {
    tag: TypeTag,
    serial: u64,
}

impl Uid {
    #[must_use]
    pub const fn new(tag: TypeTag, serial: u64) -> Self {
        Self { tag, serial }
    }

    /// Type the object was registered under.
    #[must_use]
    pub const fn type_tag(self) -> TypeTag {
        self.tag
    }

    /// Monotonic serial number.
    #[must_use]
    pub const fn serial(self) -> u64 {
        self.serial
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tag, self.serial)
    }
}

/// Array-slot address of an object: type tag plus element index.
///
/// Only valid until the next structural mutation of that type's storage.
/// Never keep one across an iteration boundary; resolve the [`Uid`] again.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Handle {
    tag: TypeTag,
    element: u32,
}

impl Handle {
    #[must_use]
    pub const fn new(tag: TypeTag, element: u32) -> Self {
        Self { tag, element }
    }

    #[must_use]
    pub const fn type_tag(self) -> TypeTag {
        self.tag
    }

    /// Slot of the object inside its type's container.
    #[must_use]
    pub const fn element_idx(self) -> u32 {
        self.element
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.element as usize
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.tag, self.element)
    }
}

/// Old element index to new element index, per type, produced by swap-removals.
///
/// Entries compose across several removals in the same teardown: an object
/// moved twice maps straight from its original slot to its final one, and
/// objects that were moved and later removed drop out of the table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemapTable {
    per_type: Vec<HashMap<u32, u32>>,
}

impl RemapTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when no element moved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.per_type.iter().all(HashMap::is_empty)
    }

    /// Number of moved elements across all types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.per_type.iter().map(HashMap::len).sum()
    }

    /// Remaps recorded for one type.
    #[must_use]
    pub fn for_type(&self, tag: TypeTag) -> Option<&HashMap<u32, u32>> {
        self.per_type.get(tag.index()).filter(|map| !map.is_empty())
    }

    /// New element index for `old`, if that element moved.
    #[must_use]
    pub fn lookup(&self, tag: TypeTag, old: u32) -> Option<u32> {
        self.per_type.get(tag.index())?.get(&old).copied()
    }

    /// Returns `handle` with its element index rewritten when it moved.
    #[must_use]
    pub fn remap(&self, handle: Handle) -> Handle {
        match self.lookup(handle.tag, handle.element) {
            Some(element) => Handle::new(handle.tag, element),
            None => handle,
        }
    }

    /// Rewrite a stored back-reference in place. Returns true if it changed.
    pub fn update(&self, handle: &mut Handle) -> bool {
        let remapped = self.remap(*handle);
        let changed = remapped != *handle;
        *handle = remapped;
        changed
    }

    /// Record that the element in `freed` was removed and, unless it was the
    /// last one, the element in `last` now lives in `freed`.
    pub(crate) fn record_swap_remove(&mut self, tag: TypeTag, freed: u32, last: u32) {
        if self.per_type.len() <= tag.index() {
            self.per_type.resize_with(tag.index() + 1, HashMap::new);
        }
        let map = &mut self.per_type[tag.index()];
        map.retain(|_, current| *current != freed);
        if freed == last {
            return;
        }
        match map.iter_mut().find(|(_, current)| **current == last) {
            Some((_, current)) => *current = freed,
            None => {
                map.insert(last, freed);
            }
        }
    }
}
