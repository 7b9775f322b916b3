//! Per-object side storage addressed by [`Handle`].

use std::ops::{Index, IndexMut};

use crate::identity::{Handle, RemapTable, TypeTag};
use crate::storage::ResourceManager;

/// One value per committed object, laid out like the containers of a
/// [`ResourceManager`] so that a [`Handle`] addresses both.
///
/// Values follow element indices, not identities: after a teardown moved
/// elements, [`HandleVec::apply_remaps`] has to replay the moves.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleVec<T> {
    per_type: Vec<Vec<T>>,
}

impl<T> Default for HandleVec<T> {
    fn default() -> Self {
        Self {
            per_type: Vec::new(),
        }
    }
}

impl<T: Default> HandleVec<T> {
    /// Default-initialised slots for every object in `resources`.
    #[must_use]
    pub fn new(resources: &ResourceManager) -> Self {
        let mut values = Self::default();
        values.resize(resources);
        values
    }

    /// Match the current container sizes of `resources`. New slots hold
    /// `T::default()`; slots past the end are dropped.
    pub fn resize(&mut self, resources: &ResourceManager) {
        self.per_type
            .resize_with(resources.type_count(), Vec::new);
        for (tag, values) in self.per_type.iter_mut().enumerate() {
            values.resize_with(resources.size(TypeTag(tag as u16)), T::default);
        }
    }

    /// Replay the element moves of one teardown.
    ///
    /// `resources` must be in the state that teardown left behind. Slots of
    /// objects added by it hold `T::default()`.
    pub fn apply_remaps(&mut self, resources: &ResourceManager, remaps: &RemapTable) {
        self.per_type
            .resize_with(resources.type_count(), Vec::new);
        for (tag, values) in self.per_type.iter_mut().enumerate() {
            let tag = TypeTag(tag as u16);
            let moved: Vec<(usize, T)> = remaps
                .for_type(tag)
                .into_iter()
                .flatten()
                .map(|(&from, &to)| {
                    let value = values
                        .get_mut(from as usize)
                        .map(std::mem::take)
                        .unwrap_or_default();
                    (to as usize, value)
                })
                .collect();
            values.resize_with(resources.size(tag), T::default);
            for (to, value) in moved {
                if let Some(slot) = values.get_mut(to) {
                    *slot = value;
                }
            }
        }
    }
}

impl<T> HandleVec<T> {
    /// Number of slots for one type.
    #[must_use]
    pub fn size(&self, tag: TypeTag) -> usize {
        self.per_type.get(tag.index()).map_or(0, Vec::len)
    }

    /// Number of slots across all types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.per_type.iter().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.per_type.iter().all(Vec::is_empty)
    }

    #[must_use]
    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.per_type.get(handle.type_tag().index())?.get(handle.index())
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.per_type
            .get_mut(handle.type_tag().index())?
            .get_mut(handle.index())
    }

    /// Drop every slot.
    pub fn clear(&mut self) {
        for values in &mut self.per_type {
            values.clear();
        }
    }
}

impl<T> Index<Handle> for HandleVec<T> {
    type Output = T;

    fn index(&self, handle: Handle) -> &T {
        &self.per_type[handle.type_tag().index()][handle.index()]
    }
}

impl<T> IndexMut<Handle> for HandleVec<T> {
    fn index_mut(&mut self, handle: Handle) -> &mut T {
        &mut self.per_type[handle.type_tag().index()][handle.index()]
    }
}
