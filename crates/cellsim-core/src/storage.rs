//! Object storage: one contiguous container per registered concrete type plus
//! the UID indirection table.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{SimError, SimResult};
use crate::identity::{Handle, RemapTable, TypeTag, Uid};
use crate::object::{AsAny, SimObject};

/// Exclusive access to one stored object.
pub type ObjectGuard<'a> = MutexGuard<'a, dyn SimObject>;

/// Type-erased view of a [`TypedContainer`].
pub(crate) trait ObjectContainer: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn type_name(&self) -> &'static str;
    fn len(&self) -> usize;
    fn uid_at(&self, slot: usize) -> Option<Uid>;
    fn lock(&self, slot: usize) -> Option<ObjectGuard<'_>>;
    fn object_mut(&mut self, slot: usize) -> Option<&mut dyn SimObject>;
    /// Append and return the new slot; on type mismatch returns the type
    /// name of the rejected object.
    fn push_boxed(&mut self, uid: Uid, object: Box<dyn SimObject>) -> Result<u32, &'static str>;
    /// Swap-remove `slot`; returns the UID of the element moved into it.
    fn swap_remove(&mut self, slot: usize) -> Option<Uid>;
    fn claim(&self, slot: usize, round: u64) -> bool;
    fn clear(&mut self);
}

/// Contiguous storage for a single concrete object type.
///
/// The element index of every object equals its slot; `uids` and `claims`
/// are parallel columns.
#[derive(Debug)]
pub(crate) struct TypedContainer<T> {
    objects: Vec<Mutex<T>>,
    uids: Vec<Uid>,
    claims: Vec<AtomicU64>,
}

impl<T> Default for TypedContainer<T> {
    fn default() -> Self {
        Self {
            objects: Vec::new(),
            uids: Vec::new(),
            claims: Vec::new(),
        }
    }
}

impl<T: SimObject> TypedContainer<T> {
    fn push(&mut self, uid: Uid, mut object: T) -> u32 {
        let slot = self.objects.len() as u32;
        object.base_mut().set_element_idx(slot);
        self.objects.push(Mutex::new(object));
        self.uids.push(uid);
        self.claims.push(AtomicU64::new(0));
        slot
    }

    fn get(&self, slot: usize) -> Option<MutexGuard<'_, T>> {
        self.objects
            .get(slot)
            .map(|cell| cell.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn get_mut(&mut self, slot: usize) -> Option<&mut T> {
        self.objects
            .get_mut(slot)
            .map(|cell| cell.get_mut().unwrap_or_else(PoisonError::into_inner))
    }
}

impl<T: SimObject> ObjectContainer for TypedContainer<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn len(&self) -> usize {
        self.objects.len()
    }

    fn uid_at(&self, slot: usize) -> Option<Uid> {
        self.uids.get(slot).copied()
    }

    fn lock(&self, slot: usize) -> Option<ObjectGuard<'_>> {
        let cell: &Mutex<dyn SimObject> = self.objects.get(slot)?;
        Some(cell.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn object_mut(&mut self, slot: usize) -> Option<&mut dyn SimObject> {
        self.get_mut(slot).map(|object| object as &mut dyn SimObject)
    }

    fn push_boxed(&mut self, uid: Uid, object: Box<dyn SimObject>) -> Result<u32, &'static str> {
        let found = (*object).type_name();
        let object = AsAny::into_any(object)
            .downcast::<T>()
            .map_err(|_| found)?;
        Ok(self.push(uid, *object))
    }

    fn swap_remove(&mut self, slot: usize) -> Option<Uid> {
        if slot >= self.objects.len() {
            return None;
        }
        self.objects.swap_remove(slot);
        self.uids.swap_remove(slot);
        self.claims.swap_remove(slot);
        let moved = self.uids.get(slot).copied()?;
        if let Some(object) = self.get_mut(slot) {
            object.base_mut().set_element_idx(slot as u32);
        }
        Some(moved)
    }

    fn claim(&self, slot: usize, round: u64) -> bool {
        self.claims
            .get(slot)
            .is_some_and(|claim| claim.swap(round, Ordering::AcqRel) != round)
    }

    fn clear(&mut self) {
        self.objects.clear();
        self.uids.clear();
        self.claims.clear();
    }
}

/// Owns every committed simulation object.
///
/// Objects are grouped by concrete type, each type in its own contiguous
/// container addressed by [`Handle`]. The [`Uid`] of an object never changes;
/// the indirection table maps it to the object's current handle and is kept
/// in sync with every structural mutation.
pub struct ResourceManager {
    containers: Vec<Box<dyn ObjectContainer>>,
    type_tags: HashMap<TypeId, TypeTag>,
    uid_index: HashMap<Uid, Handle>,
    next_serial: u64,
    epoch: u64,
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("types", &self.containers.len())
            .field("objects", &self.uid_index.len())
            .field("next_serial", &self.next_serial)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl ResourceManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            containers: Vec::new(),
            type_tags: HashMap::new(),
            uid_index: HashMap::new(),
            next_serial: 0,
            epoch: 0,
        }
    }

    /// Register a concrete object type. Registering twice returns the same tag.
    pub fn register<T: SimObject>(&mut self) -> TypeTag {
        if let Some(&tag) = self.type_tags.get(&TypeId::of::<T>()) {
            return tag;
        }
        let tag = TypeTag(self.containers.len() as u16);
        self.containers.push(Box::new(TypedContainer::<T>::default()));
        self.type_tags.insert(TypeId::of::<T>(), tag);
        tag
    }

    /// Tag of a registered type.
    pub fn type_tag<T: SimObject>(&self) -> SimResult<TypeTag> {
        self.type_tags
            .get(&TypeId::of::<T>())
            .copied()
            .ok_or(SimError::UnregisteredType {
                type_name: type_name::<T>(),
            })
    }

    /// Number of registered types.
    #[must_use]
    pub fn type_count(&self) -> usize {
        self.containers.len()
    }

    /// Store `object` immediately and return its new UID.
    ///
    /// Intended for model setup; during an iteration objects are staged
    /// through the execution context instead.
    pub fn create<T: SimObject>(&mut self, object: T) -> SimResult<Uid> {
        let tag = self.type_tag::<T>()?;
        let uid = self.issue_uid(tag);
        let container = self
            .typed_mut::<T>(tag)
            .ok_or(SimError::InvalidState("container type does not match its tag"))?;
        let slot = container.push(uid, object);
        self.uid_index.insert(uid, Handle::new(tag, slot));
        self.epoch += 1;
        Ok(uid)
    }

    /// Store an already boxed object under `tag`.
    pub(crate) fn insert_boxed(
        &mut self,
        tag: TypeTag,
        object: Box<dyn SimObject>,
    ) -> SimResult<Uid> {
        let Some(container) = self.containers.get(tag.index()) else {
            return Err(SimError::UnregisteredType {
                type_name: (*object).type_name(),
            });
        };
        let expected = container.type_name();
        let uid = Uid::new(tag, self.next_serial);
        let container = &mut self.containers[tag.index()];
        let slot = container
            .push_boxed(uid, object)
            .map_err(|found| SimError::TypeMismatch { expected, found })?;
        self.next_serial += 1;
        self.uid_index.insert(uid, Handle::new(tag, slot));
        self.epoch += 1;
        Ok(uid)
    }

    fn issue_uid(&mut self, tag: TypeTag) -> Uid {
        let uid = Uid::new(tag, self.next_serial);
        self.next_serial += 1;
        uid
    }

    /// Returns true while `uid` addresses a committed object.
    #[must_use]
    pub fn contains(&self, uid: Uid) -> bool {
        self.uid_index.contains_key(&uid)
    }

    /// Current handle of `uid`.
    pub fn handle(&self, uid: Uid) -> SimResult<Handle> {
        self.uid_index
            .get(&uid)
            .copied()
            .ok_or(SimError::NotFound { uid })
    }

    /// UID of the object currently stored at `handle`.
    #[must_use]
    pub fn uid_at(&self, handle: Handle) -> Option<Uid> {
        self.containers
            .get(handle.type_tag().index())?
            .uid_at(handle.index())
    }

    /// Lock the object `uid` as its concrete type.
    pub fn get<T: SimObject>(&self, uid: Uid) -> SimResult<MutexGuard<'_, T>> {
        let handle = self.handle(uid)?;
        self.typed::<T>(handle.type_tag())?
            .get(handle.index())
            .ok_or(SimError::NotFound { uid })
    }

    /// Exclusive borrow of `uid` as its concrete type, without locking.
    pub fn get_mut<T: SimObject>(&mut self, uid: Uid) -> SimResult<&mut T> {
        let handle = self.handle(uid)?;
        let found = self.containers[handle.type_tag().index()].type_name();
        self.typed_mut::<T>(handle.type_tag())
            .ok_or(SimError::TypeMismatch {
                expected: type_name::<T>(),
                found,
            })?
            .get_mut(handle.index())
            .ok_or(SimError::NotFound { uid })
    }

    /// Lock the object `uid` through its capability set.
    pub fn get_dyn(&self, uid: Uid) -> SimResult<ObjectGuard<'_>> {
        let handle = self.handle(uid)?;
        self.lock_handle(handle).ok_or(SimError::NotFound { uid })
    }

    /// Lock the object stored at `handle`.
    #[must_use]
    pub fn lock_handle(&self, handle: Handle) -> Option<ObjectGuard<'_>> {
        self.containers
            .get(handle.type_tag().index())?
            .lock(handle.index())
    }

    pub(crate) fn object_mut(&mut self, handle: Handle) -> Option<&mut dyn SimObject> {
        self.containers
            .get_mut(handle.type_tag().index())?
            .object_mut(handle.index())
    }

    /// Number of committed objects of one type.
    #[must_use]
    pub fn size(&self, tag: TypeTag) -> usize {
        self.containers.get(tag.index()).map_or(0, |c| c.len())
    }

    pub fn size_of<T: SimObject>(&self) -> SimResult<usize> {
        Ok(self.size(self.type_tag::<T>()?))
    }

    /// Number of committed objects across all types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.uid_index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uid_index.is_empty()
    }

    /// Handles of every committed object, ordered by type tag then slot.
    pub fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.containers
            .iter()
            .enumerate()
            .flat_map(|(tag, container)| {
                let tag = TypeTag(tag as u16);
                (0..container.len() as u32).map(move |slot| Handle::new(tag, slot))
            })
    }

    /// Lazily lock the objects of type `T` one after another.
    pub fn iter_of_type<T: SimObject>(
        &self,
    ) -> SimResult<impl Iterator<Item = (Uid, MutexGuard<'_, T>)> + '_> {
        let container = self.typed::<T>(self.type_tag::<T>()?)?;
        Ok((0..container.objects.len()).filter_map(move |slot| {
            Some((container.uids[slot], container.get(slot)?))
        }))
    }

    /// Visit every object of type `T`.
    pub fn for_each_of_type<T: SimObject>(&self, mut f: impl FnMut(Uid, &T)) -> SimResult<()> {
        for (uid, object) in self.iter_of_type::<T>()? {
            f(uid, &object);
        }
        Ok(())
    }

    /// Visit every committed object, type by type.
    pub fn for_each_object(&self, mut f: impl FnMut(Uid, &dyn SimObject)) {
        for container in &self.containers {
            for slot in 0..container.len() {
                if let (Some(uid), Some(object)) = (container.uid_at(slot), container.lock(slot)) {
                    f(uid, &*object);
                }
            }
        }
    }

    /// Mutably visit every committed object.
    pub fn for_each_object_mut(&mut self, mut f: impl FnMut(Uid, &mut dyn SimObject)) {
        for container in &mut self.containers {
            for slot in 0..container.len() {
                let Some(uid) = container.uid_at(slot) else {
                    continue;
                };
                if let Some(object) = container.object_mut(slot) {
                    f(uid, object);
                }
            }
        }
    }

    /// Remove `uid` by swap-and-pop and return the resulting remaps.
    ///
    /// Structural: only the teardown phase may call this while a scheduler
    /// is running.
    pub fn remove_structural(&mut self, uid: Uid) -> SimResult<RemapTable> {
        let mut remaps = RemapTable::new();
        self.remove_into(uid, &mut remaps)?;
        Ok(remaps)
    }

    /// Like [`Self::remove_structural`] but accumulates into `remaps`.
    pub fn remove_into(&mut self, uid: Uid, remaps: &mut RemapTable) -> SimResult<()> {
        let handle = self.uid_index.remove(&uid).ok_or(SimError::NotFound { uid })?;
        let tag = handle.type_tag();
        let container = &mut self.containers[tag.index()];
        let last = container.len().saturating_sub(1) as u32;
        if let Some(moved) = container.swap_remove(handle.index()) {
            self.uid_index.insert(moved, handle);
        }
        remaps.record_swap_remove(tag, handle.element_idx(), last);
        self.epoch += 1;
        Ok(())
    }

    /// Let every object fix back-references after structural changes.
    ///
    /// Returns the number of objects visited.
    pub fn apply_remaps(&mut self, remaps: &RemapTable) -> usize {
        if remaps.is_empty() {
            return 0;
        }
        let mut visited = 0;
        self.for_each_object_mut(|_, object| {
            object.update_references(remaps);
            visited += 1;
        });
        visited
    }

    /// Drop every object. All UIDs and handles become invalid; serials keep
    /// counting so UIDs are never reissued.
    pub fn clear(&mut self) {
        for container in &mut self.containers {
            container.clear();
        }
        self.uid_index.clear();
        self.epoch += 1;
    }

    /// Counter bumped by every structural mutation.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Mark `handle` as executed in claim round `round`; false if it already
    /// was. Round 0 is the unclaimed state.
    pub(crate) fn claim(&self, handle: Handle, round: u64) -> bool {
        round != 0
            && self
                .containers
                .get(handle.type_tag().index())
                .is_some_and(|container| container.claim(handle.index(), round))
    }

    fn typed<T: SimObject>(&self, tag: TypeTag) -> SimResult<&TypedContainer<T>> {
        let container = self
            .containers
            .get(tag.index())
            .ok_or(SimError::UnregisteredType {
                type_name: type_name::<T>(),
            })?;
        ObjectContainer::as_any(&**container)
            .downcast_ref::<TypedContainer<T>>()
            .ok_or(SimError::TypeMismatch {
                expected: type_name::<T>(),
                found: container.type_name(),
            })
    }

    fn typed_mut<T: SimObject>(&mut self, tag: TypeTag) -> Option<&mut TypedContainer<T>> {
        let container = self.containers.get_mut(tag.index())?;
        ObjectContainer::as_any_mut(&mut **container).downcast_mut::<TypedContainer<T>>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectBase;
    use glam::DVec3;

    #[derive(Debug, Default)]
    struct Tagged {
        base: ObjectBase,
        label: u32,
    }

    impl SimObject for Tagged {
        fn base(&self) -> &ObjectBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut ObjectBase {
            &mut self.base
        }
    }

    #[derive(Debug, Default)]
    struct Other {
        base: ObjectBase,
    }

    impl SimObject for Other {
        fn base(&self) -> &ObjectBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut ObjectBase {
            &mut self.base
        }
    }

    fn tagged(label: u32) -> Tagged {
        Tagged {
            base: ObjectBase::new(DVec3::splat(label as f64), 1.0),
            label,
        }
    }

    #[test]
    fn create_requires_registration() {
        let mut rm = ResourceManager::new();
        let err = rm.create(tagged(0)).expect_err("unregistered");
        assert!(matches!(err, SimError::UnregisteredType { .. }));
        let tag = rm.register::<Tagged>();
        assert_eq!(rm.register::<Tagged>(), tag);
        rm.create(tagged(0)).expect("registered");
        assert_eq!(rm.size(tag), 1);
    }

    #[test]
    fn swap_remove_keeps_uids_resolvable() {
        let mut rm = ResourceManager::new();
        let tag = rm.register::<Tagged>();
        let uids: Vec<Uid> = (0..5)
            .map(|label| rm.create(tagged(label)).expect("create"))
            .collect();

        let remaps = rm.remove_structural(uids[1]).expect("remove");
        assert_eq!(remaps.lookup(tag, 4), Some(1));
        assert_eq!(rm.size(tag), 4);

        for (label, &uid) in uids.iter().enumerate() {
            if label == 1 {
                assert!(matches!(rm.get::<Tagged>(uid), Err(SimError::NotFound { .. })));
                continue;
            }
            let handle = rm.handle(uid).expect("handle");
            let object = rm.get::<Tagged>(uid).expect("get");
            assert_eq!(object.label, label as u32);
            assert_eq!(object.base.element_idx(), handle.element_idx());
            assert_eq!(rm.uid_at(handle), Some(uid));
        }
    }

    #[test]
    fn wrong_concrete_type_is_a_mismatch() {
        let mut rm = ResourceManager::new();
        rm.register::<Tagged>();
        rm.register::<Other>();
        let uid = rm.create(tagged(3)).expect("create");
        let err = rm.get::<Other>(uid).expect_err("mismatch");
        assert!(matches!(err, SimError::TypeMismatch { .. }));
        assert!(err.is_recoverable());
        assert!(rm.get_mut::<Other>(uid).is_err());
        assert_eq!(rm.get_mut::<Tagged>(uid).expect("tagged").label, 3);
    }

    #[test]
    fn boxed_insert_checks_container_type() {
        let mut rm = ResourceManager::new();
        let tagged_tag = rm.register::<Tagged>();
        let other_tag = rm.register::<Other>();
        let uid = rm
            .insert_boxed(tagged_tag, Box::new(tagged(9)))
            .expect("insert");
        assert_eq!(uid.type_tag(), tagged_tag);
        let err = rm
            .insert_boxed(other_tag, Box::new(tagged(1)))
            .expect_err("wrong container");
        assert!(matches!(err, SimError::TypeMismatch { .. }));
        assert_eq!(rm.len(), 1);
    }

    #[test]
    fn traversal_reflects_state_at_call_time() {
        let mut rm = ResourceManager::new();
        rm.register::<Tagged>();
        rm.register::<Other>();
        for label in 0..3 {
            rm.create(tagged(label)).expect("create");
        }
        rm.create(Other::default()).expect("create other");

        let mut labels = Vec::new();
        rm.for_each_of_type::<Tagged>(|_, p| labels.push(p.label))
            .expect("typed traversal");
        assert_eq!(labels, vec![0, 1, 2]);

        let mut seen = 0;
        rm.for_each_object(|_, _| seen += 1);
        assert_eq!(seen, 4);
        assert_eq!(rm.handles().count(), 4);
        // restartable
        assert_eq!(rm.iter_of_type::<Tagged>().expect("iter").count(), 3);
    }

    #[test]
    fn clear_invalidates_uids_without_reuse() {
        let mut rm = ResourceManager::new();
        rm.register::<Tagged>();
        let first = rm.create(tagged(0)).expect("create");
        let epoch = rm.epoch();
        rm.clear();
        assert!(rm.epoch() > epoch);
        assert!(rm.is_empty());
        assert!(matches!(rm.handle(first), Err(SimError::NotFound { .. })));
        let second = rm.create(tagged(0)).expect("create");
        assert_ne!(first, second);
        assert!(second.serial() > first.serial());
    }

    #[test]
    fn claims_are_per_round() {
        let mut rm = ResourceManager::new();
        rm.register::<Tagged>();
        let uid = rm.create(tagged(0)).expect("create");
        let handle = rm.handle(uid).expect("handle");
        assert!(!rm.claim(handle, 0));
        assert!(rm.claim(handle, 1));
        assert!(!rm.claim(handle, 1));
        assert!(rm.claim(handle, 2));
    }
}
