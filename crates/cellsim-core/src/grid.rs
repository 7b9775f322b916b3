//! Per-iteration spatial snapshot of all committed objects.

use cellsim_index::{NeighborhoodIndex, UniformGridIndex};
use glam::DVec3;
use tracing::trace;

use crate::error::SimResult;
use crate::identity::{Handle, Uid};
use crate::storage::ResourceManager;

/// A neighbor reported by a radius query.
///
/// Position and diameter are the values recorded at the last rebuild, so
/// every reader of one snapshot sees the same neighborhood regardless of
/// which objects other workers already advanced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub uid: Uid,
    pub handle: Handle,
    pub position: DVec3,
    pub diameter: f64,
    pub distance_squared: f64,
}

/// Uniform box grid over the committed objects.
///
/// Entries are stored in handle order, which is the iteration order of
/// [`ResourceManager::handles`]; handle lookups are binary searches.
#[derive(Debug, Clone)]
pub struct Grid {
    index: UniformGridIndex,
    handles: Vec<Handle>,
    uids: Vec<Uid>,
    diameters: Vec<f64>,
    interaction_radius: f64,
    built_epoch: Option<u64>,
    dirty: bool,
}

impl Default for Grid {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Grid {
    #[must_use]
    pub fn new(min_box_length: f64) -> Self {
        Self {
            index: UniformGridIndex::new(min_box_length),
            handles: Vec::new(),
            uids: Vec::new(),
            diameters: Vec::new(),
            interaction_radius: 0.0,
            built_epoch: None,
            dirty: true,
        }
    }

    /// Re-index every committed object and write box indices back.
    ///
    /// The interaction radius is the largest diameter present; boxes are at
    /// least that wide.
    pub fn rebuild(&mut self, resources: &mut ResourceManager) -> SimResult<()> {
        self.handles.clear();
        self.uids.clear();
        self.diameters.clear();
        let mut positions = Vec::with_capacity(resources.len());
        let mut radius: f64 = 0.0;
        for handle in resources.handles() {
            let (Some(uid), Some(object)) = (resources.uid_at(handle), resources.lock_handle(handle))
            else {
                continue;
            };
            positions.push(object.position());
            radius = radius.max(object.diameter());
            self.handles.push(handle);
            self.uids.push(uid);
            self.diameters.push(object.diameter());
        }

        self.index.rebuild(&positions, radius)?;
        self.interaction_radius = radius;

        for (entry, &handle) in self.handles.iter().enumerate() {
            let box_idx = self.index.box_of(entry);
            if let Some(object) = resources.object_mut(handle) {
                object.base_mut().set_box_idx(box_idx);
            }
        }

        self.built_epoch = Some(resources.epoch());
        self.dirty = false;
        trace!(
            entries = self.handles.len(),
            box_length = self.index.box_length(),
            dimensions = ?self.index.dimensions(),
            "grid rebuilt"
        );
        Ok(())
    }

    /// True when the snapshot was built from the current storage layout and
    /// nothing invalidated it since.
    #[must_use]
    pub fn is_current(&self, resources: &ResourceManager) -> bool {
        !self.dirty && self.built_epoch == Some(resources.epoch())
    }

    /// Force a rebuild before the next iteration.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Make the indexed domain cover at least `[min, max]` on every axis.
    ///
    /// Returns whether the bounds changed; unchanged bounds leave the
    /// snapshot valid.
    pub fn set_dimension_thresholds(&mut self, min: f64, max: f64) -> SimResult<bool> {
        let changed = self.index.set_dimension_thresholds(min, max)?;
        if changed {
            self.dirty = true;
        }
        Ok(changed)
    }

    pub fn clear_dimension_thresholds(&mut self) -> bool {
        let changed = self.index.clear_dimension_thresholds();
        if changed {
            self.dirty = true;
        }
        changed
    }

    #[must_use]
    pub fn dimension_thresholds(&self) -> Option<(f64, f64)> {
        self.index.dimension_thresholds()
    }

    /// Visit every object whose distance to `handle` is within
    /// `sqrt(squared_radius)`, excluding `handle` itself.
    ///
    /// Radii larger than the box length are clipped to the 27 surrounding
    /// boxes.
    pub fn for_each_neighbor_within_radius(
        &self,
        handle: Handle,
        squared_radius: f64,
        mut f: impl FnMut(&Neighbor),
    ) {
        let Some(entry) = self.entry_of(handle) else {
            return;
        };
        self.index
            .neighbors_within(entry, squared_radius, &mut |other, distance| {
                f(&Neighbor {
                    uid: self.uids[other],
                    handle: self.handles[other],
                    position: self.index.position(other).unwrap_or(DVec3::ZERO),
                    diameter: self.diameters[other],
                    distance_squared: distance.into_inner(),
                });
            });
    }

    /// Snapshot record of `handle`, with its squared distance to `from`.
    #[must_use]
    pub fn record_of(&self, handle: Handle, from: Handle) -> Option<Neighbor> {
        let entry = self.entry_of(handle)?;
        let position = self.index.position(entry)?;
        let origin = self.position_of(from).unwrap_or(position);
        Some(Neighbor {
            uid: self.uids[entry],
            handle,
            position,
            diameter: self.diameters[entry],
            distance_squared: position.distance_squared(origin),
        })
    }

    /// Every handle sharing or adjoining the box of `handle`.
    pub fn for_each_candidate(&self, handle: Handle, mut f: impl FnMut(Handle)) {
        let Some(entry) = self.entry_of(handle) else {
            return;
        };
        self.index
            .for_each_candidate(entry, &mut |other| f(self.handles[other]));
    }

    /// Entry position of `handle` in the snapshot.
    #[must_use]
    pub fn entry_of(&self, handle: Handle) -> Option<usize> {
        self.handles.binary_search(&handle).ok()
    }

    /// Box assigned to `handle` at the last rebuild.
    #[must_use]
    pub fn box_of(&self, handle: Handle) -> Option<usize> {
        self.index.box_of(self.entry_of(handle)?)
    }

    /// Position recorded for `handle` at the last rebuild.
    #[must_use]
    pub fn position_of(&self, handle: Handle) -> Option<DVec3> {
        self.index.position(self.entry_of(handle)?)
    }

    /// Largest diameter seen at the last rebuild.
    #[must_use]
    pub fn interaction_radius(&self) -> f64 {
        self.interaction_radius
    }

    #[must_use]
    pub fn box_length(&self) -> f64 {
        self.index.box_length()
    }

    #[must_use]
    pub fn dimensions(&self) -> [usize; 3] {
        self.index.dimensions()
    }

    #[must_use]
    pub fn handles(&self) -> &[Handle] {
        &self.handles
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Underlying spatial index.
    #[must_use]
    pub fn index(&self) -> &UniformGridIndex {
        &self.index
    }
}
