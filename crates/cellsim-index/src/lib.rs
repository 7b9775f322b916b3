//! Spatial indexing abstractions for neighborhood queries over 3D positions.
//!
//! Entries are identified by their position in the slice handed to
//! [`NeighborhoodIndex::rebuild`]; callers keep their own mapping from entry
//! index to whatever identity they use.

use glam::DVec3;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive box length).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// An entry's position contains NaN or infinity.
    #[error("entry {index} has a non-finite position")]
    NonFinitePosition { index: usize },
    /// More entries than the index can address.
    #[error("{count} entries exceed the addressable range")]
    TooManyEntries { count: usize },
}

/// Common behaviour exposed by neighborhood indices.
pub trait NeighborhoodIndex {
    /// Rebuild internal structures from entry positions.
    ///
    /// `interaction_radius` is the largest distance at which two entries can
    /// interact; implementations size their cells so that every interacting
    /// pair lives in adjacent cells.
    fn rebuild(&mut self, positions: &[DVec3], interaction_radius: f64) -> Result<(), IndexError>;

    /// Visit neighbors of `entry` within the provided squared radius.
    ///
    /// The entry itself is never visited.
    fn neighbors_within(
        &self,
        entry: usize,
        radius_sq: f64,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f64>),
    );

    /// Visit every entry sharing a cell with `entry` or lying in an adjacent cell.
    fn for_each_candidate(&self, entry: usize, visitor: &mut dyn FnMut(usize));
}

/// Uniform box grid over the occupied domain.
///
/// Boxes are cubes whose side equals the interaction radius (bounded below by
/// `min_box_length`), so a radius query only ever has to inspect the query's
/// own box and the 26 around it. Only occupied boxes are stored: their
/// coordinates are kept sorted and entries are laid out box-major in a single
/// flat array with per-box offsets, so memory follows the population rather
/// than the volume of the domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    /// Lower limit applied to the box side length.
    pub min_box_length: f64,
    thresholds: Option<(f64, f64)>,
    #[serde(skip)]
    box_length: f64,
    #[serde(skip)]
    origin: DVec3,
    #[serde(skip)]
    dimensions: [usize; 3],
    #[serde(skip)]
    box_keys: Vec<[usize; 3]>,
    #[serde(skip)]
    box_starts: Vec<u32>,
    #[serde(skip)]
    box_entries: Vec<u32>,
    #[serde(skip)]
    entry_boxes: Vec<u32>,
    #[serde(skip)]
    positions: Vec<DVec3>,
}

impl UniformGridIndex {
    /// Create an empty grid whose boxes are at least `min_box_length` wide.
    #[must_use]
    pub fn new(min_box_length: f64) -> Self {
        Self {
            min_box_length,
            thresholds: None,
            box_length: min_box_length,
            origin: DVec3::ZERO,
            dimensions: [0; 3],
            box_keys: Vec::new(),
            box_starts: vec![0],
            box_entries: Vec::new(),
            entry_boxes: Vec::new(),
            positions: Vec::new(),
        }
    }

    /// Constrain the indexed domain to always cover `[min, max]` on every axis.
    ///
    /// Returns `true` when the stored thresholds changed. The new bounds apply
    /// from the next [`NeighborhoodIndex::rebuild`] on.
    pub fn set_dimension_thresholds(&mut self, min: f64, max: f64) -> Result<bool, IndexError> {
        if !min.is_finite() || !max.is_finite() || min >= max {
            return Err(IndexError::InvalidConfig(
                "dimension thresholds must be finite with min < max",
            ));
        }
        let changed = self.thresholds != Some((min, max));
        self.thresholds = Some((min, max));
        Ok(changed)
    }

    /// Drop configured thresholds; the domain follows the entries again.
    pub fn clear_dimension_thresholds(&mut self) -> bool {
        self.thresholds.take().is_some()
    }

    /// Currently configured thresholds.
    #[must_use]
    pub fn dimension_thresholds(&self) -> Option<(f64, f64)> {
        self.thresholds
    }

    /// Side length of one box as of the last rebuild.
    #[must_use]
    pub fn box_length(&self) -> f64 {
        self.box_length
    }

    /// Lower corner of the indexed domain.
    #[must_use]
    pub fn origin(&self) -> DVec3 {
        self.origin
    }

    /// Number of boxes along each axis.
    #[must_use]
    pub fn dimensions(&self) -> [usize; 3] {
        self.dimensions
    }

    /// Number of occupied boxes.
    #[must_use]
    pub fn box_count(&self) -> usize {
        self.box_keys.len()
    }

    /// Number of indexed entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true when nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Position recorded for `entry` at the last rebuild.
    #[must_use]
    pub fn position(&self, entry: usize) -> Option<DVec3> {
        self.positions.get(entry).copied()
    }

    /// Index of the occupied box assigned to `entry`.
    #[must_use]
    pub fn box_of(&self, entry: usize) -> Option<usize> {
        self.entry_boxes.get(entry).map(|&b| b as usize)
    }

    /// Box coordinates assigned to `entry`.
    #[must_use]
    pub fn box_coordinates(&self, entry: usize) -> Option<[usize; 3]> {
        self.box_of(entry).and_then(|b| self.box_keys.get(b).copied())
    }

    /// Occupied box at `coordinates`, if any entry lives there.
    #[must_use]
    pub fn box_at(&self, coordinates: [usize; 3]) -> Option<usize> {
        self.box_keys.binary_search(&coordinates).ok()
    }

    /// Entries assigned to the occupied box `box_index`.
    #[must_use]
    pub fn box_entries(&self, box_index: usize) -> &[u32] {
        match (
            self.box_starts.get(box_index),
            self.box_starts.get(box_index + 1),
        ) {
            (Some(&start), Some(&end)) => &self.box_entries[start as usize..end as usize],
            _ => &[],
        }
    }

    fn clear_tables(&mut self) {
        self.box_keys.clear();
        self.box_starts.clear();
        self.box_entries.clear();
        self.entry_boxes.clear();
        self.positions.clear();
        self.dimensions = [0; 3];
    }

    fn coordinates_of(&self, position: DVec3) -> [usize; 3] {
        let relative = (position - self.origin) / self.box_length;
        let axis = |value: f64, dim: usize| (value.floor().max(0.0) as usize).min(dim - 1);
        [
            axis(relative.x, self.dimensions[0]),
            axis(relative.y, self.dimensions[1]),
            axis(relative.z, self.dimensions[2]),
        ]
    }

    fn bounds(&self, positions: &[DVec3]) -> Result<Option<(DVec3, DVec3)>, IndexError> {
        let mut bounds: Option<(DVec3, DVec3)> = None;
        for (index, &position) in positions.iter().enumerate() {
            if !position.is_finite() {
                return Err(IndexError::NonFinitePosition { index });
            }
            bounds = Some(match bounds {
                Some((lower, upper)) => (lower.min(position), upper.max(position)),
                None => (position, position),
            });
        }
        if let Some((min, max)) = self.thresholds {
            let (lower, upper) = bounds.unwrap_or((DVec3::splat(min), DVec3::splat(max)));
            bounds = Some((lower.min(DVec3::splat(min)), upper.max(DVec3::splat(max))));
        }
        Ok(bounds)
    }

    /// Visit every entry in the 3x3x3 block of boxes centred on `box_index`.
    fn visit_surrounding(&self, box_index: usize, mut visit: impl FnMut(usize)) {
        let Some(&center) = self.box_keys.get(box_index) else {
            return;
        };
        let range = |c: usize| c.saturating_sub(1)..=c.saturating_add(1);
        for z in range(center[2]) {
            for y in range(center[1]) {
                for x in range(center[0]) {
                    let Some(found) = self.box_at([x, y, z]) else {
                        continue;
                    };
                    for &entry in self.box_entries(found) {
                        visit(entry as usize);
                    }
                }
            }
        }
    }
}

impl Default for UniformGridIndex {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl NeighborhoodIndex for UniformGridIndex {
    fn rebuild(&mut self, positions: &[DVec3], interaction_radius: f64) -> Result<(), IndexError> {
        if !(self.min_box_length > 0.0) || !self.min_box_length.is_finite() {
            return Err(IndexError::InvalidConfig(
                "min_box_length must be positive and finite",
            ));
        }
        if !interaction_radius.is_finite() || interaction_radius < 0.0 {
            return Err(IndexError::InvalidConfig(
                "interaction radius must be finite and non-negative",
            ));
        }
        if positions.len() >= u32::MAX as usize {
            return Err(IndexError::TooManyEntries {
                count: positions.len(),
            });
        }

        self.clear_tables();
        self.box_length = interaction_radius.max(self.min_box_length);
        let Some((lower, upper)) = self.bounds(positions)? else {
            self.box_starts.push(0);
            return Ok(());
        };

        self.origin = lower;
        let extent = (upper - lower) / self.box_length;
        for (axis, value) in extent.to_array().into_iter().enumerate() {
            self.dimensions[axis] = (value.floor() as usize).saturating_add(1);
        }

        self.positions.extend_from_slice(positions);
        let mut keyed: Vec<([usize; 3], u32)> = positions
            .iter()
            .enumerate()
            .map(|(entry, &p)| (self.coordinates_of(p), entry as u32))
            .collect();
        keyed.sort_unstable();

        // Entries arrive grouped by box; open a new box whenever the key changes.
        self.entry_boxes.resize(positions.len(), 0);
        self.box_entries.reserve(positions.len());
        for (key, entry) in keyed {
            if self.box_keys.last() != Some(&key) {
                self.box_keys.push(key);
                self.box_starts.push(self.box_entries.len() as u32);
            }
            self.entry_boxes[entry as usize] = (self.box_keys.len() - 1) as u32;
            self.box_entries.push(entry);
        }
        self.box_starts.push(self.box_entries.len() as u32);
        Ok(())
    }

    fn neighbors_within(
        &self,
        entry: usize,
        radius_sq: f64,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f64>),
    ) {
        let (Some(box_index), Some(center)) = (self.box_of(entry), self.position(entry)) else {
            return;
        };
        self.visit_surrounding(box_index, |other| {
            if other == entry {
                return;
            }
            let dist_sq = self.positions[other].distance_squared(center);
            if dist_sq <= radius_sq {
                visitor(other, OrderedFloat(dist_sq));
            }
        });
    }

    fn for_each_candidate(&self, entry: usize, visitor: &mut dyn FnMut(usize)) {
        let Some(box_index) = self.box_of(entry) else {
            return;
        };
        self.visit_surrounding(box_index, |other| {
            if other != entry {
                visitor(other);
            }
        });
    }
}
