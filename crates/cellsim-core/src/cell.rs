//! Reference object kind: a sphere that pushes overlapping neighbors away.

use glam::DVec3;
use std::f64::consts::PI;
use std::sync::Arc;

use crate::error::SimResult;
use crate::execution::ObjectContext;
use crate::object::{BiologyModule, ObjectBase, SimObject};

/// Spherical cell with simple overlap repulsion.
#[derive(Debug, Clone, Default)]
pub struct Cell {
    base: ObjectBase,
    adherence: f64,
}

impl Cell {
    #[must_use]
    pub fn new(position: DVec3, diameter: f64) -> Self {
        Self {
            base: ObjectBase::new(position, diameter),
            adherence: 0.0,
        }
    }

    /// Displacements shorter than `adherence` are dropped.
    #[must_use]
    pub fn with_adherence(mut self, adherence: f64) -> Self {
        self.adherence = adherence;
        self
    }

    #[must_use]
    pub fn with_module(mut self, module: Arc<dyn BiologyModule>) -> Self {
        self.base.add_biology_module(module);
        self
    }

    #[must_use]
    pub fn adherence(&self) -> f64 {
        self.adherence
    }

    #[must_use]
    pub fn volume(&self) -> f64 {
        let radius = self.base.diameter / 2.0;
        4.0 / 3.0 * PI * radius.powi(3)
    }

    /// Grow or shrink by `delta` volume units; the volume never drops below zero.
    pub fn change_volume(&mut self, delta: f64) {
        let volume = (self.volume() + delta).max(0.0);
        self.base.diameter = 2.0 * (volume * 3.0 / (4.0 * PI)).cbrt();
    }

    /// Split into two cells of equal volume along `axis`.
    ///
    /// `self` keeps the mother's place shifted backwards; the returned
    /// daughter sits on the other side and inherits copyable modules.
    #[must_use]
    pub fn divide(&mut self, axis: DVec3) -> Cell {
        let axis = axis.try_normalize().unwrap_or(DVec3::X);
        let diameter = self.base.diameter / 2f64.cbrt();
        let offset = axis * diameter / 4.0;
        let center = self.base.position;
        self.base.diameter = diameter;
        self.base.position = center - offset;

        let mut daughter = Cell::new(center + offset, diameter).with_adherence(self.adherence);
        for module in self.base.inherited_modules() {
            daughter.base.add_biology_module(module);
        }
        daughter
    }
}

impl SimObject for Cell {
    fn base(&self) -> &ObjectBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ObjectBase {
        &mut self.base
    }

    fn compute_displacement(&self, ctx: &ObjectContext<'_>, squared_radius: f64) -> SimResult<DVec3> {
        let own = self.base.position;
        let radius = self.base.diameter / 2.0;
        let uid = ctx.uid();
        let mut displacement = DVec3::ZERO;
        ctx.for_each_neighbor_within_radius(squared_radius, |neighbor| {
            let delta = own - neighbor.position;
            let distance = delta.length();
            let overlap = radius + neighbor.diameter / 2.0 - distance;
            if overlap <= 0.0 {
                return;
            }
            let direction = if distance > 0.0 {
                delta / distance
            } else if uid < neighbor.uid {
                DVec3::NEG_X
            } else {
                DVec3::X
            };
            // Each partner of the pair moves half the overlap.
            displacement += direction * overlap * 0.5;
        });
        if displacement.length() < self.adherence {
            return Ok(DVec3::ZERO);
        }
        Ok(displacement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_changes_round_trip_through_diameter() {
        let mut cell = Cell::new(DVec3::ZERO, 2.0);
        let volume = cell.volume();
        cell.change_volume(volume);
        assert!((cell.volume() - 2.0 * volume).abs() < 1e-9);
        cell.change_volume(-10.0 * volume);
        assert_eq!(cell.diameter(), 0.0);
    }

    #[test]
    fn division_conserves_volume() {
        let mut mother = Cell::new(DVec3::splat(5.0), 4.0).with_adherence(0.1);
        let before = mother.volume();
        let daughter = mother.divide(DVec3::new(0.0, 2.0, 0.0));
        assert!((mother.volume() + daughter.volume() - before).abs() < 1e-9);
        assert!(daughter.position().y > mother.position().y);
        assert_eq!(daughter.position().x, 5.0);
        assert_eq!(daughter.adherence(), 0.1);
    }
}
