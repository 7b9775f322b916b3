//! Demo population: cells that grow and divide.

use anyhow::{Context, Result, bail};
use cellsim_core::{BiologyModule, Cell, ObjectContext, Scheduler, SimObject, SimResult, Uid};
use glam::DVec3;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use std::sync::Arc;

/// Grows a [`Cell`] every iteration and splits it once it gets too large.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrowDivide {
    /// Volume added per iteration.
    pub growth_rate: f64,
    /// Diameter at which a cell divides.
    pub division_diameter: f64,
}

impl Default for GrowDivide {
    fn default() -> Self {
        Self {
            growth_rate: 0.5,
            division_diameter: 2.0,
        }
    }
}

impl BiologyModule for GrowDivide {
    fn name(&self) -> &str {
        "grow_divide"
    }

    fn run(&self, object: &mut dyn SimObject, ctx: &mut ObjectContext<'_>) -> SimResult<()> {
        let Some(cell) = object.downcast_mut::<Cell>() else {
            return Ok(());
        };
        if cell.diameter() <= self.division_diameter {
            cell.change_volume(self.growth_rate);
            return Ok(());
        }
        // Division axis derived from identity so replays match.
        let serial = ctx.uid().serial() as f64;
        let axis = DVec3::new(serial.sin(), serial.cos(), (serial * 0.5).sin());
        let daughter = cell.divide(axis);
        ctx.new_object(daughter)?;
        Ok(())
    }
}

/// Register [`Cell`] and scatter `count` cells uniformly over the domain.
pub fn seed_population(
    scheduler: &mut Scheduler,
    count: usize,
    seed: u64,
    module: GrowDivide,
) -> Result<Vec<Uid>> {
    if !(module.division_diameter > 0.0) {
        bail!("division diameter must be positive");
    }
    let config = scheduler.config().clone();
    let sizes = 0.5 * module.division_diameter..module.division_diameter;
    let module: Arc<dyn BiologyModule> = Arc::new(module);
    let mut rng = SmallRng::seed_from_u64(seed);
    let resources = scheduler.resources_mut();
    resources.register::<Cell>();

    let span = config.min_bound..config.max_bound;
    let mut uids = Vec::with_capacity(count);
    for _ in 0..count {
        let position = DVec3::new(
            rng.random_range(span.clone()),
            rng.random_range(span.clone()),
            rng.random_range(span.clone()),
        );
        let diameter = rng.random_range(sizes.clone());
        let cell = Cell::new(position, diameter).with_module(Arc::clone(&module));
        uids.push(resources.create(cell).context("failed to seed cell")?);
    }
    Ok(uids)
}
