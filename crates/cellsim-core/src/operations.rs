//! Per-object operations making up the scheduler pipeline.

use glam::DVec3;
use std::fmt;

use crate::error::{SimError, SimResult};
use crate::execution::ObjectContext;
use crate::object::{SimObject, run_biology_modules};

/// Distance kept below the upper domain bound by containment.
pub const BOUND_EPSILON: f64 = 1e-10;

/// One step of the per-object pipeline.
pub trait Operation: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, object: &mut dyn SimObject, ctx: &mut ObjectContext<'_>) -> SimResult<()>;
}

/// Clamp every component of `position` into `[lb, rb)`.
#[must_use]
pub fn apply_bounding_box(position: DVec3, lb: f64, rb: f64) -> DVec3 {
    let upper = below(rb);
    let clamp = |p: f64| {
        if p < lb {
            lb
        } else if p >= rb {
            upper
        } else {
            p
        }
    };
    DVec3::new(clamp(position.x), clamp(position.y), clamp(position.z))
}

/// `rb - BOUND_EPSILON`, or the next float below `rb` once the epsilon is
/// lost to rounding.
fn below(rb: f64) -> f64 {
    let shifted = rb - BOUND_EPSILON;
    if shifted < rb {
        return shifted;
    }
    if !rb.is_finite() {
        return rb;
    }
    if rb == 0.0 {
        return -f64::from_bits(1);
    }
    let bits = rb.to_bits();
    if rb > 0.0 {
        f64::from_bits(bits - 1)
    } else {
        f64::from_bits(bits + 1)
    }
}

/// Keeps objects inside the simulation cube. Out of bounds is not an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundSpace {
    pub min_bound: f64,
    pub max_bound: f64,
}

impl BoundSpace {
    #[must_use]
    pub fn new(min_bound: f64, max_bound: f64) -> Self {
        Self {
            min_bound,
            max_bound,
        }
    }
}

impl Operation for BoundSpace {
    fn name(&self) -> &str {
        "bound_space"
    }

    fn run(&self, object: &mut dyn SimObject, _ctx: &mut ObjectContext<'_>) -> SimResult<()> {
        let position = object.position();
        let clamped = apply_bounding_box(position, self.min_bound, self.max_bound);
        if clamped != position {
            object.set_position(clamped);
        }
        Ok(())
    }
}

/// Runs the behaviour modules attached to each object.
#[derive(Debug, Clone, Copy, Default)]
pub struct BiologyModuleOp;

impl Operation for BiologyModuleOp {
    fn name(&self) -> &str {
        "biology_modules"
    }

    fn run(&self, object: &mut dyn SimObject, ctx: &mut ObjectContext<'_>) -> SimResult<()> {
        run_biology_modules(object, ctx)
    }
}

/// Computes and applies the mechanical displacement of each object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplacementOp {
    /// Upper limit on the displacement length per iteration.
    pub max_displacement: f64,
}

impl DisplacementOp {
    #[must_use]
    pub fn new(max_displacement: f64) -> Self {
        Self { max_displacement }
    }
}

impl Operation for DisplacementOp {
    fn name(&self) -> &str {
        "displacement"
    }

    fn run(&self, object: &mut dyn SimObject, ctx: &mut ObjectContext<'_>) -> SimResult<()> {
        let squared_radius = ctx.box_length() * ctx.box_length();
        let displacement = object.compute_displacement(ctx, squared_radius)?;
        if !displacement.is_finite() {
            return Err(SimError::Fatal(format!(
                "non-finite displacement {displacement} for {}",
                ctx.uid()
            )));
        }
        if displacement != DVec3::ZERO {
            object.apply_displacement(displacement.clamp_length_max(self.max_displacement));
        }
        Ok(())
    }
}

/// Adapts a closure into an [`Operation`].
pub struct FnOperation<F> {
    name: String,
    f: F,
}

impl<F> FnOperation<F>
where
    F: Fn(&mut dyn SimObject, &mut ObjectContext<'_>) -> SimResult<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> fmt::Debug for FnOperation<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<F> Operation for FnOperation<F>
where
    F: Fn(&mut dyn SimObject, &mut ObjectContext<'_>) -> SimResult<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, object: &mut dyn SimObject, ctx: &mut ObjectContext<'_>) -> SimResult<()> {
        (self.f)(object, ctx)
    }
}
