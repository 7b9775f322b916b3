//! Capability set shared by every simulation object kind.
//!
//! The scheduler and the built-in operations only ever talk to objects
//! through [`SimObject`]; concrete kinds embed an [`ObjectBase`] and override
//! the hooks they care about.

use glam::DVec3;
use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;

use crate::error::SimResult;
use crate::execution::ObjectContext;
use crate::identity::RemapTable;

/// Upcast helper so trait objects can be downcast to their concrete type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// A behaviour attached to an individual object and run once per iteration.
pub trait BiologyModule: Send + Sync + fmt::Debug {
    /// Human readable identifier used in logs and errors.
    fn name(&self) -> &str {
        type_name::<Self>()
    }

    /// Whether objects created by the owner (e.g. daughters) inherit the module.
    fn copy_to_new(&self) -> bool {
        true
    }

    /// Advance the module for `object`.
    ///
    /// Modules may stage new objects or removals through `ctx` and may append
    /// further modules to `object`; appended modules start running in the
    /// next iteration.
    fn run(&self, object: &mut dyn SimObject, ctx: &mut ObjectContext<'_>) -> SimResult<()>;
}

/// State every object kind carries.
#[derive(Debug, Clone, Default)]
pub struct ObjectBase {
    pub position: DVec3,
    pub diameter: f64,
    biology_modules: Vec<Arc<dyn BiologyModule>>,
    box_idx: Option<usize>,
    element_idx: u32,
}

impl ObjectBase {
    #[must_use]
    pub fn new(position: DVec3, diameter: f64) -> Self {
        Self {
            position,
            diameter,
            ..Self::default()
        }
    }

    /// Builder variant of [`Self::add_biology_module`].
    #[must_use]
    pub fn with_module(mut self, module: Arc<dyn BiologyModule>) -> Self {
        self.biology_modules.push(module);
        self
    }

    pub fn add_biology_module(&mut self, module: Arc<dyn BiologyModule>) {
        self.biology_modules.push(module);
    }

    /// Remove every module with the given name; returns how many were dropped.
    pub fn remove_biology_modules(&mut self, name: &str) -> usize {
        let before = self.biology_modules.len();
        self.biology_modules.retain(|module| module.name() != name);
        before - self.biology_modules.len()
    }

    #[must_use]
    pub fn biology_modules(&self) -> &[Arc<dyn BiologyModule>] {
        &self.biology_modules
    }

    /// Modules a newly created object should start with.
    #[must_use]
    pub fn inherited_modules(&self) -> Vec<Arc<dyn BiologyModule>> {
        self.biology_modules
            .iter()
            .filter(|module| module.copy_to_new())
            .cloned()
            .collect()
    }

    /// Grid box assigned at the last rebuild, if the object was indexed.
    #[must_use]
    pub fn box_idx(&self) -> Option<usize> {
        self.box_idx
    }

    /// Current slot inside the owning container.
    #[must_use]
    pub fn element_idx(&self) -> u32 {
        self.element_idx
    }

    pub(crate) fn set_box_idx(&mut self, box_idx: Option<usize>) {
        self.box_idx = box_idx;
    }

    pub(crate) fn set_element_idx(&mut self, element_idx: u32) {
        self.element_idx = element_idx;
    }
}

/// Capability set of a simulation object.
pub trait SimObject: AsAny + Send + Sync + fmt::Debug {
    fn base(&self) -> &ObjectBase;
    fn base_mut(&mut self) -> &mut ObjectBase;

    /// Concrete type name, used in error messages.
    fn type_name(&self) -> &'static str {
        type_name::<Self>()
    }

    fn position(&self) -> DVec3 {
        self.base().position
    }

    fn set_position(&mut self, position: DVec3) {
        self.base_mut().position = position;
    }

    fn diameter(&self) -> f64 {
        self.base().diameter
    }

    fn set_diameter(&mut self, diameter: f64) {
        self.base_mut().diameter = diameter;
    }

    /// Displacement the object wants to make this iteration.
    ///
    /// `squared_radius` bounds the neighborhood that may be inspected
    /// through `ctx`.
    fn compute_displacement(
        &self,
        _ctx: &ObjectContext<'_>,
        _squared_radius: f64,
    ) -> SimResult<DVec3> {
        Ok(DVec3::ZERO)
    }

    fn apply_displacement(&mut self, displacement: DVec3) {
        let position = self.position();
        self.set_position(position + displacement);
    }

    /// Rewrite stored handles to other objects after a structural commit.
    fn update_references(&mut self, _remaps: &RemapTable) {}
}

impl dyn SimObject {
    /// Borrow as the concrete type `T`.
    #[must_use]
    pub fn downcast_ref<T: SimObject>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Mutably borrow as the concrete type `T`.
    #[must_use]
    pub fn downcast_mut<T: SimObject>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }

    #[must_use]
    pub fn is<T: SimObject>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// Run every module attached to `object` in insertion order.
///
/// The module list is detached while it runs so modules can freely mutate the
/// object; modules appended during the run are kept after the existing ones.
pub fn run_biology_modules(
    object: &mut dyn SimObject,
    ctx: &mut ObjectContext<'_>,
) -> SimResult<()> {
    let mut modules = std::mem::take(&mut object.base_mut().biology_modules);
    let mut result = Ok(());
    for module in &modules {
        result = module.run(object, ctx);
        if result.is_err() {
            break;
        }
    }
    let appended = std::mem::take(&mut object.base_mut().biology_modules);
    modules.extend(appended);
    object.base_mut().biology_modules = modules;
    result
}
