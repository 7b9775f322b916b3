//! Per-iteration kernel of an agent-based cell simulation.
//!
//! Objects live in per-type contiguous containers owned by the
//! [`ResourceManager`]; each carries a stable [`Uid`] and a volatile
//! [`Handle`]. Every iteration the [`Scheduler`] runs an ordered
//! [`Operation`] pipeline over all objects in parallel through the
//! [`InPlaceExecutionContext`], which writes straight into storage and
//! defers additions and removals to the single-threaded teardown. The
//! [`Grid`] answers neighbor queries against the snapshot built at the
//! previous teardown.

pub mod cell;
pub mod config;
pub mod error;
pub mod execution;
pub mod grid;
pub mod handle_vec;
pub mod identity;
pub mod object;
pub mod operations;
pub mod scheduler;
pub mod storage;

pub use cell::Cell;
pub use config::SimulationConfig;
pub use error::{SimError, SimResult};
pub use execution::{
    InPlaceExecutionContext, ObjectContext, PendingChanges, StagedId, StagedObject,
    TeardownReport,
};
pub use grid::{Grid, Neighbor};
pub use handle_vec::HandleVec;
pub use identity::{Handle, RemapTable, TypeTag, Uid};
pub use object::{AsAny, BiologyModule, ObjectBase, SimObject, run_biology_modules};
pub use operations::{
    BOUND_EPSILON, BiologyModuleOp, BoundSpace, DisplacementOp, FnOperation, Operation,
    apply_bounding_box,
};
pub use scheduler::{IterationSummary, Scheduler, SchedulerState, default_operations};
pub use storage::{ObjectGuard, ResourceManager};
