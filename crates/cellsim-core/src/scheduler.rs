//! Iteration driver: setup, parallel operation pipeline, teardown.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::SimulationConfig;
use crate::error::{SimError, SimResult};
use crate::execution::{InPlaceExecutionContext, PendingChanges, TeardownReport};
use crate::grid::Grid;
use crate::identity::Handle;
use crate::operations::{BiologyModuleOp, BoundSpace, DisplacementOp, Operation};
use crate::storage::ResourceManager;

/// Where the scheduler is in its iteration loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerState {
    Idle,
    IterationSetup,
    Running,
    IterationTeardown,
    /// A fatal error ended the run; no further iterations are accepted.
    Terminated,
}

/// Summary recorded for every committed iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationSummary {
    pub iteration: u64,
    /// Committed objects after teardown.
    pub objects: usize,
    pub added: usize,
    pub removed: usize,
    /// Elements moved by swap-removals.
    pub remapped: usize,
}

/// Per-worker accumulation during the running phase.
#[derive(Default)]
struct WorkerOutcome {
    staged: PendingChanges,
    failure: Option<(Handle, SimError)>,
}

impl WorkerOutcome {
    /// Keep the failure of the lowest handle so reports do not depend on
    /// which worker failed first.
    fn record(&mut self, handle: Handle, err: SimError) {
        let replace = self
            .failure
            .as_ref()
            .is_none_or(|(existing, _)| handle < *existing);
        if replace {
            self.failure = Some((handle, err));
        }
    }

    fn merge(mut self, other: WorkerOutcome) -> WorkerOutcome {
        self.staged.merge(other.staged);
        if let Some((handle, err)) = other.failure {
            self.record(handle, err);
        }
        self
    }
}

/// Drives the simulation one iteration at a time.
pub struct Scheduler {
    resources: ResourceManager,
    grid: Grid,
    context: InPlaceExecutionContext,
    operations: Vec<Arc<dyn Operation>>,
    config: SimulationConfig,
    pool: ThreadPool,
    state: SchedulerState,
    completed: u64,
    history: VecDeque<IterationSummary>,
    last_teardown: Option<TeardownReport>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.state)
            .field("completed", &self.completed)
            .field("objects", &self.resources.len())
            .field(
                "operations",
                &self.operations.iter().map(|op| op.name()).collect::<Vec<_>>(),
            )
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl Scheduler {
    /// Build a scheduler with empty storage.
    pub fn new(config: SimulationConfig) -> SimResult<Self> {
        Self::with_resources(config, ResourceManager::new())
    }

    /// Build a scheduler around an already populated resource manager.
    pub fn with_resources(config: SimulationConfig, resources: ResourceManager) -> SimResult<Self> {
        config.validate()?;
        let mut builder = ThreadPoolBuilder::new()
            .thread_name(|index| format!("cellsim-worker-{index}"));
        if let Some(threads) = config.num_threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder.build()?;
        let history_capacity = config.history_capacity;
        Ok(Self {
            resources,
            grid: Grid::new(config.min_box_length),
            context: InPlaceExecutionContext::new(config.neighbor_guard),
            operations: default_operations(&config),
            config,
            pool,
            state: SchedulerState::Idle,
            completed: 0,
            history: VecDeque::with_capacity(history_capacity),
            last_teardown: None,
        })
    }

    /// Replace the operation pipeline.
    #[must_use]
    pub fn with_operations(mut self, operations: Vec<Arc<dyn Operation>>) -> Self {
        self.operations = operations;
        self
    }

    pub fn set_operations(&mut self, operations: Vec<Arc<dyn Operation>>) {
        self.operations = operations;
    }

    /// Append an operation to the end of the pipeline.
    pub fn push_operation(&mut self, operation: Arc<dyn Operation>) {
        self.operations.push(operation);
    }

    #[must_use]
    pub fn operations(&self) -> &[Arc<dyn Operation>] {
        &self.operations
    }

    /// Advance the simulation by one iteration.
    ///
    /// An error from any operation aborts the remaining work of the
    /// iteration; changes staged so far are still committed, then the
    /// scheduler moves to [`SchedulerState::Terminated`] and returns the
    /// error.
    pub fn step(&mut self) -> SimResult<IterationSummary> {
        if self.state == SchedulerState::Terminated {
            return Err(SimError::InvalidState(
                "scheduler terminated after a fatal error",
            ));
        }
        match self.advance() {
            Ok(summary) => {
                self.state = SchedulerState::Idle;
                Ok(summary)
            }
            Err(err) => {
                self.state = SchedulerState::Terminated;
                error!(
                    iteration = self.context.iteration(),
                    error = %err,
                    "simulation terminated"
                );
                Err(err)
            }
        }
    }

    /// Run `iterations` steps, stopping at the first error.
    pub fn simulate(&mut self, iterations: u64) -> SimResult<()> {
        for _ in 0..iterations {
            self.step()?;
        }
        info!(
            iterations,
            completed = self.completed,
            objects = self.resources.len(),
            "simulation finished"
        );
        Ok(())
    }

    fn advance(&mut self) -> SimResult<IterationSummary> {
        self.state = SchedulerState::IterationSetup;
        self.context.setup_iteration();
        if self.config.bound_space {
            self.grid
                .set_dimension_thresholds(self.config.min_bound, self.config.max_bound)?;
        }
        if !self.grid.is_current(&self.resources) {
            self.grid.rebuild(&mut self.resources)?;
        }

        self.state = SchedulerState::Running;
        let outcome = self.run_operations();

        self.state = SchedulerState::IterationTeardown;
        self.context.absorb(outcome.staged);
        let report = self.context.tear_down_iteration(&mut self.resources)?;
        self.grid.rebuild(&mut self.resources)?;

        let summary = IterationSummary {
            iteration: self.context.iteration(),
            objects: self.resources.len(),
            added: report.added.len(),
            removed: report.removed.len(),
            remapped: report.remaps.len(),
        };
        self.completed += 1;
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary.clone());
        self.last_teardown = Some(report);

        match outcome.failure {
            Some((_, err)) => Err(err),
            None => Ok(summary),
        }
    }

    fn run_operations(&self) -> WorkerOutcome {
        let handles: Vec<Handle> = self.resources.handles().collect();
        let abort = AtomicBool::new(false);
        let resources = &self.resources;
        let grid = &self.grid;
        let context = &self.context;
        let operations = self.operations.as_slice();

        self.pool.install(|| {
            handles
                .par_iter()
                .fold(WorkerOutcome::default, |mut outcome, &handle| {
                    if abort.load(Ordering::Relaxed) {
                        return outcome;
                    }
                    if let Err(err) =
                        context.execute(resources, grid, handle, operations, &mut outcome.staged)
                    {
                        abort.store(true, Ordering::Relaxed);
                        outcome.record(handle, err);
                    }
                    outcome
                })
                .reduce(WorkerOutcome::default, WorkerOutcome::merge)
        })
    }

    #[must_use]
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Number of committed iterations.
    #[must_use]
    pub fn iteration(&self) -> u64 {
        self.completed
    }

    #[must_use]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    #[must_use]
    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    /// Mutable storage access between iterations. The grid is rebuilt before
    /// the next iteration runs.
    pub fn resources_mut(&mut self) -> &mut ResourceManager {
        self.grid.mark_dirty();
        &mut self.resources
    }

    #[must_use]
    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    #[must_use]
    pub fn context(&self) -> &InPlaceExecutionContext {
        &self.context
    }

    /// See [`InPlaceExecutionContext::disable_neighbor_guard`].
    pub fn disable_neighbor_guard(&mut self) {
        self.context.disable_neighbor_guard();
    }

    /// Worker threads in the pool.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// What the most recent teardown committed: issued UIDs by staging id,
    /// removals and element moves. Side storage keyed by handle replays the
    /// moves from here.
    #[must_use]
    pub fn last_teardown(&self) -> Option<&TeardownReport> {
        self.last_teardown.as_ref()
    }

    /// Retained iteration summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &IterationSummary> {
        self.history.iter()
    }
}

/// Pipeline used unless the caller installs its own.
#[must_use]
pub fn default_operations(config: &SimulationConfig) -> Vec<Arc<dyn Operation>> {
    let mut operations: Vec<Arc<dyn Operation>> = Vec::with_capacity(3);
    if config.bound_space {
        operations.push(Arc::new(BoundSpace::new(config.min_bound, config.max_bound)));
    }
    operations.push(Arc::new(BiologyModuleOp));
    operations.push(Arc::new(DisplacementOp::new(config.max_displacement)));
    operations
}
