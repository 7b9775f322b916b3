use cellsim_core::{
    BiologyModule, Cell, FnOperation, Handle, HandleVec, ObjectBase, ObjectContext, Operation,
    RemapTable, ResourceManager, Scheduler, SimError, SimObject, SimResult, SimulationConfig, Uid,
};
use glam::DVec3;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use std::sync::{Arc, Mutex};

fn op(
    name: &str,
    f: impl Fn(&mut dyn SimObject, &mut ObjectContext<'_>) -> SimResult<()> + Send + Sync + 'static,
) -> Arc<dyn Operation> {
    Arc::new(FnOperation::new(name, f))
}

fn scheduler_with_cells(config: SimulationConfig, positions: &[DVec3]) -> (Scheduler, Vec<Uid>) {
    let mut scheduler = Scheduler::new(config).expect("scheduler");
    let resources = scheduler.resources_mut();
    resources.register::<Cell>();
    let uids = positions
        .iter()
        .map(|&p| resources.create(Cell::new(p, 1.0)).expect("cell"))
        .collect();
    (scheduler, uids)
}

#[derive(Debug, Default)]
struct Labelled {
    base: ObjectBase,
    label: u64,
}

impl SimObject for Labelled {
    fn base(&self) -> &ObjectBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ObjectBase {
        &mut self.base
    }
}

#[test]
fn pushes_and_removals_keep_identity() {
    let mut rng = SmallRng::seed_from_u64(0x5EED);
    let mut rm = ResourceManager::new();
    let tag = rm.register::<Labelled>();
    let mut live: Vec<(Uid, u64)> = Vec::new();
    let mut pushes = 0_usize;
    let mut removals = 0_usize;

    for label in 0..400_u64 {
        let uid = rm
            .create(Labelled {
                base: ObjectBase::new(DVec3::ZERO, 1.0),
                label,
            })
            .expect("create");
        live.push((uid, label));
        pushes += 1;
        if rng.random_bool(0.4) && !live.is_empty() {
            let (uid, _) = live.swap_remove(rng.random_range(0..live.len()));
            rm.remove_structural(uid).expect("remove");
            removals += 1;
        }
    }

    assert_eq!(rm.size(tag), pushes - removals);
    for &(uid, label) in &live {
        let handle = rm.handle(uid).expect("survivor resolves");
        assert_eq!(rm.uid_at(handle), Some(uid));
        let object = rm.get::<Labelled>(uid).expect("survivor");
        assert_eq!(object.label, label);
        assert_eq!(object.base().element_idx(), handle.element_idx());
    }
}

#[test]
fn removal_is_deferred_until_teardown() {
    let (mut scheduler, uids) = scheduler_with_cells(
        SimulationConfig::default(),
        &[DVec3::ZERO, DVec3::new(0.5, 0.0, 0.0)],
    );
    let (keeper, victim) = (uids[0], uids[1]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    scheduler.set_operations(vec![op("mark", move |_, ctx| {
        if ctx.uid() == keeper {
            ctx.remove_from_simulation(victim)?;
        }
        assert!(ctx.contains(victim));
        let mut neighbors = Vec::new();
        ctx.for_each_neighbor_within_radius(1.0, |n| neighbors.push(n.uid));
        log.lock().expect("log").push((ctx.uid(), neighbors));
        Ok(())
    })]);

    let summary = scheduler.step().expect("step");
    assert_eq!(summary.removed, 1);
    let seen = seen.lock().expect("log").clone();
    assert_eq!(seen.len(), 2);
    for (uid, neighbors) in seen {
        let expected = if uid == keeper { victim } else { keeper };
        assert_eq!(neighbors, vec![expected]);
    }
    assert!(matches!(
        scheduler.resources().get::<Cell>(victim),
        Err(SimError::NotFound { .. })
    ));
    assert_eq!(scheduler.resources().len(), 1);
}

#[test]
fn staged_objects_appear_next_iteration() {
    let (mut scheduler, uids) =
        scheduler_with_cells(SimulationConfig::default(), &[DVec3::splat(2.0)]);
    let parent = uids[0];
    let counts = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&counts);
    scheduler.set_operations(vec![op("spawn", move |object, ctx| {
        if ctx.uid() != parent {
            return Ok(());
        }
        let mut found = 0;
        ctx.for_each_neighbor_within_radius(1.0, |_| found += 1);
        log.lock().expect("log").push((ctx.iteration(), found));
        if ctx.iteration() == 0 {
            ctx.new_object(Cell::new(object.position() + DVec3::new(0.0, 0.5, 0.0), 1.0))?;
        }
        Ok(())
    })]);

    let first = scheduler.step().expect("first");
    assert_eq!(first.added, 1);
    scheduler.step().expect("second");
    assert_eq!(*counts.lock().expect("log"), vec![(0, 0), (1, 1)]);
}

#[test]
fn containment_keeps_objects_inside_the_domain() {
    let config = SimulationConfig {
        bound_space: true,
        min_bound: 0.0,
        max_bound: 20.0,
        ..SimulationConfig::default()
    };
    let (mut scheduler, uids) = scheduler_with_cells(
        config,
        &[
            DVec3::new(-4.0, 5.0, 5.0),
            DVec3::new(5.0, 25.0, 20.0),
            DVec3::new(3.0, 4.0, 5.0),
        ],
    );
    scheduler.step().expect("step");
    let position = |uid| {
        scheduler
            .resources()
            .get::<Cell>(uid)
            .expect("cell")
            .position()
    };
    assert_eq!(position(uids[0]), DVec3::new(0.0, 5.0, 5.0));
    let clamped = position(uids[1]);
    assert_eq!(clamped.x, 5.0);
    assert!(clamped.y < 20.0 && clamped.y > 19.99);
    assert!(clamped.z < 20.0);
    assert_eq!(position(uids[2]), DVec3::new(3.0, 4.0, 5.0));
}

#[test]
fn neighbor_query_from_an_operation() {
    let (mut scheduler, uids) = scheduler_with_cells(
        SimulationConfig::default(),
        &[DVec3::ZERO, DVec3::new(0.0, 0.0, 1.0)],
    );
    let (o1, o2) = (uids[0], uids[1]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    scheduler.set_operations(vec![op("query", move |_, ctx| {
        if ctx.uid() == o1 {
            ctx.for_each_neighbor_within_radius(1.0, |n| {
                log.lock().expect("log").push(n.uid);
            });
        }
        Ok(())
    })]);
    scheduler.step().expect("step");
    assert_eq!(*seen.lock().expect("log"), vec![o2]);
}

#[derive(Debug, Default)]
struct Counter {
    base: ObjectBase,
    hits: u64,
}

impl SimObject for Counter {
    fn base(&self) -> &ObjectBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ObjectBase {
        &mut self.base
    }
}

#[test]
fn guarded_cross_writes_are_race_free() {
    let config = SimulationConfig {
        num_threads: Some(4),
        ..SimulationConfig::default()
    };
    let mut scheduler = Scheduler::new(config).expect("scheduler");
    let mut rng = SmallRng::seed_from_u64(7);
    let resources = scheduler.resources_mut();
    resources.register::<Counter>();
    let uids: Vec<Uid> = (0..300)
        .map(|_| {
            let position = DVec3::new(
                rng.random_range(0.0..6.0),
                rng.random_range(0.0..6.0),
                rng.random_range(0.0..6.0),
            );
            resources
                .create(Counter {
                    base: ObjectBase::new(position, 1.0),
                    hits: 0,
                })
                .expect("counter")
        })
        .collect();

    scheduler.set_operations(vec![op("poke", |_, ctx| {
        let mut targets = Vec::new();
        ctx.for_each_neighbor_within_radius(1.0, |n| targets.push(n.uid));
        for uid in targets {
            ctx.neighbor_mut_as::<Counter>(uid)?.hits += 1;
        }
        Ok(())
    })]);
    scheduler.step().expect("step");

    let grid = scheduler.grid();
    let resources = scheduler.resources();
    for uid in uids {
        let handle = resources.handle(uid).expect("handle");
        let mut expected = 0;
        grid.for_each_neighbor_within_radius(handle, 1.0, |_| expected += 1);
        assert_eq!(resources.get::<Counter>(uid).expect("counter").hits, expected);
    }
}

#[derive(Debug)]
struct GrowAndSplit {
    growth: f64,
    threshold: f64,
}

impl BiologyModule for GrowAndSplit {
    fn run(&self, object: &mut dyn SimObject, ctx: &mut ObjectContext<'_>) -> SimResult<()> {
        let Some(cell) = object.downcast_mut::<Cell>() else {
            return Ok(());
        };
        cell.change_volume(self.growth);
        if cell.diameter() > self.threshold {
            let daughter = cell.divide(DVec3::new(1.0, 0.5, 0.25));
            ctx.new_object(daughter)?;
        }
        Ok(())
    }
}

fn replay(threads: usize, seed: u64) -> Vec<(Uid, [f64; 3], f64)> {
    let config = SimulationConfig {
        bound_space: true,
        min_bound: 0.0,
        max_bound: 30.0,
        num_threads: Some(threads),
        ..SimulationConfig::default()
    };
    let mut scheduler = Scheduler::new(config).expect("scheduler");
    let module: Arc<dyn BiologyModule> = Arc::new(GrowAndSplit {
        growth: 0.4,
        threshold: 1.6,
    });
    let mut rng = SmallRng::seed_from_u64(seed);
    let resources = scheduler.resources_mut();
    resources.register::<Cell>();
    for _ in 0..120 {
        let position = DVec3::new(
            rng.random_range(10.0..20.0),
            rng.random_range(10.0..20.0),
            rng.random_range(10.0..20.0),
        );
        resources
            .create(Cell::new(position, rng.random_range(0.8..1.4)).with_module(Arc::clone(&module)))
            .expect("cell");
    }
    scheduler.simulate(8).expect("simulate");

    let mut state = Vec::new();
    scheduler
        .resources()
        .for_each_of_type::<Cell>(|uid, cell| {
            state.push((uid, cell.position().to_array(), cell.diameter()));
        })
        .expect("cells");
    state.sort_by_key(|entry| entry.0);
    state
}

#[test]
fn guarded_runs_replay_deterministically() {
    let first = replay(4, 11);
    let second = replay(4, 11);
    assert!(first.len() > 120, "cells should have divided");
    assert_eq!(first, second);
    assert_eq!(first, replay(1, 11));
}

#[derive(Debug, Default)]
struct Tether {
    base: ObjectBase,
    partner: Option<Handle>,
}

impl SimObject for Tether {
    fn base(&self) -> &ObjectBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ObjectBase {
        &mut self.base
    }

    fn update_references(&mut self, remaps: &RemapTable) {
        if let Some(partner) = self.partner.as_mut() {
            remaps.update(partner);
        }
    }
}

#[test]
fn back_references_follow_swap_removals() {
    let mut scheduler = Scheduler::new(SimulationConfig::default()).expect("scheduler");
    let resources = scheduler.resources_mut();
    resources.register::<Tether>();
    let uids: Vec<Uid> = (0..5)
        .map(|i| {
            resources
                .create(Tether {
                    base: ObjectBase::new(DVec3::splat(i as f64 * 3.0), 1.0),
                    partner: None,
                })
                .expect("tether")
        })
        .collect();
    let last = resources.handle(uids[4]).expect("handle");
    resources.get_mut::<Tether>(uids[0]).expect("tether").partner = Some(last);

    let victim = uids[1];
    scheduler.set_operations(vec![op("cull", move |_, ctx| {
        if ctx.uid() == victim {
            ctx.remove_from_simulation(victim)?;
        }
        Ok(())
    })]);
    let summary = scheduler.step().expect("step");
    assert_eq!(summary.remapped, 1);

    let resources = scheduler.resources();
    let moved = resources.handle(uids[4]).expect("moved");
    assert_ne!(moved, last);
    let partner = resources.get::<Tether>(uids[0]).expect("tether").partner;
    assert_eq!(partner, Some(moved));
}

#[derive(Debug)]
struct Recruiter;

#[derive(Debug)]
struct Marker;

impl BiologyModule for Recruiter {
    fn name(&self) -> &str {
        "recruiter"
    }

    fn run(&self, object: &mut dyn SimObject, ctx: &mut ObjectContext<'_>) -> SimResult<()> {
        if ctx.iteration() == 0 {
            object.base_mut().add_biology_module(Arc::new(Marker));
        }
        Ok(())
    }
}

impl BiologyModule for Marker {
    fn name(&self) -> &str {
        "marker"
    }

    fn copy_to_new(&self) -> bool {
        false
    }

    fn run(&self, object: &mut dyn SimObject, _ctx: &mut ObjectContext<'_>) -> SimResult<()> {
        let diameter = object.diameter();
        object.set_diameter(diameter + 1.0);
        Ok(())
    }
}

#[test]
fn modules_added_during_a_run_start_next_iteration() {
    let mut scheduler = Scheduler::new(SimulationConfig::default()).expect("scheduler");
    let resources = scheduler.resources_mut();
    resources.register::<Cell>();
    let uid = resources
        .create(Cell::new(DVec3::ZERO, 1.0).with_module(Arc::new(Recruiter)))
        .expect("cell");

    scheduler.step().expect("first");
    let diameter = |s: &Scheduler| s.resources().get::<Cell>(uid).expect("cell").diameter();
    assert_eq!(diameter(&scheduler), 1.0);
    {
        let cell = scheduler.resources().get::<Cell>(uid).expect("cell");
        let names: Vec<&str> = cell.base().biology_modules().iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["recruiter", "marker"]);
        assert_eq!(cell.base().inherited_modules().len(), 1);
    }
    scheduler.step().expect("second");
    assert_eq!(diameter(&scheduler), 2.0);
}

#[test]
fn side_storage_follows_scheduled_removals() {
    let positions: Vec<DVec3> = (0..10).map(|i| DVec3::new(i as f64 * 3.0, 0.0, 0.0)).collect();
    let (scheduler, uids) = scheduler_with_cells(SimulationConfig::default(), &positions);
    let mut scheduler = scheduler.with_operations(vec![op("thin_out", |_, ctx| {
        if ctx.uid().serial() % 2 == 0 {
            ctx.remove_from_simulation(ctx.uid())?;
        }
        Ok(())
    })]);

    let mut serials = HandleVec::<u64>::new(scheduler.resources());
    for &uid in &uids {
        serials[scheduler.resources().handle(uid).expect("handle")] = uid.serial();
    }
    scheduler.step().expect("step");
    let report = scheduler.last_teardown().expect("teardown report");
    assert_eq!(report.removed.len(), 5);
    assert!(!report.remaps.is_empty());
    serials.apply_remaps(scheduler.resources(), &report.remaps);

    assert_eq!(serials.len(), 5);
    for &uid in uids.iter().filter(|uid| uid.serial() % 2 == 1) {
        let handle = scheduler.resources().handle(uid).expect("survivor");
        assert_eq!(serials[handle], uid.serial());
    }
}

#[test]
fn daughters_are_reachable_through_their_staging_id() {
    let (scheduler, uids) = scheduler_with_cells(
        SimulationConfig::default(),
        &[DVec3::ZERO, DVec3::splat(20.0), DVec3::splat(40.0)],
    );
    let mut scheduler = scheduler.with_operations(vec![op("bud", |object, ctx| {
        if ctx.iteration() > 0 {
            return Ok(());
        }
        let id = ctx.new_object(Cell::new(object.position() + DVec3::X, 1.0))?;
        let daughter = ctx.staged_mut(id)?;
        daughter.set_diameter(0.5);
        Ok(())
    })]);
    scheduler.step().expect("step");

    let report = scheduler.last_teardown().expect("teardown report");
    assert_eq!(report.staged.len(), uids.len());
    for (&id, &mother) in report.staged.iter().zip(&uids) {
        assert_eq!(id.origin(), Some(mother));
        let daughter = report.uid_of(id).expect("committed daughter");
        let cell = scheduler.resources().get::<Cell>(daughter).expect("cell");
        assert_eq!(cell.diameter(), 0.5);
        let mother_position = scheduler
            .resources()
            .get::<Cell>(mother)
            .expect("mother")
            .position();
        assert_eq!(cell.position(), mother_position + DVec3::X);
    }
}
