//! Integration tests for the task manager: dependency order, exactly-once
//! execution, and primary-thread placement across many ticks.

use fusion_core::{CompositeTask, FnTask, Task, TaskCategory, TaskManager, TickContext};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Layered graph: every task in layer `n` depends on every task in `n - 1`.
fn layered_tasks(
    layers: usize,
    width: usize,
    log: &Arc<Mutex<Vec<(usize, usize)>>>,
) -> Vec<Arc<dyn Task>> {
    let mut tasks = Vec::new();
    for layer in 0..layers {
        for slot in 0..width {
            let log = Arc::clone(log);
            let mut task = FnTask::new(format!("l{layer}s{slot}"), TaskCategory::SIMULATION, move |_| {
                log.lock().push((layer, slot));
                Ok(())
            });
            if layer > 0 {
                for upstream in 0..width {
                    task = task.depends_on(format!("l{}s{upstream}", layer - 1));
                }
            }
            tasks.push(task.shared());
        }
    }
    tasks
}

#[test]
fn test_layers_complete_in_order() {
    let mut manager = TaskManager::with_threads(4).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let tasks = layered_tasks(5, 8, &log);

    for tick in 0..20 {
        log.lock().clear();
        let ctx = TickContext {
            tick,
            ..TickContext::default()
        };
        manager.spawn_jobs_for_system_tasks(&tasks, &ctx).unwrap();
        let report = manager.wait_for_system_tasks().unwrap();
        assert_eq!(report.completed, 40);

        let log = log.lock();
        assert_eq!(log.len(), 40);
        let layers: Vec<usize> = log.iter().map(|(layer, _)| *layer).collect();
        assert!(layers.windows(2).all(|w| w[0] <= w[1]), "tick {tick}: {layers:?}");
    }
}

#[test]
fn test_every_task_runs_exactly_once() {
    let mut manager = TaskManager::with_threads(6).unwrap();
    let counts: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));

    let tasks: Vec<Arc<dyn Task>> = (0..64)
        .map(|i| {
            let counts = Arc::clone(&counts);
            let name = format!("t{i}");
            let key = name.clone();
            let mut task = FnTask::new(name, TaskCategory::ALL, move |_| {
                *counts.lock().entry(key.clone()).or_default() += 1;
                Ok(())
            });
            if i % 3 == 0 && i > 0 {
                task = task.depends_on(format!("t{}", i - 1));
            }
            if i % 5 == 0 {
                task = task.primary_thread_only();
            }
            task.shared()
        })
        .collect();

    manager.spawn_jobs_for_system_tasks(&tasks, &TickContext::default()).unwrap();
    let report = manager.wait_for_system_tasks().unwrap();

    assert_eq!(report.executed(), 64);
    assert_eq!(report.primary_executed, 13);
    let counts = counts.lock();
    assert_eq!(counts.len(), 64);
    assert!(counts.values().all(|&c| c == 1));
}

#[test]
fn test_dependent_of_early_root_runs_once_per_tick() {
    let mut manager = TaskManager::with_threads(4).unwrap();
    let runs = Arc::new(Mutex::new(HashMap::<String, usize>::new()));
    let counting = |name: String| {
        let runs = Arc::clone(&runs);
        let key = name.clone();
        FnTask::new(name, TaskCategory::SIMULATION, move |_| {
            *runs.lock().entry(key.clone()).or_default() += 1;
            Ok(())
        })
    };

    // `dep` becomes ready as soon as `root` finishes, often while the
    // remaining roots are still being handed out
    let mut tasks = vec![counting("root".to_owned()).shared()];
    tasks.extend((0..32).map(|i| counting(format!("filler{i}")).shared()));
    tasks.push(counting("dep".to_owned()).depends_on("root").shared());

    for tick in 0..200 {
        runs.lock().clear();
        manager.spawn_jobs_for_system_tasks(&tasks, &TickContext::default()).unwrap();
        let report = manager.wait_for_system_tasks().unwrap();

        assert_eq!(report.completed, 34, "tick {tick}");
        let runs = runs.lock();
        assert_eq!(runs.len(), 34, "tick {tick}");
        assert!(runs.values().all(|&c| c == 1), "tick {tick}: {runs:?}");
    }
}

#[test]
fn test_panicking_fused_member_does_not_skip_the_rest() {
    let mut manager = TaskManager::with_threads(2).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let after = {
        let ran = Arc::clone(&ran);
        FnTask::new("after", TaskCategory::SIMULATION, move |_| {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .shared()
    };
    let panics = FnTask::new("panics", TaskCategory::SIMULATION, |_| panic!("bad state")).shared();
    let fused: Arc<dyn Task> = Arc::new(CompositeTask::new("w/simulation", vec![panics, after]));

    manager.spawn_jobs_for_system_tasks(&[fused], &TickContext::default()).unwrap();
    let report = manager.wait_for_system_tasks().unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.panicked, 0);
}

#[test]
fn test_primary_tasks_stay_on_primary_thread() {
    let mut manager = TaskManager::with_threads(3).unwrap();
    let primary = thread::current().id();
    let off_primary = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<Arc<dyn Task>> = (0..10)
        .map(|i| {
            let off_primary = Arc::clone(&off_primary);
            let mut task = FnTask::new(format!("ui{i}"), TaskCategory::RENDERING, move |_| {
                if thread::current().id() != primary {
                    off_primary.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            })
            .primary_thread_only();
            // Primary tasks chained behind worker tasks
            if i > 0 {
                task = task.depends_on(format!("work{i}"));
            }
            task.shared()
        })
        .chain((1..10).map(|i| FnTask::new(format!("work{i}"), TaskCategory::RENDERING, |_| Ok(())).shared()))
        .collect();

    manager.spawn_jobs_for_system_tasks(&tasks, &TickContext::default()).unwrap();
    let report = manager.wait_for_system_tasks().unwrap();

    assert_eq!(report.completed, 19);
    assert_eq!(report.primary_executed, 10);
    assert_eq!(off_primary.load(Ordering::SeqCst), 0);
}

#[test]
fn test_failures_do_not_block_dependents() {
    let mut manager = TaskManager::with_threads(2).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let after = {
        let ran = Arc::clone(&ran);
        FnTask::new("after", TaskCategory::SIMULATION, move |_| {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .depends_on("fails")
        .depends_on("panics")
        .shared()
    };
    let tasks = vec![
        FnTask::new("fails", TaskCategory::SIMULATION, |_| Err("broken input".into())).shared(),
        FnTask::new("panics", TaskCategory::SIMULATION, |_| panic!("bad state")).shared(),
        after,
    ];

    manager.spawn_jobs_for_system_tasks(&tasks, &TickContext::default()).unwrap();
    let report = manager.wait_for_system_tasks().unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.panicked, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_tick_context_reaches_every_task() {
    let mut manager = TaskManager::with_threads(4).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let tasks: Vec<Arc<dyn Task>> = (0..12)
        .map(|i| {
            let seen = Arc::clone(&seen);
            FnTask::new(format!("t{i}"), TaskCategory::SIMULATION, move |ctx| {
                seen.lock().push(ctx.tick);
                Ok(())
            })
            .shared()
        })
        .collect();

    let ctx = TickContext {
        tick: 42,
        ..TickContext::default()
    };
    manager.spawn_jobs_for_system_tasks(&tasks, &ctx).unwrap();
    manager.wait_for_system_tasks().unwrap();

    assert!(seen.lock().iter().all(|&tick| tick == 42));
}

#[test]
fn test_thread_cleanup_runs_on_every_worker() {
    let cleaned = Arc::new(AtomicUsize::new(0));
    {
        let mut manager = TaskManager::with_threads(3).unwrap();
        let cleaned = Arc::clone(&cleaned);
        manager.add_thread_cleanup(move || {
            cleaned.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(cleaned.load(Ordering::SeqCst), 3);
}
