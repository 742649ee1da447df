//! End-to-end scenarios for the worker pool.
//!
//! Every test builds its own registry and pool; jobs run in real forked
//! children, so these tests exercise the wire protocol, the busy/free
//! protocol and failure classification together.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use procpool::{
    CallWrapper, Error, HeapHandle, JobEntry, JobRegistry, OOM_EXIT_CODE, PoolConfig, QuitStatus,
    SendError, WorkerFailure, WorkerPool, select,
};

struct Jobs {
    inc: JobEntry<i64, i64>,
    double: JobEntry<i64, i64>,
    nap: JobEntry<u64, u64>,
    boom: JobEntry<(), ()>,
    snapshot: JobEntry<(), (u64, usize, i32)>,
}

fn build_registry() -> (JobRegistry, Jobs) {
    let mut registry = JobRegistry::new();
    let jobs = Jobs {
        inc: registry.register("inc", |n: i64| n + 1),
        double: registry.register("double", |n: i64| n * 2),
        nap: registry.register("nap", |ms: u64| {
            thread::sleep(Duration::from_millis(ms));
            ms
        }),
        boom: registry.register("boom", |_: ()| -> () { panic!("boom happened") }),
        snapshot: registry.register("snapshot", |_: ()| {
            let entry = procpool::entry_state().expect("worker entry state installed");
            let saved = entry
                .saved_state
                .downcast_ref::<i32>()
                .copied()
                .unwrap_or(-1);
            (entry.heap.0, entry.worker_id, saved)
        }),
    };
    (registry, jobs)
}

fn make_pool_with(config: PoolConfig, wrapper: Option<CallWrapper>) -> (WorkerPool, Jobs) {
    let (registry, jobs) = build_registry();
    let pool = WorkerPool::make(config, Arc::new(registry), Arc::new(42i32), wrapper)
        .expect("pool construction");
    (pool, jobs)
}

fn make_pool(longlived: bool, nbr_procs: usize) -> (WorkerPool, Jobs) {
    make_pool_with(
        PoolConfig {
            nbr_procs,
            longlived_workers: longlived,
            ..Default::default()
        },
        None,
    )
}

#[test]
fn two_longlived_workers_resolve_independently() {
    let (pool, jobs) = make_pool(true, 2);

    let mut h0 = pool.call(0, jobs.inc, 41).unwrap();
    let mut h1 = pool.call(1, jobs.double, 21).unwrap();
    assert!(pool.is_busy(0));
    assert!(pool.is_busy(1));

    assert_eq!(*h0.get_result().unwrap(), 42);
    assert_eq!(*h1.get_result().unwrap(), 42);
    assert!(!pool.is_busy(0));
    assert!(!pool.is_busy(1));
}

#[test]
fn second_call_on_busy_worker_is_rejected() {
    let (pool, jobs) = make_pool(true, 1);

    let mut first = pool.call(0, jobs.nap, 150).unwrap();
    let err = pool.call(0, jobs.inc, 1).unwrap_err();
    assert!(matches!(err, Error::WorkerBusy));

    // The first call is unaffected by the rejected dispatch.
    assert_eq!(*first.get_result().unwrap(), 150);
    assert!(!pool.is_busy(0));
}

#[test]
fn killed_clone_child_classifies_as_oom_and_record_survives() {
    let (pool, jobs) = make_pool(false, 1);

    let mut handle = pool.call(0, jobs.nap, 60_000).unwrap();
    let pid = handle.pid();

    // Stand in for the kernel OOM killer.
    thread::sleep(Duration::from_millis(50));
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGKILL)
        .unwrap();

    match handle.get_result().unwrap_err() {
        Error::WorkerFailed { pid: reported, failure } => {
            assert_eq!(reported, pid);
            assert_eq!(failure, WorkerFailure::Oomed);
        }
        other => panic!("expected WorkerFailed, got {:?}", other),
    }

    // The clone record goes back to dormant idle; the next call forks a
    // fresh child.
    assert!(!pool.is_force_quit(0));
    assert!(!pool.is_busy(0));
    let mut retry = pool.call(0, jobs.inc, 41).unwrap();
    assert_eq!(*retry.get_result().unwrap(), 42);
}

#[test]
fn select_drains_every_handle_exactly_once() {
    let (pool, jobs) = make_pool(true, 4);

    let mut pending = Vec::new();
    for (worker, ms) in [(0u64, 50u64), (1, 100), (2, 150), (3, 200)] {
        pending.push(
            pool.call_with_id(worker as usize, jobs.nap, ms, worker + 1)
                .unwrap(),
        );
    }

    let mut drained = Vec::new();
    let mut rounds = 0;
    while !pending.is_empty() {
        rounds += 1;
        assert!(rounds < 100, "select failed to drain");
        let selected = select(pending, &[]).unwrap();
        assert!(selected.ready_fds.is_empty());
        for mut handle in selected.readys {
            drained.push(handle.call_id());
            handle.get_result().unwrap();
        }
        pending = selected.waiters;
    }

    drained.sort_unstable();
    assert_eq!(drained, vec![1, 2, 3, 4]);
    for worker in pool.workers() {
        assert!(!pool.is_busy(worker));
    }
}

#[test]
fn cancel_releases_the_worker_promptly() {
    let (pool, jobs) = make_pool(true, 2);

    let mut handles = [pool.call(0, jobs.nap, 60_000).unwrap()];
    pool.cancel(&mut handles);
    let [mut handle] = handles;
    assert!(handle.is_cancelled());
    assert!(!pool.is_busy(0));

    let started = Instant::now();
    let err = handle.get_result().unwrap_err();
    assert!(matches!(err, Error::WorkerFailed { .. }));
    assert!(started.elapsed() < Duration::from_secs(5));

    // A cancelled long-lived worker is terminal; its sibling is not.
    assert!(pool.is_force_quit(0));
    let mut other = pool.call(1, jobs.inc, 1).unwrap();
    assert_eq!(*other.get_result().unwrap(), 2);
}

#[test]
fn cancelled_clone_record_is_reusable() {
    let (pool, jobs) = make_pool(false, 1);

    let mut handle = pool.call(0, jobs.nap, 60_000).unwrap();
    handle.cancel();
    let err = handle.get_result().unwrap_err();
    match err {
        Error::WorkerFailed { failure, .. } => {
            // The controller delivered the kill, so this is a quit, not
            // an OOM.
            assert_eq!(
                failure,
                WorkerFailure::Quit(QuitStatus::Signaled(nix::sys::signal::Signal::SIGKILL))
            );
        }
        other => panic!("expected WorkerFailed, got {:?}", other),
    }

    assert!(!pool.is_force_quit(0));
    let mut retry = pool.call(0, jobs.double, 4).unwrap();
    assert_eq!(*retry.get_result().unwrap(), 8);
}

#[test]
fn force_quit_all_is_idempotent_and_terminal() {
    let (pool, jobs) = make_pool(true, 2);

    let mut pending = pool.call(0, jobs.nap, 60_000).unwrap();

    pool.force_quit_all();
    pool.force_quit_all(); // No errors, no double close

    // Every pending result fails with a worker failure...
    let err = pending.get_result().unwrap_err();
    assert!(matches!(err, Error::WorkerFailed { .. }));

    // ...and every further call fails to send.
    for worker in pool.workers() {
        assert!(pool.is_force_quit(worker));
        let err = pool.call(worker, jobs.inc, 1).unwrap_err();
        assert!(matches!(err, Error::FailedToSendJob(_)));
    }
}

#[test]
fn roundtrip_laws_hold() {
    let (pool, jobs) = make_pool(true, 1);

    let mut handle = pool.call_with_id(0, jobs.double, 21, 7).unwrap();
    assert_eq!(handle.call_id(), 7);
    assert_eq!(*handle.job(), 21);
    assert_eq!(handle.worker_id(), 0);

    let meta = pool.current_handle(0).expect("busy worker exposes metadata");
    assert_eq!(meta.call_id(), 7);
    assert_eq!(meta.worker_id(), 0);
    assert!(!meta.is_cancelled());

    assert_eq!(*handle.get_result().unwrap(), 42);
    assert!(pool.current_handle(0).is_none());

    // get_result is idempotent once resolved.
    assert_eq!(*handle.get_result().unwrap(), 42);
    assert!(!pool.is_busy(0));
}

#[test]
fn longlived_worker_services_many_jobs() {
    let (pool, jobs) = make_pool(true, 1);

    for n in 0..3 {
        let mut handle = pool.call(0, jobs.inc, n).unwrap();
        assert_eq!(*handle.get_result().unwrap(), n + 1);
    }
    assert_eq!(pool.stats().total_jobs_completed, 3);
}

#[test]
fn clone_mode_roundtrip() {
    let (pool, jobs) = make_pool(false, 2);

    let mut h0 = pool.call(0, jobs.inc, 1).unwrap();
    let mut h1 = pool.call(1, jobs.inc, 2).unwrap();
    assert_eq!(*h0.get_result().unwrap(), 2);
    assert_eq!(*h1.get_result().unwrap(), 3);
    assert_eq!(pool.stats().total_jobs_completed, 2);
}

#[test]
fn panicking_job_reports_failed_and_condemns_longlived_worker() {
    let (pool, jobs) = make_pool(true, 1);

    let mut handle = pool.call(0, jobs.boom, ()).unwrap();
    match handle.get_result().unwrap_err() {
        Error::WorkerFailed { failure, .. } => match failure {
            WorkerFailure::JobFailed(message) => assert!(message.contains("boom happened")),
            other => panic!("expected JobFailed, got {:?}", other),
        },
        other => panic!("expected WorkerFailed, got {:?}", other),
    }
    assert!(pool.is_force_quit(0));
}

#[test]
fn entry_state_reaches_jobs_in_the_child() {
    let (pool, jobs) = make_pool_with(
        PoolConfig {
            nbr_procs: 2,
            longlived_workers: true,
            heap: HeapHandle(7),
            ..Default::default()
        },
        None,
    );

    let mut handle = pool.call(1, jobs.snapshot, ()).unwrap();
    let (heap, worker_id, saved) = handle.get_result().unwrap().clone();
    assert_eq!(heap, 7);
    assert_eq!(worker_id, 1);
    assert_eq!(saved, 42);
}

#[test]
fn call_wrapper_runs_inside_the_child() {
    let wrapper: CallWrapper = Arc::new(|run| {
        run().map(|value| serde_json::json!(value.as_i64().unwrap_or(0) + 1000))
    });
    let (pool, jobs) = make_pool_with(
        PoolConfig {
            nbr_procs: 1,
            longlived_workers: true,
            ..Default::default()
        },
        Some(wrapper),
    );

    let mut handle = pool.call(0, jobs.inc, 41).unwrap();
    assert_eq!(*handle.get_result().unwrap(), 1042);
}

#[test]
fn over_budget_worker_exits_with_the_distinguished_status() {
    let (pool, jobs) = make_pool_with(
        PoolConfig {
            nbr_procs: 1,
            longlived_workers: true,
            // Any real process exceeds one MiB of RSS.
            memory_limit_mib: Some(1),
            ..Default::default()
        },
        None,
    );

    // The first job completes; the self-check then makes the worker leave.
    let mut handle = pool.call(0, jobs.inc, 1).unwrap();
    assert_eq!(*handle.get_result().unwrap(), 2);

    thread::sleep(Duration::from_millis(300));
    match pool.call(0, jobs.inc, 2).unwrap_err() {
        Error::FailedToSendJob(SendError::WorkerAlreadyExited(status)) => {
            assert_eq!(status, QuitStatus::Exited(OOM_EXIT_CODE));
        }
        other => panic!("expected WorkerAlreadyExited, got {:?}", other),
    }
    assert!(pool.is_force_quit(0));
}

#[test]
fn graceful_shutdown_retires_idle_workers() {
    let (pool, jobs) = make_pool(true, 2);

    let mut warmup = pool.call(0, jobs.inc, 0).unwrap();
    assert_eq!(*warmup.get_result().unwrap(), 1);

    pool.shutdown(Duration::from_secs(2));
    for worker in pool.workers() {
        assert!(pool.is_force_quit(worker));
        assert!(matches!(
            pool.call(worker, jobs.inc, 1).unwrap_err(),
            Error::FailedToSendJob(_)
        ));
    }
}

#[test]
fn clone_lifecycle_hooks_are_idempotent() {
    let (pool, jobs) = make_pool(false, 1);

    // Parking a child twice forks once; closing twice closes once.
    pool.spawn(0).unwrap();
    pool.spawn(0).unwrap();
    pool.close(0);
    pool.close(0);

    // A parked child (re-spawned here) services the next call.
    pool.spawn(0).unwrap();
    let mut handle = pool.call(0, jobs.inc, 9).unwrap();
    assert_eq!(*handle.get_result().unwrap(), 10);
}
