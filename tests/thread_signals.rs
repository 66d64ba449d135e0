mod common;

use common::{SHARED_LEN, shared};
use std::sync::atomic::Ordering;
use tandem::{
    CpuCore, Error, ExitStatus, MaskHow, Options, Program, RuntimeBuilder, Signal, SignalSet,
    TaskId, TaskState,
};

fn init_threads(ntasks: usize) {
    let init = RuntimeBuilder::new()
        .ntasks(ntasks)
        .export_len(SHARED_LEN)
        .options(Options::THREAD)
        .init()
        .expect("thread-mode init succeeds");

    assert_eq!(init.id, TaskId::Root);
}

fn spawn(main: impl FnOnce(u32) -> i32 + Send + 'static) -> u32 {
    tandem::spawn(Program::entry(main), CpuCore::AsIs, None).expect("spawn succeeds")
}

/// Passes each signal along the ring: a task waits for it, then forwards it
/// to the next task, the last one back to the root.
fn relay(id: u32) -> i32 {
    let ntasks = tandem::ntasks().expect("task sees the instance") as u32;
    let pair = SignalSet::from([Signal::SIGUSR1, Signal::SIGUSR2]);
    tandem::sigmask(MaskHow::Block, &pair).expect("task blocks the ring signals");

    shared().barrier.wait(ntasks + 1);

    let next = if id + 1 == ntasks {
        TaskId::Root
    } else {
        TaskId::Child(id + 1)
    };

    for signal in [Signal::SIGUSR1, Signal::SIGUSR2] {
        match tandem::sigwait(&SignalSet::from([signal])) {
            Ok(received) if received == signal => {}
            _ => return 1,
        }
        if tandem::kill(next, signal).is_err() {
            return 2;
        }
    }

    0
}

fn run_ring(ntasks: u32) {
    init_threads(ntasks as usize);

    let pair = SignalSet::from([Signal::SIGUSR1, Signal::SIGUSR2]);
    let original = tandem::sigmask(MaskHow::Block, &pair).unwrap();

    for _ in 0..ntasks {
        spawn(relay);
    }

    shared().barrier.wait(ntasks + 1);

    for signal in [Signal::SIGUSR1, Signal::SIGUSR2] {
        tandem::kill(TaskId::Child(0), signal).unwrap();
        assert_eq!(
            tandem::sigwait(&SignalSet::from([signal])).unwrap(),
            signal,
            "{signal} did not make it around a ring of {ntasks}"
        );
    }

    let mut reaped = vec![false; ntasks as usize];
    for _ in 0..ntasks {
        let (id, code) = tandem::wait_any().unwrap();
        assert_eq!(code, 0, "task {id} failed in the ring");
        assert!(!reaped[id as usize], "task {id} reaped twice");
        reaped[id as usize] = true;
    }

    assert!(matches!(tandem::wait_any(), Err(Error::NoOutstandingTasks)));
    assert!(matches!(
        tandem::kill(TaskId::Child(ntasks), Signal::SIGUSR1),
        Err(Error::OutOfRange(TaskId::Child(id))) if id == ntasks
    ));

    tandem::fin().unwrap();
    tandem::sigmask(MaskHow::SetMask, &original).unwrap();
}

#[test]
fn test_signal_ring_of_one() {
    let _serial = common::serial();
    common::init_tracing();

    run_ring(1);
}

#[test]
fn test_signal_ring_of_two() {
    let _serial = common::serial();
    common::init_tracing();

    run_ring(2);
}

#[test]
fn test_signal_ring_of_ten() {
    let _serial = common::serial();
    common::init_tracing();

    run_ring(10);
}

#[test]
fn test_sigmask_block_then_unblock_restores_mask() {
    let _serial = common::serial();
    common::init_tracing();

    let pair = SignalSet::from([Signal::SIGUSR1, Signal::SIGUSR2]);

    // Plain thread mask before init.
    let before = tandem::sigmask(MaskHow::Block, &pair).unwrap();
    tandem::sigmask(MaskHow::Unblock, &pair).unwrap();
    assert_eq!(tandem::sigmask(MaskHow::Block, &SignalSet::empty()).unwrap(), before);

    init_threads(1);

    let original = tandem::sigmask(MaskHow::Block, &pair).unwrap();
    let blocked = tandem::sigmask(MaskHow::Unblock, &pair).unwrap();
    assert!(blocked.contains(Signal::SIGUSR1) && blocked.contains(Signal::SIGUSR2));

    let restored = tandem::sigmask(MaskHow::Block, &SignalSet::empty()).unwrap();
    assert_eq!(restored, original, "block then unblock must restore the mask");

    tandem::fin().unwrap();
}

#[test]
fn test_child_killed_by_unblocked_signal_is_unresolved() {
    let _serial = common::serial();
    common::init_tracing();

    init_threads(1);

    let id = spawn(|_| {
        let only_usr2 = SignalSet::from([Signal::SIGUSR2]);
        if tandem::sigmask(MaskHow::SetMask, &only_usr2).is_err() {
            return 1;
        }
        shared().barrier.wait(2);

        let _ = tandem::sigwait(&only_usr2);
        0
    });

    shared().barrier.wait(2);
    tandem::kill(TaskId::Child(id), Signal::SIGUSR1).unwrap();

    match tandem::wait(id) {
        Err(Error::Unresolved { task, signal }) => {
            assert_eq!(task, id);
            assert_eq!(signal, Signal::SIGUSR1);
        }
        other => panic!("expected an unresolved signal death, got {other:?}"),
    }

    assert_eq!(
        tandem::state(id).unwrap(),
        TaskState::Signaled(Signal::SIGUSR1)
    );
    assert!(
        matches!(tandem::wait(id), Err(Error::NoSuchTask(TaskId::Child(_)))),
        "a task is reaped only once"
    );
    assert!(tandem::is_initialized(), "the root survives its child's death");

    tandem::fin().unwrap();
}

#[test]
fn test_default_ignored_signal_is_discarded() {
    let _serial = common::serial();
    common::init_tracing();

    init_threads(1);

    let id = spawn(|_| {
        if tandem::sigmask(MaskHow::SetMask, &SignalSet::empty()).is_err() {
            return 1;
        }
        shared().barrier.wait(2);
        shared().barrier.wait(2);

        // A runtime call after the signal landed.
        match tandem::my_id() {
            Ok(TaskId::Child(_)) => 0,
            _ => 2,
        }
    });

    shared().barrier.wait(2);
    tandem::kill(TaskId::Child(id), Signal::SIGCHLD).unwrap();
    shared().barrier.wait(2);

    assert_eq!(tandem::wait_status(id).unwrap(), ExitStatus::Exited(0));
    tandem::fin().unwrap();
}

#[test]
fn test_wait_any_reports_each_task_once() {
    let _serial = common::serial();
    common::init_tracing();

    init_threads(4);

    for _ in 0..4 {
        spawn(|id| 10 + id as i32);
    }

    let mut codes = Vec::new();
    for _ in 0..4 {
        let (id, code) = tandem::wait_any().unwrap();
        assert_eq!(code, 10 + id as i32);
        codes.push(id);
    }
    codes.sort_unstable();

    assert_eq!(codes, vec![0, 1, 2, 3]);
    assert!(matches!(tandem::wait_any(), Err(Error::NoOutstandingTasks)));

    tandem::fin().unwrap();
}

#[test]
fn test_exit_and_panic_end_only_the_task() {
    let _serial = common::serial();
    common::init_tracing();

    init_threads(2);

    let exiting = spawn(|_| tandem::exit(7));
    let panicking = spawn(|_| panic!("task body failure"));

    assert_eq!(tandem::wait(exiting).unwrap(), 7);
    assert_eq!(tandem::wait(panicking).unwrap(), 101);

    tandem::fin().unwrap();
}

#[test]
fn test_tasks_share_the_exported_region() {
    let _serial = common::serial();
    common::init_tracing();

    init_threads(8);

    for _ in 0..8 {
        spawn(|_| {
            shared().counter.fetch_add(1, Ordering::SeqCst);
            0
        });
    }

    while let Ok((_, code)) = tandem::wait_any() {
        assert_eq!(code, 0);
    }

    assert_eq!(shared().counter.load(Ordering::SeqCst), 8);
    tandem::fin().unwrap();
}

#[test]
fn test_task_rejoins_through_init_and_finalizes_its_own_view() {
    let _serial = common::serial();
    common::init_tracing();

    init_threads(1);

    let id = spawn(|id| {
        match tandem::init(1, 0, Options::AUTO) {
            Ok(init) if init.id == TaskId::Child(id) => {}
            _ => return 1,
        }

        if tandem::fin().is_err() {
            return 2;
        }
        if tandem::is_initialized() || !matches!(tandem::my_id(), Err(Error::NotInitialized)) {
            return 3;
        }
        if !matches!(tandem::fin(), Err(Error::NotInitialized)) {
            return 4;
        }

        0
    });

    assert_eq!(tandem::wait(id).unwrap(), 0);
    assert!(tandem::is_initialized(), "a task's fin leaves the root's view alone");

    tandem::fin().unwrap();
}

#[test]
fn test_spawn_rules() {
    let _serial = common::serial();
    common::init_tracing();

    init_threads(2);

    assert!(matches!(
        tandem::kill(TaskId::Child(1), Signal::SIGUSR1),
        Err(Error::NoSuchTask(_))
    ));
    assert!(matches!(
        tandem::spawn(Program::entry(|_| 0), CpuCore::AsIs, Some(2)),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        tandem::spawn(
            Program::image("/bin/true", Vec::<String>::new()),
            CpuCore::AsIs,
            None
        ),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(tandem::state(0).unwrap(), TaskState::Pending);

    let child = tandem::spawn(
        Program::entry(|_| {
            match tandem::spawn(Program::entry(|_| 0), CpuCore::AsIs, None) {
                Err(Error::PermissionDenied(_)) => 0,
                _ => 1,
            }
        }),
        CpuCore::AsIs,
        Some(1),
    )
    .unwrap();
    assert_eq!(child, 1);

    assert!(matches!(
        tandem::spawn(Program::entry(|_| 0), CpuCore::AsIs, Some(1)),
        Err(Error::InvalidArgument(_))
    ));
    assert!(
        matches!(tandem::fin(), Err(Error::Busy(_))),
        "root fin must wait for every task to be reaped"
    );

    assert_eq!(tandem::wait(child).unwrap(), 0);
    tandem::fin().unwrap();
}

#[test]
fn test_helper_thread_of_a_task_is_not_root() {
    let _serial = common::serial();
    common::init_tracing();

    init_threads(2);

    let id = spawn(|_| {
        let helper = std::thread::spawn(|| {
            let spawned = tandem::spawn(Program::entry(|_| 0), CpuCore::AsIs, None);

            [
                matches!(tandem::my_id(), Err(Error::PermissionDenied(_))),
                matches!(spawned, Err(Error::PermissionDenied(_))),
                matches!(tandem::wait_any(), Err(Error::PermissionDenied(_))),
                matches!(tandem::fin(), Err(Error::PermissionDenied(_))),
                tandem::is_initialized(),
            ]
        });

        match helper.join() {
            Ok(checks) if checks.iter().all(|passed| *passed) => 0,
            _ => 1,
        }
    });

    assert_eq!(
        tandem::wait(id).unwrap(),
        0,
        "a thread started by a task must not act as the root"
    );
    assert_eq!(tandem::state(1).unwrap(), TaskState::Pending);
    assert!(tandem::is_initialized());

    tandem::fin().unwrap();
}

#[test]
fn test_sigkill_cannot_be_blocked_by_a_task() {
    let _serial = common::serial();
    common::init_tracing();

    init_threads(1);

    let id = spawn(|_| {
        let usr1 = SignalSet::from([Signal::SIGUSR1]);
        let blocked = tandem::sigmask(MaskHow::Block, &usr1.with(Signal::SIGKILL))
            .and_then(|_| tandem::sigmask(MaskHow::Block, &SignalSet::empty()));
        shared().barrier.wait(2);

        match blocked {
            Ok(mask) if mask.contains(Signal::SIGUSR1) && !mask.contains(Signal::SIGKILL) => {
                let _ = tandem::sigwait(&usr1);
                0
            }
            _ => 1,
        }
    });

    shared().barrier.wait(2);
    tandem::kill(TaskId::Child(id), Signal::SIGKILL).unwrap();

    assert!(matches!(
        tandem::wait(id),
        Err(Error::Unresolved { signal: Signal::SIGKILL, .. })
    ));

    tandem::fin().unwrap();
}

#[cfg(target_os = "linux")]
#[test]
fn test_task_can_be_pinned_to_a_core() {
    let _serial = common::serial();
    common::init_tracing();

    let allowed = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        assert_eq!(
            libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set),
            0
        );
        (0..libc::CPU_SETSIZE as usize)
            .rev()
            .find(|core| libc::CPU_ISSET(*core, &set))
            .expect("the test runs on at least one core")
    };

    init_threads(1);

    let id = tandem::spawn(
        Program::entry(move |_| {
            let running_on = unsafe { libc::sched_getcpu() };
            if running_on == allowed as i32 { 0 } else { running_on + 1 }
        }),
        CpuCore::Core(allowed),
        None,
    )
    .unwrap();

    assert_eq!(tandem::wait(id).unwrap(), 0, "task should run on core {allowed}");
    tandem::fin().unwrap();
}
