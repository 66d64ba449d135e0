//! Image tasks: the test binary re-executes itself as each task, and the
//! re-executed copy joins the instance through `init`.

mod common;

use common::{SHARED_LEN, shared};
use std::sync::atomic::Ordering;
use tandem::{CpuCore, Options, Program, RuntimeBuilder, TaskId};

const NTASKS: usize = 3;

fn image_task(id: u32) -> ! {
    // Whatever the image execs next must not try to join this instance.
    let leftover = std::env::vars().any(|(name, _)| name.starts_with("TANDEM_"));
    if leftover {
        tandem::exit(2)
    }

    if tandem::mode().is_ok_and(|mode| mode.is_process()) {
        shared().counter.fetch_add(1, Ordering::SeqCst);
        tandem::exit(10 + id as i32)
    }

    tandem::exit(1)
}

#[test]
fn test_image_tasks_join_through_init() {
    let init = RuntimeBuilder::new()
        .ntasks(NTASKS)
        .export_len(SHARED_LEN)
        .options(Options::PROCESS_CLONE)
        .init()
        .expect("init succeeds");

    if let TaskId::Child(id) = init.id {
        assert_eq!(init.ntasks, NTASKS);
        image_task(id);
    }

    let program = std::env::current_exe().expect("test binary path");
    let args = [
        "test_image_tasks_join_through_init",
        "--exact",
        "--test-threads=1",
        "--quiet",
    ];

    for _ in 0..NTASKS {
        tandem::spawn(
            Program::image(program.clone(), args),
            CpuCore::AsIs,
            None,
        )
        .expect("image spawn succeeds");
    }

    for id in 0..NTASKS as u32 {
        assert_eq!(
            tandem::wait(id).expect("image task is reaped"),
            10 + id as i32,
            "image task {id} did not join as itself, or kept its handoff environment"
        );
    }

    assert_eq!(shared().counter.load(Ordering::SeqCst), NTASKS as u32);

    tandem::fin().unwrap();
}
