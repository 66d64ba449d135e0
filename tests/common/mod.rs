#![allow(dead_code)]

use parking_lot::{Mutex, MutexGuard};
use std::sync::Once;
use std::sync::atomic::{AtomicU32, Ordering};
use tandem::Error;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();
static SERIAL: Mutex<()> = Mutex::new(());

/// Initialise tracing for tests.
///
/// Logs go through `with_test_writer()`, so they only show for failing tests
/// unless run with `--nocapture`. Enable levels with `RUST_LOG=debug`.
///
/// Not for process-mode binaries: forked children must not share the
/// subscriber's locks.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Serializes tests of one binary: the runtime is a process singleton.
///
/// Also tears down whatever instance a failed test left behind.
pub fn serial() -> MutexGuard<'static, ()> {
    let guard = SERIAL.lock();

    if tandem::is_initialized() {
        loop {
            match tandem::wait_any() {
                Ok(_) | Err(Error::Unresolved { .. }) => continue,
                Err(_) => break,
            }
        }
        let _ = tandem::fin();
    }

    guard
}

/// Reusable barrier for tasks in the exported region.
///
/// Spins instead of parking so it works across processes as well as threads.
/// All-zero is the initial state.
#[repr(C)]
pub struct SpinBarrier {
    arrived: AtomicU32,
    generation: AtomicU32,
}

impl SpinBarrier {
    pub fn wait(&self, parties: u32) {
        let generation = self.generation.load(Ordering::Acquire);

        if self.arrived.fetch_add(1, Ordering::AcqRel) + 1 == parties {
            self.arrived.store(0, Ordering::Relaxed);
            self.generation.fetch_add(1, Ordering::Release);
            return;
        }

        while self.generation.load(Ordering::Acquire) == generation {
            std::thread::yield_now();
        }
    }
}

/// Layout the tests place in the exported region.
#[repr(C)]
pub struct Shared {
    pub barrier: SpinBarrier,
    pub counter: AtomicU32,
}

pub const SHARED_LEN: usize = std::mem::size_of::<Shared>();

/// The [`Shared`] block at the start of the exported region.
pub fn shared() -> &'static Shared {
    let region = tandem::export()
        .expect("runtime is initialized")
        .expect("an exported region was requested");

    let shared: &Shared = unsafe { region.cast::<Shared>() }.expect("region fits Shared");

    // The region outlives every task; it is released only by the root's fin.
    unsafe { &*(shared as *const Shared) }
}
