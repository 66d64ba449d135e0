//! Process-wide runtime instance and its lifecycle.
//!
//! One instance may exist per process. It lives in a single lifecycle slot:
//!
//! ```text
//! Uninitialized ──init──► Initialized ──fin──► Finalized ──init──► Initialized
//! ```
//!
//! Operations clone the instance handle out of the slot and release the slot
//! lock before doing any work, so a blocking `wait` or `sigwait` never holds
//! it, and no lock is held across `fork`.

use crate::builder::{Init, RuntimeBuilder};
use crate::error::{Error, Result};
use crate::memory::{ExportedRegion, HeapBlock, RegionBacking, SharedMapping};
use crate::mode::{self, ExecutionMode};
use crate::registry::Registry;
use crate::runtime::context;
use crate::substrate::handoff::Handoff;
use crate::substrate::{ProcessSubstrate, Substrate};
use crate::task::{TaskId, TaskState};
use crate::NTASKS_MAX;

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread::{self, ThreadId};
use tracing::{debug, info};

enum Lifecycle {
    Uninitialized,
    Initialized(Arc<Instance>),
    Finalized,
}

static RUNTIME: Mutex<Lifecycle> = Mutex::new(Lifecycle::Uninitialized);

/// A negotiated, initialized runtime.
pub(crate) struct Instance {
    pub(crate) mode: ExecutionMode,
    pub(crate) registry: Registry,
    pub(crate) substrate: Substrate,
    export: Option<RegionBacking>,
    /// Identity of this process: the root, or the child a forked or exec'd
    /// process was spawned as. Thread tasks override it with their context.
    own_id: AtomicI64,
    /// The thread that called `init` as the root. Other threads of the root
    /// process that run no task body are not tasks.
    root_thread: Option<ThreadId>,
}

impl Instance {
    fn create(mode: ExecutionMode, ntasks: usize, export_len: usize) -> Result<Self> {
        let export = match export_len {
            0 => None,
            len if mode.is_thread() => Some(RegionBacking::Heap(HeapBlock::new(len)?)),
            len => Some(RegionBacking::Shared(SharedMapping::create(
                "tandem-export",
                len,
            )?)),
        };

        Ok(Self {
            mode,
            registry: Registry::new(ntasks),
            substrate: Substrate::new(mode, ntasks)?,
            export,
            own_id: AtomicI64::new(TaskId::ROOT_RAW),
            root_thread: Some(thread::current().id()),
        })
    }

    fn join(handoff: &Handoff) -> Result<Self> {
        let export = match handoff.export {
            Some((fd, len)) => Some(RegionBacking::Shared(unsafe {
                SharedMapping::attach(fd, len)?
            })),
            None => None,
        };

        Ok(Self {
            mode: handoff.mode,
            registry: Registry::new(handoff.ntasks),
            substrate: Substrate::Process(ProcessSubstrate::attach(handoff)?),
            export,
            own_id: AtomicI64::new(i64::from(handoff.task)),
            root_thread: None,
        })
    }

    pub(crate) fn ntasks(&self) -> usize {
        self.registry.ntasks()
    }

    /// Identity of the calling thread within this instance.
    pub(crate) fn caller(&self) -> Result<TaskId> {
        match context::current() {
            Some(context) if context.finalized => Err(Error::NotInitialized),
            Some(context) => Ok(context.id),
            None => match self.own_id() {
                TaskId::Root if !self.on_root_thread() => Err(Error::PermissionDenied(
                    "calling thread is neither the root nor a task".into(),
                )),
                id => Ok(id),
            },
        }
    }

    fn on_root_thread(&self) -> bool {
        self.root_thread
            .is_none_or(|root| root == thread::current().id())
    }

    fn own_id(&self) -> TaskId {
        TaskId::from_raw(self.own_id.load(Ordering::Acquire)).unwrap_or(TaskId::Root)
    }

    /// Records that this process now runs as `id`. Called in a forked child.
    pub(crate) fn adopt_identity(&self, id: TaskId) {
        self.own_id.store(id.as_raw(), Ordering::Release);
    }

    pub(crate) fn export(&self) -> Option<ExportedRegion> {
        self.export.as_ref().map(RegionBacking::view)
    }

    pub(crate) fn export_mapping(&self) -> Option<&SharedMapping> {
        self.export.as_ref().and_then(RegionBacking::shared)
    }
}

/// Clones the live instance out of the lifecycle slot together with the
/// caller's identity.
pub(crate) fn acquire() -> Result<(Arc<Instance>, TaskId)> {
    let instance = current().ok_or(Error::NotInitialized)?;
    let caller = instance.caller()?;

    Ok((instance, caller))
}

/// The live instance, if any, regardless of the caller's view.
pub(crate) fn current() -> Option<Arc<Instance>> {
    match &*RUNTIME.lock() {
        Lifecycle::Initialized(instance) => Some(Arc::clone(instance)),
        Lifecycle::Uninitialized | Lifecycle::Finalized => None,
    }
}

pub(crate) fn initialize(config: &RuntimeBuilder) -> Result<Init> {
    let mut lifecycle = RUNTIME.lock();

    if let Lifecycle::Initialized(instance) = &*lifecycle {
        // A spawned task asking who it is gets its own identity back.
        return match instance.caller() {
            Ok(id @ TaskId::Child(_)) => Ok(Init {
                id,
                ntasks: instance.ntasks(),
            }),
            _ => Err(Error::Busy("runtime is already initialized")),
        };
    }

    if let Some(handoff) = Handoff::from_env()? {
        let instance = Instance::join(&handoff)?;
        *lifecycle = Lifecycle::Initialized(Arc::new(instance));

        // A later `init` here, or a program exec'd from here, starts afresh.
        handoff.consume();

        debug!(task = handoff.task, mode = %handoff.mode, "image joined its instance");

        return Ok(Init {
            id: TaskId::Child(handoff.task),
            ntasks: handoff.ntasks,
        });
    }

    let mode = mode::negotiate(config.options, config.resolve_override()?)?;

    match config.ntasks {
        0 => {
            return Err(Error::InvalidArgument(
                "an instance needs at least one task".into(),
            ));
        }
        requested if requested > NTASKS_MAX => {
            return Err(Error::Overflow {
                requested,
                max: NTASKS_MAX,
            });
        }
        _ => {}
    }

    let instance = Instance::create(mode, config.ntasks, config.export_len)?;
    *lifecycle = Lifecycle::Initialized(Arc::new(instance));

    info!(
        %mode,
        ntasks = config.ntasks,
        export_len = config.export_len,
        "runtime initialized"
    );

    Ok(Init {
        id: TaskId::Root,
        ntasks: config.ntasks,
    })
}

/// Finalizes the calling task's view of the runtime.
///
/// Called by the root, this tears the instance down and releases the exported
/// region; every spawned task must have been reaped first. Called by any other
/// task, it only finalizes that task's own view.
///
/// # Errors
/// - [`Error::NotInitialized`] if there is no instance (or this view is
///   already finalized).
/// - [`Error::Busy`] if the root still has unreaped tasks.
/// - [`Error::PermissionDenied`] from a thread of the root process that is
///   neither the root nor a task.
///
/// # Example
/// ```ignore
/// tandem::init(4, 0, Options::AUTO)?;
/// // spawn and reap...
/// tandem::fin()?;
/// ```
pub fn fin() -> Result<()> {
    let mut lifecycle = RUNTIME.lock();

    let Lifecycle::Initialized(instance) = &*lifecycle else {
        return Err(Error::NotInitialized);
    };

    if let Some(context) = context::current() {
        if context.finalized {
            return Err(Error::NotInitialized);
        }

        context::finalize_current();
        debug!(task = %context.id, "task finalized its view");
        return Ok(());
    }

    let id = instance.caller()?;
    if id.is_root() && instance.registry.has_outstanding() {
        return Err(Error::Busy("spawned tasks have not been reaped"));
    }

    *lifecycle = Lifecycle::Finalized;

    if id.is_root() {
        info!("runtime finalized");
    }

    Ok(())
}

/// True while the calling task's view of the runtime is initialized. Never
/// fails.
pub fn is_initialized() -> bool {
    !matches!(acquire(), Err(Error::NotInitialized))
}

/// The negotiated execution mode.
pub fn mode() -> Result<ExecutionMode> {
    Ok(acquire()?.0.mode)
}

/// Number of child tasks the instance was initialized with.
pub fn ntasks() -> Result<usize> {
    Ok(acquire()?.0.ntasks())
}

/// Identity of the calling task.
pub fn my_id() -> Result<TaskId> {
    Ok(acquire()?.1)
}

/// The region the root exported at `init`, if it asked for one.
pub fn export() -> Result<Option<ExportedRegion>> {
    Ok(acquire()?.0.export())
}

/// Lifecycle state of child `task` as the calling process sees it.
///
/// Only the root's view is authoritative in process modes.
pub fn state(task: u32) -> Result<TaskState> {
    let (instance, _) = acquire()?;
    instance.registry.check_target(TaskId::Child(task))?;
    instance.registry.state(task)
}
