//! Process substrate: every task is a child process of the root.
//!
//! Entry programs are forked and run their closure in the child. Image
//! programs are forked and exec'd, with the control block and exported
//! region passed as inherited memfd descriptors (see [`Handoff`]).
//!
//! Everything an exec'd child needs is prepared before `fork`; between `fork`
//! and `exec` the child only makes raw syscalls.
//!
//! Signals are real OS signals here. Routing targets the thread each task
//! registered in the control block, `sigwait` is the OS one, and reaping is
//! `waitpid`.

use super::control::{self, ControlBlock, TaskEntry};
use super::handoff::{ENV_PREFIX, Handoff};
use crate::affinity;
use crate::error::{Error, Result};
use crate::mode::ExecutionMode;
use crate::registry::Registry;
use crate::runtime::Instance;
use crate::signal::{self, MaskHow, SignalSet};
use crate::task::{CpuCore, ExitStatus, Program, ProgramKind, TaskId, TaskMain};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
#[cfg(target_os = "linux")]
use nix::sys::wait::{Id, waitid};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, getpid};
use std::env;
use std::ffi::{CString, c_char};
use std::io::{self, Write};
use std::os::fd::RawFd;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Set in a process forked for an entry task. Such a process shares the
/// root's exit handlers and must never run them, even after `fin`.
static FORKED_TASK: AtomicBool = AtomicBool::new(false);

/// Pause between reap passes that cannot block until a task terminates.
const FOREIGN_CHILD_POLL: Duration = Duration::from_millis(2);

pub(crate) struct ProcessSubstrate {
    mode: ExecutionMode,
    control: ControlBlock,
}

impl ProcessSubstrate {
    pub(crate) fn new(mode: ExecutionMode, ntasks: usize) -> Result<Self> {
        Ok(Self {
            mode,
            control: ControlBlock::create(ntasks)?,
        })
    }

    /// Joins the instance described by an exec handoff as task `handoff.task`.
    pub(crate) fn attach(handoff: &Handoff) -> Result<Self> {
        let (fd, len) = handoff.control;
        let control = unsafe { ControlBlock::attach(fd, len, handoff.ntasks)? };

        if let Some(entry) = control.entry(handoff.task) {
            entry.register(getpid().as_raw(), control::gettid());
        }

        Ok(Self {
            mode: handoff.mode,
            control,
        })
    }

    fn entry(&self, index: u32) -> Result<&TaskEntry> {
        self.control
            .entry(index)
            .ok_or(Error::OutOfRange(TaskId::Child(index)))
    }

    pub(crate) fn spawn(
        &self,
        instance: &Arc<Instance>,
        index: u32,
        program: Program,
        cpu: CpuCore,
    ) -> Result<()> {
        match program.kind {
            ProgramKind::Entry(main) => self.fork_entry(instance, index, main, cpu),
            ProgramKind::Image { path, args } => {
                self.fork_image(instance, index, &path, &args, cpu)
            }
        }
    }

    fn fork_entry(
        &self,
        instance: &Arc<Instance>,
        index: u32,
        main: TaskMain,
        cpu: CpuCore,
    ) -> Result<()> {
        let entry = self.entry(index)?;

        // Anything still buffered would otherwise be written by both sides.
        let _ = io::stdout().flush();

        match unsafe { fork() }? {
            ForkResult::Child => {
                FORKED_TASK.store(true, Ordering::Release);
                instance.adopt_identity(TaskId::Child(index));
                entry.register(getpid().as_raw(), control::gettid());
                let _ = affinity::apply(cpu);

                let code = panic::catch_unwind(AssertUnwindSafe(|| main(index))).unwrap_or(101);
                exit_child(code)
            }
            ForkResult::Parent { child } => {
                entry.register_spawned(child.as_raw());
                debug!(task = index, pid = child.as_raw(), "forked entry task");
                Ok(())
            }
        }
    }

    fn fork_image(
        &self,
        instance: &Arc<Instance>,
        index: u32,
        path: &Path,
        args: &[String],
        cpu: CpuCore,
    ) -> Result<()> {
        let entry = self.entry(index)?;

        let control_fd = self.control.mapping().raw_fd().ok_or_else(memfd_required)?;
        let export = match instance.export_mapping() {
            Some(mapping) => Some((
                mapping.raw_fd().ok_or_else(memfd_required)?,
                mapping.len(),
            )),
            None => None,
        };

        let handoff = Handoff {
            task: index,
            ntasks: instance.registry.ntasks(),
            mode: self.mode,
            control: (control_fd, self.control.mapping().len()),
            export,
        };

        let exec = PreparedExec::new(path, args, &handoff)?;
        let inherited: [Option<RawFd>; 2] = [Some(control_fd), export.map(|(fd, _)| fd)];

        let _ = io::stdout().flush();

        match unsafe { fork() }? {
            ForkResult::Child => {
                // Raw syscalls only from here on.
                for fd in inherited.into_iter().flatten() {
                    unsafe { libc::fcntl(fd, libc::F_SETFD, 0) };
                }
                let _ = affinity::apply(cpu);

                unsafe {
                    libc::execve(exec.path.as_ptr(), exec.argv.as_ptr(), exec.envp.as_ptr());
                    libc::_exit(127)
                }
            }
            ForkResult::Parent { child } => {
                entry.register_spawned(child.as_raw());
                debug!(
                    task = index,
                    pid = child.as_raw(),
                    image = %path.display(),
                    "spawned image task"
                );
                Ok(())
            }
        }
    }

    pub(crate) fn route(&self, target: TaskId, signal: Signal) -> Result<()> {
        let (pid, tid) = match target {
            TaskId::Root => self.control.root(),
            TaskId::Child(index) => self
                .entry(index)?
                .target()
                .ok_or(Error::NoSuchTask(target))?,
        };

        deliver(pid, tid, signal)
    }

    pub(crate) fn sigmask(&self, how: MaskHow, set: SignalSet) -> Result<SignalSet> {
        signal::thread_mask(how, set)
    }

    pub(crate) fn sigwait(&self, set: SignalSet) -> Result<Signal> {
        Ok(set.to_sigset().wait()?)
    }

    pub(crate) fn reap(&self, registry: &Registry, index: u32) -> Result<ExitStatus> {
        registry.ensure_reapable(index)?;

        let pid = match self.entry(index)?.pid() {
            0 => return Err(Error::NoSuchTask(TaskId::Child(index))),
            pid => Pid::from_raw(pid),
        };

        loop {
            match waitpid(pid, None) {
                Ok(status) => {
                    if let Some(status) = exit_status(status) {
                        return Ok(self.collect(registry, index, status));
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    /// Reaps whichever outstanding task terminates first.
    ///
    /// Only task pids are ever waited on, so children the embedding program
    /// started itself keep their exit status for their owner.
    pub(crate) fn reap_any(&self, registry: &Registry) -> Result<(u32, ExitStatus)> {
        loop {
            let outstanding = registry.outstanding();
            if outstanding.is_empty() {
                return Err(Error::NoOutstandingTasks);
            }

            for index in outstanding {
                let pid = match self.entry(index)?.pid() {
                    0 => continue,
                    pid => Pid::from_raw(pid),
                };

                match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(status) => {
                        if let Some(status) = exit_status(status) {
                            return Ok((index, self.collect(registry, index, status)));
                        }
                    }
                    Err(Errno::EINTR) => {}
                    Err(errno) => return Err(errno.into()),
                }
            }

            self.park()?;
        }
    }

    /// Blocks until some child is waitable, without reaping it.
    #[cfg(target_os = "linux")]
    fn park(&self) -> Result<()> {
        loop {
            match waitid(Id::All, WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                Ok(status) => {
                    let is_task = status
                        .pid()
                        .is_some_and(|pid| self.control.find(pid.as_raw()).is_some());

                    // A foreign zombie stays waitable until its owner reaps it.
                    if !is_task {
                        thread::sleep(FOREIGN_CHILD_POLL);
                    }
                    return Ok(());
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(()),
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn park(&self) -> Result<()> {
        thread::sleep(FOREIGN_CHILD_POLL);
        Ok(())
    }

    fn collect(&self, registry: &Registry, index: u32, status: ExitStatus) -> ExitStatus {
        if let Some(entry) = self.control.entry(index) {
            entry.clear();
        }

        debug!(task = index, %status, "reaped task");
        registry.mark_reaped(index, status)
    }
}

/// True in a process forked for an entry task.
pub(crate) fn is_forked_task() -> bool {
    FORKED_TASK.load(Ordering::Acquire)
}

/// Ends a child process without running the parent's exit handlers.
pub(crate) fn exit_child(code: i32) -> ! {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();

    unsafe { libc::_exit(code) }
}

fn exit_status(status: WaitStatus) -> Option<ExitStatus> {
    match status {
        WaitStatus::Exited(_, code) => Some(ExitStatus::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => Some(ExitStatus::Signaled(signal)),
        _ => None,
    }
}

/// Sends `signal` to thread `tid` of process `pid`.
#[cfg(target_os = "linux")]
fn deliver(pid: i32, tid: i32, signal: Signal) -> Result<()> {
    let rc = unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, signal as libc::c_int) };
    if rc == 0 {
        return Ok(());
    }

    match Errno::last() {
        // The registered thread is gone; the process may still take it.
        Errno::ESRCH => Ok(kill(Pid::from_raw(pid), signal)?),
        errno => Err(errno.into()),
    }
}

#[cfg(not(target_os = "linux"))]
fn deliver(pid: i32, _tid: i32, signal: Signal) -> Result<()> {
    Ok(kill(Pid::from_raw(pid), signal)?)
}

fn memfd_required() -> Error {
    Error::PermissionDenied("spawning an image needs memfd-backed shared memory".into())
}

/// Arguments for `execve`, built before `fork` so the child never allocates.
struct PreparedExec {
    path: CString,
    argv: Vec<*const c_char>,
    envp: Vec<*const c_char>,
    // Owners of the strings `argv` and `envp` point into.
    _args: Vec<CString>,
    _vars: Vec<CString>,
}

impl PreparedExec {
    fn new(path: &Path, args: &[String], handoff: &Handoff) -> Result<Self> {
        let path = cstring(path.as_os_str().as_bytes().to_vec())?;

        let mut owned_args = vec![path.clone()];
        for arg in args {
            owned_args.push(cstring(arg.clone().into_bytes())?);
        }

        let mut owned_vars = Vec::new();
        for (name, value) in env::vars_os() {
            if name.as_bytes().starts_with(ENV_PREFIX) {
                continue;
            }

            let mut pair = name.into_vec();
            pair.push(b'=');
            pair.extend(value.into_vec());
            owned_vars.push(cstring(pair)?);
        }
        for (name, value) in handoff.to_env() {
            owned_vars.push(cstring(format!("{name}={value}").into_bytes())?);
        }

        Ok(Self {
            path,
            argv: null_terminated(&owned_args),
            envp: null_terminated(&owned_vars),
            _args: owned_args,
            _vars: owned_vars,
        })
    }
}

fn cstring(bytes: Vec<u8>) -> Result<CString> {
    CString::new(bytes).map_err(|_| {
        Error::InvalidArgument("image path, argument or environment contains a NUL byte".into())
    })
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|string| string.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}
