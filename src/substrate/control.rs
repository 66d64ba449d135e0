//! Control block shared by every process of an instance.
//!
//! A small memfd-backed table mapped by the root before any child exists and
//! inherited by forked and exec'd children. It records where each task lives
//! (`pid` for waiting, `tid` for thread-directed delivery) so any task can
//! route a signal to any other without asking the root.
//!
//! ```text
//! ┌──────────── 64 bytes ────────────┬────────┬────────┬─────┐
//! │ magic │ ntasks │ root pid │ tid  │ task 0 │ task 1 │ ... │
//! └──────────────────────────────────┴────────┴────────┴─────┘
//!                                       pid,tid  pid,tid
//! ```

use crate::error::{Error, Result};
use crate::memory::SharedMapping;

use nix::unistd::getpid;
use std::mem::size_of;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

const MAGIC: u32 = 0x746e_646d;
const HEADER_LEN: usize = 64;

#[repr(C)]
struct Header {
    magic: AtomicU32,
    ntasks: AtomicU32,
    root_pid: AtomicI32,
    root_tid: AtomicI32,
}

/// Location of one task. Zero means "not spawned" or "already reaped".
#[repr(C)]
pub(crate) struct TaskEntry {
    pid: AtomicI32,
    tid: AtomicI32,
}

impl TaskEntry {
    /// Called by the task itself once it runs.
    pub(crate) fn register(&self, pid: i32, tid: i32) {
        self.pid.store(pid, Ordering::Release);
        self.tid.store(tid, Ordering::Release);
    }

    /// Called by the spawner after `fork`. Until the child registers its own
    /// thread, signals go to its main thread, whose tid equals its pid.
    pub(crate) fn register_spawned(&self, pid: i32) {
        self.pid.store(pid, Ordering::Release);
        let _ = self
            .tid
            .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn clear(&self) {
        self.tid.store(0, Ordering::Release);
        self.pid.store(0, Ordering::Release);
    }

    pub(crate) fn pid(&self) -> i32 {
        self.pid.load(Ordering::Acquire)
    }

    /// `(pid, tid)` to deliver to, if the task is live.
    pub(crate) fn target(&self) -> Option<(i32, i32)> {
        let pid = self.pid();
        if pid == 0 {
            return None;
        }

        let tid = match self.tid.load(Ordering::Acquire) {
            0 => pid,
            tid => tid,
        };

        Some((pid, tid))
    }
}

pub(crate) struct ControlBlock {
    mapping: SharedMapping,
    ntasks: usize,
}

impl ControlBlock {
    /// Maps a fresh block with the calling thread registered as the root.
    pub(crate) fn create(ntasks: usize) -> Result<Self> {
        let mapping = SharedMapping::create("tandem-control", Self::len_for(ntasks))?;
        let block = Self { mapping, ntasks };

        let header = block.header();
        header.ntasks.store(ntasks as u32, Ordering::Release);
        header.root_pid.store(getpid().as_raw(), Ordering::Release);
        header.root_tid.store(gettid(), Ordering::Release);
        header.magic.store(MAGIC, Ordering::Release);

        Ok(block)
    }

    /// Maps a block inherited across `exec`.
    ///
    /// # Safety
    /// `raw` must be an inherited descriptor owned by nobody else in this
    /// process.
    pub(crate) unsafe fn attach(raw: RawFd, len: usize, ntasks: usize) -> Result<Self> {
        if len < Self::len_for(ntasks) {
            return Err(Error::InvalidArgument(format!(
                "control block of {len} bytes cannot describe {ntasks} tasks"
            )));
        }

        let mapping = unsafe { SharedMapping::attach(raw, len)? };
        let block = Self { mapping, ntasks };

        let header = block.header();
        if header.magic.load(Ordering::Acquire) != MAGIC
            || header.ntasks.load(Ordering::Acquire) as usize != ntasks
        {
            return Err(Error::InvalidArgument(
                "inherited descriptor does not hold a matching control block".into(),
            ));
        }

        Ok(block)
    }

    fn len_for(ntasks: usize) -> usize {
        HEADER_LEN + ntasks * size_of::<TaskEntry>()
    }

    fn header(&self) -> &Header {
        // The mapping is page-aligned and at least HEADER_LEN bytes long.
        unsafe { &*self.mapping.as_ptr().cast::<Header>() }
    }

    pub(crate) fn entry(&self, index: u32) -> Option<&TaskEntry> {
        if index as usize >= self.ntasks {
            return None;
        }

        unsafe {
            let entries = self.mapping.as_ptr().add(HEADER_LEN).cast::<TaskEntry>();
            Some(&*entries.add(index as usize))
        }
    }

    /// `(pid, tid)` of the root task.
    pub(crate) fn root(&self) -> (i32, i32) {
        let header = self.header();
        (
            header.root_pid.load(Ordering::Acquire),
            header.root_tid.load(Ordering::Acquire),
        )
    }

    /// Index of the live task running as process `pid`.
    pub(crate) fn find(&self, pid: i32) -> Option<u32> {
        (0..self.ntasks as u32).find(|index| {
            self.entry(*index)
                .is_some_and(|entry| pid != 0 && entry.pid() == pid)
        })
    }

    pub(crate) fn mapping(&self) -> &SharedMapping {
        &self.mapping
    }
}

/// Kernel id of the calling thread.
#[cfg(target_os = "linux")]
pub(crate) fn gettid() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// Without thread-directed delivery the process id stands in for the thread.
#[cfg(not(target_os = "linux"))]
pub(crate) fn gettid() -> i32 {
    getpid().as_raw()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_the_root_and_finds_children() {
        let block = ControlBlock::create(3).unwrap();

        let (pid, tid) = block.root();
        assert_eq!(pid, getpid().as_raw());
        assert_eq!(tid, gettid());

        block.entry(1).unwrap().register_spawned(4242);
        assert_eq!(block.find(4242), Some(1));
        assert_eq!(block.entry(1).unwrap().target(), Some((4242, 4242)));

        block.entry(1).unwrap().clear();
        assert_eq!(block.find(4242), None);
        assert!(block.entry(3).is_none());
    }

    #[test]
    fn self_registration_wins_over_the_spawner() {
        let block = ControlBlock::create(1).unwrap();
        let entry = block.entry(0).unwrap();

        entry.register(4242, 4243);
        entry.register_spawned(4242);

        assert_eq!(entry.target(), Some((4242, 4243)));
    }
}
