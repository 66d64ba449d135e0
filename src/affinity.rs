//! CPU placement of spawned tasks.
//!
//! [`apply`] is a bare syscall wrapper with no allocation or logging, so it is
//! safe to call between `fork` and `exec`.

use crate::error::{Error, Result};
use crate::task::CpuCore;

/// Checks a requested core before any task is realized.
#[cfg(target_os = "linux")]
pub(crate) fn validate(cpu: CpuCore) -> Result<()> {
    match cpu {
        CpuCore::Core(core) if core >= libc::CPU_SETSIZE as usize => Err(Error::InvalidArgument(
            format!("cpu core {core} is beyond the supported set"),
        )),
        _ => Ok(()),
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn validate(_cpu: CpuCore) -> Result<()> {
    Ok(())
}

/// Pins the calling thread to the requested core.
#[cfg(target_os = "linux")]
pub(crate) fn apply(cpu: CpuCore) -> Result<()> {
    let CpuCore::Core(core) = cpu else {
        return Ok(());
    };

    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core, &mut set);

        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(nix::Error::last().into());
        }
    }

    Ok(())
}

/// Placement is advisory; platforms without `sched_setaffinity` leave tasks
/// where the scheduler puts them.
#[cfg(not(target_os = "linux"))]
pub(crate) fn apply(_cpu: CpuCore) -> Result<()> {
    Ok(())
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn rejects_cores_beyond_the_cpu_set() {
        assert!(validate(CpuCore::AsIs).is_ok());
        assert!(validate(CpuCore::Core(0)).is_ok());
        assert!(matches!(
            validate(CpuCore::Core(libc::CPU_SETSIZE as usize)),
            Err(Error::InvalidArgument(_))
        ));
    }
}
