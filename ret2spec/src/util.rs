use std::io::Read;
use nix::sched::{ CpuSet, sched_setaffinity, sched_yield };
use nix::unistd::{ Pid, SysconfVar, sysconf };

use crate::error::{ LeakError, Result };

/// Utilities for controlling the state of the current process (and for
/// inspecting the machine it runs on).
pub struct RsbEnv;
impl RsbEnv {
    const ISOLATED_PATH: &'static str =
        "/sys/devices/system/cpu/isolated";
    const SMT_PATH: &'static str =
        "/sys/devices/system/cpu/smt/control";
    const VULN_PATH: &'static str =
        "/sys/devices/system/cpu/vulnerabilities";

    fn read_trimmed(path: &str) -> std::result::Result<String, std::io::ErrorKind> {
        let mut f = std::fs::File::open(path).map_err(|e| e.kind())?;
        let mut res = String::new();
        f.read_to_string(&mut res).map_err(|e| e.kind())?;
        Ok(res.trim().to_string())
    }

    /// Return a string describing the set of isolated cores.
    pub fn sysfs_isolated() -> std::result::Result<String, std::io::ErrorKind> {
        Self::read_trimmed(Self::ISOLATED_PATH).map(|s| match s.as_str() {
            "" => "disabled".to_string(),
            _ => s,
        })
    }

    /// Returns true if SMT is enabled.
    ///
    /// A sibling thread shares the RSB on some parts, which adds noise.
    pub fn sysfs_smt_enabled() -> std::result::Result<bool, std::io::ErrorKind> {
        let res = Self::read_trimmed(Self::SMT_PATH)?;
        Ok(matches!(res.as_str(), "on" | "forceon"))
    }

    /// Return the kernel's description of a particular vulnerability
    /// (for instance, `spectre_v2` or `retbleed`).
    ///
    /// Mitigations that stuff the RSB on context switches will defeat the
    /// cross-process variant.
    pub fn sysfs_vulnerability(name: &str)
        -> std::result::Result<String, std::io::ErrorKind>
    {
        Self::read_trimmed(&format!("{}/{}", Self::VULN_PATH, name))
    }

    /// Return the number of online cores.
    pub fn online_cores() -> Option<usize> {
        sysconf(SysconfVar::_NPROCESSORS_ONLN).ok().flatten()
            .map(|n| n as usize)
    }
}

impl RsbEnv {
    /// Pin to a particular core.
    pub fn pin_to_core(core: usize) -> Result<()> {
        let this_pid = Pid::from_raw(0);
        let mut cpuset = CpuSet::new();
        cpuset.set(core).map_err(|errno| LeakError::Setup { core, errno })?;
        sched_setaffinity(this_pid, &cpuset)
            .map_err(|errno| LeakError::Setup { core, errno })?;
        log::info!("pinned to core {}", core);
        Ok(())
    }

    /// Give up the CPU.
    ///
    /// This can't meaningfully fail on Linux; if it somehow does, we just
    /// keep running.
    #[inline(always)]
    pub fn yield_cpu() {
        let _ = sched_yield();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pin_to_bogus_core() {
        match RsbEnv::pin_to_core(CpuSet::count() + 1) {
            Err(LeakError::Setup { core, .. }) => {
                assert_eq!(core, CpuSet::count() + 1);
            },
            _ => panic!("expected a setup failure"),
        }
    }

    #[test]
    fn online_cores() {
        assert!(RsbEnv::online_cores().unwrap_or(1) >= 1);
    }
}
