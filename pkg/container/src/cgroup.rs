//! cgroup-v1 resource caps.
//!
//! Each container owns one directory per controller:
//! `<root>/{memory,cpu,pids}/container/<id>`. A limit of `-1` (or `0`)
//! means unset; swap distinguishes `-1` (unset, the group may still swap)
//! from `0` (no swap beyond RAM).

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::warn;

const SUBSYSTEMS: [&str; 3] = ["memory", "cpu", "pids"];

/// CFS period used for CPU caps; the quota scales against it.
const CFS_PERIOD_US: i64 = 1_000_000;

pub struct Cgroups {
    root: PathBuf,
}

impl Cgroups {
    /// Controller rooted at the real `/sys/fs/cgroup` hierarchy.
    pub fn new() -> Self {
        Self::at(Path::new(pkg_constants::paths::CGROUP_ROOT))
    }

    /// Controller rooted at an arbitrary directory.
    pub fn at(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn subsystem_dir(&self, subsystem: &str, container_id: &str) -> PathBuf {
        self.root
            .join(subsystem)
            .join("container")
            .join(container_id)
    }

    fn dirs(&self, container_id: &str) -> [PathBuf; 3] {
        SUBSYSTEMS.map(|s| self.subsystem_dir(s, container_id))
    }

    /// Create the per-container directories (optionally) and admit the
    /// current process into each of them.
    pub fn create(&self, container_id: &str, create_dirs: bool) -> Result<()> {
        let dirs = self.dirs(container_id);
        if create_dirs {
            for dir in &dirs {
                std::fs::create_dir_all(dir).with_context(|| {
                    format!("Unable to create cgroup directory {}", dir.display())
                })?;
            }
        }

        let pid = std::process::id().to_string();
        for dir in &dirs {
            // Admission can fail on the outer re-exec path; the container
            // process re-admits itself before running user code.
            if let Err(e) = std::fs::write(dir.join("cgroup.procs"), &pid) {
                warn!("Unable to write to {}/cgroup.procs: {}", dir.display(), e);
            }
        }
        Ok(())
    }

    /// Apply the requested limits; unset values leave their controller
    /// files untouched.
    pub fn configure(
        &self,
        container_id: &str,
        memory_mib: i64,
        swap_mib: i64,
        pids_max: i64,
        cpus: f64,
    ) -> Result<()> {
        if memory_mib > 0 {
            self.set_memory_limit(container_id, memory_mib, swap_mib)?;
        }
        if cpus > 0.0 {
            self.set_cpu_limit(container_id, cpus)?;
        }
        if pids_max > 0 {
            self.set_pids_limit(container_id, pids_max)?;
        }
        Ok(())
    }

    fn set_memory_limit(&self, container_id: &str, memory_mib: i64, swap_mib: i64) -> Result<()> {
        let dir = self.subsystem_dir("memory", container_id);
        write_limit(
            &dir.join("memory.limit_in_bytes"),
            memory_mib * 1024 * 1024,
        )?;

        // memory.memsw.limit_in_bytes caps RAM and swap together; left
        // untouched, the group keeps consuming swap past the RAM cap.
        if swap_mib >= 0 {
            write_limit(
                &dir.join("memory.memsw.limit_in_bytes"),
                (memory_mib + swap_mib) * 1024 * 1024,
            )?;
        }
        Ok(())
    }

    fn set_cpu_limit(&self, container_id: &str, cpus: f64) -> Result<()> {
        let host_cpus = num_cpus::get();
        if cpus > host_cpus as f64 {
            warn!(
                "Ignoring attempt to set CPU quota to {} with only {} CPUs available",
                cpus, host_cpus
            );
            return Ok(());
        }
        let dir = self.subsystem_dir("cpu", container_id);
        write_limit(&dir.join("cpu.cfs_period_us"), CFS_PERIOD_US)?;
        write_limit(
            &dir.join("cpu.cfs_quota_us"),
            (CFS_PERIOD_US as f64 * cpus).round() as i64,
        )?;
        Ok(())
    }

    fn set_pids_limit(&self, container_id: &str, pids_max: i64) -> Result<()> {
        write_limit(
            &self.subsystem_dir("pids", container_id).join("pids.max"),
            pids_max,
        )
    }

    /// Remove all three directories. Missing directories are tolerated so
    /// teardown after a partial setup still works; any other failure
    /// propagates, since it usually means processes are still inside.
    pub fn remove(&self, container_id: &str) -> Result<()> {
        for dir in self.dirs(container_id) {
            match std::fs::remove_dir(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(anyhow!("Unable to remove cgroup dir {}: {}", dir.display(), e));
                }
            }
        }
        Ok(())
    }
}

impl Default for Cgroups {
    fn default() -> Self {
        Self::new()
    }
}

fn write_limit(path: &Path, value: i64) -> Result<()> {
    std::fs::write(path, value.to_string())
        .with_context(|| format!("Unable to write {}", path.display()))
}

// ─── Tests ─────────────────────────────────────────────────────
