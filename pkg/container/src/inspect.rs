//! Running-container discovery.
//!
//! Nothing about a running container is persisted directly; everything is
//! re-derived: the cgroup `cpu/container/<id>` directory proves the
//! container exists, its `cgroup.procs` yields the leader pid, the
//! leader's `/proc/<pid>/exe` gives the command, and the overlay options
//! recorded in `/proc/mounts` lead back to the image hash.

use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

use pkg_constants::paths::{CGROUP_ROOT, IMAGES_DIR};
use pkg_image::ImageStore;

use crate::lifecycle::mount_path;

/// A running container, as reconstructed from cgroupfs and /proc.
#[derive(Debug, Clone)]
pub struct RunningContainer {
    pub id: String,
    /// `name:tag`, or empty when the mount table gave nothing back.
    pub image: String,
    /// The leader's command path, relative to the container root.
    pub command: String,
    /// 0 means "not actually running" and callers treat it as absent.
    pub pid: i32,
}

/// Every container with a live process, in cgroupfs enumeration order.
pub fn running_containers(store: &ImageStore) -> Result<Vec<RunningContainer>> {
    let base = Path::new(CGROUP_ROOT).join("cpu").join("container");
    let entries = match std::fs::read_dir(&base) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("unable to read {}", base.display()));
        }
    };

    let mut containers = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let id = entry.file_name().to_string_lossy().to_string();
        // A dying container can leave its cgroup dir behind briefly;
        // anything unreadable is treated as not running.
        match container_info(&id, store) {
            Ok(container) if container.pid > 0 => containers.push(container),
            Ok(_) => {}
            Err(e) => warn!("Skipping container {}: {}", id, e),
        }
    }
    Ok(containers)
}

/// Reconstruct one container's record. A container whose `cgroup.procs`
/// is empty comes back with `pid == 0`.
pub fn container_info(container_id: &str, store: &ImageStore) -> Result<RunningContainer> {
    let procs_path = Path::new(CGROUP_ROOT)
        .join("cpu")
        .join("container")
        .join(container_id)
        .join("cgroup.procs");
    let procs = std::fs::read_to_string(&procs_path)
        .with_context(|| format!("Unable to read {}", procs_path.display()))?;

    let Some(pid) = last_pid(&procs) else {
        return Ok(RunningContainer {
            id: container_id.to_string(),
            image: String::new(),
            command: String::new(),
            pid: 0,
        });
    };

    let exe = std::fs::read_link(format!("/proc/{}/exe", pid))
        .with_context(|| format!("Unable to resolve /proc/{}/exe", pid))?;

    // The leader was exec'd after a chroot into the (possibly
    // symlink-laden) mount path; strip the resolved prefix to recover the
    // in-container command.
    let real_mount = std::fs::canonicalize(mount_path(container_id))
        .with_context(|| "Unable to resolve container mount path")?;
    let exe = exe.to_string_lossy().into_owned();
    let command = exe
        .strip_prefix(&real_mount.display().to_string())
        .unwrap_or(&exe)
        .to_string();

    Ok(RunningContainer {
        id: container_id.to_string(),
        image: image_for_container(container_id, store)?,
        command,
        pid,
    })
}

/// Leader pid of a running container, or 0 if it is not running.
pub fn pid_for(container_id: &str, store: &ImageStore) -> Result<i32> {
    for container in running_containers(store)? {
        if container.id == container_id {
            return Ok(container.pid);
        }
    }
    Ok(0)
}

fn last_pid(procs: &str) -> Option<i32> {
    procs
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()?
        .parse()
        .ok()
}

/// `name:tag` of the image backing a container, recovered from the
/// overlay `lowerdir` recorded in the host mount table.
fn image_for_container(container_id: &str, store: &ImageStore) -> Result<String> {
    let mounts = std::fs::read_to_string("/proc/mounts")
        .with_context(|| "Unable to read /proc/mounts")?;

    for line in mounts.lines() {
        if !line.contains(container_id) {
            continue;
        }
        if let Some(hash) = image_hash_from_mount_line(line, IMAGES_DIR)
            && let Some((name, tag)) = store.name_tag_for(&hash)?
        {
            return Ok(format!("{}:{}", name, tag));
        }
    }
    Ok(String::new())
}

/// Pull the 12-char image hash out of an overlay mount line: the first
/// `lowerdir=` entry's first path component after the images directory.
fn image_hash_from_mount_line(line: &str, images_dir: &str) -> Option<String> {
    let option = line
        .split([' ', ','])
        .find(|part| part.starts_with("lowerdir="))?;
    let prefix = format!("lowerdir={}/", images_dir);
    let rest = option.strip_prefix(prefix.as_str())?;
    Some(rest.get(..12)?.to_string())
}

// ─── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_pid() {
        assert_eq!(last_pid(""), None);
        assert_eq!(last_pid("\n"), None);
        assert_eq!(last_pid("42\n"), Some(42));
        assert_eq!(last_pid("10\n11\n12\n"), Some(12));
    }

    #[test]
    fn test_image_hash_from_mount_line() {
        let line = "none /var/run/container/containers/cafebabe1234/fs/mnt overlay \
                    rw,relatime,lowerdir=/var/lib/container/images/0123456789ab/aaaa00000000/fs:\
                    /var/lib/container/images/0123456789ab/bbbb00000000/fs,\
                    upperdir=/var/run/container/containers/cafebabe1234/fs/upperdir,\
                    workdir=/var/run/container/containers/cafebabe1234/fs/workdir 0 0";
        assert_eq!(
            image_hash_from_mount_line(line, "/var/lib/container/images"),
            Some("0123456789ab".to_string())
        );
    }

    #[test]
    fn test_image_hash_ignores_foreign_mount_lines() {
        assert_eq!(
            image_hash_from_mount_line("proc /proc proc rw 0 0", "/var/lib/container/images"),
            None
        );
        // An overlay whose layers live somewhere else entirely.
        let line = "none /mnt overlay rw,lowerdir=/srv/other/layers/x,upperdir=/u,workdir=/w 0 0";
        assert_eq!(
            image_hash_from_mount_line(line, "/var/lib/container/images"),
            None
        );
    }
}
