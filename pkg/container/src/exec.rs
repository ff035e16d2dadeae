//! Exec into a running container.
//!
//! The caller joins the leader's namespaces one `setns` at a time, admits
//! itself into the container's cgroups, chroots into the overlay mount
//! and runs the requested command with the image environment. Everything
//! that reads host state (catalog, /proc, mount table) happens before the
//! first `setns`, while this process can still see it.

use anyhow::{Context, Result, anyhow, bail};
use nix::fcntl::{OFlag, open};
use nix::sched::{CloneFlags, setns};
use nix::sys::stat::Mode;
use nix::unistd::{chdir, chroot};

use pkg_image::ImageStore;

use crate::cgroup::Cgroups;
use crate::inspect;
use crate::lifecycle::{mount_path, run_user_command};

/// The leader's namespaces joined, in order.
const NAMESPACES: [(&str, CloneFlags); 5] = [
    ("ipc", CloneFlags::CLONE_NEWIPC),
    ("mnt", CloneFlags::CLONE_NEWNS),
    ("net", CloneFlags::CLONE_NEWNET),
    ("pid", CloneFlags::CLONE_NEWPID),
    ("uts", CloneFlags::CLONE_NEWUTS),
];

pub fn exec_in_container(container_id: &str, command: &[String], store: &ImageStore) -> Result<()> {
    let container = inspect::container_info(container_id, store)
        .with_context(|| format!("No such container: {}", container_id))?;
    if container.pid == 0 {
        bail!("No such container: {}", container_id);
    }

    // Host-side lookups first: after setns/chroot the catalog is gone.
    let (name, tag) = pkg_image::split_image_ref(&container.image);
    let Some(image_hash) = store.exists_by_tag(name, tag)? else {
        bail!("Unable to get image details for container {}", container_id);
    };
    let config = store.config(&image_hash)?;

    let mut ns_fds = Vec::with_capacity(NAMESPACES.len());
    for (name, flags) in NAMESPACES {
        let path = format!("/proc/{}/ns/{}", container.pid, name);
        let fd = open(path.as_str(), OFlag::O_RDONLY, Mode::empty())
            .map_err(|e| anyhow!("Unable to open namespace file {}: {}", path, e))?;
        ns_fds.push((fd, flags, name));
    }
    for (fd, flags, name) in &ns_fds {
        setns(fd, *flags).map_err(|e| anyhow!("Unable to join {} namespace: {}", name, e))?;
    }

    // Join the container's cgroups; the dirs already exist.
    Cgroups::new().create(container_id, false)?;

    let mnt = mount_path(container_id);
    chroot(mnt.as_path()).map_err(|e| anyhow!("Unable to chroot: {}", e))?;
    chdir("/").map_err(|e| anyhow!("Unable to change directory: {}", e))?;

    let status = run_user_command(command, &config.config.env)
        .with_context(|| "Unable to exec command in container")?;
    if !status.success() {
        bail!("command exited: {}", status);
    }
    Ok(())
}
