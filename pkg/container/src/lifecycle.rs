//! The two-stage container launch.
//!
//! The parent does all host-side work (overlay mount, host veth), then
//! re-executes itself through `/proc/self/exe` three times: `setup-netns`
//! creates and persists the network namespace, `setup-veth` moves the
//! container end of the veth pair into it, and `child-mode`, forked with
//! `CLONE_NEWPID|NEWNS|NEWUTS|NEWIPC`, becomes the container: it joins
//! the persisted netns, applies cgroups, chroots into the overlay and
//! runs the user command.

use std::ffi::CString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use nix::mount::{MsFlags, mount, umount};
use nix::sched::CloneFlags;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{Pid, chdir, chroot, execv, sethostname};
use rand::Rng;
use tracing::{info, warn};

use pkg_constants::paths::{CONTAINERS_DIR, RESOLV_CONF_CANDIDATES};
use pkg_image::ImageStore;

use crate::cgroup::Cgroups;

const SELF_EXE: &str = "/proc/self/exe";

/// Resource limits for `run`/`child-mode`; `-1` means unset.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub memory_mib: i64,
    pub swap_mib: i64,
    pub pids_max: i64,
    pub cpus: f64,
}

pub struct RunOptions {
    /// `name[:tag]` image reference.
    pub image: String,
    pub limits: Limits,
    pub command: Vec<String>,
}

pub struct ChildOptions {
    pub container_id: String,
    pub image_hash: String,
    pub limits: Limits,
    pub command: Vec<String>,
}

/// 12 hex digits from 48 random bits.
pub fn create_container_id() -> String {
    let bytes: [u8; 6] = rand::rng().random();
    hex::encode(bytes)
}

fn container_root(container_id: &str) -> PathBuf {
    Path::new(CONTAINERS_DIR).join(container_id)
}

/// The overlay mount point a container's processes are chrooted into.
pub fn mount_path(container_id: &str) -> PathBuf {
    container_root(container_id).join("fs").join("mnt")
}

// ─── Stage 0: parent ──────────────────────────────────────────────────────

pub async fn run(store: &ImageStore, opts: RunOptions) -> Result<()> {
    if !pkg_network::bridge_is_up().await? {
        info!("Bringing up the container bridge...");
        pkg_network::create_bridge().await?;
    }

    let container_id = create_container_id();
    info!("New container ID: {}", container_id);

    let (name, tag) = pkg_image::split_image_ref(&opts.image);
    let image_hash = store.pull_if_needed(name, tag).await?;
    info!("Image to overlay mount: {}", image_hash);

    let mut teardown = Teardown::new();

    create_container_directories(&container_id)?;
    {
        let id = container_id.clone();
        teardown.push("remove container directory", move || {
            std::fs::remove_dir_all(container_root(&id))
                .with_context(|| "unable to remove container directory")
        });
    }
    {
        // Armed before child C creates the dirs; removal tolerates their
        // absence if we never get that far.
        let id = container_id.clone();
        teardown.push("remove cgroups", move || Cgroups::new().remove(&id));
    }

    mount_overlay(store, &container_id, &image_hash)?;
    {
        let id = container_id.clone();
        teardown.push("unmount container fs", move || {
            umount(mount_path(&id).as_path())
                .map_err(|e| anyhow!("Unable to unmount container fs: {}", e))
        });
    }

    pkg_network::setup_host_veth(&container_id).await?;

    reexec_stage("setup-netns", &container_id).await?;
    {
        let id = container_id.clone();
        teardown.push("release network namespace", move || {
            pkg_network::teardown(&id)
        });
    }

    reexec_stage("setup-veth", &container_id).await?;

    let child = spawn_container_child(&container_id, &image_hash, &opts)?;
    let status = waitpid(child, None)
        .map_err(|e| anyhow!("Unable to wait for container process: {}", e))?;
    info!("Container {} done.", container_id);

    teardown.run()?;

    // A non-zero child C means its setup failed; the user command's own
    // exit status is not propagated.
    if let WaitStatus::Exited(_, code) = status
        && code != 0
    {
        bail!("container process exited with status {}", code);
    }
    Ok(())
}

fn create_container_directories(container_id: &str) -> Result<()> {
    let fs_home = container_root(container_id).join("fs");
    for dir in [
        fs_home.join("mnt"),
        fs_home.join("upperdir"),
        fs_home.join("workdir"),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Unable to create required directory {}", dir.display()))?;
    }
    Ok(())
}

/// Colon-joined `lowerdir` entries: later manifest layers stack on top,
/// so the list is the manifest order reversed.
fn overlay_lower_dirs(store: &ImageStore, image_hash: &str, layers: &[String]) -> Vec<String> {
    let mut lower: Vec<String> = Vec::new();
    for layer in layers {
        lower.insert(
            0,
            store
                .layer_fs_dir(image_hash, layer)
                .display()
                .to_string(),
        );
    }
    lower
}

fn mount_overlay(store: &ImageStore, container_id: &str, image_hash: &str) -> Result<()> {
    let manifest = store.manifest(image_hash)?;
    let lower = overlay_lower_dirs(store, image_hash, &manifest.layers);

    let fs_home = container_root(container_id).join("fs");
    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.join(":"),
        fs_home.join("upperdir").display(),
        fs_home.join("workdir").display(),
    );

    mount(
        Some("none"),
        fs_home.join("mnt").as_path(),
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .map_err(|e| anyhow!("Overlay mount failed: {}", e))
}

/// Run one flat re-exec stage (`setup-netns` / `setup-veth`) and wait.
async fn reexec_stage(stage: &str, container_id: &str) -> Result<()> {
    let status = tokio::process::Command::new(SELF_EXE)
        .arg(stage)
        .arg(container_id)
        .status()
        .await
        .map_err(|e| anyhow!("Unable to re-exec {} stage: {}", stage, e))?;
    if !status.success() {
        bail!("{} stage failed for container {}", stage, container_id);
    }
    Ok(())
}

/// Fork child C with the namespace clone flags and exec ourselves in
/// `child-mode`. The kernel puts the child in its new PID/mount/UTS/IPC
/// namespaces at clone time; the network namespace is joined explicitly
/// inside the child.
fn spawn_container_child(container_id: &str, image_hash: &str, opts: &RunOptions) -> Result<Pid> {
    let mut argv: Vec<String> = vec![
        SELF_EXE.to_string(),
        "child-mode".to_string(),
        format!("--memory={}", opts.limits.memory_mib),
        format!("--swap={}", opts.limits.swap_mib),
        format!("--pids={}", opts.limits.pids_max),
        format!("--cpus={}", opts.limits.cpus),
        format!("--image={}", image_hash),
        container_id.to_string(),
    ];
    argv.extend(opts.command.iter().cloned());

    let exe = CString::new(SELF_EXE)?;
    let args: Vec<CString> = argv
        .into_iter()
        .map(CString::new)
        .collect::<Result<_, _>>()?;

    const CHILD_STACK_SIZE: usize = 1024 * 1024;
    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let flags = CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC;

    let child = Box::new(|| -> isize {
        // Only reached if the exec itself fails.
        let _ = execv(&exe, &args);
        127
    });

    unsafe { nix::sched::clone(child, &mut stack, flags, Some(Signal::SIGCHLD as i32)) }
        .map_err(|e| anyhow!("Unable to clone container process: {}", e))
}

// ─── Stage 1: child C ─────────────────────────────────────────────────────

pub async fn child_stage(store: &ImageStore, opts: ChildOptions) -> Result<()> {
    let container_id = &opts.container_id;

    sethostname(container_id).map_err(|e| anyhow!("Unable to set hostname: {}", e))?;
    pkg_network::join_namespace(container_id)
        .with_context(|| "Unable to join container network namespace")?;

    let cgroups = Cgroups::new();
    cgroups.create(container_id, true)?;
    cgroups.configure(
        container_id,
        opts.limits.memory_mib,
        opts.limits.swap_mib,
        opts.limits.pids_max,
        opts.limits.cpus,
    )?;

    copy_resolv_conf(container_id);

    // Everything below the chroot can no longer see the image store.
    let config = store.config(&opts.image_hash)?;

    let mnt = mount_path(container_id);
    chroot(mnt.as_path()).map_err(|e| anyhow!("Unable to chroot: {}", e))?;
    chdir("/").map_err(|e| anyhow!("Unable to change directory: {}", e))?;

    mount_pseudo_filesystems()?;
    pkg_network::setup_loopback().await?;

    match run_user_command(&opts.command, &config.config.env) {
        Ok(status) if !status.success() => {
            info!("Command {} exited: {}", opts.command[0], status);
        }
        Ok(_) => {}
        Err(e) => warn!("{}", e),
    }

    unmount_pseudo_filesystems()
}

/// Best-effort DNS: copy the first existing host resolv.conf candidate
/// into the container; none existing means no DNS, which is fine.
fn copy_resolv_conf(container_id: &str) {
    for candidate in RESOLV_CONF_CANDIDATES {
        if !Path::new(candidate).exists() {
            continue;
        }
        let dest = mount_path(container_id).join("etc").join("resolv.conf");
        if let Err(e) = std::fs::copy(candidate, &dest) {
            warn!("Unable to copy {} to {}: {}", candidate, dest.display(), e);
        }
        return;
    }
}

fn mount_pseudo_filesystems() -> Result<()> {
    ensure_dirs(&["/proc", "/sys", "/tmp", "/dev"])?;
    mount_fs("proc", "/proc", "proc")?;
    mount_fs("tmpfs", "/tmp", "tmpfs")?;
    mount_fs("tmpfs", "/dev", "tmpfs")?;
    ensure_dirs(&["/dev/pts"])?;
    mount_fs("devpts", "/dev/pts", "devpts")?;
    mount_fs("sysfs", "/sys", "sysfs")?;
    Ok(())
}

fn unmount_pseudo_filesystems() -> Result<()> {
    for target in ["/dev/pts", "/dev", "/sys", "/proc", "/tmp"] {
        umount(target).map_err(|e| anyhow!("Unable to unmount {}: {}", target, e))?;
    }
    Ok(())
}

fn mount_fs(source: &str, target: &str, fstype: &str) -> Result<()> {
    mount(
        Some(source),
        target,
        Some(fstype),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|e| anyhow!("Unable to mount {} on {}: {}", fstype, target, e))
}

fn ensure_dirs(dirs: &[&str]) -> Result<()> {
    for dir in dirs {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Unable to create directory {}", dir))?;
    }
    Ok(())
}

/// Run the user's command with the image environment, fully replacing the
/// inherited one. Stdio stays wired to the caller's.
pub(crate) fn run_user_command(
    command: &[String],
    env: &[String],
) -> Result<std::process::ExitStatus> {
    let mut cmd = std::process::Command::new(&command[0]);
    cmd.args(&command[1..]).env_clear();
    for pair in env {
        if let Some((key, value)) = pair.split_once('=') {
            cmd.env(key, value);
        }
    }
    cmd.status()
        .map_err(|e| anyhow!("Unable to run {}: {}", command[0], e))
}

// ─── Teardown ─────────────────────────────────────────────────────────────

/// Reverse-order cleanup stack. Steps are armed as setup commits, so a
/// mid-flight failure unwinds exactly what was built; the success path
/// runs the same steps via [`Teardown::run`].
struct Teardown {
    steps: Vec<(&'static str, Box<dyn FnOnce() -> Result<()>>)>,
}

impl Teardown {
    fn new() -> Self {
        Self { steps: Vec::new() }
    }

    fn push<F>(&mut self, label: &'static str, step: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.steps.push((label, Box::new(step)));
    }

    fn run(mut self) -> Result<()> {
        let mut first_err = None;
        for (label, step) in self.steps.drain(..).rev() {
            if let Err(e) = step() {
                warn!("Teardown step '{}' failed: {}", label, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        for (label, step) in self.steps.drain(..).rev() {
            if let Err(e) = step() {
                warn!("Teardown step '{}' failed: {}", label, e);
            }
        }
    }
}

// ─── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_container_id_shape() {
        for _ in 0..16 {
            let id = create_container_id();
            assert_eq!(id.len(), 12);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_container_ids_are_unique() {
        let a = create_container_id();
        let b = create_container_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_lowerdir_reverses_manifest_order() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ImageStore::at(tmp.path());
        let layers = vec![
            "aaaa00000000ffff".to_string(),
            "bbbb00000000ffff".to_string(),
            "cccc00000000ffff".to_string(),
        ];

        let lower = overlay_lower_dirs(&store, "0123456789ab", &layers);
        let images = tmp.path().join("images").join("0123456789ab");
        assert_eq!(
            lower,
            vec![
                images.join("cccc00000000").join("fs").display().to_string(),
                images.join("bbbb00000000").join("fs").display().to_string(),
                images.join("aaaa00000000").join("fs").display().to_string(),
            ]
        );
    }

    #[test]
    fn test_teardown_runs_in_reverse_order() {
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut teardown = Teardown::new();
        for step in ["first", "second", "third"] {
            let order = Rc::clone(&order);
            teardown.push("step", move || {
                order.borrow_mut().push(step);
                Ok(())
            });
        }
        teardown.run().unwrap();
        assert_eq!(*order.borrow(), vec!["third", "second", "first"]);
    }

    #[test]
    fn test_teardown_keeps_going_past_failures() {
        let ran = Rc::new(Cell::new(false));
        let mut teardown = Teardown::new();
        {
            let ran = Rc::clone(&ran);
            teardown.push("early", move || {
                ran.set(true);
                Ok(())
            });
        }
        teardown.push("failing", || Err(anyhow!("boom")));

        // The failing step runs first (reverse order) but the earlier
        // one still executes, and the error is reported.
        assert!(teardown.run().is_err());
        assert!(ran.get());
    }

    #[test]
    fn test_teardown_drop_unwinds_armed_steps() {
        let ran = Rc::new(Cell::new(0));
        {
            let mut teardown = Teardown::new();
            for _ in 0..3 {
                let ran = Rc::clone(&ran);
                teardown.push("step", move || {
                    ran.set(ran.get() + 1);
                    Ok(())
                });
            }
            // Dropped without run(): mid-flight failure path.
        }
        assert_eq!(ran.get(), 3);
    }
}
