//! Filesystem path constants.
//!
//! These paths are contractual: the image store, the lifecycle engine and
//! the inspector all derive their layouts from them, and `ps` re-discovers
//! running containers by parsing them back out of cgroupfs and /proc/mounts.

// ─── Image store ──────────────────────────────────────────────────────────

/// Root of all persistent image state.
pub const LIB_DIR: &str = "/var/lib/container";

/// Unpacked image layers and manifest/config copies, one dir per hash.
pub const IMAGES_DIR: &str = "/var/lib/container/images";

/// Staging area for in-flight pulls; deleted once a pull succeeds.
pub const TMP_DIR: &str = "/var/lib/container/tmp";

// ─── Runtime state ────────────────────────────────────────────────────────

/// Per-container overlay directories: `<id>/fs/{mnt,upperdir,workdir}`.
pub const CONTAINERS_DIR: &str = "/var/run/container/containers";

/// Bind-mounted network namespace handles, one file per container id.
pub const NETNS_DIR: &str = "/var/run/container/net-ns";

/// cgroup-v1 hierarchy root.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

// ─── DNS ──────────────────────────────────────────────────────────────────

/// Host resolv.conf candidates, tried in order; the first hit is copied
/// into the container. None existing means the container runs without DNS.
pub const RESOLV_CONF_CANDIDATES: [&str; 3] = [
    "/var/run/systemd/resolve/resolv.conf",
    "/etc/containerresolv.conf",
    "/etc/resolv.conf",
];
