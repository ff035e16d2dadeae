use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use futures_util::TryStreamExt;
use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkInfo};
use nix::fcntl::{OFlag, open};
use nix::mount::{MsFlags, mount, umount};
use nix::sched::{CloneFlags, setns, unshare};
use nix::sys::stat::Mode;
use rand::Rng;
use tracing::{info, warn};

use pkg_constants::network::{BRIDGE_ADDR, BRIDGE_NAME, MAC_PREFIX, SUBNET_OCTETS, SUBNET_PREFIX};
use pkg_constants::paths::NETNS_DIR;

/// One netlink connection per operation; the driver task runs on the
/// current-thread runtime and dies with the process.
fn connect() -> Result<rtnetlink::Handle> {
    let (conn, handle, _) = rtnetlink::new_connection()?;
    tokio::spawn(conn);
    Ok(handle)
}

async fn link_index(handle: &rtnetlink::Handle, name: &str) -> Result<u32> {
    let link = handle
        .link()
        .get()
        .match_name(name.to_string())
        .execute()
        .try_next()
        .await
        .map_err(|e| anyhow!("Unable to fetch link {}: {}", name, e))?
        .ok_or_else(|| anyhow!("link {} not found", name))?;
    Ok(link.header.index)
}

/// `EEXIST` from the kernel, which idempotent setup paths treat as fine.
fn is_exist(err: &rtnetlink::Error) -> bool {
    matches!(err, rtnetlink::Error::NetlinkError(msg) if msg.raw_code() == -libc::EEXIST)
}

/// `open(2)` returning an owned descriptor, so it closes on drop.
fn open_fd(path: &Path, flags: OFlag, mode: Mode) -> nix::Result<OwnedFd> {
    open(path, flags, mode)
}

// ─── Host bridge ──────────────────────────────────────────────────────────

/// True iff a link of type "bridge" named `container0` exists.
pub async fn bridge_is_up() -> Result<bool> {
    let handle = connect()?;
    let mut links = handle.link().get().execute();
    while let Some(link) = links.try_next().await? {
        let mut name_matches = false;
        let mut is_bridge = false;
        for attr in &link.attributes {
            match attr {
                LinkAttribute::IfName(name) => name_matches = name == BRIDGE_NAME,
                LinkAttribute::LinkInfo(infos) => {
                    is_bridge = infos
                        .iter()
                        .any(|info| matches!(info, LinkInfo::Kind(InfoKind::Bridge)));
                }
                _ => {}
            }
        }
        if name_matches && is_bridge {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Create `container0` and give it the gateway address. Idempotent: an
/// already-existing bridge or address is success.
pub async fn create_bridge() -> Result<()> {
    let handle = connect()?;

    if let Err(e) = handle
        .link()
        .add(rtnetlink::LinkBridge::new(BRIDGE_NAME).build())
        .execute()
        .await
    {
        if !is_exist(&e) {
            return Err(anyhow!("Unable to create {} bridge: {}", BRIDGE_NAME, e));
        }
    }

    let index = link_index(&handle, BRIDGE_NAME).await?;
    let address: IpAddr = BRIDGE_ADDR.parse()?;
    if let Err(e) = handle
        .address()
        .add(index, address, SUBNET_PREFIX)
        .execute()
        .await
    {
        if !is_exist(&e) {
            return Err(anyhow!("Unable to address {} bridge: {}", BRIDGE_NAME, e));
        }
    }
    handle
        .link()
        .set(rtnetlink::LinkUnspec::new_with_index(index).up().build())
        .execute()
        .await?;
    Ok(())
}

// ─── Per-container veth pair ──────────────────────────────────────────────

fn veth_host_name(container_id: &str) -> String {
    format!("veth0_{}", &container_id[..6])
}

fn veth_peer_name(container_id: &str) -> String {
    format!("veth1_{}", &container_id[..6])
}

/// Locally-administered MAC: fixed `02:42` prefix, four random bytes.
fn container_mac() -> Vec<u8> {
    let mut mac = vec![MAC_PREFIX[0], MAC_PREFIX[1], 0, 0, 0, 0];
    rand::rng().fill(&mut mac[2..]);
    mac
}

/// Random container address in the bridge's /16. Collisions between
/// containers are not checked.
fn container_ip() -> Ipv4Addr {
    let mut rng = rand::rng();
    Ipv4Addr::new(
        SUBNET_OCTETS[0],
        SUBNET_OCTETS[1],
        rng.random_range(0..254),
        rng.random_range(0..254),
    )
}

/// Create the `veth0_<id6>`/`veth1_<id6>` pair on the host, give the
/// container end its MAC, and enslave the host end to the bridge.
pub async fn setup_host_veth(container_id: &str) -> Result<()> {
    let handle = connect()?;
    let veth0 = veth_host_name(container_id);
    let veth1 = veth_peer_name(container_id);

    handle
        .link()
        .add(rtnetlink::LinkVeth::new(&veth0, &veth1).build())
        .execute()
        .await
        .map_err(|e| anyhow!("Unable to create veth pair for {}: {}", container_id, e))?;

    let veth1_index = link_index(&handle, &veth1).await?;
    handle
        .link()
        .set(
            rtnetlink::LinkUnspec::new_with_index(veth1_index)
                .address(container_mac())
                .build(),
        )
        .execute()
        .await
        .map_err(|e| anyhow!("Unable to set MAC on {}: {}", veth1, e))?;

    let veth0_index = link_index(&handle, &veth0).await?;
    handle
        .link()
        .set(rtnetlink::LinkUnspec::new_with_index(veth0_index).up().build())
        .execute()
        .await?;

    let bridge_index = link_index(&handle, BRIDGE_NAME).await?;
    handle
        .link()
        .set(
            rtnetlink::LinkUnspec::new_with_index(veth0_index)
                .controller(bridge_index)
                .build(),
        )
        .execute()
        .await
        .map_err(|e| anyhow!("Unable to enslave {} to {}: {}", veth0, BRIDGE_NAME, e))?;
    Ok(())
}

// ─── Network namespace ────────────────────────────────────────────────────

/// Path of a container's bind-mounted namespace handle.
pub fn namespace_path(container_id: &str) -> PathBuf {
    Path::new(NETNS_DIR).join(container_id)
}

/// Create the container's network namespace and persist it by
/// bind-mounting `/proc/self/ns/net` over a file that outlives this
/// process, then return to the original namespace.
pub fn create_namespace(container_id: &str) -> Result<()> {
    std::fs::create_dir_all(NETNS_DIR)
        .with_context(|| format!("unable to create {}", NETNS_DIR))?;

    let ns_path = namespace_path(container_id);
    // Exclusive create: a leftover bind file means an id collision.
    let bind_file = open_fd(
        ns_path.as_path(),
        OFlag::O_RDONLY | OFlag::O_CREAT | OFlag::O_EXCL,
        Mode::from_bits_truncate(0o644),
    )
    .map_err(|e| anyhow!("Unable to open network bind file {}: {}", ns_path.display(), e))?;
    drop(bind_file);

    // Hold the current namespace open so this process can return to it;
    // the fd must outlive the restoring setns below.
    let preserve = open_fd(Path::new("/proc/self/ns/net"), OFlag::O_RDONLY, Mode::empty())
        .map_err(|e| anyhow!("Unable to open /proc/self/ns/net: {}", e))?;

    unshare(CloneFlags::CLONE_NEWNET)
        .map_err(|e| anyhow!("Unshare system call failed: {}", e))?;

    // The bind mount keeps the fresh namespace alive after we leave it.
    mount(
        Some("/proc/self/ns/net"),
        ns_path.as_path(),
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| anyhow!("Mount system call failed: {}", e))?;

    setns(&preserve, CloneFlags::CLONE_NEWNET)
        .map_err(|e| anyhow!("Setns system call failed: {}", e))?;
    Ok(())
}

/// Move the container end of the veth pair into the persisted namespace,
/// then configure it from inside: address, link up, default route.
pub async fn attach_veth(container_id: &str) -> Result<()> {
    let ns_path = namespace_path(container_id);
    let ns_fd = open_fd(ns_path.as_path(), OFlag::O_RDONLY, Mode::empty())
        .map_err(|e| anyhow!("Unable to open {}: {}", ns_path.display(), e))?;

    let veth1 = veth_peer_name(container_id);
    {
        let handle = connect()?;
        let index = link_index(&handle, &veth1).await?;
        handle
            .link()
            .set(
                rtnetlink::LinkUnspec::new_with_index(index)
                    .setns_by_fd(ns_fd.as_raw_fd())
                    .build(),
            )
            .execute()
            .await
            .map_err(|e| anyhow!("Unable to set network namespace for {}: {}", veth1, e))?;
    }

    setns(&ns_fd, CloneFlags::CLONE_NEWNET)
        .map_err(|e| anyhow!("Setns system call failed: {}", e))?;

    // The first connection's socket belongs to the host namespace; open a
    // fresh one now that this thread is inside the container's.
    let handle = connect()?;
    let index = link_index(&handle, &veth1).await?;

    let address = container_ip();
    info!("Assigning {} to {}", address, veth1);
    handle
        .address()
        .add(index, IpAddr::V4(address), SUBNET_PREFIX)
        .execute()
        .await
        .map_err(|e| anyhow!("Error assigning IP to {}: {}", veth1, e))?;

    handle
        .link()
        .set(rtnetlink::LinkUnspec::new_with_index(index).up().build())
        .execute()
        .await
        .map_err(|e| anyhow!("Unable to bring up {}: {}", veth1, e))?;

    let gateway: Ipv4Addr = BRIDGE_ADDR.parse()?;
    handle
        .route()
        .add(rtnetlink::RouteMessageBuilder::<Ipv4Addr>::new().gateway(gateway).build())
        .execute()
        .await
        .map_err(|e| anyhow!("Unable to add default route: {}", e))?;
    Ok(())
}

/// Join a container's persisted network namespace.
pub fn join_namespace(container_id: &str) -> Result<()> {
    let ns_path = namespace_path(container_id);
    let ns_fd = open_fd(ns_path.as_path(), OFlag::O_RDONLY, Mode::empty())
        .map_err(|e| anyhow!("Unable to open {}: {}", ns_path.display(), e))?;
    setns(&ns_fd, CloneFlags::CLONE_NEWNET)
        .map_err(|e| anyhow!("Setns system call failed: {}", e))?;
    Ok(())
}

/// Bring up loopback inside the current (container) namespace. Looking
/// `lo` up by name has been unreliable, so walk the link dump instead.
pub async fn setup_loopback() -> Result<()> {
    let handle = connect()?;
    let mut links = handle.link().get().execute();
    while let Some(link) = links.try_next().await? {
        let is_lo = link
            .attributes
            .iter()
            .any(|attr| matches!(attr, LinkAttribute::IfName(name) if name == "lo"));
        if !is_lo {
            continue;
        }
        if let Err(e) = handle
            .address()
            .add(link.header.index, "127.0.0.1".parse()?, 32)
            .execute()
            .await
        {
            if !is_exist(&e) {
                warn!("Unable to configure local interface: {}", e);
            }
        }
        handle
            .link()
            .set(rtnetlink::LinkUnspec::new_with_index(link.header.index).up().build())
            .execute()
            .await?;
    }
    Ok(())
}

/// Release a container's namespace: unmount the bind file and remove it.
/// The kernel reaps the namespace, and with it the container-side veth.
pub fn teardown(container_id: &str) -> Result<()> {
    let ns_path = namespace_path(container_id);
    umount(ns_path.as_path()).map_err(|e| {
        anyhow!(
            "Unable to unmount network namespace at {}: {}",
            ns_path.display(),
            e
        )
    })?;
    std::fs::remove_file(&ns_path)
        .with_context(|| format!("unable to remove {}", ns_path.display()))?;
    Ok(())
}

// ─── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_veth_names_use_six_id_chars() {
        assert_eq!(veth_host_name("cafebabe1234"), "veth0_cafeba");
        assert_eq!(veth_peer_name("cafebabe1234"), "veth1_cafeba");
    }

    #[test]
    fn test_container_mac_is_locally_administered() {
        for _ in 0..32 {
            let mac = container_mac();
            assert_eq!(mac.len(), 6);
            assert_eq!(&mac[..2], &[0x02, 0x42]);
        }
    }

    #[test]
    fn test_container_ip_stays_in_subnet() {
        for _ in 0..128 {
            let ip = container_ip();
            let octets = ip.octets();
            assert_eq!(&octets[..2], &[172, 29]);
            assert!(octets[2] < 254);
            assert!(octets[3] < 254);
        }
    }
}
