//! Container network fabric.
//!
//! One host bridge (`container0`, 172.29.0.1/16) plus, per container: a
//! veth pair whose host end is enslaved to the bridge, a network
//! namespace persisted as a bind-mounted file, and a random address in
//! the bridge's /16 with a default route back through it.

mod fabric;

pub use fabric::{
    attach_veth, bridge_is_up, create_bridge, create_namespace, join_namespace, namespace_path,
    setup_host_veth, setup_loopback, teardown,
};
