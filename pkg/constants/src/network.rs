//! Network plan constants.
//!
//! One fixed /16 for everything: the bridge owns `.0.1` and containers get
//! random addresses from the rest of the block.

/// Name of the host bridge all containers attach to.
pub const BRIDGE_NAME: &str = "container0";

/// Address assigned to the bridge, also the containers' default gateway.
pub const BRIDGE_ADDR: &str = "172.29.0.1";

/// Prefix length shared by the bridge and every container address.
pub const SUBNET_PREFIX: u8 = 16;

/// Leading octets of every container address.
pub const SUBNET_OCTETS: [u8; 2] = [172, 29];

/// Locally-administered MAC prefix for container-side veth devices.
pub const MAC_PREFIX: [u8; 2] = [0x02, 0x42];
