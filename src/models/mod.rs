//! Database row types.

pub mod node;
pub mod peer_share;
pub mod tunnel;

pub use node::Node;
pub use peer_share::{PeerShare, PeerShareRuntime};
pub use tunnel::{ChainTunnel, FederationTunnelBinding, PendingRelease, Tunnel};
