pub mod allocation;
pub mod peer;
pub mod status;

pub use allocation::{Allocation, AllocationReason};
pub use peer::{DiscoveredPeer, PeerRecord, PeerView};
pub use status::{EvseStatus, StatusDelta};
