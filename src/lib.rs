//! meshnet: ad-hoc peer-to-peer mesh messaging over UDP.
//!
//! Nodes on the same network segment find each other by broadcast beacon,
//! keep a liveness-tracked peer table, and flood application messages
//! with TTL-bounded relaying and duplicate suppression. File payloads
//! ride the same relay as chunked messages with an accept/reject step on
//! the receiving side.

pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod identity;
pub mod liveness;
pub mod message;
pub mod node;
pub mod peer;
pub mod relay;
pub mod transfer;
pub mod transport;

pub use config::Config;
pub use error::{MeshError, Result};
pub use events::{EventReceiver, NodeEvent};
pub use identity::NodeIdentity;
pub use message::{MeshMessage, MessageKind, Payload};
pub use node::MeshNode;
pub use peer::PeerRecord;
pub use transfer::{FileTransferState, TransferStatus};
pub use transport::{AddressProvider, NetworkFormation, NoFormation, StaticAddresses};
