pub mod conn;
pub mod extension;
pub mod fingerprint;
pub mod mse;
/// Peer Exchange (PEX) BEP 11
pub mod pex;
pub mod priority;
/// Extension for Peers to Send Metadata Files BEP 9
pub mod ut_metadata;
pub mod wire;

pub use conn::{BlockRequest, CloseReason, ConnEvent, ConnInput, PeerConnection};
pub use wire::{HandShake, PeerMessage};
