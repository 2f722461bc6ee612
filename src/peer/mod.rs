pub mod connection;
pub mod ice;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::{ConnectionCoordinator, Outcome};
pub use transport::{PeerTransport, TransportEvent, TransportFactory, WebRtcTransport, WebRtcTransportFactory};
pub use types::{CandidateDescriptor, ConnectionState, SdpType, SessionDescription};
