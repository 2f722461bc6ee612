pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::CallConfig;
pub use error::{CallError, Result, StoreError};
pub use events::CallEvent;
pub use peer::{CandidateDescriptor, ConnectionCoordinator, Outcome, SessionDescription};
pub use session::{CallSession, Role};
pub use signaling::{MemoryStore, RecordStore, SignalingChannel};
