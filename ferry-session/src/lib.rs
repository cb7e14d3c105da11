//! Transfer sessions: the per-transfer state machine, the process-wide
//! session registry, and the drive loops that move chunks between peers.

pub mod backoff;
pub mod config;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod state;

mod util;

pub use config::TransferConfig;
pub use registry::{SessionHandle, SessionRegistry};
pub use state::{Direction, SessionState, TransferSession};
