//! Shared types, wire formats, and the error taxonomy for ferry.

pub mod error;
pub mod types;
pub mod wire;

pub use error::{FerryError, Result};
pub use types::{PeerId, SessionId, UploadId};
