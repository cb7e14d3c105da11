//! Ferry application surface: user settings plus the coordinator facade
//! that callers drive to upload, send, receive, and track files.

pub mod coordinator;
pub mod settings;

pub use coordinator::Coordinator;
pub use settings::Settings;
