//! Local content store: file blobs on disk plus upload metadata in SQLite.

pub mod chunker;
pub mod store;

pub use chunker::ChunkReader;
pub use store::{ContentStore, FileUpload, ReceiveSlot, UploadStatus};
