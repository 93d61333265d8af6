pub mod download;
pub mod registry;
pub mod state;

pub use download::{DownloadEvent, DownloadManager, DownloadTask, HfHubRepository, RemoteRepository};
pub use registry::{lookup, ModelDescriptor, ModelId, Variant};
pub use state::ModelState;
