pub mod cache;
pub mod config;
pub mod error;
pub mod gc;
pub mod image;
pub mod reconciler;
pub mod record;
pub mod secrets;
pub mod serializer;
pub mod server;
pub mod storage;
pub mod version;

pub use cache::UnpackCache;
pub use config::Config;
pub use error::{Error, Result};
pub use image::{ImagePuller, RegistryClient};
pub use reconciler::Reconciler;
pub use record::{CatalogRecord, InMemoryRecordStore, RecordStore};
pub use storage::LocalDirStorage;
