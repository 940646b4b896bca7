pub mod disk;

pub use disk::{DiskVectorStore, COLLECTION_NAME};
