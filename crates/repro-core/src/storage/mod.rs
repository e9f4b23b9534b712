pub mod blob;
pub mod schema;
pub mod store;

pub use blob::{open_blob_store, BlobError, BlobStore, ObjectBlobStore};
pub use store::{CasOutcome, Store};
