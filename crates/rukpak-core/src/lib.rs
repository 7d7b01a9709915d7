//! Source unpackers, content store, and bundle transforms for the
//! provisioner engine: everything the `rukpak-provisioner` binary calls
//! into that isn't reconciler control flow.

pub mod pod_utils;
pub mod store;
pub mod transform;
pub mod tree;
pub mod unpack;
pub mod upload_store;

pub use store::{ContentStore, StoreError};
pub use tree::{FileTree, TreeError};
pub use unpack::{CompositeUnpacker, UnpackCtx, UnpackError, UnpackResult, UnpackState, Unpacker};
pub use upload_store::{UploadStore, UploadStoreError};
