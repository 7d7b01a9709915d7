//! Shared reconciler context, threaded into both the bundle and
//! bundle-deployment controllers.

use std::sync::Arc;

use rukpak_core::unpack::{CompositeUnpacker, UnpackCtx};
use rukpak_core::ContentStore;

use crate::render::{ApplyEngine, DynamicWatchManager};

pub struct Ctx {
    pub provisioner_class_name: String,
    pub unpack_ctx: UnpackCtx,
    pub unpacker: CompositeUnpacker,
    pub content_store: ContentStore,
    pub apply_engine: Arc<dyn ApplyEngine>,
    pub dynamic_watch_manager: Arc<dyn DynamicWatchManager>,
    /// Plain-format transform option: reject bundles whose `manifests/`
    /// directory contains no objects. Off by default, matching upstream
    /// rukpak's lenient default.
    pub reject_empty_object_set: bool,
}
