//! Runtime delivery of versioned asset bundles: download, verify, cache, load and unload them, keeping every bundle
//! alive exactly as long as something depends on it.
//!
//! A package is described by a [PackageManifest], a table of logical assets and the physical bundle files they live
//! in, decoded from a compact binary format by [deserialize_manifest] or, a few records per tick, by a
//! [DeserializeManifestOperation].  [PackageFiles] keeps manifests on disk next to a hash and an applied-version
//! pointer.
//!
//! Everything long-running is an [AsyncOperation]: a cooperative, poll-driven task with a status, a progress, child
//! operations which are aborted along with their parent, and a bounded synchronous fallback in
//! [AsyncOperation::wait_for_sync_complete].  An [OperationSystem] polls operations once per tick within a
//! [TimeSlice].  There are no threads: shared state is `Rc`/`RefCell`, and callbacks run on the polling thread.
//!
//! The [ResourceManager] is the core.  It keeps one [LoadBundleFileOperation] per bundle no matter how many callers
//! want it, counts references to it through [BundleHandle]s and [AssetHandle]s, and destroys bundles bottom-up: a
//! bundle goes only once nothing references it, it is not loading, and every bundle depending on it is gone.  Where
//! bundle bytes come from is a [BundleFileSystem]: a [DirectoryFileSystem] on disk, or a [CacheFileSystem] which
//! downloads missing bundles through a pluggable [FileFetch] with per-file single flight and bounded retries.
//!
//! Decoded assets can be kept in an [AssetCache], backed by any of three [EvictionCache] policies: [LruCache],
//! [LruKCache] and [ArcCache].
//!
//! [ResourcePackage] ties all of it together for one package.
mod arc_cache;
mod asset_cache;
mod buffer;
mod bundle_loader;
mod download;
mod error;
mod eviction;
mod filesystem;
mod loading_tasker;
mod lru_cache;
mod lru_k_cache;
mod manifest;
mod manifest_codec;
mod operation;
mod package;
mod package_files;
mod recency_list;
mod resource_manager;
mod traits;

pub use arc_cache::*;
pub use asset_cache::*;
pub use buffer::*;
pub use bundle_loader::*;
pub use download::*;
pub use error::*;
pub use eviction::*;
pub use filesystem::*;
pub use loading_tasker::*;
pub use lru_cache::*;
pub use lru_k_cache::*;
pub use manifest::*;
pub use manifest_codec::*;
pub use operation::*;
pub use package::*;
pub use package_files::*;
pub use resource_manager::*;
pub use traits::*;
