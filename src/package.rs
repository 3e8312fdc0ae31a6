//! A [ResourcePackage] is the object an application owns for one content package.  It knows where the manifests
//! live, which [BundleFileSystem] serves bundles, and owns the [ResourceManager] for the installed manifest.
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use log::{debug, warn};

use crate::*;

#[derive(Clone, Debug, derive_builder::Builder)]
#[builder(default)]
pub struct PackageConfig {
    #[builder(setter(into))]
    pub package_name: String,
    pub operation_system: OperationSystemConfig,
    pub resource_manager: ResourceManagerConfig,
    pub download: DownloadConfig,
}

impl Default for PackageConfig {
    fn default() -> Self {
        PackageConfig {
            package_name: "DefaultPackage".into(),
            operation_system: Default::default(),
            resource_manager: Default::default(),
            download: Default::default(),
        }
    }
}

type ManifestOperationRef = Rc<RefCell<LoadPackageManifestOperation>>;

pub struct ResourcePackage {
    config: PackageConfig,
    files: PackageFiles,
    file_system: Rc<dyn BundleFileSystem>,
    /// Set when bundles come from a remote.
    cache: Option<Rc<CacheFileSystem>>,
    operations: OperationSystem,
    pending_manifest: Option<ManifestOperationRef>,
    manager: Option<ResourceManager>,
}

impl ResourcePackage {
    /// A package whose bundles are all available through `file_system`.
    pub fn new(config: PackageConfig, manifest_root: &Path, file_system: Rc<dyn BundleFileSystem>) -> ResourcePackage {
        ResourcePackage {
            files: PackageFiles::new(manifest_root, config.package_name.clone()),
            operations: OperationSystem::new(config.operation_system.clone()),
            config,
            file_system,
            cache: None,
            pending_manifest: None,
            manager: None,
        }
    }

    /// A package whose bundles are downloaded from `remote_base` into `cache_root` on first use.
    pub fn with_remote(
        config: PackageConfig,
        manifest_root: &Path,
        cache_root: &Path,
        remote_base: impl Into<String>,
        fetch: Rc<dyn FileFetch>,
    ) -> ResourcePackage {
        let center = DownloadCenter::new(config.package_name.clone(), fetch, config.download.clone());
        let cache = Rc::new(CacheFileSystem::new(cache_root, remote_base, center));
        let mut package = ResourcePackage::new(config, manifest_root, cache.clone());
        package.cache = Some(cache);
        package
    }

    pub fn package_name(&self) -> &str {
        &self.config.package_name
    }

    pub fn config(&self) -> &PackageConfig {
        &self.config
    }

    pub fn files(&self) -> &PackageFiles {
        &self.files
    }

    pub fn file_system(&self) -> &Rc<dyn BundleFileSystem> {
        &self.file_system
    }

    pub fn manifest(&self) -> Option<&Rc<PackageManifest>> {
        self.manager.as_ref().map(|m| m.manifest())
    }

    fn no_manifest(&self) -> OperationError {
        OperationError::NoManifest(self.config.package_name.clone())
    }

    pub fn manager(&self) -> Result<&ResourceManager, OperationError> {
        self.manager.as_ref().ok_or_else(|| self.no_manifest())
    }

    pub fn manager_mut(&mut self) -> Result<&mut ResourceManager, OperationError> {
        let err = self.no_manifest();
        self.manager.as_mut().ok_or(err)
    }

    /// Make `manifest` the active one.  Everything loaded from the previous manifest is unloaded.
    pub fn install_manifest(&mut self, manifest: Rc<PackageManifest>) {
        if let Some(mut old) = self.manager.take() {
            warn!(
                "Replacing manifest {} of {}, unloading everything",
                old.manifest().package_version(),
                self.config.package_name
            );
            old.force_unload_all();
        }
        debug!(
            "Installed manifest {} of {}",
            manifest.package_version(),
            self.config.package_name
        );
        self.manager = Some(ResourceManager::new(
            self.config.resource_manager.clone(),
            manifest,
            self.file_system.clone(),
            self.config.operation_system.clone(),
        ));
    }

    /// Load, apply and install a saved manifest in one go.  Nothing changes if any step fails.
    pub fn load_manifest(&mut self, version: &str) -> Result<(), OperationError> {
        let manifest = self.files.load_manifest(version, None)?;
        self.files.apply_version(version)?;
        self.install_manifest(Rc::new(manifest));
        Ok(())
    }

    /// Load the manifest recorded as applied, if any.  Returns whether one was loaded.
    pub fn load_applied_manifest(&mut self) -> Result<bool, OperationError> {
        match self.files.applied_version()? {
            Some(version) => self.load_manifest(&version).map(|_| true),
            None => Ok(false),
        }
    }

    /// Start decoding, checking and applying a saved manifest across ticks.  The [ResourcePackage::update] that sees
    /// the operation succeed installs the manifest.  A failure is reported by the operation and leaves the installed
    /// manifest alone.  Any manifest request still in flight is aborted.
    pub fn request_manifest(&mut self, version: &str) -> Result<ManifestOperationRef, OperationError> {
        if let Some(op) = self.pending_manifest.take() {
            warn!("Manifest request for {} replaced by {}", op.borrow().version(), version);
            abort_and_notify(&*op);
        }
        let op = LoadPackageManifestOperation::new(self.files.clone(), version, None)?;
        let op = Rc::new(RefCell::new(op));
        self.operations.start_operation(op.clone());
        self.pending_manifest = Some(op.clone());
        Ok(op)
    }

    fn poll_manifest(&mut self) {
        let done = match &self.pending_manifest {
            Some(op) => op.borrow().is_done(),
            None => false,
        };
        if !done {
            return;
        }
        let manifest = match self.pending_manifest.take() {
            Some(op) => op.borrow().manifest(),
            None => None,
        };
        if let Some(manifest) = manifest {
            self.install_manifest(manifest);
        }
    }

    /// Run one tick: manifest requests first, then bundle and asset loads.
    pub fn update(&mut self) {
        self.operations.update();
        self.poll_manifest();
        if let Some(manager) = &mut self.manager {
            manager.update();
        }
    }

    pub fn load_asset(&mut self, location: &str) -> Result<AssetHandle, OperationError> {
        Ok(self.manager_mut()?.load_asset(location))
    }

    pub fn load_bundle(&mut self, id: BundleId) -> Result<BundleHandle, OperationError> {
        self.manager_mut()?.load_bundle(id)
    }

    pub fn unload_unused_assets(&mut self) {
        if let Some(manager) = &mut self.manager {
            let loops = manager.config().unload_loop_count;
            manager.unload_unused_assets(loops);
        }
    }

    pub fn force_unload_all(&mut self) {
        if let Some(manager) = &mut self.manager {
            manager.force_unload_all();
        }
    }

    /// Download every bundle carrying one of `tags` that is not cached yet, or every bundle if `tags` is empty.
    pub fn create_downloader(&self, tags: &[&str]) -> Result<BundleDownloaderOperation, OperationError> {
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| OperationError::Offline(self.config.package_name.clone()))?;
        let manifest = self.manifest().ok_or_else(|| self.no_manifest())?;
        let bundles: Vec<&PackageBundle> = if tags.is_empty() {
            manifest.bundles().iter().collect()
        } else {
            manifest
                .bundles_by_tags(tags)
                .into_iter()
                .filter_map(|id| manifest.bundle(id))
                .collect()
        };
        cache.create_downloader(&bundles, self.config.download.max_concurrent_downloads)
    }
}
