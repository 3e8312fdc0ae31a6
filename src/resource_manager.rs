//! The [ResourceManager] hands out bundles and assets and decides when they can go away.
//!
//! There is at most one [LoadBundleFileOperation] per bundle.  Every consumer references it: a [BundleHandle] from
//! [ResourceManager::load_bundle], or an [AssetProvider], which references the bundle of an asset plus all of that
//! bundle's dependencies.  Providers are in turn referenced by [AssetHandle]s.  Handles release on drop.
//!
//! Unloading goes bottom-up: providers without handles are destroyed first, which releases their bundles; a bundle is
//! then destroyed once it has no references, is not loading, and every bundle depending on it is already destroyed.
//! A chain of N dependent bundles takes N unload loops to tear down completely.
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use ahash::RandomState;
use log::{debug, error, warn};

use crate::*;

#[derive(Clone, Debug, derive_builder::Builder)]
#[builder(default)]
pub struct ResourceManagerConfig {
    /// Bundle loads allowed in flight at once.  Further loads wait for a slot.
    pub bundle_loading_max_concurrency: usize,
    /// Destroy bundles as soon as nothing uses them, rather than on [ResourceManager::unload_unused_assets].
    pub auto_unload_bundle_when_unused: bool,
    /// Unload loops run per tick when unloading automatically.
    pub unload_loop_count: usize,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        ResourceManagerConfig {
            bundle_loading_max_concurrency: usize::MAX,
            auto_unload_bundle_when_unused: false,
            unload_loop_count: 10,
        }
    }
}

/// A counted reference to a bundle loader.
pub struct BundleHandle {
    loader: LoaderRef,
}

impl BundleHandle {
    fn new(loader: LoaderRef) -> BundleHandle {
        loader.borrow_mut().reference();
        BundleHandle { loader }
    }

    pub fn bundle_id(&self) -> BundleId {
        self.loader.borrow().bundle_id()
    }

    pub fn bundle_name(&self) -> String {
        self.loader.borrow().bundle_name().to_string()
    }

    pub fn status(&self) -> OperationStatus {
        self.loader.borrow().status()
    }

    pub fn is_done(&self) -> bool {
        self.loader.borrow().is_done()
    }

    pub fn progress(&self) -> f32 {
        self.loader.borrow().progress()
    }

    pub fn error(&self) -> Option<OperationError> {
        self.loader.borrow().error().cloned()
    }

    /// The loaded bundle, once the load succeeded.
    pub fn bundle(&self) -> Option<Rc<LoadedBundle>> {
        self.loader.borrow().result()
    }

    pub fn on_completed(&self, callback: CompletionCallback) {
        self.loader.borrow_mut().on_completed(callback);
    }

    /// Block until the bundle is loaded or has failed.
    pub fn wait_for_completion(&self) -> OperationStatus {
        wait_and_notify(&*self.loader)
    }
}

impl Clone for BundleHandle {
    fn clone(&self) -> Self {
        BundleHandle::new(self.loader.clone())
    }
}

impl Drop for BundleHandle {
    fn drop(&mut self) {
        self.loader.borrow_mut().release();
    }
}

impl std::fmt::Debug for BundleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let loader = self.loader.borrow();
        f.debug_struct("BundleHandle")
            .field("bundle", &loader.bundle_name())
            .field("status", &loader.status())
            .finish()
    }
}

pub type ProviderRef = Rc<RefCell<AssetProvider>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ProviderStep {
    StartBundleLoader,
    WaitBundleLoader,
    Done,
}

/// Loads the bundle of one asset together with every bundle it depends on.
pub struct AssetProvider {
    core: OperationCore,
    location: String,
    asset: Option<PackageAsset>,
    /// The main bundle first, then its dependencies.
    loaders: Vec<LoaderRef>,
    step: ProviderStep,
    ref_count: usize,
    destroyed: bool,
    bundle: Option<Rc<LoadedBundle>>,
}

impl AssetProvider {
    fn new(asset: PackageAsset, loaders: Vec<LoaderRef>) -> AssetProvider {
        for loader in &loaders {
            loader.borrow_mut().reference();
        }
        AssetProvider {
            core: OperationCore::new(),
            location: asset.asset_path.clone(),
            asset: Some(asset),
            loaders,
            step: ProviderStep::StartBundleLoader,
            ref_count: 0,
            destroyed: false,
            bundle: None,
        }
    }

    /// A provider which fails as soon as it starts.
    fn failed(location: &str, err: OperationError) -> AssetProvider {
        let mut provider = AssetProvider {
            core: OperationCore::new(),
            location: location.to_string(),
            asset: None,
            loaders: vec![],
            step: ProviderStep::Done,
            ref_count: 0,
            destroyed: false,
            bundle: None,
        };
        provider.start_operation();
        provider.core.fail(err);
        provider
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn asset(&self) -> Option<&PackageAsset> {
        self.asset.as_ref()
    }

    pub fn main_bundle_id(&self) -> Option<BundleId> {
        self.asset.as_ref().map(|a| a.bundle_id)
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn bundle(&self) -> Option<Rc<LoadedBundle>> {
        self.bundle.clone()
    }

    pub fn bundle_names(&self) -> Vec<String> {
        self.loaders
            .iter()
            .map(|l| l.borrow().bundle_name().to_string())
            .collect()
    }

    pub fn can_destroy(&self) -> bool {
        self.ref_count == 0
    }

    /// Release every bundle this provider holds.  An unfinished load fails as aborted.
    fn destroy_provider(&mut self) {
        if self.destroyed {
            return;
        }
        debug!("Destroyed provider for {}", self.location);
        self.destroyed = true;
        self.step = ProviderStep::Done;
        self.core.fail(OperationError::Aborted);
        self.bundle = None;
        for loader in &self.loaders {
            loader.borrow_mut().release();
        }
    }
}

impl AsyncOperation for AssetProvider {
    fn core(&self) -> &OperationCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut OperationCore {
        &mut self.core
    }

    fn internal_start(&mut self) {}

    fn internal_update(&mut self, _slice: &TimeSlice) {
        if self.step == ProviderStep::StartBundleLoader {
            self.step = ProviderStep::WaitBundleLoader;
        }
        if self.step != ProviderStep::WaitBundleLoader {
            return;
        }

        // Loaders are polled by the operation system, and outlive this provider if it is destroyed mid-load.
        if self.core.is_waiting_sync() {
            for loader in &self.loaders {
                wait_and_notify(&**loader);
            }
        }

        let mut progress = 0.0;
        let mut pending = false;
        let mut failure = None;
        for loader in &self.loaders {
            let loader = loader.borrow();
            progress += loader.progress();
            if !loader.is_done() {
                pending = true;
            } else if failure.is_none() {
                failure = loader.error().cloned();
            }
        }
        self.core.set_progress(progress / self.loaders.len() as f32);

        if let Some(e) = failure {
            self.step = ProviderStep::Done;
            self.core.fail(e);
            return;
        }
        if pending {
            return;
        }

        self.step = ProviderStep::Done;
        match self.loaders.first().and_then(|l| l.borrow().result()) {
            Some(bundle) => {
                self.bundle = Some(bundle);
                self.core.succeed();
            }
            None => self.core.fail(OperationError::NotLoaded(self.location.clone())),
        }
    }

    fn description(&self) -> String {
        format!("AssetProvider({})", self.location)
    }
}

/// A counted reference to an asset provider.
pub struct AssetHandle {
    provider: ProviderRef,
}

impl AssetHandle {
    fn new(provider: ProviderRef) -> AssetHandle {
        provider.borrow_mut().ref_count += 1;
        AssetHandle { provider }
    }

    pub fn location(&self) -> String {
        self.provider.borrow().location().to_string()
    }

    pub fn asset(&self) -> Option<PackageAsset> {
        self.provider.borrow().asset().cloned()
    }

    pub fn status(&self) -> OperationStatus {
        self.provider.borrow().status()
    }

    pub fn is_done(&self) -> bool {
        self.provider.borrow().is_done()
    }

    pub fn progress(&self) -> f32 {
        self.provider.borrow().progress()
    }

    pub fn error(&self) -> Option<OperationError> {
        self.provider.borrow().error().cloned()
    }

    /// The bundle holding the asset, once loaded.
    pub fn bundle(&self) -> Option<Rc<LoadedBundle>> {
        self.provider.borrow().bundle()
    }

    pub fn on_completed(&self, callback: CompletionCallback) {
        self.provider.borrow_mut().on_completed(callback);
    }

    pub fn wait_for_completion(&self) -> OperationStatus {
        wait_and_notify(&*self.provider)
    }

    /// Decode the asset out of its loaded bundle.
    pub fn decode<D: AssetDecoder>(&self, decoder: &D) -> Result<D::Output, OperationError> {
        let provider = self.provider.borrow();
        if let Some(e) = provider.error() {
            return Err(e.clone());
        }
        let bundle = provider
            .bundle()
            .ok_or_else(|| OperationError::NotLoaded(provider.location().to_string()))?;
        let asset = provider
            .asset()
            .ok_or_else(|| OperationError::AssetNotFound(provider.location().to_string()))?;
        bundle.decode(decoder, asset)
    }
}

impl Clone for AssetHandle {
    fn clone(&self) -> Self {
        AssetHandle::new(self.provider.clone())
    }
}

impl Drop for AssetHandle {
    fn drop(&mut self) {
        let mut provider = self.provider.borrow_mut();
        provider.ref_count = provider.ref_count.saturating_sub(1);
    }
}

impl std::fmt::Debug for AssetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let provider = self.provider.borrow();
        f.debug_struct("AssetHandle")
            .field("location", &provider.location())
            .field("status", &provider.status())
            .finish()
    }
}

/// A loader as seen by [ResourceManager::debug_report].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugBundleInfo {
    pub bundle_name: String,
    pub ref_count: usize,
    pub status: OperationStatus,
    /// Bundles depending on this one which currently have a loader.
    pub reference_bundles: Vec<String>,
}

pub struct ResourceManager {
    config: ResourceManagerConfig,
    manifest: Rc<PackageManifest>,
    file_system: Rc<dyn BundleFileSystem>,
    limiter: LoadLimiter,
    /// Loaders by bundle name.  Never retried at this layer.
    loaders: LoadingTaskTracker<LoaderRef>,
    /// Providers by asset path.
    providers: HashMap<String, ProviderRef, RandomState>,
    operations: OperationSystem,
    locked: bool,
}

impl ResourceManager {
    pub fn new(
        config: ResourceManagerConfig,
        manifest: Rc<PackageManifest>,
        file_system: Rc<dyn BundleFileSystem>,
        system_config: OperationSystemConfig,
    ) -> ResourceManager {
        ResourceManager {
            limiter: LoadLimiter::new(config.bundle_loading_max_concurrency),
            config,
            manifest,
            file_system,
            loaders: LoadingTaskTracker::new(0),
            providers: Default::default(),
            operations: OperationSystem::new(system_config),
            locked: false,
        }
    }

    pub fn config(&self) -> &ResourceManagerConfig {
        &self.config
    }

    pub fn manifest(&self) -> &Rc<PackageManifest> {
        &self.manifest
    }

    /// While locked, new loads fail immediately with [OperationError::Locked].
    pub fn lock_load_operation(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn loader_count(&self) -> usize {
        self.loaders.len()
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Bundle loads currently in flight.
    pub fn loading_count(&self) -> usize {
        self.limiter.in_flight()
    }

    fn loader(&self, id: BundleId) -> Option<&LoaderRef> {
        let bundle = self.manifest.bundle(id)?;
        self.loaders.try_get_task(&bundle.bundle_name)
    }

    pub fn has_loader(&self, id: BundleId) -> bool {
        self.loader(id).is_some()
    }

    fn get_or_create_loader(&mut self, id: BundleId) -> Result<LoaderRef, OperationError> {
        let bundle = self
            .manifest
            .bundle(id)
            .ok_or(OperationError::UnknownBundle(id))?;
        if let Some(loader) = self.loaders.try_get_task(&bundle.bundle_name) {
            return Ok(loader.clone());
        }
        let loader = Rc::new(RefCell::new(LoadBundleFileOperation::new(
            id,
            bundle.clone(),
            self.file_system.clone(),
            self.limiter.clone(),
        )));
        self.loaders.add_task(&bundle.bundle_name, loader.clone());
        Ok(loader)
    }

    /// Get a handle to a bundle, loading it if nothing else has.
    pub fn load_bundle(&mut self, id: BundleId) -> Result<BundleHandle, OperationError> {
        if self.locked {
            error!("The load operation is locked, refusing to load bundle {}", id);
            return Err(OperationError::Locked);
        }
        let loader = self.get_or_create_loader(id)?;
        if loader.borrow().status() == OperationStatus::None {
            self.operations.start_operation(loader.clone());
        }
        Ok(BundleHandle::new(loader))
    }

    /// Give a handle back.  Unused bundles are destroyed right away when unloading automatically.
    pub fn release(&mut self, handle: BundleHandle) {
        let id = handle.bundle_id();
        drop(handle);
        if self.config.auto_unload_bundle_when_unused {
            self.try_destroy(id);
        }
    }

    fn is_bundle_destroyed(&self, id: BundleId) -> bool {
        self.loader(id).map_or(true, |l| l.borrow().is_destroyed())
    }

    /// Whether a bundle's loader could be destroyed now.
    pub fn can_destroy_loader(&self, id: BundleId) -> bool {
        let loader = match self.loader(id) {
            Some(l) => l,
            None => return false,
        };
        let loader = loader.borrow();
        loader.can_release()
            && loader
                .bundle()
                .reference_bundle_ids()
                .iter()
                .all(|&dependent| self.is_bundle_destroyed(dependent))
    }

    /// Destroy a bundle's loader if nothing uses it and every bundle depending on it is gone.
    pub fn try_destroy(&mut self, id: BundleId) -> bool {
        if !self.can_destroy_loader(id) {
            return false;
        }
        self.destroy_loader(id);
        true
    }

    fn destroy_loader(&mut self, id: BundleId) {
        let name = match self.manifest.bundle(id) {
            Some(b) => b.bundle_name.clone(),
            None => return,
        };
        if let Some(loader) = self.loaders.remove_task(&name) {
            loader.borrow_mut().destroy_loader();
        }
    }

    /// A handle whose provider has already failed.  It is still polled once so completion callbacks fire.
    fn failed_asset(&mut self, location: &str, err: OperationError) -> AssetHandle {
        let provider = Rc::new(RefCell::new(AssetProvider::failed(location, err)));
        self.operations.start_operation(provider.clone());
        AssetHandle::new(provider)
    }

    /// Get a handle to an asset, loading its bundles if needed.
    ///
    /// Failures, including an unknown location, are reported through the handle.
    pub fn load_asset(&mut self, location: &str) -> AssetHandle {
        if self.locked {
            error!("The load operation is locked, refusing to load {}", location);
            return self.failed_asset(location, OperationError::Locked);
        }
        let asset = match self.manifest.asset_by_location(location) {
            Some(a) => a.clone(),
            None => {
                error!("Failed to load asset, no asset at {}", location);
                return self.failed_asset(location, OperationError::AssetNotFound(location.to_string()));
            }
        };

        if let Some(provider) = self.providers.get(&asset.asset_path) {
            return AssetHandle::new(provider.clone());
        }

        let mut loaders = Vec::with_capacity(asset.depend_bundle_ids.len() + 1);
        let mut ids = vec![asset.bundle_id];
        ids.extend(
            asset
                .depend_bundle_ids
                .iter()
                .copied()
                .filter(|&d| d != asset.bundle_id),
        );
        for id in ids {
            match self.get_or_create_loader(id) {
                Ok(l) => loaders.push(l),
                Err(e) => return self.failed_asset(location, e),
            }
        }
        for loader in &loaders {
            if loader.borrow().status() == OperationStatus::None {
                self.operations.start_operation(loader.clone());
            }
        }

        let key = asset.asset_path.clone();
        let provider = Rc::new(RefCell::new(AssetProvider::new(asset, loaders)));
        self.providers.insert(key, provider.clone());
        self.operations.start_operation(provider.clone());
        AssetHandle::new(provider)
    }

    /// Look an asset up in a loaded bundle and decode it.
    pub fn get_asset<D: AssetDecoder>(
        &self,
        handle: &BundleHandle,
        location: &str,
        decoder: &D,
    ) -> Result<D::Output, OperationError> {
        let asset = self
            .manifest
            .asset_by_location(location)
            .ok_or_else(|| OperationError::AssetNotFound(location.to_string()))?;
        if asset.bundle_id != handle.bundle_id() {
            return Err(OperationError::AssetNotInBundle {
                asset: asset.asset_path.clone(),
                bundle: handle.bundle_name(),
            });
        }
        let bundle = handle
            .bundle()
            .ok_or_else(|| OperationError::NotLoaded(handle.bundle_name()))?;
        bundle.decode(decoder, asset)
    }

    fn destroy_unused_providers(&mut self, main_bundle: Option<BundleId>) {
        let mut unused = vec![];
        for (key, provider) in self.providers.iter() {
            let p = provider.borrow();
            if p.can_destroy() && (main_bundle.is_none() || p.main_bundle_id() == main_bundle) {
                unused.push(key.clone());
            }
        }
        for key in unused {
            if let Some(provider) = self.providers.remove(&key) {
                provider.borrow_mut().destroy_provider();
            }
        }
    }

    /// Unload the bundles of one asset, if nothing else uses them.
    pub fn try_unload_unused_asset(&mut self, location: &str, loop_count: usize) {
        let asset = match self.manifest.asset_by_location(location) {
            Some(a) => a.clone(),
            None => {
                error!("Failed to unload asset, no asset at {}", location);
                return;
            }
        };
        for _ in 0..loop_count {
            self.destroy_unused_providers(Some(asset.bundle_id));
            self.try_destroy(asset.bundle_id);
            for &id in &asset.depend_bundle_ids {
                self.try_destroy(id);
            }
        }
    }

    /// Destroy every provider without handles, then every bundle that is no longer needed.  Each loop tears down one
    /// more level of the dependency graph.
    pub fn unload_unused_assets(&mut self, loop_count: usize) {
        for _ in 0..loop_count {
            self.destroy_unused_providers(None);

            // Decided up front, so a bundle and one it depends on are never destroyed in the same loop.
            let destroyable: Vec<BundleId> = self
                .loaders
                .tasks()
                .map(|(_, l)| l.borrow().bundle_id())
                .filter(|&id| self.can_destroy_loader(id))
                .collect();
            if destroyable.is_empty() {
                break;
            }
            for id in destroyable {
                self.destroy_loader(id);
            }
        }
    }

    /// Abort every load and drop every provider and loader, regardless of handles.
    ///
    /// Loaders still held by a [BundleHandle] are forgotten but not destroyed, since their handles may still be read.
    pub fn force_unload_all(&mut self) {
        self.operations.clear_all();
        for (_, provider) in self.providers.drain() {
            abort_and_notify(&*provider);
            provider.borrow_mut().destroy_provider();
        }

        let names: Vec<String> = self.loaders.keys().map(|k| k.to_string()).collect();
        for name in names {
            if let Some(loader) = self.loaders.remove_task(&name) {
                abort_and_notify(&*loader);
                let mut loader = loader.borrow_mut();
                if loader.ref_count() == 0 {
                    loader.destroy_loader();
                } else {
                    warn!(
                        "Forgetting loader for {} with {} outstanding handle(s)",
                        name,
                        loader.ref_count()
                    );
                }
            }
        }
    }

    /// Run one tick of loading.
    pub fn update(&mut self) {
        self.operations.update();
        self.after_update();
    }

    /// Run one tick of loading within the given budget.
    pub fn update_with(&mut self, slice: &TimeSlice) {
        self.operations.update_with(slice);
        self.after_update();
    }

    fn after_update(&mut self) {
        if self.config.auto_unload_bundle_when_unused {
            self.unload_unused_assets(self.config.unload_loop_count);
        }
    }

    /// Every live loader, sorted by bundle name.
    pub fn debug_report(&self) -> Vec<DebugBundleInfo> {
        let mut report: Vec<DebugBundleInfo> = self
            .loaders
            .tasks()
            .map(|(name, loader)| {
                let loader = loader.borrow();
                let reference_bundles = loader
                    .bundle()
                    .reference_bundle_ids()
                    .iter()
                    .filter_map(|&id| self.manifest.bundle(id))
                    .filter(|b| self.loaders.has_task(&b.bundle_name))
                    .map(|b| b.bundle_name.clone())
                    .collect();
                DebugBundleInfo {
                    bundle_name: name.to_string(),
                    ref_count: loader.ref_count(),
                    status: loader.status(),
                    reference_bundles,
                }
            })
            .collect();
        report.sort_by(|a, b| a.bundle_name.cmp(&b.bundle_name));
        report
    }
}
