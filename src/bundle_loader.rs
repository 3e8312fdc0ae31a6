//! One loader per bundle, shared by everything that needs the bundle.
//!
//! A [LoadBundleFileOperation] waits for a [LoadLimiter] slot, then drives the [BundleFileSystem] load.  Its
//! reference count gates destruction: a loader is only destroyed with no references and no load in flight.  Whether
//! the bundles depending on it are gone is the [crate::ResourceManager]'s call, since only it sees every loader.
use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, warn};

use crate::*;

pub type LoaderRef = Rc<RefCell<LoadBundleFileOperation>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LoaderStep {
    None,
    CheckConcurrency,
    LoadBundleFile,
    Done,
}

pub struct LoadBundleFileOperation {
    core: OperationCore,
    bundle_id: BundleId,
    bundle: PackageBundle,
    file_system: Rc<dyn BundleFileSystem>,
    limiter: LoadLimiter,
    step: LoaderStep,
    load_op: Option<LoadBundleRef>,
    slot: Option<LoadSlot>,
    ref_count: usize,
    destroyed: bool,
    downloaded_bytes: u64,
    result: Option<Rc<LoadedBundle>>,
}

impl LoadBundleFileOperation {
    pub fn new(
        bundle_id: BundleId,
        bundle: PackageBundle,
        file_system: Rc<dyn BundleFileSystem>,
        limiter: LoadLimiter,
    ) -> LoadBundleFileOperation {
        debug!("Created loader for {}", bundle.bundle_name);
        LoadBundleFileOperation {
            core: OperationCore::new(),
            bundle_id,
            bundle,
            file_system,
            limiter,
            step: LoaderStep::None,
            load_op: None,
            slot: None,
            ref_count: 0,
            destroyed: false,
            downloaded_bytes: 0,
            result: None,
        }
    }

    pub fn bundle_id(&self) -> BundleId {
        self.bundle_id
    }

    pub fn bundle(&self) -> &PackageBundle {
        &self.bundle
    }

    pub fn bundle_name(&self) -> &str {
        &self.bundle.bundle_name
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Whether the bundle file load is in flight.
    pub fn is_loading(&self) -> bool {
        self.step == LoaderStep::LoadBundleFile
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes
    }

    pub fn result(&self) -> Option<Rc<LoadedBundle>> {
        self.result.clone()
    }

    pub fn reference(&mut self) {
        self.ref_count += 1;
    }

    /// # Panics
    ///
    /// If the loader has no references left.
    pub fn release(&mut self) {
        assert!(
            self.ref_count > 0,
            "Bundle file loader released more often than referenced: {}",
            self.bundle.bundle_name
        );
        self.ref_count -= 1;
    }

    /// No references and nothing in flight.
    pub fn can_release(&self) -> bool {
        !self.is_loading() && self.ref_count == 0
    }

    /// Tear the loader down, dropping the loaded bundle.
    ///
    /// # Panics
    ///
    /// If a load is in flight or the loader is still referenced.
    pub fn destroy_loader(&mut self) {
        assert!(
            !self.is_loading(),
            "Bundle file loader is not done: {}",
            self.bundle.bundle_name
        );
        assert_eq!(
            self.ref_count, 0,
            "Bundle file loader ref is not zero: {}",
            self.bundle.bundle_name
        );
        debug!("Destroyed loader for {}", self.bundle.bundle_name);
        self.destroyed = true;
        self.result = None;
        if !self.core.is_done() {
            self.step = LoaderStep::Done;
            self.core
                .fail(OperationError::Destroyed(self.bundle.bundle_name.clone()));
        }
    }

    fn begin_load(&mut self) {
        let op = self.file_system.load_bundle_file(&self.bundle);
        op.borrow_mut().start_operation();
        self.load_op = Some(op);
        self.step = LoaderStep::LoadBundleFile;
    }

    fn finish(&mut self, outcome: Result<Rc<LoadedBundle>, OperationError>) {
        self.step = LoaderStep::Done;
        self.load_op = None;
        self.slot = None;
        match outcome {
            Ok(bundle) => {
                self.result = Some(bundle);
                self.core.succeed();
            }
            Err(e) => self.core.fail(e),
        }
    }
}

impl AsyncOperation for LoadBundleFileOperation {
    fn core(&self) -> &OperationCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut OperationCore {
        &mut self.core
    }

    fn internal_start(&mut self) {
        self.step = LoaderStep::CheckConcurrency;
    }

    fn internal_update(&mut self, slice: &TimeSlice) {
        if self.step == LoaderStep::CheckConcurrency {
            let slot = if self.core.is_waiting_sync() {
                Some(self.limiter.acquire_unbounded())
            } else {
                self.limiter.try_acquire()
            };
            match slot {
                Some(s) => self.slot = Some(s),
                None => return,
            }
            self.begin_load();
        }

        if self.step != LoaderStep::LoadBundleFile {
            return;
        }
        let op = match &self.load_op {
            Some(op) => op.clone(),
            None => return,
        };
        if self.core.is_waiting_sync() {
            wait_and_notify(&*op);
        } else {
            update_and_notify(&*op, slice);
        }

        let outcome = {
            let op = op.borrow();
            self.downloaded_bytes = op.downloaded_bytes();
            self.core.set_progress(op.progress());
            if !op.is_done() {
                return;
            }
            match (op.error(), op.result()) {
                (Some(e @ OperationError::Bundle { .. }), _) => Err(e.clone()),
                (Some(e), _) => Err(e.clone().in_bundle(self.bundle.bundle_name.clone(), "loading")),
                (None, Some(bundle)) => Ok(bundle),
                (None, None) => Err(OperationError::NotLoaded(self.bundle.bundle_name.clone())),
            }
        };
        self.finish(outcome);
    }

    fn internal_abort(&mut self) {
        if let Some(op) = self.load_op.take() {
            warn!("Aborting load of {}", self.bundle.bundle_name);
            abort_and_notify(&*op);
        }
        self.slot = None;
        self.step = LoaderStep::Done;
    }

    fn description(&self) -> String {
        format!("LoadBundleFileOperation({})", self.bundle.bundle_name)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::Cell;
    use std::collections::HashMap;

    use super::*;

    /// Serves bundles from memory after a number of polls, counting loads.
    #[derive(Default)]
    pub(crate) struct MemoryFileSystem {
        pub(crate) files: HashMap<String, Vec<u8>>,
        pub(crate) polls_per_load: u32,
        pub(crate) loads: Rc<Cell<u32>>,
    }

    impl MemoryFileSystem {
        /// Every bundle of the manifest, holding `len` bytes each.
        pub(crate) fn for_manifest(manifest: &PackageManifest, polls_per_load: u32) -> MemoryFileSystem {
            MemoryFileSystem {
                files: manifest
                    .bundles()
                    .iter()
                    .map(|b| (b.bundle_name.clone(), b.bundle_name.as_bytes()[..4].to_vec()))
                    .collect(),
                polls_per_load,
                loads: Default::default(),
            }
        }
    }

    struct MemoryLoad {
        core: OperationCore,
        bundle_name: String,
        data: Option<Vec<u8>>,
        remaining: u32,
        result: Option<Rc<LoadedBundle>>,
    }

    impl AsyncOperation for MemoryLoad {
        fn core(&self) -> &OperationCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut OperationCore {
            &mut self.core
        }

        fn internal_start(&mut self) {}

        fn internal_update(&mut self, _slice: &TimeSlice) {
            if self.remaining > 0 {
                self.remaining -= 1;
                return;
            }
            match self.data.take() {
                Some(data) => {
                    self.result = Some(Rc::new(LoadedBundle::new(self.bundle_name.clone(), data)));
                    self.core.succeed();
                }
                None => self.core.fail(OperationError::Io {
                    context: format!("reading {}", self.bundle_name),
                    kind: std::io::ErrorKind::NotFound,
                    message: "missing".into(),
                }),
            }
        }

        fn description(&self) -> String {
            format!("MemoryLoad({})", self.bundle_name)
        }
    }

    impl LoadBundleOperation for MemoryLoad {
        fn result(&self) -> Option<Rc<LoadedBundle>> {
            self.result.clone()
        }
    }

    impl BundleFileSystem for MemoryFileSystem {
        fn exists(&self, bundle: &PackageBundle) -> bool {
            self.files.contains_key(&bundle.bundle_name)
        }

        fn read_bytes(&self, bundle: &PackageBundle) -> Result<Vec<u8>, OperationError> {
            self.files
                .get(&bundle.bundle_name)
                .cloned()
                .ok_or_else(|| OperationError::NotLoaded(bundle.bundle_name.clone()))
        }

        fn load_bundle_file(&self, bundle: &PackageBundle) -> LoadBundleRef {
            self.loads.set(self.loads.get() + 1);
            Rc::new(RefCell::new(MemoryLoad {
                core: OperationCore::new(),
                bundle_name: bundle.bundle_name.clone(),
                data: self.files.get(&bundle.bundle_name).cloned(),
                remaining: self.polls_per_load,
                result: None,
            }))
        }
    }

    fn loader(fs: MemoryFileSystem, limiter: &LoadLimiter) -> LoadBundleFileOperation {
        let manifest = crate::manifest::tests::shared_shader_manifest();
        LoadBundleFileOperation::new(
            1,
            manifest.bundle(1).unwrap().clone(),
            Rc::new(fs),
            limiter.clone(),
        )
    }

    #[test]
    fn test_load_and_destroy() {
        let manifest = crate::manifest::tests::shared_shader_manifest();
        let limiter = LoadLimiter::new(4);
        let loader = RefCell::new(loader(MemoryFileSystem::for_manifest(&manifest, 1), &limiter));
        loader.borrow_mut().reference();
        loader.borrow_mut().start_operation();

        assert!(!update_and_notify(&loader, &TimeSlice::unbounded()));
        assert!(loader.borrow().is_loading());
        assert_eq!(limiter.in_flight(), 1);
        assert!(!loader.borrow().can_release());

        assert!(update_and_notify(&loader, &TimeSlice::unbounded()));
        assert_eq!(limiter.in_flight(), 0);
        assert_eq!(loader.borrow().result().unwrap().bytes(), b"ui.b");

        loader.borrow_mut().release();
        assert!(loader.borrow().can_release());
        loader.borrow_mut().destroy_loader();
        assert!(loader.borrow().is_destroyed());
        assert!(loader.borrow().result().is_none());
        // A successful load stays successful after destruction.
        assert_eq!(loader.borrow().status(), OperationStatus::Succeed);
    }

    #[test]
    fn test_waits_for_a_slot() {
        let manifest = crate::manifest::tests::shared_shader_manifest();
        let limiter = LoadLimiter::new(1);
        let held = limiter.try_acquire().unwrap();
        let loader = RefCell::new(loader(MemoryFileSystem::for_manifest(&manifest, 0), &limiter));
        loader.borrow_mut().start_operation();

        for _ in 0..3 {
            assert!(!update_and_notify(&loader, &TimeSlice::unbounded()));
            assert!(!loader.borrow().is_loading());
        }
        drop(held);
        assert!(update_and_notify(&loader, &TimeSlice::unbounded()));
        assert_eq!(loader.borrow().status(), OperationStatus::Succeed);
    }

    #[test]
    fn test_failure_is_terminal_and_wrapped() {
        let limiter = LoadLimiter::new(1);
        let loader = RefCell::new(loader(MemoryFileSystem::default(), &limiter));
        assert_eq!(wait_and_notify(&loader), OperationStatus::Failed);
        let err = loader.borrow().error().cloned().unwrap();
        assert_eq!(err.code(), "io_failed");
        assert!(err.to_string().starts_with("bundle ui.bundle failed while loading"));
        // No retry at this layer.
        update_and_notify(&loader, &TimeSlice::unbounded());
        assert_eq!(loader.borrow().status(), OperationStatus::Failed);
    }

    #[test]
    fn test_abort_releases_slot() {
        let manifest = crate::manifest::tests::shared_shader_manifest();
        let limiter = LoadLimiter::new(1);
        let loader = RefCell::new(loader(MemoryFileSystem::for_manifest(&manifest, 10), &limiter));
        loader.borrow_mut().start_operation();
        update_and_notify(&loader, &TimeSlice::unbounded());
        assert_eq!(limiter.in_flight(), 1);

        abort_and_notify(&loader);
        assert!(loader.borrow().error().unwrap().is_aborted());
        assert_eq!(limiter.in_flight(), 0);
        assert!(loader.borrow().can_release());
    }

    #[test]
    fn test_destroy_before_start_fails_waiters() {
        let limiter = LoadLimiter::new(1);
        let loader = RefCell::new(loader(MemoryFileSystem::default(), &limiter));
        loader.borrow_mut().destroy_loader();
        assert_eq!(loader.borrow().error().unwrap().code(), "loader_destroyed");
    }

    #[test]
    #[should_panic(expected = "Bundle file loader is not done")]
    fn test_destroy_in_flight_panics() {
        let manifest = crate::manifest::tests::shared_shader_manifest();
        let limiter = LoadLimiter::new(1);
        let loader = RefCell::new(loader(MemoryFileSystem::for_manifest(&manifest, 10), &limiter));
        loader.borrow_mut().start_operation();
        update_and_notify(&loader, &TimeSlice::unbounded());
        loader.borrow_mut().destroy_loader();
    }

    #[test]
    #[should_panic(expected = "Bundle file loader ref is not zero")]
    fn test_destroy_referenced_panics() {
        let limiter = LoadLimiter::new(1);
        let mut loader = loader(MemoryFileSystem::default(), &limiter);
        loader.reference();
        loader.destroy_loader();
    }

    #[test]
    #[should_panic(expected = "released more often than referenced")]
    fn test_release_below_zero_panics() {
        let limiter = LoadLimiter::new(1);
        loader(MemoryFileSystem::default(), &limiter).release();
    }
}
