use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::debug;

use crate::*;

/// A file system which is backed by a given root directory, holding bundle files under their file names.
///
/// This handles the rather tricky path cases around Windows and Linux differences, and makes a best effort to
/// disallow bundle names which would use relative paths to escape the root directory, primarily as a measure to detect
/// bugs in manifests.
#[derive(Debug)]
pub struct DirectoryFileSystem {
    root_path: PathBuf,
}

fn conv_path(path: &str) -> Result<relative_path::RelativePathBuf, OperationError> {
    relative_path::RelativePathBuf::from_path(path).map_err(|_| OperationError::Io {
        context: format!("resolving {}", path),
        kind: std::io::ErrorKind::InvalidInput,
        message: "invalid path".into(),
    })
}

impl DirectoryFileSystem {
    pub fn new(root_path: &Path) -> DirectoryFileSystem {
        DirectoryFileSystem {
            root_path: root_path.to_path_buf(),
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Resolve a path relative to the root, refusing to leave it.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, OperationError> {
        // On Windows, canonicalize is currently very broken when relative path segments appear in the middle of a
        // path, and stdlib doesn't help us out. Go via `RelativePathBuf` to clean it up.
        let absolute = conv_path(path)?.to_logical_path(&self.root_path);
        if !absolute.starts_with(&self.root_path) || absolute == self.root_path {
            return Err(OperationError::Io {
                context: format!("resolving {}", path),
                kind: std::io::ErrorKind::InvalidInput,
                message: "path is outside the root directory".into(),
            });
        }
        Ok(absolute)
    }

    pub fn bundle_path(&self, bundle: &PackageBundle) -> Result<PathBuf, OperationError> {
        self.resolve(bundle.file_name())
    }
}

impl BundleFileSystem for DirectoryFileSystem {
    fn exists(&self, bundle: &PackageBundle) -> bool {
        self.bundle_path(bundle).map_or(false, |p| p.is_file())
    }

    fn read_bytes(&self, bundle: &PackageBundle) -> Result<Vec<u8>, OperationError> {
        let path = self.bundle_path(bundle)?;
        std::fs::read(&path).map_err(|e| OperationError::io(format!("reading {}", path.display()), &e))
    }

    fn load_bundle_file(&self, bundle: &PackageBundle) -> LoadBundleRef {
        Rc::new(RefCell::new(ReadBundleOperation::new(
            bundle,
            self.bundle_path(bundle),
            None,
        )))
    }
}

/// Read a bundle file and check it against the size the manifest records.
fn read_bundle_file(bundle_name: &str, path: &Path, expected_size: u64) -> Result<LoadedBundle, OperationError> {
    let bytes =
        std::fs::read(path).map_err(|e| OperationError::io(format!("reading {}", path.display()), &e))?;
    if bytes.len() as u64 != expected_size {
        return Err(OperationError::Verification {
            what: bundle_name.to_string(),
            message: format!("expected {} bytes, found {}", expected_size, bytes.len()),
        });
    }
    Ok(LoadedBundle::new(bundle_name, bytes))
}

enum ReadStep {
    Download,
    Read,
    Done,
}

/// Loads one bundle from disk, downloading it first if it is not there.
pub struct ReadBundleOperation {
    core: OperationCore,
    bundle_name: String,
    file_size: u64,
    path: Result<PathBuf, OperationError>,
    download: Option<(Rc<DownloadCenter>, DownloadRequest)>,
    downloading: Option<DownloadRef>,
    step: ReadStep,
    downloaded_bytes: u64,
    result: Option<Rc<LoadedBundle>>,
}

impl ReadBundleOperation {
    fn new(
        bundle: &PackageBundle,
        path: Result<PathBuf, OperationError>,
        download: Option<(Rc<DownloadCenter>, DownloadRequest)>,
    ) -> ReadBundleOperation {
        ReadBundleOperation {
            core: OperationCore::new(),
            bundle_name: bundle.bundle_name.clone(),
            file_size: bundle.file_size,
            path,
            download,
            downloading: None,
            step: ReadStep::Read,
            downloaded_bytes: 0,
            result: None,
        }
    }

    fn fail(&mut self, err: OperationError) {
        self.step = ReadStep::Done;
        self.core.fail(err);
    }
}

impl AsyncOperation for ReadBundleOperation {
    fn core(&self) -> &OperationCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut OperationCore {
        &mut self.core
    }

    fn internal_start(&mut self) {
        if let Err(e) = &self.path {
            let err = e.clone().in_bundle(self.bundle_name.clone(), "resolving");
            self.fail(err);
            return;
        }
        if let Some((center, request)) = &self.download {
            let op = center.download(&self.bundle_name, request.clone(), Some(self.file_size));
            op.borrow_mut().start_operation();
            self.downloading = Some(op);
            self.step = ReadStep::Download;
        }
    }

    fn internal_update(&mut self, slice: &TimeSlice) {
        if let ReadStep::Download = self.step {
            let op = match &self.downloading {
                Some(op) => op.clone(),
                None => return,
            };
            if self.core.is_waiting_sync() {
                wait_and_notify(&*op);
            } else {
                update_and_notify(&*op, slice);
            }

            let op = op.borrow();
            self.downloaded_bytes = op.downloaded_bytes();
            self.core.set_progress(op.progress() * 0.9);
            if !op.is_done() {
                return;
            }
            if let Some(e) = op.error() {
                let err = e.clone().in_bundle(self.bundle_name.clone(), "downloading");
                drop(op);
                self.downloading = None;
                self.fail(err);
                return;
            }
            drop(op);
            self.downloading = None;
            self.step = ReadStep::Read;
        }

        if let ReadStep::Read = self.step {
            let loaded = match &self.path {
                Ok(path) => read_bundle_file(&self.bundle_name, path, self.file_size),
                Err(e) => Err(e.clone()),
            };
            match loaded {
                Ok(bundle) => {
                    debug!("Loaded bundle {} ({} bytes)", self.bundle_name, bundle.len());
                    self.step = ReadStep::Done;
                    self.result = Some(Rc::new(bundle));
                    self.core.succeed();
                }
                Err(e) => {
                    let err = e.in_bundle(self.bundle_name.clone(), "reading");
                    self.fail(err);
                }
            }
        }
    }

    fn internal_abort(&mut self) {
        if let Some(op) = self.downloading.take() {
            abort_and_notify(&*op);
        }
        self.step = ReadStep::Done;
    }

    fn description(&self) -> String {
        format!("ReadBundleOperation({})", self.bundle_name)
    }
}

impl LoadBundleOperation for ReadBundleOperation {
    fn result(&self) -> Option<Rc<LoadedBundle>> {
        self.result.clone()
    }

    fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes
    }
}

/// A local cache directory in front of a remote server.
///
/// Bundles missing from the cache, or cached with the wrong size, are downloaded through the [DownloadCenter] before
/// they are read.
pub struct CacheFileSystem {
    cache: DirectoryFileSystem,
    remote_base: String,
    center: Rc<DownloadCenter>,
}

impl CacheFileSystem {
    pub fn new(cache_root: &Path, remote_base: impl Into<String>, center: Rc<DownloadCenter>) -> CacheFileSystem {
        CacheFileSystem {
            cache: DirectoryFileSystem::new(cache_root),
            remote_base: remote_base.into(),
            center,
        }
    }

    pub fn center(&self) -> &Rc<DownloadCenter> {
        &self.center
    }

    pub fn remote_url(&self, bundle: &PackageBundle) -> String {
        format!(
            "{}/{}",
            self.remote_base.trim_end_matches('/'),
            bundle.file_name()
        )
    }

    /// Whether the cached copy of a bundle is complete.
    pub fn is_cached(&self, bundle: &PackageBundle) -> bool {
        self.cache
            .bundle_path(bundle)
            .ok()
            .and_then(|p| std::fs::metadata(p).ok())
            .map_or(false, |m| m.is_file() && m.len() == bundle.file_size)
    }

    fn download_request(&self, bundle: &PackageBundle) -> Result<DownloadRequest, OperationError> {
        Ok(DownloadRequest {
            url: self.remote_url(bundle),
            destination: self.cache.bundle_path(bundle)?,
            resume_from: 0,
            headers: vec![],
        })
    }

    /// Download every bundle of `bundles` that is not cached yet.
    pub fn create_downloader(
        &self,
        bundles: &[&PackageBundle],
        max_concurrent: usize,
    ) -> Result<BundleDownloaderOperation, OperationError> {
        let mut items = Vec::new();
        for bundle in bundles.iter().filter(|b| !self.is_cached(b)) {
            items.push(DownloadItem {
                key: bundle.bundle_name.clone(),
                request: self.download_request(bundle)?,
                size: bundle.file_size,
            });
        }
        Ok(BundleDownloaderOperation::new(
            self.center.clone(),
            items,
            max_concurrent,
        ))
    }
}

impl BundleFileSystem for CacheFileSystem {
    fn exists(&self, bundle: &PackageBundle) -> bool {
        self.is_cached(bundle)
    }

    fn read_bytes(&self, bundle: &PackageBundle) -> Result<Vec<u8>, OperationError> {
        self.cache.read_bytes(bundle)
    }

    fn load_bundle_file(&self, bundle: &PackageBundle) -> LoadBundleRef {
        let download = if self.is_cached(bundle) {
            None
        } else {
            self.download_request(bundle)
                .ok()
                .map(|r| (self.center.clone(), r))
        };
        Rc::new(RefCell::new(ReadBundleOperation::new(
            bundle,
            self.cache.bundle_path(bundle),
            download,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::tests::MemoryFetch;
    use crate::manifest::tests::shared_shader_manifest;

    fn load(fs: &dyn BundleFileSystem, bundle: &PackageBundle) -> LoadBundleRef {
        let op = fs.load_bundle_file(bundle);
        wait_and_notify(&*op);
        op
    }

    #[test]
    fn test_directory_file_system() {
        let tmp_dir = tempfile::tempdir().unwrap();

        // Create a directory under the temporary directory so that we can test relative paths.
        let root = tmp_dir.path().join("actual_dir");
        std::fs::create_dir(&root).unwrap();
        let fs = DirectoryFileSystem::new(&root);
        let manifest = shared_shader_manifest();
        let ui = manifest.bundle(1).unwrap();
        let level = manifest.bundle(2).unwrap();

        std::fs::write(root.join(ui.file_name()), "abcd").unwrap();
        // Wrong size on disk.
        std::fs::write(root.join(level.file_name()), "ab").unwrap();
        // Something outside the root.
        std::fs::write(tmp_dir.path().join("d"), "dddd").unwrap();

        assert!(fs.exists(ui));
        assert!(!fs.exists(manifest.bundle(0).unwrap()));
        assert_eq!(fs.read_text(ui).unwrap(), "abcd");

        let op = load(&fs, ui);
        let op = op.borrow();
        assert_eq!(op.status(), OperationStatus::Succeed);
        assert_eq!(op.result().unwrap().bytes(), b"abcd");
        assert_eq!(op.result().unwrap().bundle_name(), "ui.bundle");

        let op = load(&fs, level);
        assert_eq!(
            op.borrow().error().unwrap().code(),
            "verification_failed"
        );

        let op = load(&fs, manifest.bundle(0).unwrap());
        let err = op.borrow().error().cloned().unwrap();
        assert_eq!(err.code(), "io_failed");
        assert!(err
            .to_string()
            .starts_with("bundle shaders.bundle failed while reading"));

        // Paths outside the root get a specific error.
        let mut escaping = PackageBundle::new("escape");
        escaping.file_name = "../d".into();
        escaping.file_size = 4;
        assert!(!fs.exists(&escaping));
        let op = load(&fs, &escaping);
        let err = op.borrow().error().cloned().unwrap();
        assert!(err.to_string().contains("outside the root directory"));
    }

    #[test]
    fn test_cache_file_system_downloads_missing_bundles() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let manifest = shared_shader_manifest();
        let ui = manifest.bundle(1).unwrap();
        let fetch = Rc::new(
            MemoryFetch::default().with_file(&format!("http://cdn/v1/{}", ui.file_name()), b"abcd"),
        );
        let center = DownloadCenter::new("DefaultPackage", fetch.clone(), Default::default());
        let fs = CacheFileSystem::new(tmp_dir.path(), "http://cdn/v1/", center);

        assert!(!fs.exists(ui));
        assert_eq!(fs.remote_url(ui), format!("http://cdn/v1/{}", ui.file_name()));
        let op = load(&fs, ui);
        assert_eq!(op.borrow().status(), OperationStatus::Succeed);
        assert_eq!(op.borrow().downloaded_bytes(), 4);
        assert!(fs.exists(ui));
        assert_eq!(fetch.fetches.get(), 1);

        // Cached now.
        let op = load(&fs, ui);
        assert_eq!(op.borrow().result().unwrap().bytes(), b"abcd");
        assert_eq!(fetch.fetches.get(), 1);

        let op = load(&fs, manifest.bundle(2).unwrap());
        let err = op.borrow().error().cloned().unwrap();
        assert_eq!(err.code(), "fetch_failed");
        assert!(err
            .to_string()
            .starts_with("bundle level.bundle failed while downloading"));
    }

    #[test]
    fn test_create_downloader_skips_cached() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let manifest = shared_shader_manifest();
        let bundles: Vec<_> = manifest.bundles().iter().collect();
        let mut fetch = MemoryFetch::default();
        for b in &bundles {
            fetch = fetch.with_file(&format!("http://cdn/{}", b.file_name()), b"abcd");
        }
        let fetch = Rc::new(fetch);
        let center = DownloadCenter::new("DefaultPackage", fetch.clone(), Default::default());
        let fs = CacheFileSystem::new(tmp_dir.path(), "http://cdn", center);
        std::fs::write(tmp_dir.path().join(bundles[0].file_name()), "abcd").unwrap();

        let downloader = fs.create_downloader(&bundles, 2).unwrap();
        assert_eq!(downloader.total_count(), 2);
        assert_eq!(downloader.total_bytes(), 8);
        let downloader = RefCell::new(downloader);
        assert_eq!(wait_and_notify(&downloader), OperationStatus::Succeed);
        assert!(bundles.iter().all(|b| fs.exists(b)));
        assert_eq!(fetch.fetches.get(), 2);
    }
}
