//! Where a package keeps its manifests on disk.
//!
//! For a package `P` and version `V`, the root directory holds:
//!
//! - `P_V.bytes`: the binary manifest.
//! - `P_V.hash`: the lowercase hex sha256 of the `.bytes` file.
//! - `P.version`: the version currently applied.
//!
//! A version is only ever applied once its manifest and hash are on disk and agree with each other.
use std::cell::RefCell;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, error};
use sha2::{Digest, Sha256};

use crate::*;

/// The `.hash` companion of a manifest.
pub fn manifest_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Check manifest bytes against their `.hash` companion.
pub fn verify_manifest_data(data: &[u8], hash: &str) -> Result<(), OperationError> {
    if data.is_empty() {
        return Err(ManifestError::EmptyBuffer.into());
    }
    let actual = manifest_hash(data);
    if !actual.eq_ignore_ascii_case(hash.trim()) {
        return Err(OperationError::Verification {
            what: "manifest".into(),
            message: format!("expected hash {}, got {}", hash.trim(), actual),
        });
    }
    Ok(())
}

/// Write through a temporary file, so readers never see a half written file.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), OperationError> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".temp");
    let temp = PathBuf::from(temp);
    fs::write(&temp, data).map_err(|e| OperationError::io(format!("writing {}", temp.display()), &e))?;
    fs::rename(&temp, path).map_err(|e| OperationError::io(format!("moving {} into place", path.display()), &e))
}

fn read(path: &Path) -> Result<Vec<u8>, OperationError> {
    fs::read(path).map_err(|e| OperationError::io(format!("reading {}", path.display()), &e))
}

#[derive(Clone, Debug)]
pub struct PackageFiles {
    root: PathBuf,
    package_name: String,
}

impl PackageFiles {
    pub fn new(root: &Path, package_name: impl Into<String>) -> PackageFiles {
        PackageFiles {
            root: root.to_path_buf(),
            package_name: package_name.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn manifest_bytes_path(&self, version: &str) -> PathBuf {
        self.root
            .join(format!("{}_{}.bytes", self.package_name, version))
    }

    pub fn manifest_hash_path(&self, version: &str) -> PathBuf {
        self.root
            .join(format!("{}_{}.hash", self.package_name, version))
    }

    pub fn version_path(&self) -> PathBuf {
        self.root.join(format!("{}.version", self.package_name))
    }

    pub fn has_manifest(&self, version: &str) -> bool {
        self.manifest_bytes_path(version).is_file() && self.manifest_hash_path(version).is_file()
    }

    /// Store manifest bytes for a version along with their hash, which is returned.
    pub fn save_manifest(&self, version: &str, data: &[u8]) -> Result<String, OperationError> {
        fs::create_dir_all(&self.root)
            .map_err(|e| OperationError::io(format!("creating {}", self.root.display()), &e))?;
        let hash = manifest_hash(data);
        write_atomic(&self.manifest_bytes_path(version), data)?;
        write_atomic(&self.manifest_hash_path(version), hash.as_bytes())?;
        debug!("Saved manifest {} {}", self.package_name, version);
        Ok(hash)
    }

    /// Read the manifest bytes of a version, verified against the stored hash.
    pub fn read_manifest_data(&self, version: &str) -> Result<Vec<u8>, OperationError> {
        let data = read(&self.manifest_bytes_path(version))?;
        let hash = read(&self.manifest_hash_path(version))?;
        let hash = String::from_utf8_lossy(&hash);
        verify_manifest_data(&data, &hash).map_err(|e| {
            error!("Manifest {} {} is corrupt: {}", self.package_name, version, e);
            e
        })?;
        Ok(data)
    }

    /// Check that a decoded manifest is the one this package expects for `version`.
    pub fn verify_manifest_version(&self, manifest: &PackageManifest, version: &str) -> Result<(), OperationError> {
        if manifest.package_name() != self.package_name || manifest.package_version() != version {
            return Err(OperationError::Verification {
                what: "manifest".into(),
                message: format!(
                    "expected {} {}, found {} {}",
                    self.package_name,
                    version,
                    manifest.package_name(),
                    manifest.package_version()
                ),
            });
        }
        Ok(())
    }

    /// Read, verify and decode the manifest of a version in one pass.
    pub fn load_manifest(
        &self,
        version: &str,
        services: Option<&dyn ManifestRestoreServices>,
    ) -> Result<PackageManifest, OperationError> {
        let data = self.read_manifest_data(version)?;
        let manifest = match services {
            Some(s) => deserialize_manifest_with(&data, s)?,
            None => deserialize_manifest(&data)?,
        };
        self.verify_manifest_version(&manifest, version)?;
        Ok(manifest)
    }

    /// Read and verify the manifest of a version, returning an operation which decodes it across ticks.
    pub fn load_manifest_operation(
        &self,
        version: &str,
        services: Option<Box<dyn ManifestRestoreServices>>,
    ) -> Result<DeserializeManifestOperation, OperationError> {
        let data = self.read_manifest_data(version)?;
        Ok(DeserializeManifestOperation::new(data, services))
    }

    /// The applied version, or `None` if no version has been applied yet.
    pub fn applied_version(&self) -> Result<Option<String>, OperationError> {
        let path = self.version_path();
        match fs::read_to_string(&path) {
            Ok(v) => Ok(Some(v.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OperationError::io(format!("reading {}", path.display()), &e)),
        }
    }

    /// Point the package at a version whose manifest is already saved and intact.
    pub fn apply_version(&self, version: &str) -> Result<(), OperationError> {
        self.read_manifest_data(version)?;
        write_atomic(&self.version_path(), version.as_bytes())?;
        debug!("Applied manifest {} {}", self.package_name, version);
        Ok(())
    }

    /// Delete the manifest of a version.  The applied version cannot be removed.
    pub fn remove_manifest(&self, version: &str) -> Result<(), OperationError> {
        if self.applied_version()?.as_deref() == Some(version) {
            return Err(OperationError::Io {
                context: format!("removing manifest {} {}", self.package_name, version),
                kind: ErrorKind::PermissionDenied,
                message: "version is applied".into(),
            });
        }
        for path in &[self.manifest_bytes_path(version), self.manifest_hash_path(version)] {
            match fs::remove_file(path) {
                Err(e) if e.kind() != ErrorKind::NotFound => {
                    return Err(OperationError::io(format!("removing {}", path.display()), &e))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Decodes the saved manifest of a version across ticks, checks it is that version, and applies it.
///
/// Succeeds only once the `.version` pointer names the decoded manifest.
pub struct LoadPackageManifestOperation {
    core: OperationCore,
    files: PackageFiles,
    version: String,
    decode: Rc<RefCell<DeserializeManifestOperation>>,
    manifest: Option<Rc<PackageManifest>>,
}

impl LoadPackageManifestOperation {
    pub fn new(
        files: PackageFiles,
        version: &str,
        services: Option<Box<dyn ManifestRestoreServices>>,
    ) -> Result<LoadPackageManifestOperation, OperationError> {
        let decode = Rc::new(RefCell::new(files.load_manifest_operation(version, services)?));
        let mut core = OperationCore::new();
        core.add_child(decode.clone());
        Ok(LoadPackageManifestOperation {
            core,
            files,
            version: version.to_string(),
            decode,
            manifest: None,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// The applied manifest, once the operation has succeeded.
    pub fn manifest(&self) -> Option<Rc<PackageManifest>> {
        self.manifest.clone()
    }

    fn check_and_apply(&self, manifest: &PackageManifest) -> Result<(), OperationError> {
        self.files.verify_manifest_version(manifest, &self.version)?;
        self.files.apply_version(&self.version)
    }
}

impl AsyncOperation for LoadPackageManifestOperation {
    fn core(&self) -> &OperationCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut OperationCore {
        &mut self.core
    }

    fn internal_start(&mut self) {
        self.decode.borrow_mut().start_operation();
    }

    fn internal_update(&mut self, slice: &TimeSlice) {
        let done = if self.core.is_waiting_sync() {
            wait_and_notify(&*self.decode);
            true
        } else {
            update_and_notify(&*self.decode, slice)
        };
        self.core.set_progress(self.decode.borrow().progress());
        if !done {
            return;
        }

        let decoded = {
            let decode = self.decode.borrow();
            match (decode.error(), decode.manifest()) {
                (Some(e), _) => Err(e.clone()),
                (None, Some(m)) => Ok(m),
                (None, None) => Err(OperationError::NotLoaded(self.version.clone())),
            }
        };
        match decoded.and_then(|m| self.check_and_apply(&m).map(|_| m)) {
            Ok(manifest) => {
                self.manifest = Some(manifest);
                self.core.succeed();
            }
            Err(e) => {
                error!(
                    "Failed to load manifest {} {}: {}",
                    self.files.package_name, self.version, e
                );
                self.core.fail(e);
            }
        }
    }

    fn description(&self) -> String {
        format!("LoadPackageManifestOperation({} {})", self.files.package_name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::tests::shared_shader_manifest;

    fn files() -> (tempfile::TempDir, PackageFiles) {
        let dir = tempfile::tempdir().unwrap();
        let files = PackageFiles::new(&dir.path().join("manifests"), "DefaultPackage");
        (dir, files)
    }

    #[test]
    fn test_layout() {
        let (_dir, files) = files();
        assert!(files
            .manifest_bytes_path("v1")
            .ends_with("manifests/DefaultPackage_v1.bytes"));
        assert!(files
            .manifest_hash_path("v1")
            .ends_with("manifests/DefaultPackage_v1.hash"));
        assert!(files.version_path().ends_with("manifests/DefaultPackage.version"));
    }

    #[test]
    fn test_hash() {
        assert_eq!(
            manifest_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(verify_manifest_data(b"abc", &manifest_hash(b"abc").to_uppercase()).is_ok());
        assert_eq!(
            verify_manifest_data(b"abd", &manifest_hash(b"abc")).unwrap_err().code(),
            "verification_failed"
        );
        assert_eq!(verify_manifest_data(b"", "").unwrap_err().code(), "manifest_empty");
    }

    #[test]
    fn test_save_apply_load() {
        let (_dir, files) = files();
        let manifest = shared_shader_manifest();
        let data = manifest.to_bytes().unwrap();

        assert_eq!(files.applied_version().unwrap(), None);
        assert!(!files.has_manifest("v1"));
        let hash = files.save_manifest("v1", &data).unwrap();
        assert_eq!(hash, manifest_hash(&data));
        assert!(files.has_manifest("v1"));

        files.apply_version("v1").unwrap();
        assert_eq!(files.applied_version().unwrap().as_deref(), Some("v1"));

        let loaded = files.load_manifest("v1", None).unwrap();
        assert_eq!(loaded.bundles(), manifest.bundles());
        assert_eq!(loaded.assets(), manifest.assets());
    }

    #[test]
    fn test_corrupt_manifest_is_rejected() {
        let (_dir, files) = files();
        let data = shared_shader_manifest().to_bytes().unwrap();
        files.save_manifest("v1", &data).unwrap();

        let mut tampered = data.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xff;
        std::fs::write(files.manifest_bytes_path("v1"), &tampered).unwrap();

        assert_eq!(files.load_manifest("v1", None).unwrap_err().code(), "verification_failed");
        assert_eq!(files.apply_version("v1").unwrap_err().code(), "verification_failed");
        assert_eq!(files.applied_version().unwrap(), None);
    }

    #[test]
    fn test_apply_requires_saved_manifest() {
        let (_dir, files) = files();
        let err = files.apply_version("v2").unwrap_err();
        assert_eq!(err.code(), "io_failed");
        assert!(matches!(err, OperationError::Io { kind: ErrorKind::NotFound, .. }));
    }

    #[test]
    fn test_version_mismatch() {
        let (_dir, files) = files();
        let data = shared_shader_manifest().to_bytes().unwrap();
        files.save_manifest("v2", &data).unwrap();
        assert_eq!(files.load_manifest("v2", None).unwrap_err().code(), "verification_failed");
    }

    #[test]
    fn test_load_operation() {
        let (_dir, files) = files();
        files
            .save_manifest("v1", &shared_shader_manifest().to_bytes().unwrap())
            .unwrap();

        let op = std::cell::RefCell::new(files.load_manifest_operation("v1", None).unwrap());
        assert_eq!(wait_and_notify(&op), OperationStatus::Succeed);
        let manifest = op.borrow().manifest().unwrap();
        assert_eq!(manifest.package_version(), "v1");
        assert_eq!(manifest.bundles().len(), 3);
    }

    #[test]
    fn test_load_package_manifest_operation() {
        let (_dir, files) = files();
        let data = shared_shader_manifest().to_bytes().unwrap();
        files.save_manifest("v1", &data).unwrap();
        files.save_manifest("v2", &data).unwrap();

        let op = std::cell::RefCell::new(LoadPackageManifestOperation::new(files.clone(), "v1", None).unwrap());
        assert_eq!(wait_and_notify(&op), OperationStatus::Succeed);
        assert_eq!(op.borrow().manifest().unwrap().package_version(), "v1");
        assert_eq!(files.applied_version().unwrap().as_deref(), Some("v1"));

        // The v2 file holds a v1 manifest: nothing is applied.
        let op = std::cell::RefCell::new(LoadPackageManifestOperation::new(files.clone(), "v2", None).unwrap());
        assert_eq!(wait_and_notify(&op), OperationStatus::Failed);
        assert_eq!(op.borrow().error().unwrap().code(), "verification_failed");
        assert!(op.borrow().manifest().is_none());
        assert_eq!(files.applied_version().unwrap().as_deref(), Some("v1"));
    }

    #[test]
    fn test_remove_manifest() {
        let (_dir, files) = files();
        let data = shared_shader_manifest().to_bytes().unwrap();
        files.save_manifest("v1", &data).unwrap();
        files.save_manifest("v0", &data).unwrap();
        files.apply_version("v1").unwrap();

        assert!(files.remove_manifest("v1").is_err());
        files.remove_manifest("v0").unwrap();
        assert!(!files.has_manifest("v0"));
        files.remove_manifest("v0").unwrap();
        assert!(files.has_manifest("v1"));
    }
}
