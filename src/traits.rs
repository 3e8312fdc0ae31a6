//! The [BundleFileSystem] trait is responsible for turning a [PackageBundle] into the bytes of a [LoadedBundle].
//!
//! The loader only ever sees bundles through this trait, then uses an [AssetDecoder] on a loaded bundle when an asset
//! is actually wanted.
use std::cell::RefCell;
use std::io::Read;
use std::rc::Rc;

use crate::*;

/// The contents of a bundle file, once loaded.
#[derive(Debug, PartialEq, Eq)]
pub struct LoadedBundle {
    bundle_name: String,
    bytes: Vec<u8>,
}

impl LoadedBundle {
    pub fn new(bundle_name: impl Into<String>, bytes: Vec<u8>) -> LoadedBundle {
        LoadedBundle {
            bundle_name: bundle_name.into(),
            bytes,
        }
    }

    pub fn bundle_name(&self) -> &str {
        &self.bundle_name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Run a decoder over this bundle for one of its assets.
    pub fn decode<D: AssetDecoder>(
        &self,
        decoder: &D,
        asset: &PackageAsset,
    ) -> Result<D::Output, OperationError> {
        decoder
            .decode(asset, &self.bytes[..])
            .map_err(|e| OperationError::Decode {
                asset: asset.asset_path.clone(),
                message: e.to_string(),
            })
    }
}

/// An operation producing a [LoadedBundle].
pub trait LoadBundleOperation: AsyncOperation {
    /// Set once the operation succeeds.
    fn result(&self) -> Option<Rc<LoadedBundle>>;

    /// Bytes fetched from remote so far.  Bundles already on disk report 0.
    fn downloaded_bytes(&self) -> u64 {
        0
    }
}

pub type LoadBundleRef = Rc<RefCell<dyn LoadBundleOperation>>;

/// Where bundle files live.
pub trait BundleFileSystem {
    /// Whether the bundle can be read without fetching it first.
    fn exists(&self, bundle: &PackageBundle) -> bool;

    fn read_bytes(&self, bundle: &PackageBundle) -> Result<Vec<u8>, OperationError>;

    fn read_text(&self, bundle: &PackageBundle) -> Result<String, OperationError> {
        let bytes = self.read_bytes(bundle)?;
        String::from_utf8(bytes).map_err(|e| OperationError::Decode {
            asset: bundle.bundle_name.clone(),
            message: e.to_string(),
        })
    }

    /// Start loading a bundle.  The returned operation has not been started.
    fn load_bundle_file(&self, bundle: &PackageBundle) -> LoadBundleRef;
}

/// An `AssetDecoder` knows how to get from the bytes of a bundle to one of its assets in memory.
pub trait AssetDecoder {
    type Output;
    type Error: std::error::Error;

    fn decode<R: Read>(&self, asset: &PackageAsset, reader: R) -> Result<Self::Output, Self::Error>;
}
