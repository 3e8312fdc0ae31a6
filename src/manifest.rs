//! The in-memory package manifest: which logical assets exist, which physical bundles hold them, and how bundles
//! depend on each other.
//!
//! A [PackageManifest] is built once, by [ManifestBuilder] or [PackageManifest::new], and is immutable afterwards.
//! Building validates every bundle id, computes the reverse dependency edges used for safe bundle destruction, and
//! rejects dependency cycles.
use std::collections::HashMap;

use ahash::RandomState;
use log::warn;

use crate::buffer::BufferError;

type ManifestMap<V> = HashMap<String, V, RandomState>;

/// Index of a bundle within its manifest's bundle list.
pub type BundleId = usize;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest buffer is empty")]
    EmptyBuffer,
    #[error("invalid manifest file signature {found:#x}")]
    InvalidSignature { found: u32 },
    #[error("manifest file version {found} is not compatible with {expected}")]
    IncompatibleVersion {
        found: String,
        expected: &'static str,
    },
    #[error("addressable manifests do not support location to lower")]
    AddressableWithLowercase,
    #[error("replacing asset paths with addresses requires addressable")]
    ReplacePathWithoutAddressable,
    #[error("malformed manifest: {0}")]
    Buffer(#[from] BufferError),
    #[error("invalid {what}: {value}")]
    InvalidValue { what: &'static str, value: i64 },
    #[error("unknown output name style {0}")]
    UnknownNameStyle(i32),
    #[error("asset {asset_path} references invalid bundle id {bundle_id}")]
    InvalidBundleId { asset_path: String, bundle_id: usize },
    #[error("bundle {bundle_name} depends on invalid bundle id {bundle_id}")]
    InvalidDependId {
        bundle_name: String,
        bundle_id: usize,
    },
    #[error("asset path already exists: {0}")]
    DuplicateAssetPath(String),
    #[error("location already exists: {0}")]
    DuplicateLocation(String),
    #[error("asset guid already exists: {0}")]
    DuplicateGuid(String),
    #[error("bundle name already exists: {0}")]
    DuplicateBundleName(String),
    #[error("bundle dependency cycle through {0}")]
    DependencyCycle(String),
    #[error("manifest restore failed: {0}")]
    Restore(String),
}

/// How bundle files are named on the remote server and in the local cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileNameStyle {
    HashName,
    BundleName,
    BundleNameHashName,
}

impl FileNameStyle {
    pub fn from_i32(value: i32) -> Result<FileNameStyle, ManifestError> {
        match value {
            0 => Ok(FileNameStyle::HashName),
            1 => Ok(FileNameStyle::BundleName),
            2 => Ok(FileNameStyle::BundleNameHashName),
            other => Err(ManifestError::UnknownNameStyle(other)),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            FileNameStyle::HashName => 0,
            FileNameStyle::BundleName => 1,
            FileNameStyle::BundleNameHashName => 2,
        }
    }

    /// Compute the remote file name of a bundle.
    pub fn file_name(self, bundle_name: &str, file_hash: &str) -> String {
        let ext = file_extension(bundle_name);
        match self {
            FileNameStyle::HashName => format!("{}{}", file_hash, ext),
            FileNameStyle::BundleName => bundle_name.to_string(),
            FileNameStyle::BundleNameHashName => {
                let stem = &bundle_name[..bundle_name.len() - ext.len()];
                format!("{}_{}{}", stem, file_hash, ext)
            }
        }
    }
}

/// The extension of the last path segment including its dot, or `""`.
fn file_extension(path: &str) -> &str {
    let segment_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
    match path[segment_start..].rfind('.') {
        Some(i) => &path[segment_start + i..],
        None => "",
    }
}

/// Global settings of a manifest, read before any record.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ManifestHeader {
    pub file_version: String,
    pub enable_addressable: bool,
    pub support_extensionless: bool,
    pub location_to_lower: bool,
    pub include_asset_guid: bool,
    pub replace_asset_path_with_address: bool,
    pub output_name_style: i32,
    pub build_bundle_type: i32,
    pub build_pipeline: String,
    pub package_name: String,
    pub package_version: String,
    pub package_note: String,
}

impl ManifestHeader {
    /// Reject flag combinations the lookup tables cannot honour.
    pub fn validate(&self) -> Result<FileNameStyle, ManifestError> {
        if self.enable_addressable && self.location_to_lower {
            return Err(ManifestError::AddressableWithLowercase);
        }
        if !self.enable_addressable && self.replace_asset_path_with_address {
            return Err(ManifestError::ReplacePathWithoutAddressable);
        }
        FileNameStyle::from_i32(self.output_name_style)
    }

    fn replaces_asset_path(&self) -> bool {
        self.enable_addressable && self.replace_asset_path_with_address
    }
}

/// A logical asset and the bundles needed to load it.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct PackageAsset {
    pub address: String,
    pub asset_path: String,
    pub asset_guid: String,
    pub asset_tags: Vec<String>,
    pub bundle_id: BundleId,
    /// Every bundle the main bundle needs, flattened.
    pub depend_bundle_ids: Vec<BundleId>,
}

impl PackageAsset {
    pub fn has_tag(&self, tags: &[&str]) -> bool {
        self.asset_tags.iter().any(|t| tags.contains(&t.as_str()))
    }
}

/// A physical bundle file.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct PackageBundle {
    pub bundle_name: String,
    /// CRC recorded by the build engine, carried through untouched.
    pub engine_crc: u32,
    pub file_hash: String,
    pub file_crc: u32,
    pub file_size: u64,
    pub encrypted: bool,
    pub tags: Vec<String>,
    pub depend_bundle_ids: Vec<BundleId>,
    pub(crate) reference_bundle_ids: Vec<BundleId>,
    pub(crate) file_name: String,
}

impl PackageBundle {
    pub fn new(bundle_name: impl Into<String>) -> PackageBundle {
        PackageBundle {
            bundle_name: bundle_name.into(),
            ..Default::default()
        }
    }

    /// Bundles that depend on this one.  Filled in when the owning manifest is built.
    pub fn reference_bundle_ids(&self) -> &[BundleId] {
        &self.reference_bundle_ids
    }

    /// Remote and cache file name.  Filled in when the owning manifest is built.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn has_tag(&self, tags: &[&str]) -> bool {
        self.tags.iter().any(|t| tags.contains(&t.as_str()))
    }
}

/// Incrementally assembles a [PackageManifest], one record at a time.
///
/// Used directly by the time-sliced decoder, so that each record can be validated as soon as it is read.
#[derive(Debug)]
pub struct ManifestBuilder {
    header: ManifestHeader,
    name_style: FileNameStyle,
    assets: Vec<PackageAsset>,
    bundles: Vec<PackageBundle>,
    asset_by_path: ManifestMap<usize>,
    location_to_asset: ManifestMap<usize>,
    guid_to_asset: ManifestMap<usize>,
    bundle_by_name: ManifestMap<BundleId>,
    bundle_by_file_name: ManifestMap<BundleId>,
}

impl ManifestBuilder {
    pub fn new(header: ManifestHeader) -> Result<ManifestBuilder, ManifestError> {
        let name_style = header.validate()?;
        Ok(ManifestBuilder {
            header,
            name_style,
            assets: Vec::new(),
            bundles: Vec::new(),
            asset_by_path: Default::default(),
            location_to_asset: Default::default(),
            guid_to_asset: Default::default(),
            bundle_by_name: Default::default(),
            bundle_by_file_name: Default::default(),
        })
    }

    pub fn header(&self) -> &ManifestHeader {
        &self.header
    }

    pub fn reserve(&mut self, assets: usize, bundles: usize) {
        self.assets.reserve(assets);
        self.bundles.reserve(bundles);
    }

    fn location_key(&self, location: &str) -> String {
        if self.header.location_to_lower {
            location.to_lowercase()
        } else {
            location.to_string()
        }
    }

    fn add_location(&mut self, location: &str, index: usize) -> Result<(), ManifestError> {
        let key = self.location_key(location);
        if self.location_to_asset.contains_key(&key) {
            return Err(ManifestError::DuplicateLocation(location.to_string()));
        }
        self.location_to_asset.insert(key, index);
        Ok(())
    }

    pub fn push_asset(&mut self, mut asset: PackageAsset) -> Result<(), ManifestError> {
        if self.header.replaces_asset_path() {
            asset.asset_path = asset.address.clone();
        }
        let index = self.assets.len();

        // Asset paths must be unique regardless of any location mapping.
        if self.asset_by_path.contains_key(&asset.asset_path) {
            return Err(ManifestError::DuplicateAssetPath(asset.asset_path));
        }
        self.asset_by_path.insert(asset.asset_path.clone(), index);
        self.add_location(&asset.asset_path, index)?;

        if self.header.support_extensionless {
            let ext = file_extension(&asset.asset_path);
            if !ext.is_empty() {
                let stem = &asset.asset_path[..asset.asset_path.len() - ext.len()];
                let key = self.location_key(stem);
                if self.location_to_asset.contains_key(&key) {
                    warn!("Location already exists: {}", stem);
                } else {
                    self.location_to_asset.insert(key, index);
                }
            }
        }

        if self.header.include_asset_guid {
            if self.guid_to_asset.contains_key(&asset.asset_guid) {
                return Err(ManifestError::DuplicateGuid(asset.asset_guid));
            }
            self.guid_to_asset.insert(asset.asset_guid.clone(), index);
        }

        if self.header.enable_addressable
            && !self.header.replace_asset_path_with_address
            && !asset.address.is_empty()
        {
            self.add_location(&asset.address, index)?;
        }

        self.assets.push(asset);
        Ok(())
    }

    pub fn push_bundle(&mut self, mut bundle: PackageBundle) -> Result<(), ManifestError> {
        let id = self.bundles.len();
        if self.bundle_by_name.contains_key(&bundle.bundle_name) {
            return Err(ManifestError::DuplicateBundleName(bundle.bundle_name));
        }
        bundle.file_name = self
            .name_style
            .file_name(&bundle.bundle_name, &bundle.file_hash);
        bundle.reference_bundle_ids.clear();
        self.bundle_by_name.insert(bundle.bundle_name.clone(), id);
        self.bundle_by_file_name.insert(bundle.file_name.clone(), id);
        self.bundles.push(bundle);
        Ok(())
    }

    /// Validate every id, link the reverse edges and check the graph is acyclic.
    pub fn finish(mut self) -> Result<PackageManifest, ManifestError> {
        let bundle_count = self.bundles.len();
        let mut bundle_main_assets = vec![Vec::new(); bundle_count];

        for (index, asset) in self.assets.iter().enumerate() {
            if asset.bundle_id >= bundle_count {
                return Err(ManifestError::InvalidBundleId {
                    asset_path: asset.asset_path.clone(),
                    bundle_id: asset.bundle_id,
                });
            }
            if let Some(bad) = asset
                .depend_bundle_ids
                .iter()
                .find(|id| **id >= bundle_count)
            {
                return Err(ManifestError::InvalidBundleId {
                    asset_path: asset.asset_path.clone(),
                    bundle_id: *bad,
                });
            }
            bundle_main_assets[asset.bundle_id].push(index);
        }

        for source in 0..bundle_count {
            for i in 0..self.bundles[source].depend_bundle_ids.len() {
                let target = self.bundles[source].depend_bundle_ids[i];
                if target >= bundle_count {
                    return Err(ManifestError::InvalidDependId {
                        bundle_name: self.bundles[source].bundle_name.clone(),
                        bundle_id: target,
                    });
                }
                let refs = &mut self.bundles[target].reference_bundle_ids;
                if !refs.contains(&source) {
                    refs.push(source);
                }
            }
        }

        if let Some(id) = find_cycle(&self.bundles) {
            return Err(ManifestError::DependencyCycle(
                self.bundles[id].bundle_name.clone(),
            ));
        }

        Ok(PackageManifest {
            header: self.header,
            assets: self.assets,
            bundles: self.bundles,
            asset_by_path: self.asset_by_path,
            location_to_asset: self.location_to_asset,
            guid_to_asset: self.guid_to_asset,
            bundle_by_name: self.bundle_by_name,
            bundle_by_file_name: self.bundle_by_file_name,
            bundle_main_assets,
        })
    }
}

/// Return a bundle on a dependency cycle, if there is one.
fn find_cycle(bundles: &[PackageBundle]) -> Option<BundleId> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; bundles.len()];
    for root in 0..bundles.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        // Stack of (bundle, next dependency to visit).
        let mut stack = vec![(root, 0usize)];
        marks[root] = Mark::InProgress;
        while let Some((node, next)) = stack.last_mut() {
            let node = *node;
            match bundles[node].depend_bundle_ids.get(*next) {
                Some(&dep) => {
                    *next += 1;
                    match marks[dep] {
                        Mark::InProgress => return Some(dep),
                        Mark::Unvisited => {
                            marks[dep] = Mark::InProgress;
                            stack.push((dep, 0));
                        }
                        Mark::Done => {}
                    }
                }
                None => {
                    marks[node] = Mark::Done;
                    stack.pop();
                }
            }
        }
    }
    None
}

/// An immutable, validated snapshot of one package version.
#[derive(Debug)]
pub struct PackageManifest {
    header: ManifestHeader,
    assets: Vec<PackageAsset>,
    bundles: Vec<PackageBundle>,
    asset_by_path: ManifestMap<usize>,
    location_to_asset: ManifestMap<usize>,
    guid_to_asset: ManifestMap<usize>,
    bundle_by_name: ManifestMap<BundleId>,
    bundle_by_file_name: ManifestMap<BundleId>,
    bundle_main_assets: Vec<Vec<usize>>,
}

impl PackageManifest {
    pub fn new(
        header: ManifestHeader,
        assets: Vec<PackageAsset>,
        bundles: Vec<PackageBundle>,
    ) -> Result<PackageManifest, ManifestError> {
        let mut builder = ManifestBuilder::new(header)?;
        builder.reserve(assets.len(), bundles.len());
        for asset in assets {
            builder.push_asset(asset)?;
        }
        for bundle in bundles {
            builder.push_bundle(bundle)?;
        }
        builder.finish()
    }

    pub fn header(&self) -> &ManifestHeader {
        &self.header
    }

    pub fn package_name(&self) -> &str {
        &self.header.package_name
    }

    pub fn package_version(&self) -> &str {
        &self.header.package_version
    }

    pub fn assets(&self) -> &[PackageAsset] {
        &self.assets
    }

    pub fn bundles(&self) -> &[PackageBundle] {
        &self.bundles
    }

    pub fn bundle(&self, id: BundleId) -> Option<&PackageBundle> {
        self.bundles.get(id)
    }

    pub fn bundle_id(&self, bundle_name: &str) -> Option<BundleId> {
        self.bundle_by_name.get(bundle_name).copied()
    }

    pub fn bundle_by_name(&self, bundle_name: &str) -> Option<&PackageBundle> {
        self.bundle_id(bundle_name).map(|id| &self.bundles[id])
    }

    pub fn bundle_by_file_name(&self, file_name: &str) -> Option<&PackageBundle> {
        self.bundle_by_file_name
            .get(file_name)
            .map(|id| &self.bundles[*id])
    }

    pub fn asset_by_path(&self, asset_path: &str) -> Option<&PackageAsset> {
        self.asset_by_path
            .get(asset_path)
            .map(|i| &self.assets[*i])
    }

    /// Resolve a user-facing location: an asset path, an extension-less path or an address, depending on the header.
    pub fn asset_by_location(&self, location: &str) -> Option<&PackageAsset> {
        let found = if self.header.location_to_lower {
            self.location_to_asset.get(&location.to_lowercase())
        } else {
            self.location_to_asset.get(location)
        };
        found.map(|i| &self.assets[*i])
    }

    pub fn asset_by_guid(&self, guid: &str) -> Option<&PackageAsset> {
        self.guid_to_asset.get(guid).map(|i| &self.assets[*i])
    }

    /// Assets whose main bundle is `id`.
    pub fn main_assets(&self, id: BundleId) -> impl Iterator<Item = &PackageAsset> + '_ {
        self.bundle_main_assets
            .get(id)
            .into_iter()
            .flatten()
            .map(move |i| &self.assets[*i])
    }

    pub fn bundles_by_tags(&self, tags: &[&str]) -> Vec<BundleId> {
        self.bundles
            .iter()
            .enumerate()
            .filter(|(_, b)| b.has_tag(tags))
            .map(|(id, _)| id)
            .collect()
    }

    /// Names of the bundles depending on `id`, for diagnostics.
    pub fn reference_bundle_names(&self, id: BundleId) -> Vec<&str> {
        self.bundles
            .get(id)
            .map(|b| {
                b.reference_bundle_ids
                    .iter()
                    .map(|r| self.bundles[*r].bundle_name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }
}
