//! Binary encoding of a [PackageManifest].
//!
//! Layout, all little-endian, strings and arrays `u16` prefixed:
//!
//! ```text
//! u32 signature, utf8 file version
//! header: bool addressable, bool extensionless, bool location to lower, bool include guid,
//!         [bool replace asset path with address, from 2025.9.30], i32 name style, i32 bundle type,
//!         utf8 pipeline, utf8 package name, utf8 package version, utf8 package note
//! i32 asset count, then per asset:
//!         utf8 address, utf8 asset path, utf8 guid, utf8[] tags, i32 bundle id, i32[] depend ids
//! i32 bundle count, then per bundle:
//!         utf8 name, u32 engine crc, utf8 file hash, u32 file crc, i64 file size, bool encrypted,
//!         utf8[] tags, i32[] depend ids
//! ```
//!
//! Large manifests can be decoded by a [DeserializeManifestOperation], a few records per scheduler tick.
use std::cmp::Ordering;
use std::convert::TryFrom;
use std::rc::Rc;

use log::{debug, error};

use crate::buffer::{BufferReader, BufferWriter};
use crate::manifest::*;
use crate::operation::{AsyncOperation, OperationCore, TimeSlice};

pub const FILE_SIGN: u32 = 0x594F4F;
/// The version written by [serialize_manifest].
pub const FILE_VERSION: &str = "2025.9.30";
/// The oldest version that can still be read.
pub const MIN_FILE_VERSION: &str = "2025.8.28";
/// First version carrying the `replace_asset_path_with_address` flag.
const REPLACE_ASSET_PATH_VERSION: &str = "2025.9.30";
pub const FILE_MAX_SIZE: usize = 100 * 1024 * 1024;

/// Optional transform applied to the raw manifest bytes before decoding, typically decryption.
pub trait ManifestRestoreServices {
    fn restore(&self, data: &[u8]) -> Result<Vec<u8>, String>;
}

fn parse_version(version: &str) -> Option<Vec<u32>> {
    version.split('.').map(|p| p.parse().ok()).collect()
}

/// Compare dotted numeric versions, `None` if either does not parse.
fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    Some(parse_version(a)?.cmp(&parse_version(b)?))
}

fn version_at_least(version: &str, min: &str) -> Result<bool, ManifestError> {
    compare_versions(version, min)
        .map(|o| o != Ordering::Less)
        .ok_or_else(|| ManifestError::IncompatibleVersion {
            found: version.to_string(),
            expected: FILE_VERSION,
        })
}

fn check_file_version(version: &str) -> Result<(), ManifestError> {
    if version_at_least(version, MIN_FILE_VERSION)? {
        Ok(())
    } else {
        Err(ManifestError::IncompatibleVersion {
            found: version.to_string(),
            expected: FILE_VERSION,
        })
    }
}

fn to_index(value: i32, what: &'static str) -> Result<usize, ManifestError> {
    usize::try_from(value).map_err(|_| ManifestError::InvalidValue {
        what,
        value: value as i64,
    })
}

fn to_i32(value: usize, what: &'static str) -> Result<i32, ManifestError> {
    i32::try_from(value).map_err(|_| ManifestError::InvalidValue {
        what,
        value: value as i64,
    })
}

fn read_ids(reader: &mut BufferReader, what: &'static str) -> Result<Vec<BundleId>, ManifestError> {
    reader
        .read_i32_array()?
        .into_iter()
        .map(|id| to_index(id, what))
        .collect()
}

fn read_header(reader: &mut BufferReader) -> Result<ManifestHeader, ManifestError> {
    if !reader.is_valid() {
        return Err(ManifestError::EmptyBuffer);
    }
    let sign = reader.read_u32()?;
    if sign != FILE_SIGN {
        return Err(ManifestError::InvalidSignature { found: sign });
    }
    let file_version = reader.read_utf8()?;
    check_file_version(&file_version)?;

    let mut header = ManifestHeader {
        enable_addressable: reader.read_bool()?,
        support_extensionless: reader.read_bool()?,
        location_to_lower: reader.read_bool()?,
        include_asset_guid: reader.read_bool()?,
        ..Default::default()
    };
    if version_at_least(&file_version, REPLACE_ASSET_PATH_VERSION)? {
        header.replace_asset_path_with_address = reader.read_bool()?;
    }
    header.file_version = file_version;
    header.output_name_style = reader.read_i32()?;
    header.build_bundle_type = reader.read_i32()?;
    header.build_pipeline = reader.read_utf8()?;
    header.package_name = reader.read_utf8()?;
    header.package_version = reader.read_utf8()?;
    header.package_note = reader.read_utf8()?;
    Ok(header)
}

/// Smallest encodings of an asset and of a bundle record: every string and array empty.
const MIN_ASSET_SIZE: usize = 2 + 2 + 2 + 2 + 4 + 2;
const MIN_BUNDLE_SIZE: usize = 2 + 4 + 2 + 4 + 8 + 1 + 2 + 2;

/// Read a record count, rejecting counts the rest of the buffer cannot hold.
fn read_count(
    reader: &mut BufferReader,
    what: &'static str,
    min_record_size: usize,
) -> Result<usize, ManifestError> {
    let count = to_index(reader.read_i32()?, what)?;
    if count.saturating_mul(min_record_size) > reader.remaining() {
        return Err(ManifestError::InvalidValue {
            what,
            value: count as i64,
        });
    }
    Ok(count)
}

fn read_asset(reader: &mut BufferReader, header: &ManifestHeader) -> Result<PackageAsset, ManifestError> {
    let address = reader.read_utf8()?;
    let asset_path = if header.enable_addressable && header.replace_asset_path_with_address {
        reader.skip_utf8()?;
        address.clone()
    } else {
        reader.read_utf8()?
    };
    Ok(PackageAsset {
        address,
        asset_path,
        asset_guid: reader.read_utf8()?,
        asset_tags: reader.read_utf8_array()?,
        bundle_id: to_index(reader.read_i32()?, "asset bundle id")?,
        depend_bundle_ids: read_ids(reader, "asset depend id")?,
    })
}

fn read_bundle(reader: &mut BufferReader) -> Result<PackageBundle, ManifestError> {
    let mut bundle = PackageBundle::new(reader.read_utf8()?);
    bundle.engine_crc = reader.read_u32()?;
    bundle.file_hash = reader.read_utf8()?;
    bundle.file_crc = reader.read_u32()?;
    let size = reader.read_i64()?;
    bundle.file_size = u64::try_from(size).map_err(|_| ManifestError::InvalidValue {
        what: "bundle file size",
        value: size,
    })?;
    bundle.encrypted = reader.read_bool()?;
    bundle.tags = reader.read_utf8_array()?;
    bundle.depend_bundle_ids = read_ids(reader, "bundle depend id")?;
    Ok(bundle)
}

/// Decode a manifest in one pass.
pub fn deserialize_manifest(data: &[u8]) -> Result<PackageManifest, ManifestError> {
    let mut reader = BufferReader::new(data);
    let mut builder = ManifestBuilder::new(read_header(&mut reader)?)?;

    let asset_count = read_count(&mut reader, "asset count", MIN_ASSET_SIZE)?;
    builder.reserve(asset_count, 0);
    for _ in 0..asset_count {
        let asset = read_asset(&mut reader, builder.header())?;
        builder.push_asset(asset)?;
    }

    let bundle_count = read_count(&mut reader, "bundle count", MIN_BUNDLE_SIZE)?;
    builder.reserve(0, bundle_count);
    for _ in 0..bundle_count {
        builder.push_bundle(read_bundle(&mut reader)?)?;
    }
    builder.finish()
}

/// Restore then decode a manifest in one pass.
pub fn deserialize_manifest_with(
    data: &[u8],
    services: &dyn ManifestRestoreServices,
) -> Result<PackageManifest, ManifestError> {
    let restored = services.restore(data).map_err(ManifestError::Restore)?;
    deserialize_manifest(&restored)
}

/// Encode a manifest.  The `replace_asset_path_with_address` flag is only written when the header's file version
/// carries it.
pub fn serialize_manifest(manifest: &PackageManifest) -> Result<Vec<u8>, ManifestError> {
    let header = manifest.header();
    check_file_version(&header.file_version)?;
    let mut w = BufferWriter::new(FILE_MAX_SIZE);

    w.write_u32(FILE_SIGN)?;
    w.write_utf8(&header.file_version)?;
    w.write_bool(header.enable_addressable)?;
    w.write_bool(header.support_extensionless)?;
    w.write_bool(header.location_to_lower)?;
    w.write_bool(header.include_asset_guid)?;
    if version_at_least(&header.file_version, REPLACE_ASSET_PATH_VERSION)? {
        w.write_bool(header.replace_asset_path_with_address)?;
    }
    w.write_i32(header.output_name_style)?;
    w.write_i32(header.build_bundle_type)?;
    w.write_utf8(&header.build_pipeline)?;
    w.write_utf8(&header.package_name)?;
    w.write_utf8(&header.package_version)?;
    w.write_utf8(&header.package_note)?;

    w.write_i32(to_i32(manifest.assets().len(), "asset count")?)?;
    for asset in manifest.assets() {
        w.write_utf8(&asset.address)?;
        w.write_utf8(&asset.asset_path)?;
        w.write_utf8(&asset.asset_guid)?;
        w.write_utf8_array(&asset.asset_tags)?;
        w.write_i32(to_i32(asset.bundle_id, "asset bundle id")?)?;
        let depends = ids_to_i32(&asset.depend_bundle_ids)?;
        w.write_i32_array(&depends)?;
    }

    w.write_i32(to_i32(manifest.bundles().len(), "bundle count")?)?;
    for bundle in manifest.bundles() {
        w.write_utf8(&bundle.bundle_name)?;
        w.write_u32(bundle.engine_crc)?;
        w.write_utf8(&bundle.file_hash)?;
        w.write_u32(bundle.file_crc)?;
        let size = i64::try_from(bundle.file_size).map_err(|_| ManifestError::InvalidValue {
            what: "bundle file size",
            value: i64::MAX,
        })?;
        w.write_i64(size)?;
        w.write_bool(bundle.encrypted)?;
        w.write_utf8_array(&bundle.tags)?;
        let depends = ids_to_i32(&bundle.depend_bundle_ids)?;
        w.write_i32_array(&depends)?;
    }
    Ok(w.into_bytes())
}

fn ids_to_i32(ids: &[BundleId]) -> Result<Vec<i32>, ManifestError> {
    ids.iter().map(|id| to_i32(*id, "depend id")).collect()
}

impl PackageManifest {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ManifestError> {
        serialize_manifest(self)
    }
}

enum DeserializeStep {
    Header,
    Assets {
        builder: ManifestBuilder,
        remaining: usize,
    },
    Bundles {
        builder: ManifestBuilder,
        remaining: usize,
    },
    Done,
}

/// Decodes a manifest across as many ticks as its [TimeSlice]s require, with the same result as
/// [deserialize_manifest].
pub struct DeserializeManifestOperation {
    core: OperationCore,
    services: Option<Box<dyn ManifestRestoreServices>>,
    data: Vec<u8>,
    restored: bool,
    offset: usize,
    step: DeserializeStep,
    total: usize,
    manifest: Option<Rc<PackageManifest>>,
}

impl DeserializeManifestOperation {
    pub fn new(
        data: Vec<u8>,
        services: Option<Box<dyn ManifestRestoreServices>>,
    ) -> DeserializeManifestOperation {
        DeserializeManifestOperation {
            core: OperationCore::new(),
            services,
            data,
            restored: false,
            offset: 0,
            step: DeserializeStep::Header,
            total: 0,
            manifest: None,
        }
    }

    /// The decoded manifest, once the operation has succeeded.
    pub fn manifest(&self) -> Option<Rc<PackageManifest>> {
        self.manifest.clone()
    }

    fn restore(&mut self) -> Result<(), ManifestError> {
        if self.data.is_empty() {
            return Err(ManifestError::EmptyBuffer);
        }
        if let Some(services) = &self.services {
            self.data = services.restore(&self.data).map_err(ManifestError::Restore)?;
        }
        self.restored = true;
        Ok(())
    }

    /// Run steps until the slice is spent or the manifest is built.  Always decodes at least one record.
    fn run(&mut self, slice: &TimeSlice) -> Result<(), ManifestError> {
        if !self.restored {
            self.restore()?;
        }

        let mut reader = BufferReader::new(&self.data);
        reader.set_offset(self.offset);
        let mut step = std::mem::replace(&mut self.step, DeserializeStep::Done);
        loop {
            let mut busy = false;
            step = match step {
                DeserializeStep::Header => {
                    let mut builder = ManifestBuilder::new(read_header(&mut reader)?)?;
                    let remaining = read_count(&mut reader, "asset count", MIN_ASSET_SIZE)?;
                    builder.reserve(remaining, 0);
                    self.total = remaining;
                    DeserializeStep::Assets { builder, remaining }
                }
                DeserializeStep::Assets {
                    mut builder,
                    mut remaining,
                } => {
                    while remaining > 0 && !busy {
                        let asset = read_asset(&mut reader, builder.header())?;
                        builder.push_asset(asset)?;
                        remaining -= 1;
                        busy = slice.yield_now();
                    }
                    self.core
                        .set_progress(progress(self.total, remaining) * 0.5);
                    if remaining == 0 {
                        let remaining = read_count(&mut reader, "bundle count", MIN_BUNDLE_SIZE)?;
                        builder.reserve(0, remaining);
                        self.total = remaining;
                        DeserializeStep::Bundles { builder, remaining }
                    } else {
                        DeserializeStep::Assets { builder, remaining }
                    }
                }
                DeserializeStep::Bundles {
                    mut builder,
                    mut remaining,
                } => {
                    while remaining > 0 && !busy {
                        builder.push_bundle(read_bundle(&mut reader)?)?;
                        remaining -= 1;
                        busy = slice.yield_now();
                    }
                    self.core
                        .set_progress(0.5 + progress(self.total, remaining) * 0.5);
                    if remaining == 0 {
                        let manifest = builder.finish()?;
                        debug!(
                            "Deserialized manifest {} {} with {} assets and {} bundles",
                            manifest.package_name(),
                            manifest.package_version(),
                            manifest.assets().len(),
                            manifest.bundles().len()
                        );
                        self.manifest = Some(Rc::new(manifest));
                        self.core.succeed();
                        return Ok(());
                    }
                    DeserializeStep::Bundles { builder, remaining }
                }
                DeserializeStep::Done => return Ok(()),
            };

            if busy {
                self.offset = reader.offset();
                self.step = step;
                return Ok(());
            }
        }
    }
}

fn progress(total: usize, remaining: usize) -> f32 {
    if total == 0 {
        1.0
    } else {
        1.0 - remaining as f32 / total as f32
    }
}

impl AsyncOperation for DeserializeManifestOperation {
    fn core(&self) -> &OperationCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut OperationCore {
        &mut self.core
    }

    fn internal_start(&mut self) {}

    fn internal_update(&mut self, slice: &TimeSlice) {
        if let Err(e) = self.run(slice) {
            error!("Failed to deserialize manifest: {}", e);
            self.step = DeserializeStep::Done;
            self.core.fail(e.into());
        }
    }

    fn description(&self) -> String {
        "DeserializeManifestOperation".into()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::manifest::tests::*;
    use crate::operation::{update_and_notify, wait_and_notify, OperationStatus};

    fn sized_manifest(asset_count: usize, bundle_count: usize) -> Result<PackageManifest, ManifestError> {
        let bundles = (0..bundle_count)
            .map(|i| {
                let depends: Vec<BundleId> = if i > 0 { vec![i - 1] } else { vec![] };
                let mut b = bundle(&format!("b{}.bundle", i), &depends);
                b.tags = vec![format!("tag{}", i % 3)];
                b.encrypted = i % 2 == 0;
                b.file_crc = i as u32;
                b
            })
            .collect();
        let assets = (0..asset_count)
            .map(|i| {
                let owner = if bundle_count == 0 { 0 } else { i % bundle_count };
                let mut a = asset(&format!("assets/a{}.prefab", i), owner, &[]);
                a.asset_tags = vec!["t".into()];
                if owner > 0 {
                    a.depend_bundle_ids = vec![owner - 1];
                }
                a
            })
            .collect();
        PackageManifest::new(header(), assets, bundles)
    }

    fn assert_same(a: &PackageManifest, b: &PackageManifest) {
        assert_eq!(a.header(), b.header());
        assert_eq!(a.assets(), b.assets());
        assert_eq!(a.bundles(), b.bundles());
    }

    #[test]
    fn test_round_trip_sizes() {
        for &n in &[0usize, 1, 1000] {
            for &m in &[0usize, 1, 1000] {
                let built = sized_manifest(n, m);
                if n > 0 && m == 0 {
                    // An asset needs a bundle to live in.
                    assert!(matches!(built, Err(ManifestError::InvalidBundleId { .. })));
                    continue;
                }
                let built = built.unwrap();
                let decoded = deserialize_manifest(&built.to_bytes().unwrap()).unwrap();
                assert_same(&built, &decoded);
                assert_eq!(decoded.assets().len(), n);
                assert_eq!(decoded.bundles().len(), m);
            }
        }
    }

    #[test]
    fn test_sliced_matches_one_pass() {
        let built = sized_manifest(1000, 100).unwrap();
        let bytes = built.to_bytes().unwrap();
        let one_pass = deserialize_manifest(&bytes).unwrap();

        let op = RefCell::new(DeserializeManifestOperation::new(bytes, None));
        op.borrow_mut().start_operation();
        let mut ticks = 0;
        let mut last_progress = 0.0;
        while !update_and_notify(&op, &TimeSlice::steps(64)) {
            ticks += 1;
            let p = op.borrow().progress();
            assert!(p >= last_progress);
            last_progress = p;
        }
        // 1100 records at 64 per tick.
        assert!(ticks >= 17);
        assert_eq!(op.borrow().status(), OperationStatus::Succeed);
        assert_same(&one_pass, &op.borrow().manifest().unwrap());
    }

    #[test]
    fn test_sync_wait() {
        let bytes = sized_manifest(10, 3).unwrap().to_bytes().unwrap();
        let op = RefCell::new(DeserializeManifestOperation::new(bytes, None));
        assert_eq!(wait_and_notify(&op), OperationStatus::Succeed);
        assert_eq!(op.borrow().manifest().unwrap().assets().len(), 10);
    }

    #[test]
    fn test_format_errors() {
        assert_eq!(deserialize_manifest(&[]).unwrap_err(), ManifestError::EmptyBuffer);

        let mut w = BufferWriter::new(1024);
        w.write_u32(0x1234).unwrap();
        assert_eq!(
            deserialize_manifest(&w.into_bytes()).unwrap_err(),
            ManifestError::InvalidSignature { found: 0x1234 }
        );

        let mut w = BufferWriter::new(1024);
        w.write_u32(FILE_SIGN).unwrap();
        w.write_utf8("2024.1.1").unwrap();
        assert_eq!(
            deserialize_manifest(&w.into_bytes()).unwrap_err(),
            ManifestError::IncompatibleVersion {
                found: "2024.1.1".into(),
                expected: FILE_VERSION
            }
        );

        // Truncation anywhere is a buffer error, never a panic.
        let bytes = sized_manifest(3, 2).unwrap().to_bytes().unwrap();
        for len in 1..bytes.len() {
            assert!(deserialize_manifest(&bytes[..len]).is_err());
        }
    }

    #[test]
    fn test_oversized_counts() {
        let bytes = sized_manifest(0, 0).unwrap().to_bytes().unwrap();
        let len = bytes.len();

        // The asset count, then the bundle count, are the last eight bytes of an empty manifest.
        for &at in &[len - 8, len - 4] {
            let mut corrupt = bytes.clone();
            corrupt[at..at + 4].copy_from_slice(&i32::MAX.to_le_bytes());
            assert!(matches!(
                deserialize_manifest(&corrupt),
                Err(ManifestError::InvalidValue { value, .. }) if value == i32::MAX as i64
            ));

            let op = RefCell::new(DeserializeManifestOperation::new(corrupt, None));
            assert_eq!(wait_and_notify(&op), OperationStatus::Failed);
            assert!(op.borrow().manifest().is_none());
        }

        // A count which fits exactly is not rejected up front.
        let bytes = sized_manifest(2, 1).unwrap().to_bytes().unwrap();
        assert_eq!(deserialize_manifest(&bytes).unwrap().assets().len(), 2);
    }

    #[test]
    fn test_addressable_lowercase_fails_fast() {
        let mut h = header();
        h.enable_addressable = true;
        let m = PackageManifest::new(h, vec![], vec![]).unwrap();
        let mut bytes = m.to_bytes().unwrap();
        // Flip location_to_lower, which follows the signature, the version string and two flags.
        let offset = 4 + 2 + FILE_VERSION.len() + 2;
        bytes[offset] = 1;

        let op = RefCell::new(DeserializeManifestOperation::new(bytes, None));
        assert_eq!(wait_and_notify(&op), OperationStatus::Failed);
        assert_eq!(
            op.borrow().error().unwrap().code(),
            "manifest_invalid_config"
        );
    }

    #[test]
    fn test_old_version_has_no_replace_flag() {
        let mut h = header();
        h.file_version = MIN_FILE_VERSION.into();
        let old = PackageManifest::new(h, vec![], vec![bundle("a.bundle", &[])]).unwrap();
        let new = PackageManifest::new(header(), vec![], vec![bundle("a.bundle", &[])]).unwrap();
        let old_bytes = old.to_bytes().unwrap();
        let new_bytes = new.to_bytes().unwrap();
        assert_eq!(
            new_bytes.len() - old_bytes.len(),
            1 + FILE_VERSION.len() - MIN_FILE_VERSION.len()
        );
        assert_same(&old, &deserialize_manifest(&old_bytes).unwrap());
    }

    struct XorRestore(u8);

    impl ManifestRestoreServices for XorRestore {
        fn restore(&self, data: &[u8]) -> Result<Vec<u8>, String> {
            Ok(data.iter().map(|b| b ^ self.0).collect())
        }
    }

    #[test]
    fn test_restore_services() {
        let built = sized_manifest(5, 2).unwrap();
        let scrambled: Vec<u8> = built.to_bytes().unwrap().iter().map(|b| b ^ 0x5a).collect();
        assert!(deserialize_manifest(&scrambled).is_err());
        assert_same(
            &built,
            &deserialize_manifest_with(&scrambled, &XorRestore(0x5a)).unwrap(),
        );

        let op = RefCell::new(DeserializeManifestOperation::new(
            scrambled,
            Some(Box::new(XorRestore(0x5a))),
        ));
        assert_eq!(wait_and_notify(&op), OperationStatus::Succeed);
    }

    #[test]
    fn test_versions() {
        assert_eq!(compare_versions("2025.9.30", "2025.10.1"), Some(Ordering::Less));
        assert_eq!(compare_versions("2025.9.30", "2025.9.30"), Some(Ordering::Equal));
        assert!(compare_versions("abc", "2025.9.30").is_none());
        assert!(check_file_version("2026.1.1").is_ok());
        assert!(check_file_version("not a version").is_err());
    }
}
