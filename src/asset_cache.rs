//! The [AssetCache] decodes assets out of loaded bundles with an [AssetDecoder], and keeps the decoded objects around.
//!
//! The cache looks in three places before decoding:
//!
//! - Pinned entries, added with [AssetCache::cache_always], which are never evicted and may only be removed with
//!   [AssetCache::remove].
//! - The decoded cache, bounded and evicted by the configured [CachePolicy].
//! - Weak references to everything decoded so far.  An evicted object is handed back as long as something outside
//!   the cache still holds it.
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::debug;

use crate::*;

type CacheHashMap<V> = std::collections::HashMap<String, V, ahash::RandomState>;

#[derive(Clone, Debug, derive_builder::Builder)]
#[builder(default)]
pub struct AssetCacheConfig {
    pub policy: CachePolicy,
    /// Maximum number of decoded objects kept by the policy.  Must not be 0.
    pub capacity: usize,
}

impl Default for AssetCacheConfig {
    fn default() -> Self {
        AssetCacheConfig {
            policy: CachePolicy::Lru,
            capacity: 128,
        }
    }
}

pub struct AssetCache<D: AssetDecoder>
where
    D::Output: 'static,
{
    config: AssetCacheConfig,
    pinned_entries: RefCell<CacheHashMap<Rc<D::Output>>>,
    decoded_cache: RefCell<Box<dyn EvictionCache<String, Rc<D::Output>>>>,
    /// After eviction, we can still give the item back if something external kept it around; do so unless the user
    /// explicitly removed it.
    weak_refs: RefCell<CacheHashMap<Weak<D::Output>>>,
    decoder: D,
}

impl<D: AssetDecoder> AssetCache<D>
where
    D::Output: 'static,
{
    /// # Panics
    ///
    /// If the configured capacity is 0.
    pub fn new(decoder: D, config: AssetCacheConfig) -> AssetCache<D> {
        AssetCache {
            decoded_cache: RefCell::new(config.policy.build(config.capacity)),
            pinned_entries: Default::default(),
            weak_refs: Default::default(),
            decoder,
            config,
        }
    }

    pub fn config(&self) -> &AssetCacheConfig {
        &self.config
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    /// Number of objects held by the eviction policy.
    pub fn cached_count(&self) -> usize {
        self.decoded_cache.borrow().len()
    }

    /// Find an item in the cache, returning `None` if it isn't currently cached.
    pub fn search_for_item(&self, key: &str) -> Option<Rc<D::Output>> {
        if let Some(x) = self.pinned_entries.borrow().get(key) {
            return Some(x.clone());
        }

        if let Some(x) = self.decoded_cache.borrow_mut().get(&key.to_string()) {
            return Some(x.clone());
        }

        self.weak_refs.borrow().get(key).and_then(|x| x.upgrade())
    }

    /// Get an asset from a loaded bundle, decoding it if it isn't cached.
    pub fn get_from_bundle(
        &self,
        bundle: &LoadedBundle,
        asset: &PackageAsset,
    ) -> Result<Rc<D::Output>, OperationError> {
        let key = &asset.asset_path;
        if let Some(x) = self.search_for_item(key) {
            return Ok(x);
        }

        let res = Rc::new(bundle.decode(&self.decoder, asset)?);
        if let Some((evicted, _)) = self
            .decoded_cache
            .borrow_mut()
            .add(key.clone(), res.clone())
        {
            debug!("Evicted decoded asset {}", evicted);
        }
        self.weak_refs
            .borrow_mut()
            .insert(key.clone(), Rc::downgrade(&res));
        Ok(res)
    }

    /// Get the asset behind a handle, which must have finished loading.
    pub fn get(&self, handle: &AssetHandle) -> Result<Rc<D::Output>, OperationError> {
        if let Some(e) = handle.error() {
            return Err(e);
        }
        let asset = handle
            .asset()
            .ok_or_else(|| OperationError::AssetNotFound(handle.location()))?;
        let bundle = handle
            .bundle()
            .ok_or_else(|| OperationError::NotLoaded(handle.location()))?;
        self.get_from_bundle(&bundle, &asset)
    }

    /// Pin an item, so that it is always present in the cache.
    pub fn cache_always(&self, key: String, value: Rc<D::Output>) {
        let weak = Rc::downgrade(&value);
        self.pinned_entries.borrow_mut().insert(key.clone(), value);
        self.weak_refs.borrow_mut().insert(key, weak);
    }

    /// Remove an item from the cache.
    pub fn remove(&self, key: &str) {
        self.pinned_entries.borrow_mut().remove(key);
        self.decoded_cache.borrow_mut().remove(&key.to_string());
        self.weak_refs.borrow_mut().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::io::{Error as IoError, ErrorKind, Read};

    use super::*;
    use crate::bundle_loader::tests::MemoryFileSystem;
    use crate::manifest::tests::{asset, shared_shader_manifest};

    #[derive(Default)]
    struct CountingDecoder {
        decodes: Cell<u32>,
    }

    impl AssetDecoder for CountingDecoder {
        type Output = String;
        type Error = IoError;

        fn decode<R: Read>(&self, asset: &PackageAsset, mut reader: R) -> Result<String, IoError> {
            self.decodes.set(self.decodes.get() + 1);
            let mut out = String::new();
            reader.read_to_string(&mut out)?;
            if out == "bad" {
                return Err(IoError::new(ErrorKind::InvalidData, "bad asset"));
            }
            Ok(format!("{}:{}", asset.asset_path, out))
        }
    }

    fn build_cache(policy: CachePolicy, capacity: usize) -> AssetCache<CountingDecoder> {
        let cfg = AssetCacheConfigBuilder::default()
            .policy(policy)
            .capacity(capacity)
            .build()
            .expect("Should build");
        AssetCache::new(CountingDecoder::default(), cfg)
    }

    fn bundle() -> LoadedBundle {
        LoadedBundle::new("data.bundle", b"abc".to_vec())
    }

    #[test]
    fn basic_ops() {
        let cache = build_cache(CachePolicy::Lru, 4);
        let bundle = bundle();
        let a = asset("assets/a.txt", 0, &[]);
        let b = asset("assets/b.txt", 0, &[]);

        let first = cache.get_from_bundle(&bundle, &a).unwrap();
        assert_eq!(&*first, "assets/a.txt:abc");
        let again = cache.get_from_bundle(&bundle, &a).unwrap();
        assert!(Rc::ptr_eq(&first, &again));
        cache.get_from_bundle(&bundle, &b).unwrap();
        assert_eq!(cache.decoder().decodes.get(), 2);

        cache.search_for_item("assets/a.txt").expect("Should find the key");
        cache.search_for_item("assets/b.txt").expect("Should find the item");

        drop((first, again));
        cache.remove("assets/a.txt");
        assert!(cache.search_for_item("assets/a.txt").is_none());
        assert_eq!(cache.cached_count(), 1);
    }

    /// Evicted objects can still be handed back through the weak references, until the last outside holder drops them.
    #[test]
    fn test_weak_recovery() {
        let cache = build_cache(CachePolicy::Lru, 2);
        let bundle = bundle();

        let mut held = vec![];
        for i in 0..10 {
            held.push(cache.get_from_bundle(&bundle, &asset(&format!("assets/{}", i), 0, &[])).unwrap());
        }
        assert_eq!(cache.cached_count(), 2);
        assert!(!cache.decoded_cache.borrow().contains(&"assets/1".to_string()));
        assert!(cache.weak_refs.borrow().get("assets/1").is_some());

        assert_eq!(&*cache.search_for_item("assets/1").unwrap(), "assets/1:abc");
        cache.get_from_bundle(&bundle, &asset("assets/1", 0, &[])).unwrap();
        assert_eq!(cache.decoder().decodes.get(), 10);

        held.clear();
        assert!(cache.search_for_item("assets/1").is_none());
        assert!(cache.search_for_item("assets/9").is_some());
    }

    #[test]
    fn test_pinned_entries_survive_eviction() {
        let cache = build_cache(CachePolicy::Arc, 1);
        let bundle = bundle();
        cache.cache_always("assets/pinned".into(), Rc::new("pinned".to_string()));

        for i in 0..5 {
            cache.get_from_bundle(&bundle, &asset(&format!("assets/{}", i), 0, &[])).unwrap();
        }
        let pinned = cache.get_from_bundle(&bundle, &asset("assets/pinned", 0, &[])).unwrap();
        assert_eq!(&*pinned, "pinned");
        assert_eq!(cache.decoder().decodes.get(), 5);

        drop(pinned);
        cache.remove("assets/pinned");
        assert!(cache.search_for_item("assets/pinned").is_none());
    }

    #[test]
    fn test_decode_failures_are_not_cached() {
        let cache = build_cache(CachePolicy::LruK { k: 2 }, 4);
        let bad = LoadedBundle::new("bad.bundle", b"bad".to_vec());
        let a = asset("assets/a.txt", 0, &[]);

        let err = cache.get_from_bundle(&bad, &a).unwrap_err();
        assert_eq!(err.code(), "decode_failed");
        assert!(cache.search_for_item("assets/a.txt").is_none());
        assert_eq!(cache.cached_count(), 0);
    }

    #[test]
    fn test_get_through_asset_handle() {
        let manifest = Rc::new(shared_shader_manifest());
        let fs = MemoryFileSystem::for_manifest(&manifest, 0);
        let mut manager = ResourceManager::new(Default::default(), manifest, Rc::new(fs), Default::default());
        let cache = build_cache(CachePolicy::Lru, 4);

        let handle = manager.load_asset("assets/ui/button.prefab");
        assert_eq!(cache.get(&handle).unwrap_err().code(), "bundle_not_loaded");
        handle.wait_for_completion();
        assert_eq!(&*cache.get(&handle).unwrap(), "assets/ui/button.prefab:ui.b");
        cache.get(&handle).unwrap();
        assert_eq!(cache.decoder().decodes.get(), 1);

        let missing = manager.load_asset("assets/missing");
        assert_eq!(cache.get(&missing).unwrap_err().code(), "asset_not_found");
    }
}
