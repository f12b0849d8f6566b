//! The source cache: staged source trees indexed by source unique key.
//!
//! The analogue of the artifact cache for sources. A source is cached under
//! `(kind, unique-key)` where the unique key hash also folds in the keys of
//! earlier sources when the plugin requires previous sources. Cached trees
//! make fetches skippable and junction loads cheap.

use crate::cas::{CasStore, Digest, StageMode};
use crate::error::{IoResultExt, Result};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

#[derive(Debug)]
pub struct SourceCache {
    cas: Arc<CasStore>,
    refs: PathBuf,
}

impl SourceCache {
    pub fn open(cas: Arc<CasStore>, cachedir: &Path) -> Result<Self> {
        let refs = cachedir.join("sources").join("refs");
        fs::create_dir_all(&refs).map_err_path(&refs)?;
        Ok(Self { cas, refs })
    }

    /// The ref hash for a source: its unique key, plus the unique keys of
    /// all earlier sources of the element when the plugin opts in.
    pub fn key_hash(
        unique_key: &serde_json::Value,
        previous: Option<&[serde_json::Value]>,
    ) -> String {
        crate::cachekey::hash_value(&serde_json::json!({
            "key": unique_key,
            "previous-sources": previous,
        }))
    }

    fn ref_path(&self, kind: &str, key_hash: &str) -> PathBuf {
        self.refs.join(kind).join(key_hash)
    }

    pub fn contains(&self, kind: &str, key_hash: &str) -> bool {
        self.ref_path(kind, key_hash).is_file()
    }

    /// The cached tree digest, if present and still backed by the CAS.
    pub fn load(&self, kind: &str, key_hash: &str) -> Result<Option<Digest>> {
        let path = self.ref_path(kind, key_hash);
        if !path.is_file() {
            return Ok(None);
        }
        let digest: Digest = crate::utils::read_json_file(&path)?;
        if !self.cas.has_blob(&digest) {
            return Ok(None);
        }
        Ok(Some(digest))
    }

    pub fn commit(&self, kind: &str, key_hash: &str, digest: &Digest) -> Result<()> {
        let bytes = serde_json::to_vec(digest).expect("digests always serialize");
        crate::utils::write_atomic(&self.ref_path(kind, key_hash), &bytes)
    }

    /// Returns the cached tree for the key, staging and ingesting it via
    /// `stage` on a miss.
    pub fn ensure<F>(&self, kind: &str, key_hash: &str, stage: F) -> Result<Digest>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        if let Some(digest) = self.load(kind, key_hash)? {
            trace!(kind, key_hash, "source cache hit");
            return Ok(digest);
        }
        let scratch = tempfile::tempdir().map_err_path(&self.refs)?;
        stage(scratch.path())?;
        let digest = self.cas.import_tree(scratch.path())?;
        self.commit(kind, key_hash, &digest)?;
        debug!(kind, key_hash, %digest, "source staged and cached");
        Ok(digest)
    }

    /// Materialises a cached source tree into `dest`.
    pub fn stage_into(&self, digest: &Digest, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest).map_err_path(dest)?;
        self.cas.checkout_tree(digest, dest, StageMode::Copy)?;
        Ok(())
    }

    /// CAS roots reachable from source refs, for garbage collection.
    pub fn live_roots(&self) -> Vec<Digest> {
        walkdir::WalkDir::new(&self.refs)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| crate::utils::read_json_file::<Digest>(e.path()).ok())
            .collect()
    }
}

/// The cache ref hash for source `index` of an element, folding in earlier
/// source keys when the plugin requires previous sources. `None` while the
/// source has no ref.
pub fn element_source_key(
    sources: &[crate::element::Source],
    index: usize,
) -> Option<String> {
    let source = &sources[index];
    let unique = source.plugin.unique_key()?;
    let previous: Option<Vec<serde_json::Value>> = if source.plugin.requires_previous_sources() {
        let mut keys = Vec::new();
        for earlier in &sources[..index] {
            keys.push(earlier.plugin.unique_key()?);
        }
        Some(keys)
    } else {
        None
    };
    Some(SourceCache::key_hash(&unique, previous.as_deref()))
}

/// Returns the cached tree for source `index` of an element, fetching
/// upstream and ingesting on a miss.
pub fn ensure_element_source(
    cache: &SourceCache,
    sources: &[crate::element::Source],
    index: usize,
    ctx: &crate::plugin::SourceContext<'_>,
) -> Result<Digest> {
    let source = &sources[index];
    let key_hash = element_source_key(sources, index).ok_or_else(|| {
        crate::error::SourceError::Inconsistent {
            element: ctx.element.to_string(),
            kind: source.kind.clone(),
        }
    })?;
    // Fetch before staging: `stage` presupposes fetched contents, and a
    // failed stage attempt could leave partial output behind for a second
    // attempt to ingest on top of.
    cache.ensure(&source.kind, &key_hash, |dir| {
        source.plugin.fetch(ctx)?;
        source.plugin.stage(ctx, dir)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cache() -> (tempfile::TempDir, SourceCache) {
        let dir = tempfile::tempdir().unwrap();
        let cas = Arc::new(CasStore::open(dir.path()).unwrap());
        let cache = SourceCache::open(cas, dir.path()).unwrap();
        (dir, cache)
    }

    #[test]
    fn miss_stages_then_hits() {
        let (_dir, cache) = cache();
        let key = SourceCache::key_hash(&serde_json::json!({"url": "u", "sha": "s"}), None);
        let mut staged = 0;
        let digest = cache
            .ensure("tar", &key, |dir| {
                staged += 1;
                fs::write(dir.join("configure"), "#!/bin/sh\n").map_err_path(dir)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(staged, 1);

        // Second call must not stage again.
        let digest2 = cache
            .ensure("tar", &key, |_| panic!("staged on a cache hit"))
            .unwrap();
        assert_eq!(digest, digest2);
    }

    #[test]
    fn previous_sources_change_the_key() {
        let key = serde_json::json!({"patch": "p1"});
        let without = SourceCache::key_hash(&key, None);
        let with = SourceCache::key_hash(&key, Some(&[serde_json::json!({"tar": "t"})]));
        assert_ne!(without, with);
    }

    #[test]
    fn staging_materialises_the_tree() {
        let (_dir, cache) = cache();
        let key = SourceCache::key_hash(&serde_json::json!("k"), None);
        let digest = cache
            .ensure("test", &key, |dir| {
                fs::create_dir(dir.join("sub")).map_err_path(dir)?;
                fs::write(dir.join("sub/file"), "content").map_err_path(dir)?;
                Ok(())
            })
            .unwrap();
        let dest = tempfile::tempdir().unwrap();
        cache.stage_into(&digest, dest.path()).unwrap();
        assert_eq!(fs::read_to_string(dest.path().join("sub/file")).unwrap(), "content");
    }
}
