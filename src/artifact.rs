//! Artifacts and the local artifact cache.
//!
//! An artifact is the persisted record of one build, addressed by
//! `(project, element, strong key)`. The record itself is a JSON proto blob
//! in the CAS; the cache maintains symbolic refs pointing at proto digests
//! under `<cachedir>/artifacts/refs/<project>/<element>/<key>`. Ref files
//! are touched on access, which is the LRU order quota eviction uses.

use crate::cas::{CasStore, Digest, StageMode};
use crate::error::{ArtifactError, IoError, IoResultExt, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

/// Current artifact proto format.
const PROTO_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactProto {
    pub version: u32,
    pub project_name: String,
    pub element_name: String,
    pub kind: String,
    pub strong_key: String,
    pub weak_key: String,
    /// False for a recorded build failure; failures are cached too so they
    /// are reproducible and shareable.
    pub build_success: bool,
    /// Root tree of `%{install-root}`; absent when the build failed before
    /// collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buildtree: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<Digest>,
    pub public: serde_json::Value,
    pub environment: BTreeMap<String, String>,
    /// Strong keys of the direct build dependencies at assembly time.
    pub build_deps: BTreeMap<String, String>,
    /// Split-domain indexes computed at assembly time.
    pub splits: BTreeMap<String, Vec<String>>,
}

impl ArtifactProto {
    pub fn name(&self) -> ArtifactName {
        ArtifactName {
            project: self.project_name.clone(),
            element: self.element_name.clone(),
            key: self.strong_key.clone(),
        }
    }
}

/// `project/element/strong-key`, addressable without a project checkout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactName {
    pub project: String,
    /// Element name including the `.bst` suffix.
    pub element: String,
    pub key: String,
}

impl ArtifactName {
    pub fn parse(name: &str) -> Result<Self, ArtifactError> {
        let parts: Vec<&str> = name.split('/').collect();
        if parts.len() < 3 {
            return Err(ArtifactError::BadName { name: name.to_string() });
        }
        let project = parts[0].to_string();
        let key = parts[parts.len() - 1].to_string();
        let element = parts[1..parts.len() - 1].join("/");
        if project.is_empty()
            || element.is_empty()
            || key.len() != 64
            || !key.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(ArtifactError::BadName { name: name.to_string() });
        }
        Ok(Self { project, element: format!("{element}.bst"), key })
    }

    /// The element path component with `.bst` stripped.
    fn element_stem(&self) -> &str {
        self.element.strip_suffix(".bst").unwrap_or(&self.element)
    }

    /// The remote-asset URI for this artifact.
    pub fn uri(&self) -> String {
        format!("artifact://{}/{}/{}", self.project, self.element_stem(), self.key)
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.element_stem(), self.key)
    }
}

#[derive(Debug)]
pub struct ArtifactCache {
    cas: Arc<CasStore>,
    refs: PathBuf,
}

impl ArtifactCache {
    pub fn open(cas: Arc<CasStore>, cachedir: &Path) -> Result<Self> {
        let refs = cachedir.join("artifacts").join("refs");
        fs::create_dir_all(&refs).map_err_path(&refs)?;
        Ok(Self { cas, refs })
    }

    pub fn cas(&self) -> &Arc<CasStore> {
        &self.cas
    }

    fn ref_path(&self, project: &str, element: &str, key: &str) -> PathBuf {
        let stem = element.strip_suffix(".bst").unwrap_or(element);
        self.refs.join(project).join(stem).join(key)
    }

    /// Stores the proto in the CAS and indexes it under the strong key.
    pub fn store(&self, proto: &ArtifactProto) -> Result<Digest> {
        let bytes = serde_json::to_vec(proto).expect("artifact protos always serialize");
        let digest = self.cas.put_blob(&bytes)?;
        self.write_ref(
            &self.ref_path(&proto.project_name, &proto.element_name, &proto.strong_key),
            &digest,
        )?;
        Ok(digest)
    }

    /// Additionally indexes the proto under its weak key, for non-strict
    /// resolution.
    pub fn link_weak(&self, proto: &ArtifactProto) -> Result<()> {
        let bytes = serde_json::to_vec(proto).expect("artifact protos always serialize");
        let digest = self.cas.put_blob(&bytes)?;
        self.write_ref(
            &self.ref_path(&proto.project_name, &proto.element_name, &proto.weak_key),
            &digest,
        )
    }

    fn write_ref(&self, path: &Path, digest: &Digest) -> Result<()> {
        let bytes = serde_json::to_vec(digest).expect("digests always serialize");
        crate::utils::write_atomic(path, &bytes)
    }

    pub fn contains(&self, project: &str, element: &str, key: &str) -> bool {
        self.ref_path(project, element, key).is_file()
    }

    /// Loads the proto behind a key, touching the ref for LRU accounting.
    pub fn lookup(
        &self,
        project: &str,
        element: &str,
        key: &str,
    ) -> Result<Option<ArtifactProto>> {
        let path = self.ref_path(project, element, key);
        if !path.is_file() {
            return Ok(None);
        }
        let digest: Digest = crate::utils::read_json_file(&path)?;
        let bytes = self.cas.get_blob(&digest)?;
        let proto = serde_json::from_slice(&bytes)
            .map_err(|e| IoError::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e), &path))?;
        let now = fs::File::open(&path).and_then(|f| f.set_modified(SystemTime::now()));
        drop(now);
        Ok(Some(proto))
    }

    pub fn lookup_name(&self, name: &ArtifactName) -> Result<Option<ArtifactProto>> {
        self.lookup(&name.project, &name.element, &name.key)
    }

    pub fn remove(&self, project: &str, element: &str, key: &str) -> Result<()> {
        let path = self.ref_path(project, element, key);
        if path.is_file() {
            fs::remove_file(&path).map_err_path(&path)?;
        }
        Ok(())
    }

    /// Materialises the artifact tree at `dest`.
    pub fn checkout(&self, proto: &ArtifactProto, dest: &Path, hardlinks: bool) -> Result<()> {
        let tree = proto.tree.as_ref().ok_or_else(|| ArtifactError::NotCached {
            name: proto.name().to_string(),
        })?;
        let mode = if hardlinks { StageMode::Hardlink } else { StageMode::Copy };
        self.cas.checkout_tree(tree, dest, mode)?;
        Ok(())
    }

    /// Every ref on disk with its last-use time, oldest first.
    fn refs_by_age(&self) -> Vec<(PathBuf, SystemTime)> {
        let mut refs: Vec<(PathBuf, SystemTime)> = walkdir::WalkDir::new(&self.refs)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let mtime = e
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (e.into_path(), mtime)
            })
            .collect();
        refs.sort_by_key(|(_, mtime)| *mtime);
        refs
    }

    /// CAS roots reachable from the current refs, for garbage collection.
    pub fn live_roots(&self) -> Vec<Digest> {
        let mut roots = Vec::new();
        for (path, _) in self.refs_by_age() {
            let Ok(digest) = crate::utils::read_json_file::<Digest>(&path) else { continue };
            roots.push(digest);
            if let Ok(bytes) = self.cas.get_blob(&digest) {
                if let Ok(proto) = serde_json::from_slice::<ArtifactProto>(&bytes) {
                    roots.extend(proto.tree);
                    roots.extend(proto.buildtree);
                    roots.extend(proto.logs);
                }
            }
        }
        roots
    }

    /// Evicts least-recently-used artifacts until the store fits `quota`
    /// bytes, then garbage-collects unreferenced blobs. Runs under the cache
    /// lock; extra live roots (source cache refs) are kept alive.
    pub fn enforce_quota(&self, quota: u64, extra_roots: &[Digest]) -> Result<u64> {
        if self.cas.total_size() <= quota {
            return Ok(0);
        }
        let lock_path = self
            .refs
            .parent()
            .expect("refs directory always has a parent")
            .join("lock");
        let _lock = crate::cas::ExclusiveLock::acquire(&lock_path)?;
        let mut evicted = 0u64;
        loop {
            let mut roots = self.live_roots();
            roots.extend_from_slice(extra_roots);
            evicted += self.cas.prune(&roots)?;
            if self.cas.total_size() <= quota {
                return Ok(evicted);
            }
            let refs = self.refs_by_age();
            let Some((oldest, _)) = refs.first() else {
                return Err(crate::error::CasError::QuotaExceeded { quota }.into());
            };
            debug!(path = %oldest.display(), "evicting artifact ref for quota");
            fs::remove_file(oldest).map_err_path(oldest)?;
        }
    }
}
