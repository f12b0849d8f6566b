//! Shared fixtures: a directory-backed test source kind, in-memory remotes
//! and project scaffolding.
#![allow(dead_code)]

use bst_core::error::Result;
use bst_core::node::Node;
use bst_core::plugin::{PluginRegistry, SourceContext, SourceKindDecl, SourcePlugin};
use bst_core::{Context, Digest, Stream, UserConfig};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A source kind staging a local directory, with an explicit `ref` standing
/// in for upstream content identity. Tracking derives the ref from the
/// directory contents.
#[derive(Debug, Default)]
pub struct DirSource {
    path: PathBuf,
    reference: Option<String>,
    requires_previous: bool,
}

impl DirSource {
    fn content_hash(path: &Path) -> String {
        let mut entries: Vec<(String, Vec<u8>)> = walkdir::WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e
                    .path()
                    .strip_prefix(path)
                    .unwrap()
                    .to_string_lossy()
                    .into_owned();
                (rel, fs::read(e.path()).unwrap_or_default())
            })
            .collect();
        entries.sort();
        let mut bytes = Vec::new();
        for (name, content) in entries {
            bytes.extend_from_slice(name.as_bytes());
            bytes.push(0);
            bytes.extend_from_slice(&content);
            bytes.push(0);
        }
        Digest::of_bytes(&bytes).hex()
    }
}

impl SourcePlugin for DirSource {
    fn configure(&mut self, node: &Node) -> Result<()> {
        node.validate_keys(&["path", "ref", "requires-previous"])?;
        self.path = PathBuf::from(node.get_str("path")?);
        self.reference = node.get_str_opt("ref")?.map(str::to_string);
        self.requires_previous = node.get_bool("requires-previous", false)?;
        Ok(())
    }

    fn unique_key(&self) -> Option<serde_json::Value> {
        self.reference.as_ref().map(|r| serde_json::json!({ "ref": r }))
    }

    fn requires_previous_sources(&self) -> bool {
        self.requires_previous
    }

    fn get_ref(&self) -> Option<Node> {
        self.reference.as_ref().map(|r| {
            let mut node = Node::empty("dir source ref");
            node.insert("ref", Node::scalar(r.clone(), bst_core::Provenance::synthetic("track")));
            node
        })
    }

    fn set_ref(&mut self, node: &Node) -> Result<()> {
        self.reference = Some(node.get_str("ref")?.to_string());
        Ok(())
    }

    fn fetch(&self, _ctx: &SourceContext<'_>) -> Result<()> {
        Ok(())
    }

    fn stage(&self, _ctx: &SourceContext<'_>, directory: &Path) -> Result<()> {
        for entry in walkdir::WalkDir::new(&self.path).min_depth(1) {
            let entry = entry.map_err(|e| {
                bst_core::Error::User(format!("cannot stage {}: {e}", self.path.display()))
            })?;
            let rel = entry.path().strip_prefix(&self.path).unwrap();
            let dest = directory.join(rel);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&dest)
                    .map_err(|e| bst_core::Error::User(e.to_string()))?;
            } else {
                bst_core::utils::copy_entry(entry.path(), &dest)?;
            }
        }
        Ok(())
    }

    fn track(&self, _ctx: &SourceContext<'_>) -> Result<Option<Node>> {
        let mut node = Node::empty("tracked ref");
        node.insert(
            "ref",
            Node::scalar(
                Self::content_hash(&self.path),
                bst_core::Provenance::synthetic("track"),
            ),
        );
        Ok(Some(node))
    }
}

pub fn registry() -> PluginRegistry {
    let mut registry = PluginRegistry::with_builtins();
    registry
        .register_source(SourceKindDecl {
            kind: "dir".to_string(),
            version: 0,
            defaults: None,
            deprecated: None,
            create: Box::new(|| Box::new(DirSource::default())),
        })
        .unwrap();
    registry
}

/// A scratch project checkout.
pub struct TestProject {
    pub dir: tempfile::TempDir,
}

impl TestProject {
    pub fn new(conf: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("project.conf"), conf).unwrap();
        fs::create_dir_all(dir.path().join("elements")).unwrap();
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_element(&self, name: &str, yaml: &str) {
        let path = self.dir.path().join("elements").join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, yaml).unwrap();
    }

    /// Creates a content directory usable by `dir` sources, returning its
    /// absolute path.
    pub fn write_files(&self, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let root = self.dir.path().join("files").join(name);
        for (rel, content) in files {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        fs::create_dir_all(&root).unwrap();
        root
    }
}

/// A context over a scratch cache directory.
pub struct TestSession {
    pub cache_dir: tempfile::TempDir,
    pub stream: Stream,
}

impl TestSession {
    pub fn new() -> Self {
        Self::with_config(UserConfig::default())
    }

    pub fn with_config(mut config: UserConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let cache_dir = tempfile::tempdir().unwrap();
        config.cachedir = Some(cache_dir.path().to_path_buf());
        let context = Context::with_services(
            config,
            Arc::new(registry()),
            Arc::new(bst_core::sandbox::HostExecutor),
        )
        .unwrap();
        Self { cache_dir, stream: Stream::new(Arc::new(context)) }
    }
}

/// In-memory index + storage remote for exercising pull/push flows.
#[derive(Default)]
pub struct MemoryRemote {
    pub name: String,
    pub refs: Mutex<HashMap<String, Digest>>,
    pub blobs: Mutex<HashMap<Digest, Vec<u8>>>,
    pub unreachable: std::sync::atomic::AtomicBool,
}

impl MemoryRemote {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self { name: name.to_string(), ..Default::default() })
    }

    fn check(&self) -> Result<(), bst_core::error::RemoteError> {
        if self.unreachable.load(std::sync::atomic::Ordering::SeqCst) {
            Err(bst_core::error::RemoteError::Network {
                url: self.name.clone(),
                message: "unreachable".into(),
            })
        } else {
            Ok(())
        }
    }
}

impl bst_core::remote::RemoteIndex for MemoryRemote {
    fn url(&self) -> &str {
        &self.name
    }

    fn get_ref(&self, uri: &str) -> Result<Option<Digest>, bst_core::error::RemoteError> {
        self.check()?;
        Ok(self.refs.lock().unwrap().get(uri).copied())
    }

    fn put_ref(&self, uri: &str, digest: &Digest) -> Result<(), bst_core::error::RemoteError> {
        self.check()?;
        self.refs.lock().unwrap().insert(uri.to_string(), *digest);
        Ok(())
    }
}

impl bst_core::remote::RemoteStorage for MemoryRemote {
    fn url(&self) -> &str {
        &self.name
    }

    fn missing_blobs(
        &self,
        digests: &[Digest],
    ) -> Result<Vec<Digest>, bst_core::error::RemoteError> {
        self.check()?;
        let blobs = self.blobs.lock().unwrap();
        Ok(digests.iter().filter(|d| !blobs.contains_key(d)).copied().collect())
    }

    fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>, bst_core::error::RemoteError> {
        self.check()?;
        self.blobs.lock().unwrap().get(digest).cloned().ok_or_else(|| {
            bst_core::error::RemoteError::MissingBlob {
                url: self.name.clone(),
                digest: digest.to_string(),
            }
        })
    }

    fn put_blob(&self, digest: &Digest, bytes: &[u8]) -> Result<(), bst_core::error::RemoteError> {
        self.check()?;
        self.blobs.lock().unwrap().insert(*digest, bytes.to_vec());
        Ok(())
    }
}

pub fn memory_cluster(
    remote: &Arc<MemoryRemote>,
    push: bool,
) -> bst_core::remote::RemoteCluster {
    let spec = bst_core::remote::RemoteSpec {
        url: remote.name.clone(),
        instance_name: None,
        kind: bst_core::remote::RemoteKind::All,
        push,
        server_cert: None,
        client_cert: None,
        client_key: None,
    };
    let mut cluster = bst_core::remote::RemoteCluster::new();
    cluster.add_index(spec.clone(), Box::new(Arc::clone(remote)));
    cluster.add_storage(spec, Box::new(Arc::clone(remote)));
    cluster
}
