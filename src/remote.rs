//! Remote cache client.
//!
//! Remotes follow the index/storage split: an index maps symbolic references
//! (artifact names, source keys) to root digests, a storage service moves
//! blobs. Servers are configured as ordered lists with per-entry push
//! capability; pulling walks the index list until one resolves, then walks
//! the storage list for each missing blob. A server that fails is skipped
//! with a warning; total pull failure is non-fatal and the caller falls back
//! to building locally.

use crate::artifact::ArtifactProto;
use crate::cas::{CasStore, Digest};
use crate::error::{Error, RemoteError, Result};
use crate::node::Node;
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    Index,
    Storage,
    All,
}

impl RemoteKind {
    pub fn serves_index(self) -> bool {
        matches!(self, Self::Index | Self::All)
    }

    pub fn serves_storage(self) -> bool {
        matches!(self, Self::Storage | Self::All)
    }
}

/// One configured remote server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteSpec {
    pub url: String,
    #[serde(default, rename = "instance-name")]
    pub instance_name: Option<String>,
    #[serde(default = "default_kind", rename = "type")]
    pub kind: RemoteKind,
    #[serde(default)]
    pub push: bool,
    #[serde(default, rename = "server-cert")]
    pub server_cert: Option<PathBuf>,
    #[serde(default, rename = "client-cert")]
    pub client_cert: Option<PathBuf>,
    #[serde(default, rename = "client-key")]
    pub client_key: Option<PathBuf>,
}

fn default_kind() -> RemoteKind {
    RemoteKind::All
}

impl RemoteSpec {
    pub fn from_node(node: &Node) -> Result<Self> {
        node.validate_keys(&[
            "url",
            "instance-name",
            "type",
            "push",
            "server-cert",
            "client-cert",
            "client-key",
        ])?;
        let kind = match node.get_str_opt("type")? {
            None | Some("all") => RemoteKind::All,
            Some("index") => RemoteKind::Index,
            Some("storage") => RemoteKind::Storage,
            Some(other) => {
                return Err(RemoteError::BadSpec {
                    url: node.get_str("url")?.to_string(),
                    message: format!("unknown remote type '{other}'"),
                }
                .into())
            }
        };
        Ok(Self {
            url: node.get_str("url")?.to_string(),
            instance_name: node.get_str_opt("instance-name")?.map(str::to_string),
            kind,
            push: node.get_bool("push", false)?,
            server_cert: node.get_str_opt("server-cert")?.map(PathBuf::from),
            client_cert: node.get_str_opt("client-cert")?.map(PathBuf::from),
            client_key: node.get_str_opt("client-key")?.map(PathBuf::from),
        })
    }
}

/// Symbolic reference service.
pub trait RemoteIndex: Send + Sync {
    fn url(&self) -> &str;
    fn get_ref(&self, uri: &str) -> Result<Option<Digest>, RemoteError>;
    fn put_ref(&self, uri: &str, digest: &Digest) -> Result<(), RemoteError>;
}

/// Blob transport service.
pub trait RemoteStorage: Send + Sync {
    fn url(&self) -> &str;
    /// A `FindMissingBlobs`-style probe: which of `digests` must be
    /// uploaded.
    fn missing_blobs(&self, digests: &[Digest]) -> Result<Vec<Digest>, RemoteError>;
    fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>, RemoteError>;
    fn put_blob(&self, digest: &Digest, bytes: &[u8]) -> Result<(), RemoteError>;
}

impl<T: RemoteIndex + ?Sized> RemoteIndex for std::sync::Arc<T> {
    fn url(&self) -> &str {
        (**self).url()
    }

    fn get_ref(&self, uri: &str) -> Result<Option<Digest>, RemoteError> {
        (**self).get_ref(uri)
    }

    fn put_ref(&self, uri: &str, digest: &Digest) -> Result<(), RemoteError> {
        (**self).put_ref(uri, digest)
    }
}

impl<T: RemoteStorage + ?Sized> RemoteStorage for std::sync::Arc<T> {
    fn url(&self) -> &str {
        (**self).url()
    }

    fn missing_blobs(&self, digests: &[Digest]) -> Result<Vec<Digest>, RemoteError> {
        (**self).missing_blobs(digests)
    }

    fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>, RemoteError> {
        (**self).get_blob(digest)
    }

    fn put_blob(&self, digest: &Digest, bytes: &[u8]) -> Result<(), RemoteError> {
        (**self).put_blob(digest, bytes)
    }
}

/// The ordered set of remotes for one concern (artifacts or sources).
pub struct RemoteCluster {
    indexes: Vec<(RemoteSpec, Box<dyn RemoteIndex>)>,
    storages: Vec<(RemoteSpec, Box<dyn RemoteStorage>)>,
}

impl fmt::Debug for RemoteCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCluster")
            .field("indexes", &self.indexes.len())
            .field("storages", &self.storages.len())
            .finish()
    }
}

impl Default for RemoteCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteCluster {
    pub fn new() -> Self {
        Self { indexes: Vec::new(), storages: Vec::new() }
    }

    /// Builds HTTP clients for each spec, in list order.
    pub fn from_specs(specs: &[RemoteSpec]) -> Result<Self> {
        let mut cluster = Self::new();
        for spec in specs {
            if spec.kind.serves_index() {
                cluster.add_index(spec.clone(), Box::new(HttpRemote::new(spec)?));
            }
            if spec.kind.serves_storage() {
                cluster.add_storage(spec.clone(), Box::new(HttpRemote::new(spec)?));
            }
        }
        Ok(cluster)
    }

    pub fn add_index(&mut self, spec: RemoteSpec, index: Box<dyn RemoteIndex>) {
        self.indexes.push((spec, index));
    }

    pub fn add_storage(&mut self, spec: RemoteSpec, storage: Box<dyn RemoteStorage>) {
        self.storages.push((spec, storage));
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty() && self.storages.is_empty()
    }

    pub fn has_push(&self) -> bool {
        self.indexes.iter().any(|(s, _)| s.push) || self.storages.iter().any(|(s, _)| s.push)
    }

    /// Resolves a symbolic reference; the first index that answers wins.
    /// Server failures are logged and skipped.
    pub fn pull_ref(&self, uri: &str) -> Result<Option<Digest>, RemoteError> {
        let mut failures = 0usize;
        let mut last_network: Option<RemoteError> = None;
        for (spec, index) in &self.indexes {
            match index.get_ref(uri) {
                Ok(Some(digest)) => return Ok(Some(digest)),
                Ok(None) => {}
                Err(e) => {
                    warn!(url = %spec.url, "index lookup failed: {e}");
                    failures += 1;
                    if e.is_network() {
                        last_network = Some(e);
                    }
                }
            }
        }
        // A clean "no index knows this reference" is None; if every index
        // was unreachable, surface the network error so the caller can
        // retry.
        if failures == self.indexes.len() {
            if let Some(e) = last_network {
                return Err(e);
            }
        }
        Ok(None)
    }

    /// Downloads a blob into the CAS, trying storages in order.
    pub fn pull_blob(&self, cas: &CasStore, digest: &Digest) -> Result<(), RemoteError> {
        if cas.has_blob(digest) {
            return Ok(());
        }
        let mut last: Option<RemoteError> = None;
        for (spec, storage) in &self.storages {
            match storage.get_blob(digest) {
                Ok(bytes) => {
                    let stored = cas.put_blob(&bytes).map_err(|e| RemoteError::Rejected {
                        url: spec.url.clone(),
                        message: e.to_string(),
                    })?;
                    if stored != *digest {
                        return Err(RemoteError::Rejected {
                            url: spec.url.clone(),
                            message: format!(
                                "blob {digest} arrived with digest {stored}"
                            ),
                        });
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(url = %spec.url, %digest, "blob download failed: {e}");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or(RemoteError::MissingBlob {
            url: "<no storage configured>".to_string(),
            digest: digest.to_string(),
        }))
    }

    /// Downloads a tree transitively.
    pub fn pull_tree(&self, cas: &CasStore, root: &Digest) -> Result<(), RemoteError> {
        self.pull_blob(cas, root)?;
        if let Ok(dir) = cas.get_directory(root) {
            for file in &dir.files {
                self.pull_blob(cas, &file.digest)?;
            }
            for sub in &dir.directories {
                self.pull_tree(cas, &sub.digest)?;
            }
        }
        Ok(())
    }

    /// Uploads a tree to every push-capable storage, probing for missing
    /// blobs first.
    pub fn push_tree(&self, cas: &CasStore, root: &Digest) -> Result<(), Error> {
        let blobs = cas.tree_blobs(root)?;
        for (spec, storage) in self.storages.iter().filter(|(s, _)| s.push) {
            let missing = storage.missing_blobs(&blobs)?;
            trace!(url = %spec.url, total = blobs.len(), missing = missing.len(), "pushing tree");
            for digest in missing {
                let bytes = cas.get_blob(&digest)?;
                storage.put_blob(&digest, &bytes)?;
            }
        }
        Ok(())
    }

    /// Writes a symbolic reference on every push-capable index.
    pub fn push_ref(&self, uri: &str, digest: &Digest) -> Result<(), RemoteError> {
        for (spec, index) in self.indexes.iter().filter(|(s, _)| s.push) {
            index.put_ref(uri, digest)?;
            trace!(url = %spec.url, uri, "reference pushed");
        }
        Ok(())
    }

    /// Pulls a complete artifact: proto, tree, logs, and optionally the
    /// build tree. `Ok(None)` when no index knows the reference.
    pub fn pull_artifact(
        &self,
        cas: &CasStore,
        uri: &str,
        pull_buildtrees: bool,
    ) -> Result<Option<ArtifactProto>, RemoteError> {
        let Some(proto_digest) = self.pull_ref(uri)? else { return Ok(None) };
        self.pull_blob(cas, &proto_digest)?;
        let bytes = cas.get_blob(&proto_digest).map_err(|e| RemoteError::Rejected {
            url: uri.to_string(),
            message: e.to_string(),
        })?;
        let proto: ArtifactProto =
            serde_json::from_slice(&bytes).map_err(|e| RemoteError::Rejected {
                url: uri.to_string(),
                message: format!("malformed artifact proto: {e}"),
            })?;
        if let Some(tree) = &proto.tree {
            self.pull_tree(cas, tree)?;
        }
        if let Some(logs) = &proto.logs {
            self.pull_blob(cas, logs)?;
        }
        if pull_buildtrees {
            if let Some(buildtree) = &proto.buildtree {
                self.pull_tree(cas, buildtree)?;
            }
        }
        Ok(Some(proto))
    }

    /// Pushes a complete artifact. Failures are reported, not fatal to the
    /// build that produced it.
    pub fn push_artifact(&self, cas: &CasStore, proto: &ArtifactProto) -> Result<(), Error> {
        let bytes = serde_json::to_vec(proto).expect("artifact protos always serialize");
        let proto_digest = cas.put_blob(&bytes)?;
        if let Some(tree) = &proto.tree {
            self.push_tree(cas, tree)?;
        }
        if let Some(buildtree) = &proto.buildtree {
            self.push_tree(cas, buildtree)?;
        }
        if let Some(logs) = &proto.logs {
            self.push_tree(cas, logs)?;
        }
        self.push_tree(cas, &proto_digest)?;
        self.push_ref(&proto.name().uri(), &proto_digest)?;
        Ok(())
    }
}

/// HTTP implementation of both services, over a plain JSON mapping:
/// `GET/PUT /blobs/<hash>/<size>`, `GET/PUT /refs?uri=...`,
/// `POST /missing`.
pub struct HttpRemote {
    base: String,
    client: reqwest::blocking::Client,
}

impl HttpRemote {
    pub fn new(spec: &RemoteSpec) -> Result<Self, RemoteError> {
        let mut builder = reqwest::blocking::Client::builder();
        let bad = |message: String| RemoteError::BadSpec { url: spec.url.clone(), message };
        url::Url::parse(&spec.url).map_err(|e| bad(e.to_string()))?;
        if let Some(cert_path) = &spec.server_cert {
            let pem = std::fs::read(cert_path).map_err(|e| bad(e.to_string()))?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| bad(e.to_string()))?;
            builder = builder.add_root_certificate(cert);
        }
        if let (Some(cert), Some(key)) = (&spec.client_cert, &spec.client_key) {
            let mut pem = std::fs::read(cert).map_err(|e| bad(e.to_string()))?;
            pem.extend(std::fs::read(key).map_err(|e| bad(e.to_string()))?);
            let identity = reqwest::Identity::from_pem(&pem).map_err(|e| bad(e.to_string()))?;
            builder = builder.identity(identity);
        }
        let client = builder.build().map_err(|e| bad(e.to_string()))?;
        let mut base = spec.url.trim_end_matches('/').to_string();
        if let Some(instance) = &spec.instance_name {
            base = format!("{base}/{instance}");
        }
        Ok(Self { base, client })
    }

    fn network(&self, e: reqwest::Error) -> RemoteError {
        RemoteError::Network { url: self.base.clone(), message: e.to_string() }
    }

    fn rejected(&self, status: reqwest::StatusCode) -> RemoteError {
        RemoteError::Rejected { url: self.base.clone(), message: format!("HTTP {status}") }
    }
}

impl RemoteIndex for HttpRemote {
    fn url(&self) -> &str {
        &self.base
    }

    fn get_ref(&self, uri: &str) -> Result<Option<Digest>, RemoteError> {
        let response = self
            .client
            .get(format!("{}/refs", self.base))
            .query(&[("uri", uri)])
            .send()
            .map_err(|e| self.network(e))?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let digest: Digest = response.json().map_err(|e| self.network(e))?;
                Ok(Some(digest))
            }
            s => Err(self.rejected(s)),
        }
    }

    fn put_ref(&self, uri: &str, digest: &Digest) -> Result<(), RemoteError> {
        let response = self
            .client
            .put(format!("{}/refs", self.base))
            .query(&[("uri", uri)])
            .json(digest)
            .send()
            .map_err(|e| self.network(e))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.rejected(response.status()))
        }
    }
}

impl RemoteStorage for HttpRemote {
    fn url(&self) -> &str {
        &self.base
    }

    fn missing_blobs(&self, digests: &[Digest]) -> Result<Vec<Digest>, RemoteError> {
        let response = self
            .client
            .post(format!("{}/missing", self.base))
            .json(&digests)
            .send()
            .map_err(|e| self.network(e))?;
        if response.status().is_success() {
            response.json().map_err(|e| self.network(e))
        } else {
            Err(self.rejected(response.status()))
        }
    }

    fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>, RemoteError> {
        let response = self
            .client
            .get(format!("{}/blobs/{}/{}", self.base, digest.hex(), digest.size()))
            .send()
            .map_err(|e| self.network(e))?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Err(RemoteError::MissingBlob {
                url: self.base.clone(),
                digest: digest.to_string(),
            }),
            s if s.is_success() => {
                Ok(response.bytes().map_err(|e| self.network(e))?.to_vec())
            }
            s => Err(self.rejected(s)),
        }
    }

    fn put_blob(&self, digest: &Digest, bytes: &[u8]) -> Result<(), RemoteError> {
        let response = self
            .client
            .put(format!("{}/blobs/{}/{}", self.base, digest.hex(), digest.size()))
            .body(bytes.to_vec())
            .send()
            .map_err(|e| self.network(e))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.rejected(response.status()))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::Arc;

    fn cas() -> (tempfile::TempDir, Arc<CasStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CasStore::open(dir.path()).unwrap());
        (dir, store)
    }

    #[test]
    fn push_then_pull_roundtrip() {
        let (_dir, local) = cas();
        let remote = MemoryRemote::new("primary");
        let cluster = cluster_of(&remote, true);

        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("lib.so"), "binary").unwrap();
        let tree = local.import_tree(src.path()).unwrap();
        cluster.push_tree(&local, &tree).unwrap();
        cluster.push_ref("artifact://p/e/key", &tree).unwrap();

        // A cold cache pulls the tree back.
        let (_dir2, cold) = cas();
        let resolved = cluster.pull_ref("artifact://p/e/key").unwrap().unwrap();
        assert_eq!(resolved, tree);
        cluster.pull_tree(&cold, &tree).unwrap();
        assert!(cold.has_blob(&tree));
    }

    #[test]
    fn first_resolving_index_wins() {
        let (_dir, local) = cas();
        let a = MemoryRemote::new("a");
        let b = MemoryRemote::new("b");
        let digest = local.put_blob(b"proto").unwrap();
        b.blobs.lock().unwrap().insert(digest, b"proto".to_vec());
        b.refs.lock().unwrap().insert("ref".into(), digest);

        let mut cluster = RemoteCluster::new();
        for remote in [&a, &b] {
            let spec = RemoteSpec {
                url: remote.name.clone(),
                instance_name: None,
                kind: RemoteKind::All,
                push: false,
                server_cert: None,
                client_cert: None,
                client_key: None,
            };
            cluster.add_index(spec.clone(), Box::new(Arc::clone(remote)));
            cluster.add_storage(spec, Box::new(Arc::clone(remote)));
        }
        assert_eq!(cluster.pull_ref("ref").unwrap(), Some(digest));
    }

    #[test]
    fn unreachable_server_is_skipped() {
        let (_dir, local) = cas();
        let flaky = MemoryRemote::new("flaky");
        let good = MemoryRemote::new("good");
        let digest = Digest::of_bytes(b"blob");
        good.blobs.lock().unwrap().insert(digest, b"blob".to_vec());
        flaky
            .unreachable
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let mut cluster = RemoteCluster::new();
        for remote in [&flaky, &good] {
            let spec = RemoteSpec {
                url: remote.name.clone(),
                instance_name: None,
                kind: RemoteKind::Storage,
                push: false,
                server_cert: None,
                client_cert: None,
                client_key: None,
            };
            cluster.add_storage(spec, Box::new(Arc::clone(remote)));
        }
        cluster.pull_blob(&local, &digest).unwrap();
        assert!(local.has_blob(&digest));
    }

    #[test]
    fn push_only_targets_push_remotes() {
        let (_dir, local) = cas();
        let ro = MemoryRemote::new("readonly");
        let cluster = cluster_of(&ro, false);
        let digest = local.put_blob(b"data").unwrap();
        cluster.push_tree(&local, &digest).unwrap();
        assert!(ro.blobs.lock().unwrap().is_empty());
        cluster.push_ref("r", &digest).unwrap();
        assert!(ro.refs.lock().unwrap().is_empty());
    }

    #[test]
    fn corrupted_download_is_rejected() {
        let (_dir, local) = cas();
        let evil = MemoryRemote::new("evil");
        let digest = Digest::of_bytes(b"expected");
        evil.blobs.lock().unwrap().insert(digest, b"tampered".to_vec());
        let cluster = cluster_of(&evil, false);
        assert!(cluster.pull_blob(&local, &digest).is_err());
    }
}
