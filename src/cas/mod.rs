//! Local content-addressable store.
//!
//! Blobs are named by the SHA-256 of their bytes and live under
//! `<cachedir>/cas/objects/<hh>/<hex>`. Directories are stored as canonical
//! JSON blobs listing name-sorted files, subdirectories and symlinks, so a
//! tree is identified by the digest of its root directory object. Writes are
//! atomic (temp file, then rename by digest); reads are lock-free. The store
//! never records ownership: checkouts materialise as the calling user and
//! modes are normalised to 0644/0755, which is what the artifact metadata
//! policy requires.

use crate::error::{CasError, IoError, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::{
    collections::{HashMap, HashSet},
    fmt, fs,
    io::{self, Read, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// A SHA-256 content digest with the blob's size in bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    hash: [u8; 32],
    size: u64,
}

impl Digest {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self { hash: hasher.finalize().into(), size: bytes.len() as u64 }
    }

    pub fn hex(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn parse(hash: &str, size: u64) -> Option<Self> {
        let bytes = hex::decode(hash).ok()?;
        let hash: [u8; 32] = bytes.try_into().ok()?;
        Some(Self { hash, size })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hex(), self.size)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        DigestRepr { hash: self.hex(), size: self.size }.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = DigestRepr::deserialize(deserializer)?;
        Digest::parse(&repr.hash, repr.size)
            .ok_or_else(|| serde::de::Error::custom("malformed digest hash"))
    }
}

#[derive(Serialize, Deserialize)]
struct DigestRepr {
    hash: String,
    size: u64,
}

/// A directory object: the tree indirection between blobs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Directory {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub directories: Vec<DirNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symlinks: Vec<SymlinkNode>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub digest: Digest,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub executable: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DirNode {
    pub name: String,
    pub digest: Digest,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SymlinkNode {
    pub name: String,
    pub target: String,
}

impl Directory {
    fn normalize(&mut self) {
        self.files.sort_by(|a, b| a.name.cmp(&b.name));
        self.directories.sort_by(|a, b| a.name.cmp(&b.name));
        self.symlinks.sort_by(|a, b| a.name.cmp(&b.name));
    }
}

/// One leaf of a flattened tree listing.
#[derive(Clone, Debug, PartialEq)]
pub enum TreeEntry {
    File { digest: Digest, executable: bool },
    Symlink { target: String },
}

/// How [`CasStore::checkout_tree`] materialises files.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StageMode {
    /// Plain copies, always writable by the caller.
    Copy,
    /// Hardlinks into the store where possible; executables are copied so
    /// the store objects can stay mode 0444.
    Hardlink,
}

pub struct CasStore {
    objects: PathBuf,
    tmp: PathBuf,
    pins: Arc<Mutex<HashMap<Digest, usize>>>,
}

impl fmt::Debug for CasStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CasStore").field("objects", &self.objects).finish()
    }
}

impl CasStore {
    /// Opens (creating if needed) the store under `<cachedir>/cas`.
    pub fn open(cachedir: &Path) -> Result<Self, CasError> {
        let objects = cachedir.join("cas").join("objects");
        let tmp = cachedir.join("tmp");
        fs::create_dir_all(&objects).map_err(|e| io_err(e, &objects))?;
        fs::create_dir_all(&tmp).map_err(|e| io_err(e, &tmp))?;
        Ok(Self { objects, tmp, pins: Arc::default() })
    }

    fn object_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.hex();
        self.objects.join(&hex[..2]).join(&hex[2..])
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.object_path(digest).is_file()
    }

    /// Path of a stored blob, failing if it is absent.
    pub fn blob_path(&self, digest: &Digest) -> Result<PathBuf, CasError> {
        let path = self.object_path(digest);
        if path.is_file() {
            Ok(path)
        } else {
            Err(CasError::MissingBlob { digest: digest.to_string() })
        }
    }

    pub fn put_blob(&self, bytes: &[u8]) -> Result<Digest, CasError> {
        let digest = Digest::of_bytes(bytes);
        let path = self.object_path(&digest);
        if path.is_file() {
            return Ok(digest);
        }
        self.write_object(&path, |file| file.write_all(bytes))?;
        Ok(digest)
    }

    /// Streams a file from disk into the store.
    pub fn put_file(&self, source: &Path) -> Result<Digest, CasError> {
        let mut input = fs::File::open(source).map_err(|e| io_err(e, source))?;
        let mut hasher = Sha256::new();
        let mut tmp = tempfile::NamedTempFile::new_in(&self.tmp).map_err(|e| io_err(e, &self.tmp))?;
        let mut buf = [0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let n = input.read(&mut buf).map_err(|e| io_err(e, source))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n]).map_err(|e| io_err(e, source))?;
            size += n as u64;
        }
        let digest = Digest { hash: hasher.finalize().into(), size };
        let path = self.object_path(&digest);
        if path.is_file() {
            return Ok(digest);
        }
        self.persist_object(tmp, &path)?;
        Ok(digest)
    }

    fn write_object(
        &self,
        path: &Path,
        write: impl FnOnce(&mut fs::File) -> io::Result<()>,
    ) -> Result<(), CasError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.tmp).map_err(|e| io_err(e, &self.tmp))?;
        write(tmp.as_file_mut()).map_err(|e| io_err(e, path))?;
        self.persist_object(tmp, path)
    }

    fn persist_object(&self, tmp: tempfile::NamedTempFile, path: &Path) -> Result<(), CasError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(e, parent))?;
        }
        let mut perms = tmp.as_file().metadata().map_err(|e| io_err(e, path))?.permissions();
        perms.set_mode(0o444);
        tmp.as_file().set_permissions(perms).map_err(|e| io_err(e, path))?;
        match tmp.persist(path) {
            Ok(_) => Ok(()),
            // Another instance may have stored the same object concurrently.
            Err(e) if path.is_file() => {
                drop(e);
                Ok(())
            }
            Err(e) => Err(io_err(e.error, path)),
        }
    }

    pub fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>, CasError> {
        let path = self.blob_path(digest)?;
        let bytes = fs::read(&path).map_err(|e| io_err(e, &path))?;
        Ok(bytes)
    }

    /// Verifies a stored blob against its digest.
    pub fn verify_blob(&self, digest: &Digest) -> Result<(), CasError> {
        let bytes = self.get_blob(digest)?;
        let actual = Digest::of_bytes(&bytes);
        if actual != *digest {
            return Err(CasError::Corrupt {
                digest: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    pub fn put_directory(&self, dir: &Directory) -> Result<Digest, CasError> {
        let mut dir = dir.clone();
        dir.normalize();
        let bytes = serde_json::to_vec(&dir)
            .expect("directory objects always serialize");
        self.put_blob(&bytes)
    }

    pub fn get_directory(&self, digest: &Digest) -> Result<Directory, CasError> {
        let bytes = self.get_blob(digest)?;
        serde_json::from_slice(&bytes).map_err(|e| CasError::BadDirectory {
            digest: digest.to_string(),
            message: e.to_string(),
        })
    }

    /// Ingests a directory tree from disk, returning the root digest.
    /// Regular files, directories and symlinks are captured; everything else
    /// is rejected. setuid/setgid bits and xattrs are not representable and
    /// are thereby dropped.
    pub fn import_tree(&self, path: &Path) -> Result<Digest, CasError> {
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        let mut symlinks = Vec::new();
        let mut entries: Vec<_> = fs::read_dir(path)
            .map_err(|e| io_err(e, path))?
            .collect::<io::Result<_>>()
            .map_err(|e| io_err(e, path))?;
        entries.sort_by_key(|e| e.file_name());

        let mut file_paths = Vec::new();
        for entry in &entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            let entry_path = entry.path();
            let meta = fs::symlink_metadata(&entry_path).map_err(|e| io_err(e, &entry_path))?;
            let ftype = meta.file_type();
            if ftype.is_symlink() {
                let target = fs::read_link(&entry_path).map_err(|e| io_err(e, &entry_path))?;
                symlinks.push(SymlinkNode {
                    name,
                    target: target.to_string_lossy().into_owned(),
                });
            } else if ftype.is_dir() {
                let digest = self.import_tree(&entry_path)?;
                dirs.push(DirNode { name, digest });
            } else if ftype.is_file() {
                let executable = meta.permissions().mode() & 0o111 != 0;
                file_paths.push((name, entry_path, executable));
            } else {
                return Err(io_err(
                    io::Error::new(io::ErrorKind::InvalidInput, "unsupported file type"),
                    &entry_path,
                ));
            }
        }

        let ingested: Result<Vec<FileNode>, CasError> = file_paths
            .par_iter()
            .map(|(name, path, executable)| {
                Ok(FileNode {
                    name: name.clone(),
                    digest: self.put_file(path)?,
                    executable: *executable,
                })
            })
            .collect();
        files.extend(ingested?);

        self.put_directory(&Directory { files, directories: dirs, symlinks })
    }

    /// Materialises a tree at `dest`, which must not already exist.
    pub fn checkout_tree(
        &self,
        digest: &Digest,
        dest: &Path,
        mode: StageMode,
    ) -> Result<(), CasError> {
        fs::create_dir_all(dest).map_err(|e| io_err(e, dest))?;
        let dir = self.get_directory(digest)?;
        for file in &dir.files {
            let target = dest.join(&file.name);
            self.checkout_file(&file.digest, &target, file.executable, mode)?;
        }
        for symlink in &dir.symlinks {
            let target = dest.join(&symlink.name);
            std::os::unix::fs::symlink(&symlink.target, &target)
                .map_err(|e| io_err(e, &target))?;
        }
        for sub in &dir.directories {
            self.checkout_tree(&sub.digest, &dest.join(&sub.name), mode)?;
        }
        Ok(())
    }

    pub fn checkout_file(
        &self,
        digest: &Digest,
        dest: &Path,
        executable: bool,
        mode: StageMode,
    ) -> Result<(), CasError> {
        let source = self.blob_path(digest)?;
        if mode == StageMode::Hardlink && !executable {
            match fs::hard_link(&source, dest) {
                Ok(()) => return Ok(()),
                // Cross-device links fall back to copying.
                Err(_) => {}
            }
        }
        fs::copy(&source, dest).map_err(|e| io_err(e, dest))?;
        let perm = fs::Permissions::from_mode(if executable { 0o755 } else { 0o644 });
        fs::set_permissions(dest, perm).map_err(|e| io_err(e, dest))?;
        Ok(())
    }

    /// Flattens a tree into `(slash-joined relative path, entry)` pairs in
    /// depth-first order.
    pub fn tree_entries(&self, digest: &Digest) -> Result<Vec<(String, TreeEntry)>, CasError> {
        let mut out = Vec::new();
        self.collect_entries(digest, String::new(), &mut out)?;
        Ok(out)
    }

    fn collect_entries(
        &self,
        digest: &Digest,
        prefix: String,
        out: &mut Vec<(String, TreeEntry)>,
    ) -> Result<(), CasError> {
        let dir = self.get_directory(digest)?;
        for file in dir.files {
            out.push((
                join_path(&prefix, &file.name),
                TreeEntry::File { digest: file.digest, executable: file.executable },
            ));
        }
        for symlink in dir.symlinks {
            out.push((join_path(&prefix, &symlink.name), TreeEntry::Symlink {
                target: symlink.target,
            }));
        }
        for sub in dir.directories {
            self.collect_entries(&sub.digest, join_path(&prefix, &sub.name), out)?;
        }
        Ok(())
    }

    /// The transitive blob set of a tree, including directory objects. A
    /// root that is not a directory object (a log blob for instance) is its
    /// own transitive set.
    pub fn tree_blobs(&self, digest: &Digest) -> Result<Vec<Digest>, CasError> {
        let mut out = vec![*digest];
        let dir = match self.get_directory(digest) {
            Ok(dir) => dir,
            Err(CasError::BadDirectory { .. }) => return Ok(out),
            Err(e) => return Err(e),
        };
        for file in dir.files {
            out.push(file.digest);
        }
        for sub in dir.directories {
            out.extend(self.tree_blobs(&sub.digest)?);
        }
        Ok(out)
    }

    /// Pins digests against garbage collection for the guard's lifetime.
    pub fn pin(&self, digests: Vec<Digest>) -> CasPin {
        let mut pins = self.pins.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for digest in &digests {
            *pins.entry(*digest).or_insert(0) += 1;
        }
        drop(pins);
        CasPin { pins: Arc::clone(&self.pins), digests }
    }

    fn is_pinned(&self, digest: &Digest) -> bool {
        self.pins
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(digest)
    }

    /// Total bytes stored.
    pub fn total_size(&self) -> u64 {
        crate::utils::dir_size(&self.objects)
    }

    /// Removes every object that is neither reachable from `live` roots nor
    /// pinned. Returns the number of bytes reclaimed.
    pub fn prune(&self, live_roots: &[Digest]) -> Result<u64, CasError> {
        let mut live: HashSet<Digest> = HashSet::new();
        for root in live_roots {
            if self.has_blob(root) {
                for digest in self.tree_blobs(root)? {
                    live.insert(digest);
                }
            }
        }
        let mut reclaimed = 0u64;
        for entry in walkdir::WalkDir::new(&self.objects).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| {
                io_err(io::Error::new(io::ErrorKind::Other, e.to_string()), &self.objects)
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(digest) = digest_from_object_path(entry.path()) else { continue };
            if live.contains(&digest) || self.is_pinned(&digest) {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or_default();
            if fs::remove_file(entry.path()).is_ok() {
                reclaimed += size;
            }
        }
        Ok(reclaimed)
    }
}

fn digest_from_object_path(path: &Path) -> Option<Digest> {
    let name = path.file_name()?.to_str()?;
    let shard = path.parent()?.file_name()?.to_str()?;
    let size = path.metadata().ok()?.len();
    Digest::parse(&format!("{shard}{name}"), size)
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn io_err(e: io::Error, path: &Path) -> CasError {
    CasError::Io(IoError::new(e, path))
}

/// Guard holding digests pinned in the store.
pub struct CasPin {
    pins: Arc<Mutex<HashMap<Digest, usize>>>,
    digests: Vec<Digest>,
}

impl Drop for CasPin {
    fn drop(&mut self) {
        let mut pins = self.pins.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for digest in &self.digests {
            if let Some(count) = pins.get_mut(digest) {
                *count -= 1;
                if *count == 0 {
                    pins.remove(digest);
                }
            }
        }
    }
}

/// Advisory exclusive lock file taken around eviction and collection.
pub struct ExclusiveLock {
    path: PathBuf,
}

impl ExclusiveLock {
    pub fn acquire(path: &Path) -> Result<Self, CasError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(e, parent))?;
        }
        match fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self { path: path.to_path_buf() })
            }
            Err(e) => Err(io_err(e, path)),
        }
    }
}

impl Drop for ExclusiveLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> (tempfile::TempDir, CasStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CasStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn blob_roundtrip() {
        let (_dir, store) = store();
        let digest = store.put_blob(b"hello world").unwrap();
        assert!(store.has_blob(&digest));
        assert_eq!(store.get_blob(&digest).unwrap(), b"hello world");
        store.verify_blob(&digest).unwrap();
    }

    #[test]
    fn digests_are_stable() {
        let digest = Digest::of_bytes(b"abc");
        assert_eq!(
            digest.hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(digest.size(), 3);
    }

    #[test]
    fn tree_import_checkout_roundtrip() {
        let (_dir, store) = store();
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("usr/bin")).unwrap();
        fs::write(src.path().join("usr/bin/tool"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(
            src.path().join("usr/bin/tool"),
            fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        fs::write(src.path().join("README"), "docs\n").unwrap();
        std::os::unix::fs::symlink("usr/bin/tool", src.path().join("tool")).unwrap();

        let digest = store.import_tree(src.path()).unwrap();

        let dest = tempfile::tempdir().unwrap();
        let out = dest.path().join("checkout");
        store.checkout_tree(&digest, &out, StageMode::Copy).unwrap();
        assert_eq!(fs::read_to_string(out.join("README")).unwrap(), "docs\n");
        let mode = fs::metadata(out.join("usr/bin/tool")).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        assert_eq!(fs::read_link(out.join("tool")).unwrap(), PathBuf::from("usr/bin/tool"));
    }

    #[test]
    fn identical_trees_share_a_digest() {
        let (_dir, store) = store();
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        for root in [&a, &b] {
            fs::write(root.path().join("f"), "same").unwrap();
        }
        let da = store.import_tree(a.path()).unwrap();
        let db = store.import_tree(b.path()).unwrap();
        assert_eq!(da, db);
    }

    #[test]
    fn tree_entries_flatten() {
        let (_dir, store) = store();
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("bin")).unwrap();
        fs::write(src.path().join("bin/a"), "a").unwrap();
        fs::write(src.path().join("top"), "t").unwrap();
        let digest = store.import_tree(src.path()).unwrap();
        let entries = store.tree_entries(&digest).unwrap();
        let paths: Vec<_> = entries.iter().map(|(p, _)| p.as_str()).collect();
        assert!(paths.contains(&"bin/a"));
        assert!(paths.contains(&"top"));
    }

    #[test]
    fn prune_keeps_live_and_pinned() {
        let (_dir, store) = store();
        let live = store.put_blob(b"live").unwrap();
        let pinned = store.put_blob(b"pinned").unwrap();
        let dead = store.put_blob(b"dead").unwrap();
        let _pin = store.pin(vec![pinned]);
        let reclaimed = store.prune(&[live]).unwrap();
        assert!(reclaimed > 0);
        assert!(store.has_blob(&live));
        assert!(store.has_blob(&pinned));
        assert!(!store.has_blob(&dead));
    }

    #[test]
    fn exclusive_lock_excludes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let lock = ExclusiveLock::acquire(&path).unwrap();
        assert!(ExclusiveLock::acquire(&path).is_err());
        drop(lock);
        ExclusiveLock::acquire(&path).unwrap();
    }
}
