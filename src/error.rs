//! Error types emitted by the core.
//!
//! Every expected failure mode is `Result`-typed; each domain has its own
//! error enum and all of them fold into [`Error`]. Errors that originate in
//! YAML carry the [`Provenance`] of the offending node so the frontend can
//! print `file [line N column M]` references.

use crate::node::Provenance;
use std::{
    io,
    path::{Path, PathBuf},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Broad classification used to partition process exit codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Load,
    Plugin,
    Sandbox,
    Cache,
    Network,
    User,
    Internal,
}

/// Top level error of the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Cas(#[from] CasError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Io(#[from] IoError),
    /// Bad input from the driver's caller (unknown element, malformed
    /// artifact name, ...).
    #[error("{0}")]
    User(String),
    /// A task was cancelled before it could complete.
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Load(_) => ErrorClass::Load,
            Self::Plugin(_) => ErrorClass::Plugin,
            Self::Source(e) => e.class(),
            Self::Sandbox(_) => ErrorClass::Sandbox,
            Self::Cas(_) | Self::Artifact(_) => ErrorClass::Cache,
            Self::Remote(_) => ErrorClass::Network,
            Self::Io(_) => ErrorClass::Internal,
            Self::User(_) | Self::Cancelled => ErrorClass::User,
        }
    }

    /// Whether retrying the operation may succeed (network-class failures).
    pub fn is_network(&self) -> bool {
        match self {
            Self::Remote(e) => e.is_network(),
            Self::Source(SourceError::Fetch { .. }) => true,
            _ => false,
        }
    }

    /// Provenance of the node this error refers to, if any.
    pub fn provenance(&self) -> Option<&Provenance> {
        match self {
            Self::Load(e) => Some(&e.provenance),
            Self::Plugin(PluginError::Configure { provenance, .. }) => Some(provenance),
            _ => None,
        }
    }
}

/// An io error paired with the path that produced it.
#[derive(Debug, thiserror::Error)]
#[error("\"{}\": {source}", path.display())]
pub struct IoError {
    #[source]
    pub source: io::Error,
    pub path: PathBuf,
}

impl IoError {
    pub fn new(source: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { source, path: path.into() }
    }
}

/// Extension adding path context to `io::Result`.
pub(crate) trait IoResultExt<T> {
    fn map_err_path(self, path: &Path) -> Result<T, IoError>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn map_err_path(self, path: &Path) -> Result<T, IoError> {
        self.map_err(|e| IoError::new(e, path))
    }
}

/// Why a load failed; mirrors the reasons surfaced to users one by one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadErrorReason {
    InvalidYaml,
    ExpectedMapping,
    ExpectedSequence,
    ExpectedScalar,
    ExpectedBool,
    ExpectedInt,
    MissingKey,
    UnknownKey,
    IncludeNotFound,
    IncludeCycle,
    UnsupportedDirective,
    IllegalComposite,
    AssertionFired,
    UndefinedOption,
    InvalidExpression,
    UndefinedVariable,
    CyclicVariable,
    ProtectedVariable,
    BadElementName,
    MissingElement,
    CircularDependency,
    BadDependency,
    InvalidProjectName,
    UnsupportedProject,
    ConflictingJunction,
    InvalidJunction,
    BadOptionValue,
    DuplicatePlugin,
    UnknownPlugin,
    InvalidSymbolName,
}

#[derive(Debug, thiserror::Error)]
#[error("{provenance}: {message}")]
pub struct LoadError {
    pub reason: LoadErrorReason,
    pub provenance: Provenance,
    pub message: String,
}

impl LoadError {
    pub fn new(reason: LoadErrorReason, provenance: Provenance, message: impl Into<String>) -> Self {
        Self { reason, provenance, message: message.into() }
    }
}

/// Convenience constructor used all over the node and element layers.
macro_rules! load_error {
    ($reason:ident, $provenance:expr, $($arg:tt)*) => {
        $crate::error::LoadError::new(
            $crate::error::LoadErrorReason::$reason,
            $provenance,
            format!($($arg)*),
        )
    };
}

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("unknown {kind_type} kind '{kind}'")]
    UnknownKind { kind_type: &'static str, kind: String },
    #[error("{kind_type} kind '{kind}' is provided more than once")]
    Duplicate { kind_type: &'static str, kind: String },
    #[error("{provenance}: invalid configuration for '{kind}': {message}")]
    Configure { kind: String, provenance: Provenance, message: String },
    #[error("preflight failed for '{kind}': {message}")]
    Preflight { kind: String, message: String },
    #[error("'{kind}' is deprecated: {message}")]
    Deprecated { kind: String, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The source has no ref; tracking is required before it can be keyed.
    #[error("source '{kind}' of '{element}' has no ref, track it first")]
    Inconsistent { element: String, kind: String },
    #[error("failed to fetch source '{kind}' of '{element}': {message}")]
    Fetch { element: String, kind: String, message: String },
    #[error("failed to stage source '{kind}' of '{element}': {message}")]
    Stage { element: String, kind: String, message: String },
    #[error("failed to track source '{kind}' of '{element}': {message}")]
    Track { element: String, kind: String, message: String },
    #[error("source directory '{directory}' of '{element}' escapes the build root")]
    BadDirectory { element: String, directory: String },
}

impl SourceError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Fetch { .. } | Self::Track { .. } => ErrorClass::Network,
            _ => ErrorClass::Plugin,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error(
        "'{path}' is staged by both '{first}' and '{second}' with differing contents \
         and is not whitelisted by '{second}'"
    )]
    Overlap { path: String, first: String, second: String },
    #[error(
        "'{path}' is staged by both '{first}' and '{second}' with differing contents; \
         overlap warnings are fatal in this project"
    )]
    OverlapFatal { path: String, first: String, second: String },
    #[error("command-subdir '{subdir}' of '{element}' escapes the build root")]
    BadCommandSubdir { element: String, subdir: String },
    #[error("command group '{group}' of '{element}' failed with exit status {status}")]
    CommandFailed { element: String, group: String, status: i32 },
    #[error("sandbox executor failed for '{element}': {message}")]
    Executor { element: String, message: String },
    #[error("failed to collect '{path}' from '{element}': {message}")]
    Collect { element: String, path: String, message: String },
    #[error("staging location '{location}' of dependency '{element}' is not absolute")]
    BadLocation { element: String, location: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CasError {
    #[error("blob {digest} is corrupt: content hashes to {actual}")]
    Corrupt { digest: String, actual: String },
    #[error("blob {digest} is not in the local store")]
    MissingBlob { digest: String },
    #[error("malformed directory object {digest}: {message}")]
    BadDirectory { digest: String, message: String },
    #[error("cache quota of {quota} bytes exceeded and nothing left to evict")]
    QuotaExceeded { quota: u64 },
    #[error(transparent)]
    Io(#[from] IoError),
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact '{name}' is not cached")]
    NotCached { name: String },
    #[error("build tree of '{name}' is not available locally or on any remote")]
    BuildTreeUnavailable { name: String },
    #[error("'{name}' is not a valid artifact name")]
    BadName { name: String },
    #[error(transparent)]
    Io(#[from] IoError),
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Transport-level failure; candidates for retry with backoff.
    #[error("remote '{url}' is unreachable: {message}")]
    Network { url: String, message: String },
    #[error("remote '{url}' rejected the request: {message}")]
    Rejected { url: String, message: String },
    #[error("remote '{url}' is missing blob {digest}")]
    MissingBlob { url: String, digest: String },
    #[error("invalid remote specification '{url}': {message}")]
    BadSpec { url: String, message: String },
}

impl RemoteError {
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}
