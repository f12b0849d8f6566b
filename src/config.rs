//! User configuration and the runtime context.
//!
//! The configuration file is plain serde YAML (no provenance needed at this
//! layer), discovered under XDG config unless a path is given. The
//! [`Context`] realises the configuration: cache directories created, CAS
//! and caches opened, plugin registry and sandbox executor bound. One
//! context serves any number of driver invocations.

use crate::artifact::ArtifactCache;
use crate::cas::CasStore;
use crate::error::{Error, IoResultExt, Result};
use crate::plugin::PluginRegistry;
use crate::project::SourcePolicy;
use crate::remote::RemoteSpec;
use crate::sandbox::{HostExecutor, SandboxExecutor};
use crate::scheduler::{OnError, SchedulerConfig};
use crate::sourcecache::SourceCache;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

/// When (if at all) `%{build-root}` trees are captured into artifacts.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBuildTrees {
    Never,
    #[default]
    Auto,
    Always,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    /// Local cache quota, accepting `500M` / `5G` style suffixes.
    #[serde(default, deserialize_with = "deserialize_quota")]
    pub quota: Option<u64>,
    #[serde(default)]
    pub pull_buildtrees: bool,
    #[serde(default)]
    pub cache_buildtrees: CacheBuildTrees,
    /// Optional dedicated storage service used for all concerns.
    #[serde(default)]
    pub storage_service: Option<RemoteSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchedulerUserConfig {
    #[serde(default = "defaults::fetchers")]
    pub fetchers: usize,
    #[serde(default = "defaults::builders")]
    pub builders: usize,
    #[serde(default = "defaults::pushers")]
    pub pushers: usize,
    #[serde(default = "defaults::network_retries")]
    pub network_retries: u32,
    #[serde(default = "defaults::on_error")]
    pub on_error: OnErrorConfig,
}

mod defaults {
    pub(super) fn fetchers() -> usize {
        10
    }
    pub(super) fn builders() -> usize {
        4
    }
    pub(super) fn pushers() -> usize {
        4
    }
    pub(super) fn network_retries() -> u32 {
        2
    }
    pub(super) fn on_error() -> super::OnErrorConfig {
        super::OnErrorConfig::Continue
    }
}

impl Default for SchedulerUserConfig {
    fn default() -> Self {
        Self {
            fetchers: defaults::fetchers(),
            builders: defaults::builders(),
            pushers: defaults::pushers(),
            network_retries: defaults::network_retries(),
            on_error: defaults::on_error(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnErrorConfig {
    Continue,
    Quit,
    Terminate,
}

impl From<OnErrorConfig> for OnError {
    fn from(value: OnErrorConfig) -> Self {
        match value {
            OnErrorConfig::Continue => OnError::Continue,
            OnErrorConfig::Quit => OnError::Quit,
            OnErrorConfig::Terminate => OnError::Terminate,
        }
    }
}

/// Whether already-cached dependencies are rebuilt in a session.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildDependencies {
    #[default]
    None,
    All,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BuildConfig {
    #[serde(default)]
    pub max_jobs: Option<usize>,
    #[serde(default)]
    pub dependencies: BuildDependencies,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub source: SourcePolicy,
}

/// Per-project overrides in the user configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProjectUserConfig {
    #[serde(default)]
    pub artifacts: Vec<RemoteSpec>,
    #[serde(default)]
    pub source_caches: Vec<RemoteSpec>,
    /// Strict cache-key resolution; defaults to on.
    #[serde(default)]
    pub strict: Option<bool>,
    #[serde(default)]
    pub default_mirror: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserConfig {
    #[serde(default)]
    pub cachedir: Option<PathBuf>,
    #[serde(default)]
    pub sourcedir: Option<PathBuf>,
    #[serde(default)]
    pub logdir: Option<PathBuf>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scheduler: SchedulerUserConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub fetch: PolicyConfig,
    #[serde(default)]
    pub track: PolicyConfig,
    #[serde(default)]
    pub artifacts: Vec<RemoteSpec>,
    #[serde(default)]
    pub source_caches: Vec<RemoteSpec>,
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectUserConfig>,
}

impl UserConfig {
    /// Reads a configuration file; `None` discovers
    /// `$XDG_CONFIG_HOME/buildstream.conf` and falls back to defaults when
    /// absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let Some(config_dir) = dirs::config_dir() else { return Ok(Self::default()) };
                let candidate = config_dir.join("buildstream.conf");
                if !candidate.is_file() {
                    return Ok(Self::default());
                }
                candidate
            }
        };
        let text = fs::read_to_string(&path).map_err_path(&path)?;
        serde_yaml_ng::from_str(&text)
            .map_err(|e| Error::User(format!("malformed configuration '{}': {e}", path.display())))
    }

    pub fn max_jobs(&self) -> usize {
        self.build.max_jobs.unwrap_or_else(num_cpus::get)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            fetchers: self.scheduler.fetchers,
            builders: self.scheduler.builders,
            pushers: self.scheduler.pushers,
            network_retries: self.scheduler.network_retries,
            on_error: self.scheduler.on_error.into(),
            ..SchedulerConfig::default()
        }
    }

    pub fn project(&self, name: &str) -> ProjectUserConfig {
        self.projects.get(name).cloned().unwrap_or_default()
    }

    /// Strict cache-key resolution for a project; on unless disabled.
    pub fn strict(&self, project_name: &str) -> bool {
        self.project(project_name).strict.unwrap_or(true)
    }

    /// Remote artifact specs: per-project first, then global.
    pub fn artifact_specs(&self, project_name: &str) -> Vec<RemoteSpec> {
        let mut specs = self.project(project_name).artifacts;
        specs.extend(self.artifacts.iter().cloned());
        specs
    }

    pub fn source_cache_specs(&self, project_name: &str) -> Vec<RemoteSpec> {
        let mut specs = self.project(project_name).source_caches;
        specs.extend(self.source_caches.iter().cloned());
        // Test harnesses inject a source cache through the environment.
        if let Ok(url) = std::env::var("BST_SOURCE_CACHE") {
            specs.push(RemoteSpec {
                url,
                instance_name: None,
                kind: crate::remote::RemoteKind::All,
                push: true,
                server_cert: None,
                client_cert: None,
                client_key: None,
            });
        }
        specs
    }
}

fn deserialize_quota<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => parse_size(&s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid size '{s}'"))),
    }
}

/// Parses `512`, `100K`, `500M`, `5G`, `1T`.
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let (number, multiplier) = match s.chars().last()? {
        'K' | 'k' => (&s[..s.len() - 1], 1u64 << 10),
        'M' | 'm' => (&s[..s.len() - 1], 1u64 << 20),
        'G' | 'g' => (&s[..s.len() - 1], 1u64 << 30),
        'T' | 't' => (&s[..s.len() - 1], 1u64 << 40),
        _ => (s, 1),
    };
    number.trim().parse::<u64>().ok()?.checked_mul(multiplier)
}

/// The realised runtime: directories, stores and services.
pub struct Context {
    pub config: UserConfig,
    pub cachedir: PathBuf,
    pub sourcedir: PathBuf,
    pub logdir: PathBuf,
    pub cas: Arc<CasStore>,
    pub artifacts: Arc<ArtifactCache>,
    pub source_cache: Arc<SourceCache>,
    pub registry: Arc<PluginRegistry>,
    pub executor: Arc<dyn SandboxExecutor>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("cachedir", &self.cachedir).finish()
    }
}

impl Context {
    pub fn new(config: UserConfig) -> Result<Self> {
        Self::with_services(config, Arc::new(PluginRegistry::with_builtins()), Arc::new(HostExecutor))
    }

    pub fn with_services(
        config: UserConfig,
        registry: Arc<PluginRegistry>,
        executor: Arc<dyn SandboxExecutor>,
    ) -> Result<Self> {
        let cachedir = match &config.cachedir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir()
                .ok_or_else(|| Error::User("cannot determine a cache directory".to_string()))?
                .join("buildstream"),
        };
        let sourcedir = config.sourcedir.clone().unwrap_or_else(|| cachedir.join("sources-dl"));
        let logdir = config.logdir.clone().unwrap_or_else(|| cachedir.join("logs"));
        for dir in [&cachedir, &sourcedir, &logdir] {
            fs::create_dir_all(dir).map_err_path(dir)?;
        }

        let cas = Arc::new(CasStore::open(&cachedir)?);
        let artifacts = Arc::new(ArtifactCache::open(Arc::clone(&cas), &cachedir)?);
        let source_cache = Arc::new(SourceCache::open(Arc::clone(&cas), &cachedir)?);
        Ok(Self {
            config,
            cachedir,
            sourcedir,
            logdir,
            cas,
            artifacts,
            source_cache,
            registry,
            executor,
        })
    }

    /// Per-element build log path.
    pub fn log_path(&self, project: &str, element: &str, key: &str, activity: &str) -> PathBuf {
        let stem = element.strip_suffix(".bst").unwrap_or(element);
        self.logdir.join(project).join(stem).join(format!("{key}-{activity}.log"))
    }

    /// Applies the cache quota, evicting LRU artifacts and collecting
    /// garbage.
    pub fn enforce_quota(&self) -> Result<u64> {
        match self.config.cache.quota {
            Some(quota) => {
                let extra = self.source_cache.live_roots();
                self.artifacts.enforce_quota(quota, &extra)
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sizes_parse_with_suffixes() {
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("100K"), Some(100 << 10));
        assert_eq!(parse_size("5G"), Some(5 << 30));
        assert_eq!(parse_size("nope"), None);
    }

    #[test]
    fn config_parses_from_yaml() {
        let yaml = "\
cache:
  quota: 5G
  cache-buildtrees: always
scheduler:
  fetchers: 12
  builders: 2
  pushers: 1
  network-retries: 5
  on-error: quit
projects:
  myproject:
    strict: false
    options:
      debug: 'true'
";
        let config: UserConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.cache.quota, Some(5 << 30));
        assert_eq!(config.cache.cache_buildtrees, CacheBuildTrees::Always);
        assert_eq!(config.scheduler.builders, 2);
        assert_eq!(config.scheduler.on_error, OnErrorConfig::Quit);
        assert!(!config.strict("myproject"));
        assert!(config.strict("other"));
        assert_eq!(config.project("myproject").options.get("debug").unwrap(), "true");
    }

    #[test]
    fn defaults_are_usable() {
        let config = UserConfig::default();
        assert!(config.max_jobs() >= 1);
        let sched = config.scheduler_config();
        assert_eq!(sched.fetchers, 10);
    }
}
