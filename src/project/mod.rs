//! Project loading.
//!
//! A project is a directory rooted at a `project.conf`. Loading parses the
//! first-class keys (`name`, `min-version`, `element-path`, `plugins`) before
//! any directive runs, builds the option pool, then resolves the remaining
//! configuration with `(@)`/`(?)`/`(!)` realised in this project's option
//! context. The result is the namespace in which this project's elements are
//! composed.

use crate::error::{LoadError, Result};
use crate::node::{
    composite, resolve_directives, resolve_pending_lists, IncludeResolver, Node, Provenance,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

pub mod options;

pub use options::{host_arch, host_os, OptionKind, OptionPool};

pub const PROJECT_CONF: &str = "project.conf";

/// The core format version announced to projects; `min-version` above this
/// fails the load.
pub const FORMAT_VERSION: (u32, u32) = (2, 4);

static PROJECT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]*$").unwrap());

/// Builtin defaults composited beneath every project.
const BUILTIN_DEFAULTS: &str = include_str!("../data/projectconfig.yaml");

/// Warning tokens that `fatal-warnings` can promote to errors.
pub mod warnings {
    pub const OVERLAPS: &str = "overlaps";
    pub const DEPRECATED: &str = "deprecated";
    pub const UNALIASED_URL: &str = "unaliased-url";
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PluginOriginKind {
    Local { path: PathBuf },
    Pip { package_name: String },
    Junction { junction: String },
}

#[derive(Clone, Debug)]
pub struct PluginOrigin {
    pub kind: PluginOriginKind,
    pub elements: Vec<String>,
    pub sources: Vec<String>,
    pub allow_deprecated: bool,
}

/// A named mirror: per-alias replacement URL prefixes.
#[derive(Clone, Debug)]
pub struct Mirror {
    pub name: String,
    pub aliases: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Debug, Default)]
pub struct JunctionConfig {
    /// Subproject names that may be loaded more than once without conflict.
    pub duplicates: Vec<String>,
    /// Subproject names dependants should not observe.
    pub internal: Vec<String>,
}

/// Which upstreams a fetch or track may contact.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcePolicy {
    /// Mirrors first, then the original alias URL.
    #[default]
    All,
    /// Only the original alias URLs.
    Aliases,
    /// Only mirror URLs.
    Mirrors,
    /// Only the user's default mirror, falling back to the alias.
    User,
}

#[derive(Debug)]
pub struct Project {
    pub name: String,
    /// Absolute path of the project checkout.
    pub directory: PathBuf,
    pub element_path: PathBuf,
    pub min_version: (u32, u32),
    pub options: OptionPool,
    pub aliases: BTreeMap<String, String>,
    pub mirrors: Vec<Mirror>,
    pub plugin_origins: Vec<PluginOrigin>,
    /// Project-wide defaults, composited under every element.
    pub variables: Node,
    pub environment: Node,
    pub environment_nocache: Vec<String>,
    pub split_rules: Node,
    /// Per-kind overlays from the `elements:` and `sources:` sections.
    pub element_overrides: Node,
    pub source_overrides: Node,
    pub junctions: JunctionConfig,
    pub fatal_warnings: Vec<String>,
    pub default_targets: Vec<String>,
    /// Remote cache recommendations, consumed by the context.
    pub artifact_cache_specs: Vec<crate::remote::RemoteSpec>,
    pub source_cache_specs: Vec<crate::remote::RemoteSpec>,
}

impl Project {
    /// Loads a project from its checkout directory.
    ///
    /// `toplevel` is the root directory of the invoking toplevel project,
    /// used for the `toplevel-root` dynamic alias; it equals `directory` for
    /// the toplevel itself. `option_overrides` are user-supplied option
    /// values for this project.
    pub fn load(
        directory: &Path,
        toplevel: &Path,
        option_overrides: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let conf_path = directory.join(PROJECT_CONF);
        let shortname = format!(
            "{}",
            conf_path
                .strip_prefix(toplevel)
                .unwrap_or(&conf_path)
                .display()
        );
        let raw = crate::node::load(&conf_path, &shortname)?;
        Self::from_node(raw, directory, toplevel, option_overrides)
    }

    fn from_node(
        raw: Node,
        directory: &Path,
        toplevel: &Path,
        option_overrides: &BTreeMap<String, String>,
    ) -> Result<Self> {
        // First-class keys are read before any directive resolution and are
        // not includable.
        let name = raw.get_str("name")?.to_string();
        if !PROJECT_NAME.is_match(&name) {
            return Err(load_error!(
                InvalidProjectName,
                raw.get_node("name")?.provenance().clone(),
                "invalid project name '{name}': names may not start with a digit"
            )
            .into());
        }
        let min_version = parse_min_version(raw.get_node("min-version")?)?;
        if min_version > FORMAT_VERSION {
            return Err(load_error!(
                UnsupportedProject,
                raw.get_node("min-version")?.provenance().clone(),
                "project '{name}' requires format version {}.{}, this core provides {}.{}",
                min_version.0,
                min_version.1,
                FORMAT_VERSION.0,
                FORMAT_VERSION.1
            )
            .into());
        }
        let element_path_rel = raw.get_str_opt("element-path")?.unwrap_or("elements");
        let plugin_origins = parse_plugin_origins(&raw)?;

        let mut options = OptionPool::load(raw.get("options"))?;
        options.apply_overrides(option_overrides)?;
        options.validate()?;

        // The remaining configuration composes onto the builtin defaults and
        // then has its directives realised in this project's option context.
        let mut config = crate::node::load_string(BUILTIN_DEFAULTS, "core defaults")
            .map_err(crate::error::Error::from)?;
        composite::compose(&mut config, &raw)?;
        let includes = FileIncludes { root: directory.to_path_buf(), options: &options };
        resolve_directives(&mut config, &options, &includes, &mut Vec::new())?;
        resolve_pending_lists(&mut config)?;

        let aliases = parse_aliases(&config, directory, toplevel)?;
        let mirrors = parse_mirrors(&config, directory, toplevel)?;

        let junctions = match config.get("junctions") {
            Some(node) => JunctionConfig {
                duplicates: node.get_str_list_opt("duplicates")?,
                internal: node.get_str_list_opt("internal")?,
            },
            None => JunctionConfig::default(),
        };

        let default_targets = match config.get("defaults") {
            Some(node) => node.get_str_list_opt("targets")?,
            None => Vec::new(),
        };

        let artifact_cache_specs = parse_remote_specs(config.get("artifacts"))?;
        let source_cache_specs = parse_remote_specs(config.get("source-caches"))?;

        let origin = config.provenance().clone();
        Ok(Self {
            element_path: directory.join(element_path_rel),
            directory: directory.to_path_buf(),
            min_version,
            aliases,
            mirrors,
            plugin_origins,
            variables: config.get("variables").cloned().unwrap_or_else(|| empty(&origin)),
            environment: config.get("environment").cloned().unwrap_or_else(|| empty(&origin)),
            environment_nocache: config.get_str_list_opt("environment-nocache")?,
            split_rules: config.get("split-rules").cloned().unwrap_or_else(|| empty(&origin)),
            element_overrides: config.get("elements").cloned().unwrap_or_else(|| empty(&origin)),
            source_overrides: config.get("sources").cloned().unwrap_or_else(|| empty(&origin)),
            junctions,
            fatal_warnings: match config.get("fatal-warnings") {
                Some(_) => config.get_str_list_opt("fatal-warnings")?,
                None => Vec::new(),
            },
            default_targets,
            artifact_cache_specs,
            source_cache_specs,
            options,
            name,
        })
    }

    /// Whether the given warning token is promoted to an error.
    pub fn warning_is_fatal(&self, token: &str) -> bool {
        self.fatal_warnings.iter().any(|w| w == token)
    }

    /// Absolute path of an element file within this project.
    pub fn element_file(&self, element_name: &str) -> Result<PathBuf> {
        validate_element_name(element_name)?;
        Ok(self.element_path.join(element_name))
    }

    /// Rewrites `alias:path` into the ordered list of candidate URLs to
    /// contact, honouring the source policy and the user's default mirror.
    /// Tracking scans the same candidates in reverse.
    pub fn translate_url(
        &self,
        url: &str,
        policy: SourcePolicy,
        default_mirror: Option<&str>,
        tracking: bool,
    ) -> Vec<String> {
        let Some((alias, rest)) = url.split_once(':') else {
            return vec![url.to_string()];
        };
        let Some(base) = self.aliases.get(alias) else {
            // Not an alias of this project (e.g. a full https:// URL).
            return vec![url.to_string()];
        };

        let mut mirror_urls = Vec::new();
        let mut ordered: Vec<&Mirror> = self.mirrors.iter().collect();
        if let Some(default) = default_mirror {
            ordered.sort_by_key(|m| if m.name == default { 0 } else { 1 });
        }
        for mirror in ordered {
            if let Some(prefixes) = mirror.aliases.get(alias) {
                for prefix in prefixes {
                    mirror_urls.push(format!("{prefix}{rest}"));
                }
            }
        }
        let base_url = format!("{base}{rest}");

        let mut candidates = match policy {
            SourcePolicy::All => {
                let mut urls = mirror_urls;
                urls.push(base_url);
                urls
            }
            SourcePolicy::Aliases => vec![base_url],
            SourcePolicy::Mirrors => mirror_urls,
            SourcePolicy::User => {
                let mut urls: Vec<String> = Vec::new();
                if let Some(default) = default_mirror {
                    if let Some(mirror) = self.mirrors.iter().find(|m| m.name == default) {
                        if let Some(prefixes) = mirror.aliases.get(alias) {
                            urls.extend(prefixes.iter().map(|p| format!("{p}{rest}")));
                        }
                    }
                }
                if urls.is_empty() {
                    urls.push(base_url);
                }
                urls
            }
        };
        if tracking {
            candidates.reverse();
        }
        candidates
    }
}

fn empty(provenance: &Provenance) -> Node {
    Node::mapping(BTreeMap::new(), provenance.clone())
}

fn parse_min_version(node: &Node) -> Result<(u32, u32)> {
    let s = node.expect_scalar()?;
    let parts: Vec<&str> = s.split('.').collect();
    let parse = |p: &str| -> Result<u32, LoadError> {
        p.parse().map_err(|_| {
            load_error!(
                UnsupportedProject,
                node.provenance().clone(),
                "malformed min-version '{s}', expected MAJOR.MINOR"
            )
        })
    };
    match parts.as_slice() {
        [major, minor] => Ok((parse(major)?, parse(minor)?)),
        _ => Err(load_error!(
            UnsupportedProject,
            node.provenance().clone(),
            "malformed min-version '{s}', expected MAJOR.MINOR"
        )
        .into()),
    }
}

fn parse_plugin_origins(raw: &Node) -> Result<Vec<PluginOrigin>> {
    let mut origins = Vec::new();
    let Some(plugins) = raw.get("plugins") else { return Ok(origins) };
    let mut seen_elements: std::collections::BTreeSet<String> = Default::default();
    let mut seen_sources: std::collections::BTreeSet<String> = Default::default();
    for entry in plugins.expect_sequence()? {
        let origin = entry.get_str("origin")?;
        let kind = match origin {
            "local" => PluginOriginKind::Local { path: PathBuf::from(entry.get_str("path")?) },
            "pip" => PluginOriginKind::Pip {
                package_name: entry.get_str("package-name")?.to_string(),
            },
            "junction" => PluginOriginKind::Junction {
                junction: entry.get_str("junction")?.to_string(),
            },
            other => {
                return Err(load_error!(
                    UnknownPlugin,
                    entry.provenance().clone(),
                    "unknown plugin origin '{other}'"
                )
                .into())
            }
        };
        let elements = entry.get_str_list_opt("elements")?;
        let sources = entry.get_str_list_opt("sources")?;
        // The same kind provided by two origins is fatal.
        for (names, seen, what) in [
            (&elements, &mut seen_elements, "element"),
            (&sources, &mut seen_sources, "source"),
        ] {
            for name in names {
                if !seen.insert(name.clone()) {
                    return Err(load_error!(
                        DuplicatePlugin,
                        entry.provenance().clone(),
                        "{what} plugin '{name}' is provided by more than one origin"
                    )
                    .into());
                }
            }
        }
        origins.push(PluginOrigin {
            kind,
            elements,
            sources,
            allow_deprecated: entry.get_bool("allow-deprecated", false)?,
        });
    }
    Ok(origins)
}

/// Expands the dynamic `project-root` / `toplevel-root` aliases, which are
/// only legal in alias and mirror value positions.
fn expand_root_tokens(value: &str, directory: &Path, toplevel: &Path) -> String {
    value
        .replace("%{project-root-uri}", &format!("file://{}", directory.display()))
        .replace("%{project-root}", &directory.display().to_string())
        .replace("%{toplevel-root-uri}", &format!("file://{}", toplevel.display()))
        .replace("%{toplevel-root}", &toplevel.display().to_string())
}

fn parse_aliases(
    config: &Node,
    directory: &Path,
    toplevel: &Path,
) -> Result<BTreeMap<String, String>> {
    let mut aliases = BTreeMap::new();
    if let Some(node) = config.get("aliases") {
        for (alias, value) in node.expect_mapping()? {
            let url = expand_root_tokens(value.expect_scalar()?, directory, toplevel);
            aliases.insert(alias.clone(), url);
        }
    }
    Ok(aliases)
}

fn parse_mirrors(config: &Node, directory: &Path, toplevel: &Path) -> Result<Vec<Mirror>> {
    let mut mirrors = Vec::new();
    if let Some(node) = config.get("mirrors") {
        for entry in node.expect_sequence()? {
            let name = entry.get_str("name")?.to_string();
            let mut aliases = BTreeMap::new();
            for (alias, urls) in entry.get_node("aliases")?.expect_mapping()? {
                let mut prefixes = Vec::new();
                for url in urls.expect_sequence()? {
                    prefixes.push(expand_root_tokens(url.expect_scalar()?, directory, toplevel));
                }
                aliases.insert(alias.clone(), prefixes);
            }
            mirrors.push(Mirror { name, aliases });
        }
    }
    Ok(mirrors)
}

fn parse_remote_specs(node: Option<&Node>) -> Result<Vec<crate::remote::RemoteSpec>> {
    let mut specs = Vec::new();
    if let Some(node) = node {
        for entry in node.expect_sequence()? {
            specs.push(crate::remote::RemoteSpec::from_node(entry)?);
        }
    }
    Ok(specs)
}

/// Validates a project-relative element name: must end in `.bst`, stay
/// relative, and use no parent references. `:` is the junction separator
/// and cannot appear inside a name.
pub fn validate_element_name(name: &str) -> Result<(), LoadError> {
    let ok = name.ends_with(".bst")
        && !name.starts_with('/')
        && !name.contains(':')
        && !name.split('/').any(|c| c.is_empty() || c == "." || c == "..");
    if ok {
        Ok(())
    } else {
        Err(load_error!(
            BadElementName,
            Provenance::synthetic("element name"),
            "invalid element name '{name}'"
        ))
    }
}

/// Resolves `(@)` references against plain files in the project directory.
/// Cross-junction references require the element loader's resolver.
struct FileIncludes<'a> {
    root: PathBuf,
    options: &'a OptionPool,
}

impl IncludeResolver for FileIncludes<'_> {
    fn resolve(
        &self,
        reference: &str,
        provenance: &Provenance,
        stack: &mut Vec<String>,
    ) -> Result<Node> {
        if reference.contains(':') {
            return Err(load_error!(
                IncludeNotFound,
                provenance.clone(),
                "cross-junction include '{reference}' is not available while loading project \
                 configuration"
            )
            .into());
        }
        let path = self.root.join(reference);
        if !path.is_file() {
            return Err(load_error!(
                IncludeNotFound,
                provenance.clone(),
                "include file '{reference}' was not found"
            )
            .into());
        }
        let mut node = crate::node::load(&path, reference)?;
        resolve_directives(&mut node, self.options, self, stack)?;
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_project(dir: &Path, conf: &str) {
        fs::write(dir.join(PROJECT_CONF), conf).unwrap();
    }

    fn load(dir: &Path) -> Result<Project> {
        Project::load(dir, dir, &BTreeMap::new())
    }

    #[test]
    fn minimal_project() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path(), "name: test\nmin-version: 2.0\n");
        let project = load(dir.path()).unwrap();
        assert_eq!(project.name, "test");
        assert_eq!(project.element_path, dir.path().join("elements"));
        // Builtin defaults are composited in.
        assert_eq!(project.variables.get_str("prefix").unwrap(), "/usr");
    }

    #[test]
    fn min_version_gate() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path(), "name: test\nmin-version: 99.0\n");
        let err = load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("format version"));
    }

    #[test]
    fn digit_leading_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path(), "name: 9lives\nmin-version: 2.0\n");
        assert!(load(dir.path()).is_err());
    }

    #[test]
    fn project_variables_override_builtin_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write_project(
            dir.path(),
            "name: test\nmin-version: 2.0\nvariables:\n  prefix: /opt\n",
        );
        let project = load(dir.path()).unwrap();
        assert_eq!(project.variables.get_str("prefix").unwrap(), "/opt");
        assert_eq!(project.variables.get_str("sysconfdir").unwrap(), "/etc");
    }

    #[test]
    fn conditionals_resolve_against_options() {
        let dir = tempfile::tempdir().unwrap();
        write_project(
            dir.path(),
            "name: test\nmin-version: 2.0\n\
             options:\n  debug:\n    type: bool\n    default: true\n\
             variables:\n  flags: -O2\n\
             (?):\n- debug:\n    variables:\n      flags: -O0 -g\n",
        );
        let project = load(dir.path()).unwrap();
        assert_eq!(project.variables.get_str("flags").unwrap(), "-O0 -g");
    }

    #[test]
    fn includes_merge_under_the_project() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("region.yml"), "variables:\n  region: east\n  zone: a\n")
            .unwrap();
        write_project(
            dir.path(),
            "name: test\nmin-version: 2.0\n(@): region.yml\nvariables:\n  zone: b\n",
        );
        let project = load(dir.path()).unwrap();
        assert_eq!(project.variables.get_str("region").unwrap(), "east");
        // The includer wins per key.
        assert_eq!(project.variables.get_str("zone").unwrap(), "b");
    }

    #[test]
    fn alias_translation_with_mirrors() {
        let dir = tempfile::tempdir().unwrap();
        write_project(
            dir.path(),
            "name: test\nmin-version: 2.0\n\
             aliases:\n  upstream: https://example.com/\n\
             mirrors:\n- name: oz\n  aliases:\n    upstream:\n    - https://oz.example.com/\n",
        );
        let project = load(dir.path()).unwrap();
        let urls =
            project.translate_url("upstream:pkg.tar.gz", SourcePolicy::All, None, false);
        assert_eq!(
            urls,
            vec![
                "https://oz.example.com/pkg.tar.gz".to_string(),
                "https://example.com/pkg.tar.gz".to_string(),
            ]
        );
        let tracked =
            project.translate_url("upstream:pkg.tar.gz", SourcePolicy::All, None, true);
        assert_eq!(tracked.first().unwrap(), "https://example.com/pkg.tar.gz");
    }

    #[test]
    fn project_root_alias_expansion() {
        let dir = tempfile::tempdir().unwrap();
        write_project(
            dir.path(),
            "name: test\nmin-version: 2.0\naliases:\n  here: \"%{project-root-uri}/\"\n",
        );
        let project = load(dir.path()).unwrap();
        let urls = project.translate_url("here:tarballs/a.tar", SourcePolicy::All, None, false);
        assert_eq!(urls.len(), 1);
        assert!(urls[0].starts_with("file://"));
        assert!(urls[0].ends_with("/tarballs/a.tar"));
    }

    #[test]
    fn element_name_validation() {
        assert!(validate_element_name("core/base.bst").is_ok());
        assert!(validate_element_name("base.bst").is_ok());
        assert!(validate_element_name("../escape.bst").is_err());
        assert!(validate_element_name("/abs.bst").is_err());
        assert!(validate_element_name("noext").is_err());
    }
}
