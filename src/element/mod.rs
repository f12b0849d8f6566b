//! Element loading and the project graph.
//!
//! The [`Loader`] turns target element names into an [`ElementGraph`]: a
//! directed acyclic arena of fully composed elements. Composition stacks
//! five layers, lowest priority first: core builtin defaults and project
//! defaults (pre-merged by the project loader), the plugin's own default
//! YAML, the project's per-kind overrides, and the element declaration
//! itself, whose directives resolve in the declaring project's option
//! context. Variables expand after composition completes.
//!
//! Junctions load subprojects at this level: the junction element's sources
//! are staged into a private checkout directory and the subproject is loaded
//! from there with its own options. Junction elements never enter the graph;
//! `link` elements forward to their target and never enter the graph either.

use crate::error::{Error, LoadError, PluginError, Result};
use crate::node::{
    composite, resolve_directives, resolve_pending_lists, IncludeResolver, Node, Provenance,
};
use crate::plugin::{ElementPlugin, PluginRegistry, SourceContext, SourcePlugin};
use crate::project::{validate_element_name, Project, SourcePolicy};
use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    path::{Path, PathBuf},
};

pub mod variables;

pub use variables::Variables;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub(crate) usize);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DepType {
    Build,
    Runtime,
    All,
}

impl DepType {
    pub fn is_build(self) -> bool {
        matches!(self, Self::Build | Self::All)
    }

    pub fn is_runtime(self) -> bool {
        matches!(self, Self::Runtime | Self::All)
    }
}

/// Traversal scopes over the graph.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Everything reachable over any edge, including the element.
    All,
    /// What must be staged to build the element: the runtime closure of each
    /// direct build dependency. Excludes the element.
    Build,
    /// What must be present to run the element: the runtime closure
    /// including the element itself.
    Run,
}

#[derive(Clone, Debug)]
pub struct Dependency {
    pub target: ElementId,
    pub dep_type: DepType,
    /// Forces the dependency's strict key into this element's weak key, so
    /// non-strict builds still rebuild when this dependency changes.
    pub strict: bool,
    /// Per-edge configuration (`location`, ...).
    pub config: Option<Node>,
}

impl Dependency {
    /// Where this dependency stages inside the sandbox; defaults to `/`.
    pub fn location(&self) -> Result<String, LoadError> {
        match &self.config {
            Some(node) => Ok(node.get_str_opt("location")?.unwrap_or("/").to_string()),
            None => Ok("/".to_string()),
        }
    }
}

/// Cache status of an element, owned by the driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CacheState {
    Waiting,
    Buildable,
    Cached,
    Failed,
    FetchNeeded,
}

/// Sandbox requirements declared by an element.
#[derive(Clone, Debug, Default)]
pub struct SandboxOptions {
    pub build_uid: Option<u32>,
    pub build_gid: Option<u32>,
    pub build_os: Option<String>,
    pub build_arch: Option<String>,
    pub remote_apis_socket: Option<String>,
}

impl SandboxOptions {
    fn parse(node: Option<&Node>) -> Result<Self, LoadError> {
        let Some(node) = node else { return Ok(Self::default()) };
        node.validate_keys(&[
            "build-uid",
            "build-gid",
            "build-os",
            "build-arch",
            "remote-apis-socket",
        ])?;
        let parse_id = |key: &str| -> Result<Option<u32>, LoadError> {
            match node.get(key) {
                Some(n) => Ok(Some(n.parse_int()? as u32)),
                None => Ok(None),
            }
        };
        Ok(Self {
            build_uid: parse_id("build-uid")?,
            build_gid: parse_id("build-gid")?,
            build_os: node.get_str_opt("build-os")?.map(str::to_string),
            build_arch: node.get_str_opt("build-arch")?.map(str::to_string),
            remote_apis_socket: node.get_str_opt("remote-apis-socket")?.map(str::to_string),
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "build-uid": self.build_uid,
            "build-gid": self.build_gid,
            "build-os": self.build_os,
            "build-arch": self.build_arch,
        })
    }
}

/// A bound source of an element.
pub struct Source {
    pub kind: String,
    pub plugin_version: u32,
    /// Subdirectory of the build root this source stages into.
    pub directory: Option<String>,
    pub plugin: Box<dyn SourcePlugin>,
    /// The declaration, kept for ref writeback after tracking.
    pub node: Node,
    pub provenance: Provenance,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source").field("kind", &self.kind).finish()
    }
}

pub struct Element {
    pub id: ElementId,
    /// Full element path, junction-prefixed across projects. Display and
    /// dependency identity.
    pub name: String,
    /// Name within the owning project; artifact addressing uses this, so
    /// two load instances of one subproject element share artifacts.
    pub local_name: String,
    /// Index of the owning project in [`ElementGraph::projects`].
    pub project: usize,
    pub project_name: String,
    pub kind: String,
    pub plugin_version: u32,
    pub plugin: Box<dyn ElementPlugin>,
    pub sources: Vec<Source>,
    pub dependencies: Vec<Dependency>,
    pub variables: Variables,
    pub environment: BTreeMap<String, String>,
    pub environment_nocache: Vec<String>,
    pub config: Node,
    pub public: Node,
    pub sandbox: SandboxOptions,
    pub provenance: Provenance,
    /// File the element was declared in, for ref writeback.
    pub file_path: PathBuf,
    pub weak_key: Option<String>,
    pub strict_key: Option<String>,
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Element {
    /// Direct dependencies matching the given edge type.
    pub fn direct_deps(&self, build: bool) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter().filter(move |d| {
            if build {
                d.dep_type.is_build()
            } else {
                d.dep_type.is_runtime()
            }
        })
    }

    /// The `bst` public data domain, if declared.
    pub fn public_bst(&self) -> Option<&Node> {
        self.public.get("bst")
    }

    /// Integration commands declared in public data.
    pub fn integration_commands(&self) -> Result<Vec<String>, LoadError> {
        match self.public_bst() {
            Some(bst) => bst.get_str_list_opt("integration-commands"),
            None => Ok(Vec::new()),
        }
    }

    /// Overlap whitelist globs, variable-expanded.
    pub fn overlap_whitelist(&self) -> Result<Vec<String>, LoadError> {
        match self.public_bst() {
            Some(bst) => bst.get_str_list_opt("overlap-whitelist"),
            None => Ok(Vec::new()),
        }
    }

    /// Split-rule domains: domain name to glob list.
    pub fn split_rules(&self) -> Result<BTreeMap<String, Vec<String>>, LoadError> {
        let mut out = BTreeMap::new();
        if let Some(bst) = self.public_bst() {
            if let Some(rules) = bst.get("split-rules") {
                for (domain, globs) in rules.expect_mapping()? {
                    let mut patterns = Vec::new();
                    for glob in globs.expect_sequence()? {
                        patterns.push(glob.expect_scalar()?.to_string());
                    }
                    out.insert(domain.clone(), patterns);
                }
            }
        }
        Ok(out)
    }

    /// Whether all sources have refs, i.e. cache keys can exist.
    pub fn sources_resolved(&self) -> bool {
        self.sources.iter().all(|s| s.plugin.unique_key().is_some())
    }
}

pub struct ElementGraph {
    pub elements: Vec<Element>,
    pub projects: Vec<Project>,
}

impl fmt::Debug for ElementGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementGraph").field("elements", &self.elements.len()).finish()
    }
}

impl ElementGraph {
    pub fn get(&self, id: ElementId) -> &Element {
        &self.elements[id.0]
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter()
    }

    pub fn find(&self, name: &str) -> Option<ElementId> {
        self.elements.iter().find(|e| e.name == name).map(|e| e.id)
    }

    /// Elements in `scope` of `id`, dependencies before dependants.
    pub fn dependencies(&self, id: ElementId, scope: Scope) -> Vec<ElementId> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        match scope {
            Scope::Run => self.run_closure(id, &mut visited, &mut out),
            Scope::Build => {
                for dep in self.get(id).direct_deps(true) {
                    self.run_closure(dep.target, &mut visited, &mut out);
                }
            }
            Scope::All => self.all_closure(id, &mut visited, &mut out),
        }
        out
    }

    fn run_closure(&self, id: ElementId, visited: &mut HashSet<ElementId>, out: &mut Vec<ElementId>) {
        if !visited.insert(id) {
            return;
        }
        for dep in self.get(id).direct_deps(false) {
            self.run_closure(dep.target, visited, out);
        }
        out.push(id);
    }

    fn all_closure(&self, id: ElementId, visited: &mut HashSet<ElementId>, out: &mut Vec<ElementId>) {
        if !visited.insert(id) {
            return;
        }
        for dep in &self.get(id).dependencies {
            self.all_closure(dep.target, visited, out);
        }
        out.push(id);
    }

    /// Elements that reach `id` over build or runtime edges.
    pub fn reverse_closure(&self, id: ElementId) -> Vec<ElementId> {
        let mut out = Vec::new();
        for candidate in &self.elements {
            if candidate.id != id
                && self
                    .dependencies(candidate.id, Scope::All)
                    .contains(&id)
            {
                out.push(candidate.id);
            }
        }
        out
    }

    /// Computes weak and strict cache keys for every element whose sources
    /// are resolved. Elements with unresolved sources (and their reverse
    /// dependencies' strict keys) stay unkeyed.
    pub fn resolve_cache_keys(&mut self) -> Result<()> {
        let order: Vec<ElementId> = {
            let mut out = Vec::new();
            let mut visited = HashSet::new();
            for id in 0..self.elements.len() {
                self.all_closure(ElementId(id), &mut visited, &mut out);
            }
            out
        };

        for id in order {
            let unique = match self.element_unique_key(id)? {
                Some(u) => u,
                None => continue,
            };

            let element = self.get(id);
            let mut weak_parts = Vec::new();
            let mut weak_ok = true;
            let mut strict_parts = Vec::new();
            let mut strict_ok = true;
            for dep in element.direct_deps(true) {
                let dep_element = self.get(dep.target);
                match &dep_element.strict_key {
                    Some(key) => strict_parts.push(key.clone()),
                    None => strict_ok = false,
                }
                if dep.strict {
                    // A strict edge feeds the dependency's strict key into
                    // the weak key too.
                    match &dep_element.strict_key {
                        Some(key) => weak_parts.push(key.clone()),
                        None => weak_ok = false,
                    }
                } else {
                    weak_parts.push(dep_element.name.clone());
                }
            }

            let element = &mut self.elements[id.0];
            element.weak_key = weak_ok.then(|| crate::cachekey::weak_key(&unique, &weak_parts));
            element.strict_key =
                strict_ok.then(|| crate::cachekey::strong_key(&unique, &strict_parts));
        }
        Ok(())
    }

    fn element_unique_key(&self, id: ElementId) -> Result<Option<serde_json::Value>> {
        let element = self.get(id);
        let mut source_keys: Vec<serde_json::Value> = Vec::new();
        let mut previous: Vec<serde_json::Value> = Vec::new();
        for source in &element.sources {
            let Some(key) = source.plugin.unique_key() else { return Ok(None) };
            let mut entry = serde_json::json!({
                "kind": source.kind,
                "plugin-version": source.plugin_version,
                "key": key,
                "directory": source.directory,
            });
            if source.plugin.requires_previous_sources() {
                entry["previous-sources"] = serde_json::Value::Array(previous.clone());
            }
            previous.push(entry["key"].clone());
            source_keys.push(entry);
        }

        let mut environment = element.environment.clone();
        for name in &element.environment_nocache {
            environment.remove(name);
        }

        Ok(Some(crate::cachekey::element_unique(
            &element.kind,
            element.plugin_version,
            serde_json::json!({
                "element": element.config.to_json(),
                "plugin": element.plugin.unique_key(),
            }),
            element.variables.to_json(),
            serde_json::to_value(&environment).expect("string maps serialize"),
            source_keys,
            element.public.to_json(),
            element.sandbox.to_json(),
        )))
    }
}

/// Services and policy the loader needs beyond the project itself.
pub struct LoaderConfig {
    /// Download area handed to source plugins.
    pub sourcedir: PathBuf,
    /// Where junction subproject checkouts are staged.
    pub junctions_dir: PathBuf,
    pub policy: SourcePolicy,
    pub default_mirror: Option<String>,
    /// Per-project user option overrides, keyed by project name.
    pub project_options: BTreeMap<String, BTreeMap<String, String>>,
    pub max_jobs: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            sourcedir: std::env::temp_dir().join("bst-sources"),
            junctions_dir: std::env::temp_dir().join("bst-junctions"),
            policy: SourcePolicy::default(),
            default_mirror: None,
            project_options: BTreeMap::new(),
            max_jobs: num_cpus::get(),
        }
    }
}

#[derive(Copy, Clone, PartialEq)]
enum LoadState {
    Loading,
    Loaded(ElementId),
}

struct LoadedProject {
    project: Project,
    /// Junction chain prefix for element names, empty for the toplevel.
    prefix: String,
    /// Nested junction overrides inherited from the parent:
    /// junction-name-in-this-project -> (parent project index, element name).
    junction_overrides: BTreeMap<String, (usize, String)>,
}

struct LoaderState {
    projects: Vec<LoadedProject>,
    elements: Vec<Element>,
    load_states: HashMap<(usize, String), LoadState>,
    /// Subproject identity tracking for junction conflicts:
    /// project name -> first junction chain that loaded it.
    subprojects: HashMap<String, String>,
    /// (project, junction element name) -> loaded subproject index.
    junctions: HashMap<(usize, String), usize>,
}

pub struct Loader<'a> {
    registry: &'a PluginRegistry,
    config: LoaderConfig,
    state: RefCell<LoaderState>,
}

impl<'a> Loader<'a> {
    pub fn new(project: Project, registry: &'a PluginRegistry, config: LoaderConfig) -> Self {
        let state = LoaderState {
            projects: vec![LoadedProject {
                project,
                prefix: String::new(),
                junction_overrides: BTreeMap::new(),
            }],
            elements: Vec::new(),
            load_states: HashMap::new(),
            subprojects: HashMap::new(),
            junctions: HashMap::new(),
        };
        Self { registry, config, state: RefCell::new(state) }
    }

    /// Loads the targets and everything they reach, returning the graph and
    /// the target ids in argument order.
    pub fn load(self, targets: &[&str]) -> Result<(ElementGraph, Vec<ElementId>)> {
        let mut ids = Vec::new();
        for target in targets {
            ids.push(self.load_element(0, target)?);
        }
        let state = self.state.into_inner();
        let mut graph = ElementGraph {
            elements: state.elements,
            projects: state.projects.into_iter().map(|p| p.project).collect(),
        };
        graph.resolve_cache_keys()?;
        Ok((graph, ids))
    }

    /// Loads one element by (possibly junction-prefixed) name within the
    /// given project, resolving links and junction prefixes.
    fn load_element(&self, project_idx: usize, name: &str) -> Result<ElementId> {
        // Junction prefix: descend into the subproject first.
        if let Some((junction_name, rest)) = name.split_once(':') {
            let sub_idx = self.load_junction(project_idx, junction_name)?;
            return self.load_element(sub_idx, rest);
        }

        validate_element_name(name)?;
        let key = (project_idx, name.to_string());
        match self.state.borrow().load_states.get(&key) {
            Some(LoadState::Loaded(id)) => return Ok(*id),
            Some(LoadState::Loading) => {
                let full_name = self.full_name(project_idx, name);
                return Err(load_error!(
                    CircularDependency,
                    Provenance::synthetic(&full_name),
                    "circular dependency on '{full_name}'"
                )
                .into());
            }
            None => {}
        }

        // Mark before reading so circular links and dependencies are caught.
        self.state
            .borrow_mut()
            .load_states
            .insert(key.clone(), LoadState::Loading);

        let result = self.load_element_steps(project_idx, name);
        match result {
            Ok(id) => {
                self.state.borrow_mut().load_states.insert(key, LoadState::Loaded(id));
                Ok(id)
            }
            Err(e) => {
                self.state.borrow_mut().load_states.remove(&key);
                Err(e)
            }
        }
    }

    fn load_element_steps(&self, project_idx: usize, name: &str) -> Result<ElementId> {
        let (file_path, shortname, raw) = self.read_element_file(project_idx, name)?;
        let kind = raw.get_str("kind").map_err(Error::from)?.to_string();

        // Links forward to their target without entering the graph.
        if kind == "link" {
            let target = link_target(&raw)?;
            return self.load_element(project_idx, &target);
        }
        if kind == "junction" {
            return Err(load_error!(
                InvalidJunction,
                raw.provenance().clone(),
                "junction '{shortname}' cannot be used as an element dependency"
            )
            .into());
        }

        self.load_element_inner(project_idx, name, &file_path, &shortname, raw, kind)
    }

    fn read_element_file(
        &self,
        project_idx: usize,
        name: &str,
    ) -> Result<(PathBuf, String, Node)> {
        let state = self.state.borrow();
        let loaded = &state.projects[project_idx];
        let file_path = loaded.project.element_file(name)?;
        let shortname = self.full_name(project_idx, name);
        drop(state);
        if !file_path.is_file() {
            return Err(load_error!(
                MissingElement,
                Provenance::synthetic(&shortname),
                "element '{shortname}' was not found"
            )
            .into());
        }
        let raw = crate::node::load(&file_path, &shortname)?;
        Ok((file_path, shortname, raw))
    }

    fn full_name(&self, project_idx: usize, name: &str) -> String {
        let state = self.state.borrow();
        let prefix = &state.projects[project_idx].prefix;
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}{name}")
        }
    }

    fn load_element_inner(
        &self,
        project_idx: usize,
        name: &str,
        file_path: &Path,
        shortname: &str,
        raw: Node,
        kind: String,
    ) -> Result<ElementId> {
        let decl = self.registry.element_decl(&kind).map_err(|_| {
            Error::from(PluginError::UnknownKind { kind_type: "element", kind: kind.clone() })
        })?;
        let plugin_version = decl.version;
        if let Some(message) = decl.deprecated.clone() {
            let (fatal, allowed) = {
                let state = self.state.borrow();
                let project = &state.projects[project_idx].project;
                let allowed = project.plugin_origins.iter().any(|origin| {
                    origin.allow_deprecated && origin.elements.iter().any(|n| *n == kind)
                });
                (project.warning_is_fatal(crate::project::warnings::DEPRECATED), allowed)
            };
            if !allowed {
                if fatal {
                    return Err(PluginError::Deprecated { kind: kind.clone(), message }.into());
                }
                warn!(kind = %kind, element = %shortname, "deprecated element kind: {message}");
            }
        }

        // Resolve the declaration's directives in the declaring project's
        // option context, then stack the composition layers.
        let mut declaration = raw;
        {
            let includes = LoaderIncludes { loader: self, project_idx };
            let state = self.state.borrow();
            let options = state.projects[project_idx].project.options.clone();
            drop(state);
            resolve_directives(&mut declaration, &options, &includes, &mut Vec::new())?;
        }

        let mut composed = {
            let state = self.state.borrow();
            let project = &state.projects[project_idx].project;
            let mut base = Node::empty("element defaults");
            // Options declaring `variable:` export at the project-defaults
            // layer, overridable by the element.
            let mut vars_node = project.variables.clone();
            let mut exported = BTreeMap::new();
            project.options.export_variables(&mut exported);
            for (name, value) in exported {
                vars_node.insert(name, Node::scalar(value, Provenance::synthetic("project options")));
            }
            base.insert("variables", vars_node);
            base.insert("environment", project.environment.clone());
            let nocache_prov = project.environment.provenance().clone();
            base.insert(
                "environment-nocache",
                Node::sequence(
                    project
                        .environment_nocache
                        .iter()
                        .map(|n| Node::scalar(n.clone(), nocache_prov.clone()))
                        .collect(),
                    nocache_prov.clone(),
                ),
            );
            let mut bst = Node::empty("element defaults");
            bst.insert("split-rules", project.split_rules.clone());
            let mut public = Node::empty("element defaults");
            public.insert("bst", bst);
            base.insert("public", public);
            base
        };

        if let Some(plugin_defaults) = self.registry.element_defaults(&kind)? {
            composite::compose(&mut composed, &plugin_defaults)?;
        }
        {
            let state = self.state.borrow();
            let overrides = state.projects[project_idx].project.element_overrides.clone();
            drop(state);
            if let Some(kind_override) = overrides.get(&kind) {
                composite::compose(&mut composed, kind_override)?;
            }
        }
        composite::compose(&mut composed, &declaration)?;
        resolve_pending_lists(&mut composed)?;

        composed.validate_keys(&[
            "kind",
            "depends",
            "build-depends",
            "runtime-depends",
            "sources",
            "variables",
            "environment",
            "environment-nocache",
            "config",
            "public",
            "sandbox",
            "description",
        ])?;

        // Dependencies load before the element itself; cycles are caught by
        // the Loading state.
        let mut dependencies = Vec::new();
        for (dep_node, default_type) in dependency_nodes(&composed)? {
            let parsed = parse_dependency(&dep_node, default_type)?;
            let target = self.load_element(project_idx, &parsed.name)?;
            dependencies.push(Dependency {
                target,
                dep_type: parsed.dep_type,
                strict: parsed.strict,
                config: parsed.config,
            });
        }
        if kind == "stack" {
            // Stacks promote every dependency to both build and runtime.
            for dep in &mut dependencies {
                dep.dep_type = DepType::All;
            }
        }

        let (project_name, reserved) = {
            let state = self.state.borrow();
            let project = &state.projects[project_idx].project;
            let mut reserved = BTreeMap::new();
            // The project-relative name: two load instances of the same
            // subproject element must key identically.
            reserved.insert("element-name".to_string(), name.to_string());
            reserved.insert("project-name".to_string(), project.name.clone());
            reserved.insert("max-jobs".to_string(), self.config.max_jobs.to_string());
            (project.name.clone(), reserved)
        };
        let empty_vars = Node::empty("element defaults");
        let variables = Variables::new(
            composed.get("variables").unwrap_or(&empty_vars),
            reserved,
        )?;

        let mut environment = BTreeMap::new();
        for (name, value) in composed.get_str_map_opt("environment")? {
            environment.insert(name.clone(), variables.subst(&value, composed.provenance())?);
        }
        let environment_nocache = composed.get_str_list_opt("environment-nocache")?;

        let mut config = composed.get("config").cloned().unwrap_or_else(|| Node::empty("config"));
        variables.subst_node(&mut config)?;
        let mut public = composed.get("public").cloned().unwrap_or_else(|| Node::empty("public"));
        variables.subst_node(&mut public)?;
        let sandbox = SandboxOptions::parse(composed.get("sandbox"))?;

        let mut plugin = (decl.create)();
        plugin.configure(&config)?;
        plugin.preflight()?;

        let sources = self.load_sources(project_idx, &composed, shortname, &variables)?;
        if kind == "stack" && !sources.is_empty() {
            return Err(load_error!(
                BadDependency,
                composed.get_node("sources")?.provenance().clone(),
                "stack elements may not declare sources"
            )
            .into());
        }

        let mut state = self.state.borrow_mut();
        let id = ElementId(state.elements.len());
        state.elements.push(Element {
            id,
            name: shortname.to_string(),
            local_name: name.to_string(),
            project: project_idx,
            project_name,
            kind,
            plugin_version,
            plugin,
            sources,
            dependencies,
            variables,
            environment,
            environment_nocache,
            config,
            public,
            sandbox,
            provenance: composed.provenance().clone(),
            file_path: file_path.to_path_buf(),
            weak_key: None,
            strict_key: None,
        });
        Ok(id)
    }

    fn load_sources(
        &self,
        project_idx: usize,
        composed: &Node,
        element_name: &str,
        variables: &Variables,
    ) -> Result<Vec<Source>> {
        let mut sources = Vec::new();
        let Some(source_list) = composed.get("sources") else { return Ok(sources) };
        for declared in source_list.expect_sequence()? {
            let kind = declared.get_str("kind")?.to_string();
            let decl = self.registry.source_decl(&kind)?;

            // Plugin defaults, then per-kind project overrides, then the
            // declaration itself.
            let mut source_node = self
                .registry
                .source_defaults(&kind)?
                .unwrap_or_else(|| Node::empty("source defaults"));
            let kind_override = {
                let state = self.state.borrow();
                state.projects[project_idx].project.source_overrides.get(&kind).cloned()
            };
            if let Some(kind_override) = kind_override {
                composite::compose(&mut source_node, &kind_override)?;
            }
            composite::compose(&mut source_node, declared)?;
            resolve_pending_lists(&mut source_node)?;
            let source_node = &source_node;

            let directory = source_node.get_str_opt("directory")?.map(str::to_string);
            if let Some(dir) = &directory {
                let expanded = variables.subst(dir, source_node.provenance())?;
                if !crate::utils::is_contained_relative(&expanded) {
                    return Err(crate::error::SourceError::BadDirectory {
                        element: element_name.to_string(),
                        directory: dir.clone(),
                    }
                    .into());
                }
            }

            let mut plugin_node = source_node.clone();
            variables.subst_node(&mut plugin_node)?;
            let mut plugin = (decl.create)();
            let mut config_node = plugin_node.clone();
            config_node.remove("kind");
            config_node.remove("directory");
            plugin.configure(&config_node)?;
            plugin.preflight()?;

            sources.push(Source {
                kind,
                plugin_version: decl.version,
                directory,
                plugin,
                node: source_node.clone(),
                provenance: source_node.provenance().clone(),
            });
        }
        Ok(sources)
    }

    /// Loads (or reuses) the subproject behind a junction element.
    fn load_junction(&self, project_idx: usize, junction_name: &str) -> Result<usize> {
        validate_element_name(junction_name)?;
        if let Some(sub_idx) = self
            .state
            .borrow()
            .junctions
            .get(&(project_idx, junction_name.to_string()))
        {
            return Ok(*sub_idx);
        }

        // A parent project may override this junction with its own element.
        let override_target = self
            .state
            .borrow()
            .projects[project_idx]
            .junction_overrides
            .get(junction_name)
            .cloned();
        if let Some((parent_idx, target)) = override_target {
            let sub_idx = self.load_junction(parent_idx, &target)?;
            self.state
                .borrow_mut()
                .junctions
                .insert((project_idx, junction_name.to_string()), sub_idx);
            return Ok(sub_idx);
        }

        let (_file_path, shortname, raw) = self.read_element_file(project_idx, junction_name)?;
        let kind = raw.get_str("kind").map_err(Error::from)?;
        if kind == "link" {
            let target = link_target(&raw)?;
            // A link may hop across another junction before naming the
            // junction element itself.
            if let Some((first, rest)) = target.split_once(':') {
                let mid_idx = self.load_junction(project_idx, first)?;
                let sub_idx = self.load_junction(mid_idx, rest)?;
                self.state
                    .borrow_mut()
                    .junctions
                    .insert((project_idx, junction_name.to_string()), sub_idx);
                return Ok(sub_idx);
            }
            let sub_idx = self.load_junction(project_idx, &target)?;
            self.state
                .borrow_mut()
                .junctions
                .insert((project_idx, junction_name.to_string()), sub_idx);
            return Ok(sub_idx);
        }
        if kind != "junction" {
            return Err(load_error!(
                InvalidJunction,
                raw.provenance().clone(),
                "'{shortname}' is a '{kind}' element, not a junction"
            )
            .into());
        }
        if raw.get("depends").is_some()
            || raw.get("build-depends").is_some()
            || raw.get("runtime-depends").is_some()
        {
            return Err(load_error!(
                InvalidJunction,
                raw.provenance().clone(),
                "junction '{shortname}' may not declare dependencies"
            )
            .into());
        }

        // Resolve directives and read junction configuration.
        let mut declaration = raw;
        {
            let includes = LoaderIncludes { loader: self, project_idx };
            let options = self.state.borrow().projects[project_idx].project.options.clone();
            resolve_directives(&mut declaration, &options, &includes, &mut Vec::new())?;
        }
        let config = declaration.get("config").cloned().unwrap_or_else(|| Node::empty("config"));
        let mut subproject_options: BTreeMap<String, String> = BTreeMap::new();
        if let Some(options_node) = config.get("options") {
            for (name, value) in options_node.expect_mapping()? {
                subproject_options.insert(name.clone(), value.expect_scalar()?.to_string());
            }
        }
        let mut junction_overrides = BTreeMap::new();
        if let Some(overrides_node) = config.get("overrides") {
            for (nested, target) in overrides_node.expect_mapping()? {
                junction_overrides
                    .insert(nested.clone(), (project_idx, target.expect_scalar()?.to_string()));
            }
        }

        // Stage the junction's sources into a private checkout keyed by the
        // junction chain.
        let checkout = self.stage_junction_sources(project_idx, &shortname, &declaration)?;

        // User option overrides for the subproject win over junction ones.
        let sub_prefix = format!("{shortname}:");
        let toplevel_dir = self.state.borrow().projects[0].project.directory.clone();
        let subproject = Project::load(&checkout, &toplevel_dir, &subproject_options)?;
        let subproject = if let Some(user) = self.config.project_options.get(&subproject.name) {
            let mut merged = subproject_options.clone();
            merged.extend(user.clone());
            Project::load(&checkout, &toplevel_dir, &merged)?
        } else {
            subproject
        };

        // Conflict detection: the same project reached over two different
        // junction chains is fatal unless declared a duplicate or internal.
        {
            let mut state = self.state.borrow_mut();
            let sub_name = subproject.name.clone();
            if let Some(first_chain) = state.subprojects.get(&sub_name) {
                if first_chain != &sub_prefix {
                    let toplevel = &state.projects[0].project;
                    let allowed = toplevel.junctions.duplicates.contains(&sub_name)
                        || toplevel.junctions.internal.contains(&sub_name);
                    if !allowed {
                        return Err(load_error!(
                            ConflictingJunction,
                            declaration.provenance().clone(),
                            "project '{sub_name}' is already loaded through '{first_chain}', \
                             and through '{sub_prefix}'; declare it in junctions.duplicates or \
                             junctions.internal to allow this"
                        )
                        .into());
                    }
                }
            } else {
                state.subprojects.insert(sub_name, sub_prefix.clone());
            }

            let sub_idx = state.projects.len();
            state.projects.push(LoadedProject {
                project: subproject,
                prefix: sub_prefix,
                junction_overrides,
            });
            state.junctions.insert((project_idx, junction_name.to_string()), sub_idx);
            Ok(sub_idx)
        }
    }

    fn stage_junction_sources(
        &self,
        project_idx: usize,
        shortname: &str,
        declaration: &Node,
    ) -> Result<PathBuf> {
        let checkout = self
            .config
            .junctions_dir
            .join(shortname.replace([':', '/'], "_"));
        if checkout.is_dir() {
            std::fs::remove_dir_all(&checkout)
                .map_err(|e| crate::error::IoError::new(e, &checkout))?;
        }
        std::fs::create_dir_all(&checkout)
            .map_err(|e| crate::error::IoError::new(e, &checkout))?;

        let Some(source_list) = declaration.get("sources") else {
            return Err(load_error!(
                InvalidJunction,
                declaration.provenance().clone(),
                "junction '{shortname}' declares no sources"
            )
            .into());
        };
        for declared in source_list.expect_sequence()? {
            let kind = declared.get_str("kind")?.to_string();
            let decl = self.registry.source_decl(&kind)?;
            let mut config_node = self
                .registry
                .source_defaults(&kind)?
                .unwrap_or_else(|| Node::empty("source defaults"));
            let kind_override = {
                let state = self.state.borrow();
                state.projects[project_idx].project.source_overrides.get(&kind).cloned()
            };
            if let Some(kind_override) = kind_override {
                composite::compose(&mut config_node, &kind_override)?;
            }
            composite::compose(&mut config_node, declared)?;
            resolve_pending_lists(&mut config_node)?;
            config_node.remove("kind");
            config_node.remove("directory");
            let mut plugin = (decl.create)();
            plugin.configure(&config_node)?;

            let state = self.state.borrow();
            let project = &state.projects[project_idx].project;
            let policy = self.config.policy;
            let default_mirror = self.config.default_mirror.clone();
            let translator = |url: &str, tracking: bool| {
                project.translate_url(url, policy, default_mirror.as_deref(), tracking)
            };
            let ctx = SourceContext {
                element: shortname,
                sourcedir: &self.config.sourcedir,
                translator: &translator,
            };
            // Fetch before staging; `stage` presupposes fetched contents.
            plugin.fetch(&ctx)?;
            plugin.stage(&ctx, &checkout)?;
        }
        Ok(checkout)
    }
}

/// Include resolution for element declarations: project-relative files, or
/// junction-prefixed files resolved in the subproject's option context.
struct LoaderIncludes<'l, 'a> {
    loader: &'l Loader<'a>,
    project_idx: usize,
}

impl IncludeResolver for LoaderIncludes<'_, '_> {
    fn resolve(
        &self,
        reference: &str,
        provenance: &Provenance,
        stack: &mut Vec<String>,
    ) -> Result<Node> {
        let (project_idx, relative) = match reference.rsplit_once(':') {
            Some((junction_chain, rest)) => {
                let mut idx = self.project_idx;
                for junction in junction_chain.split(':') {
                    idx = self.loader.load_junction(idx, junction)?;
                }
                (idx, rest)
            }
            None => (self.project_idx, reference),
        };
        let (path, options) = {
            let state = self.loader.state.borrow();
            let project = &state.projects[project_idx].project;
            (project.directory.join(relative), project.options.clone())
        };
        if !path.is_file() {
            return Err(load_error!(
                IncludeNotFound,
                provenance.clone(),
                "include file '{reference}' was not found"
            )
            .into());
        }
        let mut node = crate::node::load(&path, reference)?;
        let includes = LoaderIncludes { loader: self.loader, project_idx };
        resolve_directives(&mut node, &options, &includes, stack)?;
        Ok(node)
    }
}

struct ParsedDep {
    name: String,
    dep_type: DepType,
    strict: bool,
    config: Option<Node>,
}

fn dependency_nodes(composed: &Node) -> Result<Vec<(Node, DepType)>, LoadError> {
    let mut out = Vec::new();
    for (key, default_type) in [
        ("build-depends", DepType::Build),
        ("runtime-depends", DepType::Runtime),
        ("depends", DepType::All),
    ] {
        if let Some(list) = composed.get(key) {
            for item in list.expect_sequence()? {
                out.push((item.clone(), default_type));
            }
        }
    }
    Ok(out)
}

fn parse_dependency(node: &Node, default_type: DepType) -> Result<ParsedDep> {
    match node.as_scalar() {
        Some(name) => Ok(ParsedDep {
            name: name.to_string(),
            dep_type: default_type,
            strict: false,
            config: None,
        }),
        None => {
            node.validate_keys(&["filename", "junction", "type", "strict", "config"])?;
            let filename = node.get_str("filename")?.to_string();
            let name = match node.get_str_opt("junction")? {
                Some(junction) => format!("{junction}:{filename}"),
                None => filename,
            };
            let dep_type = match node.get_str_opt("type")? {
                None => default_type,
                Some("build") => DepType::Build,
                Some("runtime") => DepType::Runtime,
                Some("all") => DepType::All,
                Some(other) => {
                    return Err(load_error!(
                        BadDependency,
                        node.provenance().clone(),
                        "invalid dependency type '{other}'"
                    )
                    .into())
                }
            };
            Ok(ParsedDep {
                name,
                dep_type,
                strict: node.get_bool("strict", false)?,
                config: node.get("config").cloned(),
            })
        }
    }
}

fn link_target(raw: &Node) -> Result<String> {
    let config = raw.get_node("config")?;
    let target = config.get_node("target")?;
    match target.as_scalar() {
        Some(s) => Ok(s.to_string()),
        None => {
            let filename = target.get_str("filename")?;
            Ok(match target.get_str_opt("junction")? {
                Some(junction) => format!("{junction}:{filename}"),
                None => filename.to_string(),
            })
        }
    }
}
