//! Sandbox orchestration and artifact assembly.
//!
//! The core does not run build commands itself; it stages a sandbox root,
//! writes a command proto and hands both to a [`SandboxExecutor`]. Staging
//! materialises the build-scope dependency artifacts (location-sorted,
//! overlap-checked), runs their integration commands, and places the
//! element's sources under `%{build-root}`. After the executor succeeds the
//! install root is collected into the CAS with normalised metadata and the
//! artifact proto is assembled. A failed command group still produces a
//! proto (`build_success: false`) so failures are reproducible and
//! shareable.

use crate::artifact::{ArtifactCache, ArtifactProto};
use crate::cas::{CasStore, Digest, StageMode, TreeEntry};
use crate::config::CacheBuildTrees;
use crate::element::{Element, ElementGraph, ElementId, Scope, Variables};
use crate::error::{ArtifactError, IoResultExt, Result, SandboxError, SourceError};
use crate::plugin::SourceContext;
use crate::project::SourcePolicy;
use crate::scheduler::CancelToken;
use crate::sourcecache::SourceCache;
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

pub mod overlap;
pub mod split;

pub use overlap::{OverlapLedger, OverlapWarning};

/// The command proto handed to the executor: a single argv, environment,
/// working directory and platform.
#[derive(Clone, Debug)]
pub struct SandboxCommand {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Sandbox-absolute working directory.
    pub cwd: String,
    pub build_uid: Option<u32>,
    pub build_gid: Option<u32>,
    pub build_os: Option<String>,
    pub build_arch: Option<String>,
}

/// Contract with the external low-level executor (a `buildbox-run`-like
/// child process). The host executor below is a plain-process stand-in for
/// tests and bring-up; hermeticity is the executor's concern, not ours.
pub trait SandboxExecutor: Send + Sync {
    /// Runs the command with the staged `root`, streaming combined output to
    /// `log`. Returns the exit status.
    fn run(
        &self,
        root: &Path,
        command: &SandboxCommand,
        log: &mut dyn Write,
        cancel: &CancelToken,
    ) -> Result<i32, SandboxError>;
}

/// Executes commands as plain host processes chrooted-by-convention into the
/// sandbox root: the working directory lands below the root, the environment
/// is cleared, and references to the conventional sandbox roots
/// (`/buildstream...`) in the command and environment are rewritten below
/// the staged root. Not hermetic; a production deployment points the
/// orchestrator at a real isolation executor instead.
#[derive(Debug, Default)]
pub struct HostExecutor;

impl SandboxExecutor for HostExecutor {
    fn run(
        &self,
        root: &Path,
        command: &SandboxCommand,
        log: &mut dyn Write,
        cancel: &CancelToken,
    ) -> Result<i32, SandboxError> {
        let executor_err = |message: String| SandboxError::Executor {
            element: command.cwd.clone(),
            message,
        };
        let rewrite = |value: &str| -> String {
            value.replace(
                "/buildstream",
                &format!("{}/buildstream", root.display()),
            )
        };
        let cwd = root.join(command.cwd.trim_start_matches('/'));
        fs::create_dir_all(&cwd).map_err(|e| executor_err(e.to_string()))?;
        let argv: Vec<String> = command.argv.iter().map(|a| rewrite(a)).collect();
        let env: BTreeMap<String, String> =
            command.env.iter().map(|(k, v)| (k.clone(), rewrite(v))).collect();
        let mut child = std::process::Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&cwd)
            .env_clear()
            .envs(&env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| executor_err(e.to_string()))?;

        // Drain the pipes on their own threads so a chatty child cannot
        // fill the pipe buffer and stall while we poll for cancellation.
        let mut stdout = child.stdout.take().expect("stdout is piped");
        let mut stderr = child.stderr.take().expect("stderr is piped");
        let out_thread = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = std::io::Read::read_to_end(&mut stdout, &mut buf);
            buf
        });
        let err_thread = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = std::io::Read::read_to_end(&mut stderr, &mut buf);
            buf
        });

        let status = loop {
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(executor_err("cancelled".to_string()));
            }
            match child.try_wait().map_err(|e| executor_err(e.to_string()))? {
                Some(status) => break status,
                None => std::thread::sleep(std::time::Duration::from_millis(25)),
            }
        };
        let mut output = out_thread.join().unwrap_or_default();
        output.extend(err_thread.join().unwrap_or_default());
        let _ = log.write_all(&output);
        Ok(status.code().unwrap_or(-1))
    }
}

/// A staged sandbox under construction.
pub struct Sandbox {
    root: PathBuf,
    element_name: String,
    env: BTreeMap<String, String>,
    sandbox_options: crate::element::SandboxOptions,
    executor: Arc<dyn SandboxExecutor>,
    log: Box<dyn Write + Send>,
    cancel: CancelToken,
    pub(crate) ledger: OverlapLedger,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox").field("root", &self.root).finish()
    }
}

impl Sandbox {
    pub fn new(
        root: PathBuf,
        element: &Element,
        executor: Arc<dyn SandboxExecutor>,
        log: Box<dyn Write + Send>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            root,
            element_name: element.name.clone(),
            env: element.environment.clone(),
            sandbox_options: element.sandbox.clone(),
            executor,
            log,
            cancel,
            ledger: OverlapLedger::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path of a sandbox-absolute path.
    pub fn host_path(&self, sandbox_path: &str) -> PathBuf {
        self.root.join(sandbox_path.trim_start_matches('/'))
    }

    /// Declares a writable area, creating it.
    pub fn mark_directory(&mut self, sandbox_path: &str) -> Result<()> {
        let host = self.host_path(sandbox_path);
        fs::create_dir_all(&host).map_err_path(&host)?;
        Ok(())
    }

    /// Runs a command group: the commands joined under `sh -e`, halting on
    /// the first non-zero exit.
    pub fn run_group(&mut self, group: &str, commands: &[String], cwd: &str) -> Result<()> {
        if commands.is_empty() {
            return Ok(());
        }
        let script = commands.join("\n");
        let _ = writeln!(self.log, "[{}] {group}", self.element_name);
        for command in commands {
            let _ = writeln!(self.log, "+ {command}");
        }
        let command = SandboxCommand {
            argv: vec!["/bin/sh".to_string(), "-e".to_string(), "-c".to_string(), script],
            env: self.env.clone(),
            cwd: cwd.to_string(),
            build_uid: self.sandbox_options.build_uid,
            build_gid: self.sandbox_options.build_gid,
            build_os: self.sandbox_options.build_os.clone(),
            build_arch: self.sandbox_options.build_arch.clone(),
        };
        let status = self.executor.run(&self.root, &command, &mut self.log, &self.cancel)?;
        if status != 0 {
            return Err(SandboxError::CommandFailed {
                element: self.element_name.clone(),
                group: group.to_string(),
                status,
            }
            .into());
        }
        Ok(())
    }

    pub fn warnings(&self) -> &[OverlapWarning] {
        self.ledger.warnings()
    }
}

/// Everything an element plugin can reach during staging and assembly.
pub struct BuildContext<'a> {
    pub graph: &'a ElementGraph,
    pub element_id: ElementId,
    pub cas: &'a CasStore,
    pub artifacts: &'a ArtifactCache,
    pub source_cache: &'a SourceCache,
    /// Resolved artifact protos for every element in build scope.
    pub dep_protos: &'a HashMap<ElementId, ArtifactProto>,
    pub sourcedir: &'a Path,
    pub policy: SourcePolicy,
    pub default_mirror: Option<String>,
}

impl BuildContext<'_> {
    pub fn element(&self) -> &Element {
        self.graph.get(self.element_id)
    }

    pub fn variables(&self) -> &Variables {
        &self.element().variables
    }

    /// A variable lookup that must succeed.
    pub fn variable(&self, name: &str) -> Result<String> {
        self.variables().get(name).map(str::to_string).ok_or_else(|| {
            crate::error::Error::User(format!(
                "'{}' does not define the '%{{{name}}}' variable",
                self.element().name
            ))
        })
    }

    /// The ordered staging plan: every build-scope element paired with the
    /// sandbox location its subtree stages at, parent locations first.
    pub fn staging_plan(&self) -> Result<Vec<(ElementId, String)>> {
        let element = self.element();
        let mut plan: Vec<(ElementId, String)> = Vec::new();
        for dep in element.direct_deps(true) {
            let location = dep.location()?;
            for id in self.graph.dependencies(dep.target, Scope::Run) {
                if !plan.iter().any(|(seen, loc)| *seen == id && *loc == location) {
                    plan.push((id, location.clone()));
                }
            }
        }
        // Parent directories stage before their children; stable, so the
        // topological order within one location is preserved.
        plan.sort_by_key(|(_, location)| crate::utils::absolute_components(location).len());
        Ok(plan)
    }

    /// Stages every build-scope dependency artifact into the sandbox.
    pub fn stage_dependencies(&self, sandbox: &mut Sandbox) -> Result<()> {
        for (id, location) in self.staging_plan()? {
            self.stage_artifact(sandbox, id, &location)?;
        }
        Ok(())
    }

    /// Stages one dependency's artifact tree at `location`, recording every
    /// path in the overlap ledger.
    pub fn stage_artifact(
        &self,
        sandbox: &mut Sandbox,
        id: ElementId,
        location: &str,
    ) -> Result<()> {
        let dep = self.graph.get(id);
        let proto = self.dep_protos.get(&id).ok_or_else(|| ArtifactError::NotCached {
            name: dep.name.clone(),
        })?;
        let tree = proto.tree.as_ref().ok_or_else(|| ArtifactError::NotCached {
            name: dep.name.clone(),
        })?;
        let whitelist = dep.overlap_whitelist()?;
        trace!(element = %dep.name, location, "staging artifact");

        for (relpath, entry) in self.cas.tree_entries(tree)? {
            let sandbox_abs = join_location(location, &relpath);
            // Symlinks participate in overlap detection through a digest of
            // their target.
            let digest = match &entry {
                TreeEntry::File { digest, .. } => *digest,
                TreeEntry::Symlink { target } => Digest::of_bytes(target.as_bytes()),
            };
            let graph = self.graph;
            let should_write = sandbox.ledger.record(
                &sandbox_abs,
                digest,
                id,
                &dep.name,
                |owner| graph.get(owner).name.clone(),
                &whitelist,
            )?;
            if !should_write {
                continue;
            }
            let host = sandbox.host_path(&sandbox_abs);
            if let Some(parent) = host.parent() {
                fs::create_dir_all(parent).map_err_path(parent)?;
            }
            if host.symlink_metadata().is_ok() {
                fs::remove_file(&host).map_err_path(&host)?;
            }
            match entry {
                TreeEntry::File { digest, executable } => {
                    self.cas.checkout_file(&digest, &host, executable, StageMode::Hardlink)?;
                }
                TreeEntry::Symlink { target } => {
                    std::os::unix::fs::symlink(&target, &host).map_err_path(&host)?;
                }
            }
        }
        Ok(())
    }

    /// Runs the integration commands of every staged dependency, in
    /// topological order by build-closure depth; ties break by element path.
    pub fn integrate(&self, sandbox: &mut Sandbox) -> Result<()> {
        let mut staged = self.graph.dependencies(self.element_id, Scope::Build);
        let mut levels: HashMap<ElementId, usize> = HashMap::new();
        for &id in &staged {
            self.topo_level(id, &mut levels);
        }
        staged.sort_by(|a, b| {
            (levels[a], &self.graph.get(*a).name).cmp(&(levels[b], &self.graph.get(*b).name))
        });
        for id in staged {
            let dep = self.graph.get(id);
            let commands = dep.integration_commands()?;
            if !commands.is_empty() {
                debug!(element = %dep.name, "running integration commands");
                sandbox.run_group(&format!("integrate {}", dep.name), &commands, "/")?;
            }
        }
        Ok(())
    }

    fn topo_level(&self, id: ElementId, memo: &mut HashMap<ElementId, usize>) -> usize {
        if let Some(level) = memo.get(&id) {
            return *level;
        }
        let level = self
            .graph
            .get(id)
            .direct_deps(false)
            .map(|d| d.target)
            .collect::<Vec<_>>()
            .into_iter()
            .map(|dep| self.topo_level(dep, memo) + 1)
            .max()
            .unwrap_or(0);
        memo.insert(id, level);
        level
    }

    /// Stages the element's own sources under `path` (normally
    /// `%{build-root}`), each source honouring its `directory`.
    pub fn stage_sources(&self, sandbox: &mut Sandbox, path: &str) -> Result<()> {
        let element = self.element();
        for index in 0..element.sources.len() {
            let digest = self.cached_source(index)?;
            let source = &element.sources[index];
            let dest_rel = match &source.directory {
                Some(dir) => {
                    let expanded = element.variables.subst(dir, &source.provenance)?;
                    let Some(normalized) =
                        crate::utils::normalize_relative(Path::new(&expanded))
                    else {
                        return Err(SourceError::BadDirectory {
                            element: element.name.clone(),
                            directory: dir.clone(),
                        }
                        .into());
                    };
                    normalized
                }
                None => PathBuf::new(),
            };
            let dest = sandbox.host_path(path).join(dest_rel);
            self.source_cache.stage_into(&digest, &dest)?;
        }
        Ok(())
    }

    /// The cached tree digest for one source, fetching and caching on a
    /// miss.
    pub fn cached_source(&self, index: usize) -> Result<Digest> {
        let element = self.element();
        let project = &self.graph.projects[element.project];
        let policy = self.policy;
        let default_mirror = self.default_mirror.clone();
        let translator =
            move |url: &str, tracking: bool| project.translate_url(url, policy, default_mirror.as_deref(), tracking);
        let ctx = SourceContext {
            element: &element.name,
            sourcedir: self.sourcedir,
            translator: &translator,
        };
        crate::sourcecache::ensure_element_source(self.source_cache, &element.sources, index, &ctx)
    }
}

fn join_location(location: &str, relpath: &str) -> String {
    let mut components = crate::utils::absolute_components(location);
    components.extend(relpath.split('/').map(str::to_string));
    format!("/{}", components.join("/"))
}

/// Policy inputs for one build.
pub struct BuildOptions {
    pub executor: Arc<dyn SandboxExecutor>,
    /// Scratch area for sandbox roots, outside any project checkout.
    pub scratch_dir: PathBuf,
    pub log_path: PathBuf,
    pub cancel: CancelToken,
    pub cache_buildtrees: CacheBuildTrees,
}

/// Drives a complete build of the context's element: stage, integrate,
/// assemble, collect, and produce the artifact proto.
///
/// A failing command group returns `Ok` with `build_success: false` and the
/// log attached; infrastructure failures (overlaps, staging errors, executor
/// crashes) return `Err`.
pub fn build_element(ctx: &BuildContext<'_>, opts: &BuildOptions) -> Result<ArtifactProto> {
    let element = ctx.element();
    fs::create_dir_all(&opts.scratch_dir).map_err_path(&opts.scratch_dir)?;
    let scratch = tempfile::Builder::new()
        .prefix("sandbox-")
        .tempdir_in(&opts.scratch_dir)
        .map_err_path(&opts.scratch_dir)?;
    crate::utils::create_parent_dir_all(&opts.log_path)?;
    let log = fs::File::create(&opts.log_path).map_err_path(&opts.log_path)?;

    let mut sandbox = Sandbox::new(
        scratch.path().to_path_buf(),
        element,
        Arc::clone(&opts.executor),
        Box::new(log),
        opts.cancel.clone(),
    );

    info!(element = %element.name, "building");
    element.plugin.configure_sandbox(ctx, &mut sandbox)?;
    element.plugin.stage(ctx, &mut sandbox)?;
    let mut first_overlap = None;
    for warning in sandbox.warnings() {
        warn!(
            path = %warning.path,
            first = %warning.first,
            second = %warning.second,
            "whitelisted overlap"
        );
        if first_overlap.is_none() {
            first_overlap = Some(warning.clone());
        }
    }
    // `fatal-warnings: [overlaps]` promotes whitelisted overlaps to errors
    // at their site.
    if let Some(warning) = first_overlap {
        let project = &ctx.graph.projects[element.project];
        if project.warning_is_fatal(crate::project::warnings::OVERLAPS) {
            return Err(SandboxError::OverlapFatal {
                path: warning.path,
                first: warning.first,
                second: warning.second,
            }
            .into());
        }
    }

    let assembled = element.plugin.assemble(ctx, &mut sandbox);
    let build_failed_cmd = matches!(
        &assembled,
        Err(crate::error::Error::Sandbox(SandboxError::CommandFailed { .. }))
    );

    let logs = ingest_log(ctx.cas, &opts.log_path)?;
    let buildtree = capture_buildtree(
        ctx,
        &sandbox,
        opts.cache_buildtrees,
        assembled.is_err(),
    )?;

    let (build_success, tree, splits) = match assembled {
        Ok(collect_root) => {
            let host = sandbox.host_path(&collect_root);
            if !host.is_dir() {
                return Err(SandboxError::Collect {
                    element: element.name.clone(),
                    path: collect_root,
                    message: "install root was not created".to_string(),
                }
                .into());
            }
            let tree = ctx.cas.import_tree(&host)?;
            let files: Vec<String> = ctx
                .cas
                .tree_entries(&tree)?
                .into_iter()
                .map(|(path, _)| format!("/{path}"))
                .collect();
            let splits = split::compute_splits(&element.split_rules()?, &files);
            (true, Some(tree), splits)
        }
        Err(e) if build_failed_cmd => {
            warn!(element = %element.name, "build failed: {e}");
            (false, None, BTreeMap::new())
        }
        Err(e) => return Err(e),
    };

    let mut build_deps = BTreeMap::new();
    for dep in element.direct_deps(true) {
        let dep_element = ctx.graph.get(dep.target);
        if let Some(key) = &dep_element.strict_key {
            build_deps.insert(dep_element.name.clone(), key.clone());
        }
    }

    let proto = ArtifactProto {
        version: 1,
        project_name: element.project_name.clone(),
        element_name: element.local_name.clone(),
        kind: element.kind.clone(),
        strong_key: element
            .strict_key
            .clone()
            .expect("buildable elements have resolved keys"),
        weak_key: element
            .weak_key
            .clone()
            .expect("buildable elements have resolved keys"),
        build_success,
        tree,
        buildtree,
        logs,
        public: element.public.to_json(),
        environment: element.environment.clone(),
        build_deps,
        splits,
    };
    Ok(proto)
}

fn ingest_log(cas: &CasStore, log_path: &Path) -> Result<Option<Digest>> {
    if log_path.is_file() {
        Ok(Some(cas.put_file(log_path)?))
    } else {
        Ok(None)
    }
}

fn capture_buildtree(
    ctx: &BuildContext<'_>,
    sandbox: &Sandbox,
    policy: CacheBuildTrees,
    failed: bool,
) -> Result<Option<Digest>> {
    let capture = match policy {
        CacheBuildTrees::Always => true,
        CacheBuildTrees::Auto => failed,
        CacheBuildTrees::Never => false,
    };
    if !capture {
        return Ok(None);
    }
    let Some(build_root) = ctx.element().variables.get("build-root") else { return Ok(None) };
    let host = sandbox.host_path(build_root);
    if host.is_dir() {
        Ok(Some(ctx.cas.import_tree(&host)?))
    } else {
        Ok(None)
    }
}
