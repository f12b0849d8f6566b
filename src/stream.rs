//! The programmatic driver.
//!
//! `Stream` is what a frontend maps commands onto: load a project and
//! targets once, then run build/fetch/track/pull/push/show/checkout intents
//! against the loaded pipeline. Each intent plans a task graph and runs it
//! on the scheduler; jobs communicate results through a session state table
//! keyed by element, which the driver owns.

use crate::artifact::{ArtifactName, ArtifactProto};
use crate::config::Context;
use crate::element::{
    CacheState, Element, ElementGraph, ElementId, Loader, LoaderConfig, Scope,
};
use crate::error::{ArtifactError, Error, Result, SandboxError, SourceError};
use crate::node::Node;
use crate::pipeline::{Intent, Plan, Planner, TrackSelection};
use crate::plugin::SourceContext;
use crate::project::Project;
use crate::remote::RemoteCluster;
use crate::sandbox::{build_element, BuildContext, BuildOptions};
use crate::scheduler::{
    CancelToken, JobFn, JobOutcome, Scheduler, SchedulerReport, Task, TaskKind,
};
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{Arc, Mutex},
};

/// A loaded project graph plus the session services resolved for it.
#[derive(Debug)]
pub struct LoadedPipeline {
    pub graph: Arc<ElementGraph>,
    pub targets: Vec<ElementId>,
    pub project_name: String,
    pub strict: bool,
    pub artifact_remotes: Arc<RemoteCluster>,
    pub source_remotes: Arc<RemoteCluster>,
    pub default_mirror: Option<String>,
    pub track_selection: TrackSelection,
}

/// One line of `show` output.
#[derive(Clone, Debug)]
pub struct ElementReport {
    pub name: String,
    pub kind: String,
    pub state: CacheState,
    pub weak_key: Option<String>,
    pub strict_key: Option<String>,
}

/// A new ref produced by tracking, already written back to the element
/// file.
#[derive(Clone, Debug)]
pub struct TrackedRef {
    pub element: String,
    pub source_index: usize,
    pub new_ref: Node,
}

#[derive(Default)]
struct SessionState {
    protos: Mutex<HashMap<ElementId, ArtifactProto>>,
    tracked: Mutex<Vec<(ElementId, usize, Node)>>,
}

pub struct Stream {
    context: Arc<Context>,
    pub cancel: CancelToken,
}

impl Stream {
    pub fn new(context: Arc<Context>) -> Self {
        Self { context, cancel: CancelToken::new() }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Loads the project at `project_dir` and resolves `targets` (or the
    /// project's default targets) into a pipeline.
    pub fn load(&self, project_dir: &Path, targets: &[&str]) -> Result<LoadedPipeline> {
        // The project's name decides which user overrides apply, so load
        // once to learn it and reload when overrides exist.
        let project = Project::load(project_dir, project_dir, &BTreeMap::new())?;
        let user = self.context.config.project(&project.name);
        let project = if user.options.is_empty() {
            project
        } else {
            Project::load(project_dir, project_dir, &user.options)?
        };

        let default_targets = project.default_targets.clone();
        let targets: Vec<String> = if targets.is_empty() {
            default_targets
        } else {
            targets.iter().map(|t| t.to_string()).collect()
        };
        if targets.is_empty() {
            return Err(Error::User(
                "no targets given and the project declares no default targets".to_string(),
            ));
        }

        let mut artifact_specs = self.context.config.artifact_specs(&project.name);
        artifact_specs.extend(project.artifact_cache_specs.iter().cloned());
        let mut source_specs = self.context.config.source_cache_specs(&project.name);
        source_specs.extend(project.source_cache_specs.iter().cloned());
        // A dedicated storage service backs every concern, storage-only.
        if let Some(storage) = &self.context.config.cache.storage_service {
            let mut spec = storage.clone();
            spec.kind = crate::remote::RemoteKind::Storage;
            artifact_specs.push(spec.clone());
            source_specs.push(spec);
        }

        let project_name = project.name.clone();
        let loader_config = LoaderConfig {
            sourcedir: self.context.sourcedir.clone(),
            junctions_dir: self.context.cachedir.join("junctions"),
            policy: self.context.config.fetch.source,
            default_mirror: user.default_mirror.clone(),
            project_options: self
                .context
                .config
                .projects
                .iter()
                .map(|(name, p)| (name.clone(), p.options.clone()))
                .collect(),
            max_jobs: self.context.config.max_jobs(),
        };
        let loader = Loader::new(project, self.context.registry.as_ref(), loader_config);
        let target_refs: Vec<&str> = targets.iter().map(String::as_str).collect();
        let (graph, target_ids) = loader.load(&target_refs)?;

        Ok(LoadedPipeline {
            graph: Arc::new(graph),
            targets: target_ids,
            strict: self.context.config.strict(&project_name),
            artifact_remotes: Arc::new(RemoteCluster::from_specs(&artifact_specs)?),
            source_remotes: Arc::new(RemoteCluster::from_specs(&source_specs)?),
            default_mirror: user.default_mirror,
            project_name,
            track_selection: TrackSelection::default(),
        })
    }

    fn planner<'a>(&self, pipeline: &'a LoadedPipeline) -> Planner<'a> {
        Planner {
            graph: &pipeline.graph,
            have_artifact_remotes: !pipeline.artifact_remotes.is_empty(),
            push_artifacts: pipeline.artifact_remotes.has_push(),
            push_sources: pipeline.source_remotes.has_push(),
            track_selection: pipeline.track_selection,
        }
    }

    /// Per-element cache state, in pipeline order. No side effects.
    pub fn show(&self, pipeline: &LoadedPipeline) -> Result<Vec<ElementReport>> {
        let plan = self.planner(pipeline).plan(&pipeline.targets, Intent::Show);
        let mut states: HashMap<ElementId, CacheState> = HashMap::new();
        let mut reports = Vec::new();
        for &id in &plan.elements {
            let element = pipeline.graph.get(id);
            let state = self.element_state(pipeline, element, &states);
            states.insert(id, state);
            reports.push(ElementReport {
                name: element.name.clone(),
                kind: element.kind.clone(),
                state,
                weak_key: element.weak_key.clone(),
                strict_key: element.strict_key.clone(),
            });
        }
        Ok(reports)
    }

    fn element_state(
        &self,
        pipeline: &LoadedPipeline,
        element: &Element,
        dep_states: &HashMap<ElementId, CacheState>,
    ) -> CacheState {
        if !element.sources_resolved() {
            return CacheState::FetchNeeded;
        }
        if let Some(proto) = self.lookup_local(pipeline, element) {
            return if proto.build_success { CacheState::Cached } else { CacheState::Failed };
        }
        let buildable = pipeline
            .graph
            .dependencies(element.id, Scope::Build)
            .iter()
            .all(|dep| matches!(dep_states.get(dep), Some(CacheState::Cached)));
        if buildable {
            CacheState::Buildable
        } else {
            CacheState::Waiting
        }
    }

    fn candidate_keys(strict: bool, element: &Element) -> Vec<String> {
        let mut keys = Vec::new();
        keys.extend(element.strict_key.clone());
        if !strict {
            keys.extend(element.weak_key.clone());
        }
        keys
    }

    fn lookup_local(&self, pipeline: &LoadedPipeline, element: &Element) -> Option<ArtifactProto> {
        for key in Self::candidate_keys(pipeline.strict, element) {
            if let Ok(Some(proto)) =
                self.context.artifacts.lookup(&element.project_name, &element.local_name, &key)
            {
                return Some(proto);
            }
        }
        None
    }

    pub fn build(&self, pipeline: &LoadedPipeline) -> Result<SchedulerReport> {
        self.run_intent(pipeline, Intent::Build)
    }

    pub fn fetch(&self, pipeline: &LoadedPipeline) -> Result<SchedulerReport> {
        self.run_intent(pipeline, Intent::Fetch)
    }

    pub fn pull(&self, pipeline: &LoadedPipeline) -> Result<SchedulerReport> {
        self.run_intent(pipeline, Intent::Pull)
    }

    pub fn push(&self, pipeline: &LoadedPipeline) -> Result<SchedulerReport> {
        self.run_intent(pipeline, Intent::Push)
    }

    fn run_intent(&self, pipeline: &LoadedPipeline, intent: Intent) -> Result<SchedulerReport> {
        let plan = self.planner(pipeline).plan(&pipeline.targets, intent);
        let state = Arc::new(SessionState::default());
        let report = self.run_plan(pipeline, &plan, &state)?;
        self.context.enforce_quota()?;
        Ok(report)
    }

    fn run_plan(
        &self,
        pipeline: &LoadedPipeline,
        plan: &Plan,
        state: &Arc<SessionState>,
    ) -> Result<SchedulerReport> {
        let scheduler = Scheduler::new(self.context.config.scheduler_config());
        let jobs = JobBuilder {
            context: Arc::clone(&self.context),
            graph: Arc::clone(&pipeline.graph),
            state: Arc::clone(state),
            artifact_remotes: Arc::clone(&pipeline.artifact_remotes),
            source_remotes: Arc::clone(&pipeline.source_remotes),
            strict: pipeline.strict,
            default_mirror: pipeline.default_mirror.clone(),
            network_retries: self.context.config.scheduler.network_retries,
            force_rebuild: std::env::var_os("BST_FORCE_SESSION_REBUILD").is_some()
                || self.context.config.build.dependencies
                    == crate::config::BuildDependencies::All,
        };
        let tasks = plan
            .tasks
            .iter()
            .map(|t| Task {
                id: t.id,
                kind: t.kind,
                element: t.element,
                element_name: t.element_name.clone(),
                prerequisites: t.prerequisites.clone(),
                depth: t.depth,
            })
            .collect();
        let factory = move |task: &Task| jobs.job(task);
        Ok(scheduler.run(tasks, &factory, &self.cancel))
    }

    /// Tracks sources, writes accepted refs back into element files and
    /// returns them. The caller reloads the pipeline afterwards; dependent
    /// intents must not reuse the stale one.
    pub fn track(&self, pipeline: &LoadedPipeline) -> Result<Vec<TrackedRef>> {
        let plan = self.planner(pipeline).plan(&pipeline.targets, Intent::Track);
        let state = Arc::new(SessionState::default());
        let report = self.run_plan(pipeline, &plan, &state)?;
        if !report.success {
            let detail: Vec<String> = report
                .failed()
                .map(|t| format!("{}: {}", t.element_name, t.error.clone().unwrap_or_default()))
                .collect();
            return Err(Error::User(format!("tracking failed: {}", detail.join("; "))));
        }

        let mut written = Vec::new();
        let tracked = state.tracked.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for (id, source_index, new_ref) in tracked.iter() {
            let element = pipeline.graph.get(*id);
            if element.project != 0 {
                warn!(element = %element.name, "not writing refs across a junction");
                continue;
            }
            self.write_ref(element, *source_index, new_ref)?;
            written.push(TrackedRef {
                element: element.name.clone(),
                source_index: *source_index,
                new_ref: new_ref.clone(),
            });
        }
        Ok(written)
    }

    /// Merges a new ref into the element's declaration on disk.
    fn write_ref(&self, element: &Element, source_index: usize, new_ref: &Node) -> Result<()> {
        let mut raw = crate::node::load(&element.file_path, &element.name)?;
        let sources = raw.get_mut("sources").ok_or_else(|| {
            Error::User(format!("'{}' has no sources to track", element.name))
        })?;
        let crate::node::Value::Sequence(items) = sources.value_mut() else {
            return Err(Error::User(format!("'{}' has malformed sources", element.name)));
        };
        let Some(source_node) = items.get_mut(source_index) else {
            return Err(Error::User(format!(
                "'{}' has no source at index {source_index}",
                element.name
            )));
        };
        crate::node::compose(source_node, new_ref)?;
        let text = crate::node::dump(&raw)?;
        crate::utils::write_atomic(&element.file_path, text.as_bytes())?;
        info!(element = %element.name, source = source_index, "ref updated");
        Ok(())
    }

    /// Stages a cached artifact tree of a loaded element at `dest`.
    pub fn checkout(
        &self,
        pipeline: &LoadedPipeline,
        target: ElementId,
        dest: &Path,
        hardlinks: bool,
    ) -> Result<()> {
        let element = pipeline.graph.get(target);
        let proto = self.lookup_local(pipeline, element).ok_or_else(|| {
            ArtifactError::NotCached { name: element.name.clone() }
        })?;
        self.context.artifacts.checkout(&proto, dest, hardlinks)
    }

    /// Stages an artifact by name, without a project checkout.
    pub fn checkout_artifact(
        &self,
        name: &ArtifactName,
        dest: &Path,
        hardlinks: bool,
    ) -> Result<()> {
        let proto = self
            .context
            .artifacts
            .lookup_name(name)?
            .ok_or_else(|| ArtifactError::NotCached { name: name.to_string() })?;
        self.context.artifacts.checkout(&proto, dest, hardlinks)
    }

    /// Stages the build tree of a cached artifact at `dest`, pulling it
    /// lazily when it was not downloaded with the artifact. Fails with a
    /// clear error when no remote still holds it.
    pub fn checkout_buildtree(
        &self,
        pipeline: &LoadedPipeline,
        name: &ArtifactName,
        dest: &Path,
    ) -> Result<()> {
        let proto = self
            .context
            .artifacts
            .lookup_name(name)?
            .ok_or_else(|| ArtifactError::NotCached { name: name.to_string() })?;
        let tree = proto.buildtree.ok_or_else(|| ArtifactError::BuildTreeUnavailable {
            name: name.to_string(),
        })?;
        if !self.context.cas.has_blob(&tree) {
            pipeline
                .artifact_remotes
                .pull_tree(&self.context.cas, &tree)
                .map_err(|e| {
                    warn!(artifact = %name, "build tree pull failed: {e}");
                    ArtifactError::BuildTreeUnavailable { name: name.to_string() }
                })?;
        }
        self.context.cas.checkout_tree(&tree, dest, crate::cas::StageMode::Copy)?;
        Ok(())
    }

    /// The build log of a cached artifact.
    pub fn artifact_log(&self, name: &ArtifactName) -> Result<Vec<u8>> {
        let proto = self
            .context
            .artifacts
            .lookup_name(name)?
            .ok_or_else(|| ArtifactError::NotCached { name: name.to_string() })?;
        let logs = proto
            .logs
            .ok_or_else(|| ArtifactError::NotCached { name: name.to_string() })?;
        Ok(self.context.cas.get_blob(&logs)?)
    }

    /// File listing of a cached artifact tree.
    pub fn artifact_contents(&self, name: &ArtifactName) -> Result<Vec<String>> {
        let proto = self
            .context
            .artifacts
            .lookup_name(name)?
            .ok_or_else(|| ArtifactError::NotCached { name: name.to_string() })?;
        let tree = proto
            .tree
            .ok_or_else(|| ArtifactError::NotCached { name: name.to_string() })?;
        Ok(self
            .context
            .cas
            .tree_entries(&tree)?
            .into_iter()
            .map(|(path, _)| format!("/{path}"))
            .collect())
    }

    pub fn delete_artifact(&self, name: &ArtifactName) -> Result<()> {
        self.context.artifacts.remove(&name.project, &name.element, &name.key)
    }
}

/// Builds job bodies for the scheduler; everything a job touches is owned
/// through Arcs so workers never borrow driver state.
struct JobBuilder {
    context: Arc<Context>,
    graph: Arc<ElementGraph>,
    state: Arc<SessionState>,
    artifact_remotes: Arc<RemoteCluster>,
    source_remotes: Arc<RemoteCluster>,
    strict: bool,
    default_mirror: Option<String>,
    network_retries: u32,
    force_rebuild: bool,
}

impl JobBuilder {
    fn job(&self, task: &Task) -> JobFn {
        let shared = SharedJob {
            context: Arc::clone(&self.context),
            graph: Arc::clone(&self.graph),
            state: Arc::clone(&self.state),
            artifact_remotes: Arc::clone(&self.artifact_remotes),
            source_remotes: Arc::clone(&self.source_remotes),
            strict: self.strict,
            default_mirror: self.default_mirror.clone(),
            network_retries: self.network_retries,
            force_rebuild: self.force_rebuild,
            element: task.element,
        };
        match task.kind {
            TaskKind::Pull => Box::new(move |ctx| shared.pull(ctx)),
            TaskKind::Fetch => Box::new(move |ctx| shared.fetch(ctx)),
            TaskKind::Build => Box::new(move |ctx| shared.build(ctx)),
            TaskKind::Push => Box::new(move |ctx| shared.push(ctx)),
            TaskKind::Track => Box::new(move |ctx| shared.track(ctx)),
            TaskKind::PullSource => Box::new(move |ctx| shared.pull_source(ctx)),
            TaskKind::PushSource => Box::new(move |ctx| shared.push_source(ctx)),
        }
    }
}

struct SharedJob {
    context: Arc<Context>,
    graph: Arc<ElementGraph>,
    state: Arc<SessionState>,
    artifact_remotes: Arc<RemoteCluster>,
    source_remotes: Arc<RemoteCluster>,
    strict: bool,
    default_mirror: Option<String>,
    network_retries: u32,
    force_rebuild: bool,
    element: ElementId,
}

impl SharedJob {
    fn element(&self) -> &Element {
        self.graph.get(self.element)
    }

    fn record_proto(&self, proto: ArtifactProto) {
        self.state
            .protos
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(self.element, proto);
    }

    fn recorded(&self) -> Option<ArtifactProto> {
        self.state
            .protos
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&self.element)
            .cloned()
    }

    fn candidate_keys(&self) -> Vec<String> {
        Stream::candidate_keys(self.strict, self.element())
    }

    fn lookup_local(&self) -> Option<ArtifactProto> {
        let element = self.element();
        for key in self.candidate_keys() {
            if let Ok(Some(proto)) =
                self.context.artifacts.lookup(&element.project_name, &element.local_name, &key)
            {
                return Some(proto);
            }
        }
        None
    }

    /// Runs `f` with a source context bound to this element's project.
    fn with_sources<R>(&self, f: impl FnOnce(&SourceContext<'_>) -> Result<R>) -> Result<R> {
        let element = self.element();
        let project = &self.graph.projects[element.project];
        let policy = self.context.config.fetch.source;
        let default_mirror = self.default_mirror.clone();
        let translator = move |url: &str, tracking: bool| {
            project.translate_url(url, policy, default_mirror.as_deref(), tracking)
        };
        let ctx = SourceContext {
            element: &element.name,
            sourcedir: &self.context.sourcedir,
            translator: &translator,
        };
        f(&ctx)
    }

    /// Network errors are surfaced while retries remain; afterwards the
    /// operation downgrades to "not found" so the pipeline can fall back.
    fn soften_network<T>(
        &self,
        attempt: u32,
        result: Result<T, crate::error::RemoteError>,
        fallback: T,
    ) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) if e.is_network() && attempt <= self.network_retries => Err(e.into()),
            Err(e) => {
                warn!(element = %self.element().name, "remote unavailable, falling back: {e}");
                Ok(fallback)
            }
        }
    }

    fn pull(&self, ctx: &crate::scheduler::JobContext) -> Result<JobOutcome> {
        let element = self.element();
        if let Some(proto) = self.lookup_local() {
            self.record_proto(proto);
            return Ok(JobOutcome { skipped: true });
        }
        for key in self.candidate_keys() {
            let name = ArtifactName {
                project: element.project_name.clone(),
                element: element.local_name.clone(),
                key,
            };
            let pulled = self.soften_network(
                ctx.attempt,
                self.artifact_remotes.pull_artifact(
                    &self.context.cas,
                    &name.uri(),
                    self.context.config.cache.pull_buildtrees,
                ),
                None,
            )?;
            if let Some(proto) = pulled {
                debug!(element = %element.name, "artifact pulled");
                self.context.artifacts.store(&proto)?;
                if !self.strict {
                    self.context.artifacts.link_weak(&proto)?;
                }
                self.record_proto(proto);
                return Ok(JobOutcome { skipped: false });
            }
        }
        Ok(JobOutcome { skipped: true })
    }

    fn fetch(&self, ctx: &crate::scheduler::JobContext) -> Result<JobOutcome> {
        if self.recorded().is_some() || (!self.force_rebuild && self.lookup_local().is_some()) {
            // A pulled or locally cached artifact makes fetching
            // unnecessary.
            return Ok(JobOutcome { skipped: true });
        }
        let element = self.element();
        let mut fetched_any = false;
        for index in 0..element.sources.len() {
            let source = &element.sources[index];
            let key_hash = crate::sourcecache::element_source_key(&element.sources, index)
                .ok_or_else(|| SourceError::Inconsistent {
                    element: element.name.clone(),
                    kind: source.kind.clone(),
                })?;
            if self.context.source_cache.contains(&source.kind, &key_hash) {
                continue;
            }
            // A source cache remote may hold the staged tree already.
            if !self.source_remotes.is_empty() {
                let uri = format!("source://{}/{}", source.kind, key_hash);
                let resolved = self.soften_network(
                    ctx.attempt,
                    self.source_remotes.pull_ref(&uri),
                    None,
                )?;
                if let Some(digest) = resolved {
                    let pulled = self.soften_network(
                        ctx.attempt,
                        self.source_remotes
                            .pull_tree(&self.context.cas, &digest)
                            .map(|()| true),
                        false,
                    )?;
                    if pulled {
                        self.context.source_cache.commit(&source.kind, &key_hash, &digest)?;
                        fetched_any = true;
                        continue;
                    }
                }
            }
            self.with_sources(|sctx| {
                crate::sourcecache::ensure_element_source(
                    &self.context.source_cache,
                    &element.sources,
                    index,
                    sctx,
                )
            })?;
            fetched_any = true;
        }
        Ok(JobOutcome { skipped: !fetched_any })
    }

    fn pull_source(&self, ctx: &crate::scheduler::JobContext) -> Result<JobOutcome> {
        // Source pulling is folded into fetch; the dedicated task exists for
        // pull-only pipelines.
        self.fetch(ctx)
    }

    fn push_source(&self, _ctx: &crate::scheduler::JobContext) -> Result<JobOutcome> {
        let element = self.element();
        let mut pushed = false;
        for index in 0..element.sources.len() {
            let source = &element.sources[index];
            let Some(key_hash) = crate::sourcecache::element_source_key(&element.sources, index)
            else {
                continue;
            };
            let Some(digest) = self.context.source_cache.load(&source.kind, &key_hash)? else {
                continue;
            };
            self.source_remotes.push_tree(&self.context.cas, &digest)?;
            self.source_remotes
                .push_ref(&format!("source://{}/{}", source.kind, key_hash), &digest)?;
            pushed = true;
        }
        Ok(JobOutcome { skipped: !pushed })
    }

    fn build(&self, ctx: &crate::scheduler::JobContext) -> Result<JobOutcome> {
        let element = self.element();
        if !self.force_rebuild {
            let cached = self.recorded().or_else(|| self.lookup_local());
            if let Some(proto) = cached {
                if proto.build_success {
                    self.record_proto(proto);
                    return Ok(JobOutcome { skipped: true });
                }
                self.record_proto(proto);
                return Err(Error::User(format!(
                    "'{}' is cached as a failed build; delete the artifact to retry",
                    element.name
                )));
            }
        }

        // Everything in build scope must be resolved by now, either in the
        // session state (pulled or built this run) or in the local cache.
        let mut dep_protos = HashMap::new();
        for dep in self.graph.dependencies(self.element, Scope::Build) {
            let from_state = self
                .state
                .protos
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(&dep)
                .cloned();
            let proto = match from_state {
                Some(proto) => proto,
                None => {
                    let dep_element = self.graph.get(dep);
                    Stream::candidate_keys(self.strict, dep_element)
                        .into_iter()
                        .find_map(|key| {
                            self.context
                                .artifacts
                                .lookup(&dep_element.project_name, &dep_element.name, &key)
                                .ok()
                                .flatten()
                        })
                        .ok_or_else(|| ArtifactError::NotCached {
                            name: dep_element.name.clone(),
                        })?
                }
            };
            dep_protos.insert(dep, proto);
        }

        let strong_key = element.strict_key.clone().ok_or_else(|| {
            Error::User(format!(
                "cannot compute a cache key for '{}'; its sources have no refs",
                element.name
            ))
        })?;
        let build_ctx = BuildContext {
            graph: &self.graph,
            element_id: self.element,
            cas: &self.context.cas,
            artifacts: &self.context.artifacts,
            source_cache: &self.context.source_cache,
            dep_protos: &dep_protos,
            sourcedir: &self.context.sourcedir,
            policy: self.context.config.fetch.source,
            default_mirror: self.default_mirror.clone(),
        };
        let options = BuildOptions {
            executor: Arc::clone(&self.context.executor),
            scratch_dir: self.context.cachedir.join("tmp"),
            log_path: self.context.log_path(
                &element.project_name,
                &element.local_name,
                &strong_key,
                "build",
            ),
            cancel: ctx.cancel.clone(),
            cache_buildtrees: self.context.config.cache.cache_buildtrees,
        };
        let proto = build_element(&build_ctx, &options)?;
        self.context.artifacts.store(&proto)?;
        if !self.strict {
            self.context.artifacts.link_weak(&proto)?;
        }
        let failed = !proto.build_success;
        self.record_proto(proto);
        if failed {
            return Err(SandboxError::CommandFailed {
                element: element.name.clone(),
                group: "assemble".to_string(),
                status: 1,
            }
            .into());
        }
        Ok(JobOutcome { skipped: false })
    }

    fn push(&self, _ctx: &crate::scheduler::JobContext) -> Result<JobOutcome> {
        let Some(proto) = self.recorded().or_else(|| self.lookup_local()) else {
            return Ok(JobOutcome { skipped: true });
        };
        self.artifact_remotes.push_artifact(&self.context.cas, &proto)?;
        debug!(element = %self.element().name, "artifact pushed");
        Ok(JobOutcome { skipped: false })
    }

    fn track(&self, _ctx: &crate::scheduler::JobContext) -> Result<JobOutcome> {
        let element = self.element();
        let mut tracked_any = false;
        for (index, source) in element.sources.iter().enumerate() {
            let new_ref = self.with_sources(|sctx| source.plugin.track(sctx))?;
            if let Some(node) = new_ref {
                self.state
                    .tracked
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push((self.element, index, node));
                tracked_any = true;
            }
        }
        Ok(JobOutcome { skipped: !tracked_any })
    }
}
