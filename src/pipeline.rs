//! The pipeline planner.
//!
//! Given loaded targets and a command intent, computes the element set in
//! the appropriate scope and derives the task graph the scheduler runs:
//! which elements get Track/Fetch/Pull/Build/Push tasks and the prerequisite
//! edges between them.

use crate::element::{ElementGraph, ElementId, Scope};
use crate::scheduler::{Task, TaskId, TaskKind};
use std::collections::HashMap;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Intent {
    Build,
    Fetch,
    Track,
    Pull,
    Push,
    Show,
}

/// Which elements a track run touches.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TrackSelection {
    /// Only the named targets.
    #[default]
    None,
    /// The whole closure.
    All,
}

#[derive(Debug)]
pub struct Plan {
    /// Session elements, dependencies before dependants.
    pub elements: Vec<ElementId>,
    pub tasks: Vec<Task>,
}

pub struct Planner<'a> {
    pub graph: &'a ElementGraph,
    /// Whether artifact remotes are configured at all (Pull tasks).
    pub have_artifact_remotes: bool,
    /// Whether any artifact remote accepts pushes (Push tasks).
    pub push_artifacts: bool,
    /// Whether any source cache remote accepts pushes (PushSource tasks).
    pub push_sources: bool,
    pub track_selection: TrackSelection,
}

impl Planner<'_> {
    pub fn plan(&self, targets: &[ElementId], intent: Intent) -> Plan {
        let elements = self.session_elements(targets, intent);
        let depths = self.depths(targets);
        let mut tasks = Vec::new();
        let mut by_element: HashMap<(ElementId, TaskKind), TaskId> = HashMap::new();
        // Build tasks for elements sharing a strong key run one after the
        // other; the later ones resolve as cache hits instead of racing.
        let mut build_by_key: HashMap<String, TaskId> = HashMap::new();

        let mut push_task = |tasks: &mut Vec<Task>,
                             by_element: &mut HashMap<(ElementId, TaskKind), TaskId>,
                             id: ElementId,
                             kind: TaskKind,
                             prerequisites: Vec<TaskId>| {
            let task_id = TaskId(tasks.len());
            tasks.push(Task {
                id: task_id,
                kind,
                element: id,
                element_name: self.graph.get(id).name.clone(),
                prerequisites,
                depth: depths.get(&id).copied().unwrap_or(0),
            });
            by_element.insert((id, kind), task_id);
            task_id
        };

        for &id in &elements {
            let element = self.graph.get(id);
            let has_sources = !element.sources.is_empty();
            match intent {
                Intent::Show => {}
                Intent::Track => {
                    if has_sources {
                        push_task(&mut tasks, &mut by_element, id, TaskKind::Track, Vec::new());
                    }
                }
                Intent::Fetch => {
                    if has_sources {
                        push_task(&mut tasks, &mut by_element, id, TaskKind::Fetch, Vec::new());
                    }
                }
                Intent::Pull => {
                    push_task(&mut tasks, &mut by_element, id, TaskKind::Pull, Vec::new());
                }
                Intent::Push => {
                    push_task(&mut tasks, &mut by_element, id, TaskKind::Push, Vec::new());
                }
                Intent::Build => {
                    // Pull first: a remote hit short-circuits Fetch and
                    // Build for this element.
                    let mut build_prereqs = Vec::new();
                    let pull = self.have_artifact_remotes.then(|| {
                        push_task(&mut tasks, &mut by_element, id, TaskKind::Pull, Vec::new())
                    });
                    build_prereqs.extend(pull);

                    if has_sources {
                        let fetch = push_task(
                            &mut tasks,
                            &mut by_element,
                            id,
                            TaskKind::Fetch,
                            pull.into_iter().collect(),
                        );
                        build_prereqs.push(fetch);
                        if self.push_sources {
                            push_task(
                                &mut tasks,
                                &mut by_element,
                                id,
                                TaskKind::PushSource,
                                vec![fetch],
                            );
                        }
                    }

                    // Build starts strictly after every build-scope
                    // dependency's Build completed (or was skipped as
                    // cached/pulled).
                    for dep in self.graph.dependencies(id, Scope::Build) {
                        if let Some(task) = by_element.get(&(dep, TaskKind::Build)) {
                            build_prereqs.push(*task);
                        }
                    }
                    if let Some(key) = &element.strict_key {
                        if let Some(twin) = build_by_key.get(key) {
                            build_prereqs.push(*twin);
                        }
                    }
                    let build =
                        push_task(&mut tasks, &mut by_element, id, TaskKind::Build, build_prereqs);
                    if let Some(key) = &element.strict_key {
                        build_by_key.entry(key.clone()).or_insert(build);
                    }

                    if self.push_artifacts {
                        push_task(&mut tasks, &mut by_element, id, TaskKind::Push, vec![build]);
                    }
                }
            }
        }

        Plan { elements, tasks }
    }

    fn session_elements(&self, targets: &[ElementId], intent: Intent) -> Vec<ElementId> {
        match intent {
            Intent::Track if self.track_selection == TrackSelection::None => targets.to_vec(),
            _ => {
                let mut out = Vec::new();
                let mut seen = std::collections::HashSet::new();
                for &target in targets {
                    for id in self.graph.dependencies(target, Scope::All) {
                        if seen.insert(id) {
                            out.push(id);
                        }
                    }
                }
                out
            }
        }
    }

    /// Topological depth from the targets: a target is depth 0, its
    /// dependencies are deeper. The scheduler runs deeper tasks first among
    /// equals.
    fn depths(&self, targets: &[ElementId]) -> HashMap<ElementId, usize> {
        let mut depths: HashMap<ElementId, usize> = HashMap::new();
        let mut queue: std::collections::VecDeque<(ElementId, usize)> =
            targets.iter().map(|t| (*t, 0usize)).collect();
        while let Some((id, depth)) = queue.pop_front() {
            if depths.get(&id).is_some_and(|existing| *existing >= depth) {
                continue;
            }
            depths.insert(id, depth);
            for dep in &self.graph.get(id).dependencies {
                queue.push_back((dep.target, depth + 1));
            }
        }
        depths
    }
}
