//! Cross-project composition: junctions, links, option contexts, duplicate
//! detection.

mod common;

use bst_core::scheduler::{TaskKind, TaskState};
use common::{TestProject, TestSession};
use std::fs;
use std::path::Path;

/// Writes a subproject checkout under `root` and returns its path.
fn write_subproject(root: &Path, name: &str, conf: &str) -> std::path::PathBuf {
    let dir = root.join("subprojects").join(name);
    fs::create_dir_all(dir.join("elements")).unwrap();
    fs::write(dir.join("project.conf"), conf).unwrap();
    dir
}

fn write_sub_element(dir: &Path, name: &str, yaml: &str) {
    fs::write(dir.join("elements").join(name), yaml).unwrap();
}

fn junction_element(subproject: &Path, extra: &str) -> String {
    format!(
        "kind: junction\nsources:\n- kind: dir\n  path: {}\n{extra}",
        subproject.display()
    )
}

#[test]
fn subproject_elements_resolve_in_their_own_option_context() {
    let session = TestSession::new();
    let project = TestProject::new("name: toplevel\nmin-version: 2.0\n");
    let sub = write_subproject(
        project.path(),
        "q",
        "name: qproject\nmin-version: 2.0\n\
         options:\n  fast:\n    type: bool\n    default: true\n",
    );
    let libfiles = project.write_files("lib", &[("lib.txt", "library\n")]);
    write_sub_element(
        &sub,
        "lib.bst",
        &format!(
            "kind: import\nsources:\n- kind: dir\n  path: {}\n  ref: l1\n\
             variables:\n  speed: slow\n\
             (?):\n- fast:\n    variables:\n      speed: fast\n",
            libfiles.display()
        ),
    );
    project.write_element("q.bst", &junction_element(&sub, ""));
    project.write_element(
        "app.bst",
        "kind: manual\nbuild-depends:\n- q.bst:lib.bst\n",
    );

    let pipeline = session.stream.load(project.path(), &["app.bst"]).unwrap();
    let lib = pipeline.graph.get(pipeline.graph.find("q.bst:lib.bst").unwrap());
    // The conditional resolved against qproject's own options, not the
    // toplevel's (which has no `fast` option at all).
    assert_eq!(lib.variables.get("speed"), Some("fast"));
    assert_eq!(lib.project_name, "qproject");
    assert!(lib.strict_key.is_some());

    let report = session.stream.build(&pipeline).unwrap();
    assert!(report.success, "{:?}", report.tasks);
}

#[test]
fn junctions_may_override_subproject_options() {
    let session = TestSession::new();
    let project = TestProject::new("name: toplevel\nmin-version: 2.0\n");
    let sub = write_subproject(
        project.path(),
        "q",
        "name: qproject\nmin-version: 2.0\n\
         options:\n  fast:\n    type: bool\n    default: true\n",
    );
    let libfiles = project.write_files("lib", &[("lib.txt", "library\n")]);
    write_sub_element(
        &sub,
        "lib.bst",
        &format!(
            "kind: import\nsources:\n- kind: dir\n  path: {}\n  ref: l1\n\
             variables:\n  speed: slow\n\
             (?):\n- fast:\n    variables:\n      speed: fast\n",
            libfiles.display()
        ),
    );
    project.write_element(
        "q.bst",
        &junction_element(&sub, "config:\n  options:\n    fast: 'false'\n"),
    );
    project.write_element("app.bst", "kind: manual\nbuild-depends:\n- q.bst:lib.bst\n");

    let pipeline = session.stream.load(project.path(), &["app.bst"]).unwrap();
    let lib = pipeline.graph.get(pipeline.graph.find("q.bst:lib.bst").unwrap());
    assert_eq!(lib.variables.get("speed"), Some("slow"));
}

fn duplicate_project(declare_duplicates: bool) -> (TestProject, std::path::PathBuf) {
    let conf = if declare_duplicates {
        "name: toplevel\nmin-version: 2.0\njunctions:\n  duplicates:\n  - qproject\n"
    } else {
        "name: toplevel\nmin-version: 2.0\n"
    };
    let project = TestProject::new(conf);
    let sub = write_subproject(project.path(), "q", "name: qproject\nmin-version: 2.0\n");
    let libfiles = project.write_files("lib", &[("lib.txt", "library\n")]);
    write_sub_element(
        &sub,
        "lib.bst",
        &format!(
            "kind: import\nsources:\n- kind: dir\n  path: {}\n  ref: l1\n",
            libfiles.display()
        ),
    );
    project.write_element("j1.bst", &junction_element(&sub, ""));
    project.write_element("j2.bst", &junction_element(&sub, ""));
    project.write_element(
        "app.bst",
        "kind: manual\nbuild-depends:\n- j1.bst:lib.bst\n- j2.bst:lib.bst\n",
    );
    (project, sub)
}

#[test]
fn conflicting_junctions_are_fatal_unless_declared() {
    let session = TestSession::new();
    let (project, _sub) = duplicate_project(false);
    let err = session.stream.load(project.path(), &["app.bst"]).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("qproject"), "{message}");
    assert!(message.contains("duplicates"), "{message}");
}

#[test]
fn declared_duplicates_coexist_and_build_once() {
    let session = TestSession::new();
    let (project, _sub) = duplicate_project(true);
    let pipeline = session.stream.load(project.path(), &["app.bst"]).unwrap();

    let via_j1 = pipeline.graph.get(pipeline.graph.find("j1.bst:lib.bst").unwrap());
    let via_j2 = pipeline.graph.get(pipeline.graph.find("j2.bst:lib.bst").unwrap());
    // Two load instances of the same element share the same strong key.
    assert_eq!(via_j1.strict_key, via_j2.strict_key);

    let report = session.stream.build(&pipeline).unwrap();
    assert!(report.success, "{:?}", report.tasks);
    let lib_builds: Vec<TaskState> = report
        .tasks
        .iter()
        .filter(|t| t.kind == TaskKind::Build && t.element_name.ends_with(":lib.bst"))
        .map(|t| t.state)
        .collect();
    assert_eq!(lib_builds.len(), 2);
    assert_eq!(lib_builds.iter().filter(|s| **s == TaskState::Done).count(), 1);
    assert_eq!(lib_builds.iter().filter(|s| **s == TaskState::Skipped).count(), 1);
}

#[test]
fn links_forward_to_junctioned_elements() {
    let session = TestSession::new();
    let project = TestProject::new("name: toplevel\nmin-version: 2.0\n");
    let sub = write_subproject(project.path(), "q", "name: qproject\nmin-version: 2.0\n");
    let libfiles = project.write_files("lib", &[("lib.txt", "library\n")]);
    write_sub_element(
        &sub,
        "lib.bst",
        &format!(
            "kind: import\nsources:\n- kind: dir\n  path: {}\n  ref: l1\n",
            libfiles.display()
        ),
    );
    project.write_element("q.bst", &junction_element(&sub, ""));
    project.write_element(
        "lib-link.bst",
        "kind: link\nconfig:\n  target:\n    junction: q.bst\n    filename: lib.bst\n",
    );
    project.write_element(
        "app.bst",
        "kind: manual\nbuild-depends:\n- lib-link.bst\n- q.bst:lib.bst\n",
    );

    let pipeline = session.stream.load(project.path(), &["app.bst"]).unwrap();
    // The link resolved to the same element instance, not a copy.
    let app = pipeline.graph.get(pipeline.graph.find("app.bst").unwrap());
    assert_eq!(app.dependencies.len(), 2);
    assert_eq!(app.dependencies[0].target, app.dependencies[1].target);
}

#[test]
fn depending_on_a_junction_is_an_error() {
    let session = TestSession::new();
    let project = TestProject::new("name: toplevel\nmin-version: 2.0\n");
    let sub = write_subproject(project.path(), "q", "name: qproject\nmin-version: 2.0\n");
    project.write_element("q.bst", &junction_element(&sub, ""));
    project.write_element("app.bst", "kind: manual\nbuild-depends:\n- q.bst\n");
    let err = session.stream.load(project.path(), &["app.bst"]).unwrap_err();
    assert!(err.to_string().contains("junction"), "{err}");
}

#[test]
fn includes_cross_junctions_in_the_declaring_option_context() {
    let session = TestSession::new();
    let project = TestProject::new("name: toplevel\nmin-version: 2.0\n");
    let sub = write_subproject(
        project.path(),
        "q",
        "name: qproject\nmin-version: 2.0\n\
         options:\n  flavour:\n    type: enum\n    values: [vanilla, spicy]\n    default: spicy\n",
    );
    fs::write(
        sub.join("fragment.yml"),
        "variables:\n  taste: plain\n(?):\n- flavour == 'spicy':\n    variables:\n      taste: spicy\n",
    )
    .unwrap();
    project.write_element("q.bst", &junction_element(&sub, ""));
    project.write_element("app.bst", "kind: manual\n(@): q.bst:fragment.yml\n");

    let pipeline = session.stream.load(project.path(), &["app.bst"]).unwrap();
    let app = pipeline.graph.get(pipeline.graph.find("app.bst").unwrap());
    // The fragment's conditional saw qproject's options.
    assert_eq!(app.variables.get("taste"), Some("spicy"));
}

#[test]
fn junction_declaring_dependencies_is_rejected() {
    let session = TestSession::new();
    let project = TestProject::new("name: toplevel\nmin-version: 2.0\n");
    let sub = write_subproject(project.path(), "q", "name: qproject\nmin-version: 2.0\n");
    project.write_element(
        "q.bst",
        &format!(
            "kind: junction\nsources:\n- kind: dir\n  path: {}\ndepends:\n- other.bst\n",
            sub.display()
        ),
    );
    project.write_element("app.bst", "kind: manual\nbuild-depends:\n- q.bst:lib.bst\n");
    let err = session.stream.load(project.path(), &["app.bst"]).unwrap_err();
    assert!(err.to_string().contains("dependencies"), "{err}");
}
