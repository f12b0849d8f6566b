//! End-to-end pipeline scenarios: building, caching, rebuild propagation,
//! non-strict reuse, overlaps, remote short-circuiting and tracking.

mod common;

use bst_core::scheduler::{TaskKind, TaskState};
use bst_core::{CacheState, SchedulerReport, UserConfig};
use common::{memory_cluster, MemoryRemote, TestProject, TestSession};
use std::sync::Arc;

fn task_state(report: &SchedulerReport, kind: TaskKind, element: &str) -> TaskState {
    report
        .tasks
        .iter()
        .find(|t| t.kind == kind && t.element_name == element)
        .unwrap_or_else(|| panic!("no {kind:?} task for {element}"))
        .state
}

fn import_project() -> TestProject {
    let project = TestProject::new("name: test\nmin-version: 2.0\n");
    let files = project.write_files("hello", &[("hello.txt", "hello world\n")]);
    project.write_element(
        "hello.bst",
        &format!("kind: import\nsources:\n- kind: dir\n  path: {}\n  ref: r1\n", files.display()),
    );
    project
}

#[test]
fn import_element_builds_and_checks_out() {
    let session = TestSession::new();
    let project = import_project();
    let pipeline = session.stream.load(project.path(), &["hello.bst"]).unwrap();

    let before = session.stream.show(&pipeline).unwrap();
    assert_eq!(before[0].state, CacheState::Buildable);

    let report = session.stream.build(&pipeline).unwrap();
    assert!(report.success, "{:?}", report.tasks);
    assert_eq!(task_state(&report, TaskKind::Build, "hello.bst"), TaskState::Done);

    let after = session.stream.show(&pipeline).unwrap();
    assert_eq!(after[0].state, CacheState::Cached);

    let dest = tempfile::tempdir().unwrap();
    let checkout = dest.path().join("out");
    let target = pipeline.graph.find("hello.bst").unwrap();
    session.stream.checkout(&pipeline, target, &checkout, false).unwrap();
    assert_eq!(
        std::fs::read_to_string(checkout.join("hello.txt")).unwrap(),
        "hello world\n"
    );
}

#[test]
fn manual_element_runs_command_groups() {
    let session = TestSession::new();
    let project = TestProject::new("name: test\nmin-version: 2.0\n");
    let files = project.write_files("src", &[("input.txt", "data\n")]);
    project.write_element(
        "app.bst",
        &format!(
            "kind: manual\n\
             sources:\n- kind: dir\n  path: {}\n  ref: r1\n\
             config:\n\
               build-commands:\n  - cp input.txt output.txt\n\
               install-commands:\n\
               - mkdir -p \"%{{install-root}}/usr/share\"\n\
               - cp output.txt \"%{{install-root}}/usr/share/output.txt\"\n",
            files.display()
        ),
    );
    let pipeline = session.stream.load(project.path(), &["app.bst"]).unwrap();
    let report = session.stream.build(&pipeline).unwrap();
    assert!(report.success, "{:?}", report.tasks);

    let element = pipeline.graph.get(pipeline.graph.find("app.bst").unwrap());
    let name = bst_core::ArtifactName {
        project: "test".into(),
        element: "app.bst".into(),
        key: element.strict_key.clone().unwrap(),
    };
    let contents = session.stream.artifact_contents(&name).unwrap();
    assert!(contents.contains(&"/usr/share/output.txt".to_string()), "{contents:?}");
}

#[test]
fn second_build_is_a_cache_hit() {
    let session = TestSession::new();
    let project = import_project();
    let pipeline = session.stream.load(project.path(), &["hello.bst"]).unwrap();
    assert!(session.stream.build(&pipeline).unwrap().success);

    let report = session.stream.build(&pipeline).unwrap();
    assert!(report.success);
    assert_eq!(task_state(&report, TaskKind::Build, "hello.bst"), TaskState::Skipped);
}

fn dep_chain_project(base_ref: &str) -> TestProject {
    let project = TestProject::new("name: test\nmin-version: 2.0\n");
    let files = project.write_files("base", &[("lib.txt", base_ref)]);
    project.write_element(
        "base.bst",
        &format!(
            "kind: import\nsources:\n- kind: dir\n  path: {}\n  ref: {base_ref}\n",
            files.display()
        ),
    );
    project.write_element(
        "app.bst",
        "kind: manual\nbuild-depends:\n- base.bst\n\
         config:\n  install-commands:\n  - mkdir -p \"%{install-root}\"\n  - echo app > \"%{install-root}/app\"\n",
    );
    project
}

#[test]
fn strict_rebuild_propagates_to_reverse_dependencies() {
    let session = TestSession::new();
    let project = dep_chain_project("r1");
    let pipeline = session.stream.load(project.path(), &["app.bst"]).unwrap();
    assert!(session.stream.build(&pipeline).unwrap().success);
    let old_app_key = pipeline
        .graph
        .get(pipeline.graph.find("app.bst").unwrap())
        .strict_key
        .clone()
        .unwrap();

    // A new source ref on the dependency invalidates both artifacts.
    let files = project.write_files("base", &[("lib.txt", "r2")]);
    project.write_element(
        "base.bst",
        &format!(
            "kind: import\nsources:\n- kind: dir\n  path: {}\n  ref: r2\n",
            files.display()
        ),
    );
    let pipeline = session.stream.load(project.path(), &["app.bst"]).unwrap();
    let show = session.stream.show(&pipeline).unwrap();
    let state_of = |name: &str| show.iter().find(|r| r.name == name).unwrap().state;
    assert_eq!(state_of("base.bst"), CacheState::Buildable);
    assert_eq!(state_of("app.bst"), CacheState::Waiting);

    let report = session.stream.build(&pipeline).unwrap();
    assert!(report.success);
    assert_eq!(task_state(&report, TaskKind::Build, "base.bst"), TaskState::Done);
    assert_eq!(task_state(&report, TaskKind::Build, "app.bst"), TaskState::Done);
    let new_app_key = pipeline
        .graph
        .get(pipeline.graph.find("app.bst").unwrap())
        .strict_key
        .clone()
        .unwrap();
    assert_ne!(old_app_key, new_app_key);
}

#[test]
fn non_strict_mode_reuses_by_weak_key() {
    let mut config = UserConfig::default();
    config.projects.insert(
        "test".to_string(),
        bst_core::config::ProjectUserConfig { strict: Some(false), ..Default::default() },
    );
    let session = TestSession::with_config(config);

    let project = dep_chain_project("r1");
    let pipeline = session.stream.load(project.path(), &["app.bst"]).unwrap();
    assert!(session.stream.build(&pipeline).unwrap().success);

    let files = project.write_files("base", &[("lib.txt", "r2")]);
    project.write_element(
        "base.bst",
        &format!(
            "kind: import\nsources:\n- kind: dir\n  path: {}\n  ref: r2\n",
            files.display()
        ),
    );
    let pipeline = session.stream.load(project.path(), &["app.bst"]).unwrap();
    let report = session.stream.build(&pipeline).unwrap();
    assert!(report.success);
    // The dependency rebuilds; the app resolves through its weak key and
    // reuses the existing artifact.
    assert_eq!(task_state(&report, TaskKind::Build, "base.bst"), TaskState::Done);
    assert_eq!(task_state(&report, TaskKind::Build, "app.bst"), TaskState::Skipped);
}

fn overlap_project(whitelist: bool) -> TestProject {
    let project = TestProject::new("name: test\nmin-version: 2.0\n");
    let a = project.write_files("a", &[("usr/bin/foo", "from a\n")]);
    let b = project.write_files("b", &[("usr/bin/foo", "from b\n")]);
    project.write_element(
        "a.bst",
        &format!("kind: import\nsources:\n- kind: dir\n  path: {}\n  ref: a1\n", a.display()),
    );
    let whitelist_yaml = if whitelist {
        "public:\n  bst:\n    overlap-whitelist:\n    - /usr/bin/foo\n"
    } else {
        ""
    };
    project.write_element(
        "b.bst",
        &format!(
            "kind: import\nsources:\n- kind: dir\n  path: {}\n  ref: b1\n{whitelist_yaml}",
            b.display()
        ),
    );
    project.write_element(
        "out.bst",
        "kind: compose\nbuild-depends:\n- a.bst\n- b.bst\nconfig:\n  integrate: false\n",
    );
    project
}

#[test]
fn conflicting_overlap_fails_the_build() {
    let session = TestSession::new();
    let project = overlap_project(false);
    let pipeline = session.stream.load(project.path(), &["out.bst"]).unwrap();
    let report = session.stream.build(&pipeline).unwrap();
    assert!(!report.success);
    let failed: Vec<_> = report.failed().collect();
    assert_eq!(failed.len(), 1);
    let error = failed[0].error.clone().unwrap();
    assert!(error.contains("/usr/bin/foo"), "{error}");
    assert!(error.contains("a.bst") && error.contains("b.bst"), "{error}");
}

#[test]
fn whitelisted_overlap_is_permitted_and_the_newcomer_wins() {
    let session = TestSession::new();
    let project = overlap_project(true);
    let pipeline = session.stream.load(project.path(), &["out.bst"]).unwrap();
    let report = session.stream.build(&pipeline).unwrap();
    assert!(report.success, "{:?}", report.tasks);

    let dest = tempfile::tempdir().unwrap();
    let checkout = dest.path().join("out");
    let target = pipeline.graph.find("out.bst").unwrap();
    session.stream.checkout(&pipeline, target, &checkout, false).unwrap();
    assert_eq!(
        std::fs::read_to_string(checkout.join("usr/bin/foo")).unwrap(),
        "from b\n"
    );
}

#[test]
fn integration_commands_run_before_assembly() {
    let session = TestSession::new();
    let project = TestProject::new("name: test\nmin-version: 2.0\n");
    let files = project.write_files("base", &[("etc/app.conf", "config\n")]);
    project.write_element(
        "base.bst",
        &format!(
            "kind: import\n\
             sources:\n- kind: dir\n  path: {}\n  ref: r1\n\
             public:\n  bst:\n    integration-commands:\n    - touch /buildstream-integrated\n",
            files.display()
        ),
    );
    project.write_element(
        "app.bst",
        "kind: manual\nbuild-depends:\n- base.bst\n\
         config:\n  install-commands:\n  - test -f /buildstream-integrated\n  - mkdir -p \"%{install-root}\"\n  - cp /buildstream-integrated \"%{install-root}/marker\"\n",
    );
    let pipeline = session.stream.load(project.path(), &["app.bst"]).unwrap();
    let report = session.stream.build(&pipeline).unwrap();
    assert!(report.success, "{:?}", report.tasks);
}

#[test]
fn remote_pull_short_circuits_fetch_and_build() {
    let remote = MemoryRemote::new("https://cache.example");
    let project = import_project();

    // First session builds and pushes.
    {
        let session = TestSession::new();
        let mut pipeline = session.stream.load(project.path(), &["hello.bst"]).unwrap();
        pipeline.artifact_remotes = Arc::new(memory_cluster(&remote, true));
        let report = session.stream.build(&pipeline).unwrap();
        assert!(report.success, "{:?}", report.tasks);
        assert_eq!(task_state(&report, TaskKind::Push, "hello.bst"), TaskState::Done);
    }
    assert!(!remote.refs.lock().unwrap().is_empty());

    // A cold cache pulls instead of fetching or building.
    {
        let session = TestSession::new();
        let mut pipeline = session.stream.load(project.path(), &["hello.bst"]).unwrap();
        pipeline.artifact_remotes = Arc::new(memory_cluster(&remote, false));
        let report = session.stream.build(&pipeline).unwrap();
        assert!(report.success, "{:?}", report.tasks);
        assert_eq!(task_state(&report, TaskKind::Pull, "hello.bst"), TaskState::Done);
        assert_eq!(task_state(&report, TaskKind::Fetch, "hello.bst"), TaskState::Skipped);
        assert_eq!(task_state(&report, TaskKind::Build, "hello.bst"), TaskState::Skipped);
        let show = session.stream.show(&pipeline).unwrap();
        assert_eq!(show[0].state, CacheState::Cached);
    }

    // With the remote unreachable the pipeline falls back to fetch + build.
    {
        let mut config = UserConfig::default();
        config.scheduler.network_retries = 0;
        let session = TestSession::with_config(config);
        remote.unreachable.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut pipeline = session.stream.load(project.path(), &["hello.bst"]).unwrap();
        pipeline.artifact_remotes = Arc::new(memory_cluster(&remote, false));
        let report = session.stream.build(&pipeline).unwrap();
        assert!(report.success, "{:?}", report.tasks);
        assert_eq!(task_state(&report, TaskKind::Build, "hello.bst"), TaskState::Done);
    }
}

#[test]
fn tracking_writes_refs_back() {
    let session = TestSession::new();
    let project = TestProject::new("name: test\nmin-version: 2.0\n");
    let files = project.write_files("src", &[("main.c", "int main;\n")]);
    project.write_element(
        "app.bst",
        &format!("kind: import\nsources:\n- kind: dir\n  path: {}\n", files.display()),
    );

    let pipeline = session.stream.load(project.path(), &["app.bst"]).unwrap();
    let show = session.stream.show(&pipeline).unwrap();
    assert_eq!(show[0].state, CacheState::FetchNeeded);

    let tracked = session.stream.track(&pipeline).unwrap();
    assert_eq!(tracked.len(), 1);
    let text = std::fs::read_to_string(project.path().join("elements/app.bst")).unwrap();
    assert!(text.contains("ref:"), "{text}");

    // After re-loading, keys resolve and the element can build.
    let pipeline = session.stream.load(project.path(), &["app.bst"]).unwrap();
    let show = session.stream.show(&pipeline).unwrap();
    assert_eq!(show[0].state, CacheState::Buildable);
    assert!(show[0].strict_key.is_some());
    assert!(session.stream.build(&pipeline).unwrap().success);
}

#[test]
fn failed_builds_record_an_artifact_with_logs() {
    let session = TestSession::new();
    let project = TestProject::new("name: test\nmin-version: 2.0\n");
    project.write_element(
        "broken.bst",
        "kind: manual\nconfig:\n  build-commands:\n  - echo about to fail\n  - false\n",
    );
    let pipeline = session.stream.load(project.path(), &["broken.bst"]).unwrap();
    let report = session.stream.build(&pipeline).unwrap();
    assert!(!report.success);

    let element = pipeline.graph.get(pipeline.graph.find("broken.bst").unwrap());
    let key = element.strict_key.clone().unwrap();
    let proto = session
        .stream
        .context()
        .artifacts
        .lookup("test", "broken.bst", &key)
        .unwrap()
        .expect("failed build is recorded");
    assert!(!proto.build_success);
    assert!(proto.tree.is_none());

    let name = bst_core::ArtifactName { project: "test".into(), element: "broken.bst".into(), key };
    let log = session.stream.artifact_log(&name).unwrap();
    assert!(String::from_utf8_lossy(&log).contains("about to fail"));

    let show = session.stream.show(&pipeline).unwrap();
    assert_eq!(show[0].state, CacheState::Failed);
}

#[test]
fn fetch_populates_the_source_cache() {
    let session = TestSession::new();
    let project = import_project();
    let pipeline = session.stream.load(project.path(), &["hello.bst"]).unwrap();

    let report = session.stream.fetch(&pipeline).unwrap();
    assert!(report.success);
    assert_eq!(task_state(&report, TaskKind::Fetch, "hello.bst"), TaskState::Done);

    // Everything is cached now, a second fetch has nothing to do.
    let report = session.stream.fetch(&pipeline).unwrap();
    assert_eq!(task_state(&report, TaskKind::Fetch, "hello.bst"), TaskState::Skipped);
}

#[test]
fn filter_elements_reduce_one_dependency_to_domains() {
    let session = TestSession::new();
    let project = TestProject::new("name: test\nmin-version: 2.0\n");
    let files = project.write_files(
        "base",
        &[("usr/bin/tool", "#!/bin/sh\n"), ("usr/include/tool.h", "#pragma once\n")],
    );
    project.write_element(
        "base.bst",
        &format!("kind: import\nsources:\n- kind: dir\n  path: {}\n  ref: r1\n", files.display()),
    );
    project.write_element(
        "devel.bst",
        "kind: filter\nbuild-depends:\n- base.bst\nconfig:\n  include:\n  - devel\n",
    );
    let pipeline = session.stream.load(project.path(), &["devel.bst"]).unwrap();
    let report = session.stream.build(&pipeline).unwrap();
    assert!(report.success, "{:?}", report.tasks);

    let element = pipeline.graph.get(pipeline.graph.find("devel.bst").unwrap());
    let name = bst_core::ArtifactName {
        project: "test".into(),
        element: "devel.bst".into(),
        key: element.strict_key.clone().unwrap(),
    };
    let contents = session.stream.artifact_contents(&name).unwrap();
    assert!(contents.contains(&"/usr/include/tool.h".to_string()), "{contents:?}");
    assert!(!contents.iter().any(|p| p.starts_with("/usr/bin")), "{contents:?}");
}

#[test]
fn script_elements_lay_out_dependencies_by_location() {
    let session = TestSession::new();
    let project = TestProject::new("name: test\nmin-version: 2.0\n");
    let files = project.write_files("tools", &[("bin/tool", "#!/bin/sh\n")]);
    project.write_element(
        "tools.bst",
        &format!("kind: import\nsources:\n- kind: dir\n  path: {}\n  ref: t1\n", files.display()),
    );
    project.write_element(
        "run.bst",
        "kind: script\n\
         build-depends:\n- filename: tools.bst\n  config:\n    location: /sysroot\n\
         config:\n  commands:\n  - mkdir -p \"%{install-root}\"\n  - echo done > \"%{install-root}/result\"\n",
    );
    let pipeline = session.stream.load(project.path(), &["run.bst"]).unwrap();
    let report = session.stream.build(&pipeline).unwrap();
    assert!(report.success, "{:?}", report.tasks);

    let element = pipeline.graph.get(pipeline.graph.find("run.bst").unwrap());
    let name = bst_core::ArtifactName {
        project: "test".into(),
        element: "run.bst".into(),
        key: element.strict_key.clone().unwrap(),
    };
    let contents = session.stream.artifact_contents(&name).unwrap();
    assert_eq!(contents, vec!["/result".to_string()]);
}
