//! Integration tests for graph construction + scheduling with fakes.

use capstan_ci::{GraphBuilder, Scheduler};
use capstan_core::fakes::{FakeExecutor, MemorySecretStore, RecordingObserver};
use capstan_core::version::{BranchPolicy, TagPattern, VersionResolver};
use capstan_core::{
    BuildConfig, BuildContext, BumpLevel, BumpPolicy, CommitId, CommitRange, Version,
};
use std::sync::Arc;
use uuid::Uuid;

const CONFIG: &str = r#"
version:
  tag: "v{version}"
  bump:
    policy: conventional-commits
    strict: true

ci-locks:
  - repo-name: capstan
    branch: main

phases:
  build:
    linux:
      - sh: make build VERSION=${VERSION}
    windows:
      - sh: make build
  test:
    linux:
      - sh: make test
        wait-on-full-previous-phase: false
    windows:
      - sh: make test
  publish:
    linux:
      - sh: make publish ${PUBLISH_VERSION}
        run-on-change: new-version-only
"#;

fn resolve_context(messages: &[&str], last_published: Option<Version>) -> BuildContext {
    let raw: Vec<(CommitId, String)> = messages
        .iter()
        .enumerate()
        .map(|(i, m)| (CommitId::new(format!("{i:040x}")), m.to_string()))
        .collect();
    let range = CommitRange::parse(
        Some(CommitId::new("0".repeat(40))),
        CommitId::new("f".repeat(40)),
        raw,
    );

    let policy = BumpPolicy {
        strict: true,
        ..BumpPolicy::default()
    };
    let resolver = VersionResolver::new(policy, BranchPolicy::unrestricted(), "main");
    let resolved = resolver
        .resolve(Some(Version::new(1, 2, 3)), None, &range)
        .expect("version resolution failed");

    BuildContext {
        build_id: Uuid::new_v4(),
        branch: Some("main".to_string()),
        range,
        resolved,
        tag_pattern: TagPattern::new("v{version}").unwrap(),
        last_published,
        may_publish: true,
        environment: Default::default(),
    }
}

/// Test: a full pipeline run end to end, from version resolution through
/// commit messages to graph construction and parallel execution.
#[tokio::test]
async fn test_full_build_succeeds() {
    let ctx = resolve_context(&["fix: a", "feat: b"], None);
    assert_eq!(ctx.resolved.version, Version::new(1, 3, 0));
    assert_eq!(ctx.resolved.bump, BumpLevel::Minor);

    let config = BuildConfig::load_str(CONFIG).unwrap();
    let graph = Arc::new(GraphBuilder::new(&config, &ctx).build().unwrap());
    assert_eq!(graph.build_locks.len(), 1);

    let executor = Arc::new(FakeExecutor::new());
    let observer = Arc::new(RecordingObserver::new());
    let scheduler = Scheduler::new(executor.clone(), Arc::new(MemorySecretStore::new()))
        .with_observer(observer.clone());

    let result = scheduler.run(graph, &ctx).await.unwrap();
    assert!(result.success);
    assert_eq!(result.phases.len(), 3);
    assert_eq!(result.failed_count(), 0);

    // Substituted version flows into the executed commands.
    let commands = executor.commands();
    assert!(commands.contains(&"make build VERSION=1.3.0".to_string()));
    assert!(commands.contains(&"make publish v1.3.0".to_string()));

    // The build lock wraps the whole run.
    let events = observer.events();
    assert_eq!(events.first().map(String::as_str), Some("build.started 1.3.0"));
    assert!(events.contains(&"lock.acquired capstan/main".to_string()));
    assert!(events.contains(&"lock.released capstan/main".to_string()));
}

/// Test: the same source state builds the same graph twice, the property
/// that makes local and orchestrated runs interchangeable.
#[tokio::test]
async fn test_graph_is_reproducible() {
    let ctx = resolve_context(&["fix: a"], None);
    let config = BuildConfig::load_str(CONFIG).unwrap();

    let first = GraphBuilder::new(&config, &ctx).build().unwrap();
    let second = GraphBuilder::new(&config, &ctx).build().unwrap();
    assert_eq!(first, second);
    assert_eq!(first.config_digest, second.config_digest);
}

/// Test: no bumpable change + already-published version leaves the publish
/// phase entirely NOP while build/test still run.
#[tokio::test]
async fn test_publish_gated_out_without_new_version() {
    let ctx = resolve_context(&["docs: readme"], Some(Version::new(1, 2, 3)));
    assert_eq!(ctx.resolved.bump, BumpLevel::None);
    assert!(!ctx.version_is_new());

    let config = BuildConfig::load_str(CONFIG).unwrap();
    let graph = Arc::new(GraphBuilder::new(&config, &ctx).build().unwrap());

    let executor = Arc::new(FakeExecutor::new());
    let scheduler = Scheduler::new(executor.clone(), Arc::new(MemorySecretStore::new()));
    let result = scheduler.run(graph, &ctx).await.unwrap();

    assert!(result.success);
    let publish = &result.phases[2];
    assert!(publish.variants.iter().all(|v| v.skipped));
    assert!(!executor
        .commands()
        .iter()
        .any(|c| c.starts_with("make publish")));
}

/// Test: a failing build phase keeps test/publish from ever starting, while
/// the sibling variant of the failing phase still finishes.
#[tokio::test]
async fn test_failure_stops_downstream_phases() {
    let ctx = resolve_context(&["fix: a"], None);
    let config = BuildConfig::load_str(CONFIG).unwrap();
    let graph = Arc::new(GraphBuilder::new(&config, &ctx).build().unwrap());

    // `windows` runs `make build` then `make test`; only the publish step
    // contains "publish". Fail anything on the windows variant's build.
    let executor = Arc::new(FakeExecutor::failing_on("build VERSION"));
    let scheduler = Scheduler::new(executor.clone(), Arc::new(MemorySecretStore::new()));
    let result = scheduler.run(graph, &ctx).await.unwrap();

    assert!(!result.success);
    assert!(!result.phases[0].success);
    assert!(result.phases[2].skipped);
    assert!(!executor
        .commands()
        .iter()
        .any(|c| c.starts_with("make publish")));
}
