//! Multi-repo orchestration through the public API: block, unblock, resume.

use warden::core::classifier::KeywordClassifier;
use warden::core::orchestration::RepoState;
use warden::io::config::WardenConfig;
use warden::io::init::WardenPaths;
use warden::io::store::FileStore;
use warden::orchestrate::{
    EventKind, OrchestrationRequest, orchestration_events, orchestration_status, run_orchestration,
    unblock,
};
use warden::test_support::{
    RecordingSleeper, RepoWorkspace, RoutedWorker, complete, failure, progress, repo,
};

#[test]
fn diamond_graph_recovers_after_unblock() {
    let workspace = RepoWorkspace::new(&[
        repo("base", &[]),
        repo("left", &["base"]),
        repo("right", &["base"]),
        repo("top", &["left", "right"]),
    ])
    .expect("workspace");
    let config = WardenConfig::default();
    let request = OrchestrationRequest {
        root: workspace.root(),
        repo_config: workspace.config_path(),
        task: "Upgrade the toolchain.",
        config: &config,
        fresh: false,
    };

    // `left` hits a permission wall, which halts its job immediately.
    let first = RoutedWorker::new()
        .route(workspace.repo_dir("base"), vec![complete(3)])
        .route(
            workspace.repo_dir("left"),
            vec![failure("Permission denied: Bash(git push)")],
        )
        .route(workspace.repo_dir("right"), vec![progress(1), complete(1)]);
    let report = run_orchestration(
        &request,
        &first,
        &KeywordClassifier,
        &RecordingSleeper::default(),
        |_| {},
    )
    .expect("first run");

    assert_eq!(report.order, vec!["base", "left", "right", "top"]);
    let left = report.state.repo("left").expect("left");
    assert_eq!(left.status, RepoState::Blocked);
    assert!(left.block_reason.as_deref().unwrap_or("").contains("permission_denied"));
    assert_eq!(report.state.repo("right").expect("right").status, RepoState::Completed);
    assert_eq!(report.waiting(), vec!["top"]);
    assert_eq!(first.calls(&workspace.repo_dir("top")), 0);

    unblock(workspace.root(), "left", &config).expect("unblock");

    let second = RoutedWorker::new()
        .route(workspace.repo_dir("left"), vec![complete(2)])
        .route(workspace.repo_dir("top"), vec![complete(1)]);
    let report = run_orchestration(
        &request,
        &second,
        &KeywordClassifier,
        &RecordingSleeper::default(),
        |_| {},
    )
    .expect("second run");

    assert!(report.all_completed());
    assert_eq!(report.state.completed_repos, vec!["base", "right", "left", "top"]);
    assert_eq!(second.calls(&workspace.repo_dir("base")), 0);

    let store = FileStore::for_paths(&WardenPaths::new(workspace.root()));
    let persisted = orchestration_status(&store).expect("status").expect("state");
    assert!(!persisted.active);
    let kinds: Vec<EventKind> = orchestration_events(&store)
        .expect("events")
        .into_iter()
        .map(|event| event.event)
        .collect();
    assert!(kinds.contains(&EventKind::RepoUnblocked));
    assert_eq!(kinds.iter().filter(|kind| **kind == EventKind::Finished).count(), 2);
}

#[test]
fn fresh_run_discards_previous_progress() {
    let workspace =
        RepoWorkspace::new(&[repo("solo", &[]), repo("next", &["solo"])]).expect("workspace");
    let config = WardenConfig::default();
    let mut request = OrchestrationRequest {
        root: workspace.root(),
        repo_config: workspace.config_path(),
        task: "Tidy up.",
        config: &config,
        fresh: false,
    };

    let first = RoutedWorker::new().route(
        workspace.repo_dir("solo"),
        vec![failure("Permission denied: write to /etc")],
    );
    run_orchestration(&request, &first, &KeywordClassifier, &RecordingSleeper::default(), |_| {})
        .expect("first run");

    request.fresh = true;
    let second = RoutedWorker::new()
        .route(workspace.repo_dir("solo"), vec![complete(1)])
        .route(workspace.repo_dir("next"), vec![complete(1)]);
    let mut kinds = Vec::new();
    let report = run_orchestration(
        &request,
        &second,
        &KeywordClassifier,
        &RecordingSleeper::default(),
        |event| kinds.push(event.event),
    )
    .expect("fresh run");

    assert_eq!(kinds.first(), Some(&EventKind::Started));
    assert!(report.all_completed());
}
