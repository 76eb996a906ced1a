//! Worker session tests
//!
//! A serial session attaches to an "editor" that is really an axum server,
//! and talks to a shell script standing in for the MCP bridge. The bridge
//! answers every request with the same tool result, whose text is valid
//! editor status JSON and also carries the compile success marker.

#![cfg(unix)]

use axum::{routing::get, Json, Router};
use edharness_common::{CleanupLevel, TestCategory, TestMetadata, TestOutcome, WorkerId};
use edharness_runner::{HarnessConfig, ResyncOutcome, SessionMode, SuiteReport, WorkerSession};
use serde_json::json;
use std::path::{Path, PathBuf};

const BRIDGE: &str = r##"printf '%s %s' "$EDHARNESS_WORKER" "$EDHARNESS_WORKER_PROJECT_PATH" \
  > "$(dirname "$0")/bridge_env.txt"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"{\\"isCompiling\\":false,\\"isRunningTests\\":false,\\"message\\":\\"Compilation completed successfully\\"}"}]}}\n' "$id"
  fi
done
"##;

fn canonical_project(root: &Path) -> PathBuf {
    let project = root.join("Game");
    std::fs::create_dir_all(project.join("Assets")).unwrap();
    std::fs::create_dir_all(project.join("Packages")).unwrap();
    std::fs::create_dir_all(project.join("ProjectSettings")).unwrap();
    std::fs::write(project.join("Assets/Player.cs"), "class Player {}").unwrap();
    std::fs::write(
        project.join("ProjectSettings/ProjectVersion.txt"),
        "m_EditorVersion: 2022.3.50f1\n",
    )
    .unwrap();
    project
}

async fn serve_health() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let router = Router::new().route(
        "/scripts-compile-status",
        get(|| async { Json(json!({"status": "idle", "isCompiling": false})) }),
    );
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    port
}

fn config(root: &Path, port: u16) -> HarnessConfig {
    let bridge = root.join("bridge.sh");
    std::fs::write(&bridge, BRIDGE).unwrap();
    let editor = root.join("editor");
    std::fs::write(&editor, "#!/bin/sh\nexit 0\n").unwrap();

    let mut config = HarnessConfig::default();
    config.project_path = canonical_project(root);
    config.locks_dir = root.join("locks");
    config.editor.executable = Some(editor);
    config.editor.health_request_timeout_ms = 500;
    config.workers.base_port = port - 1;
    config.workers.node_program = format!("/bin/sh {}", bridge.display());
    config.rpc.request_timeout_secs = 10;
    config.resync.idle_poll_interval_ms = 10;
    config.resync.settle_delay_ms = 1;
    config.resync.refresh_retry_delay_ms = 10;
    config
}

#[tokio::test]
async fn test_serial_session_runs_cases_and_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let port = serve_health().await;
    let config = config(dir.path(), port);
    let canonical = config.project_path.clone();
    let worker: WorkerId = "gw1".parse().unwrap();

    let mut session = WorkerSession::setup(config, worker.clone(), SessionMode::Serial)
        .await
        .unwrap();

    let project = session.project_path().to_path_buf();
    assert_eq!(project, dir.path().join("Game.worker_gw1"));
    assert_eq!(session.port(), port);
    assert!(project.join("Assets/Player.cs").is_file());
    assert!(project.join(".harness/settings.json").is_file());
    assert!(session.registration().is_none());
    assert_eq!(session.instance().unwrap().pid, None);
    assert!(session.env().contains(&(
        "EDHARNESS_WORKER_PROJECT_PATH".to_string(),
        project.display().to_string()
    )));

    let mut suite = SuiteReport::new(&worker);

    let passing = TestMetadata::new("test_list_tools_roundtrip");
    let report = session
        .run_case(&passing, |tools| async move {
            tools.list_tools().await?;
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(report.outcome, TestOutcome::Passed);
    assert_eq!(report.applied_level, CleanupLevel::Minimal);
    assert_eq!(report.resync, ResyncOutcome::Clean);
    suite.record(report);

    assert_eq!(
        std::fs::read_to_string(dir.path().join("bridge_env.txt")).unwrap(),
        format!("gw1 {}", project.display())
    );

    let failing = TestMetadata::new("test_compile_errors");
    let report = session
        .run_case(&failing, |_tools| async move { anyhow::bail!("assertion failed") })
        .await
        .unwrap();
    assert_eq!(report.outcome, TestOutcome::Failed);
    assert_eq!(report.applied_level, CleanupLevel::Full);
    assert_eq!(report.resync, ResyncOutcome::Refreshed { refreshes: 1 });
    assert_eq!(report.error.as_deref(), Some("assertion failed"));
    suite.record(report);

    let protocol = TestMetadata::new("test_initialize").with_category(TestCategory::Protocol);
    let report = session
        .run_case(&protocol, |_tools| async move { Ok(()) })
        .await
        .unwrap();
    assert_eq!(report.resync, ResyncOutcome::Skipped);
    suite.record(report);

    suite.finish();
    assert_eq!((suite.passed, suite.failed), (2, 1));

    session.teardown(true).await.unwrap();
    assert!(!project.exists());
    assert!(canonical.join("Assets/Player.cs").is_file());
}
