//! End-to-end orchestration tests.
//!
//! External collaborators are stub shell scripts: the database admin CLI and
//! WP-CLI are configurable paths, so tests exercise the real subprocess path
//! and capture every invocation without MySQL or WordPress installed.

#![cfg(unix)]

use std::io::Write as _;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use wp_provisioner::commands;
use wp_provisioner::coordinator::Coordinator;
use wp_provisioner::error::ErrorKind;
use wp_provisioner::registry::InstanceState;
use wp_provisioner::AppConfig;

struct TestEnv {
    dir: TempDir,
    coordinator: Arc<Coordinator>,
}

impl TestEnv {
    /// Invocation log shared by both stub binaries.
    fn command_log(&self) -> String {
        std::fs::read_to_string(self.dir.path().join("cmd.log")).unwrap_or_default()
    }

    fn content_path(&self, name: &str) -> PathBuf {
        self.dir.path().join("htdocs").join(name)
    }
}

fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
    let log = dir.join("cmd.log");
    let path = dir.join(name);
    let script = format!("#!/bin/sh\necho \"{} $@\" >> {}\n{}\n", name, log.display(), body);
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn write_wordpress_zip(path: &Path) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    writer.add_directory("wordpress/", options).unwrap();
    for (name, content) in [
        ("wordpress/index.php", "<?php // front controller"),
        ("wordpress/wp-settings.php", "<?php // bootstrap"),
        ("wordpress/wp-includes/version.php", "<?php $wp_version = '6.8.2';"),
    ] {
        writer.start_file(name, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap();
}

/// Build a complete environment: docroot, archive, stub binaries, config,
/// coordinator with a fresh registry.
fn setup(cap: usize, mysql_body: &str, wp_body: &str) -> TestEnv {
    setup_with(cap, mysql_body, wp_body, |_| {})
}

fn setup_with(
    cap: usize,
    mysql_body: &str,
    wp_body: &str,
    tweak: impl FnOnce(&mut AppConfig),
) -> TestEnv {
    let dir = tempfile::tempdir().unwrap();

    let docroot = dir.path().join("htdocs");
    std::fs::create_dir_all(&docroot).unwrap();
    let archive = dir.path().join("wordpress.zip");
    write_wordpress_zip(&archive);

    let mut config = AppConfig::default();
    config.server.document_root = docroot;
    config.server.archive_path = archive;
    config.database.mysql_bin = write_stub(dir.path(), "mysql", mysql_body);
    config.site.wp_cli_bin = write_stub(dir.path(), "wp", wp_body);
    config.instances.max_instances = cap;
    config.operations.step_retries = 0;
    config.operations.command_timeout_secs = 30;
    tweak(&mut config);
    config.validate().unwrap();

    let registry_path = dir.path().join("registry.toml");
    let coordinator = Arc::new(Coordinator::new(config, &registry_path).unwrap());
    TestEnv { dir, coordinator }
}

const OK: &str = "exit 0";

/// WP-CLI stub that fails only `core install`.
const WP_INSTALL_FAILS: &str = r#"if [ "$1" = "core" ] && [ "$2" = "install" ]; then
  echo "Error: Database connection refused" >&2
  exit 1
fi
exit 0"#;

#[tokio::test]
async fn create_produces_an_active_instance() {
    let env = setup(5, OK, OK);

    let (instance, warnings) = env
        .coordinator
        .create(Some("wp_test_01".to_string()))
        .await
        .unwrap();

    assert_eq!(instance.state, InstanceState::Active);
    assert_eq!(instance.database_name, "wp_test_01");
    assert_eq!(instance.site_url, "http://localhost/wp_test_01");
    assert!(warnings.is_empty());

    assert!(env.content_path("wp_test_01").join("wp-settings.php").is_file());
    assert_eq!(env.coordinator.list().len(), 1);

    let log = env.command_log();
    assert!(log.contains("CREATE DATABASE `wp_test_01`"));
    assert!(log.contains("config create"));
    assert!(log.contains("core install"));
}

#[tokio::test]
async fn create_auto_assigns_numbered_names() {
    let env = setup(5, OK, OK);

    let (first, _) = env.coordinator.create(None).await.unwrap();
    let (second, _) = env.coordinator.create(None).await.unwrap();

    assert_eq!(first.name, "wp_test_01");
    assert_eq!(second.name, "wp_test_02");
}

#[tokio::test]
async fn create_rejects_taken_and_invalid_names() {
    let env = setup(5, OK, OK);
    env.coordinator
        .create(Some("wp_test_01".to_string()))
        .await
        .unwrap();

    let taken = env
        .coordinator
        .create(Some("wp_test_01".to_string()))
        .await
        .unwrap_err();
    assert_eq!(taken.kind(), ErrorKind::NameTaken);

    let invalid = env
        .coordinator
        .create(Some("unprefixed".to_string()))
        .await
        .unwrap_err();
    assert_eq!(invalid.kind(), ErrorKind::ConfigInvalid);
    // Neither rejection left partial state behind.
    assert_eq!(env.coordinator.list().len(), 1);
}

#[tokio::test]
async fn bulk_create_over_cap_reports_partial_success() {
    let env = setup(3, OK, OK);

    let report = Arc::clone(&env.coordinator).create_bulk(5).await;

    assert_eq!(report.requested, 5);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.failed, 2);
    assert_eq!(env.coordinator.list().len(), 3);

    let cap_errors = report
        .results
        .iter()
        .filter_map(|entry| entry.error.as_ref())
        .filter(|err| err.kind() == ErrorKind::CapReached)
        .count();
    assert_eq!(cap_errors, 2);
}

#[tokio::test]
async fn failed_install_leaves_a_failed_entry_with_diagnostics() {
    let env = setup(5, OK, WP_INSTALL_FAILS);

    let err = env
        .coordinator
        .create(Some("wp_test_01".to_string()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalToolFailed);
    assert_eq!(err.step(), Some("install"));

    let listed = env.coordinator.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].state, InstanceState::Failed);
    assert_eq!(listed[0].failed_step.as_deref(), Some("install"));
    assert!(listed[0]
        .diagnostic
        .as_deref()
        .is_some_and(|d| d.contains("Database connection refused")));
    // Partial artifacts stay in place for inspection.
    assert!(env.content_path("wp_test_01").exists());
}

#[tokio::test]
async fn failed_theme_extra_is_a_warning_not_a_failure() {
    // WP-CLI stub that fails only `theme install`.
    let wp_body = r#"if [ "$1" = "theme" ]; then
  echo "Warning: theme 'astra' not found" >&2
  exit 1
fi
exit 0"#;
    let env = setup_with(5, OK, wp_body, |config| {
        config.site.default_theme = "astra".to_string();
    });

    let (instance, warnings) = env
        .coordinator
        .create(Some("wp_test_01".to_string()))
        .await
        .unwrap();

    assert_eq!(instance.state, InstanceState::Active);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("astra"));
}

#[tokio::test]
async fn verified_listing_flags_drifted_active_entries() {
    // SHOW DATABASES reports wp_test_01; every other database looks absent.
    let mysql_body = r#"case "$*" in
  *"SHOW DATABASES"*) echo wp_test_01;;
esac
exit 0"#;
    let env = setup(5, mysql_body, OK);
    let (instance, _) = env
        .coordinator
        .create(Some("wp_test_01".to_string()))
        .await
        .unwrap();

    let summaries = commands::list_instances_verified(&env.coordinator)
        .await
        .unwrap();
    assert_eq!(summaries[0].drift, None);

    // Simulate outside interference: the content tree disappears while the
    // registry still says Active.
    std::fs::remove_dir_all(&instance.content_path).unwrap();
    let summaries = commands::list_instances_verified(&env.coordinator)
        .await
        .unwrap();
    assert_eq!(summaries[0].drift.as_deref(), Some("content missing"));
}

#[tokio::test]
async fn delete_converges_a_failed_instance() {
    let env = setup(5, OK, WP_INSTALL_FAILS);
    let _ = env.coordinator.create(Some("wp_test_01".to_string())).await;

    env.coordinator.delete("wp_test_01").await.unwrap();

    assert!(env.coordinator.list().is_empty());
    assert!(!env.content_path("wp_test_01").exists());
    assert!(env.command_log().contains("DROP DATABASE IF EXISTS `wp_test_01`"));
}

#[tokio::test]
async fn delete_is_idempotent() {
    let env = setup(5, OK, OK);
    env.coordinator
        .create(Some("wp_test_01".to_string()))
        .await
        .unwrap();

    env.coordinator.delete("wp_test_01").await.unwrap();
    // Second delete observes already-absent artifacts and still succeeds.
    env.coordinator.delete("wp_test_01").await.unwrap();
    assert!(env.coordinator.list().is_empty());
}

#[tokio::test]
async fn reset_rebuilds_an_existing_instance() {
    let env = setup(5, OK, OK);
    let (instance, _) = env
        .coordinator
        .create(Some("wp_test_01".to_string()))
        .await
        .unwrap();

    // Dirty the content tree; reset must rebuild it from the archive.
    std::fs::write(instance.content_path.join("stale-upload.bin"), b"junk").unwrap();

    let (after, _) = env.coordinator.reset("wp_test_01").await.unwrap();
    assert_eq!(after.state, InstanceState::Active);
    assert!(!env.content_path("wp_test_01").join("stale-upload.bin").exists());
    assert!(env.content_path("wp_test_01").join("wp-settings.php").is_file());
    assert_eq!(env.coordinator.list().len(), 1);
}

#[tokio::test]
async fn reset_on_unknown_name_mutates_nothing() {
    let env = setup(5, OK, OK);

    let err = env.coordinator.reset("wp_test_99").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownInstance);
    assert!(env.coordinator.list().is_empty());
    // No external call was made for the rejected operation.
    assert!(env.command_log().is_empty());
}

#[tokio::test]
async fn same_name_operations_conflict_distinct_names_proceed() {
    // Slow database step keeps the first operation in flight.
    let env = setup(5, "sleep 1\nexit 0", OK);

    let first = env.coordinator.create(Some("wp_test_01".to_string()));
    let second = env.coordinator.create(Some("wp_test_01".to_string()));
    let other = env.coordinator.create(Some("wp_test_02".to_string()));
    let (first, second, other) = tokio::join!(first, second, other);
    other.unwrap();

    // Exactly one of the same-name pair wins; the distinct name is unaffected.
    let same_name = [first, second];
    let conflicts = same_name
        .iter()
        .filter(|r| {
            r.as_ref()
                .err()
                .is_some_and(|e| e.kind() == ErrorKind::OperationInProgress)
        })
        .count();
    let successes = same_name.iter().filter(|r| r.is_ok()).count();
    assert_eq!(conflicts, 1);
    assert_eq!(successes, 1);
}

#[tokio::test]
async fn cancel_runs_a_deferred_delete_after_completion() {
    let env = setup(5, "sleep 1\nexit 0", OK);

    let coordinator = Arc::clone(&env.coordinator);
    let create = tokio::spawn(async move {
        coordinator.create(Some("wp_test_01".to_string())).await
    });

    // Let the operation pass its validation phase and enter the slow step.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(env.coordinator.cancel("wp_test_01"));

    // The running operation completes normally...
    create.await.unwrap().unwrap();
    // ...and the deferred cleanup has already removed the instance.
    assert!(env.coordinator.list().is_empty());
    assert!(!env.content_path("wp_test_01").exists());
}

#[tokio::test]
async fn cancel_without_an_operation_in_flight_is_a_no_op() {
    let env = setup(5, OK, OK);
    assert!(!env.coordinator.cancel("wp_test_01"));
}

#[tokio::test]
async fn registry_rebuilds_from_disk_on_startup() {
    let dir;
    let config;
    {
        let env = setup(5, OK, OK);
        env.coordinator
            .create(Some("wp_test_01".to_string()))
            .await
            .unwrap();
        config = env.coordinator.config().clone();
        dir = env.dir;
    }

    let coordinator = Coordinator::new(config, &dir.path().join("registry.toml")).unwrap();
    let listed = coordinator.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "wp_test_01");
    assert_eq!(listed[0].state, InstanceState::Active);
}

#[tokio::test]
async fn delete_partial_keeps_the_registry_entry() {
    // DROP DATABASE fails while everything else works.
    let mysql_body = r#"case "$*" in
  *"DROP DATABASE"*) echo "ERROR 1045: access denied" >&2; exit 1;;
esac
exit 0"#;
    let env = setup(5, mysql_body, OK);
    env.coordinator
        .create(Some("wp_test_01".to_string()))
        .await
        .unwrap();

    let err = env.coordinator.delete("wp_test_01").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeletePartial);
    assert_eq!(
        err.payload().get("sub_step").map(String::as_str),
        Some("drop_database")
    );

    // Entry survives for retry.
    let listed = env.coordinator.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].state, InstanceState::Failed);
}
