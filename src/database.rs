//! Admin-level database operations.
//!
//! Wraps the MySQL admin CLI rather than a wire-protocol driver: the target
//! environment is a local XAMPP-style stack where the client binary is
//! already present and the admin account often has no password. Transport
//! failures (binary missing, server unreachable, timeout) and logical
//! failures (name conflict) both surface as the calling step's error kind,
//! with the distinction preserved in the captured detail text.

use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;

use tokio::process::Command;

use crate::config::{DatabaseConfig, OperationLimits};
use crate::error::{AppError, Result};

pub struct DatabaseAdmin {
    mysql_bin: PathBuf,
    host: String,
    user: String,
    password: String,
    timeout: Duration,
}

impl DatabaseAdmin {
    pub fn new(database: &DatabaseConfig, limits: &OperationLimits) -> Self {
        Self {
            mysql_bin: database.mysql_bin.clone(),
            host: database.host.clone(),
            user: database.admin_user.clone(),
            password: database.admin_password.clone(),
            timeout: Duration::from_secs(limits.command_timeout_secs),
        }
    }

    /// Run a single SQL statement through the admin connection.
    ///
    /// Returns the raw output on spawn success regardless of exit status;
    /// callers decide what a non-zero exit means for their operation.
    async fn run_statement(&self, sql: &str) -> std::result::Result<Output, String> {
        let mut cmd = Command::new(&self.mysql_bin);
        cmd.arg(format!("-u{}", self.user));
        if !self.password.is_empty() {
            cmd.arg(format!("-p{}", self.password));
        }
        cmd.arg(format!("-h{}", self.host))
            .arg("-N")
            .arg("-e")
            .arg(sql);

        let result = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| format!("timed out after {}s", self.timeout.as_secs()))?;
        result.map_err(|e| format!("failed to run {}: {}", self.mysql_bin.display(), e))
    }

    /// Create a database for a new instance.
    ///
    /// No `IF NOT EXISTS`: the registry has already guaranteed uniqueness on
    /// its side, so a conflict here means the server knows a database the
    /// registry does not, and the operation must fail rather than adopt it.
    pub async fn create_database(&self, name: &str) -> Result<()> {
        let sql = format!(
            "CREATE DATABASE `{}` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci;",
            name
        );
        let output = self
            .run_statement(&sql)
            .await
            .map_err(|detail| AppError::database_create(name, detail))?;

        if output.status.success() {
            log::info!("Created database {}", name);
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(AppError::database_create(name, stderr.trim().to_string()))
        }
    }

    /// Drop a database. A database that does not exist counts as success:
    /// the registry may be ahead of server truth after a partial failure.
    pub async fn drop_database(&self, name: &str) -> Result<()> {
        let sql = format!("DROP DATABASE IF EXISTS `{}`;", name);
        let output = self
            .run_statement(&sql)
            .await
            .map_err(|detail| AppError::database_drop(name, detail))?;

        if output.status.success() {
            log::info!("Dropped database {}", name);
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(AppError::database_drop(name, stderr.trim().to_string()))
        }
    }

    pub async fn database_exists(&self, name: &str) -> Result<bool> {
        let sql = format!("SHOW DATABASES LIKE '{}';", name);
        let output = self
            .run_statement(&sql)
            .await
            .map_err(|detail| AppError::database_create(name, detail))?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(stdout.lines().any(|line| line.trim() == name))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(AppError::database_create(name, stderr.trim().to_string()))
        }
    }

    /// Connectivity probe; returns the server version line.
    pub async fn probe(&self) -> Result<String> {
        let output = self
            .run_statement("SELECT VERSION();")
            .await
            .map_err(|detail| AppError::database_create("(probe)", detail))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(AppError::database_create("(probe)", stderr.trim().to_string()))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::DatabaseAdmin;
    use crate::config::{DatabaseConfig, OperationLimits};
    use crate::error::ErrorKind;
    use std::os::unix::fs::PermissionsExt as _;
    use std::path::{Path, PathBuf};

    /// Write an executable shell script standing in for the mysql binary.
    fn stub_mysql(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("mysql");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn admin(mysql_bin: PathBuf, timeout_secs: u64) -> DatabaseAdmin {
        let database = DatabaseConfig {
            mysql_bin,
            ..DatabaseConfig::default()
        };
        let limits = OperationLimits {
            command_timeout_secs: timeout_secs,
            ..OperationLimits::default()
        };
        DatabaseAdmin::new(&database, &limits)
    }

    #[tokio::test]
    async fn create_database_succeeds_on_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let bin = stub_mysql(dir.path(), "exit 0");
        admin(bin, 5).create_database("wp_test_01").await.unwrap();
    }

    #[tokio::test]
    async fn create_database_captures_stderr_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let bin = stub_mysql(
            dir.path(),
            "echo \"ERROR 1007 (HY000): Can't create database 'wp_test_01'; database exists\" >&2; exit 1",
        );
        let err = admin(bin, 5).create_database("wp_test_01").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DatabaseCreateFailed);
        assert!(err
            .payload()
            .get("detail")
            .is_some_and(|d| d.contains("database exists")));
    }

    #[tokio::test]
    async fn drop_database_reports_drop_kind() {
        let dir = tempfile::tempdir().unwrap();
        let bin = stub_mysql(dir.path(), "echo 'ERROR 1045: access denied' >&2; exit 1");
        let err = admin(bin, 5).drop_database("wp_test_01").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DatabaseDropFailed);
    }

    #[tokio::test]
    async fn database_exists_matches_exact_name() {
        let dir = tempfile::tempdir().unwrap();
        let bin = stub_mysql(dir.path(), "echo wp_test_01");
        let admin = admin(bin, 5);
        assert!(admin.database_exists("wp_test_01").await.unwrap());
        assert!(!admin.database_exists("wp_test_02").await.unwrap());
    }

    #[tokio::test]
    async fn slow_commands_hit_the_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let bin = stub_mysql(dir.path(), "sleep 10");
        let err = admin(bin, 1).create_database("wp_test_01").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DatabaseCreateFailed);
        assert!(err
            .payload()
            .get("detail")
            .is_some_and(|d| d.contains("timed out")));
    }

    #[tokio::test]
    async fn missing_binary_is_a_transport_failure() {
        let err = admin(PathBuf::from("/nonexistent/mysql"), 5)
            .probe()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DatabaseCreateFailed);
    }
}
