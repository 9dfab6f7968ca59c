//! Application error types.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// Application error that can be serialized into operation reports.
#[derive(Debug, Clone)]
pub struct AppError {
    payload: HashMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No instance with the given name is registered
    UnknownInstance,
    /// The name (or a value derived from it) is already registered
    NameTaken,
    /// The configured instance cap is reached
    CapReached,
    /// Another operation on the same instance is in flight
    OperationInProgress,
    /// Configuration is missing or malformed
    ConfigInvalid,
    /// Filesystem operation failed
    FilesystemError,
    /// CREATE DATABASE failed (server conflict or transport failure)
    DatabaseCreateFailed,
    /// DROP DATABASE failed on an existing database
    DatabaseDropFailed,
    /// The site-configuration command exited non-zero or could not run
    ExternalToolFailed,
    /// Deletion removed some artifacts but not all
    DeletePartial,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::UnknownInstance => 1001,
            Self::NameTaken => 1002,
            Self::CapReached => 1003,
            Self::OperationInProgress => 1004,
            Self::ConfigInvalid => 2001,
            Self::FilesystemError => 2002,
            Self::DatabaseCreateFailed => 3001,
            Self::DatabaseDropFailed => 3002,
            Self::ExternalToolFailed => 3003,
            Self::DeletePartial => 4001,
        }
    }

    /// Process exit code for the presentation layer.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigInvalid | Self::NameTaken | Self::UnknownInstance => 2,
            Self::ExternalToolFailed => 3,
            Self::DatabaseCreateFailed | Self::DatabaseDropFailed => 4,
            Self::FilesystemError | Self::DeletePartial => 5,
            Self::OperationInProgress => 6,
            Self::CapReached => 7,
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: HashMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            HashMap::new()
        } else {
            HashMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    pub fn unknown_instance(name: &str) -> Self {
        Self::new(
            ErrorKind::UnknownInstance,
            HashMap::from([("name".to_string(), name.to_string())]),
        )
    }

    pub fn name_taken(name: &str, conflict: &str) -> Self {
        Self::new(
            ErrorKind::NameTaken,
            HashMap::from([
                ("name".to_string(), name.to_string()),
                ("conflict".to_string(), conflict.to_string()),
            ]),
        )
    }

    pub fn cap_reached(cap: usize) -> Self {
        Self::new(
            ErrorKind::CapReached,
            HashMap::from([("cap".to_string(), cap.to_string())]),
        )
    }

    pub fn operation_in_progress(name: &str) -> Self {
        Self::new(
            ErrorKind::OperationInProgress,
            HashMap::from([("name".to_string(), name.to_string())]),
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::ConfigInvalid, message)
    }

    pub fn filesystem(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::FilesystemError, message)
    }

    pub fn database_create(database: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::DatabaseCreateFailed,
            HashMap::from([
                ("database".to_string(), database.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn database_drop(database: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::DatabaseDropFailed,
            HashMap::from([
                ("database".to_string(), database.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn external_tool(exit_code: Option<i32>, stdout: &str, stderr: &str) -> Self {
        let mut payload = HashMap::from([(
            "exit_code".to_string(),
            exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
        )]);
        if !stdout.trim().is_empty() {
            payload.insert("stdout".to_string(), stdout.trim().to_string());
        }
        if !stderr.trim().is_empty() {
            payload.insert("stderr".to_string(), stderr.trim().to_string());
        }
        Self::new(ErrorKind::ExternalToolFailed, payload)
    }

    pub fn external_tool_spawn(detail: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::ExternalToolFailed, detail)
    }

    pub fn delete_partial(name: &str, sub_step: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::DeletePartial,
            HashMap::from([
                ("name".to_string(), name.to_string()),
                ("sub_step".to_string(), sub_step.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn payload(&self) -> &HashMap<String, String> {
        &self.payload
    }

    /// The failing step recorded by an engine, if any.
    pub fn step(&self) -> Option<&str> {
        self.payload.get("step").map(String::as_str)
    }

    /// Attach the step name an engine was executing when this error occurred.
    pub fn with_step(mut self, step: &str) -> Self {
        self.payload.insert("step".to_string(), step.to_string());
        self
    }

    /// Attach the instance name, if no constructor already recorded one.
    pub fn with_name(mut self, name: &str) -> Self {
        self.payload
            .entry("name".to_string())
            .or_insert_with(|| name.to_string());
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let mut pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            pairs.sort();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 3)?;
        s.serialize_field("kind", &self.kind)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::filesystem(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::filesystem(err.to_string())
    }
}

impl From<walkdir::Error> for AppError {
    fn from(err: walkdir::Error) -> Self {
        Self::filesystem(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::{AppError, ErrorKind};

    #[test]
    fn step_round_trips_through_payload() {
        let err = AppError::filesystem("disk full").with_step("extract");
        assert_eq!(err.step(), Some("extract"));
        assert_eq!(err.kind(), ErrorKind::FilesystemError);
    }

    #[test]
    fn external_tool_drops_empty_streams() {
        let err = AppError::external_tool(Some(1), "", "boom");
        assert_eq!(err.payload().get("exit_code").map(String::as_str), Some("1"));
        assert_eq!(err.payload().get("stderr").map(String::as_str), Some("boom"));
        assert!(!err.payload().contains_key("stdout"));
    }

    #[test]
    fn exit_codes_cover_the_surface_contract() {
        assert_eq!(ErrorKind::ConfigInvalid.exit_code(), 2);
        assert_eq!(ErrorKind::ExternalToolFailed.exit_code(), 3);
        assert_eq!(ErrorKind::DatabaseCreateFailed.exit_code(), 4);
        assert_eq!(ErrorKind::FilesystemError.exit_code(), 5);
        assert_eq!(ErrorKind::OperationInProgress.exit_code(), 6);
        assert_eq!(ErrorKind::CapReached.exit_code(), 7);
    }
}
