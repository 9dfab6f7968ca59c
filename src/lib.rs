//! Provision, reset, and tear down isolated local WordPress installations.
//!
//! Each instance is an independent site (own files, own database, own URL
//! path) under a shared web-server document root. The core is the
//! [`coordinator::Coordinator`]: it sequences the non-atomic external steps
//! of an operation into one logical transaction per instance, with at most
//! one in-flight operation per name and a bounded pool across names.

pub mod archive;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod engine;
pub mod error;
pub mod paths;
pub mod registry;
pub mod validation;
pub mod wp_cli;

pub use config::AppConfig;
pub use coordinator::{BulkReport, Coordinator};
pub use engine::{OperationKind, ProgressEvent, StepPhase};
pub use error::{AppError, ErrorKind, Result};
pub use registry::{Instance, InstanceState, Registry};
