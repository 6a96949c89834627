//! dynsql core
//!
//! Core domain model with stable, versioned types.
//! Never rename diagnostic codes - they are part of the public API.

pub mod diagnostic;
pub mod report;
pub mod config;

pub use diagnostic::{Diagnostic, DiagnosticCode, Severity, Location};
pub use report::{Report, ReportVersion, ReportSummary, ReportSubstitution, fingerprint};
pub use config::{Config, ConfigError, CONFIG_FILE_NAME, DEFAULT_PROCEDURE, BindingPolicy, ResolutionConfig, OutputConfig, OutputFormat};
