//! Resolution report schema (stable v1)
//!
//! This schema is STABLE and VERSIONED.
//! Breaking changes require a new version.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use crate::diagnostic::{Diagnostic, Severity};

/// Report schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportVersion {
    /// Major version (breaking changes)
    pub major: u32,

    /// Minor version (backward-compatible additions)
    pub minor: u32,
}

impl ReportVersion {
    /// Current report schema version
    pub const CURRENT: ReportVersion = ReportVersion { major: 1, minor: 0 };
}

impl std::fmt::Display for ReportVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Summary statistics for a report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    /// Number of errors
    pub errors: usize,

    /// Number of warnings
    pub warnings: usize,

    /// Number of variable references substituted
    pub substitutions: usize,
}

/// One variable reference replaced in the inner query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSubstitution {
    /// Variable name as written in the inner query
    pub name: String,

    /// Byte offset in the inner query
    pub offset: usize,

    /// Byte length of the reference
    pub length: usize,

    /// Text spliced in its place
    pub replacement: String,
}

/// Resolution report (report.json v1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Schema version
    pub version: ReportVersion,

    /// Timestamp (ISO 8601)
    pub timestamp: String,

    /// Script the report was produced from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,

    /// Output mode (`query` or `resolved`)
    pub mode: String,

    /// Source text of the resolved dynamic-execution call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call: Option<String>,

    /// Inner query text before substitution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inner_query: Option<String>,

    /// Inner query with every variable reference substituted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_query: Option<String>,

    /// SHA-256 of the resolved query, for de-duplicating findings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    /// Substitutions in offset order
    pub substitutions: Vec<ReportSubstitution>,

    /// Summary statistics
    pub summary: ReportSummary,

    /// All diagnostics
    pub diagnostics: Vec<Diagnostic>,
}

impl Report {
    /// Create a new empty report
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            version: ReportVersion::CURRENT,
            timestamp: chrono::Utc::now().to_rfc3339(),
            script: None,
            mode: mode.into(),
            call: None,
            inner_query: None,
            resolved_query: None,
            fingerprint: None,
            substitutions: Vec::new(),
            summary: ReportSummary::default(),
            diagnostics: Vec::new(),
        }
    }

    /// Set the script path
    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    /// Record the resolved query and its fingerprint
    pub fn set_resolved_query(&mut self, query: impl Into<String>) {
        let query = query.into();
        self.fingerprint = Some(fingerprint(&query));
        self.resolved_query = Some(query);
    }

    /// Add a substitution
    pub fn add_substitution(&mut self, substitution: ReportSubstitution) {
        self.summary.substitutions += 1;
        self.substitutions.push(substitution);
    }

    /// Add a diagnostic to the report
    pub fn add_diagnostic(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Error => self.summary.errors += 1,
            Severity::Warn => self.summary.warnings += 1,
            Severity::Info => {}
        }

        self.diagnostics.push(diagnostic);
    }

    /// Check if the report has any errors
    pub fn has_errors(&self) -> bool {
        self.summary.errors > 0
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Save to file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        let json = self.to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }
}

/// Hex-encoded SHA-256 of a query text
pub fn fingerprint(query: &str) -> String {
    hex::encode(Sha256::digest(query.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::{Diagnostic, DiagnosticCode};

    #[test]
    fn empty_report() {
        let report = Report::new("query");
        assert_eq!(report.version, ReportVersion::CURRENT);
        assert_eq!(report.summary, ReportSummary::default());
        assert!(!report.has_errors());
    }

    #[test]
    fn report_counts_diagnostics_and_substitutions() {
        let mut report = Report::new("resolved");
        report.add_diagnostic(Diagnostic::error(DiagnosticCode::MissingBinding, "missing"));
        report.add_diagnostic(Diagnostic::warning(DiagnosticCode::SignatureMismatch, "mismatch"));
        report.add_substitution(ReportSubstitution {
            name: "@id".to_string(),
            offset: 27,
            length: 3,
            replacement: "42".to_string(),
        });

        assert_eq!(report.summary.errors, 1);
        assert_eq!(report.summary.warnings, 1);
        assert_eq!(report.summary.substitutions, 1);
        assert!(report.has_errors());
    }

    #[test]
    fn resolved_query_is_fingerprinted() {
        let mut report = Report::new("resolved");
        report.set_resolved_query("SELECT 1");

        let hash = report.fingerprint.clone().unwrap();
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, fingerprint("SELECT 1"));
        assert_ne!(hash, fingerprint("SELECT 2"));
    }

    #[test]
    fn report_serialization_skips_absent_fields() {
        let report = Report::new("query").with_script("a.sql");
        let json = report.to_json().unwrap();
        assert!(json.contains("\"version\""));
        assert!(json.contains("\"a.sql\""));
        assert!(!json.contains("resolved_query"));
    }
}
