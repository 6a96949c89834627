//! Engine failures

use dynsql_core::{Diagnostic, DiagnosticCode, Location};
use dynsql_sql::ParseError;
use std::path::Path;

/// Reasons a resolution run aborts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Script has {} parse error(s)", .0.len())]
    Parse(Vec<ParseError>),

    #[error("No call to {procedure} found in script")]
    NoDynamicCall { procedure: String },

    #[error("Malformed dynamic call: {reason}")]
    MalformedCall { reason: String },

    /// The inner query uses a variable the call site does not bind
    #[error("Variable {name} at offset {offset} is not bound at the call site")]
    UnresolvedParameter { name: String, offset: usize },

    /// A call-site variable was never assigned in the script
    #[error("Variable {name} is passed to the call but never assigned")]
    MissingBinding { name: String },

    #[error("Variable reference {next} at offset {offset} overlaps {previous}")]
    OverlappingReferences {
        previous: String,
        next: String,
        offset: usize,
    },
}

impl EngineError {
    pub fn code(&self) -> DiagnosticCode {
        match self {
            EngineError::Parse(_) => DiagnosticCode::SqlParseError,
            EngineError::NoDynamicCall { .. } => DiagnosticCode::NoDynamicCall,
            EngineError::MalformedCall { .. } => DiagnosticCode::MalformedCall,
            EngineError::UnresolvedParameter { .. } => DiagnosticCode::UnresolvedParameter,
            EngineError::MissingBinding { .. } => DiagnosticCode::MissingBinding,
            EngineError::OverlappingReferences { .. } => DiagnosticCode::OverlappingReferences,
        }
    }

    /// Process exit code; only malformed calls and overlapping references share one
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Parse(_) => 2,
            EngineError::NoDynamicCall { .. } => 3,
            EngineError::UnresolvedParameter { .. } => 4,
            EngineError::MissingBinding { .. } => 5,
            EngineError::MalformedCall { .. } | EngineError::OverlappingReferences { .. } => 6,
        }
    }

    /// Convert to diagnostics; parse failures yield one per error
    pub fn to_diagnostics(&self, file_path: Option<&Path>) -> Vec<Diagnostic> {
        if let EngineError::Parse(errors) = self {
            return errors.iter().map(|e| e.to_diagnostic(file_path)).collect();
        }

        let mut diag = Diagnostic::error(self.code(), self.to_string());
        match self {
            EngineError::UnresolvedParameter { name, .. } | EngineError::MissingBinding { name } => {
                diag = diag.with_subject(name.clone());
            }
            EngineError::OverlappingReferences { next, .. } => {
                diag = diag.with_subject(next.clone());
            }
            _ => {}
        }

        if let Some(path) = file_path {
            diag = diag.with_location(Location::new(path.display().to_string()));
        }

        vec![diag]
    }
}
