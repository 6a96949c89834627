//! Resolution pipeline
//!
//! Sequences the stages for one script: parse-error check, variable table
//! and call location, parameter binding, inner-query resolution.

use dynsql_core::{
    Diagnostic, DiagnosticCode, Location, Report, ReportSubstitution, ResolutionConfig, Severity,
};
use dynsql_sql::{ParsedScript, SqlParser};
use std::fmt;
use std::path::Path;

use crate::binder::ParameterBinder;
use crate::calls::{DynamicCall, DynamicCallLocator};
use crate::error::EngineError;
use crate::resolver::{InnerQuery, InnerQueryResolver, ResolvedQuery};
use crate::variables::VariableTable;

/// What a run produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// The inner query text as written
    #[default]
    Query,

    /// The inner query with every reference substituted
    Resolved,
}

impl OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::Query => "query",
            OutputMode::Resolved => "resolved",
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub mode: OutputMode,

    /// The call that was resolved
    pub call: DynamicCall,

    /// Inner query text before substitution
    pub inner_query: String,

    /// Present in [`OutputMode::Resolved`]
    pub resolved: Option<ResolvedQuery>,

    /// Warnings collected along the way
    pub diagnostics: Vec<Diagnostic>,
}

impl Resolution {
    /// The text to print for the selected mode
    pub fn output(&self) -> &str {
        match &self.resolved {
            Some(resolved) => &resolved.text,
            None => &self.inner_query,
        }
    }

    pub fn has_warnings(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity == Severity::Warn)
    }

    /// Build the JSON report for this run
    pub fn to_report(&self, script: Option<&Path>) -> Report {
        let mut report = Report::new(self.mode.as_str());
        if let Some(path) = script {
            report = report.with_script(path.display().to_string());
        }

        report.call = Some(self.call.text.clone());
        report.inner_query = Some(self.inner_query.clone());

        if let Some(resolved) = &self.resolved {
            report.set_resolved_query(resolved.text.clone());
            for substitution in &resolved.substitutions {
                report.add_substitution(ReportSubstitution {
                    name: substitution.site.name.clone(),
                    offset: substitution.site.offset,
                    length: substitution.site.length,
                    replacement: substitution.replacement.clone(),
                });
            }
        }

        for diag in &self.diagnostics {
            report.add_diagnostic(diag.clone());
        }

        report
    }
}

/// Resolves the first dynamic call of a script
pub struct DynamicSqlEngine {
    config: ResolutionConfig,
    parser: SqlParser,
}

impl DynamicSqlEngine {
    pub fn new(config: ResolutionConfig) -> Self {
        Self {
            config,
            parser: SqlParser::new(),
        }
    }

    /// Parse `sql` and run on it
    pub fn run_text(&self, sql: &str, mode: OutputMode) -> Result<Resolution, EngineError> {
        let parsed = self.parser.parse(sql, None);
        self.run(&parsed, mode)
    }

    pub fn run(&self, parsed: &ParsedScript, mode: OutputMode) -> Result<Resolution, EngineError> {
        if !parsed.is_valid() {
            return Err(EngineError::Parse(parsed.errors.clone()));
        }

        let policy = self.config.binding_policy;
        let table = VariableTable::build(parsed, self.config.include_declarations);
        let mut calls = DynamicCallLocator::new(self.config.procedure.as_str())
            .locate(parsed)
            .into_iter();

        let Some(call) = calls.next() else {
            return Err(EngineError::NoDynamicCall {
                procedure: self.config.procedure.clone(),
            });
        };

        let call_location = location(parsed, call.span.0);
        let mut diagnostics = Vec::new();

        let ignored: Vec<DynamicCall> = calls.collect();
        if let Some(next) = ignored.first() {
            tracing::warn!(ignored = ignored.len(), "only the first dynamic call is resolved");
            diagnostics.push(
                Diagnostic::warning(
                    DiagnosticCode::AdditionalCallsIgnored,
                    format!(
                        "{} more call(s) to {} ignored; only the first is resolved",
                        ignored.len(),
                        self.config.procedure
                    ),
                )
                .with_location(location(parsed, next.span.0)),
            );
        }

        let binder = ParameterBinder::new(&table, policy)
            .with_query_text_policy(self.config.query_text_policy);
        let inner_query = binder.query_text(&call)?;
        tracing::debug!(query = %inner_query, "inner query");

        let resolved = match mode {
            OutputMode::Query => None,
            OutputMode::Resolved => {
                let binding = binder.bind(&call);
                diagnostics.extend(
                    binding
                        .diagnostics
                        .into_iter()
                        .map(|d| d.with_location(call_location.clone())),
                );

                let query = InnerQuery::parse(&self.parser, inner_query.as_str());
                for error in &query.errors {
                    tracing::warn!(error = %error, "inner query did not parse cleanly");
                    diagnostics.push(
                        Diagnostic::warning(
                            DiagnosticCode::SqlParseError,
                            format!("Inner query: {}", error),
                        )
                        .with_location(call_location.clone()),
                    );
                }

                let resolver = InnerQueryResolver::new(&table, &binding.pairs, policy);
                Some(resolver.resolve(&query)?)
            }
        };

        Ok(Resolution {
            mode,
            call,
            inner_query,
            resolved,
            diagnostics,
        })
    }
}

impl Default for DynamicSqlEngine {
    fn default() -> Self {
        Self::new(ResolutionConfig::default())
    }
}

fn location(parsed: &ParsedScript, offset: usize) -> Location {
    let file = parsed
        .file_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<input>".to_string());
    let (line, column) = parsed.tokens.position(offset);
    Location::with_position(file, line, column).at_offset(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynsql_core::BindingPolicy;
    use pretty_assertions::assert_eq;

    const SCRIPT: &str = "SET @p1 = N'SELECT * FROM t WHERE id = @id';\n\
                          SET @p2 = N'@id int';\n\
                          EXEC sp_executesql @p1, @p2, @id = @userId;\n\
                          SET @userId = 42;";

    #[test]
    fn query_mode_returns_inner_query() {
        let resolution = DynamicSqlEngine::default().run_text(SCRIPT, OutputMode::Query).unwrap();

        assert_eq!(resolution.output(), "SELECT * FROM t WHERE id = @id");
        assert!(resolution.resolved.is_none());
    }

    #[test]
    fn resolved_mode_substitutes_values() {
        let resolution = DynamicSqlEngine::default().run_text(SCRIPT, OutputMode::Resolved).unwrap();

        assert_eq!(resolution.output(), "SELECT * FROM t WHERE id = 42");
        assert!(resolution.diagnostics.is_empty());
    }

    #[test]
    fn parse_errors_abort() {
        let result = DynamicSqlEngine::default().run_text("SET @a = ", OutputMode::Query);
        assert!(matches!(result, Err(EngineError::Parse(errors)) if errors.len() == 1));
    }

    #[test]
    fn script_without_call_fails() {
        let result = DynamicSqlEngine::default().run_text("SELECT 1", OutputMode::Query);
        assert_eq!(
            result,
            Err(EngineError::NoDynamicCall { procedure: "sp_executesql".into() })
        );
    }

    #[test]
    fn procedure_name_is_configurable() {
        let config = ResolutionConfig {
            procedure: "run_dynamic".to_string(),
            ..ResolutionConfig::default()
        };
        let resolution = DynamicSqlEngine::new(config)
            .run_text("EXEC dbo.run_dynamic N'SELECT 2'", OutputMode::Resolved)
            .unwrap();

        assert_eq!(resolution.output(), "SELECT 2");
    }

    #[test]
    fn last_policy_uses_latest_assignment() {
        let sql = "SET @v = 1; SET @v = 2; EXEC sp_executesql N'SELECT @x', N'@x int', @x = @v";
        let config = ResolutionConfig {
            binding_policy: BindingPolicy::Last,
            ..ResolutionConfig::default()
        };

        let first = DynamicSqlEngine::default().run_text(sql, OutputMode::Resolved).unwrap();
        let last = DynamicSqlEngine::new(config).run_text(sql, OutputMode::Resolved).unwrap();

        assert_eq!(first.output(), "SELECT 1");
        assert_eq!(last.output(), "SELECT 2");
    }

    #[test]
    fn query_text_follows_its_own_policy() {
        let sql = "SET @q = N'SELECT 1'; SET @q = N'SELECT 2'; EXEC sp_executesql @q";

        let latest = DynamicSqlEngine::default().run_text(sql, OutputMode::Query).unwrap();
        assert_eq!(latest.output(), "SELECT 2");

        let config = ResolutionConfig {
            query_text_policy: BindingPolicy::First,
            ..ResolutionConfig::default()
        };
        let earliest = DynamicSqlEngine::new(config).run_text(sql, OutputMode::Query).unwrap();
        assert_eq!(earliest.output(), "SELECT 1");
    }

    #[test]
    fn report_carries_substitutions_and_fingerprint() {
        let resolution = DynamicSqlEngine::default().run_text(SCRIPT, OutputMode::Resolved).unwrap();
        let report = resolution.to_report(Some(Path::new("script.sql")));

        assert_eq!(report.mode, "resolved");
        assert_eq!(report.script.as_deref(), Some("script.sql"));
        assert_eq!(report.summary.substitutions, 1);
        assert_eq!(report.substitutions[0].replacement, "42");
        assert_eq!(
            report.fingerprint,
            Some(dynsql_core::fingerprint("SELECT * FROM t WHERE id = 42"))
        );
    }
}
