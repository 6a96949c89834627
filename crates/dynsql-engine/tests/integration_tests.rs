//! End-to-end resolution over SQL fixtures

use dynsql_core::{BindingPolicy, DiagnosticCode, ResolutionConfig};
use dynsql_engine::{DynamicSqlEngine, EngineError, OutputMode, Resolution};
use dynsql_sql::SqlParser;
use pretty_assertions::assert_eq;
use std::path::{Path, PathBuf};

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures").join(name)
}

fn run_with(config: ResolutionConfig, name: &str, mode: OutputMode) -> Result<Resolution, EngineError> {
    let parsed = SqlParser::new().parse_file(&fixture(name)).unwrap();
    DynamicSqlEngine::new(config).run(&parsed, mode)
}

fn run(name: &str, mode: OutputMode) -> Result<Resolution, EngineError> {
    run_with(ResolutionConfig::default(), name, mode)
}

#[test]
fn user_lookup_query_mode() {
    let resolution = run("user_lookup.sql", OutputMode::Query).unwrap();
    assert_eq!(resolution.output(), "SELECT * FROM t WHERE id = @id");
}

#[test]
fn user_lookup_resolved_mode() {
    let resolution = run("user_lookup.sql", OutputMode::Resolved).unwrap();
    assert_eq!(resolution.output(), "SELECT * FROM t WHERE id = 42");
    assert_eq!(
        resolution.call.text,
        "EXEC sp_executesql @p1, @p2, @id = @userId"
    );
}

#[test]
fn unassigned_call_site_variable_fails() {
    let error = run("user_lookup_unbound.sql", OutputMode::Resolved).unwrap_err();

    assert_eq!(error, EngineError::MissingBinding { name: "@userId".into() });
    assert_eq!(error.exit_code(), 5);
}

#[test]
fn query_mode_does_not_need_value_bindings() {
    let resolution = run("user_lookup_unbound.sql", OutputMode::Query).unwrap();
    assert_eq!(resolution.output(), "SELECT * FROM t WHERE id = @id");
}

#[test]
fn session_update_keeps_literal_quotes() {
    let resolution = run("session_update.sql", OutputMode::Resolved).unwrap();

    assert_eq!(
        resolution.output(),
        "UPDATE session SET ss_last_used = '2024-03-18T09:15:00' WHERE ss_sequence = 1187"
    );

    let names: Vec<&str> = resolution
        .resolved
        .as_ref()
        .unwrap()
        .substitutions
        .iter()
        .map(|s| s.site.name.as_str())
        .collect();
    assert_eq!(names, vec!["@LastUsed", "@sequence"]);
}

#[test]
fn calls_inside_try_blocks_resolve_with_declarations() {
    let resolution = run("nested_blocks.sql", OutputMode::Resolved).unwrap();
    assert_eq!(
        resolution.output(),
        "SELECT name, email FROM dbo.users WHERE tenant_id = 7 AND status = N'active' ORDER BY name"
    );
}

#[test]
fn declarations_can_be_excluded() {
    let config = ResolutionConfig {
        include_declarations: false,
        ..ResolutionConfig::default()
    };
    let error = run_with(config, "nested_blocks.sql", OutputMode::Query).unwrap_err();

    assert_eq!(error, EngineError::MissingBinding { name: "@sql".into() });
}

#[test]
fn positional_values_follow_the_signature() {
    let resolution = run("positional_values.sql", OutputMode::Resolved).unwrap();
    assert_eq!(
        resolution.output(),
        "SELECT order_id FROM sales.orders WHERE placed_at >= '2024-01-01' AND placed_at < '2025-01-01'"
    );
    assert!(resolution.diagnostics.is_empty());
}

#[test]
fn binding_policy_selects_assignment() {
    let first = run("reassigned.sql", OutputMode::Resolved).unwrap();
    assert_eq!(first.output(), "SELECT * FROM audit WHERE level = 1");

    let config = ResolutionConfig {
        binding_policy: BindingPolicy::Last,
        ..ResolutionConfig::default()
    };
    let last = run_with(config, "reassigned.sql", OutputMode::Resolved).unwrap();
    assert_eq!(last.output(), "SELECT * FROM audit WHERE level = 3");
}

#[test]
fn assignment_after_unterminated_update_is_bound() {
    let resolution = run("update_without_semicolons.sql", OutputMode::Resolved).unwrap();
    assert_eq!(resolution.output(), "SELECT hits FROM counters WHERE id = 3");
}

#[test]
fn unmodelled_values_are_substituted_as_written() {
    let resolution = run("sequence_values.sql", OutputMode::Resolved).unwrap();
    assert_eq!(
        resolution.output(),
        "INSERT INTO orders (id, fee) VALUES (NEXT VALUE FOR dbo.order_ids, $5.00)"
    );
}

#[test]
fn only_first_call_is_resolved() {
    let resolution = run("multiple_calls.sql", OutputMode::Resolved).unwrap();

    assert_eq!(resolution.output(), "DELETE FROM queue WHERE id = 12");
    assert_eq!(resolution.diagnostics.len(), 1);
    assert_eq!(resolution.diagnostics[0].code, DiagnosticCode::AdditionalCallsIgnored);
    assert_eq!(resolution.diagnostics[0].location.as_ref().unwrap().line, Some(5));
}

#[test]
fn script_without_dynamic_call() {
    let error = run("no_dynamic_call.sql", OutputMode::Query).unwrap_err();
    assert!(matches!(error, EngineError::NoDynamicCall { .. }));
    assert_eq!(error.exit_code(), 3);
}

#[test]
fn syntax_errors_stop_the_run() {
    let error = run("syntax_error.sql", OutputMode::Query).unwrap_err();

    let diagnostics = error.to_diagnostics(Some(&fixture("syntax_error.sql")));
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].code, DiagnosticCode::SqlParseError);
    assert_eq!(error.exit_code(), 2);
}

#[test]
fn report_for_resolved_fixture() {
    let path = fixture("session_update.sql");
    let resolution = run("session_update.sql", OutputMode::Resolved).unwrap();
    let report = resolution.to_report(Some(&path));

    assert_eq!(report.summary.substitutions, 2);
    assert!(!report.has_errors());

    let json = report.to_json().unwrap();
    assert!(json.contains("\"fingerprint\""));
    assert!(json.contains("ss_last_used"));
}
