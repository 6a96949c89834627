use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use walkdir::WalkDir;

use dynsql_core::{BindingPolicy, Config, Diagnostic, OutputFormat, Report, Severity, CONFIG_FILE_NAME};
use dynsql_engine::{DynamicSqlEngine, EngineError, OutputMode, Resolution};
use dynsql_sql::SqlParser;

/// dynsql - Recover dynamic SQL passed to sp_executesql
#[derive(Parser)]
#[command(name = "dynsql")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: dynsql.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract the inner query of a script's dynamic call
    Resolve {
        /// SQL script to read
        script: PathBuf,

        /// Print the query as written or with values substituted
        #[arg(short, long, value_enum, default_value_t = ModeArg::Query)]
        mode: ModeArg,

        /// Output format (overrides config)
        #[arg(short, long, value_enum)]
        format: Option<FormatArg>,

        /// Write the query or report to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Which assignment wins for reassigned variables (overrides config)
        #[arg(long, value_enum)]
        binding_policy: Option<PolicyArg>,

        /// Which assignment of the query-text variable wins (overrides config)
        #[arg(long, value_enum)]
        query_text_policy: Option<PolicyArg>,
    },

    /// Resolve every .sql file under a directory
    Scan {
        /// Directory to walk
        dir: PathBuf,

        /// Which assignment wins for reassigned variables (overrides config)
        #[arg(long, value_enum)]
        binding_policy: Option<PolicyArg>,

        /// Which assignment of the query-text variable wins (overrides config)
        #[arg(long, value_enum)]
        query_text_policy: Option<PolicyArg>,
    },

    /// Write a default dynsql.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Inner query as written
    Query,
    /// Inner query with every variable substituted
    Resolved,
}

impl From<ModeArg> for OutputMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Query => OutputMode::Query,
            ModeArg::Resolved => OutputMode::Resolved,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Text,
    Json,
}

impl From<FormatArg> for OutputFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Text => OutputFormat::Text,
            FormatArg::Json => OutputFormat::Json,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    First,
    Last,
}

impl From<PolicyArg> for BindingPolicy {
    fn from(policy: PolicyArg) -> Self {
        match policy {
            PolicyArg::First => BindingPolicy::First,
            PolicyArg::Last => BindingPolicy::Last,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            1
        }
    };

    std::process::exit(code);
}

/// Log to stderr; RUST_LOG wins over --verbose
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Resolve {
            script,
            mode,
            format,
            output,
            binding_policy,
            query_text_policy,
        } => {
            let mut config = load_config(cli.config.as_deref(), cli.verbose)?;
            apply_policies(&mut config, binding_policy, query_text_policy);
            let format = format.map(Into::into).unwrap_or(config.output.format);

            resolve_command(&config, &script, mode.into(), format, output.as_deref(), cli.verbose)
        }
        Commands::Scan {
            dir,
            binding_policy,
            query_text_policy,
        } => {
            let mut config = load_config(cli.config.as_deref(), cli.verbose)?;
            apply_policies(&mut config, binding_policy, query_text_policy);

            scan_command(&config, &dir, cli.verbose)
        }
        Commands::Init { force } => init_command(cli.config.as_deref(), force),
    }
}

fn apply_policies(config: &mut Config, binding: Option<PolicyArg>, query_text: Option<PolicyArg>) {
    if let Some(policy) = binding {
        config.resolution.binding_policy = policy.into();
    }
    if let Some(policy) = query_text {
        config.resolution.query_text_policy = policy.into();
    }
}

/// Explicit path, then dynsql.toml in the working directory, then defaults
fn load_config(path: Option<&Path>, verbose: bool) -> Result<Config> {
    let config = if let Some(config_path) = path {
        Config::from_file(config_path)
            .with_context(|| format!("Failed to load config {}", config_path.display()))?
    } else if Path::new(CONFIG_FILE_NAME).exists() {
        Config::from_file(Path::new(CONFIG_FILE_NAME))
            .with_context(|| format!("Failed to load config {}", CONFIG_FILE_NAME))?
    } else {
        if verbose {
            eprintln!("{}", "No config file found, using defaults".yellow());
        }
        Config::default()
    };

    if verbose {
        eprintln!(
            "{} procedure: {}, binding policy: {}, query text policy: {}",
            "Using".cyan(),
            config.resolution.procedure,
            config.resolution.binding_policy,
            config.resolution.query_text_policy
        );
    }

    Ok(config)
}

/// Resolve command - print the inner query of one script
fn resolve_command(
    config: &Config,
    script: &Path,
    mode: OutputMode,
    format: OutputFormat,
    output: Option<&Path>,
    verbose: bool,
) -> Result<i32> {
    let parsed = SqlParser::new().parse_file(script)?;

    if verbose {
        eprintln!(
            "{} {} ({} statements)",
            "Parsed".cyan(),
            script.display(),
            parsed.statement_count()
        );
    }

    if parsed.is_valid() && format == OutputFormat::Text {
        println!("{}", "✓ Script parsed successfully, no errors found".green());
    }

    let engine = DynamicSqlEngine::new(config.resolution.clone());
    match engine.run(&parsed, mode) {
        Ok(resolution) => {
            match format {
                OutputFormat::Text => print_resolution(&resolution, output)?,
                OutputFormat::Json => write_report(&resolution.to_report(Some(script)), output)?,
            }
            Ok(0)
        }
        Err(error) => {
            let diagnostics = error.to_diagnostics(Some(script));
            for diag in &diagnostics {
                eprint_diagnostic(diag);
            }

            if format == OutputFormat::Json {
                let mut report = Report::new(mode.as_str()).with_script(script.display().to_string());
                for diag in diagnostics {
                    report.add_diagnostic(diag);
                }
                write_report(&report, output)?;
            }

            Ok(error.exit_code())
        }
    }
}

fn print_resolution(resolution: &Resolution, output: Option<&Path>) -> Result<()> {
    for diag in &resolution.diagnostics {
        eprint_diagnostic(diag);
    }

    println!("{}", "Dynamic call:".bold());
    println!("   {}", resolution.call.text);

    let label = match resolution.mode {
        OutputMode::Query => "Inner query:",
        OutputMode::Resolved => "Substituted query:",
    };

    match output {
        Some(path) => {
            std::fs::write(path, format!("{}\n", resolution.output()))
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("{} {} {}", label.bold(), "written to".green(), path.display());
        }
        None => {
            println!("{}", label.bold());
            println!("   {}", resolution.output());
        }
    }

    Ok(())
}

fn write_report(report: &Report, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            report
                .save_to_file(path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("{} {}", "Report saved to:".green(), path.display());
        }
        None => println!("{}", report.to_json()?),
    }
    Ok(())
}

fn eprint_diagnostic(diag: &Diagnostic) {
    let severity_str = match diag.severity {
        Severity::Error => "ERROR".red().bold(),
        Severity::Warn => "WARN".yellow().bold(),
        Severity::Info => "INFO".cyan(),
    };

    eprintln!("  [{}] {}: {}", severity_str, diag.code, diag.message);
    if let Some(loc) = &diag.location {
        eprintln!("    at {}", loc);
    }
}

/// Scan command - resolve every script under a directory
fn scan_command(config: &Config, dir: &Path, verbose: bool) -> Result<i32> {
    if !dir.is_dir() {
        anyhow::bail!("{} is not a directory", dir.display());
    }

    let parser = SqlParser::new();
    let engine = DynamicSqlEngine::new(config.resolution.clone());

    let mut resolved = 0;
    let mut with_warnings = 0;
    let mut without_call = 0;
    let mut failed = 0;
    let mut exit_code = 0;

    for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                println!("  {} {}", "✗".red(), e);
                failed += 1;
                exit_code = exit_code.max(1);
                continue;
            }
        };

        let is_script = entry.file_type().is_file()
            && entry
                .path()
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"));
        if !is_script {
            continue;
        }

        let path = entry.path();
        tracing::debug!(path = %path.display(), "scanning script");

        let parsed = match parser.parse_file(path) {
            Ok(parsed) => parsed,
            Err(e) => {
                println!("  {} {}", "✗".red(), e);
                failed += 1;
                exit_code = exit_code.max(1);
                continue;
            }
        };

        match engine.run(&parsed, OutputMode::Resolved) {
            Ok(resolution) => {
                resolved += 1;
                if resolution.has_warnings() {
                    with_warnings += 1;
                }
                println!("  {} {}", "✓".green(), path.display());
                if verbose {
                    println!("      {}", resolution.output());
                }
                for diag in &resolution.diagnostics {
                    println!("      {} {}", "warning:".yellow(), diag.message);
                }
            }
            Err(EngineError::NoDynamicCall { .. }) => {
                without_call += 1;
                println!("  {} {} {}", "-".dimmed(), path.display(), "(no dynamic call)".dimmed());
            }
            Err(error) => {
                failed += 1;
                exit_code = exit_code.max(error.exit_code());
                println!("  {} {}: {}", "✗".red(), path.display(), error);
            }
        }
    }

    println!();
    println!("{}", "Summary:".bold());
    println!("  Resolved:        {}", resolved.to_string().green());
    if with_warnings > 0 {
        println!("  With warnings:   {}", with_warnings.to_string().yellow());
    }
    println!("  No dynamic call: {}", without_call);
    if failed > 0 {
        println!("  Failed:          {}", failed.to_string().red().bold());
    } else {
        println!("  Failed:          {}", failed.to_string().green());
    }

    Ok(exit_code)
}

/// Init command - write the default config file
fn init_command(path: Option<&Path>, force: bool) -> Result<i32> {
    let path = path.unwrap_or(Path::new(CONFIG_FILE_NAME));

    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    Config::default().save_to_file(path)?;
    println!("{} {}", "Wrote".green(), path.display());

    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = "SET @p1 = N'SELECT * FROM t WHERE id = @id';\n\
                          SET @p2 = N'@id int';\n\
                          EXEC sp_executesql @p1, @p2, @id = @userId;\n\
                          SET @userId = 42;\n";

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn init_writes_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        assert_eq!(init_command(Some(&path), false).unwrap(), 0);
        assert_eq!(Config::from_file(&path).unwrap(), Config::default());
        assert!(init_command(Some(&path), false).is_err());
        assert_eq!(init_command(Some(&path), true).unwrap(), 0);
    }

    #[test]
    fn resolve_writes_query_to_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("call.sql");
        let output = dir.path().join("query.sql");
        std::fs::write(&script, SCRIPT).unwrap();

        let code = resolve_command(
            &Config::default(),
            &script,
            OutputMode::Resolved,
            OutputFormat::Text,
            Some(&output),
            false,
        )
        .unwrap();

        assert_eq!(code, 0);
        assert_eq!(
            std::fs::read_to_string(&output).unwrap(),
            "SELECT * FROM t WHERE id = 42\n"
        );
    }

    #[test]
    fn resolve_failure_maps_to_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("call.sql");
        let report = dir.path().join("report.json");
        std::fs::write(&script, SCRIPT.replace("SET @userId = 42;\n", "")).unwrap();

        let code = resolve_command(
            &Config::default(),
            &script,
            OutputMode::Resolved,
            OutputFormat::Json,
            Some(&report),
            false,
        )
        .unwrap();

        assert_eq!(code, 5);
        let json = std::fs::read_to_string(&report).unwrap();
        assert!(json.contains("MISSING_BINDING"));
    }

    #[test]
    fn scan_reports_worst_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a_ok.sql"), SCRIPT).unwrap();
        std::fs::write(dir.path().join("b_plain.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not sql").unwrap();
        assert_eq!(scan_command(&Config::default(), dir.path(), false).unwrap(), 0);

        std::fs::write(dir.path().join("c_broken.sql"), "BEGIN SELECT 1").unwrap();
        assert_eq!(scan_command(&Config::default(), dir.path(), false).unwrap(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn scan_counts_unwalkable_entries_as_failures() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a_ok.sql"), SCRIPT).unwrap();
        std::os::unix::fs::symlink(dir.path().join("missing"), dir.path().join("b_dangling.sql")).unwrap();

        assert_eq!(scan_command(&Config::default(), dir.path(), false).unwrap(), 1);
    }
}
