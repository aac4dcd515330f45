// MaaS Plugins - monitoring checks and template tooling
//
// Plugins run by the monitoring agent, plus offline tools for keeping the
// monitoring templates of a deployment branch honest.
//
// # Subcommands
// - compare: structural diff of a template against the playbook templates
// - memcached-status: memcached liveness and item counters
// - command-timer: wall-clock time of arbitrary commands
// - nova-api-local-check: nova API liveness, response time and server states
// - snapshot: redacted template built from a raw monitoring API dump
//
// Check plugins write the agent protocol to stdout; logs always go to stderr.
//
// # Usage
// maas-plugins compare --playbooks setup-infra.yml setup-memcached.yml \
//     --branch master --test-file memcached.maas_data
// maas-plugins memcached-status 172.29.236.10 --port 11211
// maas-plugins command-timer "ls_root=ls /"
// OS_AUTH_URL=http://172.29.236.100:5000/v3 ... maas-plugins nova-api-local-check 172.29.236.100

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::env;
use std::fs;
use std::io::{self, IsTerminal};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// Module declarations
mod checks;
mod diff;
mod maas;
mod snapshot;
mod templates;

use checks::command_timer::{CommandTimerCheck, TimedCommand};
use checks::memcached::{MemcachedCheck, DEFAULT_PORT};
use checks::nova::{Credentials, NovaApiLocalCheck};
use checks::Check;
use diff::IgnoreSet;
use maas::MetricEmitter;
use snapshot::{LabelMapping, SnapshotRequest};
use templates::{to_pretty_json, TemplateStore};

#[derive(Parser)]
#[command(
    name = "maas-plugins",
    about = "Monitoring checks and template tooling",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compare a template against the templates of one or more playbooks
    Compare(CompareArgs),
    /// Report memcached status and item counters
    MemcachedStatus(MemcachedArgs),
    /// Time commands and report each duration in milliseconds
    CommandTimer(CommandTimerArgs),
    /// Report nova API status, response time and server states
    NovaApiLocalCheck(NovaArgs),
    /// Build a redacted template from a raw monitoring API dump
    Snapshot(SnapshotArgs),
}

#[derive(Args)]
struct CompareArgs {
    /// Playbooks whose templates form the reference
    #[arg(long, num_args = 1.., required = true)]
    playbooks: Vec<String>,

    /// Branch directory holding the templates
    #[arg(long)]
    branch: String,

    /// Root directory of the per-branch templates
    #[arg(long, alias = "templates_dir", env = "MAAS_TEMPLATES_DIR", default_value = ".")]
    templates_dir: PathBuf,

    /// Template to test against the reference
    #[arg(long, alias = "test_file")]
    test_file: String,

    /// Key name to leave out of the comparison at any depth
    #[arg(long = "ignore", value_name = "KEY")]
    ignore: Vec<String>,
}

#[derive(Args)]
struct MemcachedArgs {
    /// memcached IP address
    ip: Ipv4Addr,

    /// memcached port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Connect and read timeout in seconds
    #[arg(long, default_value_t = 5)]
    timeout: u64,
}

#[derive(Args)]
struct CommandTimerArgs {
    /// Commands to time, as NAME=COMMAND
    #[arg(required = true, value_name = "NAME=COMMAND")]
    commands: Vec<TimedCommand>,
}

#[derive(Args)]
struct NovaArgs {
    /// nova API IP address
    ip: Ipv4Addr,

    /// Identity service URL
    #[arg(long, env = "OS_AUTH_URL")]
    auth_url: String,

    #[arg(long, env = "OS_USERNAME")]
    username: String,

    #[arg(long, env = "OS_PASSWORD", hide_env_values = true)]
    password: String,

    #[arg(long, env = "OS_PROJECT_NAME")]
    project_name: String,

    #[arg(long, env = "OS_USER_DOMAIN_NAME", default_value = "Default")]
    user_domain_name: String,

    #[arg(long, env = "OS_PROJECT_DOMAIN_NAME", default_value = "Default")]
    project_domain_name: String,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,
}

#[derive(Args)]
struct SnapshotArgs {
    /// Playbook the snapshot is named after
    playbook: String,

    /// Branch directory to write into
    branch: String,

    /// Entity mappings as LABEL:TEMPLATE, in raw dump order
    #[arg(value_name = "LABEL[:TEMPLATE]")]
    labels: Vec<LabelMapping>,

    /// Raw monitoring API dump to read
    #[arg(long, alias = "from_file")]
    from_file: PathBuf,

    /// Root directory for per-branch output
    #[arg(long, alias = "base_dir", default_value = ".")]
    base_dir: PathBuf,

    /// Also write the raw dump next to the snapshot
    #[arg(long, alias = "raw_output")]
    raw_output: bool,
}

/// Application entry point
///
/// Exit status:
/// - 0: check reported `status okay`, or no template drift
/// - 1: check reported `status error`, or template drift was printed
/// - 2: usage, I/O or parse failure
#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

/// Dispatches a subcommand; `Ok(false)` means a reported failure
async fn run(command: Command) -> Result<bool> {
    match command {
        Command::Compare(args) => run_compare(&args),
        Command::MemcachedStatus(args) => {
            let check = MemcachedCheck::new(args.ip, args.port)
                .with_timeout(Duration::from_secs(args.timeout));
            run_plugin(&check).await
        }
        Command::CommandTimer(args) => run_plugin(&CommandTimerCheck::new(args.commands)).await,
        Command::NovaApiLocalCheck(args) => {
            let credentials = Credentials {
                auth_url: args.auth_url,
                username: args.username,
                password: args.password,
                project_name: args.project_name,
                user_domain_name: args.user_domain_name,
                project_domain_name: args.project_domain_name,
            };
            let check = NovaApiLocalCheck::new(args.ip, credentials)
                .with_timeout(Duration::from_secs(args.timeout));
            run_plugin(&check).await
        }
        Command::Snapshot(args) => run_snapshot(args),
    }
}

/// Compares the test template against the merged playbook templates
///
/// Drift is printed to stderr as indented JSON with sorted keys.
fn run_compare(args: &CompareArgs) -> Result<bool> {
    let store = TemplateStore::new(&args.templates_dir);

    let reference = store
        .load_playbooks(args.playbooks.as_slice(), &args.branch)
        .context("Failed to build the reference from playbook templates")?;
    let candidate = store
        .load(&args.branch, &args.test_file)
        .with_context(|| format!("Failed to load test file '{}'", args.test_file))?;

    let ignored: IgnoreSet = args.ignore.iter().cloned().collect();
    let result = diff::compare(&reference, &candidate, &ignored);

    if result.is_empty() {
        info!("'{}' matches the reference templates", args.test_file);
        return Ok(true);
    }

    eprintln!("{}", to_pretty_json(&result)?);
    Ok(false)
}

/// Runs a check plugin against stdout
async fn run_plugin(check: &dyn Check) -> Result<bool> {
    let mut emitter = MetricEmitter::new(io::stdout());
    checks::run_check(check, &mut emitter)
        .await
        .context("Failed to write check output")
}

fn run_snapshot(args: SnapshotArgs) -> Result<bool> {
    let text = fs::read_to_string(&args.from_file)
        .with_context(|| format!("Failed to read raw data from {}", args.from_file.display()))?;
    let raw: Value = serde_json::from_str(&text)
        .with_context(|| format!("Raw data in {} is not valid JSON", args.from_file.display()))?;

    let request = SnapshotRequest {
        playbook: args.playbook,
        branch: args.branch,
        base_dir: args.base_dir,
        raw_output: args.raw_output,
    };
    snapshot::write_snapshot(&request, &raw, &args.labels)?;
    Ok(true)
}

/// Initializes the logging subsystem
///
/// Everything is written to stderr so it never mixes with plugin output.
/// JSON format is used under systemd (`INVOCATION_ID` set), a human-readable
/// format otherwise.
///
/// # Log Levels
/// Default: WARN
/// Can be overridden with RUST_LOG environment variable
fn init_logging() {
    let is_systemd = env::var("INVOCATION_ID").is_ok();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    if is_systemd {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(io::stderr().is_terminal()),
            )
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_template(dir: &TempDir, name: &str, value: Value) {
        let branch_dir = dir.path().join("master");
        fs::create_dir_all(&branch_dir).unwrap();
        fs::write(branch_dir.join(name), value.to_string()).unwrap();
    }

    fn compare_args(dir: &TempDir, ignore: &[&str]) -> CompareArgs {
        CompareArgs {
            playbooks: vec!["setup-memcached.yml".to_string()],
            branch: "master".to_string(),
            templates_dir: dir.path().to_path_buf(),
            test_file: "memcached.maas_data".to_string(),
            ignore: ignore.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_compare_arguments() {
        let cli = Cli::try_parse_from([
            "maas-plugins",
            "compare",
            "--playbooks",
            "setup-infra.yml",
            "setup-memcached.yml",
            "--branch",
            "master",
            "--test_file",
            "memcached.maas_data",
        ])
        .unwrap();

        match cli.command {
            Command::Compare(args) => {
                assert_eq!(args.playbooks, vec!["setup-infra.yml", "setup-memcached.yml"]);
                assert_eq!(args.test_file, "memcached.maas_data");
                assert!(args.ignore.is_empty());
            }
            _ => panic!("expected compare"),
        }
    }

    #[test]
    fn test_command_timer_rejects_malformed_command() {
        assert!(Cli::try_parse_from(["maas-plugins", "command-timer", "no_equals"]).is_err());
        assert!(Cli::try_parse_from(["maas-plugins", "command-timer", "ls=ls /"]).is_ok());
    }

    #[test]
    fn test_memcached_requires_ipv4() {
        assert!(Cli::try_parse_from(["maas-plugins", "memcached-status", "not-an-ip"]).is_err());
        assert!(Cli::try_parse_from(["maas-plugins", "memcached-status", "127.0.0.1"]).is_ok());
    }

    #[test]
    fn test_parse_nova_arguments() {
        let cli = Cli::try_parse_from([
            "maas-plugins",
            "nova-api-local-check",
            "172.29.236.100",
            "--auth-url",
            "http://172.29.236.100:5000/v3",
            "--username",
            "admin",
            "--password",
            "secret",
            "--project-name",
            "admin",
        ])
        .unwrap();

        match cli.command {
            Command::NovaApiLocalCheck(args) => {
                assert_eq!(args.ip, Ipv4Addr::new(172, 29, 236, 100));
                assert_eq!(args.timeout, 10);
            }
            _ => panic!("expected nova-api-local-check"),
        }
    }

    #[test]
    fn test_compare_without_drift() {
        let dir = TempDir::new().unwrap();
        let template = json!({"infra1": {"checks": {"memcached_status": {"period": 60}}}});
        write_template(&dir, "setup-memcached", template.clone());
        write_template(&dir, "memcached.maas_data", template);

        assert!(run_compare(&compare_args(&dir, &[])).unwrap());
    }

    #[test]
    fn test_compare_reports_drift_unless_ignored() {
        let dir = TempDir::new().unwrap();
        write_template(
            &dir,
            "setup-memcached",
            json!({"infra1": {"checks": {"memcached_status": {"period": 60}}}}),
        );
        write_template(
            &dir,
            "memcached.maas_data",
            json!({"infra1": {"checks": {"memcached_status": {"period": 30}}}}),
        );

        assert!(!run_compare(&compare_args(&dir, &[])).unwrap());
        assert!(run_compare(&compare_args(&dir, &["period"])).unwrap());
    }

    #[test]
    fn test_compare_fails_on_missing_template() {
        let dir = TempDir::new().unwrap();
        assert!(run_compare(&compare_args(&dir, &[])).is_err());
    }
}
