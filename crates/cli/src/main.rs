use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;

use kapply_api::{
    parse_documents, DeletePolicy, DiffSummary, Document, Engine, EngineConfig, ResourceClient, ResourceRef, Timeout,
    WaitCondition,
};
use kapply_kubehub::{ConnectOptions, KubeClient};

#[derive(Parser, Debug)]
#[command(name = "kapplyctl", version, about = "Server-side apply and wait for Kubernetes objects")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for every document (default: the document's, else the current context's)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Path to a kubeconfig file
    #[arg(long, global = true, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long, global = true, env = "KAPPLY_CONTEXT")]
    context: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(clap::Args, Debug, Clone, Default)]
struct Timing {
    /// Wait timeout, e.g. 90s or 5m (0 checks once, negative waits without bound)
    #[arg(long, value_parser = parse_timeout, allow_hyphen_values = true)]
    timeout: Option<Timeout>,
    /// Delay between polls, e.g. 2s
    #[arg(long, value_parser = parse_interval)]
    poll: Option<Duration>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Server-side apply every document in FILE, optionally waiting for conditions
    Apply {
        /// YAML file ("-" reads stdin)
        #[arg(short = 'f', long = "filename")]
        file: PathBuf,
        /// Condition to wait for after apply: PATH or PATH=VALUE (repeatable)
        #[arg(long = "wait")]
        wait: Vec<String>,
        #[command(flatten)]
        timing: Timing,
        /// Take ownership of fields managed by someone else
        #[arg(long = "force-conflicts", action = ArgAction::SetTrue)]
        force_conflicts: bool,
        /// Field manager name (default: KAPPLY_FIELD_MANAGER or "kapply")
        #[arg(long = "field-manager")]
        field_manager: Option<String>,
        /// Validate server-side without persisting
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Delete every object in FILE
    Delete {
        #[arg(short = 'f', long = "filename")]
        file: PathBuf,
        /// Propagation policy: orphan, background or foreground
        #[arg(long, default_value = "background", value_parser = DeletePolicy::from_str)]
        policy: DeletePolicy,
        /// Block until the objects are gone
        #[arg(long, action = ArgAction::SetTrue)]
        wait: bool,
        #[command(flatten)]
        timing: Timing,
    },
    /// Wait for conditions on the objects in FILE without applying
    Wait {
        #[arg(short = 'f', long = "filename")]
        file: PathBuf,
        /// Condition: PATH or PATH=VALUE (repeatable)
        #[arg(long = "for", required = true)]
        conditions: Vec<String>,
        #[command(flatten)]
        timing: Timing,
    },
    /// Summarize how FILE differs from live state
    Diff {
        #[arg(short = 'f', long = "filename")]
        file: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("KAPPLY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries command output; logs go to stderr
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KAPPLY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KAPPLY_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_timeout(s: &str) -> Result<Timeout, String> {
    Timeout::parse(s).map_err(|e| e.to_string())
}

fn parse_interval(s: &str) -> Result<Duration, String> {
    kapply_api::parse_duration(s).map_err(|e| e.to_string())
}

fn read_input(file: &Path) -> Result<String> {
    if file.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
        Ok(buf)
    } else {
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))
    }
}

/// Documents in FILE paired with the reference each one addresses.
fn load_targets(file: &Path, ns: Option<&str>) -> Result<Vec<(ResourceRef, Document)>> {
    let yaml = read_input(file)?;
    let docs = parse_documents(&yaml).with_context(|| format!("parsing {}", file.display()))?;
    if docs.is_empty() {
        bail!("no documents in {}", file.display());
    }
    docs.into_iter()
        .enumerate()
        .map(|(i, doc)| {
            let target = ResourceRef::from_document(&doc, ns).with_context(|| format!("document {}", i + 1))?;
            Ok((target, doc))
        })
        .collect()
}

fn conditions(specs: &[String], cfg: &EngineConfig, timing: &Timing) -> Result<Vec<WaitCondition>> {
    let cfg = cfg.with_timing(timing.timeout, timing.poll);
    specs
        .iter()
        .map(|s| cfg.condition(s).with_context(|| format!("--wait/--for {s:?}")))
        .collect()
}

#[derive(Debug, Serialize)]
struct Row {
    target: String,
    result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    diff: Option<DiffSummary>,
}

impl Row {
    fn new(target: &ResourceRef, result: &'static str) -> Self {
        Self { target: target.to_string(), result, resource_version: None, diff: None }
    }
}

fn emit(output: Output, row: &Row) -> Result<()> {
    match output {
        Output::Human => {
            let mut line = format!("{} {}", row.target, row.result);
            if let Some(rv) = &row.resource_version {
                line.push_str(&format!(" (rv {})", rv));
            }
            if let Some(d) = &row.diff {
                line.push_str(&format!(": +{} ~{} -{}", d.adds, d.updates, d.removes));
            }
            println!("{}", line);
        }
        Output::Json => println!("{}", serde_json::to_string(row)?),
    }
    Ok(())
}

async fn run<C: ResourceClient>(engine: &Engine<C>, cli: &Cli) -> Result<()> {
    let ns = cli.namespace.as_deref();
    let cfg = engine.config();
    match &cli.command {
        Commands::Apply { file, wait, timing, force_conflicts, field_manager, dry_run } => {
            let targets = load_targets(file, ns)?;
            let conds = conditions(wait, cfg, timing)?;
            let mut opts = cfg.apply_options();
            if let Some(m) = field_manager {
                opts.field_manager = m.clone();
            }
            opts.force_conflicts |= *force_conflicts;
            opts.dry_run = *dry_run;
            info!(documents = targets.len(), conditions = conds.len(), manager = %opts.field_manager, "apply invoked");
            for (target, doc) in &targets {
                let applied = engine
                    .apply_and_wait(target, doc, &opts, &conds)
                    .await
                    .with_context(|| format!("applying {}", target))?;
                let result = if applied.dry_run { "applied (dry run)" } else if conds.is_empty() { "applied" } else { "applied and ready" };
                emit(cli.output, &Row { resource_version: applied.resource_version, ..Row::new(target, result) })?;
            }
        }
        Commands::Delete { file, policy, wait, timing } => {
            let targets = load_targets(file, ns)?;
            let waits = cfg.with_timing(timing.timeout, timing.poll);
            info!(documents = targets.len(), policy = ?policy, wait, "delete invoked");
            for (target, _) in &targets {
                let result = if *wait {
                    engine
                        .delete_and_wait(target, *policy, waits.wait_timeout, waits.poll_interval)
                        .await
                        .with_context(|| format!("deleting {}", target))?;
                    "deleted"
                } else if engine.delete(target, *policy).await.with_context(|| format!("deleting {}", target))? {
                    "delete requested"
                } else {
                    "already absent"
                };
                emit(cli.output, &Row::new(target, result))?;
            }
        }
        Commands::Wait { file, conditions: specs, timing } => {
            let targets = load_targets(file, ns)?;
            let conds = conditions(specs, cfg, timing)?;
            info!(documents = targets.len(), conditions = conds.len(), "wait invoked");
            for (target, _) in &targets {
                engine
                    .wait_for_conditions(target, &conds)
                    .await
                    .into_result()
                    .with_context(|| format!("waiting for {}", target))?;
                emit(cli.output, &Row::new(target, "condition met"))?;
            }
        }
        Commands::Diff { file } => {
            let targets = load_targets(file, ns)?;
            for (target, doc) in &targets {
                let d = engine.diff(target, doc).await.with_context(|| format!("diffing {}", target))?;
                let result = if d.is_empty() { "unchanged" } else { "changed" };
                emit(cli.output, &Row { diff: Some(d), ..Row::new(target, result) })?;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let client = KubeClient::connect(ConnectOptions {
        kubeconfig: cli.kubeconfig.as_deref(),
        context: cli.context.as_deref(),
        ..Default::default()
    })
    .await?;
    let engine = Engine::new(client, EngineConfig::from_env());
    run(&engine, &cli).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_flags_parse() {
        let cli = Cli::try_parse_from([
            "kapplyctl", "apply", "-f", "deploy.yaml", "--wait", "status.readyReplicas=3", "--wait", "status.observedGeneration",
            "--timeout", "2m", "--poll", "500ms", "--force-conflicts", "--ns", "prod", "-o", "json",
        ])
        .unwrap();
        assert_eq!(cli.output, Output::Json);
        assert_eq!(cli.namespace.as_deref(), Some("prod"));
        match cli.command {
            Commands::Apply { wait, timing, force_conflicts, dry_run, .. } => {
                assert_eq!(wait.len(), 2);
                assert_eq!(timing.timeout, Some(Timeout::After(Duration::from_secs(120))));
                assert_eq!(timing.poll, Some(Duration::from_millis(500)));
                assert!(force_conflicts);
                assert!(!dry_run);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn negative_timeout_means_unbounded() {
        let cli = Cli::try_parse_from(["kapplyctl", "wait", "-f", "-", "--for", "status.phase=Running", "--timeout", "-1s"]).unwrap();
        match cli.command {
            Commands::Wait { timing, conditions, .. } => {
                assert_eq!(timing.timeout, Some(Timeout::Unbounded));
                assert_eq!(conditions, vec!["status.phase=Running".to_string()]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn wait_requires_a_condition() {
        assert!(Cli::try_parse_from(["kapplyctl", "wait", "-f", "x.yaml"]).is_err());
    }

    #[test]
    fn delete_policy_parses() {
        let cli = Cli::try_parse_from(["kapplyctl", "delete", "-f", "x.yaml", "--policy", "foreground", "--wait"]).unwrap();
        match cli.command {
            Commands::Delete { policy, wait, .. } => {
                assert_eq!(policy, DeletePolicy::Foreground);
                assert!(wait);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["kapplyctl", "delete", "-f", "x.yaml", "--policy", "cascade"]).is_err());
    }

    #[test]
    fn conditions_take_flag_timing_over_config() {
        let cfg = EngineConfig::default();
        let timing = Timing { timeout: Some(Timeout::Once), poll: None };
        let conds = conditions(&["status.phase=Running".to_string()], &cfg, &timing).unwrap();
        assert_eq!(conds[0].timeout, Timeout::Once);
        assert_eq!(conds[0].poll_interval, cfg.poll_interval);
        assert!(conditions(&["status[".to_string()], &cfg, &timing).is_err());
    }
}
