//! `autopackd` — the thinnest possible process entrypoint around the
//! Autopack core: argument parsing and wiring, no business logic. Loads a
//! `ProjectRuleset` and a run spec from disk, boots a `ControlPlane` over
//! the production `ShellGitAdapter` / `CommandCIGate` pair, and starts one
//! run.

#![allow(dead_code)]

use anyhow::{Context, Result};
use autopack_core::ci_gate::CommandCIGate;
use autopack_core::control_plane::{ControlPlane, StartRunBody};
use autopack_core::file_layout::FileLayout;
use autopack_core::git_adapter::ShellGitAdapter;
use autopack_core::model::ProjectRuleset;
use autopack_core::supervisor::Supervisor;
use autopack_core::AutopackError;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Start one Autopack run against a project's ruleset and a run spec.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the project's ruleset file. `.toml` or `.yaml`/`.yml` by extension.
    #[arg(long)]
    ruleset: PathBuf,

    /// Path to a JSON run spec (the `POST /runs/start` body shape).
    #[arg(long)]
    run_spec: PathBuf,

    /// Directory the FileLayout tree (backlogs, learned rules, run workspaces) lives under.
    #[arg(long, default_value = ".autonomous_runs")]
    runs_dir: PathBuf,

    /// Repository root the ShellGitAdapter operates against.
    #[arg(long, default_value = ".")]
    repo_root: PathBuf,

    /// CI command the CommandCIGate invokes via the shell.
    #[arg(long, default_value = "true")]
    ci_command: String,

    /// Max CI retries before a run is failed with `CiRed`.
    #[arg(long, default_value_t = 2)]
    ci_max_retries: u32,
}

/// Exit codes per the control-plane error taxonomy: `0` normal, `2`
/// config/ruleset invalid, `3` infra unavailable on boot, `4` persistence
/// corruption detected.
fn exit_code_for(err: &AutopackError) -> u8 {
    match err {
        AutopackError::RulesetInvalid { .. } => 2,
        AutopackError::Infra { .. } => 3,
        AutopackError::Io { .. } | AutopackError::Serde(_) => 4,
        _ => 1,
    }
}

fn load_ruleset(path: &PathBuf) -> Result<ProjectRuleset> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading ruleset file {}", path.display()))?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&raw).with_context(|| format!("parsing ruleset {} as YAML", path.display()))
        }
        _ => toml::from_str(&raw).with_context(|| format!("parsing ruleset {} as TOML", path.display())),
    }
}

fn load_run_spec(path: &PathBuf) -> Result<StartRunBody> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading run spec {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing run spec {} as JSON", path.display()))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("autopack_core=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let ruleset = match load_ruleset(&args.ruleset) {
        Ok(ruleset) => ruleset,
        Err(err) => {
            tracing::error!("ruleset invalid: {err:#}");
            return ExitCode::from(2);
        }
    };

    let run_spec = match load_run_spec(&args.run_spec) {
        Ok(spec) => spec,
        Err(err) => {
            tracing::error!("run spec invalid: {err:#}");
            return ExitCode::from(2);
        }
    };

    tracing::info!(project_id = %ruleset.project_id, "starting autopackd");

    let git = Arc::new(ShellGitAdapter::new(args.repo_root.clone()));
    let ci = Arc::new(CommandCIGate::new(args.ci_command.clone(), args.ci_max_retries));
    let file_layout = FileLayout::new(args.runs_dir.clone());

    let control_plane = ControlPlane::new(Supervisor::new(git, ci, file_layout));
    control_plane.register_project(ruleset).await;

    match control_plane.start_run(run_spec).await {
        Ok(response) => {
            tracing::info!(run_id = %response.run_id, "run started");
            println!("{}", response.run_id);
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!("failed to start run: {err}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}
