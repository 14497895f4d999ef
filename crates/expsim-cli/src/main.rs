//! expsim CLI: run synthetic training runs and browse what they recorded.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::EnvFilter;

use expsim_core::sim::{launch, quickstart, LaunchParams, QuickstartParams};
use expsim_core::{storage, LocalTracker, Settings, SystemClock, TrackerConfig};

#[derive(Parser)]
#[command(
    name = "expsim",
    about = "Synthetic training runs reported to a local experiment tracker",
    version,
    author
)]
struct Cli {
    /// Directory holding all tracked projects
    #[arg(long, global = true, env = "EXPSIM_DIR", default_value = "./runs")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Exponentially converging acc/loss over epochs 2..EPOCHS
    Quickstart {
        #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
        epochs: i64,
        /// Learning rate recorded in the run config
        #[arg(long, default_value_t = 0.01)]
        lr: f64,
        /// Seed for the random source (default: OS entropy)
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Logarithmic train/validation curves with sampled hyperparameters
    Launch {
        #[arg(long, default_value_t = launch::STEPS)]
        steps: u32,
        /// Pause after every step, in milliseconds
        #[arg(long, default_value_t = 1000)]
        pause_ms: u64,
        #[arg(long, default_value = launch::PROJECT)]
        project: String,
        #[arg(long, default_value = launch::OWNER)]
        owner: String,
        /// Write job.yaml so the run can be relaunched
        #[arg(long)]
        job: bool,
        /// Do not attach the source snapshot
        #[arg(long)]
        no_save_code: bool,
        /// Seed for the random source (default: OS entropy)
        #[arg(long)]
        seed: Option<u64>,
    },
    /// List projects, or the runs of one project
    List {
        #[arg(long, short)]
        project: Option<String>,
    },
    /// Inspect a run: metadata, config, last metrics and artifacts
    Inspect {
        /// Path to the run directory (e.g. runs/launch-test/20240101_120000_1a2b3c4d)
        run_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    // Diagnostics go to stderr; stdout carries the simulation output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Quickstart { epochs, lr, seed } => {
            cmd_quickstart(cli.dir, QuickstartParams { epochs, lr }, seed)?;
        }
        Commands::Launch {
            steps,
            pause_ms,
            project,
            owner,
            job,
            no_save_code,
            seed,
        } => {
            let params = LaunchParams {
                project,
                owner: Some(owner),
                steps,
                pause: Duration::from_millis(pause_ms),
                settings: Settings::default()
                    .with_job_creation(job)
                    .with_save_code(!no_save_code),
            };
            cmd_launch(cli.dir, params, seed)?;
        }
        Commands::List { project } => {
            cmd_list(cli.dir, project)?;
        }
        Commands::Inspect { run_dir } => {
            cmd_inspect(run_dir)?;
        }
    }

    Ok(())
}

// ─── Command implementations ──────────────────────────────────────────────────

fn make_rng(seed: Option<u64>) -> StdRng {
    seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64)
}

fn cmd_quickstart(dir: PathBuf, params: QuickstartParams, seed: Option<u64>) -> Result<()> {
    let tracker = LocalTracker::new(TrackerConfig::new(dir));
    let mut stdout = std::io::stdout().lock();
    quickstart::run(&tracker, &params, &mut make_rng(seed), &mut stdout)?;
    Ok(())
}

fn cmd_launch(dir: PathBuf, params: LaunchParams, seed: Option<u64>) -> Result<()> {
    let tracker = LocalTracker::new(TrackerConfig::new(&dir));
    let emitted = launch::run(&tracker, &params, &mut make_rng(seed), &SystemClock)?;
    println!(
        "Logged {} steps to {}",
        emitted,
        dir.join(&params.project).display()
    );
    Ok(())
}

fn cmd_list(dir: PathBuf, project: Option<String>) -> Result<()> {
    if let Some(project) = project {
        let project_dir = dir.join(&project);
        let runs = storage::list_runs(&project_dir)?;

        if runs.is_empty() {
            println!("No runs found for project '{}'", project);
            return Ok(());
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(["Run", "Status", "Owner", "Started", "Duration", "Records"]);

        for run_name in &runs {
            let Ok(meta) = storage::load_run_metadata(&project_dir.join(run_name)) else {
                table.add_row([run_name.as_str(), "UNKNOWN", "-", "-", "-", "-"]);
                continue;
            };

            let duration = meta
                .duration_secs
                .map(format_duration)
                .unwrap_or_else(|| "running".to_string());

            table.add_row([
                run_name.as_str(),
                &meta.status.to_string(),
                meta.owner.as_deref().unwrap_or("-"),
                &meta.started_at.format("%Y-%m-%d %H:%M").to_string(),
                &duration,
                &meta.records.to_string(),
            ]);
        }

        println!("Project: {}", project);
        println!("{}", table);
    } else {
        let projects = storage::list_projects(&dir)?;

        if projects.is_empty() {
            println!("No projects found in '{}'", dir.display());
            return Ok(());
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(["Project", "Runs"]);

        for project in &projects {
            let runs = storage::list_runs(&dir.join(project)).unwrap_or_default();
            table.add_row([project.as_str(), &runs.len().to_string()]);
        }

        println!("Projects in: {}", dir.display());
        println!("{}", table);
    }

    Ok(())
}

fn cmd_inspect(run_dir: PathBuf) -> Result<()> {
    if !run_dir.exists() {
        anyhow::bail!("Run directory not found: {}", run_dir.display());
    }

    let meta = storage::load_run_metadata(&run_dir)?;
    println!("Run: {}", meta.name);
    println!("Project: {}", meta.project);
    if let Some(owner) = &meta.owner {
        println!("Owner: {}", owner);
    }
    println!("Status: {}", meta.status);
    println!("Started: {}", meta.started_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(d) = meta.duration_secs {
        println!("Duration: {}", format_duration(d));
    }
    println!("Records: {}", meta.records);
    println!();

    let config = storage::load_config(&run_dir)?;
    if !config.is_empty() {
        println!("── Config ──────────────────────────────");
        for (key, value) in config.iter() {
            println!("{}: {}", key, value);
        }
        println!();
    }

    let rows = storage::read_metrics(&run_dir.join(storage::METRICS_FILE))?;
    if let Some(last) = rows.last() {
        println!("── Last Metrics ({} total rows) ─────────", rows.len());
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(["Metric", "Value"]);
        let mut entries: Vec<_> = last.iter().collect();
        entries.sort_by_key(|(k, _)| k.as_str());
        for (k, v) in entries {
            table.add_row([k.as_str(), &v.to_string()]);
        }
        println!("{}", table);
    }

    let artifacts = storage::list_artifacts(&run_dir)?;
    if !artifacts.is_empty() {
        println!("── Artifacts ({}) ──────────────────────", artifacts.len());
        for (path, size) in &artifacts {
            println!("  {} ({} bytes)", path, size);
        }
    }

    Ok(())
}

// ─── Utilities ────────────────────────────────────────────────────────────────

fn format_duration(secs: f64) -> String {
    let secs = secs as u64;
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{}h {}m", h, m)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}
