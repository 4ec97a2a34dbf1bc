use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bootproof::appliance::Appliance;
use bootproof::assets::AssetRepository;
use bootproof::clock::Clock;
use bootproof::config::Settings;
use bootproof::monitoring::MetricsTextfile;
use bootproof::process;
use bootproof::queue::VerificationAsset;
use bootproof::runner::RunOutcome;
use bootproof::scheduler::AssetOutcome;
use bootproof::verification::PipelineOutcome;
use bootproof::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Settings TOML (defaults to $BOOTPROOF_CONFIG, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Turn screenshot verification on for this device
    Enable,
    /// Turn screenshot verification off for this device
    Disable,
    /// Override the VM CPU/RAM for one asset
    SetResources {
        asset: String,
        #[arg(long)]
        cpus: Option<u32>,
        #[arg(long)]
        ram_mib: Option<u64>,
        /// Drop both overrides
        #[arg(long, conflicts_with_all = ["cpus", "ram_mib"])]
        clear: bool,
    },
    /// Set the applications a verified guest must report (none clears)
    ExpectApps { asset: String, apps: Vec<String> },
    /// Set the services a verified guest must report (none clears)
    ExpectServices { asset: String, services: Vec<String> },
    /// Inspect or edit the verification queue
    Queue {
        #[command(subcommand)]
        cmd: QueueCommand,
    },
    /// Verify one snapshot now
    Run {
        asset: String,
        epoch: i64,
        /// Start the run detached and return immediately
        #[arg(long)]
        background: bool,
    },
    /// Verify the next queued snapshot
    RunNext,
    /// Queue snapshots that are due for verification
    Schedule {
        /// Only consider this asset
        #[arg(long)]
        asset: Option<String>,
    },
    /// Ask a running verification of an asset to stop
    Cancel { asset: String },
    /// Show the running verification and queue, or one asset's status
    Status { asset: Option<String> },
}

#[derive(Debug, Subcommand)]
enum QueueCommand {
    Add { asset: String, epoch: i64 },
    Remove { asset: String, epoch: i64 },
    List,
    Clear,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_json);

    let settings = Settings::locate(args.config.as_deref())?;
    let metrics = match settings.metrics.textfile.as_deref() {
        Some(path) => Some(MetricsTextfile::install(path)?),
        None => None,
    };
    let app = Appliance::from_settings(settings)?;

    let result = dispatch(&app, args.cmd, args.config.as_deref());
    if let Some(m) = metrics
        && let Err(e) = m.flush()
    {
        tracing::warn!(error = %e, "failed to write metrics textfile");
    }
    result
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn dispatch(app: &Appliance, cmd: Command, config: Option<&Path>) -> Result<()> {
    match cmd {
        Command::Enable => set_enabled(app, true),
        Command::Disable => set_enabled(app, false),
        Command::SetResources {
            asset,
            cpus,
            ram_mib,
            clear,
        } => update_asset(app, &asset, |a| {
            if clear {
                a.verification.cpu_cores = None;
                a.verification.ram_mib = None;
            }
            if cpus.is_some() {
                a.verification.cpu_cores = cpus;
            }
            if ram_mib.is_some() {
                a.verification.ram_mib = ram_mib;
            }
        }),
        Command::ExpectApps { asset, apps } => {
            update_asset(app, &asset, |a| a.verification.expected_applications = apps)
        }
        Command::ExpectServices { asset, services } => {
            update_asset(app, &asset, |a| a.verification.expected_services = services)
        }
        Command::Queue { cmd } => cmd_queue(app, cmd),
        Command::Run {
            asset,
            epoch,
            background: true,
        } => cmd_run_background(app, &asset, epoch, config),
        Command::Run { asset, epoch, .. } => {
            let outcome = app.runner()?.run_one(&asset, epoch)?;
            report_run(&outcome);
            Ok(())
        }
        Command::RunNext => {
            let outcome = app.runner()?.run_next()?;
            report_run(&outcome);
            Ok(())
        }
        Command::Schedule { asset } => cmd_schedule(app, asset.as_deref()),
        Command::Cancel { asset } => {
            if app.runner()?.request_cancel(&asset)? {
                println!("cancellation requested for {asset}");
                Ok(())
            } else {
                Err(Error::msg(format!("{asset} has no verification running")))
            }
        }
        Command::Status { asset } => cmd_status(app, asset.as_deref()),
    }
}

fn set_enabled(app: &Appliance, enabled: bool) -> Result<()> {
    app.features().set_verification_enabled(enabled)?;
    println!(
        "screenshot verification {}",
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

fn update_asset(app: &Appliance, key: &str, f: impl FnOnce(&mut bootproof::assets::Asset)) -> Result<()> {
    let mut asset = app.assets.get(key)?;
    f(&mut asset);
    app.assets.save(&asset)?;
    println!("updated {key}");
    Ok(())
}

fn cmd_queue(app: &Appliance, cmd: QueueCommand) -> Result<()> {
    let queue = app.queue();
    match cmd {
        QueueCommand::Add { asset, epoch } => {
            let found = app.assets.get(&asset)?;
            if !found.has_local_point(epoch) {
                return Err(Error::not_found("recovery point", format!("{asset}@{epoch}")));
            }
            let item = VerificationAsset::new(&asset, epoch, app.clock.now(), found.most_recent_verified_epoch());
            if queue.add(item)? {
                println!("queued {asset}@{epoch}");
            } else {
                println!("{asset}@{epoch} was not queued: no attempts remaining");
            }
        }
        QueueCommand::Remove { asset, epoch } => {
            let item = VerificationAsset::new(&asset, epoch, 0, 0);
            if queue.remove(&item)? {
                println!("removed {item}");
            } else {
                println!("{item} was not queued");
            }
        }
        QueueCommand::List => print_queue(app)?,
        QueueCommand::Clear => {
            let n = queue.remove_all()?;
            println!("cleared {n} queued verification(s)");
        }
    }
    Ok(())
}

fn print_queue(app: &Appliance) -> Result<()> {
    let queue = app.queue();
    let entries = queue.list()?;
    if entries.is_empty() {
        println!("queue is empty");
        return Ok(());
    }
    for (i, e) in entries.iter().enumerate() {
        println!(
            "{:>2}. {:<32} queued {:<12} attempts {}/{}",
            i + 1,
            e.to_string(),
            e.queued_time,
            queue.attempts(e)?,
            queue.limits().max_attempts
        );
    }
    Ok(())
}

fn cmd_run_background(app: &Appliance, asset: &str, epoch: i64, config: Option<&Path>) -> Result<()> {
    let mut argv = app.settings.runner.background_command.clone();
    if argv.is_empty() {
        let exe = std::env::current_exe()?;
        argv.push(exe.display().to_string());
        if let Some(cfg) = config {
            argv.push("--config".to_string());
            argv.push(cfg.display().to_string());
        }
        argv.push("run".to_string());
    }
    argv.push(asset.to_string());
    argv.push(epoch.to_string());
    let pid = process::spawn_detached(&argv)?;
    tracing::info!(asset, epoch, pid, "started background verification");
    println!("started verification of {asset}@{epoch} (pid {pid})");
    Ok(())
}

fn cmd_schedule(app: &Appliance, asset: Option<&str>) -> Result<()> {
    let scheduler = app.scheduler();
    match asset {
        Some(key) => match scheduler.schedule_for_asset(key)? {
            AssetOutcome::Skipped(why) => println!("{key}: not scheduled ({why})"),
            AssetOutcome::Considered { queued, rejected } => {
                println!("{key}: queued {queued:?}, rejected {rejected:?}")
            }
        },
        None => {
            let s = scheduler.schedule_for_all_assets()?;
            println!(
                "assets {} queued {} rejected {} skipped {} failed {}",
                s.assets, s.queued, s.rejected, s.skipped, s.failed
            );
        }
    }
    Ok(())
}

fn cmd_status(app: &Appliance, asset: Option<&str>) -> Result<()> {
    if let Some(key) = asset {
        match app.status().get(key)? {
            Some(rec) => println!("{}", serde_json::to_string_pretty(&rec)?),
            None => println!("{key}: no verification recorded"),
        }
        if let Some(marker) = app.status().failure_marker(key)? {
            println!("failure: {marker}");
        }
        return Ok(());
    }
    match app.in_progress().active()? {
        Some(rec) => println!(
            "running: {}@{} pid {} since {} (timeout {}s)",
            rec.asset_key, rec.snapshot_epoch, rec.pid, rec.start_time, rec.timeout_secs
        ),
        None => println!("running: none"),
    }
    print_queue(app)
}

fn report_run(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Busy(rec) => println!(
            "busy: {}@{} is running in pid {}",
            rec.asset_key, rec.snapshot_epoch, rec.pid
        ),
        RunOutcome::Idle => println!("nothing to verify"),
        RunOutcome::Invalid { item, reason } => println!("{item}: not run ({reason})"),
        RunOutcome::Ran { item, outcome } => match outcome {
            PipelineOutcome::Cancelled { .. } => println!("{item}: cancelled"),
            PipelineOutcome::Finished { result, requeued, .. } => {
                let suffix = if *requeued { " (requeued)" } else { "" };
                println!("{item}: {result}{suffix}");
            }
        },
    }
}
