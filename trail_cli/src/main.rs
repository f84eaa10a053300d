use clap::{Parser, Subcommand};
use trail_core::location::ScriptedLocationSource;
use trail_core::store::{collections, default_layout};
use trail_core::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "trail")]
#[command(about = "Offline-first workout tracker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a session from a scripted straight-line walk
    Simulate {
        /// Activity mode (outdoor, indoor_fixed, indoor_general)
        #[arg(long, default_value = "outdoor")]
        mode: String,

        #[arg(long, default_value = "local")]
        owner: String,

        /// Length of the walk in seconds
        #[arg(long, default_value_t = 60)]
        duration: u64,

        /// Walking speed in m/s
        #[arg(long, default_value_t = 4.0)]
        speed: f64,

        /// Start of a slow stretch, in seconds from the start
        #[arg(long, requires = "slow_until")]
        slow_from: Option<u64>,

        /// End of the slow stretch (inclusive)
        #[arg(long, requires = "slow_from")]
        slow_until: Option<u64>,

        /// Speed during the slow stretch in m/s
        #[arg(long, default_value_t = 0.1)]
        slow_speed: f64,

        /// Reported horizontal accuracy in meters
        #[arg(long, default_value_t = 5.0)]
        accuracy: f64,

        /// Attach a simulated heart-rate sensor
        #[arg(long)]
        heart_rate: bool,
    },

    /// List recorded sessions
    Sessions,

    /// List queued sync operations
    Pending,

    /// Send queued operations to the remote ledger
    Drain {
        /// Treat the remote as unreachable
        #[arg(long)]
        offline: bool,

        /// Ledger directory (defaults to <data-dir>/remote)
        #[arg(long)]
        ledger: Option<PathBuf>,
    },

    /// Return an errored operation to the pending queue
    Retry { op_id: Uuid },

    /// Drop a queued operation without sending it
    Discard { op_id: Uuid },

    /// Append session summaries to a CSV file
    Export {
        #[arg(long)]
        out: PathBuf,
    },

    /// Delete a finished, fully synced session and its points
    Purge { session_id: Uuid },

    /// Rewrite collection logs to their live contents
    Compact,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;
    trail_core::logging::init(&config.logging, cli.verbose);
    let data_dir = cli.data_dir.unwrap_or_else(|| config.data.data_dir.clone());
    tracing::debug!("Using data directory {:?}", data_dir);

    match cli.command {
        Commands::Simulate {
            mode,
            owner,
            duration,
            speed,
            slow_from,
            slow_until,
            slow_speed,
            accuracy,
            heart_rate,
        } => {
            let walk = Walk {
                duration,
                speed,
                slow: slow_from.zip(slow_until).map(|(from, until)| (from, until, slow_speed)),
                accuracy,
            };
            cmd_simulate(&data_dir, &config, mode.parse()?, &owner, walk, heart_rate)
        }
        Commands::Sessions => cmd_sessions(&data_dir),
        Commands::Pending => cmd_pending(&data_dir, &config),
        Commands::Drain { offline, ledger } => {
            let ledger = ledger.unwrap_or_else(|| data_dir.join("remote"));
            cmd_drain(&data_dir, &config, offline, &ledger)
        }
        Commands::Retry { op_id } => {
            sync_queue(&data_dir, &config)?.retry(op_id)?;
            println!("✓ Operation {} queued for retry", op_id);
            Ok(())
        }
        Commands::Discard { op_id } => {
            if sync_queue(&data_dir, &config)?.discard(op_id)? {
                println!("✓ Operation {} discarded", op_id);
                Ok(())
            } else {
                Err(Error::NotFound(format!("sync operation {}", op_id)))
            }
        }
        Commands::Export { out } => cmd_export(&data_dir, &out),
        Commands::Purge { session_id } => {
            let mut controller = SessionController::new(config, open_store(&data_dir)?);
            controller.purge(session_id)?;
            println!("✓ Purged session {}", session_id);
            Ok(())
        }
        Commands::Compact => cmd_compact(&data_dir),
    }
}

fn open_store(data_dir: &Path) -> Result<Arc<Store>> {
    Ok(Arc::new(Store::open_default(data_dir.join("store"))?))
}

fn sync_queue(data_dir: &Path, config: &Config) -> Result<SyncQueue> {
    Ok(SyncQueue::new(
        open_store(data_dir)?,
        RetryPolicy::from_config(&config.sync),
    ))
}

struct Walk {
    duration: u64,
    speed: f64,
    /// (from, until, speed)
    slow: Option<(u64, u64, f64)>,
    accuracy: f64,
}

impl Walk {
    fn speed_at(&self, t: u64) -> f64 {
        match self.slow {
            Some((from, until, slow)) if (from..=until).contains(&t) => slow,
            _ => self.speed,
        }
    }
}

const WALK_START: (f64, f64) = (-5.7945, -35.2110);
const WALK_BEARING_DEG: f64 = 90.0;

fn cmd_simulate(
    data_dir: &Path,
    config: &Config,
    mode: ActivityMode,
    owner: &str,
    walk: Walk,
    heart_rate: bool,
) -> Result<()> {
    let store = open_store(data_dir)?;
    let mut controller = SessionController::new(config.clone(), Arc::clone(&store));

    let mut sensors = SessionSensors::default();
    if mode.uses_location() {
        let source = ScriptedLocationSource::line(
            WALK_START,
            WALK_BEARING_DEG,
            chrono::Utc::now(),
            config.sampler.interval_secs,
            walk.duration,
            walk.accuracy,
            |t| walk.speed_at(t),
        );
        sensors = sensors.with_location(source);
    }
    if heart_rate {
        let sensor = HeartRateSensor::new(config.heart_rate.clone(), None)
            .with_simulation_interval(std::time::Duration::from_millis(10));
        sensors = sensors.with_heart_rate(sensor);
    }

    let session_id = controller.start(owner, mode, serde_json::json!({ "source": "simulate" }), sensors)?.id;
    println!("Started session {}", session_id);

    let report = controller.pump()?;
    if report.transition == Some(SessionState::Paused) {
        if let Some(at) = controller.sampler_stats().and_then(|s| s.auto_paused_at) {
            println!("  Auto-paused at {}", at.format("%H:%M:%S"));
        }
    }

    let mut bpm = None;
    if heart_rate {
        for _ in 0..50 {
            bpm = controller.heart_rate().map(|s| s.bpm);
            if bpm.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }

    if controller.state() == SessionState::Failed {
        let reason = controller
            .session()
            .and_then(|s| s.failure_reason.clone())
            .unwrap_or_default();
        println!("✗ Session failed: {}", reason);
        return Ok(());
    }

    let session = controller.stop()?;
    println!("\n✓ Session completed!");
    println!("  Accepted points: {}", report.accepted);
    println!("  Rejected points: {}", report.rejected);
    println!("  Distance: {:.1} m", session.distance_m);
    println!("  Duration: {:.0} s", session.duration_secs);
    println!("  Pace: {}", geo::format_pace(session.avg_pace_secs));
    if let Some(bpm) = bpm {
        println!("  Heart rate: {} bpm", bpm);
    }
    println!("  Queued sync operations: {}", controller.queue().len()?);

    let compacted = store.compact_if_needed(config.store.compact_after_records)?;
    if compacted > 0 {
        tracing::info!("Compacted {} collections", compacted);
    }
    Ok(())
}

fn cmd_sessions(data_dir: &Path) -> Result<()> {
    let store = open_store(data_dir)?;
    let sessions: Vec<WorkoutSession> = store.all(collections::SESSIONS)?;
    if sessions.is_empty() {
        println!("No sessions recorded.");
        return Ok(());
    }
    for session in &sessions {
        println!(
            "{}  {:<9}  {:<14}  {:>8.1} m  {:>5.0} s  {}",
            session.id,
            session.state,
            session.mode.as_str(),
            session.distance_m,
            session.duration_secs,
            geo::format_pace(session.avg_pace_secs)
        );
    }
    Ok(())
}

fn cmd_pending(data_dir: &Path, config: &Config) -> Result<()> {
    let queue = sync_queue(data_dir, config)?;
    let pending = queue.pending()?;
    let errored = queue.errored()?;
    if pending.is_empty() && errored.is_empty() {
        println!("Sync queue is empty.");
        return Ok(());
    }
    for op in pending.iter().chain(errored.iter()) {
        println!(
            "{}  {:<8}  {:?} {:?} {}  attempts={}{}",
            op.id,
            format!("{:?}", op.status).to_lowercase(),
            op.kind,
            op.entity_kind,
            op.entity_id,
            op.attempts,
            op.last_error
                .as_ref()
                .map(|e| format!("  last_error={}", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn cmd_drain(data_dir: &Path, config: &Config, offline: bool, ledger: &Path) -> Result<()> {
    let queue = sync_queue(data_dir, config)?;
    let report = if offline {
        queue.drain(&mut OfflineEndpoint)?
    } else {
        queue.drain(&mut LedgerEndpoint::open(ledger)?)?
    };

    println!(
        "Confirmed {}, failed {}, errored {}, deferred {}",
        report.confirmed.len(),
        report.failed.len(),
        report.errored.len(),
        report.deferred
    );
    for id in &report.errored {
        println!("  ✗ {} needs attention (see `trail pending`)", id);
    }
    Ok(())
}

fn cmd_export(data_dir: &Path, out: &Path) -> Result<()> {
    let store = open_store(data_dir)?;
    let sessions: Vec<WorkoutSession> = store.all(collections::SESSIONS)?;
    let count = trail_core::export::write_sessions_csv(&sessions, out)?;
    println!("✓ Exported {} sessions to {}", count, out.display());
    Ok(())
}

fn cmd_compact(data_dir: &Path) -> Result<()> {
    let store = open_store(data_dir)?;
    for spec in default_layout() {
        store.compact(&spec.name)?;
    }
    println!("✓ Compacted store at {}", store.root().display());
    Ok(())
}
