use canfuzz_core::bus::{self, BusKind, CanBus};
use canfuzz_core::case_store::CaseStore;
use canfuzz_core::config::{CanfuzzConfig, DEFAULT_CONFIG_FILE};
use canfuzz_core::generator::{PayloadPattern, SweepConfig, parse_int_auto, parse_targets};
use canfuzz_core::lenattack::{LengthAttackOptions, LineSink, run_length_attack};
use canfuzz_core::listener::{ArbIdCounter, count_arbitration_ids};
use canfuzz_core::record::{FailureCaseRecord, RunEntry};
use canfuzz_core::supervisor::{Supervisor, SupervisorConfig, SupervisorEvent};
use canfuzz_core::trace::{self, ExportSummary};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "canfuzz",
    author,
    version,
    about = "CAN length-attack fuzzer and run supervisor",
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to ./canfuzz.toml when present)
    #[arg(short, long, global = true, value_parser)]
    config: Option<PathBuf>,

    /// Verbose logging on stderr
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send frames whose payload length disagrees with their DLC
    Lenattack(LenattackArgs),

    /// Count arbitration ids seen on the bus until Ctrl-C
    Listener {
        #[command(flatten)]
        bus: BusArgs,
        /// Sort the report by descending hit count
        #[arg(short, long)]
        reverse: bool,
    },

    /// Run a worker under supervision, recording its failures
    Run {
        /// Module name used for classification (defaults to the first argument)
        #[arg(long)]
        module: Option<String>,
        /// Worker arguments, starting with the module name
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Re-run the worker for one stored failure case
    Replay {
        /// Fingerprint (or a prefix of it) shown by `cases list`
        fingerprint: String,
    },

    /// Re-run every stored failure case, one after another
    ReplayAll {
        #[arg(long)]
        module: Option<String>,
    },

    /// Inspect and manage stored failure cases
    #[command(subcommand)]
    Cases(CasesCommand),

    /// Convert a worker log into a measurement trace
    Export(ExportArgs),
}

#[derive(Args, Debug, Clone)]
struct BusArgs {
    /// CAN interface name
    #[arg(short, long)]
    interface: Option<String>,
    /// Bus driver
    #[arg(long, value_parser = parse_bus_kind)]
    bus: Option<BusKind>,
}

#[derive(Args, Debug)]
struct LenattackArgs {
    /// Arbitration ids: single values, ranges like 0x100-0x1FF, or `any`
    #[arg(required = true, num_args = 1..)]
    targets: Vec<String>,
    #[arg(long, default_value_t = 0)]
    min_dlc: u8,
    #[arg(long, default_value_t = 8)]
    max_dlc: u8,
    /// rand, zeros, ffs, aa, 55, inc or custom:<hex>
    #[arg(short, long, default_value = "inc")]
    pattern: PayloadPattern,
    /// Probability that a step's payload length disagrees with its DLC
    #[arg(long, default_value_t = 0.5, allow_negative_numbers = true)]
    mismatch_prob: f64,
    /// Seconds between frames
    #[arg(long, default_value_t = 0.05, allow_negative_numbers = true)]
    interval: f64,
    /// Frames sent per (target, DLC) step
    #[arg(short, long, default_value_t = 1)]
    bursts: u32,
    /// Restart the sweep until interrupted
    #[arg(long)]
    repeat: bool,
    /// First byte of the `inc` pattern
    #[arg(long, default_value = "0", value_parser = parse_byte)]
    start_byte: u8,
    /// Append send reports to this file
    #[arg(long)]
    log: Option<PathBuf>,
    /// Do not echo send reports to the console
    #[arg(short, long)]
    quiet: bool,
    /// Seed for reproducible payloads
    #[arg(long)]
    seed: Option<u64>,
    #[command(flatten)]
    bus: BusArgs,
}

#[derive(Subcommand, Debug)]
enum CasesCommand {
    /// List stored failures
    List {
        #[arg(long)]
        module: Option<String>,
    },
    /// Number of stored failures per module
    Summary,
    /// Remove stored failures for one module, or all of them
    Clear {
        #[arg(long)]
        module: Option<String>,
    },
    /// Remove one stored failure
    Delete { fingerprint: String },
    /// Write stored failures to a CSV file
    ExportCsv { output: PathBuf },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum TraceFormat {
    Asc,
    Mf4,
}

impl TraceFormat {
    fn extension(self) -> &'static str {
        match self {
            TraceFormat::Asc => "asc",
            TraceFormat::Mf4 => "mf4",
        }
    }
}

#[derive(Args, Debug)]
struct ExportArgs {
    #[arg(value_enum)]
    format: TraceFormat,
    /// Worker log to read frames from
    input: PathBuf,
    /// Output file (defaults to the export directory, named after the input)
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[arg(long, default_value = "canfuzz Security Report")]
    title: String,
    /// Leave the frame-count comment off ASC output
    #[arg(long)]
    no_trailer: bool,
}

fn parse_bus_kind(s: &str) -> Result<BusKind, String> {
    s.parse()
}

/// Accepts any integer and keeps its low byte.
fn parse_byte(s: &str) -> Result<u8, String> {
    parse_int_auto(s)
        .map(|v| (v & 0xFF) as u8)
        .ok_or_else(|| format!("'{s}' is not an integer"))
}

fn init_logging(verbose: u8) {
    let log_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("canfuzz={log_level},canfuzz_core={log_level}").into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();
}

fn load_config(path: Option<&Path>) -> Result<CanfuzzConfig> {
    let config = match path {
        Some(path) => CanfuzzConfig::load_from_file(path)?,
        None => CanfuzzConfig::load_or_default(Path::new(DEFAULT_CONFIG_FILE))?,
    };
    Ok(config)
}

fn install_stop_flag() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        stop_clone.store(true, Ordering::SeqCst);
    })
    .context("failed to install Ctrl-C handler")?;
    Ok(stop)
}

fn stdout_sink() -> LineSink {
    Arc::new(|line: &str| {
        let mut out = io::stdout().lock();
        // A closed stdout must not abort the sweep.
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    })
}

fn open_bus(config: &CanfuzzConfig, args: &BusArgs) -> Result<Arc<dyn CanBus>> {
    let kind = args.bus.unwrap_or(config.bus.kind);
    let channel = args.interface.as_deref().unwrap_or(&config.bus.channel);
    bus::open(kind, channel).with_context(|| format!("failed to open {kind} bus on {channel}"))
}

fn cmd_lenattack(config: &CanfuzzConfig, args: LenattackArgs) -> Result<()> {
    let targets = parse_targets(&args.targets);
    if targets.is_empty() {
        println!("No valid targets. Exiting.");
        return Ok(());
    }
    let interval = Duration::try_from_secs_f64(args.interval.max(0.0))
        .context("--interval is out of range")?;

    let bus = open_bus(config, &args.bus)?;
    let stop = install_stop_flag()?;
    let rng = match args.seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_rng(&mut rand::rng()),
    };
    let options = LengthAttackOptions {
        sweep: SweepConfig {
            targets,
            min_dlc: args.min_dlc,
            max_dlc: args.max_dlc,
            pattern: args.pattern,
            mismatch_prob: args.mismatch_prob,
            bursts: args.bursts,
            interval,
            repeat: args.repeat,
            start_byte: args.start_byte,
        },
        quiet: args.quiet,
        log_path: args.log,
        poll_timeout: config.bus.poll_timeout(),
        join_timeout: config.bus.join_timeout(),
    };

    let stats = run_length_attack(Arc::clone(&bus), &options, rng, stdout_sink(), &stop);
    bus.close();
    if stats.listener_abandoned {
        warn!("listener thread was still running at exit");
    }
    Ok(())
}

fn cmd_listener(config: &CanfuzzConfig, args: BusArgs, reverse: bool) -> Result<()> {
    let bus = open_bus(config, &args)?;
    let stop = install_stop_flag()?;
    println!("Running listener (press Ctrl+C to exit)");

    let poll_timeout = config.bus.poll_timeout();
    let counter = count_arbitration_ids(Arc::clone(&bus), poll_timeout, &stop, |id, unique| {
        let mut out = io::stdout().lock();
        let _ = write!(out, "\r{}", ArbIdCounter::progress_line(id, unique));
        let _ = out.flush();
    })
    .context("failed to start listener")?;
    bus.close();

    println!("\n");
    for line in counter.report(reverse) {
        println!("{line}");
    }
    Ok(())
}

fn build_supervisor(
    cli_config: Option<&Path>,
    config: &CanfuzzConfig,
    store: Arc<CaseStore>,
) -> Result<Supervisor> {
    let settings = &config.supervisor;
    let mut supervisor_config = match &settings.program {
        Some(program) => SupervisorConfig::new(program),
        None => {
            let exe = std::env::current_exe().context("failed to locate the canfuzz executable")?;
            let mut own = SupervisorConfig::new(exe);
            if let Some(path) = cli_config {
                own.base_args.push("--config".to_string());
                own.base_args.push(path.display().to_string());
            }
            own
        }
    };
    supervisor_config.base_args.extend(settings.base_args.iter().cloned());
    supervisor_config.working_dir = settings.working_dir.clone();
    supervisor_config.env = settings.env.clone();
    Ok(Supervisor::new(supervisor_config, store))
}

/// Prints console events until the run finishes, stopping it on Ctrl-C.
///
/// `events` must be subscribed before the run starts so its first lines are not missed.
fn follow_run(
    supervisor: &Supervisor,
    events: &Receiver<SupervisorEvent>,
    stop: &AtomicBool,
) -> Option<RunEntry> {
    let mut stop_sent = false;
    loop {
        if stop.load(Ordering::SeqCst) && !stop_sent {
            supervisor.stop();
            stop_sent = true;
        }
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(SupervisorEvent::Console(line)) => println!("{line}"),
            Ok(SupervisorEvent::RunFinished(entry)) => return Some(entry),
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

fn report_run(entry: &RunEntry) {
    info!(
        module = %entry.module,
        status = %entry.status,
        successes = entry.success_cases.len(),
        failures = entry.failure_cases.len(),
        "run finished"
    );
}

fn cmd_run(supervisor: &Supervisor, module: Option<String>, args: Vec<String>) -> Result<()> {
    let module = module.or_else(|| args.first().cloned()).unwrap_or_default();
    let stop = install_stop_flag()?;
    let events = supervisor.events();
    let handle = supervisor.run(&args, &module)?;
    follow_run(supervisor, &events, &stop);
    let entry = handle.wait();
    report_run(&entry);
    Ok(())
}

fn cmd_replay(supervisor: &Supervisor, fingerprint: &str) -> Result<()> {
    let record = supervisor
        .store()
        .find(fingerprint)
        .with_context(|| format!("no stored case matches '{fingerprint}'"))?;
    let stop = install_stop_flag()?;
    let events = supervisor.events();
    let handle = supervisor.replay(&record)?;
    follow_run(supervisor, &events, &stop);
    report_run(&handle.wait());
    Ok(())
}

fn cmd_replay_all(supervisor: &Supervisor, module: Option<&str>) -> Result<()> {
    let records = supervisor.store().get(module);
    if records.is_empty() {
        println!("No failure cases stored.");
        return Ok(());
    }
    let stop = install_stop_flag()?;
    let events = supervisor.events();
    for (index, record) in records.iter().enumerate() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        println!("[{}/{}] {} {}", index + 1, records.len(), record.module, record.timestamp);
        match supervisor.replay(record) {
            Ok(handle) => {
                follow_run(supervisor, &events, &stop);
                report_run(&handle.wait());
            }
            Err(e) => warn!(error = %e, "skipping failure case"),
        }
    }
    Ok(())
}

fn describe(record: &FailureCaseRecord) -> String {
    let details = &record.case_details;
    format!(
        "{}  {}  {:<10} ID={} {}",
        record.fingerprint(),
        record.timestamp,
        record.module,
        details.id.as_deref().unwrap_or("-"),
        details.error_type.as_deref().unwrap_or(&details.message),
    )
}

fn cmd_cases(store: &CaseStore, command: CasesCommand) -> Result<()> {
    match command {
        CasesCommand::List { module } => {
            for record in store.get(module.as_deref()) {
                println!("{}", describe(&record));
            }
        }
        CasesCommand::Summary => {
            for (module, count) in store.summary() {
                println!("{module}: {count}");
            }
        }
        CasesCommand::Clear { module } => {
            store.clear(module.as_deref())?;
        }
        CasesCommand::Delete { fingerprint } => {
            let record = store
                .find(&fingerprint)
                .with_context(|| format!("no stored case matches '{fingerprint}'"))?;
            store.delete(&record.module, &record.timestamp, &record.command)?;
        }
        CasesCommand::ExportCsv { output } => {
            let rows = store.export_csv(&output)?;
            println!("Exported {rows} cases to {}", output.display());
        }
    }
    Ok(())
}

fn cmd_export(config: &CanfuzzConfig, args: ExportArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read log {}", args.input.display()))?;
    let output = args.output.unwrap_or_else(|| {
        let stem = args
            .input
            .file_stem()
            .map_or_else(|| "canfuzz_trace".into(), |s| s.to_string_lossy().into_owned());
        config
            .export
            .output_dir
            .join(format!("{stem}.{}", args.format.extension()))
    });

    match args.format {
        TraceFormat::Asc => {
            let frames = trace::export_asc(&text, &output, !args.no_trailer)?;
            println!("Wrote {frames} frames to {}", output.display());
        }
        TraceFormat::Mf4 => {
            let summary = ExportSummary::from_log(&text);
            let samples = trace::export_mf4(&text, &output, &args.title, summary)?;
            println!("Wrote {samples} samples to {}", output.display());
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Lenattack(args) => cmd_lenattack(&config, args),
        Commands::Listener { bus, reverse } => cmd_listener(&config, bus, reverse),
        Commands::Cases(command) => cmd_cases(&CaseStore::open(&config.store.path), command),
        Commands::Export(args) => cmd_export(&config, args),
        Commands::Run { module, args } => {
            let store = Arc::new(CaseStore::open(&config.store.path));
            let supervisor = build_supervisor(cli.config.as_deref(), &config, store)?;
            cmd_run(&supervisor, module, args)
        }
        Commands::Replay { fingerprint } => {
            let store = Arc::new(CaseStore::open(&config.store.path));
            let supervisor = build_supervisor(cli.config.as_deref(), &config, store)?;
            cmd_replay(&supervisor, &fingerprint)
        }
        Commands::ReplayAll { module } => {
            let store = Arc::new(CaseStore::open(&config.store.path));
            let supervisor = build_supervisor(cli.config.as_deref(), &config, store)?;
            cmd_replay_all(&supervisor, module.as_deref())
        }
    }
}
