use anyhow::{Context, Result};
use audit_core::{ensure_dir, AuditError, Location, ProxyConfig};
use audit_runner::{
    ExperimentConfig, ExperimentReport, InterruptSignal, RosterStrategy, SessionRegistry,
};
use chrono::Local;
use clap::{Parser, ValueEnum};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Parser)]
#[command(name = "auditor", version = "0.3.0", about = "Run demographic ad audit experiments")]
struct Cli {
    /// JSON Lines file that collects every record; blocks append to it
    #[arg(short = 'o', long, default_value = "output/ads.jsonl")]
    output: PathBuf,
    /// Roster repetitions per block
    #[arg(short = 'a', long, default_value_t = 1)]
    agents: usize,
    #[arg(short = 'b', long, default_value_t = 1)]
    blocks: usize,
    #[arg(long, value_enum, default_value_t = LocationArg::Champaign)]
    location: LocationArg,
    #[arg(short = 'v', long)]
    debug: bool,
    #[arg(long, value_enum, default_value_t = RosterArg::Qc)]
    roster: RosterArg,
    /// YAML scrape catalog replacing the built-in one
    #[arg(long)]
    catalog: Option<PathBuf>,
    /// YAML treatment table replacing the built-in one
    #[arg(long)]
    treatments: Option<PathBuf>,
    #[arg(long)]
    webdriver_url: Option<String>,
    #[arg(long)]
    headless: bool,
    /// Give up on a training site after this many failed visits
    #[arg(long)]
    retry_budget: Option<usize>,
    /// Store every captured page under this directory
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,
    /// host:port of an HTTP proxy for every browser
    #[arg(long)]
    proxy: Option<String>,
    #[arg(long, default_value = "output")]
    log_dir: PathBuf,
    #[arg(long)]
    no_connectivity_check: bool,
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LocationArg {
    #[value(name = "champaign")]
    Champaign,
    #[value(name = "chicago")]
    Chicago,
    #[value(name = "sacramento")]
    Sacramento,
    #[value(name = "atlanta")]
    Atlanta,
}

impl From<LocationArg> for Location {
    fn from(value: LocationArg) -> Self {
        match value {
            LocationArg::Champaign => Location::Champaign,
            LocationArg::Chicago => Location::Chicago,
            LocationArg::Sacramento => Location::Sacramento,
            LocationArg::Atlanta => Location::Atlanta,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RosterArg {
    #[value(name = "qc")]
    Qc,
    #[value(name = "single-site")]
    SingleSite,
    #[value(name = "test")]
    Test,
}

impl From<RosterArg> for RosterStrategy {
    fn from(value: RosterArg) -> Self {
        match value {
            RosterArg::Qc => RosterStrategy::Qc,
            RosterArg::SingleSite => RosterStrategy::SingleSite,
            RosterArg::Test => RosterStrategy::Test,
        }
    }
}

impl Cli {
    fn into_config(self) -> Result<ExperimentConfig> {
        let mut config = ExperimentConfig::new(self.location.into(), self.output);
        config.agents = self.agents;
        config.blocks = self.blocks;
        config.debug = self.debug;
        config.roster = self.roster.into();
        config.catalog_file = self.catalog;
        config.treatments_file = self.treatments;
        config.headless = self.headless;
        config.retry_budget = self.retry_budget;
        config.snapshot_dir = self.snapshot_dir;
        config.seed = self.seed;
        if let Some(url) = self.webdriver_url {
            config.webdriver_url = url;
        }
        if self.no_connectivity_check {
            config.connectivity_url = None;
        }
        config.proxy = self
            .proxy
            .as_deref()
            .map(ProxyConfig::parse)
            .transpose()
            .context("invalid --proxy")?;
        config.with_env_defaults()
    }
}

fn init_logging(debug: bool, log_dir: &Path) -> Result<PathBuf> {
    ensure_dir(log_dir)?;
    let path = log_dir.join(format!("{}.log", Local::now().format("%Y-%m-%dT%H-%M-%S")));
    let file = File::create(&path)
        .with_context(|| format!("failed to create log file {}", path.display()))?;
    let level = if debug { "debug" } else { "info" };
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(level)
            .add_directive("hyper_util=warn".parse()?)
            .add_directive("reqwest=warn".parse()?),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(std::io::stderr.and(Mutex::new(file)))
        .init();
    Ok(path)
}

fn install_interrupt_handler(interrupt: &InterruptSignal) -> Result<()> {
    let signal = interrupt.clone();
    ctrlc::set_handler(move || {
        if signal.is_triggered() {
            eprintln!("second interrupt, exiting without cleanup");
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
        signal.trigger();
    })
    .context("failed to install Ctrl-C handler")
}

fn print_summary(report: &ExperimentReport) {
    for block in &report.blocks {
        match &block.error {
            None => println!(
                "block {}: records={} agents={} failed_agents={} sessions_released={}",
                block.block,
                block.records_written,
                block.agents.len(),
                block.failed_agents(),
                block.sessions_released
            ),
            Some(err) => println!("block {}: failed: {}", block.block, err),
        }
    }
    println!(
        "blocks={} failed_blocks={} records={}",
        report.blocks.len(),
        report.failed_blocks(),
        report.records_written()
    );
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_path = init_logging(cli.debug, &cli.log_dir)?;
    info!(log = %log_path.display(), "logging to file");
    let config = cli.into_config()?;

    let interrupt = InterruptSignal::new(SessionRegistry::new());
    install_interrupt_handler(&interrupt)?;

    match audit_runner::run_experiment(&config, interrupt) {
        Ok(report) => {
            print_summary(&report);
            Ok(())
        }
        Err(err) => {
            if matches!(err.downcast_ref::<AuditError>(), Some(AuditError::Interrupted)) {
                error!("experiment interrupted");
                std::process::exit(INTERRUPTED_EXIT_CODE);
            }
            error!(error = %format!("{:#}", err), "experiment failed");
            Err(err)
        }
    }
}
