pub mod agent;
pub mod catalog;
pub mod config;
pub mod connectivity;
pub mod notify;
pub mod page_capture;
pub mod scheduler;
pub mod session;
pub mod site_visitor;
pub mod sink;
pub mod step;
pub mod treatment;
pub mod webdriver;
pub mod writer;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentOutcome};
pub use catalog::{ScrapeCatalog, StepCatalog};
pub use config::{ExperimentConfig, PushoverCredentials};
pub use notify::{LogNotifier, Notifier, PushoverNotifier};
pub use scheduler::{BlockReport, BlockScheduler, ExperimentReport, InterruptSignal};
pub use session::SessionRegistry;
pub use treatment::RosterStrategy;

use anyhow::Result;
use connectivity::{AssumeOnline, ConnectivityProbe, HttpConnectivityProbe};
use sink::{JsonlRecordSink, RecordSink};
use std::sync::Arc;
use tracing::info;
use treatment::AgentFactory;
use webdriver::WebDriverSessionFactory;

/// Wires the production collaborators around the block scheduler and runs
/// every block. `interrupt` must be the signal the caller's Ctrl-C handler
/// triggers; its registry receives every session this run opens.
pub fn run_experiment(
    config: &ExperimentConfig,
    interrupt: InterruptSignal,
) -> Result<ExperimentReport> {
    let catalog = config.load_catalog()?;
    let treatments = config.load_treatments()?;
    config.validate(&catalog, &treatments)?;

    let probe: Arc<dyn ConnectivityProbe> = match &config.connectivity_url {
        Some(url) => Arc::new(HttpConnectivityProbe::new(url)?),
        None => Arc::new(AssumeOnline),
    };
    let notifier: Arc<dyn Notifier> = match &config.pushover {
        Some(creds) => Arc::new(PushoverNotifier::new(&creds.user, &creds.token)?),
        None => Arc::new(LogNotifier),
    };
    let sessions = WebDriverSessionFactory::new(&config.webdriver_url, config.headless)?;
    let factory = AgentFactory::new(
        Arc::new(sessions),
        interrupt.registry().clone(),
        Arc::new(treatments),
        probe,
    )
    .with_proxy(config.proxy.clone())
    .with_retry_budget(config.retry_budget);

    let output = config.output.clone();
    let sinks = Box::new(move |_block: usize| -> Result<Box<dyn RecordSink + Send>> {
        Ok(Box::new(JsonlRecordSink::open(&output)?))
    });

    info!(
        location = %config.location,
        roster = %config.roster,
        agents = config.agents,
        blocks = config.blocks,
        output = %config.output.display(),
        webdriver = %config.webdriver_url,
        proxy = config.proxy.is_some(),
        "starting experiment"
    );
    let mut scheduler = scheduler::BlockScheduler::new(
        config.scheduler_settings(),
        factory,
        Arc::new(catalog),
        sinks,
        notifier,
        interrupt,
    );
    scheduler.run()
}
