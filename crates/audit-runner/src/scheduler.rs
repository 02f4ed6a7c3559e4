use crate::agent::{Agent, AgentOutcome};
use crate::catalog::ScrapeCatalog;
use crate::notify::{
    notify_quietly, Notifier, MESSAGE_BLOCK_FAILED, MESSAGE_COMPLETED, MESSAGE_INTERRUPTED,
};
use crate::session::SessionRegistry;
use crate::sink::RecordSink;
use crate::treatment::{AgentFactory, RosterStrategy};
use crate::writer::ResultWriter;
use anyhow::{anyhow, Result};
use audit_core::{AuditError, Location};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

const DEFAULT_JOIN_POLL: Duration = Duration::from_millis(200);

/// Process-wide stop request. Triggering it force-releases every session
/// the scheduler has registered, from whatever thread calls it.
#[derive(Clone)]
pub struct InterruptSignal {
    triggered: Arc<AtomicBool>,
    sessions: SessionRegistry,
}

impl InterruptSignal {
    pub fn new(sessions: SessionRegistry) -> Self {
        Self {
            triggered: Arc::new(AtomicBool::new(false)),
            sessions,
        }
    }

    /// Returns how many sessions this call released.
    pub fn trigger(&self) -> usize {
        self.triggered.store(true, Ordering::SeqCst);
        let released = self.sessions.release_all();
        warn!(released, "interrupt received; browser sessions force-released");
        released
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.sessions
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub location: Location,
    /// Roster repetitions per block.
    pub agents: usize,
    pub blocks: usize,
    pub roster: RosterStrategy,
    pub seed: Option<u64>,
}

/// Opens the output sink for one block.
pub type SinkFactory = dyn Fn(usize) -> Result<Box<dyn RecordSink + Send>> + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockReport {
    pub block: usize,
    pub agents: Vec<AgentOutcome>,
    pub records_written: usize,
    pub sessions_released: usize,
    pub error: Option<String>,
}

impl BlockReport {
    fn failed(block: usize, error: String) -> Self {
        Self {
            block,
            agents: Vec::new(),
            records_written: 0,
            sessions_released: 0,
            error: Some(error),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn failed_agents(&self) -> usize {
        self.agents.iter().filter(|a| !a.succeeded()).count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExperimentReport {
    pub blocks: Vec<BlockReport>,
    pub interrupted: bool,
}

impl ExperimentReport {
    pub fn failed_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| !b.succeeded()).count()
    }

    pub fn records_written(&self) -> usize {
        self.blocks.iter().map(|b| b.records_written).sum()
    }

    pub fn failed_agents(&self) -> usize {
        self.blocks.iter().map(BlockReport::failed_agents).sum()
    }
}

/// Runs blocks one after another. Every session opened in a block is
/// released before the next block starts, whatever happened in it.
pub struct BlockScheduler {
    settings: SchedulerSettings,
    factory: AgentFactory,
    catalog: Arc<dyn ScrapeCatalog>,
    sinks: Box<SinkFactory>,
    notifier: Arc<dyn Notifier>,
    interrupt: InterruptSignal,
    join_poll: Duration,
    rng: StdRng,
}

impl BlockScheduler {
    /// `interrupt` must share the registry `factory` registers sessions in.
    pub fn new(
        settings: SchedulerSettings,
        factory: AgentFactory,
        catalog: Arc<dyn ScrapeCatalog>,
        sinks: Box<SinkFactory>,
        notifier: Arc<dyn Notifier>,
        interrupt: InterruptSignal,
    ) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            settings,
            factory,
            catalog,
            sinks,
            notifier,
            interrupt,
            join_poll: DEFAULT_JOIN_POLL,
            rng,
        }
    }

    pub fn with_join_poll(mut self, join_poll: Duration) -> Self {
        self.join_poll = join_poll;
        self
    }

    pub fn run(&mut self) -> Result<ExperimentReport> {
        let report = match self.run_blocks() {
            Ok(report) => report,
            Err(err) => {
                let released = self.interrupt.registry().release_all();
                error!(released, error = %format!("{:#}", err), "experiment aborted");
                notify_quietly(
                    self.notifier.as_ref(),
                    &format!("{}: {:#}", MESSAGE_INTERRUPTED, err),
                );
                return Err(err);
            }
        };

        if report.interrupted {
            warn!(
                blocks_run = report.blocks.len(),
                records = report.records_written(),
                "experiment interrupted"
            );
            notify_quietly(self.notifier.as_ref(), MESSAGE_INTERRUPTED);
            return Err(anyhow!(AuditError::Interrupted));
        }

        let failed = report.failed_blocks();
        let message = if failed == 0 {
            MESSAGE_COMPLETED.to_string()
        } else {
            format!(
                "{} ({} of {} blocks failed)",
                MESSAGE_COMPLETED,
                failed,
                report.blocks.len()
            )
        };
        info!(
            blocks = report.blocks.len(),
            failed_blocks = failed,
            failed_agents = report.failed_agents(),
            records = report.records_written(),
            "completed measurement"
        );
        notify_quietly(self.notifier.as_ref(), &message);
        Ok(report)
    }

    fn run_blocks(&mut self) -> Result<ExperimentReport> {
        let mut report = ExperimentReport::default();
        for block in 0..self.settings.blocks {
            if self.interrupt.is_triggered() {
                report.interrupted = true;
                break;
            }
            info!(block, location = %self.settings.location, roster = %self.settings.roster, "starting block");
            let outcome = self.run_block(block);
            let released = self.interrupt.registry().release_all();
            match outcome {
                Ok(mut block_report) => {
                    block_report.sessions_released = released;
                    report.blocks.push(block_report);
                }
                Err(err) if is_interrupted(&err) || self.interrupt.is_triggered() => {
                    warn!(block, released, "block abandoned after interrupt");
                    let mut failed = BlockReport::failed(block, format!("{:#}", err));
                    failed.sessions_released = released;
                    report.blocks.push(failed);
                    report.interrupted = true;
                    break;
                }
                Err(err) => {
                    error!(block, released, error = %format!("{:#}", err), "block failed");
                    notify_quietly(
                        self.notifier.as_ref(),
                        &format!("{} (block {}): {:#}", MESSAGE_BLOCK_FAILED, block, err),
                    );
                    let mut failed = BlockReport::failed(block, format!("{:#}", err));
                    failed.sessions_released = released;
                    report.blocks.push(failed);
                }
            }
            info!(block, "completed block");
        }
        if self.interrupt.is_triggered() && !report.interrupted {
            warn!(blocks_run = report.blocks.len(), "interrupt arrived after the last block");
            report.interrupted = true;
        }
        Ok(report)
    }

    fn run_block(&mut self, block: usize) -> Result<BlockReport> {
        info!(block, "creating agents");
        let mut agents = self.factory.build_roster(
            self.settings.roster,
            block,
            self.settings.agents,
            &mut self.rng,
        )?;

        info!(block, agents = agents.len(), "adding scrape steps");
        for agent in agents.iter_mut() {
            let steps = self
                .catalog
                .scrape_steps(self.settings.location, &mut self.rng)?;
            agent.add_scrape_steps(steps);
        }
        for agent in agents.iter_mut() {
            agent.shuffle_steps(&mut self.rng);
        }
        if self.interrupt.is_triggered() {
            return Err(anyhow!(AuditError::Interrupted));
        }

        let writer = ResultWriter::spawn(block, (self.sinks)(block)?)?;
        info!(block, agents = agents.len(), "starting threads");
        let (done_tx, done_rx) = mpsc::channel::<AgentOutcome>();
        let mut outcomes = Vec::with_capacity(agents.len());
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(agents.len());
        for (index, agent) in agents.into_iter().enumerate() {
            let identity = agent.identity().to_string();
            match launch(block, index, agent, &writer, done_tx.clone()) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    error!(block, agent = %identity, error = %format!("{:#}", err), "agent not started");
                    outcomes.push(AgentOutcome::failed(&identity, format!("{:#}", err)));
                }
            }
        }
        drop(done_tx);

        let launched = handles.len();
        let mut finished = 0usize;
        while finished < launched {
            if self.interrupt.is_triggered() {
                return Err(anyhow!(AuditError::Interrupted));
            }
            match done_rx.recv_timeout(self.join_poll) {
                Ok(outcome) => {
                    if let Some(err) = &outcome.error {
                        warn!(block, agent = %outcome.identity, error = %err, "agent ended early");
                    }
                    outcomes.push(outcome);
                    finished += 1;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        for handle in handles {
            if handle.join().is_err() {
                error!(block, "agent thread panicked outside its run");
            }
        }
        // Released sessions end agents early, so a full join does not mean
        // the block ran to completion.
        if self.interrupt.is_triggered() {
            return Err(anyhow!(AuditError::Interrupted));
        }

        let summary = writer.finish()?;
        if self.interrupt.is_triggered() {
            return Err(anyhow!(AuditError::Interrupted));
        }
        Ok(BlockReport {
            block,
            agents: outcomes,
            records_written: summary.records_written,
            sessions_released: 0,
            error: None,
        })
    }
}

fn launch(
    block: usize,
    index: usize,
    agent: Agent,
    writer: &ResultWriter,
    done: mpsc::Sender<AgentOutcome>,
) -> Result<JoinHandle<()>> {
    let records = writer.sender();
    let identity = agent.identity().to_string();
    thread::Builder::new()
        .name(format!("auditor-{}-{}-{}", block, index, identity))
        .spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| agent.run(&records)))
                .unwrap_or_else(|payload| {
                    error!(block, agent = %identity, "agent panicked");
                    AgentOutcome::failed(&identity, panic_message(payload.as_ref()))
                });
            let _ = done.send(outcome);
        })
        .map_err(|e| anyhow!("failed to spawn agent thread: {}", e))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}

fn is_interrupted(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<AuditError>(), Some(AuditError::Interrupted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::AssumeOnline;
    use crate::step::{Step, StepContext, StepKind};
    use crate::testing::{
        EmitCatalog, EventLog, FakeSessionFactory, MemorySink, RecordingNotifier,
    };
    use crate::treatment::TreatmentTable;
    use audit_core::Record;
    use rand::RngCore;
    use std::time::Instant;

    const ONE_SITE_PER_TREATMENT: &str = r#"
treatments:
  control: { sites: [control.test], delay: 0 }
  male: { sites: [male.test], delay: 0 }
  female: { sites: [female.test], delay: 0 }
  caucasian: { sites: [caucasian.test], delay: 0 }
  afam: { sites: [afam.test], delay: 0 }
  hispanic: { sites: [hispanic.test], delay: 0 }
  asian: { sites: [asian.test], delay: 0 }
"#;

    struct Harness {
        sessions: FakeSessionFactory,
        notifier: Arc<RecordingNotifier>,
        sink: MemorySink,
        interrupt: InterruptSignal,
    }

    fn scheduler(
        harness: &Harness,
        settings: SchedulerSettings,
        treatments: &str,
        catalog: Arc<dyn ScrapeCatalog>,
    ) -> BlockScheduler {
        let factory = AgentFactory::new(
            Arc::new(harness.sessions.clone()),
            harness.interrupt.registry().clone(),
            Arc::new(TreatmentTable::from_yaml_str(treatments).expect("treatments")),
            Arc::new(AssumeOnline),
        );
        let sink = harness.sink.clone();
        BlockScheduler::new(
            settings,
            factory,
            catalog,
            Box::new(move |_block| Ok(Box::new(sink.clone()) as Box<dyn RecordSink + Send>)),
            harness.notifier.clone(),
            harness.interrupt.clone(),
        )
        .with_join_poll(Duration::from_millis(10))
    }

    fn harness(sessions: FakeSessionFactory, events: EventLog) -> Harness {
        Harness {
            sessions,
            notifier: Arc::new(RecordingNotifier::default()),
            sink: MemorySink::with_events(events),
            interrupt: InterruptSignal::new(SessionRegistry::new()),
        }
    }

    fn settings(roster: RosterStrategy, agents: usize, blocks: usize) -> SchedulerSettings {
        SchedulerSettings {
            location: Location::Champaign,
            agents,
            blocks,
            roster,
            seed: Some(42),
        }
    }

    #[test]
    fn qc_block_emits_every_training_and_scrape_record() {
        let events = EventLog::default();
        let h = harness(FakeSessionFactory::new(), events.clone());
        let catalog = Arc::new(EmitCatalog {
            count: 3,
            events: events.clone(),
        });
        let mut scheduler = scheduler(&h, settings(RosterStrategy::Qc, 1, 1), ONE_SITE_PER_TREATMENT, catalog);

        let report = scheduler.run().expect("experiment");

        assert_eq!(report.blocks.len(), 1);
        assert_eq!(report.blocks[0].records_written, 8 * (2 + 3));
        assert_eq!(report.blocks[0].sessions_released, 8);
        assert_eq!(report.failed_agents(), 0);
        let records = h.sink.records();
        assert_eq!(records.len(), 40);
        assert_eq!(records.iter().filter(|r| r.kind == "visit").count(), 16);
        assert_eq!(records.iter().filter(|r| r.kind == "emit").count(), 24);
        assert_eq!(h.sessions.opened().len(), 8);
        assert_eq!(h.sessions.quit_counts(), vec![1; 8]);
        assert_eq!(h.notifier.messages(), vec![MESSAGE_COMPLETED.to_string()]);
    }

    #[test]
    fn writer_sees_sentinel_after_every_agent_finished() {
        let events = EventLog::default();
        let h = harness(FakeSessionFactory::new(), events.clone());
        let catalog = Arc::new(EmitCatalog {
            count: 4,
            events: events.clone(),
        });
        let mut scheduler = scheduler(&h, settings(RosterStrategy::SingleSite, 1, 2), ONE_SITE_PER_TREATMENT, catalog);
        scheduler.run().expect("experiment");

        let events = events.lock().expect("events").clone();
        let flushes: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.as_str() == "flush")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(flushes.len(), 2, "one flush per block");
        assert_eq!(flushes[0], 9 * 4, "block 0 steps all precede its flush");
        assert_eq!(flushes[1], events.len() - 1);
        assert_eq!(h.sessions.quit_counts(), vec![1; 18]);
    }

    #[test]
    fn failed_block_is_torn_down_and_next_block_runs() {
        let events = EventLog::default();
        let h = harness(FakeSessionFactory::new().failing_open_at(3), events.clone());
        let catalog = Arc::new(EmitCatalog {
            count: 1,
            events: events.clone(),
        });
        let mut scheduler = scheduler(&h, settings(RosterStrategy::Qc, 1, 2), ONE_SITE_PER_TREATMENT, catalog);

        let report = scheduler.run().expect("experiment continues past a failed block");

        assert_eq!(report.blocks.len(), 2);
        assert!(!report.blocks[0].succeeded());
        assert_eq!(report.blocks[0].sessions_released, 3);
        assert!(report.blocks[1].succeeded());
        assert_eq!(report.blocks[1].records_written, 8 * 3);
        assert_eq!(h.sessions.opened().len(), 11);
        assert_eq!(h.sessions.quit_counts(), vec![1; 11]);
        let messages = h.notifier.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].starts_with(MESSAGE_BLOCK_FAILED));
        assert!(messages[0].contains("block 0"));
        assert!(messages[1].starts_with(MESSAGE_COMPLETED));
        assert!(messages[1].contains("1 of 2 blocks failed"));
    }

    struct PanicStep;

    impl Step for PanicStep {
        fn name(&self) -> &str {
            "fragile"
        }

        fn kind(&self) -> StepKind {
            StepKind::Scrape
        }

        fn delay(&self) -> Duration {
            Duration::ZERO
        }

        fn invoke(&mut self, _ctx: &StepContext<'_>) -> Result<Vec<Record>> {
            panic!("layout changed");
        }
    }

    struct PanicCatalog;

    impl ScrapeCatalog for PanicCatalog {
        fn scrape_steps(&self, _location: Location, _rng: &mut dyn RngCore) -> Result<Vec<Box<dyn Step>>> {
            Ok(vec![Box::new(PanicStep)])
        }
    }

    #[test]
    fn panicking_agent_becomes_failed_outcome() {
        let h = harness(FakeSessionFactory::new(), EventLog::default());
        let mut scheduler = scheduler(
            &h,
            settings(RosterStrategy::Test, 2, 1),
            ONE_SITE_PER_TREATMENT,
            Arc::new(PanicCatalog),
        );
        let report = scheduler.run().expect("experiment");

        let block = &report.blocks[0];
        assert!(block.succeeded());
        assert_eq!(block.agents.len(), 2);
        assert_eq!(block.failed_agents(), 2);
        assert!(block.agents[0]
            .error
            .as_deref()
            .expect("error")
            .contains("layout changed"));
        assert_eq!(block.records_written, 2, "training visits recorded before the panic");
        assert_eq!(h.sessions.quit_counts(), vec![1, 1]);
    }

    #[test]
    fn interrupt_releases_running_sessions_once_and_notifies_once() {
        let h = harness(
            FakeSessionFactory::new()
                .dead_host("control.test")
                .navigation_guard(100_000),
            EventLog::default(),
        );
        let catalog = Arc::new(EmitCatalog {
            count: 0,
            events: EventLog::default(),
        });
        let treatments = "treatments:\n  control: { sites: [control.test], delay: 1 }\n";
        let mut scheduler = scheduler(&h, settings(RosterStrategy::Test, 5, 3), treatments, catalog);
        let runner = thread::spawn(move || scheduler.run());

        let deadline = Instant::now() + Duration::from_secs(10);
        while h.sessions.navigations().len() < 5 {
            assert!(Instant::now() < deadline, "agents never started");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(h.interrupt.trigger(), 5);

        let err = runner
            .join()
            .expect("scheduler thread")
            .expect_err("interrupted run fails");
        assert!(is_interrupted(&err));
        assert_eq!(h.sessions.opened().len(), 5, "no further blocks started");
        assert_eq!(h.sessions.quit_counts(), vec![1; 5]);
        assert_eq!(h.notifier.messages(), vec![MESSAGE_INTERRUPTED.to_string()]);
        assert_eq!(h.interrupt.trigger(), 0);
    }

    #[test]
    fn interrupt_during_last_join_is_not_reported_as_success() {
        let h = harness(
            FakeSessionFactory::new()
                .dead_host("control.test")
                .navigation_guard(100_000),
            EventLog::default(),
        );
        let catalog = Arc::new(EmitCatalog {
            count: 0,
            events: EventLog::default(),
        });
        let treatments = "treatments:\n  control: { sites: [control.test], delay: 0 }\n";
        let mut scheduler = scheduler(&h, settings(RosterStrategy::Test, 1, 1), treatments, catalog)
            .with_join_poll(Duration::from_secs(30));
        let runner = thread::spawn(move || scheduler.run());

        let deadline = Instant::now() + Duration::from_secs(10);
        while h.sessions.navigations().len() < 2 {
            assert!(Instant::now() < deadline, "agent never retried");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(h.interrupt.trigger(), 1);

        let err = runner
            .join()
            .expect("scheduler thread")
            .expect_err("interrupted run fails");
        assert!(is_interrupted(&err));
        assert_eq!(h.sessions.quit_counts(), vec![1]);
        assert_eq!(h.notifier.messages(), vec![MESSAGE_INTERRUPTED.to_string()]);
    }
}
