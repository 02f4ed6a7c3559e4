//! Fakes shared by the unit tests.

use crate::catalog::ScrapeCatalog;
use crate::notify::Notifier;
use crate::session::{BrowserSession, SessionFactory};
use crate::sink::RecordSink;
use crate::step::{Step, StepContext, StepKind};
use anyhow::{anyhow, Result};
use audit_core::{ensure_dir, Location, ProxyConfig, Record};
use chrono::Utc;
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use url::Url;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) struct TempDirGuard {
    pub(crate) path: PathBuf,
}

impl TempDirGuard {
    pub(crate) fn new(prefix: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&path).expect("temp dir");
        Self { path }
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

#[derive(Default)]
struct FakeBrowserState {
    opened: Vec<String>,
    proxies: Vec<Option<ProxyConfig>>,
    quits: Vec<usize>,
    navigations: Vec<String>,
    failures_left: HashMap<String, usize>,
    dead_hosts: HashSet<String>,
    navigation_guard: Option<usize>,
    fail_open_at: Option<usize>,
    fail_quit: bool,
}

/// Opens in-memory sessions that log every call into one shared state.
#[derive(Clone, Default)]
pub(crate) struct FakeSessionFactory {
    state: Arc<Mutex<FakeBrowserState>>,
}

impl FakeSessionFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// `host` fails its first `times` navigations, then succeeds.
    pub(crate) fn failing_host(self, host: &str, times: usize) -> Self {
        lock(&self.state)
            .failures_left
            .insert(host.to_string(), times);
        self
    }

    pub(crate) fn dead_host(self, host: &str) -> Self {
        lock(&self.state).dead_hosts.insert(host.to_string());
        self
    }

    /// Panics the driver after `max` navigations so a runaway loop ends.
    pub(crate) fn navigation_guard(self, max: usize) -> Self {
        lock(&self.state).navigation_guard = Some(max);
        self
    }

    /// The `index`-th call to `open` (zero based) fails.
    pub(crate) fn failing_open_at(self, index: usize) -> Self {
        lock(&self.state).fail_open_at = Some(index);
        self
    }

    pub(crate) fn failing_quit(self) -> Self {
        lock(&self.state).fail_quit = true;
        self
    }

    pub(crate) fn opened(&self) -> Vec<String> {
        lock(&self.state).opened.clone()
    }

    pub(crate) fn proxies(&self) -> Vec<Option<ProxyConfig>> {
        lock(&self.state).proxies.clone()
    }

    pub(crate) fn quit_counts(&self) -> Vec<usize> {
        lock(&self.state).quits.clone()
    }

    pub(crate) fn navigations(&self) -> Vec<String> {
        lock(&self.state).navigations.clone()
    }

    pub(crate) fn page_source_for(&self, url: &str) -> String {
        format!("<html><head><title>title of {url}</title></head><body>ad slot</body></html>")
    }
}

impl SessionFactory for FakeSessionFactory {
    fn open(&self, identity: &str, proxy: Option<&ProxyConfig>) -> Result<Box<dyn BrowserSession>> {
        let mut state = lock(&self.state);
        if state.fail_open_at == Some(state.opened.len()) {
            state.fail_open_at = None;
            return Err(anyhow!("could not start browser for {}", identity));
        }
        let index = state.opened.len();
        state.opened.push(identity.to_string());
        state.proxies.push(proxy.cloned());
        state.quits.push(0);
        Ok(Box::new(FakeSession {
            index,
            state: self.state.clone(),
            current: Mutex::new(None),
        }))
    }
}

struct FakeSession {
    index: usize,
    state: Arc<Mutex<FakeBrowserState>>,
    current: Mutex<Option<String>>,
}

impl BrowserSession for FakeSession {
    fn navigate(&self, url: &Url) -> Result<()> {
        let target = url.as_str().to_string();
        let host = url.host_str().unwrap_or_default().to_string();
        let tripped = {
            let mut state = lock(&self.state);
            state.navigations.push(target.clone());
            state
                .navigation_guard
                .map_or(false, |max| state.navigations.len() > max)
        };
        if tripped {
            panic!("navigation guard tripped at {}", target);
        }
        let mut state = lock(&self.state);
        if state.dead_hosts.contains(&host) {
            return Err(anyhow!("neterror: could not reach {}", target));
        }
        if let Some(left) = state.failures_left.get_mut(&host) {
            if *left > 0 {
                *left -= 1;
                return Err(anyhow!("timeout loading {}", target));
            }
        }
        *lock(&self.current) = Some(target);
        Ok(())
    }

    fn title(&self) -> Result<String> {
        let current = lock(&self.current).clone().unwrap_or_default();
        Ok(format!("title of {}", current))
    }

    fn page_source(&self) -> Result<String> {
        let current = lock(&self.current).clone().unwrap_or_default();
        Ok(format!(
            "<html><head><title>title of {current}</title></head><body>ad slot</body></html>"
        ))
    }

    fn quit(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.quits[self.index] += 1;
        if state.fail_quit {
            return Err(anyhow!("browser already gone"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub(crate) fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str) -> Result<()> {
        lock(&self.messages).push(message.to_string());
        Ok(())
    }
}

/// Ordered log that steps and sinks append to, to check cross-thread ordering.
pub(crate) type EventLog = Arc<Mutex<Vec<String>>>;

#[derive(Clone, Default)]
pub(crate) struct MemorySink {
    records: Arc<Mutex<Vec<Record>>>,
    events: EventLog,
}

impl MemorySink {
    pub(crate) fn with_events(events: EventLog) -> Self {
        Self {
            records: Arc::default(),
            events,
        }
    }

    pub(crate) fn records(&self) -> Vec<Record> {
        lock(&self.records).clone()
    }
}

impl RecordSink for MemorySink {
    fn append_record(&mut self, record: &Record) -> Result<()> {
        lock(&self.records).push(record.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        lock(&self.events).push("flush".to_string());
        Ok(())
    }
}

/// Step that always succeeds with one record and logs `<agent>:<name>`.
pub(crate) struct EmitStep {
    name: String,
    kind: StepKind,
    events: EventLog,
}

impl EmitStep {
    pub(crate) fn new(name: &str, kind: StepKind, events: EventLog) -> Self {
        Self {
            name: name.to_string(),
            kind,
            events,
        }
    }
}

impl Step for EmitStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StepKind {
        self.kind
    }

    fn delay(&self) -> Duration {
        Duration::ZERO
    }

    fn invoke(&mut self, ctx: &StepContext<'_>) -> Result<Vec<Record>> {
        lock(&self.events).push(format!("{}:{}", ctx.identity, self.name));
        Ok(vec![ctx.record(&self.name, "emit", &self.name)])
    }
}

/// Catalog of `count` emit steps for every location.
pub(crate) struct EmitCatalog {
    pub(crate) count: usize,
    pub(crate) events: EventLog,
}

impl ScrapeCatalog for EmitCatalog {
    fn scrape_steps(&self, _location: Location, _rng: &mut dyn RngCore) -> Result<Vec<Box<dyn Step>>> {
        Ok((0..self.count)
            .map(|i| {
                Box::new(EmitStep::new(
                    &format!("scrape-{}", i),
                    StepKind::Scrape,
                    self.events.clone(),
                )) as Box<dyn Step>
            })
            .collect())
    }
}
