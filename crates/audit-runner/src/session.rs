use anyhow::{anyhow, Result};
use audit_core::{AuditError, ProxyConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use url::Url;

/// Browser automation driver behind an agent. Implementations must tolerate
/// calls from the scheduler's emergency path while an agent thread is mid-call.
pub trait BrowserSession: Send + Sync {
    fn navigate(&self, url: &Url) -> Result<()>;
    fn title(&self) -> Result<String>;
    fn page_source(&self) -> Result<String>;
    fn quit(&self) -> Result<()>;
}

pub trait SessionFactory: Send + Sync {
    fn open(&self, identity: &str, proxy: Option<&ProxyConfig>) -> Result<Box<dyn BrowserSession>>;
}

/// Shared handle to one agent's session. The agent thread drives it; the
/// scheduler keeps a clone so it can release the session from outside.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionSlot>,
}

struct SessionSlot {
    identity: String,
    session: Box<dyn BrowserSession>,
    released: AtomicBool,
}

impl SessionHandle {
    pub fn new(identity: &str, session: Box<dyn BrowserSession>) -> Self {
        Self {
            inner: Arc::new(SessionSlot {
                identity: identity.to_string(),
                session,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    fn live(&self) -> Result<&dyn BrowserSession> {
        if self.is_released() {
            return Err(anyhow!(AuditError::SessionReleased {
                identity: self.inner.identity.clone(),
            }));
        }
        Ok(self.inner.session.as_ref())
    }

    pub fn navigate(&self, url: &Url) -> Result<()> {
        self.live()?.navigate(url)
    }

    pub fn title(&self) -> Result<String> {
        self.live()?.title()
    }

    pub fn page_source(&self) -> Result<String> {
        self.live()?.page_source()
    }

    /// Quits the underlying session the first time it is called. Returns
    /// whether this call did the release.
    pub fn release(&self) -> bool {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Err(err) = self.inner.session.quit() {
            warn!(
                agent = %self.inner.identity,
                error = %format!("{:#}", err),
                "browser session quit failed"
            );
        } else {
            debug!(agent = %self.inner.identity, "browser session released");
        }
        true
    }
}

pub fn is_session_released(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<AuditError>(),
        Some(AuditError::SessionReleased { .. })
    )
}

/// Every session opened for the current block, so teardown and the
/// interrupt path can reach them regardless of where the block stopped.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    handles: Arc<Mutex<Vec<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: SessionHandle) -> Result<()> {
        let mut handles = self
            .handles
            .lock()
            .map_err(|_| anyhow!("session registry lock poisoned"))?;
        handles.push(handle);
        Ok(())
    }

    pub fn open_count(&self) -> usize {
        self.handles
            .lock()
            .map(|handles| handles.iter().filter(|h| !h.is_released()).count())
            .unwrap_or(0)
    }

    /// Releases and forgets every registered session. Safe to call from any
    /// thread and more than once; each session is quit at most once.
    pub fn release_all(&self) -> usize {
        let drained: Vec<SessionHandle> = match self.handles.lock() {
            Ok(mut handles) => handles.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        drained.iter().filter(|handle| handle.release()).count()
    }
}
