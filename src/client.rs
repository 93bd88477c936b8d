use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::analysis::AnalysisInvoker;
use crate::capabilities::CapabilityCache;
use crate::config::AppConfig;
use crate::correlator::RequestCorrelator;
use crate::error::{ClientError, Superseded};
use crate::escalation::{EscalationPolicy, EscalationState, FailureState, SoftBackoff, Verdict};
use crate::protocol::{AnalysisRequest, CapabilityDescriptor};
use crate::supervisor::ProcessSupervisor;
use crate::transport::{CommandLauncher, Launcher};

/// Per-phase time budgets.
#[derive(Debug, Clone, Copy)]
struct Budgets {
    list_tools: Duration,
    analyze: Duration,
    retry_interval: Duration,
}

/// Snapshot for status output.
#[derive(Debug, Clone)]
pub struct ClientStatus {
    pub connected: bool,
    pub pid: Option<u32>,
    pub launches: u64,
    pub next_id: u64,
    pub state: EscalationState,
    pub failures: FailureState,
    pub stale_drained: u64,
    pub tools_cached: usize,
}

/// Everything that touches the pipes, guarded by one lock.
struct Session {
    supervisor: ProcessSupervisor,
    correlator: RequestCorrelator,
    capabilities: CapabilityCache,
    invoker: AnalysisInvoker,
    policy: EscalationPolicy,
    backoff: SoftBackoff,
}

impl Session {
    /// Make sure a live server exists. A dead one is replaced through
    /// the restart path so ids and the capability cache start over.
    async fn ensure_running(&mut self) -> Result<(), ClientError> {
        if self.supervisor.is_alive() {
            return Ok(());
        }
        if !self.supervisor.has_handle() {
            self.begin_lifetime();
            return self.supervisor.start().await;
        }
        warn!("Vision server is no longer running");
        self.restart().await
    }

    async fn restart(&mut self) -> Result<(), ClientError> {
        self.begin_lifetime();
        self.supervisor.restart().await
    }

    /// Ids and the tool list belong to one server lifetime.
    fn begin_lifetime(&mut self) {
        self.correlator.reset();
        self.capabilities.clear();
    }

    async fn attempt(
        &mut self,
        request: &AnalysisRequest,
        budgets: Budgets,
    ) -> Result<String, ClientError> {
        self.ensure_running().await?;
        let transport = self.supervisor.transport()?;
        if let Err(e) = self
            .capabilities
            .ensure(&mut self.correlator, transport, budgets.list_tools)
            .await
        {
            warn!("Capability listing failed, analyzing without it: {e}");
        }
        self.invoker
            .invoke(
                &mut self.correlator,
                transport,
                request,
                self.capabilities.tools(),
                budgets.analyze,
            )
            .await
    }

    fn succeeded(&mut self) {
        self.policy.record_success();
        self.backoff.on_success();
    }

    async fn failed(&mut self, attempt: u64, err: &ClientError) {
        warn!("Vision attempt {attempt} failed [{}]: {err}", err.kind());
        if self.policy.record_failure() == Verdict::Restart {
            if let Err(e) = self.restart().await {
                error!("Vision server restart failed, will retry on next attempt: {e}");
            }
            self.policy.restart_completed();
        }
    }
}

/// Serialized, self-healing client for the image-analysis server.
///
/// All callers share one subprocess. The lock is held for a whole
/// `analyze` call, retries included, so at most one request is ever in
/// flight on the pipe.
pub struct VisionClient {
    session: Mutex<Session>,
    generation: AtomicU64,
    budgets: Budgets,
}

impl VisionClient {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_launcher(Box::new(CommandLauncher::new(config.server.clone())), config)
    }

    pub fn with_launcher(launcher: Box<dyn Launcher>, config: &AppConfig) -> Self {
        let retry = &config.retry;
        Self {
            session: Mutex::new(Session {
                supervisor: ProcessSupervisor::new(launcher, config.server.stop_grace()),
                correlator: RequestCorrelator::new(),
                capabilities: CapabilityCache::new(),
                invoker: AnalysisInvoker::new(&config.analysis),
                policy: EscalationPolicy::new(),
                backoff: SoftBackoff::new(
                    Duration::from_millis(retry.soft_base_ms),
                    Duration::from_millis(retry.soft_max_ms),
                ),
            }),
            generation: AtomicU64::new(0),
            budgets: Budgets {
                list_tools: config.timeouts.list_tools(),
                analyze: config.timeouts.analyze(),
                retry_interval: retry.interval(),
            },
        }
    }

    /// Launch the server now instead of on first use.
    pub async fn start(&self) -> Result<(), ClientError> {
        self.session.lock().await.ensure_running().await
    }

    pub async fn stop(&self) {
        self.session.lock().await.supervisor.stop().await;
        info!("Vision client stopped");
    }

    pub async fn restart(&self) -> Result<(), ClientError> {
        self.session.lock().await.restart().await
    }

    /// Analyze `image` with `prompt`, retrying until the server produces
    /// real analysis text.
    ///
    /// The only non-text outcome is `Superseded`: a newer `analyze` call
    /// started while this one was still retrying.
    pub async fn analyze(&self, image: impl AsRef<Path>, prompt: &str) -> Result<String, Superseded> {
        let request = AnalysisRequest::new(image.as_ref(), prompt);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut guard = self.session.lock().await;
        let session = &mut *guard;

        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match session.attempt(&request, self.budgets).await {
                Ok(text) => {
                    session.succeeded();
                    info!("Vision analysis done after {attempt} attempt(s): {} chars", text.len());
                    return Ok(text);
                }
                Err(e) => session.failed(attempt, &e).await,
            }

            if self.superseded(generation) {
                info!("Abandoning superseded vision request after {attempt} attempt(s)");
                return Err(Superseded);
            }
            tokio::time::sleep(self.budgets.retry_interval).await;
            if self.superseded(generation) {
                info!("Abandoning superseded vision request after {attempt} attempt(s)");
                return Err(Superseded);
            }
        }
    }

    /// One attempt, for callers that can go a cycle without analysis.
    ///
    /// After a failure analysis is disabled for an exponentially growing
    /// window; calls inside the window return `None` without touching the
    /// server.
    pub async fn analyze_or_skip(&self, image: impl AsRef<Path>, prompt: &str) -> Option<String> {
        let request = AnalysisRequest::new(image.as_ref(), prompt);
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.session.lock().await;
        let session = &mut *guard;

        if let Some(left) = session.backoff.remaining() {
            debug!("Vision analysis skipped, {}s of backoff left", left.as_secs());
            return None;
        }
        match session.attempt(&request, self.budgets).await {
            Ok(text) => {
                session.succeeded();
                Some(text)
            }
            Err(e) => {
                session.failed(1, &e).await;
                session.backoff.on_failure();
                None
            }
        }
    }

    /// The server's tool list, fetching it if this lifetime hasn't yet.
    pub async fn capabilities(&self) -> Result<Vec<CapabilityDescriptor>, ClientError> {
        let mut guard = self.session.lock().await;
        let session = &mut *guard;
        session.ensure_running().await?;
        let transport = session.supervisor.transport()?;
        session
            .capabilities
            .ensure(&mut session.correlator, transport, self.budgets.list_tools)
            .await?;
        Ok(session.capabilities.tools().to_vec())
    }

    pub async fn status(&self) -> ClientStatus {
        let mut guard = self.session.lock().await;
        let s = &mut *guard;
        ClientStatus {
            connected: s.supervisor.is_alive(),
            pid: s.supervisor.pid(),
            launches: s.supervisor.launches(),
            next_id: s.correlator.next_id(),
            state: s.policy.state(),
            failures: s.policy.failures(),
            stale_drained: s.correlator.stale_total(),
            tools_cached: s.capabilities.tools().len(),
        }
    }

    fn superseded(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }
}
