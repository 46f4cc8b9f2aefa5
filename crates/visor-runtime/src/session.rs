//! Per-session lifecycle management.
//!
//! ```text
//! INIT → LOADING_STATE → BROWSER_STARTING → RECORDER_ATTACHING
//!      → STREAMING → WORKFLOW_RUNNING → FINALIZING → ENDED
//!                  ↘ FAILED (browser/workflow errors)
//! ```
//!
//! FINALIZING always attempts storage-state auto-save when enabled; auto-save
//! failures are logged and never change the terminal status.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, info, warn};

use visor_browser::{
    BrowserError, BrowserSession, CdpSession, LaunchOptions, RecorderBridge,
    RecorderBridgeConfig,
};
use visor_core::{SessionId, StreamingConfig};
use visor_store::{PriorityLoader, RecordMetadata, StorageStateBlob, StorageStateStore};
use visor_stream::{EventStreamer, StreamerRegistry};

use crate::workflow::{PauseGate, WorkflowRunner, WorkflowStep};

/// States of the per-session machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, nothing started.
    Init,
    /// Loading prior storage state.
    LoadingState,
    /// Launching the browser.
    BrowserStarting,
    /// Injecting the recorder, waiting for the first FullSnapshot.
    RecorderAttaching,
    /// Events flowing, workflow not yet started.
    Streaming,
    /// Workflow executing.
    WorkflowRunning,
    /// Auto-save and teardown.
    Finalizing,
    /// Terminal success.
    Ended,
    /// Terminal failure.
    Failed,
}

/// Launches browsers; a seam so tests and deployments can substitute.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Launch a new browser session.
    async fn launch(&self) -> Result<Arc<dyn BrowserSession>, BrowserError>;
}

/// Launcher backed by the CDP driver.
pub struct CdpLauncher {
    options: LaunchOptions,
}

impl CdpLauncher {
    /// Create a launcher with the given options.
    #[must_use]
    pub fn new(options: LaunchOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl BrowserLauncher for CdpLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserSession>, BrowserError> {
        let session = CdpSession::launch(&self.options).await?;
        Ok(Arc::new(session))
    }
}

/// Live state of one visual streaming session.
pub struct VisualSession {
    session_id: SessionId,
    owner_id: String,
    state: RwLock<SessionState>,
    degraded: AtomicBool,
    browser: RwLock<Option<Arc<dyn BrowserSession>>>,
    pause: PauseGate,
    streamer: Arc<EventStreamer>,
}

impl VisualSession {
    fn new(session_id: SessionId, owner_id: String, streamer: Arc<EventStreamer>) -> Self {
        Self {
            session_id,
            owner_id,
            state: RwLock::new(SessionState::Init),
            degraded: AtomicBool::new(false),
            browser: RwLock::new(None),
            pause: PauseGate::new(),
            streamer,
        }
    }

    /// The session id.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// The owning user.
    #[must_use]
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Whether recorder injection degraded the session.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// The browser handle, once the browser has started.
    #[must_use]
    pub fn browser(&self) -> Option<Arc<dyn BrowserSession>> {
        self.browser.read().clone()
    }

    /// The pause gate shared with control channels.
    #[must_use]
    pub fn pause_gate(&self) -> PauseGate {
        self.pause.clone()
    }

    /// The session's event streamer.
    #[must_use]
    pub fn streamer(&self) -> &Arc<EventStreamer> {
        &self.streamer
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.write();
        info!(session_id = %self.session_id, from = ?*state, to = ?next, "session state transition");
        *state = next;
    }

    fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::Relaxed);
        warn!(session_id = %self.session_id, "session degraded, events may be sparse");
    }
}

/// Terminal summary of a session run.
#[derive(Clone, Debug, Serialize)]
pub struct SessionOutcome {
    /// The session that ran.
    pub session_id: SessionId,
    /// Terminal state (`ended` or `failed`).
    pub state: SessionState,
    /// Whether the session was degraded.
    pub degraded: bool,
    /// Record id of the auto-saved storage state, when one was written.
    pub auto_saved_record: Option<String>,
    /// Workflow steps completed.
    pub steps_completed: usize,
    /// Error description for failed sessions.
    pub error: Option<String>,
}

/// Errors surfaced to callers that cannot even start a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The browser could not be launched.
    #[error("browser launch failed: {0}")]
    Launch(#[from] BrowserError),
}

/// Creates and drives visual streaming sessions.
pub struct SessionManager {
    config: StreamingConfig,
    registry: Arc<StreamerRegistry>,
    store: Option<Arc<StorageStateStore>>,
    loader: PriorityLoader,
    launcher: Arc<dyn BrowserLauncher>,
    sessions: DashMap<String, Arc<VisualSession>>,
}

impl SessionManager {
    /// Wire up a manager.
    #[must_use]
    pub fn new(
        config: StreamingConfig,
        registry: Arc<StreamerRegistry>,
        store: Option<Arc<StorageStateStore>>,
        loader: PriorityLoader,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            loader,
            launcher,
            sessions: DashMap::new(),
        }
    }

    /// The streamer registry shared with the server.
    #[must_use]
    pub fn registry(&self) -> &Arc<StreamerRegistry> {
        &self.registry
    }

    /// The storage-state store, when persistence is configured.
    #[must_use]
    pub fn store(&self) -> Option<&Arc<StorageStateStore>> {
        self.store.as_ref()
    }

    /// The streaming config.
    #[must_use]
    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Resolve a live session.
    #[must_use]
    pub fn session(&self, session_id: &SessionId) -> Option<Arc<VisualSession>> {
        self.sessions
            .get(session_id.as_str())
            .map(|s| Arc::clone(s.value()))
    }

    /// Browser handle for a live session (control channel entry point).
    #[must_use]
    pub fn browser_for(&self, session_id: &SessionId) -> Option<Arc<dyn BrowserSession>> {
        self.session(session_id).and_then(|s| s.browser())
    }

    /// Attach an externally created browser under a session id.
    ///
    /// For embedders that own the browser lifecycle elsewhere: the session
    /// becomes resolvable by the stream/control channels but is not driven
    /// through the workflow state machine.
    #[must_use]
    pub fn attach_session(
        &self,
        session_id: &SessionId,
        owner_id: &str,
        browser: Arc<dyn BrowserSession>,
    ) -> Arc<VisualSession> {
        let streamer = self.registry.register(session_id);
        let session = Arc::new(VisualSession::new(
            session_id.clone(),
            owner_id.to_string(),
            streamer,
        ));
        *session.browser.write() = Some(browser);
        session.set_state(SessionState::Streaming);
        let _ = self
            .sessions
            .insert(session_id.as_str().to_string(), Arc::clone(&session));
        session
    }

    /// Remove an attached session and its streamer.
    pub fn detach_session(&self, session_id: &SessionId) {
        let _ = self.sessions.remove(session_id.as_str());
        let _ = self.registry.remove(session_id);
    }

    /// Run a workflow in a fresh session, returning its terminal summary.
    pub async fn run_workflow(
        &self,
        owner_id: &str,
        workflow_id: &str,
        steps: &[WorkflowStep],
    ) -> SessionOutcome {
        let session_id = SessionId::new();
        let streamer = self.registry.register(&session_id);
        let session = Arc::new(VisualSession::new(
            session_id.clone(),
            owner_id.to_string(),
            Arc::clone(&streamer),
        ));
        let _ = self
            .sessions
            .insert(session_id.as_str().to_string(), Arc::clone(&session));

        let mut outcome = SessionOutcome {
            session_id: session_id.clone(),
            state: SessionState::Failed,
            degraded: false,
            auto_saved_record: None,
            steps_completed: 0,
            error: None,
        };

        // LOADING_STATE — prior storage state, gated by feature flag.
        session.set_state(SessionState::LoadingState);
        let prior = if self.config.feature_use_cookies {
            self.loader
                .load(owner_id, &[], self.config.cookie_verify_ttl_hours)
        } else {
            None
        };

        // BROWSER_STARTING
        session.set_state(SessionState::BrowserStarting);
        let browser = match self.launcher.launch().await {
            Ok(browser) => browser,
            Err(err) => {
                error!(session_id = %session_id, error = %err, "browser launch failed");
                outcome.error = Some(err.to_string());
                session.set_state(SessionState::Failed);
                self.teardown(&session, None).await;
                return outcome;
            }
        };
        *session.browser.write() = Some(Arc::clone(&browser));
        if let Some(prior) = prior {
            match browser.restore_storage_state(&prior.blob).await {
                Ok(()) => info!(session_id = %session_id, source = ?prior.source, "restored prior storage state"),
                Err(err) => warn!(session_id = %session_id, error = %err, "storage state restore failed"),
            }
        }

        // RECORDER_ATTACHING — inject, then wait for the first FullSnapshot.
        session.set_state(SessionState::RecorderAttaching);
        let streamer_task = streamer.start();
        let ingest = streamer.ingest_handle();
        let bridge_result = RecorderBridge::attach(
            Arc::clone(&browser),
            Arc::new(move |payload: String| {
                let _ = ingest.submit_raw(&payload);
            }),
            RecorderBridgeConfig::default(),
        )
        .await;
        if let Err(err) = bridge_result {
            warn!(session_id = %session_id, error = %err, "recorder attach failed after retry");
            session.mark_degraded();
        }
        if !self.wait_for_snapshot(&streamer).await {
            warn!(session_id = %session_id, "no FullSnapshot before deadline");
            session.mark_degraded();
        }

        // STREAMING → WORKFLOW_RUNNING
        session.set_state(SessionState::Streaming);
        session.set_state(SessionState::WorkflowRunning);
        let runner = WorkflowRunner::new(Arc::clone(&browser), session.pause_gate());
        let workflow_result = runner.run(steps).await;
        match &workflow_result {
            Ok(report) => outcome.steps_completed = report.steps_completed,
            Err(err) => {
                let crate::workflow::WorkflowError::Browser { step, .. } = err;
                outcome.steps_completed = *step;
                error!(session_id = %session_id, error = %err, "workflow failed");
                outcome.error = Some(err.to_string());
            }
        }

        // FINALIZING — auto-save runs regardless of workflow result.
        session.set_state(SessionState::Finalizing);
        if self.config.auto_save_session_state {
            outcome.auto_saved_record = self
                .auto_save(owner_id, workflow_id, browser.as_ref())
                .await;
        }

        self.teardown(&session, Some(streamer_task)).await;

        outcome.degraded = session.is_degraded();
        outcome.state = if workflow_result.is_ok() {
            SessionState::Ended
        } else {
            SessionState::Failed
        };
        session.set_state(outcome.state);
        outcome
    }

    /// Capture and persist the browser's storage state.
    ///
    /// Never fails the session: every error path logs a warning and returns
    /// `None`.
    async fn auto_save(
        &self,
        owner_id: &str,
        workflow_id: &str,
        browser: &dyn BrowserSession,
    ) -> Option<String> {
        let store = match &self.store {
            Some(store) => store,
            None => {
                warn!("auto-save skipped: no storage-state store configured");
                return None;
            }
        };
        let cookies = match browser.cookies().await {
            Ok(cookies) => cookies,
            Err(err) => {
                warn!(error = %err, "auto-save: cookie extraction failed");
                return None;
            }
        };
        let origins = match browser.extract_local_storage().await {
            Ok(origins) => origins,
            Err(err) => {
                warn!(error = %err, "auto-save: local storage extraction failed");
                Vec::new()
            }
        };
        let env_metadata = match browser.env_metadata().await {
            Ok(meta) => serde_json::to_value(meta).ok(),
            Err(err) => {
                warn!(error = %err, "auto-save: env metadata extraction failed");
                None
            }
        };
        let blob = StorageStateBlob {
            cookies,
            origins,
            env_metadata,
        };
        let metadata = RecordMetadata {
            workflow_id: Some(workflow_id.to_string()),
            auto_saved: Some(true),
            ..RecordMetadata::default()
        };
        match store.save(owner_id, blob, metadata) {
            Ok(record) => {
                info!(
                    record_id = %record.record_id,
                    status = record.status.as_str(),
                    "auto-saved storage state"
                );
                Some(record.record_id)
            }
            Err(err) => {
                warn!(error = %err, "auto-save failed");
                None
            }
        }
    }

    async fn wait_for_snapshot(&self, streamer: &Arc<EventStreamer>) -> bool {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.snapshot_wait_secs);
        loop {
            if streamer.status().streaming_ready {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn teardown(
        &self,
        session: &Arc<VisualSession>,
        streamer_task: Option<tokio::task::JoinHandle<()>>,
    ) {
        let _ = self.sessions.remove(session.session_id.as_str());
        session.streamer.shutdown();
        if let Some(task) = streamer_task {
            // Bounded grace for in-flight fan-out.
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
        let _ = self.registry.remove(&session.session_id);
        if let Some(browser) = session.browser() {
            if let Err(err) = browser.close().await {
                warn!(session_id = %session.session_id, error = %err, "browser close failed");
            }
        }
    }
}
