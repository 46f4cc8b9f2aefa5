//! Scripted workflow execution against a browser session.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use visor_browser::{BrowserError, BrowserSession};

/// One step of a scripted workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkflowStep {
    /// Navigate to a URL.
    Navigate {
        /// Target URL.
        url: String,
    },
    /// Click the first element matching a selector.
    Click {
        /// CSS selector.
        selector: String,
    },
    /// Fill an input element. Pausable by a live control channel.
    Input {
        /// CSS selector.
        selector: String,
        /// Value to enter.
        value: String,
    },
    /// Wait for an element to appear.
    Wait {
        /// CSS selector.
        selector: String,
        /// Maximum wait in milliseconds.
        #[serde(default = "default_wait_timeout")]
        timeout_ms: u64,
    },
}

fn default_wait_timeout() -> u64 {
    10_000
}

/// Errors from workflow execution.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A browser command failed.
    #[error("browser error at step {step}: {source}")]
    Browser {
        /// Index of the failing step.
        step: usize,
        /// The underlying browser error.
        #[source]
        source: BrowserError,
    },
}

/// Result summary of a workflow run.
#[derive(Clone, Debug, Serialize)]
pub struct WorkflowReport {
    /// Steps in the script.
    pub steps_total: usize,
    /// Steps completed before stop or failure.
    pub steps_completed: usize,
}

/// Shared pause flag between a workflow run and a live control channel.
///
/// While raised, `input` steps wait. Used for interactive password entry,
/// where the viewer types through the control channel instead of the script.
#[derive(Clone)]
pub struct PauseGate {
    tx: Arc<watch::Sender<bool>>,
}

impl PauseGate {
    /// Create an unpaused gate.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the pause flag.
    pub fn pause(&self) {
        let _ = self.tx.send(true);
    }

    /// Lower the pause flag.
    pub fn resume(&self) {
        let _ = self.tx.send(false);
    }

    /// Whether the flag is raised.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes a scripted list of actions against one browser session.
pub struct WorkflowRunner {
    session: Arc<dyn BrowserSession>,
    pause: PauseGate,
}

impl WorkflowRunner {
    /// Create a runner over a browser session with a pause gate.
    #[must_use]
    pub fn new(session: Arc<dyn BrowserSession>, pause: PauseGate) -> Self {
        Self { session, pause }
    }

    /// Run all steps in order.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Browser`] at the first failing step; the
    /// report inside the error context reflects completed steps.
    pub async fn run(&self, steps: &[WorkflowStep]) -> Result<WorkflowReport, WorkflowError> {
        let mut completed = 0;
        for (index, step) in steps.iter().enumerate() {
            if matches!(step, WorkflowStep::Input { .. }) {
                self.wait_while_paused().await;
            }
            info!(step = index, total = steps.len(), "executing workflow step");
            self.execute(step)
                .await
                .map_err(|source| WorkflowError::Browser {
                    step: index,
                    source,
                })?;
            completed += 1;
        }
        Ok(WorkflowReport {
            steps_total: steps.len(),
            steps_completed: completed,
        })
    }

    async fn execute(&self, step: &WorkflowStep) -> Result<(), BrowserError> {
        match step {
            WorkflowStep::Navigate { url } => self.session.navigate(url).await,
            WorkflowStep::Click { selector } => self.session.click_selector(selector).await,
            WorkflowStep::Input { selector, value } => self.session.fill(selector, value).await,
            WorkflowStep::Wait {
                selector,
                timeout_ms,
            } => self.session.wait_for(selector, *timeout_ms).await,
        }
    }

    async fn wait_while_paused(&self) {
        let mut rx = self.pause.subscribe();
        // wait_for returns immediately when already unpaused.
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::time::Duration;
    use visor_browser::{BridgeHandler, EnvMetadata, MouseButton, NavigationHandler};
    use visor_store::{Cookie, OriginState, StorageStateBlob};

    #[derive(Default)]
    struct ScriptedBrowser {
        actions: Mutex<Vec<String>>,
        fail_on: Mutex<Option<String>>,
    }

    #[async_trait]
    impl BrowserSession for ScriptedBrowser {
        async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
            self.record(format!("navigate:{url}"))
        }
        fn current_url(&self) -> Option<String> {
            None
        }
        fn on_frame_navigated(&self, _handler: NavigationHandler) {}
        async fn evaluate(&self, _script: &str) -> Result<Value, BrowserError> {
            Ok(Value::Null)
        }
        async fn expose_bridge(
            &self,
            _name: &str,
            _handler: BridgeHandler,
        ) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn cookies(&self) -> Result<Vec<Cookie>, BrowserError> {
            Ok(Vec::new())
        }
        async fn extract_local_storage(&self) -> Result<Vec<OriginState>, BrowserError> {
            Ok(Vec::new())
        }
        async fn env_metadata(&self) -> Result<EnvMetadata, BrowserError> {
            Ok(EnvMetadata::default())
        }
        async fn restore_storage_state(
            &self,
            _blob: &StorageStateBlob,
        ) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn mouse_move(&self, _x: f64, _y: f64) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn mouse_down(&self, _button: MouseButton) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn mouse_up(&self, _button: MouseButton) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn mouse_click(
            &self,
            _x: f64,
            _y: f64,
            _button: MouseButton,
        ) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn mouse_dblclick(&self, _x: f64, _y: f64) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn mouse_wheel(
            &self,
            _dx: f64,
            _dy: f64,
            _x: f64,
            _y: f64,
        ) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn keyboard_press(&self, _key: &str) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn keyboard_down(&self, _key: &str) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn keyboard_up(&self, _key: &str) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn click_selector(&self, selector: &str) -> Result<(), BrowserError> {
            self.record(format!("click:{selector}"))
        }
        async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError> {
            self.record(format!("fill:{selector}:{value}"))
        }
        async fn wait_for(&self, selector: &str, _timeout_ms: u64) -> Result<(), BrowserError> {
            self.record(format!("wait:{selector}"))
        }
        async fn close(&self) -> Result<(), BrowserError> {
            Ok(())
        }
    }

    impl ScriptedBrowser {
        fn record(&self, action: String) -> Result<(), BrowserError> {
            if self.fail_on.lock().as_deref() == Some(action.as_str()) {
                return Err(BrowserError::ActionFailed {
                    action,
                    reason: "scripted failure".into(),
                });
            }
            self.actions.lock().push(action);
            Ok(())
        }
    }

    fn login_steps() -> Vec<WorkflowStep> {
        vec![
            WorkflowStep::Navigate {
                url: "https://accounts.google.com".into(),
            },
            WorkflowStep::Wait {
                selector: "#identifierId".into(),
                timeout_ms: 5000,
            },
            WorkflowStep::Input {
                selector: "#identifierId".into(),
                value: "user@example.com".into(),
            },
            WorkflowStep::Click {
                selector: "#identifierNext".into(),
            },
        ]
    }

    #[tokio::test]
    async fn runs_steps_in_order() {
        let browser = Arc::new(ScriptedBrowser::default());
        let runner = WorkflowRunner::new(browser.clone(), PauseGate::new());
        let report = runner.run(&login_steps()).await.unwrap();
        assert_eq!(report.steps_completed, 4);
        assert_eq!(
            browser.actions.lock().as_slice(),
            [
                "navigate:https://accounts.google.com",
                "wait:#identifierId",
                "fill:#identifierId:user@example.com",
                "click:#identifierNext",
            ]
        );
    }

    #[tokio::test]
    async fn failure_reports_step_index() {
        let browser = Arc::new(ScriptedBrowser::default());
        *browser.fail_on.lock() = Some("click:#identifierNext".into());
        let runner = WorkflowRunner::new(browser.clone(), PauseGate::new());
        let err = runner.run(&login_steps()).await.unwrap_err();
        let WorkflowError::Browser { step, .. } = err;
        assert_eq!(step, 3);
    }

    #[tokio::test]
    async fn input_steps_wait_for_resume() {
        let browser = Arc::new(ScriptedBrowser::default());
        let gate = PauseGate::new();
        gate.pause();

        let runner = WorkflowRunner::new(browser.clone(), gate.clone());
        let steps = vec![WorkflowStep::Input {
            selector: "#password".into(),
            value: "secret".into(),
        }];
        let run = tokio::spawn(async move { runner.run(&steps).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(browser.actions.lock().is_empty());

        gate.resume();
        let report = run.await.unwrap().unwrap();
        assert_eq!(report.steps_completed, 1);
        assert_eq!(browser.actions.lock().len(), 1);
    }

    #[tokio::test]
    async fn non_input_steps_ignore_pause() {
        let browser = Arc::new(ScriptedBrowser::default());
        let gate = PauseGate::new();
        gate.pause();

        let runner = WorkflowRunner::new(browser.clone(), gate.clone());
        let steps = vec![WorkflowStep::Navigate {
            url: "https://example.com".into(),
        }];
        let report = runner.run(&steps).await.unwrap();
        assert_eq!(report.steps_completed, 1);
    }

    #[test]
    fn pause_gate_flag() {
        let gate = PauseGate::new();
        assert!(!gate.is_paused());
        gate.pause();
        assert!(gate.is_paused());
        gate.resume();
        assert!(!gate.is_paused());
    }

    #[test]
    fn steps_deserialize_from_workflow_file() {
        let raw = r##"[
            {"action": "navigate", "url": "https://docs.google.com"},
            {"action": "wait", "selector": "#main"},
            {"action": "input", "selector": "#q", "value": "hello"},
            {"action": "click", "selector": "#go"}
        ]"##;
        let steps: Vec<WorkflowStep> = serde_json::from_str(raw).unwrap();
        assert_eq!(steps.len(), 4);
        assert!(matches!(
            &steps[1],
            WorkflowStep::Wait { timeout_ms, .. } if *timeout_ms == 10_000
        ));
    }
}
