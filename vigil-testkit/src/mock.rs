use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use vigil::{
    FindingSummary, ReportArtifact, ResultReporter, ScanEngine, ScanError, ScanResultPayload,
};

#[derive(Clone, Debug)]
enum Failure {
    Always(String),
    Times { remaining: u32, message: String },
}

#[derive(Default)]
struct Script {
    failures: HashMap<String, Failure>,
    fail_all: Option<String>,
    delays: HashMap<String, Duration>,
    held: HashSet<String>,
    panics: HashSet<String>,
    released: bool,
    findings: FindingSummary,
    calls: Vec<String>,
    shutdowns: usize,
}

impl Script {
    /// Consume one scripted failure for `target`, if any.
    fn take_failure(&mut self, target: &str) -> Option<String> {
        if let Some(message) = &self.fail_all {
            return Some(message.clone());
        }
        match self.failures.get_mut(target)? {
            Failure::Always(message) => Some(message.clone()),
            Failure::Times { remaining, message } => {
                if *remaining == 0 {
                    return None;
                }
                *remaining -= 1;
                Some(message.clone())
            }
        }
    }
}

/// [`ScanEngine`] whose behaviour per target is scripted by the test.
///
/// Unscripted targets succeed immediately with a report at
/// `memory://reports/<call number>`.
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    script: Arc<Mutex<Script>>,
    called: Arc<Notify>,
    release: Arc<Notify>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every scan of `target`.
    pub fn fail_target(&self, target: &str, message: &str) {
        self.script
            .lock()
            .failures
            .insert(target.to_string(), Failure::Always(message.to_string()));
    }

    /// Fail the next `times` scans of `target`, then succeed.
    pub fn fail_target_times(&self, target: &str, times: u32, message: &str) {
        self.script.lock().failures.insert(
            target.to_string(),
            Failure::Times {
                remaining: times,
                message: message.to_string(),
            },
        );
    }

    /// Fail every scan regardless of target.
    pub fn fail_all(&self, message: &str) {
        self.script.lock().fail_all = Some(message.to_string());
    }

    /// Panic inside every scan of `target`.
    pub fn panic_target(&self, target: &str) {
        self.script.lock().panics.insert(target.to_string());
    }

    /// Sleep on the tokio clock before scanning `target`.
    pub fn delay_target(&self, target: &str, delay: Duration) {
        self.script.lock().delays.insert(target.to_string(), delay);
    }

    /// Block scans of `target` until [`ScriptedEngine::release`] is called.
    pub fn hold_target(&self, target: &str) {
        self.script.lock().held.insert(target.to_string());
    }

    pub fn release(&self) {
        self.script.lock().released = true;
        self.release.notify_waiters();
    }

    pub fn set_findings(&self, findings: FindingSummary) {
        self.script.lock().findings = findings;
    }

    /// Targets scanned so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.script.lock().calls.clone()
    }

    pub fn calls_for(&self, target: &str) -> usize {
        self.script
            .lock()
            .calls
            .iter()
            .filter(|call| call.as_str() == target)
            .count()
    }

    pub fn assert_scan_count_eq(&self, expected: usize) {
        let actual = self.script.lock().calls.len();
        assert_eq!(
            actual, expected,
            "Expected {} scans, got {}",
            expected, actual
        );
    }

    pub fn shutdown_count(&self) -> usize {
        self.script.lock().shutdowns
    }

    /// Wait until `target` has been handed to the engine at least once.
    pub async fn wait_for_scan(&self, target: &str) {
        loop {
            let called = self.called.notified();
            tokio::pin!(called);
            called.as_mut().enable();
            if self.calls_for(target) > 0 {
                return;
            }
            called.await;
        }
    }

    async fn wait_for_release(&self) {
        loop {
            let released = self.release.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if self.script.lock().released {
                return;
            }
            released.await;
        }
    }
}

impl std::fmt::Debug for ScriptedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let script = self.script.lock();
        f.debug_struct("ScriptedEngine")
            .field("calls", &script.calls.len())
            .field("held", &script.held)
            .field("released", &script.released)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ScanEngine for ScriptedEngine {
    async fn run_target_scan(
        &self,
        target: &str,
        _max_duration: Duration,
    ) -> Result<ReportArtifact, ScanError> {
        let (call, delay, held, panics, failure, findings) = {
            let mut script = self.script.lock();
            script.calls.push(target.to_string());
            let failure = script.take_failure(target);
            (
                script.calls.len(),
                script.delays.get(target).copied(),
                script.held.contains(target),
                script.panics.contains(target),
                failure,
                script.findings,
            )
        };
        self.called.notify_waiters();

        if held {
            self.wait_for_release().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if panics {
            panic!("scanner crashed on {target}");
        }
        if let Some(message) = failure {
            return Err(ScanError::Engine(message));
        }
        Ok(ReportArtifact::new(format!("memory://reports/{call}")).with_findings(findings))
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.script.lock().shutdowns += 1;
        Ok(())
    }
}

/// [`ResultReporter`] that keeps every payload it is handed.
#[derive(Clone)]
pub struct RecordingReporter {
    posted: Arc<Mutex<Vec<ScanResultPayload>>>,
    failing: bool,
    panicking: bool,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self {
            posted: Arc::new(Mutex::new(Vec::new())),
            failing: false,
            panicking: false,
        }
    }

    /// Record payloads but report every delivery as failed.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::new()
        }
    }

    /// Record payloads, then panic on every delivery.
    pub fn panicking() -> Self {
        Self {
            panicking: true,
            ..Self::new()
        }
    }

    pub fn posted(&self) -> Vec<ScanResultPayload> {
        self.posted.lock().clone()
    }

    pub fn assert_posted_count_eq(&self, expected: usize) {
        let actual = self.posted.lock().len();
        assert_eq!(
            actual, expected,
            "Expected {} posted results, got {}",
            expected, actual
        );
    }
}

impl Default for RecordingReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultReporter for RecordingReporter {
    async fn post_result(&self, payload: &ScanResultPayload) -> anyhow::Result<()> {
        self.posted.lock().push(payload.clone());
        if self.panicking {
            panic!("reporter crashed on {}", payload.target);
        }
        if self.failing {
            anyhow::bail!("result endpoint unavailable");
        }
        Ok(())
    }
}
