//! Media-engine boundary.
//!
//! The capture/encode pipeline is produced and managed by an external media
//! engine; streamwarden only sees its run-state and can nudge it (stop +
//! immediate restart in place, without terminating the hosting process).
//! [`EngineHandle`] is the seam: production code wraps the engine process,
//! tests use the scriptable mock constructors.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Run-state reported by the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Stopped,
    Starting,
    /// Paused/buffering: a non-terminal intermediate state. The pipeline is
    /// alive but not yet (or no longer) producing output.
    Buffering,
    Running,
    Error,
}

impl PipelineState {
    /// Intermediate states count toward stuck detection; terminal states and
    /// `Running` reset it.
    #[must_use]
    pub fn is_intermediate(self) -> bool {
        matches!(self, Self::Starting | Self::Buffering)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Buffering => write!(f, "buffering"),
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Point-in-time engine probe result.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub state: PipelineState,
    /// Whether the engine's own process is alive.
    pub process_alive: bool,
    /// Last error message surfaced by the engine, if any.
    pub last_error: Option<String>,
}

/// Handle to the media engine.
///
/// Cloneable; all probe/control calls are async and must be awaited under a
/// bounded timeout by callers so a hung engine cannot stall the control loop.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    backend: EngineBackend,
}

#[derive(Debug, Clone)]
enum EngineBackend {
    Command(std::sync::Arc<CommandEngine>),
    Mock(std::sync::Arc<Mutex<MockEngine>>),
}

impl EngineHandle {
    /// Wrap an externally launched engine process.
    #[must_use]
    pub fn command(engine: CommandEngine) -> Self {
        Self {
            backend: EngineBackend::Command(std::sync::Arc::new(engine)),
        }
    }

    /// Probe the engine's current status.
    pub async fn status(&self) -> Result<EngineStatus> {
        match &self.backend {
            EngineBackend::Command(engine) => engine.status().await,
            EngineBackend::Mock(mock) => {
                let mut guard = mock.lock().unwrap_or_else(|e| e.into_inner());
                guard.status()
            }
        }
    }

    /// Stop and immediately restart the pipeline in place.
    ///
    /// This is the "nudge" tier of the escalation ladder: the hosting
    /// process keeps running, only the pipeline is cycled.
    pub async fn restart_pipeline(&self) -> Result<()> {
        match &self.backend {
            EngineBackend::Command(engine) => engine.restart_pipeline().await,
            EngineBackend::Mock(mock) => {
                let mut guard = mock.lock().unwrap_or_else(|e| e.into_inner());
                guard.nudges += 1;
                if guard.fail_nudge {
                    Err(Error::Engine("mock nudge failure".to_string()))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Orderly engine shutdown used during process teardown.
    pub async fn stop(&self) -> Result<()> {
        match &self.backend {
            EngineBackend::Command(engine) => engine.stop().await,
            EngineBackend::Mock(_) => Ok(()),
        }
    }
}

/// Engine adapter that launches and supervises the external engine command.
///
/// The engine binary (gst-launch pipeline, mediamtx wrapper, etc.) is
/// configuration; streamwarden only observes the child's liveness and the
/// output directory it is expected to keep fresh.
#[derive(Debug)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
    /// Directory the engine writes output segments into; freshness of those
    /// artifacts distinguishes `Running` from `Buffering`.
    output_dir: PathBuf,
    /// An artifact older than this means the pipeline is not producing.
    artifact_fresh_within: Duration,
    child: Mutex<Option<Child>>,
    started_at_ms: Mutex<Option<u64>>,
}

/// Grace period after spawn during which a quiet engine reports `Starting`
/// rather than `Buffering`.
const STARTUP_GRACE: Duration = Duration::from_secs(10);

/// Bound on the stop half of a pipeline nudge.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

impl CommandEngine {
    /// Create an adapter for the given engine command line.
    #[must_use]
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        output_dir: PathBuf,
        artifact_fresh_within: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            output_dir,
            artifact_fresh_within,
            child: Mutex::new(None),
            started_at_ms: Mutex::new(None),
        }
    }

    /// Spawn the engine process if it is not already running.
    pub fn spawn(&self) -> Result<()> {
        let mut guard = self.child.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(child) = guard.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return Ok(());
            }
        }
        info!(program = %self.program, "spawning media engine");
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Engine(format!("failed to spawn {}: {e}", self.program)))?;
        *guard = Some(child);
        drop(guard);
        let mut started = self.started_at_ms.lock().unwrap_or_else(|e| e.into_inner());
        *started = Some(crate::epoch_ms());
        Ok(())
    }

    async fn status(&self) -> Result<EngineStatus> {
        let (alive, exit_error) = {
            let mut guard = self.child.lock().unwrap_or_else(|e| e.into_inner());
            match guard.as_mut() {
                None => (false, None),
                Some(child) => match child.try_wait() {
                    Ok(None) => (true, None),
                    Ok(Some(status)) => (false, Some(format!("engine exited: {status}"))),
                    Err(e) => (false, Some(format!("engine wait failed: {e}"))),
                },
            }
        };

        if !alive {
            return Ok(EngineStatus {
                state: if exit_error.is_some() {
                    PipelineState::Error
                } else {
                    PipelineState::Stopped
                },
                process_alive: false,
                last_error: exit_error,
            });
        }

        let state = if self.artifacts_fresh() {
            PipelineState::Running
        } else if self.within_startup_grace() {
            PipelineState::Starting
        } else {
            PipelineState::Buffering
        };

        Ok(EngineStatus {
            state,
            process_alive: true,
            last_error: None,
        })
    }

    fn within_startup_grace(&self) -> bool {
        let started = self.started_at_ms.lock().unwrap_or_else(|e| e.into_inner());
        started.is_some_and(|ts| {
            crate::epoch_ms().saturating_sub(ts)
                < u64::try_from(STARTUP_GRACE.as_millis()).unwrap_or(u64::MAX)
        })
    }

    /// Whether any output artifact was modified within the freshness bound.
    fn artifacts_fresh(&self) -> bool {
        crate::reclaim::newest_artifact_age(&self.output_dir)
            .is_some_and(|age| age <= self.artifact_fresh_within)
    }

    async fn restart_pipeline(&self) -> Result<()> {
        warn!(program = %self.program, "pipeline nudge: stopping engine for in-place restart");
        self.stop().await?;
        self.spawn()
    }

    async fn stop(&self) -> Result<()> {
        let child = {
            let mut guard = self.child.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        let Some(mut child) = child else {
            return Ok(());
        };
        // Kill with a bounded wait; a wedged child must not stall the nudge.
        child.start_kill().ok();
        match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                info!(%status, "media engine stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Engine(format!("engine wait failed: {e}"))),
            Err(_) => Err(Error::Engine("engine did not exit within stop timeout".to_string())),
        }
    }
}

/// Scriptable mock engine used by sampler/supervisor tests.
#[derive(Debug)]
pub struct MockEngine {
    /// Remaining states to report, consumed front-first; the last entry
    /// repeats once the script is exhausted.
    script: Vec<PipelineState>,
    position: usize,
    /// Probe calls fail entirely (simulates an unreachable engine).
    fail_probe: bool,
    fail_nudge: bool,
    /// Number of pipeline nudges received.
    pub nudges: u32,
}

impl MockEngine {
    fn status(&mut self) -> Result<EngineStatus> {
        if self.fail_probe {
            return Err(Error::Engine("mock engine unreachable".to_string()));
        }
        let state = self
            .script
            .get(self.position)
            .or_else(|| self.script.last())
            .copied()
            .unwrap_or(PipelineState::Running);
        if self.position < self.script.len() {
            self.position += 1;
        }
        Ok(EngineStatus {
            state,
            process_alive: true,
            last_error: if state == PipelineState::Error {
                Some("mock pipeline error".to_string())
            } else {
                None
            },
        })
    }
}

/// A healthy mock engine that always reports `Running`.
#[must_use]
pub fn mock_engine_handle() -> EngineHandle {
    mock_engine_with_script(vec![PipelineState::Running])
}

/// A mock engine whose probes fail outright.
#[must_use]
pub fn mock_engine_handle_failing() -> EngineHandle {
    EngineHandle {
        backend: EngineBackend::Mock(std::sync::Arc::new(Mutex::new(MockEngine {
            script: Vec::new(),
            position: 0,
            fail_probe: true,
            fail_nudge: false,
            nudges: 0,
        }))),
    }
}

/// A mock engine that plays back the given state sequence, repeating the
/// final state once exhausted.
#[must_use]
pub fn mock_engine_with_script(script: Vec<PipelineState>) -> EngineHandle {
    EngineHandle {
        backend: EngineBackend::Mock(std::sync::Arc::new(Mutex::new(MockEngine {
            script,
            position: 0,
            fail_probe: false,
            fail_nudge: false,
            nudges: 0,
        }))),
    }
}

impl EngineHandle {
    /// Number of nudges a mock engine has received. Panics on non-mock
    /// handles; test-support only.
    #[must_use]
    pub fn mock_nudge_count(&self) -> u32 {
        match &self.backend {
            EngineBackend::Mock(mock) => {
                mock.lock().unwrap_or_else(|e| e.into_inner()).nudges
            }
            EngineBackend::Command(_) => panic!("mock_nudge_count on a command engine"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_engine_reports_running() {
        let handle = mock_engine_handle();
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, PipelineState::Running);
        assert!(status.process_alive);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn failing_mock_returns_error() {
        let handle = mock_engine_handle_failing();
        assert!(handle.status().await.is_err());
    }

    #[tokio::test]
    async fn script_plays_back_and_repeats_last_state() {
        let handle = mock_engine_with_script(vec![
            PipelineState::Starting,
            PipelineState::Buffering,
            PipelineState::Running,
        ]);
        assert_eq!(handle.status().await.unwrap().state, PipelineState::Starting);
        assert_eq!(handle.status().await.unwrap().state, PipelineState::Buffering);
        assert_eq!(handle.status().await.unwrap().state, PipelineState::Running);
        // Script exhausted: last state repeats.
        assert_eq!(handle.status().await.unwrap().state, PipelineState::Running);
    }

    #[tokio::test]
    async fn nudges_are_counted() {
        let handle = mock_engine_handle();
        handle.restart_pipeline().await.unwrap();
        handle.restart_pipeline().await.unwrap();
        assert_eq!(handle.mock_nudge_count(), 2);
    }

    #[test]
    fn intermediate_states() {
        assert!(PipelineState::Starting.is_intermediate());
        assert!(PipelineState::Buffering.is_intermediate());
        assert!(!PipelineState::Running.is_intermediate());
        assert!(!PipelineState::Stopped.is_intermediate());
        assert!(!PipelineState::Error.is_intermediate());
    }

    #[test]
    fn pipeline_state_serializes_snake_case() {
        let json = serde_json::to_string(&PipelineState::Buffering).unwrap();
        assert_eq!(json, "\"buffering\"");
    }
}
