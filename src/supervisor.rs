//! Lifecycle of the external transcoder.
//!
//! The supervisor owns [`PipelineState`] and is driven from a single
//! coordinator task: ticks carry fresh metadata, and a per-process watcher
//! reports exits as [`PipelineEvent`]s. Every start goes through the same
//! sequence (stop the old process and confirm it exited, spawn the new one,
//! install its buffer), so at most one transcoder is ever live.

use log::{debug, error, info, warn};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_stream::StreamExt;
use tokio_util::io::ReaderStream;

use crate::constants::OUTPUT_CHUNK_SIZE;
use crate::hub::{BroadcastHub, BufferWriter};
use crate::metadata::ResolvedMetadata;
use crate::transcoder::{ProcessOutput, Transcoder, TranscoderProcess};

/// How long an old output pump may keep draining after its process is gone
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// When restarts are allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Minimum time between the last restart and a metadata-driven one
    pub debounce: Duration,
    /// Minimum time between the last restart and a crash-driven one
    pub min_restart_interval: Duration,
    /// Cap on the exponential crash backoff
    pub max_backoff: Duration,
    /// A process that ran this long resets the failure count
    pub stable_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(60),
            min_restart_interval: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            stable_after: Duration::from_secs(30),
        }
    }
}

impl RestartPolicy {
    /// Delay after the n-th consecutive failure: min interval doubling, capped
    pub fn crash_backoff(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(16);
        let delay = self.min_restart_interval.saturating_mul(1u32 << exponent);
        delay.min(self.max_backoff.max(self.min_restart_interval))
    }

    /// Earliest instant a crash restart may happen
    pub fn crash_restart_at(
        &self,
        last_restart: Option<Instant>,
        consecutive_failures: u32,
        now: Instant,
    ) -> Instant {
        match last_restart {
            Some(last) => (last + self.crash_backoff(consecutive_failures)).max(now),
            None => now,
        }
    }

    /// Whether a metadata change may restart the pipeline now
    pub fn metadata_restart_due(&self, last_restart: Option<Instant>, now: Instant) -> bool {
        match last_restart {
            Some(last) => now.saturating_duration_since(last) >= self.debounce,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Stopped,
    Starting,
    Running,
    /// Process exited or failed to spawn; a restart is pending
    Crashed,
    /// Running with an outdated title, waiting out the debounce
    MetadataStale,
    Stopping,
}

impl PipelinePhase {
    /// A transcoder process is producing output
    pub fn is_live(&self) -> bool {
        matches!(self, PipelinePhase::Running | PipelinePhase::MetadataStale)
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelinePhase::Stopped => "stopped",
            PipelinePhase::Starting => "starting",
            PipelinePhase::Running => "running",
            PipelinePhase::Crashed => "crashed",
            PipelinePhase::MetadataStale => "metadata_stale",
            PipelinePhase::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    Initial,
    Crash,
    MetadataChanged,
}

/// Errors that end a pipeline generation
#[derive(Debug)]
pub enum PipelineError {
    /// The transcoder could not be started
    Spawn(std::io::Error),
    /// The transcoder exited on its own
    Exited { generation: u64, code: Option<i32> },
    /// Waiting on the transcoder failed
    Wait(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Spawn(err) => write!(f, "Failed to start transcoder: {}", err),
            PipelineError::Exited { generation, code } => match code {
                Some(code) => write!(f, "Transcoder #{} exited with code {}", generation, code),
                None => write!(f, "Transcoder #{} was terminated by a signal", generation),
            },
            PipelineError::Wait(msg) => write!(f, "Lost track of transcoder: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}

/// Reported by process watchers to the coordinator
#[derive(Debug)]
pub enum PipelineEvent {
    Exited {
        generation: u64,
        code: Option<i32>,
        error: Option<String>,
    },
}

struct ActivePipeline {
    generation: u64,
    started_at: Instant,
    stop_tx: Option<oneshot::Sender<oneshot::Sender<()>>>,
    pump: JoinHandle<()>,
}

/// Everything the supervisor knows about the pipeline
#[derive(Default)]
pub struct PipelineState {
    phase: Option<PipelinePhase>,
    active: Option<ActivePipeline>,
    started_with: Option<ResolvedMetadata>,
    last_restart: Option<Instant>,
    generation: u64,
    restarts: u64,
    consecutive_failures: u32,
    pending_restart: Option<Instant>,
    last_error: Option<String>,
    last_exit_code: Option<i32>,
    shut_down: bool,
}

impl PipelineState {
    pub fn phase(&self) -> PipelinePhase {
        self.phase.unwrap_or(PipelinePhase::Stopped)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Restarts after the first start, whatever the reason
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn started_with(&self) -> Option<&ResolvedMetadata> {
        self.started_with.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

/// Snapshot served on the pipeline health endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineHealth {
    pub phase: PipelinePhase,
    pub generation: u64,
    pub restarts: u64,
    pub consecutive_failures: u32,
    pub running_for_secs: Option<u64>,
    pub started_with_title: Option<String>,
    pub last_error: Option<String>,
    pub last_exit_code: Option<i32>,
    pub next_restart_in_ms: Option<u64>,
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self {
            phase: PipelinePhase::Stopped,
            generation: 0,
            restarts: 0,
            consecutive_failures: 0,
            running_for_secs: None,
            started_with_title: None,
            last_error: None,
            last_exit_code: None,
            next_restart_in_ms: None,
        }
    }
}

pub struct Supervisor {
    transcoder: Box<dyn Transcoder>,
    hub: BroadcastHub,
    policy: RestartPolicy,
    kill_timeout: Duration,
    events: mpsc::UnboundedSender<PipelineEvent>,
    state: PipelineState,
}

impl Supervisor {
    /// Create a stopped supervisor and the channel its watchers report on
    pub fn new(
        transcoder: Box<dyn Transcoder>,
        hub: BroadcastHub,
        policy: RestartPolicy,
        kill_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            transcoder,
            hub,
            policy,
            kill_timeout,
            events,
            state: PipelineState::default(),
        };
        (supervisor, events_rx)
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn phase(&self) -> PipelinePhase {
        self.state.phase()
    }

    pub fn next_restart_at(&self) -> Option<Instant> {
        self.state.pending_restart
    }

    pub fn health(&self, now: Instant) -> PipelineHealth {
        let state = &self.state;
        PipelineHealth {
            phase: state.phase(),
            generation: state.generation,
            restarts: state.restarts,
            consecutive_failures: state.consecutive_failures,
            running_for_secs: state
                .active
                .as_ref()
                .map(|active| now.saturating_duration_since(active.started_at).as_secs()),
            started_with_title: state.started_with.as_ref().map(|m| m.title.clone()),
            last_error: state.last_error.clone(),
            last_exit_code: state.last_exit_code,
            next_restart_in_ms: state
                .pending_restart
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
        }
    }

    /// React to freshly computed metadata
    ///
    /// Starts the first pipeline, performs due crash restarts, and restarts a
    /// running pipeline whose title is outdated once the debounce allows it.
    pub async fn on_tick(&mut self, metadata: &ResolvedMetadata, now: Instant) {
        if self.state.shut_down {
            return;
        }
        self.clear_failures_if_stable(now);
        match self.state.phase() {
            PipelinePhase::Stopped => {
                self.restart(metadata, now, RestartReason::Initial).await;
            }
            PipelinePhase::Crashed => {
                self.poll_restart(metadata, now).await;
            }
            PipelinePhase::Running | PipelinePhase::MetadataStale => {
                let stale = self
                    .state
                    .started_with
                    .as_ref()
                    .map_or(true, |started| started.title != metadata.title);
                if !stale {
                    self.state.phase = Some(PipelinePhase::Running);
                    return;
                }
                if self.policy.metadata_restart_due(self.state.last_restart, now) {
                    self.state.phase = Some(PipelinePhase::MetadataStale);
                    self.restart(metadata, now, RestartReason::MetadataChanged)
                        .await;
                } else if self.state.phase() == PipelinePhase::Running {
                    debug!(
                        "Title changed to '{}', restart deferred by debounce",
                        metadata.title
                    );
                    self.state.phase = Some(PipelinePhase::MetadataStale);
                }
            }
            PipelinePhase::Starting | PipelinePhase::Stopping => {}
        }
    }

    /// A live process that has run `stable_after` wipes the failure count
    fn clear_failures_if_stable(&mut self, now: Instant) {
        let stable = self.state.active.as_ref().map_or(false, |active| {
            now.saturating_duration_since(active.started_at) >= self.policy.stable_after
        });
        if stable && self.state.consecutive_failures > 0 {
            debug!(
                "Transcoder #{} is stable, clearing {} failure(s)",
                self.state.generation, self.state.consecutive_failures
            );
            self.state.consecutive_failures = 0;
        }
    }

    /// Perform a pending crash restart if its time has come
    pub async fn poll_restart(&mut self, metadata: &ResolvedMetadata, now: Instant) {
        if self.state.shut_down || self.state.phase() != PipelinePhase::Crashed {
            return;
        }
        match self.state.pending_restart {
            Some(at) if at <= now => {
                self.restart(metadata, now, RestartReason::Crash).await;
            }
            _ => {}
        }
    }

    /// Record a process exit reported by a watcher
    ///
    /// Exits from generations other than the live one are ignored.
    pub fn handle_event(&mut self, event: PipelineEvent, now: Instant) {
        let PipelineEvent::Exited {
            generation,
            code,
            error,
        } = event;

        let is_current = self
            .state
            .active
            .as_ref()
            .map_or(false, |active| active.generation == generation);
        if !is_current || self.state.shut_down {
            debug!("Ignoring exit of stale transcoder #{}", generation);
            return;
        }

        let Some(active) = self.state.active.take() else {
            return;
        };
        let ran_for = now.saturating_duration_since(active.started_at);
        // the pump ends by itself once the dead process's stdout hits EOF
        drop(active);

        if ran_for >= self.policy.stable_after {
            self.state.consecutive_failures = 1;
        } else {
            self.state.consecutive_failures += 1;
        }

        let failure = match error {
            Some(msg) => PipelineError::Wait(msg),
            None => PipelineError::Exited { generation, code },
        };
        let restart_at = self.policy.crash_restart_at(
            self.state.last_restart,
            self.state.consecutive_failures,
            now,
        );
        warn!(
            "{} after {:.1}s; restarting in {:.1}s (failure #{})",
            failure,
            ran_for.as_secs_f64(),
            restart_at.saturating_duration_since(now).as_secs_f64(),
            self.state.consecutive_failures
        );

        self.state.phase = Some(PipelinePhase::Crashed);
        self.state.last_exit_code = code;
        self.state.last_error = Some(failure.to_string());
        self.state.pending_restart = Some(restart_at);
    }

    /// Stop the current process (if any) and start a new one
    pub async fn restart(
        &mut self,
        metadata: &ResolvedMetadata,
        now: Instant,
        reason: RestartReason,
    ) {
        if self.state.shut_down {
            return;
        }
        self.clear_failures_if_stable(now);
        self.state.phase = Some(PipelinePhase::Starting);
        self.state.pending_restart = None;
        self.stop_active().await;

        self.state.generation += 1;
        let generation = self.state.generation;
        if self.state.last_restart.is_some() {
            self.state.restarts += 1;
        }
        self.state.last_restart = Some(now);

        match reason {
            RestartReason::Initial => info!(
                "Starting transcoder #{} ({}) with title '{}'",
                generation,
                self.transcoder.describe(),
                metadata.title
            ),
            RestartReason::Crash => info!(
                "Restarting transcoder #{} after failure, title '{}'",
                generation, metadata.title
            ),
            RestartReason::MetadataChanged => info!(
                "Restarting transcoder #{} for new title '{}'",
                generation, metadata.title
            ),
        }

        let spawned = match self.transcoder.spawn(metadata) {
            Ok(spawned) => spawned,
            Err(e) => {
                let failure = PipelineError::Spawn(e);
                self.state.consecutive_failures += 1;
                let restart_at = self.policy.crash_restart_at(
                    self.state.last_restart,
                    self.state.consecutive_failures,
                    now,
                );
                error!(
                    "{}; retrying in {:.1}s",
                    failure,
                    restart_at.saturating_duration_since(now).as_secs_f64()
                );
                self.state.phase = Some(PipelinePhase::Crashed);
                self.state.last_error = Some(failure.to_string());
                self.state.last_exit_code = None;
                self.state.pending_restart = Some(restart_at);
                return;
            }
        };

        let writer = self.hub.install_buffer(generation);
        let pump = tokio::spawn(pump_output(spawned.output, writer));

        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(watch_process(
            spawned.process,
            generation,
            stop_rx,
            self.events.clone(),
            self.kill_timeout,
        ));

        self.state.active = Some(ActivePipeline {
            generation,
            started_at: now,
            stop_tx: Some(stop_tx),
            pump,
        });
        self.state.started_with = Some(metadata.clone());
        self.state.phase = Some(PipelinePhase::Running);
    }

    /// Terminate the transcoder and end every listener stream
    pub async fn shutdown(&mut self) {
        if self.state.shut_down {
            return;
        }
        info!("Stopping pipeline");
        self.state.phase = Some(PipelinePhase::Stopping);
        self.state.shut_down = true;
        self.state.pending_restart = None;
        self.stop_active().await;
        self.hub.close();
        self.state.phase = Some(PipelinePhase::Stopped);
    }

    /// Kill the live process, wait for its exit, then let its output drain
    async fn stop_active(&mut self) {
        let Some(mut active) = self.state.active.take() else {
            return;
        };

        if let Some(stop_tx) = active.stop_tx.take() {
            let (ack_tx, ack_rx) = oneshot::channel();
            // the watcher is gone if the process already exited
            if stop_tx.send(ack_tx).is_ok() {
                let wait = self.kill_timeout + Duration::from_secs(1);
                match timeout(wait, ack_rx).await {
                    Ok(Ok(())) => debug!("Transcoder #{} stopped", active.generation),
                    Ok(Err(_)) => debug!("Transcoder #{} watcher ended", active.generation),
                    Err(_) => error!(
                        "Transcoder #{} did not confirm exit within {:?}",
                        active.generation, wait
                    ),
                }
            }
        }

        if timeout(PUMP_DRAIN_TIMEOUT, &mut active.pump).await.is_err() {
            warn!(
                "Output of transcoder #{} still open, detaching it",
                active.generation
            );
            active.pump.abort();
        }
    }
}

/// Copy transcoder output into the hub buffer until EOF
async fn pump_output(output: ProcessOutput, writer: BufferWriter) {
    let mut stream = ReaderStream::with_capacity(output, OUTPUT_CHUNK_SIZE);
    let mut total_bytes = 0u64;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                total_bytes += bytes.len() as u64;
                writer.send(bytes);
            }
            Err(e) => {
                warn!("Read error on transcoder #{} output: {}", writer.generation(), e);
                break;
            }
        }
    }
    debug!(
        "Output of transcoder #{} ended after {} bytes",
        writer.generation(),
        total_bytes
    );
}

enum WatchOutcome {
    Exited(std::io::Result<Option<i32>>),
    StopRequested(Option<oneshot::Sender<()>>),
}

/// Report the process's exit, or kill it when asked and confirm the exit
async fn watch_process(
    mut process: Box<dyn TranscoderProcess>,
    generation: u64,
    mut stop_rx: oneshot::Receiver<oneshot::Sender<()>>,
    events: mpsc::UnboundedSender<PipelineEvent>,
    kill_timeout: Duration,
) {
    let outcome = tokio::select! {
        result = process.wait() => WatchOutcome::Exited(result),
        request = &mut stop_rx => WatchOutcome::StopRequested(request.ok()),
    };

    match outcome {
        WatchOutcome::Exited(result) => {
            let (code, error) = match result {
                Ok(code) => (code, None),
                Err(e) => (None, Some(e.to_string())),
            };
            // the coordinator may already be gone during shutdown
            let _ = events.send(PipelineEvent::Exited {
                generation,
                code,
                error,
            });
        }
        WatchOutcome::StopRequested(ack) => {
            if let Err(e) = process.start_kill() {
                warn!("Failed to signal transcoder #{}: {}", generation, e);
            }
            match timeout(kill_timeout, process.wait()).await {
                Ok(Ok(code)) => debug!("Transcoder #{} exited with {:?}", generation, code),
                Ok(Err(e)) => warn!("Waiting for transcoder #{} failed: {}", generation, e),
                Err(_) => error!(
                    "Transcoder #{} still running {:?} after kill",
                    generation, kill_timeout
                ),
            }
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
        }
    }
}
