use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::emit::Emitter;
use super::{FailedEvent, ReplayOptions, ReplayReport, ReplayState};
use crate::container::{EventLocation, LogContainer, RecordingReader};
use crate::store::Connector;
use crate::{Error, Result};

/// Control signal from a [`ReplaySession`] to its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayControl {
    Run,
    Pause,
    Stop,
}

/// Recordings with a replay in progress, process-wide.
fn active_replays() -> &'static Mutex<HashSet<PathBuf>> {
    static ACTIVE: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    ACTIVE.get_or_init(Mutex::default)
}

/// Marks a recording as being replayed until dropped.
struct ActiveReplay {
    key: PathBuf,
}

impl ActiveReplay {
    fn claim(name: &str, path: &Path) -> Result<Self> {
        let mut active = active_replays()
            .lock()
            .map_err(|_| Error::InvalidState {
                message: "replay registry poisoned".to_string(),
            })?;
        if !active.insert(path.to_path_buf()) {
            return Err(Error::ReplayInProgress {
                name: name.to_string(),
            });
        }
        Ok(Self {
            key: path.to_path_buf(),
        })
    }
}

impl Drop for ActiveReplay {
    fn drop(&mut self) {
        if let Ok(mut active) = active_replays().lock() {
            active.remove(&self.key);
        }
    }
}

/// Starts replay sessions for recordings in a container.
#[derive(Debug, Clone)]
pub struct Replayer {
    container: Arc<LogContainer>,
}

impl Replayer {
    pub fn new(container: Arc<LogContainer>) -> Self {
        Self { container }
    }

    /// Starts replaying `name` into `target`.
    ///
    /// Fails with [`Error::ReplayInProgress`] while another session replays
    /// the same recording and with [`Error::TargetUnreachable`] when the
    /// target cannot be reached. An empty recording yields a session that is
    /// already stopped; the target is not contacted.
    pub async fn start(
        &self,
        name: &str,
        target: Arc<dyn Connector>,
        options: ReplayOptions,
    ) -> Result<ReplaySession> {
        options.validate()?;
        let guard = ActiveReplay::claim(name, &self.container.path_for(name)?)?;

        let reader = self.container.open_recovering(name).await?;
        let truncated = reader.is_truncated();
        if let Some(truncation) = reader.truncation() {
            warn!(
                recording = %name,
                offset = truncation.offset,
                reason = %truncation.reason,
                valid_events = reader.event_count(),
                "recording is truncated, replaying its valid prefix"
            );
        }

        // Global timestamp order; the stable sort keeps file order for ties.
        let mut schedule: Vec<EventLocation> = reader.index().to_vec();
        schedule.sort_by_key(|location| location.timestamp_ns);

        let (control, control_rx) = watch::channel(ReplayControl::Run);
        let cancel = CancellationToken::new();
        let cursor = Arc::new(AtomicU64::new(0));
        let total = schedule.len() as u64;
        let report = ReplayReport {
            name: name.to_string(),
            total,
            emitted: 0,
            failures: Vec::new(),
            truncated,
            state: ReplayState::Idle,
            elapsed: std::time::Duration::ZERO,
        };

        if schedule.is_empty() {
            info!(recording = %name, "recording is empty, nothing to replay");
            let (state, _) = watch::channel(ReplayState::Stopped);
            let report = ReplayReport {
                state: ReplayState::Stopped,
                ..report
            };
            drop(guard);
            return Ok(ReplaySession {
                name: name.to_string(),
                total,
                control,
                cancel,
                state: Arc::new(state),
                cursor,
                task: tokio::spawn(async move { report }),
            });
        }

        let emitter = Emitter::connect(target.clone(), &options).await?;
        let (state, _) = watch::channel(ReplayState::Running);
        let state = Arc::new(state);
        info!(
            recording = %name,
            target = %target.describe(),
            events = total,
            speed = options.speed_factor,
            mode = ?options.mode,
            id_policy = ?options.id_policy,
            "replay started"
        );

        let task = ReplayTask {
            reader,
            schedule,
            emitter,
            options,
            control: control_rx,
            cancel: cancel.clone(),
            state: state.clone(),
            cursor: cursor.clone(),
            report,
            _guard: guard,
        };

        Ok(ReplaySession {
            name: name.to_string(),
            total,
            control,
            cancel,
            state,
            cursor,
            task: tokio::spawn(task.run()),
        })
    }

    /// Replays `name` to completion.
    pub async fn run(
        &self,
        name: &str,
        target: Arc<dyn Connector>,
        options: ReplayOptions,
    ) -> Result<ReplayReport> {
        self.start(name, target, options).await?.wait().await
    }
}

/// Handle to a running replay.
pub struct ReplaySession {
    name: String,
    total: u64,
    control: watch::Sender<ReplayControl>,
    /// Interrupts a retry wait inside an emit.
    cancel: CancellationToken,
    state: Arc<watch::Sender<ReplayState>>,
    cursor: Arc<AtomicU64>,
    task: JoinHandle<ReplayReport>,
}

impl ReplaySession {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ReplayState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReplayState> {
        self.state.subscribe()
    }

    /// Number of events handled so far.
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Suspends before the next event, keeping the remaining wait.
    pub fn pause(&self) -> Result<()> {
        match self.state() {
            ReplayState::Running => {
                self.control.send_replace(ReplayControl::Pause);
                Ok(())
            }
            ReplayState::Paused => Ok(()),
            other => Err(self.invalid("pause", other)),
        }
    }

    pub fn resume(&self) -> Result<()> {
        match self.state() {
            ReplayState::Paused | ReplayState::Running => {
                self.control.send_replace(ReplayControl::Run);
                Ok(())
            }
            other => Err(self.invalid("resume", other)),
        }
    }

    /// Cancels at the next wait, including a wait before retrying an
    /// event. Stopping a finished session is a no-op.
    pub fn stop(&self) {
        let state = self.state();
        if !state.is_terminal() {
            self.state.send_replace(ReplayState::Stopping);
        }
        self.control.send_replace(ReplayControl::Stop);
        self.cancel.cancel();
    }

    /// Waits for the session to end and returns its report.
    pub async fn wait(self) -> Result<ReplayReport> {
        self.task.await.map_err(|e| Error::InvalidState {
            message: format!("replay of '{}' panicked: {}", self.name, e),
        })
    }

    fn invalid(&self, action: &str, state: ReplayState) -> Error {
        Error::InvalidState {
            message: format!("cannot {} replay of '{}' while {:?}", action, self.name, state),
        }
    }
}

struct ReplayTask {
    reader: RecordingReader,
    schedule: Vec<EventLocation>,
    emitter: Emitter,
    options: ReplayOptions,
    control: watch::Receiver<ReplayControl>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<ReplayState>>,
    cursor: Arc<AtomicU64>,
    report: ReplayReport,
    _guard: ActiveReplay,
}

impl ReplayTask {
    async fn run(mut self) -> ReplayReport {
        let started = Instant::now();
        let mut deadline = started;
        let mut previous_ns = self.schedule.first().map_or(0, |l| l.timestamp_ns);
        let mut outcome = ReplayState::Stopped;

        let schedule = std::mem::take(&mut self.schedule);
        for (index, location) in schedule.iter().enumerate() {
            let event = match self.reader.read_at(location).await {
                Ok(event) => event,
                Err(e) => {
                    error!(recording = %self.report.name, index, error = %e, "failed to read event");
                    self.fail(index, location, "", &e);
                    outcome = ReplayState::Failed;
                    break;
                }
            };

            deadline += self
                .options
                .scaled(location.timestamp_ns.saturating_sub(previous_ns));
            previous_ns = location.timestamp_ns;

            match self.wait_until(deadline).await {
                Some(resumed) => deadline = resumed,
                None => {
                    debug!(recording = %self.report.name, index, "replay stopped");
                    break;
                }
            }

            match event.decode() {
                Ok(payload) => match self.emitter.emit(&payload, &self.cancel).await {
                    Ok(Some(_)) => self.report.emitted += 1,
                    Ok(None) => {
                        debug!(recording = %self.report.name, index, "replay stopped while retrying");
                        break;
                    }
                    Err(e) => {
                        warn!(channel = %event.channel, index, error = %e, "event not applied");
                        self.fail(index, location, &event.channel, &e);
                    }
                },
                Err(e) => self.fail(index, location, &event.channel, &e),
            }
            self.cursor.store(index as u64 + 1, Ordering::Release);
        }

        self.report.state = outcome;
        self.report.elapsed = started.elapsed();
        self.state.send_replace(outcome);
        info!(
            recording = %self.report.name,
            emitted = self.report.emitted,
            failed = self.report.failures.len(),
            elapsed_ms = self.report.elapsed.as_millis() as u64,
            state = ?outcome,
            "replay finished"
        );
        self.report
    }

    /// Waits until `deadline` while honouring pause and stop. Returns the
    /// deadline to emit at, shifted by any pause, or `None` when stopped.
    async fn wait_until(&mut self, mut deadline: Instant) -> Option<Instant> {
        loop {
            let control = *self.control.borrow_and_update();
            match control {
                ReplayControl::Stop => return None,
                ReplayControl::Pause => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    self.state.send_replace(ReplayState::Paused);
                    info!(recording = %self.report.name, "replay paused");
                    loop {
                        if self.control.changed().await.is_err() {
                            return None;
                        }
                        match *self.control.borrow_and_update() {
                            ReplayControl::Run => break,
                            ReplayControl::Stop => return None,
                            ReplayControl::Pause => {}
                        }
                    }
                    self.state.send_replace(ReplayState::Running);
                    info!(recording = %self.report.name, "replay resumed");
                    deadline = Instant::now() + remaining;
                }
                ReplayControl::Run => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => return Some(deadline),
                        changed = self.control.changed() => {
                            if changed.is_err() {
                                // Session handle dropped; finish unattended.
                                tokio::time::sleep_until(deadline).await;
                                return Some(deadline);
                            }
                        }
                    }
                }
            }
        }
    }

    fn fail(&mut self, index: usize, location: &EventLocation, channel: &str, error: &Error) {
        let channel = if channel.is_empty() {
            self.reader
                .channel(location.channel_id)
                .map(|c| c.name.clone())
                .unwrap_or_default()
        } else {
            channel.to_string()
        };
        self.report.failures.push(FailedEvent {
            index: index as u64,
            channel,
            timestamp_ns: location.timestamp_ns,
            error: error.to_string(),
        });
    }
}
