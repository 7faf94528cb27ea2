//! Live session lifecycle.
//!
//! ## Threads and tasks
//!
//! ```text
//! device thread ("parley-audio")      session event loop (tokio task)
//! ──────────────────────────────      ───────────────────────────────
//! open input, open output             select! (biased):
//! capture::run ── try_send ──►          local close signal
//!   outbound channel ──► connector      inbound remote messages
//! drop input, drop output               playback completion events
//! ```
//!
//! The cpal stream types are bound to the thread that created them, so both
//! streams are opened, driven and dropped on the device thread. Everything
//! else happens on the event loop, which handles remote messages one at a
//! time in arrival order.
//!
//! ## Teardown
//!
//! [`LiveSession::finish`] is the single exit path. It transitions to a
//! terminal state under the state lock (so it wins exactly once), closes the
//! capture gate, takes whatever resources were acquired so far, releases
//! them, broadcasts the status and fires the close callback.

pub mod config;
pub mod events;
pub mod state;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    audio::AudioBackend,
    buffering::create_capture_ring,
    capture::{self, CaptureContext, CaptureGate, CapturePipeline},
    diagnostics::{DiagnosticsSnapshot, PipelineDiagnostics},
    error::{ParleyError, Result},
    playback::{
        InterruptionController, OutputDevice, PlaybackEvent, PlaybackScheduler,
    },
    remote::{InboundMessage, RemoteConnector, RemoteHandle},
};

pub use config::SessionConfig;
pub use events::{SessionOutcome, SessionStatusEvent};
pub use state::SessionState;

/// Invoked once with the terminal outcome, after resources are released.
pub type CloseCallback = Box<dyn FnOnce(SessionOutcome) + Send>;

const STATUS_CHANNEL_CAPACITY: usize = 64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one live duplex audio session. Cheap to clone.
#[derive(Clone)]
pub struct LiveSession {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    config: SessionConfig,
    state: Mutex<SessionState>,
    started: AtomicBool,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    gate: Arc<CaptureGate>,
    diagnostics: Arc<PipelineDiagnostics>,
    resources: Mutex<SessionResources>,
    on_close: Mutex<Option<CloseCallback>>,
    closed_tx: watch::Sender<Option<SessionOutcome>>,
    /// Set once both device streams are dropped (or were never opened).
    released_tx: Arc<watch::Sender<bool>>,
}

/// Resources acquired while connecting. Each is taken exactly once.
#[derive(Default)]
struct SessionResources {
    remote: Option<Box<dyn RemoteHandle>>,
    devices: Option<DeviceThread>,
}

impl SessionResources {
    fn release(self, released: &watch::Sender<bool>) {
        if let Some(mut remote) = self.remote {
            remote.close();
            debug!("remote session released");
        }
        match self.devices {
            Some(devices) => devices.stop(),
            None => {
                released.send_replace(true);
            }
        }
    }
}

struct DeviceThread {
    running: Arc<AtomicBool>,
    _thread: std::thread::JoinHandle<()>,
}

impl DeviceThread {
    /// Signal the device thread to leave its capture loop and drop both
    /// streams. Does not join: the event loop must not block on device
    /// shutdown. `released_tx` reports completion.
    fn stop(self) {
        self.running.store(false, Ordering::Release);
        debug!("device thread signalled to stop");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let resources = std::mem::take(self.resources.get_mut());
        if resources.remote.is_some() || resources.devices.is_some() {
            warn!(session = self.id, "session dropped without teardown, releasing");
            resources.release(&self.released_tx);
        }
    }
}

impl LiveSession {
    /// Create a session in `Connecting`. Nothing is opened until
    /// [`start`](Self::start).
    pub fn new(config: SessionConfig) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (closed_tx, _) = watch::channel(None);
        let (released_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                config,
                state: Mutex::new(SessionState::Connecting),
                started: AtomicBool::new(false),
                status_tx,
                gate: Arc::new(CaptureGate::default()),
                diagnostics: Arc::new(PipelineDiagnostics::default()),
                resources: Mutex::new(SessionResources::default()),
                on_close: Mutex::new(None),
                closed_tx,
                released_tx: Arc::new(released_tx),
            }),
        }
    }

    /// Register the close notification. Replaces any earlier callback.
    pub fn on_close(self, callback: impl FnOnce(SessionOutcome) + Send + 'static) -> Self {
        *self.inner.on_close.lock() = Some(Box::new(callback));
        self
    }

    /// Create and start a session in one step.
    pub async fn connect<C>(
        config: SessionConfig,
        context: &str,
        backend: Arc<dyn AudioBackend>,
        connector: &C,
    ) -> Result<Self>
    where
        C: RemoteConnector + ?Sized,
    {
        let session = Self::new(config);
        session.start(context, backend, connector).await?;
        Ok(session)
    }

    /// Open the devices, then the remote session, then run the event loop.
    ///
    /// Returns once the remote session is established; the session turns
    /// `Active` when the remote confirms. If [`close`](Self::close) is called
    /// meanwhile, whatever was acquired is released and `Ok(())` is returned
    /// with the session `Closed`.
    ///
    /// # Errors
    /// Device and remote failures move the session to `Error`, release
    /// everything acquired so far, and are returned.
    pub async fn start<C>(
        &self,
        context: &str,
        backend: Arc<dyn AudioBackend>,
        connector: &C,
    ) -> Result<()>
    where
        C: RemoteConnector + ?Sized,
    {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(ParleyError::Config("session already started".into()));
        }
        if self.state().is_terminal() {
            return Ok(());
        }
        self.emit(SessionState::Connecting, None);
        if let Err(e) = self.inner.config.validate() {
            return self.fail(e);
        }

        let config = &self.inner.config;
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);
        let (events_tx, events_rx) = mpsc::unbounded_channel::<PlaybackEvent>();
        let pipeline = CapturePipeline::new(
            Arc::clone(&self.inner.gate),
            config.input_format,
            outbound_tx,
            Arc::clone(&self.inner.diagnostics),
        );

        let (opened_tx, opened_rx) = oneshot::channel();
        let running = Arc::new(AtomicBool::new(true));
        let thread = match spawn_device_thread(DeviceThreadContext {
            backend,
            pipeline,
            frame_len: config.frame_len,
            events: events_tx,
            running: Arc::clone(&running),
            released: Arc::clone(&self.inner.released_tx),
            opened: opened_tx,
        }) {
            Ok(thread) => thread,
            Err(e) => return self.fail(e.into()),
        };
        if !self.register_devices(DeviceThread {
            running,
            _thread: thread,
        }) {
            return Ok(());
        }

        let opened = opened_rx.await;
        // A local close while opening wins over whatever the devices report.
        if self.state().is_terminal() {
            return Ok(());
        }
        let output = match opened {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return self.fail(e),
            Err(_) => {
                return self.fail(ParleyError::DeviceAccess(
                    "device thread exited before opening streams".into(),
                ))
            }
        };

        let scheduler = PlaybackScheduler::new(
            output,
            config.output_format,
            Arc::clone(&self.inner.diagnostics),
        );

        let setup = config.setup_for(context);
        let link = match connector.connect(&setup, outbound_rx).await {
            Ok(link) => link,
            Err(ParleyError::RemoteSession(msg)) => {
                return self.fail(ParleyError::RemoteSession(msg))
            }
            Err(e) => return self.fail(ParleyError::RemoteSession(e.to_string())),
        };
        if !self.register_remote(link.handle) {
            return Ok(());
        }

        info!(session = self.inner.id, model = %setup.model, "remote session opened");

        let span = info_span!("session", id = self.inner.id);
        tokio::spawn(
            run_event_loop(self.clone(), link.inbound, events_rx, scheduler).instrument(span),
        );
        Ok(())
    }

    /// Close locally. Idempotent and safe to call concurrently; returns
    /// `true` only for the call that performed the teardown.
    pub fn close(&self) -> bool {
        self.finish(SessionState::Closed, None)
    }

    /// Mute or unmute the microphone. Frames captured while muted are dropped.
    pub fn set_muted(&self, muted: bool) {
        let was = self.inner.gate.is_muted();
        self.inner.gate.set_muted(muted);
        if was != muted {
            info!(session = self.inner.id, muted, "microphone mute changed");
        }
    }

    pub fn is_muted(&self) -> bool {
        self.inner.gate.is_muted()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.inner.status_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.inner.diagnostics.snapshot()
    }

    /// Resolve once the session reached a terminal state and both device
    /// streams are dropped.
    pub async fn wait_closed(&self) -> SessionOutcome {
        let mut closed_rx = self.inner.closed_tx.subscribe();
        let outcome = match closed_rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        }
        .unwrap_or(SessionOutcome {
            state: self.state(),
            detail: None,
        });

        let mut released_rx = self.inner.released_tx.subscribe();
        let _ = released_rx.wait_for(|released| *released).await;
        outcome
    }

    fn emit(&self, status: SessionState, detail: Option<String>) {
        let _ = self
            .inner
            .status_tx
            .send(SessionStatusEvent { status, detail });
    }

    /// Confirmation from the remote: open the gate and go `Active`.
    fn activate(&self) {
        {
            let mut state = self.inner.state.lock();
            if let Err(e) = state.transition(SessionState::Active) {
                debug!(error = %e, "ignoring remote confirmation");
                return;
            }
            self.inner.gate.activate();
        }
        info!(session = self.inner.id, "session active");
        self.emit(SessionState::Active, None);
    }

    fn fail<T>(&self, err: ParleyError) -> Result<T> {
        self.finish(SessionState::Error, Some(err.to_string()));
        Err(err)
    }

    /// Enter `terminal` and tear everything down. Returns `false` when the
    /// session had already ended.
    fn finish(&self, terminal: SessionState, detail: Option<String>) -> bool {
        let from = {
            let mut state = self.inner.state.lock();
            let from = *state;
            if state.transition(terminal).is_err() {
                return false;
            }
            self.inner.gate.deactivate();
            from
        };

        match terminal {
            SessionState::Error => warn!(
                session = self.inner.id,
                %from,
                detail = detail.as_deref().unwrap_or_default(),
                "session failed"
            ),
            _ => info!(
                session = self.inner.id,
                %from,
                detail = detail.as_deref().unwrap_or_default(),
                "session closed"
            ),
        }

        let resources = std::mem::take(&mut *self.inner.resources.lock());
        resources.release(&self.inner.released_tx);

        self.emit(terminal, detail.clone());
        let outcome = SessionOutcome {
            state: terminal,
            detail,
        };
        let callback = self.inner.on_close.lock().take();
        if let Some(callback) = callback {
            callback(outcome.clone());
        }
        self.inner.closed_tx.send_replace(Some(outcome));
        true
    }

    /// Hand the device thread to the session. When teardown already ran, it
    /// is stopped at once and `false` is returned.
    fn register_devices(&self, devices: DeviceThread) -> bool {
        let state = self.inner.state.lock();
        if state.is_terminal() {
            drop(state);
            devices.stop();
            return false;
        }
        self.inner.resources.lock().devices = Some(devices);
        true
    }

    /// Hand the remote handle to the session, closing it at once when
    /// teardown already ran.
    fn register_remote(&self, mut remote: Box<dyn RemoteHandle>) -> bool {
        let state = self.inner.state.lock();
        if state.is_terminal() {
            drop(state);
            remote.close();
            return false;
        }
        self.inner.resources.lock().remote = Some(remote);
        true
    }

    /// Apply one remote message. Returns `true` when the session ended.
    fn handle_inbound(
        &self,
        message: InboundMessage,
        scheduler: &PlaybackScheduler,
        interrupter: &InterruptionController,
    ) -> bool {
        match message {
            InboundMessage::Ready => self.activate(),
            InboundMessage::Audio { data, .. } => {
                if self.state() == SessionState::Active {
                    scheduler.enqueue(&data);
                } else {
                    debug!("ignoring audio before session is active");
                }
            }
            InboundMessage::Interrupted => {
                interrupter.interrupt();
            }
            InboundMessage::TurnComplete => {
                debug!(buffered = scheduler.buffered_secs(), "remote turn complete");
            }
            InboundMessage::Closed { reason } => {
                self.finish(SessionState::Closed, reason);
                return true;
            }
            InboundMessage::Error { message } => {
                self.finish(SessionState::Error, Some(message));
                return true;
            }
        }
        false
    }
}

impl std::fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSession")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("muted", &self.is_muted())
            .finish_non_exhaustive()
    }
}

async fn run_event_loop(
    session: LiveSession,
    mut inbound: mpsc::Receiver<InboundMessage>,
    mut playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
    scheduler: PlaybackScheduler,
) {
    let interrupter = scheduler.interruption_controller();
    let mut closed_rx = session.inner.closed_tx.subscribe();
    debug!("session event loop started");

    loop {
        tokio::select! {
            biased;

            _ = closed_rx.wait_for(Option::is_some) => break,

            message = inbound.recv() => match message {
                Some(message) => {
                    if session.handle_inbound(message, &scheduler, &interrupter) {
                        break;
                    }
                }
                None => {
                    session.finish(
                        SessionState::Closed,
                        Some("remote channel closed".into()),
                    );
                    break;
                }
            },

            Some(event) = playback_events.recv() => scheduler.handle_event(event),
        }
    }

    let snap = session.diagnostics_snapshot();
    info!(
        chunks = snap.chunks_received,
        malformed = snap.chunks_malformed,
        scheduled = snap.units_scheduled,
        completed = snap.units_completed,
        interruptions = snap.interruptions,
        "session event loop stopped"
    );
}

struct DeviceThreadContext {
    backend: Arc<dyn AudioBackend>,
    pipeline: CapturePipeline,
    frame_len: usize,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    running: Arc<AtomicBool>,
    released: Arc<watch::Sender<bool>>,
    opened: oneshot::Sender<Result<Arc<dyn OutputDevice>>>,
}

/// Open input then output on a dedicated thread, run capture there, and drop
/// input then output when `running` clears. Any failure before capture starts
/// drops what was already open before reporting through `opened`.
fn spawn_device_thread(ctx: DeviceThreadContext) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("parley-audio".into())
        .spawn(move || {
            let DeviceThreadContext {
                backend,
                pipeline,
                frame_len,
                events,
                running,
                released,
                opened,
            } = ctx;

            let (producer, consumer) = create_capture_ring();
            let input = match backend.open_input(producer, Arc::clone(&running)) {
                Ok(input) => input,
                Err(e) => {
                    warn!(error = %e, "failed to open input device");
                    let _ = opened.send(Err(e));
                    released.send_replace(true);
                    return;
                }
            };
            let output = match backend.open_output(events) {
                Ok(output) => output,
                Err(e) => {
                    warn!(error = %e, "failed to open output device");
                    drop(input);
                    let _ = opened.send(Err(e));
                    released.send_replace(true);
                    return;
                }
            };
            let capture = match CaptureContext::new(
                pipeline,
                consumer,
                Arc::clone(&running),
                input.sample_rate,
                frame_len,
            ) {
                Ok(capture) => capture,
                Err(e) => {
                    warn!(
                        error = %e,
                        input_rate = input.sample_rate,
                        "cannot capture from input device"
                    );
                    drop(input);
                    drop(output);
                    let _ = opened.send(Err(e));
                    released.send_replace(true);
                    return;
                }
            };
            info!(
                input_rate = input.sample_rate,
                output_rate = output.device.sample_rate(),
                "audio devices open"
            );

            if opened.send(Ok(Arc::clone(&output.device))).is_err() {
                running.store(false, Ordering::Release);
            }

            capture::run(capture);

            drop(input);
            drop(output);
            info!("audio devices released");
            released.send_replace(true);
        })
}
