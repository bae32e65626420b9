use crate::codec;
use crate::composer::{self, ComposedCommand, DrumPatch, LightPatch, StatePatch};
use crate::config::TowerConfig;
use crate::error::{LinkError, ProtocolError, Result, TowerError};
use crate::event::{DisconnectReason, EventBus, TowerEvent};
use crate::liveness::{ConnectionState, ConnectionStatus, LivenessMonitor};
use crate::message::{self, Classification, MessageKind, TowerCommand};
use crate::sequencer::{CommandCompletion, CommandOutcome, CommandSequencer, QueueStatus};
use crate::state::{
    AudioState, Compass, DrumLevel, LightEffect, LightLayer, LightSequence, LightState, Seal, TowerState,
};
use crate::transport::{DeviceInfo, TowerTransport, TransportEvent};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, info, trace, warn};

#[derive(Debug, Default)]
struct BatteryTracker {
    last_percent: Option<u8>,
    last_notified: Option<Instant>,
    last_millivolts: Option<u16>,
}

#[derive(Debug, Default)]
struct Mirror {
    /// Last known tower state, `None` until a state frame arrives or a command is composed
    state: Option<TowerState>,
    /// Last seen beam count, `None` while uninitialized
    skull_count: Option<u16>,
    broken_seals: BTreeSet<Seal>,
    battery: BatteryTracker,
}

#[derive(Debug, Default)]
struct Tasks {
    pump: Option<JoinHandle<()>>,
    grace: Option<JoinHandle<()>>,
    /// Long operation owning the grace timer
    long_operation: Option<u64>,
    next_long_operation: u64,
}

/// A rotation or calibration whose heartbeat silence is expected.
#[derive(Debug, Clone, Copy)]
struct LongOperation {
    id: u64,
    calibrating: bool,
}

/// Frame queued on the sequencer.
struct Outbound {
    frame: Bytes,
    long_operation: Option<LongOperation>,
}

impl From<Bytes> for Outbound {
    fn from(frame: Bytes) -> Self {
        Self {
            frame,
            long_operation: None,
        }
    }
}

struct TowerShared<T: TowerTransport> {
    config: TowerConfig,
    transport: Arc<T>,
    monitor: LivenessMonitor<T>,
    sequencer: CommandSequencer<Outbound>,
    events: EventBus,
    mirror: Mutex<Mirror>,
    tasks: Mutex<Tasks>,
    span: Span,
}

/// Controller for one Return to Dark Tower unit.
///
/// Owns the transport, the command queue and the liveness monitor. Every
/// outbound state command is composed from the local state mirror, which is
/// updated as soon as the command is queued. Cloning gives another handle to
/// the same controller.
pub struct DarkTower<T: TowerTransport> {
    shared: Arc<TowerShared<T>>,
}

impl<T: TowerTransport> Clone for DarkTower<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: TowerTransport> DarkTower<T> {
    /// Create a controller. Must be called from within a Tokio runtime.
    pub fn new(transport: T, config: TowerConfig) -> Self {
        Self::with_parent_span(transport, config, &Span::current())
    }

    /// Like [`DarkTower::new`], logging under `parent`.
    pub fn with_parent_span(transport: T, config: TowerConfig, parent: &Span) -> Self {
        let span = tracing::info_span!(parent: parent, "controller", device = %config.device_name);
        let transport = Arc::new(transport);
        let events = EventBus::new();
        let monitor = LivenessMonitor::new(transport.clone(), config.clone(), events.clone(), &span);
        let command_timeout = config.command_timeout();

        let shared = Arc::new_cyclic(|weak: &Weak<TowerShared<T>>| {
            let writer = weak.clone();
            let sequencer = CommandSequencer::new(command_timeout, &span, move |outbound: Outbound| {
                let writer = writer.clone();
                async move {
                    let Some(shared) = writer.upgrade() else {
                        return Err(TowerError::Disposed);
                    };
                    let tower = DarkTower { shared };
                    if let Some(operation) = outbound.long_operation {
                        tower.begin_long_operation(operation);
                    }
                    tower.send_frame(outbound.frame).await
                }
            });
            TowerShared {
                config,
                transport: transport.clone(),
                monitor,
                sequencer,
                events,
                mirror: Mutex::new(Mirror::default()),
                tasks: Mutex::new(Tasks::default()),
                span: span.clone(),
            }
        });

        let weak = Arc::downgrade(&shared);
        shared.monitor.on_disconnect(move |reason| {
            if let Some(shared) = weak.upgrade() {
                DarkTower { shared }.on_disconnected(reason);
            }
        });

        let (sink, rx) = mpsc::unbounded_channel();
        shared.transport.attach(sink);
        let pump = tokio::spawn(Self::pump(Arc::downgrade(&shared), rx).instrument(span));
        shared.tasks.lock().pump = Some(pump);

        Self { shared }
    }

    async fn pump(shared: Weak<TowerShared<T>>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            let tower = DarkTower { shared };
            match event {
                TransportEvent::Bytes(frame) => tower.handle_frame(&frame),
                TransportEvent::LinkLost => tower.shared.monitor.on_link_lost(),
                TransportEvent::Availability(available) => {
                    info!(available, "Adapter availability changed");
                    tower.shared.events.emit(TowerEvent::AvailabilityChanged(available));
                }
            }
        }
        debug!("Transport event stream closed");
    }

    // --- Connection ---

    /// Connect to the tower.
    ///
    /// Link failures do not surface here; subscribers see
    /// `Disconnected(ConnectFailed(..))` instead. Only a disposed controller
    /// returns an error.
    pub async fn connect(&self) -> Result<()> {
        match self.shared.monitor.connect().await {
            Ok(()) => Ok(()),
            Err(TowerError::Disposed) => Err(TowerError::Disposed),
            Err(e) => {
                debug!(parent: &self.shared.span, error = %e, "Connect failure reported as disconnect");
                Ok(())
            }
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.shared.monitor.disconnect().await
    }

    /// Tear everything down. The controller cannot reconnect afterwards.
    pub async fn dispose(&self) {
        let (pump, grace) = {
            let mut tasks = self.shared.tasks.lock();
            (tasks.pump.take(), tasks.grace.take())
        };
        for task in [pump, grace].into_iter().flatten() {
            task.abort();
        }
        self.shared.sequencer.clear();
        self.shared.monitor.dispose().await;
        info!(parent: &self.shared.span, "Controller disposed");
    }

    fn on_disconnected(&self, reason: &DisconnectReason) {
        let cleared = self.shared.sequencer.clear();
        let grace = {
            let mut tasks = self.shared.tasks.lock();
            tasks.long_operation = None;
            tasks.grace.take()
        };
        if let Some(grace) = grace {
            grace.abort();
        }
        self.shared.mirror.lock().battery = BatteryTracker::default();
        debug!(parent: &self.shared.span, cleared, ?reason, "Controller reset after disconnect");
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.shared.monitor.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Disposed => Err(TowerError::Disposed),
            ConnectionState::Disconnected | ConnectionState::Connecting => Err(LinkError::NotConnected.into()),
        }
    }

    // --- Outbound ---

    /// Write one frame, retrying transient failures with a linear backoff.
    ///
    /// A link-down error disconnects at once. Exhausted retries and user
    /// cancellation give up without an error; the command then waits out its
    /// queue timeout.
    async fn send_frame(&self, frame: Bytes) -> Result<()> {
        let config = &self.shared.config;
        let mut attempt = 0;
        loop {
            match self.shared.transport.write(frame.clone()).await {
                Ok(()) => {
                    debug!(bytes = %hex::encode(&frame), attempt, "Frame written");
                    return Ok(());
                }
                Err(e) if e.is_link_down() => {
                    warn!(error = %e, "Link down during write");
                    self.shared
                        .monitor
                        .enter_disconnected(DisconnectReason::WriteFailed(e.clone()));
                    return Err(e.into());
                }
                Err(LinkError::Cancelled) => {
                    info!("Write cancelled by user");
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > config.max_send_retries {
                        warn!(error = %e, retries = config.max_send_retries, "Giving up on frame");
                        return Ok(());
                    }
                    let delay = config.retry_delay(attempt);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "Write failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Compose against the mirror, queue the frame and keep the composed state.
    fn enqueue_composed<F>(
        &self,
        description: &str,
        long_operation: Option<LongOperation>,
        compose: F,
    ) -> Result<CommandCompletion>
    where
        F: FnOnce(Option<&TowerState>) -> Result<ComposedCommand, ProtocolError>,
    {
        self.ensure_connected()?;
        let mut mirror = self.shared.mirror.lock();
        let composed = compose(mirror.state.as_ref())?;
        let outbound = Outbound {
            frame: composed.frame,
            long_operation,
        };
        let completion = self.shared.sequencer.enqueue(outbound, Some(description));
        mirror.state = Some(composed.state);
        Ok(completion)
    }

    fn enqueue_command(
        &self,
        command: TowerCommand,
        long_operation: Option<LongOperation>,
    ) -> Result<CommandCompletion> {
        self.ensure_connected()?;
        let outbound = Outbound {
            frame: Bytes::copy_from_slice(&[u8::from(command)]),
            long_operation,
        };
        Ok(self.shared.sequencer.enqueue(outbound, Some(&command.to_string())))
    }

    fn long_operation(&self, calibrating: bool) -> LongOperation {
        let mut tasks = self.shared.tasks.lock();
        let id = tasks.next_long_operation;
        tasks.next_long_operation = tasks.next_long_operation.wrapping_add(1);
        LongOperation { id, calibrating }
    }

    /// Flag a long operation and arm the grace timer that clears it. Runs
    /// when the frame is about to be written.
    fn begin_long_operation(&self, operation: LongOperation) {
        let monitor = &self.shared.monitor;
        monitor.set_long_operation(true);
        if operation.calibrating {
            monitor.set_calibrating(true);
        }

        let weak = Arc::downgrade(&self.shared);
        let grace = self.shared.config.long_operation_grace();
        let timer = tokio::spawn(
            async move {
                tokio::time::sleep(grace).await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                {
                    let mut tasks = shared.tasks.lock();
                    if tasks.long_operation != Some(operation.id) {
                        return;
                    }
                    tasks.long_operation = None;
                    // this task's own handle
                    tasks.grace = None;
                }
                if shared.monitor.expire_long_operation() {
                    warn!("Calibration did not report completion within the grace period");
                } else {
                    debug!("Long operation grace period elapsed");
                }
            }
            .instrument(self.shared.span.clone()),
        );

        let previous = {
            let mut tasks = self.shared.tasks.lock();
            tasks.long_operation = Some(operation.id);
            tasks.grace.replace(timer)
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Clear the long-operation flag once a rotation command has completed.
    /// Calibration ends on its own completion signal instead.
    fn finish_long_operation(&self, operation: LongOperation) {
        if operation.calibrating || self.shared.monitor.is_calibrating() {
            return;
        }
        let grace = {
            let mut tasks = self.shared.tasks.lock();
            if tasks.long_operation != Some(operation.id) {
                return;
            }
            tasks.long_operation = None;
            tasks.grace.take()
        };
        if let Some(grace) = grace {
            grace.abort();
        }
        self.shared.monitor.end_long_operation();
    }

    /// Queue a long-running state command and drop its long-operation flag when it completes.
    async fn run_long_operation<F>(&self, description: &str, compose: F) -> Result<CommandOutcome>
    where
        F: FnOnce(Option<&TowerState>) -> Result<ComposedCommand, ProtocolError>,
    {
        let operation = self.long_operation(false);
        let completion = self.enqueue_composed(description, Some(operation), compose)?;
        let outcome = completion.await;
        self.finish_long_operation(operation);
        outcome
    }

    // --- Operations ---

    pub async fn calibrate(&self) -> Result<CommandOutcome> {
        let completion = self.enqueue_command(TowerCommand::Calibration, Some(self.long_operation(true)))?;
        info!(parent: &self.shared.span, "Calibration requested");
        completion.await
    }

    /// Play a sample once. The mirror does not remember it.
    pub async fn play_sound(&self, sample: u8, looped: bool, volume: u8) -> Result<CommandOutcome> {
        let audio = AudioState { sample, looped, volume };
        self.enqueue_composed("play sound", None, |current| composer::compose_sound(current, audio))?.await
    }

    pub async fn set_led(
        &self,
        layer: LightLayer,
        slot: usize,
        effect: LightEffect,
        looped: bool,
    ) -> Result<CommandOutcome> {
        let light = LightState::new(effect, looped);
        self.enqueue_composed("set led", None, |current| composer::compose_led(current, layer, slot, light))?.await
    }

    /// Change several lights in one frame.
    pub async fn set_lights(&self, lights: &[LightPatch]) -> Result<CommandOutcome> {
        let patch = StatePatch {
            lights: lights.to_vec(),
            audio: Some(AudioState::SILENT),
            ..StatePatch::default()
        };
        self.enqueue_composed("set lights", None, |current| composer::compose_patch(current, &patch))?.await
    }

    pub async fn set_led_sequence(&self, sequence: LightSequence) -> Result<CommandOutcome> {
        let patch = StatePatch::new()
            .led_sequence(u8::from(sequence))
            .audio(AudioState::SILENT);
        self.enqueue_composed("led sequence", None, |current| composer::compose_patch(current, &patch))?.await
    }

    /// Turn all three drums in one frame.
    pub async fn rotate(
        &self,
        top: Compass,
        middle: Compass,
        bottom: Compass,
        play_sound: bool,
    ) -> Result<CommandOutcome> {
        let patch = StatePatch::new()
            .drum(DrumLevel::Top, DrumPatch::rotate(top, play_sound))
            .drum(DrumLevel::Middle, DrumPatch::rotate(middle, play_sound))
            .drum(DrumLevel::Bottom, DrumPatch::rotate(bottom, play_sound))
            .audio(AudioState::SILENT);
        self.run_long_operation("rotate drums", |current| composer::compose_patch(current, &patch)).await
    }

    pub async fn rotate_drum(&self, level: DrumLevel, position: Compass, play_sound: bool) -> Result<CommandOutcome> {
        self.run_long_operation("rotate drum", |current| {
            composer::compose_rotation(current, level, position, play_sound)
        })
        .await
    }

    /// Rotate the given drums to random positions.
    pub async fn random_rotate(&self, levels: &[DrumLevel]) -> Result<CommandOutcome> {
        self.ensure_connected()?;
        if levels.is_empty() {
            return Ok(CommandOutcome::Acknowledged);
        }

        let patch = {
            let mut rng = rand::thread_rng();
            levels.iter().fold(StatePatch::new().audio(AudioState::SILENT), |patch, &level| {
                let position = Compass::ALL[rng.gen_range(0..Compass::ALL.len())];
                patch.drum(level, DrumPatch::rotate(position, false))
            })
        };
        debug!(parent: &self.shared.span, drums = ?patch.drums, "Random rotation");

        self.run_long_operation("random rotate", |current| composer::compose_patch(current, &patch)).await
    }

    /// Light the seal's ring slot, play the seal sound and remember the seal as broken.
    pub async fn break_seal(&self, seal: Seal) -> Result<CommandOutcome> {
        let (layer, slot) = seal.light();
        let patch = StatePatch::new()
            .light(layer, slot, LightState::new(LightEffect::BreatheFast, false))
            .audio(AudioState::sample(self.shared.config.seal_break_sound));
        let completion =
            self.enqueue_composed("break seal", None, |current| composer::compose_transient_audio(current, &patch))?;
        self.shared.mirror.lock().broken_seals.insert(seal);
        info!(parent: &self.shared.span, level = %seal.level, side = %seal.side, "Seal broken");
        completion.await
    }

    pub fn broken_seals(&self) -> Vec<Seal> {
        self.shared.mirror.lock().broken_seals.iter().copied().collect()
    }

    pub fn is_seal_broken(&self, seal: Seal) -> bool {
        self.shared.mirror.lock().broken_seals.contains(&seal)
    }

    pub fn reset_broken_seals(&self) {
        self.shared.mirror.lock().broken_seals.clear();
    }

    pub async fn reset_skull_counter(&self) -> Result<CommandOutcome> {
        let completion = self.enqueue_command(TowerCommand::ResetCounter, None)?;
        {
            let mut mirror = self.shared.mirror.lock();
            mirror.skull_count = Some(0);
            if let Some(state) = mirror.state.as_mut() {
                state.beam.skull_count = 0;
            }
        }
        completion.await
    }

    pub async fn reset_door(&self) -> Result<CommandOutcome> {
        self.enqueue_command(TowerCommand::DoorReset, None)?.await
    }

    pub async fn unjam_drums(&self) -> Result<CommandOutcome> {
        self.enqueue_command(TowerCommand::UnjamDrums, None)?.await
    }

    pub async fn overwrite_drum_states(&self) -> Result<CommandOutcome> {
        self.enqueue_command(TowerCommand::OverwriteDrumStates, None)?.await
    }

    /// Send an arbitrary patch against the mirror. Audio in the patch is played once.
    pub async fn send_patch(&self, patch: &StatePatch) -> Result<CommandOutcome> {
        self.enqueue_composed("state patch", None, |current| composer::compose_transient_audio(current, patch))?.await
    }

    /// Queue a prebuilt frame as is. The mirror is left alone.
    pub async fn send_raw(&self, frame: Bytes) -> Result<CommandOutcome> {
        self.ensure_connected()?;
        self.shared.sequencer.enqueue(frame.into(), Some("raw frame")).await
    }

    // --- Inbound ---

    fn handle_frame(&self, frame: &[u8]) {
        let Some(class) = message::classify_frame(frame) else {
            debug!("Ignoring empty frame");
            return;
        };
        let monitor = &self.shared.monitor;
        monitor.record_response();

        match class.kind {
            MessageKind::BatteryReading => {
                monitor.record_heartbeat();
                self.handle_battery(frame);
                return;
            }
            MessageKind::TowerState => match codec::decode_state_frame(frame) {
                Ok(state) => self.handle_state(state),
                Err(e) => warn!(error = %e, bytes = %hex::encode(frame), "Undecodable state frame"),
            },
            MessageKind::CalibrationFinished => {
                self.log_frame(&class, frame);
                self.complete_calibration();
                self.emit_message(&class, frame);
            }
            _ => {
                self.log_frame(&class, frame);
                self.emit_message(&class, frame);
            }
        }

        self.shared.sequencer.on_response();
    }

    fn log_frame(&self, class: &Classification, frame: &[u8]) {
        let bytes = hex::encode(frame);
        if class.critical {
            warn!(kind = %class.kind, bytes, "Tower reported a fault");
        } else if class.kind.is_unmapped() {
            info!(kind = %class.kind, bytes, "Unmapped tower message");
        } else {
            debug!(kind = %class.kind, bytes, "Tower message");
        }
    }

    fn emit_message(&self, class: &Classification, frame: &[u8]) {
        self.shared.events.emit(TowerEvent::Message {
            kind: class.kind,
            lines: message::render_human_readable(frame),
        });
    }

    fn handle_battery(&self, frame: &[u8]) {
        let Some(millivolts) = message::battery_millivolts(frame) else {
            debug!(bytes = %hex::encode(frame), "Short battery frame");
            return;
        };
        let percent = message::millivolts_to_percentage(millivolts);
        let config = &self.shared.config;
        if config.log_battery_frames {
            debug!(millivolts, percent, "Battery");
        } else {
            trace!(millivolts, percent, "Battery");
        }

        let notify = {
            let mut mirror = self.shared.mirror.lock();
            let battery = &mut mirror.battery;
            battery.last_millivolts = Some(millivolts);

            let now = Instant::now();
            let due = config.battery_notify_enabled
                && if config.battery_notify_on_change_only {
                    battery.last_percent != Some(percent)
                } else {
                    battery
                        .last_notified
                        .is_none_or(|at| now.duration_since(at) >= config.battery_notify_interval())
                };
            if due {
                battery.last_percent = Some(percent);
                battery.last_notified = Some(now);
            }
            due
        };

        if notify {
            self.shared.events.emit(TowerEvent::Battery { millivolts, percent });
        }
    }

    fn handle_state(&self, state: TowerState) {
        let skull_drop = {
            let mut mirror = self.shared.mirror.lock();
            mirror.state = Some(state);
            let count = state.beam.skull_count;
            if mirror.skull_count != Some(count) {
                mirror.skull_count = Some(count);
                (count != 0).then_some(count)
            } else {
                None
            }
        };
        debug!(%state, "Tower state");
        self.shared.events.emit(TowerEvent::StateChanged(state));

        if let Some(count) = skull_drop {
            info!(count, "Skull dropped");
            self.shared.events.emit(TowerEvent::SkullDrop(count));
        }

        if state.is_calibrated() && self.shared.monitor.is_calibrating() {
            self.complete_calibration();
        }
    }

    fn complete_calibration(&self) {
        if !self.shared.monitor.finish_calibration() {
            return;
        }
        let grace = {
            let mut tasks = self.shared.tasks.lock();
            tasks.long_operation = None;
            tasks.grace.take()
        };
        if let Some(grace) = grace {
            grace.abort();
        }
        info!("Calibration complete");
        self.shared.events.emit(TowerEvent::CalibrationComplete);
    }

    // --- Introspection ---

    pub fn subscribe(&self) -> broadcast::Receiver<TowerEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> Option<TowerState> {
        self.shared.mirror.lock().state
    }

    pub fn is_calibrated(&self) -> bool {
        self.state().is_some_and(|s| s.is_calibrated())
    }

    /// Last reported beam count, if any state frame has been seen.
    pub fn skull_count(&self) -> Option<u16> {
        self.shared.mirror.lock().skull_count
    }

    /// Last battery reading as (millivolts, percent).
    pub fn battery(&self) -> Option<(u16, u8)> {
        self.shared
            .mirror
            .lock()
            .battery
            .last_millivolts
            .map(|mv| (mv, message::millivolts_to_percentage(mv)))
    }

    pub fn is_connected(&self) -> bool {
        self.shared.monitor.is_connected()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.shared.monitor.status()
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.shared.sequencer.status()
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.shared.monitor.device_info()
    }

    pub fn config(&self) -> &TowerConfig {
        &self.shared.config
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }
}
