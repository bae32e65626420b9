//! In-memory tower used by the test suite and the `simulate` command.
//!
//! Behaves like a well-mannered tower: state commands are applied and echoed
//! back as a state report, calibration finishes after a delay, and battery
//! heartbeats are emitted at a fixed period while the link is up. Test hooks
//! allow forcing write failures, dropping the link and injecting frames.

use crate::codec;
use crate::error::LinkError;
use crate::message::{MessageKind, TowerCommand};
use crate::state::{Compass, TowerState};
use crate::transport::{DeviceInfo, TowerTransport, TransportEvent};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Period of battery heartbeats, `None` for no heartbeats
    pub battery_period: Option<Duration>,
    pub battery_millivolts: u16,
    pub calibration_time: Duration,
    pub device_info: DeviceInfo,
    /// Answer `connect` with `NotFound` when false
    pub present: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        let mut device_info = DeviceInfo::new();
        device_info.insert("manufacturer".into(), "Restoration Games".into());
        device_info.insert("model".into(), "ReturnToDarkTower".into());
        device_info.insert("firmware".into(), "sim".into());
        Self {
            battery_period: Some(Duration::from_millis(200)),
            battery_millivolts: 4200,
            calibration_time: Duration::from_secs(2),
            device_info,
            present: true,
        }
    }
}

impl SimOptions {
    /// No background traffic at all; frames only flow in answer to writes.
    pub fn quiet() -> Self {
        Self {
            battery_period: None,
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct SimState {
    link_connected: bool,
    tower: TowerState,
    battery_millivolts: u16,
    written: Vec<Bytes>,
    write_attempts: usize,
    write_failures: VecDeque<LinkError>,
    connect_failure: Option<LinkError>,
    echo_state: bool,
    cleaned_up: bool,
    heartbeat: Option<JoinHandle<()>>,
    calibration: Option<JoinHandle<()>>,
}

struct SimInner {
    options: SimOptions,
    state: Mutex<SimState>,
    sink: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

/// Simulated tower transport. Clones share the same tower.
#[derive(Clone)]
pub struct SimulatedTower {
    inner: Arc<SimInner>,
}

impl Default for SimulatedTower {
    fn default() -> Self {
        Self::new(SimOptions::default())
    }
}

/// Build a battery report carrying `millivolts`.
pub fn battery_frame(millivolts: u16) -> Bytes {
    let mut frame = BytesMut::with_capacity(5);
    frame.put_u8(MessageKind::BatteryReading.into());
    frame.put_u16(0);
    frame.put_u16(millivolts);
    frame.freeze()
}

impl SimulatedTower {
    pub fn new(options: SimOptions) -> Self {
        let battery_millivolts = options.battery_millivolts;
        Self {
            inner: Arc::new(SimInner {
                options,
                state: Mutex::new(SimState {
                    battery_millivolts,
                    echo_state: true,
                    ..SimState::default()
                }),
                sink: Mutex::new(None),
            }),
        }
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(sink) = self.inner.sink.lock().as_ref() {
            let _ = sink.send(event);
        }
    }

    fn emit_state(&self, state: &TowerState) {
        match codec::encode_state_frame(state) {
            Ok(frame) => self.emit(TransportEvent::Bytes(frame)),
            Err(e) => debug!(error = %e, "Simulated tower could not encode its state"),
        }
    }

    /// React to a frame the controller wrote.
    fn respond(&self, frame: &[u8]) {
        let Some(&first) = frame.first() else {
            return;
        };
        let Ok(command) = TowerCommand::try_from(first) else {
            debug!(discriminator = first, "Simulated tower ignores unknown command");
            return;
        };

        let echo = {
            let mut st = self.inner.state.lock();
            match command {
                TowerCommand::TowerState => match codec::decode_state_frame(frame) {
                    Ok(mut next) => {
                        // the beam counter belongs to the tower
                        next.beam = st.tower.beam;
                        st.tower = next;
                    }
                    Err(e) => {
                        debug!(error = %e, "Simulated tower ignores malformed state command");
                        return;
                    }
                },
                TowerCommand::ResetCounter => st.tower.beam.skull_count = 0,
                TowerCommand::UnjamDrums => st.tower.drums.iter_mut().for_each(|d| d.jammed = false),
                TowerCommand::DoorReset | TowerCommand::OverwriteDrumStates => {}
                TowerCommand::Calibration => {
                    let task = self.spawn_calibration();
                    if let Some(previous) = st.calibration.replace(task) {
                        previous.abort();
                    }
                    return;
                }
            }
            st.echo_state.then_some(st.tower)
        };

        if let Some(state) = echo {
            self.emit_state(&state);
        }
    }

    fn spawn_calibration(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.options.calibration_time;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let tower = SimulatedTower { inner };
            let state = {
                let mut st = tower.inner.state.lock();
                for drum in st.tower.drums.iter_mut() {
                    drum.calibrated = true;
                    drum.jammed = false;
                    drum.position = Compass::North;
                }
                st.tower
            };
            tower.emit_state(&state);
            tower.emit(TransportEvent::Bytes(Bytes::from_static(&[0x08])));
        })
    }

    fn spawn_heartbeat(&self, period: Duration) -> JoinHandle<()> {
        let weak: Weak<SimInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let tower = SimulatedTower { inner };
                let (up, millivolts) = {
                    let st = tower.inner.state.lock();
                    (st.link_connected, st.battery_millivolts)
                };
                if up {
                    trace!(millivolts, "Simulated heartbeat");
                    tower.emit(TransportEvent::Bytes(battery_frame(millivolts)));
                }
            }
        })
    }

    // --- Test hooks ---

    /// Frames that were written successfully, oldest first.
    pub fn written(&self) -> Vec<Bytes> {
        self.inner.state.lock().written.clone()
    }

    /// Every call to `write`, failed ones included.
    pub fn write_attempts(&self) -> usize {
        self.inner.state.lock().write_attempts
    }

    /// Make the next `count` writes fail with `error`.
    pub fn fail_next_writes(&self, count: usize, error: LinkError) {
        let mut st = self.inner.state.lock();
        st.write_failures.extend(std::iter::repeat_n(error, count));
    }

    pub fn fail_next_connect(&self, error: LinkError) {
        self.inner.state.lock().connect_failure = Some(error);
    }

    /// Flip the link-layer flag without telling anyone.
    pub fn set_link_connected(&self, connected: bool) {
        self.inner.state.lock().link_connected = connected;
    }

    /// Drop the link and report it.
    pub fn lose_link(&self) {
        self.set_link_connected(false);
        self.emit(TransportEvent::LinkLost);
    }

    pub fn set_availability(&self, available: bool) {
        self.emit(TransportEvent::Availability(available));
    }

    /// Stop echoing state reports, so state commands go unanswered.
    pub fn set_echo_state(&self, echo: bool) {
        self.inner.state.lock().echo_state = echo;
    }

    pub fn set_battery_millivolts(&self, millivolts: u16) {
        self.inner.state.lock().battery_millivolts = millivolts;
    }

    /// A skull falls through the beam.
    pub fn drop_skull(&self) {
        let state = {
            let mut st = self.inner.state.lock();
            st.tower.beam.skull_count = st.tower.beam.skull_count.wrapping_add(1);
            st.tower
        };
        self.emit_state(&state);
    }

    /// Push an arbitrary inbound frame.
    pub fn inject(&self, frame: impl Into<Bytes>) {
        self.emit(TransportEvent::Bytes(frame.into()));
    }

    pub fn tower_state(&self) -> TowerState {
        self.inner.state.lock().tower
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.inner.state.lock().cleaned_up
    }
}

impl TowerTransport for SimulatedTower {
    async fn connect(&self, device_name: &str, _service_ids: &[String]) -> Result<(), LinkError> {
        if !self.inner.options.present {
            return Err(LinkError::NotFound);
        }
        let mut st = self.inner.state.lock();
        if let Some(error) = st.connect_failure.take() {
            return Err(error);
        }
        debug!(device_name, "Simulated link up");
        st.link_connected = true;
        if let Some(period) = self.inner.options.battery_period {
            let task = self.spawn_heartbeat(period);
            if let Some(previous) = st.heartbeat.replace(task) {
                previous.abort();
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        let mut st = self.inner.state.lock();
        st.link_connected = false;
        if let Some(task) = st.heartbeat.take() {
            task.abort();
        }
        Ok(())
    }

    fn is_link_connected(&self) -> bool {
        self.inner.state.lock().link_connected
    }

    async fn write(&self, frame: Bytes) -> Result<(), LinkError> {
        {
            let mut st = self.inner.state.lock();
            st.write_attempts += 1;
            if !st.link_connected {
                return Err(LinkError::NotConnected);
            }
            if let Some(error) = st.write_failures.pop_front() {
                return Err(error);
            }
            st.written.push(frame.clone());
        }
        self.respond(&frame);
        Ok(())
    }

    async fn read_device_info(&self) -> Result<DeviceInfo, LinkError> {
        if !self.is_link_connected() {
            return Err(LinkError::NotConnected);
        }
        Ok(self.inner.options.device_info.clone())
    }

    async fn cleanup(&self) {
        let mut st = self.inner.state.lock();
        st.link_connected = false;
        st.cleaned_up = true;
        for task in [st.heartbeat.take(), st.calibration.take()].into_iter().flatten() {
            task.abort();
        }
        drop(st);
        self.inner.sink.lock().take();
    }

    fn attach(&self, sink: mpsc::UnboundedSender<TransportEvent>) {
        *self.inner.sink.lock() = Some(sink);
    }
}
