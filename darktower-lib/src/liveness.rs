//! Connection lifecycle and health checking.
//!
//! Battery frames arrive roughly every 200ms and double as the heartbeat.
//! Any inbound frame counts as a response. A periodic health check compares
//! both clocks against their thresholds and tears the connection down when
//! the tower has gone quiet.

use crate::config::TowerConfig;
use crate::error::{LinkError, Result, TowerError};
use crate::event::{DisconnectReason, EventBus, TowerEvent};
use crate::transport::{DeviceInfo, TowerTransport};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use strum_macros::Display;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, Span, debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal
    Disposed,
}

/// Point-in-time view of the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub link_connected: bool,
    pub ms_since_last_response: Option<u64>,
    pub ms_since_last_heartbeat: Option<u64>,
    pub long_operation: bool,
    pub calibrating: bool,
    pub heartbeat_monitoring: bool,
    pub verify_before_disconnect: bool,
    pub heartbeat_timeout_ms: u64,
    pub long_operation_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub health_check_interval_ms: u64,
}

type DisconnectListener = Arc<dyn Fn(&DisconnectReason) + Send + Sync>;

struct MonitorState {
    connection: ConnectionState,
    last_response: Instant,
    last_heartbeat: Instant,
    long_operation: bool,
    calibrating: bool,
    device_info: Option<DeviceInfo>,
    health_task: Option<JoinHandle<()>>,
}

struct MonitorShared<T> {
    transport: Arc<T>,
    config: TowerConfig,
    state: Mutex<MonitorState>,
    listeners: Mutex<Vec<DisconnectListener>>,
    events: EventBus,
    span: Span,
}

pub struct LivenessMonitor<T> {
    shared: Arc<MonitorShared<T>>,
}

impl<T> Clone for LivenessMonitor<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: TowerTransport> LivenessMonitor<T> {
    pub fn new(transport: Arc<T>, config: TowerConfig, events: EventBus, parent: &Span) -> Self {
        let now = Instant::now();
        Self {
            shared: Arc::new(MonitorShared {
                transport,
                config,
                state: Mutex::new(MonitorState {
                    connection: ConnectionState::Disconnected,
                    last_response: now,
                    last_heartbeat: now,
                    long_operation: false,
                    calibrating: false,
                    device_info: None,
                    health_task: None,
                }),
                listeners: Mutex::new(Vec::new()),
                events,
                span: tracing::info_span!(parent: parent, "liveness"),
            }),
        }
    }

    /// Register a callback run on every transition into `Disconnected` (or
    /// `Disposed` from a live connection). Listeners run before the
    /// `Disconnected` event is broadcast.
    pub fn on_disconnect<F>(&self, listener: F)
    where
        F: Fn(&DisconnectReason) + Send + Sync + 'static,
    {
        self.shared.listeners.lock().push(Arc::new(listener));
    }

    /// Connect the transport and start health checking.
    ///
    /// Link failures are returned and also reported as
    /// `Disconnected(ConnectFailed)`. Calling this on a disposed monitor
    /// fails with [`TowerError::Disposed`].
    pub async fn connect(&self) -> Result<()> {
        {
            let mut st = self.shared.state.lock();
            match st.connection {
                ConnectionState::Disposed => return Err(TowerError::Disposed),
                ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
                ConnectionState::Disconnected => st.connection = ConnectionState::Connecting,
            }
        }

        let config = &self.shared.config;
        async {
            info!("Connecting to {}", config.device_name);
            if let Err(e) = self
                .shared
                .transport
                .connect(&config.device_name, &config.service_ids)
                .await
            {
                warn!(error = %e, "Connect failed");
                self.enter_disconnected(DisconnectReason::ConnectFailed(e.clone()));
                return Err(e.into());
            }

            let device_info = match self.shared.transport.read_device_info().await {
                Ok(info) => {
                    debug!(fields = info.len(), "Device information read");
                    Some(info)
                }
                Err(e) => {
                    warn!(error = %e, "Could not read device information");
                    None
                }
            };

            {
                let mut st = self.shared.state.lock();
                if st.connection != ConnectionState::Connecting {
                    // disposed or disconnected while the link came up
                    return Err(match st.connection {
                        ConnectionState::Disposed => TowerError::Disposed,
                        _ => LinkError::NotConnected.into(),
                    });
                }
                let now = Instant::now();
                st.connection = ConnectionState::Connected;
                st.last_response = now;
                st.last_heartbeat = now;
                st.device_info = device_info;
                st.health_task = Some(self.spawn_health_check());
            }

            info!("Tower connected");
            self.shared.events.emit(TowerEvent::Connected);
            Ok(())
        }
        .instrument(self.shared.span.clone())
        .await
    }

    fn spawn_health_check(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        let period = self.shared.config.health_check_interval();
        tokio::spawn(Self::health_loop(weak, period).instrument(self.shared.span.clone()))
    }

    async fn health_loop(shared: Weak<MonitorShared<T>>, period: std::time::Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(shared) = shared.upgrade() else {
                break;
            };
            let monitor = LivenessMonitor { shared };
            if !monitor.check_health() {
                break;
            }
        }
    }

    /// Run one health check. Returns false once the monitor is no longer connected.
    pub fn check_health(&self) -> bool {
        let link_up = self.shared.transport.is_link_connected();
        let config = &self.shared.config;

        let verdict = {
            let mut st = self.shared.state.lock();
            if st.connection != ConnectionState::Connected {
                return false;
            }
            let now = Instant::now();

            let mut verdict = None;
            if !link_up {
                verdict = Some(DisconnectReason::LinkLost);
            } else if config.heartbeat_monitoring {
                let threshold = if st.long_operation {
                    config.long_operation_timeout()
                } else {
                    config.heartbeat_timeout()
                };
                let silent = now.duration_since(st.last_heartbeat);
                if silent > threshold {
                    if st.long_operation {
                        debug!(silent_ms = silent.as_millis() as u64, "Heartbeat gap during long operation");
                    } else if config.verify_before_disconnect && self.shared.transport.is_link_connected() {
                        warn!(
                            silent_ms = silent.as_millis() as u64,
                            "Heartbeat missed but link still up, treating as transient"
                        );
                        st.last_heartbeat = now;
                    } else {
                        verdict = Some(DisconnectReason::HeartbeatTimeout);
                    }
                }
            }

            if verdict.is_none() && now.duration_since(st.last_response) > config.response_timeout() {
                verdict = Some(DisconnectReason::ResponseTimeout);
            }
            verdict
        };

        match verdict {
            Some(reason) => {
                self.enter_disconnected(reason);
                false
            }
            None => true,
        }
    }

    /// Move to `Disconnected` and notify. Returns false when already disconnected or disposed.
    pub fn enter_disconnected(&self, reason: DisconnectReason) -> bool {
        self.transition(ConnectionState::Disconnected, reason)
    }

    fn transition(&self, to: ConnectionState, reason: DisconnectReason) -> bool {
        let (was, task) = {
            let mut st = self.shared.state.lock();
            let was = st.connection;
            if was == ConnectionState::Disposed || (was == to && to == ConnectionState::Disconnected) {
                return false;
            }
            st.connection = to;
            st.long_operation = false;
            st.calibrating = false;
            st.device_info = None;
            (was, st.health_task.take())
        };

        if let Some(task) = task {
            task.abort();
        }
        if was == ConnectionState::Disconnected {
            // disposing an idle monitor
            return true;
        }

        {
            let _guard = self.shared.span.enter();
            match &reason {
                DisconnectReason::Requested | DisconnectReason::Disposed => info!(?reason, "Tower disconnected"),
                _ => warn!(?reason, "Tower disconnected"),
            }
        }

        let listeners = self.shared.listeners.lock().clone();
        for listener in listeners {
            listener(&reason);
        }
        self.shared.events.emit(TowerEvent::Disconnected(reason));
        true
    }

    /// Explicit disconnect. Always stops health checking, then closes the link.
    pub async fn disconnect(&self) -> Result<()> {
        if self.state() == ConnectionState::Disposed {
            return Err(TowerError::Disposed);
        }
        self.enter_disconnected(DisconnectReason::Requested);
        self.shared.transport.disconnect().await?;
        Ok(())
    }

    pub fn on_link_lost(&self) {
        self.enter_disconnected(DisconnectReason::LinkLost);
    }

    /// Enter the terminal state and release the transport. Idempotent.
    pub async fn dispose(&self) {
        if self.transition(ConnectionState::Disposed, DisconnectReason::Disposed) {
            self.shared.transport.cleanup().await;
        }
    }

    pub fn record_response(&self) {
        self.shared.state.lock().last_response = Instant::now();
    }

    pub fn record_heartbeat(&self) {
        let mut st = self.shared.state.lock();
        let now = Instant::now();
        st.last_heartbeat = now;
        st.last_response = now;
    }

    pub fn reset_heartbeat(&self) {
        self.shared.state.lock().last_heartbeat = Instant::now();
    }

    pub fn set_long_operation(&self, active: bool) {
        self.shared.state.lock().long_operation = active;
    }

    /// Clear the long-operation flag and restart the heartbeat clock.
    pub fn end_long_operation(&self) {
        let mut st = self.shared.state.lock();
        if st.long_operation {
            st.long_operation = false;
            st.last_heartbeat = Instant::now();
        }
    }

    /// The long-operation window ran out without a completion signal. Drops
    /// both flags and restarts the heartbeat clock. Returns true if a
    /// calibration was still running.
    pub fn expire_long_operation(&self) -> bool {
        let mut st = self.shared.state.lock();
        let was_calibrating = st.calibrating;
        st.calibrating = false;
        if st.long_operation {
            st.long_operation = false;
            st.last_heartbeat = Instant::now();
        }
        was_calibrating
    }

    pub fn set_calibrating(&self, active: bool) {
        self.shared.state.lock().calibrating = active;
    }

    /// End a running calibration. Returns true if one was running.
    pub fn finish_calibration(&self) -> bool {
        let mut st = self.shared.state.lock();
        if !st.calibrating {
            return false;
        }
        st.calibrating = false;
        st.long_operation = false;
        st.last_heartbeat = Instant::now();
        true
    }

    pub fn is_calibrating(&self) -> bool {
        self.shared.state.lock().calibrating
    }

    pub fn is_long_operation(&self) -> bool {
        self.shared.state.lock().long_operation
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().connection
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.shared.state.lock().device_info.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        let link_connected = self.shared.transport.is_link_connected();
        let st = self.shared.state.lock();
        let live = st.connection == ConnectionState::Connected;
        let since = |at: Instant| live.then(|| at.elapsed().as_millis() as u64);
        let config = &self.shared.config;
        ConnectionStatus {
            state: st.connection,
            link_connected,
            ms_since_last_response: since(st.last_response),
            ms_since_last_heartbeat: since(st.last_heartbeat),
            long_operation: st.long_operation,
            calibrating: st.calibrating,
            heartbeat_monitoring: config.heartbeat_monitoring,
            verify_before_disconnect: config.verify_before_disconnect,
            heartbeat_timeout_ms: config.heartbeat_timeout_ms,
            long_operation_timeout_ms: config.long_operation_timeout_ms,
            response_timeout_ms: config.response_timeout_ms,
            health_check_interval_ms: config.health_check_interval_ms,
        }
    }
}
