//! Common test utilities and shared imports

// Shared across test files; not every item is used by every file
#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use darktower_lib::codec::encode_state_frame;
#[allow(unused_imports)]
pub use darktower_lib::sequencer::CommandOutcome;
#[allow(unused_imports)]
pub use darktower_lib::sim::{SimOptions, SimulatedTower, battery_frame};
#[allow(unused_imports)]
pub use darktower_lib::state::{Compass, DrumLevel, LightEffect, LightLayer, Seal, TowerState};
#[allow(unused_imports)]
pub use darktower_lib::{DarkTower, DisconnectReason, LinkError, TowerConfig, TowerError, TowerEvent};
#[allow(unused_imports)]
pub use std::time::Duration;
#[allow(unused_imports)]
pub use tokio::time::Instant;

use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// Let spawned tasks run without moving the clock.
#[allow(dead_code)]
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Route library logs to the test output. Honors RUST_LOG.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Build a controller on a fresh simulated tower and connect it.
#[allow(dead_code)]
pub async fn connected(
    options: SimOptions,
    config: TowerConfig,
) -> (DarkTower<SimulatedTower>, SimulatedTower, broadcast::Receiver<TowerEvent>) {
    init_tracing();
    let sim = SimulatedTower::new(options);
    let tower = DarkTower::new(sim.clone(), config);
    let events = tower.subscribe();
    tower.connect().await.expect("Failed to connect");
    assert!(tower.is_connected());
    (tower, sim, events)
}

/// Everything received so far.
#[allow(dead_code)]
pub fn drain(events: &mut broadcast::Receiver<TowerEvent>) -> Vec<TowerEvent> {
    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    received
}

#[allow(dead_code)]
pub fn disconnects(events: &[TowerEvent]) -> Vec<DisconnectReason> {
    events
        .iter()
        .filter_map(|e| match e {
            TowerEvent::Disconnected(reason) => Some(reason.clone()),
            _ => None,
        })
        .collect()
}

/// State report for the given tower state.
#[allow(dead_code)]
pub fn state_report(state: &TowerState) -> Bytes {
    encode_state_frame(state).expect("Failed to encode state")
}
