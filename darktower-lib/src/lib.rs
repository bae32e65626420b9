pub mod codec;
pub mod composer;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod event;
pub mod liveness;
pub mod message;
pub mod sequencer;
pub mod sim;
pub mod state;
pub mod transport;


// Re-export the controller and the types most callers touch
pub use config::TowerConfig;
pub use device::DarkTower;
pub use error::{LinkError, ProtocolError, TowerError};
pub use event::{DisconnectReason, TowerEvent};
pub use state::TowerState;
pub use transport::{TowerTransport, TransportEvent};
