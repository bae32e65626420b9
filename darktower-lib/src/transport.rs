//! The seam between the protocol engine and a concrete wireless stack.

use crate::error::LinkError;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::future::Future;
use tokio::sync::mpsc;

/// Values read from the device information service, keyed by characteristic name.
pub type DeviceInfo = BTreeMap<String, String>;

/// Unsolicited notifications pushed by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One inbound frame, discriminator byte first
    Bytes(Bytes),
    /// The link dropped without being asked to
    LinkLost,
    /// The adapter itself became usable or unusable
    Availability(bool),
}

/// A link to one tower.
///
/// Implementations push inbound frames and link notifications into the sink
/// handed over by [`TowerTransport::attach`]. Every method takes `&self`; an
/// adapter keeps its own interior state.
pub trait TowerTransport: Send + Sync + 'static {
    fn connect(&self, device_name: &str, service_ids: &[String]) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Link-layer view of the connection, independent of any protocol traffic.
    fn is_link_connected(&self) -> bool;

    fn write(&self, frame: Bytes) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn read_device_info(&self) -> impl Future<Output = Result<DeviceInfo, LinkError>> + Send;

    /// Release adapter resources. Called once on dispose.
    fn cleanup(&self) -> impl Future<Output = ()> + Send;

    /// Register the sink for inbound events. A later call replaces the earlier sink.
    fn attach(&self, sink: mpsc::UnboundedSender<TransportEvent>);
}
