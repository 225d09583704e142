use shared::types::NodeId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("peer {0} is not reachable")]
    NodeUnavailable(NodeId),

    #[error("peer {0} is not part of the configured fleet")]
    UnknownPeer(NodeId),

    #[error("transport channel closed")]
    ChannelClosed,
}

#[derive(Error, Debug)]
pub enum SensorError {
    #[error("sensor device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("sensor returned an implausible reading: {0}")]
    ImplausibleReading(String),
}
