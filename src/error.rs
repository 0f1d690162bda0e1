// Error types shared by the client and the dispatcher
use crate::grid::CellId;
use crate::link::LinkState;
use std::io;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GridError {
    #[error("cell {0} lies outside the yard")]
    CellOutOfRange(CellId),
    #[error("lane {lane} / row {row} lies outside the yard")]
    LaneRowOutOfRange { lane: i32, row: i32 },
}

/// Failures while turning wire bytes into typed messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed assignment: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("assignment has no waypoints")]
    EmptyPath,
    #[error("speed must be a positive number, got {0}")]
    InvalidSpeed(f32),
    #[error("flag must be 0 or 1, got {0}")]
    InvalidFlag(i64),
    #[error("unrecognised client line {0:?}")]
    UnknownLine(String),
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("could not connect to {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("link is {0:?}, expected Disconnected")]
    InvalidState(LinkState),
    #[error("link is not connected")]
    NotConnected,
    #[error("peer closed the connection")]
    PeerClosed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("vehicle {0} is not logged in")]
    UnknownVehicle(String),
    #[error("vehicle {name} reported cell {reported}, expected {expected:?}")]
    UnexpectedCompletion {
        name: String,
        reported: CellId,
        expected: Option<CellId>,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}
