// AGV yard - shared code for the yard viewer (client.rs) and the traffic dispatcher (server.rs)
pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod grid;
pub mod link;
pub mod protocol;
pub mod queue;
pub mod telemetry;
pub mod vehicle;

pub use command::MotionCommand;
pub use config::{ClientConfig, ServerConfig, VehicleConfig};
pub use dispatch::{Dispatcher, SlotStatus, manhattan_route};
pub use error::{ConfigError, DispatchError, GridError, LinkError, ProtocolError};
pub use executor::{MotionExecutor, Pose};
pub use grid::{CellGrid, CellId, GridConfig, Position, Zone};
pub use link::{LinkOptions, LinkState, VehicleLink};
pub use protocol::{ClientMessage, PathAssignment};
pub use queue::CommandQueue;
pub use vehicle::{Fleet, Vehicle, VehicleSnapshot};
