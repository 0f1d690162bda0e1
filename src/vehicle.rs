use crate::config::ClientConfig;
use crate::error::{ConfigError, LinkError};
use crate::executor::{MotionExecutor, Pose};
use crate::grid::{CellGrid, CellId};
use crate::link::{LinkOptions, LinkState, VehicleLink};
use crate::queue::CommandQueue;
use tracing::{info, warn};

/// Read-only view of one vehicle for the render layer.
#[derive(Clone, Debug, PartialEq)]
pub struct VehicleSnapshot {
    pub name: String,
    pub pose: Pose,
    pub link: LinkState,
    pub pending: usize,
    pub target: Option<CellId>,
    pub completed: u64,
}

/// One simulated AGV: its server link, command queue and executor.
pub struct Vehicle {
    link: VehicleLink,
    queue: CommandQueue,
    executor: MotionExecutor,
    completed: u64,
    torn_down: bool,
}

impl Vehicle {
    pub fn new(
        name: impl Into<String>,
        addr: impl Into<String>,
        start_cell: CellId,
        grid: &CellGrid,
        options: LinkOptions,
        idle_interval: f32,
    ) -> Self {
        let queue = CommandQueue::new();
        let link = VehicleLink::new(name, addr, grid.clone(), queue.clone(), options);
        let start = grid.cell_to_position(start_cell);
        let executor = MotionExecutor::with_idle_interval(start, idle_interval);
        Self {
            link,
            queue,
            executor,
            completed: 0,
            torn_down: false,
        }
    }

    pub fn name(&self) -> &str {
        self.link.name()
    }

    pub fn connect(&mut self) -> Result<(), LinkError> {
        self.link.connect()
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn executor(&self) -> &MotionExecutor {
        &self.executor
    }

    /// Advances this vehicle by `dt` and reports every finished path to the server.
    /// Returns how many paths finished during the tick.
    pub fn tick(&mut self, dt: f32) -> usize {
        let link = &self.link;
        let mut finished = 0;
        self.executor.tick(dt, &self.queue, |cell| {
            finished += 1;
            info!(vehicle = %link.name(), cell, "path complete");
            if let Err(e) = link.send_completion(cell) {
                warn!(vehicle = %link.name(), cell, error = %e, "completion report not sent");
            }
        });
        self.completed += finished as u64;
        finished
    }

    pub fn snapshot(&self) -> VehicleSnapshot {
        VehicleSnapshot {
            name: self.name().to_string(),
            pose: self.executor.pose(),
            link: self.link.state(),
            pending: self.queue.len(),
            target: self.executor.current().map(|c| c.final_cell()),
            completed: self.completed,
        }
    }

    /// Closes the link and drops pending commands. Calling it again does nothing.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.link.shutdown();
        let dropped = self.queue.clear();
        if dropped > 0 {
            info!(vehicle = %self.name(), dropped, "discarded pending commands");
        }
    }
}

impl Drop for Vehicle {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// All vehicles of a yard, stepped together on a fixed simulation cadence.
pub struct Fleet {
    grid: CellGrid,
    vehicles: Vec<Vehicle>,
    tick_interval: f32,
    accumulator: f32,
    sim_time: f64,
}

impl Fleet {
    /// Frames longer than this are truncated so a stalled window does not
    /// trigger a burst of catch-up ticks.
    const MAX_FRAME: f32 = 0.25;
    /// Smallest accepted tick. Shorter or non-finite intervals are raised to it.
    pub const MIN_TICK: f32 = 0.001;

    pub fn new(grid: CellGrid, tick_interval: f32) -> Self {
        let tick_interval = if tick_interval.is_finite() && tick_interval >= Self::MIN_TICK {
            tick_interval
        } else {
            warn!(requested = tick_interval, used = Self::MIN_TICK, "tick interval too small");
            Self::MIN_TICK
        };
        Self {
            grid,
            vehicles: Vec::new(),
            tick_interval,
            accumulator: 0.0,
            sim_time: 0.0,
        }
    }

    /// Spawns and connects every configured vehicle. Vehicles whose connection
    /// fails stay in the fleet in the `Failed` state.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut fleet = Self::new(CellGrid::new(config.grid.clone()), config.tick_interval);
        for v in &config.vehicles {
            let mut vehicle = Vehicle::new(
                v.name.clone(),
                config.server_for(v),
                v.start_cell,
                &fleet.grid,
                config.link_options(),
                config.idle_interval,
            );
            // failure is already logged by the link
            let _ = vehicle.connect();
            fleet.spawn(vehicle);
        }
        Ok(fleet)
    }

    pub fn grid(&self) -> &CellGrid {
        &self.grid
    }

    pub fn spawn(&mut self, vehicle: Vehicle) {
        info!(vehicle = %vehicle.name(), "spawned");
        self.vehicles.push(vehicle);
    }

    /// Tears the named vehicle down and removes it.
    pub fn despawn(&mut self, name: &str) -> bool {
        let Some(index) = self.vehicles.iter().position(|v| v.name() == name) else {
            return false;
        };
        let mut vehicle = self.vehicles.remove(index);
        vehicle.teardown();
        info!(vehicle = %name, "despawned");
        true
    }

    pub fn vehicles(&self) -> &[Vehicle] {
        &self.vehicles
    }

    pub fn get(&self, name: &str) -> Option<&Vehicle> {
        self.vehicles.iter().find(|v| v.name() == name)
    }

    pub fn tick_interval(&self) -> f32 {
        self.tick_interval
    }

    pub fn sim_time(&self) -> f64 {
        self.sim_time
    }

    /// Runs one fixed tick for every vehicle.
    pub fn step(&mut self) {
        for vehicle in &mut self.vehicles {
            vehicle.tick(self.tick_interval);
        }
        self.sim_time += f64::from(self.tick_interval);
    }

    /// Feeds `frame_dt` simulated seconds into the accumulator and runs as many
    /// whole ticks as it covers. Returns the number of ticks run.
    pub fn advance(&mut self, frame_dt: f32) -> usize {
        if frame_dt.is_finite() {
            self.accumulator += frame_dt.clamp(0.0, Self::MAX_FRAME);
        }
        let mut steps = 0;
        while self.accumulator >= self.tick_interval {
            self.accumulator -= self.tick_interval;
            self.step();
            steps += 1;
        }
        steps
    }

    pub fn snapshots(&self) -> Vec<VehicleSnapshot> {
        self.vehicles.iter().map(Vehicle::snapshot).collect()
    }

    pub fn shutdown(&mut self) {
        for vehicle in &mut self.vehicles {
            vehicle.teardown();
        }
    }
}
