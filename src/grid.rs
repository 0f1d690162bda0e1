// Cell id <-> world position mapping shared with the traffic server
use crate::error::GridError;
use serde::{Deserialize, Serialize};

pub type CellId = i32;

/// A point in yard space. `x` runs across the zones (row axis), `z` along the lanes,
/// `y` is height above the ground.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Position {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn distance(self, other: Position) -> f32 {
        let (dx, dy, dz) = (other.x - self.x, other.y - self.y, other.z - self.z);
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn lerp(self, other: Position, t: f32) -> Position {
        Position {
            x: self.x + (other.x - self.x) * t,
            y: self.y + (other.y - self.y) * t,
            z: self.z + (other.z - self.z) * t,
        }
    }
}

/// The four strips of the yard, in order of increasing row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Zone {
    HighSpeed,
    Buffer,
    Loading,
    HolderApron,
}

/// Zone boundary constants. Defaults describe the standard yard layout.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GridConfig {
    /// Cells per row (lanes along the buffer zone).
    pub lane_count: i32,
    /// Row index of the buffer lane; rows below it are high-speed lanes.
    pub buffer_row: i32,
    /// Row index where the holder apron starts.
    pub holder_row: i32,
    pub high_speed_lane_width: f32,
    pub buffer_length: f32,
    pub loading_lane_width: f32,
    pub loading_lane_count: i32,
    pub holder_apron_depth: f32,
    /// Width of one cell along the lane axis.
    pub cell_width: f32,
    pub ride_height: f32,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            lane_count: 40,
            buffer_row: 5,
            holder_row: 12,
            high_speed_lane_width: 4.0,
            buffer_length: 16.0,
            loading_lane_width: 4.0,
            loading_lane_count: 5,
            holder_apron_depth: 16.0,
            cell_width: 4.0,
            ride_height: 1.25,
        }
    }
}

/// Stateless mapping from cells to positions. Cheap to clone and share between threads.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CellGrid {
    config: GridConfig,
}

impl CellGrid {
    pub fn new(config: GridConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Splits a linear id into `(lane, row)`.
    pub fn lane_row(&self, cell: CellId) -> (i32, i32) {
        let lanes = self.config.lane_count.max(1);
        (cell.rem_euclid(lanes), cell.div_euclid(lanes))
    }

    pub fn cell_id(&self, lane: i32, row: i32) -> CellId {
        row * self.config.lane_count + lane
    }

    pub fn zone_of(&self, row: i32) -> Zone {
        let c = &self.config;
        if row < c.buffer_row {
            Zone::HighSpeed
        } else if row == c.buffer_row {
            Zone::Buffer
        } else if row < c.holder_row {
            Zone::Loading
        } else {
            Zone::HolderApron
        }
    }

    /// Permissive mapping: every id lands in one of the four zones.
    pub fn cell_to_position(&self, cell: CellId) -> Position {
        let (lane, row) = self.lane_row(cell);
        self.lane_row_to_position(lane, row)
    }

    pub fn lane_row_to_position(&self, lane: i32, row: i32) -> Position {
        let c = &self.config;
        let buffer_start = c.buffer_row as f32 * c.high_speed_lane_width;
        let x = match self.zone_of(row) {
            Zone::HighSpeed => row as f32 * c.high_speed_lane_width + c.high_speed_lane_width / 2.0,
            Zone::Buffer => buffer_start + c.buffer_length / 2.0,
            Zone::Loading => {
                buffer_start
                    + c.buffer_length
                    + (row - c.buffer_row - 1) as f32 * c.loading_lane_width
                    + c.loading_lane_width / 2.0
            }
            Zone::HolderApron => self.terminal_offset(),
        };
        let z = lane as f32 * c.cell_width + c.cell_width / 2.0;
        Position::new(x, c.ride_height, z)
    }

    /// Strict mapping: rejects negative ids and rows past the holder row.
    pub fn try_cell_to_position(&self, cell: CellId) -> Result<Position, GridError> {
        let (lane, row) = self.lane_row(cell);
        if cell < 0 || row > self.config.holder_row {
            return Err(GridError::CellOutOfRange(cell));
        }
        Ok(self.lane_row_to_position(lane, row))
    }

    pub fn try_lane_row_to_position(&self, lane: i32, row: i32) -> Result<Position, GridError> {
        let c = &self.config;
        if !(0..c.lane_count).contains(&lane) || !(0..=c.holder_row).contains(&row) {
            return Err(GridError::LaneRowOutOfRange { lane, row });
        }
        Ok(self.lane_row_to_position(lane, row))
    }

    /// Fixed x offset of the holder apron.
    pub fn terminal_offset(&self) -> f32 {
        let c = &self.config;
        c.buffer_row as f32 * c.high_speed_lane_width
            + c.buffer_length
            + c.loading_lane_count as f32 * c.loading_lane_width
            + c.holder_apron_depth
    }

    /// Extent of the yard on the x/z plane, used by renderers.
    pub fn extent(&self) -> (f32, f32) {
        let c = &self.config;
        (
            self.terminal_offset() + c.loading_lane_width,
            c.lane_count as f32 * c.cell_width,
        )
    }
}
