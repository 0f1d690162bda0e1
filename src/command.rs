use crate::error::ProtocolError;
use crate::grid::{CellGrid, CellId, Position};
use crate::protocol::PathAssignment;

/// A path assignment resolved into world waypoints, ready for the executor.
/// Always holds at least one waypoint.
#[derive(Clone, Debug, PartialEq)]
pub struct MotionCommand {
    cells: Vec<CellId>,
    waypoints: Vec<Position>,
    speed: f32,
    busy: bool,
}

impl MotionCommand {
    pub fn from_assignment(assignment: &PathAssignment, grid: &CellGrid) -> Result<Self, ProtocolError> {
        if assignment.cells.is_empty() {
            return Err(ProtocolError::EmptyPath);
        }
        if !assignment.speed.is_finite() || assignment.speed <= 0.0 {
            return Err(ProtocolError::InvalidSpeed(assignment.speed));
        }
        let waypoints = assignment
            .cells
            .iter()
            .map(|&cell| grid.cell_to_position(cell))
            .collect();
        Ok(Self {
            cells: assignment.cells.clone(),
            waypoints,
            speed: assignment.speed,
            busy: assignment.busy,
        })
    }

    pub fn waypoints(&self) -> &[Position] {
        &self.waypoints
    }

    pub fn cells(&self) -> &[CellId] {
        &self.cells
    }

    /// The cell reported back to the server once this command finishes.
    pub fn final_cell(&self) -> CellId {
        self.cells[self.cells.len() - 1]
    }

    pub fn final_position(&self) -> Position {
        self.waypoints[self.waypoints.len() - 1]
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn busy(&self) -> bool {
        self.busy
    }
}
