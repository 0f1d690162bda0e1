// Server-side bookkeeping for the closed dispatch loop: a vehicle gets its next
// assignment only after it reported the final cell of the previous one.
use crate::error::DispatchError;
use crate::grid::{CellGrid, CellId};
use crate::protocol::PathAssignment;
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Default)]
struct Slot {
    pending: VecDeque<PathAssignment>,
    in_flight: Option<PathAssignment>,
    last_cell: Option<CellId>,
    completed: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SlotStatus {
    pub name: String,
    pub pending: usize,
    pub in_flight: Option<Vec<CellId>>,
    pub last_cell: Option<CellId>,
    pub completed: u64,
}

#[derive(Debug, Default)]
pub struct Dispatcher {
    slots: BTreeMap<String, Slot>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a vehicle. Logging in again keeps its pending assignments and puts
    /// the in-flight one back at their head, since the old connection never finished it.
    pub fn login(&mut self, name: &str, start_cell: Option<CellId>) {
        let slot = self.slots.entry(name.to_string()).or_default();
        if let Some(lost) = slot.in_flight.take() {
            slot.pending.push_front(lost);
        }
        if start_cell.is_some() {
            slot.last_cell = start_cell;
        }
    }

    pub fn logout(&mut self, name: &str) -> bool {
        self.slots.remove(name).is_some()
    }

    pub fn is_logged_in(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn submit(&mut self, name: &str, assignment: PathAssignment) -> Result<(), DispatchError> {
        self.slot_mut(name)?.pending.push_back(assignment);
        Ok(())
    }

    /// Hands out the next assignment for `name` if nothing is in flight.
    pub fn next_to_send(&mut self, name: &str) -> Result<Option<PathAssignment>, DispatchError> {
        let slot = self.slot_mut(name)?;
        if slot.in_flight.is_some() {
            return Ok(None);
        }
        let next = slot.pending.pop_front();
        slot.in_flight = next.clone();
        Ok(next)
    }

    /// Accepts a completion report. Returns the assignment it closes.
    pub fn report(&mut self, name: &str, cell: CellId) -> Result<PathAssignment, DispatchError> {
        let slot = self.slot_mut(name)?;
        match slot.in_flight.take() {
            Some(done) if done.final_cell() == Some(cell) => {
                slot.last_cell = Some(cell);
                slot.completed += 1;
                Ok(done)
            }
            other => {
                let expected = other.as_ref().and_then(PathAssignment::final_cell);
                slot.in_flight = other;
                Err(DispatchError::UnexpectedCompletion {
                    name: name.to_string(),
                    reported: cell,
                    expected,
                })
            }
        }
    }

    pub fn last_cell(&self, name: &str) -> Option<CellId> {
        self.slots.get(name).and_then(|s| s.last_cell)
    }

    pub fn status(&self) -> Vec<SlotStatus> {
        self.slots
            .iter()
            .map(|(name, slot)| SlotStatus {
                name: name.clone(),
                pending: slot.pending.len(),
                in_flight: slot.in_flight.as_ref().map(|a| a.cells.clone()),
                last_cell: slot.last_cell,
                completed: slot.completed,
            })
            .collect()
    }

    fn slot_mut(&mut self, name: &str) -> Result<&mut Slot, DispatchError> {
        self.slots
            .get_mut(name)
            .ok_or_else(|| DispatchError::UnknownVehicle(name.to_string()))
    }
}

/// Corner waypoints from `from` to `to`: along the lane first, then across rows.
pub fn manhattan_route(grid: &CellGrid, from: CellId, to: CellId) -> Vec<CellId> {
    let (_, from_row) = grid.lane_row(from);
    let (to_lane, _) = grid.lane_row(to);
    let corner = grid.cell_id(to_lane, from_row);
    let mut route = vec![from];
    for cell in [corner, to] {
        if route.last() != Some(&cell) {
            route.push(cell);
        }
    }
    route
}
