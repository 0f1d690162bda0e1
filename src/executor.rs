use crate::command::MotionCommand;
use crate::grid::{CellId, Position};
use crate::queue::CommandQueue;
use std::f32::consts::PI;

/// Default idle wait before polling an empty queue again, in simulated seconds.
pub const IDLE_INTERVAL: f32 = 0.1;

/// What the render layer needs to draw one vehicle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pose {
    pub position: Position,
    /// Yaw in radians, measured from +x towards +z.
    pub heading: f32,
    pub busy: bool,
}

struct ActiveMotion {
    command: MotionCommand,
    // vehicle start position followed by the command's waypoints
    points: Vec<Position>,
    // arc length from the start to each point
    distances: Vec<f32>,
    duration: f32,
    elapsed: f32,
}

impl ActiveMotion {
    fn new(from: Position, command: MotionCommand) -> Self {
        let mut points = Vec::with_capacity(command.waypoints().len() + 1);
        points.push(from);
        points.extend_from_slice(command.waypoints());

        let mut distances = Vec::with_capacity(points.len());
        let mut total = 0.0;
        distances.push(0.0);
        for pair in points.windows(2) {
            total += pair[0].distance(pair[1]);
            distances.push(total);
        }

        let duration = total / command.speed();
        Self {
            command,
            points,
            distances,
            duration,
            elapsed: 0.0,
        }
    }

    fn finished(&self) -> bool {
        self.elapsed >= self.duration
    }

    /// Position and segment heading at the current eased progress.
    fn sample(&self) -> (Position, Option<f32>) {
        let total = self.distances[self.distances.len() - 1];
        if total <= 0.0 || self.duration <= 0.0 {
            return (self.points[self.points.len() - 1], None);
        }
        let t = (self.elapsed / self.duration).clamp(0.0, 1.0);
        let target = ease_in_out_sine(t) * total;

        let segment = self
            .distances
            .windows(2)
            .position(|d| target <= d[1] && d[1] > d[0])
            .unwrap_or(self.points.len() - 2);
        let (a, b) = (self.points[segment], self.points[segment + 1]);
        let length = self.distances[segment + 1] - self.distances[segment];
        let local = if length > 0.0 {
            (target - self.distances[segment]) / length
        } else {
            1.0
        };
        let heading = (length > 0.0).then(|| (b.z - a.z).atan2(b.x - a.x));
        (a.lerp(b, local.clamp(0.0, 1.0)), heading)
    }
}

fn ease_in_out_sine(t: f32) -> f32 {
    0.5 - 0.5 * (PI * t).cos()
}

/// Drives one vehicle through the commands of its queue, one at a time.
pub struct MotionExecutor {
    position: Position,
    heading: f32,
    busy: bool,
    idle_interval: f32,
    idle_remaining: f32,
    active: Option<ActiveMotion>,
}

impl MotionExecutor {
    pub fn new(start: Position) -> Self {
        Self::with_idle_interval(start, IDLE_INTERVAL)
    }

    pub fn with_idle_interval(start: Position, idle_interval: f32) -> Self {
        Self {
            position: start,
            heading: 0.0,
            busy: false,
            idle_interval: idle_interval.max(0.0),
            idle_remaining: 0.0,
            active: None,
        }
    }

    pub fn pose(&self) -> Pose {
        Pose {
            position: self.position,
            heading: self.heading,
            busy: self.busy,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    pub fn current(&self) -> Option<&MotionCommand> {
        self.active.as_ref().map(|m| &m.command)
    }

    /// Fraction of the current command already travelled, by time.
    pub fn progress(&self) -> Option<f32> {
        self.active.as_ref().map(|m| {
            if m.duration > 0.0 {
                (m.elapsed / m.duration).min(1.0)
            } else {
                1.0
            }
        })
    }

    /// Advances simulated time by `dt` seconds. `on_complete` receives the final
    /// cell of every command finished during this tick, in completion order.
    pub fn tick(&mut self, dt: f32, queue: &CommandQueue, mut on_complete: impl FnMut(CellId)) {
        let mut budget = dt.max(0.0);
        loop {
            if self.active.is_none() {
                if self.idle_remaining > 0.0 {
                    let wait = self.idle_remaining.min(budget);
                    self.idle_remaining -= wait;
                    budget -= wait;
                    if self.idle_remaining > 0.0 {
                        return;
                    }
                }
                match queue.try_dequeue() {
                    Some(command) => self.start(command),
                    None => {
                        self.idle_remaining = self.idle_interval;
                        return;
                    }
                }
            }

            let Some(motion) = self.active.as_mut() else {
                return;
            };
            let remaining = (motion.duration - motion.elapsed).max(0.0);
            if budget >= remaining {
                motion.elapsed = motion.duration;
                budget -= remaining;
            } else {
                motion.elapsed += budget;
                budget = 0.0;
            }

            let (position, heading) = motion.sample();
            self.position = position;
            if let Some(heading) = heading {
                self.heading = heading;
            }

            if !motion.finished() {
                return;
            }
            let cell = motion.command.final_cell();
            self.position = motion.command.final_position();
            self.active = None;
            on_complete(cell);
        }
    }

    fn start(&mut self, command: MotionCommand) {
        self.busy = command.busy();
        self.active = Some(ActiveMotion::new(self.position, command));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::CellGrid;
    use crate::protocol::PathAssignment;

    fn command(cells: Vec<CellId>, speed: f32, busy: bool) -> MotionCommand {
        let a = PathAssignment::new(cells, speed, busy).unwrap();
        MotionCommand::from_assignment(&a, &CellGrid::default()).unwrap()
    }

    fn run(exec: &mut MotionExecutor, queue: &CommandQueue, ticks: usize, dt: f32) -> Vec<CellId> {
        let mut done = Vec::new();
        for _ in 0..ticks {
            exec.tick(dt, queue, |cell| done.push(cell));
        }
        done
    }

    #[test]
    fn idles_on_empty_queue() {
        let queue = CommandQueue::new();
        let mut exec = MotionExecutor::new(Position::default());
        assert!(run(&mut exec, &queue, 5, 0.1).is_empty());
        assert!(exec.is_idle());
        assert_eq!(exec.pose().position, Position::default());
    }

    #[test]
    fn travels_and_reports_final_cell_once() {
        let grid = CellGrid::default();
        let queue = CommandQueue::new();
        let mut exec = MotionExecutor::new(grid.cell_to_position(2));
        // 2 -> 18 is 16 cells along the lane: 64 units at speed 12
        queue.enqueue(command(vec![2, 18], 12.0, true));

        let done = run(&mut exec, &queue, 20, 0.1);
        assert!(done.is_empty());
        assert!(exec.pose().busy);
        let p = exec.pose().position;
        assert!(p.z > grid.cell_to_position(2).z && p.z < grid.cell_to_position(18).z);
        assert!((exec.pose().heading - PI / 2.0).abs() < 1e-4);

        let done = run(&mut exec, &queue, 40, 0.1);
        assert_eq!(done, vec![18]);
        assert_eq!(exec.pose().position, grid.cell_to_position(18));
        assert!(exec.is_idle());
    }

    #[test]
    fn chains_commands_on_the_same_tick() {
        let grid = CellGrid::default();
        let queue = CommandQueue::new();
        let mut exec = MotionExecutor::new(grid.cell_to_position(0));
        queue.enqueue(command(vec![0], 5.0, false));
        queue.enqueue(command(vec![1], 4.0, true));
        queue.enqueue(command(vec![1, 3], 4.0, false));

        let mut done = Vec::new();
        // zero-length first command finishes instantly, the 4-unit second one
        // takes exactly one second; leftover time carries into the third
        exec.tick(1.5, &queue, |c| done.push(c));
        assert_eq!(done, vec![0, 1]);
        assert_eq!(exec.current().map(|c| c.final_cell()), Some(3));
        assert!(!exec.pose().busy);
        assert!(exec.progress().unwrap() > 0.0);

        exec.tick(10.0, &queue, |c| done.push(c));
        assert_eq!(done, vec![0, 1, 3]);
    }

    #[test]
    fn busy_flag_follows_latest_command() {
        let queue = CommandQueue::new();
        let mut exec = MotionExecutor::new(CellGrid::default().cell_to_position(0));
        queue.enqueue(command(vec![0], 1.0, true));
        run(&mut exec, &queue, 1, 0.1);
        assert!(exec.pose().busy);
        queue.enqueue(command(vec![0], 1.0, false));
        run(&mut exec, &queue, 3, 0.1);
        assert!(!exec.pose().busy);
    }

    #[test]
    fn easing_is_symmetric() {
        assert_eq!(ease_in_out_sine(0.0), 0.0);
        assert!((ease_in_out_sine(0.5) - 0.5).abs() < 1e-6);
        assert!((ease_in_out_sine(1.0) - 1.0).abs() < 1e-6);
    }
}
