// Vehicle <-> traffic server wire format.
//
// Every message is one `\n` terminated line. Server -> vehicle lines carry a JSON
// path assignment; vehicle -> server lines are either `login <name>` or the decimal
// id of the cell a finished path ended on.
use crate::error::ProtocolError;
use crate::grid::CellId;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead};

/// A path assignment exactly as the server issues it.
#[derive(Clone, Debug, PartialEq)]
pub struct PathAssignment {
    pub cells: Vec<CellId>,
    pub speed: f32,
    pub busy: bool,
}

#[derive(Serialize, Deserialize)]
struct WireAssignment {
    path: Vec<CellId>,
    speed: f32,
    flag: i64,
}

impl PathAssignment {
    pub fn new(cells: Vec<CellId>, speed: f32, busy: bool) -> Result<Self, ProtocolError> {
        let assignment = Self { cells, speed, busy };
        assignment.validate()?;
        Ok(assignment)
    }

    pub fn final_cell(&self) -> Option<CellId> {
        self.cells.last().copied()
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        if self.cells.is_empty() {
            return Err(ProtocolError::EmptyPath);
        }
        if !self.speed.is_finite() || self.speed <= 0.0 {
            return Err(ProtocolError::InvalidSpeed(self.speed));
        }
        Ok(())
    }

    /// Parses one inbound line. Surrounding whitespace is ignored.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let wire: WireAssignment = serde_json::from_str(line.trim())?;
        let busy = match wire.flag {
            0 => false,
            1 => true,
            other => return Err(ProtocolError::InvalidFlag(other)),
        };
        let assignment = Self {
            cells: wire.path,
            speed: wire.speed,
            busy,
        };
        assignment.validate()?;
        Ok(assignment)
    }

    /// Encodes as a complete line, newline included.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let wire = WireAssignment {
            path: self.cells.clone(),
            speed: self.speed,
            flag: i64::from(self.busy),
        };
        let mut json = serde_json::to_string(&wire)?;
        json.push('\n');
        Ok(json)
    }
}

/// Messages sent from vehicle -> server
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    Login(String),
    Completion(CellId),
}

impl ClientMessage {
    pub fn encode(&self) -> String {
        match self {
            ClientMessage::Login(name) => format!("login {}\n", name),
            ClientMessage::Completion(cell) => format!("{}\n", cell),
        }
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();
        if let Some(name) = line.strip_prefix("login ") {
            let name = name.trim();
            if !name.is_empty() {
                return Ok(ClientMessage::Login(name.to_string()));
            }
        }
        line.parse::<CellId>()
            .map(ClientMessage::Completion)
            .map_err(|_| ProtocolError::UnknownLine(line.to_string()))
    }
}

/// Reads the next non-blank line into `line` without its terminator.
/// Returns `Ok(false)` once the peer has closed the stream.
pub fn read_frame<R: BufRead>(reader: &mut R, line: &mut String) -> io::Result<bool> {
    loop {
        line.clear();
        if reader.read_line(line)? == 0 {
            return Ok(false);
        }
        let trimmed = line.trim_end_matches(['\n', '\r']).len();
        line.truncate(trimmed);
        if !line.trim().is_empty() {
            return Ok(true);
        }
    }
}
