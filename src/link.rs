// One TCP connection per vehicle.
//
// Layout mirrors a full-duplex socket split across threads: a receive thread turns
// inbound lines into motion commands, a send thread drains an mpsc channel of
// outbound messages, and the owning thread only ever touches the channel.
use crate::command::MotionCommand;
use crate::error::LinkError;
use crate::grid::{CellGrid, CellId};
use crate::protocol::{ClientMessage, PathAssignment, read_frame};
use crate::queue::CommandQueue;
use std::io::{self, BufReader, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// The initial connect failed. Terminal until `connect` is called again by hand.
    Failed,
}

#[derive(Clone, Debug)]
pub struct LinkOptions {
    pub connect_timeout: Option<Duration>,
    /// Bounds how long teardown can wait on a peer that stopped reading.
    pub write_timeout: Option<Duration>,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(3)),
            write_timeout: Some(Duration::from_secs(5)),
        }
    }
}

#[derive(Clone, Debug)]
struct SharedState(Arc<Mutex<LinkState>>);

impl SharedState {
    fn get(&self) -> LinkState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: LinkState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Moves Connected -> Disconnected; any other state is left alone.
    fn drop_connection(&self) {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *guard == LinkState::Connected {
            *guard = LinkState::Disconnected;
        }
    }
}

pub struct VehicleLink {
    name: String,
    addr: String,
    options: LinkOptions,
    grid: CellGrid,
    queue: CommandQueue,
    state: SharedState,
    stop: Arc<AtomicBool>,
    stream: Option<TcpStream>,
    tx: Option<mpsc::Sender<ClientMessage>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl VehicleLink {
    /// Creates a link in the `Disconnected` state. Decoded commands land in `queue`.
    pub fn new(
        name: impl Into<String>,
        addr: impl Into<String>,
        grid: CellGrid,
        queue: CommandQueue,
        options: LinkOptions,
    ) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            options,
            grid,
            queue,
            state: SharedState(Arc::new(Mutex::new(LinkState::Disconnected))),
            stop: Arc::new(AtomicBool::new(false)),
            stream: None,
            tx: None,
            reader: None,
            writer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> LinkState {
        self.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Connects, sends the login line and starts the receive and send threads.
    pub fn connect(&mut self) -> Result<(), LinkError> {
        match self.state() {
            LinkState::Disconnected => {}
            other => return Err(LinkError::InvalidState(other)),
        }
        // reap threads left over from a connection the peer closed
        self.shutdown();
        self.stop = Arc::new(AtomicBool::new(false));
        self.state.set(LinkState::Connecting);

        match self.open() {
            Ok(()) => {
                info!(vehicle = %self.name, addr = %self.addr, "connected to traffic server");
                Ok(())
            }
            Err(e) => {
                error!(vehicle = %self.name, addr = %self.addr, error = %e, "connection failed");
                self.shutdown();
                self.state.set(LinkState::Failed);
                Err(e)
            }
        }
    }

    fn open(&mut self) -> Result<(), LinkError> {
        let mut stream = self.dial().map_err(|source| LinkError::Connection {
            addr: self.addr.clone(),
            source,
        })?;
        let _ = stream.set_nodelay(true);
        stream.set_write_timeout(self.options.write_timeout)?;

        stream.write_all(ClientMessage::Login(self.name.clone()).encode().as_bytes())?;
        stream.flush()?;
        self.stream = Some(stream.try_clone()?);
        // must precede the receive thread, whose exit moves Connected -> Disconnected
        self.state.set(LinkState::Connected);

        let (tx, rx) = mpsc::channel::<ClientMessage>();
        let read_half = stream.try_clone()?;
        let write_half = stream.try_clone()?;

        let reader = {
            let name = self.name.clone();
            let grid = self.grid.clone();
            let queue = self.queue.clone();
            let state = self.state.clone();
            let stop = Arc::clone(&self.stop);
            thread::Builder::new()
                .name(format!("{}-recv", self.name))
                .spawn(move || receive_loop(&name, read_half, &grid, &queue, &state, &stop))?
        };
        self.reader = Some(reader);

        let writer = {
            let name = self.name.clone();
            let state = self.state.clone();
            thread::Builder::new()
                .name(format!("{}-send", self.name))
                .spawn(move || send_loop(&name, write_half, rx, &state))?
        };
        self.writer = Some(writer);
        self.tx = Some(tx);

        Ok(())
    }

    fn dial(&self) -> io::Result<TcpStream> {
        let Some(timeout) = self.options.connect_timeout else {
            return TcpStream::connect(self.addr.as_str());
        };
        let mut last_err = None;
        for addr in self.addr.as_str().to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
        }))
    }

    /// Queues a completion report for `cell`. Reports leave in call order.
    pub fn send_completion(&self, cell: CellId) -> Result<(), LinkError> {
        self.send(ClientMessage::Completion(cell))
    }

    fn send(&self, msg: ClientMessage) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let tx = self.tx.as_ref().ok_or(LinkError::NotConnected)?;
        tx.send(msg).map_err(|_| LinkError::PeerClosed)
    }

    /// Stops both threads and closes the socket. Queued outbound messages are
    /// flushed first. Safe to call any number of times.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);

        // closing the channel lets the send thread drain and exit
        drop(self.tx.take());
        if let Some(handle) = self.writer.take() {
            if handle.join().is_err() {
                warn!(vehicle = %self.name, "send thread panicked");
            }
        }

        if let Some(stream) = self.stream.take() {
            // unblocks the pending read in the receive thread
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!(vehicle = %self.name, error = %e, "socket already closed");
            }
        }
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!(vehicle = %self.name, "receive thread panicked");
            }
            info!(vehicle = %self.name, "link closed");
        }

        if self.state() != LinkState::Failed {
            self.state.set(LinkState::Disconnected);
        }
    }
}

impl Drop for VehicleLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive_loop(
    name: &str,
    stream: TcpStream,
    grid: &CellGrid,
    queue: &CommandQueue,
    state: &SharedState,
    stop: &AtomicBool,
) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        let frame = read_frame(&mut reader, &mut line);
        if stop.load(Ordering::Acquire) {
            debug!(vehicle = %name, "receive loop stopping");
            break;
        }
        match frame {
            Ok(true) => {
                let decoded = PathAssignment::decode(&line)
                    .and_then(|assignment| MotionCommand::from_assignment(&assignment, grid));
                match decoded {
                    Ok(command) => {
                        debug!(
                            vehicle = %name,
                            cells = ?command.cells(),
                            speed = command.speed(),
                            busy = command.busy(),
                            "path received"
                        );
                        queue.enqueue(command);
                    }
                    Err(e) => {
                        warn!(vehicle = %name, error = %e, payload = %line, "rejected assignment")
                    }
                }
            }
            Ok(false) => {
                info!(vehicle = %name, "server closed the connection");
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(vehicle = %name, error = %e, "dropped non utf-8 line");
            }
            Err(e) => {
                warn!(vehicle = %name, error = %e, "read failed");
                break;
            }
        }
    }
    state.drop_connection();
}

fn send_loop(
    name: &str,
    mut stream: TcpStream,
    rx: mpsc::Receiver<ClientMessage>,
    state: &SharedState,
) {
    for msg in rx {
        let line = msg.encode();
        if let Err(e) = stream.write_all(line.as_bytes()).and_then(|_| stream.flush()) {
            warn!(vehicle = %name, error = %e, "send failed");
            state.drop_connection();
            break;
        }
        debug!(vehicle = %name, message = %line.trim_end(), "sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::net::TcpListener;

    fn link_to(addr: String) -> VehicleLink {
        let options = LinkOptions::default();
        VehicleLink::new("agv_test", addr, CellGrid::default(), CommandQueue::new(), options)
    }

    #[test]
    fn failed_connect_is_terminal() {
        // bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let mut link = link_to(addr.to_string());
        assert!(matches!(link.connect(), Err(LinkError::Connection { .. })));
        assert_eq!(link.state(), LinkState::Failed);
        assert!(matches!(link.connect(), Err(LinkError::InvalidState(LinkState::Failed))));
        assert!(matches!(link.send_completion(3), Err(LinkError::NotConnected)));
        link.shutdown();
        assert_eq!(link.state(), LinkState::Failed);
    }

    #[test]
    fn send_before_connect_is_rejected() {
        let link = link_to("127.0.0.1:1".into());
        assert_eq!(link.state(), LinkState::Disconnected);
        assert!(matches!(link.send_completion(1), Err(LinkError::NotConnected)));
    }

    #[test]
    fn logs_in_and_decodes_split_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut login = String::new();
            reader.read_line(&mut login).unwrap();
            // one message split across writes, then a bad one, then two coalesced
            stream.write_all(b"{\"path\":[1,").unwrap();
            stream.flush().unwrap();
            thread::sleep(Duration::from_millis(20));
            stream.write_all(b"2],\"speed\":1,\"flag\":1}\nnot json\n").unwrap();
            let coalesced: &[u8] =
                b"{\"path\":[3],\"speed\":2,\"flag\":0}\n{\"path\":[4],\"speed\":2,\"flag\":0}\n";
            stream.write_all(coalesced).unwrap();
            let mut done = String::new();
            reader.read_line(&mut done).unwrap();
            (login, done)
        });

        let mut link = link_to(addr);
        link.connect().unwrap();
        assert!(link.is_connected());

        let mut cells = Vec::new();
        for _ in 0..200 {
            while let Some(cmd) = link.queue().try_dequeue() {
                cells.push(cmd.cells().to_vec());
            }
            if cells.len() == 3 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(cells, vec![vec![1, 2], vec![3], vec![4]]);

        link.send_completion(4).unwrap();
        let (login, done) = server.join().unwrap();
        assert_eq!(login, "login agv_test\n");
        assert_eq!(done, "4\n");

        link.shutdown();
        link.shutdown();
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[test]
    fn skips_lines_that_are_not_utf8() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut login = String::new();
            reader.read_line(&mut login).unwrap();
            stream.write_all(b"\xff\xfe\n{\"path\":[7,8],\"speed\":4,\"flag\":0}\n").unwrap();
            let mut rest = String::new();
            let _ = reader.read_line(&mut rest);
        });

        let mut link = link_to(addr);
        link.connect().unwrap();
        let mut received = None;
        for _ in 0..200 {
            received = link.queue().try_dequeue();
            if received.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(received.unwrap().cells(), &[7, 8]);
        assert!(link.is_connected());
        assert!(link.queue().is_empty());

        link.shutdown();
        server.join().unwrap();
    }
}
