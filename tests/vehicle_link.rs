// Loopback scenarios: a scripted traffic server on one side, real vehicles on the other.
use agv_yard::{CellGrid, CellId, LinkError, LinkOptions, LinkState, Vehicle};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

fn vehicle(name: &str, addr: &str, start: CellId) -> Vehicle {
    Vehicle::new(name, addr, start, &CellGrid::default(), LinkOptions::default(), 0.1)
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn read_line(reader: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    line.trim_end().to_string()
}

/// Reads lines until the client hangs up.
fn read_all(mut reader: BufReader<TcpStream>) -> Vec<String> {
    let mut lines = Vec::new();
    let mut line = String::new();
    while reader.read_line(&mut line).unwrap_or(0) > 0 {
        lines.push(line.trim_end().to_string());
        line.clear();
    }
    lines
}

#[test]
fn single_path_is_driven_and_reported_once() {
    let (listener, addr) = listener();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        stream.write_all(b"{\"path\":[2,18],\"speed\":12,\"flag\":0}\n").unwrap();
        read_all(reader)
    });

    let mut agv = vehicle("agv_1", &addr, 2);
    agv.connect().unwrap();
    assert_eq!(agv.link_state(), LinkState::Connected);
    assert!(wait_until(|| agv.queue().len() == 1));

    // a zero-length tick only picks the command up
    agv.tick(0.0);
    let current = agv.executor().current().unwrap();
    assert_eq!(current.waypoints().len(), 2);
    assert_eq!(current.final_cell(), 18);
    assert!(!agv.executor().pose().busy);

    let mut finished = 0;
    for _ in 0..100 {
        finished += agv.tick(0.1);
    }
    assert_eq!(finished, 1);
    assert_eq!(agv.executor().pose().position, CellGrid::default().cell_to_position(18));

    agv.teardown();
    assert_eq!(server.join().unwrap(), vec!["login agv_1".to_string(), "18".to_string()]);
}

#[test]
fn completions_follow_assignment_order() {
    let (listener, addr) = listener();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        // coalesced into one write on purpose
        let burst: &[u8] = concat!(
            "{\"path\":[2,18],\"speed\":100,\"flag\":1}\n",
            "{\"path\":[],\"speed\":1,\"flag\":0}\n",
            "{\"path\":[18,58],\"speed\":100,\"flag\":0}\n",
        )
        .as_bytes();
        stream.write_all(burst).unwrap();
        read_all(reader)
    });

    let mut agv = vehicle("agv_2", &addr, 2);
    agv.connect().unwrap();
    assert!(wait_until(|| agv.queue().len() == 2));
    for _ in 0..50 {
        agv.tick(0.1);
    }
    assert_eq!(agv.snapshot().completed, 2);
    agv.teardown();

    let lines = server.join().unwrap();
    assert_eq!(lines, vec!["login agv_2", "18", "58"]);
}

#[test]
fn teardown_twice_is_harmless() {
    let (listener, addr) = listener();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        read_all(BufReader::new(stream))
    });

    let mut agv = vehicle("agv_3", &addr, 0);
    agv.connect().unwrap();
    agv.teardown();
    agv.teardown();
    assert_eq!(agv.link_state(), LinkState::Disconnected);
    assert_eq!(server.join().unwrap(), vec!["login agv_3"]);
    drop(agv);
}

#[test]
fn peer_close_marks_link_disconnected() {
    let (listener, addr) = listener();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream);
        read_line(&mut reader)
    });

    let mut agv = vehicle("agv_4", &addr, 0);
    agv.connect().unwrap();
    assert_eq!(server.join().unwrap(), "login agv_4");
    assert!(wait_until(|| agv.link_state() == LinkState::Disconnected));

    // the simulation keeps running and the report is dropped with a warning
    agv.tick(0.1);
    agv.teardown();
}

#[test]
fn close_right_after_login_is_never_missed() {
    let (listener, addr) = listener();
    let rounds = 100;
    let server = thread::spawn(move || {
        for _ in 0..rounds {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            read_line(&mut reader);
            // dropping the reader closes the socket while connect may still be running
        }
    });

    for i in 0..rounds {
        let mut agv = vehicle(&format!("agv_{i}"), &addr, 0);
        agv.connect().unwrap();
        assert!(
            wait_until(|| agv.link_state() == LinkState::Disconnected),
            "round {i} stayed {:?}",
            agv.link_state()
        );
        agv.teardown();
    }
    server.join().unwrap();
}

#[test]
fn unreachable_server_fails_once() {
    let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().to_string();
    let mut agv = vehicle("agv_5", &addr, 0);
    assert!(matches!(agv.connect(), Err(LinkError::Connection { .. })));
    assert_eq!(agv.link_state(), LinkState::Failed);
    assert_eq!(agv.tick(0.1), 0);
}

#[test]
fn vehicles_do_not_share_assignments() {
    let (listener, addr) = listener();
    let (finish_tx, finish_rx) = mpsc::channel::<()>();
    let server = thread::spawn(move || {
        let mut conns = Vec::new();
        for _ in 0..2 {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let login = read_line(&mut reader);
            conns.push((login, stream, reader));
        }
        for (login, stream, _) in &mut conns {
            let line: &[u8] = if login.as_str() == "login agv_a" {
                b"{\"path\":[1,2],\"speed\":5,\"flag\":1}\n"
            } else {
                b"{\"path\":[40],\"speed\":5,\"flag\":0}\n"
            };
            stream.write_all(line).unwrap();
        }
        let _ = finish_rx.recv();
    });

    let mut a = vehicle("agv_a", &addr, 0);
    let mut b = vehicle("agv_b", &addr, 0);
    a.connect().unwrap();
    b.connect().unwrap();
    assert!(wait_until(|| a.queue().len() == 1 && b.queue().len() == 1));
    // nothing else shows up later
    thread::sleep(Duration::from_millis(50));
    assert_eq!(a.queue().len(), 1);
    assert_eq!(b.queue().len(), 1);

    let cmd_a = a.queue().try_dequeue().unwrap();
    let cmd_b = b.queue().try_dequeue().unwrap();
    assert_eq!(cmd_a.cells(), &[1, 2]);
    assert!(cmd_a.busy());
    assert_eq!(cmd_b.cells(), &[40]);
    assert!(!cmd_b.busy());

    finish_tx.send(()).unwrap();
    a.teardown();
    b.teardown();
    server.join().unwrap();
}
