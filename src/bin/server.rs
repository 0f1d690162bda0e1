// Server.rs - AGV traffic dispatcher
use agv_yard::protocol::read_frame;
use agv_yard::{
    CellGrid, CellId, ClientMessage, Dispatcher, PathAssignment, ServerConfig, SlotStatus,
    manhattan_route, telemetry,
};
use anyhow::Context;
use clap::Parser;
use eframe::egui::{
    self, Align2, Color32, CornerRadius, FontId, Pos2, Rect, Stroke, StrokeKind, Vec2,
};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::io::{BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Traffic dispatcher for simulated AGVs", long_about = None)]
struct CliArgs {
    /// JSON config file. Built-in defaults are used when omitted.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Listen on 0.0.0.0:PORT instead of the configured address.
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,
}

fn main() -> anyhow::Result<()> {
    telemetry::init("info");
    let args = CliArgs::parse();

    let mut config = match &args.config {
        Some(path) => {
            ServerConfig::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => ServerConfig::default(),
    };
    if let Some(port) = args.port {
        config.bind = format!("0.0.0.0:{port}");
    }
    let listener =
        TcpListener::bind(&config.bind).with_context(|| format!("binding {}", config.bind))?;

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default().with_inner_size([1000.0, 640.0]),
        ..Default::default()
    };
    eframe::run_native(
        "AGV Traffic Dispatcher",
        options,
        Box::new(move |_cc| Ok(Box::new(ServerApp::new(listener, config)))),
    )
    .map_err(|e| anyhow::anyhow!("dispatcher exited with error: {e}"))
}

// Where a logged-in vehicle's outbound lines go, tagged with the connection
// that owns it so a stale connection cannot unregister a newer one.
struct Outbox {
    conn: u64,
    tx: mpsc::Sender<String>,
}

#[derive(Default)]
struct Yard {
    dispatcher: Dispatcher,
    outboxes: HashMap<String, Outbox>,
    start_cells: BTreeMap<String, CellId>,
}

impl Yard {
    fn new(start_cells: BTreeMap<String, CellId>) -> Self {
        Self {
            start_cells,
            ..Self::default()
        }
    }

    /// Registers a freshly logged in vehicle at its configured parking cell.
    fn login(&mut self, name: &str, outbox: Outbox, log: &Log) {
        let start = self.start_cells.get(name).copied();
        if start.is_none() && self.dispatcher.last_cell(name).is_none() {
            log.warn(format!("no start cell configured for {name}; position unknown"));
        }
        self.dispatcher.login(name, start);
        self.outboxes.insert(name.to_string(), outbox);
        self.pump(name, log);
    }

    /// Sends the next assignment for `name` if the vehicle is free.
    fn pump(&mut self, name: &str, log: &Log) {
        let next = match self.dispatcher.next_to_send(name) {
            Ok(Some(next)) => next,
            Ok(None) => return,
            Err(e) => {
                log.warn(format!("{e}"));
                return;
            }
        };
        let line = match next.encode() {
            Ok(line) => line,
            Err(e) => {
                log.warn(format!("could not encode path for {name}: {e}"));
                return;
            }
        };
        let sent = self.outboxes.get(name).is_some_and(|o| o.tx.send(line).is_ok());
        if sent {
            log.info(format!("sent path {:?} to {name} (busy={})", next.cells, next.busy));
        } else {
            log.warn(format!("{name} has no open connection"));
        }
    }
}

// Shared state accessed by GUI and Networking threads
type SharedYard = Arc<Mutex<Yard>>;

fn lock(yard: &SharedYard) -> MutexGuard<'_, Yard> {
    yard.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mirrors every event to tracing and to the in-window log.
#[derive(Clone)]
struct Log(mpsc::Sender<String>);

impl Log {
    fn info(&self, line: String) {
        info!("{line}");
        let _ = self.0.send(line);
    }

    fn warn(&self, line: String) {
        warn!("{line}");
        let _ = self.0.send(format!("WARNING: {line}"));
    }
}

struct ServerApp {
    yard: SharedYard,
    grid: CellGrid,
    log: Vec<String>,
    rx_log: mpsc::Receiver<String>,
    tx_log: Log,

    // Composer
    selected: Option<String>,
    path_text: String,
    speed: f32,
    busy: bool,
}

impl ServerApp {
    fn new(listener: TcpListener, config: ServerConfig) -> Self {
        let (tx_log, rx_log) = mpsc::channel();
        let tx_log = Log(tx_log);
        let yard: SharedYard = Arc::new(Mutex::new(Yard::new(config.start_cells.clone())));

        let yard_clone = yard.clone();
        let log_clone = tx_log.clone();
        // Spawn Listener Thread
        thread::spawn(move || {
            let addr = listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".into());
            log_clone.info(format!("Dispatcher listening on {addr}"));
            let next_conn = AtomicU64::new(1);

            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let yard_ref = yard_clone.clone();
                        let log_ref = log_clone.clone();
                        let conn = next_conn.fetch_add(1, Ordering::Relaxed);
                        // Spawn a handler per vehicle
                        thread::spawn(move || handle_vehicle(stream, conn, yard_ref, log_ref));
                    }
                    Err(e) => log_clone.warn(format!("Connection failed: {e}")),
                }
            }
        });

        Self {
            yard,
            grid: CellGrid::new(config.grid),
            log: vec![],
            rx_log,
            tx_log,
            selected: None,
            path_text: String::new(),
            speed: config.default_speed,
            busy: false,
        }
    }

    fn queue_path(&mut self, name: &str, cells: Vec<CellId>) {
        let assignment = match PathAssignment::new(cells, self.speed, self.busy) {
            Ok(a) => a,
            Err(e) => {
                self.tx_log.warn(format!("rejected path: {e}"));
                return;
            }
        };
        let mut yard = lock(&self.yard);
        match yard.dispatcher.submit(name, assignment) {
            Ok(()) => yard.pump(name, &self.tx_log),
            Err(e) => self.tx_log.warn(format!("{e}")),
        }
    }

    fn random_route(&self, name: &str) -> Option<Vec<CellId>> {
        let from = lock(&self.yard).dispatcher.last_cell(name)?;
        Some(route_to_loading_lane(&self.grid, from, &mut rand::thread_rng()))
    }
}

// Random trip from `from` to a loading lane
fn route_to_loading_lane(grid: &CellGrid, from: CellId, rng: &mut impl Rng) -> Vec<CellId> {
    let c = grid.config();
    let lane = rng.gen_range(0..c.lane_count);
    let row = if c.holder_row > c.buffer_row + 1 {
        rng.gen_range(c.buffer_row + 1..c.holder_row)
    } else {
        c.buffer_row
    };
    manhattan_route(grid, from, grid.cell_id(lane, row))
}

fn parse_cells(text: &str) -> Result<Vec<CellId>, String> {
    text.split(|ch: char| ch == ',' || ch.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<CellId>().map_err(|_| format!("not a cell id: {s:?}")))
        .collect()
}

impl eframe::App for ServerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        // 1. Process Logs
        while let Ok(msg) = self.rx_log.try_recv() {
            self.log.push(msg);
            if self.log.len() > 100 {
                self.log.remove(0);
            }
        }

        let status: Vec<SlotStatus> = lock(&self.yard).dispatcher.status();
        if self
            .selected
            .as_ref()
            .is_some_and(|name| !status.iter().any(|s| &s.name == name))
        {
            self.selected = None;
        }
        if self.selected.is_none() {
            self.selected = status.first().map(|s| s.name.clone());
        }

        egui::SidePanel::left("controls").min_width(260.0).show(ctx, |ui| {
            ui.heading("Dispatcher");
            ui.label(format!("Connected vehicles: {}", status.len()));

            ui.separator();
            for s in &status {
                ui.label(format!(
                    "{}  at {}  queued {}  done {}",
                    s.name,
                    s.last_cell.map_or("?".to_string(), |c| c.to_string()),
                    s.pending,
                    s.completed
                ));
                if let Some(cells) = &s.in_flight {
                    ui.small(format!("  driving {:?}", cells));
                }
            }

            ui.separator();
            ui.label("New assignment:");
            egui::ComboBox::from_label("Vehicle")
                .selected_text(self.selected.clone().unwrap_or_else(|| "-".into()))
                .show_ui(ui, |ui| {
                    for s in &status {
                        ui.selectable_value(&mut self.selected, Some(s.name.clone()), &s.name);
                    }
                });
            ui.add(egui::TextEdit::singleline(&mut self.path_text).hint_text("cells, e.g. 2, 18"));
            ui.add(egui::Slider::new(&mut self.speed, 1.0..=30.0).text("Speed"));
            ui.checkbox(&mut self.busy, "Loaded (flag)");

            if let Some(name) = self.selected.clone() {
                ui.horizontal(|ui| {
                    if ui.button("Queue path").clicked() {
                        match parse_cells(&self.path_text) {
                            Ok(cells) => self.queue_path(&name, cells),
                            Err(e) => self.tx_log.warn(e),
                        }
                    }
                    if ui.button("Random route").clicked() {
                        match self.random_route(&name) {
                            Some(cells) => self.queue_path(&name, cells),
                            None => {
                                self.tx_log
                                    .warn(format!("{name} is at an unknown cell; queue a path"));
                            }
                        }
                    }
                });
            }

            ui.separator();
            ui.heading("Log");
            egui::ScrollArea::vertical().show(ui, |ui| {
                for line in &self.log {
                    ui.monospace(line);
                }
            });
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading("Yard");
            let available = ui.available_rect_before_wrap();
            let (across, along) = self.grid.extent();
            let scale = (available.width() / along).min(available.height() / across);
            let (response, painter) =
                ui.allocate_painter(Vec2::new(along * scale, across * scale), egui::Sense::hover());
            let to_screen = |cell: CellId| -> Pos2 {
                let p = self.grid.cell_to_position(cell);
                response.rect.min + Vec2::new(p.z * scale, p.x * scale)
            };

            let border = Stroke::new(2.0, Color32::GRAY);
            painter.rect_stroke(response.rect, CornerRadius::ZERO, border, StrokeKind::Middle);
            let c = self.grid.config();
            let buffer = c.buffer_row as f32 * c.high_speed_lane_width;
            let buffer_band = Rect::from_min_size(
                response.rect.min + Vec2::new(0.0, buffer * scale),
                Vec2::new(response.rect.width(), c.buffer_length * scale),
            );
            painter.rect_filled(buffer_band, CornerRadius::ZERO, Color32::from_rgb(40, 52, 40));

            for s in &status {
                if let Some(cells) = &s.in_flight {
                    let mut points: Vec<Pos2> = s.last_cell.into_iter().map(to_screen).collect();
                    points.extend(cells.iter().map(|&c| to_screen(c)));
                    painter.add(egui::Shape::line(points, Stroke::new(1.5, Color32::LIGHT_BLUE)));
                }
                if let Some(cell) = s.last_cell {
                    let pos = to_screen(cell);
                    painter.circle_filled(pos, 6.0, Color32::from_rgb(230, 200, 60));
                    painter.text(
                        pos + Vec2::new(0.0, -10.0),
                        Align2::CENTER_BOTTOM,
                        &s.name,
                        FontId::proportional(12.0),
                        Color32::WHITE,
                    );
                }
            }
        });

        ctx.request_repaint_after(Duration::from_millis(100));
    }
}

fn handle_vehicle(stream: TcpStream, conn: u64, yard: SharedYard, log: Log) {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());
    debug!(peer = %peer_addr, conn, "new connection");

    // Split stream for full-duplex
    let (stream_read, mut stream_write) = match stream.try_clone() {
        Ok(read) => (read, stream),
        Err(e) => {
            log.warn(format!("Failed to clone stream from {peer_addr}: {e}"));
            return;
        }
    };

    let mut reader = BufReader::new(stream_read);
    let mut line = String::new();

    // The first line must be the login
    let first = read_frame(&mut reader, &mut line)
        .map(|open| open.then(|| ClientMessage::parse(&line)));
    let name = match first {
        Ok(Some(Ok(ClientMessage::Login(name)))) => name,
        Ok(Some(other)) => {
            log.warn(format!("{peer_addr} did not log in first: {other:?}"));
            return;
        }
        Ok(None) | Err(_) => return,
    };

    // Channel for Server -> Vehicle lines
    let (tx_cmd, rx_cmd) = mpsc::channel::<String>();

    // 1. WRITER THREAD: sends assignments to this vehicle
    let name_write = name.clone();
    thread::spawn(move || {
        for msg in rx_cmd {
            if stream_write.write_all(msg.as_bytes()).and_then(|_| stream_write.flush()).is_err() {
                break; // Vehicle disconnected
            }
        }
        debug!(vehicle = %name_write, "writer thread ended");
    });

    lock(&yard).login(&name, Outbox { conn, tx: tx_cmd }, &log);
    log.info(format!("{name} logged in from {peer_addr}"));

    // 2. READER (current thread): completion reports
    loop {
        match read_frame(&mut reader, &mut line) {
            Ok(true) => match ClientMessage::parse(&line) {
                Ok(ClientMessage::Completion(cell)) => {
                    let mut guard = lock(&yard);
                    match guard.dispatcher.report(&name, cell) {
                        Ok(done) => {
                            log.info(format!("{name} finished {:?}", done.cells));
                            guard.pump(&name, &log);
                        }
                        Err(e) => log.warn(format!("{e}")),
                    }
                }
                Ok(ClientMessage::Login(again)) => {
                    log.warn(format!("{name} sent a second login as {again}"))
                }
                Err(e) => log.warn(format!("bad line from {name}: {e}")),
            },
            Ok(false) => break, // EOF
            Err(e) => {
                debug!(vehicle = %name, error = %e, "read failed");
                break;
            }
        }
    }

    // Cleanup
    let mut guard = lock(&yard);
    if guard.outboxes.get(&name).is_some_and(|o| o.conn == conn) {
        guard.outboxes.remove(&name);
        guard.dispatcher.logout(&name);
        drop(guard);
        log.info(format!("{name} disconnected"));
    }
}
