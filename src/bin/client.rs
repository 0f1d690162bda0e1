// Client.rs - AGV yard viewer
use agv_yard::{CellGrid, ClientConfig, Fleet, LinkState, Position, VehicleSnapshot, telemetry};
use anyhow::Context;
use clap::Parser;
use eframe::egui::{
    self, Align2, Color32, CornerRadius, FontId, Pos2, Rect, Stroke, StrokeKind, Vec2,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Simulated AGV yard driven by a traffic server",
    long_about = None
)]
struct CliArgs {
    /// JSON config file. Built-in defaults are used when omitted.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Traffic server address, overriding the config file.
    #[arg(short, long, value_name = "HOST:PORT")]
    server: Option<String>,
}

fn main() -> anyhow::Result<()> {
    telemetry::init("info");
    let args = CliArgs::parse();

    let mut config = match &args.config {
        Some(path) => {
            ClientConfig::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => ClientConfig::default(),
    };
    if let Some(server) = args.server {
        config.server = server;
    }
    info!(server = %config.server, vehicles = config.vehicles.len(), "starting yard viewer");

    let fleet = Fleet::from_config(&config).context("invalid client settings")?;
    let time_scale = config.time_scale;

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default().with_inner_size([1100.0, 640.0]),
        ..Default::default()
    };
    eframe::run_native(
        "AGV Yard",
        options,
        Box::new(move |_cc| Ok(Box::new(ClientApp::new(fleet, time_scale)))),
    )
    .map_err(|e| anyhow::anyhow!("viewer exited with error: {e}"))
}

struct ClientApp {
    fleet: Fleet,
    time_scale: f32,
    paused: bool,
    last_update: Instant,
    link_states: HashMap<String, LinkState>,
    logs: Vec<String>,
}

impl ClientApp {
    fn new(fleet: Fleet, time_scale: f32) -> Self {
        let link_states = fleet
            .vehicles()
            .iter()
            .map(|v| (v.name().to_string(), v.link_state()))
            .collect();
        Self {
            fleet,
            time_scale,
            paused: false,
            last_update: Instant::now(),
            link_states,
            logs: vec!["Yard ready.".into()],
        }
    }

    fn update_simulation(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_update).as_secs_f32();
        self.last_update = now;
        if !self.paused {
            self.fleet.advance(dt * self.time_scale);
        }

        for v in self.fleet.vehicles() {
            let state = v.link_state();
            let previous = self.link_states.insert(v.name().to_string(), state);
            if previous != Some(state) {
                self.logs.push(format!("{}: link {:?}", v.name(), state));
            }
        }
        if self.logs.len() > 100 {
            self.logs.remove(0);
        }
    }
}

fn link_color(state: LinkState) -> Color32 {
    match state {
        LinkState::Connected => Color32::GREEN,
        LinkState::Connecting => Color32::YELLOW,
        LinkState::Disconnected => Color32::GRAY,
        LinkState::Failed => Color32::RED,
    }
}

/// Screen mapping for the top-down view: lanes run left to right.
struct YardView {
    rect: Rect,
    scale: f32,
}

impl YardView {
    fn fit(grid: &CellGrid, available: Rect) -> Self {
        let (across, along) = grid.extent();
        let scale = (available.width() / along).min(available.height() / across);
        let rect = Rect::from_min_size(available.min, Vec2::new(along * scale, across * scale));
        Self { rect, scale }
    }

    fn to_screen(&self, p: Position) -> Pos2 {
        self.rect.min + Vec2::new(p.z * self.scale, p.x * self.scale)
    }

    fn band(&self, from_x: f32, to_x: f32) -> Rect {
        Rect::from_min_max(
            self.rect.min + Vec2::new(0.0, from_x * self.scale),
            Pos2::new(self.rect.max.x, self.rect.min.y + to_x * self.scale),
        )
    }
}

fn draw_yard(painter: &egui::Painter, view: &YardView, grid: &CellGrid) {
    let c = grid.config();
    let buffer_start = c.buffer_row as f32 * c.high_speed_lane_width;
    let loading_start = buffer_start + c.buffer_length;
    let apron_start = loading_start + c.loading_lane_count as f32 * c.loading_lane_width;
    let zones = [
        (0.0, buffer_start, Color32::from_rgb(40, 44, 52), "high-speed lanes"),
        (buffer_start, loading_start, Color32::from_rgb(52, 60, 48), "buffer lane"),
        (loading_start, apron_start, Color32::from_rgb(44, 48, 64), "loading lanes"),
        (apron_start, grid.extent().0, Color32::from_rgb(64, 52, 40), "holder apron"),
    ];
    for (from, to, color, label) in zones {
        let band = view.band(from, to);
        painter.rect_filled(band, CornerRadius::ZERO, color);
        painter.text(
            band.left_top() + Vec2::new(4.0, 2.0),
            Align2::LEFT_TOP,
            label,
            FontId::proportional(11.0),
            Color32::from_gray(160),
        );
    }

    for row in 1..c.buffer_row {
        let y = view.rect.min.y + row as f32 * c.high_speed_lane_width * view.scale;
        painter.line_segment(
            [Pos2::new(view.rect.min.x, y), Pos2::new(view.rect.max.x, y)],
            Stroke::new(0.5, Color32::from_gray(90)),
        );
    }
    let border = Stroke::new(1.0, Color32::GRAY);
    painter.rect_stroke(view.rect, CornerRadius::ZERO, border, StrokeKind::Middle);
}

fn draw_vehicle(painter: &egui::Painter, view: &YardView, v: &VehicleSnapshot) {
    let center = view.to_screen(v.pose.position);
    // heading is measured in the x/z plane; screen axes are (z, x)
    let dir = Vec2::new(v.pose.heading.sin(), v.pose.heading.cos());
    let body = Color32::from_rgb(230, 200, 60);

    painter.circle_filled(center, 6.0, body);
    painter.line_segment([center, center + dir * 12.0], Stroke::new(2.0, body));
    if v.pose.busy {
        let container = Rect::from_center_size(center, Vec2::splat(8.0));
        painter.rect_filled(container, CornerRadius::same(1), Color32::from_rgb(200, 80, 40));
    }
    painter.circle_stroke(center, 8.0, Stroke::new(1.0, link_color(v.link)));
    painter.text(
        center + Vec2::new(0.0, -12.0),
        Align2::CENTER_BOTTOM,
        &v.name,
        FontId::proportional(12.0),
        Color32::WHITE,
    );
}

impl eframe::App for ClientApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        // 1. Advance the simulation
        self.update_simulation();
        let snapshots = self.fleet.snapshots();

        // 2. GUI Layout
        let mut despawn = None;
        egui::SidePanel::left("fleet").min_width(240.0).show(ctx, |ui| {
            ui.heading("AGV Fleet");
            ui.label(format!("Sim time: {:.1} s", self.fleet.sim_time()));
            ui.checkbox(&mut self.paused, "Pause");
            ui.add(egui::Slider::new(&mut self.time_scale, 0.1..=10.0).text("Time scale"));

            ui.separator();
            for v in &snapshots {
                ui.horizontal(|ui| {
                    ui.colored_label(link_color(v.link), "●");
                    ui.strong(&v.name);
                    ui.label(format!("{:?}", v.link));
                    if ui.small_button("Remove").clicked() {
                        despawn = Some(v.name.clone());
                    }
                });
                ui.label(format!(
                    "  target {}  queued {}  done {}{}",
                    v.target.map_or("-".to_string(), |c| c.to_string()),
                    v.pending,
                    v.completed,
                    if v.pose.busy { "  [loaded]" } else { "" }
                ));
            }

            ui.separator();
            ui.heading("Log");
            egui::ScrollArea::vertical().show(ui, |ui| {
                for log in self.logs.iter().rev() {
                    ui.monospace(log);
                }
            });
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            let available = ui.available_rect_before_wrap();
            let view = YardView::fit(self.fleet.grid(), available);
            let (_response, painter) = ui.allocate_painter(view.rect.size(), egui::Sense::hover());
            draw_yard(&painter, &view, self.fleet.grid());
            for v in &snapshots {
                draw_vehicle(&painter, &view, v);
            }
        });

        if let Some(name) = despawn {
            if self.fleet.despawn(&name) {
                self.link_states.remove(&name);
                self.logs.push(format!("{name}: removed"));
            }
        }

        ctx.request_repaint_after(Duration::from_millis(16));
    }
}
