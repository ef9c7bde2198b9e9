use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use eframe::egui::{self, ColorImage, Key, TextureHandle, TextureOptions};
use tracing::{error, warn};

use crate::audio::AudioOutput;
use crate::config::{DEFAULT_CONFIG_FILE, EmulatorConfig};
use crate::nes::ppu::{FRAME_HEIGHT, FRAME_WIDTH};
use crate::nes::{
    BUTTON_A, BUTTON_B, BUTTON_DOWN, BUTTON_LEFT, BUTTON_RIGHT, BUTTON_SELECT, BUTTON_START,
    BUTTON_UP, Nes,
};

const IDLE_REPAINT: Duration = Duration::from_millis(16);
const MAX_FRAMES_PER_UPDATE: u32 = 2;
const AUDIO_MAX_BUFFER_MS: usize = 10;

const PAD1_BINDINGS: [(Key, u8); 12] = [
    (Key::W, BUTTON_UP),
    (Key::S, BUTTON_DOWN),
    (Key::A, BUTTON_LEFT),
    (Key::D, BUTTON_RIGHT),
    (Key::ArrowUp, BUTTON_UP),
    (Key::ArrowDown, BUTTON_DOWN),
    (Key::ArrowLeft, BUTTON_LEFT),
    (Key::ArrowRight, BUTTON_RIGHT),
    (Key::Space, BUTTON_A),
    (Key::Z, BUTTON_A),
    (Key::X, BUTTON_B),
    (Key::Enter, BUTTON_START),
];

const PAD2_BINDINGS: [(Key, u8); 8] = [
    (Key::I, BUTTON_UP),
    (Key::K, BUTTON_DOWN),
    (Key::J, BUTTON_LEFT),
    (Key::L, BUTTON_RIGHT),
    (Key::N, BUTTON_A),
    (Key::M, BUTTON_B),
    (Key::Tab, BUTTON_SELECT),
    (Key::Backspace, BUTTON_START),
];

/// Everything the window loop mutates between frames.
pub struct RuntimeState {
    pub running: bool,
    pub focused: bool,
    pub paused: bool,
    pub status_line: String,
    pub loaded_rom: Option<PathBuf>,
    next_frame_at: Option<Instant>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            running: false,
            focused: true,
            paused: false,
            status_line: "Drop a .nes file or click Open ROM".to_string(),
            loaded_rom: None,
            next_frame_at: None,
        }
    }
}

pub struct NesApp {
    nes: Option<Nes>,
    config: EmulatorConfig,
    runtime: RuntimeState,
    frame_texture: Option<TextureHandle>,
    audio: Option<AudioOutput>,
}

impl NesApp {
    pub fn new(cc: &eframe::CreationContext<'_>, rom: Option<PathBuf>) -> Self {
        cc.egui_ctx.set_visuals(egui::Visuals::dark());

        let mut runtime = RuntimeState::default();
        let config = match EmulatorConfig::load_or_default(Path::new(DEFAULT_CONFIG_FILE)) {
            Ok(config) => config,
            Err(err) => {
                warn!("{err:#}");
                runtime.status_line = format!("Config ignored: {err:#}");
                EmulatorConfig::default()
            }
        };

        let audio = match AudioOutput::new() {
            Ok(audio) => Some(audio),
            Err(err) => {
                warn!("audio disabled: {err:#}");
                None
            }
        };

        let mut app = Self {
            nes: None,
            config,
            runtime,
            frame_texture: None,
            audio,
        };
        if let Some(path) = rom {
            app.load_rom(&path);
        }
        app
    }

    fn load_rom(&mut self, path: &Path) {
        let result = match self.nes.as_mut() {
            Some(nes) => nes.load_game(path),
            None => Nes::from_path(path, &self.config).map(|nes| {
                self.nes = Some(nes);
            }),
        };

        match result {
            Ok(()) => {
                let mapper = self.nes.as_ref().map(Nes::mapper_name).unwrap_or_default();
                if let (Some(nes), Some(audio)) = (self.nes.as_mut(), &self.audio) {
                    nes.set_audio_sample_rate(audio.sample_rate());
                }
                self.runtime.status_line = format!(
                    "Loaded {} using {mapper}",
                    path.file_name().and_then(|f| f.to_str()).unwrap_or("ROM"),
                );
                self.runtime.loaded_rom = Some(path.to_path_buf());
                self.runtime.running = true;
                self.runtime.paused = false;
                self.runtime.next_frame_at = None;
                self.frame_texture = None;
            }
            Err(err) => {
                error!("failed to load ROM: {err:#}");
                self.runtime.status_line = format!("Failed to load ROM: {err:#}");
            }
        }
    }

    fn open_rom_dialog(&mut self) {
        if let Some(path) = rfd::FileDialog::new()
            .add_filter("NES ROM", &["nes"])
            .set_title("Open NES ROM")
            .pick_file()
        {
            self.load_rom(&path);
        }
    }

    fn handle_dropped_files(&mut self, ctx: &egui::Context) {
        let dropped = ctx.input(|input| input.raw.dropped_files.clone());
        for file in dropped {
            let Some(path) = file.path else {
                continue;
            };
            let is_nes = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("nes"));

            if is_nes {
                self.load_rom(&path);
            } else {
                self.runtime.status_line = format!("Unsupported file: {}", path.display());
            }
        }
    }

    fn reset(&mut self) {
        if let Some(nes) = self.nes.as_mut() {
            nes.reset();
            self.runtime.running = true;
            self.runtime.next_frame_at = None;
            self.runtime.status_line = "Reset complete".to_string();
        }
    }

    fn toggle_pause(&mut self) {
        if self.nes.is_some() {
            self.runtime.paused = !self.runtime.paused;
            self.runtime.next_frame_at = None;
        }
    }

    fn handle_shortcuts(&mut self, ctx: &egui::Context) {
        if ctx.input(|i| i.modifiers.command && i.key_pressed(Key::O)) {
            self.open_rom_dialog();
        }
        if ctx.input(|i| i.key_pressed(Key::R)) {
            self.reset();
        }
        if ctx.input(|i| i.key_pressed(Key::P)) {
            self.toggle_pause();
        }
    }

    fn controller_state_from_input(ctx: &egui::Context, bindings: &[(Key, u8)]) -> u8 {
        ctx.input(|input| {
            bindings
                .iter()
                .filter(|(key, _)| input.key_down(*key))
                .fold(0u8, |state, (_, button)| state | button)
        })
    }

    fn pad1_state(ctx: &egui::Context) -> u8 {
        let mut state = Self::controller_state_from_input(ctx, &PAD1_BINDINGS);
        if ctx.input(|input| input.modifiers.shift) {
            state |= BUTTON_SELECT;
        }
        state
    }

    fn update_texture(&mut self, ctx: &egui::Context) {
        let Some(nes) = self.nes.as_mut() else {
            return;
        };
        if !nes.frame_ready() && self.frame_texture.is_some() {
            return;
        }
        nes.clear_frame_ready();

        let image = ColorImage::from_rgba_unmultiplied([FRAME_WIDTH, FRAME_HEIGHT], nes.frame_buffer());
        if let Some(texture) = self.frame_texture.as_mut() {
            texture.set(image, TextureOptions::NEAREST);
        } else {
            self.frame_texture =
                Some(ctx.load_texture("nes-frame", image, TextureOptions::NEAREST));
        }
    }

    fn queued_audio_samples(&self) -> usize {
        self.audio.as_ref().map_or(0, AudioOutput::queued_samples)
    }

    fn run_due_frames(&mut self, ctx: &egui::Context) {
        let Some(frame_rate) = self.nes.as_ref().map(|nes| nes.tv_system().frame_rate()) else {
            return;
        };
        if !self.runtime.running || self.runtime.paused {
            return;
        }

        let frame_interval = Duration::from_secs_f64(1.0 / frame_rate);
        let now = Instant::now();
        let mut next = self.runtime.next_frame_at.unwrap_or(now);
        let max_samples = self
            .audio
            .as_ref()
            .map_or(usize::MAX, |audio| {
                audio.sample_rate() as usize * AUDIO_MAX_BUFFER_MS / 1000
            });
        let (pad1, pad2) = if self.runtime.focused {
            (
                Self::pad1_state(ctx),
                Self::controller_state_from_input(ctx, &PAD2_BINDINGS),
            )
        } else {
            (0, 0)
        };

        let mut ran_frames = 0u32;
        while Instant::now() >= next
            && self.queued_audio_samples() < max_samples
            && ran_frames < MAX_FRAMES_PER_UPDATE
        {
            let Some(nes) = self.nes.as_mut() else {
                break;
            };
            nes.set_controller_state(pad1);
            nes.set_controller2_state(pad2);
            if let Err(err) = nes.run_frame() {
                self.runtime.running = false;
                self.runtime.status_line = format!("Emulation halted: {err}");
                break;
            }
            let samples = nes.take_audio_samples();
            if let Some(audio) = &self.audio {
                audio.push_samples(&samples);
            }
            ran_frames += 1;
            next += frame_interval;
        }

        if ran_frames == 0 && now > next + frame_interval {
            next = now;
        }
        self.runtime.next_frame_at = Some(next);
    }
}

impl eframe::App for NesApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.runtime.focused = ctx.input(|i| i.focused);
        self.handle_dropped_files(ctx);
        self.handle_shortcuts(ctx);
        self.run_due_frames(ctx);
        self.update_texture(ctx);

        let has_rom = self.nes.is_some();
        egui::TopBottomPanel::top("toolbar").show(ctx, |ui| {
            ui.horizontal(|ui| {
                if ui.button("Open ROM").clicked() {
                    self.open_rom_dialog();
                }
                if ui
                    .add_enabled(has_rom, egui::Button::new("Reset (R)"))
                    .clicked()
                {
                    self.reset();
                }
                let pause_label = if self.runtime.paused {
                    "Resume (P)"
                } else {
                    "Pause (P)"
                };
                if ui
                    .add_enabled(has_rom, egui::Button::new(pause_label))
                    .clicked()
                {
                    self.toggle_pause();
                }
                if let Some(path) = &self.runtime.loaded_rom {
                    ui.separator();
                    ui.label(path.display().to_string());
                }
            });
        });

        egui::TopBottomPanel::bottom("status").show(ctx, |ui| {
            ui.horizontal_wrapped(|ui| {
                ui.label(&self.runtime.status_line);
                if let Some(nes) = &self.nes {
                    ui.separator();
                    ui.label(format!("Mapper: {}", nes.mapper_name()));
                    ui.separator();
                    ui.label(format!("{:?}", nes.tv_system()));
                }
                ui.separator();
                match &self.audio {
                    Some(audio) => ui.label(format!(
                        "Audio: {} Hz (queue {} ms)",
                        audio.sample_rate(),
                        (audio.queued_samples() * 1000) / audio.sample_rate().max(1) as usize
                    )),
                    None => ui.label("Audio: unavailable"),
                };
                ui.separator();
                ui.label(
                    "Pad 1: WASD/arrows, Space/Z=A, X=B, Enter=Start, Shift=Select. Pad 2: IJKL, N=A, M=B, Backspace=Start, Tab=Select. P=Pause",
                );
            });

            if let Some(nes) = &self.nes {
                let cpu = nes.cpu();
                let (scanline, dot) = nes.ppu().position();
                ui.separator();
                ui.collapsing("Debug", |ui| {
                    ui.monospace(format!(
                        "CPU A={:02X} X={:02X} Y={:02X} P={:02X} SP={:02X} PC={:04X} cycles={}",
                        cpu.a,
                        cpu.x,
                        cpu.y,
                        cpu.p,
                        cpu.sp,
                        cpu.pc,
                        cpu.total_cycles()
                    ));
                    ui.monospace(format!("PPU scanline={scanline} dot={dot}"));
                    ui.monospace(format!("Mapper detail: {}", nes.mapper_state()));
                });
            }
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.vertical_centered(|ui| {
                let available = ui.available_size();
                let scale_x = (available.x / FRAME_WIDTH as f32).max(1.0);
                let scale_y = (available.y / FRAME_HEIGHT as f32).max(1.0);
                let scale = scale_x.min(scale_y).floor().max(1.0);
                let target = egui::vec2(FRAME_WIDTH as f32 * scale, FRAME_HEIGHT as f32 * scale);

                if let Some(texture) = &self.frame_texture {
                    ui.add(egui::Image::new(texture).fit_to_exact_size(target));
                }
            });
        });

        match self.runtime.next_frame_at {
            Some(next) if self.runtime.running && !self.runtime.paused => {
                let wait = next.saturating_duration_since(Instant::now());
                ctx.request_repaint_after(wait.min(IDLE_REPAINT));
            }
            _ => ctx.request_repaint_after(IDLE_REPAINT),
        }
    }
}
