use std::path::PathBuf;

use famicore::app;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let rom = std::env::args_os().nth(1).map(PathBuf::from);

    let options = eframe::NativeOptions {
        viewport: eframe::egui::ViewportBuilder::default()
            .with_inner_size([1024.0, 720.0])
            .with_min_inner_size([640.0, 480.0])
            .with_title("famicore"),
        vsync: true,
        ..Default::default()
    };

    eframe::run_native(
        "famicore",
        options,
        Box::new(|cc| Ok(Box::new(app::NesApp::new(cc, rom)))),
    )
    .map_err(|err| anyhow::anyhow!("failed to run app: {err}"))
}
