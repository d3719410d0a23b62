mod app;
mod cache;
mod confidence;
mod config;
mod dispatch;
mod error;
mod image_set;
mod imaging;
mod job;
mod launch;
mod loading;
mod logging;
mod remote;
mod session;

fn main() -> eframe::Result<()> {
    if let Err(err) = logging::init() {
        eprintln!("Logging disabled: {err}");
    }

    let settings = config::Settings::load();
    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    let (initial_request, initial_status) = match launch::parse_launch_request_from_args(&cli_args)
    {
        Ok(request) => (request, None),
        Err(err) => {
            log::warn!("Ignoring launch arguments: {err}");
            (None, Some(format!("Launch URL/args error: {err}")))
        }
    };

    let native_options = eframe::NativeOptions {
        viewport: eframe::egui::ViewportBuilder::default()
            .with_inner_size([1280.0, 820.0])
            .with_min_inner_size([720.0, 480.0])
            .with_decorations(false)
            .with_resizable(true),
        ..Default::default()
    };

    eframe::run_native(
        "Casescope",
        native_options,
        Box::new(move |_cc| {
            Ok(Box::new(app::CaseViewerApp::new(
                settings,
                initial_request,
                initial_status,
            )))
        }),
    )
}
