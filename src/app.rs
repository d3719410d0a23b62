use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use eframe::egui::{
    self, ColorImage, ResizeDirection, Sense, TextureHandle, TextureOptions, ViewportCommand,
};

use crate::config::{settings_file_path, Settings};
use crate::confidence::ConfidenceBreakdown;
use crate::dispatch::ThreadDispatcher;
use crate::error::{ViewerError, ViewerResult};
use crate::image_set::{ScanImage, SelectionChange};
use crate::imaging::{decode_image_bytes, downsample_color_image};
use crate::job::{AnalysisJob, AnalysisKind};
use crate::launch::LaunchRequest;
use crate::loading::{LoadingCoordinator, Readiness};
use crate::remote::{HttpScanService, ImageStore, RemoteImage};
use crate::session::{JobHandle, JobOutcome, ScanRenderer, ScanSession, StartOptions};

const APP_TITLE: &str = "Casescope";
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const THUMB_MAX_DIM: usize = 96;
const THUMB_LIST_MAX_DIM: f32 = 72.0;
const SLIDE_DURATION: Duration = Duration::from_millis(220);
const FRAME_INTERVAL: Duration = Duration::from_millis(16);
const JOB_REPAINT_INTERVAL: Duration = Duration::from_millis(100);
const PREDICTED_FILL: egui::Color32 = egui::Color32::from_rgb(90, 140, 220);

enum RemoteReply {
    Listing(Vec<RemoteImage>),
    Uploaded(RemoteImage),
    Deleted { index: usize, reference: String },
}

struct LoadedImage {
    texture: TextureHandle,
    thumb: TextureHandle,
}

#[derive(Clone, Copy)]
enum UiAction {
    OpenScan,
    Reload,
    Upload,
    DeleteSelected,
    Select(usize),
    Next,
    Previous,
    First,
    Last,
    Analyze,
    Retry,
    Cancel,
    DismissError,
    RememberKind,
}

pub struct CaseViewerApp {
    settings: Settings,
    service: Option<Arc<HttpScanService>>,
    session: Option<ScanSession>,
    loading: LoadingCoordinator,
    selected_kind: AnalysisKind,
    job_handle: Option<JobHandle>,
    textures: HashMap<String, LoadedImage>,
    image_failures: HashMap<String, String>,
    fetches_in_flight: HashSet<String>,
    image_sender: Sender<(String, Result<ColorImage, String>)>,
    image_receiver: Receiver<(String, Result<ColorImage, String>)>,
    remote_receiver: Option<Receiver<ViewerResult<RemoteReply>>>,
    pending_launch_request: Option<LaunchRequest>,
    pending_image: Option<usize>,
    scan_input: String,
    status_line: String,
}

impl CaseViewerApp {
    pub fn new(
        settings: Settings,
        initial_request: Option<LaunchRequest>,
        initial_status: Option<String>,
    ) -> Self {
        let (image_sender, image_receiver) = mpsc::channel();
        Self {
            loading: LoadingCoordinator::new(settings.min_loading()),
            selected_kind: settings.default_kind,
            settings,
            service: None,
            session: None,
            job_handle: None,
            textures: HashMap::new(),
            image_failures: HashMap::new(),
            fetches_in_flight: HashSet::new(),
            image_sender,
            image_receiver,
            remote_receiver: None,
            pending_launch_request: initial_request,
            pending_image: None,
            scan_input: String::new(),
            status_line: initial_status.unwrap_or_default(),
        }
    }

    fn apply_black_background(ctx: &egui::Context) {
        let mut visuals = egui::Visuals::dark();
        let line_base = egui::Color32::from_gray(28);
        let line_hover = egui::Color32::from_gray(42);
        let line_active = egui::Color32::from_gray(56);

        visuals.panel_fill = egui::Color32::BLACK;
        visuals.window_fill = egui::Color32::BLACK;
        visuals.faint_bg_color = egui::Color32::from_gray(8);
        visuals.extreme_bg_color = egui::Color32::from_gray(12);
        visuals.window_stroke = egui::Stroke::new(1.0, line_base);
        visuals.widgets.noninteractive.bg_stroke = egui::Stroke::new(1.0, line_base);
        visuals.widgets.inactive.bg_stroke = egui::Stroke::new(1.0, line_base);
        visuals.widgets.hovered.bg_stroke = egui::Stroke::new(1.0, line_hover);
        visuals.widgets.active.bg_stroke = egui::Stroke::new(1.0, line_active);
        visuals.widgets.open.bg_stroke = egui::Stroke::new(1.0, line_base);
        ctx.set_visuals(visuals);
    }

    fn is_busy(&self) -> bool {
        self.remote_receiver.is_some() || !self.fetches_in_flight.is_empty()
    }

    fn handle_launch_request(&mut self, request: LaunchRequest) {
        if let Some(server_url) = request.server_url {
            self.settings.server_url = server_url;
        }
        if let Some(kind) = request.kind {
            self.selected_kind = kind;
        }
        self.scan_input = request.scan_id.clone();
        self.open_scan(request.scan_id, request.image);
    }

    fn open_scan(&mut self, scan_id: String, image: Option<usize>) {
        let scan_id = scan_id.trim().to_string();
        if scan_id.is_empty() {
            self.status_line = "Enter a scan id to open.".to_string();
            return;
        }

        let service = match HttpScanService::new(&self.settings) {
            Ok(service) => Arc::new(service),
            Err(err) => {
                self.status_line = format!("Scan service error: {err:#}");
                return;
            }
        };
        let dispatcher = ThreadDispatcher::new(
            service.clone(),
            self.settings.poll_interval(),
            self.settings.max_poll_failures,
        );

        log::info!(
            "Opening scan {scan_id} from {}",
            self.settings.server_url
        );
        self.session = Some(ScanSession::new(scan_id.clone(), Box::new(dispatcher)));
        self.service = Some(service);
        self.job_handle = None;
        self.textures.clear();
        self.image_failures.clear();
        self.fetches_in_flight.clear();
        self.loading = LoadingCoordinator::new(self.settings.min_loading());
        self.pending_image = image;
        self.status_line = format!("Loading scan {scan_id}...");
        self.request_listing();
    }

    fn request_listing(&mut self) {
        let (Some(service), Some(session)) = (self.service.clone(), self.session.as_ref()) else {
            return;
        };
        let scan_id = session.scan_id().to_string();
        self.spawn_remote(move || service.list_images(&scan_id).map(RemoteReply::Listing));
    }

    fn spawn_remote<F>(&mut self, work: F)
    where
        F: FnOnce() -> ViewerResult<RemoteReply> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        self.remote_receiver = Some(receiver);
        thread::spawn(move || {
            let _ = sender.send(work());
        });
    }

    fn upload_image(&mut self, ctx: &egui::Context) {
        let (Some(service), Some(session)) = (self.service.clone(), self.session.as_ref()) else {
            self.status_line = "Open a scan before uploading.".to_string();
            return;
        };
        if self.remote_receiver.is_some() {
            self.status_line = "Wait for the current request to finish.".to_string();
            return;
        }
        let Some(path) = rfd::FileDialog::new()
            .add_filter("Scan images", &["png", "jpg", "jpeg", "dcm", "dicom"])
            .pick_file()
        else {
            return;
        };

        let scan_id = session.scan_id().to_string();
        self.status_line = format!("Uploading {}...", display_name(&path));
        self.spawn_remote(move || {
            service
                .upload_image(&scan_id, &path)
                .map(RemoteReply::Uploaded)
        });
        ctx.set_cursor_icon(egui::CursorIcon::Progress);
        ctx.request_repaint();
    }

    fn delete_selected(&mut self) {
        let (Some(service), Some(session)) = (self.service.clone(), self.session.as_ref()) else {
            return;
        };
        let Some(index) = session.selected_index() else {
            return;
        };
        if session.images().len() <= 1 {
            self.status_line = ViewerError::LastImageError.to_string();
            return;
        }
        if self.remote_receiver.is_some() {
            self.status_line = "Wait for the current request to finish.".to_string();
            return;
        }
        let remote_index = match session.remote_index(index) {
            Ok(remote_index) => remote_index,
            Err(err) => {
                self.status_line = err.to_string();
                return;
            }
        };
        let reference = session
            .selected_image()
            .map(|image| image.reference.clone())
            .unwrap_or_default();

        let scan_id = session.scan_id().to_string();
        self.status_line = format!("Deleting image {}...", index + 1);
        self.spawn_remote(move || {
            service
                .delete_image(&scan_id, remote_index)
                .map(|()| RemoteReply::Deleted { index, reference })
        });
    }

    fn poll_remote(&mut self, ctx: &egui::Context) {
        let Some(receiver) = self.remote_receiver.take() else {
            return;
        };

        match receiver.try_recv() {
            Ok(Ok(reply)) => self.apply_remote_reply(reply),
            Ok(Err(err)) => {
                if err.is_recoverable() {
                    log::warn!("Scan request failed: {err}");
                } else {
                    log::error!("Scan request rejected locally: {err}");
                }
                self.status_line = err.to_string();
            }
            Err(TryRecvError::Empty) => {
                self.remote_receiver = Some(receiver);
                ctx.request_repaint_after(FRAME_INTERVAL);
            }
            Err(TryRecvError::Disconnected) => {
                self.status_line = "Scan service worker disconnected.".to_string();
            }
        }
    }

    fn apply_remote_reply(&mut self, reply: RemoteReply) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let now = Instant::now();
        let selected_before = session.selected_image().map(|image| image.reference.clone());

        match reply {
            RemoteReply::Listing(images) => {
                let count = images.len();
                session.load_images(images);
                self.status_line = if count == 0 {
                    "This scan has no images yet. Upload one to start.".to_string()
                } else {
                    format!("Loaded {count} image(s) for scan {}.", session.scan_id())
                };
                if let Some(index) = self.pending_image.take() {
                    if let Err(err) = session.select(index) {
                        self.status_line = format!("Launch image: {err}");
                    }
                }
            }
            RemoteReply::Uploaded(image) => match session.add_image(image) {
                Ok(index) => {
                    let previous = session.selected_index();
                    if let Ok(change) = session.select(index) {
                        self.loading.on_selection(change, now);
                    } else {
                        self.loading.begin(index, previous, now);
                    }
                    self.status_line = format!("Uploaded image {}.", index + 1);
                    return;
                }
                Err(err) => self.status_line = err.to_string(),
            },
            RemoteReply::Deleted { index, reference } => {
                let unchanged = session
                    .images()
                    .get(index)
                    .is_some_and(|image| image.reference == reference);
                let deleted = if unchanged {
                    session.delete_image(index)
                } else {
                    Err(ViewerError::NotFound(reference))
                };
                match deleted {
                    // The store may renumber what is left, so fetch its view.
                    Ok(()) => {
                        self.status_line = format!("Deleted image {}.", index + 1);
                        self.request_listing();
                    }
                    Err(err) => {
                        self.status_line = format!("{err}; reloading scan.");
                        self.request_listing();
                        return;
                    }
                }
            }
        }

        self.forget_unreferenced_images();
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let selected_after = session.selected_image().map(|image| image.reference.clone());
        if selected_before != selected_after {
            if let Some(index) = session.selected_index() {
                self.loading.begin(index, None, now);
            }
        }
    }

    /// Drops textures and failures for images the scan no longer shows.
    fn forget_unreferenced_images(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let keep = session.referenced_images();
        let dropped = retain_referenced(&mut self.textures, &keep)
            + retain_referenced(&mut self.image_failures, &keep);
        if dropped > 0 {
            log::debug!("Released {dropped} image(s) no longer in the scan");
        }
    }

    /// Fetches the listing again and lets failed images be retried.
    fn reload_scan(&mut self) {
        let selected_failed = self
            .session
            .as_ref()
            .and_then(ScanSession::selected_image)
            .is_some_and(|image| self.image_failures.contains_key(&image.reference));
        self.image_failures.clear();
        if selected_failed {
            self.loading.invalidate(Instant::now());
        }
        self.request_listing();
    }

    fn remember_kind(&mut self) {
        self.settings.default_kind = self.selected_kind;
        let Some(path) = settings_file_path() else {
            return;
        };
        if let Err(err) = Settings::save_default_kind(&path, self.selected_kind) {
            log::warn!("Could not save settings: {err:#}");
            self.status_line = format!("Could not save settings: {err:#}");
        }
    }

    fn request_image(&mut self, reference: &str) {
        if self.textures.contains_key(reference)
            || self.image_failures.contains_key(reference)
            || self.fetches_in_flight.contains(reference)
        {
            return;
        }
        let Some(service) = self.service.clone() else {
            return;
        };

        let reference = reference.to_string();
        self.fetches_in_flight.insert(reference.clone());
        let sender = self.image_sender.clone();
        thread::spawn(move || {
            let decoded = service
                .fetch_image(&reference)
                .map_err(|err| err.to_string())
                .and_then(|bytes| decode_image_bytes(&bytes).map_err(|err| format!("{err:#}")));
            let _ = sender.send((reference, decoded));
        });
    }

    fn request_scan_images(&mut self) {
        let references = self
            .session
            .as_ref()
            .map(|session| {
                session
                    .images()
                    .images()
                    .iter()
                    .map(|image| image.reference.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        for reference in references {
            self.request_image(&reference);
        }
    }

    fn poll_images(&mut self, ctx: &egui::Context) {
        while let Ok((reference, decoded)) = self.image_receiver.try_recv() {
            self.fetches_in_flight.remove(&reference);
            match decoded {
                Ok(color_image) => {
                    let thumb = downsample_color_image(&color_image, THUMB_MAX_DIM);
                    let texture = ctx.load_texture(
                        format!("scan-image:{reference}"),
                        color_image,
                        TextureOptions::LINEAR,
                    );
                    let thumb = ctx.load_texture(
                        format!("scan-thumb:{reference}"),
                        thumb,
                        TextureOptions::LINEAR,
                    );
                    self.textures
                        .insert(reference, LoadedImage { texture, thumb });
                }
                Err(err) => {
                    log::warn!("Could not load image {reference}: {err}");
                    self.status_line = format!("Could not load image: {err}");
                    self.image_failures.insert(reference, err);
                }
            }
        }
        if !self.fetches_in_flight.is_empty() {
            ctx.request_repaint_after(FRAME_INTERVAL);
        }
    }

    fn poll_analysis(&mut self, ctx: &egui::Context) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.poll_events();

        if let Some(outcome) = self.job_handle.as_ref().and_then(JobHandle::try_outcome) {
            self.job_handle = None;
            self.status_line = match outcome {
                JobOutcome::Completed(result) => format!(
                    "{} analysis finished for image {}.",
                    result.kind.label(),
                    result.image_index + 1
                ),
                JobOutcome::Failed(err) => err.to_string(),
                JobOutcome::Cancelled => "Analysis cancelled.".to_string(),
            };
        }
        if session.active_job().is_some() {
            ctx.request_repaint_after(JOB_REPAINT_INTERVAL);
        }
    }

    fn update_loading_gate(&mut self, ctx: &egui::Context) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let Some(image) = session.selected_image() else {
            return;
        };
        let now = Instant::now();
        if self.loading.gate_index().is_none() {
            self.loading.begin(image.index, None, now);
        }

        self.loading
            .observe_cache_revision(session.cache().revision());
        let readiness = Readiness {
            image: self.textures.contains_key(&image.reference)
                || self.image_failures.contains_key(&image.reference),
            session: session.session_ready_for(image.index),
            analysis: session.analysis_ready_for(image.index),
        };
        if self.loading.update(image.index, readiness, now) {
            let wait = self
                .loading
                .remaining(now)
                .unwrap_or(FRAME_INTERVAL)
                .clamp(FRAME_INTERVAL, self.loading.min_duration().max(FRAME_INTERVAL));
            ctx.request_repaint_after(wait);
        }
    }

    fn apply_selection(&mut self, change: ViewerResult<SelectionChange>) {
        match change {
            Ok(change) => self.loading.on_selection(change, Instant::now()),
            Err(err) => self.status_line = err.to_string(),
        }
    }

    fn apply_action(&mut self, action: UiAction, ctx: &egui::Context) {
        match action {
            UiAction::OpenScan => self.open_scan(self.scan_input.clone(), None),
            UiAction::Reload => self.reload_scan(),
            UiAction::Upload => self.upload_image(ctx),
            UiAction::DeleteSelected => self.delete_selected(),
            UiAction::Select(index) => {
                if let Some(change) = self.session.as_mut().map(|s| s.select(index)) {
                    self.apply_selection(change);
                }
            }
            UiAction::Next => {
                if let Some(change) = self.session.as_mut().map(ScanSession::select_next) {
                    self.apply_selection(change);
                }
            }
            UiAction::Previous => {
                if let Some(change) = self.session.as_mut().map(ScanSession::select_previous) {
                    self.apply_selection(change);
                }
            }
            UiAction::First => {
                if let Some(change) = self.session.as_mut().map(ScanSession::select_first) {
                    self.apply_selection(change);
                }
            }
            UiAction::Last => {
                if let Some(change) = self.session.as_mut().map(ScanSession::select_last) {
                    self.apply_selection(change);
                }
            }
            UiAction::Analyze => self.start_analysis(false),
            UiAction::Retry => self.start_analysis(true),
            UiAction::Cancel => {
                if let Some(session) = self.session.as_mut() {
                    if session.cancel_analysis().is_some() {
                        self.status_line = "Analysis cancelled.".to_string();
                    }
                }
                self.job_handle = None;
            }
            UiAction::DismissError => {
                if let Some(session) = self.session.as_mut() {
                    session.clear_error();
                }
            }
            UiAction::RememberKind => self.remember_kind(),
        }
    }

    fn start_analysis(&mut self, force: bool) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(index) = session.selected_index() else {
            self.status_line = "Select an image to analyze.".to_string();
            return;
        };
        let kind = self.selected_kind;
        let started = if force {
            session.retry_analysis(kind)
        } else {
            session.start_analysis(index, kind, StartOptions::default())
        };
        match started {
            Ok(handle) => {
                log::debug!("Tracking analysis job {}", handle.job_id());
                self.status_line = format!("{} analysis started for image {}.", kind.label(), index + 1);
                self.job_handle = Some(handle);
            }
            Err(err) => self.status_line = err.to_string(),
        }
    }

    fn collect_keyboard_actions(ctx: &egui::Context, actions: &mut Vec<UiAction>) {
        if ctx.wants_keyboard_input() {
            return;
        }
        ctx.input_mut(|input| {
            let bindings = [
                (egui::Key::ArrowLeft, UiAction::Previous),
                (egui::Key::ArrowRight, UiAction::Next),
                (egui::Key::Home, UiAction::First),
                (egui::Key::End, UiAction::Last),
                (egui::Key::Delete, UiAction::DeleteSelected),
            ];
            for (key, action) in bindings {
                if input.consume_key(egui::Modifiers::NONE, key) {
                    actions.push(action);
                }
            }
        });
    }

    fn show_titlebar(&self, ctx: &egui::Context, actions: &mut Vec<UiAction>) {
        let is_maximized = ctx.input(|input| input.viewport().maximized.unwrap_or(false));
        let title_text = match self.session.as_ref() {
            Some(session) => format!("{APP_TITLE} v{APP_VERSION} - scan {}", session.scan_id()),
            None => format!("{APP_TITLE} v{APP_VERSION}"),
        };
        let bar_fill = ctx.style().visuals.panel_fill;
        let has_session = self.session.is_some();

        egui::TopBottomPanel::top("titlebar")
            .show_separator_line(false)
            .frame(egui::Frame::none().fill(bar_fill))
            .exact_height(30.0)
            .show(ctx, |ui| {
                let button_size = egui::vec2(28.0, 22.0);
                let side_width = button_size.x * 3.0 + ui.spacing().item_spacing.x * 2.0;
                let titlebar_rect = ui.max_rect();
                let center_width = (ui.available_width()
                    - side_width * 2.0
                    - ui.spacing().item_spacing.x * 2.0)
                    .max(0.0);

                ui.add_space(2.0);
                ui.horizontal(|ui| {
                    ui.allocate_ui_with_layout(
                        egui::vec2(side_width, button_size.y),
                        egui::Layout::left_to_right(egui::Align::Center),
                        |ui| {
                            ui.add_space(4.0);
                            ui.menu_button("☰", |ui| {
                                if ui.add_enabled(has_session, egui::Button::new("Upload image")).clicked() {
                                    actions.push(UiAction::Upload);
                                    ui.close_menu();
                                }
                                if ui.add_enabled(has_session, egui::Button::new("Delete selected image")).clicked() {
                                    actions.push(UiAction::DeleteSelected);
                                    ui.close_menu();
                                }
                                if ui.add_enabled(has_session, egui::Button::new("Reload scan")).clicked() {
                                    actions.push(UiAction::Reload);
                                    ui.close_menu();
                                }
                            });
                        },
                    );

                    let (title_rect, drag_response) = ui.allocate_exact_size(
                        egui::vec2(center_width, button_size.y),
                        Sense::click_and_drag(),
                    );
                    ui.painter().text(
                        egui::pos2(titlebar_rect.center().x, title_rect.center().y),
                        egui::Align2::CENTER_CENTER,
                        &title_text,
                        egui::FontId::proportional(14.0),
                        ui.visuals().text_color(),
                    );
                    if drag_response.is_pointer_button_down_on() {
                        ctx.send_viewport_cmd(ViewportCommand::StartDrag);
                    }
                    if drag_response.double_clicked() {
                        ctx.send_viewport_cmd(ViewportCommand::Maximized(!is_maximized));
                    }

                    ui.allocate_ui_with_layout(
                        egui::vec2(ui.available_width(), button_size.y),
                        egui::Layout::right_to_left(egui::Align::Center),
                        |ui| {
                            let window_button = |label: &str| {
                                egui::Button::new(label.to_string())
                                    .fill(bar_fill)
                                    .stroke(egui::Stroke::NONE)
                            };
                            if ui.add_sized(button_size, window_button("X")).clicked() {
                                ctx.send_viewport_cmd(ViewportCommand::Close);
                            }
                            if ui.add_sized(button_size, window_button("□")).clicked() {
                                ctx.send_viewport_cmd(ViewportCommand::Maximized(!is_maximized));
                            }
                            if ui.add_sized(button_size, window_button("_")).clicked() {
                                ctx.send_viewport_cmd(ViewportCommand::Minimized(true));
                            }
                        },
                    );
                });
            });
    }

    fn show_toolbar(&mut self, ctx: &egui::Context, actions: &mut Vec<UiAction>) {
        let session = self.session.as_ref();
        let selected = session.and_then(ScanSession::selected_index);
        let count = session.map(|s| s.images().len()).unwrap_or(0);
        let busy = self.remote_receiver.is_some();
        let scan_input = &mut self.scan_input;

        egui::TopBottomPanel::top("toolbar").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.label("Scan");
                let response = ui.add(
                    egui::TextEdit::singleline(scan_input)
                        .hint_text("scan id")
                        .desired_width(180.0),
                );
                let submitted =
                    response.lost_focus() && ui.input(|input| input.key_pressed(egui::Key::Enter));
                if ui.button("Open").clicked() || submitted {
                    actions.push(UiAction::OpenScan);
                }
                ui.separator();

                if ui
                    .add_enabled(session.is_some() && !busy, egui::Button::new("Upload"))
                    .clicked()
                {
                    actions.push(UiAction::Upload);
                }
                if ui
                    .add_enabled(count > 1 && !busy, egui::Button::new("Delete"))
                    .on_disabled_hover_text("A scan keeps at least one image.")
                    .clicked()
                {
                    actions.push(UiAction::DeleteSelected);
                }
                ui.separator();

                let at_start = selected.map_or(true, |index| index == 0);
                let at_end = selected.map_or(true, |index| index + 1 >= count);
                if ui.add_enabled(!at_start, egui::Button::new("⏮")).clicked() {
                    actions.push(UiAction::First);
                }
                if ui.add_enabled(!at_start, egui::Button::new("◀")).clicked() {
                    actions.push(UiAction::Previous);
                }
                match selected {
                    Some(index) => ui.label(format!("{} / {count}", index + 1)),
                    None => ui.weak("- / -"),
                };
                if ui.add_enabled(!at_end, egui::Button::new("▶")).clicked() {
                    actions.push(UiAction::Next);
                }
                if ui.add_enabled(!at_end, egui::Button::new("⏭")).clicked() {
                    actions.push(UiAction::Last);
                }
            });
        });
    }

    fn show_thumbnails(&self, ui: &mut egui::Ui, actions: &mut Vec<UiAction>) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.images().is_empty() {
            ui.weak("No images.");
            return;
        }

        let selected = session.selected_index();
        let now = SystemTime::now();
        egui::ScrollArea::vertical()
            .id_salt("scan-thumbnails")
            .show(ui, |ui| {
                for image in session.images().images() {
                    let is_current = selected == Some(image.index);
                    let stroke_color = if is_current {
                        PREDICTED_FILL
                    } else {
                        egui::Color32::from_gray(35)
                    };
                    let has_results = session.cache().has_any_for(image.index);

                    egui::Frame::none()
                        .stroke(egui::Stroke::new(1.0, stroke_color))
                        .inner_margin(egui::Margin::same(4.0))
                        .show(ui, |ui| {
                            ui.vertical_centered(|ui| {
                                let response = match self.textures.get(&image.reference) {
                                    Some(loaded) => {
                                        let size = loaded.thumb.size_vec2();
                                        let scale = (THUMB_LIST_MAX_DIM / size.x.max(size.y).max(1.0))
                                            .clamp(0.01, 1.0);
                                        ui.add(
                                            egui::Image::new((loaded.thumb.id(), size * scale))
                                                .sense(Sense::click()),
                                        )
                                    }
                                    None => ui.add_sized(
                                        [THUMB_LIST_MAX_DIM, THUMB_LIST_MAX_DIM],
                                        egui::Button::new("…").frame(false),
                                    ),
                                };
                                let response = response.on_hover_text(format!(
                                    "{} · added {}",
                                    reference_name(&image.reference),
                                    format_age(image.uploaded_at, now)
                                ));
                                if response.clicked() {
                                    actions.push(UiAction::Select(image.index));
                                }
                                let caption = if has_results {
                                    format!("{} ●", image.index + 1)
                                } else {
                                    format!("{}", image.index + 1)
                                };
                                ui.small(caption);
                            });
                        });
                    ui.add_space(4.0);
                }
            });
    }

    fn show_analysis_panel(
        &mut self,
        ui: &mut egui::Ui,
        actions: &mut Vec<UiAction>,
        wanted: &mut Vec<String>,
    ) {
        let Some(session) = self.session.as_ref() else {
            ui.weak("Open a scan to analyze its images.");
            return;
        };
        let selected = session.selected_index();

        ui.heading("Analysis");
        let previous_kind = self.selected_kind;
        egui::ComboBox::from_id_salt("analysis-kind")
            .selected_text(self.selected_kind.label())
            .show_ui(ui, |ui| {
                for kind in AnalysisKind::ALL {
                    ui.selectable_value(&mut self.selected_kind, kind, kind.label());
                }
            });
        if self.selected_kind != previous_kind {
            actions.push(UiAction::RememberKind);
        }
        let kind = self.selected_kind;
        let now = SystemTime::now();
        let active = session.active_job();
        let cached = session.analysis_by_type(kind);

        ui.horizontal(|ui| {
            if ui
                .add_enabled(
                    selected.is_some() && active.is_none() && !session.is_analysis_cached(kind),
                    egui::Button::new("Analyze"),
                )
                .clicked()
            {
                actions.push(UiAction::Analyze);
            }
            if ui
                .add_enabled(
                    selected.is_some() && (cached.is_some() || active.is_some()),
                    egui::Button::new("Retry"),
                )
                .on_hover_text("Run again, replacing any running analysis.")
                .clicked()
            {
                actions.push(UiAction::Retry);
            }
            if ui
                .add_enabled(active.is_some(), egui::Button::new("Cancel"))
                .clicked()
            {
                actions.push(UiAction::Cancel);
            }
        });

        match (session.active_job_for_selection(), active) {
            (Some(job), _) => {
                ui.add(
                    egui::ProgressBar::new(f32::from(job.progress) / 100.0)
                        .text(format!("{} · {}%", job.stage.label(), job.progress))
                        .animate(true),
                );
                let started = ui.small(format!(
                    "{} analysis started {}",
                    job.kind.label(),
                    format_age(job.started_at, now)
                ));
                if let Some(remote_id) = job.remote_id.as_deref() {
                    started.on_hover_text(format!("Remote job {remote_id}"));
                }
            }
            (None, Some(job)) => {
                ui.weak(format!(
                    "{} analysis running on image {}.",
                    job.kind.label(),
                    job.image_index + 1
                ));
            }
            (None, None) => {}
        }
        if let Some(err) = session.last_error() {
            let error_color = ui.visuals().error_fg_color;
            ui.horizontal_wrapped(|ui| {
                ui.colored_label(error_color, err.to_string());
                if ui.small_button("Dismiss").clicked() {
                    actions.push(UiAction::DismissError);
                }
            });
        }
        ui.separator();

        match cached {
            Some(entry) => {
                let result = &entry.result;
                egui::Grid::new("analysis-summary")
                    .num_columns(2)
                    .spacing([12.0, 4.0])
                    .show(ui, |ui| {
                        ui.label("Detected");
                        ui.strong(result.detected_case.as_deref().unwrap_or("-"));
                        ui.end_row();
                        ui.label("Confidence");
                        ui.strong(
                            result
                                .confidence
                                .map(|value| format!("{value:.1}%"))
                                .unwrap_or_else(|| "-".to_string()),
                        );
                        ui.end_row();
                        ui.label("Stored");
                        ui.label(format_age(entry.stored_at, now));
                        ui.end_row();
                        if let Some(run_time) = session.job(&entry.job_id).and_then(job_run_time) {
                            ui.label("Run time");
                            ui.label(format!("{:.1} s", run_time.as_secs_f32()));
                            ui.end_row();
                        }
                    });
                if let Some(findings) = result.findings.as_deref() {
                    ui.add_space(6.0);
                    ui.label(egui::RichText::new("Findings").strong());
                    ui.label(findings);
                }
                if let Some(note) = result.medical_note.as_deref() {
                    ui.add_space(6.0);
                    ui.label(egui::RichText::new("Note").strong());
                    ui.label(note);
                }
                ui.add_space(6.0);
            }
            None if active.is_some_and(|job| Some(job.image_index) == selected) => {}
            None if session.has_completed_analysis() => {
                ui.weak(format!("No {} result for this image yet.", kind.label()));
            }
            None => {
                ui.weak("No analysis for this image yet.");
            }
        }

        let mut renderer = PanelRenderer {
            ui,
            textures: &self.textures,
            wanted,
            output_title: if kind.is_modality_conversion() {
                "Converted image"
            } else {
                "Output image"
            },
        };
        session.render(kind, &mut renderer);
    }

    fn show_image_canvas(&self, ui: &mut egui::Ui, now: Instant) -> bool {
        let Some(session) = self.session.as_ref() else {
            centered_label(ui, "Enter a scan id to start.");
            return false;
        };
        let Some(image) = session.selected_image() else {
            let text = if session.is_loaded() {
                "This scan has no images. Upload one to start."
            } else {
                "Loading scan..."
            };
            centered_label(ui, text);
            return false;
        };

        if self.loading.is_loading() {
            let waiting = self.loading.signals().pending().join(", ");
            ui.vertical_centered(|ui| {
                ui.add_space((ui.available_height() / 2.0 - 30.0).max(0.0));
                ui.add(egui::Spinner::new().size(36.0));
                if !waiting.is_empty() {
                    ui.weak(format!("Waiting for {waiting}"));
                }
            });
            return true;
        }
        let Some(loaded) = self.textures.get(&image.reference) else {
            let text = self
                .image_failures
                .get(&image.reference)
                .map(|err| format!("Image {} could not be shown: {err}", image.index + 1))
                .unwrap_or_else(|| "Loading image...".to_string());
            centered_label(ui, &text);
            return false;
        };

        let (canvas_rect, _) = ui.allocate_exact_size(ui.available_size(), Sense::hover());
        let image_size = loaded.texture.size_vec2();
        if image_size.x <= 0.0 || image_size.y <= 0.0 || !canvas_rect.is_positive() {
            return false;
        }
        let fit_scale = (canvas_rect.width() / image_size.x)
            .min(canvas_rect.height() / image_size.y)
            .max(0.01);
        let offset = self.loading.slide_offset(now, SLIDE_DURATION);
        let image_rect = egui::Rect::from_center_size(
            canvas_rect.center() + egui::vec2(offset * canvas_rect.width(), 0.0),
            image_size * fit_scale,
        );
        ui.painter_at(canvas_rect).image(
            loaded.texture.id(),
            image_rect,
            egui::Rect::from_min_max(egui::Pos2::ZERO, egui::pos2(1.0, 1.0)),
            egui::Color32::WHITE,
        );
        offset != 0.0
    }

    fn show_resize_grip(&self, ctx: &egui::Context) {
        const GRIP_SIZE: f32 = 18.0;
        const MARGIN: f32 = 1.0;

        egui::Area::new(egui::Id::new("window-resize-grip"))
            .order(egui::Order::Foreground)
            .anchor(egui::Align2::RIGHT_BOTTOM, egui::vec2(-MARGIN, -MARGIN))
            .show(ctx, |ui| {
                let (rect, response) = ui
                    .allocate_exact_size(egui::vec2(GRIP_SIZE, GRIP_SIZE), Sense::click_and_drag());
                if response.drag_started() {
                    ui.ctx().send_viewport_cmd(ViewportCommand::BeginResize(
                        ResizeDirection::SouthEast,
                    ));
                }
                if response.hovered() && !response.dragged() {
                    ui.ctx().set_cursor_icon(egui::CursorIcon::ResizeSouthEast);
                }

                let stroke = egui::Stroke::new(1.0, egui::Color32::from_gray(72));
                let r = rect.shrink(3.0);
                for offset in [0.0_f32, 4.0, 8.0] {
                    ui.painter().line_segment(
                        [
                            egui::pos2(r.right() - 4.0 - offset, r.bottom()),
                            egui::pos2(r.right(), r.bottom() - 4.0 - offset),
                        ],
                        stroke,
                    );
                }
            });
    }
}

/// Draws the session's render callbacks into the analysis side panel.
struct PanelRenderer<'a> {
    ui: &'a mut egui::Ui,
    textures: &'a HashMap<String, LoadedImage>,
    wanted: &'a mut Vec<String>,
    output_title: &'static str,
}

impl ScanRenderer for PanelRenderer<'_> {
    fn show_image(&mut self, image: &ScanImage) {
        self.ui.small(format!(
            "Image {} · {}",
            image.index + 1,
            reference_name(&image.reference)
        ));
    }

    fn show_output_image(&mut self, reference: &str) {
        self.ui.add_space(6.0);
        self.ui.label(egui::RichText::new(self.output_title).strong());
        match self.textures.get(reference) {
            Some(loaded) => {
                let size = loaded.texture.size_vec2();
                let width = self.ui.available_width().max(1.0);
                let scale = (width / size.x.max(1.0)).min(1.0);
                self.ui
                    .add(egui::Image::new((loaded.texture.id(), size * scale)));
            }
            None => {
                self.ui.add(egui::Spinner::new());
                self.wanted.push(reference.to_string());
            }
        }
    }

    fn show_confidence(&mut self, breakdown: &ConfidenceBreakdown) {
        if breakdown.is_empty() {
            return;
        }
        self.ui.add_space(6.0);
        match breakdown.predicted_entry() {
            Some(predicted) => self.ui.label(
                egui::RichText::new(format!(
                    "Confidence · predicted {} ({:.1}%)",
                    predicted.label, predicted.percentage
                ))
                .strong(),
            ),
            None => self.ui.label(egui::RichText::new("Confidence").strong()),
        };
        for (position, entry) in breakdown.entries.iter().enumerate() {
            let predicted = breakdown.is_predicted(position);
            self.ui.horizontal(|ui| {
                let label = egui::RichText::new(&entry.label);
                ui.add_sized(
                    [110.0, ui.spacing().interact_size.y],
                    egui::Label::new(if predicted { label.strong() } else { label }).truncate(),
                );
                let mut bar = egui::ProgressBar::new(entry.percentage / 100.0)
                    .text(format!("{:.1}%", entry.percentage));
                if predicted {
                    bar = bar.fill(PREDICTED_FILL);
                }
                ui.add(bar);
            });
        }
    }
}

impl eframe::App for CaseViewerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        Self::apply_black_background(ctx);

        if let Some(request) = self.pending_launch_request.take() {
            self.handle_launch_request(request);
        }

        self.poll_remote(ctx);
        self.poll_images(ctx);
        self.poll_analysis(ctx);
        self.request_scan_images();
        self.update_loading_gate(ctx);

        let mut actions = Vec::new();
        let mut wanted = Vec::new();
        Self::collect_keyboard_actions(ctx, &mut actions);

        self.show_titlebar(ctx, &mut actions);
        self.show_toolbar(ctx, &mut actions);

        egui::TopBottomPanel::bottom("status-line").show(ctx, |ui| {
            ui.horizontal(|ui| {
                if self.is_busy() {
                    ui.add(egui::Spinner::new().size(12.0));
                }
                ui.label(&self.status_line);
            });
        });

        egui::SidePanel::left("thumbnails")
            .resizable(false)
            .exact_width(THUMB_LIST_MAX_DIM + 28.0)
            .show(ctx, |ui| self.show_thumbnails(ui, &mut actions));

        egui::SidePanel::right("analysis")
            .default_width(320.0)
            .show(ctx, |ui| {
                egui::ScrollArea::vertical()
                    .id_salt("analysis-scroll")
                    .show(ui, |ui| self.show_analysis_panel(ui, &mut actions, &mut wanted));
            });

        let now = Instant::now();
        let mut animating = false;
        egui::CentralPanel::default().show(ctx, |ui| {
            animating = self.show_image_canvas(ui, now);
        });
        if animating {
            ctx.request_repaint();
        }

        for reference in wanted {
            self.request_image(&reference);
        }
        for action in actions {
            self.apply_action(action, ctx);
        }

        self.show_resize_grip(ctx);
        if self.is_busy() {
            ctx.set_cursor_icon(egui::CursorIcon::Progress);
        }
    }
}

fn centered_label(ui: &mut egui::Ui, text: &str) {
    ui.allocate_ui_with_layout(
        ui.available_size(),
        egui::Layout::centered_and_justified(egui::Direction::TopDown),
        |ui| {
            ui.label(text);
        },
    );
}

fn retain_referenced<V>(entries: &mut HashMap<String, V>, keep: &HashSet<String>) -> usize {
    let before = entries.len();
    entries.retain(|reference, _| keep.contains(reference));
    before - entries.len()
}

fn format_age(then: SystemTime, now: SystemTime) -> String {
    let seconds = now.duration_since(then).unwrap_or_default().as_secs();
    match seconds {
        0..=4 => "just now".to_string(),
        5..=59 => format!("{seconds} s ago"),
        60..=3599 => format!("{} min ago", seconds / 60),
        _ => format!("{} h ago", seconds / 3600),
    }
}

fn job_run_time(job: &AnalysisJob) -> Option<Duration> {
    job.completed_at?.duration_since(job.started_at).ok()
}

fn reference_name(reference: &str) -> &str {
    let trimmed = reference.split(['?', '#']).next().unwrap_or(reference);
    trimmed
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(trimmed)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
