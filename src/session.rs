//! Analysis session for one scan.
//!
//! [`ScanSession`] owns the image set, the analysis cache and the single
//! in-flight analysis job. Workers never touch this state; they send
//! [`JobEvent`]s that the frame loop applies through [`ScanSession::poll_events`],
//! so every mutation happens on the UI thread between frames.
//!
//! A finished job always writes under the image index it was started for.
//! Reads always key off the current selection, so a result that lands after
//! the user moved on is stored but only shown once that image is selected
//! again.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::SystemTime;

use crate::cache::{AnalysisCache, CachedAnalysis};
use crate::confidence::ConfidenceBreakdown;
use crate::dispatch::{JobDispatcher, JobEvent, JobRequest};
use crate::error::{ViewerError, ViewerResult};
use crate::image_set::{ImageSet, ScanImage, SelectionChange};
use crate::job::{AnalysisJob, AnalysisKind, AnalysisResult, JobStatus};
use crate::remote::{RemoteImage, RemoteResult};

const JOB_HISTORY_LIMIT: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Cancel a running job instead of failing with `AnalysisBusy`.
    pub force: bool,
}

impl StartOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(Arc<AnalysisResult>),
    Failed(ViewerError),
    Cancelled,
}

/// Returned by [`ScanSession::start_analysis`]; resolves once the job ends.
#[derive(Debug)]
pub struct JobHandle {
    job_id: String,
    outcome: Receiver<JobOutcome>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn try_outcome(&self) -> Option<JobOutcome> {
        self.outcome.try_recv().ok()
    }
}

/// Rendering callbacks the session drives for the current selection.
pub trait ScanRenderer {
    fn show_image(&mut self, image: &ScanImage);
    fn show_output_image(&mut self, reference: &str);
    fn show_confidence(&mut self, breakdown: &ConfidenceBreakdown);
}

struct ActiveJob {
    job: AnalysisJob,
    image_ref: String,
    cancel: Arc<AtomicBool>,
    outcome: Sender<JobOutcome>,
}

pub struct ScanSession {
    scan_id: String,
    images: ImageSet,
    images_loaded: bool,
    cache: AnalysisCache,
    active: Option<ActiveJob>,
    history: VecDeque<AnalysisJob>,
    /// Whether the newest archived job's failure is still on display.
    show_last_failure: bool,
    dispatcher: Box<dyn JobDispatcher>,
    events_tx: Sender<JobEvent>,
    events_rx: Receiver<JobEvent>,
}

impl ScanSession {
    pub fn new(scan_id: impl Into<String>, dispatcher: Box<dyn JobDispatcher>) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            scan_id: scan_id.into(),
            images: ImageSet::default(),
            images_loaded: false,
            cache: AnalysisCache::default(),
            active: None,
            history: VecDeque::new(),
            show_last_failure: false,
            dispatcher,
            events_tx,
            events_rx,
        }
    }

    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    pub fn images(&self) -> &ImageSet {
        &self.images
    }

    pub fn cache(&self) -> &AnalysisCache {
        &self.cache
    }

    pub fn is_loaded(&self) -> bool {
        self.images_loaded
    }

    pub fn selected_index(&self) -> Option<usize> {
        self.images.selected_index()
    }

    pub fn selected_image(&self) -> Option<&ScanImage> {
        self.images.selected()
    }

    /// Error recorded on the most recent job, until dismissed or superseded
    /// by a new start.
    pub fn last_error(&self) -> Option<&ViewerError> {
        self.history
            .back()
            .filter(|_| self.show_last_failure)
            .and_then(|job| job.error.as_ref())
    }

    pub fn clear_error(&mut self) {
        self.show_last_failure = false;
    }

    /// Replaces the image set with a fresh listing from the image store.
    ///
    /// Cached results survive only where the same image is still at the same
    /// index; a running job whose image moved or vanished is cancelled.
    pub fn load_images(&mut self, listing: Vec<RemoteImage>) {
        let previous_selection = self.images.selected_index();
        self.images = ImageSet::from_listing(
            listing
                .into_iter()
                .map(|image| (image.index, image.url))
                .collect(),
        );
        self.images_loaded = true;
        if let Some(previous) = previous_selection {
            let restored = previous.min(self.images.len().saturating_sub(1));
            if !self.images.is_empty() {
                let _ = self.images.select(restored);
            }
        }

        let images = &self.images;
        let dropped = if self.cache.is_empty() {
            0
        } else {
            self.cache.retain(|index, image_ref| {
                images
                    .get(index)
                    .is_some_and(|image| image.reference == image_ref)
            })
        };
        if dropped > 0 {
            log::info!("Dropped {dropped} cached analyses after reloading scan {}", self.scan_id);
        }

        let target_still_valid = self.active.as_ref().map(|active| {
            self.images
                .get(active.job.image_index)
                .is_some_and(|image| image.reference == active.image_ref)
        });
        if target_still_valid == Some(false) {
            self.cancel_active("its image changed on reload");
        }
    }

    /// Records an upload the image store accepted.
    pub fn add_image(&mut self, uploaded: RemoteImage) -> ViewerResult<usize> {
        let index = self.images.add_image(uploaded.url, uploaded.index)?;
        self.images_loaded = true;
        Ok(index)
    }

    /// Index the image store uses for the image at local `index`.
    pub fn remote_index(&self, index: usize) -> ViewerResult<usize> {
        self.images
            .get(index)
            .map(|image| image.remote_index)
            .ok_or(ViewerError::IndexOutOfRange {
                index,
                len: self.images.len(),
            })
    }

    /// Removes an image and re-keys everything indexed by image position in
    /// one step.
    pub fn delete_image(&mut self, index: usize) -> ViewerResult<()> {
        let removed = self.images.delete_image(index)?;
        let purged = self.cache.shift_after_delete(index);
        log::info!(
            "Deleted image {index} ({}) from scan {}; purged {purged} cached analyses, {} left",
            removed.reference,
            self.scan_id,
            self.cache.len()
        );

        let target = self.active.as_ref().map(|active| active.job.image_index);
        match target {
            Some(target) if target == index => {
                self.cancel_active("its image was deleted");
            }
            Some(target) if target > index => {
                if let Some(active) = self.active.as_mut() {
                    active.job.image_index -= 1;
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn select(&mut self, index: usize) -> ViewerResult<SelectionChange> {
        self.images.select(index)
    }

    pub fn select_next(&mut self) -> ViewerResult<SelectionChange> {
        self.images.next()
    }

    pub fn select_previous(&mut self) -> ViewerResult<SelectionChange> {
        self.images.previous()
    }

    pub fn select_first(&mut self) -> ViewerResult<SelectionChange> {
        self.images.first()
    }

    pub fn select_last(&mut self) -> ViewerResult<SelectionChange> {
        self.images.last()
    }

    pub fn start_analysis(
        &mut self,
        image_index: usize,
        kind: AnalysisKind,
        options: StartOptions,
    ) -> ViewerResult<JobHandle> {
        let (image_ref, remote_index) = self
            .images
            .get(image_index)
            .map(|image| (image.reference.clone(), image.remote_index))
            .ok_or(ViewerError::IndexOutOfRange {
                index: image_index,
                len: self.images.len(),
            })?;

        if let Some(active) = self.active.as_ref() {
            if !options.force {
                return Err(ViewerError::AnalysisBusy {
                    job_id: active.job.id.clone(),
                });
            }
            self.cancel_active("a new analysis replaced it");
        }

        let job = AnalysisJob::new(image_index, kind);
        let cancel = Arc::new(AtomicBool::new(false));
        let (outcome_tx, outcome_rx) = mpsc::channel();
        log::info!(
            "Starting {kind} analysis {} for image {image_index} of scan {}",
            job.id,
            self.scan_id
        );

        self.dispatcher.dispatch(
            JobRequest {
                job_id: job.id.clone(),
                scan_id: self.scan_id.clone(),
                image_index,
                remote_index,
                kind,
                cancel: Arc::clone(&cancel),
            },
            self.events_tx.clone(),
        );

        let handle = JobHandle {
            job_id: job.id.clone(),
            outcome: outcome_rx,
        };
        self.show_last_failure = false;
        self.active = Some(ActiveJob {
            job,
            image_ref,
            cancel,
            outcome: outcome_tx,
        });
        Ok(handle)
    }

    /// Re-runs `kind` on the selected image, replacing any running job. The
    /// cached result stays visible until the new one lands.
    pub fn retry_analysis(&mut self, kind: AnalysisKind) -> ViewerResult<JobHandle> {
        let index = self.images.selected_index().ok_or(ViewerError::IndexOutOfRange {
            index: 0,
            len: self.images.len(),
        })?;
        self.start_analysis(index, kind, StartOptions::forced())
    }

    /// Returns the id of the job that was cancelled, if any.
    pub fn cancel_analysis(&mut self) -> Option<String> {
        self.cancel_active("cancelled by user")
    }

    fn cancel_active(&mut self, reason: &str) -> Option<String> {
        let mut active = self.active.take()?;
        active.cancel.store(true, Ordering::Relaxed);
        if let Err(err) = active.job.transition_to(JobStatus::Cancelled) {
            log::error!("Could not cancel analysis job {}: {err}", active.job.id);
        }
        log::info!("Cancelled analysis job {} ({reason})", active.job.id);
        let _ = active.outcome.send(JobOutcome::Cancelled);
        let job_id = active.job.id.clone();
        self.archive(active.job);
        Some(job_id)
    }

    pub fn analysis_by_type(&self, kind: AnalysisKind) -> Option<&CachedAnalysis> {
        let index = self.images.selected_index()?;
        self.cache.get(index, kind)
    }

    pub fn is_analysis_cached(&self, kind: AnalysisKind) -> bool {
        self.images
            .selected_index()
            .is_some_and(|index| self.cache.contains(index, kind))
    }

    pub fn has_completed_analysis(&self) -> bool {
        self.images
            .selected_index()
            .is_some_and(|index| self.cache.has_any_for(index))
    }

    pub fn active_job(&self) -> Option<&AnalysisJob> {
        self.active.as_ref().map(|active| &active.job)
    }

    /// The running job, but only if it targets the selected image.
    pub fn active_job_for_selection(&self) -> Option<&AnalysisJob> {
        let selected = self.images.selected_index()?;
        self.active_job()
            .filter(|job| job.image_index == selected)
    }

    /// Every image reference the session can still ask a renderer to show:
    /// the scan's images plus cached output images.
    pub fn referenced_images(&self) -> HashSet<String> {
        self.images
            .images()
            .iter()
            .map(|image| image.reference.clone())
            .chain(
                self.cache
                    .iter()
                    .filter_map(|entry| entry.result.output_image_ref.clone()),
            )
            .collect()
    }

    pub fn job(&self, job_id: &str) -> Option<&AnalysisJob> {
        self.active_job()
            .filter(|job| job.id == job_id)
            .or_else(|| self.history.iter().find(|job| job.id == job_id))
    }

    pub fn session_ready_for(&self, index: usize) -> bool {
        self.images_loaded && index < self.images.len()
    }

    /// False only while a job for `index` has not been accepted remotely yet
    /// and nothing is cached to show in the meantime.
    pub fn analysis_ready_for(&self, index: usize) -> bool {
        match self.active_job() {
            Some(job) if job.image_index == index && job.status() == JobStatus::Pending => {
                self.cache.has_any_for(index)
            }
            _ => true,
        }
    }

    /// Applies every worker event queued since the last call.
    pub fn poll_events(&mut self) -> usize {
        let mut applied = 0usize;
        loop {
            match self.events_rx.try_recv() {
                Ok(event) => {
                    if self.apply_event(event) {
                        applied += 1;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        applied
    }

    fn apply_event(&mut self, event: JobEvent) -> bool {
        let is_current = self
            .active
            .as_ref()
            .is_some_and(|active| active.job.id == event.job_id());
        if !is_current {
            log::debug!(
                "Discarding event for inactive analysis job {}",
                event.job_id()
            );
            return false;
        }

        let outcome = match event {
            JobEvent::Accepted { remote_id, .. } => {
                if let Some(active) = self.active.as_mut() {
                    active.job.remote_id = Some(remote_id);
                    ensure_processing(&mut active.job);
                }
                return true;
            }
            JobEvent::Progress {
                progress, stage, ..
            } => {
                if let Some(active) = self.active.as_mut() {
                    ensure_processing(&mut active.job);
                    active.job.record_progress(progress, stage);
                }
                return true;
            }
            JobEvent::Completed { result, .. } => self.complete_active(result),
            JobEvent::Failed { error, .. } => self.fail_active(error),
        };

        if let Some(active) = self.active.take() {
            let _ = active.outcome.send(outcome);
            self.archive(active.job);
        }
        true
    }

    fn complete_active(&mut self, remote: RemoteResult) -> JobOutcome {
        let Some(active) = self.active.as_mut() else {
            return JobOutcome::Cancelled;
        };
        ensure_processing(&mut active.job);
        if let Err(err) = active.job.transition_to(JobStatus::Completed) {
            log::error!("Analysis job {} finished out of order: {err}", active.job.id);
            return JobOutcome::Failed(err);
        }

        let result = Arc::new(remote.into_result(active.job.image_index, active.job.kind));
        active.job.result = Some(Arc::clone(&result));
        self.cache.insert(CachedAnalysis {
            result: Arc::clone(&result),
            job_id: active.job.id.clone(),
            image_ref: active.image_ref.clone(),
            stored_at: SystemTime::now(),
        });
        log::info!(
            "Analysis job {} completed for image {} ({})",
            active.job.id,
            active.job.image_index,
            active.job.kind
        );
        JobOutcome::Completed(result)
    }

    fn fail_active(&mut self, error: ViewerError) -> JobOutcome {
        let Some(active) = self.active.as_mut() else {
            return JobOutcome::Cancelled;
        };
        if let Err(err) = active.job.transition_to(JobStatus::Failed) {
            log::error!("Analysis job {} failed out of order: {err}", active.job.id);
        }
        log::warn!("Analysis job {} failed: {error}", active.job.id);
        active.job.error = Some(error.clone());
        self.show_last_failure = true;
        JobOutcome::Failed(error)
    }

    fn archive(&mut self, job: AnalysisJob) {
        if self.history.len() == JOB_HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(job);
    }

    /// Drives `renderer` with the selected image and its cached `kind` result.
    pub fn render(&self, kind: AnalysisKind, renderer: &mut dyn ScanRenderer) {
        let Some(image) = self.images.selected() else {
            return;
        };
        renderer.show_image(image);

        let Some(cached) = self.analysis_by_type(kind) else {
            return;
        };
        if let Some(output) = cached.result.output_image_ref.as_deref() {
            renderer.show_output_image(output);
        }
        renderer.show_confidence(&cached.result.confidence_breakdown());
    }
}

fn ensure_processing(job: &mut AnalysisJob) {
    if job.status() == JobStatus::Pending {
        if let Err(err) = job.transition_to(JobStatus::Processing) {
            log::error!("Analysis job {} could not start processing: {err}", job.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    use serde_json::json;

    use crate::dispatch::tests::{poll, ScriptedService};
    use crate::dispatch::ThreadDispatcher;
    use crate::job::JobStage;

    #[derive(Clone, Default)]
    struct RecordingDispatcher {
        requests: Rc<RefCell<Vec<JobRequest>>>,
    }

    impl JobDispatcher for RecordingDispatcher {
        fn dispatch(&self, request: JobRequest, _events: Sender<JobEvent>) {
            self.requests.borrow_mut().push(request);
        }
    }

    fn session_with(count: usize) -> (ScanSession, RecordingDispatcher) {
        let dispatcher = RecordingDispatcher::default();
        let mut session = ScanSession::new("scan-42", Box::new(dispatcher.clone()));
        session.load_images(
            (0..count)
                .map(|index| RemoteImage {
                    index,
                    url: format!("/media/scan-42/{index}.png"),
                })
                .collect(),
        );
        (session, dispatcher)
    }

    fn send(session: &ScanSession, event: JobEvent) {
        session.events_tx.send(event).expect("session receiver alive");
    }

    fn completed(job_id: &str, case: &str, confidence: f64) -> JobEvent {
        JobEvent::Completed {
            job_id: job_id.to_string(),
            result: RemoteResult {
                confidence: Some(json!(confidence)),
                detected_case: Some(case.to_string()),
                confidence_scores: Some(json!([[case, confidence], ["normal", 1.0 - confidence]])),
                ..RemoteResult::default()
            },
        }
    }

    #[test]
    fn second_start_without_force_is_busy_and_first_result_still_lands() {
        let (mut session, dispatcher) = session_with(2);
        let first = session
            .start_analysis(0, AnalysisKind::Auto, StartOptions::default())
            .expect("first start");

        let err = session
            .start_analysis(0, AnalysisKind::Auto, StartOptions::default())
            .expect_err("second start must be refused");
        assert_eq!(
            err,
            ViewerError::AnalysisBusy {
                job_id: first.job_id().to_string()
            }
        );
        assert_eq!(dispatcher.requests.borrow().len(), 1);

        send(&session, completed(first.job_id(), "glioma", 0.91));
        assert_eq!(session.poll_events(), 1);
        let cached = session
            .analysis_by_type(AnalysisKind::Auto)
            .expect("result cached");
        assert_eq!(cached.job_id, first.job_id());
        assert!(matches!(first.try_outcome(), Some(JobOutcome::Completed(_))));
        assert!(session.active_job().is_none());
    }

    #[test]
    fn late_result_for_deselected_image_is_stored_but_not_shown() {
        let (mut session, dispatcher) = session_with(2);
        session.select(0).expect("select 0");
        let handle = session
            .start_analysis(0, AnalysisKind::Auto, StartOptions::default())
            .expect("start");
        send(
            &session,
            JobEvent::Progress {
                job_id: handle.job_id().to_string(),
                progress: 40,
                stage: Some(JobStage::Processing),
            },
        );
        session.poll_events();

        session.select(1).expect("select 1");
        assert!(session.active_job_for_selection().is_none());

        send(&session, completed(handle.job_id(), "glioma", 0.91));
        session.poll_events();

        assert!(session.cache().contains(0, AnalysisKind::Auto));
        assert!(session.analysis_by_type(AnalysisKind::Auto).is_none());
        assert!(!session.has_completed_analysis());

        session.select(0).expect("select 0 again");
        let cached = session
            .analysis_by_type(AnalysisKind::Auto)
            .expect("visible after reselect");
        assert_eq!(cached.result.confidence, Some(91.0));
        assert_eq!(cached.result.detected_case.as_deref(), Some("glioma"));
        assert_eq!(cached.result.image_index, 0);
        assert_eq!(dispatcher.requests.borrow().len(), 1);
    }

    #[test]
    fn retry_creates_new_job_and_keeps_old_result_until_done() {
        let (mut session, _dispatcher) = session_with(3);
        session.select(2).expect("select");
        let first = session
            .start_analysis(2, AnalysisKind::BrainTumor, StartOptions::default())
            .expect("start");
        send(&session, completed(first.job_id(), "meningioma", 0.7));
        session.poll_events();

        let retry = session
            .retry_analysis(AnalysisKind::BrainTumor)
            .expect("retry");
        assert_ne!(retry.job_id(), first.job_id());
        assert_eq!(
            session
                .analysis_by_type(AnalysisKind::BrainTumor)
                .map(|e| e.job_id.clone()),
            Some(first.job_id().to_string())
        );

        send(
            &session,
            JobEvent::Failed {
                job_id: retry.job_id().to_string(),
                error: ViewerError::AnalysisFailed("gpu out of memory".to_string()),
            },
        );
        session.poll_events();
        assert!(matches!(retry.try_outcome(), Some(JobOutcome::Failed(_))));
        assert_eq!(
            session.last_error(),
            Some(&ViewerError::AnalysisFailed("gpu out of memory".to_string()))
        );
        let kept = session
            .analysis_by_type(AnalysisKind::BrainTumor)
            .expect("previous result kept after failure");
        assert_eq!(kept.job_id, first.job_id());
        assert!(session
            .job(retry.job_id())
            .is_some_and(|job| job.error.is_some()));
        session.clear_error();
        assert_eq!(session.last_error(), None);

        let again = session
            .retry_analysis(AnalysisKind::BrainTumor)
            .expect("retry again");
        assert_eq!(session.last_error(), None);
        send(&session, completed(again.job_id(), "glioma", 0.95));
        session.poll_events();
        let replaced = session
            .analysis_by_type(AnalysisKind::BrainTumor)
            .expect("new result cached");
        assert_eq!(replaced.job_id, again.job_id());
        assert_eq!(
            session.job(first.job_id()).map(|job| job.status()),
            Some(JobStatus::Completed)
        );
        assert_eq!(
            session
                .job(first.job_id())
                .and_then(|job| job.result.as_ref())
                .and_then(|result| result.detected_case.clone())
                .as_deref(),
            Some("meningioma")
        );
    }

    #[test]
    fn cancelled_job_ignores_late_completion() {
        let (mut session, dispatcher) = session_with(1);
        let handle = session
            .start_analysis(0, AnalysisKind::Auto, StartOptions::default())
            .expect("start");
        send(
            &session,
            JobEvent::Accepted {
                job_id: handle.job_id().to_string(),
                remote_id: "remote-9".to_string(),
            },
        );
        session.poll_events();
        assert_eq!(
            session.active_job().map(|job| job.status()),
            Some(JobStatus::Processing)
        );

        assert_eq!(
            session.cancel_analysis().as_deref(),
            Some(handle.job_id())
        );
        assert!(dispatcher.requests.borrow()[0].is_cancelled());
        assert!(matches!(handle.try_outcome(), Some(JobOutcome::Cancelled)));

        let revision = session.cache().revision();
        send(&session, completed(handle.job_id(), "glioma", 0.9));
        assert_eq!(session.poll_events(), 0);
        assert_eq!(session.cache().revision(), revision);
        assert!(session.cache().is_empty());
        assert_eq!(
            session.job(handle.job_id()).map(|job| job.status()),
            Some(JobStatus::Cancelled)
        );
        assert_eq!(session.cancel_analysis(), None);
    }

    #[test]
    fn forced_start_replaces_running_job() {
        let (mut session, dispatcher) = session_with(2);
        let first = session
            .start_analysis(0, AnalysisKind::Auto, StartOptions::default())
            .expect("start");
        let second = session
            .start_analysis(1, AnalysisKind::Alzheimer, StartOptions::forced())
            .expect("forced start");
        assert!(dispatcher.requests.borrow()[0].is_cancelled());
        assert!(!dispatcher.requests.borrow()[1].is_cancelled());

        send(&session, completed(first.job_id(), "glioma", 0.9));
        send(&session, completed(second.job_id(), "mild_demented", 0.6));
        assert_eq!(session.poll_events(), 1);
        assert!(!session.cache().contains(0, AnalysisKind::Auto));
        assert!(session.cache().contains(1, AnalysisKind::Alzheimer));
    }

    #[test]
    fn start_rejects_unknown_image() {
        let (mut session, _dispatcher) = session_with(2);
        assert_eq!(
            session
                .start_analysis(5, AnalysisKind::Auto, StartOptions::default())
                .map(|handle| handle.job_id().to_string()),
            Err(ViewerError::IndexOutOfRange { index: 5, len: 2 })
        );
    }

    #[test]
    fn deleting_an_image_rekeys_cache_and_running_job() {
        let (mut session, _dispatcher) = session_with(4);
        for index in 0..3 {
            let handle = session
                .start_analysis(index, AnalysisKind::Auto, StartOptions::default())
                .expect("start");
            send(&session, completed(handle.job_id(), &format!("case{index}"), 0.5));
            session.poll_events();
        }
        let running = session
            .start_analysis(3, AnalysisKind::Auto, StartOptions::default())
            .expect("start");

        session.delete_image(1).expect("delete");
        assert_eq!(session.images().len(), 3);
        assert!(session.cache().contains(0, AnalysisKind::Auto));
        assert_eq!(
            session
                .cache()
                .get(1, AnalysisKind::Auto)
                .and_then(|e| e.result.detected_case.clone())
                .as_deref(),
            Some("case2")
        );
        assert!(!session.cache().contains(2, AnalysisKind::Auto));
        assert_eq!(session.active_job().map(|job| job.image_index), Some(2));

        send(&session, completed(running.job_id(), "case3", 0.8));
        session.poll_events();
        assert_eq!(
            session
                .cache()
                .get(2, AnalysisKind::Auto)
                .map(|e| e.image_ref.as_str()),
            Some("/media/scan-42/3.png")
        );
    }

    #[test]
    fn deleting_the_target_image_cancels_its_job() {
        let (mut session, _dispatcher) = session_with(2);
        let handle = session
            .start_analysis(1, AnalysisKind::Auto, StartOptions::default())
            .expect("start");
        session.delete_image(1).expect("delete");
        assert!(session.active_job().is_none());
        assert!(matches!(handle.try_outcome(), Some(JobOutcome::Cancelled)));

        assert_eq!(session.delete_image(0), Err(ViewerError::LastImageError));
    }

    #[test]
    fn reload_drops_entries_for_moved_images() {
        let (mut session, _dispatcher) = session_with(2);
        for index in 0..2 {
            let handle = session
                .start_analysis(index, AnalysisKind::Auto, StartOptions::default())
                .expect("start");
            send(&session, completed(handle.job_id(), "glioma", 0.9));
            session.poll_events();
        }

        session.load_images(vec![
            RemoteImage {
                index: 0,
                url: "/media/scan-42/0.png".to_string(),
            },
            RemoteImage {
                index: 1,
                url: "/media/scan-42/replacement.png".to_string(),
            },
        ]);
        assert!(session.cache().contains(0, AnalysisKind::Auto));
        assert!(!session.cache().contains(1, AnalysisKind::Auto));
    }

    #[test]
    fn gapped_listing_keeps_store_indices_for_requests() {
        let dispatcher = RecordingDispatcher::default();
        let mut session = ScanSession::new("scan-42", Box::new(dispatcher.clone()));
        session.load_images(vec![
            RemoteImage {
                index: 5,
                url: "/media/scan-42/b.png".to_string(),
            },
            RemoteImage {
                index: 2,
                url: "/media/scan-42/a.png".to_string(),
            },
        ]);
        assert_eq!(session.remote_index(0), Ok(2));
        assert_eq!(session.remote_index(1), Ok(5));
        assert_eq!(
            session.remote_index(2),
            Err(ViewerError::IndexOutOfRange { index: 2, len: 2 })
        );

        session.select(1).expect("select b");
        let handle = session
            .start_analysis(1, AnalysisKind::Auto, StartOptions::default())
            .expect("start");
        {
            let requests = dispatcher.requests.borrow();
            assert_eq!(requests[0].image_index, 1);
            assert_eq!(requests[0].remote_index, 5);
        }
        send(&session, completed(handle.job_id(), "glioma", 0.9));
        session.poll_events();
        assert_eq!(
            session
                .cache()
                .get(1, AnalysisKind::Auto)
                .map(|e| e.image_ref.as_str()),
            Some("/media/scan-42/b.png")
        );

        let uploaded = session
            .add_image(RemoteImage {
                index: 8,
                url: "/media/scan-42/c.png".to_string(),
            })
            .expect("upload recorded");
        assert_eq!(uploaded, 2);
        assert_eq!(session.remote_index(2), Ok(8));

        session.delete_image(0).expect("delete a");
        assert_eq!(session.remote_index(0), Ok(5));
        assert_eq!(session.remote_index(1), Ok(8));
        assert!(session.cache().contains(0, AnalysisKind::Auto));
    }

    #[test]
    fn readiness_signals_follow_job_state() {
        let (mut session, _dispatcher) = session_with(2);
        assert!(session.session_ready_for(1));
        assert!(!session.session_ready_for(2));

        let handle = session
            .start_analysis(1, AnalysisKind::Auto, StartOptions::default())
            .expect("start");
        assert!(!session.analysis_ready_for(1));
        assert!(session.analysis_ready_for(0));

        send(
            &session,
            JobEvent::Accepted {
                job_id: handle.job_id().to_string(),
                remote_id: "remote-1".to_string(),
            },
        );
        session.poll_events();
        assert!(session.analysis_ready_for(1));
    }

    #[derive(Default)]
    struct Recorded {
        image: Option<String>,
        output: Option<String>,
        labels: Vec<String>,
        predicted: Option<String>,
    }

    impl ScanRenderer for Recorded {
        fn show_image(&mut self, image: &ScanImage) {
            self.image = Some(image.reference.clone());
        }

        fn show_output_image(&mut self, reference: &str) {
            self.output = Some(reference.to_string());
        }

        fn show_confidence(&mut self, breakdown: &ConfidenceBreakdown) {
            self.labels = breakdown.entries.iter().map(|e| e.label.clone()).collect();
            self.predicted = breakdown.predicted_entry().map(|e| e.label.clone());
        }
    }

    #[test]
    fn render_uses_current_selection_only() {
        let (mut session, _dispatcher) = session_with(2);
        let handle = session
            .start_analysis(0, AnalysisKind::MriToCt, StartOptions::default())
            .expect("start");
        send(
            &session,
            JobEvent::Completed {
                job_id: handle.job_id().to_string(),
                result: RemoteResult {
                    output_image: Some("/media/scan-42/0-ct.png".to_string()),
                    detected_case: Some("normal".to_string()),
                    confidence_scores: Some(json!({"normal": 0.8, "abnormal": 0.2})),
                    ..RemoteResult::default()
                },
            },
        );
        session.poll_events();

        let mut on_first = Recorded::default();
        session.render(AnalysisKind::MriToCt, &mut on_first);
        assert_eq!(on_first.image.as_deref(), Some("/media/scan-42/0.png"));
        assert_eq!(on_first.output.as_deref(), Some("/media/scan-42/0-ct.png"));
        assert_eq!(on_first.labels, vec!["normal", "abnormal"]);
        assert_eq!(on_first.predicted.as_deref(), Some("normal"));

        session.select(1).expect("select");
        let mut on_second = Recorded::default();
        session.render(AnalysisKind::MriToCt, &mut on_second);
        assert_eq!(on_second.image.as_deref(), Some("/media/scan-42/1.png"));
        assert!(on_second.output.is_none());
        assert!(on_second.labels.is_empty());
    }

    #[test]
    fn referenced_images_follow_deletes_and_outputs() {
        let (mut session, _dispatcher) = session_with(3);
        let handle = session
            .start_analysis(2, AnalysisKind::CtToMri, StartOptions::default())
            .expect("start");
        send(
            &session,
            JobEvent::Completed {
                job_id: handle.job_id().to_string(),
                result: RemoteResult {
                    output_image: Some("/media/scan-42/2-mri.png".to_string()),
                    ..RemoteResult::default()
                },
            },
        );
        session.poll_events();

        let referenced = session.referenced_images();
        assert_eq!(referenced.len(), 4);
        assert!(referenced.contains("/media/scan-42/2-mri.png"));

        session.delete_image(1).expect("delete");
        let referenced = session.referenced_images();
        assert!(!referenced.contains("/media/scan-42/1.png"));
        assert!(referenced.contains("/media/scan-42/2.png"));
        assert!(referenced.contains("/media/scan-42/2-mri.png"));

        session.delete_image(1).expect("delete analysed image");
        let referenced = session.referenced_images();
        assert_eq!(
            referenced,
            HashSet::from(["/media/scan-42/0.png".to_string()])
        );
    }

    #[test]
    fn threaded_job_completes_through_polling() {
        let mut done = poll(JobStatus::Completed, 1.0, Some(JobStage::Completed));
        done.result = Some(RemoteResult {
            confidence: Some(json!(91)),
            detected_case: Some("glioma".to_string()),
            ..RemoteResult::default()
        });
        let service = Arc::new(ScriptedService::with_polls(vec![
            Ok(poll(JobStatus::Processing, 0.5, Some(JobStage::Processing))),
            Ok(done),
        ]));
        let dispatcher = ThreadDispatcher::new(service.clone(), Duration::ZERO, 3);
        let mut session = ScanSession::new("scan-42", Box::new(dispatcher));
        session.load_images(vec![
            RemoteImage {
                index: 0,
                url: "0.png".to_string(),
            },
            RemoteImage {
                index: 1,
                url: "1.png".to_string(),
            },
        ]);

        let handle = session
            .start_analysis(0, AnalysisKind::Auto, StartOptions::default())
            .expect("start");
        session.select(1).expect("navigate away");

        let deadline = Instant::now() + Duration::from_secs(5);
        while session.active_job().is_some() && Instant::now() < deadline {
            session.poll_events();
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(matches!(
            handle.try_outcome(),
            Some(JobOutcome::Completed(_))
        ));
        assert!(session.analysis_by_type(AnalysisKind::Auto).is_none());
        session.select(0).expect("back to first image");
        let cached = session
            .analysis_by_type(AnalysisKind::Auto)
            .expect("cached result");
        assert_eq!(cached.result.confidence, Some(91.0));
        assert_eq!(cached.result.detected_case.as_deref(), Some("glioma"));
        assert_eq!(
            service.starts.lock().expect("lock").as_slice(),
            &[(0, AnalysisKind::Auto)]
        );
    }
}
