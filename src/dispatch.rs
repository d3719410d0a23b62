use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::ViewerError;
use crate::job::{AnalysisKind, JobStage, JobStatus};
use crate::remote::{AnalysisService, RemoteResult};

const CANCEL_CHECK_SLICE: Duration = Duration::from_millis(50);

/// Everything a worker needs to run one analysis job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_id: String,
    pub scan_id: String,
    /// Local position, used for logging only.
    pub image_index: usize,
    /// The image store's index, sent to the analysis service.
    pub remote_index: usize,
    pub kind: AnalysisKind,
    pub cancel: Arc<AtomicBool>,
}

impl JobRequest {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Worker to session messages, always tagged with the local job id.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Accepted {
        job_id: String,
        remote_id: String,
    },
    Progress {
        job_id: String,
        progress: u8,
        stage: Option<JobStage>,
    },
    Completed {
        job_id: String,
        result: RemoteResult,
    },
    Failed {
        job_id: String,
        error: ViewerError,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Accepted { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. } => job_id,
        }
    }
}

/// Runs analysis jobs off the frame loop and reports back through `events`.
pub trait JobDispatcher {
    fn dispatch(&self, request: JobRequest, events: Sender<JobEvent>);
}

pub struct ThreadDispatcher {
    service: Arc<dyn AnalysisService>,
    poll_interval: Duration,
    max_poll_failures: u32,
}

impl ThreadDispatcher {
    pub fn new(
        service: Arc<dyn AnalysisService>,
        poll_interval: Duration,
        max_poll_failures: u32,
    ) -> Self {
        Self {
            service,
            poll_interval,
            max_poll_failures,
        }
    }
}

impl JobDispatcher for ThreadDispatcher {
    fn dispatch(&self, request: JobRequest, events: Sender<JobEvent>) {
        let service = Arc::clone(&self.service);
        let poll_interval = self.poll_interval;
        let max_poll_failures = self.max_poll_failures;
        thread::spawn(move || {
            run_job(
                service.as_ref(),
                &request,
                poll_interval,
                max_poll_failures,
                &events,
            );
        });
    }
}

/// Starts the remote job and polls it until it finishes, fails, or the local
/// job is cancelled. Cancellation only stops the polling; the remote job may
/// keep running.
pub fn run_job(
    service: &dyn AnalysisService,
    request: &JobRequest,
    poll_interval: Duration,
    max_poll_failures: u32,
    events: &Sender<JobEvent>,
) {
    if request.is_cancelled() {
        return;
    }

    let job_id = request.job_id.clone();
    let remote_id =
        match service.start_analysis(&request.scan_id, request.remote_index, request.kind) {
            Ok(remote_id) => remote_id,
            Err(error) => {
                log::warn!("Analysis job {job_id} could not start: {error}");
                let _ = events.send(JobEvent::Failed { job_id, error });
                return;
            }
        };
    log::debug!(
        "Analysis job {job_id} for image {} accepted as remote job {remote_id}",
        request.image_index
    );
    if events
        .send(JobEvent::Accepted {
            job_id: job_id.clone(),
            remote_id: remote_id.clone(),
        })
        .is_err()
    {
        return;
    }

    let mut last_progress = None::<(u8, Option<JobStage>)>;
    // Once a job reports progress above 1 it is on a 0-100 scale for good.
    let mut percent_scale = false;
    let mut consecutive_failures = 0u32;
    loop {
        if !sleep_unless_cancelled(poll_interval, &request.cancel) {
            log::debug!("Stopped polling cancelled analysis job {job_id}");
            return;
        }

        let poll = match service.poll_job(&remote_id) {
            Ok(poll) => {
                consecutive_failures = 0;
                poll
            }
            Err(error) => {
                consecutive_failures += 1;
                log::warn!(
                    "Polling analysis job {job_id} failed ({consecutive_failures}/{max_poll_failures}): {error}"
                );
                if consecutive_failures >= max_poll_failures.max(1) {
                    let _ = events.send(JobEvent::Failed { job_id, error });
                    return;
                }
                continue;
            }
        };

        if request.is_cancelled() {
            return;
        }

        let event = match poll.status {
            JobStatus::Completed => JobEvent::Completed {
                job_id: job_id.clone(),
                result: poll.result.unwrap_or_default(),
            },
            JobStatus::Failed | JobStatus::Cancelled => {
                let reason = poll.error.clone().unwrap_or_else(|| {
                    format!("analysis service reported the job as {}", poll.status)
                });
                JobEvent::Failed {
                    job_id: job_id.clone(),
                    error: ViewerError::AnalysisFailed(reason),
                }
            }
            JobStatus::Pending | JobStatus::Processing => {
                percent_scale |= poll.reports_percent_scale();
                let snapshot = (poll.percent(percent_scale), poll.stage);
                if last_progress == Some(snapshot) {
                    continue;
                }
                last_progress = Some(snapshot);
                JobEvent::Progress {
                    job_id: job_id.clone(),
                    progress: snapshot.0,
                    stage: snapshot.1,
                }
            }
        };

        let finished = matches!(
            event,
            JobEvent::Completed { .. } | JobEvent::Failed { .. }
        );
        if events.send(event).is_err() || finished {
            return;
        }
    }
}

/// Returns `false` when the flag was raised before the interval elapsed.
fn sleep_unless_cancelled(interval: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + interval;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_CHECK_SLICE));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::mpsc;
    use std::sync::Mutex;

    use crate::error::ViewerResult;
    use crate::remote::JobPoll;

    pub(crate) fn poll(status: JobStatus, progress: f64, stage: Option<JobStage>) -> JobPoll {
        JobPoll {
            status,
            progress: Some(progress),
            stage,
            result: None,
            error: None,
        }
    }

    /// Scripted analysis service; every start returns `remote-N`.
    #[derive(Default)]
    pub(crate) struct ScriptedService {
        pub start_error: Mutex<Option<ViewerError>>,
        pub polls: Mutex<VecDeque<ViewerResult<JobPoll>>>,
        pub starts: Mutex<Vec<(usize, AnalysisKind)>>,
        pub cancel_on_poll: Mutex<Option<Arc<AtomicBool>>>,
    }

    impl ScriptedService {
        pub(crate) fn with_polls(polls: Vec<ViewerResult<JobPoll>>) -> Self {
            Self {
                polls: Mutex::new(polls.into()),
                ..Self::default()
            }
        }
    }

    impl AnalysisService for ScriptedService {
        fn start_analysis(
            &self,
            _scan_id: &str,
            image_index: usize,
            kind: AnalysisKind,
        ) -> ViewerResult<String> {
            if let Some(error) = self.start_error.lock().expect("lock").take() {
                return Err(error);
            }
            let mut starts = self.starts.lock().expect("lock");
            starts.push((image_index, kind));
            Ok(format!("remote-{}", starts.len()))
        }

        fn poll_job(&self, _job_id: &str) -> ViewerResult<JobPoll> {
            if let Some(flag) = self.cancel_on_poll.lock().expect("lock").as_ref() {
                flag.store(true, Ordering::Relaxed);
            }
            self.polls
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Ok(poll(JobStatus::Processing, 0.0, None)))
        }
    }

    fn request() -> JobRequest {
        JobRequest {
            job_id: "local-1".to_string(),
            scan_id: "scan-7".to_string(),
            image_index: 0,
            remote_index: 3,
            kind: AnalysisKind::Auto,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    fn collect(service: &ScriptedService, request: &JobRequest, max_failures: u32) -> Vec<JobEvent> {
        let (tx, rx) = mpsc::channel();
        run_job(service, request, Duration::ZERO, max_failures, &tx);
        drop(tx);
        rx.iter().collect()
    }

    #[test]
    fn reports_progress_then_completion() {
        let mut done = poll(JobStatus::Completed, 1.0, Some(JobStage::Completed));
        done.result = Some(RemoteResult {
            detected_case: Some("glioma".to_string()),
            ..RemoteResult::default()
        });
        let service = ScriptedService::with_polls(vec![
            Ok(poll(JobStatus::Processing, 0.3, Some(JobStage::Processing))),
            Ok(poll(JobStatus::Processing, 0.3, Some(JobStage::Processing))),
            Err(ViewerError::RemoteUnavailable("timeout".to_string())),
            Ok(poll(JobStatus::Processing, 80.0, Some(JobStage::GeneratingReport))),
            Ok(done),
        ]);

        let events = collect(&service, &request(), 3);
        assert_eq!(events.len(), 4);
        assert!(matches!(
            &events[0],
            JobEvent::Accepted { remote_id, .. } if remote_id == "remote-1"
        ));
        assert!(matches!(events[1], JobEvent::Progress { progress: 30, .. }));
        assert!(matches!(
            events[2],
            JobEvent::Progress {
                progress: 80,
                stage: Some(JobStage::GeneratingReport),
                ..
            }
        ));
        assert!(matches!(
            &events[3],
            JobEvent::Completed { result, .. } if result.detected_case.as_deref() == Some("glioma")
        ));
        assert!(events.iter().all(|event| event.job_id() == "local-1"));
        assert_eq!(
            service.starts.lock().expect("lock").as_slice(),
            &[(3, AnalysisKind::Auto)]
        );
    }

    #[test]
    fn percent_scale_sticks_after_first_large_value() {
        let service = ScriptedService::with_polls(vec![
            Ok(poll(JobStatus::Processing, 0.5, None)),
            Ok(poll(JobStatus::Processing, 40.0, None)),
            Ok(poll(JobStatus::Processing, 1.0, Some(JobStage::GeneratingReport))),
            Ok(poll(JobStatus::Failed, 1.0, None)),
        ]);

        let events = collect(&service, &request(), 3);
        let progress = events
            .iter()
            .filter_map(|event| match event {
                JobEvent::Progress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(progress, vec![50, 40, 1]);
    }

    #[test]
    fn start_failure_is_reported() {
        let service = ScriptedService::default();
        *service.start_error.lock().expect("lock") =
            Some(ViewerError::RemoteUnavailable("connection refused".to_string()));

        let events = collect(&service, &request(), 3);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            JobEvent::Failed {
                error: ViewerError::RemoteUnavailable(_),
                ..
            }
        ));
    }

    #[test]
    fn repeated_poll_failures_fail_the_job() {
        let unavailable = || Err(ViewerError::RemoteUnavailable("503".to_string()));
        let service = ScriptedService::with_polls(vec![unavailable(), unavailable()]);

        let events = collect(&service, &request(), 2);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], JobEvent::Failed { .. }));
    }

    #[test]
    fn server_side_failure_becomes_analysis_failed() {
        let mut failed = poll(JobStatus::Failed, 0.5, None);
        failed.error = Some("model crashed".to_string());
        let service = ScriptedService::with_polls(vec![Ok(failed)]);

        let events = collect(&service, &request(), 3);
        assert!(matches!(
            &events[1],
            JobEvent::Failed { error: ViewerError::AnalysisFailed(reason), .. } if reason == "model crashed"
        ));
    }

    #[test]
    fn cancellation_stops_polling_silently() {
        let request = request();
        let service = ScriptedService::with_polls(vec![Ok(poll(
            JobStatus::Completed,
            1.0,
            None,
        ))]);
        *service.cancel_on_poll.lock().expect("lock") = Some(Arc::clone(&request.cancel));

        let events = collect(&service, &request, 3);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], JobEvent::Accepted { .. }));

        request.cancel.store(true, Ordering::Relaxed);
        let service = ScriptedService::default();
        assert!(collect(&service, &request, 3).is_empty());
        assert!(service.starts.lock().expect("lock").is_empty());
    }
}
