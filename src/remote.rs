use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::{multipart, Client, RequestBuilder, Response};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::config::Settings;
use crate::confidence;
use crate::error::{ViewerError, ViewerResult};
use crate::job::{AnalysisKind, AnalysisResult, JobStage, JobStatus};

const UPLOAD_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "dcm", "dicom"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteImage {
    pub index: usize,
    pub url: String,
}

/// One poll of a remote analysis job.
#[derive(Debug, Clone, Deserialize)]
pub struct JobPoll {
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub stage: Option<JobStage>,
    #[serde(default)]
    pub result: Option<RemoteResult>,
    #[serde(default)]
    pub error: Option<String>,
}

impl JobPoll {
    /// Progress as 0-100. Services report either a fraction or a percentage,
    /// so a value at or below 1 reads as a fraction unless `percent_scale`
    /// is set because the same job already reported a value above 1.
    pub fn percent(&self, percent_scale: bool) -> u8 {
        let Some(progress) = self.progress.filter(|value| value.is_finite()) else {
            return 0;
        };
        let percent = if percent_scale {
            progress.clamp(0.0, 100.0) as f32
        } else {
            confidence::percentage_from_number(progress)
        };
        percent.round() as u8
    }

    pub fn reports_percent_scale(&self) -> bool {
        self.progress.is_some_and(|value| value > 1.0)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteResult {
    #[serde(default)]
    pub confidence: Option<serde_json::Value>,
    #[serde(default, alias = "detectedCase", alias = "prediction")]
    pub detected_case: Option<String>,
    #[serde(default)]
    pub findings: Option<String>,
    #[serde(default, alias = "medicalNote")]
    pub medical_note: Option<String>,
    #[serde(
        default,
        alias = "confidenceScores",
        alias = "raw_confidence_scores",
        alias = "rawConfidenceScores"
    )]
    pub confidence_scores: Option<serde_json::Value>,
    #[serde(
        default,
        alias = "outputImage",
        alias = "output_image_url",
        alias = "outputImageUrl"
    )]
    pub output_image: Option<String>,
}

impl RemoteResult {
    pub fn into_result(self, image_index: usize, kind: AnalysisKind) -> AnalysisResult {
        let confidence = self
            .confidence
            .as_ref()
            .filter(|value| !value.is_null())
            .map(confidence::coerce_percentage);
        AnalysisResult {
            image_index,
            kind,
            confidence,
            detected_case: non_empty(self.detected_case),
            findings: non_empty(self.findings),
            medical_note: non_empty(self.medical_note),
            raw_confidence_scores: self.confidence_scores.map(confidence::decode_embedded),
            output_image_ref: non_empty(self.output_image),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}

/// Remote storage for a scan's images.
pub trait ImageStore: Send + Sync {
    fn list_images(&self, scan_id: &str) -> ViewerResult<Vec<RemoteImage>>;
    fn upload_image(&self, scan_id: &str, file: &Path) -> ViewerResult<RemoteImage>;
    fn delete_image(&self, scan_id: &str, index: usize) -> ViewerResult<()>;
    fn fetch_image(&self, reference: &str) -> ViewerResult<Vec<u8>>;
}

/// Remote AI analysis invocation and status.
pub trait AnalysisService: Send + Sync {
    fn start_analysis(
        &self,
        scan_id: &str,
        image_index: usize,
        kind: AnalysisKind,
    ) -> ViewerResult<String>;
    fn poll_job(&self, job_id: &str) -> ViewerResult<JobPoll>;
}

/// HTTP binding of both services against one API base URL.
pub struct HttpScanService {
    client: Client,
    base: String,
    api_token: Option<String>,
    max_upload_bytes: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ImageListing {
    Bare(Vec<RemoteImage>),
    Wrapped { images: Vec<RemoteImage> },
}

#[derive(Deserialize)]
struct StartedJob {
    #[serde(alias = "id", alias = "jobId")]
    job_id: String,
}

impl HttpScanService {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("Could not initialize HTTP client for the scan service")?;
        Ok(Self {
            client,
            base: normalize_base_url(&settings.server_url),
            api_token: settings.api_token.clone(),
            max_upload_bytes: settings.max_upload_bytes,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.api_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn resolve(&self, reference: &str) -> String {
        resolve_reference(&self.base, reference)
    }

    fn send(&self, request: RequestBuilder, url: &str) -> Result<Response, ViewerError> {
        let response = self
            .authorized(request)
            .send()
            .with_context(|| format!("HTTP request failed for {url}"))
            .map_err(remote_unavailable)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let detail = response
            .text()
            .unwrap_or_else(|_| String::from("unable to read error body"));
        log::warn!("HTTP {status} for {url}: {detail}");
        Err(match status {
            StatusCode::NOT_FOUND => ViewerError::NotFound(format!("{url}: {detail}")),
            _ => ViewerError::RemoteUnavailable(format!("HTTP {status} for {url}: {detail}")),
        })
    }
}

impl ImageStore for HttpScanService {
    fn list_images(&self, scan_id: &str) -> ViewerResult<Vec<RemoteImage>> {
        let url = format!("{}/scans/{scan_id}/images", self.base);
        let response = self.send(
            self.client.get(&url).header(ACCEPT, "application/json"),
            &url,
        )?;
        let listing = response
            .json::<ImageListing>()
            .with_context(|| format!("Could not decode image listing from {url}"))
            .map_err(remote_unavailable)?;
        Ok(match listing {
            ImageListing::Bare(images) | ImageListing::Wrapped { images } => images,
        })
    }

    fn upload_image(&self, scan_id: &str, file: &Path) -> ViewerResult<RemoteImage> {
        validate_upload(file, self.max_upload_bytes)?;
        let url = format!("{}/scans/{scan_id}/images", self.base);
        let form = multipart::Form::new()
            .file("file", file)
            .map_err(|err| {
                ViewerError::UploadRejected(format!("could not read {}: {err}", file.display()))
            })?;

        let response = self
            .authorized(self.client.post(&url).multipart(form))
            .send()
            .with_context(|| format!("Upload request failed for {url}"))
            .map_err(remote_unavailable)?;
        let status = response.status();
        if matches!(
            status,
            StatusCode::BAD_REQUEST
                | StatusCode::PAYLOAD_TOO_LARGE
                | StatusCode::UNSUPPORTED_MEDIA_TYPE
                | StatusCode::UNPROCESSABLE_ENTITY
        ) {
            let detail = response
                .text()
                .unwrap_or_else(|_| String::from("no reason given"));
            return Err(ViewerError::UploadRejected(detail));
        }
        if !status.is_success() {
            return Err(ViewerError::RemoteUnavailable(format!(
                "HTTP {status} for {url}"
            )));
        }
        response
            .json::<RemoteImage>()
            .with_context(|| format!("Could not decode upload response from {url}"))
            .map_err(remote_unavailable)
    }

    fn delete_image(&self, scan_id: &str, index: usize) -> ViewerResult<()> {
        let url = format!("{}/scans/{scan_id}/images/{index}", self.base);
        self.send(self.client.delete(&url), &url)?;
        Ok(())
    }

    fn fetch_image(&self, reference: &str) -> ViewerResult<Vec<u8>> {
        let url = self.resolve(reference);
        let response = self.send(self.client.get(&url), &url)?;
        response
            .bytes()
            .map(|body| body.to_vec())
            .with_context(|| format!("Could not read response body from {url}"))
            .map_err(remote_unavailable)
    }
}

impl AnalysisService for HttpScanService {
    fn start_analysis(
        &self,
        scan_id: &str,
        image_index: usize,
        kind: AnalysisKind,
    ) -> ViewerResult<String> {
        let url = format!("{}/scans/{scan_id}/analyses", self.base);
        let body = serde_json::json!({ "image_index": image_index, "kind": kind });
        let response = self.send(self.client.post(&url).json(&body), &url)?;
        let started = response
            .json::<StartedJob>()
            .with_context(|| format!("Could not decode analysis job id from {url}"))
            .map_err(remote_unavailable)?;
        Ok(started.job_id)
    }

    fn poll_job(&self, job_id: &str) -> ViewerResult<JobPoll> {
        let url = format!("{}/analyses/{job_id}", self.base);
        let response = self.send(
            self.client.get(&url).header(ACCEPT, "application/json"),
            &url,
        )?;
        response
            .json::<JobPoll>()
            .with_context(|| format!("Could not decode job status from {url}"))
            .map_err(remote_unavailable)
    }
}

fn remote_unavailable(err: anyhow::Error) -> ViewerError {
    ViewerError::RemoteUnavailable(format!("{err:#}"))
}

pub fn validate_upload(file: &Path, max_bytes: u64) -> ViewerResult<()> {
    check_upload(file, max_bytes).map_err(|err| ViewerError::UploadRejected(format!("{err:#}")))
}

fn check_upload(file: &Path, max_bytes: u64) -> Result<()> {
    let extension = file
        .extension()
        .and_then(|value| value.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !UPLOAD_EXTENSIONS.contains(&extension.as_str()) {
        bail!(
            "{} is not a supported image type (expected one of {})",
            file.display(),
            UPLOAD_EXTENSIONS.join(", ")
        );
    }

    let size = std::fs::metadata(file)
        .with_context(|| format!("Could not read {}", file.display()))?
        .len();
    if size == 0 {
        bail!("{} is empty", file.display());
    }
    if size > max_bytes {
        bail!(
            "{} is {size} bytes; the limit is {max_bytes} bytes",
            file.display()
        );
    }
    Ok(())
}

pub fn normalize_base_url(base_url: &str) -> String {
    let trimmed = strip_query_and_fragment(base_url.trim())
        .trim()
        .trim_end_matches('/');
    trimmed.to_string()
}

fn strip_query_and_fragment(value: &str) -> &str {
    let query_index = value.find('?').unwrap_or(value.len());
    let fragment_index = value.find('#').unwrap_or(value.len());
    &value[..query_index.min(fragment_index)]
}

/// Absolute references are used as-is; anything else is joined onto `base`.
pub fn resolve_reference(base: &str, reference: &str) -> String {
    let reference = reference.trim();
    if reference.contains("://") {
        return reference.to_string();
    }
    if reference.starts_with('/') {
        if let Some(origin) = origin_of(base) {
            return format!("{origin}{reference}");
        }
    }
    format!("{base}/{}", reference.trim_start_matches('/'))
}

fn origin_of(url: &str) -> Option<&str> {
    let scheme_end = url.find("://")? + 3;
    let path_start = url[scheme_end..]
        .find('/')
        .map(|index| scheme_end + index)
        .unwrap_or(url.len());
    Some(&url[..path_start])
}
