//! Remote spreadsheet mirror
//!
//! Best-effort replica of the durable log for live dashboards. Rows are
//! handed to a single background worker over a channel, so the tick path
//! never waits on the network and delivered rows keep their relative order.
//! The worker provisions the spreadsheet on the first row; if that fails the
//! mirror disables itself for the rest of the run.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::SinkError;
use crate::models::ObservationRecord;
use crate::recording::RecordSink;

pub const ACCESS_TOKEN_ENV: &str = "GOOGLE_SHEETS_ACCESS_TOKEN";

const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const DRIVE_FILES_API: &str = "https://www.googleapis.com/drive/v3/files";
const SPREADSHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";

/// Upper bound on draining queued rows at shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Rows waiting for delivery before new ones are dropped
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Remote spreadsheet operations used by the mirror
#[async_trait]
pub trait SheetBackend: Send + Sync {
    /// Locate the named sheet, creating it if absent. Returns a shareable URL.
    async fn open_sheet(&self, sheet_name: &str) -> Result<String, SinkError>;

    /// Row 1 of the opened sheet; empty for a fresh sheet
    async fn read_header(&self) -> Result<Vec<String>, SinkError>;

    async fn append_row(&self, row: &[String]) -> Result<(), SinkError>;
}

/// Open the sheet and make sure row 1 is `header`. A fresh sheet gets the
/// header written; a sheet with any other first row is rejected.
pub async fn provision(
    backend: &dyn SheetBackend,
    sheet_name: &str,
    header: &[String],
) -> Result<String, SinkError> {
    let url = backend.open_sheet(sheet_name).await?;
    let found = backend.read_header().await?;

    if found.is_empty() {
        backend.append_row(header).await?;
    } else if found != header {
        return Err(SinkError::HeaderMismatch {
            found,
            expected: header.to_vec(),
        });
    }
    Ok(url)
}

/// Google Sheets v4 / Drive v3 over REST with a bearer token
pub struct GoogleSheetsBackend {
    client: Client,
    access_token: String,
    share_publicly: bool,
    spreadsheet_id: Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedSpreadsheet {
    spreadsheet_id: String,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

impl GoogleSheetsBackend {
    pub fn new(access_token: String, share_publicly: bool) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(remote)?;

        Ok(Self {
            client,
            access_token,
            share_publicly,
            spreadsheet_id: Mutex::new(None),
        })
    }

    /// Build from `GOOGLE_SHEETS_ACCESS_TOKEN`; `None` when the variable is unset.
    pub fn from_env(share_publicly: bool) -> Option<Result<Self, SinkError>> {
        std::env::var(ACCESS_TOKEN_ENV)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .map(|token| Self::new(token, share_publicly))
    }

    async fn find_spreadsheet(&self, name: &str) -> Result<Option<String>, SinkError> {
        let query = format!(
            "name = '{}' and mimeType = '{}' and trashed = false",
            name.replace('\'', "\\'"),
            SPREADSHEET_MIME
        );
        let response = self
            .client
            .get(DRIVE_FILES_API)
            .bearer_auth(&self.access_token)
            .query(&[("q", query.as_str()), ("fields", "files(id)")])
            .send()
            .await
            .map_err(remote)?;
        let list: DriveFileList = check(response).await?.json().await.map_err(remote)?;
        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    async fn create_spreadsheet(&self, name: &str) -> Result<String, SinkError> {
        let response = self
            .client
            .post(SHEETS_API)
            .bearer_auth(&self.access_token)
            .json(&json!({ "properties": { "title": name } }))
            .send()
            .await
            .map_err(remote)?;
        let created: CreatedSpreadsheet = check(response).await?.json().await.map_err(remote)?;

        if self.share_publicly {
            let response = self
                .client
                .post(format!("{}/{}/permissions", DRIVE_FILES_API, created.spreadsheet_id))
                .bearer_auth(&self.access_token)
                .json(&json!({ "type": "anyone", "role": "reader" }))
                .send()
                .await
                .map_err(remote)?;
            if let Err(e) = check(response).await {
                warn!("Could not share spreadsheet publicly: {}", e);
            }
        }

        Ok(created.spreadsheet_id)
    }

    fn opened_id(&self) -> Result<String, SinkError> {
        self.spreadsheet_id
            .lock()
            .clone()
            .ok_or_else(|| SinkError::Remote("spreadsheet not opened".into()))
    }

    async fn first_row(&self, id: &str) -> Result<Vec<String>, SinkError> {
        let response = self
            .client
            .get(format!("{}/{}/values/A1:1", SHEETS_API, id))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(remote)?;
        let range: ValueRange = check(response).await?.json().await.map_err(remote)?;
        Ok(range.values.into_iter().next().unwrap_or_default())
    }

    async fn append_to(&self, id: &str, row: &[String]) -> Result<(), SinkError> {
        let response = self
            .client
            .post(format!("{}/{}/values/A1:append", SHEETS_API, id))
            .bearer_auth(&self.access_token)
            .query(&[("valueInputOption", "RAW"), ("insertDataOption", "INSERT_ROWS")])
            .json(&json!({ "values": [row] }))
            .send()
            .await
            .map_err(remote)?;
        check(response).await.map(|_| ())
    }
}

#[async_trait]
impl SheetBackend for GoogleSheetsBackend {
    async fn open_sheet(&self, sheet_name: &str) -> Result<String, SinkError> {
        let id = match self.find_spreadsheet(sheet_name).await? {
            Some(id) => id,
            None => {
                info!("Creating spreadsheet '{}'", sheet_name);
                self.create_spreadsheet(sheet_name).await?
            }
        };

        let url = format!("https://docs.google.com/spreadsheets/d/{}", id);
        *self.spreadsheet_id.lock() = Some(id);
        Ok(url)
    }

    async fn read_header(&self) -> Result<Vec<String>, SinkError> {
        let id = self.opened_id()?;
        self.first_row(&id).await
    }

    async fn append_row(&self, row: &[String]) -> Result<(), SinkError> {
        let id = self.opened_id()?;
        self.append_to(&id, row).await
    }
}

fn remote(e: reqwest::Error) -> SinkError {
    SinkError::Remote(e.to_string())
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, SinkError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SinkError::Remote(format!("HTTP {}: {}", status, body)))
}

#[derive(Default)]
struct MirrorState {
    enabled: AtomicBool,
    url: Mutex<Option<String>>,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Mirror sink backed by a background delivery worker
pub struct RemoteMirrorSink {
    sheet_name: String,
    state: Arc<MirrorState>,
    tx: Mutex<Option<mpsc::Sender<Vec<String>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteMirrorSink {
    /// Start the delivery worker. Must be called inside a tokio runtime.
    pub fn spawn(backend: Arc<dyn SheetBackend>, sheet_name: &str, header: Vec<String>) -> Self {
        Self::with_capacity(backend, sheet_name, header, DEFAULT_QUEUE_CAPACITY)
    }

    /// As `spawn`, with at most `capacity` rows waiting for delivery
    pub fn with_capacity(
        backend: Arc<dyn SheetBackend>,
        sheet_name: &str,
        header: Vec<String>,
        capacity: usize,
    ) -> Self {
        let state = Arc::new(MirrorState {
            enabled: AtomicBool::new(true),
            ..Default::default()
        });
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(deliver(
            backend,
            sheet_name.to_string(),
            header,
            rx,
            Arc::clone(&state),
        ));

        Self {
            sheet_name: sheet_name.to_string(),
            state,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn url(&self) -> Option<String> {
        self.state.url.lock().clone()
    }

    pub fn delivered(&self) -> u64 {
        self.state.delivered.load(Ordering::Relaxed)
    }

    /// Rows the remote rejected after they were queued
    pub fn failed(&self) -> u64 {
        self.state.failed.load(Ordering::Relaxed)
    }
}

async fn deliver(
    backend: Arc<dyn SheetBackend>,
    sheet_name: String,
    header: Vec<String>,
    mut rx: mpsc::Receiver<Vec<String>>,
    state: Arc<MirrorState>,
) {
    let mut provisioned = false;

    while let Some(row) = rx.recv().await {
        if !provisioned {
            match provision(backend.as_ref(), &sheet_name, &header).await {
                Ok(url) => {
                    info!("Connected to Google Sheet: {}", sheet_name);
                    info!("Share link: {}", url);
                    *state.url.lock() = Some(url);
                    provisioned = true;
                }
                Err(e) => {
                    state.enabled.store(false, Ordering::Relaxed);
                    error!(
                        "Could not set up remote mirror '{}': {}. Writing to the durable log only",
                        sheet_name, e
                    );
                    return;
                }
            }
        }

        match backend.append_row(&row).await {
            Ok(()) => {
                state.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                state.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    market_id = row.get(1).map(String::as_str).unwrap_or_default(),
                    "Error writing to remote mirror: {}",
                    e
                );
            }
        }
    }

    debug!("Mirror worker drained");
}

#[async_trait]
impl RecordSink for RemoteMirrorSink {
    fn name(&self) -> &'static str {
        "google-sheets"
    }

    fn destination(&self) -> String {
        match self.url() {
            Some(url) => format!("{} ({})", self.sheet_name, url),
            None => self.sheet_name.clone(),
        }
    }

    fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::Relaxed)
    }

    fn failures(&self) -> u64 {
        self.failed()
    }

    async fn append(&self, record: &ObservationRecord) -> Result<(), SinkError> {
        if !self.is_enabled() {
            return Err(SinkError::Disabled);
        }
        let tx = self.tx.lock();
        let tx = tx.as_ref().ok_or(SinkError::QueueClosed)?;
        tx.try_send(record.to_row()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SinkError::QueueClosed,
        })
    }

    async fn close(&self) {
        // Dropping the sender lets the worker finish the queue and exit
        drop(self.tx.lock().take());
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut worker).await.is_err() {
                warn!("Remote mirror did not drain within {:?}", DRAIN_TIMEOUT);
                worker.abort();
            }
        }
    }
}

/// Mirror variant used when mirroring is off or could not be configured
#[derive(Debug, Default)]
pub struct DisabledMirror {
    reason: Option<String>,
}

impl DisabledMirror {
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
impl RecordSink for DisabledMirror {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn destination(&self) -> String {
        match &self.reason {
            Some(reason) => format!("disabled ({})", reason),
            None => "disabled".to_string(),
        }
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn append(&self, _record: &ObservationRecord) -> Result<(), SinkError> {
        Err(SinkError::Disabled)
    }
}
