//! C2 Client Library
//!
//! Client side of the C2 emulation channel. Registers the hosting program with
//! the controller, mirrors controller-assigned tasks into a bounded inbound
//! queue, batches task reports into a bounded outbound queue, and moves files
//! in either direction.
//!
//! Every exchange with the controller (register, report, poll, permission
//! request, upload, download) passes through one gate, so the controller never
//! sees two overlapping requests from the same agent.

pub mod protocol;
pub mod runner;
pub mod transport;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use c2emu_common::{AgentConfig, BoundedQueue, ReportRecord, TaskRecord, TaskState};

pub use protocol::{Action, C2Urls, TransferDirection, ACCEPT_FLAG};
pub use runner::TaskRunner;
pub use transport::{C2Transport, HttpTransport, TransportError};

/// Pause between two files of one transfer batch.
pub const FILE_PAUSE: Duration = Duration::from_millis(100);

/// Optional hook applied to file bytes after reading (upload) or after
/// receiving (download), e.g. for encryption.
pub type FileTransform = Arc<dyn Fn(Vec<u8>) -> Vec<u8> + Send + Sync>;

/// What one loop iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The report queue was submitted; no poll this tick.
    Reported,
    /// One poll request was made.
    Polled,
    /// Not connected, nothing sent.
    Idle,
}

pub struct C2Client {
    id: String,
    own_ip: String,
    download_dir: PathBuf,
    urls: C2Urls,
    transport: Arc<dyn C2Transport>,
    tasks: BoundedQueue<TaskRecord>,
    reports: BoundedQueue<ReportRecord>,
    connected: AtomicBool,
    free: AtomicBool,
    report_interval_ms: AtomicU64,
    exchange_gate: Mutex<()>,
    file_transform: Option<FileTransform>,
}

impl C2Client {
    /// Build a client from `config`. Creates the download directory if needed.
    pub fn new(config: &AgentConfig, transport: Arc<dyn C2Transport>) -> Result<Self> {
        let agent = &config.agent;
        if !agent.download_dir.is_dir() {
            info!("Create the download storage folder: {}", agent.download_dir.display());
            std::fs::create_dir_all(&agent.download_dir).with_context(|| {
                format!("creating download dir {}", agent.download_dir.display())
            })?;
        }

        Ok(Self {
            id: agent.id.clone(),
            own_ip: agent.own_ip.clone(),
            download_dir: agent.download_dir.clone(),
            urls: C2Urls::new(&config.controller.base_url(), &agent.id),
            transport,
            tasks: BoundedQueue::new(agent.task_queue_capacity),
            reports: BoundedQueue::new(agent.report_queue_capacity),
            connected: AtomicBool::new(false),
            free: AtomicBool::new(true),
            report_interval_ms: AtomicU64::new(agent.report_interval_secs.saturating_mul(1000)),
            exchange_gate: Mutex::new(()),
            file_transform: None,
        })
    }

    pub fn with_file_transform(mut self, transform: FileTransform) -> Self {
        self.file_transform = Some(transform);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn own_ip(&self) -> &str {
        &self.own_ip
    }

    pub fn urls(&self) -> &C2Urls {
        &self.urls
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Mark whether the host program is idle; sent as `free` with every request.
    pub fn set_free(&self, free: bool) {
        self.free.store(free, Ordering::SeqCst);
    }

    pub fn is_free(&self) -> bool {
        self.free.load(Ordering::SeqCst)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms.load(Ordering::SeqCst))
    }

    /// Change the pause between loop iterations; applies from the next sleep.
    /// A zero interval is refused and the current one kept.
    pub fn set_report_interval(&self, interval: Duration) -> bool {
        let millis = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            warn!("report interval must be at least 1ms, keeping {:?}", self.report_interval());
            return false;
        }
        self.report_interval_ms.store(millis, Ordering::SeqCst);
        true
    }

    pub fn task_queue_len(&self) -> usize {
        self.tasks.len()
    }

    pub fn report_queue_len(&self) -> usize {
        self.reports.len()
    }

    /// Run one network exchange behind the gate. A transport failure marks
    /// the client disconnected and yields `None`.
    async fn exchange<T, F>(&self, what: &str, request: F) -> Option<T>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        let _gate = self.exchange_gate.lock().await;
        match request.await {
            Ok(reply) => Some(reply),
            Err(err) => {
                warn!("controller {} exchange failed: {}", what, err);
                self.connected.store(false, Ordering::SeqCst);
                None
            }
        }
    }

    async fn report_to_hub(&self, action: Action, data: Value) -> Option<Value> {
        let envelope = protocol::Envelope {
            id: &self.id,
            free: self.is_free(),
            action,
            data,
        };
        let body = match serde_json::to_value(&envelope) {
            Ok(body) => body,
            Err(err) => {
                warn!("failed to encode {} request: {}", action.as_str(), err);
                return None;
            }
        };
        self.exchange(action.as_str(), self.transport.post_json(&self.urls.post_data, &body))
            .await
    }

    /// Announce this agent and its seed tasks. Connected only when the
    /// controller answers with the finished state.
    pub async fn register(&self, tasks: &[TaskRecord]) -> bool {
        info!("Start to register to the C2 [{}]...", self.urls.base);
        let data = json!({ "ipaddr": self.own_ip, "tasks": tasks });
        let Some(reply) = self.report_to_hub(Action::Register, data).await else {
            return false;
        };
        if protocol::reply_state(&reply) == Some(TaskState::Finished) {
            self.connected.store(true, Ordering::SeqCst);
            info!("Client connected to the C2 server.");
            true
        } else {
            warn!("registration not confirmed: {}", reply);
            false
        }
    }

    /// Queue a controller task for the host program. `false` when full.
    pub fn add_task(&self, task: TaskRecord) -> bool {
        match self.tasks.try_push(task) {
            Ok(()) => true,
            Err(task) => {
                warn!(task_id = task.task_id, "C2 task queue full, task dropped");
                false
            }
        }
    }

    /// Queue a report for the next submission. `false` when full.
    pub fn add_report(&self, report: ReportRecord) -> bool {
        match self.reports.try_push(report) {
            Ok(()) => true,
            Err(report) => {
                warn!(task_id = report.task_id, "C2 report queue full, report dropped");
                false
            }
        }
    }

    /// Next controller task, if any. Never waits.
    pub fn next_task(&self) -> Option<TaskRecord> {
        self.tasks.try_pop()
    }

    /// Submit every queued report as one batch. Returns `true` when a
    /// submission was attempted, `false` when there was nothing to send or
    /// the client is not connected.
    pub async fn submit_reports(&self) -> bool {
        if !self.is_connected() || self.reports.is_empty() {
            return false;
        }
        let batch = self.reports.drain();
        if batch.is_empty() {
            return false;
        }
        let data = match serde_json::to_value(&batch) {
            Ok(data) => data,
            Err(err) => {
                warn!("failed to encode report batch: {}", err);
                return false;
            }
        };
        debug!(count = batch.len(), "submitting reports");
        if self.report_to_hub(Action::Report, data).await.is_none() {
            // The batch goes back ahead of reports queued meanwhile.
            let dropped = self.reports.requeue_front(batch);
            if !dropped.is_empty() {
                warn!(dropped = dropped.len(), "reports lost after failed submission");
            }
        }
        true
    }

    /// Ask the controller for one task and queue it. Returns `true` when a
    /// task was received and queued.
    pub async fn fetch_task(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Some(reply) = self.report_to_hub(Action::GetTask, Value::Null).await else {
            return false;
        };
        let task = match reply.get("task") {
            None | Some(Value::Null) => {
                debug!("no task assigned");
                return false;
            }
            Some(task) => task.clone(),
        };
        match serde_json::from_value::<TaskRecord>(task) {
            Ok(task) => {
                info!(task_id = task.task_id, task_type = %task.task_type, "got new task");
                self.add_task(task)
            }
            Err(err) => {
                warn!("invalid task information: {}", err);
                false
            }
        }
    }

    /// One loop iteration: reports take priority over polling, and at most
    /// one exchange happens.
    pub async fn tick(&self) -> Tick {
        if self.submit_reports().await {
            return Tick::Reported;
        }
        if self.is_connected() {
            self.fetch_task().await;
            return Tick::Polled;
        }
        Tick::Idle
    }

    /// Loop until `cancel` fires, sleeping the report interval between ticks.
    /// Cancellation is observed between ticks; an exchange in flight finishes.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Start the C2 client main loop.");
        while !cancel.is_cancelled() {
            match self.tick().await {
                Tick::Reported => debug!("reported the current state to C2"),
                Tick::Polled => debug!("polled C2 for a task"),
                Tick::Idle => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.report_interval()) => {}
            }
        }
        info!("C2 client main loop end.");
    }

    /// Spawn [`C2Client::run`] on the runtime.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(cancel))
    }

    fn transform(&self, data: Vec<u8>) -> Vec<u8> {
        match &self.file_transform {
            Some(transform) => transform(data),
            None => data,
        }
    }

    /// Ask permission for the whole batch, then move each file in turn.
    /// Returns `false` if permission is refused or could not be obtained, or
    /// if any file failed.
    pub async fn transfer_files(&self, files: &[String], direction: TransferDirection) -> bool {
        let action = direction.action();
        let Some(reply) = self.report_to_hub(action, json!(files)).await else {
            return false;
        };
        if !protocol::is_accepted(&reply, action) {
            info!("controller refused {} of {} file(s)", action.as_str(), files.len());
            return false;
        }

        let mut all_ok = true;
        for file in files {
            let ok = match direction {
                TransferDirection::Upload => self.upload_file(Path::new(file)).await.is_some(),
                TransferDirection::Download => self.download_file(file, &self.download_dir).await,
            };
            all_ok &= ok;
            sleep(FILE_PAUSE).await;
        }
        all_ok
    }

    /// Upload one whole file. Returns the controller's reply, or `None` if
    /// the file is missing/unreadable or the upload failed.
    pub async fn upload_file(&self, path: &Path) -> Option<Value> {
        if !path.is_file() {
            warn!("Upload file : {} not exist", path.display());
            return None;
        }
        let data = match tokio::fs::read(path).await {
            Ok(data) => self.transform(data),
            Err(err) => {
                warn!("File IO error: {}", err);
                return None;
            }
        };
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        info!("uploading file {} ...", file_name);
        self.exchange(
            "upload",
            self.transport.post_file(&self.urls.upload, &file_name, data),
        )
        .await
    }

    /// Download `name` into `dest_dir`. Only the final path component of
    /// `name` is used for the local file.
    pub async fn download_file(&self, name: &str, dest_dir: &Path) -> bool {
        if let Err(err) = tokio::fs::create_dir_all(dest_dir).await {
            warn!("cannot create download dir {}: {}", dest_dir.display(), err);
            return false;
        }
        let Some(local_name) = Path::new(name).file_name() else {
            warn!("invalid download file name: {:?}", name);
            return false;
        };
        let target = dest_dir.join(local_name);

        info!("Downloading file {} ...", name);
        let body = json!({ "filename": name });
        let Some(data) = self
            .exchange("download", self.transport.get_bytes(&self.urls.download, &body))
            .await
        else {
            return false;
        };
        let data = self.transform(data);
        match tokio::fs::write(&target, data).await {
            Ok(()) => true,
            Err(err) => {
                warn!("Create download file error : {}", err);
                false
            }
        }
    }
}
