//! Downloads through a pluggable [FileFetch] backend.
//!
//! The crate does not speak any wire protocol itself.  A [FileFetch] starts a [FetchRequest] that writes one URL to
//! one path and is polled for progress.  On top of that:
//!
//! - [DownloadFileOperation] downloads to a temporary file, resumes partial files, verifies the size, moves the file
//!   into place and retries transient failures.
//! - [DownloadCenter] makes concurrent requests for the same key share one [DownloadFileOperation], caps how many
//!   run at once, and counts failures.
//! - [BundleDownloaderOperation] downloads a batch with a progress callback.
//!
//! Download operations are driven by whoever waits on them, not by the [crate::OperationSystem]: each waiter polls
//! the shared operation from its own update, and polling a finished operation does nothing.
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use ahash::RandomState;
use log::{debug, error, warn};

use crate::*;

/// What happens to a partially downloaded file when its download is aborted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortPolicy {
    DeleteTemporary,
    /// Keep it so that a later download can resume.
    KeepTemporary,
}

impl Default for AbortPolicy {
    fn default() -> Self {
        AbortPolicy::KeepTemporary
    }
}

#[derive(Clone, Debug, derive_builder::Builder)]
#[builder(default)]
pub struct DownloadConfig {
    /// Retries per file after the first failed attempt.
    pub max_retry_count: u32,
    pub abort_policy: AbortPolicy,
    pub max_concurrent_downloads: usize,
    /// Files at least this large resume from a partial temporary file instead of starting over.
    pub resume_min_size: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        DownloadConfig {
            max_retry_count: 3,
            abort_policy: AbortPolicy::default(),
            max_concurrent_downloads: 10,
            resume_min_size: 1024 * 1024,
        }
    }
}

/// One file to fetch.
#[derive(Clone, Debug, PartialEq, Eq, derive_builder::Builder)]
#[builder(setter(into))]
pub struct DownloadRequest {
    pub url: String,
    pub destination: PathBuf,
    /// Byte offset to resume from.  The backend appends to `destination` when this is not 0.
    #[builder(default)]
    pub resume_from: u64,
    #[builder(default)]
    pub headers: Vec<(String, String)>,
}

impl DownloadRequest {
    /// The HTTP `Range` header a resumed request needs.
    pub fn range_header(&self) -> Option<String> {
        if self.resume_from > 0 {
            Some(format!("bytes={}-", self.resume_from))
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadResponse {
    pub url: String,
    pub path: PathBuf,
    /// Total bytes on disk, including any resumed prefix.
    pub downloaded_bytes: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FetchPoll {
    Pending { progress: f32, downloaded_bytes: u64 },
    Done(DownloadResponse),
    Failed(String),
}

/// A fetch in flight.
pub trait FetchRequest {
    fn poll(&mut self) -> FetchPoll;

    fn abort(&mut self);
}

/// The download backend.
pub trait FileFetch {
    fn fetch(&self, request: &DownloadRequest) -> Box<dyn FetchRequest>;
}

/// Failure counts per package and event, for diagnostics.
#[derive(Debug, Default)]
pub struct RequestFailureCounter {
    counts: HashMap<String, u32, RandomState>,
}

impl RequestFailureCounter {
    fn key(package_name: &str, event: &str) -> String {
        format!("{}_{}", package_name, event)
    }

    pub fn record(&mut self, package_name: &str, event: &str) {
        *self
            .counts
            .entry(Self::key(package_name, event))
            .or_insert(0) += 1;
    }

    pub fn count(&self, package_name: &str, event: &str) -> u32 {
        self.counts
            .get(&Self::key(package_name, event))
            .copied()
            .unwrap_or(0)
    }
}

pub type DownloadRef = Rc<RefCell<DownloadFileOperation>>;

pub const DOWNLOAD_FAILED_EVENT: &str = "download_file";

fn temp_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".temp");
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove {}: {}", path.display(), e);
        }
    }
}

enum DownloadState {
    /// Waiting for a concurrency slot.
    Queued,
    Fetching(Box<dyn FetchRequest>),
    Done,
}

/// Downloads one file to its destination, through a temporary file.
pub struct DownloadFileOperation {
    core: OperationCore,
    center: Rc<DownloadCenter>,
    key: String,
    request: DownloadRequest,
    expected_size: Option<u64>,
    state: DownloadState,
    slot: Option<LoadSlot>,
    downloaded_bytes: u64,
    response: Option<DownloadResponse>,
}

impl DownloadFileOperation {
    fn new(
        center: Rc<DownloadCenter>,
        key: &str,
        request: DownloadRequest,
        expected_size: Option<u64>,
    ) -> DownloadFileOperation {
        DownloadFileOperation {
            core: OperationCore::new(),
            center,
            key: key.to_string(),
            request,
            expected_size,
            state: DownloadState::Queued,
            slot: None,
            downloaded_bytes: 0,
            response: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes
    }

    pub fn response(&self) -> Option<&DownloadResponse> {
        self.response.as_ref()
    }

    fn temp_path(&self) -> PathBuf {
        temp_path(&self.request.destination)
    }

    /// Where to resume the next attempt, discarding a temporary file that cannot be resumed.
    fn resume_offset(&self) -> u64 {
        let temp = self.temp_path();
        let existing = match std::fs::metadata(&temp) {
            Ok(m) => m.len(),
            Err(_) => return 0,
        };
        match self.expected_size {
            Some(expected) if expected >= self.center.config.resume_min_size && existing < expected => existing,
            _ => {
                remove_if_exists(&temp);
                0
            }
        }
    }

    fn begin_attempt(&mut self) -> Result<(), OperationError> {
        let temp = self.temp_path();
        if let Some(parent) = temp.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| OperationError::io(format!("creating {}", parent.display()), &e))?;
        }
        let mut attempt = self.request.clone();
        attempt.destination = temp;
        attempt.resume_from = self.resume_offset();
        if attempt.resume_from > 0 {
            debug!("Resuming {} from byte {}", attempt.url, attempt.resume_from);
        }
        self.downloaded_bytes = attempt.resume_from;
        self.state = DownloadState::Fetching(self.center.fetch.fetch(&attempt));
        Ok(())
    }

    /// Verify the finished temporary file and move it into place.
    fn commit(&self) -> Result<u64, OperationError> {
        let temp = self.temp_path();
        let size = std::fs::metadata(&temp)
            .map_err(|e| OperationError::io(format!("reading {}", temp.display()), &e))?
            .len();
        if let Some(expected) = self.expected_size {
            if size != expected {
                remove_if_exists(&temp);
                return Err(OperationError::Verification {
                    what: self.request.url.clone(),
                    message: format!("expected {} bytes, got {}", expected, size),
                });
            }
        }
        std::fs::rename(&temp, &self.request.destination).map_err(|e| {
            OperationError::io(
                format!("moving download to {}", self.request.destination.display()),
                &e,
            )
        })?;
        Ok(size)
    }

    fn attempt_failed(&mut self, err: OperationError) {
        self.slot = None;
        self.state = DownloadState::Queued;
        self.center
            .failures
            .borrow_mut()
            .record(&self.center.package_name, DOWNLOAD_FAILED_EVENT);

        if !err.is_retryable() {
            error!("Download of {} failed: {}", self.request.url, err);
            self.finish_failed(err);
            return;
        }

        let decision = self.center.tasks.borrow_mut().record_failure(&self.key);
        if let RetryDecision::Exhausted { failures } = decision {
            let message = match err {
                OperationError::Fetch { message, .. } => message,
                other => other.to_string(),
            };
            let err = OperationError::Fetch {
                url: self.request.url.clone(),
                attempts: failures,
                message,
            };
            error!("{}", err);
            self.finish_failed(err);
        }
    }

    fn finish_failed(&mut self, err: OperationError) {
        self.state = DownloadState::Done;
        self.center.tasks.borrow_mut().reset_retry(&self.key);
        self.core.fail(err);
    }

    fn stop_fetch(&mut self) {
        if let DownloadState::Fetching(mut fetch) = std::mem::replace(&mut self.state, DownloadState::Done) {
            fetch.abort();
            if self.center.config.abort_policy == AbortPolicy::DeleteTemporary {
                remove_if_exists(&self.temp_path());
            }
        }
        self.slot = None;
    }
}

impl AsyncOperation for DownloadFileOperation {
    fn core(&self) -> &OperationCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut OperationCore {
        &mut self.core
    }

    fn internal_start(&mut self) {
        self.state = DownloadState::Queued;
    }

    fn internal_update(&mut self, _slice: &TimeSlice) {
        if let DownloadState::Queued = self.state {
            let slot = if self.core.is_waiting_sync() {
                Some(self.center.limiter.acquire_unbounded())
            } else {
                self.center.limiter.try_acquire()
            };
            match slot {
                Some(s) => self.slot = Some(s),
                None => return,
            }
            if let Err(e) = self.begin_attempt() {
                self.attempt_failed(e);
                return;
            }
        }

        let poll = match &mut self.state {
            DownloadState::Fetching(fetch) => fetch.poll(),
            _ => return,
        };
        match poll {
            FetchPoll::Pending {
                progress,
                downloaded_bytes,
            } => {
                self.downloaded_bytes = downloaded_bytes;
                self.core.set_progress(progress);
            }
            FetchPoll::Done(_) => match self.commit() {
                Ok(size) => {
                    self.state = DownloadState::Done;
                    self.slot = None;
                    self.downloaded_bytes = size;
                    self.center.tasks.borrow_mut().reset_retry(&self.key);
                    self.response = Some(DownloadResponse {
                        url: self.request.url.clone(),
                        path: self.request.destination.clone(),
                        downloaded_bytes: size,
                    });
                    debug!("Downloaded {} ({} bytes)", self.request.url, size);
                    self.core.succeed();
                }
                Err(e) => self.attempt_failed(e),
            },
            FetchPoll::Failed(message) => self.attempt_failed(OperationError::Fetch {
                url: self.request.url.clone(),
                attempts: 1,
                message,
            }),
        }
    }

    fn internal_abort(&mut self) {
        self.stop_fetch();
    }

    fn description(&self) -> String {
        format!("DownloadFileOperation({})", self.request.url)
    }
}

impl Drop for DownloadFileOperation {
    fn drop(&mut self) {
        // Nobody is waiting anymore.
        self.stop_fetch();
    }
}

/// Shares downloads between requesters and bounds how many run at once.
pub struct DownloadCenter {
    package_name: String,
    fetch: Rc<dyn FileFetch>,
    config: DownloadConfig,
    tasks: RefCell<LoadingTaskTracker<Weak<RefCell<DownloadFileOperation>>>>,
    failures: RefCell<RequestFailureCounter>,
    limiter: LoadLimiter,
}

impl DownloadCenter {
    pub fn new(
        package_name: impl Into<String>,
        fetch: Rc<dyn FileFetch>,
        config: DownloadConfig,
    ) -> Rc<DownloadCenter> {
        Rc::new(DownloadCenter {
            package_name: package_name.into(),
            fetch,
            tasks: RefCell::new(LoadingTaskTracker::new(config.max_retry_count)),
            failures: Default::default(),
            limiter: LoadLimiter::new(config.max_concurrent_downloads),
            config,
        })
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Get the in-flight download for `key`, or start a new one.  The operation still has to be started and polled
    /// by the caller.
    pub fn download(
        self: &Rc<Self>,
        key: &str,
        request: DownloadRequest,
        expected_size: Option<u64>,
    ) -> DownloadRef {
        let mut tasks = self.tasks.borrow_mut();
        if let Some(op) = tasks.try_get_task(key).and_then(Weak::upgrade) {
            if !is_finished(&op) {
                return op;
            }
        }
        tasks.remove_task(key);

        let op = Rc::new(RefCell::new(DownloadFileOperation::new(
            self.clone(),
            key,
            request,
            expected_size,
        )));
        tasks.add_task(key, Rc::downgrade(&op));
        op
    }

    /// Forget downloads that finished or that nobody holds anymore.
    pub fn update(&self) {
        self.tasks
            .borrow_mut()
            .retain(|_, op| op.upgrade().map_or(false, |op| !is_finished(&op)));
    }

    pub fn is_downloading(&self, key: &str) -> bool {
        self.tasks
            .borrow()
            .try_get_task(key)
            .and_then(Weak::upgrade)
            .map_or(false, |op| !is_finished(&op))
    }

    pub fn downloading_count(&self) -> usize {
        self.limiter.in_flight()
    }

    pub fn failure_count(&self, event: &str) -> u32 {
        self.failures.borrow().count(&self.package_name, event)
    }
}

/// Done, or mid-update by its owner and so certainly not finished.
fn is_finished(op: &DownloadRef) -> bool {
    op.try_borrow().map(|o| o.is_done()).unwrap_or(false)
}

/// One file of a batch download.
#[derive(Clone, Debug)]
pub struct DownloadItem {
    pub key: String,
    pub request: DownloadRequest,
    pub size: u64,
}

pub type DownloadProgressCallback = Box<dyn FnMut(f32, usize, usize)>;

/// Downloads a batch of files, a bounded number at a time.  Fails with the first file that fails.
pub struct BundleDownloaderOperation {
    core: OperationCore,
    center: Rc<DownloadCenter>,
    max_concurrent: usize,
    pending: VecDeque<DownloadItem>,
    active: Vec<(DownloadItem, DownloadRef)>,
    total_count: usize,
    total_bytes: u64,
    current_count: usize,
    current_bytes: u64,
    on_progress: Option<DownloadProgressCallback>,
}

impl BundleDownloaderOperation {
    pub fn new(
        center: Rc<DownloadCenter>,
        items: Vec<DownloadItem>,
        max_concurrent: usize,
    ) -> BundleDownloaderOperation {
        BundleDownloaderOperation {
            core: OperationCore::new(),
            center,
            max_concurrent: max_concurrent.max(1),
            total_count: items.len(),
            total_bytes: items.iter().map(|i| i.size).sum(),
            pending: items.into(),
            active: Vec::new(),
            current_count: 0,
            current_bytes: 0,
            on_progress: None,
        }
    }

    /// Called with `(progress, downloaded files, total files)` whenever a file completes.
    pub fn set_progress_callback(&mut self, callback: DownloadProgressCallback) {
        self.on_progress = Some(callback);
    }

    pub fn total_count(&self) -> usize {
        self.total_count
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn current_count(&self) -> usize {
        self.current_count
    }

    /// Bytes of completed files plus bytes of files in flight.
    pub fn current_bytes(&self) -> u64 {
        self.current_bytes
            + self
                .active
                .iter()
                .map(|(_, op)| op.borrow().downloaded_bytes())
                .sum::<u64>()
    }

    /// Let go of every download, aborting those nobody else is waiting for.
    fn release_active(&mut self) {
        self.pending.clear();
        for (item, op) in self.active.drain(..) {
            if Rc::strong_count(&op) == 1 {
                debug!("Aborting download of {}", item.key);
                abort_and_notify(&*op);
            }
        }
    }

    fn report_progress(&mut self) {
        let progress = if self.total_bytes > 0 {
            self.current_bytes as f32 / self.total_bytes as f32
        } else if self.total_count > 0 {
            self.current_count as f32 / self.total_count as f32
        } else {
            1.0
        };
        self.core.set_progress(progress);
        if let Some(cb) = self.on_progress.as_mut() {
            cb(progress, self.current_count, self.total_count);
        }
    }
}

impl AsyncOperation for BundleDownloaderOperation {
    fn core(&self) -> &OperationCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut OperationCore {
        &mut self.core
    }

    fn internal_start(&mut self) {
        if self.total_count == 0 {
            self.report_progress();
            self.core.succeed();
        }
    }

    fn internal_update(&mut self, slice: &TimeSlice) {
        while self.active.len() < self.max_concurrent {
            let item = match self.pending.pop_front() {
                Some(i) => i,
                None => break,
            };
            // Two items, or another requester, may share a key and so a download.
            let op = self
                .center
                .download(&item.key, item.request.clone(), Some(item.size));
            op.borrow_mut().start_operation();
            self.active.push((item, op));
        }

        let mut finished = Vec::new();
        for (i, (_, op)) in self.active.iter().enumerate() {
            if self.core.is_waiting_sync() {
                wait_and_notify(&**op);
            } else {
                update_and_notify(&**op, slice);
            }
            if op.borrow().is_done() {
                finished.push(i);
            }
        }

        for i in finished.into_iter().rev() {
            let (item, op) = self.active.remove(i);
            let op = op.borrow();
            match op.error() {
                None => {
                    self.current_count += 1;
                    self.current_bytes += item.size;
                    self.report_progress();
                }
                Some(e) => {
                    let err = e.clone().in_bundle(item.key.clone(), "downloading");
                    drop(op);
                    error!("{}", err);
                    self.release_active();
                    self.core.fail(err);
                    return;
                }
            }
        }

        if self.pending.is_empty() && self.active.is_empty() {
            self.core.succeed();
        }
    }

    fn internal_abort(&mut self) {
        self.release_active();
    }

    fn description(&self) -> String {
        format!("BundleDownloaderOperation({} files)", self.total_count)
    }
}
