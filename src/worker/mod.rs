//! Device-side queue consumer.
//!
//! One worker per device inbox. It scans the inbox at a fixed interval and
//! runs each request to completion before touching the next, in file name
//! order. A request file is claimed and deleted before its command runs, so
//! a crash mid-command never replays it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::message::{CodecError, Request, Response, Target};
use crate::transport::file_queue::{
    claim, is_request_file, request_basename, response_file_name, write_atomic,
};

/// Errors from the worker loop.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Executes commands for one device.
///
/// Handlers own their device connection; `&mut self` keeps one command in
/// flight at a time.
#[async_trait]
pub trait CommandHandler: Send {
    async fn handle(&mut self, request: Request) -> Response;
}

/// Handler shared between the queue loop and the HTTP endpoint.
pub type SharedHandler<H> = Arc<Mutex<H>>;

/// Directory-scanning worker loop.
pub struct QueueWorker<H> {
    target: Target,
    inbox: PathBuf,
    outbox: PathBuf,
    scan_interval: Duration,
    handler: SharedHandler<H>,
}

impl<H: CommandHandler + 'static> QueueWorker<H> {
    /// Create a worker, creating its directories if needed.
    pub async fn new(
        target: Target,
        inbox: impl AsRef<Path>,
        outbox: impl AsRef<Path>,
        scan_interval: Duration,
        handler: SharedHandler<H>,
    ) -> Result<Self> {
        let inbox = inbox.as_ref().to_path_buf();
        let outbox = outbox.as_ref().to_path_buf();
        fs::create_dir_all(&inbox).await?;
        fs::create_dir_all(&outbox).await?;
        Ok(Self {
            target,
            inbox,
            outbox,
            scan_interval,
            handler,
        })
    }

    pub async fn from_config(config: &WorkerConfig, handler: SharedHandler<H>) -> Result<Self> {
        Self::new(
            Target::new(&config.target),
            &config.inbox,
            &config.outbox,
            config.scan_interval(),
            handler,
        )
        .await
    }

    pub fn handler(&self) -> SharedHandler<H> {
        self.handler.clone()
    }

    /// Pending request files, in processing order.
    pub async fn pending(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.inbox).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if is_request_file(&name.to_string_lossy()) {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Process every pending request once. Returns how many were handled.
    pub async fn scan_once(&self) -> Result<usize> {
        let mut handled = 0;
        for path in self.pending().await? {
            if self.process_file(&path).await? {
                handled += 1;
            }
        }
        Ok(handled)
    }

    /// Claim, read, delete, handle, and answer one request file.
    ///
    /// Returns `false` if the file was already gone.
    pub async fn process_file(&self, path: &Path) -> Result<bool> {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return Ok(false);
        };
        let basename = request_basename(&name).to_string();

        let Some(claimed) = claim(path).await? else {
            debug!(file = %name, "Request withdrawn before claim");
            return Ok(false);
        };

        let read = fs::read(&claimed).await;
        if let Err(e) = fs::remove_file(&claimed).await {
            error!(file = %name, error = %e, "Failed to remove claimed request");
        }

        let response = match read
            .map_err(WorkerError::from)
            .and_then(|bytes| Ok(Request::decode(self.target.clone(), &bytes)?))
        {
            Ok(request) => {
                let correlation_id = request.correlation_id.clone();
                debug!(
                    target = %self.target,
                    %correlation_id,
                    file = %name,
                    command = %request.command_type(),
                    "Processing request"
                );
                let response = self.handler.lock().await.handle(request).await;
                debug!(
                    target = %self.target,
                    %correlation_id,
                    ok = response.ok,
                    message = %response.message,
                    "Request handled"
                );
                response
            }
            Err(e) => {
                warn!(target = %self.target, file = %name, error = %e, "Removed invalid request");
                Response::invalid_json()
            }
        };

        let out = self.outbox.join(response_file_name(&basename));
        if let Err(e) = write_atomic(&out, &response.encode()?).await {
            error!(file = %out.display(), error = %e, "Failed to write response");
            return Err(e.into());
        }
        Ok(true)
    }

    /// Run until `stop` flips to true. Stops between files, never mid-command.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        info!(
            target = %self.target,
            inbox = %self.inbox.display(),
            outbox = %self.outbox.display(),
            "Worker started"
        );

        'outer: loop {
            match self.pending().await {
                Ok(files) => {
                    for path in files {
                        if *stop.borrow() {
                            break 'outer;
                        }
                        if let Err(e) = self.process_file(&path).await {
                            error!(target = %self.target, file = %path.display(), error = %e, "Request processing failed");
                        }
                    }
                }
                Err(e) => error!(target = %self.target, error = %e, "Inbox scan failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.scan_interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *stop.borrow() {
                break;
            }
        }

        info!(target = %self.target, "Worker stopped");
    }

    /// Run in a background task.
    pub fn spawn(self) -> WorkerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        WorkerHandle {
            stop: stop_tx,
            task,
        }
    }
}

/// Handle to a running worker.
pub struct WorkerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to stop after its current command.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Stop and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            error!(error = %e, "Worker task failed");
        }
    }
}
