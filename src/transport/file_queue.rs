//! Directory-based command queue.
//!
//! Layout per target:
//! ```text
//! {inbox}/
//!   {basename}.json             request, written atomically
//!   .{basename}.json.claimed    request the worker has taken (transient)
//! {outbox}/
//!   {basename}.response.json    response, written atomically
//! ```
//!
//! `basename` is a time-ordered token followed by the sanitized correlation
//! id, so lexicographic order is dispatch order and concurrent calls with
//! the same correlation id never share a file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{CommandTransport, Receipt, Result, TransportError, TransportKind, Withdrawal};
use crate::message::{Request, Response, Target};

/// Suffix of request files.
pub const REQUEST_SUFFIX: &str = ".json";
/// Suffix of response files.
pub const RESPONSE_SUFFIX: &str = ".response.json";
/// Suffix of files being written.
pub const TEMP_SUFFIX: &str = ".tmp";
/// Suffix of requests a worker has claimed.
pub const CLAIMED_SUFFIX: &str = ".claimed";

const MAX_KEY_LENGTH: usize = 96;

/// File-queue transport for one target.
pub struct FileQueueTransport {
    target: Target,
    inbox: PathBuf,
    outbox: PathBuf,
    poll_interval: Duration,
}

impl FileQueueTransport {
    /// Create the transport, creating both directories if needed.
    pub async fn new(
        target: Target,
        inbox: impl AsRef<Path>,
        outbox: impl AsRef<Path>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let inbox = inbox.as_ref().to_path_buf();
        let outbox = outbox.as_ref().to_path_buf();
        fs::create_dir_all(&inbox).await?;
        fs::create_dir_all(&outbox).await?;
        Ok(Self {
            target,
            inbox,
            outbox,
            poll_interval,
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn request_path(&self, basename: &str) -> PathBuf {
        self.inbox.join(request_file_name(basename))
    }

    pub fn response_path(&self, basename: &str) -> PathBuf {
        self.outbox.join(response_file_name(basename))
    }
}

#[async_trait]
impl CommandTransport for FileQueueTransport {
    async fn submit(&self, request: &Request) -> Result<Receipt> {
        let basename = basename_for(&request.correlation_id);
        let path = self.request_path(&basename);
        write_atomic(&path, &request.encode()?).await?;

        debug!(
            target = %self.target,
            correlation_id = %request.correlation_id,
            file = %path.display(),
            "Queued request"
        );

        Ok(Receipt {
            correlation_id: request.correlation_id.clone(),
            key: basename,
        })
    }

    async fn poll(&self, receipt: &Receipt, timeout: Duration) -> Result<Response> {
        let path = self.response_path(&receipt.key);
        let deadline = Instant::now().checked_add(timeout);

        loop {
            match fs::read(&path).await {
                Ok(bytes) => {
                    if let Err(e) = fs::remove_file(&path).await {
                        warn!(file = %path.display(), error = %e, "Failed to remove consumed response");
                    }
                    return Ok(Response::decode(&bytes)?);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            let mut pause = self.poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(TransportError::Timeout {
                        correlation_id: receipt.correlation_id.clone(),
                        waited: timeout,
                    });
                }
                pause = pause.min(deadline - now);
            }
            tokio::time::sleep(pause).await;
        }
    }

    async fn withdraw(&self, receipt: &Receipt) -> Result<Withdrawal> {
        match fs::remove_file(self.request_path(&receipt.key)).await {
            Ok(()) => Ok(Withdrawal::Withdrawn),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Withdrawal::AlreadyClaimed),
            Err(e) => Err(e.into()),
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::FileQueue
    }
}

// ============================================================================
// Naming
// ============================================================================

/// Unique, time-ordered file basename for a call.
pub fn basename_for(correlation_id: &str) -> String {
    let token = uuid::Uuid::now_v7().simple().to_string();
    let key = sanitize_key(correlation_id);
    if key.is_empty() {
        token
    } else {
        format!("{token}_{key}")
    }
}

/// Replace characters unsafe in file names with `_` and bound the length.
pub fn sanitize_key(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_KEY_LENGTH)
        .collect()
}

pub fn request_file_name(basename: &str) -> String {
    format!("{basename}{REQUEST_SUFFIX}")
}

pub fn response_file_name(basename: &str) -> String {
    format!("{basename}{RESPONSE_SUFFIX}")
}

/// True for pending request files: `*.json`, excluding responses and
/// hidden (claimed) files. Matching is case-insensitive.
pub fn is_request_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !name.starts_with('.') && lower.ends_with(REQUEST_SUFFIX) && !lower.ends_with(RESPONSE_SUFFIX)
}

/// Basename of a request file name (`abc.json` -> `abc`).
pub fn request_basename(name: &str) -> &str {
    let cut = name.len().saturating_sub(REQUEST_SUFFIX.len());
    if name.is_char_boundary(cut) && name[cut..].eq_ignore_ascii_case(REQUEST_SUFFIX) {
        &name[..cut]
    } else {
        name
    }
}

// ============================================================================
// File operations
// ============================================================================

/// Write atomically using temp file + rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(TEMP_SUFFIX);
    let temp = PathBuf::from(temp);
    fs::write(&temp, bytes).await?;
    fs::rename(&temp, path).await
}

/// Claim a request file for processing by renaming it to a hidden name.
///
/// Returns `None` if the file is gone (withdrawn or claimed elsewhere).
pub async fn claim(path: &Path) -> std::io::Result<Option<PathBuf>> {
    let Some(name) = path.file_name() else {
        return Ok(None);
    };
    let mut claimed_name = std::ffi::OsString::from(".");
    claimed_name.push(name);
    claimed_name.push(CLAIMED_SUFFIX);
    let claimed = path.with_file_name(claimed_name);

    match fs::rename(path, &claimed).await {
        Ok(()) => Ok(Some(claimed)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
