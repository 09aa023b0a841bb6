//! Robotic arm endpoint.
//!
//! Commands:
//! - `run_lua` / `run_program` `{ file, timeout? }`
//! - `upload_lua` `{ path }`
//! - `upload_tech_point` / `upload_techpoint` `{ path, activate = true, use_old = false }`
//!
//! A run is tracked to completion with the [`CompletionTracker`]. A timed
//! out wait leaves the program running on the controller; nothing here can
//! abort a physical motion.

pub mod sim;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};

use super::LinkError;
use crate::config::ArmConfig;
use crate::error::LabcellError;
use crate::message::{wait_from_secs, Request, Response};
use crate::telemetry::TelemetrySource;
use crate::tracker::{CompletionTracker, Phase};
use crate::worker::CommandHandler;

pub use sim::SimulatedArm;

/// Point table switch result meaning the table is already active.
pub const POINT_TABLE_ALREADY_ACTIVE: i32 = 130;

pub mod msg {
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const UPLOADED: &str = "uploaded";
    pub const MISSING_FILE: &str = "Missing file";
    pub const MISSING_PATH: &str = "Missing path";
    pub const INVALID_PATH: &str = "Invalid path";
    pub const UNKNOWN_COMMAND: &str = "Unknown command type";
    /// Capability named when no telemetry call is supported.
    pub const TELEMETRY: &str = "telemetry";
}

/// Controller calls used by the arm handler. Result codes are the vendor's:
/// zero is success.
#[async_trait]
pub trait ArmLink: TelemetrySource {
    /// Telemetry surface of this link.
    fn telemetry(&self) -> &dyn TelemetrySource;

    async fn load_program(&self, remote_path: &str) -> Result<i32, LinkError>;

    async fn run_program(&self) -> Result<i32, LinkError>;

    async fn upload_program(&self, local_path: &Path) -> Result<i32, LinkError>;

    /// Upload a point table database. `legacy` selects the generic file
    /// upload path older controllers need.
    async fn upload_point_table(&self, local_path: &Path, legacy: bool) -> Result<i32, LinkError>;

    async fn switch_point_table(&self, name: &str) -> Result<i32, LinkError>;
}

/// Command handler owning one arm link.
pub struct ArmHandler<L> {
    link: L,
    tracker: CompletionTracker,
    config: ArmConfig,
    base_dir: PathBuf,
}

impl<L: ArmLink> ArmHandler<L> {
    pub fn new(link: L, config: ArmConfig, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            tracker: CompletionTracker::from_config(&config.tracker),
            link,
            config,
            base_dir: base_dir.into(),
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn tracker(&self) -> &CompletionTracker {
        &self.tracker
    }

    async fn run_program(&mut self, request: &Request) -> Response {
        let Some(file) = request.str_field("file") else {
            return Response::reply(request, false, msg::MISSING_FILE);
        };
        let remote_path = format!("{}/{}", self.config.program_dir.trim_end_matches('/'), file);
        let wait = request
            .f64_field("timeout")
            .and_then(wait_from_secs)
            .unwrap_or_else(|| self.config.default_wait());

        match self.link.load_program(&remote_path).await {
            Ok(0) => {}
            Ok(code) => return failed(request, "load", code),
            Err(e) => return link_failed(request, "load", e),
        }
        match self.link.run_program().await {
            Ok(0) => {}
            Ok(code) => return failed(request, "run", code),
            Err(e) => return link_failed(request, "run", e),
        }

        info!(program = %remote_path, ?wait, "Program started");
        let completion = self.tracker.wait(self.link.telemetry(), Some(wait)).await;

        let mut response = match completion.phase {
            Phase::Done => Response::reply(request, true, msg::COMPLETED),
            Phase::Timeout if self.tracker.telemetry_unavailable() => {
                warn!(
                    program = %remote_path,
                    ?wait,
                    "Controller reports no supported telemetry; completion cannot be observed"
                );
                LabcellError::EndpointUnsupportedCapability(msg::TELEMETRY.into()).reply_to(request)
            }
            Phase::Timeout => {
                warn!(
                    program = %remote_path,
                    ?wait,
                    seen_busy = completion.state.seen_busy,
                    "Completion wait timed out; the program may still be running"
                );
                LabcellError::TransportTimeout(wait).reply_to(request)
            }
            _ => LabcellError::EndpointFailure(msg::FAILED.into()).reply_to(request),
        };
        response.extra.extend(completion.to_extra());
        response
    }

    async fn upload_program(&mut self, request: &Request) -> Response {
        let path = match self.upload_path(request).await {
            Ok(path) => path,
            Err(response) => return *response,
        };
        match self.link.upload_program(&path).await {
            Ok(0) => Response::reply(request, true, msg::UPLOADED),
            Ok(code) => failed(request, "upload", code),
            Err(e) => link_failed(request, "upload", e),
        }
    }

    async fn upload_point_table(&mut self, request: &Request) -> Response {
        let path = match self.upload_path(request).await {
            Ok(path) => path,
            Err(response) => return *response,
        };
        let activate = request.bool_field("activate").unwrap_or(true);
        let legacy = request.bool_field("use_old").unwrap_or(false);

        match self.link.upload_point_table(&path, legacy).await {
            Ok(0) => {}
            Ok(code) => return failed(request, "upload", code),
            Err(e) => return link_failed(request, "upload", e),
        }
        if !activate {
            return Response::reply(request, true, msg::UPLOADED);
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        tokio::time::sleep(self.config.activation_delay()).await;

        match self.link.switch_point_table(&name).await {
            Ok(0) => Response::reply(request, true, msg::UPLOADED),
            Ok(POINT_TABLE_ALREADY_ACTIVE) => {
                info!(table = %name, "Point table already active");
                Response::reply(request, true, msg::UPLOADED)
            }
            Ok(code) => failed(request, "activate", code),
            Err(e) => link_failed(request, "activate", e),
        }
    }

    /// Resolved, existing local path from the request's `path` field.
    async fn upload_path(&self, request: &Request) -> Result<PathBuf, Box<Response>> {
        let Some(raw) = request.str_field("path") else {
            return Err(Box::new(Response::reply(request, false, msg::MISSING_PATH)));
        };
        let resolved = resolve_upload_path(
            raw,
            &self.base_dir,
            &self.config.scripts_dir,
            &self.config.point_table_dir,
        )
        .await;
        if tokio::fs::metadata(&resolved).await.is_err() {
            return Err(Box::new(Response::reply(request, false, msg::INVALID_PATH)));
        }
        Ok(resolved)
    }
}

#[async_trait]
impl<L: ArmLink> CommandHandler for ArmHandler<L> {
    async fn handle(&mut self, request: Request) -> Response {
        match request.command_type().as_str() {
            "run_lua" | "run_program" => self.run_program(&request).await,
            "upload_lua" => self.upload_program(&request).await,
            "upload_tech_point" | "upload_techpoint" => self.upload_point_table(&request).await,
            _ => Response::reply(&request, false, msg::UNKNOWN_COMMAND),
        }
    }
}

fn failed(request: &Request, stage: &str, code: i32) -> Response {
    warn!(correlation_id = %request.correlation_id, stage, code, "Controller returned error code");
    LabcellError::EndpointFailure(msg::FAILED.into())
        .reply_to(request)
        .with_extra("stage", stage)
        .with_extra("code", code)
}

fn link_failed(request: &Request, stage: &str, err: LinkError) -> Response {
    warn!(correlation_id = %request.correlation_id, stage, error = %err, "Controller call failed");
    LabcellError::EndpointFailure(msg::FAILED.into())
        .reply_to(request)
        .with_extra("stage", stage)
        .with_extra("detail", err.to_string())
}

/// Resolve an upload path.
///
/// Absolute paths are used as given. A bare file name is looked up in
/// `scripts_dir`, then `point_table_dir`. Anything else is relative to
/// `base_dir`.
pub async fn resolve_upload_path(
    raw: &str,
    base_dir: &Path,
    scripts_dir: &str,
    point_table_dir: &str,
) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        return path.to_path_buf();
    }

    if path.components().count() == 1 {
        for dir in [scripts_dir, point_table_dir] {
            let candidate = base_dir.join(dir).join(path);
            if tokio::fs::metadata(&candidate).await.is_ok() {
                return candidate;
            }
        }
    }

    base_dir.join(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::message::{Payload, Target};
    use serde_json::json;
    use tempfile::TempDir;

    fn request(body: serde_json::Value) -> Request {
        Request::new("c-1", Target::new("arm"), body.as_object().cloned().unwrap_or_else(Payload::new))
    }

    fn handler(base: &Path, run_ms: u64) -> ArmHandler<SimulatedArm> {
        let simulation = SimulationConfig {
            run_duration_ms: run_ms,
            ..Default::default()
        };
        ArmHandler::new(
            SimulatedArm::new(&simulation),
            ArmConfig::default(),
            base,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_lua_completes() {
        let temp = TempDir::new().unwrap();
        let mut arm = handler(temp.path(), 1500);

        let response = arm
            .handle(request(json!({ "type": "run_lua", "file": "pick.lua" })))
            .await;

        assert!(response.ok, "{response:?}");
        assert_eq!(response.message, "completed");
        assert_eq!(response.extra["seen_busy"], true);
        assert_eq!(arm.link().loaded().await.as_deref(), Some("/fruser/pick.lua"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_program_timeout() {
        let temp = TempDir::new().unwrap();
        let mut arm = handler(temp.path(), 10_000);

        let response = arm
            .handle(request(json!({ "command": "RUN_PROGRAM", "file": "long.lua", "timeout": 2 })))
            .await;

        assert!(!response.ok);
        assert_eq!(response.message, "timeout");
        assert_eq!(response.correlation_id.as_deref(), Some("c-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_timeout_is_clamped() {
        let temp = TempDir::new().unwrap();
        let mut arm = handler(temp.path(), 1500);

        let response = arm
            .handle(request(json!({ "type": "run_lua", "file": "pick.lua", "timeout": 1e300 })))
            .await;

        assert!(response.ok, "{response:?}");
        assert_eq!(response.message, "completed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_blind_controller_answers_unsupported() {
        let temp = TempDir::new().unwrap();
        let simulation = SimulationConfig {
            run_duration_ms: 500,
            capabilities: Vec::new(),
            ..Default::default()
        };
        let mut arm = ArmHandler::new(SimulatedArm::new(&simulation), ArmConfig::default(), temp.path());

        let response = arm
            .handle(request(json!({ "type": "run_lua", "file": "pick.lua", "timeout": 2 })))
            .await;

        assert!(!response.ok);
        assert_eq!(response.message, "unsupported:telemetry");
        assert_eq!(response.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(response.extra["seen_busy"], false);
        assert!(arm.tracker().telemetry_unavailable());
    }

    #[tokio::test]
    async fn test_run_lua_missing_file() {
        let temp = TempDir::new().unwrap();
        let mut arm = handler(temp.path(), 100);
        let response = arm.handle(request(json!({ "type": "run_lua" }))).await;
        assert_eq!(response.message, "Missing file");
    }

    #[tokio::test]
    async fn test_load_failure_reports_code() {
        let temp = TempDir::new().unwrap();
        let mut arm = ArmHandler::new(
            SimulatedArm::new(&SimulationConfig::default()).with_load_code(14),
            ArmConfig::default(),
            temp.path(),
        );

        let response = arm
            .handle(request(json!({ "type": "run_lua", "file": "x.lua" })))
            .await;

        assert!(!response.ok);
        assert_eq!(response.message, "failed");
        assert_eq!(response.extra["stage"], "load");
        assert_eq!(response.extra["code"], 14);
    }

    #[tokio::test]
    async fn test_upload_lua_resolves_scripts_dir() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("lua_scripts")).unwrap();
        std::fs::write(temp.path().join("lua_scripts/pick.lua"), b"-- pick").unwrap();
        let mut arm = handler(temp.path(), 100);

        let response = arm
            .handle(request(json!({ "type": "upload_lua", "path": "pick.lua" })))
            .await;
        assert!(response.ok);
        assert_eq!(response.message, "uploaded");

        let response = arm
            .handle(request(json!({ "type": "upload_lua", "path": "missing.lua" })))
            .await;
        assert_eq!(response.message, "Invalid path");

        let response = arm.handle(request(json!({ "type": "upload_lua" }))).await;
        assert_eq!(response.message, "Missing path");
    }

    #[tokio::test(start_paused = true)]
    async fn test_point_table_upload_and_activation() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("TechPoint_db")).unwrap();
        std::fs::write(temp.path().join("TechPoint_db/cell.db"), b"db").unwrap();
        let mut arm = handler(temp.path(), 100);

        let response = arm
            .handle(request(json!({ "type": "upload_tech_point", "path": "cell.db" })))
            .await;
        assert!(response.ok);
        assert_eq!(arm.link().active_point_table().await.as_deref(), Some("cell.db"));

        // Re-activating the active table answers 130, still a success.
        let response = arm
            .handle(request(json!({ "type": "upload_techpoint", "path": "cell.db" })))
            .await;
        assert!(response.ok);
    }

    #[tokio::test]
    async fn test_point_table_without_activation() {
        let temp = TempDir::new().unwrap();
        let table = temp.path().join("other.db");
        std::fs::write(&table, b"db").unwrap();
        let mut arm = handler(temp.path(), 100);

        let response = arm
            .handle(request(json!({
                "type": "upload_tech_point",
                "path": table.to_string_lossy(),
                "activate": false,
                "use_old": true
            })))
            .await;

        assert!(response.ok);
        assert_eq!(arm.link().active_point_table().await, None);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let temp = TempDir::new().unwrap();
        let mut arm = handler(temp.path(), 100);
        let response = arm.handle(request(json!({ "type": "dance" }))).await;
        assert!(!response.ok);
        assert_eq!(response.message, "Unknown command type");
    }

    #[tokio::test]
    async fn test_resolve_upload_path_order() {
        let temp = TempDir::new().unwrap();
        let base = temp.path();
        std::fs::create_dir_all(base.join("lua_scripts")).unwrap();
        std::fs::create_dir_all(base.join("TechPoint_db")).unwrap();
        std::fs::write(base.join("lua_scripts/a.lua"), b"").unwrap();
        std::fs::write(base.join("TechPoint_db/a.lua"), b"").unwrap();
        std::fs::write(base.join("TechPoint_db/b.db"), b"").unwrap();

        let resolve = |raw: &'static str| resolve_upload_path(raw, base, "lua_scripts", "TechPoint_db");
        assert_eq!(resolve("a.lua").await, base.join("lua_scripts/a.lua"));
        assert_eq!(resolve("b.db").await, base.join("TechPoint_db/b.db"));
        assert_eq!(resolve("sub/c.lua").await, base.join("sub/c.lua"));
        assert_eq!(resolve("nope.lua").await, base.join("nope.lua"));
    }
}
