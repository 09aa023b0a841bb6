//! labcell - lab-cell command orchestration
//!
//! Sends JSON commands to device controllers over a file-drop queue or
//! HTTP, correlates each response with its request, decides when a robot
//! arm has actually finished moving, and runs fail-fast workflows of such
//! commands across devices.

pub mod config;
pub mod devices;
pub mod dispatch;
pub mod error;
pub mod message;
#[cfg(feature = "http")]
pub mod server;
pub mod telemetry;
pub mod tracker;
pub mod transport;
pub mod utils;
pub mod worker;
pub mod workflow;

pub use config::Config;
pub use dispatch::CorrelatedDispatcher;
pub use error::LabcellError;
pub use message::{Payload, Request, Response, Target};
pub use tracker::CompletionTracker;
pub use worker::{CommandHandler, QueueWorker};
pub use workflow::{WorkflowDefinition, WorkflowEngine, WorkflowResult};
