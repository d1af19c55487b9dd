//! Dispatch
//!
//! Turning "I need this stage's artifact" into a result.
//!
//! Every transport implements [`Dispatcher`]. The [`MuxDispatcher`] is the
//! correlation-id broker used when external workers pull requests and push
//! results; the other transports serve requests directly.

pub mod batch;
pub mod error;
pub mod file;
pub mod inline;
pub mod interactive;
pub mod mux;
pub mod tracking;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::pipeline::Stage;

pub use batch::{BatchFileDispatcher, BatchManifest, BatchStatus};
pub use error::{DispatchError, DispatchResult};
pub use file::{FileDispatcher, ResultEnvelope, SignalRecord, SignalStatus};
pub use inline::{serve, InlineDispatcher, Worker};
pub use interactive::InteractiveDispatcher;
pub use mux::MuxDispatcher;
pub use tracking::{DispatchTracker, TrackingDispatcher};

/// File locations for transports that exchange requests through the filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLocations {
    pub request_path: PathBuf,
    pub result_path: PathBuf,
}

/// A unit of work before the dispatcher has assigned it an id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub case_id: String,
    pub stage: Stage,
    /// Request body handed to the worker
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<RequestLocations>,
}

impl DispatchRequest {
    pub fn new(case_id: &str, stage: Stage, payload: serde_json::Value) -> Self {
        Self {
            case_id: case_id.to_string(),
            stage,
            payload,
            locations: None,
        }
    }

    pub fn with_locations(mut self, request_path: PathBuf, result_path: PathBuf) -> Self {
        self.locations = Some(RequestLocations {
            request_path,
            result_path,
        });
        self
    }
}

/// A request with its dispatcher-assigned correlation id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuedRequest {
    pub dispatch_id: u64,
    #[serde(flatten)]
    pub request: DispatchRequest,
}

/// Optional capability: acknowledge that a result was consumed
pub trait Finalizer: Send + Sync {
    fn mark_done(&self, request: &DispatchRequest) -> DispatchResult<()>;
}

/// Take a request, return the worker's raw result bytes
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> DispatchResult<Vec<u8>>;

    /// Short transport name for logs and reports
    fn name(&self) -> &'static str;

    fn finalizer(&self) -> Option<&dyn Finalizer> {
        None
    }
}

/// Shared reference to a dispatcher
pub type SharedDispatcher = Arc<dyn Dispatcher>;

#[async_trait]
impl<D: Dispatcher + ?Sized> Dispatcher for Arc<D> {
    async fn dispatch(&self, request: DispatchRequest) -> DispatchResult<Vec<u8>> {
        (**self).dispatch(request).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn finalizer(&self) -> Option<&dyn Finalizer> {
        (**self).finalizer()
    }
}
