//! Interactive Dispatcher
//!
//! A person at a terminal is the worker.
//!
//! Each dispatch prints a banner naming the request and result files, waits
//! for the operator to press Enter, then reads and validates the result.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::error::{DispatchError, DispatchResult};
use super::file::FileDispatcherConfig;
use super::{DispatchRequest, Dispatcher};
use crate::atomic_file::write_json_atomic;

pub struct InteractiveDispatcher<R, W> {
    input: Mutex<R>,
    output: Mutex<W>,
    paths: FileDispatcherConfig,
    next_id: AtomicU64,
}

impl<R, W> InteractiveDispatcher<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// `paths.work_dir` decides where request/result files go when the
    /// request carries no locations
    pub fn new(input: R, output: W, paths: FileDispatcherConfig) -> Self {
        Self {
            input: Mutex::new(input),
            output: Mutex::new(output),
            paths,
            next_id: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl<R, W> Dispatcher for InteractiveDispatcher<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn dispatch(&self, request: DispatchRequest) -> DispatchResult<Vec<u8>> {
        let dispatch_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let locations = self.paths.locations_for(&request);
        write_json_atomic(&locations.request_path, &request.payload)?;
        // A result left by an earlier pass through this stage must not be read back.
        match tokio::fs::remove_file(&locations.result_path).await {
            Ok(()) => debug!(dispatch_id, "Removed previous result"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // One prompt at a time on a shared terminal.
        let mut output = self.output.lock().await;
        let mut input = self.input.lock().await;

        let banner = format!(
            "\n=== dispatch {dispatch_id}: case {} / {} ===\nRequest: {}\nWrite the artifact JSON to: {}\nPress Enter when done...\n",
            request.case_id,
            request.stage,
            locations.request_path.display(),
            locations.result_path.display(),
        );
        output.write_all(banner.as_bytes()).await?;
        output.flush().await?;

        let mut line = String::new();
        if input.read_line(&mut line).await? == 0 {
            return Err(DispatchError::Cancelled {
                dispatch_id: Some(dispatch_id),
            });
        }

        let bytes = match tokio::fs::read(&locations.result_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DispatchError::EmptyResult { dispatch_id })
            }
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(DispatchError::EmptyResult { dispatch_id });
        }
        serde_json::from_slice::<serde_json::Value>(&bytes).map_err(|e| {
            DispatchError::MalformedResult {
                dispatch_id,
                message: e.to_string(),
            }
        })?;

        info!(dispatch_id, case_id = %request.case_id, stage = %request.stage, "Interactive result read");
        Ok(bytes)
    }

    fn name(&self) -> &'static str {
        "interactive"
    }
}
