//! Message routing: one handler per envelope kind.

use super::definition::FunctionDefinition;
use super::{REQUIRED_CAPABILITIES, Worker};
use crate::errors::{InvocationError, TransportError};
use crate::protocol::{
    Content, FunctionEnvironmentReloadRequest, FunctionEnvironmentReloadResponse, FunctionLoadRequest,
    FunctionLoadResponse, FunctionMetadataResponse, FunctionsMetadataRequest, InvocationResponse, PROTOCOL_VERSION,
    RpcException, StatusResult, StreamingMessage, WorkerInitRequest, WorkerInitResponse, WorkerMetadata,
    WorkerStatusResponse, kind_of,
};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

fn failure(type_name: &str, message: impl Into<String>) -> StatusResult {
    StatusResult::failure(RpcException {
        type_name: type_name.to_string(),
        message: message.into(),
        stack_trace: String::new(),
        is_user_exception: false,
    })
}

async fn reply(
    outbound: &mpsc::Sender<StreamingMessage>,
    request_id: String,
    content: Content,
) -> Result<(), TransportError> {
    outbound
        .send(StreamingMessage::new(request_id, content))
        .await
        .map_err(|_| TransportError::Closed)
}

impl Worker {
    /// Handle one inbound message. Returns the grace period when the message
    /// asks the worker to terminate.
    pub(super) async fn route(
        &self,
        message: StreamingMessage,
        outbound: &mpsc::Sender<StreamingMessage>,
        tasks: &mut JoinSet<()>,
    ) -> Result<Option<Duration>, TransportError> {
        let StreamingMessage { request_id, content } = message;
        let kind = kind_of(&content);
        debug!(target: "funcworker::runtime::router", request_id = %request_id, kind = %kind, "message received");

        if !self.is_initialized() && !matches!(content, Content::WorkerInitRequest(_)) {
            warn!(request_id = %request_id, kind = %kind, "router: worker not initialized, dropping message");
            self.metrics.record_message_dropped();
            return Ok(None);
        }

        match content {
            Content::WorkerInitRequest(req) => {
                let response = self.handle_init(req);
                reply(outbound, request_id, Content::WorkerInitResponse(response)).await?;
            }
            Content::FunctionLoadRequest(req) => {
                let response = self.handle_load(req);
                reply(outbound, request_id, Content::FunctionLoadResponse(response)).await?;
            }
            Content::FunctionsMetadataRequest(req) => {
                let response = self.handle_metadata(req);
                reply(outbound, request_id, Content::FunctionMetadataResponse(response)).await?;
            }
            Content::InvocationRequest(req) => {
                if !self.is_accepting() {
                    let err = InvocationError::ShuttingDown;
                    warn!(
                        request_id = %request_id,
                        invocation_id = %req.invocation_id,
                        "router: rejecting invocation during shutdown"
                    );
                    let response = InvocationResponse::failed(
                        req.invocation_id,
                        StatusResult::failure(err.to_rpc_exception(false, false)),
                    );
                    reply(outbound, request_id, Content::InvocationResponse(response)).await?;
                    return Ok(None);
                }
                let handler = self.invocations.clone();
                let outbound = outbound.clone();
                tasks.spawn(async move {
                    let invocation_id = req.invocation_id.clone();
                    let response = handler.invoke(req).await;
                    if reply(&outbound, request_id, Content::InvocationResponse(response))
                        .await
                        .is_err()
                    {
                        warn!(invocation_id = %invocation_id, "router: outbound closed, dropping invocation response");
                    }
                });
            }
            Content::InvocationCancel(cancel) => {
                if self.invocations.cancel(&cancel.invocation_id) {
                    info!(invocation_id = %cancel.invocation_id, "invocation cancellation requested");
                } else {
                    debug!(invocation_id = %cancel.invocation_id, "cancel for unknown or finished invocation ignored");
                }
            }
            Content::FunctionEnvironmentReloadRequest(req) => {
                let response = self.handle_reload(req);
                reply(outbound, request_id, Content::FunctionEnvironmentReloadResponse(response)).await?;
            }
            Content::WorkerStatusRequest(_) => {
                reply(outbound, request_id, Content::WorkerStatusResponse(WorkerStatusResponse::default())).await?;
            }
            Content::WorkerTerminate(terminate) => {
                let grace = terminate
                    .grace_period_ms
                    .map(Duration::from_millis)
                    .unwrap_or(self.options.terminate_grace_period);
                return Ok(Some(grace));
            }
            Content::StartStream(_)
            | Content::WorkerInitResponse(_)
            | Content::FunctionLoadResponse(_)
            | Content::FunctionMetadataResponse(_)
            | Content::InvocationResponse(_)
            | Content::FunctionEnvironmentReloadResponse(_)
            | Content::WorkerStatusResponse(_)
            | Content::Unknown => {
                warn!(request_id = %request_id, kind = %kind, "router: unsupported message kind, dropping message");
                self.metrics.record_message_dropped();
            }
        }
        Ok(None)
    }

    fn handle_init(&self, req: WorkerInitRequest) -> WorkerInitResponse {
        if self.initialized.swap(true, Ordering::SeqCst) {
            warn!(host_version = %req.host_version, "router: duplicate init request");
            return WorkerInitResponse {
                worker_version: env!("CARGO_PKG_VERSION").to_string(),
                capabilities: self.capabilities(),
                worker_metadata: worker_metadata(),
                result: failure("WorkerAlreadyInitialized", "the worker has already been initialized"),
            };
        }

        info!(
            host_version = %req.host_version,
            function_app_directory = %req.function_app_directory,
            host_capabilities = req.capabilities.len(),
            "worker initialized"
        );
        {
            let mut host = self.host.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            host.host_version = req.host_version;
            host.capabilities = req.capabilities;
            host.function_app_directory = req.function_app_directory;
        }

        WorkerInitResponse {
            worker_version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: self.capabilities(),
            worker_metadata: worker_metadata(),
            result: StatusResult::success(),
        }
    }

    fn handle_load(&self, req: FunctionLoadRequest) -> FunctionLoadResponse {
        let function_id = req.function_id.clone();
        if req.metadata.is_proxy {
            debug!(
                function_id = %function_id,
                name = %req.metadata.name,
                "proxy function acknowledged without loading"
            );
            return FunctionLoadResponse {
                function_id,
                result: StatusResult::success(),
            };
        }

        let loaded = FunctionDefinition::from_load_request(&req, &self.registry).and_then(|def| self.store.insert(def));
        let result = match loaded {
            Ok(def) => {
                self.metrics.record_function_loaded();
                info!(
                    function_id = %def.id,
                    function_name = %def.name,
                    entry_point = %def.entry_point,
                    parameters = def.parameters.len(),
                    projection = ?def.projection,
                    "function loaded"
                );
                StatusResult::success()
            }
            Err(e) => {
                self.metrics.record_load_failure();
                warn!(function_id = %function_id, name = %req.metadata.name, error = %e, "function load failed");
                failure("FunctionLoadError", e.to_string())
            }
        };
        FunctionLoadResponse { function_id, result }
    }

    fn handle_metadata(&self, req: FunctionsMetadataRequest) -> FunctionMetadataResponse {
        let mut functions = self.registry.metadata();
        for f in &mut functions {
            if f.function_id.is_empty() {
                f.function_id = f.entry_point.clone();
            }
        }
        debug!(
            function_app_directory = %req.function_app_directory,
            count = functions.len(),
            "function metadata requested"
        );

        let result = match functions.iter().find(|f| f.bindings.is_empty()) {
            Some(f) => failure(
                "FunctionMetadataError",
                format!(
                    "Functions must declare at least one binding. No bindings were found in the function '{}'",
                    f.name
                ),
            ),
            None => StatusResult::success(),
        };

        FunctionMetadataResponse {
            use_default_metadata_indexing: functions.is_empty(),
            function_metadata_results: functions,
            result,
        }
    }

    /// The app directory is recorded, never made the process working
    /// directory: invocations may be running on other tasks.
    fn handle_reload(&self, req: FunctionEnvironmentReloadRequest) -> FunctionEnvironmentReloadResponse {
        let mut result = StatusResult::success();
        let mut directory = None;
        if !req.function_app_directory.is_empty() {
            match std::fs::metadata(&req.function_app_directory) {
                Ok(meta) if meta.is_dir() => directory = Some(req.function_app_directory),
                Ok(_) => {
                    warn!(directory = %req.function_app_directory, "function app directory is not a directory");
                    result = failure(
                        "EnvironmentReloadError",
                        format!("'{}' is not a directory", req.function_app_directory),
                    );
                }
                Err(e) => {
                    warn!(
                        directory = %req.function_app_directory,
                        error = %e,
                        "function app directory is not accessible"
                    );
                    result = failure("EnvironmentReloadError", e.to_string());
                }
            }
        }

        {
            let mut host = self.host.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            host.environment = req.environment_variables;
            if let Some(directory) = directory {
                host.function_app_directory = directory;
            }
            info!(variables = host.environment.len(), "environment reloaded");
        }

        FunctionEnvironmentReloadResponse {
            worker_metadata: worker_metadata(),
            capabilities: self.capabilities(),
            result,
        }
    }

    /// Option capabilities plus the required set; required ones win.
    pub fn capabilities(&self) -> BTreeMap<String, bool> {
        let mut caps = self.options.capabilities.clone();
        for name in REQUIRED_CAPABILITIES {
            caps.insert(name.to_string(), true);
        }
        caps
    }
}

pub(crate) fn worker_metadata() -> WorkerMetadata {
    WorkerMetadata {
        runtime_name: "rust".to_string(),
        runtime_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
        worker_version: env!("CARGO_PKG_VERSION").to_string(),
        worker_bitness: std::env::consts::ARCH.to_string(),
        custom_properties: BTreeMap::from([("protocol_version".to_string(), PROTOCOL_VERSION.to_string())]),
    }
}
