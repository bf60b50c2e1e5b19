#![allow(dead_code)]

pub mod tracing_capture;

use funcworker::errors::TransportError;
use funcworker::protocol::{
    BindingDirection, BindingInfo, Content, FunctionLoadRequest, FunctionLoadResponse, InvocationRequest,
    InvocationResponse, ParameterBinding, RpcFunctionMetadata, StreamingMessage, TypedData, WorkerInitRequest,
    WorkerInitResponse,
};
use funcworker::runtime::{
    ConverterRegistry, FunctionContext, FunctionContextFactory, FunctionDefinition, FunctionRegistry, FunctionStore,
    ParamType, Worker,
};
use funcworker::value::{Record, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// In-memory host: drives a worker through channels instead of a socket.
pub struct Harness {
    pub worker: Arc<Worker>,
    host_tx: Option<mpsc::Sender<StreamingMessage>>,
    host_rx: mpsc::Receiver<StreamingMessage>,
    pending: VecDeque<StreamingMessage>,
    join: Option<JoinHandle<Result<(), TransportError>>>,
    next_id: u64,
}

impl Harness {
    pub fn start(worker: Arc<Worker>) -> Self {
        let (host_tx, inbound) = mpsc::channel(256);
        let (outbound, host_rx) = mpsc::channel(256);
        let join = tokio::spawn(worker.clone().run(inbound, outbound));
        Self {
            worker,
            host_tx: Some(host_tx),
            host_rx,
            pending: VecDeque::new(),
            join: Some(join),
            next_id: 0,
        }
    }

    /// Start a worker and complete the init handshake.
    pub async fn started(worker: Arc<Worker>) -> Self {
        let mut harness = Self::start(worker);
        let init = harness.init().await;
        assert!(init.result.is_success(), "init failed: {:?}", init.result);
        harness
    }

    pub fn next_request_id(&mut self) -> String {
        self.next_id += 1;
        format!("req-{}", self.next_id)
    }

    pub async fn send_with_id(&self, request_id: impl Into<String>, content: Content) {
        self.host_tx
            .as_ref()
            .expect("host channel already closed")
            .send(StreamingMessage::new(request_id, content))
            .await
            .expect("worker stopped reading");
    }

    pub async fn send(&mut self, content: Content) -> String {
        let id = self.next_request_id();
        self.send_with_id(id.clone(), content).await;
        id
    }

    /// Next message from the worker, in arrival order.
    pub async fn recv(&mut self) -> StreamingMessage {
        if let Some(msg) = self.pending.pop_front() {
            return msg;
        }
        tokio::time::timeout(RESPONSE_TIMEOUT, self.host_rx.recv())
            .await
            .expect("timed out waiting for worker message")
            .expect("worker closed the outbound channel")
    }

    /// Wait for the response correlated with `request_id`, buffering others.
    pub async fn recv_for(&mut self, request_id: &str) -> StreamingMessage {
        if let Some(pos) = self.pending.iter().position(|m| m.request_id == request_id) {
            return self.pending.remove(pos).expect("position is valid");
        }
        loop {
            let msg = tokio::time::timeout(RESPONSE_TIMEOUT, self.host_rx.recv())
                .await
                .expect("timed out waiting for correlated response")
                .expect("worker closed the outbound channel");
            if msg.request_id == request_id {
                return msg;
            }
            self.pending.push_back(msg);
        }
    }

    pub async fn request(&mut self, content: Content) -> StreamingMessage {
        let id = self.send(content).await;
        self.recv_for(&id).await
    }

    /// Assert that the worker sends nothing for `ms` milliseconds.
    pub async fn expect_silence(&mut self, ms: u64) {
        assert!(self.pending.is_empty(), "unexpected buffered messages: {:?}", self.pending);
        if let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(ms), self.host_rx.recv()).await {
            panic!("expected no message, got {msg:?}");
        }
    }

    pub async fn init(&mut self) -> WorkerInitResponse {
        let msg = self
            .request(Content::WorkerInitRequest(WorkerInitRequest {
                host_version: "4.0.0".into(),
                ..Default::default()
            }))
            .await;
        match msg.content {
            Content::WorkerInitResponse(r) => r,
            other => panic!("expected init response, got {other:?}"),
        }
    }

    pub async fn load(
        &mut self,
        function_id: &str,
        entry_point: &str,
        bindings: Vec<BindingInfo>,
    ) -> FunctionLoadResponse {
        let msg = self
            .request(Content::FunctionLoadRequest(load_request(function_id, entry_point, bindings)))
            .await;
        match msg.content {
            Content::FunctionLoadResponse(r) => r,
            other => panic!("expected load response, got {other:?}"),
        }
    }

    pub async fn invoke(&mut self, request: InvocationRequest) -> InvocationResponse {
        let msg = self.request(Content::InvocationRequest(request)).await;
        into_invocation_response(msg)
    }

    /// Close the host side and wait for the worker loop to finish.
    pub async fn close(mut self) -> Result<(), TransportError> {
        self.host_tx.take();
        self.join_worker().await
    }

    pub async fn join_worker(&mut self) -> Result<(), TransportError> {
        let join = self.join.take().expect("worker already joined");
        tokio::time::timeout(Duration::from_secs(10), join)
            .await
            .expect("worker did not stop")
            .expect("worker task panicked")
    }
}

pub fn into_invocation_response(msg: StreamingMessage) -> InvocationResponse {
    match msg.content {
        Content::InvocationResponse(r) => r,
        other => panic!("expected invocation response, got {other:?}"),
    }
}

pub fn load_request(function_id: &str, entry_point: &str, bindings: Vec<BindingInfo>) -> FunctionLoadRequest {
    FunctionLoadRequest {
        function_id: function_id.to_string(),
        metadata: RpcFunctionMetadata {
            name: entry_point.to_string(),
            entry_point: entry_point.to_string(),
            bindings,
            ..Default::default()
        },
    }
}

pub fn trigger(name: &str) -> BindingInfo {
    BindingInfo::new(name, "httpTrigger", BindingDirection::In)
}

pub fn output(name: &str) -> BindingInfo {
    BindingInfo::new(name, "queue", BindingDirection::Out)
}

pub fn invocation(invocation_id: &str, function_id: &str, inputs: Vec<(&str, Option<TypedData>)>) -> InvocationRequest {
    InvocationRequest {
        invocation_id: invocation_id.to_string(),
        function_id: function_id.to_string(),
        input_data: inputs
            .into_iter()
            .map(|(name, data)| ParameterBinding::new(name, data))
            .collect(),
        ..Default::default()
    }
}

pub fn output_named<'a>(response: &'a InvocationResponse, name: &str) -> Option<&'a Option<TypedData>> {
    response.output_data.iter().find(|b| b.name == name).map(|b| &b.data)
}

/// Functions shared by the integration tests.
pub fn sample_registry() -> FunctionRegistry {
    FunctionRegistry::builder()
        .register_sync("Echo", [("message", ParamType::of::<String>())], |_inv, args| {
            Ok(args.get::<String>("message").cloned().map(Value::from))
        })
        .register_sync("Constant", Vec::<(String, ParamType)>::new(), |_inv, _args| {
            Ok(Some(Value::from("ok")))
        })
        .register_sync("Split", [("text", ParamType::of::<String>())], |_inv, args| {
            let text = args.get::<String>("text").cloned().unwrap_or_default();
            Ok(Some(Value::object(Record::new().with("a", text))))
        })
        .register_sync("Fail", Vec::<(String, ParamType)>::new(), |_inv, _args| {
            Err(funcworker::FunctionFault::new("ValidationError", "quantity must be positive").into())
        })
        .register_sync("Panic", Vec::<(String, ParamType)>::new(), |_inv, _args| {
            panic!("handler exploded")
        })
        .register("Sleepy", [("ms", ParamType::of::<i64>())], |inv, args| async move {
            let ms = args.get::<i64>("ms").copied().unwrap_or(50) as u64;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(Some(Value::from("slept"))),
                _ = inv.cancellation_token().cancelled() => Err(anyhow::anyhow!("stopped early")),
            }
        })
        .register_sync("SideChannel", Vec::<(String, ParamType)>::new(), |inv, _args| {
            inv.set_output("audit", "written");
            inv.add_trace_attribute("custom.tag", "yes");
            inv.add_trace_attribute("faas.execution", "spoofed");
            Ok(Some(Value::object(Record::new().with("queue", "from-return"))))
        })
        .build()
}

/// A context for `entry_point` loaded with `bindings`, outside of any worker.
pub fn context_for(
    registry: &FunctionRegistry,
    entry_point: &str,
    bindings: Vec<BindingInfo>,
    request: InvocationRequest,
    converters: ConverterRegistry,
) -> FunctionContext {
    let store = Arc::new(FunctionStore::new());
    let load = load_request(&request.function_id, entry_point, bindings);
    let definition = FunctionDefinition::from_load_request(&load, registry).expect("definition should load");
    store.insert(definition).expect("fresh store");
    FunctionContextFactory::new(store, Arc::new(converters))
        .create(request, CancellationToken::new())
        .expect("context should be created")
}
