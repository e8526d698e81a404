//! Middleware pipeline: ordered stages fed by a single bounded ingress
//!
//! Requests are consumed by exactly one task, so they are processed in the
//! order the read pumps pushed them. A full ingress makes the pushing read
//! pump wait; nothing is dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::HubHandle;
use crate::session::SessionToken;

/// One inbound frame, tagged with the session it arrived on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub session: SessionToken,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

impl Request {
    pub fn new(session: SessionToken, payload: impl Into<String>) -> Self {
        Self {
            session,
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// What a stage wants done with the request it was handed
#[derive(Debug)]
pub enum Flow {
    /// Pass the (possibly rewritten) request to the next stage
    Continue(Request),
    /// Stop here; later stages never see the request
    Halt,
}

/// What stages can reach while handling a request
#[derive(Clone)]
pub struct PipelineContext {
    hub: HubHandle,
}

impl PipelineContext {
    pub fn new(hub: HubHandle) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }
}

/// A single processing stage
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, request: Request, ctx: &PipelineContext) -> anyhow::Result<Flow>;
}

/// Ordered stage list plus its ingress queue
pub struct MiddlewarePipeline {
    stages: Vec<Arc<dyn Middleware>>,
    ingress_tx: mpsc::Sender<Request>,
    ingress_rx: mpsc::Receiver<Request>,
}

impl MiddlewarePipeline {
    /// Create an empty pipeline whose ingress holds `capacity` requests
    pub fn new(capacity: usize) -> Self {
        let (ingress_tx, ingress_rx) = mpsc::channel(capacity.max(1));
        Self {
            stages: Vec::new(),
            ingress_tx,
            ingress_rx,
        }
    }

    /// Append a stage; stages run in registration order
    pub fn register(&mut self, stage: Arc<dyn Middleware>) {
        debug!(stage = stage.name(), position = self.stages.len(), "registering middleware");
        self.stages.push(stage);
    }

    /// Producer side of the ingress, handed to each read pump
    pub fn sender(&self) -> mpsc::Sender<Request> {
        self.ingress_tx.clone()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Consume the ingress until cancelled or every sender is dropped.
    pub async fn run(self, ctx: PipelineContext, cancel: CancellationToken) {
        let Self {
            stages,
            ingress_tx,
            mut ingress_rx,
        } = self;
        drop(ingress_tx);
        info!(stages = stages.len(), "middleware pipeline started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("middleware pipeline shutting down");
                    break;
                }
                request = ingress_rx.recv() => match request {
                    Some(request) => {
                        process(&stages, request, &ctx).await;
                    }
                    None => {
                        info!("middleware ingress closed");
                        break;
                    }
                },
            }
        }
    }

    pub fn spawn(self, ctx: PipelineContext, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(ctx, cancel))
    }
}

/// Run one request through the stages. Returns the request as the last
/// stage left it, or `None` if a stage halted or failed.
pub async fn process(
    stages: &[Arc<dyn Middleware>],
    request: Request,
    ctx: &PipelineContext,
) -> Option<Request> {
    let received_at = request.received_at;
    let mut current = request;
    for stage in stages {
        match stage.handle(current, ctx).await {
            Ok(Flow::Continue(next)) => current = next,
            Ok(Flow::Halt) => {
                debug!(stage = stage.name(), "request halted");
                return None;
            }
            Err(e) => {
                warn!(stage = stage.name(), error = %e, "middleware failed, dropping request");
                return None;
            }
        }
    }
    debug!(
        session_token = %current.session,
        latency_ms = (Utc::now() - received_at).num_milliseconds(),
        "request processed"
    );
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::hub::Hub;
    use std::sync::Mutex;

    /// Records payloads it sees, appends a marker, optionally halts
    struct Recorder {
        name: String,
        seen: Arc<Mutex<Vec<String>>>,
        halt_on: Option<String>,
    }

    impl Recorder {
        fn new(name: &str, seen: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                seen,
                halt_on: None,
            }
        }
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, mut request: Request, _ctx: &PipelineContext) -> anyhow::Result<Flow> {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, request.payload));
            if self.halt_on.as_deref() == Some(request.payload.as_str()) {
                return Ok(Flow::Halt);
            }
            request.payload.push('+');
            Ok(Flow::Continue(request))
        }
    }

    struct Failing;

    #[async_trait]
    impl Middleware for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn handle(&self, _request: Request, _ctx: &PipelineContext) -> anyhow::Result<Flow> {
            anyhow::bail!("boom")
        }
    }

    fn ctx() -> PipelineContext {
        let (_hub, handle) = Hub::new(Arc::new(HubConfig::default()));
        PipelineContext::new(handle)
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stages: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Recorder::new("a", seen.clone())),
            Arc::new(Recorder::new("b", seen.clone())),
        ];
        let out = process(&stages, Request::new("t".into(), "x"), &ctx()).await;
        assert_eq!(out.unwrap().payload, "x++");
        assert_eq!(*seen.lock().unwrap(), vec!["a:x", "b:x+"]);
    }

    #[tokio::test]
    async fn test_halt_stops_chain() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut first = Recorder::new("a", seen.clone());
        first.halt_on = Some("stop".to_string());
        let stages: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(first),
            Arc::new(Recorder::new("b", seen.clone())),
        ];
        assert!(process(&stages, Request::new("t".into(), "stop"), &ctx()).await.is_none());
        assert_eq!(*seen.lock().unwrap(), vec!["a:stop"]);
    }

    #[tokio::test]
    async fn test_failure_drops_request() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stages: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Failing),
            Arc::new(Recorder::new("b", seen.clone())),
        ];
        assert!(process(&stages, Request::new("t".into(), "x"), &ctx()).await.is_none());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_processes_fifo() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = MiddlewarePipeline::new(4);
        pipeline.register(Arc::new(Recorder::new("r", seen.clone())));
        assert_eq!(pipeline.len(), 1);

        let tx = pipeline.sender();
        let task = pipeline.spawn(ctx(), CancellationToken::new());
        for i in 0..20 {
            tx.send(Request::new("t".into(), format!("{i}"))).await.unwrap();
        }
        drop(tx);
        task.await.unwrap();

        let expected: Vec<String> = (0..20).map(|i| format!("r:{i}")).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_full_ingress_blocks_producer() {
        let pipeline = MiddlewarePipeline::new(1);
        let tx = pipeline.sender();
        tx.send(Request::new("t".into(), "first")).await.unwrap();

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            tx.send(Request::new("t".into(), "second")),
        )
        .await;
        assert!(blocked.is_err());
        drop(pipeline);
    }
}
