//! Built-in middleware stages

use async_trait::async_trait;
use tracing::debug;

use crate::pipeline::{Flow, Middleware, PipelineContext, Request};

/// Halts requests whose payload is empty after normalization
pub struct DropEmpty;

#[async_trait]
impl Middleware for DropEmpty {
    fn name(&self) -> &str {
        "drop_empty"
    }

    async fn handle(&self, request: Request, _ctx: &PipelineContext) -> anyhow::Result<Flow> {
        if request.payload.is_empty() {
            debug!(session = %request.session, "dropping empty payload");
            return Ok(Flow::Halt);
        }
        Ok(Flow::Continue(request))
    }
}

/// Fans the payload out to every live session through the hub
pub struct Broadcaster;

#[async_trait]
impl Middleware for Broadcaster {
    fn name(&self) -> &str {
        "broadcaster"
    }

    async fn handle(&self, request: Request, ctx: &PipelineContext) -> anyhow::Result<Flow> {
        ctx.hub().broadcast(request.payload.as_str()).await?;
        Ok(Flow::Continue(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, next_client_id};
    use crate::config::HubConfig;
    use crate::hub::Hub;
    use crate::pipeline::process;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_drop_empty_halts() {
        let (_hub, handle) = Hub::new(Arc::new(HubConfig::default()));
        let ctx = PipelineContext::new(handle);

        let flow = DropEmpty.handle(Request::new("t".into(), ""), &ctx).await.unwrap();
        assert!(matches!(flow, Flow::Halt));

        let flow = DropEmpty.handle(Request::new("t".into(), "hi"), &ctx).await.unwrap();
        assert!(matches!(flow, Flow::Continue(r) if r.payload == "hi"));
    }

    #[tokio::test]
    async fn test_broadcaster_reaches_registered_client() {
        let config = Arc::new(HubConfig::default());
        let (hub, handle) = Hub::new(config.clone());
        let cancel = CancellationToken::new();
        let task = hub.spawn(cancel.clone());

        let (client, mut queues) = Client::new(next_client_id(), &config);
        handle.register(client.clone(), None).await.unwrap();
        assert!(queues.tokens.recv().await.is_some());

        let ctx = PipelineContext::new(handle);
        let stages: Vec<Arc<dyn Middleware>> = vec![Arc::new(DropEmpty), Arc::new(Broadcaster)];
        process(&stages, Request::new("t".into(), ""), &ctx).await;
        process(&stages, Request::new("t".into(), "hello"), &ctx).await;

        assert_eq!(queues.messages.recv().await.as_deref(), Some("hello"));
        assert!(queues.messages.try_recv().is_err());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcaster_fails_when_hub_gone() {
        let (hub, handle) = Hub::new(Arc::new(HubConfig::default()));
        drop(hub);
        let ctx = PipelineContext::new(handle);
        assert!(Broadcaster.handle(Request::new("t".into(), "x"), &ctx).await.is_err());
    }
}
