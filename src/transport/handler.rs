//! Method handlers for inbound requests

use async_trait::async_trait;
use std::future::Future;

use crate::protocol::Frame;

/// Serves one named method.
///
/// Arguments and results are flat string maps; typed interpretation is the
/// handler's business. An `Err` is sent back to the caller as
/// `status=error` with the error's message.
#[async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    async fn handle(&self, args: Frame) -> anyhow::Result<Frame>;
}

/// Adapts an async closure into a [`MethodHandler`]
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(Frame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Frame>> + Send + 'static,
{
    async fn handle(&self, args: Frame) -> anyhow::Result<Frame> {
        (self.0)(args).await
    }
}

/// Replies with its arguments unchanged
pub struct EchoHandler;

#[async_trait]
impl MethodHandler for EchoHandler {
    async fn handle(&self, args: Frame) -> anyhow::Result<Frame> {
        Ok(args)
    }
}
