//! Binds the operation layer to the protocol handle interface.

use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;

use super::layer::{OperationHandler, OperationLayer};
use super::messages::GRAPHQL_WS;
use crate::net::connection::ConnectionHandle;
use crate::protocol::{ConnectionContext, HandlerError, HandlerFactory, ProtocolHandle};

const PROTOCOLS: &[&str] = &[GRAPHQL_WS];

/// Handler factory for a `graphql-ws` route.
pub struct GraphqlRoute<H> {
    handler: Arc<H>,
}

impl<H: OperationHandler> GraphqlRoute<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }

    pub fn from_arc(handler: Arc<H>) -> Self {
        Self { handler }
    }
}

impl<H: OperationHandler> HandlerFactory for GraphqlRoute<H> {
    fn protocols(&self) -> &[&str] {
        PROTOCOLS
    }

    fn create(&self, ctx: Arc<ConnectionContext>, out: ConnectionHandle) -> Box<dyn ProtocolHandle> {
        Box::new(OperationLayer::new(self.handler.clone(), ctx, out))
    }
}

#[async_trait]
impl<H: OperationHandler> ProtocolHandle for OperationLayer<H> {
    async fn on_connect(&mut self) -> Result<(), HandlerError> {
        self.handler().on_connect(self.context()).await
    }

    async fn handle(&mut self, message: String) -> Result<ControlFlow<()>, HandlerError> {
        OperationLayer::handle(self, &message).await
    }

    async fn shutdown(&mut self) {
        self.close();
    }

    async fn on_close(&mut self) {
        self.handler().on_close(self.context()).await;
    }
}
