use super::connector::UpstreamConnector;
use crate::routing::RoutingEngine;
use std::sync::Arc;

/// Process-wide state shared by every session.
pub struct ProxyContext {
    pub engine: Arc<RoutingEngine>,
    pub connector: UpstreamConnector,
}

impl ProxyContext {
    pub fn new(engine: Arc<RoutingEngine>) -> Self {
        Self {
            engine,
            connector: UpstreamConnector::new(),
        }
    }
}
