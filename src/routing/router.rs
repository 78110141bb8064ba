//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Store compiled routes
//! - Reject duplicate patterns at registration time
//! - Look up the first matching route for an upgrade path
//!
//! # Design Decisions
//! - Immutable after the server is built (shared via Arc without locks)
//! - O(n) scan in registration order (acceptable for typical route counts)
//! - Explicit `None` rather than a silent default route

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::{ConnectionState, HandlerFactory, RequestContext};
use crate::routing::matcher::{Matcher, PathPattern, PatternError};

/// Errors raised while building a route table.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("route '{0}' is already registered")]
    Duplicate(String),
    #[error("invalid route pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: PatternError,
    },
}

/// A validator refused the upgrade request.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct PayloadRejected(pub String);

/// Per-route check run before the handshake completes.
///
/// The returned map becomes the connection state handed to the handler.
#[async_trait]
pub trait PayloadValidator: Send + Sync + 'static {
    async fn validate(&self, request: &RequestContext) -> Result<ConnectionState, PayloadRejected>;
}

#[async_trait]
impl<F> PayloadValidator for F
where
    F: Fn(&RequestContext) -> Result<ConnectionState, PayloadRejected> + Send + Sync + 'static,
{
    async fn validate(&self, request: &RequestContext) -> Result<ConnectionState, PayloadRejected> {
        self(request)
    }
}

/// A registered route: pattern, handler factory, optional validator.
pub struct Route {
    pattern: String,
    matcher: Box<dyn Matcher>,
    handler: Arc<dyn HandlerFactory>,
    validator: Option<Arc<dyn PayloadValidator>>,
}

impl Route {
    fn new(
        pattern: &str,
        handler: Arc<dyn HandlerFactory>,
        validator: Option<Arc<dyn PayloadValidator>>,
    ) -> Result<Self, RouteError> {
        let matcher = PathPattern::parse(pattern).map_err(|source| RouteError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;

        Ok(Self {
            pattern: pattern.to_string(),
            matcher: Box::new(matcher),
            handler,
            validator,
        })
    }

    /// The pattern this route was registered with.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn handler(&self) -> &Arc<dyn HandlerFactory> {
        &self.handler
    }

    pub fn validator(&self) -> Option<&Arc<dyn PayloadValidator>> {
        self.validator.as_ref()
    }

    pub fn test(&self, path: &str) -> bool {
        self.matcher.test(path)
    }

    /// Extract path parameters. Empty when the route has none or does not match.
    pub fn params(&self, path: &str) -> HashMap<String, String> {
        self.matcher.captures(path).unwrap_or_default()
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("pattern", &self.pattern)
            .field("protocols", &self.handler.protocols())
            .field("validated", &self.validator.is_some())
            .finish()
    }
}

/// Ordered set of upgrade routes.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a pattern.
    pub fn register<H>(&mut self, pattern: &str, handler: H) -> Result<(), RouteError>
    where
        H: HandlerFactory,
    {
        self.insert(Route::new(pattern, Arc::new(handler), None)?)
    }

    /// Register a handler whose upgrades must pass `validator` first.
    pub fn register_validated<H, V>(
        &mut self,
        pattern: &str,
        handler: H,
        validator: V,
    ) -> Result<(), RouteError>
    where
        H: HandlerFactory,
        V: PayloadValidator,
    {
        self.insert(Route::new(pattern, Arc::new(handler), Some(Arc::new(validator)))?)
    }

    fn insert(&mut self, route: Route) -> Result<(), RouteError> {
        if self.routes.iter().any(|r| r.pattern == route.pattern) {
            return Err(RouteError::Duplicate(route.pattern));
        }

        tracing::debug!(pattern = %route.pattern, "Route registered");
        self.routes.push(Arc::new(route));
        Ok(())
    }

    /// First registered route matching `path`.
    pub fn resolve(&self, path: &str) -> Option<Arc<Route>> {
        self.routes.iter().find(|r| r.test(path)).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
