use std::sync::Arc;

use {
    axum::{Router, middleware, routing::MethodRouter},
    naclgate_auth::{AuthGate, ResponseShape, authenticate},
};

use crate::runtime::LifecycleError;

/// A router whose routes each declare how authentication failures are answered.
///
/// Shaped routes get the auth middleware as a route layer. Routes added with
/// [`open`](Self::open) carry no shape, so they must be excluded by the gate;
/// anything else fails [`build`](Self::build).
pub struct GuardedRouter<S = ()> {
    gate: Arc<AuthGate>,
    router: Router<S>,
    unshaped: Vec<String>,
}

impl<S> GuardedRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new(gate: Arc<AuthGate>) -> Self {
        Self {
            gate,
            router: Router::new(),
            unshaped: Vec::new(),
        }
    }

    /// Failures become `401 Unauthorized`.
    pub fn plain(self, path: &str, route: MethodRouter<S>) -> Self {
        self.shaped(path, route, ResponseShape::Plain)
    }

    /// Failures complete the upgrade and close with a protocol error.
    pub fn stream(self, path: &str, route: MethodRouter<S>) -> Self {
        self.shaped(path, route, ResponseShape::Stream)
    }

    pub fn open(mut self, path: &str, route: MethodRouter<S>) -> Self {
        if !self.gate.is_path_excluded(path) {
            self.unshaped.push(path.to_string());
        }
        self.router = self.router.route(path, route);
        self
    }

    pub fn build(self) -> Result<Router<S>, LifecycleError> {
        match self.unshaped.into_iter().next() {
            Some(path) => Err(LifecycleError::UnshapedRoute(path)),
            None => Ok(self.router),
        }
    }

    fn shaped(mut self, path: &str, route: MethodRouter<S>, shape: ResponseShape) -> Self {
        let route = route.route_layer(middleware::from_fn_with_state(
            (Arc::clone(&self.gate), shape),
            authenticate,
        ));
        self.router = self.router.route(path, route);
        self
    }
}
