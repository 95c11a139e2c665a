//! Application hooks for inbound requests and notifications.
//!
//! A session takes one [`RequestHandler`] and one [`NotificationHandler`].
//! [`Router`] implements both: it decodes params with the types registered
//! for each method and forwards anything else to optional raw handlers.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::lsp::error::Error;
use crate::lsp::registry::{MethodRegistry, NotificationMethod, RequestMethod};
use crate::lsp::types::ResponseError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Answers inbound requests. Every request gets exactly one response.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, ResponseError>;
}

/// Receives inbound notifications, in arrival order.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle_notification(&self, method: &str, params: Value);
}

/// Answers every request with `MethodNotFound`.
pub struct MethodNotFound;

#[async_trait]
impl RequestHandler for MethodNotFound {
    async fn handle_request(&self, method: &str, _params: Value) -> Result<Value, ResponseError> {
        Err(ResponseError::method_not_found(method))
    }
}

/// Drops every notification.
pub struct IgnoreNotifications;

#[async_trait]
impl NotificationHandler for IgnoreNotifications {
    async fn handle_notification(&self, method: &str, _params: Value) {
        debug!(method, "ignoring notification");
    }
}

trait ErasedRequest: Send + Sync {
    fn call(&self, params: Value) -> BoxFuture<'static, Result<Value, ResponseError>>;
}

trait ErasedNotification: Send + Sync {
    fn call(&self, params: Value) -> Option<BoxFuture<'static, ()>>;
}

struct TypedRequest<M, F> {
    handler: F,
    _method: PhantomData<fn() -> M>,
}

impl<M, F, Fut> ErasedRequest for TypedRequest<M, F>
where
    M: RequestMethod,
    F: Fn(M::Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<M::Result, ResponseError>> + Send + 'static,
{
    fn call(&self, params: Value) -> BoxFuture<'static, Result<Value, ResponseError>> {
        let params: M::Params = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => {
                let error = ResponseError::invalid_params(format!("{}: {}", M::NAME, e));
                return Box::pin(async move { Err(error) });
            }
        };

        let fut = (self.handler)(params);
        Box::pin(async move {
            let result = fut.await?;
            serde_json::to_value(result).map_err(|e| ResponseError::internal_error(e.to_string()))
        })
    }
}

struct TypedNotification<M, F> {
    handler: F,
    _method: PhantomData<fn() -> M>,
}

impl<M, F, Fut> ErasedNotification for TypedNotification<M, F>
where
    M: NotificationMethod,
    F: Fn(M::Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, params: Value) -> Option<BoxFuture<'static, ()>> {
        match serde_json::from_value::<M::Params>(params) {
            Ok(params) => {
                let fut: BoxFuture<'static, ()> = Box::pin((self.handler)(params));
                Some(fut)
            }
            Err(e) => {
                warn!(method = M::NAME, error = %e, "dropping notification with invalid params");
                None
            }
        }
    }
}

/// Dispatches inbound traffic to typed handlers by method name.
pub struct Router {
    registry: Arc<MethodRegistry>,
    requests: HashMap<&'static str, Box<dyn ErasedRequest>>,
    notifications: HashMap<&'static str, Box<dyn ErasedNotification>>,
    fallback_requests: Option<Arc<dyn RequestHandler>>,
    fallback_notifications: Option<Arc<dyn NotificationHandler>>,
}

impl Router {
    pub fn new(registry: Arc<MethodRegistry>) -> Self {
        Router {
            registry,
            requests: HashMap::new(),
            notifications: HashMap::new(),
            fallback_requests: None,
            fallback_notifications: None,
        }
    }

    /// Handle requests for `M`. `M` must be registered with exactly these types.
    pub fn on_request<M, F, Fut>(mut self, handler: F) -> Result<Self, Error>
    where
        M: RequestMethod,
        F: Fn(M::Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<M::Result, ResponseError>> + Send + 'static,
    {
        self.registry.expect_request::<M>()?;
        self.requests.insert(
            M::NAME,
            Box::new(TypedRequest::<M, F> {
                handler,
                _method: PhantomData,
            }),
        );
        Ok(self)
    }

    /// Handle notifications for `M`. `M` must be registered with exactly this type.
    pub fn on_notification<M, F, Fut>(mut self, handler: F) -> Result<Self, Error>
    where
        M: NotificationMethod,
        F: Fn(M::Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.registry.expect_notification::<M>()?;
        self.notifications.insert(
            M::NAME,
            Box::new(TypedNotification::<M, F> {
                handler,
                _method: PhantomData,
            }),
        );
        Ok(self)
    }

    /// Receives requests with no typed handler, as raw JSON.
    pub fn fallback_requests(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.fallback_requests = Some(handler);
        self
    }

    /// Receives notifications with no typed handler, as raw JSON.
    pub fn fallback_notifications(mut self, handler: Arc<dyn NotificationHandler>) -> Self {
        self.fallback_notifications = Some(handler);
        self
    }

    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }
}

#[async_trait]
impl RequestHandler for Router {
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, ResponseError> {
        if let Some(handler) = self.requests.get(method) {
            return handler.call(params).await;
        }
        if !self.registry.contains(method) {
            debug!(method, "request for unregistered method");
        }
        match &self.fallback_requests {
            Some(fallback) => fallback.handle_request(method, params).await,
            None => Err(ResponseError::method_not_found(method)),
        }
    }
}

#[async_trait]
impl NotificationHandler for Router {
    async fn handle_notification(&self, method: &str, params: Value) {
        if let Some(handler) = self.notifications.get(method) {
            if let Some(fut) = handler.call(params) {
                fut.await;
            }
            return;
        }
        match &self.fallback_notifications {
            Some(fallback) => fallback.handle_notification(method, params).await,
            None => debug!(method, "no handler for notification"),
        }
    }
}
