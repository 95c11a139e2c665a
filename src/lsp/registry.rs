//! Method registry: one parameter type and one result type per method name.
//!
//! Methods are described by marker types implementing [`RequestMethod`] or
//! [`NotificationMethod`]. Shapes are recorded when a method is registered,
//! so a name can never be used with two different Rust types.
//!
//! ```ignore
//! enum Add {}
//!
//! impl RequestMethod for Add {
//!     const NAME: &'static str = "add";
//!     type Params = AddParams;
//!     type Result = i64;
//! }
//!
//! let mut registry = MethodRegistry::lsp();
//! registry.register_request::<Add>()?;
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use crate::lsp::error::Error;

/// A request method: answered by exactly one response.
pub trait RequestMethod: 'static {
    const NAME: &'static str;
    type Params: Serialize + DeserializeOwned + Send + 'static;
    type Result: Serialize + DeserializeOwned + Send + 'static;
}

/// A notification method: never answered.
pub trait NotificationMethod: 'static {
    const NAME: &'static str;
    type Params: Serialize + DeserializeOwned + Send + 'static;
}

/// Uses an `lsp-types` request definition as a [`RequestMethod`].
pub struct LspRequest<R>(PhantomData<R>);

impl<R> RequestMethod for LspRequest<R>
where
    R: lsp_types::request::Request + 'static,
    R::Params: Send + 'static,
    R::Result: Send + 'static,
{
    const NAME: &'static str = R::METHOD;
    type Params = R::Params;
    type Result = R::Result;
}

/// Uses an `lsp-types` notification definition as a [`NotificationMethod`].
pub struct LspNotification<N>(PhantomData<N>);

impl<N> NotificationMethod for LspNotification<N>
where
    N: lsp_types::notification::Notification + 'static,
    N::Params: Send + 'static,
{
    const NAME: &'static str = N::METHOD;
    type Params = N::Params;
}

pub type Initialize = LspRequest<lsp_types::request::Initialize>;
pub type Initialized = LspNotification<lsp_types::notification::Initialized>;
pub type Shutdown = LspRequest<lsp_types::request::Shutdown>;
pub type Exit = LspNotification<lsp_types::notification::Exit>;

/// A Rust type standing in for a JSON shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    type_id: TypeId,
    type_name: &'static str,
}

impl Shape {
    pub fn of<T: 'static>() -> Self {
        Shape {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Request,
    Notification,
}

/// Registered shape of one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSpec {
    name: &'static str,
    kind: MethodKind,
    params: Shape,
    result: Option<Shape>,
}

impl MethodSpec {
    pub fn request<M: RequestMethod>() -> Self {
        MethodSpec {
            name: M::NAME,
            kind: MethodKind::Request,
            params: Shape::of::<M::Params>(),
            result: Some(Shape::of::<M::Result>()),
        }
    }

    pub fn notification<M: NotificationMethod>() -> Self {
        MethodSpec {
            name: M::NAME,
            kind: MethodKind::Notification,
            params: Shape::of::<M::Params>(),
            result: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn params(&self) -> Shape {
        self.params
    }

    pub fn result(&self) -> Option<Shape> {
        self.result
    }
}

impl fmt::Display for MethodSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, self.result) {
            (MethodKind::Request, Some(result)) => write!(
                f,
                "request({}) -> {}",
                self.params.type_name,
                result.type_name
            ),
            _ => write!(f, "notification({})", self.params.type_name),
        }
    }
}

/// Name to shape mapping, shared read-only once the session is built.
#[derive(Debug, Default, Clone)]
pub struct MethodRegistry {
    methods: HashMap<&'static str, MethodSpec>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the lifecycle methods
    /// (`initialize`, `initialized`, `shutdown`, `exit`).
    pub fn lsp() -> Self {
        let mut registry = Self::new();
        for spec in [
            MethodSpec::request::<Initialize>(),
            MethodSpec::notification::<Initialized>(),
            MethodSpec::request::<Shutdown>(),
            MethodSpec::notification::<Exit>(),
        ] {
            registry.methods.insert(spec.name, spec);
        }
        registry
    }

    pub fn register_request<M: RequestMethod>(&mut self) -> Result<&mut Self, Error> {
        self.register(MethodSpec::request::<M>())?;
        Ok(self)
    }

    pub fn register_notification<M: NotificationMethod>(&mut self) -> Result<&mut Self, Error> {
        self.register(MethodSpec::notification::<M>())?;
        Ok(self)
    }

    /// Add `spec`. Registering an identical spec again is a no-op.
    pub fn register(&mut self, spec: MethodSpec) -> Result<(), Error> {
        match self.methods.get(spec.name) {
            Some(existing) if *existing == spec => Ok(()),
            Some(existing) => Err(Error::DuplicateMethod {
                method: spec.name.to_string(),
                existing: existing.to_string(),
                attempted: spec.to_string(),
            }),
            None => {
                self.methods.insert(spec.name, spec);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodSpec> {
        self.methods.values()
    }

    /// The spec for `M`, provided `M` is exactly what was registered under its name.
    pub fn expect_request<M: RequestMethod>(&self) -> Result<&MethodSpec, Error> {
        self.expect(MethodSpec::request::<M>())
    }

    pub fn expect_notification<M: NotificationMethod>(&self) -> Result<&MethodSpec, Error> {
        self.expect(MethodSpec::notification::<M>())
    }

    fn expect(&self, used: MethodSpec) -> Result<&MethodSpec, Error> {
        let registered = self
            .methods
            .get(used.name)
            .ok_or_else(|| Error::MethodNotRegistered(used.name.to_string()))?;
        if *registered != used {
            return Err(Error::ShapeMismatch {
                method: used.name.to_string(),
                registered: registered.to_string(),
                used: used.to_string(),
            });
        }
        Ok(registered)
    }
}
