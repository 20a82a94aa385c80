//! Service registry
//!
//! Services are assembled explicitly: each method is registered with a typed
//! handler `Fn(&S, A, &mut R) -> Result<(), E>`. The registry erases those
//! types behind a [`Payload`] boundary so the server can dispatch on the
//! `"Service.Method"` string alone.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use frpc_protocol::{ErrorCode, Payload, RemoteError};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

type Handler = dyn Fn(Payload) -> BoxFuture<'static, Result<Payload, RemoteError>> + Send + Sync;

/// Errors raised while building or registering a service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("service name {0:?} is not exported")]
    UnexportedName(String),

    #[error("service {0} has no exported methods")]
    NoMethods(String),

    #[error("service already defined: {0}")]
    DuplicateService(String),
}

/// Errors resolving a `"Service.Method"` string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("service/method request ill-formed: {0}")]
    Malformed(String),

    #[error("can't find service {0}")]
    ServiceNotFound(String),

    #[error("can't find method {method} on service {service}")]
    MethodNotFound { service: String, method: String },
}

impl LookupError {
    pub fn code(&self) -> ErrorCode {
        match self {
            LookupError::Malformed(_) => ErrorCode::MalformedServiceMethod,
            LookupError::ServiceNotFound(_) => ErrorCode::ServiceNotFound,
            LookupError::MethodNotFound { .. } => ErrorCode::MethodNotFound,
        }
    }
}

impl From<LookupError> for RemoteError {
    fn from(err: LookupError) -> Self {
        RemoteError::new(err.code(), err.to_string())
    }
}

/// Exported names start with an ASCII uppercase letter and contain only
/// ASCII alphanumerics and underscores.
pub fn is_exported(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// One callable method of a service.
pub struct MethodType {
    name: String,
    arg_type: &'static str,
    reply_type: &'static str,
    num_calls: AtomicU64,
    handler: Box<Handler>,
}

impl MethodType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    /// Number of invocations so far, successful or not.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Decode `argv`, run the handler against a fresh default reply and
    /// encode the reply.
    pub async fn invoke(&self, argv: Payload) -> Result<Payload, RemoteError> {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        (self.handler)(argv).await
    }
}

impl std::fmt::Debug for MethodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodType")
            .field("name", &self.name)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .field("num_calls", &self.num_calls())
            .finish()
    }
}

/// A named receiver together with its registered methods.
#[derive(Debug)]
pub struct Service {
    name: String,
    receiver_type: &'static str,
    methods: HashMap<String, Arc<MethodType>>,
}

impl Service {
    /// Start building a service named `name` bound to `receiver`.
    pub fn builder<S>(name: impl Into<String>, receiver: S) -> ServiceBuilder<S>
    where
        S: Send + Sync + 'static,
    {
        ServiceBuilder {
            name: name.into(),
            receiver: Arc::new(receiver),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn receiver_type(&self) -> &'static str {
        self.receiver_type
    }

    pub fn method(&self, name: &str) -> Option<Arc<MethodType>> {
        self.methods.get(name).cloned()
    }

    /// Method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Invoke `method` of this service with an undecoded argument.
    pub async fn call(&self, method: &MethodType, argv: Payload) -> Result<Payload, RemoteError> {
        debug!(service = %self.name, method = %method.name, "invoking");
        method.invoke(argv).await
    }
}

pub struct ServiceBuilder<S> {
    name: String,
    receiver: Arc<S>,
    methods: HashMap<String, Arc<MethodType>>,
}

impl<S> ServiceBuilder<S>
where
    S: Send + Sync + 'static,
{
    /// Register `handler` as method `name`.
    ///
    /// The handler runs on the blocking thread pool, so it may block. `A` is
    /// decoded from the request body; `R` starts as `R::default()` (empty for
    /// maps and vectors) and is sent back if the handler returns `Ok`.
    ///
    /// Unexported or duplicate method names are skipped with a warning.
    pub fn method<A, R, E, F>(mut self, name: &str, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Default + Send + 'static,
        E: Display + 'static,
        F: Fn(&S, A, &mut R) -> Result<(), E> + Send + Sync + 'static,
    {
        if !is_exported(name) {
            warn!(service = %self.name, method = name, "method name is not exported, skipping");
            return self;
        }
        if self.methods.contains_key(name) {
            warn!(service = %self.name, method = name, "duplicate method, skipping");
            return self;
        }

        let receiver = self.receiver.clone();
        let handler = Arc::new(handler);
        let erased: Box<Handler> = Box::new(move |argv: Payload| {
            let receiver = receiver.clone();
            let handler = handler.clone();
            async move {
                let args: A = serde_json::from_value(argv)
                    .map_err(|e| RemoteError::new(ErrorCode::InvalidArgument, e.to_string()))?;

                let outcome = tokio::task::spawn_blocking(move || {
                    let mut reply = R::default();
                    handler(&receiver, args, &mut reply)
                        .map(|()| reply)
                        .map_err(|e| e.to_string())
                })
                .await;

                let reply = match outcome {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(message)) => {
                        return Err(RemoteError::new(ErrorCode::Application, message))
                    }
                    Err(e) => {
                        return Err(RemoteError::new(
                            ErrorCode::Internal,
                            format!("handler failed: {}", e),
                        ))
                    }
                };

                serde_json::to_value(reply).map_err(|e| {
                    RemoteError::new(ErrorCode::Internal, format!("failed to encode reply: {}", e))
                })
            }
            .boxed()
        });

        self.methods.insert(
            name.to_string(),
            Arc::new(MethodType {
                name: name.to_string(),
                arg_type: std::any::type_name::<A>(),
                reply_type: std::any::type_name::<R>(),
                num_calls: AtomicU64::new(0),
                handler: erased,
            }),
        );
        self
    }

    pub fn build(self) -> Result<Service, RegistryError> {
        if !is_exported(&self.name) {
            return Err(RegistryError::UnexportedName(self.name));
        }
        if self.methods.is_empty() {
            return Err(RegistryError::NoMethods(self.name));
        }

        let service = Service {
            name: self.name,
            receiver_type: std::any::type_name::<S>(),
            methods: self.methods,
        };
        for method in service.methods.values() {
            info!(
                "registered method: {}.{}({}) -> {}",
                service.name,
                method.name(),
                method.arg_type(),
                method.reply_type()
            );
        }
        Ok(service)
    }
}

/// Name → service lookup shared by every connection of a server.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: DashMap<String, Arc<Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `service`. A name that is already taken is rejected and the
    /// existing service stays in place.
    pub fn register(&self, service: Service) -> Result<(), RegistryError> {
        match self.services.entry(service.name.clone()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateService(service.name)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(service));
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(name).map(|entry| entry.value().clone())
    }

    /// Resolve `"Service.Method"`, splitting on the last `.`.
    pub fn lookup(
        &self,
        service_method: &str,
    ) -> Result<(Arc<Service>, Arc<MethodType>), LookupError> {
        let (service_name, method_name) = service_method
            .rsplit_once('.')
            .ok_or_else(|| LookupError::Malformed(service_method.to_string()))?;

        let service = self
            .get(service_name)
            .ok_or_else(|| LookupError::ServiceNotFound(service_name.to_string()))?;
        let method = service
            .method(method_name)
            .ok_or_else(|| LookupError::MethodNotFound {
                service: service_name.to_string(),
                method: method_name.to_string(),
            })?;
        Ok((service, method))
    }

    /// Registered service names, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
