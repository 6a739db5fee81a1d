//! Per-message consumer creation.
//!
//! [`ScopedConsumerFactory`] opens a [`ServiceScope`] for every message, seeds it with the
//! [`ConsumeContext`] and resolves the consumer from it; the consumer lives as long as its
//! scope. Applications wrap the factory by registering [`FactoryDecorators`] for the consumer
//! type in the hub.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::BusError;
use crate::hub::{ServiceHub, ServiceScope};
use crate::naming::short_type_name;
use crate::registration::Consumer;

/// Message-scoped data available to consumers through their scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeContext {
    message_id: Uuid,
    endpoint_name: Arc<str>,
    headers: HashMap<String, String>,
}

impl ConsumeContext {
    #[must_use]
    pub fn new(endpoint_name: impl Into<Arc<str>>) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            endpoint_name: endpoint_name.into(),
            headers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_message_id(mut self, message_id: Uuid) -> Self {
        self.message_id = message_id;
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    #[inline]
    #[must_use]
    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// A consumer instance together with the scope that owns its dependencies.
pub struct ScopedConsumer<C> {
    consumer: Arc<C>,
    scope: Option<ServiceScope>,
}

impl<C> ScopedConsumer<C> {
    #[must_use]
    pub fn new(consumer: Arc<C>, scope: ServiceScope) -> Self {
        Self {
            consumer,
            scope: Some(scope),
        }
    }

    /// Consumer not tied to any scope, e.g. a shared instance handed out by a decorator.
    #[must_use]
    pub fn unscoped(consumer: Arc<C>) -> Self {
        Self {
            consumer,
            scope: None,
        }
    }

    #[must_use]
    pub fn consumer(&self) -> &Arc<C> {
        &self.consumer
    }

    #[must_use]
    pub fn scope(&self) -> Option<&ServiceScope> {
        self.scope.as_ref()
    }
}

impl<C> Deref for ScopedConsumer<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.consumer
    }
}

impl<C> fmt::Debug for ScopedConsumer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedConsumer")
            .field("consumer", &short_type_name::<C>())
            .field("scope", &self.scope)
            .finish()
    }
}

/// Creation strategy for consumer `C`.
pub trait ConsumerFactory<C: Consumer>: Send + Sync {
    /// Create a consumer for one message.
    ///
    /// # Errors
    /// `ResolutionFailure` when the consumer or one of its dependencies cannot be resolved.
    fn create(&self, context: ConsumeContext) -> Result<ScopedConsumer<C>, BusError>;

    /// Short description used in endpoint probes.
    fn name(&self) -> String {
        "custom".to_owned()
    }
}

/// Resolves `C` from a fresh per-message scope of the hub.
pub struct ScopedConsumerFactory<C> {
    hub: Arc<ServiceHub>,
    _consumer: std::marker::PhantomData<fn() -> C>,
}

impl<C: Consumer> ScopedConsumerFactory<C> {
    #[must_use]
    pub fn new(hub: Arc<ServiceHub>) -> Self {
        Self {
            hub,
            _consumer: std::marker::PhantomData,
        }
    }
}

impl<C: Consumer> ConsumerFactory<C> for ScopedConsumerFactory<C> {
    fn create(&self, context: ConsumeContext) -> Result<ScopedConsumer<C>, BusError> {
        let scope = self.hub.create_scope();
        scope.insert::<ConsumeContext>(Arc::new(context));
        let consumer = scope.resolve::<C>()?;
        Ok(ScopedConsumer::new(consumer, scope))
    }

    fn name(&self) -> String {
        "scoped".to_owned()
    }
}

/// Wraps a consumer factory; the returned factory replaces the one it was given.
pub trait FactoryDecorator<C: Consumer>: Send + Sync {
    fn decorate(&self, factory: Arc<dyn ConsumerFactory<C>>) -> Arc<dyn ConsumerFactory<C>>;
}

impl<C, F> FactoryDecorator<C> for F
where
    C: Consumer,
    F: Fn(Arc<dyn ConsumerFactory<C>>) -> Arc<dyn ConsumerFactory<C>> + Send + Sync,
{
    fn decorate(&self, factory: Arc<dyn ConsumerFactory<C>>) -> Arc<dyn ConsumerFactory<C>> {
        self(factory)
    }
}

/// Ordered decorators for consumer `C`, registered in the hub as `FactoryDecorators<C>`.
///
/// Applied left-to-right: the first decorator wraps the base factory, each following one
/// wraps the previous result.
pub struct FactoryDecorators<C: Consumer> {
    decorators: Vec<Arc<dyn FactoryDecorator<C>>>,
}

impl<C: Consumer> FactoryDecorators<C> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            decorators: Vec::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, decorator: impl FactoryDecorator<C> + 'static) -> Self {
        self.push(Arc::new(decorator));
        self
    }

    pub fn push(&mut self, decorator: Arc<dyn FactoryDecorator<C>>) {
        self.decorators.push(decorator);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.decorators.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decorators.is_empty()
    }

    #[must_use]
    pub fn apply(&self, base: Arc<dyn ConsumerFactory<C>>) -> Arc<dyn ConsumerFactory<C>> {
        self.decorators
            .iter()
            .fold(base, |factory, decorator| decorator.decorate(factory))
    }
}

impl<C: Consumer> Default for FactoryDecorators<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Consumer> Clone for FactoryDecorators<C> {
    fn clone(&self) -> Self {
        Self {
            decorators: self.decorators.clone(),
        }
    }
}

/// Build the (possibly decorated) factory for `C`. Never cached: the result is bound to `hub`.
///
/// # Errors
/// `ResolutionFailure` when the decorator registration is malformed.
pub fn build_consumer_factory<C: Consumer>(
    hub: &Arc<ServiceHub>,
) -> Result<Arc<dyn ConsumerFactory<C>>, BusError> {
    let base: Arc<dyn ConsumerFactory<C>> =
        Arc::new(ScopedConsumerFactory::<C>::new(Arc::clone(hub)));

    match hub.find::<FactoryDecorators<C>>()? {
        Some(decorators) if !decorators.is_empty() => {
            tracing::debug!(
                consumer = short_type_name::<C>(),
                decorators = decorators.len(),
                "Decorating consumer factory"
            );
            Ok(decorators.apply(base))
        }
        _ => Ok(base),
    }
}
