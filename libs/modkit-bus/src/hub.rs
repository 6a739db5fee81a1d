//! Type-keyed resolution context for consumer wiring.
//!
//! Design goals:
//! - Applications register singletons and scoped factories once, at composition time.
//! - Registrations look up optional collaborators (definitions, decorators, name formatters)
//!   by *interface type*, without knowing who provided them.
//! - Every consumed message gets its own [`ServiceScope`]; scoped services live exactly as long
//!   as that scope.
//!
//! Implementation details:
//! - Key = `type_name::<T>()`, which works for `T = dyn Trait`.
//! - Singletons are stored as `Arc<T>` boxed into `dyn Any` (downcast on read).
//! - Factories are stored as `Arc<dyn Fn(&ServiceScope) -> anyhow::Result<Arc<T>>>`.
//!
//! Notes:
//! - Re-registering overwrites the previous value; existing `Arc`s held elsewhere remain valid.
//! - Endpoint wiring only reads the hub; registrations happen at composition time.

use parking_lot::{Mutex, RwLock};
use std::{any::Any, collections::HashMap, fmt, sync::Arc};

/// Stable type key for trait objects, uses fully-qualified `type_name::<T>()`.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct TypeKey(&'static str);

impl TypeKey {
    #[inline]
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        TypeKey(std::any::type_name::<T>())
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceHubError {
    #[error("service not found: type={type_key}")]
    NotFound { type_key: TypeKey },

    #[error("type mismatch in hub for type={type_key}")]
    TypeMismatch { type_key: TypeKey },

    #[error("scoped factory failed for type={type_key}: {source}")]
    Factory {
        type_key: TypeKey,
        #[source]
        source: anyhow::Error,
    },
}

type Boxed = Box<dyn Any + Send + Sync>;

/// Factory producing a scoped service instance.
pub type ScopedFactoryFn<T> = Arc<dyn Fn(&ServiceScope) -> anyhow::Result<Arc<T>> + Send + Sync>;

/// Type-safe registry of singletons and scoped factories keyed by interface type.
pub struct ServiceHub {
    singletons: RwLock<HashMap<TypeKey, Boxed>>,
    factories: RwLock<HashMap<TypeKey, Boxed>>,
}

impl ServiceHub {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            singletons: RwLock::new(HashMap::new()),
            factories: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for ServiceHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceHub {
    /// Register a singleton under the interface type `T`.
    /// `T` can be a trait object like `dyn ConsumerDefinition<MyConsumer>`.
    pub fn register<T>(&self, service: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.singletons
            .write()
            .insert(TypeKey::of::<T>(), Box::new(service));
    }

    /// Register a scoped factory under the interface type `T`.
    ///
    /// The factory runs at most once per [`ServiceScope`]; the instance it returns is cached
    /// in that scope and dropped with it.
    pub fn register_factory<T, F>(&self, factory: F)
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&ServiceScope) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        let factory: ScopedFactoryFn<T> = Arc::new(factory);
        self.factories
            .write()
            .insert(TypeKey::of::<T>(), Box::new(factory));
    }

    /// Store a value of the wrong type under `T`'s key.
    #[cfg(test)]
    pub(crate) fn register_mismatched<T>(&self)
    where
        T: ?Sized + 'static,
    {
        self.singletons
            .write()
            .insert(TypeKey::of::<T>(), Box::new(()));
    }

    #[must_use]
    pub fn has_factory<T>(&self) -> bool
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.factories.read().contains_key(&TypeKey::of::<T>())
    }

    /// Fetch a singleton by interface type `T`.
    ///
    /// # Errors
    /// `NotFound` when nothing is registered, `TypeMismatch` when the stored value has a
    /// different concrete type.
    pub fn get<T>(&self) -> Result<Arc<T>, ServiceHubError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.find::<T>()?.ok_or(ServiceHubError::NotFound {
            type_key: TypeKey::of::<T>(),
        })
    }

    /// Optional lookup: `Ok(None)` when `T` is not registered.
    ///
    /// # Errors
    /// `TypeMismatch` when the stored value has a different concrete type.
    pub fn find<T>(&self) -> Result<Option<Arc<T>>, ServiceHubError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let type_key = TypeKey::of::<T>();
        let r = self.singletons.read();
        let Some(boxed) = r.get(&type_key) else {
            return Ok(None);
        };

        // Stored value is exactly `Arc<T>`; downcast is safe and cheap.
        boxed
            .downcast_ref::<Arc<T>>()
            .map(|arc_t| Some(Arc::clone(arc_t)))
            .ok_or(ServiceHubError::TypeMismatch { type_key })
    }

    fn factory<T>(&self) -> Result<Option<ScopedFactoryFn<T>>, ServiceHubError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let type_key = TypeKey::of::<T>();
        let r = self.factories.read();
        let Some(boxed) = r.get(&type_key) else {
            return Ok(None);
        };
        boxed
            .downcast_ref::<ScopedFactoryFn<T>>()
            .map(|f| Some(Arc::clone(f)))
            .ok_or(ServiceHubError::TypeMismatch { type_key })
    }

    /// Introspection: singletons plus factories.
    #[must_use]
    pub fn len(&self) -> usize {
        self.singletons.read().len() + self.factories.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open a fresh resolution scope backed by this hub.
    #[must_use]
    pub fn create_scope(self: &Arc<Self>) -> ServiceScope {
        ServiceScope {
            hub: Arc::clone(self),
            instances: Mutex::new(HashMap::new()),
        }
    }
}

/// Per-message resolution scope.
///
/// Lookup order: values seeded with [`ServiceScope::insert`], then scoped factories (cached
/// per scope), then hub singletons.
pub struct ServiceScope {
    hub: Arc<ServiceHub>,
    instances: Mutex<HashMap<TypeKey, Boxed>>,
}

impl ServiceScope {
    #[inline]
    #[must_use]
    pub fn hub(&self) -> &Arc<ServiceHub> {
        &self.hub
    }

    /// Seed a scope-local value, shadowing factories and singletons for `T`.
    pub fn insert<T>(&self, value: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.instances
            .lock()
            .insert(TypeKey::of::<T>(), Box::new(value));
    }

    fn cached<T>(&self) -> Result<Option<Arc<T>>, ServiceHubError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let type_key = TypeKey::of::<T>();
        let instances = self.instances.lock();
        let Some(boxed) = instances.get(&type_key) else {
            return Ok(None);
        };
        boxed
            .downcast_ref::<Arc<T>>()
            .map(|arc_t| Some(Arc::clone(arc_t)))
            .ok_or(ServiceHubError::TypeMismatch { type_key })
    }

    /// Resolve `T` within this scope.
    ///
    /// # Errors
    /// `NotFound` when `T` is neither scoped nor a singleton, `Factory` when the scoped factory
    /// fails, `TypeMismatch` on a corrupted registration.
    pub fn resolve<T>(&self) -> Result<Arc<T>, ServiceHubError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        if let Some(found) = self.cached::<T>()? {
            return Ok(found);
        }

        if let Some(factory) = self.hub.factory::<T>()? {
            // The lock is not held here: factories may resolve their own dependencies.
            let created = factory(self).map_err(|source| ServiceHubError::Factory {
                type_key: TypeKey::of::<T>(),
                source,
            })?;
            let mut instances = self.instances.lock();
            let slot = instances
                .entry(TypeKey::of::<T>())
                .or_insert_with(|| -> Boxed { Box::new(Arc::clone(&created)) });
            return Ok(slot
                .downcast_ref::<Arc<T>>()
                .map_or(created, Arc::clone));
        }

        self.hub.get::<T>()
    }

    /// Number of instances currently owned by the scope.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ServiceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceScope")
            .field("instances", &self.len())
            .finish_non_exhaustive()
    }
}
