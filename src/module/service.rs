use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;

use super::error::ModuleError;

/// Typed handle naming one service contract.
///
/// The type parameter is the concrete value stored in the registry, usually an
/// `Arc<dyn Trait>` or `Arc<Struct>`.
pub struct ServiceKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ServiceKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Services registered by providers during `prepare`, resolved by name.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the implementation behind `key`.
    pub fn register<T>(&mut self, key: &ServiceKey<T>, service: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        self.services.insert(key.name, Box::new(service));
    }

    /// Resolves the implementation behind `key`.
    pub fn get<T>(&self, key: &ServiceKey<T>) -> Result<T, ModuleError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let service = self
            .services
            .get(key.name)
            .ok_or_else(|| ModuleError::ServiceNotRegistered {
                service: key.name.to_string(),
            })?;

        service
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| ModuleError::ServiceTypeMismatch {
                service: key.name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
