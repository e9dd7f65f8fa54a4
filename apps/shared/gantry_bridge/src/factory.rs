//! Polymorphic factory
//!
//! Maps each type tag to the routine that builds the matching proxy type.
//! Entries are registered during startup on a [`FactoryBuilder`] and frozen
//! into a [`FactoryTable`], which the bridge reads without locking.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::bridge::Shared;
use crate::error::{BridgeError, Result};
use crate::handle::ForeignPtr;
use crate::proxy::{downcast_proxy, Proxy, ProxyCore, ProxyType};
use crate::type_tag::TypeTag;

/// Builds a proxy around a fresh core
pub type AllocateFn = Arc<dyn Fn(ProxyCore) -> Arc<dyn Proxy> + Send + Sync>;

/// Runs after a factory-built proxy is attached, before anyone else sees it
pub type CreateHook = Arc<dyn Fn(&Arc<dyn Proxy>) + Send + Sync>;

struct FactoryEntry {
    name: String,
    allocate: AllocateFn,
    hooks: Vec<CreateHook>,
}

#[derive(Default)]
pub struct FactoryBuilder {
    entries: HashMap<TypeTag, FactoryEntry>,
}

impl FactoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an allocation routine for `tag`
    ///
    /// A tag can only be registered once; a second registration (including
    /// a different name hashing to the same tag) is a configuration error.
    pub fn register<F>(&mut self, tag: TypeTag, name: impl Into<String>, allocate: F) -> Result<&mut Self>
    where
        F: Fn(ProxyCore) -> Arc<dyn Proxy> + Send + Sync + 'static,
    {
        let name = name.into();
        if let Some(existing) = self.entries.get(&tag) {
            return Err(BridgeError::DuplicateTypeTag {
                tag,
                existing: existing.name.clone(),
                name,
            });
        }

        tracing::debug!(%tag, name = %name, "proxy type registered");
        self.entries.insert(
            tag,
            FactoryEntry {
                name,
                allocate: Arc::new(allocate),
                hooks: Vec::new(),
            },
        );
        Ok(self)
    }

    /// Register `T` under its own name and tag
    pub fn register_type<T: ProxyType>(&mut self) -> Result<&mut Self> {
        self.register(T::TYPE_TAG, T::TYPE_NAME, |core| Arc::new(T::from_core(core)) as Arc<dyn Proxy>)
    }

    /// Subscribe to creation of proxies for `tag`; hooks run in registration order
    pub fn on_create<F>(&mut self, tag: TypeTag, hook: F) -> Result<&mut Self>
    where
        F: Fn(&Arc<dyn Proxy>) + Send + Sync + 'static,
    {
        let entry = self
            .entries
            .get_mut(&tag)
            .ok_or(BridgeError::HookWithoutFactory(tag))?;
        entry.hooks.push(Arc::new(hook));
        Ok(self)
    }

    /// Typed form of `on_create`
    pub fn on_create_type<T, F>(&mut self, hook: F) -> Result<&mut Self>
    where
        T: ProxyType,
        F: Fn(&Arc<T>) + Send + Sync + 'static,
    {
        self.on_create(T::TYPE_TAG, move |proxy| {
            if let Some(typed) = downcast_proxy::<T>(proxy) {
                hook(&typed);
            }
        })
    }

    pub fn build(self) -> FactoryTable {
        FactoryTable {
            entries: self.entries,
        }
    }
}

/// Immutable tag → allocator table
pub struct FactoryTable {
    entries: HashMap<TypeTag, FactoryEntry>,
}

impl FactoryTable {
    pub fn builder() -> FactoryBuilder {
        FactoryBuilder::new()
    }

    pub fn contains(&self, tag: TypeTag) -> bool {
        self.entries.contains_key(&tag)
    }

    pub fn type_name(&self, tag: TypeTag) -> Option<&str> {
        self.entries.get(&tag).map(|e| e.name.as_str())
    }

    /// Registered tags, sorted
    pub fn tags(&self) -> Vec<TypeTag> {
        let mut tags: Vec<TypeTag> = self.entries.keys().copied().collect();
        tags.sort();
        tags
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn allocate(&self, tag: TypeTag, ptr: ForeignPtr, bridge: Weak<Shared>) -> Result<Arc<dyn Proxy>> {
        let entry = self
            .entries
            .get(&tag)
            .ok_or(BridgeError::UnknownTypeTag { tag, ptr })?;
        Ok((entry.allocate)(ProxyCore::new(tag, bridge)))
    }

    pub(crate) fn notify_created(&self, tag: TypeTag, proxy: &Arc<dyn Proxy>) {
        if let Some(entry) = self.entries.get(&tag) {
            for hook in &entry.hooks {
                hook(proxy);
            }
        }
    }
}
