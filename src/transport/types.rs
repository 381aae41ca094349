use ahash::AHashMap;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::sync::Arc;

/// Anything that can travel through the runtime as a message.
///
/// Subscriptions copy each delivered message into their own buffer, hence `Clone`.
pub trait Message: Any + Clone + Send + Sync + 'static {}

impl<T: Any + Clone + Send + Sync + 'static> Message for T {}

/// Runtime descriptor of a message type: the transport-visible name plus the
/// Rust type it stands for.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MessageType {
    name: Arc<str>,
    type_id: TypeId,
    rust_name: &'static str,
}

impl MessageType {
    pub fn of<T: Message>(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            type_id: TypeId::of::<T>(),
            rust_name: type_name::<T>(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn rust_name(&self) -> &'static str {
        self.rust_name
    }

    /// True if this descriptor stands for `T`.
    #[inline]
    pub fn is<T: Message>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageType")
            .field("name", &self.name)
            .field("rust_name", &self.rust_name)
            .finish()
    }
}

/// Name → descriptor table consulted by the handle API.
///
/// Additive only: registering a name that is already present keeps the
/// existing descriptor. Lookups are lock-free snapshot reads.
pub struct TypeRegistry {
    snapshot: ArcSwap<AHashMap<String, MessageType>>,
    writer: Mutex<()>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(AHashMap::new()),
            writer: Mutex::new(()),
        }
    }

    /// Register every `(name, descriptor)` pair whose name is not known yet.
    /// Returns how many names were added.
    pub fn register<I, S>(&self, types: I) -> usize
    where
        I: IntoIterator<Item = (S, MessageType)>,
        S: Into<String>,
    {
        let _writer = self.writer.lock();
        let mut next = AHashMap::clone(&self.snapshot.load());
        let mut added = 0;
        for (name, descriptor) in types {
            let name = name.into();
            if next.contains_key(&name) {
                tracing::debug!("[TypeRegistry] '{}' already registered, keeping it", name);
                continue;
            }
            next.insert(name, descriptor);
            added += 1;
        }
        if added > 0 {
            self.snapshot.store(Arc::new(next));
        }
        added
    }

    pub fn get(&self, name: &str) -> Option<MessageType> {
        self.snapshot.load().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.snapshot.load().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Ping;
    #[derive(Clone)]
    struct Pong;

    #[test]
    fn registration_is_additive() {
        let registry = TypeRegistry::new();
        assert_eq!(registry.register([("Ping", MessageType::of::<Ping>("Ping"))]), 1);
        // same name, different type: ignored
        assert_eq!(registry.register([("Ping", MessageType::of::<Pong>("Ping"))]), 0);
        assert!(registry.get("Ping").unwrap().is::<Ping>());

        let added = registry.register([
            ("Ping", MessageType::of::<Ping>("Ping")),
            ("Pong", MessageType::of::<Pong>("Pong")),
        ]);
        assert_eq!(added, 1);
        assert_eq!(registry.len(), 2);
        assert!(registry.get("Missing").is_none());
    }

    #[test]
    fn descriptor_matches_only_its_type() {
        let ty = MessageType::of::<Ping>("Ping");
        assert!(ty.is::<Ping>());
        assert!(!ty.is::<Pong>());
        assert_eq!(ty.name(), "Ping");
    }
}
