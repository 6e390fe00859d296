use crate::channel::Channel;
use crate::lock;
use crate::object::VERSION_ANY;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Opaque reference to an object exported by one side of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceHandle(NonZeroU64);

impl InstanceHandle {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:x}", self.0)
    }
}

pub trait Interface: 'static {
    const ID: u32;
    const NAME: &'static str;
}

/// Decides which object, if any, answers a request for `class_name` /
/// `interface_id` / `version`.
pub trait InstanceResolver: Send + Sync {
    fn instance(&self, class_name: &str, interface_id: u32, version: u32)
        -> Option<InstanceHandle>;

    fn release(&self, _handle: InstanceHandle) -> bool {
        false
    }
}

pub struct NoInstances;

impl InstanceResolver for NoInstances {
    fn instance(&self, _class_name: &str, _interface_id: u32, _version: u32) -> Option<InstanceHandle> {
        None
    }
}

pub struct RemoteInterface<I: Interface> {
    channel: Arc<dyn Channel>,
    handle: InstanceHandle,
    _interface: PhantomData<fn() -> I>,
}

impl<I: Interface> RemoteInterface<I> {
    pub fn new(channel: Arc<dyn Channel>, handle: InstanceHandle) -> Self {
        Self {
            channel,
            handle,
            _interface: PhantomData,
        }
    }

    pub fn handle(&self) -> InstanceHandle {
        self.handle
    }

    pub fn interface_id(&self) -> u32 {
        I::ID
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_open()
    }
}

impl<I: Interface> Clone for RemoteInterface<I> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.channel), self.handle)
    }
}

impl<I: Interface> fmt::Debug for RemoteInterface<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteInterface")
            .field("interface", &I::NAME)
            .field("handle", &self.handle)
            .field("channel", &self.channel.id())
            .finish()
    }
}

type SharedObject = Arc<dyn Any + Send + Sync>;
type Factory = Box<dyn Fn() -> SharedObject + Send + Sync>;

struct Registration {
    version: u32,
    factory: Factory,
}

struct Exported {
    interface_id: u32,
    object: SharedObject,
}

#[derive(Default)]
struct RegistryState {
    factories: HashMap<(String, u32), Vec<Registration>>,
    exported: HashMap<InstanceHandle, Exported>,
}

/// Maps (class, interface, version) onto factories and keeps every object it
/// handed out addressable by its handle.
pub struct InstanceRegistry {
    state: Mutex<RegistryState>,
    next_handle: AtomicU64,
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            next_handle: AtomicU64::new(1),
        }
    }
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<I, T, F>(&self, class_name: &str, version: u32, factory: F)
    where
        I: Interface,
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let factory: Factory = Box::new(move || Arc::new(factory()) as SharedObject);
        let mut state = lock(&self.state);
        state
            .factories
            .entry((class_name.to_string(), I::ID))
            .or_default()
            .push(Registration { version, factory });
    }

    pub fn supports(&self, class_name: &str, interface_id: u32) -> bool {
        lock(&self.state)
            .factories
            .contains_key(&(class_name.to_string(), interface_id))
    }

    pub fn export<I, T>(&self, object: Arc<T>) -> InstanceHandle
    where
        I: Interface,
        T: Any + Send + Sync,
    {
        self.insert_exported(I::ID, object)
    }

    pub fn lookup<T: Any + Send + Sync>(&self, handle: InstanceHandle) -> Option<Arc<T>> {
        let object = lock(&self.state).exported.get(&handle)?.object.clone();
        object.downcast::<T>().ok()
    }

    pub fn interface_of(&self, handle: InstanceHandle) -> Option<u32> {
        lock(&self.state)
            .exported
            .get(&handle)
            .map(|exported| exported.interface_id)
    }

    pub fn exported_count(&self) -> usize {
        lock(&self.state).exported.len()
    }

    fn insert_exported(&self, interface_id: u32, object: SharedObject) -> InstanceHandle {
        let raw = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let handle = InstanceHandle::new(raw).unwrap_or(InstanceHandle(NonZeroU64::MIN));
        lock(&self.state)
            .exported
            .insert(handle, Exported { interface_id, object });
        handle
    }
}

impl InstanceResolver for InstanceRegistry {
    fn instance(&self, class_name: &str, interface_id: u32, version: u32) -> Option<InstanceHandle> {
        let object = {
            let state = lock(&self.state);
            let candidates = state
                .factories
                .get(&(class_name.to_string(), interface_id))?;
            let chosen = if version == VERSION_ANY {
                candidates.iter().max_by_key(|r| match r.version {
                    VERSION_ANY => 0,
                    v => u64::from(v) + 1,
                })
            } else {
                candidates
                    .iter()
                    .find(|r| r.version == version)
                    .or_else(|| candidates.iter().find(|r| r.version == VERSION_ANY))
            };
            (chosen?.factory)()
        };
        Some(self.insert_exported(interface_id, object))
    }

    fn release(&self, handle: InstanceHandle) -> bool {
        lock(&self.state).exported.remove(&handle).is_some()
    }
}
