use crate::channel::Channel;
use crate::error::{CommunicatorError, Result};
use crate::escalation::{AbortOnFatal, ClosingInfo, DelayQueue, EscalationPolicy, FatalHandler, Scheduler};
use crate::instance::{InstanceHandle, InstanceResolver};
use crate::lock;
use crate::object::{Config, LaunchOptions, Object};
use crate::process::{AttachedProcess, CommandLauncher, Launcher, ProcessState, RemoteProcess};
use crate::protocol::AnnounceInfo;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

/// Told about every remote process that becomes active or goes away.
///
/// Callbacks run while the map is locked, so an observer must not call back
/// into the map from inside one.
pub trait RemoteProcessObserver: Send + Sync {
    fn activated(&self, process: &Arc<RemoteProcess>);
    fn deactivated(&self, process: &Arc<RemoteProcess>);
}

#[derive(Default)]
struct MapState {
    processes: HashMap<u32, Arc<RemoteProcess>>,
    observers: Vec<Arc<dyn RemoteProcessObserver>>,
}

pub struct RemoteProcessMap {
    state: Mutex<MapState>,
    resolver: Arc<dyn InstanceResolver>,
    launcher: Arc<dyn Launcher>,
    closing: Arc<dyn Scheduler<ClosingInfo>>,
    policy: EscalationPolicy,
    fatal: Arc<dyn FatalHandler>,
}

impl RemoteProcessMap {
    pub fn new(resolver: Arc<dyn InstanceResolver>) -> io::Result<Self> {
        let closing = DelayQueue::new("outproc-closing")?;
        Ok(Self::with_scheduler(resolver, Arc::new(closing)))
    }

    pub fn with_scheduler(
        resolver: Arc<dyn InstanceResolver>,
        closing: Arc<dyn Scheduler<ClosingInfo>>,
    ) -> Self {
        Self {
            state: Mutex::new(MapState::default()),
            resolver,
            launcher: Arc::new(CommandLauncher),
            closing,
            policy: EscalationPolicy::default(),
            fatal: Arc::new(AbortOnFatal),
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_policy(mut self, policy: EscalationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_fatal_handler(mut self, fatal: Arc<dyn FatalHandler>) -> Self {
        self.fatal = fatal;
        self
    }

    pub fn policy(&self) -> EscalationPolicy {
        self.policy
    }

    pub fn create(&self, object: &Object, config: &Config) -> Result<Arc<RemoteProcess>> {
        let options = LaunchOptions::from_parts(object, config)?;

        // The child may announce before launch returns; holding the lock
        // across the launch keeps that announce waiting until the entry
        // exists.
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let control = self.launcher.launch(config, &options)?;
        let process = Arc::new(RemoteProcess::new(control));
        let pid = process.id();

        if let Some(stale) = state.processes.insert(pid, Arc::clone(&process)) {
            warn!(pid, "replacing stale remote process entry");
            stale.set_state(ProcessState::Deactivated, &state.observers);
        }

        info!(pid, class = %object.class_name, locator = %object.locator, "remote process created");
        Ok(process)
    }

    pub fn announce(
        &self,
        channel: &Arc<dyn Channel>,
        info: &AnnounceInfo,
        implementation: Option<InstanceHandle>,
    ) -> Result<Option<InstanceHandle>> {
        if !channel.is_open() {
            return Err(CommunicatorError::Unavailable);
        }

        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let pid = info.exchange_id;

        let process = match state.processes.get(&pid) {
            Some(process) => Arc::clone(process),
            None => {
                let process = Arc::new(RemoteProcess::new(Box::new(AttachedProcess::new(pid))));
                process.bind_channel(Arc::clone(channel));
                state.processes.insert(pid, Arc::clone(&process));
                info!(pid, channel = channel.id(), "attached remote process");
                process.set_state(ProcessState::Active, &state.observers);
                process
            }
        };

        match implementation {
            None => {
                drop(guard);
                let instance = self
                    .resolver
                    .instance(&info.class_name, info.interface_id, info.version);
                if instance.is_none() {
                    warn!(
                        pid,
                        class = %info.class_name,
                        interface = info.interface_id,
                        "no instance for announced request"
                    );
                }
                Ok(instance)
            }
            Some(handle) => {
                process.bind_channel(Arc::clone(channel));
                process.store_returned_interface(handle);
                debug!(pid, %handle, "remote process offered implementation");
                process.set_state(ProcessState::Active, &state.observers);
                Ok(Some(handle))
            }
        }
    }

    pub fn destroy(&self, pid: u32) -> Result<()> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let process = state
            .processes
            .remove(&pid)
            .ok_or(CommunicatorError::UnknownProcess(pid))?;

        process.set_state(ProcessState::Deactivated, &state.observers);

        if process.is_active() {
            debug!(pid, delay_ms = self.policy.initial_delay.as_millis() as u64, "scheduling termination");
            self.closing.schedule(
                self.policy.initial_delay,
                ClosingInfo::new(process, self.policy, Arc::clone(&self.fatal)),
            );
        } else {
            info!(pid, exit_code = ?process.exit_code(), "remote process exited");
        }
        Ok(())
    }

    /// Adds `observer` and immediately reports every process that is
    /// already active.
    pub fn register(&self, observer: Arc<dyn RemoteProcessObserver>) -> Result<()> {
        let mut state = lock(&self.state);
        if state.observers.iter().any(|known| Arc::ptr_eq(known, &observer)) {
            return Err(CommunicatorError::ObserverAlreadyRegistered);
        }
        state.observers.push(Arc::clone(&observer));

        let mut active = state
            .processes
            .values()
            .filter(|process| process.state() == ProcessState::Active)
            .cloned()
            .collect::<Vec<_>>();
        active.sort_by_key(|process| process.id());
        for process in &active {
            observer.activated(process);
        }
        Ok(())
    }

    pub fn unregister(&self, observer: &Arc<dyn RemoteProcessObserver>) -> Result<()> {
        let mut state = lock(&self.state);
        let Some(index) = state
            .observers
            .iter()
            .position(|known| Arc::ptr_eq(known, observer))
        else {
            return Err(CommunicatorError::ObserverNotRegistered);
        };
        state.observers.remove(index);
        Ok(())
    }

    pub fn process(&self, pid: u32) -> Option<Arc<RemoteProcess>> {
        lock(&self.state).processes.get(&pid).cloned()
    }

    pub fn processes(&self) -> Vec<u32> {
        let mut pids = lock(&self.state).processes.keys().copied().collect::<Vec<_>>();
        pids.sort_unstable();
        pids
    }

    pub fn len(&self) -> usize {
        lock(&self.state).processes.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).processes.is_empty()
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.state).observers.len()
    }

    pub fn instance(&self, class_name: &str, interface_id: u32, version: u32) -> Option<InstanceHandle> {
        self.resolver.instance(class_name, interface_id, version)
    }

    pub fn release_instance(&self, handle: InstanceHandle) -> bool {
        self.resolver.release(handle)
    }
}

impl Drop for RemoteProcessMap {
    fn drop(&mut self) {
        let observers = match self.state.get_mut() {
            Ok(state) => state.observers.len(),
            Err(poisoned) => poisoned.into_inner().observers.len(),
        };
        if observers > 0 && !thread::panicking() {
            panic!("remote process map dropped with {observers} observer(s) still registered");
        }
    }
}
