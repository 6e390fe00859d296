use crate::channel::Channel;
use crate::error::CommunicatorError;
use crate::instance::{InstanceHandle, Interface, RemoteInterface};
use crate::lock;
use crate::object::{Config, LaunchOptions};
use crate::protocol::WireMessage;
use crate::registry::RemoteProcessObserver;
use std::fmt;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessStatus, Signal, System};
use tracing::{debug, info, warn};

/// OS-level view of a remote process.
pub trait ProcessControl: Send + Sync {
    fn id(&self) -> u32;
    fn is_active(&self) -> bool;
    fn exit_code(&self) -> Option<i32>;

    /// `hard == false` asks the process to stop, `hard == true` forces it.
    fn kill(&self, hard: bool) -> bool;
}

pub struct ChildProcess {
    id: u32,
    child: Mutex<Child>,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self {
            id: child.id(),
            child: Mutex::new(child),
        }
    }
}

impl ProcessControl for ChildProcess {
    fn id(&self) -> u32 {
        self.id
    }

    fn is_active(&self) -> bool {
        matches!(lock(&self.child).try_wait(), Ok(None))
    }

    fn exit_code(&self) -> Option<i32> {
        match lock(&self.child).try_wait() {
            Ok(Some(status)) => status.code(),
            _ => None,
        }
    }

    fn kill(&self, hard: bool) -> bool {
        if !hard {
            if let Some(delivered) = signal_pid(self.id, Signal::Term) {
                return delivered;
            }
        }
        lock(&self.child).kill().is_ok()
    }
}

/// A process that connected on its own; it is not our child so it can only
/// be observed and signalled by pid.
pub struct AttachedProcess {
    id: u32,
}

impl AttachedProcess {
    pub fn new(id: u32) -> Self {
        Self { id }
    }
}

impl ProcessControl for AttachedProcess {
    fn id(&self) -> u32 {
        self.id
    }

    fn is_active(&self) -> bool {
        let pid = Pid::from_u32(self.id);
        let mut system = System::new();
        if !system.refresh_process(pid) {
            return false;
        }
        system
            .process(pid)
            .map(|process| process.status() != ProcessStatus::Zombie)
            .unwrap_or(false)
    }

    fn exit_code(&self) -> Option<i32> {
        None
    }

    fn kill(&self, hard: bool) -> bool {
        let signal = if hard { Signal::Kill } else { Signal::Term };
        signal_pid(self.id, signal).unwrap_or(false)
    }
}

/// `None` when the platform cannot deliver `signal`.
fn signal_pid(id: u32, signal: Signal) -> Option<bool> {
    let pid = Pid::from_u32(id);
    let mut system = System::new();
    if !system.refresh_process(pid) {
        return Some(false);
    }
    system.process(pid)?.kill_with(signal)
}

pub trait Launcher: Send + Sync {
    fn launch(&self, config: &Config, options: &LaunchOptions)
        -> Result<Box<dyn ProcessControl>, CommunicatorError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CommandLauncher;

impl Launcher for CommandLauncher {
    fn launch(
        &self,
        config: &Config,
        options: &LaunchOptions,
    ) -> Result<Box<dyn ProcessControl>, CommunicatorError> {
        let child = Command::new(&config.host_application)
            .args(options.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| CommunicatorError::LaunchFailed {
                host_application: config.host_application.clone(),
                detail: err.to_string(),
            })?;

        info!(
            pid = child.id(),
            host = %config.host_application,
            "spawned host application"
        );
        Ok(Box::new(ChildProcess::new(child)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Constructed,
    Active,
    Deactivated,
}

impl ProcessState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Constructed => "constructed",
            Self::Active => "active",
            Self::Deactivated => "deactivated",
        }
    }
}

pub struct RemoteProcess {
    id: u32,
    process: Box<dyn ProcessControl>,
    state: Mutex<ProcessState>,
    state_changed: Condvar,
    channel: Mutex<Option<Arc<dyn Channel>>>,
    returned_interface: Mutex<Option<InstanceHandle>>,
}

impl RemoteProcess {
    pub(crate) fn new(process: Box<dyn ProcessControl>) -> Self {
        Self {
            id: process.id(),
            process,
            state: Mutex::new(ProcessState::Constructed),
            state_changed: Condvar::new(),
            channel: Mutex::new(None),
            returned_interface: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> ProcessState {
        *lock(&self.state)
    }

    pub fn is_active(&self) -> bool {
        self.process.is_active()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.process.exit_code()
    }

    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        lock(&self.channel).clone()
    }

    /// Blocks until the process reaches `state`. Gives up early once the
    /// process is deactivated since nothing follows that state.
    pub fn wait_state(&self, state: ProcessState, timeout: Duration) -> bool {
        // None: the timeout is too large to represent, wait without one
        let deadline = Instant::now().checked_add(timeout);
        let mut current = lock(&self.state);
        loop {
            if *current == state {
                return true;
            }
            if *current == ProcessState::Deactivated {
                return false;
            }
            current = match deadline {
                None => self
                    .state_changed
                    .wait(current)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    match self.state_changed.wait_timeout(current, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
            };
        }
    }

    pub fn instantiate(
        &self,
        wait: Duration,
        class_name: &str,
        interface_id: u32,
        version: u32,
    ) -> Option<InstanceHandle> {
        let channel = self.channel()?;
        let sequence = channel.next_sequence();
        let request = WireMessage::ObjectRequest {
            sequence,
            class_name: class_name.to_string(),
            interface_id,
            version,
        };

        match channel.request(request, wait) {
            Ok(WireMessage::ObjectResponse { implementation, .. }) => implementation,
            Ok(other) => {
                warn!(pid = self.id, kind = other.kind(), "unexpected reply to object request");
                None
            }
            Err(err) => {
                debug!(pid = self.id, class = class_name, "object request failed: {err}");
                None
            }
        }
    }

    pub fn instantiate_interface<I: Interface>(
        &self,
        wait: Duration,
        class_name: &str,
        version: u32,
    ) -> Option<RemoteInterface<I>> {
        let handle = self.instantiate(wait, class_name, I::ID, version)?;
        let channel = self.channel()?;
        Some(RemoteInterface::new(channel, handle))
    }

    pub fn terminate(&self) {
        match self.channel() {
            Some(channel) => {
                if let Err(err) = channel.send(&WireMessage::Terminate) {
                    debug!(pid = self.id, "terminate request failed, signalling instead: {err}");
                    self.process.kill(false);
                }
            }
            None => {
                self.process.kill(false);
            }
        }
    }

    pub fn take_returned_interface(&self) -> Option<InstanceHandle> {
        lock(&self.returned_interface).take()
    }

    pub fn kill(&self, hard: bool) -> bool {
        self.process.kill(hard)
    }

    pub(crate) fn bind_channel(&self, channel: Arc<dyn Channel>) {
        *lock(&self.channel) = Some(channel);
    }

    pub(crate) fn store_returned_interface(&self, handle: InstanceHandle) {
        *lock(&self.returned_interface) = Some(handle);
    }

    /// Callers hold the registry lock, which keeps fan-out ordered with
    /// respect to observer registration.
    pub(crate) fn set_state(
        self: &Arc<Self>,
        state: ProcessState,
        observers: &[Arc<dyn RemoteProcessObserver>],
    ) -> bool {
        if state == ProcessState::Constructed {
            warn!(pid = self.id, "refusing transition back to constructed");
            return false;
        }

        {
            let mut current = lock(&self.state);
            if *current == state {
                return false;
            }
            if *current == ProcessState::Deactivated {
                warn!(pid = self.id, to = state.as_str(), "refusing transition out of deactivated");
                return false;
            }
            debug!(
                pid = self.id,
                from = current.as_str(),
                to = state.as_str(),
                "remote process state change"
            );
            *current = state;
        }
        self.state_changed.notify_all();

        match state {
            ProcessState::Active => {
                for observer in observers {
                    observer.activated(self);
                }
            }
            ProcessState::Deactivated => {
                for observer in observers {
                    observer.deactivated(self);
                }
                if let Some(channel) = lock(&self.channel).take() {
                    channel.close();
                }
            }
            ProcessState::Constructed => {}
        }
        true
    }
}

impl fmt::Debug for RemoteProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteProcess")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("channel", &self.channel().map(|channel| channel.id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProcess, MemoryChannel, RecordingObserver};
    use std::thread;

    struct Echo;
    impl Interface for Echo {
        const ID: u32 = 0x51;
        const NAME: &'static str = "IEcho";
    }

    fn remote(id: u32) -> (Arc<RemoteProcess>, Arc<FakeProcess>) {
        let fake = FakeProcess::new(id);
        (Arc::new(RemoteProcess::new(Box::new(Arc::clone(&fake)))), fake)
    }

    #[test]
    fn state_changes_notify_observers_once() {
        let (process, _fake) = remote(10);
        let observer = RecordingObserver::new();
        let shared: Arc<dyn RemoteProcessObserver> = observer.clone();
        let observers = vec![shared];

        assert!(process.set_state(ProcessState::Active, &observers));
        assert!(!process.set_state(ProcessState::Active, &observers));
        assert!(process.set_state(ProcessState::Deactivated, &observers));

        assert_eq!(observer.activations(), vec![10]);
        assert_eq!(observer.deactivations(), vec![10]);
    }

    #[test]
    fn transition_back_to_constructed_is_rejected() {
        let (process, _fake) = remote(11);
        assert!(process.set_state(ProcessState::Active, &[]));
        assert!(!process.set_state(ProcessState::Constructed, &[]));
        assert_eq!(process.state(), ProcessState::Active);
    }

    #[test]
    fn transition_out_of_deactivated_is_rejected() {
        let (process, _fake) = remote(20);
        let observer = RecordingObserver::new();
        let shared: Arc<dyn RemoteProcessObserver> = observer.clone();
        let observers = vec![shared];

        assert!(process.set_state(ProcessState::Active, &observers));
        assert!(process.set_state(ProcessState::Deactivated, &observers));
        assert!(!process.set_state(ProcessState::Active, &observers));

        assert_eq!(process.state(), ProcessState::Deactivated);
        assert_eq!(observer.activations(), vec![20]);
        assert_eq!(observer.deactivations(), vec![20]);
    }

    #[test]
    fn wait_state_accepts_unrepresentable_timeout() {
        let (process, _fake) = remote(21);
        process.set_state(ProcessState::Active, &[]);
        assert!(process.wait_state(ProcessState::Active, Duration::MAX));

        let (process, _fake) = remote(22);
        let waiter = Arc::clone(&process);
        let handle = thread::spawn(move || waiter.wait_state(ProcessState::Active, Duration::MAX));
        thread::sleep(Duration::from_millis(20));
        process.set_state(ProcessState::Deactivated, &[]);
        assert!(!handle.join().expect("join waiter"));
    }

    #[test]
    fn kill_is_forwarded_to_the_process() {
        let (process, fake) = remote(23);
        assert!(process.kill(false));
        assert!(process.kill(true));
        assert_eq!(fake.kills(), vec![false, true]);
    }

    #[test]
    fn wait_state_wakes_on_activation() {
        let (process, _fake) = remote(12);
        let waiter = Arc::clone(&process);
        let handle = thread::spawn(move || waiter.wait_state(ProcessState::Active, Duration::from_secs(5)));

        thread::sleep(Duration::from_millis(20));
        process.set_state(ProcessState::Active, &[]);
        assert!(handle.join().expect("join waiter"));
    }

    #[test]
    fn wait_state_gives_up_after_deactivation() {
        let (process, _fake) = remote(13);
        process.set_state(ProcessState::Deactivated, &[]);

        let started = Instant::now();
        assert!(!process.wait_state(ProcessState::Active, Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wait_state_times_out() {
        let (process, _fake) = remote(14);
        assert!(!process.wait_state(ProcessState::Active, Duration::from_millis(30)));
    }

    #[test]
    fn deactivation_releases_and_closes_channel() {
        let (process, _fake) = remote(15);
        let channel = MemoryChannel::new();
        process.bind_channel(channel.clone());
        process.set_state(ProcessState::Active, &[]);

        process.set_state(ProcessState::Deactivated, &[]);
        assert!(process.channel().is_none());
        assert!(!channel.is_open());
    }

    #[test]
    fn instantiate_goes_over_the_bound_channel() {
        let (process, _fake) = remote(16);
        assert!(process
            .instantiate(Duration::from_millis(10), "EchoService", Echo::ID, 1)
            .is_none());

        let channel = MemoryChannel::answering(|message| match message {
            WireMessage::ObjectRequest { sequence, class_name, .. } if class_name == "EchoService" => {
                Some(WireMessage::ObjectResponse {
                    sequence: *sequence,
                    implementation: InstanceHandle::new(77),
                })
            }
            _ => None,
        });
        process.bind_channel(channel.clone());

        let proxy = process
            .instantiate_interface::<Echo>(Duration::from_secs(1), "EchoService", 1)
            .expect("remote echo");
        assert_eq!(proxy.handle(), InstanceHandle::new(77).expect("handle"));
        assert_eq!(proxy.interface_id(), Echo::ID);

        assert!(process
            .instantiate(Duration::from_millis(10), "Missing", Echo::ID, 1)
            .is_none());
    }

    #[test]
    fn terminate_prefers_the_channel() {
        let (process, fake) = remote(17);
        let channel = MemoryChannel::new();
        process.bind_channel(channel.clone());

        process.terminate();
        assert_eq!(channel.sent(), vec![WireMessage::Terminate]);
        assert!(fake.kills().is_empty());
    }

    #[test]
    fn terminate_without_channel_signals() {
        let (process, fake) = remote(18);
        process.terminate();
        assert_eq!(fake.kills(), vec![false]);
    }

    #[test]
    fn returned_interface_is_taken_once() {
        let (process, _fake) = remote(19);
        process.store_returned_interface(InstanceHandle::new(5).expect("handle"));
        assert_eq!(process.take_returned_interface(), InstanceHandle::new(5));
        assert_eq!(process.take_returned_interface(), None);
    }

    #[test]
    fn launch_of_missing_binary_fails() {
        let config = Config::new("127.0.0.1:1", "/nonexistent/outproc-host-missing");
        let result = CommandLauncher.launch(&config, &LaunchOptions::default());
        assert!(matches!(result, Err(CommunicatorError::LaunchFailed { .. })));
    }

    #[test]
    fn attached_process_for_current_pid_is_active() {
        let attached = AttachedProcess::new(std::process::id());
        assert!(attached.is_active());
        assert_eq!(attached.exit_code(), None);
    }
}
