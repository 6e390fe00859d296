use crate::channel::{next_channel_id, Channel, ChannelId};
use crate::error::{ChannelError, CommunicatorError};
use crate::escalation::FatalHandler;
use crate::lock;
use crate::object::{Config, LaunchOptions};
use crate::process::{Launcher, ProcessControl, RemoteProcess};
use crate::protocol::WireMessage;
use crate::registry::RemoteProcessObserver;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

pub struct FakeProcess {
    id: u32,
    alive: AtomicBool,
    stubborn: bool,
    kills: Mutex<Vec<bool>>,
}

impl FakeProcess {
    pub fn new(id: u32) -> Arc<Self> {
        Self::build(id, false)
    }

    /// Ignores every signal, including the forced one.
    pub fn stubborn(id: u32) -> Arc<Self> {
        Self::build(id, true)
    }

    fn build(id: u32, stubborn: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            alive: AtomicBool::new(true),
            stubborn,
            kills: Mutex::new(Vec::new()),
        })
    }

    pub fn exit(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn kills(&self) -> Vec<bool> {
        lock(&self.kills).clone()
    }
}

impl ProcessControl for Arc<FakeProcess> {
    fn id(&self) -> u32 {
        self.id
    }

    fn is_active(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn exit_code(&self) -> Option<i32> {
        if self.is_active() {
            None
        } else {
            Some(0)
        }
    }

    fn kill(&self, hard: bool) -> bool {
        lock(&self.kills).push(hard);
        if !self.stubborn {
            self.alive.store(false, Ordering::SeqCst);
        }
        true
    }
}

pub struct FakeLauncher {
    next_pid: AtomicU32,
    failing: bool,
    stubborn: bool,
    launched: Mutex<HashMap<u32, (Arc<FakeProcess>, LaunchOptions)>>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Self::build(false, false)
    }

    pub fn failing() -> Arc<Self> {
        Self::build(true, false)
    }

    pub fn stubborn() -> Arc<Self> {
        Self::build(false, true)
    }

    fn build(failing: bool, stubborn: bool) -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(1000),
            failing,
            stubborn,
            launched: Mutex::new(HashMap::new()),
        })
    }

    pub fn process(&self, pid: u32) -> Option<Arc<FakeProcess>> {
        lock(&self.launched).get(&pid).map(|(process, _)| Arc::clone(process))
    }

    pub fn options(&self, pid: u32) -> Option<LaunchOptions> {
        lock(&self.launched).get(&pid).map(|(_, options)| options.clone())
    }

    pub fn launch_count(&self) -> usize {
        lock(&self.launched).len()
    }
}

impl Launcher for FakeLauncher {
    fn launch(
        &self,
        config: &Config,
        options: &LaunchOptions,
    ) -> Result<Box<dyn ProcessControl>, CommunicatorError> {
        if self.failing {
            return Err(CommunicatorError::LaunchFailed {
                host_application: config.host_application.clone(),
                detail: "no such file".to_string(),
            });
        }

        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let process = if self.stubborn {
            FakeProcess::stubborn(pid)
        } else {
            FakeProcess::new(pid)
        };
        lock(&self.launched).insert(pid, (Arc::clone(&process), options.clone()));
        Ok(Box::new(process))
    }
}

type Responder = Box<dyn Fn(&WireMessage) -> Option<WireMessage> + Send + Sync>;

/// Channel that records what is sent and answers requests from a closure.
pub struct MemoryChannel {
    id: ChannelId,
    open: AtomicBool,
    sequence: AtomicU64,
    sent: Mutex<Vec<WireMessage>>,
    unanswered: Mutex<Vec<Sender<WireMessage>>>,
    responder: Option<Responder>,
}

impl MemoryChannel {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    pub fn answering<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&WireMessage) -> Option<WireMessage> + Send + Sync + 'static,
    {
        Self::build(Some(Box::new(responder)))
    }

    fn build(responder: Option<Responder>) -> Arc<Self> {
        Arc::new(Self {
            id: next_channel_id(),
            open: AtomicBool::new(true),
            sequence: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
            unanswered: Mutex::new(Vec::new()),
            responder,
        })
    }

    pub fn sent(&self) -> Vec<WireMessage> {
        lock(&self.sent).clone()
    }
}

impl Channel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn send(&self, message: &WireMessage) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        lock(&self.sent).push(message.clone());
        Ok(())
    }

    fn submit(&self, message: WireMessage) -> Result<Receiver<WireMessage>, ChannelError> {
        self.send(&message)?;
        let (tx, rx) = mpsc::channel();
        if let Some(reply) = self.responder.as_ref().and_then(|respond| respond(&message)) {
            let _ = tx.send(reply);
        } else {
            lock(&self.unanswered).push(tx);
        }
        Ok(rx)
    }

    fn cancel(&self, _sequence: u64) {}

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        lock(&self.unanswered).clear();
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    activated: Mutex<Vec<u32>>,
    deactivated: Mutex<Vec<u32>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn activations(&self) -> Vec<u32> {
        lock(&self.activated).clone()
    }

    pub fn deactivations(&self) -> Vec<u32> {
        lock(&self.deactivated).clone()
    }
}

impl RemoteProcessObserver for RecordingObserver {
    fn activated(&self, process: &Arc<RemoteProcess>) {
        lock(&self.activated).push(process.id());
    }

    fn deactivated(&self, process: &Arc<RemoteProcess>) {
        lock(&self.deactivated).push(process.id());
    }
}

#[derive(Default)]
pub struct RecordingFatal {
    errors: Mutex<Vec<CommunicatorError>>,
}

impl RecordingFatal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn errors(&self) -> Vec<CommunicatorError> {
        lock(&self.errors).clone()
    }
}

impl FatalHandler for RecordingFatal {
    fn fatal(&self, error: CommunicatorError) {
        lock(&self.errors).push(error);
    }
}
