use crate::channel::{Channel, ChannelHandler, SocketChannel};
use crate::error::{ChannelError, CommunicatorError, Result};
use crate::instance::{InstanceHandle, InstanceResolver, Interface, RemoteInterface};
use crate::lock;
use crate::object::VERSION_ANY;
use crate::protocol::{AnnounceInfo, AnnounceReply, WireMessage};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Default)]
struct Termination {
    requested: Mutex<bool>,
    signal: Condvar,
}

impl Termination {
    fn raise(&self) {
        *lock(&self.requested) = true;
        self.signal.notify_all();
    }
}

struct ClientHandler {
    resolver: Arc<dyn InstanceResolver>,
    termination: Arc<Termination>,
    served: Mutex<Vec<InstanceHandle>>,
}

impl ChannelHandler for ClientHandler {
    fn dispatch(&self, channel: &Arc<dyn Channel>, message: WireMessage) -> Option<WireMessage> {
        match message {
            WireMessage::ObjectRequest {
                sequence,
                class_name,
                interface_id,
                version,
            } => {
                let implementation = self.resolver.instance(&class_name, interface_id, version);
                if let Some(handle) = implementation {
                    lock(&self.served).push(handle);
                }
                debug!(
                    channel = channel.id(),
                    class = %class_name,
                    found = implementation.is_some(),
                    "object request"
                );
                Some(WireMessage::ObjectResponse {
                    sequence,
                    implementation,
                })
            }
            WireMessage::Terminate => {
                info!(channel = channel.id(), "terminate requested");
                self.termination.raise();
                None
            }
            other => {
                debug!(channel = channel.id(), kind = other.kind(), "ignoring message");
                None
            }
        }
    }

    fn state_change(&self, channel: &Arc<dyn Channel>) {
        if !channel.is_open() {
            let served = std::mem::take(&mut *lock(&self.served));
            let released = served.into_iter().filter(|handle| self.resolver.release(*handle)).count();
            debug!(channel = channel.id(), released, "released served objects");
        }
        self.termination.raise();
    }
}

struct PendingAnnounce {
    sequence: u64,
    response: Receiver<WireMessage>,
}

/// The remote side of the announce handshake: connects back to a
/// communicator, then either asks it for an object or offers one of its own.
pub struct CommunicatorClient {
    connector: String,
    exchange_id: u32,
    resolver: Arc<dyn InstanceResolver>,
    termination: Arc<Termination>,
    channel: Mutex<Option<Arc<SocketChannel>>>,
    pending: Mutex<Option<PendingAnnounce>>,
    reply: Mutex<Option<AnnounceReply>>,
}

impl CommunicatorClient {
    pub fn new(connector: impl Into<String>, resolver: Arc<dyn InstanceResolver>) -> Self {
        Self {
            connector: connector.into(),
            exchange_id: std::process::id(),
            resolver,
            termination: Arc::new(Termination::default()),
            channel: Mutex::new(None),
            pending: Mutex::new(None),
            reply: Mutex::new(None),
        }
    }

    pub fn with_exchange_id(mut self, exchange_id: u32) -> Self {
        self.exchange_id = exchange_id;
        self
    }

    pub fn create<I: Interface>(
        connector: impl Into<String>,
        resolver: Arc<dyn InstanceResolver>,
        class_name: &str,
        version: u32,
        wait: Duration,
    ) -> Result<(Self, RemoteInterface<I>)> {
        let client = Self::new(connector, resolver);
        client.open_request(wait, class_name, I::ID, version)?;
        let proxy = client
            .wait_for_completion::<I>(wait)?
            .ok_or(CommunicatorError::Unavailable)?;
        Ok((client, proxy))
    }

    pub fn connector(&self) -> &str {
        &self.connector
    }

    pub fn exchange_id(&self) -> u32 {
        self.exchange_id
    }

    pub fn is_open(&self) -> bool {
        lock(&self.channel)
            .as_ref()
            .map(|channel| channel.is_open())
            .unwrap_or(false)
    }

    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        lock(&self.channel)
            .as_ref()
            .map(|channel| Arc::clone(channel) as Arc<dyn Channel>)
    }

    pub fn announce_reply(&self) -> Option<AnnounceReply> {
        lock(&self.reply).clone()
    }

    /// Sends an announce asking for an object. The answer is collected with
    /// [`wait_for_completion`](Self::wait_for_completion).
    pub fn open_request(&self, wait: Duration, class_name: &str, interface_id: u32, version: u32) -> Result<()> {
        let channel = self.open_channel(wait)?;
        let info = AnnounceInfo::new(self.exchange_id, class_name, interface_id, version);
        let sequence = channel.next_sequence();
        let response = channel.submit(WireMessage::announce(sequence, &info, None))?;
        *lock(&self.pending) = Some(PendingAnnounce { sequence, response });
        debug!(exchange_id = self.exchange_id, class = class_name, "announce request sent");
        Ok(())
    }

    pub fn wait_for_completion<I: Interface>(&self, wait: Duration) -> Result<Option<RemoteInterface<I>>> {
        let pending = lock(&self.pending)
            .take()
            .ok_or(CommunicatorError::Unavailable)?;
        let channel = self.channel().ok_or(CommunicatorError::Unavailable)?;

        let message = match pending.response.recv_timeout(wait) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => {
                channel.cancel(pending.sequence);
                return Err(CommunicatorError::Timeout("announce response".to_string()));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(ChannelError::Closed.into());
            }
        };

        let reply = self.accept_reply(message)?;
        Ok(reply
            .implementation
            .map(|handle| RemoteInterface::new(channel, handle)))
    }

    pub fn open_offer(
        &self,
        wait: Duration,
        interface_id: u32,
        implementation: InstanceHandle,
    ) -> Result<AnnounceReply> {
        let channel = self.open_channel(wait)?;
        let info = AnnounceInfo::new(self.exchange_id, "", interface_id, VERSION_ANY);
        let sequence = channel.next_sequence();
        let message = channel.request(WireMessage::announce(sequence, &info, Some(implementation)), wait)?;
        let reply = self.accept_reply(message)?;
        info!(exchange_id = self.exchange_id, %implementation, "offered implementation");
        Ok(reply)
    }

    /// Blocks until the communicator asks us to stop or the connection goes
    /// away. `None` waits forever.
    pub fn wait_for_termination(&self, timeout: Option<Duration>) -> bool {
        // a timeout too large for an Instant waits forever
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut requested = lock(&self.termination.requested);
        while !*requested {
            requested = match deadline {
                None => self
                    .termination
                    .signal
                    .wait(requested)
                    .unwrap_or_else(|p| p.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    match self.termination.signal.wait_timeout(requested, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
            };
        }
        true
    }

    pub fn close(&self) {
        if let Some(channel) = lock(&self.channel).take() {
            channel.close();
        }
        lock(&self.pending).take();
    }

    fn open_channel(&self, wait: Duration) -> Result<Arc<SocketChannel>> {
        let mut slot = lock(&self.channel);
        if let Some(channel) = slot.as_ref().filter(|channel| channel.is_open()) {
            return Ok(Arc::clone(channel));
        }

        let handler = Arc::new(ClientHandler {
            resolver: Arc::clone(&self.resolver),
            termination: Arc::clone(&self.termination),
            served: Mutex::new(Vec::new()),
        });
        let channel = SocketChannel::connect(&self.connector, wait, handler)?;
        *slot = Some(Arc::clone(&channel));
        Ok(channel)
    }

    fn accept_reply(&self, message: WireMessage) -> Result<AnnounceReply> {
        let kind = message.kind();
        let reply = message
            .into_announce_reply()
            .ok_or_else(|| ChannelError::UnexpectedMessage(kind.to_string()))?;
        *lock(&self.reply) = Some(reply.clone());
        Ok(reply)
    }
}

impl Drop for CommunicatorClient {
    fn drop(&mut self) {
        self.close();
    }
}
