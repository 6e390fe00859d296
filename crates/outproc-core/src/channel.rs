use crate::error::ChannelError;
use crate::lock;
use crate::protocol::WireMessage;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

pub type ChannelId = u64;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_channel_id() -> ChannelId {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
}

pub trait Channel: Send + Sync {
    fn id(&self) -> ChannelId;
    fn is_open(&self) -> bool;
    fn next_sequence(&self) -> u64;
    fn send(&self, message: &WireMessage) -> Result<(), ChannelError>;

    /// Sends a request and hands back the single-use receiver its response
    /// will be delivered on.
    fn submit(&self, message: WireMessage) -> Result<Receiver<WireMessage>, ChannelError>;

    fn cancel(&self, sequence: u64);

    fn close(&self);

    fn request(&self, message: WireMessage, timeout: Duration) -> Result<WireMessage, ChannelError> {
        let sequence = message.sequence();
        let rx = self.submit(message)?;
        match rx.recv_timeout(timeout) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => {
                if let Some(sequence) = sequence {
                    self.cancel(sequence);
                }
                Err(ChannelError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(ChannelError::Closed),
        }
    }
}

/// Receives everything arriving on a channel that is not a response to one
/// of its own requests.
pub trait ChannelHandler: Send + Sync {
    fn dispatch(&self, channel: &Arc<dyn Channel>, message: WireMessage) -> Option<WireMessage>;

    fn state_change(&self, _channel: &Arc<dyn Channel>) {}
}

pub struct SocketChannel {
    id: ChannelId,
    peer: String,
    writer: Mutex<TcpStream>,
    open: AtomicBool,
    sequence: AtomicU64,
    pending: Mutex<HashMap<u64, Sender<WireMessage>>>,
}

impl SocketChannel {
    pub fn connect(
        connector: &str,
        timeout: Duration,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<Arc<Self>, ChannelError> {
        let addr = connector
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ChannelError::Io(format!("connector {connector} did not resolve")))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        Self::start(stream, handler)
    }

    pub fn start(stream: TcpStream, handler: Arc<dyn ChannelHandler>) -> Result<Arc<Self>, ChannelError> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let reader = stream.try_clone()?;

        let channel = Arc::new(Self {
            id: next_channel_id(),
            peer,
            writer: Mutex::new(stream),
            open: AtomicBool::new(true),
            sequence: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        });

        let worker = Arc::clone(&channel);
        thread::Builder::new()
            .name(format!("outproc-channel-{}", channel.id))
            .spawn(move || worker.read_loop(reader, handler))?;

        debug!(channel = channel.id, peer = %channel.peer, "channel opened");
        Ok(channel)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    fn read_loop(self: Arc<Self>, stream: TcpStream, handler: Arc<dyn ChannelHandler>) {
        let this: Arc<dyn Channel> = self.clone();
        let reader = BufReader::new(stream);

        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    if self.is_open() {
                        debug!(channel = self.id, "channel read failed: {err}");
                    }
                    break;
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let message = match serde_json::from_str::<WireMessage>(trimmed) {
                Ok(message) => message,
                Err(err) => {
                    warn!(channel = self.id, "dropping invalid message: {err}");
                    continue;
                }
            };
            trace!(channel = self.id, kind = message.kind(), "received");

            if message.is_response() {
                self.deliver(message);
                continue;
            }

            if let Some(reply) = handler.dispatch(&this, message) {
                if let Err(err) = self.send(&reply) {
                    debug!(channel = self.id, "reply failed: {err}");
                    break;
                }
            }
        }

        self.mark_closed();
        debug!(channel = self.id, peer = %self.peer, "channel closed");
        handler.state_change(&this);
    }

    fn deliver(&self, message: WireMessage) {
        let Some(sequence) = message.sequence() else {
            return;
        };
        match lock(&self.pending).remove(&sequence) {
            Some(waiter) => {
                let _ = waiter.send(message);
            }
            None => debug!(channel = self.id, sequence, "response without a waiter"),
        }
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
        lock(&self.pending).clear();
        let _ = lock(&self.writer).shutdown(Shutdown::Both);
    }
}

impl Channel for SocketChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    fn send(&self, message: &WireMessage) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }

        let mut payload = serde_json::to_vec(message)?;
        payload.push(b'\n');

        let mut writer = lock(&self.writer);
        writer.write_all(&payload)?;
        writer.flush()?;
        trace!(channel = self.id, kind = message.kind(), "sent");
        Ok(())
    }

    fn submit(&self, message: WireMessage) -> Result<Receiver<WireMessage>, ChannelError> {
        let Some(sequence) = message.sequence() else {
            return Err(ChannelError::UnexpectedMessage(format!(
                "{} cannot be awaited",
                message.kind()
            )));
        };

        let (tx, rx) = mpsc::channel();
        lock(&self.pending).insert(sequence, tx);
        if let Err(err) = self.send(&message) {
            lock(&self.pending).remove(&sequence);
            return Err(err);
        }
        Ok(rx)
    }

    fn cancel(&self, sequence: u64) {
        lock(&self.pending).remove(&sequence);
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = lock(&self.writer).shutdown(Shutdown::Both);
        }
    }
}
