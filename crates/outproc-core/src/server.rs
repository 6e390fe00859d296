use crate::channel::{Channel, ChannelHandler, ChannelId, SocketChannel};
use crate::error::{ChannelError, CommunicatorError};
use crate::instance::InstanceHandle;
use crate::lock;
use crate::protocol::{AnnounceInfo, AnnounceReply, WireMessage};
use crate::registry::RemoteProcessMap;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Default)]
struct LinkState {
    processes: Option<Weak<RemoteProcessMap>>,
    pid: u32,
}

/// Ties a channel to the remote process that announced over it, so losing
/// the connection destroys that process.
#[derive(Default)]
pub struct ProcessChannelLink {
    state: Mutex<LinkState>,
}

impl ProcessChannelLink {
    pub fn link(&self, processes: &Arc<RemoteProcessMap>, pid: u32) {
        let mut state = lock(&self.state);
        state.processes = Some(Arc::downgrade(processes));
        state.pid = pid;
    }

    pub fn is_valid(&self) -> bool {
        lock(&self.state).processes.is_some()
    }

    pub fn pid(&self) -> u32 {
        lock(&self.state).pid
    }

    pub fn state_change(&self, channel: &dyn Channel) {
        if channel.is_open() {
            return;
        }

        let (processes, pid) = {
            let mut state = lock(&self.state);
            if state.pid == 0 {
                return;
            }
            let pid = std::mem::take(&mut state.pid);
            (state.processes.as_ref().and_then(Weak::upgrade), pid)
        };

        let Some(processes) = processes else {
            return;
        };
        warn!(pid, channel = channel.id(), "lost connection to remote process, closing it");
        match processes.destroy(pid) {
            Ok(()) => {}
            Err(CommunicatorError::UnknownProcess(_)) => {
                debug!(pid, "remote process was already destroyed");
            }
            Err(err) => warn!(pid, "destroy after disconnect failed: {err}"),
        }
    }
}

struct ServerShared {
    processes: Weak<RemoteProcessMap>,
    proxy_stub_path: String,
    trace_categories: String,
    running: AtomicBool,
    channels: Mutex<HashMap<ChannelId, Arc<dyn Channel>>>,
}

struct ChannelSession {
    server: Weak<ServerShared>,
    link: ProcessChannelLink,
    // objects this session minted for its peer
    served: Mutex<Vec<InstanceHandle>>,
}

impl ChannelSession {
    fn serve(&self, answer: Option<InstanceHandle>) {
        if let Some(handle) = answer {
            lock(&self.served).push(handle);
        }
    }

    fn release_served(&self, server: &ServerShared) {
        let served = std::mem::take(&mut *lock(&self.served));
        if let Some(processes) = server.processes.upgrade() {
            for handle in served {
                processes.release_instance(handle);
            }
        }
    }

    fn announce(
        &self,
        server: &ServerShared,
        channel: &Arc<dyn Channel>,
        sequence: u64,
        info: AnnounceInfo,
        implementation: Option<InstanceHandle>,
    ) -> WireMessage {
        let answer = match server.processes.upgrade() {
            Some(processes) => match processes.announce(channel, &info, implementation) {
                Ok(answer) => {
                    self.link.link(&processes, info.exchange_id);
                    if implementation.is_none() {
                        self.serve(answer);
                    }
                    answer
                }
                Err(err) => {
                    warn!(pid = info.exchange_id, code = err.code().as_tag(), "announce refused: {err}");
                    None
                }
            },
            None => None,
        };

        WireMessage::announce_ack(
            sequence,
            AnnounceReply {
                implementation: answer,
                proxy_stub_path: server.proxy_stub_path.clone(),
                trace_categories: server.trace_categories.clone(),
            },
        )
    }
}

impl ChannelHandler for ChannelSession {
    fn dispatch(&self, channel: &Arc<dyn Channel>, message: WireMessage) -> Option<WireMessage> {
        let server = self.server.upgrade()?;
        match message {
            WireMessage::Announce {
                sequence,
                exchange_id,
                class_name,
                interface_id,
                version,
                implementation,
            } => {
                let info = AnnounceInfo::new(exchange_id, class_name, interface_id, version);
                Some(self.announce(&server, channel, sequence, info, implementation))
            }
            WireMessage::ObjectRequest {
                sequence,
                class_name,
                interface_id,
                version,
            } => {
                let implementation = server
                    .processes
                    .upgrade()
                    .and_then(|processes| processes.instance(&class_name, interface_id, version));
                self.serve(implementation);
                Some(WireMessage::ObjectResponse {
                    sequence,
                    implementation,
                })
            }
            other => {
                debug!(channel = channel.id(), kind = other.kind(), "ignoring message");
                None
            }
        }
    }

    fn state_change(&self, channel: &Arc<dyn Channel>) {
        if let Some(server) = self.server.upgrade() {
            lock(&server.channels).remove(&channel.id());
            if !channel.is_open() {
                self.release_served(&server);
            }
        }
        self.link.state_change(channel.as_ref());
    }
}

/// Accepts connections from remote processes and answers their announces
/// out of a [`RemoteProcessMap`].
pub struct ChannelServer {
    shared: Arc<ServerShared>,
    local_addr: Mutex<Option<SocketAddr>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelServer {
    pub fn new(
        processes: &Arc<RemoteProcessMap>,
        proxy_stub_path: impl Into<String>,
        trace_categories: impl Into<String>,
    ) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                processes: Arc::downgrade(processes),
                proxy_stub_path: proxy_stub_path.into(),
                trace_categories: trace_categories.into(),
                running: AtomicBool::new(false),
                channels: Mutex::new(HashMap::new()),
            }),
            local_addr: Mutex::new(None),
            acceptor: Mutex::new(None),
        }
    }

    /// Starts listening on `connector` and returns the bound address, which
    /// differs from `connector` when it asked for port 0.
    pub fn open(&self, connector: &str) -> Result<SocketAddr, ChannelError> {
        let mut acceptor = lock(&self.acceptor);
        if let Some(addr) = *lock(&self.local_addr) {
            if acceptor.is_some() {
                return Ok(addr);
            }
        }

        let listener = TcpListener::bind(connector)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("outproc-accept".to_string())
            .spawn(move || accept_loop(listener, &shared))?;

        *acceptor = Some(handle);
        *lock(&self.local_addr) = Some(addr);
        info!(%addr, "channel server listening");
        Ok(addr)
    }

    pub fn close(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = lock(&self.acceptor).take() {
            let _ = handle.join();
        }
        if let Some(addr) = lock(&self.local_addr).take() {
            info!(%addr, "channel server closed");
        }

        let channels = std::mem::take(&mut *lock(&self.shared.channels));
        for channel in channels.values() {
            channel.close();
        }
    }

    pub fn is_listening(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst) && lock(&self.acceptor).is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.shared.channels).len()
    }
}

impl Drop for ChannelServer {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop(listener: TcpListener, shared: &Arc<ServerShared>) {
    while shared.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let session = Arc::new(ChannelSession {
                    server: Arc::downgrade(shared),
                    link: ProcessChannelLink::default(),
                    served: Mutex::new(Vec::new()),
                });
                match SocketChannel::start(stream, session) {
                    Ok(channel) => {
                        debug!(channel = channel.id(), %peer, "accepted connection");
                        let id = channel.id();
                        lock(&shared.channels).insert(id, Arc::clone(&channel) as Arc<dyn Channel>);
                        // the peer may have hung up before the insert
                        if !channel.is_open() {
                            lock(&shared.channels).remove(&id);
                        }
                    }
                    Err(err) => warn!(%peer, "failed to start channel: {err}"),
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(err) => {
                warn!("accept failed: {err}");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::{ClosingInfo, ManualScheduler};
    use crate::instance::{InstanceRegistry, Interface};
    use crate::object::VERSION_ANY;
    use crate::process::ProcessState;
    use crate::registry::RemoteProcessObserver;
    use crate::testing::RecordingObserver;
    use std::sync::mpsc;

    // Above any kernel pid_max, so liveness checks never hit a real process.
    const ATTACHED_PID: u32 = 9_004_242;
    const OFFERING_PID: u32 = 9_000_777;
    const LINKED_PID: u32 = 9_000_031;

    struct Echo;
    impl Interface for Echo {
        const ID: u32 = 0x51;
        const NAME: &'static str = "IEcho";
    }

    struct Client {
        closed: Mutex<Option<mpsc::Sender<()>>>,
    }

    impl ChannelHandler for Client {
        fn dispatch(&self, _channel: &Arc<dyn Channel>, _message: WireMessage) -> Option<WireMessage> {
            None
        }

        fn state_change(&self, _channel: &Arc<dyn Channel>) {
            if let Some(tx) = lock(&self.closed).take() {
                let _ = tx.send(());
            }
        }
    }

    fn echo_registry() -> Arc<InstanceRegistry> {
        let registry = InstanceRegistry::new();
        registry.register::<Echo, _, _>("EchoService", 1, || "echo");
        Arc::new(registry)
    }

    fn processes_from(registry: Arc<InstanceRegistry>) -> Arc<RemoteProcessMap> {
        Arc::new(RemoteProcessMap::with_scheduler(
            registry,
            Arc::new(ManualScheduler::<ClosingInfo>::new()),
        ))
    }

    fn processes() -> Arc<RemoteProcessMap> {
        processes_from(echo_registry())
    }

    fn connect(addr: SocketAddr) -> (Arc<SocketChannel>, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel();
        let channel = SocketChannel::connect(
            &addr.to_string(),
            Duration::from_secs(5),
            Arc::new(Client {
                closed: Mutex::new(Some(tx)),
            }),
        )
        .expect("connect");
        (channel, rx)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..250 {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn unsolicited_announce_is_answered_and_linked() {
        let map = processes();
        let server = ChannelServer::new(&map, "/usr/lib/outproc/proxystubs", r#"["info"]"#);
        let addr = server.open("127.0.0.1:0").expect("open");
        assert!(server.is_listening());

        let recording = RecordingObserver::new();
        let observer: Arc<dyn RemoteProcessObserver> = recording.clone();
        map.register(Arc::clone(&observer)).expect("register");

        let (client, _closed) = connect(addr);
        let info = AnnounceInfo::new(ATTACHED_PID, "EchoService", Echo::ID, VERSION_ANY);
        let reply = client
            .request(
                WireMessage::announce(client.next_sequence(), &info, None),
                Duration::from_secs(5),
            )
            .expect("announce ack")
            .into_announce_reply()
            .expect("ack");

        assert!(reply.implementation.is_some());
        assert_eq!(reply.proxy_stub_path, "/usr/lib/outproc/proxystubs");
        assert_eq!(reply.trace_categories, r#"["info"]"#);
        assert_eq!(map.processes(), vec![ATTACHED_PID]);
        assert_eq!(recording.activations(), vec![ATTACHED_PID]);

        // Dropping the connection destroys the linked process.
        client.close();
        assert!(wait_until(|| map.is_empty()));
        assert_eq!(recording.deactivations(), vec![ATTACHED_PID]);
        assert!(wait_until(|| server.channel_count() == 0));

        map.unregister(&observer).expect("unregister");
        server.close();
        assert!(!server.is_listening());
    }

    #[test]
    fn offered_implementation_activates_process() {
        let map = processes();
        let server = ChannelServer::new(&map, "", "");
        let addr = server.open("127.0.0.1:0").expect("open");

        let (client, _closed) = connect(addr);
        let info = AnnounceInfo::new(OFFERING_PID, "EchoService", Echo::ID, 1);
        let reply = client
            .request(
                WireMessage::announce(client.next_sequence(), &info, InstanceHandle::new(5)),
                Duration::from_secs(5),
            )
            .expect("announce ack")
            .into_announce_reply()
            .expect("ack");

        assert_eq!(reply.implementation, InstanceHandle::new(5));
        let process = map.process(OFFERING_PID).expect("process");
        assert_eq!(process.state(), ProcessState::Active);
        assert_eq!(process.take_returned_interface(), InstanceHandle::new(5));

        server.close();
        assert!(wait_until(|| map.is_empty()));
    }

    #[test]
    fn object_request_is_served_from_resolver() {
        let map = processes();
        let server = ChannelServer::new(&map, "", "");
        let addr = server.open("127.0.0.1:0").expect("open");
        let (client, _closed) = connect(addr);

        let response = client
            .request(
                WireMessage::ObjectRequest {
                    sequence: client.next_sequence(),
                    class_name: "EchoService".to_string(),
                    interface_id: Echo::ID,
                    version: 1,
                },
                Duration::from_secs(5),
            )
            .expect("object response");
        assert!(matches!(
            response,
            WireMessage::ObjectResponse {
                implementation: Some(_),
                ..
            }
        ));
        assert!(map.is_empty());
    }

    #[test]
    fn served_objects_are_released_when_the_peer_disconnects() {
        let registry = echo_registry();
        let map = processes_from(Arc::clone(&registry));
        let server = ChannelServer::new(&map, "", "");
        let addr = server.open("127.0.0.1:0").expect("open");
        let (client, _closed) = connect(addr);

        for _ in 0..2 {
            client
                .request(
                    WireMessage::ObjectRequest {
                        sequence: client.next_sequence(),
                        class_name: "EchoService".to_string(),
                        interface_id: Echo::ID,
                        version: 1,
                    },
                    Duration::from_secs(5),
                )
                .expect("object response");
        }
        assert_eq!(registry.exported_count(), 2);

        client.close();
        assert!(wait_until(|| registry.exported_count() == 0));
        assert!(wait_until(|| server.channel_count() == 0));
        server.close();
    }

    #[test]
    fn peer_hanging_up_right_away_is_not_tracked() {
        let map = processes();
        let server = ChannelServer::new(&map, "", "");
        let addr = server.open("127.0.0.1:0").expect("open");

        for _ in 0..5 {
            drop(std::net::TcpStream::connect(addr).expect("connect"));
        }
        assert!(wait_until(|| server.channel_count() == 0));

        let (_client, _closed) = connect(addr);
        assert!(wait_until(|| server.channel_count() == 1));
        server.close();
    }

    #[test]
    fn closing_server_closes_client_connections() {
        let map = processes();
        let server = ChannelServer::new(&map, "", "");
        let addr = server.open("127.0.0.1:0").expect("open");
        let (_client, closed) = connect(addr);
        assert!(wait_until(|| server.channel_count() == 1));

        server.close();
        closed.recv_timeout(Duration::from_secs(5)).expect("client saw close");
    }

    #[test]
    fn link_destroys_only_once() {
        let map = processes();
        let channel = crate::testing::MemoryChannel::new();
        let dyn_channel: Arc<dyn Channel> = channel.clone();
        map.announce(&dyn_channel, &AnnounceInfo::new(LINKED_PID, "EchoService", Echo::ID, 1), None)
            .expect("announce");

        let link = ProcessChannelLink::default();
        assert!(!link.is_valid());
        link.link(&map, LINKED_PID);
        assert!(link.is_valid());
        assert_eq!(link.pid(), LINKED_PID);

        // Still open: nothing happens.
        link.state_change(channel.as_ref());
        assert_eq!(map.processes(), vec![LINKED_PID]);

        channel.close();
        link.state_change(channel.as_ref());
        assert!(map.is_empty());
        assert_eq!(link.pid(), 0);

        link.state_change(channel.as_ref());
        assert!(map.is_empty());
    }
}
