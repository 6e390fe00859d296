use crate::error::{ChannelError, CommunicatorError, Result};
use crate::instance::{InstanceHandle, InstanceResolver};
use crate::object::{Config, Object};
use crate::process::{ProcessState, RemoteProcess};
use crate::registry::{RemoteProcessMap, RemoteProcessObserver};
use crate::server::ChannelServer;
use crate::settings::CommunicatorSettings;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Owns the process map and the channel server remote processes connect to.
pub struct Communicator {
    settings: CommunicatorSettings,
    processes: Arc<RemoteProcessMap>,
    server: ChannelServer,
}

impl Communicator {
    pub fn new(settings: CommunicatorSettings, resolver: Arc<dyn InstanceResolver>) -> Result<Self> {
        let processes = RemoteProcessMap::new(resolver)
            .map_err(ChannelError::from)?
            .with_policy(settings.to_escalation_policy());
        Ok(Self::with_map(settings, Arc::new(processes)))
    }

    pub fn with_map(settings: CommunicatorSettings, processes: Arc<RemoteProcessMap>) -> Self {
        let server = ChannelServer::new(
            &processes,
            settings.proxy_stub_path.clone(),
            settings.trace_categories.clone(),
        );
        Self {
            settings,
            processes,
            server,
        }
    }

    pub fn open(&self) -> Result<SocketAddr> {
        Ok(self.server.open(&self.settings.connector)?)
    }

    pub fn close(&self) {
        self.server.close();
    }

    pub fn is_listening(&self) -> bool {
        self.server.is_listening()
    }

    pub fn connector(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    pub fn settings(&self) -> &CommunicatorSettings {
        &self.settings
    }

    pub fn process_map(&self) -> &Arc<RemoteProcessMap> {
        &self.processes
    }

    pub fn config(&self) -> Result<Config> {
        let connector = self.connector().ok_or(CommunicatorError::Unavailable)?;
        Ok(self.settings.to_config(&connector.to_string()))
    }

    pub fn register(&self, observer: Arc<dyn RemoteProcessObserver>) -> Result<()> {
        self.processes.register(observer)
    }

    pub fn unregister(&self, observer: &Arc<dyn RemoteProcessObserver>) -> Result<()> {
        self.processes.unregister(observer)
    }

    pub fn processes(&self) -> Vec<u32> {
        self.processes.processes()
    }

    pub fn process(&self, pid: u32) -> Option<Arc<RemoteProcess>> {
        self.processes.process(pid)
    }

    pub fn create(&self, object: &Object) -> Result<Arc<RemoteProcess>> {
        let config = self.config()?;
        self.processes.create(object, &config)
    }

    pub fn destroy(&self, pid: u32) -> Result<()> {
        self.processes.destroy(pid)
    }

    /// Launches a process for `object` and waits until it has announced the
    /// implementation it serves.
    pub fn instantiate(&self, object: &Object, wait: Duration) -> Result<(u32, Option<InstanceHandle>)> {
        let process = self.create(object)?;
        let pid = process.id();

        if !process.wait_state(ProcessState::Active, wait) {
            warn!(pid, class = %object.class_name, "remote process did not announce in time");
            if let Err(err) = self.processes.destroy(pid) {
                debug!(pid, "destroy after failed instantiate: {err}");
            }
            return Err(CommunicatorError::Timeout(format!(
                "process {pid} did not announce within {} ms",
                wait.as_millis()
            )));
        }

        info!(pid, class = %object.class_name, "remote process instantiated");
        Ok((pid, process.take_returned_interface()))
    }

    /// Stops accepting connections and destroys every remaining process.
    /// Observers must have unregistered first.
    pub fn shutdown(&self) -> Result<()> {
        self.server.close();
        for pid in self.processes.processes() {
            if let Err(err) = self.processes.destroy(pid) {
                debug!(pid, "destroy during shutdown: {err}");
            }
        }

        match self.processes.observer_count() {
            0 => Ok(()),
            observers => Err(CommunicatorError::ObserversStillRegistered(observers)),
        }
    }
}
