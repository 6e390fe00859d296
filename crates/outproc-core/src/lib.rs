pub mod channel;
pub mod client;
pub mod communicator;
pub mod error;
pub mod escalation;
pub mod instance;
pub mod logging;
pub mod object;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod settings;

#[cfg(test)]
mod testing;

pub use client::CommunicatorClient;
pub use communicator::Communicator;
pub use error::{ChannelError, CommunicatorError, ErrorCode};
pub use object::{Config, Object, VERSION_ANY};
pub use process::{ProcessState, RemoteProcess};
pub use registry::{RemoteProcessMap, RemoteProcessObserver};

use std::sync::{Mutex, MutexGuard};

/// Locks `mutex`, carrying on with the inner value if a previous holder
/// panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
