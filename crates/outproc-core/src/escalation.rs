use crate::error::CommunicatorError;
use crate::lock;
use crate::process::RemoteProcess;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EscalationPolicy {
    pub initial_delay: Duration,
    pub soft_kill_grace: Duration,
    pub hard_kill_grace: Duration,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(3_000),
            soft_kill_grace: Duration::from_millis(6_000),
            hard_kill_grace: Duration::from_millis(8_000),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EscalationStep {
    Initial,
    SoftKill,
    HardKill,
}

pub trait FatalHandler: Send + Sync {
    fn fatal(&self, error: CommunicatorError);
}

/// Stops the whole host. A process that survives a forced kill leaves the
/// system in a state nothing here can repair.
#[derive(Clone, Copy, Debug, Default)]
pub struct AbortOnFatal;

impl FatalHandler for AbortOnFatal {
    fn fatal(&self, error: CommunicatorError) {
        error!(code = error.code().as_tag(), "{error}");
        std::process::abort();
    }
}

pub trait DelayedJob: Send + 'static {
    /// Runs the job and returns the delay before it wants to run again.
    fn run(&mut self) -> Option<Duration>;
}

pub trait Scheduler<J>: Send + Sync {
    fn schedule(&self, delay: Duration, job: J);
}

pub struct ClosingInfo {
    process: Arc<RemoteProcess>,
    step: EscalationStep,
    policy: EscalationPolicy,
    fatal: Arc<dyn FatalHandler>,
}

impl ClosingInfo {
    pub fn new(process: Arc<RemoteProcess>, policy: EscalationPolicy, fatal: Arc<dyn FatalHandler>) -> Self {
        Self {
            process,
            step: EscalationStep::Initial,
            policy,
            fatal,
        }
    }

    pub fn process(&self) -> &Arc<RemoteProcess> {
        &self.process
    }

    pub fn step(&self) -> EscalationStep {
        self.step
    }

    pub fn timed(&mut self) -> Result<Option<Duration>, CommunicatorError> {
        let pid = self.process.id();
        if !self.process.is_active() {
            info!(pid, exit_code = ?self.process.exit_code(), "remote process exited");
            return Ok(None);
        }

        match self.step {
            EscalationStep::Initial => {
                warn!(pid, "remote process still running, asking it to stop");
                self.process.kill(false);
                self.step = EscalationStep::SoftKill;
                Ok(Some(self.policy.soft_kill_grace))
            }
            EscalationStep::SoftKill => {
                warn!(pid, "remote process ignored stop request, killing it");
                self.process.kill(true);
                self.step = EscalationStep::HardKill;
                Ok(Some(self.policy.hard_kill_grace))
            }
            EscalationStep::HardKill => Err(CommunicatorError::Unkillable { pid }),
        }
    }
}

impl DelayedJob for ClosingInfo {
    fn run(&mut self) -> Option<Duration> {
        match self.timed() {
            Ok(next) => next,
            Err(err) => {
                self.fatal.fatal(err);
                None
            }
        }
    }
}

impl Drop for ClosingInfo {
    fn drop(&mut self) {
        if self.process.is_active() {
            debug!(pid = self.process.id(), "closing descriptor dropped, forcing kill");
            self.process.kill(true);
        }
    }
}

struct Entry<J> {
    due: Instant,
    seq: u64,
    job: J,
}

impl<J> PartialEq for Entry<J> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<J> Eq for Entry<J> {}

impl<J> PartialOrd for Entry<J> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<J> Ord for Entry<J> {
    // Reversed so the heap pops the earliest entry first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

struct QueueState<J> {
    entries: BinaryHeap<Entry<J>>,
    next_seq: u64,
    stopped: bool,
}

impl<J> QueueState<J> {
    fn push(&mut self, due: Instant, job: J) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Entry { due, seq, job });
    }
}

struct QueueShared<J> {
    state: Mutex<QueueState<J>>,
    wake: Condvar,
}

/// Runs delayed jobs on one named worker thread. Jobs still pending when the
/// queue is dropped are dropped with it.
pub struct DelayQueue<J: DelayedJob> {
    shared: Arc<QueueShared<J>>,
    worker: Option<JoinHandle<()>>,
}

impl<J: DelayedJob> DelayQueue<J> {
    pub fn new(name: &str) -> io::Result<Self> {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                entries: BinaryHeap::new(),
                next_seq: 0,
                stopped: false,
            }),
            wake: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_queue(&worker_shared))?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub fn pending(&self) -> usize {
        lock(&self.shared.state).entries.len()
    }
}

impl<J: DelayedJob> Scheduler<J> for DelayQueue<J> {
    fn schedule(&self, delay: Duration, job: J) {
        let mut state = lock(&self.shared.state);
        if state.stopped {
            return;
        }
        state.push(due_after(Instant::now(), delay), job);
        self.shared.wake.notify_one();
    }
}

impl<J: DelayedJob> Drop for DelayQueue<J> {
    fn drop(&mut self) {
        lock(&self.shared.state).stopped = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

// Delays past what an Instant can hold are clamped to a far-off due time.
fn due_after(from: Instant, delay: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);
    from.checked_add(delay)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

fn run_queue<J: DelayedJob>(shared: &QueueShared<J>) {
    let mut state = lock(&shared.state);
    loop {
        if state.stopped {
            break;
        }

        let now = Instant::now();
        let next_due = state.entries.peek().map(|entry| entry.due);
        match next_due {
            None => {
                state = shared.wake.wait(state).unwrap_or_else(|p| p.into_inner());
            }
            Some(due) if due > now => {
                state = match shared.wake.wait_timeout(state, due - now) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }
            Some(_) => {
                let Some(mut entry) = state.entries.pop() else {
                    continue;
                };
                drop(state);
                let next = entry.job.run();
                state = lock(&shared.state);
                if let Some(delay) = next {
                    if !state.stopped {
                        state.push(due_after(entry.due, delay), entry.job);
                    }
                }
            }
        }
    }

    let remaining = std::mem::take(&mut state.entries);
    drop(state);
    drop(remaining);
}

struct ManualState<J> {
    now: Duration,
    next_seq: u64,
    entries: Vec<(Duration, u64, J)>,
}

pub struct ManualScheduler<J> {
    state: Mutex<ManualState<J>>,
}

impl<J> Default for ManualScheduler<J> {
    fn default() -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: Duration::ZERO,
                next_seq: 0,
                entries: Vec::new(),
            }),
        }
    }
}

impl<J: DelayedJob> ManualScheduler<J> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        lock(&self.state).now
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn next_due(&self) -> Option<Duration> {
        lock(&self.state).entries.iter().map(|(due, _, _)| *due).min()
    }

    /// Moves the clock forward, running every job that falls due on the way.
    /// Returns how many job runs happened.
    pub fn advance(&self, by: Duration) -> usize {
        let target = lock(&self.state).now + by;
        let mut runs = 0;

        loop {
            let (due, mut job) = {
                let mut state = lock(&self.state);
                let next = state
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, (due, _, _))| *due <= target)
                    .min_by_key(|(_, (due, seq, _))| (*due, *seq))
                    .map(|(index, _)| index);
                let Some(index) = next else {
                    state.now = target;
                    return runs;
                };
                let (due, _, job) = state.entries.swap_remove(index);
                state.now = due;
                (due, job)
            };

            runs += 1;
            if let Some(delay) = job.run() {
                let mut state = lock(&self.state);
                let seq = state.next_seq;
                state.next_seq += 1;
                state.entries.push((due + delay, seq, job));
            }
        }
    }
}

impl<J: DelayedJob> Scheduler<J> for ManualScheduler<J> {
    fn schedule(&self, delay: Duration, job: J) {
        let mut state = lock(&self.state);
        let seq = state.next_seq;
        state.next_seq += 1;
        let due = state.now + delay;
        state.entries.push((due, seq, job));
    }
}
