//! Bounded work queue: FIFO of jobs, admission up to `max_active` concurrent ones.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::machine::{Demon, Machine, MachineState, Status, TICK};

/// A unit of queued work (download, upload).
pub trait Job: Send + Sync + 'static {
    fn status(&self) -> Status;
    fn set_status(&self, status: Status);
    fn is_active(&self) -> bool;
    fn set_active(&self, active: bool);
}

pub struct WorkQueue<J> {
    items: Mutex<VecDeque<Arc<J>>>,
    active: AtomicUsize,
    max_active: usize,
}

impl<J: Job> WorkQueue<J> {
    pub fn new(max_active: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            active: AtomicUsize::new(0),
            max_active: max_active.max(1),
        }
    }

    /// Reset the job and queue it.
    pub fn add(&self, item: Arc<J>) {
        item.set_status(Status::None);
        item.set_active(false);
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(item);
    }

    /// Whether `item` is still waiting in the queue.
    pub fn contains(&self, item: &Arc<J>) -> bool {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|queued| Arc::ptr_eq(queued, item))
    }

    /// Drop a waiting job. Active jobs are released through `release`.
    pub fn remove(&self, item: &Arc<J>) -> bool {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let before = items.len();
        items.retain(|queued| !Arc::ptr_eq(queued, item));
        before != items.len()
    }

    pub fn available(&self) -> bool {
        self.active.load(Ordering::SeqCst) < self.max_active
    }

    /// Promote the oldest waiting job if a slot is free.
    pub fn activate_next(&self) -> Option<Arc<J>> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        if !self.available() {
            return None;
        }
        let item = items.pop_front()?;
        self.active.fetch_add(1, Ordering::SeqCst);
        item.set_active(true);
        Some(item)
    }

    /// Free the slot held by an active job.
    pub fn release(&self, item: &J) {
        if !item.is_active() {
            return;
        }
        item.set_active(false);
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }
}

/// Decides, each `Process` tick, which waiting jobs to start.
pub trait Admission<J: Job>: Send + Sync + 'static {
    fn process(&self, queue: &Arc<WorkQueue<J>>);

    /// Called once when the queue machine shuts down.
    fn shutdown(&self) {}
}

/// Work-queue machine: `Init -> Process` until `Shutdown`.
/// `Restart` pauses admission for `restart_interval`, then re-enters `Init`.
pub struct Scheduler<J, A> {
    machine: Machine,
    queue: Arc<WorkQueue<J>>,
    admission: A,
    restart_interval: Duration,
}

impl<J: Job, A: Admission<J>> Scheduler<J, A> {
    pub fn new(name: impl Into<String>, max_active: usize, admission: A) -> Self {
        Self {
            machine: Machine::new(name),
            queue: Arc::new(WorkQueue::new(max_active)),
            admission,
            restart_interval: crate::options::Options::default().restart_interval(),
        }
    }

    pub fn with_restart_interval(mut self, interval: Duration) -> Self {
        self.restart_interval = interval;
        self
    }

    pub fn queue(&self) -> &Arc<WorkQueue<J>> {
        &self.queue
    }

    pub fn add(&self, item: Arc<J>) {
        self.queue.add(item);
    }

    pub fn contains(&self, item: &Arc<J>) -> bool {
        self.queue.contains(item)
    }

    pub fn admission(&self) -> &A {
        &self.admission
    }
}

impl<J: Job, A: Admission<J>> Demon for Scheduler<J, A> {
    fn machine(&self) -> &Machine {
        &self.machine
    }

    async fn run(self: Arc<Self>) {
        loop {
            match self.next_state() {
                MachineState::None => break,
                MachineState::Init => {
                    self.machine.set_status(Status::Success);
                    self.machine.set_state(MachineState::Process);
                }
                MachineState::Process => {
                    if !self.machine.is_paused() {
                        self.admission.process(&self.queue);
                    }
                }
                MachineState::Restart => {
                    tracing::debug!(machine = self.machine.name(), "restarting");
                    self.machine.sleep(self.restart_interval, MachineState::Init);
                }
                MachineState::Shutdown => {
                    self.admission.shutdown();
                    self.machine.set_state(MachineState::None);
                }
                _ => {}
            }
            tokio::time::sleep(TICK).await;
        }
        self.machine.set_status(Status::None);
    }
}
