//! State machine engine: push-queue of pending states, deferred sleep, status broadcast.
//!
//! Every peer role owns a `Machine` and implements `Demon`; `start` runs the
//! role's loop on its own task. The loop pulls one state per tick with
//! `next_state` until the machine reaches `None`.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Pause between run-loop iterations.
pub const TICK: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MachineState {
    #[default]
    None,
    Init,
    Handshake,
    Ping,
    Info,
    Listen,
    Connect,
    Process,
    Sleep,
    Restart,
    Shutdown,
    Quit,
    Download,
    Upload,
    Search,
    Browse,
}

/// Outward health of a machine or a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    None,
    Info,
    Success,
    Warning,
    Error,
    Cancelled,
    Paused,
}

#[derive(Default)]
struct Schedule {
    current: MachineState,
    queue: VecDeque<MachineState>,
    deferred: Option<MachineState>,
}

pub struct Machine {
    name: String,
    schedule: Arc<Mutex<Schedule>>,
    paused: AtomicBool,
    status: watch::Sender<Status>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("status", &self.status())
            .finish()
    }
}

macro_rules! state_checks {
    ($($name:ident => $state:ident),* $(,)?) => {
        $(
            pub fn $name(&self) -> bool {
                self.state() == MachineState::$state
            }
        )*
    };
}

impl Machine {
    pub fn new(name: impl Into<String>) -> Self {
        let (status, _) = watch::channel(Status::None);
        Self {
            name: name.into(),
            schedule: Arc::new(Mutex::new(Schedule::default())),
            paused: AtomicBool::new(false),
            status,
            timer: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn schedule(&self) -> std::sync::MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> MachineState {
        self.schedule().current
    }

    /// Queue a state. `None` jumps the queue; everything else is FIFO.
    pub fn set_state(&self, state: MachineState) {
        let mut schedule = self.schedule();
        if state == MachineState::None {
            schedule.queue.push_front(state);
        } else {
            schedule.queue.push_back(state);
        }
    }

    /// Pop the next queued state into current. With nothing queued the current
    /// state stays, so its handler runs again on the next tick.
    pub fn advance(&self) -> MachineState {
        let mut schedule = self.schedule();
        if let Some(next) = schedule.queue.pop_front() {
            schedule.current = next;
        }
        schedule.current
    }

    pub fn pending(&self) -> usize {
        self.schedule().queue.len()
    }

    /// Defer `resume` by `duration`. State reads `Sleep` until the timer fires.
    /// A second call while a sleep is pending is a no-op.
    pub fn sleep(&self, duration: Duration, resume: MachineState) {
        {
            let mut schedule = self.schedule();
            if schedule.deferred.is_some() {
                return;
            }
            schedule.deferred = Some(resume);
            schedule.current = MachineState::Sleep;
        }
        let schedule = Arc::clone(&self.schedule);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let mut schedule = schedule.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(state) = schedule.deferred.take() {
                schedule.queue.push_back(state);
            }
        });
        if let Some(old) = self
            .timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle)
        {
            old.abort();
        }
    }

    pub fn sleeping(&self) -> bool {
        self.schedule().deferred.is_some()
    }

    /// State the pending sleep will resume into.
    pub fn deferred(&self) -> Option<MachineState> {
        self.schedule().deferred
    }

    pub fn cancel_sleep(&self) {
        if let Some(timer) = self.timer.lock().unwrap_or_else(|e| e.into_inner()).take() {
            timer.abort();
        }
        self.schedule().deferred = None;
    }

    /// Clear queue, deferred state and timer.
    pub fn reset(&self) {
        self.cancel_sleep();
        let mut schedule = self.schedule();
        schedule.queue.clear();
        schedule.current = MachineState::None;
    }

    /// Advisory: observed at the next tick.
    pub fn stop(&self) {
        self.set_state(MachineState::Shutdown);
    }

    /// Advisory: observed at the next tick.
    pub fn restart(&self) {
        self.set_state(MachineState::Restart);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.set_status(Status::Paused);
    }

    pub fn unpause(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.set_status(Status::Info);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    pub fn set_status(&self, status: Status) {
        self.status.send_replace(status);
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    state_checks! {
        is_none => None,
        is_init => Init,
        is_handshake => Handshake,
        is_ping => Ping,
        is_info => Info,
        is_listen => Listen,
        is_connect => Connect,
        is_process => Process,
        is_sleep => Sleep,
        is_restart => Restart,
        is_shutdown => Shutdown,
        is_quit => Quit,
        is_download => Download,
        is_upload => Upload,
        is_search => Search,
        is_browse => Browse,
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            timer.abort();
        }
    }
}

/// A role running on the engine.
pub trait Demon: Send + Sync + 'static {
    fn machine(&self) -> &Machine;

    /// Hook run before every state pop.
    fn update(&self) {}

    /// The role's run-loop. Returns once the machine reaches `None`.
    fn run(self: Arc<Self>) -> impl Future<Output = ()> + Send;

    fn next_state(&self) -> MachineState {
        self.update();
        self.machine().advance()
    }
}

/// Reset the machine, queue `Init` and spawn the role's loop.
pub fn start<D: Demon>(demon: &Arc<D>) -> JoinHandle<()> {
    let machine = demon.machine();
    machine.reset();
    machine.set_state(MachineState::Init);
    machine.set_status(Status::Info);
    tracing::debug!(machine = machine.name(), "starting");
    tokio::spawn(Arc::clone(demon).run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn states_are_fifo() {
        let m = Machine::new("t");
        m.set_state(MachineState::Init);
        m.set_state(MachineState::Handshake);
        m.set_state(MachineState::Ping);
        assert_eq!(m.advance(), MachineState::Init);
        assert_eq!(m.advance(), MachineState::Handshake);
        assert_eq!(m.advance(), MachineState::Ping);
        assert_eq!(m.advance(), MachineState::Ping);
    }

    #[test]
    fn none_jumps_the_queue() {
        let m = Machine::new("t");
        m.set_state(MachineState::Init);
        m.set_state(MachineState::Listen);
        m.set_state(MachineState::None);
        assert_eq!(m.advance(), MachineState::None);
        assert!(m.is_none());
        assert_eq!(m.advance(), MachineState::Init);
        assert_eq!(m.advance(), MachineState::Listen);
    }

    #[test]
    fn stop_and_restart_are_queued() {
        let m = Machine::new("t");
        m.set_state(MachineState::Listen);
        m.stop();
        m.restart();
        assert_eq!(m.pending(), 3);
        assert!(m.advance() == MachineState::Listen && m.is_listen());
        assert!(m.advance() == MachineState::Shutdown && m.is_shutdown());
        assert!(m.advance() == MachineState::Restart && m.is_restart());
    }

    #[test]
    fn pause_flags_and_status() {
        let m = Machine::new("t");
        let rx = m.subscribe();
        m.pause();
        assert!(m.is_paused());
        assert_eq!(*rx.borrow(), Status::Paused);
        m.unpause();
        assert!(!m.is_paused());
        assert_eq!(m.status(), Status::Info);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_resumes_into_state() {
        let m = Machine::new("t");
        m.sleep(Duration::from_millis(100), MachineState::Init);
        assert!(m.is_sleep());
        assert_eq!(m.advance(), MachineState::Sleep);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!m.sleeping());
        assert_eq!(m.advance(), MachineState::Init);
    }

    #[tokio::test(start_paused = true)]
    async fn second_sleep_is_a_noop() {
        let m = Machine::new("t");
        m.sleep(Duration::from_millis(100), MachineState::Init);
        m.sleep(Duration::from_millis(10), MachineState::Restart);
        assert_eq!(m.deferred(), Some(MachineState::Init));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(m.advance(), MachineState::Sleep);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(m.advance(), MachineState::Init);
        assert_eq!(m.advance(), MachineState::Init);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_cancels_pending_sleep() {
        let m = Machine::new("t");
        m.sleep(Duration::from_millis(50), MachineState::Init);
        m.reset();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(m.advance(), MachineState::None);
        assert_eq!(m.pending(), 0);
    }

    struct Counter {
        machine: Machine,
        ticks: AtomicUsize,
        updates: AtomicUsize,
    }

    impl Demon for Counter {
        fn machine(&self) -> &Machine {
            &self.machine
        }

        fn update(&self) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }

        async fn run(self: Arc<Self>) {
            loop {
                match self.next_state() {
                    MachineState::None => break,
                    MachineState::Init => {
                        self.ticks.fetch_add(1, Ordering::SeqCst);
                        self.machine.set_state(MachineState::Process);
                    }
                    MachineState::Process => {
                        if self.ticks.fetch_add(1, Ordering::SeqCst) >= 3 {
                            self.machine.stop();
                        }
                    }
                    MachineState::Shutdown => self.machine.set_state(MachineState::None),
                    _ => {}
                }
                tokio::time::sleep(TICK).await;
            }
        }
    }

    #[tokio::test]
    async fn run_loop_ends_at_none() {
        let demon = Arc::new(Counter {
            machine: Machine::new("counter"),
            ticks: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        });
        start(&demon).await.unwrap();
        assert!(demon.machine.is_none());
        assert!(demon.ticks.load(Ordering::SeqCst) >= 4);
        assert_eq!(
            demon.updates.load(Ordering::SeqCst),
            demon.ticks.load(Ordering::SeqCst) + 2
        );
    }
}
