//! Background timers for batched writes
//!
//! Runs periodic tasks (change-queue flushes, periodic backups) on one
//! background thread. The thread sleeps until the next task is due or a
//! stop request arrives, whichever comes first, so stopping never waits
//! out a full interval.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

/// Action a periodic task runs on every tick
pub type TaskFn = Box<dyn FnMut() -> TaskControl + Send>;

/// Returned by a task to keep or end the timer loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    Continue,
    /// The owner is gone; stop every task
    Shutdown,
}

pub struct PeriodicTask {
    name: &'static str,
    interval: Duration,
    run: TaskFn,
}

impl PeriodicTask {
    pub fn new(name: &'static str, interval: Duration, run: impl FnMut() -> TaskControl + Send + 'static) -> Self {
        Self { name, interval, run: Box::new(run) }
    }
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .finish()
    }
}

/// Owner of the timer thread
#[derive(Debug, Default)]
pub struct WriteCoordinator {
    stop: Option<Sender<()>>,
    thread_handle: Option<thread::JoinHandle<()>>,
    task_names: Vec<&'static str>,
}

impl WriteCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }

    /// Names of the tasks currently armed
    pub fn tasks(&self) -> &[&'static str] {
        &self.task_names
    }

    /// Arm `tasks`, replacing anything armed before.
    ///
    /// Tasks with a zero interval are ignored. Returns false when nothing
    /// was armed.
    pub fn start(&mut self, tasks: Vec<PeriodicTask>) -> bool {
        self.stop();

        let tasks: Vec<PeriodicTask> = tasks.into_iter().filter(|t| !t.interval.is_zero()).collect();
        if tasks.is_empty() {
            return false;
        }
        self.task_names = tasks.iter().map(|t| t.name).collect();

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("markup-write-coordinator".into())
            .spawn(move || run_loop(tasks, stop_rx));

        match handle {
            Ok(handle) => {
                self.stop = Some(stop_tx);
                self.thread_handle = Some(handle);
                true
            }
            Err(err) => {
                log::error!("failed to spawn timer thread: {err}");
                self.task_names.clear();
                false
            }
        }
    }

    /// Stop the thread and wait for it to finish its current task
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            // A closed channel means the loop already exited
            let _ = stop.send(());
        }
        if let Some(handle) = self.thread_handle.take() {
            if handle.thread().id() == thread::current().id() {
                // Stopped from inside a task; the loop exits on its own
                return;
            }
            if handle.join().is_err() {
                log::error!("timer thread panicked");
            }
        }
        self.task_names.clear();
    }
}

impl Drop for WriteCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(mut tasks: Vec<PeriodicTask>, stop: crossbeam_channel::Receiver<()>) {
    let start = Instant::now();
    let mut due: Vec<Instant> = tasks.iter().map(|t| start + t.interval).collect();

    loop {
        let Some(next) = due.iter().min().copied() else {
            return;
        };
        let wait = next.saturating_duration_since(Instant::now());
        match stop.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        for (task, due_at) in tasks.iter_mut().zip(due.iter_mut()) {
            if *due_at > now {
                continue;
            }
            log::trace!("running periodic task {}", task.name);
            if (task.run)() == TaskControl::Shutdown {
                return;
            }
            *due_at = Instant::now() + task.interval;
        }
    }
}
