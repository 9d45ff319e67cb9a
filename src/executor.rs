//! Cooperative background tasks on plain OS threads.
//!
//! Each scheduled task owns a thread that alternates between running the
//! task body and snoozing for the duration the body asked for. A wake cuts
//! the snooze short; cancellation is level-triggered and observed before
//! every run. Pools exist to keep CPU-bound work (the buffered-item
//! processor) and writer work (rollbacks) apart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

/// What a task wants after one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    /// Run again after the given delay, or earlier if woken.
    Snooze(Duration),
    /// Retire the task.
    Done,
}

pub trait Task: Send + Sync + 'static {
    fn run(&self) -> TaskControl;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

struct TaskEntry {
    wake: Sender<()>,
    cancelled: Arc<AtomicBool>,
}

/// One named pool of task threads.
pub struct TaskPool {
    name: &'static str,
    next_id: AtomicU64,
    tasks: Arc<Mutex<HashMap<TaskId, TaskEntry>>>,
}

impl TaskPool {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(1),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Schedule a task; its first run happens after `initial_snooze` unless
    /// woken earlier.
    pub fn schedule(&self, task: Arc<dyn Task>, initial_snooze: Duration) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (wake_tx, wake_rx) = channel::unbounded();
        let cancelled = Arc::new(AtomicBool::new(false));

        self.tasks
            .lock()
            .expect("task pool lock poisoned")
            .insert(
                id,
                TaskEntry {
                    wake: wake_tx,
                    cancelled: Arc::clone(&cancelled),
                },
            );

        let tasks = Arc::clone(&self.tasks);
        let thread_name = format!("{}-{}", self.name, id.0);
        tracing::debug!(target: "dcp", task = %task.describe(), pool = self.name, "scheduling task");
        thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                run_task_loop(task, wake_rx, &cancelled, initial_snooze);
                tasks.lock().expect("task pool lock poisoned").remove(&id);
            })
            .expect("failed to spawn task thread");

        id
    }

    /// Cut the task's current snooze short.
    pub fn wake(&self, id: TaskId) {
        let tasks = self.tasks.lock().expect("task pool lock poisoned");
        if let Some(entry) = tasks.get(&id) {
            let _ = entry.wake.send(());
        }
    }

    /// Stop the task before its next run. Idempotent; unknown ids are
    /// ignored (the task may have already retired).
    pub fn cancel(&self, id: TaskId) {
        let tasks = self.tasks.lock().expect("task pool lock poisoned");
        if let Some(entry) = tasks.get(&id) {
            entry.cancelled.store(true, Ordering::Release);
            let _ = entry.wake.send(());
        }
    }

    /// Cancel everything still registered.
    pub fn shutdown(&self) {
        let tasks = self.tasks.lock().expect("task pool lock poisoned");
        for entry in tasks.values() {
            entry.cancelled.store(true, Ordering::Release);
            let _ = entry.wake.send(());
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().expect("task pool lock poisoned").len()
    }
}

fn run_task_loop(
    task: Arc<dyn Task>,
    wake_rx: Receiver<()>,
    cancelled: &AtomicBool,
    initial_snooze: Duration,
) {
    let mut snooze = initial_snooze;
    loop {
        match wake_rx.recv_timeout(snooze) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if cancelled.load(Ordering::Acquire) {
            break;
        }
        match task.run() {
            TaskControl::Done => break,
            TaskControl::Snooze(next) => snooze = next,
        }
    }
}

/// The two worker pools the consumer schedules onto.
pub struct TaskPools {
    pub nonio: TaskPool,
    pub writer: TaskPool,
}

impl TaskPools {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nonio: TaskPool::new("nonio"),
            writer: TaskPool::new("writer"),
        })
    }

    pub fn shutdown(&self) {
        self.nonio.shutdown();
        self.writer.shutdown();
    }
}
