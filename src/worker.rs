use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// Code executed by a [`WorkerQueue`] on behalf of a [`WorkerTask`].
///
/// The `id` is the caller-chosen discriminator passed at task creation,
/// letting one runnable serve several request types.
pub trait WorkerRunnable: Send + Sync {
    fn run_task(&self, id: i32);
}

struct QueueEntry {
    key: u64,
    runnable: Arc<dyn WorkerRunnable>,
    id: i32,
}

struct WorkerState {
    queue: VecDeque<QueueEntry>,
    stop: bool,
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    cond: Condvar,
}

/// A worker thread with a FIFO of tasks.
///
/// Offered to adapters for off-thread work (slow clock calculations and
/// the like) that must not run on the caller's thread. Dropping the queue
/// stops the thread after the task currently running, discarding anything
/// still queued.
pub struct WorkerQueue {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerQueue {
    pub fn new(thread_name: &str) -> Self {
        let shared = Arc::new(WorkerShared {
            state: Mutex::new(WorkerState {
                queue: VecDeque::new(),
                stop: false,
            }),
            cond: Condvar::new(),
        });
        let run_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || Self::run(&run_shared))
            .expect("failed to spawn worker thread");
        WorkerQueue {
            shared,
            thread: Some(thread),
        }
    }

    fn run(shared: &WorkerShared) {
        let mut state = shared.state.lock().unwrap();
        loop {
            if state.stop {
                break;
            }
            match state.queue.pop_front() {
                Some(entry) => {
                    // Run the task with the lock released.
                    drop(state);
                    entry.runnable.run_task(entry.id);
                    state = shared.state.lock().unwrap();
                }
                None => {
                    state = shared.cond.wait(state).unwrap();
                }
            }
        }
    }
}

impl Drop for WorkerQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stop = true;
        }
        self.shared.cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

static NEXT_TASK_KEY: AtomicU64 = AtomicU64::new(0);

/// A task that can be queued on a [`WorkerQueue`].
///
/// Dropping the task dequeues it if it is still queued. Dropping does NOT
/// wait for a run already in progress; owners that need that guarantee
/// must synchronise with the runnable themselves.
pub struct WorkerTask {
    shared: Arc<WorkerShared>,
    runnable: Arc<dyn WorkerRunnable>,
    id: i32,
    // Queue-membership identity of this task object.
    task_key: u64,
}

impl WorkerTask {
    pub fn new(queue: &WorkerQueue, runnable: Arc<dyn WorkerRunnable>, id: i32) -> Self {
        WorkerTask {
            shared: Arc::clone(&queue.shared),
            runnable,
            id,
            task_key: NEXT_TASK_KEY.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Queue the task for execution.
    ///
    /// Returns false if the task is already queued. Note that a task can be
    /// queued again while its previous run is still executing.
    pub fn start(&self) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if state.queue.iter().any(|e| e.key == self.task_key) {
            return false;
        }
        state.queue.push_back(QueueEntry {
            key: self.task_key,
            runnable: Arc::clone(&self.runnable),
            id: self.id,
        });
        drop(state);
        self.shared.cond.notify_all();
        true
    }

    /// Dequeue the task. Returns whether it was queued.
    pub fn cancel(&self) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        let before = state.queue.len();
        state.queue.retain(|e| e.key != self.task_key);
        state.queue.len() != before
    }
}

impl Drop for WorkerTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    struct Recorder {
        tx: Mutex<mpsc::Sender<i32>>,
    }

    impl WorkerRunnable for Recorder {
        fn run_task(&self, id: i32) {
            self.tx.lock().unwrap().send(id).unwrap();
        }
    }

    struct Blocker {
        gate: Mutex<bool>,
        cond: Condvar,
        tx: Mutex<mpsc::Sender<i32>>,
    }

    impl WorkerRunnable for Blocker {
        fn run_task(&self, id: i32) {
            let mut open = self.gate.lock().unwrap();
            while !*open {
                open = self.cond.wait(open).unwrap();
            }
            self.tx.lock().unwrap().send(id).unwrap();
        }
    }

    #[test]
    fn tasks_run_in_fifo_order_with_id() {
        let queue = WorkerQueue::new("worker-test");
        let (tx, rx) = mpsc::channel();
        let runnable = Arc::new(Recorder { tx: Mutex::new(tx) });
        let a = WorkerTask::new(&queue, runnable.clone(), 1);
        let b = WorkerTask::new(&queue, runnable, 2);
        assert!(a.start());
        assert!(b.start());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
    }

    #[test]
    fn enqueue_while_queued_is_rejected() {
        let queue = WorkerQueue::new("worker-test");
        let (tx, rx) = mpsc::channel();
        let blocker = Arc::new(Blocker {
            gate: Mutex::new(false),
            cond: Condvar::new(),
            tx: Mutex::new(tx),
        });
        let hold = WorkerTask::new(&queue, blocker.clone(), 0);
        let task = WorkerTask::new(&queue, blocker.clone(), 1);
        // Keep the worker busy so `task` stays queued.
        assert!(hold.start());
        assert!(task.start());
        assert!(!task.start());
        // Release the blocker; both run, the duplicate did not enqueue.
        {
            let mut open = blocker.gate.lock().unwrap();
            *open = true;
        }
        blocker.cond.notify_all();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn cancel_removes_queued_task() {
        let queue = WorkerQueue::new("worker-test");
        let (tx, rx) = mpsc::channel();
        let blocker = Arc::new(Blocker {
            gate: Mutex::new(false),
            cond: Condvar::new(),
            tx: Mutex::new(tx.clone()),
        });
        let recorder = Arc::new(Recorder { tx: Mutex::new(tx) });
        let hold = WorkerTask::new(&queue, blocker.clone(), 0);
        let task = WorkerTask::new(&queue, recorder, 7);
        assert!(hold.start());
        assert!(task.start());
        assert!(task.cancel());
        assert!(!task.cancel());
        {
            let mut open = blocker.gate.lock().unwrap();
            *open = true;
        }
        blocker.cond.notify_all();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
        // The cancelled task never runs.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
