use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Lifecycle of a start/stop worker.
///
/// `Running` is entered by the worker thread as its first act; `Finished` is
/// entered on normal completion, error or cooperative stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Running,
    Finished,
}

/// State shared between a worker thread and its controller.
///
/// Transitions are published under a mutex and signalled through a condition
/// variable, so `start`/`stop` can block until the worker has actually
/// entered or left `Running` without polling.
#[derive(Debug)]
pub struct StateCell {
    state: Mutex<WorkerState>,
    cond: Condvar,
}

impl StateCell {
    pub fn new() -> Arc<StateCell> {
        Arc::new(StateCell {
            state: Mutex::new(WorkerState::NotStarted),
            cond: Condvar::new(),
        })
    }

    pub fn set(&self, state: WorkerState) {
        let mut guard = self.state.lock().unwrap();
        *guard = state;
        self.cond.notify_all();
    }

    pub fn get(&self) -> WorkerState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.get() == WorkerState::Running
    }

    /// Block until the state no longer matches `pred`.
    pub fn wait_while(&self, pred: impl Fn(WorkerState) -> bool) {
        let mut guard = self.state.lock().unwrap();
        while pred(*guard) {
            guard = self.cond.wait(guard).unwrap();
        }
    }

    /// Block until the state no longer matches `pred` or `timeout` elapses.
    /// Returns true once the predicate no longer holds.
    pub fn wait_while_for(&self, pred: impl Fn(WorkerState) -> bool, timeout: Duration) -> bool {
        let mut guard = self.state.lock().unwrap();
        while pred(*guard) {
            let (g, res) = self.cond.wait_timeout(guard, timeout).unwrap();
            guard = g;
            if res.timed_out() {
                return !pred(*guard);
            }
        }
        true
    }
}

/// Cooperative one-shot stop request, observable from any thread.
///
/// The flag is monotonic for the duration of a run; the worker clears it on
/// exit so the next session starts clean.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn state_cell_publishes_transitions() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), WorkerState::NotStarted);

        let worker_cell = Arc::clone(&cell);
        let handle = thread::spawn(move || {
            worker_cell.set(WorkerState::Running);
            worker_cell.wait_while(|s| s == WorkerState::Running);
        });

        cell.wait_while(|s| s == WorkerState::NotStarted);
        assert_eq!(cell.get(), WorkerState::Running);
        cell.set(WorkerState::Finished);
        handle.join().unwrap();
    }

    #[test]
    fn wait_while_for_times_out() {
        let cell = StateCell::new();
        let done = cell.wait_while_for(
            |s| s == WorkerState::NotStarted,
            Duration::from_millis(10),
        );
        assert!(!done);
    }

    #[test]
    fn stop_flag_is_one_shot_until_cleared() {
        let flag = StopFlag::default();
        assert!(!flag.is_requested());
        flag.request();
        flag.request();
        assert!(flag.is_requested());
        flag.clear();
        assert!(!flag.is_requested());
    }
}
