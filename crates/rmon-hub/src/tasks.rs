use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Background tasks owned by one component. `abort_all` is synchronous and
/// may be called any number of times.
#[derive(Default)]
pub struct TaskSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    pub fn push(&self, handle: JoinHandle<()>) {
        let mut handles = lock(&self.handles);
        handles.retain(|handle| !handle.is_finished());
        handles.push(handle);
    }

    pub fn abort_all(&self) {
        for handle in lock(&self.handles).drain(..) {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        lock(&self.handles)
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.abort_all();
    }
}
