//! Free-function spawn API.
//!
//! These bind new tasks to the group of the task currently running on this
//! thread, so structured waits cover transitively spawned work.

use super::task_system::{current_system, SystemInner};
use crate::runtime;
use crate::task::{Task, TaskGroup};
use std::sync::Arc;

fn bind_current<F>(f: F) -> Task
where
    F: FnOnce() + Send + 'static,
{
    match TaskGroup::current() {
        Some(group) => Task::with_group(f, group),
        None => Task::new(f),
    }
}

fn current_or_global() -> Arc<SystemInner> {
    current_system().unwrap_or_else(|| runtime::global().inner().clone())
}

pub(crate) fn submit(task: Task, wake_workers: bool) {
    match current_system() {
        Some(inner) => inner.spawn_local(task, wake_workers),
        None => runtime::global().enqueue(task),
    }
}

/// Spawn a task on the current worker's deque (front, for locality) and wake
/// a parked worker. Off a worker thread the task goes to the global system.
pub fn spawn<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    submit(bind_current(f), true);
}

/// Like [`spawn`] but without waking anyone: the task is a continuation of
/// the current work and the current thread will get to it next.
pub fn spawn_continuation<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    submit(bind_current(f), false);
}

/// Spawn a batch. Every element but the last always wakes a worker; only the
/// last honours `wake_workers`.
pub fn spawn_many<I, F>(fns: I, wake_workers: bool)
where
    I: IntoIterator<Item = F>,
    F: FnOnce() + Send + 'static,
{
    let fns: Vec<F> = fns.into_iter().collect();
    let count = fns.len();
    for (index, f) in fns.into_iter().enumerate() {
        let wake = if index + 1 == count { wake_workers } else { true };
        submit(bind_current(f), wake);
    }
}

/// Spawn `f` in a fresh child group and run tasks on this thread until that
/// group drains.
pub fn spawn_and_wait<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let inner = current_or_global();
    let _guard = inner.enter_worker();
    let group = match TaskGroup::current() {
        Some(parent) => TaskGroup::with_parent(&parent),
        None => TaskGroup::new(),
    };
    inner.spawn_local(Task::with_group(f, group.clone()), false);
    inner.busy_wait_on(&group);
}

/// Run tasks on this thread until `group` has none outstanding.
pub fn wait(group: &TaskGroup) {
    current_or_global().busy_wait_on(group);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::scheduler::TaskSystem;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn small_system() -> TaskSystem {
        let config = Config::builder().worker_threads(4).build().unwrap();
        TaskSystem::new(config).unwrap()
    }

    #[test]
    fn test_spawn_and_wait_runs_to_completion() {
        let system = small_system();
        let guard = system.enter_worker();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        spawn_and_wait(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);

        system.exit_worker(guard);
        system.shutdown();
    }

    #[test]
    fn test_spawned_children_are_covered_by_the_wait() {
        let system = small_system();
        let guard = system.enter_worker();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        spawn_and_wait(move || {
            for _ in 0..10 {
                let c = c.clone();
                // Inherits the group of the running task, so the outer wait
                // covers these too.
                spawn(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                });
            }
        });
        assert_eq!(count.load(Ordering::SeqCst), 10);

        system.exit_worker(guard);
        system.shutdown();
    }

    #[test]
    fn test_spawn_many_runs_all() {
        let system = small_system();
        let guard = system.enter_worker();
        let count = Arc::new(AtomicUsize::new(0));
        let group = TaskGroup::new();

        // Drive the batch from inside a task so the spawns inherit its group
        // and the outer wait covers them, last element not waking included.
        let c = count.clone();
        submit(
            Task::with_group(
                move || {
                    let fns: Vec<_> = (0..16)
                        .map(|_| {
                            let c = c.clone();
                            move || {
                                c.fetch_add(1, Ordering::SeqCst);
                            }
                        })
                        .collect();
                    spawn_many(fns, false);
                },
                group.clone(),
            ),
            true,
        );
        wait(&group);
        assert_eq!(count.load(Ordering::SeqCst), 16);

        system.exit_worker(guard);
        system.shutdown();
    }
}
