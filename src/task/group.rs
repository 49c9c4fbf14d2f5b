//! Structured waiting and cancellation.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

thread_local! {
    static CURRENT_GROUP: RefCell<Option<TaskGroup>> = const { RefCell::new(None) };
}

/// A reference-counted handle counting outstanding tasks.
///
/// Tasks bound to a group keep its `active_tasks` counter above zero until
/// they are destroyed; `TaskSystem::busy_wait_on` spins the counter down to
/// zero by executing tasks itself. Groups form a tree: binding a task also
/// counts it against every ancestor, so waiting on a root group covers its
/// descendants. Cancellation is cooperative and propagates downward.
#[derive(Clone)]
pub struct TaskGroup {
    inner: Arc<GroupInner>,
}

struct GroupInner {
    active: AtomicU32,
    cancelled: AtomicBool,
    parent: Option<TaskGroup>,
}

impl TaskGroup {
    /// Create a root group.
    pub fn new() -> Self {
        Self::with_parent_opt(None)
    }

    /// Create a child group. The parent link is fixed for the group's
    /// lifetime; the graph is a tree, never a cycle.
    pub fn with_parent(parent: &TaskGroup) -> Self {
        Self::with_parent_opt(Some(parent.clone()))
    }

    fn with_parent_opt(parent: Option<TaskGroup>) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                active: AtomicU32::new(0),
                cancelled: AtomicBool::new(false),
                parent,
            }),
        }
    }

    /// The group of the task currently running on this thread, if any.
    pub fn current() -> Option<TaskGroup> {
        CURRENT_GROUP.with(|g| g.borrow().clone())
    }

    /// Request cancellation. Queued tasks are not skipped; task bodies must
    /// check `is_cancelled` themselves.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// True if this group or any ancestor was cancelled.
    pub fn is_cancelled(&self) -> bool {
        let mut cur = Some(self);
        while let Some(group) = cur {
            if group.inner.cancelled.load(Ordering::Acquire) {
                return true;
            }
            cur = group.inner.parent.as_ref();
        }
        false
    }

    /// True when no bound task is outstanding.
    pub fn is_done(&self) -> bool {
        self.inner.active.load(Ordering::Acquire) == 0
    }

    /// Number of outstanding tasks, descendants included.
    pub fn active_tasks(&self) -> u32 {
        self.inner.active.load(Ordering::Acquire)
    }

    pub(crate) fn on_task_created(&self) {
        let mut cur = Some(self);
        while let Some(group) = cur {
            group.inner.active.fetch_add(1, Ordering::Release);
            cur = group.inner.parent.as_ref();
        }
    }

    pub(crate) fn on_task_done(&self) {
        let mut cur = Some(self);
        while let Some(group) = cur {
            let prev = group.inner.active.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev > 0, "task group counter underflow");
            cur = group.inner.parent.as_ref();
        }
    }

    pub(crate) fn same_group(a: &TaskGroup, b: &TaskGroup) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("active_tasks", &self.active_tasks())
            .field("cancelled", &self.inner.cancelled.load(Ordering::Relaxed))
            .field("has_parent", &self.inner.parent.is_some())
            .finish()
    }
}

/// Publishes `group` as the current group for the duration of a task body;
/// restores the previous value on drop so nested execution works.
pub(crate) struct GroupScope {
    prev: Option<TaskGroup>,
}

impl GroupScope {
    pub(crate) fn enter(group: Option<TaskGroup>) -> Self {
        let prev = CURRENT_GROUP.with(|g| g.replace(group));
        Self { prev }
    }
}

impl Drop for GroupScope {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_GROUP.with(|g| *g.borrow_mut() = prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_reach_zero() {
        let group = TaskGroup::new();
        assert!(group.is_done());

        group.on_task_created();
        group.on_task_created();
        assert_eq!(group.active_tasks(), 2);
        assert!(!group.is_done());

        group.on_task_done();
        group.on_task_done();
        assert!(group.is_done());
    }

    #[test]
    fn test_child_counts_against_parent() {
        let root = TaskGroup::new();
        let child = TaskGroup::with_parent(&root);

        child.on_task_created();
        assert_eq!(root.active_tasks(), 1);
        assert_eq!(child.active_tasks(), 1);

        child.on_task_done();
        assert!(root.is_done());
        assert!(child.is_done());
    }

    #[test]
    fn test_cancellation_propagates_down() {
        let root = TaskGroup::new();
        let child = TaskGroup::with_parent(&root);
        let grandchild = TaskGroup::with_parent(&child);

        assert!(!grandchild.is_cancelled());
        root.cancel();
        assert!(grandchild.is_cancelled());
        assert!(child.is_cancelled());
        // Cancelling a child leaves the parent alone.
        let other_root = TaskGroup::new();
        let other_child = TaskGroup::with_parent(&other_root);
        other_child.cancel();
        assert!(!other_root.is_cancelled());
    }

    #[test]
    fn test_group_scope_restores() {
        assert!(TaskGroup::current().is_none());
        let group = TaskGroup::new();
        {
            let _scope = GroupScope::enter(Some(group.clone()));
            let current = TaskGroup::current().unwrap();
            assert!(TaskGroup::same_group(&current, &group));
            {
                let inner = TaskGroup::new();
                let _nested = GroupScope::enter(Some(inner.clone()));
                let current = TaskGroup::current().unwrap();
                assert!(TaskGroup::same_group(&current, &inner));
            }
            let current = TaskGroup::current().unwrap();
            assert!(TaskGroup::same_group(&current, &group));
        }
        assert!(TaskGroup::current().is_none());
    }
}
