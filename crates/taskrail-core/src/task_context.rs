use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use crate::models::{Affinity, TaskId};

pub(crate) type Deferred = Box<dyn FnOnce()>;

thread_local! {
    static CURRENT_WORKER: Cell<Option<(Affinity, u64)>> = const { Cell::new(None) };
    static CURRENT_TASK_ID: Cell<Option<u64>> = const { Cell::new(None) };
    static DEFERRED: RefCell<Option<VecDeque<Deferred>>> = const { RefCell::new(None) };
}

/// Affinity of the scheduler worker running on this thread, if any.
pub fn current_affinity() -> Option<Affinity> {
    CURRENT_WORKER.with(Cell::get).map(|(affinity, _)| affinity)
}

/// Identity of the scheduler instance running on this thread, if any.
pub(crate) fn current_scheduler() -> Option<u64> {
    CURRENT_WORKER.with(Cell::get).map(|(_, scheduler)| scheduler)
}

pub fn current_task_id() -> Option<TaskId> {
    CURRENT_TASK_ID.with(|slot| slot.get().map(TaskId))
}

pub(crate) fn with_worker<R>(
    affinity: Affinity,
    scheduler: u64,
    operation: impl FnOnce() -> R,
) -> R {
    let previous = CURRENT_WORKER.with(|slot| slot.replace(Some((affinity, scheduler))));
    let _restore = Restore(move || CURRENT_WORKER.with(|slot| slot.set(previous)));
    operation()
}

pub(crate) fn with_task_id<R>(task_id: TaskId, operation: impl FnOnce() -> R) -> R {
    let previous = CURRENT_TASK_ID.with(|slot| slot.replace(Some(task_id.0)));
    let _restore = Restore(move || CURRENT_TASK_ID.with(|slot| slot.set(previous)));
    operation()
}

/// Runs `batch` and everything it defers, one item at a time.
///
/// Inside an active drain the batch is appended to the queue instead, so a chain of
/// completions runs in a loop rather than nesting a stack frame per link.
pub(crate) fn run_deferred(batch: Vec<Deferred>) {
    let mut batch = Some(batch);
    DEFERRED.with(|queue| {
        if let Some(pending) = queue.borrow_mut().as_mut() {
            pending.extend(batch.take().into_iter().flatten());
        }
    });
    let Some(batch) = batch else {
        return;
    };

    DEFERRED.with(|queue| *queue.borrow_mut() = Some(VecDeque::from(batch)));
    let _restore = Restore(|| DEFERRED.with(|queue| *queue.borrow_mut() = None));
    while let Some(next) = DEFERRED.with(|queue| queue.borrow_mut().as_mut()?.pop_front()) {
        next();
    }
}

/// Runs `operation` outside any active drain so completions inside it run right away.
pub(crate) fn without_deferral<R>(operation: impl FnOnce() -> R) -> R {
    let mut suspended = DEFERRED.with(|queue| queue.borrow_mut().take());
    let _restore = Restore(move || DEFERRED.with(|queue| *queue.borrow_mut() = suspended.take()));
    operation()
}

// Restores on unwind too; bodies run under catch_unwind further up.
struct Restore<F: FnMut()>(F);

impl<F: FnMut()> Drop for Restore<F> {
    fn drop(&mut self) {
        (self.0)();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::{
        Deferred, current_affinity, current_scheduler, current_task_id, run_deferred,
        with_task_id, with_worker, without_deferral,
    };
    use crate::models::{Affinity, TaskId};

    #[test]
    fn nested_scopes_restore_previous_values() {
        assert_eq!(current_affinity(), None);
        with_worker(Affinity::Concurrent, 1, || {
            with_worker(Affinity::Exclusive, 2, || {
                assert_eq!(current_affinity(), Some(Affinity::Exclusive));
                assert_eq!(current_scheduler(), Some(2));
            });
            assert_eq!(current_affinity(), Some(Affinity::Concurrent));
            assert_eq!(current_scheduler(), Some(1));
        });
        assert_eq!(current_affinity(), None);
        assert_eq!(current_scheduler(), None);
    }

    fn countdown(remaining: usize, seen: Rc<RefCell<Vec<usize>>>) -> Deferred {
        Box::new(move || {
            seen.borrow_mut().push(remaining);
            if remaining > 0 {
                run_deferred(vec![countdown(remaining - 1, seen)]);
            }
        })
    }

    #[test]
    fn deferred_work_runs_iteratively() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        run_deferred(vec![countdown(100_000, seen.clone())]);

        let seen = seen.borrow();
        assert_eq!(seen.len(), 100_001);
        assert_eq!(seen.last(), Some(&0));
    }

    #[test]
    fn work_outside_a_drain_runs_immediately() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let outer = seen.clone();
        let outer_work: Deferred = Box::new(move || {
            let inner = outer.clone();
            let deferred: Deferred = Box::new(move || inner.borrow_mut().push("deferred"));
            run_deferred(vec![deferred]);
            let inner = outer.clone();
            let immediate: Deferred = Box::new(move || inner.borrow_mut().push("immediate"));
            without_deferral(|| run_deferred(vec![immediate]));
            outer.borrow_mut().push("outer");
        });
        run_deferred(vec![outer_work]);

        assert_eq!(*seen.borrow(), vec!["immediate", "outer", "deferred"]);
    }

    #[test]
    fn task_id_is_scoped_to_the_operation() {
        let seen = with_task_id(TaskId(7), current_task_id);
        assert_eq!(seen, Some(TaskId(7)));
        assert_eq!(current_task_id(), None);
    }
}
