use std::sync::{Arc, Mutex, Weak};

use crate::models::{Progress, TaskError, TaskResult};
use crate::orchestration::observers::{ObserverHandle, ObserverList};

pub type ProgressListener = dyn Fn(&Progress) + Send + Sync;

/// Aggregates a task's own progress with one nested child into a single monotonic stream.
///
/// Listeners run synchronously on whichever thread reported; a UI listener has to
/// marshal to the UI context itself.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    inner: Arc<Mutex<ReporterState>>,
}

#[derive(Default)]
struct ReporterState {
    own: f32,
    message: String,
    reported: f32,
    completed: bool,
    child: Option<ChildLink>,
    listeners: ObserverList<ProgressListener>,
}

struct ChildLink {
    reporter: ProgressReporter,
    weight: f32,
    subscription: ObserverHandle,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, fraction: f32, message: impl Into<String>) {
        let message = message.into();
        self.update(|state| {
            if !fraction.is_nan() {
                state.own = state.own.max(fraction.clamp(0.0, 1.0));
            }
            state.message = message;
        });
    }

    /// Pins the reported value to 1.0 regardless of the child.
    pub fn complete(&self) {
        self.update(|state| {
            state.own = 1.0;
            state.completed = true;
        });
    }

    /// Nests `child` as a sub-component weighted by `weight` (clamped to [0, 1]).
    pub fn update_progress(&self, child: &ProgressReporter, weight: f32) -> TaskResult<()> {
        if child.reaches(self) {
            return Err(TaskError::invalid_input(
                "a progress reporter cannot be nested into itself or its own descendant",
            ));
        }

        let parent: Weak<Mutex<ReporterState>> = Arc::downgrade(&self.inner);
        let subscription = child.subscribe(move |_| {
            if let Some(inner) = parent.upgrade() {
                ProgressReporter { inner }.update(|_| {});
            }
        });

        let previous = {
            let mut state = self.lock();
            state.child.replace(ChildLink {
                reporter: child.clone(),
                weight: if weight.is_nan() {
                    0.0
                } else {
                    weight.clamp(0.0, 1.0)
                },
                subscription,
            })
        };
        if let Some(previous) = previous {
            previous.reporter.unsubscribe(previous.subscription);
        }

        self.update(|_| {});
        Ok(())
    }

    pub fn subscribe(&self, listener: impl Fn(&Progress) + Send + Sync + 'static) -> ObserverHandle {
        self.lock().listeners.add(Arc::new(listener))
    }

    pub fn unsubscribe(&self, handle: ObserverHandle) -> bool {
        self.lock().listeners.remove(handle)
    }

    pub fn fraction(&self) -> f32 {
        self.lock().reported
    }

    pub fn snapshot(&self) -> Progress {
        let (fraction, message, child) = {
            let state = self.lock();
            (
                state.reported,
                state.message.clone(),
                state.child.as_ref().map(|link| link.reporter.clone()),
            )
        };

        Progress {
            fraction,
            message,
            child: child.map(|reporter| Box::new(reporter.snapshot())),
        }
    }

    /// True when `target` is this reporter or one of its nested children.
    fn reaches(&self, target: &ProgressReporter) -> bool {
        let mut current = Some(self.clone());
        while let Some(reporter) = current {
            if Arc::ptr_eq(&reporter.inner, &target.inner) {
                return true;
            }
            current = reporter.lock().child.as_ref().map(|link| link.reporter.clone());
        }
        false
    }

    fn update(&self, change: impl FnOnce(&mut ReporterState)) {
        let (child, listeners) = {
            let mut state = self.lock();
            change(&mut state);
            (
                state
                    .child
                    .as_ref()
                    .map(|link| (link.reporter.clone(), link.weight)),
                state.listeners.snapshot(),
            )
        };

        // Read the child outside our own lock; child listeners lock the parent.
        let child_fraction = child.map(|(reporter, weight)| (reporter.fraction(), weight));

        {
            let mut state = self.lock();
            let combined = match child_fraction {
                _ if state.completed => 1.0,
                Some((fraction, weight)) => state.own * (1.0 - weight) + fraction * weight,
                None => state.own,
            };
            state.reported = state.reported.max(combined.clamp(0.0, 1.0));
        }

        if listeners.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        for listener in listeners {
            listener(&snapshot);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReporterState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::ProgressReporter;
    use crate::models::TaskErrorKind;

    fn recorded(reporter: &ProgressReporter) -> Arc<Mutex<Vec<f32>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        reporter.subscribe(move |progress| sink.lock().unwrap().push(progress.fraction));
        seen
    }

    #[test]
    fn fractions_are_clamped() {
        let reporter = ProgressReporter::new();
        reporter.report(-0.5, "negative");
        assert_eq!(reporter.fraction(), 0.0);
        reporter.report(3.0, "overshoot");
        assert_eq!(reporter.fraction(), 1.0);
    }

    #[test]
    fn regressions_keep_the_message_but_not_the_fraction() {
        let reporter = ProgressReporter::new();
        reporter.report(0.6, "fetching");
        reporter.report(0.2, "unpacking");

        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.fraction, 0.6);
        assert_eq!(snapshot.message, "unpacking");
    }

    #[test]
    fn child_progress_is_weighted_into_parent() {
        let parent = ProgressReporter::new();
        let child = ProgressReporter::new();
        parent.update_progress(&child, 0.5).unwrap();
        let seen = recorded(&parent);

        parent.report(0.5, "parent");
        child.report(1.0, "child");

        assert_eq!(*seen.lock().unwrap(), vec![0.25, 0.75]);
        let snapshot = parent.snapshot();
        assert_eq!(snapshot.child.as_ref().unwrap().message, "child");
        assert_eq!(snapshot.innermost_message(), "child");
    }

    #[test]
    fn replacing_the_child_detaches_the_old_one() {
        let parent = ProgressReporter::new();
        let first = ProgressReporter::new();
        let second = ProgressReporter::new();
        parent.update_progress(&first, 1.0).unwrap();
        parent.update_progress(&second, 1.0).unwrap();
        let seen = recorded(&parent);

        first.report(0.9, "stale");
        second.report(0.4, "current");

        assert_eq!(*seen.lock().unwrap(), vec![0.4]);
    }

    #[test]
    fn complete_overrides_an_unfinished_child() {
        let parent = ProgressReporter::new();
        let child = ProgressReporter::new();
        parent.update_progress(&child, 0.5).unwrap();
        child.report(0.2, "partial");

        parent.complete();

        assert_eq!(parent.fraction(), 1.0);
    }

    #[test]
    fn nesting_into_a_descendant_is_rejected() {
        let top = ProgressReporter::new();
        let middle = ProgressReporter::new();
        let bottom = ProgressReporter::new();
        top.update_progress(&middle, 0.5).unwrap();
        middle.update_progress(&bottom, 0.5).unwrap();

        let error = bottom.update_progress(&top, 0.5).unwrap_err();
        assert_eq!(error.kind, TaskErrorKind::InvalidInput);
        let error = middle.update_progress(&top, 0.5).unwrap_err();
        assert_eq!(error.kind, TaskErrorKind::InvalidInput);

        bottom.report(1.0, "done");
        assert_eq!(top.fraction(), 0.25);
    }

    #[test]
    fn nesting_into_itself_is_rejected() {
        let reporter = ProgressReporter::new();
        let error = reporter.update_progress(&reporter.clone(), 0.5).unwrap_err();
        assert_eq!(error.kind, TaskErrorKind::InvalidInput);
    }
}
