use std::sync::Arc;

use crate::models::{Affinity, TaskResult};
use crate::orchestration::manager::TaskManager;
use crate::orchestration::observers::{ObserverHandle, ObserverList};
use crate::orchestration::task::{Task, TaskContext};

pub type ItemObserver<T> = dyn Fn(&T) + Send + Sync;

type ListBody<T> = Box<dyn FnOnce(&TaskContext, &mut ItemSink<T>) -> TaskResult<()> + Send>;

/// Collects the items a list body produces and forwards each one to the item observers
/// as soon as it is pushed.
pub struct ItemSink<T> {
    items: Vec<T>,
    observers: Vec<Arc<ItemObserver<T>>>,
}

impl<T> ItemSink<T> {
    pub fn push(&mut self, item: T) {
        for observer in &self.observers {
            observer(&item);
        }
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Builder for a task whose result is a list, with per-item notifications.
pub struct ListTask<T> {
    manager: TaskManager,
    affinity: Affinity,
    name: Option<String>,
    observers: ObserverList<ItemObserver<T>>,
    body: ListBody<T>,
}

impl<T: Clone + Send + 'static> ListTask<T> {
    pub(crate) fn new<F>(manager: TaskManager, affinity: Affinity, body: F) -> Self
    where
        F: FnOnce(&TaskContext, &mut ItemSink<T>) -> TaskResult<()> + Send + 'static,
    {
        Self {
            manager,
            affinity,
            name: None,
            observers: ObserverList::new(),
            body: Box::new(body),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Observers run on the producing thread, in registration order.
    pub fn on_item(&mut self, observer: impl Fn(&T) + Send + Sync + 'static) -> ObserverHandle {
        self.observers.add(Arc::new(observer))
    }

    pub fn remove_item_observer(&mut self, handle: ObserverHandle) -> bool {
        self.observers.remove(handle)
    }

    pub fn into_task(self) -> Task<Vec<T>> {
        let observers = self.observers.snapshot();
        let body = self.body;
        let task = Task::from_body(&self.manager, self.affinity, move |context| {
            let mut sink = ItemSink {
                items: Vec::new(),
                observers,
            };
            body(context, &mut sink)?;
            Ok(sink.items)
        });

        match self.name {
            Some(name) => task.named(name),
            None => task,
        }
    }
}
