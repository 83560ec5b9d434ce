//! Observer registries for client events.
//!
//! Multiple independent subscribers may listen to the same event source and
//! each can unsubscribe independently via the handle returned from
//! [`Observers::subscribe`].

use std::sync::{Arc, Mutex};

type Callback<T> = Box<dyn Fn(&T) + Send>;

/// A set of event callbacks.
pub struct Observers<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

struct Inner<T> {
    next_id: u64,
    subs: Vec<(u64, Callback<T>)>,
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Observers {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                subs: Vec::new(),
            })),
        }
    }
}

impl<T: 'static> Observers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback; dropping or consuming the returned handle via
    /// [`Subscription::unsubscribe`] removes it.
    ///
    /// Callbacks run synchronously on the emitting thread and must not call
    /// back into the same registry.
    pub fn subscribe(&self, cb: impl Fn(&T) + Send + 'static) -> Subscription {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subs.push((id, Box::new(cb)));

        let registry = Arc::clone(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                registry.lock().unwrap().subs.retain(|(sid, _)| *sid != id);
            })),
        }
    }

    pub(crate) fn emit(&self, event: &T) {
        let inner = self.inner.lock().unwrap();
        for (_, cb) in &inner.subs {
            cb(event);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().subs.len()
    }
}

/// Handle to an active subscription; unsubscribes when consumed or dropped.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keeps the subscription alive for the lifetime of the event source
    /// instead of tying it to this handle.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
