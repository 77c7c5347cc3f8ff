//! Registration-ordered subscriber lists.
//!
//! Callbacks run synchronously, one at a time, on the relay's thread. A
//! callback may cancel any subscription, its own included, while it runs:
//! the set of subscribers for one dispatch is fixed when the dispatch starts,
//! and cancelled entries that have not yet run are skipped.

use std::cell::RefCell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

pub type Callback<E> = Box<dyn FnMut(&E) -> anyhow::Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

trait Revoke {
    fn revoke(&mut self, id: SubscriptionId) -> bool;
}

/// Cancels one subscription. Dropping the handle leaves the subscription in place.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    list: Weak<RefCell<dyn Revoke>>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Returns false if the subscription was already gone.
    pub fn cancel(&self) -> bool {
        match self.list.upgrade() {
            Some(list) => list.borrow_mut().revoke(self.id),
            None => false,
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .finish()
    }
}

/// A subscriber that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub subscriber: SubscriptionId,
    pub key: String,
    pub error: String,
}

struct Entry<K, E> {
    id: SubscriptionId,
    key: K,
    callback: Option<Callback<E>>,
}

struct Entries<K, E> {
    next_id: u64,
    entries: Vec<Entry<K, E>>,
}

impl<K, E> Revoke for Entries<K, E> {
    fn revoke(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }
}

pub struct SubscriberList<K, E> {
    inner: Rc<RefCell<Entries<K, E>>>,
}

impl<K: 'static, E: 'static> Default for SubscriberList<K, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: 'static, E: 'static> SubscriberList<K, E> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Entries {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    pub fn subscribe<F>(&self, key: K, callback: F) -> SubscriptionHandle
    where
        F: FnMut(&E) -> anyhow::Result<()> + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner.entries.push(Entry {
            id,
            key,
            callback: Some(Box::new(callback)),
        });
        drop(inner);

        let list: Rc<RefCell<dyn Revoke>> = self.inner.clone();
        SubscriptionHandle {
            id,
            list: Rc::downgrade(&list),
        }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.borrow_mut().revoke(id)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls every subscriber whose key passes `select`, in registration order.
    pub fn dispatch(
        &self,
        event: &E,
        mut select: impl FnMut(&K) -> bool,
        describe: impl Fn(&K) -> String,
    ) -> Vec<DeliveryFailure> {
        let targets = self
            .inner
            .borrow()
            .entries
            .iter()
            .filter(|entry| select(&entry.key))
            .map(|entry| (entry.id, describe(&entry.key)))
            .collect::<Vec<_>>();

        let mut failures = Vec::new();
        for (id, key) in targets {
            let callback = {
                let mut inner = self.inner.borrow_mut();
                inner
                    .entries
                    .iter_mut()
                    .find(|entry| entry.id == id)
                    .and_then(|entry| entry.callback.take())
            };
            // Gone, or already running further up the stack.
            let Some(mut callback) = callback else {
                continue;
            };

            let outcome = catch_unwind(AssertUnwindSafe(|| callback(event)));
            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(format!("{err:#}")),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };
            if let Some(error) = error {
                failures.push(DeliveryFailure {
                    subscriber: id,
                    key,
                    error,
                });
            }

            let mut inner = self.inner.borrow_mut();
            if let Some(entry) = inner.entries.iter_mut().find(|entry| entry.id == id) {
                entry.callback = Some(callback);
            }
        }
        failures
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn everything(_: &&'static str) -> bool {
        true
    }

    fn label(key: &&'static str) -> String {
        key.to_string()
    }

    #[test]
    fn dispatch_follows_registration_order() {
        let list = SubscriberList::<&'static str, u32>::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let seen = seen.clone();
            list.subscribe(name, move |value: &u32| {
                seen.borrow_mut().push(format!("{name}:{value}"));
                Ok(())
            });
        }
        assert!(list.dispatch(&7, everything, label).is_empty());
        assert_eq!(*seen.borrow(), vec!["first:7", "second:7", "third:7"]);
    }

    #[test]
    fn self_cancel_during_dispatch_keeps_others() {
        let list = SubscriberList::<&'static str, ()>::new();
        let calls = Rc::new(Cell::new(0));
        let own_handle: Rc<RefCell<Option<SubscriptionHandle>>> = Rc::new(RefCell::new(None));

        let counter = calls.clone();
        list.subscribe("a", move |_| {
            counter.set(counter.get() + 1);
            Ok(())
        });
        let counter = calls.clone();
        let slot = own_handle.clone();
        let handle = list.subscribe("b", move |_| {
            counter.set(counter.get() + 1);
            if let Some(handle) = slot.borrow().as_ref() {
                assert!(handle.cancel());
            }
            Ok(())
        });
        *own_handle.borrow_mut() = Some(handle);
        let counter = calls.clone();
        list.subscribe("c", move |_| {
            counter.set(counter.get() + 1);
            Ok(())
        });

        assert!(list.dispatch(&(), everything, label).is_empty());
        assert_eq!(calls.get(), 3);
        assert_eq!(list.len(), 2);

        list.dispatch(&(), everything, label);
        assert_eq!(calls.get(), 5);
    }

    #[test]
    fn failing_and_panicking_subscribers_are_isolated() {
        let list = SubscriberList::<&'static str, ()>::new();
        let reached = Rc::new(Cell::new(false));
        list.subscribe("err", |_| Err(anyhow::anyhow!("bad observer")));
        list.subscribe("panic", |_| panic!("observer blew up"));
        let flag = reached.clone();
        list.subscribe("ok", move |_| {
            flag.set(true);
            Ok(())
        });

        let failures = list.dispatch(&(), everything, label);
        assert!(reached.get());
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].key, "err");
        assert_eq!(failures[0].error, "bad observer");
        assert_eq!(failures[1].key, "panic");
        assert!(failures[1].error.contains("observer blew up"));
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn cancelled_handle_reports_false_twice() {
        let list = SubscriberList::<&'static str, ()>::new();
        let handle = list.subscribe("x", |_| Ok(()));
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(list.is_empty());
        drop(list);
        assert!(!handle.cancel());
    }

    #[test]
    fn select_filters_by_key() {
        let list = SubscriberList::<&'static str, ()>::new();
        let hits = Rc::new(Cell::new(0));
        for key in ["keep", "skip"] {
            let hits = hits.clone();
            list.subscribe(key, move |_| {
                hits.set(hits.get() + 1);
                Ok(())
            });
        }
        list.dispatch(&(), |key| *key == "keep", label);
        assert_eq!(hits.get(), 1);
    }
}
