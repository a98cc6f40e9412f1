//! Ordered listener registry shared by every fan-out point
//!
//! Fan-out calls listeners in registration order, isolating panics so one
//! broken listener cannot starve the rest. Listeners may be added or removed
//! while a fan-out is running:
//!
//! - `remove` waits for an in-progress callback on that listener to return;
//! - a listener removing itself from inside its own callback does not block.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, ThreadId};
use tracing::error;

pub type ListenerId = u64;

struct Slot<L: ?Sized> {
    id: ListenerId,
    listener: Arc<L>,
    active: AtomicBool,
    gate: Mutex<()>,
    delivering: Mutex<Option<ThreadId>>,
}

pub struct ListenerRegistry<L: ?Sized> {
    slots: RwLock<Vec<Arc<Slot<L>>>>,
    next_id: AtomicU64,
}

impl<L: ?Sized> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<L: ?Sized> ListenerRegistry<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<L>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot {
            id,
            listener,
            active: AtomicBool::new(true),
            gate: Mutex::new(()),
            delivering: Mutex::new(None),
        });
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(slot);
        id
    }

    /// Remove one listener; returns false if it was not registered
    pub fn remove(&self, id: ListenerId) -> bool {
        let removed = {
            let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            slots
                .iter()
                .position(|s| s.id == id)
                .map(|index| slots.remove(index))
        };

        match removed {
            Some(slot) => {
                Self::retire(&slot);
                true
            }
            None => false,
        }
    }

    /// Remove every registration of this exact listener instance
    pub fn remove_listener(&self, listener: &Arc<L>) -> usize {
        let target = Arc::as_ptr(listener) as *const ();
        self.remove_where(|candidate| Arc::as_ptr(candidate) as *const () == target)
    }

    pub fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Arc<L>) -> bool,
    {
        let removed: Vec<_> = {
            let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            let (gone, kept): (Vec<_>, Vec<_>) =
                slots.drain(..).partition(|s| predicate(&s.listener));
            *slots = kept;
            gone
        };

        removed.iter().for_each(|slot| Self::retire(slot));
        removed.len()
    }

    pub fn clear(&self) -> usize {
        self.remove_where(|_| true)
    }

    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current listeners in registration order
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| Arc::clone(&s.listener))
            .collect()
    }

    /// Call `f` on every active listener, in registration order
    pub fn for_each<F>(&self, event: &str, f: F)
    where
        F: Fn(&L),
    {
        let slots: Vec<_> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for slot in slots {
            let _gate = lock(&slot.gate);
            if !slot.active.load(Ordering::Acquire) {
                continue;
            }

            *lock(&slot.delivering) = Some(thread::current().id());
            let outcome = catch_unwind(AssertUnwindSafe(|| f(&slot.listener)));
            *lock(&slot.delivering) = None;

            if let Err(panic) = outcome {
                error!(
                    event = event,
                    listener_id = slot.id,
                    panic = %panic_message(&panic),
                    "Listener panicked, continuing with remaining listeners"
                );
            }
        }
    }

    fn retire(slot: &Slot<L>) {
        slot.active.store(false, Ordering::Release);

        // Self-removal from inside the callback already holds the gate
        let delivering_here = *lock(&slot.delivering) == Some(thread::current().id());
        if !delivering_here {
            drop(lock(&slot.gate));
        }
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    trait Counter: Send + Sync {
        fn hit(&self, value: usize);
    }

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<usize>>,
    }

    impl Counter for Recording {
        fn hit(&self, value: usize) {
            self.seen.lock().unwrap().push(value);
        }
    }

    struct Panicking;

    impl Counter for Panicking {
        fn hit(&self, _value: usize) {
            panic!("listener failure");
        }
    }

    #[test]
    fn test_fan_out_in_registration_order() {
        let registry: ListenerRegistry<dyn Counter> = ListenerRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Tagged(usize, Arc<Mutex<Vec<usize>>>);
        impl Counter for Tagged {
            fn hit(&self, _value: usize) {
                self.1.lock().unwrap().push(self.0);
            }
        }

        for tag in 0..3 {
            registry.add(Arc::new(Tagged(tag, order.clone())));
        }

        registry.for_each("hit", |l| l.hit(0));

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let registry: ListenerRegistry<dyn Counter> = ListenerRegistry::new();
        let first = Arc::new(Recording::default());
        let last = Arc::new(Recording::default());

        registry.add(first.clone());
        registry.add(Arc::new(Panicking));
        registry.add(last.clone());

        registry.for_each("hit", |l| l.hit(7));

        assert_eq!(*first.seen.lock().unwrap(), vec![7]);
        assert_eq!(*last.seen.lock().unwrap(), vec![7]);
    }

    #[test]
    fn test_remove_by_id_and_instance() {
        let registry: ListenerRegistry<dyn Counter> = ListenerRegistry::new();
        let a: Arc<dyn Counter> = Arc::new(Recording::default());
        let b = Arc::new(Recording::default());

        let id = registry.add(a.clone());
        registry.add(b.clone());
        registry.add(b.clone());

        assert!(registry.remove(id));
        assert!(!registry.remove(id));

        let b_dyn: Arc<dyn Counter> = b.clone();
        assert_eq!(registry.remove_listener(&b_dyn), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_self_removal_inside_callback_does_not_deadlock() {
        struct SelfRemoving {
            registry: Arc<ListenerRegistry<dyn Counter>>,
            id: Mutex<Option<ListenerId>>,
            calls: AtomicUsize,
        }

        impl Counter for SelfRemoving {
            fn hit(&self, _value: usize) {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = *self.id.lock().unwrap() {
                    self.registry.remove(id);
                }
            }
        }

        let registry: Arc<ListenerRegistry<dyn Counter>> = Arc::new(ListenerRegistry::new());
        let listener = Arc::new(SelfRemoving {
            registry: registry.clone(),
            id: Mutex::new(None),
            calls: AtomicUsize::new(0),
        });
        let id = registry.add(listener.clone());
        *listener.id.lock().unwrap() = Some(id);

        registry.for_each("hit", |l| l.hit(1));
        registry.for_each("hit", |l| l.hit(2));

        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_waits_for_in_progress_callback() {
        struct Slow {
            entered: Mutex<Option<std::sync::mpsc::Sender<()>>>,
            finished: AtomicBool,
        }

        impl Counter for Slow {
            fn hit(&self, _value: usize) {
                if let Some(tx) = self.entered.lock().unwrap().take() {
                    tx.send(()).unwrap();
                }
                thread::sleep(Duration::from_millis(100));
                self.finished.store(true, Ordering::SeqCst);
            }
        }

        let (tx, rx) = std::sync::mpsc::channel();
        let registry: Arc<ListenerRegistry<dyn Counter>> = Arc::new(ListenerRegistry::new());
        let slow = Arc::new(Slow {
            entered: Mutex::new(Some(tx)),
            finished: AtomicBool::new(false),
        });
        let id = registry.add(slow.clone());

        let fan_out = {
            let registry = registry.clone();
            thread::spawn(move || registry.for_each("hit", |l| l.hit(0)))
        };

        rx.recv().unwrap();
        registry.remove(id);

        // Removal returned, so the callback must have completed
        assert!(slow.finished.load(Ordering::SeqCst));
        fan_out.join().unwrap();
    }

    #[test]
    fn test_removed_listener_receives_nothing_more() {
        let registry: ListenerRegistry<dyn Counter> = ListenerRegistry::new();
        let recording = Arc::new(Recording::default());
        let id = registry.add(recording.clone());

        registry.for_each("hit", |l| l.hit(1));
        registry.remove(id);
        registry.for_each("hit", |l| l.hit(2));

        assert_eq!(*recording.seen.lock().unwrap(), vec![1]);
    }
}
