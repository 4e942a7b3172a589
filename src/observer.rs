//! Explicit observer registration for backend notifications.
use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

// Shared by every list, so a ref handed out by one list never names a callback of another.
static NEXT_CALLBACK_ID: AtomicUsize = AtomicUsize::new(1);

/// Handle returned by [`Observers::register`], used to forget the callback again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackRef {
    /// The callback reference id
    pub callback_id: usize,
}

impl fmt::Display for CallbackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.callback_id)
    }
}

/// Container for all callbacks interested in one kind of event.
pub struct Observers<T> {
    callbacks: Vec<(CallbackRef, Box<dyn FnMut(&T)>)>,
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self { callbacks: Vec::new() }
    }
}

impl<T> fmt::Debug for Observers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("registered", &self.callbacks.len())
            .finish()
    }
}

impl<T> Observers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new callback, and return the reference with which it can be forgotten.
    ///
    /// # Example
    /// ```
    /// # use lumen::observer::Observers;
    /// let mut observers = Observers::<u32>::new();
    /// let first = observers.register(|_| {});
    /// let second = observers.register(|_| {});
    /// assert_ne!(first, second);
    /// assert!(observers.forget(first));
    /// assert!(!observers.forget(first));
    /// ```
    pub fn register(&mut self, callback: impl FnMut(&T) + 'static) -> CallbackRef {
        let callback_ref = CallbackRef {
            callback_id: NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed),
        };
        self.callbacks.push((callback_ref, Box::new(callback)));
        callback_ref
    }

    /// Forgets the given callback. Returns whether it was registered.
    pub fn forget(&mut self, callback_ref: CallbackRef) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(id, _)| *id != callback_ref);
        before != self.callbacks.len()
    }

    /// Runs every registered callback, in registration order.
    pub fn emit(&mut self, event: &T) {
        for (_, callback) in self.callbacks.iter_mut() {
            callback(event);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    #[test]
    fn emit_runs_callbacks_in_registration_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut observers = Observers::new();
        let first = seen.clone();
        observers.register(move |event: &u32| first.borrow_mut().push(("first", *event)));
        let second = seen.clone();
        observers.register(move |event: &u32| second.borrow_mut().push(("second", *event)));

        observers.emit(&7);

        assert_eq!(*seen.borrow(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn forgotten_callbacks_are_not_run() {
        let count = Rc::new(RefCell::new(0));
        let mut observers = Observers::new();
        let counter = count.clone();
        let callback_ref = observers.register(move |_: &()| *counter.borrow_mut() += 1);

        assert!(observers.forget(callback_ref));
        assert!(!observers.forget(callback_ref));
        observers.emit(&());

        assert_eq!(*count.borrow(), 0);
    }

    #[test]
    fn refs_from_different_lists_never_collide() {
        let mut outputs = Observers::<u32>::new();
        let mut frames = Observers::<u64>::new();
        let output_ref = outputs.register(|_| {});
        let frame_ref = frames.register(|_| {});

        assert_ne!(output_ref, frame_ref);
        assert!(!outputs.forget(frame_ref));
        assert!(!outputs.is_empty());
        assert!(frames.forget(frame_ref));
    }
}
