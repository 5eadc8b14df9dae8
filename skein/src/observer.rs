use crate::transaction::TransactionMut;
use atomic_refcell::AtomicRefCell;
use std::sync::Arc;

pub(crate) type Callback<E> = Arc<dyn Fn(&TransactionMut, &E) + 'static>;

/// A list of callbacks interested in events of type `E`. Callbacks are
/// invoked with the transaction that produced the event. Subscribing returns
/// a [Subscription] guard; dropping the guard unsubscribes.
pub struct Observer<E> {
    state: Arc<AtomicRefCell<State<E>>>,
}

struct State<E> {
    seq: u32,
    callbacks: Vec<(u32, Callback<E>)>,
}

impl<E> Default for Observer<E> {
    fn default() -> Self {
        Observer {
            state: Arc::new(AtomicRefCell::new(State {
                seq: 0,
                callbacks: Vec::new(),
            })),
        }
    }
}

impl<E: 'static> Observer<E> {
    pub fn subscribe<F>(&self, f: F) -> Subscription
    where
        F: Fn(&TransactionMut, &E) + 'static,
    {
        let id = {
            let mut state = self.state.borrow_mut();
            let id = state.seq;
            state.seq += 1;
            state.callbacks.push((id, Arc::new(f)));
            id
        };
        let weak = Arc::downgrade(&self.state);
        Subscription::new(Box::new(move || {
            if let Some(state) = weak.upgrade() {
                let mut state = state.borrow_mut();
                state.callbacks.retain(|(entry, _)| *entry != id);
            }
        }))
    }

    /// Returns a snapshot of the registered callbacks, or `None` when nobody
    /// listens. Triggering over a snapshot lets callbacks subscribe or
    /// unsubscribe while the event is being dispatched.
    pub(crate) fn callbacks(&self) -> Option<Vec<Callback<E>>> {
        let state = self.state.borrow();
        if state.callbacks.is_empty() {
            None
        } else {
            Some(state.callbacks.iter().map(|(_, f)| f.clone()).collect())
        }
    }

    pub fn has_subscribers(&self) -> bool {
        !self.state.borrow().callbacks.is_empty()
    }
}

/// Subscription handle returned from observe methods. The registered callback
/// stays active for as long as this guard is held.
pub struct Subscription(Option<Box<dyn FnOnce()>>);

impl Subscription {
    fn new(cancel: Box<dyn FnOnce()>) -> Self {
        Subscription(Some(cancel))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.0.take() {
            cancel()
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Subscription")
    }
}
