//! Generic finite state machine with an explicit transition allow-list.
//!
//! Legal edges are registered as ordered `(from, to)` pairs, each with an optional
//! callback. [`StateMachine::try_transition`] is the only way to move through the
//! table; [`StateMachine::force_transition`] bypasses it for administrative resets.
//!
//! # Locking
//!
//! The edge lookup, the callback and the state write run under one mutex, so a
//! transition is all-or-nothing. The resulting [`StateChanged`] event is queued in
//! the same critical section and delivered to observers *after* the lock is released:
//! whichever caller finds the queue idle becomes the dispatcher and drains it in FIFO
//! order. Observers may therefore call back into the machine (the nested event is
//! queued and delivered right after the current one) and always see notifications in
//! the order the transitions happened.
//!
//! Transition callbacks run inside the critical section and must not call back into
//! the same machine.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace};

/// Requirements on a state type: cheap to copy, hashable, printable.
pub trait FsmState: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> FsmState for T where T: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// Notification emitted after every accepted transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateChanged<S> {
    /// State before the transition.
    pub from: S,
    /// State after the transition.
    pub to: S,
    /// True when produced by [`StateMachine::force_transition`].
    pub forced: bool,
}

type TransitionCallback<S> = Box<dyn Fn(S, S) + Send + Sync>;
type Observer<S> = Arc<dyn Fn(&StateChanged<S>) + Send + Sync>;

struct Core<S> {
    state: S,
    transitions: HashMap<(S, S), Option<TransitionCallback<S>>>,
    pending: VecDeque<StateChanged<S>>,
    dispatching: bool,
}

struct ObserverList<S> {
    next_id: u64,
    entries: Vec<(u64, Observer<S>)>,
}

/// Finite state machine over `S`.
pub struct StateMachine<S: FsmState> {
    name: String,
    core: Mutex<Core<S>>,
    observers: Arc<RwLock<ObserverList<S>>>,
}

impl<S: FsmState> fmt::Debug for StateMachine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.lock();
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("state", &core.state)
            .field("transitions", &core.transitions.len())
            .finish()
    }
}

impl<S: FsmState> StateMachine<S> {
    /// Creates a machine sitting in `initial` with no registered transitions.
    pub fn new(initial: S) -> Self {
        Self::named("fsm", initial)
    }

    /// Creates a machine with a name used in log output.
    pub fn named(name: impl Into<String>, initial: S) -> Self {
        Self {
            name: name.into(),
            core: Mutex::new(Core {
                state: initial,
                transitions: HashMap::new(),
                pending: VecDeque::new(),
                dispatching: false,
            }),
            observers: Arc::new(RwLock::new(ObserverList {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Registers the legal edge `from -> to` without a callback.
    pub fn add_transition(&self, from: S, to: S) {
        self.core.lock().transitions.insert((from, to), None);
    }

    /// Registers the legal edge `from -> to`; `callback(from, to)` runs once per
    /// accepted transition, before the state is written.
    pub fn add_transition_with<F>(&self, from: S, to: S, callback: F)
    where
        F: Fn(S, S) + Send + Sync + 'static,
    {
        self.core
            .lock()
            .transitions
            .insert((from, to), Some(Box::new(callback)));
    }

    /// Current state.
    pub fn state(&self) -> S {
        self.core.lock().state
    }

    /// True if `(from, to)` is in the table.
    pub fn is_registered(&self, from: S, to: S) -> bool {
        self.core.lock().transitions.contains_key(&(from, to))
    }

    /// True if `try_transition(to)` would currently succeed.
    pub fn can_transition(&self, to: S) -> bool {
        let core = self.core.lock();
        core.state == to || core.transitions.contains_key(&(core.state, to))
    }

    /// Attempts `current -> new_state` through the table.
    ///
    /// Returns true without side effects if already in `new_state`, false (state
    /// unchanged) if the edge is not registered, and otherwise runs the callback,
    /// writes the state, notifies observers and returns true.
    pub fn try_transition(&self, new_state: S) -> bool {
        let mut core = self.core.lock();
        let from = core.state;
        if from == new_state {
            return true;
        }

        match core.transitions.get(&(from, new_state)) {
            None => {
                debug!(
                    fsm = %self.name,
                    from = ?from,
                    to = ?new_state,
                    "Rejected unregistered transition"
                );
                return false;
            }
            Some(Some(callback)) => callback(from, new_state),
            Some(None) => {}
        }

        core.state = new_state;
        self.enqueue(core, StateChanged {
            from,
            to: new_state,
            forced: false,
        });
        true
    }

    /// Moves to `new_state` regardless of the table. No transition callback runs,
    /// observers are still notified. Returns the previous state.
    pub fn force_transition(&self, new_state: S) -> S {
        let mut core = self.core.lock();
        let from = core.state;
        core.state = new_state;
        debug!(fsm = %self.name, from = ?from, to = ?new_state, "Forced transition");
        self.enqueue(core, StateChanged {
            from,
            to: new_state,
            forced: true,
        });
        from
    }

    /// Registers an observer. It stays registered until the returned handle is
    /// dropped or [`Subscription::unsubscribe`] is called.
    pub fn subscribe<F>(&self, observer: F) -> Subscription<S>
    where
        F: Fn(&StateChanged<S>) + Send + Sync + 'static,
    {
        let mut list = self.observers.write();
        let id = list.next_id;
        list.next_id += 1;
        list.entries.push((id, Arc::new(observer)));
        Subscription {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.read().entries.len()
    }

    fn enqueue(&self, mut core: parking_lot::MutexGuard<'_, Core<S>>, event: StateChanged<S>) {
        core.pending.push_back(event);
        if core.dispatching {
            return;
        }
        core.dispatching = true;
        drop(core);
        self.drain();
    }

    fn drain(&self) {
        loop {
            let event = {
                let mut core = self.core.lock();
                match core.pending.pop_front() {
                    Some(event) => event,
                    None => {
                        core.dispatching = false;
                        return;
                    }
                }
            };

            let observers: Vec<Observer<S>> = self
                .observers
                .read()
                .entries
                .iter()
                .map(|(_, observer)| observer.clone())
                .collect();

            trace!(fsm = %self.name, from = ?event.from, to = ?event.to, "Dispatching state change");
            for observer in observers {
                if catch_unwind(AssertUnwindSafe(|| observer(&event))).is_err() {
                    error!(
                        fsm = %self.name,
                        from = ?event.from,
                        to = ?event.to,
                        "State observer panicked"
                    );
                }
            }
        }
    }
}

/// Observer registration handle. Dropping it removes the observer.
pub struct Subscription<S: FsmState> {
    id: u64,
    observers: Weak<RwLock<ObserverList<S>>>,
}

impl<S: FsmState> Subscription<S> {
    /// Removes the observer now.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<S: FsmState> Drop for Subscription<S> {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.write().entries.retain(|(id, _)| *id != self.id);
        }
    }
}

impl<S: FsmState> fmt::Debug for Subscription<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
