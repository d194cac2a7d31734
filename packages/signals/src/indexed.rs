//! Slot-array event storage.
//!
//! Callbacks are stored in registration order in a growable slot array. One
//! registration is the common case, so a lone callback is held inline and
//! dispatched without ever allocating the array. Removal while no dispatch is
//! active swaps with the last slot; removal during a dispatch only clears the
//! slot, and the array is compacted once the outermost dispatch completes.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::mem;
use std::rc::{Rc, Weak};

use crate::Dispatch;

/// A type-erased registered callback.
type Callback<A> = Rc<dyn Fn(&A)>;

/// Where a listener's callback currently lives inside its event.
///
/// The cell holding this value is shared between the listener and its
/// registry record, so the event can rewrite the position whenever a record
/// relocates (swap-with-last removal, compaction) without reaching into the
/// listener itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Position {
    /// Not registered anywhere. Detached listeners are inert.
    Detached,

    /// The sole registration, held inline outside the slot array.
    Single,

    /// Registered in the slot array at this index.
    Slot(usize),
}

/// One registry entry: the callback plus the position cell it shares with
/// its listener.
struct Record<A> {
    callback: Callback<A>,
    position: Rc<Cell<Position>>,
}

/// Registry storage. The single-record state is the small-object fast path:
/// it is dispatched directly and requires no slot array allocation.
///
/// The `Single` to `Many` transition is one-way. The array strategy never
/// shrinks on removal; capacity is retained for future registrations.
enum Registry<A> {
    Empty,
    Single(Record<A>),
    Many(Vec<Option<Record<A>>>),
}

/// Shared state between an [`Event`] and its [`Listener`] tokens.
///
/// The event owns the core via `Rc`; listeners hold a `Weak`. When the event
/// is dropped the weak references die with it, which makes listener drop and
/// disconnect no-ops without any explicit unlinking pass.
struct EventCore<A> {
    registry: RefCell<Registry<A>>,

    /// A dispatch is currently walking the slot array. While set, removals
    /// must not disturb slot indices, so they clear the slot instead.
    calling: Cell<bool>,

    /// The slot array contains cleared slots pending compaction.
    dirty: Cell<bool>,
}

impl<A> EventCore<A> {
    fn attach(&self, record: Record<A>) {
        let mut registry = self.registry.borrow_mut();

        match &mut *registry {
            Registry::Empty => {
                record.position.set(Position::Single);
                *registry = Registry::Single(record);
            }
            Registry::Single(_) => {
                let Registry::Single(first) = mem::replace(&mut *registry, Registry::Empty)
                else {
                    unreachable!("matched the single-record variant above");
                };

                first.position.set(Position::Slot(0));
                record.position.set(Position::Slot(1));

                let mut slots = Vec::with_capacity(2);
                slots.push(Some(first));
                slots.push(Some(record));
                *registry = Registry::Many(slots);
            }
            Registry::Many(slots) => {
                if slots.len() == slots.capacity() {
                    // Grow by a 1.5x factor instead of the default doubling,
                    // trading a little amortization for less idle capacity.
                    let additional = slots.capacity().div_euclid(2).max(1);
                    slots.reserve_exact(additional);
                }

                record.position.set(Position::Slot(slots.len()));
                slots.push(Some(record));
            }
        }
    }

    fn detach(&self, position: &Cell<Position>) {
        match position.replace(Position::Detached) {
            Position::Detached => {}
            Position::Single => {
                *self.registry.borrow_mut() = Registry::Empty;
            }
            Position::Slot(index) => {
                let mut registry = self.registry.borrow_mut();
                let Registry::Many(slots) = &mut *registry else {
                    unreachable!("a slot position implies slot array storage");
                };

                if self.calling.get() {
                    // Slot indices are live in the dispatch walk above us.
                    // Clear in place; the outermost dispatch compacts later.
                    *slots
                        .get_mut(index)
                        .expect("a live position cell always references an existing slot") = None;
                    self.dirty.set(true);
                } else {
                    debug_assert!(!self.dirty.get());

                    let removed = slots.swap_remove(index);
                    debug_assert!(removed.is_some());

                    if let Some(slot) = slots.get(index) {
                        slot.as_ref()
                            .expect("no cleared slots exist while no dispatch is active")
                            .position
                            .set(Position::Slot(index));
                    }
                }
            }
        }
    }

    fn emit_many(&self, args: &A) {
        let was_calling = self.calling.replace(true);

        let mut index = 0_usize;
        loop {
            // The registry borrow must not be held across the callback call:
            // the callback may re-enter and add or remove registrations. We
            // copy out the callback handle and release the borrow first.
            let callback = {
                let registry = self.registry.borrow();
                let Registry::Many(slots) = &*registry else {
                    break;
                };

                match slots.get(index) {
                    None => break,
                    Some(slot) => slot.as_ref().map(|record| Rc::clone(&record.callback)),
                }
            };

            if let Some(callback) = callback {
                callback(args);
            }

            index = index
                .checked_add(1)
                .expect("slot count is bounded by memory");
        }

        if !was_calling {
            self.calling.set(false);

            if self.dirty.replace(false) {
                self.compact();
            }
        }
    }

    /// Drops cleared slots and renumbers the survivors, rewriting each
    /// surviving listener's position cell to its new index. Only the
    /// outermost dispatch calls this, once no slot indices are live.
    fn compact(&self) {
        let mut registry = self.registry.borrow_mut();
        let Registry::Many(slots) = &mut *registry else {
            return;
        };

        slots.retain(Option::is_some);

        for (index, slot) in slots.iter().enumerate() {
            slot.as_ref()
                .expect("cleared slots were just removed")
                .position
                .set(Position::Slot(index));
        }
    }
}

/// A synchronous publish-subscribe event using slot-array storage.
///
/// Zero or more callbacks are registered via [`listen()`][Self::listen], each
/// represented by a [`Listener`] token. Invoking [`emit()`][Self::emit] calls
/// every registered callback with the event's arguments, on the calling
/// thread, in registration order.
///
/// A callback running during a dispatch may freely add or remove listeners on
/// the same event (itself included) and may re-invoke the same event;
/// registrations removed mid-dispatch are not visited again within that pass.
///
/// Dropping the event while listeners are attached is safe: the surviving
/// [`Listener`] tokens become inert and their drop or
/// [`disconnect()`][Listener::disconnect] is a no-op.
///
/// # Example
///
/// ```rust
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// use signals::Event;
///
/// let event = Event::<u32>::new();
/// let total = Rc::new(Cell::new(0_u32));
///
/// let _listener = event.listen({
///     let total = Rc::clone(&total);
///     move |delta: &u32| total.set(total.get().wrapping_add(*delta))
/// });
///
/// event.emit(&3);
/// event.emit(&4);
/// assert_eq!(total.get(), 7);
/// ```
pub struct Event<A: 'static> {
    core: Rc<EventCore<A>>,
}

impl<A: 'static> Event<A> {
    /// Creates a new event with no listeners attached.
    ///
    /// # Example
    ///
    /// ```rust
    /// use signals::Event;
    ///
    /// let event = Event::<u32>::new();
    /// assert_eq!(event.listener_count(), 0);
    /// ```
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self {
            core: Rc::new(EventCore {
                registry: RefCell::new(Registry::Empty),
                calling: Cell::new(false),
                dirty: Cell::new(false),
            }),
        }
    }

    /// Registers a callback and returns the [`Listener`] token representing
    /// the registration.
    ///
    /// The registration lives exactly as long as the token: dropping the
    /// token (or calling [`Listener::disconnect()`]) removes the callback
    /// from future dispatches. The token is typically embedded by value in
    /// the subscribing object so that the subscriber's lifetime bounds the
    /// registration's.
    ///
    /// The first registration is stored inline and dispatched through a
    /// dedicated fast path; the slot array is only allocated once a second
    /// listener attaches.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::cell::Cell;
    /// use std::rc::Rc;
    ///
    /// use signals::Event;
    ///
    /// let event = Event::<u32>::new();
    /// let seen = Rc::new(Cell::new(0_u32));
    ///
    /// let listener = event.listen({
    ///     let seen = Rc::clone(&seen);
    ///     move |value: &u32| seen.set(*value)
    /// });
    ///
    /// event.emit(&7);
    /// assert_eq!(seen.get(), 7);
    ///
    /// drop(listener);
    /// event.emit(&9);
    /// assert_eq!(seen.get(), 7);
    /// ```
    #[must_use = "dropping the listener immediately disconnects it"]
    pub fn listen<F>(&self, callback: F) -> Listener<A>
    where
        F: Fn(&A) + 'static,
    {
        let position = Rc::new(Cell::new(Position::Detached));

        self.core.attach(Record {
            callback: Rc::new(callback),
            position: Rc::clone(&position),
        });

        Listener {
            core: Rc::downgrade(&self.core),
            position,
        }
    }

    /// Synchronously calls every currently registered callback with `args`,
    /// in registration order.
    ///
    /// With no listeners this is a no-op; with exactly one listener the
    /// callback is invoked through the inline fast path without touching the
    /// slot array.
    ///
    /// Callbacks may re-enter: adding or removing listeners (including the
    /// currently executing one) and re-invoking this event from inside a
    /// callback are all permitted. Registrations removed during the pass are
    /// skipped for the remainder of it; registrations added during the pass
    /// are visited in the same pass.
    #[inline]
    pub fn emit(&self, args: &A) {
        let cached = {
            let registry = self.core.registry.borrow();
            match &*registry {
                Registry::Empty => return,
                Registry::Single(record) => Some(Rc::clone(&record.callback)),
                Registry::Many(_) => None,
            }
        };

        match cached {
            Some(callback) => callback(args),
            None => self.core.emit_many(args),
        }
    }

    /// The number of listeners currently attached.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        match &*self.core.registry.borrow() {
            Registry::Empty => 0,
            Registry::Single(_) => 1,
            Registry::Many(slots) => slots.iter().flatten().count(),
        }
    }

    /// Whether at least one listener is currently attached.
    #[must_use]
    pub fn has_listeners(&self) -> bool {
        self.listener_count() > 0
    }
}

impl<A: 'static> Default for Event<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: 'static> Dispatch<A> for Event<A> {
    fn emit(&self, args: &A) {
        Self::emit(self, args);
    }

    fn listener_count(&self) -> usize {
        Self::listener_count(self)
    }
}

impl<A: 'static> fmt::Debug for Event<A> {
    #[cfg_attr(test, mutants::skip)] // No API contract for Debug output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("listener_count", &self.listener_count())
            .finish()
    }
}

/// A registration token tying one callback to one [`Event`].
///
/// The token is a plain value: it can be embedded in a subscriber struct and
/// moved freely with it, because it references its registry slot through
/// stable handles rather than addresses. Dropping the token disconnects the
/// callback. Copying is not possible; two tokens can never represent the
/// same registration.
///
/// A default-constructed (detached) token is valid and inert.
pub struct Listener<A: 'static> {
    core: Weak<EventCore<A>>,
    position: Rc<Cell<Position>>,
}

impl<A: 'static> Listener<A> {
    /// Creates a detached token not registered with any event.
    ///
    /// Useful as an initial value for a subscriber field that connects
    /// later. Dropping or disconnecting a detached token does nothing.
    ///
    /// # Example
    ///
    /// ```rust
    /// use signals::Listener;
    ///
    /// let listener = Listener::<u32>::detached();
    /// assert!(!listener.is_connected());
    /// ```
    #[must_use]
    pub fn detached() -> Self {
        Self {
            core: Weak::new(),
            position: Rc::new(Cell::new(Position::Detached)),
        }
    }

    /// Removes this registration from its event, if still attached.
    ///
    /// Safe to call any number of times, and safe to call after the event
    /// has been dropped; both cases are no-ops.
    pub fn disconnect(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.detach(&self.position);
        } else {
            self.position.set(Position::Detached);
        }
    }

    /// Whether this token currently represents a live registration.
    ///
    /// Returns `false` once disconnected, and also once the event itself has
    /// been dropped.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.position.get() != Position::Detached && self.core.strong_count() > 0
    }
}

impl<A: 'static> Default for Listener<A> {
    fn default() -> Self {
        Self::detached()
    }
}

impl<A: 'static> Drop for Listener<A> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl<A: 'static> fmt::Debug for Listener<A> {
    #[cfg_attr(test, mutants::skip)] // No API contract for Debug output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("is_connected", &self.is_connected())
            .finish()
    }
}
