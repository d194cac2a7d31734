//! Grouped event storage.
//!
//! Callbacks bound to the same handler function are kept adjacent in the
//! registry, forming groups. Group order follows the registration order of
//! each group's first member; within a group the order is unspecified. A
//! lone registration is mirrored in a dedicated cache and dispatched without
//! touching the registry at all, and the mirror re-forms whenever the
//! registry shrinks back to exactly one registration.
//!
//! Grouping requires a stable notion of callback identity, so registration
//! takes a receiver and a plain handler function rather than an arbitrary
//! closure: all listeners created for the same receiver type and handler
//! function belong to one group.

use std::any::TypeId;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::mem;
use std::rc::{Rc, Weak};

use foldhash::{HashMap, HashMapExt};

use crate::Dispatch;

/// A type-erased registered callback.
type Callback<A> = Rc<dyn Fn(&A)>;

/// Identity of a callback for grouping purposes: the receiver type plus the
/// handler function. Every registration sharing this identity lands in the
/// same group.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
struct GroupKey {
    receiver_type: TypeId,
    handler: *const (),
}

/// Where a listener's callback currently lives inside its event.
///
/// The cell holding this value is shared between the listener and its
/// registry record; the event rewrites it whenever the record relocates
/// (insertion shifts, removal shifts, compaction, pending splice-in).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Position {
    /// Not registered anywhere. Detached listeners are inert.
    Detached,

    /// Registered in the registry at this index.
    Live(usize),

    /// Registered while a dispatch was active; parked in the pending list at
    /// this index until the outermost dispatch completes.
    Pending(usize),
}

/// One registry entry: the callback, its group identity, and the position
/// cell it shares with its listener.
struct Record<A> {
    callback: Callback<A>,
    group: GroupKey,
    position: Rc<Cell<Position>>,
}

struct Registry<A> {
    /// Records ordered with same-group records adjacent. Slots are `None`
    /// only while a dispatch is active and a record was removed mid-pass.
    records: Vec<Option<Record<A>>>,

    /// The insertion anchor of each group: the position cell of the group
    /// member most recently inserted into `records`. New members of the
    /// group are inserted immediately after their anchor and become the new
    /// anchor.
    ///
    /// We use foldhash for better performance with small hash tables.
    anchors: HashMap<GroupKey, Rc<Cell<Position>>>,

    /// Registrations made while a dispatch was active, spliced into
    /// `records` once the outermost dispatch completes.
    pending: Vec<Option<Record<A>>>,
}

/// Shared state between a [`GroupedEvent`] and its [`GroupedListener`]
/// tokens. The event owns the core via `Rc`; listeners hold a `Weak`, so
/// dropping the event leaves every surviving listener inert without an
/// explicit unlinking pass.
struct EventCore<A> {
    registry: RefCell<Registry<A>>,

    /// Mirror of the sole registration's callback. Populated exactly when
    /// one registration is attached; dispatch then goes through this field
    /// without touching the registry.
    cache: RefCell<Option<Callback<A>>>,

    /// Number of logically attached registrations, pending ones included.
    attached: Cell<usize>,

    /// A dispatch is currently walking the registry. While set, removals
    /// clear their slot in place and insertions are parked in the pending
    /// list, so record indices stay stable for the walk.
    calling: Cell<bool>,

    /// The registry contains cleared slots pending compaction.
    dirty: Cell<bool>,
}

impl<A> Registry<A> {
    /// Repoints or drops the group anchor before the record at `index` goes
    /// away. If the record is its group's anchor, the nearest preceding live
    /// record of the same group takes over; with no such record the group
    /// ends and the anchor entry is dropped.
    fn fix_anchor_before_removal(&mut self, index: usize) {
        let record = self
            .records
            .get(index)
            .and_then(Option::as_ref)
            .expect("a live position cell always references an existing record");
        let group = record.group;

        let is_anchor = self
            .anchors
            .get(&group)
            .is_some_and(|anchor| Rc::ptr_eq(anchor, &record.position));
        if !is_anchor {
            return;
        }

        let replacement = self
            .records
            .iter()
            .take(index)
            .rev()
            .flatten()
            .next()
            .filter(|predecessor| predecessor.group == group)
            .map(|predecessor| Rc::clone(&predecessor.position));

        match replacement {
            Some(anchor) => {
                self.anchors.insert(group, anchor);
            }
            None => {
                self.anchors.remove(&group);
            }
        }
    }
}

impl<A> EventCore<A> {
    /// Inserts a record into the registry immediately, preserving group
    /// adjacency. Must not be called while a dispatch is walking the
    /// registry; mid-dispatch registrations go through the pending list.
    fn insert_now(&self, record: Record<A>) {
        let mut registry = self.registry.borrow_mut();

        let anchor_index = registry.anchors.get(&record.group).map(|anchor| {
            let Position::Live(index) = anchor.get() else {
                unreachable!("group anchors always reference live records");
            };
            index
        });

        match anchor_index {
            Some(index) => {
                let insert_at = index
                    .checked_add(1)
                    .expect("record count is bounded by memory");

                record.position.set(Position::Live(insert_at));
                registry
                    .anchors
                    .insert(record.group, Rc::clone(&record.position));
                registry.records.insert(insert_at, Some(record));

                // Everything after the insertion point shifted up by one.
                let after = insert_at
                    .checked_add(1)
                    .expect("record count is bounded by memory");
                for (shifted, slot) in registry.records.iter().enumerate().skip(after) {
                    slot.as_ref()
                        .expect("no cleared slots exist while no dispatch is active")
                        .position
                        .set(Position::Live(shifted));
                }
            }
            None => {
                record.position.set(Position::Live(registry.records.len()));
                registry
                    .anchors
                    .insert(record.group, Rc::clone(&record.position));
                registry.records.push(Some(record));
            }
        }
    }

    fn detach(&self, position: &Cell<Position>) {
        match position.replace(Position::Detached) {
            Position::Detached => return,
            Position::Pending(index) => {
                let mut registry = self.registry.borrow_mut();
                *registry
                    .pending
                    .get_mut(index)
                    .expect("a pending position cell always references a pending entry") = None;
            }
            Position::Live(index) => {
                let mut registry = self.registry.borrow_mut();
                registry.fix_anchor_before_removal(index);

                if self.calling.get() {
                    // Record indices are live in the dispatch walk above us.
                    // Clear in place; the outermost dispatch compacts later.
                    *registry
                        .records
                        .get_mut(index)
                        .expect("a live position cell always references an existing record") = None;
                    self.dirty.set(true);
                } else {
                    let removed = registry.records.remove(index);
                    debug_assert!(removed.is_some());

                    // Everything after the removal point shifted down by one.
                    for (shifted, slot) in registry.records.iter().enumerate().skip(index) {
                        slot.as_ref()
                            .expect("no cleared slots exist while no dispatch is active")
                            .position
                            .set(Position::Live(shifted));
                    }
                }
            }
        }

        self.attached.set(
            self.attached
                .get()
                .checked_sub(1)
                .expect("every detach is preceded by an attach"),
        );

        if !self.calling.get() {
            self.refresh_cache();
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
                match registry.records.get(index) {
                    None => break,
                    Some(slot) => slot.as_ref().map(|record| Rc::clone(&record.callback)),
                }
            };

            if let Some(callback) = callback {
                callback(args);
            }

            index = index
                .checked_add(1)
                .expect("record count is bounded by memory");
        }

        if !was_calling {
            self.calling.set(false);
            self.finish_dispatch();
        }
    }

    /// Outermost-dispatch cleanup: compacts cleared slots, splices in
    /// registrations parked while the dispatch was active, and re-forms the
    /// single-registration mirror.
    fn finish_dispatch(&self) {
        if self.dirty.replace(false) {
            let mut registry = self.registry.borrow_mut();
            registry.records.retain(Option::is_some);

            for (index, slot) in registry.records.iter().enumerate() {
                slot.as_ref()
                    .expect("cleared slots were just removed")
                    .position
                    .set(Position::Live(index));
            }
        }

        let pending = mem::take(&mut self.registry.borrow_mut().pending);
        for record in pending.into_iter().flatten() {
            self.insert_now(record);
        }

        self.refresh_cache();
    }

    /// Re-establishes the invariant that the mirror cache is populated
    /// exactly when one registration is attached. Only meaningful while no
    /// dispatch is active; the cache is always empty during one.
    fn refresh_cache(&self) {
        let cache = if self.attached.get() == 1 {
            let registry = self.registry.borrow();
            registry
                .records
                .iter()
                .flatten()
                .next()
                .map(|record| Rc::clone(&record.callback))
        } else {
            None
        };

        *self.cache.borrow_mut() = cache;
    }
}

/// A synchronous publish-subscribe event that keeps same-handler callbacks
/// adjacent.
///
/// Registration takes a receiver (any `Rc`-held value) and a handler
/// function; all registrations sharing the receiver type and handler
/// function form a group, and a single [`emit()`][Self::emit] visits each
/// group as an unbroken run. Relative order between groups follows the
/// registration order of each group's first member; order within a group is
/// unspecified.
///
/// The event holds the receiver weakly. A registration whose receiver has
/// been dropped is skipped at dispatch; dropping the [`GroupedListener`]
/// token removes the registration outright.
///
/// Reentrancy follows the same contract as [`Event`][crate::Event], with one
/// difference: registrations added from inside a callback only take effect
/// once the outermost dispatch completes, so they are never visited by the
/// pass that created them.
///
/// # Example
///
/// ```rust
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// use signals::GroupedEvent;
///
/// struct Meter {
///     total: Cell<u32>,
/// }
///
/// impl Meter {
///     fn on_delta(&self, delta: &u32) {
///         self.total.set(self.total.get().wrapping_add(*delta));
///     }
/// }
///
/// let event = GroupedEvent::<u32>::new();
/// let meter = Rc::new(Meter { total: Cell::new(0) });
///
/// let _listener = event.listen(&meter, Meter::on_delta);
///
/// event.emit(&3);
/// event.emit(&4);
/// assert_eq!(meter.total.get(), 7);
/// ```
pub struct GroupedEvent<A: 'static> {
    core: Rc<EventCore<A>>,
}

impl<A: 'static> GroupedEvent<A> {
    /// Creates a new event with no listeners attached.
    ///
    /// # Example
    ///
    /// ```rust
    /// use signals::GroupedEvent;
    ///
    /// let event = GroupedEvent::<u32>::new();
    /// assert_eq!(event.listener_count(), 0);
    /// ```
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self {
            core: Rc::new(EventCore {
                registry: RefCell::new(Registry {
                    records: Vec::new(),
                    anchors: HashMap::new(),
                    pending: Vec::new(),
                }),
                cache: RefCell::new(None),
                attached: Cell::new(0),
                calling: Cell::new(false),
                dirty: Cell::new(false),
            }),
        }
    }

    /// Registers `handler` to be called on `receiver` for every emission,
    /// returning the [`GroupedListener`] token representing the
    /// registration.
    ///
    /// The stored callback performs exactly one receiver upgrade and one
    /// handler call. The event does not keep the receiver alive: if the
    /// receiver's last `Rc` is dropped while the registration exists, the
    /// registration is skipped at dispatch until its token is dropped too.
    ///
    /// All registrations for the same receiver type and handler function
    /// form one group and are dispatched as an unbroken run.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::cell::RefCell;
    /// use std::rc::Rc;
    ///
    /// use signals::GroupedEvent;
    ///
    /// struct Log {
    ///     lines: RefCell<Vec<String>>,
    /// }
    ///
    /// impl Log {
    ///     fn on_message(&self, message: &String) {
    ///         self.lines.borrow_mut().push(message.clone());
    ///     }
    /// }
    ///
    /// let event = GroupedEvent::<String>::new();
    /// let log = Rc::new(Log { lines: RefCell::new(Vec::new()) });
    ///
    /// let _listener = event.listen(&log, Log::on_message);
    ///
    /// event.emit(&"hello".to_string());
    /// assert_eq!(log.lines.borrow().len(), 1);
    /// ```
    #[must_use = "dropping the listener immediately disconnects it"]
    pub fn listen<S>(&self, receiver: &Rc<S>, handler: fn(&S, &A)) -> GroupedListener<A>
    where
        S: 'static,
    {
        let group = GroupKey {
            receiver_type: TypeId::of::<S>(),
            handler: handler as *const (),
        };

        let weak_receiver = Rc::downgrade(receiver);
        let callback: Callback<A> = Rc::new(move |args: &A| {
            if let Some(receiver) = weak_receiver.upgrade() {
                handler(&receiver, args);
            }
        });

        let position = Rc::new(Cell::new(Position::Detached));
        let record = Record {
            callback,
            group,
            position: Rc::clone(&position),
        };

        self.core.attached.set(
            self.core
                .attached
                .get()
                .checked_add(1)
                .expect("listener count is bounded by memory"),
        );

        if self.core.calling.get() {
            let mut registry = self.core.registry.borrow_mut();
            record.position.set(Position::Pending(registry.pending.len()));
            registry.pending.push(Some(record));
        } else {
            self.core.insert_now(record);
            self.core.refresh_cache();
        }

        GroupedListener {
            core: Rc::downgrade(&self.core),
            position,
        }
    }

    /// Synchronously calls every currently registered callback with `args`.
    ///
    /// Each group of same-handler registrations is visited as an unbroken
    /// run. With no listeners this is a no-op; with exactly one listener the
    /// callback is invoked through the mirror cache without touching the
    /// registry.
    ///
    /// Callbacks may re-enter: removing listeners mid-pass prevents them
    /// from being visited later in the pass, while listeners added mid-pass
    /// are only visited by subsequent passes.
    #[inline]
    pub fn emit(&self, args: &A) {
        let cached = self.core.cache.borrow().clone();
        if let Some(callback) = cached {
            callback(args);
            return;
        }

        if self.core.attached.get() == 0 {
            return;
        }

        self.core.emit_many(args);
    }

    /// The number of listeners currently attached, including any whose
    /// registration is parked until the current dispatch completes.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.core.attached.get()
    }

    /// Whether at least one listener is currently attached.
    #[must_use]
    pub fn has_listeners(&self) -> bool {
        self.listener_count() > 0
    }
}

impl<A: 'static> Default for GroupedEvent<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: 'static> Dispatch<A> for GroupedEvent<A> {
    fn emit(&self, args: &A) {
        Self::emit(self, args);
    }

    fn listener_count(&self) -> usize {
        Self::listener_count(self)
    }
}

impl<A: 'static> fmt::Debug for GroupedEvent<A> {
    #[cfg_attr(test, mutants::skip)] // No API contract for Debug output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupedEvent")
            .field("listener_count", &self.listener_count())
            .finish()
    }
}

/// A registration token tying one receiver-handler pair to one
/// [`GroupedEvent`].
///
/// The token is a plain value: it can be embedded in a subscriber struct and
/// moved freely with it, because it references its registry record through
/// stable handles rather than addresses. Dropping the token disconnects the
/// registration. Copying is not possible; two tokens can never represent the
/// same registration.
///
/// A default-constructed (detached) token is valid and inert.
pub struct GroupedListener<A: 'static> {
    core: Weak<EventCore<A>>,
    position: Rc<Cell<Position>>,
}

impl<A: 'static> GroupedListener<A> {
    /// Creates a detached token not registered with any event.
    ///
    /// # Example
    ///
    /// ```rust
    /// use signals::GroupedListener;
    ///
    /// let listener = GroupedListener::<u32>::detached();
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

impl<A: 'static> Default for GroupedListener<A> {
    fn default() -> Self {
        Self::detached()
    }
}

impl<A: 'static> Drop for GroupedListener<A> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl<A: 'static> fmt::Debug for GroupedListener<A> {
    #[cfg_attr(test, mutants::skip)] // No API contract for Debug output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupedListener")
            .field("is_connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::{assert_eq_size, assert_not_impl_any};

    use super::*;

    assert_not_impl_any!(GroupedEvent<u32>: Send, Sync);
    assert_not_impl_any!(GroupedListener<u32>: Send, Sync);

    // The event is a single shared-core handle, pointer-wide.
    assert_eq_size!(GroupedEvent<u32>, usize);

    /// Appends its tag to a shared log on every emission. Tagged listeners
    /// of one handler function form one group.
    struct Probe {
        log: Rc<RefCell<Vec<&'static str>>>,
        tag: &'static str,
    }

    impl Probe {
        fn new(log: &Rc<RefCell<Vec<&'static str>>>, tag: &'static str) -> Rc<Self> {
            Rc::new(Self {
                log: Rc::clone(log),
                tag,
            })
        }

        fn on_first(&self, _: &()) {
            self.log.borrow_mut().push(self.tag);
        }

        fn on_second(&self, _: &()) {
            self.log.borrow_mut().push(self.tag);
        }
    }

    /// Asserts that same-tag entries form unbroken runs, without fixing
    /// which run comes first or the order within a run.
    fn assert_grouped(log: &[&'static str]) {
        let transitions = log.windows(2).filter(|pair| pair[0] != pair[1]).count();
        let distinct = {
            let mut seen: Vec<&str> = Vec::new();
            for entry in log {
                if !seen.contains(entry) {
                    seen.push(entry);
                }
            }
            seen.len()
        };
        assert_eq!(
            transitions,
            distinct.saturating_sub(1),
            "entries are not grouped: {log:?}"
        );
    }

    #[test]
    fn delivers_like_a_direct_call() {
        struct Meter {
            total: Cell<u32>,
        }

        impl Meter {
            fn on_delta(&self, delta: &u32) {
                self.total.set(self.total.get().wrapping_add(*delta));
            }
        }

        let event = GroupedEvent::<u32>::new();
        let meter = Rc::new(Meter {
            total: Cell::new(0),
        });

        let _listener = event.listen(&meter, Meter::on_delta);

        event.emit(&3);
        assert_eq!(meter.total.get(), 3);

        event.emit(&4);
        assert_eq!(meter.total.get(), 7);
    }

    #[test]
    fn emit_without_listeners_is_noop() {
        let event = GroupedEvent::<()>::new();

        event.emit(&());

        assert_eq!(event.listener_count(), 0);
        assert!(!event.has_listeners());
    }

    #[test]
    fn detached_listener_is_inert() {
        let mut listener = GroupedListener::<u32>::detached();

        assert!(!listener.is_connected());
        listener.disconnect();
        listener.disconnect();
    }

    #[test]
    fn interleaved_registrations_dispatch_in_adjacent_groups() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let event = GroupedEvent::<()>::new();

        // Interleave two callback identities: first, second, first, second.
        let a = Probe::new(&log, "first");
        let b = Probe::new(&log, "second");
        let c = Probe::new(&log, "first");
        let d = Probe::new(&log, "second");

        let _la = event.listen(&a, Probe::on_first);
        let _lb = event.listen(&b, Probe::on_second);
        let lc = event.listen(&c, Probe::on_first);
        let ld = event.listen(&d, Probe::on_second);

        event.emit(&());
        {
            let log = log.borrow();
            assert_eq!(log.len(), 4);
            assert_grouped(&log);
        }

        // Removing one member of each group must leave the remaining
        // records grouped.
        drop(lc);
        drop(ld);
        log.borrow_mut().clear();

        event.emit(&());
        {
            let log = log.borrow();
            assert_eq!(log.len(), 2);
            assert_grouped(&log);
        }
    }

    #[test]
    fn groups_reform_after_inner_scope_exits() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let event = GroupedEvent::<()>::new();

        let a = Probe::new(&log, "first");
        let b = Probe::new(&log, "second");

        let _la = event.listen(&a, Probe::on_first);
        let _lb = event.listen(&b, Probe::on_second);

        {
            let c = Probe::new(&log, "first");
            let d = Probe::new(&log, "second");
            let _lc = event.listen(&c, Probe::on_first);
            let _ld = event.listen(&d, Probe::on_second);

            event.emit(&());
            assert_eq!(log.borrow().len(), 4);
            assert_grouped(&log.borrow());
            log.borrow_mut().clear();
        }

        event.emit(&());
        let log = log.borrow();
        assert_eq!(log.len(), 2);
        assert_grouped(&log);
    }

    #[test]
    fn same_receiver_different_handlers_form_separate_groups() {
        struct Dual {
            log: Rc<RefCell<Vec<&'static str>>>,
        }

        impl Dual {
            fn on_alpha(&self, _: &()) {
                self.log.borrow_mut().push("alpha");
            }

            fn on_beta(&self, _: &()) {
                self.log.borrow_mut().push("beta");
            }
        }

        let log = Rc::new(RefCell::new(Vec::new()));
        let event = GroupedEvent::<()>::new();

        let dual = Rc::new(Dual {
            log: Rc::clone(&log),
        });

        // One receiver, two handler identities, interleaved registration.
        let _l1 = event.listen(&dual, Dual::on_alpha);
        let _l2 = event.listen(&dual, Dual::on_beta);
        let _l3 = event.listen(&dual, Dual::on_alpha);
        let _l4 = event.listen(&dual, Dual::on_beta);

        event.emit(&());

        assert_eq!(log.borrow().len(), 4);
        assert_grouped(&log.borrow());
    }

    #[test]
    fn dropped_receiver_is_skipped() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let event = GroupedEvent::<()>::new();

        let keeper = Probe::new(&log, "keeper");
        let transient = Probe::new(&log, "transient");

        let _lk = event.listen(&keeper, Probe::on_first);
        let _lt = event.listen(&transient, Probe::on_first);

        drop(transient);
        event.emit(&());

        assert_eq!(*log.borrow(), vec!["keeper"]);
        // The registration still exists until its token is dropped.
        assert_eq!(event.listener_count(), 2);
    }

    #[test]
    fn event_drop_leaves_listeners_safely_destructible() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let event = GroupedEvent::<()>::new();

        let probe = Probe::new(&log, "only");
        let mut listener = event.listen(&probe, Probe::on_first);

        drop(event);

        assert!(!listener.is_connected());
        listener.disconnect();
    }

    #[test]
    fn moving_subscriber_preserves_registration() {
        struct Subscriber {
            probe: Rc<Probe>,
            listener: GroupedListener<()>,
        }

        let log = Rc::new(RefCell::new(Vec::new()));
        let event = GroupedEvent::<()>::new();

        let probe = Probe::new(&log, "moved");
        let subscriber = Subscriber {
            probe: Rc::clone(&probe),
            listener: event.listen(&probe, Probe::on_first),
        };
        drop(probe);

        // Relocate the subscriber, token included.
        let boxed = Box::new(subscriber);

        event.emit(&());
        assert_eq!(*log.borrow(), vec!["moved"]);
        assert!(boxed.listener.is_connected());
        assert_eq!(boxed.probe.tag, "moved");
    }

    #[cfg(not(miri))] // The tracking allocator cannot run under Miri.
    #[test]
    fn single_listener_dispatch_does_not_allocate() {
        let event = GroupedEvent::<()>::new();
        let log = Rc::new(RefCell::new(Vec::with_capacity(8)));

        let probe = Probe::new(&log, "only");
        let _listener = event.listen(&probe, Probe::on_first);

        let session = alloc_tracker::Session::new();
        let operation = session.operation("single_dispatch");

        {
            let _span = operation.measure_thread();

            event.emit(&());
            event.emit(&());
        }

        assert_eq!(operation.total_bytes_allocated(), 0);
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn mirror_reforms_when_shrinking_back_to_one() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let event = GroupedEvent::<()>::new();

        let survivor = Probe::new(&log, "survivor");
        let transient = Probe::new(&log, "transient");

        let _ls = event.listen(&survivor, Probe::on_first);
        let lt = event.listen(&transient, Probe::on_second);

        event.emit(&());
        assert_eq!(log.borrow().len(), 2);

        drop(lt);
        log.borrow_mut().clear();

        // Back to exactly one registration; dispatch goes through the
        // mirror again.
        event.emit(&());
        assert_eq!(*log.borrow(), vec!["survivor"]);
        assert_eq!(event.listener_count(), 1);
    }

    #[test]
    fn removal_during_dispatch_skips_removed_listener() {
        struct Remover {
            victim: RefCell<Option<GroupedListener<()>>>,
        }

        impl Remover {
            fn on_emit(&self, _: &()) {
                drop(self.victim.borrow_mut().take());
            }
        }

        let log = Rc::new(RefCell::new(Vec::new()));
        let event = GroupedEvent::<()>::new();

        let remover = Rc::new(Remover {
            victim: RefCell::new(None),
        });
        let victim_probe = Probe::new(&log, "victim");

        let _lr = event.listen(&remover, Remover::on_emit);
        *remover.victim.borrow_mut() = Some(event.listen(&victim_probe, Probe::on_first));

        event.emit(&());
        assert!(log.borrow().is_empty());
        assert_eq!(event.listener_count(), 1);
    }

    #[test]
    fn addition_during_dispatch_waits_for_next_pass() {
        struct Adder {
            event: Weak<GroupedEvent<()>>,
            probe: Rc<Probe>,
            added: RefCell<Option<GroupedListener<()>>>,
        }

        impl Adder {
            fn on_emit(&self, _: &()) {
                if self.added.borrow().is_some() {
                    return;
                }

                let event = self.event.upgrade().expect("event is alive during dispatch");
                *self.added.borrow_mut() = Some(event.listen(&self.probe, Probe::on_first));
            }
        }

        let log = Rc::new(RefCell::new(Vec::new()));
        let event = Rc::new(GroupedEvent::<()>::new());

        let adder = Rc::new(Adder {
            event: Rc::downgrade(&event),
            probe: Probe::new(&log, "late"),
            added: RefCell::new(None),
        });
        let _la = event.listen(&adder, Adder::on_emit);

        // A sibling forces the registry walk; pending splice-in only
        // happens at the end of a walk.
        let sibling = Probe::new(&log, "sibling");
        let _ls = event.listen(&sibling, Probe::on_first);

        event.emit(&());
        assert_eq!(*log.borrow(), vec!["sibling"]);
        assert_eq!(event.listener_count(), 3);

        log.borrow_mut().clear();
        event.emit(&());
        let log = log.borrow();
        assert_eq!(log.len(), 2);
        assert!(log.contains(&"sibling"));
        assert!(log.contains(&"late"));
    }

    #[test]
    fn pending_listener_can_disconnect_before_splice_in() {
        struct Churner {
            event: Weak<GroupedEvent<()>>,
            probe: Rc<Probe>,
            done: Cell<bool>,
        }

        impl Churner {
            fn on_emit(&self, _: &()) {
                if self.done.replace(true) {
                    return;
                }

                let event = self.event.upgrade().expect("event is alive during dispatch");
                // Register and immediately drop while the dispatch is still
                // walking: the parked registration must vanish cleanly.
                drop(event.listen(&self.probe, Probe::on_first));
            }
        }

        let log = Rc::new(RefCell::new(Vec::new()));
        let event = Rc::new(GroupedEvent::<()>::new());

        let churner = Rc::new(Churner {
            event: Rc::downgrade(&event),
            probe: Probe::new(&log, "ghost"),
            done: Cell::new(false),
        });
        let _lc = event.listen(&churner, Churner::on_emit);

        let sibling = Probe::new(&log, "sibling");
        let _ls = event.listen(&sibling, Probe::on_first);

        event.emit(&());
        event.emit(&());

        assert!(!log.borrow().contains(&"ghost"));
        assert_eq!(event.listener_count(), 2);
    }

    #[test]
    fn reentrant_emit_with_mutation_terminates_deterministically() {
        struct Relay {
            event: Weak<GroupedEvent<u32>>,
            hits: Cell<u32>,
            siblings: RefCell<Vec<(Rc<SpareCounter>, GroupedListener<u32>)>>,
            toggle: Cell<bool>,
        }

        impl Relay {
            fn on_count(&self, count: &u32) {
                if *count == 0 {
                    return;
                }

                self.hits.set(self.hits.get().wrapping_add(1));

                let event = self.event.upgrade().expect("event is alive during dispatch");
                if self.toggle.replace(!self.toggle.get()) {
                    drop(self.siblings.borrow_mut().pop());
                } else {
                    let spare = Rc::new(SpareCounter {
                        hits: Cell::new(0),
                    });
                    let listener = event.listen(&spare, SpareCounter::on_count);
                    self.siblings.borrow_mut().push((spare, listener));
                }

                event.emit(&count.saturating_sub(1));
            }
        }

        struct SpareCounter {
            hits: Cell<u32>,
        }

        impl SpareCounter {
            fn on_count(&self, _count: &u32) {
                self.hits.set(self.hits.get().wrapping_add(1));
            }
        }

        let event = Rc::new(GroupedEvent::<u32>::new());
        let relay = Rc::new(Relay {
            event: Rc::downgrade(&event),
            hits: Cell::new(0),
            siblings: RefCell::new(Vec::new()),
            toggle: Cell::new(false),
        });

        let _listener = event.listen(&relay, Relay::on_count);

        event.emit(&7);

        assert_eq!(relay.hits.get(), 7);
    }

    #[test]
    fn dispatch_trait_drives_event() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let event = GroupedEvent::<()>::new();

        let probe = Probe::new(&log, "only");
        let _listener = event.listen(&probe, Probe::on_first);

        let source: &dyn Dispatch<()> = &event;
        source.emit(&());

        assert_eq!(log.borrow().len(), 1);
        assert_eq!(source.listener_count(), 1);
        assert!(source.has_listeners());
    }
}
