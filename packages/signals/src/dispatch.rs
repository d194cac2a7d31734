//! The common dispatch surface shared by both event storage strategies.

/// Common surface implemented by both event flavors, allowing harnesses and
/// benchmarks to drive either storage strategy through one interface.
///
/// The two implementations trade space for time differently:
///
/// * [`Event`][crate::Event] stores callbacks in an append-order slot array
///   with amortized O(1) registration and removal.
/// * [`GroupedEvent`][crate::GroupedEvent] keeps callbacks sharing the same
///   handler function adjacent, at the cost of shifting records on insertion
///   and removal.
///
/// # Example
///
/// ```rust
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// use signals::{Dispatch, Event};
///
/// fn emit_twice<A>(source: &impl Dispatch<A>, args: &A) {
///     source.emit(args);
///     source.emit(args);
/// }
///
/// let event = Event::<u32>::new();
/// let total = Rc::new(Cell::new(0_u32));
///
/// let _listener = event.listen({
///     let total = Rc::clone(&total);
///     move |delta: &u32| total.set(total.get().wrapping_add(*delta))
/// });
///
/// emit_twice(&event, &21);
/// assert_eq!(total.get(), 42);
/// ```
pub trait Dispatch<A> {
    /// Synchronously calls every currently registered callback with `args`,
    /// in registry order.
    fn emit(&self, args: &A);

    /// The number of listeners currently attached.
    fn listener_count(&self) -> usize;

    /// Whether at least one listener is currently attached.
    fn has_listeners(&self) -> bool {
        self.listener_count() > 0
    }
}
