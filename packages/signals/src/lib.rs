//! Synchronous publish-subscribe primitives for single-threaded use.
//!
//! This crate provides in-process events: a publisher calls
//! [`emit()`][Event::emit] and every registered callback runs synchronously,
//! on the same thread, before the call returns. There are no queues, no
//! channels and no deferred delivery; an emission is semantically a loop of
//! direct function calls.
//!
//! Two event types are available, differing in how they store callbacks:
//! - [`Event<A>`] accepts arbitrary closures and stores them in a compact
//!   slot array, visiting callbacks in registration order.
//! - [`GroupedEvent<A>`] accepts receiver-plus-handler pairs and keeps
//!   callbacks sharing the same handler function adjacent, so each handler's
//!   registrations are dispatched as an unbroken run.
//!
//! Both types hand out a listener token ([`Listener`] / [`GroupedListener`])
//! per registration. Dropping the token disconnects the callback; dropping
//! the event leaves surviving tokens inert. Neither direction requires any
//! coordination from the caller.
//!
//! Callbacks may freely re-enter their own event: registering, removing and
//! emitting from inside a callback are all defined operations.
//!
//! # Example
//!
//! ```rust
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! use signals::Event;
//!
//! let event = Event::<u32>::new();
//! let total = Rc::new(Cell::new(0_u32));
//!
//! let sink = Rc::clone(&total);
//! let _listener = event.listen(move |delta: &u32| {
//!     sink.set(sink.get().wrapping_add(*delta));
//! });
//!
//! event.emit(&3);
//! event.emit(&4);
//! assert_eq!(total.get(), 7);
//! ```
//!
//! # Grouped Example
//!
//! ```rust
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! use signals::GroupedEvent;
//!
//! struct Meter {
//!     total: Cell<u32>,
//! }
//!
//! impl Meter {
//!     fn on_delta(&self, delta: &u32) {
//!         self.total.set(self.total.get().wrapping_add(*delta));
//!     }
//! }
//!
//! let event = GroupedEvent::<u32>::new();
//! let meter = Rc::new(Meter { total: Cell::new(0) });
//!
//! let _listener = event.listen(&meter, Meter::on_delta);
//!
//! event.emit(&5);
//! assert_eq!(meter.total.get(), 5);
//! ```

mod dispatch;
pub mod grouped;
pub mod indexed;

pub use dispatch::Dispatch;
pub use grouped::{GroupedEvent, GroupedListener};
pub use indexed::{Event, Listener};

#[cfg(all(test, not(miri)))]
#[global_allocator]
static ALLOCATOR: alloc_tracker::Allocator<std::alloc::System> =
    alloc_tracker::Allocator::system();
