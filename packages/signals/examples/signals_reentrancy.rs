//! Example demonstrating reentrant event usage: callbacks that register,
//! disconnect and emit from inside a dispatch.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use signals::{Event, Listener};

fn main() {
    println!("=== Countdown Example ===");
    countdown_example();

    println!("\n=== Self-disconnect Example ===");
    self_disconnect_example();
}

/// A listener that re-emits with a decremented count until it reaches zero.
fn countdown_example() {
    let event = Rc::new(Event::<u32>::new());

    let relay: Weak<Event<u32>> = Rc::downgrade(&event);
    let _listener = event.listen(move |count: &u32| {
        println!("countdown: {count}");
        if *count > 0 {
            if let Some(event) = relay.upgrade() {
                event.emit(&(count - 1));
            }
        }
    });

    event.emit(&3);
}

/// A listener that disconnects itself after its first call.
fn self_disconnect_example() {
    let event = Event::<()>::new();
    let token: Rc<RefCell<Option<Listener<()>>>> = Rc::new(RefCell::new(None));
    let hits = Rc::new(Cell::new(0_u32));

    let own_token = Rc::clone(&token);
    let sink = Rc::clone(&hits);
    *token.borrow_mut() = Some(event.listen(move |_: &()| {
        sink.set(sink.get() + 1);
        drop(own_token.borrow_mut().take());
    }));

    event.emit(&());
    event.emit(&());

    println!("Callback ran {} time(s)", hits.get());
    println!("Listeners remaining: {}", event.listener_count());
}
