//! Example demonstrating basic `Event` usage: registration, synchronous
//! dispatch and listener lifetime.

use std::cell::Cell;
use std::f64::consts::PI;
use std::rc::Rc;

use signals::Event;

fn main() {
    println!("=== Basic Emit Example ===");
    basic_emit_example();

    println!("\n=== Listener Lifetime Example ===");
    listener_lifetime_example();

    println!("\n=== Multiple Listeners Example ===");
    multiple_listeners_example();
}

/// Demonstrates that emission is a synchronous call into the callback.
fn basic_emit_example() {
    let event = Event::<f64>::new();
    let total = Rc::new(Cell::new(0.0));

    let sink = Rc::clone(&total);
    let _listener = event.listen(move |value: &f64| {
        sink.set(sink.get() + value);
    });

    event.emit(&PI);
    println!("Total after first emit: {:.5}", total.get());

    event.emit(&PI);
    println!("Total after second emit: {:.5}", total.get());
}

/// Demonstrates that dropping the listener token disconnects the callback.
fn listener_lifetime_example() {
    let event = Event::<u32>::new();
    let hits = Rc::new(Cell::new(0_u32));

    {
        let sink = Rc::clone(&hits);
        let _listener = event.listen(move |_: &u32| {
            sink.set(sink.get() + 1);
        });

        event.emit(&1);
        println!("Hits inside the scope: {}", hits.get());
    }

    // The listener went out of scope; this emission reaches nobody.
    event.emit(&2);
    println!("Hits after the scope: {}", hits.get());
    println!("Listeners remaining: {}", event.listener_count());
}

/// Demonstrates dispatch to several listeners in registration order.
fn multiple_listeners_example() {
    let event = Event::<&str>::new();

    let _first = event.listen(|name: &&str| println!("first listener saw {name}"));
    let _second = event.listen(|name: &&str| println!("second listener saw {name}"));
    let _third = event.listen(|name: &&str| println!("third listener saw {name}"));

    event.emit(&"hello");
}
