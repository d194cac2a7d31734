//! Example demonstrating `GroupedEvent`: receiver-plus-handler registration
//! and adjacent dispatch of same-handler callbacks.

use std::cell::Cell;
use std::rc::Rc;

use signals::GroupedEvent;

fn main() {
    println!("=== Grouped Dispatch Example ===");
    grouped_dispatch_example();

    println!("\n=== Weak Receiver Example ===");
    weak_receiver_example();
}

struct Logger {
    name: &'static str,
}

impl Logger {
    fn on_message(&self, message: &String) {
        println!("[log:{}] {message}", self.name);
    }
}

struct Counter {
    name: &'static str,
    count: Cell<u32>,
}

impl Counter {
    fn on_message(&self, _: &String) {
        self.count.set(self.count.get() + 1);
        println!("[count:{}] total {}", self.name, self.count.get());
    }
}

/// Registers loggers and counters interleaved; dispatch still visits each
/// handler's registrations as one unbroken run.
fn grouped_dispatch_example() {
    let event = GroupedEvent::<String>::new();

    let log_a = Rc::new(Logger { name: "a" });
    let count_a = Rc::new(Counter {
        name: "a",
        count: Cell::new(0),
    });
    let log_b = Rc::new(Logger { name: "b" });
    let count_b = Rc::new(Counter {
        name: "b",
        count: Cell::new(0),
    });

    // Interleaved registration order, grouped dispatch order.
    let _l1 = event.listen(&log_a, Logger::on_message);
    let _l2 = event.listen(&count_a, Counter::on_message);
    let _l3 = event.listen(&log_b, Logger::on_message);
    let _l4 = event.listen(&count_b, Counter::on_message);

    event.emit(&"first message".to_string());
}

/// Demonstrates that the event does not keep receivers alive.
fn weak_receiver_example() {
    let event = GroupedEvent::<String>::new();

    let keeper = Rc::new(Logger { name: "keeper" });
    let transient = Rc::new(Logger { name: "transient" });

    let _lk = event.listen(&keeper, Logger::on_message);
    let _lt = event.listen(&transient, Logger::on_message);

    event.emit(&"both receivers alive".to_string());

    drop(transient);
    event.emit(&"transient receiver dropped".to_string());

    println!("Registrations still attached: {}", event.listener_count());
}
