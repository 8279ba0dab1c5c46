use once_cell::sync::Lazy;
use prometheus::{register_int_counter, IntCounter};

pub static COMMANDS_DONE: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "marketlab_control_commands_done_total",
        "Total commands processed to DONE"
    )
    .expect("commands_done counter")
});

pub static COMMANDS_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "marketlab_control_commands_rejected_total",
        "Total commands rejected by policy or validation"
    )
    .expect("commands_rejected counter")
});

pub static COMMANDS_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "marketlab_control_commands_failed_total",
        "Total commands failed with unexpected handler errors"
    )
    .expect("commands_failed counter")
});

pub static BREAKER_TRIPS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "marketlab_control_breaker_trips_total",
        "Total circuit breaker trips"
    )
    .expect("breaker_trips counter")
});

pub static EVENTS_EMITTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "marketlab_control_events_emitted_total",
        "Total events appended to the durable event log"
    )
    .expect("events_emitted counter")
});
