//! Prometheus metrics for guest lifecycle observability
//!
//! Registered in the default registry; exporting them is left to whoever
//! embeds the daemon.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────────

    /// Hypervisor launches, counting relaunches after a guest reboot.
    pub static ref GUEST_STARTS_TOTAL: IntCounter = register_int_counter!(
        "bhyvisor_guest_starts_total",
        "Hypervisor processes launched"
    ).expect("failed to register GUEST_STARTS_TOTAL metric");

    /// Completed teardowns, whether requested or after the guest powered off.
    pub static ref GUEST_STOPS_TOTAL: IntCounter = register_int_counter!(
        "bhyvisor_guest_stops_total",
        "Guests returned to STOPPED"
    ).expect("failed to register GUEST_STOPS_TOTAL metric");

    pub static ref GUESTS_RUNNING: IntGauge = register_int_gauge!(
        "bhyvisor_guests_running",
        "Guests currently RUNNING"
    ).expect("failed to register GUESTS_RUNNING metric");

    /// Time from a stop request until the guest is STOPPED.
    ///
    /// Buckets run up to the default two-phase max-wait of 2 x 120s.
    pub static ref STOP_DURATION: Histogram = register_histogram!(
        "bhyvisor_stop_duration_seconds",
        "Time taken to stop a guest",
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 240.0]
    ).expect("failed to register STOP_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Termination
    // ─────────────────────────────────────────────────────────────────────────────

    pub static ref FORCED_KILLS_TOTAL: IntCounter = register_int_counter!(
        "bhyvisor_forced_kills_total",
        "Processes that needed a forced kill"
    ).expect("failed to register FORCED_KILLS_TOTAL metric");

    pub static ref REFUSED_TERMINATIONS_TOTAL: IntCounter = register_int_counter!(
        "bhyvisor_refused_terminations_total",
        "Processes that survived the forced kill"
    ).expect("failed to register REFUSED_TERMINATIONS_TOTAL metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Consoles
    // ─────────────────────────────────────────────────────────────────────────────

    pub static ref CONSOLE_BYTES_TOTAL: IntCounter = register_int_counter!(
        "bhyvisor_console_bytes_total",
        "Bytes read from guest serial consoles"
    ).expect("failed to register CONSOLE_BYTES_TOTAL metric");

    /// Bytes dropped because a console subscriber fell behind.
    pub static ref CONSOLE_DROPPED_BYTES_TOTAL: IntCounter = register_int_counter!(
        "bhyvisor_console_dropped_bytes_total",
        "Console bytes dropped for a slow subscriber"
    ).expect("failed to register CONSOLE_DROPPED_BYTES_TOTAL metric");
}
