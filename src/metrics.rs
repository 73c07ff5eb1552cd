//! Library metrics.
//!
//! Process-wide counters for connection lifecycle, outbound bytes, and
//! pool pressure. Exposed through the metriken registry for Prometheus
//! exposition by the embedding application.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "sockline/connections/opened",
    description = "Registry entries installed as open"
)]
pub static CONNECTIONS_OPENED: Counter = Counter::new();

#[metric(
    name = "sockline/connections/closed",
    description = "Open registry entries cleared"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "sockline/connections/active",
    description = "Currently open connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "sockline/bytes/sent", description = "Total bytes flushed out")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "sockline/pool/spilled",
    description = "Packet payloads allocated past the pool bound"
)]
pub static PACKETS_SPILLED: Counter = Counter::new();

#[metric(
    name = "sockline/flush/fatal_errors",
    description = "Flushes that ended in a forced close"
)]
pub static FLUSH_FATAL: Counter = Counter::new();
