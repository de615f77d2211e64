//! Process-wide replay counters.
//!
//! The five well-known counters sit on dedicated atomics so the packet and
//! query paths never take a lock; everything else lives in an open namespace
//! behind a reader/writer lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;

use parking_lot::RwLock;

pub const PACKETS: &str = "packets";
pub const QUERIES: &str = "queries";
pub const STREAMS: &str = "streams";
pub const CONNECTIONS: &str = "connections";
pub const FAILED_QUERIES: &str = "err.queries";

static N_PACKETS: AtomicI64 = AtomicI64::new(0);
static N_QUERIES: AtomicI64 = AtomicI64::new(0);
static N_STREAMS: AtomicI64 = AtomicI64::new(0);
static N_CONNS: AtomicI64 = AtomicI64::new(0);
static N_ERR_QUERIES: AtomicI64 = AtomicI64::new(0);

static OTHERS: OnceLock<RwLock<HashMap<String, i64>>> = OnceLock::new();

fn others() -> &'static RwLock<HashMap<String, i64>> {
    OTHERS.get_or_init(|| RwLock::new(HashMap::new()))
}

fn well_known(name: &str) -> Option<&'static AtomicI64> {
    match name {
        PACKETS => Some(&N_PACKETS),
        QUERIES => Some(&N_QUERIES),
        STREAMS => Some(&N_STREAMS),
        CONNECTIONS => Some(&N_CONNS),
        FAILED_QUERIES => Some(&N_ERR_QUERIES),
        _ => None,
    }
}

/// Add `delta` to the counter `name`, returning the new total.
pub fn add(name: &str, delta: i64) -> i64 {
    if let Some(counter) = well_known(name) {
        return counter.fetch_add(delta, Ordering::SeqCst) + delta;
    }
    let mut map = others().write();
    let total = map.entry(name.to_string()).or_insert(0);
    *total += delta;
    *total
}

/// Current total for `name`; zero for names never touched.
pub fn get(name: &str) -> i64 {
    if let Some(counter) = well_known(name) {
        return counter.load(Ordering::SeqCst);
    }
    others().read().get(name).copied().unwrap_or(0)
}

/// A fresh map with every open-namespace entry plus the well-known totals.
pub fn snapshot() -> HashMap<String, i64> {
    let map = others().read();
    let mut out = HashMap::with_capacity(map.len() + 5);
    for (name, total) in map.iter() {
        out.insert(name.clone(), *total);
    }
    out.insert(PACKETS.to_string(), N_PACKETS.load(Ordering::SeqCst));
    out.insert(QUERIES.to_string(), N_QUERIES.load(Ordering::SeqCst));
    out.insert(STREAMS.to_string(), N_STREAMS.load(Ordering::SeqCst));
    out.insert(CONNECTIONS.to_string(), N_CONNS.load(Ordering::SeqCst));
    out.insert(FAILED_QUERIES.to_string(), N_ERR_QUERIES.load(Ordering::SeqCst));
    out
}
