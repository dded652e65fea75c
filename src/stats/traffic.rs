// Session byte accounting: cumulative counters and per-download transfer deltas.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use super::push_tuple;
use crate::config::{local_events, DOWNLOAD_TOKEN_RANGE, TUPLE_DELIM};
use crate::platform::traits::{TrafficSource, TxRx};

/// `max(0, now - start)`: counter resets and wraparound never report negative traffic.
pub fn clamp_delta(start: i64, now: i64) -> u64 {
    now.saturating_sub(start).max(0) as u64
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionBytes {
    pub total: TxRx,
    pub mobile: TxRx,
    pub app: TxRx,
}

struct CounterState {
    bytes: SessionBytes,
    /// Set once `end_session` replaced the baseline with deltas.
    ended: bool,
}

#[derive(Debug, Clone, Copy)]
struct DownloadState {
    tx_at_start: i64,
    rx_at_start: i64,
    started: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferDelta {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub elapsed_secs: u64,
    pub duration_ms: u64,
}

#[derive(Default)]
struct DownloadBook {
    in_flight: HashMap<u64, DownloadState>,
    completed: Vec<TransferDelta>,
}

pub struct NetworkTrafficStats {
    source: Arc<dyn TrafficSource>,
    app_uid: u32,
    started: Instant,
    uid_stats_available: bool,
    counters: Mutex<CounterState>,
    downloads: Mutex<DownloadBook>,
}

impl NetworkTrafficStats {
    /// Snapshot the current counters as the session baseline.
    pub fn new(source: Arc<dyn TrafficSource>, app_uid: u32) -> Self {
        let total = read_or_zero("total", source.totals());
        let mobile = read_or_zero("mobile", source.mobile());
        let (app, uid_stats_available) = match source.app(app_uid) {
            Ok(app) if app.tx > 0 && app.rx > 0 => (app, true),
            _ => {
                debug!("app-scoped counters unavailable for uid {}, using totals", app_uid);
                (total, false)
            }
        };

        Self {
            source,
            app_uid,
            started: Instant::now(),
            uid_stats_available,
            counters: Mutex::new(CounterState {
                bytes: SessionBytes { total, mobile, app },
                ended: false,
            }),
            downloads: Mutex::new(DownloadBook::default()),
        }
    }

    /// Value events describing the baseline, logged once at session start.
    pub fn start_events(&self) -> Vec<(i32, f64)> {
        let bytes = self.counters.lock().bytes;
        vec![
            (local_events::START_TX_TOTAL_BYTES, bytes.total.tx as f64),
            (local_events::START_TX_APP_BYTES, bytes.app.tx as f64),
            (local_events::START_TX_MOBILE_BYTES, bytes.mobile.tx as f64),
            (local_events::START_RX_TOTAL_BYTES, bytes.total.rx as f64),
            (local_events::START_RX_APP_BYTES, bytes.app.rx as f64),
            (local_events::START_RX_MOBILE_BYTES, bytes.mobile.rx as f64),
            (local_events::UPTIME, self.source.uptime_secs()),
            (local_events::ELAPSED_REALTIME, self.source.elapsed_realtime_secs()),
        ]
    }

    pub fn uid_stats_available(&self) -> bool {
        self.uid_stats_available
    }

    fn read_app(&self) -> TxRx {
        if self.uid_stats_available {
            read_or_zero("app", self.source.app(self.app_uid))
        } else {
            read_or_zero("total", self.source.totals())
        }
    }

    /// Replace every baseline with the clamped delta to the current reading. Later calls no-op.
    pub fn end_session(&self) {
        let total = read_or_zero("total", self.source.totals());
        let mobile = read_or_zero("mobile", self.source.mobile());
        let app = self.read_app();

        let mut state = self.counters.lock();
        if state.ended {
            return;
        }
        let base = state.bytes;
        let delta = |start: TxRx, now: TxRx| TxRx {
            tx: clamp_delta(start.tx, now.tx) as i64,
            rx: clamp_delta(start.rx, now.rx) as i64,
        };
        state.bytes = SessionBytes {
            total: delta(base.total, total),
            mobile: delta(base.mobile, mobile),
            app: delta(base.app, app),
        };
        state.ended = true;
    }

    pub fn session_bytes(&self) -> SessionBytes {
        self.counters.lock().bytes
    }

    /// `totalTx@totalRx@mobileTx@mobileRx@appTx@appRx`.
    pub fn network_stats_string(&self) -> String {
        let b = self.session_bytes();
        [b.total.tx, b.total.rx, b.mobile.tx, b.mobile.rx, b.app.tx, b.app.rx]
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(&TUPLE_DELIM.to_string())
    }

    /// Record the app-scoped counters under a fresh token.
    pub fn download_started(&self) -> u64 {
        let token = rand::thread_rng().gen_range(0..DOWNLOAD_TOKEN_RANGE);
        let now = self.read_app();
        let state = DownloadState {
            tx_at_start: now.tx,
            rx_at_start: now.rx,
            started: Instant::now(),
        };

        let previous = self.downloads.lock().in_flight.insert(token, state);
        if previous.is_some() {
            // Tokens come from a small range; two concurrent downloads can share one.
            warn!("download token {} collided with an in-flight download", token);
        }
        info!("download started token={}", token);
        token
    }

    /// Close the download opened under `token`. Unknown or already-closed tokens are ignored.
    pub fn download_ended(&self, token: u64) {
        let now = self.read_app();
        let mut book = self.downloads.lock();
        let Some(state) = book.in_flight.remove(&token) else {
            debug!("no download in flight for token {}", token);
            return;
        };

        let tx_bytes = clamp_delta(state.tx_at_start, now.tx);
        let rx_bytes = clamp_delta(state.rx_at_start, now.rx);
        if tx_bytes > 0 || rx_bytes > 0 {
            book.completed.push(TransferDelta {
                tx_bytes,
                rx_bytes,
                elapsed_secs: self.started.elapsed().as_secs(),
                duration_ms: state.started.elapsed().as_millis() as u64,
            });
        }
        info!("download ended token={} tx={} rx={}", token, tx_bytes, rx_bytes);
    }

    pub fn in_flight_downloads(&self) -> usize {
        self.downloads.lock().in_flight.len()
    }

    /// Format every `tx#rx#elapsed#durationMs@` record and clear the transfer log.
    pub fn drain_to_string(&self) -> String {
        let drained = std::mem::take(&mut self.downloads.lock().completed);
        let mut out = String::new();
        for d in drained {
            push_tuple(
                &mut out,
                &[&d.tx_bytes, &d.rx_bytes, &d.elapsed_secs, &d.duration_ms],
            );
        }
        out
    }
}

fn read_or_zero(which: &str, reading: anyhow::Result<TxRx>) -> TxRx {
    reading.unwrap_or_else(|e| {
        warn!("reading {} byte counters failed: {}", which, e);
        TxRx::default()
    })
}
