use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::BandwidthLimit;

/// Byte counters shared by the transport, the bandwidth manager's automatic
/// mode, adaptive chunk sizing, and progress reporting.
pub struct TransferStats {
    bytes_sent: AtomicI64,
    bytes_recv: AtomicI64,
    last_error: Mutex<Option<String>>,
    send_rate: Mutex<RateSample>,
}

#[derive(Default)]
struct RateSample {
    window_start: Option<Instant>,
    window_bytes: f64,
    measured_rate: f64,
}

impl Default for TransferStats {
    fn default() -> Self {
        TransferStats {
            bytes_sent: AtomicI64::new(0),
            bytes_recv: AtomicI64::new(0),
            last_error: Mutex::new(None),
            send_rate: Mutex::new(RateSample::default()),
        }
    }
}

impl TransferStats {
    pub fn on_send(&self, n: i64) {
        if n <= 0 {
            return;
        }
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
        if let Ok(mut rate) = self.send_rate.lock() {
            let now = Instant::now();
            let start = *rate.window_start.get_or_insert(now);
            rate.window_bytes += n as f64;
            let elapsed = now.duration_since(start);
            if elapsed >= AUTO_SAMPLE_WINDOW {
                rate.measured_rate = rate.window_bytes / elapsed.as_secs_f64();
                rate.window_start = Some(now);
                rate.window_bytes = 0.0;
            }
        }
    }

    /// Measured upload throughput over the last closed sample window;
    /// zero until the first window completes.
    pub fn send_rate_bytes_per_sec(&self) -> f64 {
        self.send_rate
            .lock()
            .map(|r| r.measured_rate)
            .unwrap_or(0.0)
    }

    pub fn on_recv(&self, n: i64) {
        if n <= 0 {
            return;
        }
        self.bytes_recv.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> i64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_recv(&self) -> i64 {
        self.bytes_recv.load(Ordering::Relaxed)
    }

    pub fn set_last_error(&self, err: impl ToString) {
        if let Ok(mut g) = self.last_error.lock() {
            *g = Some(err.to_string());
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|g| g.clone())
    }
}

const AUTO_SAMPLE_WINDOW: Duration = Duration::from_secs(5);
// Floor for the automatic mode so a stalled sample can't wedge transfers.
const AUTO_MIN_RATE: f64 = 8.0 * 1024.0;
// Cap each wait so cancellation checks stay prompt.
const MAX_PACE_WAIT: Duration = Duration::from_millis(250);

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    // Automatic mode bookkeeping: bytes seen in the current sample window.
    window_start: Instant,
    window_bytes: f64,
    measured_rate: f64,
}

/// Token bucket for one transfer direction. `acquire` suspends until the
/// requested bytes fit; waits are sliced so cancellation is observed within
/// a second.
pub struct Limiter {
    limit: Mutex<BandwidthLimit>,
    state: Mutex<BucketState>,
}

impl Limiter {
    pub fn new(limit: BandwidthLimit) -> Self {
        let now = Instant::now();
        Limiter {
            limit: Mutex::new(limit),
            state: Mutex::new(BucketState {
                tokens: 0.0,
                last_refill: now,
                window_start: now,
                window_bytes: 0.0,
                measured_rate: 0.0,
            }),
        }
    }

    pub fn set_limit(&self, limit: BandwidthLimit) {
        if let Ok(mut g) = self.limit.lock() {
            *g = limit;
        }
    }

    fn rate_bytes_per_sec(&self, state: &BucketState) -> Option<f64> {
        let limit = self.limit.lock().ok().map(|g| *g)?;
        match limit {
            BandwidthLimit::Unlimited => None,
            BandwidthLimit::Absolute(kib) => Some((kib as f64) * 1024.0),
            BandwidthLimit::Relative(fraction) => {
                if state.measured_rate <= 0.0 {
                    // No sample yet; let the first window run free.
                    None
                } else {
                    Some((state.measured_rate * fraction.clamp(0.0, 1.0)).max(AUTO_MIN_RATE))
                }
            }
        }
    }

    /// Take `n` bytes worth of tokens, waiting as needed.
    pub async fn acquire(&self, n: usize) {
        loop {
            let wait = {
                let mut state = match self.state.lock() {
                    Ok(g) => g,
                    Err(_) => return,
                };
                let now = Instant::now();

                // Throughput sample for the automatic mode.
                state.window_bytes += n as f64;
                let elapsed = now.duration_since(state.window_start);
                if elapsed >= AUTO_SAMPLE_WINDOW {
                    state.measured_rate = state.window_bytes / elapsed.as_secs_f64();
                    state.window_start = now;
                    state.window_bytes = 0.0;
                }

                let Some(rate) = self.rate_bytes_per_sec(&state) else {
                    return;
                };

                let refill = now.duration_since(state.last_refill).as_secs_f64() * rate;
                state.tokens = (state.tokens + refill).min(rate);
                state.last_refill = now;

                if state.tokens >= n as f64 {
                    state.tokens -= n as f64;
                    None
                } else {
                    let deficit = n as f64 - state.tokens;
                    Some(Duration::from_secs_f64(deficit / rate).min(MAX_PACE_WAIT))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

/// Up/down limiter pair for one sync root.
pub struct BandwidthManager {
    pub upload: Limiter,
    pub download: Limiter,
}

impl BandwidthManager {
    pub fn new(upload: BandwidthLimit, download: BandwidthLimit) -> Self {
        BandwidthManager {
            upload: Limiter::new(upload),
            download: Limiter::new(download),
        }
    }
}
