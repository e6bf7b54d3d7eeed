//! Injected tick and time capabilities
//!
//! The scheduler core consumes exactly two capabilities from its host: a
//! stream of phase ticks and a monotonic clock. Both are behind the [`Clock`]
//! trait so tests can drive the dispatch loop with a manually-advanced
//! [`VirtualClock`] while production hosts plug in an [`IntervalClock`] or
//! their own frame provider.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};

/// One tick of the host's phase cycle.
pub struct Tick {
    /// Elapsed time since the previous tick of the same source.
    pub elapsed: Duration,
    /// Optional completion ack: the dispatch loop signals here once the tick
    /// has been fully processed, letting the sender synchronize with it.
    pub done: Option<Sender<()>>,
}

/// Tick and time source injected into a scheduler.
pub trait Clock: Send + Sync + 'static {
    /// The tick stream. Each received [`Tick`] drives one phase of the
    /// dispatch loop; the stream closing stops the loop.
    fn ticks(&self) -> Receiver<Tick>;

    /// Current monotonic time, used for wake-time computation and heartbeat
    /// comparisons.
    fn now(&self) -> Instant;
}

/// Manually-driven clock for tests.
///
/// Time only moves when [`advance`] is called and ticks only fire when
/// [`tick`] is called. `tick` blocks until the dispatch loop has fully
/// processed the tick, so assertions made afterwards observe a quiescent
/// scheduler.
///
/// [`advance`]: VirtualClock::advance
/// [`tick`]: VirtualClock::tick
pub struct VirtualClock {
    origin: Instant,
    offset_nanos: AtomicU64,
    last_tick_nanos: AtomicU64,
    tx: Sender<Tick>,
    rx: Receiver<Tick>,
}

impl VirtualClock {
    /// Create a virtual clock anchored at the current instant.
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            origin: Instant::now(),
            offset_nanos: AtomicU64::new(0),
            last_tick_nanos: AtomicU64::new(0),
            tx,
            rx,
        }
    }

    /// Advance virtual time by `seconds` without emitting a tick.
    pub fn advance(&self, seconds: f64) {
        assert!(
            seconds.is_finite() && seconds >= 0.0,
            "virtual time only moves forward"
        );
        let nanos = Duration::from_secs_f64(seconds).as_nanos() as u64;
        self.offset_nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Emit one tick and block until the scheduler has processed it.
    pub fn tick(&self) {
        let now = self.offset_nanos.load(Ordering::SeqCst);
        let last = self.last_tick_nanos.swap(now, Ordering::SeqCst);
        let (done_tx, done_rx) = bounded(1);
        let tick = Tick {
            elapsed: Duration::from_nanos(now.saturating_sub(last)),
            done: Some(done_tx),
        };
        if self.tx.send(tick).is_ok() {
            let _ = done_rx.recv();
        }
    }

    /// Emit `count` consecutive ticks (one full phase cycle, typically).
    pub fn cycle(&self, count: usize) {
        for _ in 0..count {
            self.tick();
        }
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn ticks(&self) -> Receiver<Tick> {
        self.rx.clone()
    }

    fn now(&self) -> Instant {
        self.origin + Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }
}

/// Fixed-period production tick source backed by `crossbeam::channel::tick`.
///
/// A bridge thread converts the period ticker into [`Tick`] events; it exits
/// once every receiver has been dropped.
pub struct IntervalClock {
    rx: Receiver<Tick>,
}

impl IntervalClock {
    /// Create a tick source firing every `period`.
    pub fn new(period: Duration) -> Self {
        let ticker = crossbeam::channel::tick(period);
        let (tx, rx) = bounded(1);

        thread::Builder::new()
            .name("corun-clock".to_string())
            .spawn(move || {
                let mut last = Instant::now();
                for at in ticker.iter() {
                    let tick = Tick {
                        elapsed: at.saturating_duration_since(last),
                        done: None,
                    };
                    last = at;
                    if tx.send(tick).is_err() {
                        break;
                    }
                }
            })
            .expect("Failed to spawn clock thread");

        Self { rx }
    }
}

impl Clock for IntervalClock {
    fn ticks(&self) -> Receiver<Tick> {
        self.rx.clone()
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Shared clock handle.
pub type ClockRef = Arc<dyn Clock>;
