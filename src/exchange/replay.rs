//! Replay controller: deterministic, speed-controllable, multi-source,
//! time-ordered playback that drives the virtual clock and fans out
//! payloads to registered callbacks.
//!
//! The merge discipline — one cursor per source, pick the globally smallest
//! `(timestamp, registration order)` pair each step — is grounded on the
//! teacher's `backtest_v2::queue::StreamMerger`/`EventQueue`, generalized
//! from the teacher's fixed `Event` payload to a generic `Payload` type so
//! this controller can drive market data of any shape, and from a pure
//! `BinaryHeap` merge to an explicit per-source cursor model that also
//! supports the `STEPPED`/`REALTIME`/`ACCELERATED` wall-clock-paced modes
//! spec'd here (the teacher's queue is deliberately BACKTEST-only).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{error, warn};

use super::time::TimeManager;

/// A lazily-producible, source-monotonic sequence of `(timestamp_ms, payload)`.
pub trait DataSource<P>: Send {
    /// Produce the next item, or `None` once the source is exhausted.
    fn next_item(&mut self) -> Option<(i64, P)>;
}

/// An in-memory source backed by a `Vec`, used by tests and by synchronous
/// callers that already hold their data.
pub struct VecSource<P> {
    items: std::vec::IntoIter<(i64, P)>,
}

impl<P> VecSource<P> {
    pub fn new(items: Vec<(i64, P)>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

impl<P: Send> DataSource<P> for VecSource<P> {
    fn next_item(&mut self) -> Option<(i64, P)> {
        self.items.next()
    }
}

/// Reads OHLCV rows from a CSV file and emits one trade-print-shaped payload
/// per row at the row's close timestamp, all tagged with the symbol the
/// source was opened for. Columns expected (header required):
/// `close_time_ms,open,high,low,close,volume`.
pub struct CsvKlineSource {
    reader: csv::Reader<std::fs::File>,
    symbol: String,
}

/// A single OHLCV bar emitted by `CsvKlineSource`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct KlinePayload {
    #[serde(skip, default)]
    pub symbol: String,
    pub close_time_ms: i64,
    pub open: rust_decimal::Decimal,
    pub high: rust_decimal::Decimal,
    pub low: rust_decimal::Decimal,
    pub close: rust_decimal::Decimal,
    pub volume: rust_decimal::Decimal,
}

impl CsvKlineSource {
    pub fn open(path: &std::path::Path, symbol: impl Into<String>) -> std::io::Result<Self> {
        let reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
        Ok(Self { reader, symbol: symbol.into() })
    }
}

impl DataSource<KlinePayload> for CsvKlineSource {
    fn next_item(&mut self) -> Option<(i64, KlinePayload)> {
        let mut record = csv::StringRecord::new();
        loop {
            match self.reader.read_record(&mut record) {
                Ok(true) => {
                    match record.deserialize::<KlinePayload>(None) {
                        Ok(mut kline) => {
                            kline.symbol = self.symbol.clone();
                            return Some((kline.close_time_ms, kline));
                        }
                        Err(err) => {
                            warn!(?err, "skipping malformed CSV row");
                            continue;
                        }
                    }
                }
                Ok(false) => return None,
                Err(err) => {
                    error!(?err, "CSV source read error, marking exhausted");
                    return None;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    Backtest,
    Stepped,
    Realtime,
    Accelerated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
}

#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub emitted: u64,
    pub total_estimate: Option<u64>,
    pub elapsed: Duration,
    pub last_ts: Option<i64>,
}

pub type SourceId = u64;
pub type CallbackId = u64;

struct Cursor<P> {
    id: SourceId,
    registration_order: u64,
    source: Box<dyn DataSource<P>>,
    peeked: Option<(i64, P)>,
}

impl<P> Cursor<P> {
    fn peek(&mut self) -> Option<&(i64, P)> {
        if self.peeked.is_none() {
            self.peeked = self.source.next_item();
        }
        self.peeked.as_ref()
    }

    fn take(&mut self) -> Option<(i64, P)> {
        self.peek();
        self.peeked.take()
    }
}

struct ControlState {
    status: RunStatus,
}

/// Drives one or more `DataSource<P>` streams in deterministic merged
/// timestamp order against a shared `TimeManager`.
pub struct ReplayController<P: Send + Sync + 'static> {
    clock: Arc<TimeManager>,
    cursors: Mutex<Vec<Cursor<P>>>,
    next_source_id: AtomicU64,
    next_registration_order: AtomicU64,
    callbacks: Mutex<HashMap<CallbackId, Box<dyn Fn(SourceId, &P) + Send + Sync>>>,
    next_callback_id: AtomicU64,
    control: Arc<(Mutex<ControlState>, Condvar)>,
    mode: Mutex<ReplayMode>,
    speed_factor: Mutex<f64>,
    emitted: AtomicU64,
    last_ts: Mutex<Option<i64>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopping: Arc<AtomicBool>,
    batch_callbacks: AtomicBool,
    memory_optimized: AtomicBool,
    /// Wall-clock start of the current run, for `progress().elapsed`. Never
    /// fed into matching/clock logic — purely a monitoring figure, since the
    /// system of record for simulated time is `TimeManager`, not this.
    start_instant: Mutex<Option<Instant>>,
}

impl<P: Send + Sync + 'static> ReplayController<P> {
    pub fn new(clock: Arc<TimeManager>) -> Self {
        Self {
            clock,
            cursors: Mutex::new(Vec::new()),
            next_source_id: AtomicU64::new(1),
            next_registration_order: AtomicU64::new(0),
            callbacks: Mutex::new(HashMap::new()),
            next_callback_id: AtomicU64::new(1),
            control: Arc::new((
                Mutex::new(ControlState {
                    status: RunStatus::Idle,
                }),
                Condvar::new(),
            )),
            mode: Mutex::new(ReplayMode::Backtest),
            speed_factor: Mutex::new(1.0),
            emitted: AtomicU64::new(0),
            last_ts: Mutex::new(None),
            worker: Mutex::new(None),
            stopping: Arc::new(AtomicBool::new(false)),
            batch_callbacks: AtomicBool::new(false),
            memory_optimized: AtomicBool::new(false),
            start_instant: Mutex::new(None),
        }
    }

    fn mark_started(&self) {
        let mut guard = self.start_instant.lock().unwrap();
        if guard.is_none() {
            *guard = Some(Instant::now());
        }
    }

    pub fn set_mode(&self, mode: ReplayMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn set_speed_factor(&self, factor: f64) {
        assert!(factor > 0.0, "speed_factor must be positive");
        *self.speed_factor.lock().unwrap() = factor;
    }

    /// When enabled, each dispatch fans its registered callbacks out across
    /// scoped worker threads instead of running them one after another on
    /// the emitter thread — useful once more than a handful of subscribers
    /// (market rollup, WS bridge, strategy hooks, ...) are on the same feed.
    pub fn set_batch_callbacks(&self, enabled: bool) {
        self.batch_callbacks.store(enabled, Ordering::SeqCst);
    }

    /// When enabled, `process_all_sync` does not retain the full merged
    /// `(source, timestamp, payload)` trace in memory — only dispatched
    /// callbacks observe each item. Disabled by default so tests/tools get
    /// the whole run's output back; enable it for long replay runs where
    /// holding every payload in memory would be wasteful.
    pub fn set_memory_optimized(&self, enabled: bool) {
        self.memory_optimized.store(enabled, Ordering::SeqCst);
    }

    pub fn add_source(&self, source: Box<dyn DataSource<P>>) -> SourceId {
        let id = self.next_source_id.fetch_add(1, Ordering::SeqCst);
        let order = self.next_registration_order.fetch_add(1, Ordering::SeqCst);
        self.cursors.lock().unwrap().push(Cursor {
            id,
            registration_order: order,
            source,
            peeked: None,
        });
        id
    }

    pub fn remove_source(&self, id: SourceId) {
        self.cursors.lock().unwrap().retain(|c| c.id != id);
    }

    pub fn register_callback(&self, cb: impl Fn(SourceId, &P) + Send + Sync + 'static) -> CallbackId {
        let id = self.next_callback_id.fetch_add(1, Ordering::SeqCst);
        self.callbacks.lock().unwrap().insert(id, Box::new(cb));
        id
    }

    pub fn unregister_callback(&self, id: CallbackId) {
        self.callbacks.lock().unwrap().remove(&id);
    }

    fn dispatch(&self, source_id: SourceId, payload: &P) {
        let callbacks = self.callbacks.lock().unwrap();
        if self.batch_callbacks.load(Ordering::SeqCst) && callbacks.len() > 1 {
            std::thread::scope(|scope| {
                for cb in callbacks.values() {
                    scope.spawn(|| cb(source_id, payload));
                }
            });
        } else {
            for cb in callbacks.values() {
                cb(source_id, payload);
            }
        }
    }

    /// Pick the cursor whose next item has the smallest `(timestamp,
    /// registration_order)` key, advance it, set the virtual clock, and
    /// return the item. `None` once every source is exhausted.
    fn advance_once(&self) -> Option<(SourceId, i64, P)> {
        let mut cursors = self.cursors.lock().unwrap();
        let mut best_idx = None;
        let mut best_key: Option<(i64, u64)> = None;
        for (idx, cursor) in cursors.iter_mut().enumerate() {
            if let Some((ts, _)) = cursor.peek() {
                let key = (*ts, cursor.registration_order);
                if best_key.map(|b| key < b).unwrap_or(true) {
                    best_key = Some(key);
                    best_idx = Some(idx);
                }
            }
        }
        let idx = best_idx?;
        let (ts, payload) = cursors[idx].take()?;
        let source_id = cursors[idx].id;
        drop(cursors);

        if let Err(err) = self.clock.set_backtest_time(ts) {
            error!(?err, "replay produced a backward timestamp, clamping");
        }
        self.emitted.fetch_add(1, Ordering::SeqCst);
        *self.last_ts.lock().unwrap() = Some(ts);
        Some((source_id, ts, payload))
    }

    /// Synchronous single-step API, valid in `STEPPED` mode and for direct
    /// synchronous callers; must not be interleaved with an active
    /// background run.
    pub fn step(&self) -> Option<()> {
        self.mark_started();
        let (source_id, _ts, payload) = self.advance_once()?;
        self.dispatch(source_id, &payload);
        Some(())
    }

    /// Drain every source synchronously in merged order, invoking callbacks
    /// inline. Intended for tests and offline batch processing.
    pub fn process_all_sync(&self) -> Vec<(SourceId, i64, P)>
    where
        P: Clone,
    {
        self.mark_started();
        let keep_trace = !self.memory_optimized.load(Ordering::SeqCst);
        let mut out = Vec::new();
        while let Some((source_id, ts, payload)) = self.advance_once() {
            self.dispatch(source_id, &payload);
            if keep_trace {
                out.push((source_id, ts, payload));
            }
        }
        {
            let (lock, _) = &*self.control;
            lock.lock().unwrap().status = RunStatus::Completed;
        }
        out
    }

    pub fn progress(&self) -> Progress {
        let elapsed = self.start_instant.lock().unwrap().map(|t| t.elapsed()).unwrap_or_default();
        Progress {
            emitted: self.emitted.load(Ordering::SeqCst),
            total_estimate: None,
            elapsed,
            last_ts: *self.last_ts.lock().unwrap(),
        }
    }

    pub fn status(&self) -> RunStatus {
        let (lock, _) = &*self.control;
        lock.lock().unwrap().status
    }

    /// Start the background emitter thread for `BACKTEST`/`REALTIME`/
    /// `ACCELERATED` modes. A no-op if already running.
    pub fn start(self: &Arc<Self>)
    where
        P: Send + 'static,
    {
        {
            let (lock, _) = &*self.control;
            let mut state = lock.lock().unwrap();
            if state.status == RunStatus::Running {
                return;
            }
            state.status = RunStatus::Running;
        }
        self.mark_started();
        self.stopping.store(false, Ordering::SeqCst);

        let this = Arc::clone(self);
        let handle = std::thread::spawn(move || this.run_loop());
        *self.worker.lock().unwrap() = Some(handle);
    }

    fn run_loop(self: Arc<Self>)
    where
        P: Send + 'static,
    {
        const WAIT_TICK: Duration = Duration::from_millis(200);
        let mut prev_ts: Option<i64> = None;
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }

            {
                let (lock, cvar) = &*self.control;
                let mut state = lock.lock().unwrap();
                while state.status == RunStatus::Paused {
                    let (guard, _) = cvar.wait_timeout(state, WAIT_TICK).unwrap();
                    state = guard;
                    if self.stopping.load(Ordering::SeqCst) {
                        return;
                    }
                }
                if state.status == RunStatus::Stopped {
                    return;
                }
            }

            let mode = *self.mode.lock().unwrap();
            match mode {
                ReplayMode::Stepped => {
                    // Stepped mode is driven externally via `step()`; idle here.
                    std::thread::sleep(WAIT_TICK);
                    continue;
                }
                ReplayMode::Realtime | ReplayMode::Accelerated => {
                    if let Some(prev) = prev_ts {
                        let next_ts = {
                            let cursors = self.cursors.lock().unwrap();
                            cursors
                                .iter()
                                .filter_map(|c| c.peeked.as_ref().map(|(ts, _)| *ts))
                                .min()
                        };
                        if let Some(next_ts) = next_ts {
                            let delta_ms = (next_ts - prev).max(0) as u64;
                            let sleep_ms = match mode {
                                ReplayMode::Realtime => delta_ms,
                                ReplayMode::Accelerated => {
                                    let factor = *self.speed_factor.lock().unwrap();
                                    ((delta_ms as f64) / factor) as u64
                                }
                                _ => unreachable!(),
                            };
                            std::thread::sleep(Duration::from_millis(sleep_ms.min(60_000)));
                        }
                    }
                }
                ReplayMode::Backtest => {}
            }

            match self.advance_once() {
                Some((source_id, ts, payload)) => {
                    prev_ts = Some(ts);
                    self.dispatch(source_id, &payload);
                }
                None => {
                    let (lock, _) = &*self.control;
                    lock.lock().unwrap().status = RunStatus::Completed;
                    return;
                }
            }
        }
    }

    pub fn pause(&self) {
        let (lock, cvar) = &*self.control;
        let mut state = lock.lock().unwrap();
        if state.status == RunStatus::Running {
            state.status = RunStatus::Paused;
        }
        cvar.notify_all();
    }

    pub fn resume(&self) {
        let (lock, cvar) = &*self.control;
        let mut state = lock.lock().unwrap();
        if state.status == RunStatus::Paused {
            state.status = RunStatus::Running;
        }
        cvar.notify_all();
    }

    /// Signals the emitter loop to exit; takes effect within one bounded
    /// wait tick. Any callback already in flight finishes.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let (lock, cvar) = &*self.control;
        lock.lock().unwrap().status = RunStatus::Stopped;
        cvar.notify_all();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Resets counters and status to `Idle`. Sources are not rewound — the
    /// caller must `remove_source`/`add_source` fresh ones to replay from
    /// the start, mirroring the teacher's explicit reset-vs-rewind split.
    pub fn reset(&self) {
        self.emitted.store(0, Ordering::SeqCst);
        *self.last_ts.lock().unwrap() = None;
        *self.start_instant.lock().unwrap() = None;
        let (lock, _) = &*self.control;
        lock.lock().unwrap().status = RunStatus::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn csv_kline_source_emits_rows_in_file_order_tagged_with_its_symbol() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "close_time_ms,open,high,low,close,volume").unwrap();
        writeln!(file, "1000,100,110,90,105,5").unwrap();
        writeln!(file, "2000,105,120,100,115,3").unwrap();
        file.flush().unwrap();

        let mut source = CsvKlineSource::open(file.path(), "BTCUSDT").unwrap();
        let (ts1, bar1) = source.next_item().unwrap();
        assert_eq!(ts1, 1000);
        assert_eq!(bar1.symbol, "BTCUSDT");
        assert_eq!(bar1.close, rust_decimal_macros::dec!(105));

        let (ts2, bar2) = source.next_item().unwrap();
        assert_eq!(ts2, 2000);
        assert_eq!(bar2.close, rust_decimal_macros::dec!(115));

        assert!(source.next_item().is_none());
    }

    #[test]
    fn process_all_sync_merges_two_sources_in_timestamp_order() {
        let clock = Arc::new(TimeManager::backtest(0));
        let controller: ReplayController<i32> = ReplayController::new(clock.clone());
        controller.add_source(Box::new(VecSource::new(vec![(1_000, 1), (3_000, 3)])));
        controller.add_source(Box::new(VecSource::new(vec![(2_000, 2), (4_000, 4)])));

        let out = controller.process_all_sync();
        let values: Vec<i32> = out.iter().map(|(_, _, p)| *p).collect();
        assert_eq!(values, vec![1, 2, 3, 4]);
        assert_eq!(clock.now_ms(), 4_000);
    }

    #[test]
    fn ties_break_by_registration_order() {
        let clock = Arc::new(TimeManager::backtest(0));
        let controller: ReplayController<&'static str> = ReplayController::new(clock);
        controller.add_source(Box::new(VecSource::new(vec![(1_000, "first")])));
        controller.add_source(Box::new(VecSource::new(vec![(1_000, "second")])));

        let out = controller.process_all_sync();
        let values: Vec<&str> = out.iter().map(|(_, _, p)| *p).collect();
        assert_eq!(values, vec!["first", "second"]);
    }

    #[test]
    fn step_advances_exactly_one_item() {
        let clock = Arc::new(TimeManager::backtest(0));
        let controller: ReplayController<i32> = ReplayController::new(clock.clone());
        controller.add_source(Box::new(VecSource::new(vec![(100, 1), (200, 2)])));

        assert!(controller.step().is_some());
        assert_eq!(clock.now_ms(), 100);
        assert!(controller.step().is_some());
        assert_eq!(clock.now_ms(), 200);
        assert!(controller.step().is_none());
    }

    #[test]
    fn callbacks_receive_dispatched_payloads() {
        let clock = Arc::new(TimeManager::backtest(0));
        let controller: ReplayController<i32> = ReplayController::new(clock);
        controller.add_source(Box::new(VecSource::new(vec![(10, 7)])));
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        controller.register_callback(move |_src, payload: &i32| {
            received_clone.lock().unwrap().push(*payload);
        });
        controller.process_all_sync();
        assert_eq!(*received.lock().unwrap(), vec![7]);
    }

    #[test]
    fn progress_reports_emitted_count_and_last_timestamp() {
        let clock = Arc::new(TimeManager::backtest(0));
        let controller: ReplayController<i32> = ReplayController::new(clock);
        controller.add_source(Box::new(VecSource::new(vec![(10, 1), (20, 2)])));
        controller.process_all_sync();
        let progress = controller.progress();
        assert_eq!(progress.emitted, 2);
        assert_eq!(progress.last_ts, Some(20));
    }

    #[test]
    fn start_stop_background_run_completes_via_backtest_mode() {
        let clock = Arc::new(TimeManager::backtest(0));
        let controller = Arc::new(ReplayController::<i32>::new(clock));
        controller.add_source(Box::new(VecSource::new(vec![(10, 1), (20, 2), (30, 3)])));
        controller.start();
        for _ in 0..50 {
            if controller.status() == RunStatus::Completed {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(controller.status(), RunStatus::Completed);
        controller.stop();
    }
}
