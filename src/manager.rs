//! Data manager: chunk accounting, test directions and the worker pool.
//!
//! A [`DataManager`] owns one download and one upload [`TestDirection`].
//! Request functions are registered on a direction before it starts; the
//! driver then runs a fixed worker population against them until either the
//! capture-time deadline or the Welford stability predicate fires. A
//! rate-capture task samples the direction's atomic byte total on a fixed
//! period and feeds the moving-window statistics.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use log::debug;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::errors::{Error, Result};
use crate::stats;
use crate::units::ByteRate;
use crate::welford::Welford;

/// Granularity of the streaming upload body; also the length of the shared
/// repeat pattern.
pub(crate) const READ_CHUNK_SIZE: usize = 1024;
const BLACK_HOLE_BUFFER_SIZE: usize = 8192;
const BLACK_HOLE_POOL_SIZE: usize = 64;
const DEFAULT_CAPTURE_TIME: Duration = Duration::from_secs(15);
const DEFAULT_RATE_CAPTURE_FREQUENCY: Duration = Duration::from_millis(50);
const WELFORD_WINDOW_CYCLE: Duration = Duration::from_secs(5);
const MAX_SNAPSHOT_SIZE: usize = 10;
const MAIN_LOAD_FACTOR: f64 = 0.1;
const MS_PER_SECOND: f64 = 1000.0;

/// Transfer direction of a test phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

const CHUNK_EMPTY: u8 = 0;
const CHUNK_DOWNLOAD: u8 = 1;
const CHUNK_UPLOAD: u8 = 2;

/// A unit of work repeatedly invoked by one pool worker.
pub type RequestFuture = Pin<Box<dyn std::future::Future<Output = ()> + Send>>;
/// Boxed request function; cheap to clone into every worker.
pub type RequestFn = Arc<dyn Fn() -> RequestFuture + Send + Sync>;
/// Callback invoked with the live EWMA rate on every capture tick.
pub type RateCallback = Box<dyn Fn(ByteRate) + Send + Sync>;

fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Pool of reusable read buffers backing all download drains.
///
/// Buffers come back unmodified; the download path overwrites them anyway.
struct BufferPool {
    pool: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_pool_size: usize,
}

impl BufferPool {
    fn new(buffer_size: usize, max_pool_size: usize) -> Self {
        BufferPool {
            pool: Mutex::new(Vec::with_capacity(max_pool_size)),
            buffer_size,
            max_pool_size,
        }
    }

    fn get(&self) -> Vec<u8> {
        self.pool
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size])
    }

    fn put(&self, buffer: Vec<u8>) {
        if buffer.len() != self.buffer_size {
            return;
        }

        let mut pool = self.pool.lock();
        if pool.len() < self.max_pool_size {
            pool.push(buffer);
        }
    }
}

/// Owns the two test directions and the shared transfer state.
pub struct DataManager {
    snapshot_store: Mutex<Snapshots>,
    snapshot: Mutex<Snapshot>,

    /// Uniformly distributed bit pattern repeated by every upload body.
    repeat_bytes: Bytes,
    buffer_pool: BufferPool,

    capture_time: RwLock<Duration>,
    rate_capture_frequency: RwLock<Duration>,
    n_workers: RwLock<usize>,

    running: RwLock<bool>,

    download: RwLock<Arc<TestDirection>>,
    upload: RwLock<Arc<TestDirection>>,
}

impl DataManager {
    /// Creates a manager with the default capture parameters and a worker
    /// count equal to the available parallelism.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<DataManager>| DataManager {
            snapshot_store: Mutex::new(Snapshots::new(MAX_SNAPSHOT_SIZE)),
            snapshot: Mutex::new(Snapshot::new()),
            repeat_bytes: Bytes::from(vec![0xAA; READ_CHUNK_SIZE]),
            buffer_pool: BufferPool::new(
                BLACK_HOLE_BUFFER_SIZE,
                BLACK_HOLE_POOL_SIZE,
            ),
            capture_time: RwLock::new(DEFAULT_CAPTURE_TIME),
            rate_capture_frequency: RwLock::new(
                DEFAULT_RATE_CAPTURE_FREQUENCY,
            ),
            n_workers: RwLock::new(default_workers()),
            running: RwLock::new(false),
            download: RwLock::new(Arc::new(TestDirection::new(
                Direction::Download,
                weak.clone(),
            ))),
            upload: RwLock::new(Arc::new(TestDirection::new(
                Direction::Upload,
                weak.clone(),
            ))),
        })
    }

    /// Sets the sampling period of the rate-capture loop.
    pub fn set_rate_capture_frequency(&self, frequency: Duration) -> &Self {
        *self.rate_capture_frequency.write() = frequency;
        self
    }

    /// Sets the hard deadline of one transfer direction.
    pub fn set_capture_time(&self, duration: Duration) -> &Self {
        *self.capture_time.write() = duration;
        self
    }

    /// Sets the worker population; 0 restores the CPU-count default.
    pub fn set_workers(&self, n: usize) -> &Self {
        *self.n_workers.write() = if n == 0 { default_workers() } else { n };
        self
    }

    pub fn capture_time(&self) -> Duration {
        *self.capture_time.read()
    }

    pub fn rate_capture_frequency(&self) -> Duration {
        *self.rate_capture_frequency.read()
    }

    pub fn workers(&self) -> usize {
        *self.n_workers.read()
    }

    pub(crate) fn is_running(&self) -> bool {
        *self.running.read()
    }

    pub(crate) fn set_running(&self, running: bool) {
        *self.running.write() = running;
    }

    /// Allocates a chunk and records it in the current snapshot.
    pub fn new_chunk(self: &Arc<Self>) -> Arc<DataChunk> {
        let chunk = Arc::new(DataChunk::new(Arc::downgrade(self)));
        self.snapshot.lock().push(chunk.clone());
        chunk
    }

    pub fn download_direction(&self) -> Arc<TestDirection> {
        self.download.read().clone()
    }

    pub fn upload_direction(&self) -> Arc<TestDirection> {
        self.upload.read().clone()
    }

    /// Registers a download request function; the stack is capped at the
    /// worker population.
    pub fn register_download_handler(&self, f: RequestFn) -> Arc<TestDirection> {
        let direction = self.download_direction();
        if direction.handler_count() < self.workers() {
            direction.add(f);
        }

        direction
    }

    /// Registers an upload request function; the stack is capped at the
    /// worker population.
    pub fn register_upload_handler(&self, f: RequestFn) -> Arc<TestDirection> {
        let direction = self.upload_direction();
        if direction.handler_count() < self.workers() {
            direction.add(f);
        }

        direction
    }

    pub fn total_download(&self) -> i64 {
        self.download_direction().total_bytes()
    }

    pub fn total_upload(&self) -> i64 {
        self.upload_direction().total_bytes()
    }

    pub fn add_total_download(&self, delta: i64) {
        self.download_direction().add_total_bytes(delta);
    }

    pub fn add_total_upload(&self, delta: i64) {
        self.upload_direction().add_total_bytes(delta);
    }

    /// Whole-test average download rate over the configured capture time.
    pub fn avg_download_rate(&self) -> f64 {
        let unit = self.capture_time().as_millis() as f64;
        (self.total_download() * 8 / 1000) as f64 / unit
    }

    /// Whole-test average upload rate over the configured capture time.
    pub fn avg_upload_rate(&self) -> f64 {
        let unit = self.capture_time().as_millis() as f64;
        (self.total_upload() * 8 / 1000) as f64 / unit
    }

    pub fn ewma_download_rate(&self) -> f64 {
        self.download_direction().ewma_rate()
    }

    pub fn ewma_upload_rate(&self) -> f64 {
        self.upload_direction().ewma_rate()
    }

    pub fn set_download_callback(&self, callback: RateCallback) {
        self.download_direction().set_callback(callback);
    }

    pub fn set_upload_callback(&self, callback: RateCallback) {
        self.upload_direction().set_callback(callback);
    }

    /// Waits until no more data moves in either direction, polling at the
    /// rate-capture frequency.
    pub async fn wait(&self) {
        let mut old_down = self.total_download();
        let mut old_up = self.total_upload();

        loop {
            time::sleep(self.rate_capture_frequency()).await;

            let new_down = self.total_download();
            let new_up = self.total_upload();
            let delta_down = new_down - old_down;
            let delta_up = new_up - old_up;
            old_down = new_down;
            old_up = new_up;

            if delta_down == 0 && delta_up == 0 {
                return;
            }
        }
    }

    /// Archives the current snapshot and replaces both directions with
    /// fresh ones.
    pub fn reset(self: &Arc<Self>) {
        let snapshot = std::mem::take(&mut *self.snapshot.lock());
        self.snapshot_store.lock().push(snapshot);

        *self.download.write() = Arc::new(TestDirection::new(
            Direction::Download,
            Arc::downgrade(self),
        ));
        *self.upload.write() = Arc::new(TestDirection::new(
            Direction::Upload,
            Arc::downgrade(self),
        ));
    }

    /// Runs `f` with the archived snapshots.
    pub fn with_snapshots<T>(&self, f: impl FnOnce(&Snapshots) -> T) -> T {
        f(&self.snapshot_store.lock())
    }

    pub(crate) fn repeat_bytes(&self) -> Bytes {
        self.repeat_bytes.clone()
    }
}

/// Idempotent close path for one direction run.
///
/// Close can be triggered by the capture-time timer, the stability
/// predicate, or an external caller; only the first trigger acts.
struct DirectionCloser {
    closed: AtomicBool,
    capture: CancellationToken,
    workers: CancellationToken,
    manager: Weak<DataManager>,
}

impl DirectionCloser {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.capture.cancel();
        if let Some(manager) = self.manager.upgrade() {
            manager.set_running(false);
        }
        self.workers.cancel();
        debug!("test direction: stop");
    }
}

/// One transfer phase: a stack of request functions plus the statistics
/// produced while the pool runs them.
pub struct TestDirection {
    direction: Direction,
    manager: Weak<DataManager>,
    total: AtomicI64,
    fns: Mutex<Vec<RequestFn>>,
    rate_sequence: Mutex<Vec<i64>>,
    welford: Mutex<Option<Welford>>,
    capture_callback: Mutex<Option<RateCallback>>,
    closer: Mutex<Option<Arc<DirectionCloser>>>,
}

impl TestDirection {
    fn new(direction: Direction, manager: Weak<DataManager>) -> Self {
        TestDirection {
            direction,
            manager,
            total: AtomicI64::new(0),
            fns: Mutex::new(Vec::new()),
            rate_sequence: Mutex::new(Vec::new()),
            welford: Mutex::new(None),
            capture_callback: Mutex::new(None),
            closer: Mutex::new(None),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Appends a request function. Only legal before [`start`](Self::start).
    pub fn add(&self, f: RequestFn) {
        self.fns.lock().push(f);
    }

    pub fn handler_count(&self) -> usize {
        self.fns.lock().len()
    }

    /// Total bytes moved by all workers of this direction so far.
    pub fn total_bytes(&self) -> i64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn add_total_bytes(&self, delta: i64) -> i64 {
        self.total.fetch_add(delta, Ordering::SeqCst) + delta
    }

    pub fn set_callback(&self, callback: RateCallback) {
        *self.capture_callback.lock() = Some(callback);
    }

    /// Reported rate of this direction, bytes per second.
    pub fn ewma_rate(&self) -> f64 {
        self.welford.lock().as_ref().map(|w| w.ewma()).unwrap_or(0.0)
    }

    /// Median-averaging filtered rate over the raw capture sequence,
    /// bytes per second. Diagnostic only.
    pub fn ma_filtered_rate(&self) -> f64 {
        let per_tick = stats::calc_ma_filter(&self.rate_sequence.lock());
        let Some(manager) = self.manager.upgrade() else {
            return 0.0;
        };

        per_tick / manager.rate_capture_frequency().as_secs_f64()
    }

    /// Raw per-tick byte deltas collected by the capture loop.
    pub fn rate_sequence(&self) -> Vec<i64> {
        self.rate_sequence.lock().clone()
    }

    /// Requests early termination of the run. Safe to call any number of
    /// times, from any task.
    pub fn close(&self) {
        if let Some(closer) = self.closer.lock().clone() {
            closer.close();
        }
    }

    /// Drives the worker pool until the capture-time deadline or the
    /// stability predicate fires.
    ///
    /// `cancel` is the token the registered request functions watch; the
    /// close path cancels it so in-flight transfers abort promptly.
    /// `main_index` selects the primary request function; out-of-range
    /// values fall back to 0. Workers split `max(1, 10%)` primary, the rest
    /// round-robin over the auxiliary functions.
    pub async fn start(
        self: &Arc<Self>,
        cancel: CancellationToken,
        main_index: usize,
    ) -> Result<()> {
        let manager =
            self.manager.upgrade().ok_or(Error::UninitializedManager)?;

        let fns = self.fns.lock().clone();
        if fns.is_empty() {
            return Err(Error::EmptyTaskStack);
        }

        let main_index = if main_index >= fns.len() { 0 } else { main_index };

        let n_workers = manager.workers();
        let mut main_n = (MAIN_LOAD_FACTOR * fns.len() as f64) as usize;
        if main_n == 0 {
            main_n = 1;
        }

        if fns.len() == 1 {
            main_n = n_workers;
        }

        let aux_n = n_workers.saturating_sub(main_n);
        debug!("available fns: {}", fns.len());
        debug!("main workers: {main_n}, aux workers: {aux_n}");

        manager.set_running(true);

        let capture_cancel = CancellationToken::new();
        let closer = Arc::new(DirectionCloser {
            closed: AtomicBool::new(false),
            capture: capture_cancel.clone(),
            workers: cancel,
            manager: Arc::downgrade(&manager),
        });
        *self.closer.lock() = Some(closer.clone());

        let capture_task = self.rate_capture(&manager, capture_cancel);

        let timer_closer = closer.clone();
        let capture_time = manager.capture_time();
        let timer = tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(capture_time) => {}
                _ = timer_closer.workers.cancelled() => {}
            }
            timer_closer.close();
        });

        let mut workers = JoinSet::new();

        for _ in 0..main_n {
            let f = fns[main_index].clone();
            let mgr = manager.clone();
            workers.spawn(async move {
                loop {
                    if !mgr.is_running() {
                        return;
                    }

                    f().await;
                }
            });
        }

        let mut aux_assigned = 0;
        'assign: while aux_assigned < aux_n && fns.len() > 1 {
            for (fn_index, f) in fns.iter().enumerate() {
                if aux_assigned == aux_n {
                    break 'assign;
                }

                if fn_index == main_index {
                    continue;
                }

                let f = f.clone();
                let mgr = manager.clone();
                workers.spawn(async move {
                    loop {
                        if !mgr.is_running() {
                            return;
                        }

                        f().await;
                    }
                });

                aux_assigned += 1;
            }
        }

        while workers.join_next().await.is_some() {}

        // all tasks are joined, never detached
        let _ = timer.await;
        let _ = capture_task.await;

        let raw = self.rate_sequence.lock().clone();
        let kept = stats::pauta_filter(&raw);
        debug!(
            "per capture unit: raw sequence len {}, within 3-sigma {}",
            raw.len(),
            kept.len()
        );

        Ok(())
    }

    /// Spawns the capture task: one Welford update per tick, from a single
    /// writer.
    fn rate_capture(
        self: &Arc<Self>,
        manager: &Arc<DataManager>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let frequency = manager.rate_capture_frequency();
        *self.welford.lock() =
            Some(Welford::new(WELFORD_WINDOW_CYCLE, frequency));

        let direction = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(frequency);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately; skip it so elapsed time
            // is never zero
            ticker.tick().await;

            let started = Instant::now();
            let mut prev_total = 0i64;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let new_total = direction.total_bytes();
                        let delta = new_total - prev_total;
                        prev_total = new_total;

                        if delta != 0 {
                            direction.rate_sequence.lock().push(delta);
                        }

                        let elapsed_ms =
                            started.elapsed().as_millis() as f64;
                        if elapsed_ms == 0.0 {
                            continue;
                        }

                        // anyway we update the measuring instrument
                        let global_avg =
                            new_total as f64 / elapsed_ms * MS_PER_SECOND;
                        let stable = {
                            let mut welford = direction.welford.lock();
                            match welford.as_mut() {
                                Some(w) => w.update(global_avg, delta as f64),
                                None => false,
                            }
                        };

                        if stable {
                            let closing = direction.clone();
                            tokio::spawn(async move { closing.close() });
                        }

                        let rate = direction.ewma_rate();
                        if let Some(callback) =
                            direction.capture_callback.lock().as_ref()
                        {
                            callback(ByteRate(rate));
                        }
                    }
                }
            }
        })
    }
}

/// One HTTP request/response cycle accounted as a unit.
#[derive(Debug)]
pub struct DataChunk {
    manager: Weak<DataManager>,
    state: AtomicU8,
    start_time: Mutex<Option<Instant>>,
    end_time: Mutex<Option<Instant>>,
    content_length: AtomicI64,
    remain_or_discard: AtomicI64,
}

impl DataChunk {
    fn new(manager: Weak<DataManager>) -> Self {
        DataChunk {
            manager,
            state: AtomicU8::new(CHUNK_EMPTY),
            start_time: Mutex::new(None),
            end_time: Mutex::new(None),
            content_length: AtomicI64::new(0),
            remain_or_discard: AtomicI64::new(0),
        }
    }

    /// Bytes consumed (download) or still to produce (upload).
    pub fn remain_or_discard_size(&self) -> i64 {
        self.remain_or_discard.load(Ordering::SeqCst)
    }

    pub fn content_length(&self) -> i64 {
        self.content_length.load(Ordering::SeqCst)
    }

    /// Wall-clock span between the chunk's first and last byte.
    pub fn duration(&self) -> Duration {
        match (*self.start_time.lock(), *self.end_time.lock()) {
            (Some(start), Some(end)) => end.duration_since(start),
            _ => Duration::ZERO,
        }
    }

    /// Per-chunk transfer rate. Download chunks report bytes per second;
    /// upload chunks report megabits per second.
    pub fn rate(&self) -> f64 {
        let seconds = self.duration().as_secs_f64();
        if seconds == 0.0 {
            return 0.0;
        }

        match self.state.load(Ordering::SeqCst) {
            CHUNK_DOWNLOAD => self.remain_or_discard_size() as f64 / seconds,
            CHUNK_UPLOAD => {
                (self.content_length() - self.remain_or_discard_size()) as f64
                    * 8.0
                    / 1000.0
                    / 1000.0
                    / seconds
            }
            _ => 0.0,
        }
    }

    /// Drains `reader` into the shared black-hole buffer, accounting every
    /// byte to this chunk and the download direction.
    ///
    /// Returns when the body ends or the direction stops running. An error
    /// chunk is generally caused by the remote server closing the
    /// connection early.
    pub async fn download_handler<R>(&self, reader: R) -> Result<()>
    where
        R: AsyncRead,
    {
        if self
            .state
            .compare_exchange(
                CHUNK_EMPTY,
                CHUNK_DOWNLOAD,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(Error::ChunkReused);
        }

        let manager =
            self.manager.upgrade().ok_or(Error::UninitializedManager)?;

        *self.start_time.lock() = Some(Instant::now());

        tokio::pin!(reader);
        let mut buffer = manager.buffer_pool.get();
        let result = loop {
            if !manager.is_running() {
                break Ok(());
            }

            match reader.read(&mut buffer).await {
                Ok(0) => break Ok(()),
                Ok(read) => {
                    let read = read as i64;
                    self.remain_or_discard.fetch_add(read, Ordering::SeqCst);
                    manager.add_total_download(read);
                }
                Err(err) => break Err(Error::Io(err)),
            }
        };

        manager.buffer_pool.put(buffer);
        *self.end_time.lock() = Some(Instant::now());

        result
    }

    /// Arms the chunk as an upload of `size` bytes and returns the
    /// streaming body producing the repeated pattern.
    pub fn upload_handler(
        self: &Arc<Self>,
        size: i64,
    ) -> Result<UploadBody> {
        if size <= 0 {
            return Err(Error::InvalidUploadSize(size));
        }

        if self
            .state
            .compare_exchange(
                CHUNK_EMPTY,
                CHUNK_UPLOAD,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(Error::ChunkReused);
        }

        self.content_length.store(size, Ordering::SeqCst);
        self.remain_or_discard.store(size, Ordering::SeqCst);
        *self.start_time.lock() = Some(Instant::now());

        Ok(UploadBody { chunk: self.clone() })
    }
}

/// Streaming upload body: yields slices of the shared 1 KiB pattern until
/// the chunk's content length is exhausted.
#[derive(Debug)]
pub struct UploadBody {
    chunk: Arc<DataChunk>,
}

impl Stream for UploadBody {
    type Item = std::result::Result<Bytes, io::Error>;

    fn poll_next(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let chunk = &self.chunk;
        let Some(manager) = chunk.manager.upgrade() else {
            return Poll::Ready(None);
        };

        let remaining = chunk.remain_or_discard.load(Ordering::SeqCst);
        if remaining <= 0 {
            *chunk.end_time.lock() = Some(Instant::now());
            return Poll::Ready(None);
        }

        let len = remaining.min(READ_CHUNK_SIZE as i64) as usize;
        let piece = manager.repeat_bytes().slice(..len);

        chunk.remain_or_discard.fetch_sub(len as i64, Ordering::SeqCst);
        manager.add_total_upload(len as i64);

        Poll::Ready(Some(Ok(piece)))
    }
}

/// The chunks produced by one test-direction run.
pub type Snapshot = Vec<Arc<DataChunk>>;

/// Bounded history of snapshots; the oldest is evicted on overflow.
pub struct Snapshots {
    sp: VecDeque<Snapshot>,
    max_size: usize,
}

impl Snapshots {
    fn new(max_size: usize) -> Self {
        Snapshots { sp: VecDeque::with_capacity(max_size), max_size }
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.sp.back()
    }

    pub fn all(&self) -> impl Iterator<Item = &Snapshot> {
        self.sp.iter()
    }

    pub fn len(&self) -> usize {
        self.sp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sp.is_empty()
    }

    pub fn clean(&mut self) {
        self.sp.clear();
    }

    pub(crate) fn push(&mut self, value: Snapshot) {
        if self.sp.len() == self.max_size {
            self.sp.pop_front();
        }

        self.sp.push_back(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::atomic::AtomicUsize;

    fn noop_fn(counter: Arc<AtomicUsize>) -> RequestFn {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                time::sleep(Duration::from_millis(2)).await;
            })
        })
    }

    #[tokio::test]
    async fn test_chunk_handlers_are_single_shot() {
        let manager = DataManager::new();
        manager.set_running(true);

        let chunk = manager.new_chunk();
        let body: &[u8] = b"0123456789";
        chunk.download_handler(body).await.unwrap();

        // second download attempt
        let err = chunk.download_handler(body).await.unwrap_err();
        assert!(matches!(err, Error::ChunkReused));

        // cross-handler attempt
        let err = chunk.upload_handler(100).unwrap_err();
        assert!(matches!(err, Error::ChunkReused));
    }

    #[tokio::test]
    async fn test_download_handler_accounts_every_byte() {
        const N: usize = 1024 * 1024;

        let manager = DataManager::new();
        manager.set_running(true);

        let chunk = manager.new_chunk();
        let body = vec![0u8; N];
        chunk.download_handler(body.as_slice()).await.unwrap();

        assert_eq!(chunk.remain_or_discard_size(), N as i64);
        assert_eq!(manager.total_download(), N as i64);
        assert!(chunk.duration() >= Duration::ZERO);
    }

    #[tokio::test]
    async fn test_download_handler_stops_when_not_running() {
        let manager = DataManager::new();
        // never set running

        let chunk = manager.new_chunk();
        let body = vec![0u8; 4096];
        chunk.download_handler(body.as_slice()).await.unwrap();
        assert_eq!(chunk.remain_or_discard_size(), 0);
    }

    #[tokio::test]
    async fn test_upload_body_repeats_pattern_exactly() {
        let manager = DataManager::new();
        let chunk = manager.new_chunk();

        let size = (100 * 100 - 51) * 10; // 99_490
        let body = chunk.upload_handler(size as i64).unwrap();

        let pieces: Vec<_> = body.collect().await;
        let total: usize =
            pieces.iter().map(|p| p.as_ref().unwrap().len()).sum();
        assert_eq!(total, size);
        assert!(pieces
            .iter()
            .all(|p| p.as_ref().unwrap().iter().all(|&b| b == 0xAA)));

        assert_eq!(manager.total_upload(), size as i64);
        assert_eq!(chunk.content_length(), size as i64);
        assert_eq!(chunk.remain_or_discard_size(), 0);
    }

    #[tokio::test]
    async fn test_upload_handler_rejects_non_positive_size() {
        let manager = DataManager::new();
        let chunk = manager.new_chunk();
        assert!(matches!(
            chunk.upload_handler(0),
            Err(Error::InvalidUploadSize(0))
        ));
        assert!(matches!(
            chunk.upload_handler(-5),
            Err(Error::InvalidUploadSize(-5))
        ));
    }

    #[tokio::test]
    async fn test_start_rejects_empty_stack() {
        let manager = DataManager::new();
        let direction = manager.download_direction();
        let err = direction
            .start(CancellationToken::new(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyTaskStack));
    }

    #[tokio::test]
    async fn test_pool_terminates_at_deadline() {
        let manager = DataManager::new();
        manager
            .set_capture_time(Duration::from_millis(50))
            .set_rate_capture_frequency(Duration::from_millis(10))
            .set_workers(2);

        let invocations = Arc::new(AtomicUsize::new(0));
        let direction =
            manager.register_download_handler(noop_fn(invocations.clone()));

        let token = CancellationToken::new();
        let started = std::time::Instant::now();
        direction.start(token.clone(), 0).await.unwrap();
        let elapsed = started.elapsed();

        assert!(
            elapsed < Duration::from_millis(500),
            "pool ran too long: {elapsed:?}"
        );
        assert!(invocations.load(Ordering::SeqCst) > 0);
        assert!(token.is_cancelled());
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let manager = DataManager::new();
        manager
            .set_capture_time(Duration::from_millis(200))
            .set_workers(1);

        let invocations = Arc::new(AtomicUsize::new(0));
        let direction =
            manager.register_download_handler(noop_fn(invocations.clone()));

        let token = CancellationToken::new();
        let runner = {
            let direction = direction.clone();
            let token = token.clone();
            tokio::spawn(async move { direction.start(token, 0).await })
        };

        time::sleep(Duration::from_millis(30)).await;
        direction.close();
        direction.close();
        direction.close();

        runner.await.unwrap().unwrap();
        assert!(!manager.is_running());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_close_before_start_is_noop() {
        let manager = DataManager::new();
        let direction = manager.download_direction();
        direction.close();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_register_caps_at_worker_count() {
        let manager = DataManager::new();
        manager.set_workers(2);

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            manager.register_download_handler(noop_fn(counter.clone()));
        }

        assert_eq!(manager.download_direction().handler_count(), 2);
    }

    #[tokio::test]
    async fn test_rate_capture_feeds_callback() {
        let manager = DataManager::new();
        manager
            .set_capture_time(Duration::from_millis(120))
            .set_rate_capture_frequency(Duration::from_millis(10))
            .set_workers(1);

        let manager_for_fn = manager.clone();
        let feeder: RequestFn = Arc::new(move || {
            let manager = manager_for_fn.clone();
            Box::pin(async move {
                manager.add_total_download(10_000);
                time::sleep(Duration::from_millis(5)).await;
            })
        });

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_cb = ticks.clone();
        manager.set_download_callback(Box::new(move |rate| {
            if rate.0 > 0.0 {
                ticks_cb.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let direction = manager.register_download_handler(feeder);
        direction.start(CancellationToken::new(), 0).await.unwrap();

        assert!(ticks.load(Ordering::SeqCst) > 0);
        assert!(manager.ewma_download_rate() > 0.0);

        let deltas = direction.rate_sequence();
        assert!(!deltas.is_empty());
        // the atomic total only grows, so per-tick deltas never go negative
        assert!(deltas.iter().all(|&delta| delta >= 0));
    }

    #[tokio::test]
    async fn test_total_bytes_is_monotonic() {
        let manager = DataManager::new();
        let direction = manager.download_direction();

        let mut last = 0;
        for _ in 0..100 {
            let now = direction.add_total_bytes(7);
            assert!(now > last);
            last = now;
        }

        assert_eq!(direction.total_bytes(), 700);
    }

    #[test]
    fn test_snapshot_ring_bounds_and_order() {
        let mut snapshots = Snapshots::new(MAX_SNAPSHOT_SIZE);
        let manager = DataManager::new();

        for i in 0..15 {
            let mut snapshot = Snapshot::new();
            for _ in 0..=i {
                snapshot.push(manager.new_chunk());
            }
            snapshots.push(snapshot);
        }

        assert_eq!(snapshots.len(), MAX_SNAPSHOT_SIZE);
        // the newest snapshot (15 chunks) sits at the tail
        assert_eq!(snapshots.latest().unwrap().len(), 15);
        // the oldest surviving one has 6
        assert_eq!(snapshots.all().next().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_reset_archives_snapshot_and_replaces_directions() {
        let manager = DataManager::new();
        manager.new_chunk();
        manager.new_chunk();
        manager.add_total_download(123);

        let old_direction = manager.download_direction();
        manager.reset();

        assert!(manager.with_snapshots(|s| s.latest().unwrap().len() == 2));
        assert_eq!(manager.total_download(), 0);
        assert!(!Arc::ptr_eq(&old_direction, &manager.download_direction()));
    }

    #[tokio::test]
    async fn test_wait_returns_when_idle() {
        let manager = DataManager::new();
        manager.set_rate_capture_frequency(Duration::from_millis(5));
        // nothing is moving; wait must return promptly
        time::timeout(Duration::from_secs(1), manager.wait())
            .await
            .expect("wait did not settle");
    }
}
