//! Transfer requests and per-server test operations.
//!
//! A request function is one HTTP cycle: allocate a chunk, move its bytes,
//! account them. The test operations register request functions on the data
//! manager and drive the worker pool until the deadline or the stability
//! predicate ends the run.

use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::TryStreamExt;
use log::debug;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use tokio::time::Instant;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::errors::{Error, Result};
use crate::manager::RequestFn;
use crate::ookla::server::{Server, Servers};
use crate::ookla::{sibling_url, EngineCore, PingMode};
use crate::stats;
use crate::units::ByteRate;

/// Image sizes of the download endpoint, in pixels.
const DL_SIZES: [usize; 10] =
    [350, 500, 750, 1000, 1500, 2000, 2500, 3000, 3500, 4000];
/// Upload payload size table, in kB.
const UL_SIZES: [usize; 10] =
    [100, 300, 500, 800, 1000, 1500, 2500, 3000, 3500, 4000];

const DEFAULT_DOWNLOAD_SIZE_INDEX: usize = 3;
const DEFAULT_UPLOAD_SIZE_INDEX: usize = 4;

/// Above this failure ratio a zero measured rate is reported as
/// unavailable rather than as a genuine zero.
const ERROR_RATE_THRESHOLD: f64 = 0.1;

const PING_ECHO_TIMES: usize = 10;
const PING_ECHO_FREQ: Duration = Duration::from_millis(200);
const ICMP_READ_TIMEOUT: Duration = Duration::from_secs(4);

/// One download cycle: GET the sized image and drain it through a chunk.
pub(crate) async fn download_request(
    core: &Arc<EngineCore>,
    url: &str,
    size_index: usize,
    token: &CancellationToken,
) -> Result<()> {
    let size = DL_SIZES[size_index % DL_SIZES.len()];
    let target = sibling_url(url, &format!("random{size}x{size}.jpg"))?;
    debug!("xdl url: {target}");

    let response = tokio::select! {
        _ = token.cancelled() => return Err(Error::Cancelled),
        response = core.client.get(target).send() => response?,
    };

    let chunk = core.manager.new_chunk();
    let stream = response.bytes_stream().map_err(io::Error::other);
    let reader = StreamReader::new(stream);

    tokio::select! {
        _ = token.cancelled() => Err(Error::Cancelled),
        result = chunk.download_handler(reader) => result,
    }
}

/// One upload cycle: POST the repeat-pattern body of the table-derived
/// length and discard the reply.
pub(crate) async fn upload_request(
    core: &Arc<EngineCore>,
    url: &str,
    size_index: usize,
    token: &CancellationToken,
) -> Result<()> {
    let size = UL_SIZES[size_index % UL_SIZES.len()];
    let content_length = ((size * 100 - 51) * 10) as i64;

    let chunk = core.manager.new_chunk();
    let body = chunk.upload_handler(content_length)?;
    debug!("len={content_length}, xul url: {url}");

    let request = core
        .client
        .post(url)
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(CONTENT_LENGTH, content_length)
        .body(reqwest::Body::wrap_stream(body));

    let response = tokio::select! {
        _ = token.cancelled() => return Err(Error::Cancelled),
        response = request.send() => response?,
    };

    tokio::select! {
        _ = token.cancelled() => Err(Error::Cancelled),
        body = response.bytes() => {
            let _ = body?;
            Ok(())
        }
    }
}

/// Shared request-level accounting across all closures of one run.
struct RequestCounters {
    requests: AtomicI64,
    errors: AtomicI64,
}

impl RequestCounters {
    fn new() -> Arc<Self> {
        Arc::new(RequestCounters {
            requests: AtomicI64::new(0),
            errors: AtomicI64::new(0),
        })
    }

    /// Applies the unavailable sentinel when the run produced nothing but
    /// failures.
    fn adjust(&self, rate: ByteRate) -> ByteRate {
        let requests = self.requests.load(Ordering::SeqCst);
        let errors = self.errors.load(Ordering::SeqCst);

        if rate.0 == 0.0
            && requests > 0
            && errors as f64 / requests as f64 > ERROR_RATE_THRESHOLD
        {
            return ByteRate::UNAVAILABLE;
        }

        rate
    }
}

fn download_fn(
    core: Arc<EngineCore>,
    url: String,
    size_index: usize,
    token: CancellationToken,
    counters: Arc<RequestCounters>,
) -> RequestFn {
    Arc::new(move || {
        let core = core.clone();
        let url = url.clone();
        let token = token.clone();
        let counters = counters.clone();

        Box::pin(async move {
            counters.requests.fetch_add(1, Ordering::SeqCst);
            if let Err(err) =
                download_request(&core, &url, size_index, &token).await
            {
                counters.errors.fetch_add(1, Ordering::SeqCst);
                debug!("download request failed: {err}");
            }
        })
    })
}

fn upload_fn(
    core: Arc<EngineCore>,
    url: String,
    size_index: usize,
    token: CancellationToken,
    counters: Arc<RequestCounters>,
) -> RequestFn {
    Arc::new(move || {
        let core = core.clone();
        let url = url.clone();
        let token = token.clone();
        let counters = counters.clone();

        Box::pin(async move {
            counters.requests.fetch_add(1, Ordering::SeqCst);
            if let Err(err) =
                upload_request(&core, &url, size_index, &token).await
            {
                counters.errors.fetch_add(1, Ordering::SeqCst);
                debug!("upload request failed: {err}");
            }
        })
    })
}

impl Server {
    /// Measures latency with the engine's configured probe protocol and
    /// records mean/jitter/min/max on the server.
    pub async fn ping_test(
        &mut self,
        token: &CancellationToken,
        callback: Option<&crate::ookla::ping::PingCallback>,
    ) -> Result<()> {
        let core = self.engine.core()?;
        let started = Instant::now();

        let samples = match core.config.ping_mode {
            PingMode::Tcp => {
                self.tcp_ping(token, PING_ECHO_TIMES, PING_ECHO_FREQ, callback)
                    .await?
            }
            PingMode::Icmp => {
                self.icmp_ping(
                    token,
                    ICMP_READ_TIMEOUT,
                    PING_ECHO_TIMES,
                    PING_ECHO_FREQ,
                    callback,
                )
                .await?
            }
            PingMode::Http => {
                self.http_ping(
                    token,
                    PING_ECHO_TIMES,
                    PING_ECHO_FREQ,
                    callback,
                )
                .await?
            }
        };

        if samples.is_empty() {
            return Ok(());
        }

        debug!("latency samples: {samples:?}");
        let summary = stats::standard_deviation(&samples);
        self.latency = Some(Duration::from_nanos(summary.mean.max(0) as u64));
        self.jitter = Duration::from_nanos(summary.std_dev.max(0) as u64);
        self.min_latency = Duration::from_nanos(summary.min.max(0) as u64);
        self.max_latency = Duration::from_nanos(summary.max.max(0) as u64);
        self.test_duration.ping = Some(started.elapsed());
        self.update_total_duration();

        Ok(())
    }

    /// Measures sustained download throughput against this server.
    pub async fn download_test(
        &mut self,
        token: &CancellationToken,
    ) -> Result<()> {
        let core = self.engine.core()?;
        let started = Instant::now();

        let counters = RequestCounters::new();
        let child = token.child_token();
        let direction = core.manager.register_download_handler(download_fn(
            core.clone(),
            self.url.clone(),
            DEFAULT_DOWNLOAD_SIZE_INDEX,
            child.clone(),
            counters.clone(),
        ));

        direction.start(child, 0).await?;

        self.dl_speed =
            counters.adjust(ByteRate(core.manager.ewma_download_rate()));
        self.test_duration.download = Some(started.elapsed());
        self.update_total_duration();

        Ok(())
    }

    /// Measures sustained upload throughput against this server.
    pub async fn upload_test(
        &mut self,
        token: &CancellationToken,
    ) -> Result<()> {
        let core = self.engine.core()?;
        let started = Instant::now();

        let counters = RequestCounters::new();
        let child = token.child_token();
        let direction = core.manager.register_upload_handler(upload_fn(
            core.clone(),
            self.url.clone(),
            DEFAULT_UPLOAD_SIZE_INDEX,
            child.clone(),
            counters.clone(),
        ));

        direction.start(child, 0).await?;

        self.ul_speed =
            counters.adjust(ByteRate(core.manager.ewma_upload_rate()));
        self.test_duration.upload = Some(started.elapsed());
        self.update_total_duration();

        Ok(())
    }

    /// Download test aggregating traffic across all available peers, with
    /// this server's requests as the primary worker share.
    pub async fn multi_download_test(
        &mut self,
        token: &CancellationToken,
        servers: &Servers,
    ) -> Result<()> {
        let core = self.engine.core()?;

        let available = servers.available();
        if available.is_empty() {
            return Err(Error::NoServer);
        }

        let counters = RequestCounters::new();
        let child = token.child_token();
        let mut main_index = 0;
        let mut direction = None;

        for (index, peer) in available.iter().enumerate() {
            if peer.id == self.id {
                main_index = index;
            }

            debug!("register download handler: {}", peer.url);
            direction =
                Some(core.manager.register_download_handler(download_fn(
                    core.clone(),
                    peer.url.clone(),
                    DEFAULT_DOWNLOAD_SIZE_INDEX,
                    child.clone(),
                    counters.clone(),
                )));
        }

        let direction = direction.ok_or(Error::UninitializedManager)?;
        direction.start(child, main_index).await?;

        self.dl_speed =
            counters.adjust(ByteRate(core.manager.ewma_download_rate()));

        Ok(())
    }

    /// Upload test aggregating traffic across all available peers, with
    /// this server's requests as the primary worker share.
    pub async fn multi_upload_test(
        &mut self,
        token: &CancellationToken,
        servers: &Servers,
    ) -> Result<()> {
        let core = self.engine.core()?;

        let available = servers.available();
        if available.is_empty() {
            return Err(Error::NoServer);
        }

        let counters = RequestCounters::new();
        let child = token.child_token();
        let mut main_index = 0;
        let mut direction = None;

        for (index, peer) in available.iter().enumerate() {
            if peer.id == self.id {
                main_index = index;
            }

            debug!("register upload handler: {}", peer.url);
            direction = Some(core.manager.register_upload_handler(upload_fn(
                core.clone(),
                peer.url.clone(),
                DEFAULT_UPLOAD_SIZE_INDEX,
                child.clone(),
                counters.clone(),
            )));
        }

        let direction = direction.ok_or(Error::UninitializedManager)?;
        direction.start(child, main_index).await?;

        self.ul_speed =
            counters.adjust(ByteRate(core.manager.ewma_upload_rate()));

        Ok(())
    }

    /// Ping, download and upload, one after another.
    pub async fn test_all(&mut self, token: &CancellationToken) -> Result<()> {
        self.ping_test(token, None).await?;
        self.download_test(token).await?;
        self.upload_test(token).await
    }
}
