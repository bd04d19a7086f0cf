//! Measurement engine for Ookla-protocol speed test servers.
//!
//! The engine measures one-way latency and jitter, sustained download and
//! upload throughput, and uplink packet loss against one or more remote
//! measurement servers. Transfers run on a concurrent worker pool whose
//! byte totals are sampled by a rate-capture loop; a moving-window Welford
//! statistic provides live rate feedback and stability-based early
//! termination.
//!
//! ```no_run
//! use speedtest_engine::{Speedtest, UserConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> speedtest_engine::Result<()> {
//!     let engine = Speedtest::new(UserConfig::default())?;
//!     let token = CancellationToken::new();
//!
//!     let servers = engine.fetch_servers().await?;
//!     let mut server = servers.0.into_iter().next().unwrap();
//!
//!     server.ping_test(&token, None).await?;
//!     server.download_test(&token).await?;
//!     engine.reset();
//!     server.upload_test(&token).await?;
//!
//!     println!("latency: {:?}", server.latency);
//!     println!("download: {}", server.dl_speed);
//!     println!("upload: {}", server.ul_speed);
//!     Ok(())
//! }
//! ```

pub mod errors;
pub mod location;
pub mod manager;
pub mod ookla;
pub mod stats;
pub mod units;
pub mod welford;

pub use errors::{Error, Result};
pub use location::{distance, Location};
pub use manager::{
    DataChunk, DataManager, Direction, RequestFn, Snapshot, Snapshots,
    TestDirection, UploadBody,
};
pub use ookla::catalog::User;
pub use ookla::loss::{PacketLossAnalyzer, PacketLossAnalyzerOptions};
pub use ookla::server::{Server, Servers, TestDuration, PING_TIMEOUT};
pub use ookla::transport::PLoss;
pub use ookla::{
    version, Dialer, PingMode, Speedtest, UserConfig, DEFAULT_USER_AGENT,
};
pub use stats::LatencyStats;
pub use units::{ByteRate, UnitType};
pub use welford::{StabilityCriteria, Welford};
