//! dxcluster - A Rust engine for ingesting propagation spots from DX cluster servers.
//!
//! This crate provides:
//! - A DXCC prefix resolver with longest-prefix callsign lookup
//! - A robust nom-based parser for spot and WWV announcement lines
//! - A dialect-aware login negotiator (CC-Cluster, AR-Cluster, DXSpider)
//! - An orchestrated telnet client cycling through a server pool
//! - A bounded write queue and a batching SQLite persistence worker
//!
//! # Example
//!
//! ```rust
//! use dxcluster::parser::{classify, parse_wwv, LineClass};
//!
//! let line = "WWV de W0MU <18Z>: SFI=93, A=4, K=2, No Storms -> No Storms";
//! assert_eq!(classify(line), LineClass::Wwv);
//!
//! let wwv = parse_wwv(line).expect("Failed to parse WWV line");
//! assert_eq!(wwv.sfi, 93);
//! ```

pub mod client;
pub mod config;
pub mod db;
pub mod dxcc;
pub mod parser;
pub mod queue;
pub mod record;
pub mod session;
pub mod stats;

pub use client::{ClusterClient, ClusterConfig};
pub use config::Config;
pub use db::{PersistenceWorker, RetryPolicy, open_database};
pub use dxcc::{DxccEntity, DxccResolver, LookupError};
pub use parser::{LineClass, LineParser, ParseError, classify, parse_wwv};
pub use queue::{QueuedWrite, WriteQueue, write_queue};
pub use record::{Mode, SpotRecord, WwvRecord, band_for_frequency};
pub use session::{Dialect, SessionError, SessionOptions};
pub use stats::{IngestStats, StatsSummary};
