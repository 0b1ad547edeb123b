//! Connection orchestration and stream reading for cluster servers.
//!
//! One network task owns this module end to end: it cycles through the
//! configured server pool, logs in through the session negotiator, then
//! reads the line stream and feeds parsed records into the write queue. It
//! blocks only on socket reads with explicit timeouts, never on storage.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::parser::{LineClass, LineParser, ParseError, classify};
use crate::queue::{QueuedWrite, WriteQueue};
use crate::session::{self, SessionOptions, read_line_lossy};
use crate::stats::IngestStats;

/// One connection is recycled after this many reads; the stream loop is
/// never unbounded.
const MAX_STREAM_ITERATIONS: u32 = 1_000_000;

/// Configuration for the cluster client.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Candidate servers as `host:port`, tried in shuffled order.
    pub servers: Vec<String>,

    /// Callsign to use for login.
    pub callsign: String,

    /// Contact email for dialects whose filter commands carry one.
    pub email: Option<String>,

    /// Connection timeout.
    pub connect_timeout: Duration,

    /// Overall login/handshake timeout.
    pub login_timeout: Duration,

    /// Per-filter-command reply timeout.
    pub command_timeout: Duration,

    /// Read timeout for individual lines.
    pub read_timeout: Duration,

    /// Consecutive read timeouts tolerated before the server is declared
    /// quiet and the connection recycled.
    pub read_retry_budget: u32,

    /// Sleep between read-timeout retries on the same connection.
    pub idle_sleep: Duration,

    /// Pause between connection attempts, so a server rejecting immediately
    /// is not hot-looped against.
    pub retry_pause: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            callsign: "N0CALL".to_string(),
            email: None,
            connect_timeout: Duration::from_secs(30),
            login_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            read_retry_budget: 5,
            idle_sleep: Duration::from_secs(15),
            retry_pause: Duration::from_secs(30),
        }
    }
}

/// Why a stream loop ended without a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamExit {
    /// The read-timeout budget ran out; the server has gone quiet.
    QuietServer,
    /// The process is shutting down.
    Shutdown,
    /// The stream iteration cap was reached.
    IterationCap,
}

/// Long-running cluster client: orchestrator, negotiator, and stream reader.
pub struct ClusterClient {
    config: ClusterConfig,
    parser: LineParser,
    queue: WriteQueue,
    stats: Arc<IngestStats>,
}

impl ClusterClient {
    /// Create a client. The parser (and its resolver) is constructed once at
    /// startup and injected here; nothing is lazily initialized per line.
    pub fn new(
        config: ClusterConfig,
        parser: LineParser,
        queue: WriteQueue,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            config,
            parser,
            queue,
            stats,
        }
    }

    /// Cycle through the server pool until shutdown is signalled.
    ///
    /// The pool is shuffled once per process start (spreading client load
    /// across the volunteer servers), then walked with a monotonically
    /// increasing cursor so behavior within a run is deterministic. Every
    /// failure is logged with the offending address and the cycle moves on;
    /// the loop never terminates on its own.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut servers = self.config.servers.clone();
        if servers.is_empty() {
            error!("no cluster servers configured");
            return;
        }
        servers.shuffle(&mut rand::rng());
        info!("server rotation: {}", servers.join(", "));

        let mut cursor = 0usize;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let addr = &servers[cursor % servers.len()];
            cursor = cursor.wrapping_add(1);

            match self.connect_and_stream(addr, &mut shutdown).await {
                Ok(StreamExit::Shutdown) => break,
                Ok(StreamExit::QuietServer) | Ok(StreamExit::IterationCap) => {
                    self.stats.record_reconnect();
                    info!("[{addr}] connection recycled");
                }
                Err(err) => {
                    self.stats.record_connect_failure();
                    error!("[{addr}] {err:#}");
                }
            }

            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(self.config.retry_pause) => {}
            }
        }
        info!("cluster client stopped");
    }

    /// One full connection attempt: connect, negotiate, stream.
    async fn connect_and_stream(
        &self,
        addr: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<StreamExit> {
        info!("connecting to {addr}");
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .context("connection timeout")?
            .context("failed to connect")?;

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let opts = SessionOptions {
            callsign: self.config.callsign.clone(),
            email: self.config.email.clone(),
            login_timeout: self.config.login_timeout,
            command_timeout: self.config.command_timeout,
        };
        let dialect = session::negotiate(&mut reader, &mut write_half, &opts)
            .await
            .context("login failed")?;
        info!("[{addr}] streaming ({dialect})");

        self.read_stream(&mut reader, shutdown).await
    }

    /// Wait for protocol lines and dispatch them until the server errors,
    /// goes quiet, or shutdown is signalled.
    async fn read_stream<R>(
        &self,
        reader: &mut R,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<StreamExit>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut buf = Vec::with_capacity(256);
        let mut quiet_budget = self.config.read_retry_budget;

        for _ in 0..MAX_STREAM_ITERATIONS {
            if *shutdown.borrow() {
                return Ok(StreamExit::Shutdown);
            }

            let read = tokio::select! {
                _ = shutdown.changed() => return Ok(StreamExit::Shutdown),
                r = timeout(self.config.read_timeout, read_line_lossy(reader, &mut buf)) => r,
            };

            match read {
                Ok(Ok(Some(line))) => {
                    quiet_budget = self.config.read_retry_budget;
                    self.stats.record_bytes(line.len() as u64);
                    self.dispatch_line(&line);
                }
                // EOF is an active failure, unlike a quiet server.
                Ok(Ok(None)) => anyhow::bail!("connection closed by server"),
                Ok(Err(err)) => return Err(err).context("read error"),
                Err(_) => {
                    if quiet_budget == 0 {
                        return Ok(StreamExit::QuietServer);
                    }
                    quiet_budget -= 1;
                    debug!("read timeout, {quiet_budget} retries left");
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(StreamExit::Shutdown),
                        _ = tokio::time::sleep(self.config.idle_sleep) => {}
                    }
                }
            }
        }
        warn!("stream iteration cap reached, recycling connection");
        Ok(StreamExit::IterationCap)
    }

    /// Classify one line and enqueue whatever record it yields.
    ///
    /// Parse and lookup failures are logged with the raw line retained and
    /// then discarded; nothing here may end the session.
    fn dispatch_line(&self, line: &str) {
        match classify(line) {
            LineClass::Spot => match self.parser.parse_spot(line) {
                Ok(spot) => {
                    debug!("{spot}");
                    self.stats.record_spot(&spot);
                    self.queue.enqueue(QueuedWrite::Spot(spot));
                }
                Err(ParseError::UnresolvedCallsign(call)) => {
                    self.stats.record_unresolved();
                    warn!("no DXCC allocation for \"{call}\": {}", line.trim());
                }
                Err(err) => {
                    self.stats.record_parse_failure();
                    warn!("{err}: {}", line.trim());
                }
            },
            LineClass::Wwv => match self.parser.parse_wwv(line) {
                Ok(wwv) => {
                    info!("{wwv}");
                    self.stats.record_wwv();
                    self.queue.enqueue(QueuedWrite::Wwv(wwv));
                }
                Err(err) => {
                    self.stats.record_parse_failure();
                    warn!("{err}: {}", line.trim());
                }
            },
            LineClass::Broadcast => {
                self.stats.record_broadcast();
                info!("{}", line.trim());
            }
            LineClass::Other => {
                self.stats.record_other();
                debug!("{}", line.trim());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dxcc::DxccResolver;
    use crate::queue::write_queue;
    use std::sync::atomic::Ordering;
    use tokio::io::AsyncWriteExt;

    const SAMPLE: &str = "\
K,United States,291,NA,5,8,37.53,-91.67,5.0,AA AB W N;\n\
SP,Poland,269,EU,15,28,52.25,-21.00,-1.0,3Z HF SN SO SQ SR;\n\
UA,European Russia,54,EU,16,29,55.75,-37.62,-3.0,R U RA UI;\n";

    type QueueRx = tokio::sync::mpsc::Receiver<QueuedWrite>;

    /// The receiver is returned so enqueues are not closed-channel drops;
    /// tests observe the pipeline through the stats counters.
    fn make_client(config: ClusterConfig) -> (ClusterClient, Arc<IngestStats>, QueueRx) {
        let stats = Arc::new(IngestStats::new());
        let resolver =
            DxccResolver::from_reader(SAMPLE.as_bytes()).expect("sample table should load");
        let (queue, rx) = write_queue(64, Arc::clone(&stats));
        let client =
            ClusterClient::new(config, LineParser::new(resolver), queue, Arc::clone(&stats));
        (client, stats, rx)
    }

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::default();
        assert_eq!(config.callsign, "N0CALL");
        assert_eq!(config.read_retry_budget, 5);
        assert!(config.servers.is_empty());
    }

    #[test]
    fn test_dispatch_counts_by_class() {
        let (client, stats, _rx) = make_client(ClusterConfig::default());

        client.dispatch_line("DX de SP5NOF:   10136.0  UI5A     FT8 +13dB from KO85   2138Z");
        client.dispatch_line("WWV de W1AW <18Z>: SFI=93, A=4, K=2, No Storms");
        client.dispatch_line("To ALL de K4ZR: good morning");
        client.dispatch_line("random chatter line");
        client.dispatch_line("DX de QQ9QQQ: 14025.0 K1ABC CW 10 dB 1234Z");
        client.dispatch_line("DX de W1AW: garbage frequency 1234Z");

        assert_eq!(stats.spots.load(Ordering::Relaxed), 1);
        assert_eq!(stats.wwv.load(Ordering::Relaxed), 1);
        assert_eq!(stats.broadcast_lines.load(Ordering::Relaxed), 1);
        assert_eq!(stats.other_lines.load(Ordering::Relaxed), 1);
        assert_eq!(stats.unresolved_calls.load(Ordering::Relaxed), 1);
        assert_eq!(stats.parse_failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_read_stream_dispatches_until_eof() {
        let (client, stats, _rx) = make_client(ClusterConfig::default());
        let (tx, rx) = tokio::io::duplex(4096);
        let mut reader = BufReader::new(rx);

        let (_shutdown_tx, mut shutdown) = watch::channel(false);

        let writer = tokio::spawn(async move {
            let mut tx = tx;
            tx.write_all(b"DX de SP5NOF: 10136.0 UI5A FT8 +13dB 2138Z\r\n")
                .await
                .unwrap();
            tx.write_all(b"WWV de W1AW <18Z>: SFI=93, A=4, K=2, quiet\r\n")
                .await
                .unwrap();
            // Dropping tx closes the stream: EOF is a transport failure.
        });

        let result = client.read_stream(&mut reader, &mut shutdown).await;
        writer.await.unwrap();

        assert!(result.is_err());
        assert_eq!(stats.spots.load(Ordering::Relaxed), 1);
        assert_eq!(stats.wwv.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_stream_quiet_server_exits_cleanly() {
        let config = ClusterConfig {
            read_timeout: Duration::from_millis(50),
            read_retry_budget: 2,
            idle_sleep: Duration::from_millis(10),
            ..ClusterConfig::default()
        };
        let (client, stats, _rx) = make_client(config);

        let (_tx, rx) = tokio::io::duplex(64);
        let mut reader = BufReader::new(rx);
        let (_shutdown_tx, mut shutdown) = watch::channel(false);

        let exit = client
            .read_stream(&mut reader, &mut shutdown)
            .await
            .expect("quiet server is a clean exit");
        assert_eq!(exit, StreamExit::QuietServer);
        assert_eq!(stats.spots.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_stream_stops_on_shutdown() {
        let (client, _stats, _rx) = make_client(ClusterConfig::default());
        let (_tx, rx) = tokio::io::duplex(64);
        let mut reader = BufReader::new(rx);

        let (shutdown_tx, mut shutdown) = watch::channel(false);
        shutdown_tx.send(true).unwrap();

        let exit = client
            .read_stream(&mut reader, &mut shutdown)
            .await
            .expect("shutdown is a clean exit");
        assert_eq!(exit, StreamExit::Shutdown);
    }

    #[tokio::test]
    async fn test_orchestrator_keeps_cycling_failing_servers() {
        // Closed local ports refuse immediately; the cycle must keep going
        // until told to stop, trying every address.
        let config = ClusterConfig {
            servers: vec!["127.0.0.1:9".to_string(), "127.0.0.1:19".to_string()],
            connect_timeout: Duration::from_millis(500),
            retry_pause: Duration::ZERO,
            ..ClusterConfig::default()
        };
        let (client, stats, _rx) = make_client(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(client.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("orchestrator must stop on shutdown")
            .unwrap();

        // With a two-entry rotation, >= 4 failures means both addresses
        // were attempted at least once.
        assert!(stats.connect_failures.load(Ordering::Relaxed) >= 4);
    }
}
