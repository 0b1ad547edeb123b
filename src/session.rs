//! Login negotiation against heterogeneous cluster server dialects.
//!
//! Cluster servers are operated by independent volunteers running
//! incompatible software. The negotiator probes the connection banner to
//! detect the dialect, sends the operator callsign when prompted, waits for
//! the `<call> de <server>` acknowledgement, and then issues the dialect's
//! filter command sequence. Servers that ignore a filter command are
//! tolerated; servers that reject the callsign are not.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

/// Server software family, detected from the connection banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// CC Cluster (VE7CC lineage).
    CcCluster,
    /// AR-Cluster (AB5K lineage).
    ArCluster,
    /// DXSpider.
    DxSpider,
    /// Banner matched no known family.
    Unknown,
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::CcCluster => write!(f, "CC-Cluster"),
            Dialect::ArCluster => write!(f, "AR-Cluster"),
            Dialect::DxSpider => write!(f, "DXSpider"),
            Dialect::Unknown => write!(f, "unknown"),
        }
    }
}

fn contains_ignore_case(line: &str, needle: &str) -> bool {
    line.to_ascii_uppercase().contains(&needle.to_ascii_uppercase())
}

impl Dialect {
    /// Match a banner or MOTD line against the known software families.
    fn from_banner(line: &str) -> Option<Dialect> {
        if contains_ignore_case(line, "CC Cluster") || contains_ignore_case(line, "CC-Cluster") {
            Some(Dialect::CcCluster)
        } else if contains_ignore_case(line, "AR-Cluster") {
            Some(Dialect::ArCluster)
        } else if contains_ignore_case(line, "DXSpider") || contains_ignore_case(line, "DX Spider")
        {
            Some(Dialect::DxSpider)
        } else {
            None
        }
    }

    /// The filter command sequence for this dialect.
    ///
    /// The unknown dialect gets the one legacy command every server family
    /// understands.
    pub fn filter_commands(self, email: Option<&str>) -> Vec<String> {
        match self {
            Dialect::CcCluster => ["SET/WWV", "SET/FT4", "SET/FT8", "SET/PSK", "SET/RTTY", "SET/SKIMMER"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            Dialect::ArCluster => ["SET/WWV", "SET/FT4", "SET/FT8", "SET/SKIMMER", "SET/NOBEACON"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            Dialect::DxSpider => {
                let mut commands = vec![
                    "set/dx/filter".to_string(),
                    "set/wwv/output on".to_string(),
                ];
                if let Some(email) = email {
                    commands.push(format!("set/email {email}"));
                }
                commands
            }
            Dialect::Unknown => vec!["Set Dx Filter".to_string()],
        }
    }
}

/// Errors ending a login attempt. All are session-fatal: the orchestrator
/// logs them and moves to the next server.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The server refused the configured callsign. Distinct from a timeout
    /// so operators can tell a bad configuration from a dead server.
    #[error("login rejected by server: {0}")]
    LoginRejected(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("connection closed during login")]
    ConnectionClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Knobs for one login attempt.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Operator callsign sent at the login prompt.
    pub callsign: String,

    /// Contact email, used by dialects whose command set carries one.
    pub email: Option<String>,

    /// Overall deadline for banner + login acknowledgement.
    pub login_timeout: Duration,

    /// Per-filter-command reply timeout; a miss is a warning, not an error.
    pub command_timeout: Duration,
}

/// Read one newline-terminated line, replacing invalid byte sequences
/// rather than failing; the telnet stream is not guaranteed clean UTF-8.
///
/// Returns `None` on EOF.
pub(crate) async fn read_line_lossy<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = reader.read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf);
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn read_line_deadline<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    deadline: Instant,
    waiting_for: &'static str,
) -> Result<String, SessionError>
where
    R: AsyncBufRead + Unpin,
{
    match timeout_at(deadline, read_line_lossy(reader, buf)).await {
        Ok(Ok(Some(line))) => Ok(line),
        Ok(Ok(None)) => Err(SessionError::ConnectionClosed),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(SessionError::Timeout(waiting_for)),
    }
}

/// A line prompting for the operator callsign.
fn is_login_prompt(line: &str) -> bool {
    contains_ignore_case(line, "enter your call")
        || contains_ignore_case(line, "login:")
        || contains_ignore_case(line, "callsign:")
}

/// The `<call> de <server>` echo confirming the login.
fn is_login_ack(line: &str, callsign: &str) -> bool {
    let line = line.trim().to_ascii_uppercase();
    let expected = format!("{} DE ", callsign.to_ascii_uppercase());
    line.starts_with(&expected)
}

/// A reply telling us the callsign was refused.
fn is_rejection(line: &str) -> bool {
    ["invalid callsign", "not a valid", "not allowed", "access denied", "sorry"]
        .iter()
        .any(|needle| contains_ignore_case(line, needle))
}

/// Drive the login state machine over one fresh connection.
///
/// On success the connection is streaming and the detected dialect is
/// returned; the caller hands the reader to the stream loop.
pub async fn negotiate<R, W>(
    reader: &mut R,
    writer: &mut W,
    opts: &SessionOptions,
) -> Result<Dialect, SessionError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    let deadline = Instant::now() + opts.login_timeout;
    let mut dialect = Dialect::Unknown;

    // Banner phase: scan lines until the login prompt shows up.
    loop {
        let line = read_line_deadline(reader, &mut buf, deadline, "login prompt").await?;
        if let Some(detected) = Dialect::from_banner(&line) {
            debug!("banner identifies {detected}: {}", line.trim());
            dialect = detected;
        }
        if is_login_prompt(&line) {
            break;
        }
    }

    debug!("sending callsign {}", opts.callsign);
    writer
        .write_all(format!("{}\n", opts.callsign).as_bytes())
        .await?;
    writer.flush().await?;

    // Acknowledgement phase: servers echo "<call> de <server>" on success.
    loop {
        let line = read_line_deadline(reader, &mut buf, deadline, "login acknowledgement").await?;
        if let Some(detected) = Dialect::from_banner(&line) {
            dialect = detected;
        }
        if is_rejection(&line) {
            return Err(SessionError::LoginRejected(line.trim().to_string()));
        }
        if is_login_ack(&line, &opts.callsign) {
            break;
        }
    }
    info!("logged in as {} ({dialect})", opts.callsign);

    // Filter phase: commands are best-effort; not every server supports
    // every command, so a missing reply is only a warning.
    for command in dialect.filter_commands(opts.email.as_deref()) {
        writer.write_all(format!("{command}\n").as_bytes()).await?;
        writer.flush().await?;
        match timeout(opts.command_timeout, read_line_lossy(reader, &mut buf)).await {
            Ok(Ok(Some(reply))) => debug!("\"{command}\" -> {}", reply.trim()),
            Ok(Ok(None)) => return Err(SessionError::ConnectionClosed),
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => warn!("no reply to \"{command}\""),
        }
    }

    Ok(dialect)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader, duplex, split};
    use tokio::sync::oneshot;

    fn options() -> SessionOptions {
        SessionOptions {
            callsign: "W1AW".to_string(),
            email: None,
            login_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
        }
    }

    /// Simulate a server: banner lines, callsign prompt, acknowledgement (or
    /// rejection), then echo replies while collecting received commands.
    fn spawn_server(
        stream: tokio::io::DuplexStream,
        banner: &'static [&'static str],
        ack: fn(&str) -> String,
    ) -> oneshot::Receiver<Vec<String>> {
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (read_half, mut write_half) = split(stream);
            let mut lines = BufReader::new(read_half).lines();

            for line in banner {
                write_half
                    .write_all(format!("{line}\n").as_bytes())
                    .await
                    .unwrap();
            }
            write_half
                .write_all(b"Please enter your call:\n")
                .await
                .unwrap();

            let call = lines.next_line().await.unwrap().unwrap_or_default();
            write_half
                .write_all(format!("{}\n", ack(&call)).as_bytes())
                .await
                .unwrap();

            let mut commands = vec![call];
            while let Ok(Some(line)) = lines.next_line().await {
                commands.push(line);
                if write_half.write_all(b"ok\n").await.is_err() {
                    break;
                }
            }
            let _ = done_tx.send(commands);
        });
        done_rx
    }

    async fn run_client(
        stream: tokio::io::DuplexStream,
        opts: &SessionOptions,
    ) -> Result<Dialect, SessionError> {
        let (read_half, mut write_half) = split(stream);
        let mut reader = BufReader::new(read_half);
        let result = negotiate(&mut reader, &mut write_half, opts).await;
        drop(reader);
        drop(write_half);
        result
    }

    #[tokio::test]
    async fn test_cc_cluster_dialect_and_commands() {
        let (client, server) = duplex(4096);
        let commands = spawn_server(
            server,
            &["Welcome to the NC7J CC Cluster node"],
            |call| format!("{call} de NC7J 7-Aug-2026 1830Z >"),
        );

        let dialect = run_client(client, &options()).await.expect("login");
        assert_eq!(dialect, Dialect::CcCluster);

        let commands = commands.await.unwrap();
        assert_eq!(commands[0], "W1AW");
        assert_eq!(
            commands[1..],
            Dialect::CcCluster.filter_commands(None)[..]
        );
    }

    #[tokio::test]
    async fn test_ar_cluster_dialect_and_commands() {
        let (client, server) = duplex(4096);
        let commands = spawn_server(
            server,
            &["Welcome to the W3LPL AR-Cluster node, Telnet Access Port"],
            |call| format!("{call} de W3LPL 7-Aug-2026 1830Z >"),
        );

        let dialect = run_client(client, &options()).await.expect("login");
        assert_eq!(dialect, Dialect::ArCluster);

        let commands = commands.await.unwrap();
        assert_eq!(
            commands[1..],
            Dialect::ArCluster.filter_commands(None)[..]
        );
    }

    #[tokio::test]
    async fn test_dxspider_rejection() {
        let (client, server) = duplex(4096);
        let _commands = spawn_server(
            server,
            &["Hello, this is GB7MBC DXSpider V1.57"],
            |_call| "Sorry, you are not allowed on this node".to_string(),
        );

        let err = run_client(client, &options()).await.unwrap_err();
        assert!(matches!(err, SessionError::LoginRejected(_)));
    }

    #[tokio::test]
    async fn test_dxspider_email_command() {
        let (client, server) = duplex(4096);
        let commands = spawn_server(
            server,
            &["Hello, this is GB7MBC running DXSpider V1.57"],
            |call| format!("{call} de GB7MBC 7-Aug-2026 1830Z dxspider >"),
        );

        let mut opts = options();
        opts.email = Some("op@example.net".to_string());
        let dialect = run_client(client, &opts).await.expect("login");
        assert_eq!(dialect, Dialect::DxSpider);

        let commands = commands.await.unwrap();
        assert!(commands.contains(&"set/email op@example.net".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_dialect_uses_legacy_command() {
        let (client, server) = duplex(4096);
        let commands = spawn_server(server, &["Some homebrew cluster node"], |call| {
            format!("{call} de HOMEBREW >")
        });

        let dialect = run_client(client, &options()).await.expect("login");
        assert_eq!(dialect, Dialect::Unknown);

        let commands = commands.await.unwrap();
        assert_eq!(commands[1..], ["Set Dx Filter".to_string()][..]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_timeout_is_not_a_rejection() {
        let (client, server) = duplex(4096);
        // A server that says nothing at all.
        let _hold = server;

        let mut opts = options();
        opts.login_timeout = Duration::from_millis(100);
        let err = run_client(client, &opts).await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_closed_connection_during_login() {
        let (client, server) = duplex(4096);
        drop(server);

        let err = run_client(client, &options()).await.unwrap_err();
        assert!(matches!(err, SessionError::ConnectionClosed));
    }
}
