//! Wire types and framing for the worker RPC.
//!
//! Workers inherit stdout/stderr so test output interleaves with the main
//! process; the protocol therefore rides a loopback TCP connection instead
//! of stdio. Frames are length-prefixed JSON: `LengthDelimitedCodec` for the
//! prefix, `serde_json` for the payload. The pool sends [`RunRequest`]s; the
//! worker answers with a stream of [`WorkerEvent`]s per request, terminated
//! by `Done` or `Error`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::net::TcpStream;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::snapshot::SnapshotStatus;
use crate::suite::TestOptions;

/// Environment variable carrying the pool's loopback port; its presence
/// switches the harness entry point into worker mode.
pub const WORKER_PORT_ENV: &str = "TACT_WORKER_PORT";
/// Worker index, for log lines.
pub const WORKER_ID_ENV: &str = "TACT_WORKER_ID";

/// The minimal ancestor chain a worker needs to rebuild a test's identity
/// and effective options. Describe nodes are omitted: the worker re-runs the
/// file's registration function and recovers them from there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteSummary {
    pub project: ProjectSummary,
    pub file: FileSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub title: String,
    pub options: TestOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSummary {
    pub title: String,
    /// Resolved loadable path (see [`crate::cache`]).
    pub source: PathBuf,
}

/// The single RPC request kind: run one test attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub test_id: String,
    pub summary: SuiteSummary,
    /// Resolved loadable path of the test file.
    pub source: PathBuf,
    /// Per-call deadline in milliseconds; `0` means none.
    pub timeout_ms: u64,
    /// Default deadline for polling assertions.
    pub expect_timeout_ms: u64,
    pub update_snapshots: bool,
}

/// Events streamed from the worker back to the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Handshake; the first frame a worker sends after connecting.
    Hello { worker_id: usize },
    /// The attempt has begun; `t0_ms` is the authoritative start time as
    /// milliseconds since the Unix epoch.
    Started { t0_ms: u64 },
    /// A snapshot assertion resolved.
    Snapshot { status: SnapshotStatus },
    /// Terminal: the attempt failed.
    Error { message: String, duration_ms: u64 },
    /// Terminal: the attempt succeeded.
    Done { duration_ms: u64 },
}

impl WorkerEvent {
    /// Whether this event ends the current call.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerEvent::Error { .. } | WorkerEvent::Done { .. })
    }
}

/// A framed protocol connection.
pub(crate) type Conn = Framed<TcpStream, LengthDelimitedCodec>;

pub(crate) fn frame(stream: TcpStream) -> Conn {
    Framed::new(stream, LengthDelimitedCodec::new())
}

/// Sends one message as a length-prefixed JSON frame.
pub(crate) async fn send<T: Serialize>(conn: &mut Conn, message: &T) -> Result<()> {
    let payload = serde_json::to_vec(message).context("failed to encode protocol frame")?;
    conn.send(Bytes::from(payload)).await.context("failed to send protocol frame")?;
    Ok(())
}

/// Receives one message; `None` means the peer closed the stream.
pub(crate) async fn recv<T: DeserializeOwned>(conn: &mut Conn) -> Result<Option<T>> {
    match conn.next().await {
        None => Ok(None),
        Some(frame) => {
            let bytes = frame.context("protocol stream error")?;
            let message =
                serde_json::from_slice(&bytes).context("failed to decode protocol frame")?;
            Ok(Some(message))
        }
    }
}
