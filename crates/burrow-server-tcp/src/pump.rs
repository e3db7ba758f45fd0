//! Byte pumps splicing a public client to its agent connection

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

static NEXT_LEG_ID: AtomicU64 = AtomicU64::new(1);

/// Why a pump stopped
#[derive(Debug)]
pub enum PumpOutcome {
    /// The source reached end of stream
    Eof,
    /// The pair was closed by the sibling pump or by the tunnel
    Cancelled,
    /// Reading or writing failed
    Failed(io::Error),
}

/// One-directional copy loop from `reader` into `writer`.
///
/// Whatever ends the loop, the pump cancels its pair token on the way out
/// so the opposite direction stops too.
pub struct BytePump<R, W> {
    reader: R,
    writer: W,
    buffer_size: usize,
    cancel: CancellationToken,
}

impl<R, W> BytePump<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, buffer_size: usize, cancel: CancellationToken) -> Self {
        Self {
            reader,
            writer,
            buffer_size,
            cancel,
        }
    }

    /// Run until EOF, failure or cancellation. Returns the bytes forwarded.
    pub async fn run(self) -> (PumpOutcome, u64) {
        let BytePump {
            mut reader,
            mut writer,
            buffer_size,
            cancel,
        } = self;

        let mut buffer = vec![0u8; buffer_size.max(1)];
        let mut forwarded = 0u64;

        let outcome = loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => break PumpOutcome::Cancelled,
                res = reader.read(&mut buffer) => match res {
                    Ok(0) => break PumpOutcome::Eof,
                    Ok(n) => n,
                    Err(e) => break PumpOutcome::Failed(e),
                },
            };

            let written = tokio::select! {
                _ = cancel.cancelled() => break PumpOutcome::Cancelled,
                res = async {
                    writer.write_all(&buffer[..n]).await?;
                    writer.flush().await
                } => res,
            };
            if let Err(e) = written {
                break PumpOutcome::Failed(e);
            }
            forwarded += n as u64;
        };

        cancel.cancel();
        let _ = writer.shutdown().await;

        (outcome, forwarded)
    }
}

/// Handle on the two pumps serving one public connection
#[derive(Debug, Clone)]
pub struct LegPair {
    id: u64,
    peer_address: String,
    cancel: CancellationToken,
}

impl LegPair {
    pub fn new(peer_address: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            id: NEXT_LEG_ID.fetch_add(1, Ordering::Relaxed),
            peer_address: peer_address.into(),
            cancel,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    /// Stop both directions. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Bytes moved by a finished pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairSummary {
    pub client_to_agent: u64,
    pub agent_to_client: u64,
}

/// Splice `client` and `agent` until either side ends or `leg` is closed.
///
/// Spawns one task per direction and resolves once both have stopped, at
/// which point every half of both sockets has been dropped.
pub async fn run_leg_pair(
    client: TcpStream,
    agent: TcpStream,
    buffer_size: usize,
    leg: &LegPair,
) -> PairSummary {
    let (client_read, client_write) = client.into_split();
    let (agent_read, agent_write) = agent.into_split();

    let upstream = tokio::spawn(
        BytePump::new(client_read, agent_write, buffer_size, leg.cancel.clone()).run(),
    );
    let downstream = tokio::spawn(
        BytePump::new(agent_read, client_write, buffer_size, leg.cancel.clone()).run(),
    );

    let (upstream, downstream) = tokio::join!(upstream, downstream);
    leg.close();

    let mut summary = PairSummary::default();
    match upstream {
        Ok((outcome, bytes)) => {
            debug!(
                "Client->agent pump for {} (leg {}) ended: {:?}, {} bytes",
                leg.peer_address, leg.id, outcome, bytes
            );
            summary.client_to_agent = bytes;
        }
        Err(e) => debug!("Client->agent pump for leg {} panicked: {}", leg.id, e),
    }
    match downstream {
        Ok((outcome, bytes)) => {
            debug!(
                "Agent->client pump for {} (leg {}) ended: {:?}, {} bytes",
                leg.peer_address, leg.id, outcome, bytes
            );
            summary.agent_to_client = bytes;
        }
        Err(e) => debug!("Agent->client pump for leg {} panicked: {}", leg.id, e),
    }

    summary
}
