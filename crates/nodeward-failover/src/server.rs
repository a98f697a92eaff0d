use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::controller::{FailoverController, FailoverError, FailoverOutcome};
use crate::event::TerminationEvent;

/// Longest event line accepted from a peer. EventBridge payloads are a few KiB.
pub const MAX_EVENT_LINE: usize = 64 * 1024;

/// One reply line per event line.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Ok {
        ok: bool,
        #[serde(flatten)]
        outcome: FailoverOutcome,
    },
    Err {
        ok: bool,
        error: &'static str,
        message: String,
    },
}

impl Reply {
    pub fn from_result(result: &Result<FailoverOutcome, FailoverError>) -> Self {
        match result {
            Ok(outcome) => Self::Ok {
                ok: true,
                outcome: outcome.clone(),
            },
            Err(e) => Self::Err {
                ok: false,
                error: match e {
                    FailoverError::NoHealthyCandidate { .. } => "no_healthy_candidate",
                    FailoverError::Provider(_) => "provider",
                    FailoverError::InvalidEvent(_) => "invalid_event",
                },
                message: e.to_string(),
            },
        }
    }
}

/// Listen on `addr` until ctrl-c.
pub async fn serve(controller: FailoverController, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind failover listener on {}", addr))?;
    info!(listen = %addr, "Failover listener started");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(serve_until(listener, controller, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .with_context(|| "Failed to listen for ctrl-c")?;
    info!("Shutdown signal received, stopping failover listener");
    let _ = shutdown_tx.send(true);
    let _ = handle.await;

    info!("Failover listener stopped");
    Ok(())
}

/// Accept connections until `shutdown` flips, one task per connection.
pub async fn serve_until(
    listener: TcpListener,
    controller: FailoverController,
    mut shutdown: watch::Receiver<bool>,
) {
    let controller = Arc::new(controller);
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let controller = Arc::clone(&controller);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, &controller).await {
                                warn!(peer = %peer, error = %e, "Connection handler error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                    }
                }
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    controller: &FailoverController,
) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = (&mut reader)
            .take(MAX_EVENT_LINE as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Ok(());
        }
        if buf.len() > MAX_EVENT_LINE && buf.last() != Some(&b'\n') {
            warn!(peer = %peer, limit = MAX_EVENT_LINE, "Event line too long, closing connection");
            let result = Err(FailoverError::InvalidEvent(format!(
                "event line exceeds {} bytes",
                MAX_EVENT_LINE
            )));
            write_reply(&mut write, &result).await?;
            return Ok(());
        }

        let line = String::from_utf8_lossy(&buf);
        if line.trim().is_empty() {
            continue;
        }
        let result = match TerminationEvent::parse(&line) {
            Ok(event) => {
                info!(peer = %peer, instance = %event.terminated_instance_id, "Termination event received");
                controller.handle(&event).await
            }
            Err(e) => Err(e),
        };
        write_reply(&mut write, &result).await?;
    }
}

async fn write_reply(
    write: &mut tokio::net::tcp::OwnedWriteHalf,
    result: &Result<FailoverOutcome, FailoverError>,
) -> Result<()> {
    let mut reply = serde_json::to_string(&Reply::from_result(result))?;
    reply.push('\n');
    write.write_all(reply.as_bytes()).await?;
    Ok(())
}
