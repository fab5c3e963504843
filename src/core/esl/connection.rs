//! A single authenticated event-socket connection.
//!
//! `EslConnection::open` performs the blocking part of the protocol (TCP
//! connect, `auth/request` handshake, event subscription) inline so the
//! caller gets a definite `TransportError` / `AuthenticationFailed` within
//! the connect timeout. The connection then runs as one task owning the
//! socket: outgoing commands are funneled through an mpsc channel and
//! replies are matched FIFO, which is how the switch orders them.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::SwitchEndpoint;

use super::error::{EslError, EslResult};
use super::event::{
    CONTENT_API_RESPONSE, CONTENT_AUTH_REQUEST, CONTENT_COMMAND_REPLY, CONTENT_DISCONNECT,
    CONTENT_EVENT_PLAIN, CommandReply, EslCommand, EslEvent, EslFrame, decode_frame,
};

/// Call lifecycle events the bridge subscribes to.
pub const SUBSCRIBED_EVENTS: &[&str] = &[
    "CHANNEL_CREATE",
    "CHANNEL_ANSWER",
    "CHANNEL_EXECUTE_COMPLETE",
    "CHANNEL_HANGUP",
];

pub struct PendingCommand {
    pub command: EslCommand,
    pub reply_tx: oneshot::Sender<EslResult<CommandReply>>,
}

/// Handle to a live connection task.
pub struct EslConnection {
    cmd_tx: mpsc::Sender<PendingCommand>,
    shutdown_tx: broadcast::Sender<()>,
    closed_rx: watch::Receiver<bool>,
}

impl EslConnection {
    /// Connect, authenticate and subscribe within `connect_timeout`.
    ///
    /// Decoded call events are pushed into `event_tx`; the manager routes
    /// them to sessions.
    pub async fn open(
        endpoint: &SwitchEndpoint,
        event_tx: mpsc::Sender<EslEvent>,
        connect_timeout: Duration,
    ) -> EslResult<Self> {
        let address = format!("{}:{}", endpoint.host, endpoint.port);
        let handshake = async {
            let mut stream = TcpStream::connect(&address)
                .await
                .map_err(|e| EslError::Transport(format!("connect {address}: {e}")))?;
            let mut buf = BytesMut::with_capacity(8 * 1024);

            let frame = read_frame(&mut stream, &mut buf).await?;
            if frame.content_type() != CONTENT_AUTH_REQUEST {
                return Err(EslError::Protocol(format!(
                    "expected auth/request, got {}",
                    frame.content_type()
                )));
            }

            let auth = EslCommand::Auth {
                password: endpoint.password.clone(),
            };
            stream
                .write_all(auth.to_wire().as_bytes())
                .await
                .map_err(|e| EslError::Transport(e.to_string()))?;
            let reply = CommandReply::from_frame(&read_frame(&mut stream, &mut buf).await?);
            if !reply.ok {
                return Err(EslError::AuthenticationFailed(reply.text));
            }

            let subscribe = EslCommand::Subscribe {
                events: SUBSCRIBED_EVENTS.to_vec(),
            };
            stream
                .write_all(subscribe.to_wire().as_bytes())
                .await
                .map_err(|e| EslError::Transport(e.to_string()))?;
            let reply = CommandReply::from_frame(&read_frame(&mut stream, &mut buf).await?);
            if !reply.ok {
                return Err(EslError::Protocol(format!(
                    "event subscription rejected: {}",
                    reply.text
                )));
            }

            Ok((stream, buf))
        };

        let (stream, buf) = tokio::time::timeout(connect_timeout, handshake)
            .await
            .map_err(|_| {
                EslError::Transport(format!("handshake timed out after {connect_timeout:?}"))
            })??;

        info!(instance = %endpoint.instance_id, %address, "event socket connected");

        let (cmd_tx, cmd_rx) = mpsc::channel::<PendingCommand>(64);
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let (closed_tx, closed_rx) = watch::channel(false);

        let (read_half, write_half) = stream.into_split();
        let instance = endpoint.instance_id.clone();
        tokio::spawn(async move {
            run_io(
                instance, read_half, write_half, buf, cmd_rx, event_tx, shutdown_rx,
            )
            .await;
            let _ = closed_tx.send(true);
        });

        Ok(Self {
            cmd_tx,
            shutdown_tx,
            closed_rx,
        })
    }

    /// Submit a command; the reply future resolves when the switch answers.
    pub async fn submit(&self, command: EslCommand) -> EslResult<oneshot::Receiver<EslResult<CommandReply>>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(PendingCommand { command, reply_tx })
            .await
            .map_err(|_| EslError::ConnectionLost)?;
        Ok(reply_rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Resolves when the io task exits for any reason.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn read_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> EslResult<EslFrame> {
    loop {
        if let Some((frame, used)) = decode_frame(buf)? {
            let _ = buf.split_to(used);
            return Ok(frame);
        }
        let n = stream
            .read_buf(buf)
            .await
            .map_err(|e| EslError::Transport(e.to_string()))?;
        if n == 0 {
            return Err(EslError::ConnectionLost);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_io(
    instance: String,
    mut read_half: OwnedReadHalf,
    mut write_half: OwnedWriteHalf,
    mut buf: BytesMut,
    mut cmd_rx: mpsc::Receiver<PendingCommand>,
    event_tx: mpsc::Sender<EslEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    // Replies are matched to commands in submission order.
    let mut pending: VecDeque<oneshot::Sender<EslResult<CommandReply>>> = VecDeque::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                debug!(%instance, "event socket shutdown requested");
                break;
            }

            cmd = cmd_rx.recv() => {
                let Some(PendingCommand { command, reply_tx }) = cmd else { break };
                match write_half.write_all(command.to_wire().as_bytes()).await {
                    Ok(()) => pending.push_back(reply_tx),
                    Err(e) => {
                        warn!(%instance, error = %e, "write failed, dropping connection");
                        let _ = reply_tx.send(Err(EslError::ConnectionLost));
                        break;
                    }
                }
            }

            read = read_half.read_buf(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!(%instance, "event socket closed by peer");
                        break;
                    }
                    Ok(_) => {
                        if !drain_frames(&instance, &mut buf, &mut pending, &event_tx).await {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(%instance, error = %e, "event socket read error");
                        break;
                    }
                }
            }
        }
    }

    for reply_tx in pending {
        let _ = reply_tx.send(Err(EslError::ConnectionLost));
    }
}

/// Dispatch every complete frame in the buffer. Returns false when the
/// switch announced a disconnect.
async fn drain_frames(
    instance: &str,
    buf: &mut BytesMut,
    pending: &mut VecDeque<oneshot::Sender<EslResult<CommandReply>>>,
    event_tx: &mpsc::Sender<EslEvent>,
) -> bool {
    loop {
        let frame = match decode_frame(buf) {
            Ok(Some((frame, used))) => {
                let _ = buf.split_to(used);
                frame
            }
            Ok(None) => return true,
            Err(e) => {
                warn!(%instance, error = %e, "undecodable frame, dropping connection");
                return false;
            }
        };

        match frame.content_type() {
            CONTENT_COMMAND_REPLY | CONTENT_API_RESPONSE => {
                let reply = CommandReply::from_frame(&frame);
                match pending.pop_front() {
                    Some(reply_tx) => {
                        let _ = reply_tx.send(Ok(reply));
                    }
                    None => warn!(%instance, "unsolicited reply: {}", reply.text),
                }
            }
            CONTENT_EVENT_PLAIN => {
                let Some(body) = frame.body.as_deref() else {
                    warn!(%instance, "event frame without body");
                    continue;
                };
                match EslEvent::from_plain_body(body) {
                    Ok(event) => {
                        if event_tx.send(event).await.is_err() {
                            return false;
                        }
                    }
                    Err(e) => warn!(%instance, error = %e, "unparseable event"),
                }
            }
            CONTENT_DISCONNECT => {
                info!(%instance, "switch sent disconnect notice");
                return false;
            }
            other => debug!(%instance, "ignoring frame type {other}"),
        }
    }
}
