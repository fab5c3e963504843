//! Streaming speech recognition client.
//!
//! Speaks the FunASR-style WebSocket protocol: binary PCM frames go out,
//! JSON results come back as `{"text": ..., "is_final": ...}`. One stream
//! per call leg; the pipeline owns the stream for the life of the call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

use crate::core::backoff::BackoffPolicy;

use super::BackendError;

/// One recognition result. Partials stream continuously; exactly one
/// final closes each utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptFragment {
    pub text: String,
    pub is_final: bool,
}

/// Live recognition stream: audio in, fragments (or a terminal error) out.
pub struct RecognitionStream {
    pub audio_tx: mpsc::Sender<Bytes>,
    pub updates_rx: mpsc::Receiver<Result<TranscriptFragment, BackendError>>,
}

#[async_trait]
pub trait RecognitionClient: Send + Sync {
    async fn start_stream(&self) -> Result<RecognitionStream, BackendError>;
}

#[derive(Debug, Deserialize)]
struct AsrMessage {
    #[serde(default)]
    text: String,
    #[serde(default)]
    is_final: bool,
}

/// WebSocket recognition client.
pub struct FunAsrRecognition {
    ws_url: String,
    connect_timeout: Duration,
    backoff: BackoffPolicy,
}

impl FunAsrRecognition {
    pub fn new(ws_url: impl Into<String>, connect_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            ws_url: ws_url.into(),
            connect_timeout,
            backoff: BackoffPolicy::backend(),
        })
    }

    async fn connect(
        &self,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        BackendError,
    > {
        let connect = connect_async(self.ws_url.as_str());
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Err(_) => Err(BackendError::Timeout(format!(
                "recognition connect to {}",
                self.ws_url
            ))),
            Ok(Err(e)) => Err(BackendError::Unavailable(format!(
                "recognition connect to {}: {e}",
                self.ws_url
            ))),
            Ok(Ok((ws, _))) => Ok(ws),
        }
    }
}

#[async_trait]
impl RecognitionClient for FunAsrRecognition {
    async fn start_stream(&self) -> Result<RecognitionStream, BackendError> {
        let ws = self.connect().await?;
        info!(url = %self.ws_url, "recognition stream connected");

        let (audio_tx, mut audio_rx) = mpsc::channel::<Bytes>(64);
        let (updates_tx, updates_rx) = mpsc::channel::<Result<TranscriptFragment, BackendError>>(64);

        let client = FunAsrRecognition {
            ws_url: self.ws_url.clone(),
            connect_timeout: self.connect_timeout,
            backoff: self.backoff.clone(),
        };

        tokio::spawn(async move {
            let mut ws = ws;
            'stream: loop {
                let (mut sink, mut source) = ws.split();
                let reason: BackendError = loop {
                    tokio::select! {
                        audio = audio_rx.recv() => {
                            match audio {
                                Some(frame) => {
                                    if let Err(e) = sink.send(Message::Binary(frame.to_vec().into())).await {
                                        break BackendError::Unavailable(format!("recognition send: {e}"));
                                    }
                                }
                                // Pipeline dropped the stream: call over.
                                None => break 'stream,
                            }
                        }
                        message = source.next() => {
                            match message {
                                Some(Ok(Message::Text(text))) => {
                                    match serde_json::from_str::<AsrMessage>(&text) {
                                        Ok(msg) => {
                                            let fragment = TranscriptFragment {
                                                text: msg.text,
                                                is_final: msg.is_final,
                                            };
                                            if updates_tx.send(Ok(fragment)).await.is_err() {
                                                break 'stream;
                                            }
                                        }
                                        Err(e) => warn!(error = %e, "unparseable recognition message"),
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    break BackendError::Unavailable("recognition stream closed".to_string());
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    break BackendError::Failed(format!("recognition socket: {e}"));
                                }
                            }
                        }
                    }
                };

                // Reconnect with bounded backoff; frames sent meanwhile are
                // lost, which recognition tolerates.
                warn!(error = %reason, "recognition stream dropped, reconnecting");
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    let Some(delay) = client.backoff.delay(attempt) else {
                        let _ = updates_tx.send(Err(reason.clone())).await;
                        break 'stream;
                    };
                    tokio::time::sleep(delay).await;
                    match client.connect().await {
                        Ok(reconnected) => {
                            info!(attempt, "recognition stream reconnected");
                            ws = reconnected;
                            continue 'stream;
                        }
                        Err(e) => {
                            debug!(attempt, error = %e, "recognition reconnect failed");
                        }
                    }
                }
            }
        });

        Ok(RecognitionStream {
            audio_tx,
            updates_rx,
        })
    }
}
