//! Speech synthesis client.
//!
//! Synthesized audio is spooled to disk and handed to the switch as a
//! playable file reference; the switch streams it to the leg.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::BackendError;

/// A switch-resolvable reference to synthesized audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioRef(pub String);

impl AudioRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
pub trait SynthesisClient: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<AudioRef, BackendError>;
}

/// HTTP synthesis client posting text, receiving audio bytes.
pub struct HttpSynthesis {
    client: reqwest::Client,
    api_url: String,
    voice: String,
    spool_dir: PathBuf,
    timeout: Duration,
}

impl HttpSynthesis {
    pub fn new(
        api_url: impl Into<String>,
        voice: impl Into<String>,
        spool_dir: PathBuf,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            voice: voice.into(),
            spool_dir,
            timeout,
        })
    }

    async fn fetch_audio(&self, text: &str) -> Result<AudioRef, BackendError> {
        let payload = json!({
            "text": text,
            "voice": self.voice,
            "format": "wav",
        });

        let response = self
            .client
            .post(&self.api_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(format!("synthesis request: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(BackendError::Failed(format!("synthesis returned {status}")));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| BackendError::Failed(format!("synthesis body: {e}")))?;
        if audio.is_empty() {
            return Err(BackendError::Failed("synthesis returned no audio".to_string()));
        }

        tokio::fs::create_dir_all(&self.spool_dir)
            .await
            .map_err(|e| BackendError::Failed(format!("spool dir: {e}")))?;
        let path = self.spool_dir.join(format!("{}.wav", uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| BackendError::Failed(format!("spool file: {e}")))?;
        file.write_all(&audio)
            .await
            .map_err(|e| BackendError::Failed(format!("spool write: {e}")))?;

        debug!(bytes = audio.len(), path = %path.display(), "synthesized utterance spooled");
        Ok(AudioRef(path.to_string_lossy().into_owned()))
    }
}

#[async_trait]
impl SynthesisClient for HttpSynthesis {
    async fn synthesize(&self, text: &str) -> Result<AudioRef, BackendError> {
        match tokio::time::timeout(self.timeout, self.fetch_audio(text)).await {
            Err(_) => Err(BackendError::Timeout(format!(
                "synthesis exceeded {:?}",
                self.timeout
            ))),
            Ok(result) => result,
        }
    }
}
