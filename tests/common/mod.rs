//! Shared scripted backends for integration tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use parla::core::backends::{
    AudioRef, BackendError, ChatTurn, ReasoningClient, RecognitionClient, RecognitionStream,
    SynthesisClient, TranscriptFragment,
};
use parla::core::esl::{EslError, EslResult, SwitchControl};
use parla::core::scenario::{ScenarioConfig, ScenarioRecord};
use parla::core::session::{CallRecordSink, CallReport, SessionEvent, SessionRegistry};

/// Switch double: records commands, scripts originate outcomes, and can
/// simulate the far end answering and hanging up.
pub struct MockSwitch {
    pub plays_tx: mpsc::UnboundedSender<String>,
    pub stops: AtomicU32,
    pub hangups: AtomicU32,
    /// Per-destination originate attempt counter.
    attempts: parking_lot::Mutex<HashMap<String, u32>>,
    /// Destinations fail this many originate attempts before succeeding.
    pub originate_failures: u32,
    pub originate_error: String,
    /// When set, a successful originate simulates answer + hangup so the
    /// launched session completes.
    pub registry: parking_lot::Mutex<Option<Arc<SessionRegistry>>>,
}

impl MockSwitch {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (plays_tx, plays_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                plays_tx,
                stops: AtomicU32::new(0),
                hangups: AtomicU32::new(0),
                attempts: parking_lot::Mutex::new(HashMap::new()),
                originate_failures: 0,
                originate_error: "-ERR NO_ANSWER".to_string(),
                registry: parking_lot::Mutex::new(None),
            }),
            plays_rx,
        )
    }

    pub fn with_originate_failures(
        failures: u32,
        error: &str,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (plays_tx, plays_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                plays_tx,
                stops: AtomicU32::new(0),
                hangups: AtomicU32::new(0),
                attempts: parking_lot::Mutex::new(HashMap::new()),
                originate_failures: failures,
                originate_error: error.to_string(),
                registry: parking_lot::Mutex::new(None),
            }),
            plays_rx,
        )
    }

    fn leg_from_dial_string(dial_string: &str) -> Option<String> {
        let vars = dial_string.strip_prefix('{')?;
        let vars = &vars[..vars.find('}')?];
        vars.split(',')
            .find_map(|pair| pair.strip_prefix("origination_uuid="))
            .map(str::to_string)
    }

    fn destination(dial_string: &str) -> String {
        dial_string
            .rsplit('/')
            .next()
            .unwrap_or(dial_string)
            .to_string()
    }
}

#[async_trait]
impl SwitchControl for MockSwitch {
    async fn answer(&self, _leg_id: &str) -> EslResult<()> {
        Ok(())
    }

    async fn play(&self, _leg_id: &str, audio_ref: &str) -> EslResult<()> {
        let _ = self.plays_tx.send(audio_ref.to_string());
        Ok(())
    }

    async fn stop_play(&self, _leg_id: &str) -> EslResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn hangup(&self, _leg_id: &str) -> EslResult<()> {
        self.hangups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn originate(&self, dial_string: &str, _park_target: &str) -> EslResult<String> {
        let destination = Self::destination(dial_string);
        let attempt = {
            let mut attempts = self.attempts.lock();
            let counter = attempts.entry(destination).or_insert(0);
            *counter += 1;
            *counter
        };
        if attempt <= self.originate_failures {
            return Err(EslError::CommandFailed(self.originate_error.clone()));
        }

        let leg_id = Self::leg_from_dial_string(dial_string)
            .unwrap_or_else(|| "leg-originated".to_string());

        // Far end answers, talks briefly, hangs up.
        let registry = self.registry.lock().clone();
        if let Some(registry) = registry {
            let leg = leg_id.clone();
            tokio::spawn(async move {
                registry.dispatch(&leg, SessionEvent::Answered).await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                registry
                    .dispatch(
                        &leg,
                        SessionEvent::Hangup {
                            cause: Some("NORMAL_CLEARING".to_string()),
                        },
                    )
                    .await;
            });
        }
        Ok(leg_id)
    }
}

/// Reasoning double: fails the first `fail_times` calls, then answers.
pub struct MockReasoning {
    pub reply: String,
    pub fail_times: AtomicU32,
    pub calls: parking_lot::Mutex<Vec<(String, Vec<ChatTurn>)>>,
}

impl MockReasoning {
    pub fn new(reply: &str, fail_times: u32) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            fail_times: AtomicU32::new(fail_times),
            calls: parking_lot::Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ReasoningClient for MockReasoning {
    async fn complete(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
    ) -> Result<String, BackendError> {
        self.calls
            .lock()
            .push((system_prompt.to_string(), history.to_vec()));
        let remaining = self.fail_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_times.store(remaining - 1, Ordering::SeqCst);
            return Err(BackendError::Failed("scripted reasoning failure".to_string()));
        }
        Ok(self.reply.clone())
    }
}

/// Synthesis double: deterministic refs derived from the text.
pub struct MockSynthesis {
    pub fail_times: AtomicU32,
    pub spoken: parking_lot::Mutex<Vec<String>>,
}

impl MockSynthesis {
    pub fn new(fail_times: u32) -> Arc<Self> {
        Arc::new(Self {
            fail_times: AtomicU32::new(fail_times),
            spoken: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn spoken_texts(&self) -> Vec<String> {
        self.spoken.lock().clone()
    }
}

#[async_trait]
impl SynthesisClient for MockSynthesis {
    async fn synthesize(&self, text: &str) -> Result<AudioRef, BackendError> {
        let remaining = self.fail_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_times.store(remaining - 1, Ordering::SeqCst);
            return Err(BackendError::Unavailable("scripted synthesis failure".to_string()));
        }
        self.spoken.lock().push(text.to_string());
        Ok(AudioRef(format!("tts://{text}")))
    }
}

/// Recognition double whose stream never produces anything; the result
/// channel is parked so the pipeline stays alive.
pub struct SilentRecognition {
    keepalive: parking_lot::Mutex<Vec<mpsc::Sender<Result<TranscriptFragment, BackendError>>>>,
}

impl SilentRecognition {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            keepalive: parking_lot::Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl RecognitionClient for SilentRecognition {
    async fn start_stream(&self) -> Result<RecognitionStream, BackendError> {
        let (audio_tx, audio_rx) = mpsc::channel(16);
        let (updates_tx, updates_rx) = mpsc::channel(16);
        self.keepalive.lock().push(updates_tx);
        // drain audio so sends never error
        tokio::spawn(async move {
            let mut audio_rx = audio_rx;
            while audio_rx.recv().await.is_some() {}
        });
        Ok(RecognitionStream {
            audio_tx,
            updates_rx,
        })
    }
}

/// Record sink collecting reports on a channel.
pub struct ChannelRecordSink {
    tx: mpsc::UnboundedSender<CallReport>,
}

impl ChannelRecordSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CallReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl CallRecordSink for ChannelRecordSink {
    async fn record_call(&self, report: &CallReport) {
        let _ = self.tx.send(report.clone());
    }
}

pub fn test_scenario(
    welcome: &str,
    fallbacks: &[&str],
    max_turns: u32,
    timeout_seconds: u64,
) -> ScenarioConfig {
    ScenarioConfig::try_from(ScenarioRecord {
        scenario_id: "default".to_string(),
        name: "Default".to_string(),
        entry_points: vec!["1000".to_string()],
        system_prompt: "你是一个电话AI助手".to_string(),
        welcome_message: welcome.to_string(),
        fallback_responses: fallbacks.iter().map(|s| s.to_string()).collect(),
        max_turns,
        timeout_seconds,
        custom_settings: serde_json::Value::Null,
    })
    .expect("test scenario is valid")
}
