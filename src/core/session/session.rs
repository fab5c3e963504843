//! The per-call conversational state machine.
//!
//! One consumer task per call: every state transition happens inside
//! `run`, which drains the session's event queue in arrival order. Audio
//! frames, backend completions and switch events all funnel into that
//! queue, so there is never more than one in-flight transition per
//! session. Backend calls are spawned, not awaited inline, so the loop
//! keeps consuming (hangup and barge-in in particular) while a call is
//! outstanding, and stale completions are discarded by generation.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::core::audio::AudioPipeline;
use crate::core::backends::{
    BackendError, BackendKind, ReasoningClient, SynthesisClient,
};
use crate::core::esl::SwitchControl;
use crate::core::scenario::ScenarioConfig;

use super::record::{CallOutcome, CallRecordSink, CallReport, classify_hangup};
use super::registry::{SessionHandle, SessionRegistry};
use super::session_event::{SessionEvent, SpeakPurpose};
use super::state::{CallState, EndReason};
use super::transcript::{Speaker, Transcript};

const DEFAULT_CLOSING_MESSAGE: &str = "感谢您的来电，再见";
/// How long to wait for the switch to confirm the leg ended before
/// finalizing anyway.
const HANGUP_CONFIRM_GRACE: Duration = Duration::from_secs(5);

/// Session-level tuning lifted out of `ServerConfig`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub backend_retry_budget: u32,
    pub turn_failure_limit: u32,
    pub partial_grace: Duration,
}

impl From<&ServerConfig> for SessionConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            backend_retry_budget: config.backend_retry_budget,
            turn_failure_limit: config.turn_failure_limit,
            partial_grace: config.partial_grace,
        }
    }
}

/// Everything a session needs, constructed by the launcher and
/// injected. No process-wide state.
pub struct SessionParams {
    pub session_id: String,
    pub caller_number: Option<String>,
    pub scenario: Arc<ScenarioConfig>,
    pub switch: Arc<dyn SwitchControl>,
    pub reasoning: Arc<dyn ReasoningClient>,
    pub synthesis: Arc<dyn SynthesisClient>,
    pub record_sink: Arc<dyn CallRecordSink>,
    pub registry: Arc<SessionRegistry>,
    pub config: SessionConfig,
    /// Present for campaign calls: resolves when the call finishes.
    pub completion: Option<oneshot::Sender<CallOutcome>>,
    /// Observes every state transition; used by tests and diagnostics.
    pub state_listener: Option<mpsc::UnboundedSender<CallState>>,
}

pub struct CallSession {
    session_id: String,
    caller_number: Option<String>,
    scenario: Arc<ScenarioConfig>,
    switch: Arc<dyn SwitchControl>,
    reasoning: Arc<dyn ReasoningClient>,
    synthesis: Arc<dyn SynthesisClient>,
    record_sink: Arc<dyn CallRecordSink>,
    registry: Arc<SessionRegistry>,
    handle: Arc<SessionHandle>,
    pipeline: Option<AudioPipeline>,
    events_tx: mpsc::Sender<SessionEvent>,
    config: SessionConfig,

    state: CallState,
    turn: u32,
    /// Bumped whenever in-flight backend results must be discarded.
    turn_gen: u64,
    /// Backend failures within the current turn; drives fallback rotation.
    turn_errors: u32,
    transcript: Transcript,
    /// Audio reference currently playing; completions for anything else
    /// are stale.
    current_playback: Option<(String, SpeakPurpose)>,
    answered: bool,
    started_at: DateTime<Utc>,
    started: Instant,
    last_activity: Instant,
    partial_deadline: Option<Instant>,
    confirm_deadline: Option<Instant>,
    end_reason: Option<EndReason>,
    hangup_confirmed: bool,
    hangup_cause: Option<String>,
    inflight: Vec<JoinHandle<()>>,
    completion: Option<oneshot::Sender<CallOutcome>>,
    state_listener: Option<mpsc::UnboundedSender<CallState>>,
}

impl CallSession {
    pub fn new(
        params: SessionParams,
        handle: Arc<SessionHandle>,
        pipeline: Option<AudioPipeline>,
        events_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let now = Instant::now();
        Self {
            session_id: params.session_id,
            caller_number: params.caller_number,
            scenario: params.scenario,
            switch: params.switch,
            reasoning: params.reasoning,
            synthesis: params.synthesis,
            record_sink: params.record_sink,
            registry: params.registry,
            handle,
            pipeline,
            events_tx,
            config: params.config,
            state: CallState::Idle,
            turn: 0,
            turn_gen: 0,
            turn_errors: 0,
            transcript: Transcript::new(),
            current_playback: None,
            answered: false,
            started_at: Utc::now(),
            started: now,
            last_activity: now,
            partial_deadline: None,
            confirm_deadline: None,
            end_reason: None,
            hangup_confirmed: false,
            hangup_cause: None,
            inflight: Vec::new(),
            completion: params.completion,
            state_listener: params.state_listener,
        }
    }

    pub async fn run(mut self, mut events_rx: mpsc::Receiver<SessionEvent>) {
        info!(
            session_id = %self.session_id,
            scenario = %self.scenario.scenario_id,
            "session started"
        );

        loop {
            if self.state.is_terminal() && self.hangup_confirmed {
                break;
            }

            let deadline = self.next_deadline();
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(event) => {
                            // A queued hangup always wins over anything
                            // still ahead of it in the queue.
                            let superseded = self.handle.hangup_seen.load(Ordering::SeqCst)
                                && !matches!(event, SessionEvent::Hangup { .. });
                            if superseded {
                                debug!(session_id = %self.session_id, "event superseded by hangup");
                                continue;
                            }
                            self.on_event(event).await;
                        }
                        None => {
                            if !self.state.is_terminal() {
                                warn!(session_id = %self.session_id, "event queue closed unexpectedly");
                                self.end(EndReason::Fatal).await;
                            }
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.on_deadline().await;
                }
            }
        }

        self.finalize().await;
    }

    fn next_deadline(&self) -> Instant {
        if self.state.is_terminal() {
            return self
                .confirm_deadline
                .unwrap_or_else(|| Instant::now() + HANGUP_CONFIRM_GRACE);
        }
        let inactivity = self.last_activity + self.scenario.timeout;
        match self.partial_deadline {
            Some(partial) if partial < inactivity => partial,
            _ => inactivity,
        }
    }

    async fn on_deadline(&mut self) {
        if self.state.is_terminal() {
            // Gave up waiting for the switch's hangup confirmation.
            debug!(session_id = %self.session_id, "hangup confirmation grace elapsed");
            self.hangup_confirmed = true;
            return;
        }

        let now = Instant::now();
        if let Some(partial) = self.partial_deadline {
            if now >= partial {
                // A partial fragment was never finalized: brief waiting
                // bounce, then keep listening with no resource change.
                self.partial_deadline = None;
                if self.state == CallState::AsrListening {
                    self.transition(CallState::WaitingUser);
                    self.transition(CallState::AsrListening);
                }
                return;
            }
        }

        if now >= self.last_activity + self.scenario.timeout {
            info!(session_id = %self.session_id, "inactivity timeout");
            self.end(EndReason::InactivityTimeout).await;
        }
    }

    async fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Answered => {
                if self.state == CallState::Idle {
                    self.answered = true;
                    self.last_activity = Instant::now();
                    self.start_speak(SpeakPurpose::Welcome, self.scenario.welcome_message.clone());
                }
            }

            SessionEvent::Hangup { cause } => {
                debug!(session_id = %self.session_id, ?cause, "hangup event");
                self.hangup_cause = cause;
                self.hangup_confirmed = true;
                if !self.state.is_terminal() {
                    self.end(EndReason::Hangup).await;
                }
            }

            SessionEvent::SpeechStarted => {
                self.last_activity = Instant::now();
                if self.state == CallState::TtsPlaying {
                    // Barge-in: the pipeline already cleared switch
                    // playback; dropping current_playback makes the
                    // pending completion stale so listening wins.
                    self.current_playback = None;
                    self.transition(CallState::AsrListening);
                }
            }

            SessionEvent::Transcript { text, is_final } => {
                self.last_activity = Instant::now();
                self.on_transcript(text, is_final).await;
            }

            SessionEvent::PlaybackFinished { audio_ref } => {
                self.on_playback_finished(audio_ref).await;
            }

            SessionEvent::ReasoningDone { turn_gen, result } => {
                if turn_gen != self.turn_gen {
                    debug!(session_id = %self.session_id, "stale reasoning result discarded");
                    return;
                }
                if self.state != CallState::LlmProcessing {
                    return;
                }
                match result {
                    Ok(reply) => {
                        // One turn per completed reasoning → synthesis cycle.
                        self.turn += 1;
                        self.turn_errors = 0;
                        self.last_activity = Instant::now();
                        self.transcript.push(self.turn, Speaker::Assistant, reply.clone());
                        self.start_speak(SpeakPurpose::Reply, reply);
                    }
                    Err(error) => {
                        self.on_backend_failure(BackendKind::Reasoning, error).await;
                    }
                }
            }

            SessionEvent::SpeakReady {
                turn_gen,
                purpose,
                text,
                result,
            } => {
                if turn_gen != self.turn_gen {
                    debug!(session_id = %self.session_id, "stale synthesis result discarded");
                    return;
                }
                match result {
                    Ok(audio_ref) => {
                        match self.switch.play(&self.session_id, audio_ref.as_str()).await {
                            Ok(()) => {
                                self.current_playback = Some((audio_ref.0, purpose));
                                if let Some(pipeline) = &self.pipeline {
                                    pipeline.set_playing(true);
                                }
                                self.transition(CallState::TtsPlaying);
                            }
                            Err(e) => {
                                warn!(session_id = %self.session_id, error = %e, "playback command failed");
                                self.on_backend_failure(
                                    BackendKind::Synthesis,
                                    BackendError::Failed(format!("playback of '{text}': {e}")),
                                )
                                .await;
                            }
                        }
                    }
                    Err(error) => {
                        self.on_backend_failure(BackendKind::Synthesis, error).await;
                    }
                }
            }

            SessionEvent::RecognitionFailed { error } => {
                self.on_backend_failure(BackendKind::Recognition, error).await;
            }
        }
    }

    async fn on_transcript(&mut self, text: String, is_final: bool) {
        match self.state {
            CallState::AsrListening | CallState::WaitingUser => {
                if is_final {
                    self.partial_deadline = None;
                    info!(session_id = %self.session_id, %text, "final transcript");
                    self.transcript.push(self.turn + 1, Speaker::User, text);
                    self.transition(CallState::LlmProcessing);
                    self.start_reasoning();
                } else {
                    self.partial_deadline = Some(Instant::now() + self.config.partial_grace);
                    if self.state == CallState::WaitingUser {
                        self.transition(CallState::AsrListening);
                    }
                }
            }
            CallState::LlmProcessing if is_final => {
                // User kept talking while the model was thinking; keep the
                // words for context but do not start a second turn.
                self.transcript.push(self.turn + 1, Speaker::User, text);
            }
            _ => {}
        }
    }

    async fn on_playback_finished(&mut self, audio_ref: String) {
        let matches_current = self
            .current_playback
            .as_ref()
            .is_some_and(|(current, _)| *current == audio_ref);
        if !matches_current || self.state != CallState::TtsPlaying {
            debug!(session_id = %self.session_id, "stale playback completion ignored");
            return;
        }

        let (_, purpose) = self.current_playback.take().expect("checked above");
        if let Some(pipeline) = &self.pipeline {
            pipeline.set_playing(false);
        }
        self.last_activity = Instant::now();

        match purpose {
            SpeakPurpose::Reply if self.turn >= self.scenario.max_turns => {
                info!(
                    session_id = %self.session_id,
                    turn = self.turn,
                    "max turns reached"
                );
                self.end(EndReason::MaxTurnsReached).await;
            }
            SpeakPurpose::Welcome | SpeakPurpose::Reply | SpeakPurpose::Fallback => {
                self.transition(CallState::AsrListening);
            }
        }
    }

    /// A backend call failed past its retry budget. Transient error state,
    /// deterministic fallback, back to listening. Failures past the
    /// per-turn limit end the call gracefully instead.
    async fn on_backend_failure(&mut self, kind: BackendKind, error: BackendError) {
        if self.state.is_terminal() {
            return;
        }
        self.turn_errors += 1;
        warn!(
            session_id = %self.session_id,
            backend = %kind,
            error = %error,
            failures_this_turn = self.turn_errors,
            "backend failure"
        );
        self.transition(CallState::Error);

        if self.turn_errors > self.config.turn_failure_limit {
            self.end(EndReason::BackendExhausted).await;
            return;
        }

        let fallback = self.scenario.fallback_for(self.turn_errors).to_string();
        self.start_speak(SpeakPurpose::Fallback, fallback);
    }

    /// Spawn the reasoning call for the current conversation context.
    /// Retries inside the task; the session loop keeps consuming events.
    fn start_reasoning(&mut self) {
        let reasoning = self.reasoning.clone();
        let events = self.events_tx.clone();
        let turn_gen = self.turn_gen;
        let retries = self.config.backend_retry_budget;
        let system_prompt = self.scenario.system_prompt.clone();
        let history = self.transcript.as_chat_turns();

        let handle = tokio::spawn(async move {
            let mut attempt: u32 = 0;
            let result = loop {
                attempt += 1;
                match reasoning.complete(&system_prompt, &history).await {
                    Ok(reply) => break Ok(reply),
                    Err(e) if attempt <= retries => {
                        debug!(attempt, error = %e, "reasoning retry");
                    }
                    Err(e) => break Err(e),
                }
            };
            let _ = events
                .send(SessionEvent::ReasoningDone { turn_gen, result })
                .await;
        });
        self.track(handle);
    }

    fn start_speak(&mut self, purpose: SpeakPurpose, text: String) {
        let synthesis = self.synthesis.clone();
        let events = self.events_tx.clone();
        let turn_gen = self.turn_gen;
        let retries = self.config.backend_retry_budget;

        let handle = tokio::spawn(async move {
            let mut attempt: u32 = 0;
            let result = loop {
                attempt += 1;
                match synthesis.synthesize(&text).await {
                    Ok(audio_ref) => break Ok(audio_ref),
                    Err(e) if attempt <= retries => {
                        debug!(attempt, error = %e, "synthesis retry");
                    }
                    Err(e) => break Err(e),
                }
            };
            let _ = events
                .send(SessionEvent::SpeakReady {
                    turn_gen,
                    purpose,
                    text,
                    result,
                })
                .await;
        });
        self.track(handle);
    }

    fn track(&mut self, handle: JoinHandle<()>) {
        self.inflight.retain(|h| !h.is_finished());
        self.inflight.push(handle);
    }

    async fn end(&mut self, reason: EndReason) {
        if self.state.is_terminal() {
            return;
        }
        info!(session_id = %self.session_id, ?reason, "session ending");
        self.end_reason = Some(reason);

        // Cancel outstanding backend calls; anything that still lands is
        // discarded by the generation check.
        self.turn_gen += 1;
        for handle in self.inflight.drain(..) {
            handle.abort();
        }
        if let Some(pipeline) = &self.pipeline {
            pipeline.set_playing(false);
        }

        if reason == EndReason::Hangup {
            self.hangup_confirmed = true;
        } else {
            self.play_closing().await;
            if let Err(e) = self.switch.hangup(&self.session_id).await {
                warn!(session_id = %self.session_id, error = %e, "hangup command failed");
                self.hangup_confirmed = true;
            }
            self.confirm_deadline = Some(Instant::now() + HANGUP_CONFIRM_GRACE);
        }

        self.transition(CallState::Ended);
    }

    /// Best effort: the caller should hear a goodbye rather than dead air.
    /// No retries; the hangup that follows may cut it short.
    async fn play_closing(&mut self) {
        let message = self
            .scenario
            .custom_settings
            .get("closing_message")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_CLOSING_MESSAGE)
            .to_string();
        match self.synthesis.synthesize(&message).await {
            Ok(audio_ref) => {
                if let Err(e) = self.switch.play(&self.session_id, audio_ref.as_str()).await {
                    debug!(session_id = %self.session_id, error = %e, "closing playback failed");
                }
            }
            Err(e) => {
                debug!(session_id = %self.session_id, error = %e, "closing synthesis failed");
            }
        }
    }

    fn transition(&mut self, next: CallState) {
        if self.state == next {
            return;
        }
        debug!(
            session_id = %self.session_id,
            from = %self.state,
            to = %next,
            "state transition"
        );
        self.state = next;
        self.handle.update_snapshot(next, self.turn);
        if let Some(listener) = &self.state_listener {
            let _ = listener.send(next);
        }
    }

    async fn finalize(&mut self) {
        if let Some(pipeline) = &self.pipeline {
            pipeline.close();
        }

        let status = self
            .end_reason
            .map(|r| r.record_status())
            .unwrap_or("ended")
            .to_string();
        let duration_secs = self.started.elapsed().as_secs();
        let report = CallReport {
            session_id: self.session_id.clone(),
            caller_number: self.caller_number.clone(),
            started_at: self.started_at,
            ended_at: Utc::now(),
            duration_secs,
            status,
            transcript: self.transcript.entries().to_vec(),
        };
        self.record_sink.record_call(&report).await;

        if let Some(completion) = self.completion.take() {
            let result = classify_hangup(self.answered, self.hangup_cause.as_deref());
            let _ = completion.send(CallOutcome {
                result: result.to_string(),
                duration_secs,
            });
        }

        self.registry.remove(&self.session_id);
        info!(
            session_id = %self.session_id,
            turns = self.turn,
            duration_secs,
            "session finalized"
        );
    }
}
