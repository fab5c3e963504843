//! End-to-end session machine tests over scripted backends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use parla::core::session::{
    CallReport, CallSession, CallState, SessionConfig, SessionEvent, SessionHandle, SessionParams,
    SessionRegistry, SessionSnapshot,
};

use common::{ChannelRecordSink, MockReasoning, MockSwitch, MockSynthesis, test_scenario};

struct Harness {
    events_tx: mpsc::Sender<SessionEvent>,
    handle: Arc<SessionHandle>,
    registry: Arc<SessionRegistry>,
    states_rx: mpsc::UnboundedReceiver<CallState>,
    plays_rx: mpsc::UnboundedReceiver<String>,
    switch: Arc<MockSwitch>,
    reasoning: Arc<MockReasoning>,
    synthesis: Arc<MockSynthesis>,
    reports_rx: mpsc::UnboundedReceiver<CallReport>,
    _join: JoinHandle<()>,
}

fn spawn_session(
    scenario: parla::core::scenario::ScenarioConfig,
    reasoning: Arc<MockReasoning>,
    synthesis: Arc<MockSynthesis>,
    config: SessionConfig,
) -> Harness {
    let registry = SessionRegistry::new();
    let (switch, plays_rx) = MockSwitch::new();
    let (record_sink, reports_rx) = ChannelRecordSink::new();
    let (states_tx, states_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::channel(64);

    let session_id = "leg-test-1".to_string();
    let snapshot = SessionSnapshot {
        session_id: session_id.clone(),
        instance_id: "default".to_string(),
        scenario_id: scenario.scenario_id.clone(),
        state: CallState::Idle,
        turn: 0,
        caller_number: Some("1000".to_string()),
        started_at: chrono::Utc::now(),
    };
    let handle = SessionHandle::new(
        session_id.clone(),
        "default".to_string(),
        events_tx.clone(),
        snapshot,
    );
    registry.insert(handle.clone());

    let session = CallSession::new(
        SessionParams {
            session_id,
            caller_number: Some("1000".to_string()),
            scenario: Arc::new(scenario),
            switch: switch.clone(),
            reasoning: reasoning.clone(),
            synthesis: synthesis.clone(),
            record_sink,
            registry: registry.clone(),
            config,
            completion: None,
            state_listener: Some(states_tx),
        },
        handle.clone(),
        None,
        events_tx.clone(),
    );
    let join = tokio::spawn(session.run(events_rx));

    Harness {
        events_tx,
        handle,
        registry,
        states_rx,
        plays_rx,
        switch,
        reasoning,
        synthesis,
        reports_rx,
        _join: join,
    }
}

fn default_config() -> SessionConfig {
    SessionConfig {
        backend_retry_budget: 2,
        turn_failure_limit: 3,
        partial_grace: Duration::from_millis(1500),
    }
}

async fn next_state(harness: &mut Harness) -> CallState {
    harness.states_rx.recv().await.expect("state stream open")
}

/// Drive: answer, play welcome to completion, leaves session listening.
async fn answer_and_greet(harness: &mut Harness) -> String {
    harness.events_tx.send(SessionEvent::Answered).await.unwrap();
    assert_eq!(next_state(harness).await, CallState::TtsPlaying);
    let welcome_ref = harness.plays_rx.recv().await.unwrap();
    harness
        .events_tx
        .send(SessionEvent::PlaybackFinished {
            audio_ref: welcome_ref.clone(),
        })
        .await
        .unwrap();
    assert_eq!(next_state(harness).await, CallState::AsrListening);
    welcome_ref
}

#[tokio::test(start_paused = true)]
async fn test_full_conversation_turn_then_idle_timeout() {
    let scenario = test_scenario("您好，我是AI助手", &["请稍等，我正在思考"], 10, 300);
    let reasoning = MockReasoning::new("很高兴认识你", 0);
    let synthesis = MockSynthesis::new(0);
    let mut harness = spawn_session(scenario, reasoning, synthesis, default_config());

    answer_and_greet(&mut harness).await;
    assert_eq!(
        harness.synthesis.spoken_texts(),
        vec!["您好，我是AI助手".to_string()]
    );

    // User speaks; a final transcript starts the turn.
    harness
        .events_tx
        .send(SessionEvent::Transcript {
            text: "你好".to_string(),
            is_final: true,
        })
        .await
        .unwrap();
    assert_eq!(next_state(&mut harness).await, CallState::LlmProcessing);
    assert_eq!(next_state(&mut harness).await, CallState::TtsPlaying);

    // Reasoning saw the system prompt and the user's words.
    {
        let calls = harness.reasoning.calls.lock();
        assert_eq!(calls.len(), 1);
        let (system_prompt, history) = &calls[0];
        assert_eq!(system_prompt, "你是一个电话AI助手");
        assert!(history.iter().any(|t| t.role == "user" && t.content == "你好"));
    }

    // Turn counter advanced exactly once.
    assert_eq!(harness.handle.snapshot().turn, 1);

    let reply_ref = harness.plays_rx.recv().await.unwrap();
    assert_eq!(reply_ref, "tts://很高兴认识你");
    harness
        .events_tx
        .send(SessionEvent::PlaybackFinished {
            audio_ref: reply_ref,
        })
        .await
        .unwrap();
    assert_eq!(next_state(&mut harness).await, CallState::AsrListening);

    // Silence: the paused clock advances to the inactivity deadline.
    assert_eq!(next_state(&mut harness).await, CallState::Ended);

    let report = harness.reports_rx.recv().await.unwrap();
    assert_eq!(report.status, "ended");
    assert!(report.duration_secs > 0);
    assert_eq!(report.transcript.len(), 2);
    assert_eq!(report.transcript[0].text, "你好");
    assert_eq!(report.transcript[0].turn, 1);

    // Removed from the registry only after the terminal state.
    assert!(harness.registry.get("leg-test-1").is_none());
    // The bridge hung the leg up itself.
    assert!(harness.switch.hangups.load(std::sync::atomic::Ordering::SeqCst) >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_barge_in_interrupts_playback_and_wins_over_completion() {
    let scenario = test_scenario("欢迎", &["稍等"], 10, 300);
    let reasoning = MockReasoning::new("回复", 0);
    let synthesis = MockSynthesis::new(0);
    let mut harness = spawn_session(scenario, reasoning, synthesis, default_config());

    harness.events_tx.send(SessionEvent::Answered).await.unwrap();
    assert_eq!(next_state(&mut harness).await, CallState::TtsPlaying);
    let welcome_ref = harness.plays_rx.recv().await.unwrap();

    // Start of speech during playback, with the playback-complete event
    // already queued right behind it (the race rule 5 must win).
    harness
        .events_tx
        .try_send(SessionEvent::SpeechStarted)
        .unwrap();
    harness
        .events_tx
        .try_send(SessionEvent::PlaybackFinished {
            audio_ref: welcome_ref,
        })
        .unwrap();

    // Next observable state is listening, never waiting_user, and the
    // stale completion produces no further transition.
    assert_eq!(next_state(&mut harness).await, CallState::AsrListening);

    harness
        .events_tx
        .send(SessionEvent::Transcript {
            text: "我想问个问题".to_string(),
            is_final: true,
        })
        .await
        .unwrap();
    assert_eq!(next_state(&mut harness).await, CallState::LlmProcessing);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_rotation_and_graceful_exhaustion() {
    let scenario = test_scenario("欢迎", &["回退零", "回退一", "回退二"], 10, 300);
    // Reasoning always fails; no in-task retries so every turn failure is
    // visible immediately.
    let reasoning = MockReasoning::new("unused", u32::MAX);
    let synthesis = MockSynthesis::new(0);
    let config = SessionConfig {
        backend_retry_budget: 0,
        turn_failure_limit: 3,
        partial_grace: Duration::from_millis(1500),
    };
    let mut harness = spawn_session(scenario, reasoning, synthesis, config);

    answer_and_greet(&mut harness).await;

    for expected_fallback in ["回退一", "回退二", "回退零"] {
        harness
            .events_tx
            .send(SessionEvent::Transcript {
                text: "测试".to_string(),
                is_final: true,
            })
            .await
            .unwrap();
        assert_eq!(next_state(&mut harness).await, CallState::LlmProcessing);
        assert_eq!(next_state(&mut harness).await, CallState::Error);
        // Fallback plays, then listening again.
        assert_eq!(next_state(&mut harness).await, CallState::TtsPlaying);
        let fallback_ref = harness.plays_rx.recv().await.unwrap();
        assert_eq!(fallback_ref, format!("tts://{expected_fallback}"));
        harness
            .events_tx
            .send(SessionEvent::PlaybackFinished {
                audio_ref: fallback_ref,
            })
            .await
            .unwrap();
        assert_eq!(next_state(&mut harness).await, CallState::AsrListening);
    }

    // Fourth failure in the turn exceeds the limit: graceful end with a
    // closing message.
    harness
        .events_tx
        .send(SessionEvent::Transcript {
            text: "测试".to_string(),
            is_final: true,
        })
        .await
        .unwrap();
    assert_eq!(next_state(&mut harness).await, CallState::LlmProcessing);
    assert_eq!(next_state(&mut harness).await, CallState::Error);
    assert_eq!(next_state(&mut harness).await, CallState::Ended);

    let spoken = harness.synthesis.spoken_texts();
    assert_eq!(spoken[0], "欢迎");
    assert_eq!(spoken[1], "回退一");
    assert_eq!(spoken[2], "回退二");
    assert_eq!(spoken[3], "回退零");
    // Best-effort goodbye at the end.
    assert_eq!(spoken[4], "感谢您的来电，再见");

    let report = harness.reports_rx.recv().await.unwrap();
    assert_eq!(report.status, "ended");
}

#[tokio::test(start_paused = true)]
async fn test_backend_retry_success_plays_no_fallback() {
    let scenario = test_scenario("欢迎", &["回退"], 10, 300);
    // Fails once, succeeds on the in-task retry: the caller never hears a
    // fallback.
    let reasoning = MockReasoning::new("成功的回复", 1);
    let synthesis = MockSynthesis::new(0);
    let mut harness = spawn_session(scenario, reasoning, synthesis, default_config());

    answer_and_greet(&mut harness).await;

    harness
        .events_tx
        .send(SessionEvent::Transcript {
            text: "请问营业时间".to_string(),
            is_final: true,
        })
        .await
        .unwrap();
    assert_eq!(next_state(&mut harness).await, CallState::LlmProcessing);
    assert_eq!(next_state(&mut harness).await, CallState::TtsPlaying);

    // Two reasoning attempts, one audible utterance, no fallback text.
    assert_eq!(harness.reasoning.calls.lock().len(), 2);
    let spoken = harness.synthesis.spoken_texts();
    assert_eq!(spoken, vec!["欢迎".to_string(), "成功的回复".to_string()]);
    assert_eq!(harness.handle.snapshot().turn, 1);
}

#[tokio::test(start_paused = true)]
async fn test_max_turns_ends_session_after_final_reply() {
    let scenario = test_scenario("欢迎", &["稍等"], 1, 300);
    let reasoning = MockReasoning::new("最后的回复", 0);
    let synthesis = MockSynthesis::new(0);
    let mut harness = spawn_session(scenario, reasoning, synthesis, default_config());

    answer_and_greet(&mut harness).await;

    harness
        .events_tx
        .send(SessionEvent::Transcript {
            text: "你好".to_string(),
            is_final: true,
        })
        .await
        .unwrap();
    assert_eq!(next_state(&mut harness).await, CallState::LlmProcessing);
    assert_eq!(next_state(&mut harness).await, CallState::TtsPlaying);

    let reply_ref = harness.plays_rx.recv().await.unwrap();
    harness
        .events_tx
        .send(SessionEvent::PlaybackFinished {
            audio_ref: reply_ref,
        })
        .await
        .unwrap();

    // max_turns = 1: the reply's completion ends the call.
    assert_eq!(next_state(&mut harness).await, CallState::Ended);
    let report = harness.reports_rx.recv().await.unwrap();
    assert_eq!(report.status, "ended");
}

#[tokio::test(start_paused = true)]
async fn test_hangup_wins_over_queued_events() {
    let scenario = test_scenario("欢迎", &["稍等"], 10, 300);
    let reasoning = MockReasoning::new("回复", 0);
    let synthesis = MockSynthesis::new(0);
    let mut harness = spawn_session(scenario, reasoning, synthesis, default_config());

    answer_and_greet(&mut harness).await;

    // Queue a final transcript, then a hangup through the registry (which
    // raises the supersede flag before the queue drains).
    harness
        .events_tx
        .try_send(SessionEvent::Transcript {
            text: "你好".to_string(),
            is_final: true,
        })
        .unwrap();
    harness
        .registry
        .dispatch(
            "leg-test-1",
            SessionEvent::Hangup {
                cause: Some("NORMAL_CLEARING".to_string()),
            },
        )
        .await;

    // The transcript is never acted on: no reasoning call, straight to
    // the terminal state.
    assert_eq!(next_state(&mut harness).await, CallState::Ended);
    assert!(harness.reasoning.calls.lock().is_empty());

    let report = harness.reports_rx.recv().await.unwrap();
    assert_eq!(report.status, "ended");
    assert!(harness.registry.get("leg-test-1").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_state_is_always_in_the_defined_set() {
    let scenario = test_scenario("欢迎", &["稍等"], 2, 300);
    let reasoning = MockReasoning::new("回复", 0);
    let synthesis = MockSynthesis::new(0);
    let mut harness = spawn_session(scenario, reasoning, synthesis, default_config());

    answer_and_greet(&mut harness).await;
    harness
        .events_tx
        .send(SessionEvent::Transcript {
            text: "测试".to_string(),
            is_final: true,
        })
        .await
        .unwrap();

    // Drain every transition until the session ends; all must be members
    // of the state set (the enum guarantees it, the assertion documents
    // the property).
    loop {
        let state = next_state(&mut harness).await;
        assert!(matches!(
            state,
            CallState::Idle
                | CallState::TtsPlaying
                | CallState::AsrListening
                | CallState::LlmProcessing
                | CallState::WaitingUser
                | CallState::Error
                | CallState::Ended
        ));
        if state == CallState::Ended {
            break;
        }
        if state == CallState::TtsPlaying {
            if let Ok(audio_ref) = harness.plays_rx.try_recv() {
                let _ = harness
                    .events_tx
                    .send(SessionEvent::PlaybackFinished { audio_ref })
                    .await;
            }
        }
    }
}
