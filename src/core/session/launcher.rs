//! Session creation: wires a new call leg into a running session.
//!
//! Both entry paths land here: inbound call-creation events from the
//! switch, and legs the outbound scheduler originates. The launcher holds
//! every dependency a session needs and injects them at construction.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::core::audio::{AudioPipeline, PipelineConfig};
use crate::core::backends::{ReasoningClient, RecognitionClient, SynthesisClient};
use crate::core::esl::{EslEvent, IncomingCallHandler, SwitchControl};
use crate::core::scenario::{ScenarioConfig, ScenarioSource};

use super::record::{CallOutcome, CallRecordSink};
use super::registry::{SessionHandle, SessionRegistry, SessionSnapshot};
use super::session::{CallSession, SessionConfig, SessionParams};
use super::session_event::SessionEvent;
use super::state::CallState;

const SESSION_QUEUE_CAPACITY: usize = 64;

/// How a session came to exist.
pub struct LaunchSpec {
    pub instance_id: String,
    pub leg_id: String,
    pub caller_number: Option<String>,
    pub scenario: Arc<ScenarioConfig>,
    /// Inbound legs are answered by the bridge; originated legs are
    /// answered by the far end.
    pub answer_leg: bool,
    pub completion: Option<oneshot::Sender<CallOutcome>>,
}

pub struct SessionLauncher {
    session_config: SessionConfig,
    pipeline_rates: (u32, u32),
    registry: Arc<SessionRegistry>,
    recognition: Arc<dyn RecognitionClient>,
    reasoning: Arc<dyn ReasoningClient>,
    synthesis: Arc<dyn SynthesisClient>,
    record_sink: Arc<dyn CallRecordSink>,
    scenarios: Arc<dyn ScenarioSource>,
    controls: parking_lot::RwLock<HashMap<String, Arc<dyn SwitchControl>>>,
}

impl SessionLauncher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_config: SessionConfig,
        ingress_rate: u32,
        recognition_rate: u32,
        registry: Arc<SessionRegistry>,
        recognition: Arc<dyn RecognitionClient>,
        reasoning: Arc<dyn ReasoningClient>,
        synthesis: Arc<dyn SynthesisClient>,
        record_sink: Arc<dyn CallRecordSink>,
        scenarios: Arc<dyn ScenarioSource>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_config,
            pipeline_rates: (ingress_rate, recognition_rate),
            registry,
            recognition,
            reasoning,
            synthesis,
            record_sink,
            scenarios,
            controls: parking_lot::RwLock::new(HashMap::new()),
        })
    }

    /// Bind a switch instance's control seam. One registration per
    /// connected instance, before calls can land on it.
    pub fn register_instance(&self, instance_id: impl Into<String>, control: Arc<dyn SwitchControl>) {
        self.controls.write().insert(instance_id.into(), control);
    }

    pub fn control_for(&self, instance_id: &str) -> Option<Arc<dyn SwitchControl>> {
        self.controls.read().get(instance_id).cloned()
    }

    /// Create, register and start a session for a call leg. The handle is
    /// in the registry before this returns, so routed events cannot miss
    /// the session.
    pub async fn launch(&self, spec: LaunchSpec) -> Option<Arc<SessionHandle>> {
        let Some(switch) = self.control_for(&spec.instance_id) else {
            warn!(
                instance = %spec.instance_id,
                leg = %spec.leg_id,
                "no control registered for instance, call dropped"
            );
            return None;
        };

        let (events_tx, events_rx) = mpsc::channel::<SessionEvent>(SESSION_QUEUE_CAPACITY);
        let snapshot = SessionSnapshot {
            session_id: spec.leg_id.clone(),
            instance_id: spec.instance_id.clone(),
            scenario_id: spec.scenario.scenario_id.clone(),
            state: CallState::Idle,
            turn: 0,
            caller_number: spec.caller_number.clone(),
            started_at: chrono::Utc::now(),
        };
        let handle = SessionHandle::new(
            spec.leg_id.clone(),
            spec.instance_id.clone(),
            events_tx.clone(),
            snapshot,
        );
        self.registry.insert(handle.clone());

        let pipeline = match AudioPipeline::start(
            spec.leg_id.clone(),
            spec.leg_id.clone(),
            self.recognition.clone(),
            switch.clone(),
            events_tx.clone(),
            PipelineConfig {
                ingress_rate: self.pipeline_rates.0,
                recognition_rate: self.pipeline_rates.1,
            },
        )
        .await
        {
            Ok(pipeline) => Some(pipeline),
            Err(e) => {
                // The session still runs: it will play fallbacks and time
                // out instead of dying silently.
                warn!(leg = %spec.leg_id, error = %e, "audio pipeline failed to start");
                let _ = events_tx
                    .send(SessionEvent::RecognitionFailed { error: e })
                    .await;
                None
            }
        };

        let session = CallSession::new(
            SessionParams {
                session_id: spec.leg_id.clone(),
                caller_number: spec.caller_number,
                scenario: spec.scenario,
                switch: switch.clone(),
                reasoning: self.reasoning.clone(),
                synthesis: self.synthesis.clone(),
                record_sink: self.record_sink.clone(),
                registry: self.registry.clone(),
                config: self.session_config.clone(),
                completion: spec.completion,
                state_listener: None,
            },
            handle.clone(),
            pipeline,
            events_tx,
        );
        tokio::spawn(session.run(events_rx));

        if spec.answer_leg {
            let leg_id = spec.leg_id.clone();
            tokio::spawn(async move {
                if let Err(e) = switch.answer(&leg_id).await {
                    warn!(leg = %leg_id, error = %e, "answer command failed");
                }
            });
        }

        info!(leg = %spec.leg_id, "session launched");
        Some(handle)
    }
}

#[async_trait]
impl IncomingCallHandler for SessionLauncher {
    async fn on_call_created(&self, instance_id: &str, event: &EslEvent) {
        // Originated legs are pre-registered under their leg UUID; only
        // inbound creations reach this path unknown.
        if event.header("Call-Direction") == Some("outbound") {
            return;
        }
        let Some(leg_id) = event.leg_id() else { return };
        let Some(destination) = event.destination() else {
            debug!(leg = %leg_id, "call created without destination, dropped");
            return;
        };

        let Some(scenario) = self
            .scenarios
            .scenario_for_destination(instance_id, destination)
            .await
        else {
            warn!(leg = %leg_id, %destination, "no scenario for destination, call ignored");
            return;
        };

        self.launch(LaunchSpec {
            instance_id: instance_id.to_string(),
            leg_id: leg_id.to_string(),
            caller_number: event.caller_number().map(str::to_string),
            scenario,
            answer_leg: true,
            completion: None,
        })
        .await;
    }
}
