//! Application state: every long-lived component, explicitly constructed
//! and passed by reference. No process-wide singletons.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::config::{ServerConfig, SwitchEndpoint};
use crate::core::backends::{FunAsrRecognition, HttpSynthesis, OpenAiReasoning};
use crate::core::esl::{EslManager, InstanceControl};
use crate::core::outbound::{CampaignStore, MemoryCampaignStore, OutboundScheduler};
use crate::core::scenario::{
    ScenarioConfig, ScenarioRecord, ScenarioSource, StaticScenarioSource,
};
use crate::core::session::{
    CallRecordSink, SessionConfig, SessionLauncher, SessionRegistry,
};
use crate::storage::{Db, PersistentRecordSink, SessionStore};

#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub registry: Arc<SessionRegistry>,
    pub esl: Arc<EslManager>,
    pub launcher: Arc<SessionLauncher>,
    pub outbound: Arc<OutboundScheduler>,
    pub db: Option<Arc<Db>>,
    pub session_store: Option<Arc<SessionStore>>,
}

impl AppState {
    pub async fn new(config: ServerConfig) -> anyhow::Result<Self> {
        let registry = SessionRegistry::new();
        let esl = EslManager::new(config.clone(), registry.clone());

        let db = match &config.database_url {
            Some(url) => Some(
                Db::connect(url)
                    .await
                    .context("relational store connection failed")?,
            ),
            None => {
                warn!("DATABASE_URL not set, call records will not be persisted");
                None
            }
        };
        let session_store = match &config.redis_url {
            Some(url) => Some(
                SessionStore::connect(url, config.session_ttl_seconds)
                    .await
                    .context("session store connection failed")?,
            ),
            None => {
                warn!("REDIS_URL not set, session snapshots will not be persisted");
                None
            }
        };

        let scenarios: Arc<dyn ScenarioSource> = match &db {
            Some(db) => db.clone(),
            None => Arc::new(
                StaticScenarioSource::new(Some(Arc::new(builtin_default_scenario())))
            ),
        };

        let recognition = FunAsrRecognition::new(config.asr_ws_url.clone(), config.connect_timeout);
        let reasoning = OpenAiReasoning::new(
            config.llm_api_url.clone(),
            config.llm_model.clone(),
            config.llm_max_tokens,
            config.llm_temperature,
            config.backend_timeout,
        );
        let synthesis = HttpSynthesis::new(
            config.tts_api_url.clone(),
            config.tts_voice.clone(),
            config.tts_spool_dir.clone(),
            config.backend_timeout,
        );
        let record_sink: Arc<dyn CallRecordSink> = Arc::new(PersistentRecordSink {
            db: db.clone(),
            sessions: session_store.clone(),
        });

        let launcher = SessionLauncher::new(
            SessionConfig::from(&config),
            config.switch_sample_rate,
            config.asr_sample_rate,
            registry.clone(),
            recognition,
            reasoning,
            synthesis,
            record_sink,
            scenarios.clone(),
        );
        esl.set_dispatcher(launcher.clone());

        let campaign_store: Arc<dyn CampaignStore> = match &db {
            Some(db) => db.clone(),
            None => Arc::new(MemoryCampaignStore::new()),
        };
        let outbound = OutboundScheduler::new(
            campaign_store,
            scenarios,
            launcher.clone(),
            registry.clone(),
            config.switch.instance_id.clone(),
        );

        Ok(Self {
            config,
            registry,
            esl,
            launcher,
            outbound,
            db,
            session_store,
        })
    }

    /// Bring up event-socket connections for every configured switch
    /// instance: the `freeswitch_configs` rows when a store is present,
    /// the env-configured default otherwise.
    pub async fn start(&self) {
        let mut endpoints: Vec<SwitchEndpoint> = Vec::new();
        if let Some(db) = &self.db {
            match db.switch_instances().await {
                Ok(instances) if !instances.is_empty() => {
                    endpoints.extend(instances.into_iter().map(|i| SwitchEndpoint {
                        instance_id: i.instance_id,
                        host: i.host,
                        port: i.port,
                        password: i.password,
                    }));
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "switch instance load failed, using default"),
            }
        }
        if endpoints.is_empty() {
            endpoints.push(self.config.switch.clone());
        }

        for endpoint in endpoints {
            let instance_id = endpoint.instance_id.clone();
            self.launcher.register_instance(
                instance_id.clone(),
                InstanceControl::new(self.esl.clone(), instance_id.clone()),
            );
            self.esl.connect(endpoint);
            info!(instance = %instance_id, "switch instance registered");
        }

        // Mirror live session snapshots into the TTL-bound store so the
        // control plane can poll them without touching the bridge.
        if let Some(store) = &self.session_store {
            let registry = self.registry.clone();
            let store = store.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
                loop {
                    ticker.tick().await;
                    for snapshot in registry.snapshots() {
                        store.save_snapshot(&snapshot).await;
                    }
                }
            });
        }
    }
}

/// Scenario used when no relational store is configured, mirroring the
/// stock deployment defaults.
fn builtin_default_scenario() -> ScenarioConfig {
    ScenarioConfig::try_from(ScenarioRecord {
        scenario_id: "default".to_string(),
        name: "Default".to_string(),
        entry_points: vec![],
        system_prompt: "你是一个电话AI助手，回答保持简短、口语化。".to_string(),
        welcome_message: "您好，我是AI助手，请问有什么可以帮您？".to_string(),
        fallback_responses: vec![
            "请稍等，我正在思考".to_string(),
            "嗯，让我想想".to_string(),
            "这个问题需要多考虑一下".to_string(),
            "请稍等片刻".to_string(),
        ],
        max_turns: 10,
        timeout_seconds: 300,
        custom_settings: serde_json::Value::Null,
    })
    .expect("builtin scenario is valid")
}
