use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Event-socket endpoint for a single switch instance, used to bootstrap
/// the connection manager before any `freeswitch_configs` rows are loaded.
#[derive(Debug, Clone)]
pub struct SwitchEndpoint {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    // Default switch instance (overridden by freeswitch_configs rows)
    pub switch: SwitchEndpoint,
    /// Sample rate of frames delivered by the switch
    pub switch_sample_rate: u32,

    // Backend endpoints
    pub asr_ws_url: String,
    pub asr_sample_rate: u32,
    pub llm_api_url: String,
    pub llm_model: String,
    pub llm_max_tokens: u32,
    pub llm_temperature: f32,
    pub tts_api_url: String,
    pub tts_voice: String,
    /// Directory where synthesized audio is spooled for switch playback
    pub tts_spool_dir: PathBuf,

    // Persistence (optional: the bridge degrades to in-memory state without them)
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub session_ttl_seconds: u64,

    // Timing knobs
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// Originate commands ride out the full ring time, so they get their
    /// own, much longer bound.
    pub originate_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub backend_timeout: Duration,
    /// Grace period after a non-final recognition fragment before the
    /// session briefly passes through the waiting state
    pub partial_grace: Duration,

    // Failure policy
    /// Retries per backend call before the turn counts a failure
    pub backend_retry_budget: u32,
    /// Backend failures tolerated within one turn before the call ends
    pub turn_failure_limit: u32,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3001".to_string())
            .parse::<u16>()
            .map_err(|e| format!("Invalid port number: {e}"))?;

        let switch = SwitchEndpoint {
            instance_id: env::var("FS_INSTANCE_ID").unwrap_or_else(|_| "default".to_string()),
            host: env::var("FS_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env::var("FS_PORT")
                .unwrap_or_else(|_| "8021".to_string())
                .parse::<u16>()
                .map_err(|e| format!("Invalid FS_PORT: {e}"))?,
            password: env::var("FS_PASSWORD").unwrap_or_else(|_| "ClueCon".to_string()),
        };

        let asr_ws_url =
            env::var("ASR_WS_URL").unwrap_or_else(|_| "ws://localhost:10095".to_string());
        let llm_api_url = env::var("LLM_API_URL")
            .unwrap_or_else(|_| "http://localhost:8080/v1/chat/completions".to_string());
        let llm_model = env::var("LLM_MODEL").unwrap_or_else(|_| "deepseek-chat".to_string());
        let tts_api_url =
            env::var("TTS_API_URL").unwrap_or_else(|_| "http://localhost:8000/tts".to_string());
        let tts_voice = env::var("TTS_VOICE").unwrap_or_else(|_| "default".to_string());
        let tts_spool_dir = env::var("TTS_SPOOL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp/parla-audio"));

        let database_url = env::var("DATABASE_URL").ok();
        let redis_url = env::var("REDIS_URL").ok();
        let session_ttl_seconds = env::var("SESSION_TTL_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(3600);

        let secs = |key: &str, default: u64| -> u64 {
            env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(default)
        };

        Ok(ServerConfig {
            host,
            port,
            switch,
            switch_sample_rate: 8000,
            asr_ws_url,
            asr_sample_rate: 16000,
            llm_api_url,
            llm_model,
            llm_max_tokens: 500,
            llm_temperature: 0.7,
            tts_api_url,
            tts_voice,
            tts_spool_dir,
            database_url,
            redis_url,
            session_ttl_seconds,
            connect_timeout: Duration::from_secs(secs("FS_CONNECT_TIMEOUT", 10)),
            command_timeout: Duration::from_secs(secs("FS_COMMAND_TIMEOUT", 5)),
            originate_timeout: Duration::from_secs(secs("FS_ORIGINATE_TIMEOUT", 60)),
            heartbeat_interval: Duration::from_secs(secs("FS_HEARTBEAT_INTERVAL", 30)),
            backend_timeout: Duration::from_secs(secs("BACKEND_TIMEOUT", 10)),
            partial_grace: Duration::from_millis(
                env::var("PARTIAL_GRACE_MS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(1500),
            ),
            backend_retry_budget: 2,
            turn_failure_limit: 3,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            switch: SwitchEndpoint {
                instance_id: "default".to_string(),
                host: "localhost".to_string(),
                port: 8021,
                password: "ClueCon".to_string(),
            },
            switch_sample_rate: 8000,
            asr_ws_url: "ws://localhost:10095".to_string(),
            asr_sample_rate: 16000,
            llm_api_url: "http://localhost:8080/v1/chat/completions".to_string(),
            llm_model: "deepseek-chat".to_string(),
            llm_max_tokens: 500,
            llm_temperature: 0.7,
            tts_api_url: "http://localhost:8000/tts".to_string(),
            tts_voice: "default".to_string(),
            tts_spool_dir: PathBuf::from("/tmp/parla-audio"),
            database_url: None,
            redis_url: None,
            session_ttl_seconds: 3600,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(5),
            originate_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            backend_timeout: Duration::from_secs(10),
            partial_grace: Duration::from_millis(1500),
            backend_retry_budget: 2,
            turn_failure_limit: 3,
        }
    }
}
