use std::path::PathBuf;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub internal_api_key: Option<String>,
    pub max_sessions_per_user: usize,
    pub session_idle_timeout: Duration,
    pub session_max_lifetime: Duration,
    pub max_workspace_size_mb: u64,
    pub workspaces_path: PathBuf,
    pub agent: AgentConfig,
    pub ide: IdeConfig,
    pub storage: StorageConfig,
}

/// How the agent binary is invoked inside the PTY.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Path to the agent binary.
    pub binary_path: String,
    /// Default model for ollama-mode sessions.
    pub default_model: String,
    /// Local LLM host passed to ollama-mode sessions.
    pub ollama_host: String,
    /// Remote config-service endpoint passed to api-mode sessions.
    pub api_endpoint: String,
}

/// Per-session web IDE (code-server) supervision.
#[derive(Debug, Clone)]
pub struct IdeConfig {
    pub binary_path: String,
    pub base_port: u16,
    pub max_instances: usize,
    /// URL prefix the edge rewrites instance ports onto.
    pub external_url: String,
    /// Root for per-session user-data directories.
    pub data_root: PathBuf,
    /// Root for per-session extension directories.
    pub extensions_root: PathBuf,
    pub startup_timeout: Duration,
    /// Disable the settings/keybindings lockdown (for local debugging only).
    pub lockdown_disabled: bool,
}

/// Object-store selection and credentials.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub provider: StorageProvider,
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageProvider {
    Minio,
    S3,
    /// In-process store, used by tests and single-node dev setups.
    Memory,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let get = |key: &str| std::env::var(key).ok();
        Self::from_raw_values(&get)
    }

    /// Build a Config from a raw lookup function (as values would come from
    /// env vars). Used directly in tests to avoid mutating process-global
    /// environment.
    pub fn from_raw_values(get: &dyn Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let parse_u64 = |key: &str, default: u64| -> u64 {
            get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
        };

        let provider = match get("STORAGE_PROVIDER").as_deref() {
            None | Some("minio") => StorageProvider::Minio,
            Some("s3") => StorageProvider::S3,
            Some("memory") => StorageProvider::Memory,
            Some(other @ ("azure" | "gcs")) => {
                anyhow::bail!("storage provider {other:?} is not supported by this build")
            }
            Some(other) => anyhow::bail!("unknown storage provider {other:?}"),
        };

        Ok(Config {
            port: get("PORT").and_then(|v| v.parse().ok()).unwrap_or(3050),
            internal_api_key: get("INTERNAL_API_KEY").filter(|s| !s.is_empty()),
            max_sessions_per_user: parse_u64("MAX_SESSIONS_PER_USER", 3) as usize,
            session_idle_timeout: Duration::from_secs(parse_u64("SESSION_IDLE_TIMEOUT", 1800)),
            session_max_lifetime: Duration::from_secs(parse_u64("SESSION_MAX_LIFETIME", 14400)),
            max_workspace_size_mb: parse_u64("MAX_WORKSPACE_SIZE_MB", 5120),
            workspaces_path: PathBuf::from(
                get("WORKSPACES_PATH").unwrap_or_else(|| "/workspaces".to_string()),
            ),
            agent: AgentConfig {
                binary_path: get("AGENTICODE_PATH").unwrap_or_else(|| "agenticode".to_string()),
                default_model: get("AGENTICODE_MODEL")
                    .or_else(|| get("DEFAULT_MODEL"))
                    .unwrap_or_else(|| "qwen2.5-coder:7b".to_string()),
                ollama_host: get("OLLAMA_HOST")
                    .unwrap_or_else(|| "http://localhost:11434".to_string()),
                api_endpoint: get("AGENTICWORK_API_ENDPOINT")
                    .unwrap_or_else(|| "https://api.agenticwork.io".to_string()),
            },
            ide: IdeConfig {
                binary_path: get("CODE_SERVER_PATH").unwrap_or_else(|| "code-server".to_string()),
                base_port: get("CODE_SERVER_BASE_PORT")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3100),
                max_instances: parse_u64("CODE_SERVER_MAX_INSTANCES", 100) as usize,
                external_url: get("CODE_SERVER_EXTERNAL_URL")
                    .unwrap_or_else(|| "http://localhost".to_string()),
                data_root: PathBuf::from(
                    get("CODE_SERVER_DATA_DIR")
                        .unwrap_or_else(|| "/var/lib/codepod/ide".to_string()),
                ),
                extensions_root: PathBuf::from(
                    get("CODE_SERVER_EXTENSIONS_DIR")
                        .unwrap_or_else(|| "/var/lib/codepod/ide-extensions".to_string()),
                ),
                startup_timeout: Duration::from_secs(parse_u64("CODE_SERVER_STARTUP_TIMEOUT", 30)),
                lockdown_disabled: get("CODE_SERVER_LOCKDOWN_DISABLED").as_deref() == Some("1"),
            },
            storage: StorageConfig {
                provider,
                bucket: get("STORAGE_BUCKET").unwrap_or_else(|| "codepod-workspaces".to_string()),
                endpoint: get("STORAGE_ENDPOINT").filter(|s| !s.is_empty()),
                region: get("STORAGE_REGION").unwrap_or_else(|| "us-east-1".to_string()),
                access_key: get("STORAGE_ACCESS_KEY").filter(|s| !s.is_empty()),
                secret_key: get("STORAGE_SECRET_KEY").filter(|s| !s.is_empty()),
            },
        })
    }
}
