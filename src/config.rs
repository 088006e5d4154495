use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub shell: ShellConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub path: String,
    pub autocomplete_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    pub session_file: String,
    pub max_inline_depth: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            server: ServerConfig {
                url: env::var("SERVER_URL")
                    .unwrap_or_else(|_| "http://localhost:8000".to_string()),
                request_timeout_secs: env::var("REQUEST_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
            },
            cache: CacheConfig {
                path: env::var("CACHE_PATH")
                    .unwrap_or_else(|_| "data/graphdesk_cache.db".to_string()),
                autocomplete_capacity: env::var("CACHE_CAPACITY")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()
                    .unwrap_or(1000),
            },
            shell: ShellConfig {
                session_file: env::var("SESSION_FILE")
                    .unwrap_or_else(|_| "data/graphdesk_session.json".to_string()),
                max_inline_depth: env::var("MAX_INLINE_DEPTH")
                    .unwrap_or_else(|_| "4".to_string())
                    .parse()
                    .unwrap_or(4),
            },
        })
    }

    /// Root of the data API (`<server>/api`); token endpoints live at the server root.
    pub fn api_base(&self) -> String {
        format!("{}/api", self.server.url.trim_end_matches('/'))
    }
}
