use crate::utils::parse_duration;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub environment: String,
    pub chatgpt: ChatGptConfig,
    pub task: TaskConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatGptConfig {
    pub base_url: String,
    pub auth_base_url: String,
    pub email: String,
    pub password: String,
    pub session_token: String,
    pub cf_clearance: String,
    pub proxy: Option<String>,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub auto_accept: bool,
}

/// Chrome 107桌面版UA，需与auth流程的client hints保持一致
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/107.0.0.0 Safari/537.36";

const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(120);

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            chatgpt: ChatGptConfig {
                base_url: "https://chat.openai.com".to_string(),
                auth_base_url: "https://auth0.openai.com".to_string(),
                email: String::new(),
                password: String::new(),
                session_token: String::new(),
                cf_clearance: String::new(),
                proxy: None,
                user_agent: USER_AGENT.to_string(),
            },
            task: TaskConfig {
                timeout: DEFAULT_TASK_TIMEOUT,
                auto_accept: false,
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        // 从环境变量加载配置
        if let Ok(env_type) = env::var("ENVIRONMENT") {
            config.environment = env_type;
        }

        if let Ok(token) = env::var("SESSION_TOKEN") {
            config.chatgpt.session_token = token;
        }

        if let Ok(email) = env::var("OPENAI_EMAIL") {
            config.chatgpt.email = email;
        }

        if let Ok(password) = env::var("OPENAI_PASSWORD") {
            config.chatgpt.password = password;
        }

        if let Ok(cf_clearance) = env::var("CF_CLEARANCE") {
            config.chatgpt.cf_clearance = cf_clearance;
        }

        if let Ok(proxy) = env::var("PROXY") {
            if !proxy.is_empty() {
                config.chatgpt.proxy = Some(proxy);
            }
        }

        if let Ok(base_url) = env::var("CHATGPT_BASE_URL") {
            config.chatgpt.base_url = base_url;
        }

        if let Ok(auth_url) = env::var("AUTH0_BASE_URL") {
            config.chatgpt.auth_base_url = auth_url;
        }

        if let Ok(timeout) = env::var("TASK_TIMEOUT") {
            if !timeout.is_empty() {
                config.task.timeout = parse_duration(&timeout)?;
            }
        }

        if let Ok(auto_accept) = env::var("AUTO_ACCEPT") {
            config.task.auto_accept = auto_accept.to_lowercase() == "true";
        }

        if config.chatgpt.session_token.is_empty()
            && (config.chatgpt.email.is_empty() || config.chatgpt.password.is_empty())
        {
            bail!("SESSION_TOKEN or OPENAI_EMAIL/OPENAI_PASSWORD must be set");
        }

        Ok(config)
    }
}

/// Duration在配置中以秒为单位序列化
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
