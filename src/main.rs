use anyhow::Result;
use colored::*;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod bridge;
mod config;
mod error;
mod models;
mod services;
mod utils;

use bridge::{handle_incoming, IncomingEvent, ReplyPort, TextMessage};
use config::Config;
use services::TaskManager;

/// 控制台桥接：标准输入的每一行都是user "console"的一条消息
struct ConsolePort;

impl ReplyPort for ConsolePort {
    fn reply(&self, user_id: &str, text: &str) {
        println!("{} {}", format!("[{}]", user_id).bright_blue().bold(), text);
    }

    fn accept_friend(&self, user_id: &str, greeting: &str) {
        println!("{} accepted {}: {}", "[friend]".bright_green(), user_id, greeting);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    init_logging()?;

    // 加载配置
    dotenv::dotenv().ok();
    let config = Config::load()?;

    println!("{}", "ChatGPT Relay Bot (Rust Version)".bright_green().bold());
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Environment: {}", config.environment);
    println!("Task timeout: {:?}", config.task.timeout);

    let manager = TaskManager::new(config.chatgpt.clone());
    let port: Arc<dyn ReplyPort> = Arc::new(ConsolePort);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let event = IncomingEvent::Text(TextMessage {
            user_id: "console".to_string(),
            content: line,
            from_self: false,
            group: None,
        });
        handle_incoming(&manager, &config.task, event, port.clone()).await;
    }

    Ok(())
}

fn init_logging() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatgpt_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
