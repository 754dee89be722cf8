use crate::config::TaskConfig;
use crate::services::dispatcher::{Task, TaskManager};
use std::sync::Arc;
use tracing::{debug, warn};

const FRIEND_GREETING: &str = "I'm a ChatGPT bot~";
const ERROR_REPLY: &str = "[ERROR] Failed to get ChatGPT response";

/// 消息平台事件，由外部平台客户端翻译成这个形态
pub enum IncomingEvent {
    FriendRequest { user_id: String },
    Text(TextMessage),
}

pub struct TextMessage {
    pub user_id: String,
    pub content: String,
    pub from_self: bool,
    pub group: Option<GroupContext>,
}

/// 群聊上下文：只响应@机器人的消息，回复时@回发送者
pub struct GroupContext {
    pub sender_nickname: String,
    pub bot_mention: String,
    pub mentions_bot: bool,
}

/// 回复出口，由平台客户端实现
pub trait ReplyPort: Send + Sync + 'static {
    fn reply(&self, user_id: &str, text: &str);
    fn accept_friend(&self, user_id: &str, greeting: &str);
}

/// 平台消息到任务的翻译层
pub async fn handle_incoming(
    manager: &TaskManager,
    task_config: &TaskConfig,
    event: IncomingEvent,
    port: Arc<dyn ReplyPort>,
) {
    match event {
        IncomingEvent::FriendRequest { user_id } => {
            if task_config.auto_accept {
                port.accept_friend(&user_id, FRIEND_GREETING);
            }
        }
        IncomingEvent::Text(message) => {
            if message.from_self {
                return;
            }

            let mut response_prefix = String::new();
            let mut content = message.content.trim().to_string();

            if let Some(group) = &message.group {
                if !group.mentions_bot {
                    return;
                }
                response_prefix = format!("@{} ", group.sender_nickname);
                content = content.replace(&group.bot_mention, "").trim().to_string();
            }

            if content.is_empty() {
                return;
            }

            debug!(user_id = %message.user_id, content = %content, "receive msg");

            let user_id = message.user_id.clone();
            let task = Task::new(
                &message.user_id,
                content,
                task_config.timeout,
                move |result| match result {
                    Ok(response) => {
                        debug!("ChatGPT response: {}", response);
                        port.reply(&user_id, &format!("{}{}", response_prefix, response));
                    }
                    Err(e) => {
                        warn!("failed to get ChatGPT response: {}", e);
                        port.reply(&user_id, ERROR_REPLY);
                    }
                },
            );

            manager.send_task(task).await;
        }
    }
}
