use crate::config::ChatGptConfig;
use crate::error::{ChatError, ChatResult};
use crate::models::{ConversationMessage, ConversationRequest, ConversationResponse, Credentials, MessageContent};
use crate::services::auth_flow::AuthFlow;
use crate::utils::new_message_id;
use chrono::{DateTime, Utc};
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use std::io::Write;
use tracing::{debug, info};

const ACTION_NEXT: &str = "next";
const ROLE_USER: &str = "user";
const CONTENT_TYPE_TEXT: &str = "text";
const MODEL_TEXT_DAVINCI_002_RENDER: &str = "text-davinci-002-render";

const STREAM_EOF: &str = "[DONE]";

const COOKIE_SESSION_TOKEN: &str = "__Secure-next-auth.session-token";
const COOKIE_CF_CLEARANCE: &str = "cf_clearance";

const CAPTCHA_FILE: &str = "captcha.png";

/// 对话延续性：服务端分配的conversation_id加客户端持有的parent_message_id
#[derive(Debug, Clone)]
pub struct Conversation {
    pub conversation_id: String,
    pub parent_message_id: String,
}

impl Conversation {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            parent_message_id: new_message_id(),
        }
    }
}

/// ChatGPT会话客户端，token缓存只被所属worker访问，无需加锁
pub struct ChatGptClient {
    config: ChatGptConfig,
    client: Client,
    access_token: String,
    access_token_expires: DateTime<Utc>,
}

impl ChatGptClient {
    pub fn new(config: ChatGptConfig) -> ChatResult<Self> {
        let mut builder = Client::builder();
        if let Some(proxy) = config.proxy.as_deref() {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        let client = builder.build()?;

        Ok(Self {
            config,
            client,
            access_token: String::new(),
            access_token_expires: DateTime::<Utc>::MIN_UTC,
        })
    }

    pub fn new_conversation(&self, conversation_id: &str) -> Conversation {
        Conversation::new(conversation_id)
    }

    /// 发送一条消息，流式读取响应，最后一个非[DONE]帧即回复。
    /// 成功后更新对话的conversation_id和parent_message_id。
    pub async fn send_message(
        &mut self,
        conversation: &mut Conversation,
        message: &str,
    ) -> ChatResult<String> {
        self.refresh_access_token_if_expired().await?;

        let request = ConversationRequest {
            action: ACTION_NEXT.to_string(),
            messages: vec![ConversationMessage {
                id: new_message_id(),
                role: ROLE_USER.to_string(),
                content: MessageContent {
                    content_type: CONTENT_TYPE_TEXT.to_string(),
                    parts: vec![message.to_string()],
                },
            }],
            conversation_id: conversation.conversation_id.clone(),
            parent_message_id: conversation.parent_message_id.clone(),
            model: MODEL_TEXT_DAVINCI_002_RENDER.to_string(),
        };

        let endpoint = format!("{}/backend-api/conversation", self.config.base_url);
        let mut builder = self
            .client
            .post(&endpoint)
            .header("user-agent", &self.config.user_agent)
            .header("authorization", format!("Bearer {}", self.access_token))
            .header("content-type", "application/json");

        if !self.config.cf_clearance.is_empty() {
            builder = builder.header(
                "cookie",
                format!("{}={}", COOKIE_CF_CLEARANCE, self.config.cf_clearance),
            );
        }

        let response = builder.json(&request).send().await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Upstream {
                code: status.as_u16(),
                body,
            });
        }

        // 逐帧读取，保留最后一个非[DONE]帧
        let mut stream = response.bytes_stream().eventsource();
        let mut final_frame: Option<String> = None;

        while let Some(event) = stream.next().await {
            let event = event.map_err(|e| ChatError::StreamParse(e.to_string()))?;
            if event.data == STREAM_EOF {
                break;
            }
            final_frame = Some(event.data);
        }

        let frame = final_frame
            .ok_or_else(|| ChatError::StreamParse("no data frames in response".to_string()))?;

        let parsed: ConversationResponse = serde_json::from_str(&frame)
            .map_err(|e| ChatError::StreamParse(format!("invalid final frame: {}", e)))?;

        if let Some(error) = parsed.error.as_deref().filter(|e| !e.is_empty()) {
            return Err(ChatError::Upstream {
                code: StatusCode::OK.as_u16(),
                body: error.to_string(),
            });
        }

        let reply = parsed
            .message
            .content
            .parts
            .first()
            .cloned()
            .ok_or_else(|| ChatError::malformed("conversation", "empty parts in final frame"))?;

        conversation.conversation_id = parsed.conversation_id;
        conversation.parent_message_id = parsed.message.id;

        debug!(
            conversation_id = %conversation.conversation_id,
            parent_message_id = %conversation.parent_message_id,
            "conversation updated"
        );

        Ok(reply)
    }

    /// token为空或已过期时刷新，其余情况不触网
    async fn refresh_access_token_if_expired(&mut self) -> ChatResult<()> {
        if !self.access_token.is_empty() && Utc::now() < self.access_token_expires {
            return Ok(());
        }

        let credentials = if self.config.session_token.is_empty() {
            self.refresh_by_password().await?
        } else {
            self.refresh_by_session_token().await?
        };

        info!(expires = %credentials.expires, "access token refreshed");

        self.access_token = credentials.access_token;
        self.access_token_expires = credentials.expires;

        Ok(())
    }

    /// 用session-token cookie换取access token
    async fn refresh_by_session_token(&self) -> ChatResult<Credentials> {
        let endpoint = format!("{}/api/auth/session", self.config.base_url);

        let mut cookie = format!("{}={}", COOKIE_SESSION_TOKEN, self.config.session_token);
        if !self.config.cf_clearance.is_empty() {
            cookie.push_str(&format!(
                "; {}={}",
                COOKIE_CF_CLEARANCE, self.config.cf_clearance
            ));
        }

        let response = self
            .client
            .get(&endpoint)
            .header("user-agent", &self.config.user_agent)
            .header("cookie", cookie)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::TokenRefreshFailed(format!(
                "unexpected status code: {}, body: {}",
                status.as_u16(),
                body
            )));
        }

        response
            .json::<Credentials>()
            .await
            .map_err(|e| ChatError::TokenRefreshFailed(format!("invalid session json: {}", e)))
    }

    /// 走完整登录流程，验证码落盘后从标准输入读答案
    async fn refresh_by_password(&self) -> ChatResult<Credentials> {
        let mut flow = AuthFlow::new(&self.config)?;

        let captcha = flow.begin().await?;

        let answer = if captcha.available() {
            captcha.to_file(CAPTCHA_FILE)?;
            info!(file = CAPTCHA_FILE, "captcha written, waiting for answer");
            read_captcha_answer().await?
        } else {
            String::new()
        };

        flow.finish(&answer).await
    }
}

async fn read_captcha_answer() -> ChatResult<String> {
    let answer = tokio::task::spawn_blocking(|| {
        print!("Captcha answer: ");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok::<_, std::io::Error>(line.trim().to_string())
    })
    .await
    .map_err(|e| ChatError::TokenRefreshFailed(format!("captcha prompt failed: {}", e)))??;

    Ok(answer)
}
