use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 登录成功后获得的凭证
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    #[serde(rename = "accessToken")]
    pub access_token: String,
    pub expires: DateTime<Utc>,
}

/// GET /api/auth/csrf 响应
#[derive(Debug, Deserialize)]
pub struct CsrfResponse {
    #[serde(rename = "csrfToken", default)]
    pub csrf_token: String,
}

/// POST /api/auth/signin/auth0 响应
#[derive(Debug, Deserialize)]
pub struct SigninResponse {
    #[serde(default)]
    pub url: String,
}

// 对话请求，空值字段序列化时省略
#[derive(Debug, Clone, Serialize)]
pub struct ConversationRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub action: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ConversationMessage>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub conversation_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub parent_message_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationMessage {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub content_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub parts: Vec<String>,
}

/// SSE最终帧的结构
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationResponse {
    #[serde(default)]
    pub message: ConversationMessage,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub error: Option<String>,
}
