use crate::config::ChatGptConfig;
use crate::error::{ChatError, ChatResult};
use crate::models::{Credentials, CsrfResponse, SigninResponse};
use crate::services::browser::BrowserSession;
use crate::services::captcha::Captcha;
use regex::Regex;
use reqwest::header::HeaderValue;
use reqwest::{StatusCode, Url};
use tracing::{debug, info};

/// 登录状态机。
///
/// 九次网络请求还原浏览器的Auth0登录过程，`begin`走到验证码出现为止，
/// 人工（或外部求解器）给出答案后由`finish`完成剩余步骤。
/// 中间的`state`参数由identifier步骤写入、password步骤读取。
pub struct AuthFlow {
    email: String,
    password: String,
    base_url: String,
    auth_base_url: String,
    state: Option<String>,
    session: BrowserSession,
}

impl AuthFlow {
    pub fn new(config: &ChatGptConfig) -> ChatResult<Self> {
        let session = BrowserSession::new(&config.user_agent, config.proxy.as_deref())?;

        Ok(Self {
            email: config.email.clone(),
            password: config.password.clone(),
            base_url: config.base_url.clone(),
            auth_base_url: config.auth_base_url.clone(),
            state: None,
            session,
        })
    }

    /// 执行到验证码出现为止。没有验证码时返回的Captcha为空，
    /// 可以直接用空答案调用`finish`。
    pub async fn begin(&mut self) -> ChatResult<Captcha> {
        if self.email.is_empty() || self.password.is_empty() {
            return Err(ChatError::InvalidCredentials);
        }

        info!(username = %self.email, "starting authentication process");

        self.open_login_page().await?;
        info!("got main page");

        let csrf_token = self.fetch_csrf().await?;
        debug!(token = %csrf_token, "got CSRF token");

        let auth0_url = self.post_login_prompt(&csrf_token).await?;
        debug!(url = %auth0_url, "got auth0 URL");

        let (state, captcha) = self.authorize_and_identify(&auth0_url).await?;
        self.state = Some(state);

        info!(has_captcha = captcha.available(), "got auth0 authorization");

        Ok(captcha)
    }

    /// 完成登录，返回凭证。必须在`begin`成功之后调用。
    pub async fn finish(&mut self, captcha_answer: &str) -> ChatResult<Credentials> {
        let state = self.state.clone().ok_or_else(|| {
            ChatError::Precondition(
                "state unavailable, make sure begin was called and succeeded before finish"
                    .to_string(),
            )
        })?;

        // 从这里开始关闭重定向跟随：自动跟随会让后续请求带上第二个
        // Referer并打乱顺序，上游会拒绝
        self.post_username(&state, captcha_answer).await?;
        info!("username sent");

        let new_state = self.post_password(&state).await?;
        info!("password sent");

        let callback_url = self.resume_session(&new_state, &state).await?;
        info!("session resumed");

        // 回调链会经过302/307落到聊天页，恢复重定向跟随
        let access_token = self.auth_callback(&callback_url).await?;
        debug!("logged in");

        let credentials = self.auth_session().await?;
        info!(expires = %credentials.expires, "got credentials");

        Ok(credentials)
    }

    /// 1. 登录落地页，种下cookie
    async fn open_login_page(&self) -> ChatResult<()> {
        let endpoint = format!("{}/auth/login", self.base_url);
        let headers = self.session.document_headers("none", None);

        let response = self.session.get(&endpoint, headers, true).await?;

        match response.status {
            StatusCode::OK => Ok(()),
            code => Err(ChatError::UnexpectedStatus {
                step: "begin",
                code: code.as_u16(),
            }),
        }
    }

    /// 2. CSRF token
    async fn fetch_csrf(&self) -> ChatResult<String> {
        let endpoint = format!("{}/api/auth/csrf", self.base_url);
        let referer = format!("{}/auth/login", self.base_url);
        let headers = self.session.api_headers(&referer);

        let response = self.session.get(&endpoint, headers, true).await?;

        match response.status {
            StatusCode::OK => {
                let parsed: CsrfResponse = serde_json::from_str(&response.body)
                    .map_err(|e| ChatError::malformed("getCsrf", format!("invalid json: {}", e)))?;
                if parsed.csrf_token.is_empty() {
                    return Err(ChatError::malformed("getCsrf", "csrfToken not found"));
                }
                Ok(parsed.csrf_token)
            }
            code => Err(ChatError::UnexpectedStatus {
                step: "getCsrf",
                code: code.as_u16(),
            }),
        }
    }

    /// 3. 登录提示，换取auth0授权URL
    async fn post_login_prompt(&self, csrf_token: &str) -> ChatResult<String> {
        let endpoint = format!("{}/api/auth/signin/auth0", self.base_url);
        let referer = format!("{}/auth/login", self.base_url);

        let mut headers = self.session.api_headers(&referer);
        if let Ok(origin) = HeaderValue::from_str(&self.base_url) {
            headers.insert("origin", origin);
        }

        let form = [
            ("callbackUrl", "/".to_string()),
            ("csrfToken", csrf_token.to_string()),
            ("json", "true".to_string()),
        ];

        let response = self
            .session
            .post_form(&endpoint, &[("prompt", "login")], &form, headers, true)
            .await?;

        match response.status {
            StatusCode::OK => {
                let parsed: SigninResponse = serde_json::from_str(&response.body).map_err(|e| {
                    ChatError::malformed("postLoginPrompt", format!("invalid json: {}", e))
                })?;
                if parsed.url.is_empty() {
                    return Err(ChatError::malformed("postLoginPrompt", "url not found"));
                }
                let oauth_error = format!("{}/api/auth/error?error=OAuthSignin", self.base_url);
                if parsed.url == oauth_error || parsed.url.contains("error") {
                    return Err(ChatError::RateLimited(format!(
                        "postLoginPrompt: invalid url returned ({})",
                        parsed.url
                    )));
                }
                Ok(parsed.url)
            }
            StatusCode::BAD_REQUEST => Err(ChatError::malformed("postLoginPrompt", "bad request")),
            code => Err(ChatError::UnexpectedStatus {
                step: "postLoginPrompt",
                code: code.as_u16(),
            }),
        }
    }

    /// 4. 跟随授权URL落到identifier页，取出state和可能的验证码
    async fn authorize_and_identify(&self, auth0_url: &str) -> ChatResult<(String, Captcha)> {
        let referer = format!("{}/", self.base_url);
        let headers = self.session.document_headers("same-site", Some(&referer));

        let response = self.session.get(auth0_url, headers, true).await?;

        match response.status {
            StatusCode::OK => {
                let state = query_state(&response.final_url);

                if state.is_empty() {
                    return Err(ChatError::malformed(
                        "auth0AuthorizeAndIdentifier",
                        "state not found",
                    ));
                }

                let captcha = extract_captcha(&response.body);
                if captcha.available() {
                    info!("captcha detected");
                }

                Ok((state, captcha))
            }
            code => Err(ChatError::UnexpectedStatus {
                step: "auth0AuthorizeAndIdentifier",
                code: code.as_u16(),
            }),
        }
    }

    /// 5. 提交邮箱，期待302（不跟随）
    async fn post_username(&self, state: &str, captcha_answer: &str) -> ChatResult<()> {
        let endpoint = format!("{}/u/login/identifier", self.auth_base_url);
        let referer = format!("{}/u/login/identifier?state={}", self.auth_base_url, state);
        let headers = self.session.form_headers(&self.auth_base_url, &referer);

        let mut form = vec![
            ("state", state.to_string()),
            ("username", self.email.clone()),
            ("js-available", "false".to_string()),
            ("webauthn-available", "true".to_string()),
            ("is-brave", "false".to_string()),
            ("webauthn-platform-available", "true".to_string()),
            ("action", "default".to_string()),
        ];
        if !captcha_answer.is_empty() {
            form.push(("captcha", captcha_answer.to_string()));
        }

        let response = self
            .session
            .post_form(&endpoint, &[("state", state)], &form, headers, false)
            .await?;

        match response.status {
            StatusCode::FOUND => Ok(()),
            code => Err(ChatError::UnexpectedStatus {
                step: "postUserName",
                code: code.as_u16(),
            }),
        }
    }

    /// 6. 提交密码，期待302，新的state在Location里
    async fn post_password(&self, state: &str) -> ChatResult<String> {
        let endpoint = format!("{}/u/login/password", self.auth_base_url);
        let referer = format!("{}/u/login/password?state={}", self.auth_base_url, state);
        let headers = self.session.form_headers(&self.auth_base_url, &referer);

        let form = [
            ("state", state.to_string()),
            ("username", self.email.clone()),
            ("password", self.password.clone()),
            ("action", "default".to_string()),
        ];

        let response = self
            .session
            .post_form(&endpoint, &[("state", state)], &form, headers, false)
            .await?;

        match response.status {
            StatusCode::FOUND => {
                let location = response.location.unwrap_or_default();
                let new_state = query_state(&self.resolve_url(&location)?);
                if new_state.is_empty() {
                    return Err(ChatError::malformed(
                        "postPassword",
                        "status found but no state in location",
                    ));
                }
                Ok(new_state)
            }
            code => Err(ChatError::malformed(
                "postPassword",
                format!(
                    "invalid status code returned ({}), password incorrect or wrong captcha",
                    code.as_u16()
                ),
            )),
        }
    }

    /// 7. 恢复授权会话，期待302，Location是回调URL
    async fn resume_session(&self, new_state: &str, old_state: &str) -> ChatResult<String> {
        let endpoint = format!(
            "{}/authorize/resume?state={}",
            self.auth_base_url, new_state
        );
        let referer = format!(
            "{}/u/login/password?state={}",
            self.auth_base_url, old_state
        );
        let headers = self.session.document_headers("same-origin", Some(&referer));

        let response = self.session.get(&endpoint, headers, false).await?;

        match response.status {
            StatusCode::FOUND => match response.location {
                Some(location) if !location.is_empty() => {
                    Ok(self.resolve_url(&location)?.to_string())
                }
                _ => Err(ChatError::malformed(
                    "resumeSession",
                    "couldn't find redirect url",
                )),
            },
            code => Err(ChatError::UnexpectedStatus {
                step: "resumeSession",
                code: code.as_u16(),
            }),
        }
    }

    /// 8. 跟随回调链（302 → 307 → 200），从__NEXT_DATA__拿access token
    async fn auth_callback(&self, callback_url: &str) -> ChatResult<String> {
        let headers = self.session.document_headers("same-site", None);

        let response = self.session.get(callback_url, headers, true).await?;

        match response.status {
            StatusCode::OK => {
                let next_data = extract_next_data(&response.body).ok_or_else(|| {
                    ChatError::malformed("authCallback", "__NEXT_DATA__ not found")
                })?;

                let parsed: serde_json::Value = serde_json::from_str(&next_data).map_err(|e| {
                    ChatError::malformed("authCallback", format!("invalid __NEXT_DATA__ json: {}", e))
                })?;

                let token = parsed
                    .pointer("/props/pageProps/accessToken")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();

                if token.is_empty() {
                    return Err(ChatError::malformed("authCallback", "couldn't find token"));
                }

                Ok(token.to_string())
            }
            code => Err(ChatError::UnexpectedStatus {
                step: "authCallback",
                code: code.as_u16(),
            }),
        }
    }

    /// 9. 会话端点，换取最终凭证
    async fn auth_session(&self) -> ChatResult<Credentials> {
        let endpoint = format!("{}/api/auth/session", self.base_url);
        let referer = format!("{}/chat", self.base_url);
        let headers = self.session.api_headers(&referer);

        let response = self.session.get(&endpoint, headers, true).await?;

        match response.status {
            StatusCode::OK => serde_json::from_str(&response.body)
                .map_err(|e| ChatError::malformed("authSession", format!("invalid json: {}", e))),
            code => Err(ChatError::UnexpectedStatus {
                step: "authSession",
                code: code.as_u16(),
            }),
        }
    }

    /// Location可能是相对路径，相对auth0域解析
    fn resolve_url(&self, location: &str) -> ChatResult<Url> {
        if let Ok(url) = Url::parse(location) {
            return Ok(url);
        }
        let base = Url::parse(&self.auth_base_url)
            .map_err(|e| ChatError::malformed("resolveUrl", format!("invalid base url: {}", e)))?;
        base.join(location)
            .map_err(|e| ChatError::malformed("resolveUrl", format!("invalid location: {}", e)))
    }
}

/// 取URL查询串中的state参数
fn query_state(url: &Url) -> String {
    url.query_pairs()
        .find_map(|(key, value)| {
            if key == "state" {
                Some(value.into_owned())
            } else {
                None
            }
        })
        .unwrap_or_default()
}

/// 从identifier页面HTML中提取<img alt="captcha">的src
fn extract_captcha(html: &str) -> Captcha {
    let tag = Regex::new(r#"<img[^>]*\balt=["']captcha["'][^>]*>"#).unwrap();
    let src = Regex::new(r#"\bsrc=["']([^"']+)["']"#).unwrap();

    tag.find(html)
        .and_then(|m| src.captures(m.as_str()))
        .and_then(|c| c.get(1))
        .map(|m| Captcha::new(m.as_str()))
        .unwrap_or_default()
}

/// 提取<script id="__NEXT_DATA__">的JSON内容
fn extract_next_data(html: &str) -> Option<String> {
    let re = Regex::new(r#"(?s)<script[^>]*\bid=["']__NEXT_DATA__["'][^>]*>(.*?)</script>"#).unwrap();
    re.captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_flow(server: &MockServer) -> AuthFlow {
        let mut config = Config::default().chatgpt;
        config.base_url = server.uri();
        config.auth_base_url = server.uri();
        config.email = "user@example.com".to_string();
        config.password = "hunter2".to_string();
        AuthFlow::new(&config).unwrap()
    }

    const CAPTCHA_SRC: &str = "data:image/svg+xml;base64,PHN2Zy8+";

    async fn mount_begin_steps(server: &MockServer, identifier_html: &str) {
        Mock::given(method("GET"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/auth/csrf"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"csrfToken": "csrf-1"})))
            .mount(server)
            .await;

        Mock::given(method("POST"))
            .and(path("/api/auth/signin/auth0"))
            .and(query_param("prompt", "login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"url": format!("{}/authorize", server.uri())})),
            )
            .mount(server)
            .await;

        Mock::given(method("GET"))
            .and(path("/authorize"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("Location", "/u/login/identifier?state=st-1"),
            )
            .mount(server)
            .await;

        Mock::given(method("GET"))
            .and(path("/u/login/identifier"))
            .respond_with(ResponseTemplate::new(200).set_body_string(identifier_html.to_string()))
            .mount(server)
            .await;
    }

    #[test]
    fn test_extract_captcha() {
        let html = format!(
            r#"<html><body><form><img alt="captcha" src="{}"></form></body></html>"#,
            CAPTCHA_SRC
        );
        assert_eq!(extract_captcha(&html).as_str(), CAPTCHA_SRC);
        assert!(!extract_captcha("<html><img src=\"x.png\"></html>").available());
    }

    #[test]
    fn test_extract_next_data() {
        let html = r#"<script id="__NEXT_DATA__" type="application/json">{"props":{}}</script>"#;
        assert_eq!(extract_next_data(html).unwrap(), r#"{"props":{}}"#);
        assert!(extract_next_data("<script>var x;</script>").is_none());
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let server = MockServer::start().await;
        let mut config = Config::default().chatgpt;
        config.base_url = server.uri();
        config.auth_base_url = server.uri();
        let mut flow = AuthFlow::new(&config).unwrap();

        assert!(matches!(
            flow.begin().await,
            Err(ChatError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_csrf_token_missing() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/auth/csrf"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let mut flow = test_flow(&server);
        let err = flow.begin().await.unwrap_err();
        assert!(err.to_string().contains("csrfToken"));
    }

    #[tokio::test]
    async fn test_rate_limited_url() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/auth/csrf"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"csrfToken": "csrf-1"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/signin/auth0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"url": format!("{}/api/auth/error?error=OAuthSignin", server.uri())}),
            ))
            .mount(&server)
            .await;

        let mut flow = test_flow(&server);
        assert!(matches!(
            flow.begin().await,
            Err(ChatError::RateLimited(_))
        ));
    }

    #[tokio::test]
    async fn test_begin_returns_captcha_verbatim() {
        let server = MockServer::start().await;
        let html = format!(r#"<html><img alt="captcha" src="{}"></html>"#, CAPTCHA_SRC);
        mount_begin_steps(&server, &html).await;

        let mut flow = test_flow(&server);
        let captcha = flow.begin().await.unwrap();
        assert_eq!(captcha.as_str(), CAPTCHA_SRC);
    }

    #[tokio::test]
    async fn test_finish_without_begin() {
        let server = MockServer::start().await;
        let mut flow = test_flow(&server);

        assert!(matches!(
            flow.finish("").await,
            Err(ChatError::Precondition(_))
        ));
    }

    #[tokio::test]
    async fn test_full_login_flow_and_redirect_policy() {
        let server = MockServer::start().await;
        mount_begin_steps(&server, "<html><form></form></html>").await;

        // identifier的302目标不能被自动跟随
        Mock::given(method("GET"))
            .and(path("/should-not-be-followed"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/u/login/identifier"))
            .and(query_param("state", "st-1"))
            .and(body_string_contains("username=user%40example.com"))
            .and(body_string_contains("webauthn-available=true"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", "/should-not-be-followed"),
            )
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/u/login/password"))
            .and(query_param("state", "st-1"))
            .and(body_string_contains("password=hunter2"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("Location", "/authorize/resume?state=st-2"),
            )
            .expect(1)
            .mount(&server)
            .await;

        // 若重定向策略错误，password的302也会被跟随，这里会命中两次
        Mock::given(method("GET"))
            .and(path("/authorize/resume"))
            .and(query_param("state", "st-2"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/callback"))
            .expect(1)
            .mount(&server)
            .await;

        // 回调链必须被跟随到200
        Mock::given(method("GET"))
            .and(path("/callback"))
            .respond_with(ResponseTemplate::new(307).insert_header("Location", "/chat"))
            .expect(1)
            .mount(&server)
            .await;

        let next_data = json!({"props": {"pageProps": {"accessToken": "at-1"}}});
        Mock::given(method("GET"))
            .and(path("/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                r#"<html><script id="__NEXT_DATA__" type="application/json">{}</script></html>"#,
                next_data
            )))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/auth/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"accessToken": "at-1", "expires": "2099-01-01T00:00:00Z"}),
            ))
            .mount(&server)
            .await;

        let mut flow = test_flow(&server);
        let captcha = flow.begin().await.unwrap();
        assert!(!captcha.available());

        let credentials = flow.finish("").await.unwrap();
        assert_eq!(credentials.access_token, "at-1");
        assert_eq!(credentials.expires.to_rfc3339(), "2099-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let server = MockServer::start().await;
        mount_begin_steps(&server, "<html></html>").await;

        Mock::given(method("POST"))
            .and(path("/u/login/identifier"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/next"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/u/login/password"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let mut flow = test_flow(&server);
        flow.begin().await.unwrap();

        let err = flow.finish("").await.unwrap_err();
        assert!(err
            .to_string()
            .contains("password incorrect or wrong captcha"));
    }
}
