use crate::error::ChatResult;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderValue, LOCATION};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Chrome 107的client hints，与config::USER_AGENT对应
pub const CLIENT_HINT_UA: &str =
    r#""Google Chrome";v="107", "Chromium";v="107", "Not=A?Brand";v="24""#;

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.9";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// 完整缓冲的响应
#[derive(Debug)]
pub struct BrowserResponse {
    pub status: StatusCode,
    pub final_url: Url,
    pub location: Option<String>,
    pub body: String,
}

/// 模拟浏览器的HTTP层。
///
/// 上游会对请求头顺序做指纹识别，所以每个步骤的请求头按Chrome的实际
/// 发送顺序插入。reqwest无法按请求切换重定向策略，这里在同一个cookie
/// jar上构建两个client，由调用方按步骤选择是否跟随重定向。
pub struct BrowserSession {
    follow: Client,
    no_follow: Client,
    user_agent: String,
}

impl BrowserSession {
    pub fn new(user_agent: &str, proxy: Option<&str>) -> ChatResult<Self> {
        let jar = Arc::new(Jar::default());

        let builder = || {
            let mut b = Client::builder()
                .cookie_provider(jar.clone())
                .timeout(Duration::from_secs(30));
            // 未显式指定代理时reqwest会读取环境变量中的代理配置
            if let Some(url) = proxy {
                if let Ok(p) = reqwest::Proxy::all(url) {
                    b = b.proxy(p);
                }
            }
            b
        };

        let follow = builder().redirect(Policy::limited(10)).build()?;
        let no_follow = builder().redirect(Policy::none()).build()?;

        Ok(Self {
            follow,
            no_follow,
            user_agent: user_agent.to_string(),
        })
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub async fn get(
        &self,
        url: &str,
        headers: HeaderMap,
        follow: bool,
    ) -> ChatResult<BrowserResponse> {
        debug!(url, follow, "GET");

        let client = if follow { &self.follow } else { &self.no_follow };
        let response = client.get(url).headers(headers).send().await?;

        Self::buffer(response).await
    }

    pub async fn post_form(
        &self,
        url: &str,
        query: &[(&str, &str)],
        form: &[(&str, String)],
        headers: HeaderMap,
        follow: bool,
    ) -> ChatResult<BrowserResponse> {
        debug!(url, follow, "POST");

        let client = if follow { &self.follow } else { &self.no_follow };
        let response = client
            .post(url)
            .query(query)
            .headers(headers)
            .form(form)
            .send()
            .await?;

        Self::buffer(response).await
    }

    async fn buffer(response: reqwest::Response) -> ChatResult<BrowserResponse> {
        let status = response.status();
        let final_url = response.url().clone();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        debug!(status = status.as_u16(), %final_url, "request finished");

        Ok(BrowserResponse {
            status,
            final_url,
            location,
            body,
        })
    }

    /// 页面导航请求头（accept: text/html）
    pub fn document_headers(&self, site: &str, referer: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("sec-ch-ua", HeaderValue::from_static(CLIENT_HINT_UA));
        headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
        headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Windows\""));
        headers.insert("dnt", HeaderValue::from_static("1"));
        headers.insert("upgrade-insecure-requests", HeaderValue::from_static("1"));
        if let Ok(ua) = HeaderValue::from_str(&self.user_agent) {
            headers.insert("user-agent", ua);
        }
        headers.insert("accept", HeaderValue::from_static(ACCEPT_HTML));
        if let Ok(v) = HeaderValue::from_str(site) {
            headers.insert("sec-fetch-site", v);
        }
        headers.insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
        headers.insert("sec-fetch-user", HeaderValue::from_static("?1"));
        headers.insert("sec-fetch-dest", HeaderValue::from_static("document"));
        if let Some(r) = referer {
            if let Ok(v) = HeaderValue::from_str(r) {
                headers.insert("referer", v);
            }
        }
        headers.insert("accept-language", HeaderValue::from_static(ACCEPT_LANGUAGE));
        headers
    }

    /// XHR请求头（accept: */*）
    pub fn api_headers(&self, referer: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("sec-ch-ua", HeaderValue::from_static(CLIENT_HINT_UA));
        headers.insert("dnt", HeaderValue::from_static("1"));
        headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
        if let Ok(ua) = HeaderValue::from_str(&self.user_agent) {
            headers.insert("user-agent", ua);
        }
        headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Windows\""));
        headers.insert("accept", HeaderValue::from_static("*/*"));
        headers.insert("sec-fetch-site", HeaderValue::from_static("same-origin"));
        headers.insert("sec-fetch-mode", HeaderValue::from_static("cors"));
        headers.insert("sec-fetch-dest", HeaderValue::from_static("empty"));
        if let Ok(v) = HeaderValue::from_str(referer) {
            headers.insert("referer", v);
        }
        headers.insert("accept-language", HeaderValue::from_static(ACCEPT_LANGUAGE));
        headers
    }

    /// 表单提交请求头，content-type由.form()补充
    pub fn form_headers(&self, origin: &str, referer: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("cache-control", HeaderValue::from_static("max-age=0"));
        headers.insert("sec-ch-ua", HeaderValue::from_static(CLIENT_HINT_UA));
        headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
        headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Windows\""));
        if let Ok(v) = HeaderValue::from_str(origin) {
            headers.insert("origin", v);
        }
        headers.insert("dnt", HeaderValue::from_static("1"));
        headers.insert("upgrade-insecure-requests", HeaderValue::from_static("1"));
        if let Ok(ua) = HeaderValue::from_str(&self.user_agent) {
            headers.insert("user-agent", ua);
        }
        headers.insert("accept", HeaderValue::from_static(ACCEPT_HTML));
        headers.insert("sec-fetch-site", HeaderValue::from_static("same-origin"));
        headers.insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
        headers.insert("sec-fetch-user", HeaderValue::from_static("?1"));
        headers.insert("sec-fetch-dest", HeaderValue::from_static("document"));
        if let Ok(v) = HeaderValue::from_str(referer) {
            headers.insert("referer", v);
        }
        headers.insert("accept-language", HeaderValue::from_static(ACCEPT_LANGUAGE));
        headers
    }
}
