//! Minimal W3C WebDriver client (geckodriver) backing the browser sessions.

use crate::notify::truncate_error_body;
use crate::session::{BrowserSession, SessionFactory};
use anyhow::{anyhow, Context, Result};
use audit_core::{AuditError, ProxyConfig};
use reqwest::blocking::Client as HttpClient;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

pub const DEFAULT_WEBDRIVER_URL: &str = "http://127.0.0.1:4444";
const CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Deserialize)]
struct W3cEnvelope {
    value: Value,
}

#[derive(Deserialize)]
struct W3cError {
    error: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewSession {
    session_id: String,
}

#[derive(Clone)]
struct WebDriverClient {
    endpoint: String,
    http: HttpClient,
}

impl WebDriverClient {
    fn url_for_path(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn call(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = self.url_for_path(path);
        let mut builder = self.http.request(method.clone(), &url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder
            .send()
            .map_err(|err| anyhow!("webdriver {} {} transport error: {}", method, url, err))?;
        let status = response.status();
        let raw = response
            .text()
            .with_context(|| format!("webdriver {} {} returned no body", method, url))?;
        let envelope = serde_json::from_str::<W3cEnvelope>(&raw);
        if !status.is_success() {
            if let Ok(error) = envelope
                .as_ref()
                .map_err(|_| ())
                .and_then(|env| W3cError::deserialize(&env.value).map_err(|_| ()))
            {
                return Err(anyhow!(AuditError::WebDriver {
                    code: error.error,
                    message: error.message,
                }));
            }
            return Err(anyhow!(
                "webdriver {} {} failed: status={} body={}",
                method,
                url,
                status.as_u16(),
                truncate_error_body(&raw)
            ));
        }
        envelope
            .map(|env| env.value)
            .map_err(|err| anyhow!("webdriver {} {} returned invalid JSON: {}", method, url, err))
    }
}

/// Opens one Firefox session per agent on a running WebDriver server.
pub struct WebDriverSessionFactory {
    client: WebDriverClient,
    headless: bool,
}

impl WebDriverSessionFactory {
    pub fn new(endpoint: &str, headless: bool) -> Result<Self> {
        let endpoint = endpoint.trim().to_string();
        if endpoint.is_empty() {
            return Err(anyhow!("webdriver endpoint must not be empty"));
        }
        let http = HttpClient::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(None)
            .build()?;
        Ok(Self {
            client: WebDriverClient { endpoint, http },
            headless,
        })
    }

    fn capabilities(&self, proxy: Option<&ProxyConfig>) -> Value {
        let args: Vec<&str> = if self.headless {
            vec!["-headless"]
        } else {
            Vec::new()
        };
        let mut always_match = json!({
            "browserName": "firefox",
            "moz:firefoxOptions": { "args": args },
        });
        if let Some(proxy) = proxy {
            let host_port = proxy.host_port();
            always_match["proxy"] = json!({
                "proxyType": "manual",
                "httpProxy": host_port,
                "sslProxy": host_port,
            });
        }
        json!({ "capabilities": { "alwaysMatch": always_match } })
    }
}

impl SessionFactory for WebDriverSessionFactory {
    fn open(&self, identity: &str, proxy: Option<&ProxyConfig>) -> Result<Box<dyn BrowserSession>> {
        let value = self
            .client
            .call(Method::POST, "session", Some(&self.capabilities(proxy)))?;
        let created = NewSession::deserialize(&value)
            .map_err(|err| anyhow!("webdriver new session response invalid: {}", err))?;
        info!(agent = %identity, session_id = %created.session_id, "browser session opened");
        Ok(Box::new(WebDriverSession {
            client: self.client.clone(),
            session_id: created.session_id,
        }))
    }
}

pub struct WebDriverSession {
    client: WebDriverClient,
    session_id: String,
}

impl WebDriverSession {
    fn path(&self, command: &str) -> String {
        if command.is_empty() {
            format!("session/{}", self.session_id)
        } else {
            format!("session/{}/{}", self.session_id, command)
        }
    }

    fn get_string(&self, command: &str) -> Result<String> {
        match self.client.call(Method::GET, &self.path(command), None)? {
            Value::String(value) => Ok(value),
            other => Err(anyhow!("webdriver {} returned non-string value: {}", command, other)),
        }
    }
}

impl BrowserSession for WebDriverSession {
    fn navigate(&self, url: &Url) -> Result<()> {
        debug!(session_id = %self.session_id, url = %url, "navigate");
        self.client
            .call(Method::POST, &self.path("url"), Some(&json!({ "url": url.as_str() })))?;
        Ok(())
    }

    fn title(&self) -> Result<String> {
        self.get_string("title")
    }

    fn page_source(&self) -> Result<String> {
        self.get_string("source")
    }

    fn quit(&self) -> Result<()> {
        self.client.call(Method::DELETE, &self.path(""), None)?;
        debug!(session_id = %self.session_id, "webdriver session deleted");
        Ok(())
    }
}
