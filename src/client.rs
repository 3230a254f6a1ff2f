//! HTTP client for the driver API, used by the CLI and by test drivers.

use crate::core::SessionState;
use crate::web::{DRIVER_PREFIX, ErrorResponse, SESSION_HEADER};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{code} ({status}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Deserialize)]
struct StartResponse {
    id: Option<String>,
    state: SessionState,
}

#[derive(Debug, Deserialize)]
struct WaitResponse {
    idle: bool,
}

#[derive(Debug, Clone)]
pub struct DriverClient {
    http: Client,
    base_url: String,
    session_id: Option<String>,
}

impl DriverClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            session_id: None,
        }
    }

    /// Addresses an existing session instead of the global one.
    pub fn with_session(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Starts a session and remembers its id for later calls.
    pub async fn start(&mut self, params: Value) -> Result<SessionState> {
        let response: StartResponse = self.send(self.post("start").json(&params)).await?;
        self.session_id = response.id;
        Ok(response.state)
    }

    pub async fn update(&self, params: Value) -> Result<SessionState> {
        self.send(self.post("set").json(&params)).await
    }

    pub async fn end(&mut self) -> Result<()> {
        let _: Value = self.send(self.post("end")).await?;
        self.session_id = None;
        Ok(())
    }

    pub async fn state(&self) -> Result<SessionState> {
        self.send(self.get("state")).await
    }

    pub async fn clear(&self) -> Result<Value> {
        self.send(self.post("clear")).await
    }

    pub async fn set_browser_session_state(&self, values: Map<String, Value>) -> Result<SessionState> {
        self.send(self.post("browsersessionstate").json(&Value::Object(values)))
            .await
    }

    pub async fn wait_for_idle(&self, quiet_ms: u64, timeout_ms: u64) -> Result<bool> {
        let request = self
            .get("wait")
            .query(&[("quiet_ms", quiet_ms), ("timeout_ms", timeout_ms)]);
        let response: WaitResponse = self.send(request).await?;
        Ok(response.idle)
    }

    pub async fn templates(&self) -> Result<Value> {
        let body: Value = self.send(self.get("templates")).await?;
        Ok(body.get("templates").cloned().unwrap_or_else(|| json!([])))
    }

    fn url(&self, action: &str) -> String {
        format!("{}{}/{}", self.base_url, DRIVER_PREFIX, action)
    }

    fn get(&self, action: &str) -> RequestBuilder {
        self.scoped(self.http.get(self.url(action)))
    }

    fn post(&self, action: &str) -> RequestBuilder {
        self.scoped(self.http.post(self.url(action)))
    }

    fn scoped(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.session_id {
            Some(id) => request.header(SESSION_HEADER, id),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let text = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ErrorResponse>(&text) {
        Ok(body) => (body.code, body.error),
        Err(_) => ("http_error".to_string(), text),
    };
    Err(ClientError::Api {
        status: status.as_u16(),
        code,
        message,
    })
}
