//! Asynchronous client for the camp stream registry.
//!
//! The registry is the server-side record of who is broadcasting what in which
//! camp. Broadcasters create a record when they go live, keep it alive with
//! heartbeats, and delete it when they stop. [`SessionRegistry`] is the seam the
//! session core talks to; [`RegistryClient`] is the REST implementation and
//! [`InMemoryRegistry`] backs tests and offline wiring.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

mod memory;

pub use memory::{InMemoryRegistry, RegistryCall};

pub const DEFAULT_API_BASE: &str = "http://localhost:8080";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    #[serde(rename = "LIVE", alias = "LECTURE")]
    Lecture,
    #[serde(rename = "MOGAKCO", alias = "PEER_STUDY")]
    PeerStudy,
}

impl StreamKind {
    pub fn as_wire(self) -> &'static str {
        match self {
            StreamKind::Lecture => "LIVE",
            StreamKind::PeerStudy => "MOGAKCO",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

impl FromStr for StreamKind {
    type Err = RegistryError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "LIVE" | "LECTURE" => Ok(StreamKind::Lecture),
            "MOGAKCO" | "PEER_STUDY" => Ok(StreamKind::PeerStudy),
            other => Err(RegistryError::Decode(format!("unknown stream kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStreamRequest {
    pub title: String,
    #[serde(rename = "type")]
    pub kind: StreamKind,
    pub camp_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
}

/// A registry record as returned by create and list calls.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    #[serde(alias = "sessionId", deserialize_with = "id_from_number_or_string")]
    pub stream_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub owner_nickname: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<StreamKind>,
}

/// Liveness ping carrying the broadcaster's current capture flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub session_id: String,
    pub mic_on: bool,
    pub cam_on: bool,
    pub screen_on: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_target: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatEvent<'a> {
    event_type: &'static str,
    stream_session_id: &'a str,
    #[serde(flatten)]
    heartbeat: &'a Heartbeat,
}

fn id_from_number_or_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(u64),
        Text(String),
    }
    Ok(match RawId::deserialize(deserializer)? {
        RawId::Number(n) => n.to_string(),
        RawId::Text(s) => s,
    })
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registry rejected credentials")]
    Unauthorized,
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("invalid registry response: {0}")]
    Decode(String),
    #[error("registry unavailable: {0}")]
    Unavailable(String),
    #[error("unknown stream session: {0}")]
    NotFound(String),
}

/// The registry operations the session core depends on.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn create_session(
        &self,
        request: &CreateStreamRequest,
    ) -> Result<StreamSummary, RegistryError>;

    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), RegistryError>;

    async fn close_session(&self, camp_id: &str, session_id: &str) -> Result<(), RegistryError>;

    async fn list_active(&self, camp_id: &str) -> Result<Vec<StreamSummary>, RegistryError>;
}

#[derive(Clone)]
pub struct RegistryClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn expect_success(res: Response) -> Result<Response, RegistryError> {
        let status = res.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(RegistryError::Unauthorized);
        }
        if status.is_success() {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        Err(RegistryError::UnexpectedStatus { status, body })
    }

    async fn json_body<T>(res: Response) -> Result<T, RegistryError>
    where
        T: DeserializeOwned,
    {
        let text = res.text().await?;
        serde_json::from_str(&text).map_err(|err| RegistryError::Decode(err.to_string()))
    }
}

#[async_trait]
impl SessionRegistry for RegistryClient {
    async fn create_session(
        &self,
        request: &CreateStreamRequest,
    ) -> Result<StreamSummary, RegistryError> {
        let url = self.url(&format!("/api/camps/{}/streams", request.camp_id));
        let res = self
            .authorize(self.http.post(url).json(request))
            .send()
            .await?;
        let res = Self::expect_success(res).await?;
        let created: StreamSummary = Self::json_body(res).await?;
        tracing::debug!(
            target = "camp_live::registry",
            stream_id = %created.stream_id,
            camp_id = %request.camp_id,
            "stream session created"
        );
        Ok(created)
    }

    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), RegistryError> {
        let event = HeartbeatEvent {
            event_type: "HEARTBEAT",
            stream_session_id: &heartbeat.session_id,
            heartbeat,
        };
        let res = self
            .authorize(self.http.post(self.url("/api/streams/events")).json(&event))
            .send()
            .await?;
        Self::expect_success(res).await?;
        Ok(())
    }

    async fn close_session(&self, camp_id: &str, session_id: &str) -> Result<(), RegistryError> {
        let url = self.url(&format!("/api/camps/{camp_id}/streams/{session_id}"));
        let res = self.authorize(self.http.delete(url)).send().await?;
        match Self::expect_success(res).await {
            Ok(_) => Ok(()),
            Err(RegistryError::UnexpectedStatus { status, .. }) if status == StatusCode::NOT_FOUND => {
                Err(RegistryError::NotFound(session_id.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    async fn list_active(&self, camp_id: &str) -> Result<Vec<StreamSummary>, RegistryError> {
        let url = self.url(&format!("/api/camps/{camp_id}/streams"));
        let res = self.authorize(self.http.get(url)).send().await?;
        let res = Self::expect_success(res).await?;
        Self::json_body(res).await
    }
}
