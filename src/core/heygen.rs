//! HeyGen streaming avatar integration
//!
//! Session lifecycle over the `v1/streaming.*` REST endpoints. The rendered
//! video is published to a LiveKit room described by [`StreamDescriptor`].

use crate::avatar::{AvatarBackend, AvatarSettings, SessionInfo, SpeakRequest, StreamDescriptor};
use crate::config::Config;
use crate::error::{AvatalkError, AvatalkResult};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

const SERVICE: &str = "HeyGen";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TokenData {
    token: String,
}

#[derive(Debug, Deserialize)]
struct NewSession {
    session_id: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct TaskData {
    #[serde(default)]
    duration_ms: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SessionList {
    #[serde(default)]
    sessions: Vec<ListedSession>,
}

#[derive(Debug, Deserialize)]
struct ListedSession {
    session_id: String,
}

/// Client for the HeyGen streaming API
#[derive(Clone)]
pub struct HeyGenClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

impl HeyGenClient {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: config.heygen_url.trim_end_matches('/').to_string(),
            api_key: config.heygen_api_key.clone(),
        }
    }

    async fn post(&self, path: &str, token: Option<&str>, body: Value) -> AvatalkResult<Value> {
        let mut request = self
            .http
            .post(format!("{}{}", self.url, path))
            .timeout(REQUEST_TIMEOUT)
            .json(&body);
        request = match token {
            Some(token) => request.bearer_auth(token),
            None => request.header("x-api-key", &self.api_key),
        };

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        check_response(status, &text)
    }
}

/// Map a HeyGen reply to its `data` payload or a classified error
fn check_response(status: reqwest::StatusCode, body: &str) -> AvatalkResult<Value> {
    let value: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let message = value["message"]
        .as_str()
        .or_else(|| value["error"]["message"].as_str())
        .or_else(|| value["error"].as_str())
        .map(|m| m.to_string())
        .unwrap_or_else(|| body.trim().to_string());
    let lowered = message.to_lowercase();

    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(AvatalkError::Unauthorized(format!("{SERVICE}: {message}")));
    }
    if lowered.contains("concurrent limit") {
        return Err(AvatalkError::ConcurrencyLimit(message));
    }
    if status == reqwest::StatusCode::NOT_FOUND
        || lowered.contains("session not found")
        || lowered.contains("session is closed")
    {
        return Err(AvatalkError::Disconnected);
    }
    if !status.is_success() {
        warn!("❌ {} API Error ({}): {}", SERVICE, status, message);
        return Err(AvatalkError::backend(SERVICE, format!("{status}: {message}")));
    }
    // Application errors can arrive with 200 and a non-100 code
    if let Some(code) = value["code"].as_i64() {
        if code != 100 {
            return Err(AvatalkError::backend(SERVICE, format!("code {code}: {message}")));
        }
    }
    Ok(value.get("data").cloned().unwrap_or(Value::Null))
}

fn session_body(settings: &AvatarSettings) -> Value {
    json!({
        "quality": settings.quality,
        "avatar_name": settings.avatar_name,
        "voice": {
            "voice_id": settings.voice_id,
            "rate": settings.voice_rate,
            "emotion": settings.voice_emotion,
        },
        "version": "v2",
        "video_encoding": "H264",
        "disable_idle_timeout": true,
    })
}

#[async_trait]
impl AvatarBackend for HeyGenClient {
    async fn create_token(&self) -> AvatalkResult<String> {
        let data = self.post("/v1/streaming.create_token", None, json!({})).await?;
        let token: TokenData = serde_json::from_value(data)?;
        Ok(token.token)
    }

    async fn create_session(
        &self,
        token: &str,
        settings: &AvatarSettings,
    ) -> AvatalkResult<SessionInfo> {
        let data = self
            .post("/v1/streaming.new", Some(token), session_body(settings))
            .await?;
        let created: NewSession = serde_json::from_value(data)?;
        debug!("🎭 Avatar session {} created, starting", created.session_id);

        self.post(
            "/v1/streaming.start",
            Some(token),
            json!({ "session_id": created.session_id }),
        )
        .await?;

        Ok(SessionInfo {
            session_id: created.session_id,
            token: token.to_string(),
            stream: StreamDescriptor {
                url: created.url,
                access_token: created.access_token,
            },
        })
    }

    async fn speak(
        &self,
        session: &SessionInfo,
        request: &SpeakRequest,
    ) -> AvatalkResult<Duration> {
        let data = self
            .post(
                "/v1/streaming.task",
                Some(session.token.as_str()),
                json!({
                    "session_id": session.session_id,
                    "text": request.text,
                    "task_type": "repeat",
                }),
            )
            .await?;
        let millis = serde_json::from_value::<TaskData>(data)
            .ok()
            .and_then(|task| task.duration_ms)
            .unwrap_or(0.0)
            .max(0.0);
        Ok(Duration::from_millis(millis as u64))
    }

    async fn stop_session(&self, session: &SessionInfo) -> AvatalkResult<()> {
        self.post(
            "/v1/streaming.stop",
            Some(session.token.as_str()),
            json!({ "session_id": session.session_id }),
        )
        .await
        .map(|_| ())
    }

    async fn terminate_all(&self, token: &str) -> AvatalkResult<()> {
        let url = format!("{}/v1/streaming.list", self.url);
        let response = self
            .http
            .get(url)
            .header("x-api-key", &self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        let data = check_response(status, &body)?;
        let list: SessionList = serde_json::from_value(data).unwrap_or(SessionList {
            sessions: Vec::new(),
        });

        for listed in list.sessions {
            info!("🧹 Stopping stale avatar session {}", listed.session_id);
            let result = self
                .post(
                    "/v1/streaming.stop",
                    Some(token),
                    json!({ "session_id": listed.session_id }),
                )
                .await;
            match result {
                Ok(_) | Err(AvatalkError::Disconnected) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_success_returns_data() {
        let data = check_response(
            StatusCode::OK,
            r#"{"code":100,"data":{"token":"abc"},"message":"Success"}"#,
        )
        .unwrap();
        assert_eq!(data["token"], "abc");
    }

    #[test]
    fn test_unauthorized() {
        let result = check_response(StatusCode::UNAUTHORIZED, r#"{"message":"Unauthorized"}"#);
        assert!(matches!(result, Err(AvatalkError::Unauthorized(_))));
    }

    #[test]
    fn test_concurrency_limit_is_distinguished() {
        let result = check_response(
            StatusCode::BAD_REQUEST,
            r#"{"code":10004,"message":"Concurrent limit reached"}"#,
        );
        assert!(matches!(result, Err(AvatalkError::ConcurrencyLimit(_))));

        // Same condition reported with a 200
        let result = check_response(
            StatusCode::OK,
            r#"{"code":10004,"message":"concurrent limit reached, close other sessions"}"#,
        );
        assert!(matches!(result, Err(AvatalkError::ConcurrencyLimit(_))));
    }

    #[test]
    fn test_closed_session_is_a_disconnect() {
        let result = check_response(
            StatusCode::BAD_REQUEST,
            r#"{"code":10005,"message":"Session not found"}"#,
        );
        assert!(matches!(result, Err(AvatalkError::Disconnected)));
    }

    #[test]
    fn test_other_failures() {
        let result = check_response(StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded");
        match result {
            Err(AvatalkError::Backend { service, message }) => {
                assert_eq!(service, "HeyGen");
                assert!(message.contains("upstream exploded"));
            }
            other => panic!("expected backend error, got {other:?}"),
        }

        let result = check_response(StatusCode::OK, r#"{"code":400123,"message":"bad avatar"}"#);
        assert!(matches!(result, Err(AvatalkError::Backend { .. })));
    }

    #[test]
    fn test_session_body() {
        let settings = AvatarSettings::from_config(&Config::default());
        let body = session_body(&settings);
        assert_eq!(body["quality"], "high");
        assert_eq!(body["voice"]["voice_id"], "bc69c9589d6747028dc5ec4aec2b43c3");
        assert_eq!(body["voice"]["emotion"], "excited");
        assert_eq!(body["disable_idle_timeout"], true);
    }
}
