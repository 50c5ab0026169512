//! OpenAI integration
//!
//! Chat completions with tool calling, the Assistants v2 thread/run API, and
//! file + vector store management for the knowledge base.

use crate::config::Config;
use crate::error::{AvatalkError, AvatalkResult};
use crate::ledger::KnowledgeStore;
use crate::response::{
    AssistantBackend, Completion, CompletionBackend, CompletionRequest, Role, RunStatus,
    ThreadMessage,
};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

const SERVICE: &str = "OpenAI";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const PAGE_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    /// JSON-encoded argument object
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    status: String,
    #[serde(default)]
    last_error: Option<RunError>,
}

#[derive(Debug, Deserialize)]
struct RunError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<MessageObject>,
}

#[derive(Debug, Deserialize)]
struct MessageObject {
    id: String,
    role: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    content: Vec<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<TextContent>,
}

#[derive(Debug, Deserialize)]
struct TextContent {
    value: String,
}

impl MessageObject {
    fn into_message(self) -> ThreadMessage {
        let text = self
            .content
            .into_iter()
            .filter(|c| c.kind == "text")
            .filter_map(|c| c.text.map(|t| t.value))
            .collect::<Vec<_>>()
            .join("\n");
        ThreadMessage {
            id: self.id,
            role: if self.role == "assistant" {
                Role::Assistant
            } else {
                Role::User
            },
            text,
            completed: self.status.as_deref() != Some("in_progress"),
        }
    }
}

/// Client for the OpenAI REST API
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    completion_model: String,
    assistant_model: String,
}

impl OpenAiClient {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: config.openai_url.trim_end_matches('/').to_string(),
            api_key: config.openai_api_key.clone(),
            completion_model: config.completion_model.clone(),
            assistant_model: config.assistant_model.clone(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.url, path))
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_TIMEOUT)
    }

    /// Assistants v2 endpoints need the beta header
    fn beta(&self, method: Method, path: &str) -> RequestBuilder {
        self.request(method, path).header("OpenAI-Beta", "assistants=v2")
    }

    async fn send(&self, request: RequestBuilder) -> AvatalkResult<Value> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AvatalkError::Unauthorized(format!(
                "{SERVICE}: {}",
                error_message(&body)
            )));
        }
        if !status.is_success() {
            warn!("❌ {} API Error ({}): {}", SERVICE, status, body);
            return Err(AvatalkError::backend(
                SERVICE,
                format!("{status}: {}", error_message(&body)),
            ));
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn send_as<T: DeserializeOwned>(&self, request: RequestBuilder) -> AvatalkResult<T> {
        Ok(serde_json::from_value(self.send(request).await?)?)
    }
}

/// Pull `error.message` out of an error body, or return the body itself
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(|m| m.to_string()))
        .unwrap_or_else(|| body.trim().to_string())
}

fn chat_body(model: &str, request: &CompletionRequest) -> Value {
    let mut body = json!({
        "model": model,
        "messages": [
            { "role": "system", "content": request.system },
            { "role": "user", "content": request.user }
        ],
        "temperature": request.temperature,
        "max_tokens": request.max_tokens,
    });
    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters
                    }
                })
            })
            .collect();
        body["tool_choice"] = json!("auto");
    }
    body
}

fn parse_completion(response: ChatResponse) -> AvatalkResult<Completion> {
    let message = response
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| AvatalkError::backend(SERVICE, "completion has no choices"))?;

    if let Some(call) = message.tool_calls.unwrap_or_default().into_iter().next() {
        let arguments = if call.function.arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&call.function.arguments)?
        };
        return Ok(Completion::ToolCall {
            name: call.function.name,
            arguments,
        });
    }
    Ok(Completion::Text(message.content.unwrap_or_default()))
}

#[async_trait]
impl CompletionBackend for OpenAiClient {
    async fn complete(&self, request: CompletionRequest) -> AvatalkResult<Completion> {
        debug!("🧠 Chat completion ({} tools)", request.tools.len());
        let body = chat_body(&self.completion_model, &request);
        let response: ChatResponse = self
            .send_as(self.request(Method::POST, "/chat/completions").json(&body))
            .await?;
        parse_completion(response)
    }
}

#[async_trait]
impl AssistantBackend for OpenAiClient {
    async fn create_thread(&self) -> AvatalkResult<String> {
        let created: Created = self
            .send_as(self.beta(Method::POST, "/threads").json(&json!({})))
            .await?;
        Ok(created.id)
    }

    async fn delete_thread(&self, thread_id: &str) -> AvatalkResult<()> {
        self.send(self.beta(Method::DELETE, &format!("/threads/{thread_id}")))
            .await
            .map(|_| ())
    }

    async fn append_message(
        &self,
        thread_id: &str,
        role: Role,
        text: &str,
    ) -> AvatalkResult<String> {
        let created: Created = self
            .send_as(
                self.beta(Method::POST, &format!("/threads/{thread_id}/messages"))
                    .json(&json!({ "role": role.as_str(), "content": text })),
            )
            .await?;
        Ok(created.id)
    }

    async fn create_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
        instructions: &str,
    ) -> AvatalkResult<String> {
        let mut body = json!({
            "assistant_id": assistant_id,
            "model": self.assistant_model,
        });
        if !instructions.is_empty() {
            body["instructions"] = json!(instructions);
        }
        let created: Created = self
            .send_as(
                self.beta(Method::POST, &format!("/threads/{thread_id}/runs"))
                    .json(&body),
            )
            .await?;
        Ok(created.id)
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> AvatalkResult<RunStatus> {
        let run: RunObject = self
            .send_as(self.beta(Method::GET, &format!("/threads/{thread_id}/runs/{run_id}")))
            .await?;
        let reason = run
            .last_error
            .map(|e| match (e.code, e.message) {
                (Some(code), Some(message)) => format!("{code}: {message}"),
                (code, message) => message.or(code).unwrap_or_default(),
            })
            .filter(|r| !r.is_empty());
        Ok(RunStatus::from_wire(&run.status, reason))
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> AvatalkResult<()> {
        self.send(self.beta(
            Method::POST,
            &format!("/threads/{thread_id}/runs/{run_id}/cancel"),
        ))
        .await
        .map(|_| ())
    }

    async fn last_message_id(&self, thread_id: &str) -> AvatalkResult<Option<String>> {
        let list: MessageList = self
            .send_as(
                self.beta(Method::GET, &format!("/threads/{thread_id}/messages"))
                    .query(&[("order", "desc"), ("limit", "1")]),
            )
            .await?;
        Ok(list.data.into_iter().next().map(|m| m.id))
    }

    async fn list_messages(
        &self,
        thread_id: &str,
        after: Option<&str>,
    ) -> AvatalkResult<Vec<ThreadMessage>> {
        let limit = PAGE_LIMIT.to_string();
        let mut query = vec![("order", "asc"), ("limit", limit.as_str())];
        if let Some(after) = after {
            query.push(("after", after));
        }
        let list: MessageList = self
            .send_as(
                self.beta(Method::GET, &format!("/threads/{thread_id}/messages"))
                    .query(&query),
            )
            .await?;
        Ok(list.data.into_iter().map(MessageObject::into_message).collect())
    }
}

#[async_trait]
impl KnowledgeStore for OpenAiClient {
    async fn upload_text(&self, filename: &str, text: &str) -> AvatalkResult<String> {
        let part = reqwest::multipart::Part::bytes(text.as_bytes().to_vec())
            .file_name(filename.to_string())
            .mime_str("text/plain")?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", part);
        let created: Created = self
            .send_as(
                self.request(Method::POST, "/files")
                    .timeout(UPLOAD_TIMEOUT)
                    .multipart(form),
            )
            .await?;
        Ok(created.id)
    }

    async fn attach(&self, store_id: &str, file_id: &str) -> AvatalkResult<()> {
        self.send(
            self.beta(Method::POST, &format!("/vector_stores/{store_id}/files"))
                .json(&json!({ "file_id": file_id })),
        )
        .await
        .map(|_| ())
    }

    async fn detach(&self, store_id: &str, file_id: &str) -> AvatalkResult<()> {
        self.send(self.beta(
            Method::DELETE,
            &format!("/vector_stores/{store_id}/files/{file_id}"),
        ))
        .await
        .map(|_| ())
    }

    async fn delete_file(&self, file_id: &str) -> AvatalkResult<()> {
        self.send(self.request(Method::DELETE, &format!("/files/{file_id}")))
            .await
            .map(|_| ())
    }
}
