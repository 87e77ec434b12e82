use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to {url} failed: {detail}")]
    Request { url: String, detail: String },

    #[error("unexpected status {status} from {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("failed to decode response from {url}: {detail}")]
    Decode { url: String, detail: String },
}

/// One conversation on the agent server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Typed response parts the agent server emits for a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    Tool {
        tool: String,
        #[serde(default)]
        state: serde_json::Value,
    },
    File {
        path: String,
    },
    Patch {
        #[serde(default)]
        files: Vec<String>,
    },
    Snapshot {
        snapshot: String,
    },
    StepStart,
    StepFinish,
    Agent {
        #[serde(default)]
        name: Option<String>,
    },
    Retry,
}

/// Aggregated result of one prompt or command round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptResult {
    pub session_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    pub parts: Vec<MessagePart>,
}

impl PromptResult {
    /// Concatenated text of all `text` parts.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let MessagePart::Text { text } = part {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    /// Paths named by `file` and `patch` parts.
    pub fn file_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for part in &self.parts {
            match part {
                MessagePart::File { path } => paths.push(path.clone()),
                MessagePart::Patch { files } => paths.extend(files.iter().cloned()),
                _ => {}
            }
        }
        paths
    }
}

/// Tracked file reported by `GET /file/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStatus {
    pub path: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Options for [`AgentApi::execute_prompt`].
#[derive(Debug, Clone, Default)]
pub struct PromptOptions {
    /// `provider/model`, split on the first `/`.
    pub model: Option<String>,
    /// Role label the server maps to an agent persona ("build", "reviewer", ...).
    pub agent_role: Option<String>,
    /// Reuse this session; a fresh one is created when absent.
    pub session_id: Option<String>,
    /// Title for a freshly created session.
    pub title: Option<String>,
    pub no_reply: bool,
}

/// Capability set the engine and activities depend on. Production wires the
/// HTTP [`AgentClient`]; tests substitute an in-memory variant.
#[async_trait]
pub trait AgentApi: Send + Sync {
    async fn execute_prompt(
        &self,
        prompt: &str,
        opts: PromptOptions,
    ) -> Result<PromptResult, ClientError>;

    async fn execute_command(
        &self,
        session_id: &str,
        command: &str,
        args: &[String],
    ) -> Result<PromptResult, ClientError>;

    async fn list_sessions(&self) -> Result<Vec<Session>, ClientError>;

    async fn get_session(&self, id: &str) -> Result<Session, ClientError>;

    async fn delete_session(&self, id: &str) -> Result<(), ClientError>;

    async fn abort_session(&self, id: &str) -> Result<(), ClientError>;

    async fn file_status(&self) -> Result<Vec<FileStatus>, ClientError>;

    async fn read_file(&self, path: &str) -> Result<String, ClientError>;
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelRef<'a> {
    provider_id: &'a str,
    model_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PromptRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<ModelRef<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    no_reply: bool,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum RequestPart<'a> {
    Text { text: &'a str },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandRequest<'a> {
    command: &'a str,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    arguments: &'a [String],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageResponse {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadFileResponse {
    content: String,
}

/// Split a `provider/model` string on the first `/`.
fn split_model(model: &str) -> (&str, &str) {
    match model.split_once('/') {
        Some((provider, rest)) => (provider, rest),
        None => ("", model),
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// HTTP client bound to one child agent server.
///
/// Stateless beyond the base URL: sessions live on the server.
pub struct AgentClient {
    http: reqwest::Client,
    base_url: String,
    port: u16,
}

impl AgentClient {
    pub fn new(base_url: impl Into<String>, port: u16) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            port,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<T, ClientError> {
        let resp = req.send().await.map_err(|e| ClientError::Request {
            url: url.to_string(),
            detail: e.to_string(),
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        resp.json::<T>().await.map_err(|e| ClientError::Decode {
            url: url.to_string(),
            detail: e.to_string(),
        })
    }

    async fn send_ok(&self, req: reqwest::RequestBuilder, url: &str) -> Result<(), ClientError> {
        let resp = req.send().await.map_err(|e| ClientError::Request {
            url: url.to_string(),
            detail: e.to_string(),
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn create_session(&self, title: Option<&str>) -> Result<Session, ClientError> {
        let url = self.url("/session");
        let req = self.http.post(&url).json(&CreateSessionRequest { title });
        let session: Session = self.send_json(req, &url).await?;
        debug!(port = self.port, session_id = %session.id, "created session");
        Ok(session)
    }
}

#[async_trait]
impl AgentApi for AgentClient {
    async fn execute_prompt(
        &self,
        prompt: &str,
        opts: PromptOptions,
    ) -> Result<PromptResult, ClientError> {
        let started = std::time::Instant::now();

        let session_id = match &opts.session_id {
            Some(id) => id.clone(),
            None => self.create_session(opts.title.as_deref()).await?.id,
        };

        debug!(
            port = self.port,
            session_id = %session_id,
            role = opts.agent_role.as_deref().unwrap_or("default"),
            prompt_chars = prompt.len(),
            "prompt started"
        );

        let model = opts.model.as_deref().map(|m| {
            let (provider_id, model_id) = split_model(m);
            ModelRef {
                provider_id,
                model_id,
            }
        });

        let body = PromptRequest {
            model,
            agent: opts.agent_role.as_deref(),
            no_reply: opts.no_reply,
            parts: vec![RequestPart::Text { text: prompt }],
        };

        let url = self.url(&format!("/session/{session_id}/prompt"));
        let req = self.http.post(&url).json(&body);
        let resp: MessageResponse = match self.send_json(req, &url).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(
                    port = self.port,
                    session_id = %session_id,
                    error = %e,
                    "prompt failed"
                );
                return Err(e);
            }
        };

        info!(
            port = self.port,
            session_id = %session_id,
            duration_ms = started.elapsed().as_millis() as u64,
            parts = resp.parts.len(),
            "prompt completed"
        );

        Ok(PromptResult {
            session_id,
            message_id: resp.message_id,
            parts: resp.parts,
        })
    }

    async fn execute_command(
        &self,
        session_id: &str,
        command: &str,
        args: &[String],
    ) -> Result<PromptResult, ClientError> {
        let started = std::time::Instant::now();
        let url = self.url(&format!("/session/{session_id}/command"));
        let req = self.http.post(&url).json(&CommandRequest {
            command,
            arguments: args,
        });

        let resp: MessageResponse = match self.send_json(req, &url).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(
                    port = self.port,
                    session_id,
                    command,
                    error = %e,
                    "command failed"
                );
                return Err(e);
            }
        };

        info!(
            port = self.port,
            session_id,
            command,
            duration_ms = started.elapsed().as_millis() as u64,
            parts = resp.parts.len(),
            "command completed"
        );

        Ok(PromptResult {
            session_id: session_id.to_string(),
            message_id: resp.message_id,
            parts: resp.parts,
        })
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, ClientError> {
        let url = self.url("/session");
        self.send_json(self.http.get(&url), &url).await
    }

    async fn get_session(&self, id: &str) -> Result<Session, ClientError> {
        let url = self.url(&format!("/session/{id}"));
        self.send_json(self.http.get(&url), &url).await
    }

    async fn delete_session(&self, id: &str) -> Result<(), ClientError> {
        let url = self.url(&format!("/session/{id}"));
        self.send_ok(self.http.delete(&url), &url).await
    }

    async fn abort_session(&self, id: &str) -> Result<(), ClientError> {
        let url = self.url(&format!("/session/{id}/abort"));
        self.send_ok(self.http.post(&url), &url).await
    }

    async fn file_status(&self) -> Result<Vec<FileStatus>, ClientError> {
        let url = self.url("/file/status");
        self.send_json(self.http.get(&url), &url).await
    }

    async fn read_file(&self, path: &str) -> Result<String, ClientError> {
        let url = self.url("/file/read");
        let req = self.http.get(&url).query(&[("path", path)]);
        let resp: ReadFileResponse = self.send_json(req, &url).await?;
        Ok(resp.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_split_on_first_slash() {
        assert_eq!(split_model("anthropic/claude-sonnet-4"), ("anthropic", "claude-sonnet-4"));
        assert_eq!(
            split_model("openrouter/meta/llama-3"),
            ("openrouter", "meta/llama-3")
        );
        assert_eq!(split_model("local-model"), ("", "local-model"));
    }

    #[test]
    fn message_parts_deserialize_from_tagged_json() {
        let json = r#"[
            {"type": "step-start"},
            {"type": "text", "text": "hello"},
            {"type": "reasoning", "text": "thinking"},
            {"type": "tool", "tool": "edit", "state": {"status": "done"}},
            {"type": "file", "path": "src/lib.rs"},
            {"type": "patch", "files": ["src/lib.rs", "src/main.rs"]},
            {"type": "step-finish"}
        ]"#;
        let parts: Vec<MessagePart> = serde_json::from_str(json).unwrap();
        assert_eq!(parts.len(), 7);
        assert_eq!(parts[0], MessagePart::StepStart);
        assert_eq!(
            parts[1],
            MessagePart::Text {
                text: "hello".into()
            }
        );
        assert!(matches!(parts[3], MessagePart::Tool { .. }));
    }

    #[test]
    fn prompt_result_text_and_files() {
        let result = PromptResult {
            session_id: "s1".into(),
            message_id: None,
            parts: vec![
                MessagePart::StepStart,
                MessagePart::Text { text: "a".into() },
                MessagePart::File {
                    path: "src/a.rs".into(),
                },
                MessagePart::Text { text: "b".into() },
                MessagePart::Patch {
                    files: vec!["src/b.rs".into()],
                },
            ],
        };
        assert_eq!(result.text(), "a\nb");
        assert_eq!(result.file_paths(), vec!["src/a.rs", "src/b.rs"]);
    }

    #[test]
    fn prompt_request_omits_empty_fields() {
        let body = PromptRequest {
            model: None,
            agent: None,
            no_reply: false,
            parts: vec![RequestPart::Text { text: "hi" }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("model").is_none());
        assert!(json.get("agent").is_none());
        assert!(json.get("noReply").is_none());
        assert_eq!(json["parts"][0]["type"], "text");
    }

    mod http {
        use super::super::*;
        use axum::extract::{Path as AxPath, Query};
        use axum::routing::{get, post};
        use axum::{Json, Router};
        use std::collections::HashMap;

        async fn spawn_stub() -> (String, tokio::task::JoinHandle<()>) {
            let app = Router::new()
                .route(
                    "/session",
                    post(|| async {
                        Json(serde_json::json!({"id": "sess-1", "title": "t"}))
                    })
                    .get(|| async {
                        Json(serde_json::json!([{"id": "sess-1"}, {"id": "sess-2"}]))
                    }),
                )
                .route(
                    "/session/{id}/prompt",
                    post(|AxPath(id): AxPath<String>, Json(body): Json<serde_json::Value>| async move {
                        let text = body["parts"][0]["text"].as_str().unwrap_or("").to_string();
                        Json(serde_json::json!({
                            "messageId": format!("msg-{id}"),
                            "parts": [
                                {"type": "step-start"},
                                {"type": "text", "text": format!("echo: {text}")},
                                {"type": "file", "path": "src/answer.rs"},
                                {"type": "step-finish"}
                            ]
                        }))
                    }),
                )
                .route(
                    "/session/{id}/command",
                    post(|AxPath(_id): AxPath<String>, Json(body): Json<serde_json::Value>| async move {
                        let command = body["command"].as_str().unwrap_or("").to_string();
                        Json(serde_json::json!({
                            "parts": [{"type": "text", "text": format!("ran: {command}")}]
                        }))
                    }),
                )
                .route(
                    "/session/{id}/abort",
                    post(|AxPath(_id): AxPath<String>| async { Json(serde_json::json!({})) }),
                )
                .route(
                    "/file/status",
                    get(|| async {
                        Json(serde_json::json!([
                            {"path": "src/answer.rs", "status": "modified"}
                        ]))
                    }),
                )
                .route(
                    "/file/read",
                    get(|Query(params): Query<HashMap<String, String>>| async move {
                        Json(serde_json::json!({
                            "content": format!("contents of {}", params["path"])
                        }))
                    }),
                );

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let handle = tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            (format!("http://{addr}"), handle)
        }

        #[tokio::test]
        async fn prompt_creates_session_and_collects_parts() {
            let (base, server) = spawn_stub().await;
            let client = AgentClient::new(base, 0);

            let result = client
                .execute_prompt("implement add_one", PromptOptions::default())
                .await
                .unwrap();

            assert_eq!(result.session_id, "sess-1");
            assert_eq!(result.message_id.as_deref(), Some("msg-sess-1"));
            assert_eq!(result.text(), "echo: implement add_one");
            assert_eq!(result.file_paths(), vec!["src/answer.rs"]);
            server.abort();
        }

        #[tokio::test]
        async fn prompt_reuses_provided_session() {
            let (base, server) = spawn_stub().await;
            let client = AgentClient::new(base, 0);

            let result = client
                .execute_prompt(
                    "continue",
                    PromptOptions {
                        session_id: Some("sess-9".into()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();

            assert_eq!(result.session_id, "sess-9");
            assert_eq!(result.message_id.as_deref(), Some("msg-sess-9"));
            server.abort();
        }

        #[tokio::test]
        async fn command_and_file_operations() {
            let (base, server) = spawn_stub().await;
            let client = AgentClient::new(base, 0);

            let result = client
                .execute_command("sess-1", "git add . && git commit -m 'x'", &[])
                .await
                .unwrap();
            assert!(result.text().starts_with("ran: git add ."));

            let sessions = client.list_sessions().await.unwrap();
            assert_eq!(sessions.len(), 2);

            client.abort_session("sess-1").await.unwrap();

            let files = client.file_status().await.unwrap();
            assert_eq!(files[0].path, "src/answer.rs");

            let content = client.read_file("src/answer.rs").await.unwrap();
            assert_eq!(content, "contents of src/answer.rs");
            server.abort();
        }

        #[tokio::test]
        async fn connection_refused_is_a_request_error() {
            // Port 1 is essentially never listening.
            let client = AgentClient::new("http://127.0.0.1:1", 1);
            let err = client
                .execute_prompt("hi", PromptOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(err, ClientError::Request { .. }));
        }
    }
}
