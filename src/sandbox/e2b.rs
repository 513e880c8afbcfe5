//! E2B sandbox client.
//!
//! Lifecycle calls go to the control-plane REST API; file and process calls go
//! to the `envd` daemon inside the sandbox, reachable at
//! `https://49983-{sandbox_id}.{domain}`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use serde_json::json;

use super::envelope::{self, Decoder, EndStream, Frame};
use super::{CommandOutput, Sandbox, SandboxError, SandboxProvider};
use crate::config::SandboxConfig;

const ENVD_PORT: u16 = 49983;
const SANDBOX_USER: &str = "user";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
/// Exit code reported when the process stream broke before the command ended.
const INTERRUPTED_EXIT_CODE: i32 = -1;

pub struct E2bProvider {
    client: Client,
    api_key: String,
    api_url: String,
    domain: String,
}

impl E2bProvider {
    pub fn new(config: &SandboxConfig) -> Result<Self, SandboxError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| SandboxError::NotConfigured("E2B_API_KEY is not set".to_string()))?;
        Ok(Self {
            client: Client::new(),
            api_key,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            domain: config.domain.clone(),
        })
    }

    fn api(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_url, path))
            .header("X-API-Key", &self.api_key)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SandboxInfo {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
    #[serde(default)]
    envd_access_token: Option<String>,
    #[serde(default)]
    domain: Option<String>,
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, SandboxError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SandboxError::Api {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl SandboxProvider for E2bProvider {
    async fn create(&self, template: &str, timeout: Duration) -> Result<String, SandboxError> {
        let response = self
            .api(Method::POST, "/sandboxes")
            .json(&json!({
                "templateID": template,
                "timeout": timeout.as_secs(),
            }))
            .send()
            .await?;
        let info: SandboxInfo = check(response).await?.json().await?;
        tracing::info!(sandbox_id = %info.sandbox_id, template, "Created sandbox");
        Ok(info.sandbox_id)
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let response = self
            .api(Method::GET, &format!("/sandboxes/{}", sandbox_id))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SandboxError::NotFound(sandbox_id.to_string()));
        }
        let info: SandboxInfo = check(response).await?.json().await?;
        Ok(Arc::new(E2bSandbox {
            id: info.sandbox_id,
            client: self.client.clone(),
            api_key: self.api_key.clone(),
            api_url: self.api_url.clone(),
            domain: info.domain.unwrap_or_else(|| self.domain.clone()),
            access_token: info.envd_access_token,
        }))
    }
}

struct E2bSandbox {
    id: String,
    client: Client,
    api_key: String,
    api_url: String,
    domain: String,
    access_token: Option<String>,
}

impl E2bSandbox {
    fn envd(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("https://{}{}", self.host(ENVD_PORT), path);
        let mut request = self
            .client
            .request(method, url)
            .header(
                "Authorization",
                format!("Basic {}", BASE64.encode(format!("{}:", SANDBOX_USER))),
            );
        if let Some(token) = &self.access_token {
            request = request.header("X-Access-Token", token);
        }
        request
    }
}

#[async_trait]
impl Sandbox for E2bSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set_timeout(&self, timeout: Duration) -> Result<(), SandboxError> {
        let response = self
            .client
            .post(format!("{}/sandboxes/{}/timeout", self.api_url, self.id))
            .header("X-API-Key", &self.api_key)
            .json(&json!({ "timeout": timeout.as_secs() }))
            .send()
            .await?;
        check(response).await?;
        tracing::debug!(sandbox_id = %self.id, ?timeout, "Extended sandbox timeout");
        Ok(())
    }

    async fn run_command(&self, command: &str) -> Result<CommandOutput, SandboxError> {
        let request = json!({
            "process": {
                "cmd": "/bin/bash",
                "args": ["-l", "-c", command],
                "envs": {},
            },
            "stdin": false,
        });
        let body = envelope::encode(&serde_json::to_vec(&request).map_err(|e| {
            SandboxError::Protocol(format!("failed to encode process request: {}", e))
        })?);

        tracing::debug!(sandbox_id = %self.id, command, "Running sandbox command");

        let response = self
            .envd(Method::POST, "/process.Process/Start")
            .header("Content-Type", "application/connect+json")
            .header("Connect-Protocol-Version", "1")
            .timeout(COMMAND_TIMEOUT)
            .body(body)
            .send()
            .await?;
        let response = check(response).await?;

        let mut decoder = Decoder::new();
        let mut collector = ProcessCollector::default();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => decoder.push(&chunk),
                Err(e) => return Err(collector.interrupted(format!("process stream failed: {}", e))),
            }
            loop {
                let frame = match decoder.next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => return Err(collector.interrupted(e)),
                };
                if let Some(result) = collector.apply(&frame) {
                    return result;
                }
            }
        }
        Err(collector.interrupted(
            "process stream ended before the command finished".to_string(),
        ))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let part = reqwest::multipart::Part::text(content.to_string()).file_name(path.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self
            .envd(Method::POST, "/files")
            .query(&[("path", path), ("username", SANDBOX_USER)])
            .multipart(form)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let response = self
            .envd(Method::GET, "/files")
            .query(&[("path", path), ("username", SANDBOX_USER)])
            .send()
            .await?;
        Ok(check(response).await?.text().await?)
    }

    fn host(&self, port: u16) -> String {
        format!("{}-{}.{}", port, self.id, self.domain)
    }
}

#[derive(Debug, Deserialize)]
struct ProcessMessage {
    event: ProcessEvent,
}

#[derive(Debug, Default, Deserialize)]
struct ProcessEvent {
    #[serde(default)]
    data: Option<DataEvent>,
    #[serde(default)]
    end: Option<EndEvent>,
}

#[derive(Debug, Deserialize)]
struct DataEvent {
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndEvent {
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    error: Option<String>,
}

/// Accumulates process events until the command ends.
#[derive(Debug, Default)]
struct ProcessCollector {
    stdout: String,
    stderr: String,
}

impl ProcessCollector {
    /// Returns the final result once the process has ended or the stream
    /// reported an error.
    fn apply(&mut self, frame: &Frame) -> Option<Result<CommandOutput, SandboxError>> {
        if frame.is_end_stream() {
            let end: EndStream = if frame.payload.is_empty() {
                EndStream::default()
            } else {
                match serde_json::from_slice(&frame.payload) {
                    Ok(end) => end,
                    Err(e) => return Some(Err(self.interrupted(format!("bad end-of-stream: {}", e)))),
                }
            };
            return end.error.map(|error| {
                Err(self.interrupted(format!("{}: {}", error.code, error.message)))
            });
        }

        let message: ProcessMessage = match serde_json::from_slice(&frame.payload) {
            Ok(message) => message,
            Err(e) => return Some(Err(self.interrupted(format!("bad process event: {}", e)))),
        };

        if let Some(data) = message.event.data {
            if let Err(e) = self.push_data(data) {
                return Some(Err(self.interrupted(e)));
            }
        }

        let end = message.event.end?;
        let stdout = std::mem::take(&mut self.stdout);
        let stderr = std::mem::take(&mut self.stderr);
        if end.exit_code != 0 {
            return Some(Err(SandboxError::CommandExit {
                exit_code: end.exit_code,
                error: end.error.unwrap_or_else(|| format!("exit status {}", end.exit_code)),
                stdout,
                stderr,
            }));
        }
        Some(Ok(CommandOutput {
            stdout,
            stderr,
            exit_code: 0,
        }))
    }

    fn push_data(&mut self, data: DataEvent) -> Result<(), String> {
        if let Some(chunk) = data.stdout {
            self.stdout.push_str(&decode_chunk(&chunk)?);
        }
        if let Some(chunk) = data.stderr {
            self.stderr.push_str(&decode_chunk(&chunk)?);
        }
        Ok(())
    }

    /// The command did not report an exit; keep whatever output arrived.
    fn interrupted(&mut self, reason: String) -> SandboxError {
        SandboxError::CommandExit {
            exit_code: INTERRUPTED_EXIT_CODE,
            error: reason,
            stdout: std::mem::take(&mut self.stdout),
            stderr: std::mem::take(&mut self.stderr),
        }
    }
}

fn decode_chunk(chunk: &str) -> Result<String, String> {
    let bytes = BASE64
        .decode(chunk)
        .map_err(|e| format!("bad output chunk: {}", e))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
