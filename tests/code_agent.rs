//! Runs the code-agent function through the job queue against scripted
//! model responses and an in-memory sandbox.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use vibe::code_agent::{CodeAgentFunction, CodeAgentOutput, CodeAgentSettings, ERROR_REPLY, EVENT_NAME};
use vibe::jobs::{Event, JobFunction, JobQueue, QueueOptions};
use vibe::llm::{ChatMessage, ChatResponse, FunctionCall, LlmClient, Role, ToolCall, ToolDefinition};
use vibe::sandbox::{CommandOutput, Sandbox, SandboxError, SandboxProvider};
use vibe::store::{JobRun, MessageRole, MessageType, NewMessage, RunStatus, Store};

type Files = Arc<Mutex<HashMap<String, BTreeMap<String, String>>>>;

#[derive(Default)]
struct FakeSandboxes {
    files: Files,
    created: AtomicUsize,
    commands: Arc<Mutex<Vec<String>>>,
}

struct FakeSandbox {
    id: String,
    files: Files,
    commands: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl SandboxProvider for FakeSandboxes {
    async fn create(&self, _template: &str, _timeout: Duration) -> Result<String, SandboxError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("sbx-{}", n);
        self.files.lock().unwrap().insert(id.clone(), BTreeMap::new());
        Ok(id)
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        if !self.files.lock().unwrap().contains_key(sandbox_id) {
            return Err(SandboxError::NotFound(sandbox_id.to_string()));
        }
        Ok(Arc::new(FakeSandbox {
            id: sandbox_id.to_string(),
            files: self.files.clone(),
            commands: self.commands.clone(),
        }))
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set_timeout(&self, _timeout: Duration) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn run_command(&self, command: &str) -> Result<CommandOutput, SandboxError> {
        self.commands.lock().unwrap().push(command.to_string());
        if command.starts_with("npm run build") {
            return Err(SandboxError::CommandExit {
                exit_code: 1,
                error: "exit status 1".to_string(),
                stdout: "building".to_string(),
                stderr: "Type error".to_string(),
            });
        }
        Ok(CommandOutput {
            stdout: format!("ran {}", command),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let mut files = self.files.lock().unwrap();
        let sandbox = files.entry(self.id.clone()).or_default();
        sandbox.insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.files.lock().unwrap()[&self.id]
            .get(path)
            .cloned()
            .ok_or_else(|| SandboxError::Api {
                status: 404,
                body: format!("{} not found", path),
            })
    }

    fn host(&self, port: u16) -> String {
        format!("{}-{}.sandbox.test", port, self.id)
    }
}

/// Replies from a fixed script; each call records the prompt it saw.
#[derive(Default)]
struct ScriptedLlm {
    script: Mutex<VecDeque<anyhow::Result<ChatResponse>>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedLlm {
    fn new(replies: Vec<anyhow::Result<ChatResponse>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat_completion(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _tools: Option<&[ToolDefinition]>,
    ) -> anyhow::Result<ChatResponse> {
        self.calls.lock().unwrap().push(messages.to_vec());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow::anyhow!("script exhausted")))
    }
}

fn text(content: &str) -> anyhow::Result<ChatResponse> {
    Ok(ChatResponse {
        content: Some(content.to_string()),
        tool_calls: None,
        finish_reason: Some("stop".to_string()),
        usage: None,
        model: None,
    })
}

fn tool_calls(calls: &[(&str, serde_json::Value)]) -> anyhow::Result<ChatResponse> {
    let calls = calls
        .iter()
        .enumerate()
        .map(|(i, (name, args))| ToolCall {
            id: format!("call_{}", i),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: args.to_string(),
            },
        })
        .collect();
    Ok(ChatResponse {
        content: None,
        tool_calls: Some(calls),
        finish_reason: Some("tool_calls".to_string()),
        usage: None,
        model: None,
    })
}

fn settings(max_iterations: usize) -> CodeAgentSettings {
    CodeAgentSettings {
        template: "vibe-nextjs".to_string(),
        sandbox_timeout: Duration::from_secs(1800),
        preview_port: 3000,
        code_model: "code-model".to_string(),
        summary_model: "summary-model".to_string(),
        max_iterations,
        history_limit: 5,
    }
}

fn fast_queue(store: &Store, function: CodeAgentFunction, max_retries: u32) -> JobQueue {
    let functions: Vec<Arc<dyn JobFunction>> = vec![Arc::new(function)];
    JobQueue::start(
        store.clone(),
        functions,
        QueueOptions {
            concurrency: 1,
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
    )
}

async fn project_with_request(store: &Store, value: &str) -> Uuid {
    let project = store.create_project("alice", "brave-otter").await.unwrap();
    tokio_test::assert_ok!(
        store
            .create_message(NewMessage {
                project_id: project.id,
                content: value.to_string(),
                role: MessageRole::User,
                message_type: MessageType::Result,
                fragment: None,
            })
            .await
    );
    project.id
}

async fn run_to_completion(queue: &JobQueue, store: &Store, project_id: Uuid, value: &str) -> JobRun {
    let ids = queue
        .send(Event::new(EVENT_NAME, json!({ "value": value, "projectId": project_id })))
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);

    for _ in 0..500 {
        let run = store.get_run(ids[0]).await.unwrap().unwrap();
        if run.status.is_finished() {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run did not finish");
}

#[tokio::test]
async fn test_successful_run_saves_result_with_fragment() {
    let store = Store::open_in_memory().unwrap();
    let project_id = project_with_request(&store, "a landing page").await;

    let sandboxes = Arc::new(FakeSandboxes::default());
    let code = ScriptedLlm::new(vec![
        tool_calls(&[(
            "createOrUpdateFiles",
            json!({ "files": [{ "path": "app/page.tsx", "content": "export default function Page() {}" }] }),
        )]),
        tool_calls(&[
            ("terminal", json!({ "command": "npm install lucide-react --yes" })),
            ("deploy", json!({})),
            ("readFiles", json!({ "files": ["app/page.tsx"] })),
        ]),
        text("<task_summary>Built a landing page with a hero section.</task_summary>"),
    ]);
    let summary = ScriptedLlm::new(vec![text("Landing Page"), text("Here's your landing page!")]);

    let function = CodeAgentFunction::new(
        store.clone(),
        sandboxes.clone(),
        code.clone(),
        summary.clone(),
        settings(15),
    );
    let queue = fast_queue(&store, function, 0);
    let run = run_to_completion(&queue, &store, project_id, "a landing page").await;

    assert_eq!(run.status, RunStatus::Completed, "error: {:?}", run.error);
    let output: CodeAgentOutput = serde_json::from_value(run.output.unwrap()).unwrap();
    assert_eq!(output.url, "https://3000-sbx-1.sandbox.test");
    assert_eq!(output.title, "Fragments");
    assert!(output.summary.contains("<task_summary>"));
    assert_eq!(
        output.files.get("app/page.tsx").map(String::as_str),
        Some("export default function Page() {}")
    );

    assert_eq!(code.call_count(), 3);
    assert_eq!(summary.call_count(), 2);
    assert_eq!(
        *sandboxes.commands.lock().unwrap(),
        vec!["npm install lucide-react --yes"]
    );

    // The third inference saw every tool result, including the unknown tool.
    let third = code.calls.lock().unwrap()[2].clone();
    let tool_outputs: Vec<String> = third
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.text_content())
        .collect();
    assert_eq!(tool_outputs.len(), 4);
    assert_eq!(tool_outputs[1], "ran npm install lucide-react --yes");
    assert!(tool_outputs[2].contains("unknown tool 'deploy'"));
    assert!(tool_outputs[3].contains("export default function Page()"));

    let messages = store.list_messages(project_id).await.unwrap();
    assert_eq!(messages.len(), 2);
    let reply = &messages[1];
    assert_eq!(reply.role, MessageRole::Assistant);
    assert_eq!(reply.message_type, MessageType::Result);
    assert_eq!(reply.content, "Here's your landing page!");
    let fragment = reply.fragment.as_ref().unwrap();
    assert_eq!(fragment.title, "Landing Page");
    assert_eq!(fragment.sandbox_url, "https://3000-sbx-1.sandbox.test");
    assert_eq!(fragment.files, output.files);
}

#[tokio::test]
async fn test_run_without_summary_saves_error_message() {
    let store = Store::open_in_memory().unwrap();
    let project_id = project_with_request(&store, "a chess engine").await;

    let sandboxes = Arc::new(FakeSandboxes::default());
    let code = ScriptedLlm::new(vec![
        tool_calls(&[("terminal", json!({ "command": "npm run build" }))]),
        text("Still working on it."),
        text("Never reached."),
    ]);
    let summary = ScriptedLlm::new(Vec::new());

    let function = CodeAgentFunction::new(
        store.clone(),
        sandboxes.clone(),
        code.clone(),
        summary.clone(),
        settings(2),
    );
    let queue = fast_queue(&store, function, 0);
    let run = run_to_completion(&queue, &store, project_id, "a chess engine").await;

    assert_eq!(run.status, RunStatus::Completed, "error: {:?}", run.error);
    assert_eq!(code.call_count(), 2);
    assert_eq!(summary.call_count(), 0);

    // A failed command is reported to the model, not raised.
    let second = code.calls.lock().unwrap()[1].clone();
    let report = second.last().and_then(|m| m.text_content()).unwrap();
    assert_eq!(report, "command failed: exit status 1\nstdout:building\nstderr:Type error");

    let messages = store.list_messages(project_id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].message_type, MessageType::Error);
    assert_eq!(messages[1].content, ERROR_REPLY);
    assert!(messages[1].fragment.is_none());
}

#[tokio::test]
async fn test_retry_replays_sandbox_and_inferences() {
    let store = Store::open_in_memory().unwrap();
    let project_id = project_with_request(&store, "a counter").await;

    let sandboxes = Arc::new(FakeSandboxes::default());
    // Enough replies for exactly one pass through the network.
    let code = ScriptedLlm::new(vec![
        tool_calls(&[(
            "createOrUpdateFiles",
            json!({ "files": [{ "path": "app/page.tsx", "content": "counter" }] }),
        )]),
        text("<task_summary>Counter app.</task_summary>"),
    ]);
    let summary = ScriptedLlm::new(vec![
        Err(anyhow::anyhow!("upstream unavailable")),
        text("Counter"),
        text("Your counter is ready."),
    ]);

    let function = CodeAgentFunction::new(
        store.clone(),
        sandboxes.clone(),
        code.clone(),
        summary.clone(),
        settings(15),
    );
    let queue = fast_queue(&store, function, 2);
    let run = run_to_completion(&queue, &store, project_id, "a counter").await;

    assert_eq!(run.status, RunStatus::Completed, "error: {:?}", run.error);
    assert_eq!(run.attempts, 1);
    assert_eq!(sandboxes.created.load(Ordering::SeqCst), 1);
    assert_eq!(code.call_count(), 2);
    assert_eq!(summary.call_count(), 3);

    let messages = store.list_messages(project_id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "Your counter is ready.");
    assert_eq!(messages[1].fragment.as_ref().unwrap().title, "Counter");
}
