//! Reading and writing files in the sandbox.
//!
//! Paths are passed to the sandbox as-is; relative paths resolve from the
//! sandbox user's home directory.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{Tool, ToolContext};
use crate::agent::AgentState;

#[derive(Debug, Deserialize)]
struct FileWrite {
    path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct WriteArgs {
    files: Vec<FileWrite>,
}

#[derive(Debug, Deserialize)]
struct ReadArgs {
    files: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileContent {
    path: String,
    content: String,
}

/// `createOrUpdateFiles { files: [{path, content}] }`
pub struct CreateOrUpdateFiles;

#[async_trait]
impl Tool for CreateOrUpdateFiles {
    fn name(&self) -> &str {
        "createOrUpdateFiles"
    }

    fn description(&self) -> &str {
        "Create or update files in the sandbox"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "files": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "path": { "type": "string" },
                            "content": { "type": "string" }
                        },
                        "required": ["path", "content"]
                    }
                }
            },
            "required": ["files"]
        })
    }

    async fn execute(
        &self,
        args: Value,
        ctx: &ToolContext<'_>,
        state: &mut AgentState,
    ) -> anyhow::Result<String> {
        let args: WriteArgs = serde_json::from_value(args)?;
        let current = state.files.clone();

        let files: BTreeMap<String, String> = ctx
            .step
            .run("create-or-update-files", async {
                let sandbox = ctx.sandbox().await?;
                let mut updated = current;
                for file in args.files {
                    sandbox.write_file(&file.path, &file.content).await?;
                    updated.insert(file.path, file.content);
                }
                Ok(updated)
            })
            .await?;

        let written = files.len();
        state.files = files;
        tracing::debug!(sandbox_id = %ctx.sandbox_id, files = written, "Updated sandbox files");

        Ok(format!(
            "Files written successfully. {} file(s) tracked so far.",
            written
        ))
    }
}

/// `readFiles { files: [path] }`
pub struct ReadFiles;

#[async_trait]
impl Tool for ReadFiles {
    fn name(&self) -> &str {
        "readFiles"
    }

    fn description(&self) -> &str {
        "Read files from the sandbox"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "files": {
                    "type": "array",
                    "items": { "type": "string" }
                }
            },
            "required": ["files"]
        })
    }

    async fn execute(
        &self,
        args: Value,
        ctx: &ToolContext<'_>,
        _state: &mut AgentState,
    ) -> anyhow::Result<String> {
        let args: ReadArgs = serde_json::from_value(args)?;

        let contents: Vec<FileContent> = ctx
            .step
            .run("read-files", async {
                let sandbox = ctx.sandbox().await?;
                let mut contents = Vec::with_capacity(args.files.len());
                for path in args.files {
                    let content = sandbox.read_file(&path).await?;
                    contents.push(FileContent { path, content });
                }
                Ok(contents)
            })
            .await?;

        Ok(serde_json::to_string(&contents)?)
    }
}
