//! Claude CLI agent backend.
//!
//! Spawns the CLI with `--output-format stream-json`, writes the prompt to
//! stdin, and parses the line-delimited event stream, forwarding tool use
//! and text as [`AgentEvent`]s.

use async_trait::async_trait;
use gantry_common::agent::{AgentBackend, AgentError, AgentEvent, AgentOutcome, AgentTask};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Events from the CLI's stream-json output format.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "user")]
    User {
        #[serde(default)]
        tool_use_result: Option<Value>,
    },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        usage: Option<Usage>,
        #[serde(default)]
        model: Option<String>,
    },

    #[serde(rename = "system")]
    System {
        #[allow(dead_code)]
        subtype: String,
    },
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: Value },

    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Backend driving the Claude CLI as a subprocess.
pub struct ClaudeBackend {
    command: String,
}

impl ClaudeBackend {
    /// `command` is overridable for testing (any executable speaking the
    /// stream-json protocol on stdout works).
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }

    fn build_command(&self, task: &AgentTask) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.arg("--print")
            .arg("--verbose")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--model")
            .arg(&task.model);
        if !task.system_prompt.is_empty() {
            cmd.arg("--append-system-prompt").arg(&task.system_prompt);
        }
        if !task.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").arg(task.allowed_tools.join(","));
        }
        // stderr is discarded rather than piped: nothing reads it, and a
        // full pipe buffer would wedge the agent.
        cmd.current_dir(&task.working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl AgentBackend for ClaudeBackend {
    async fn stream(
        &self,
        task: AgentTask,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<AgentOutcome, AgentError> {
        let mut cmd = self.build_command(&task);
        let mut child = cmd.spawn().map_err(AgentError::Spawn)?;

        let _ = events
            .send(AgentEvent::AgentStarted {
                role: task.role.clone(),
            })
            .await;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(task.user_prompt.as_bytes())
                .await
                .map_err(|e| AgentError::Other(anyhow::anyhow!("write prompt: {}", e)))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| AgentError::Other(anyhow::anyhow!("close stdin: {}", e)))?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Other(anyhow::anyhow!("no stdout from agent process")))?;
        let mut lines = BufReader::new(stdout).lines();

        let mut transcript: Vec<Value> = Vec::new();
        let mut accumulated = String::new();
        let mut final_result: Option<String> = None;
        let mut usage = Usage::default();
        let mut model_id = task.model.clone();
        let mut is_error = false;

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| AgentError::Other(anyhow::anyhow!("read agent output: {}", e)))?
        {
            if line.is_empty() {
                continue;
            }
            if let Ok(raw) = serde_json::from_str::<Value>(&line) {
                transcript.push(raw);
            }
            let Ok(event) = serde_json::from_str::<StreamEvent>(&line) else {
                continue;
            };
            match event {
                StreamEvent::Assistant { message } => {
                    for content in message.content {
                        match content {
                            ContentBlock::ToolUse { name, input } => {
                                let _ = events
                                    .send(AgentEvent::ToolCall { tool: name, input })
                                    .await;
                            }
                            ContentBlock::Text { text } => {
                                accumulated.push_str(&text);
                                accumulated.push('\n');
                                let _ = events.send(AgentEvent::Output { text }).await;
                            }
                        }
                    }
                }
                StreamEvent::User { tool_use_result } => {
                    if let Some(result) = tool_use_result {
                        let _ = events
                            .send(AgentEvent::ToolResult {
                                tool: String::new(),
                                result,
                            })
                            .await;
                    }
                }
                StreamEvent::Result {
                    result,
                    is_error: err,
                    usage: u,
                    model,
                } => {
                    final_result = result;
                    is_error = err;
                    if let Some(u) = u {
                        usage = u;
                    }
                    if let Some(m) = model {
                        model_id = m;
                    }
                }
                StreamEvent::System { .. } => {}
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| AgentError::Other(anyhow::anyhow!("wait for agent: {}", e)))?;
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            // Providers surface rate limits as a distinctive exit; sniff
            // the transcript for the class before giving up.
            let text = transcript
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("\n");
            if text.contains("rate_limit") || text.contains("429") {
                return Err(AgentError::RateLimited(format!("exit code {}", code)));
            }
            return Err(AgentError::NonZeroExit { exit_code: code });
        }
        if is_error {
            return Err(AgentError::Parse(
                final_result.unwrap_or_else(|| "agent reported error".to_string()),
            ));
        }

        let output = final_result.unwrap_or(accumulated);
        let _ = events
            .send(AgentEvent::AgentCompleted {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                model_id: model_id.clone(),
            })
            .await;

        Ok(AgentOutcome {
            output,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            model_id,
            conversation: Value::Array(transcript),
        })
    }
}
