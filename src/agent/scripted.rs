//! Deterministic agent backend for tests and dry runs.
//!
//! Responses are queued per role; when a role's queue is empty the
//! fallback response is served. Received tasks are recorded so tests can
//! assert on prompt contents.

use async_trait::async_trait;
use gantry_common::agent::{AgentBackend, AgentError, AgentEvent, AgentOutcome, AgentTask};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

type ResponseQueue = HashMap<String, VecDeque<Result<AgentOutcome, String>>>;

#[derive(Clone, Default)]
pub struct ScriptedBackend {
    responses: Arc<Mutex<ResponseQueue>>,
    tasks_seen: Arc<Mutex<Vec<AgentTask>>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plain-text response for a role.
    pub fn push_output(&self, role: &str, output: &str) {
        self.push_outcome(role, outcome(output));
    }

    /// Queue a JSON response for a role.
    pub fn push_json(&self, role: &str, json: Value) {
        self.push_outcome(role, outcome(&json.to_string()));
    }

    pub fn push_outcome(&self, role: &str, out: AgentOutcome) {
        self.responses
            .lock()
            .expect("scripted backend poisoned")
            .entry(role.to_string())
            .or_default()
            .push_back(Ok(out));
    }

    /// Queue a rate-limit failure for a role.
    pub fn push_rate_limit(&self, role: &str) {
        self.responses
            .lock()
            .expect("scripted backend poisoned")
            .entry(role.to_string())
            .or_default()
            .push_back(Err("rate limited".to_string()));
    }

    /// Every task the backend has received, in order.
    pub fn tasks_seen(&self) -> Vec<AgentTask> {
        self.tasks_seen
            .lock()
            .expect("scripted backend poisoned")
            .clone()
    }

    /// Tasks received for one role.
    pub fn tasks_for(&self, role: &str) -> Vec<AgentTask> {
        self.tasks_seen()
            .into_iter()
            .filter(|t| t.role == role)
            .collect()
    }
}

fn outcome(output: &str) -> AgentOutcome {
    AgentOutcome {
        output: output.to_string(),
        input_tokens: 1000,
        output_tokens: 200,
        model_id: "scripted".to_string(),
        conversation: serde_json::json!([{"role": "assistant", "content": output}]),
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn stream(
        &self,
        task: AgentTask,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<AgentOutcome, AgentError> {
        let _ = events
            .send(AgentEvent::AgentStarted {
                role: task.role.clone(),
            })
            .await;

        let queued = {
            let mut responses = self.responses.lock().expect("scripted backend poisoned");
            responses.get_mut(&task.role).and_then(|q| q.pop_front())
        };
        let role = task.role.clone();
        self.tasks_seen
            .lock()
            .expect("scripted backend poisoned")
            .push(task);

        let result = match queued {
            Some(Ok(out)) => Ok(out),
            Some(Err(message)) => Err(AgentError::RateLimited(message)),
            None => Ok(outcome(&format!("scripted default for {}", role))),
        };

        if let Ok(ref out) = result {
            let _ = events
                .send(AgentEvent::Output {
                    text: out.output.clone(),
                })
                .await;
            let _ = events
                .send(AgentEvent::AgentCompleted {
                    input_tokens: out.input_tokens,
                    output_tokens: out.output_tokens,
                    model_id: out.model_id.clone(),
                })
                .await;
        }
        result
    }
}
