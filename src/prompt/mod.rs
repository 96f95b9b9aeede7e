//! Four-layer prompt assembly.
//!
//! Layer 1: role system prompt (templates). Layer 2: repo context,
//! capped so the agent discovers the rest through its read tools.
//! Layer 3: task payload. Layer 4: loop context — previous-iteration
//! feedback, CI logs, intervention-slot instructions.

pub mod templates;

use gantry_common::cr::RepoContext;

/// Rough token estimate (≈4 chars per token) used for the layer-2 cap.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

fn truncate_to_tokens(text: &str, cap_tokens: usize) -> String {
    let cap_chars = cap_tokens.saturating_mul(4);
    if text.chars().count() <= cap_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(cap_chars).collect();
    format!("{}\n[... truncated; explore the worktree for the rest]", truncated)
}

/// Builder assembling the user prompt from layers 2–4. Layer 1 (the role
/// system prompt) travels separately as the task's system prompt.
pub struct PromptBuilder {
    repo_context: Option<String>,
    task_sections: Vec<(String, String)>,
    loop_sections: Vec<(String, String)>,
    repo_context_cap: usize,
}

impl PromptBuilder {
    pub fn new(repo_context_cap: usize) -> Self {
        Self {
            repo_context: None,
            task_sections: Vec::new(),
            loop_sections: Vec::new(),
            repo_context_cap,
        }
    }

    /// Layer 2: conventions file, directory tree, language, test command.
    pub fn repo_context(mut self, repo: &RepoContext) -> Self {
        let mut parts = Vec::new();
        if let Some(language) = &repo.language {
            parts.push(format!("Language: {}", language));
        }
        if let Some(test_command) = &repo.test_command {
            parts.push(format!("Test command: {}", test_command));
        }
        if !repo.conventions.is_empty() {
            parts.push(format!("## Repository conventions\n{}", repo.conventions));
        }
        if !repo.tree_snapshot.is_empty() {
            parts.push(format!("## Directory tree\n{}", repo.tree_snapshot));
        }
        if !parts.is_empty() {
            self.repo_context = Some(truncate_to_tokens(&parts.join("\n\n"), self.repo_context_cap));
        }
        self
    }

    /// Layer 3: one titled task payload section.
    pub fn task(mut self, title: &str, body: &str) -> Self {
        if !body.is_empty() {
            self.task_sections.push((title.to_string(), body.to_string()));
        }
        self
    }

    /// Layer 4: one titled loop-context section.
    pub fn loop_context(mut self, title: &str, body: &str) -> Self {
        if !body.is_empty() {
            self.loop_sections.push((title.to_string(), body.to_string()));
        }
        self
    }

    /// Layer 4: operator instructions from the intervention slot.
    pub fn intervention(self, instructions: Option<&str>) -> Self {
        match instructions {
            Some(text) => self.loop_context("Operator instructions", text),
            None => self,
        }
    }

    pub fn build(self) -> String {
        let mut out = String::new();
        if let Some(repo) = self.repo_context {
            out.push_str("# Repository context\n");
            out.push_str(&repo);
            out.push_str("\n\n");
        }
        for (title, body) in self.task_sections {
            out.push_str(&format!("# {}\n{}\n\n", title, body));
        }
        for (title, body) in self.loop_sections {
            out.push_str(&format!("# {}\n{}\n\n", title, body));
        }
        out.trim_end().to_string()
    }
}

/// Render the structured CR for layer 3.
pub fn render_cr(cr: &gantry_common::cr::StructuredCr) -> String {
    let mut out = format!("Title: {}\n\n{}", cr.title, cr.description);
    if !cr.acceptance_criteria.is_empty() {
        out.push_str("\n\nAcceptance criteria:\n");
        for criterion in &cr.acceptance_criteria {
            out.push_str(&format!("- {}\n", criterion));
        }
    }
    if !cr.constraints.is_empty() {
        out.push_str("\nConstraints:\n");
        for constraint in &cr.constraints {
            out.push_str(&format!("- {}\n", constraint));
        }
    }
    if !cr.risk_flags.is_empty() {
        out.push_str("\nRisk flags:\n");
        for flag in &cr.risk_flags {
            out.push_str(&format!("- {}\n", flag));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_common::cr::StructuredCr;

    fn repo() -> RepoContext {
        let mut repo = RepoContext::new("https://github.com/acme/api.git", "main");
        repo.language = Some("rust".to_string());
        repo.test_command = Some("cargo test".to_string());
        repo.conventions = "Use thiserror for errors.".to_string();
        repo.tree_snapshot = "src/\n  lib.rs\n  main.rs".to_string();
        repo
    }

    #[test]
    fn layers_appear_in_order() {
        let prompt = PromptBuilder::new(12_000)
            .repo_context(&repo())
            .task("Change request", "Add /health endpoint")
            .loop_context("Previous feedback", "missing timeout scenario")
            .intervention(Some("prefer axum idioms"))
            .build();

        let repo_pos = prompt.find("# Repository context").unwrap();
        let task_pos = prompt.find("# Change request").unwrap();
        let loop_pos = prompt.find("# Previous feedback").unwrap();
        let op_pos = prompt.find("# Operator instructions").unwrap();
        assert!(repo_pos < task_pos);
        assert!(task_pos < loop_pos);
        assert!(loop_pos < op_pos);
        assert!(prompt.contains("cargo test"));
    }

    #[test]
    fn empty_sections_are_omitted() {
        let prompt = PromptBuilder::new(12_000)
            .task("Change request", "do the thing")
            .loop_context("Previous feedback", "")
            .intervention(None)
            .build();
        assert!(!prompt.contains("Previous feedback"));
        assert!(!prompt.contains("Operator instructions"));
        assert!(!prompt.contains("Repository context"));
    }

    #[test]
    fn repo_context_is_capped() {
        let mut big = repo();
        big.tree_snapshot = "x".repeat(100_000);
        let prompt = PromptBuilder::new(100).repo_context(&big).build();
        assert!(prompt.contains("truncated"));
        // 100 tokens ≈ 400 chars, plus headers and the truncation notice.
        assert!(prompt.len() < 1000);
    }

    #[test]
    fn token_estimate_is_quarter_chars() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn render_cr_includes_criteria() {
        let cr = StructuredCr {
            title: "Add /health".to_string(),
            description: "Expose liveness".to_string(),
            acceptance_criteria: vec!["returns 200".to_string()],
            ..Default::default()
        };
        let rendered = render_cr(&cr);
        assert!(rendered.contains("Title: Add /health"));
        assert!(rendered.contains("- returns 200"));
    }
}
