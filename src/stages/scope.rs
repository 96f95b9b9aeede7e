//! Deterministic diff-scope pre-pass.
//!
//! Runs before the reviewer agents, with no LLM involved: parse the
//! unified diff, flag paths whose class widens the blast radius of the
//! change — config files, dependency manifests, infrastructure and
//! deploy descriptors.

use gantry_common::finding::{ScopeFlag, ScopeFlagKind};
use regex::Regex;
use std::sync::OnceLock;

fn touched_files_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\+\+\+ b/(.+)$").expect("valid regex"))
}

/// Paths touched by a unified diff (the `+++ b/...` side).
pub fn touched_files(diff: &str) -> Vec<String> {
    touched_files_re()
        .captures_iter(diff)
        .map(|caps| caps[1].trim().to_string())
        .filter(|path| path != "/dev/null")
        .collect()
}

/// Classify one path; None for ordinary source files.
pub fn classify(path: &str) -> Option<ScopeFlagKind> {
    let lower = path.to_lowercase();
    let file_name = lower.rsplit('/').next().unwrap_or(&lower);

    let dependency_manifests = [
        "package.json",
        "package-lock.json",
        "yarn.lock",
        "pnpm-lock.yaml",
        "requirements.txt",
        "pyproject.toml",
        "pipfile",
        "pipfile.lock",
        "go.mod",
        "go.sum",
        "cargo.toml",
        "cargo.lock",
        "gemfile",
        "gemfile.lock",
        "pom.xml",
        "build.gradle",
        "build.gradle.kts",
        "composer.json",
    ];
    if dependency_manifests.contains(&file_name) {
        return Some(ScopeFlagKind::DependencyManifest);
    }

    let infra_dirs = ["terraform/", "infra/", "infrastructure/", "deploy/", "deployment/", "ansible/", "charts/", "k8s/", "kubernetes/", "helm/"];
    if infra_dirs.iter().any(|dir| lower.starts_with(dir) || lower.contains(&format!("/{}", dir)))
        || lower.ends_with(".tf")
        || lower.ends_with(".tfvars")
    {
        return Some(ScopeFlagKind::Infrastructure);
    }

    let is_ci = lower.starts_with(".github/workflows/")
        || lower.contains("/.github/workflows/")
        || file_name == ".gitlab-ci.yml"
        || file_name == "jenkinsfile"
        || file_name == ".travis.yml"
        || file_name == "azure-pipelines.yml";
    let is_container = file_name == "dockerfile"
        || file_name.ends_with(".dockerfile")
        || file_name.starts_with("docker-compose");
    if is_ci || is_container {
        return Some(ScopeFlagKind::ConfigFile);
    }

    None
}

/// Scope flags for one repository's diff.
pub fn scan(repo_name: &str, diff: &str) -> Vec<ScopeFlag> {
    touched_files(diff)
        .into_iter()
        .filter_map(|file| {
            classify(&file).map(|kind| ScopeFlag {
                kind,
                repo: repo_name.to_string(),
                file,
            })
        })
        .collect()
}
