//! Fan-out to N competing developer workers.
//!
//! Workers run concurrently; a failing worker never cancels its peers.
//! Each worker: builds a profile-specific prompt, asks the gateway for a
//! JSON envelope of files, persists them under a worker-private scratch
//! directory, and smoke-tests the combined artifact in the sandbox (with
//! the security scan on). Results are collated worker-id ascending so
//! downstream scoring is reproducible.

use super::{
    DeveloperResult, FileKind, SmokeTest, SolutionFile, WorkerProfile, WorkerStatus,
};
use crate::card::Card;
use crate::checkpoint::LlmExchange;
use crate::errors::StageFailure;
use crate::llm::{ChatMessage, CompletionRequest, LlmGateway, prompt_hash};
use crate::sandbox::{KillReason, Language, ResourceLimits, SandboxExecutor};
use crate::stage::StageServices;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Wall-clock cap for one worker's smoke test.
const SMOKE_TEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct RawFile {
    path: String,
    content: String,
}

/// The JSON envelope a worker must return.
#[derive(Debug, Deserialize)]
struct WorkerEnvelope {
    implementation_files: Vec<RawFile>,
    #[serde(default)]
    test_files: Vec<RawFile>,
    #[serde(default)]
    notes: String,
}

pub struct DeveloperInvoker {
    gateway: Arc<LlmGateway>,
    sandbox: Arc<SandboxExecutor>,
    work_dir: PathBuf,
    model: String,
    max_tokens: u32,
}

impl DeveloperInvoker {
    pub fn from_services(services: &StageServices) -> Self {
        Self {
            gateway: services.gateway.clone(),
            sandbox: services.sandbox.clone(),
            work_dir: services.work_dir.clone(),
            model: services.llm_model.clone(),
            max_tokens: services.llm_max_tokens,
        }
    }

    /// Run `n` workers concurrently and collate their results.
    ///
    /// Also returns every LLM exchange made, for checkpoint persistence.
    pub async fn invoke(
        &self,
        card: &Card,
        adr_content: &str,
        n: u32,
        token: &CancellationToken,
    ) -> Result<(Vec<DeveloperResult>, Vec<LlmExchange>), StageFailure> {
        let mut set: JoinSet<(DeveloperResult, Option<LlmExchange>)> = JoinSet::new();

        for worker_id in 1..=n {
            let gateway = self.gateway.clone();
            let sandbox = self.sandbox.clone();
            let worker_dir = self.work_dir.join("workers").join(format!("worker-{worker_id}"));
            let model = self.model.clone();
            let max_tokens = self.max_tokens;
            let card = card.clone();
            let adr = adr_content.to_string();
            let token = token.child_token();

            set.spawn(async move {
                run_worker(
                    worker_id, &card, &adr, gateway, sandbox, worker_dir, &model, max_tokens,
                    &token,
                )
                .await
            });
        }

        let mut results = Vec::new();
        let mut exchanges = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((result, exchange)) => {
                    results.push(result);
                    exchanges.extend(exchange);
                }
                Err(e) => {
                    // A panicked worker is a lost candidate, not a lost stage.
                    tracing::error!(error = %e, "developer worker task panicked");
                }
            }
        }

        results.sort_by_key(|r| r.worker_id);
        exchanges.sort_by(|a, b| a.prompt_hash.cmp(&b.prompt_hash));

        if results.iter().any(DeveloperResult::succeeded) {
            return Ok((results, exchanges));
        }

        // All workers failed: classify the stage failure.
        if !results.is_empty()
            && results.iter().all(|r| r.status == WorkerStatus::Disqualified)
        {
            return Err(StageFailure::sandbox(
                "every developer candidate was disqualified by the security scan",
            ));
        }
        let detail = results
            .iter()
            .filter_map(|r| r.error.as_deref())
            .next()
            .unwrap_or("no worker produced a usable candidate");
        Err(StageFailure::contract(format!(
            "all {n} developer workers failed: {detail}"
        )))
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    worker_id: u32,
    card: &Card,
    adr_content: &str,
    gateway: Arc<LlmGateway>,
    sandbox: Arc<SandboxExecutor>,
    worker_dir: PathBuf,
    model: &str,
    max_tokens: u32,
    token: &CancellationToken,
) -> (DeveloperResult, Option<LlmExchange>) {
    let profile = WorkerProfile::for_worker(worker_id);
    let start = Instant::now();

    let failed = |error: String, tokens: u64, exchange: Option<LlmExchange>| {
        (
            DeveloperResult {
                worker_id,
                profile,
                status: WorkerStatus::Failed,
                files: Vec::new(),
                notes: String::new(),
                tokens_used: tokens,
                duration_seconds: start.elapsed().as_secs_f64(),
                smoke_test: None,
                error: Some(error),
            },
            exchange,
        )
    };

    let request = CompletionRequest {
        messages: vec![
            ChatMessage::system(format!(
                "You are developer worker {worker_id} with the {} profile. {}",
                profile.as_str(),
                profile.guidance()
            )),
            ChatMessage::user(build_task_prompt(card, adr_content)),
        ],
        model: model.to_string(),
        temperature: profile.temperature(),
        max_tokens,
    };
    let hash = prompt_hash(&request);

    let stage_label = "development";
    let worker_label = format!("worker-{worker_id}");
    let completion = tokio::select! {
        res = gateway.complete(&request, stage_label, &worker_label) => res,
        _ = token.cancelled() => {
            return failed("worker cancelled".to_string(), 0, None);
        }
    };

    let completion = match completion {
        Ok(c) => c,
        Err(e) => return failed(format!("completion failed: {e}"), 0, None),
    };
    let tokens_used = completion.tokens_input + completion.tokens_output;
    let exchange = LlmExchange {
        prompt_hash: hash,
        prompt: request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        response: completion.content.clone(),
    };

    let envelope: WorkerEnvelope = match parse_envelope(&completion.content) {
        Ok(env) => env,
        Err(e) => {
            return failed(
                format!("malformed worker envelope: {e}"),
                tokens_used,
                Some(exchange),
            );
        }
    };
    if envelope.implementation_files.is_empty() {
        return failed(
            "worker envelope contains no implementation files".to_string(),
            tokens_used,
            Some(exchange),
        );
    }

    let mut files = Vec::new();
    for raw in envelope.implementation_files {
        files.push(SolutionFile {
            path: raw.path,
            content: raw.content,
            kind: FileKind::Implementation,
        });
    }
    for raw in envelope.test_files {
        files.push(SolutionFile {
            path: raw.path,
            content: raw.content,
            kind: FileKind::Test,
        });
    }

    if let Err(e) = persist_files(&worker_dir, &files) {
        return failed(format!("failed to persist worker files: {e}"), tokens_used, Some(exchange));
    }

    // Smoke-run the combined artifact with the security scan on.
    let combined = combine_files(&files);
    let language = detect_language(&files);
    let limits = ResourceLimits {
        timeout_seconds: SMOKE_TEST_TIMEOUT_SECS,
        ..Default::default()
    };
    let smoke = match sandbox
        .execute(&combined, language, Some(&limits), true, token)
        .await
    {
        Ok(result) => result,
        Err(e) => {
            return failed(format!("sandbox execution error: {e}"), tokens_used, Some(exchange));
        }
    };

    let status = if smoke.killed && smoke.kill_reason == Some(KillReason::SecurityScan) {
        WorkerStatus::Disqualified
    } else {
        WorkerStatus::Succeeded
    };

    tracing::info!(
        worker_id,
        profile = profile.as_str(),
        status = ?status,
        smoke_success = smoke.success,
        "developer worker finished"
    );

    (
        DeveloperResult {
            worker_id,
            profile,
            status,
            files,
            notes: envelope.notes,
            tokens_used,
            duration_seconds: start.elapsed().as_secs_f64(),
            smoke_test: Some(SmokeTest {
                success: smoke.success,
                exit_code: smoke.exit_code,
                killed: smoke.killed,
                kill_reason: smoke.kill_reason.map(|r| r.as_str().to_string()),
            }),
            error: if status == WorkerStatus::Disqualified {
                Some(format!(
                    "security scan rejected candidate: {}",
                    smoke.scan_findings.join("; ")
                ))
            } else {
                None
            },
        },
        Some(exchange),
    )
}

fn build_task_prompt(card: &Card, adr_content: &str) -> String {
    let criteria = if card.acceptance_criteria.is_empty() {
        "- complete the task described above".to_string()
    } else {
        card.acceptance_criteria
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "## TASK\n{title}\n\n{description}\n\n## ARCHITECTURE DECISION\n{adr}\n\n\
         ## ACCEPTANCE CRITERIA\n{criteria}\n\n## OUTPUT FORMAT\n\
         Respond with a single JSON object:\n\
         {{\"implementation_files\": [{{\"path\": \"...\", \"content\": \"...\"}}], \
         \"test_files\": [{{\"path\": \"...\", \"content\": \"...\"}}], \"notes\": \"...\"}}",
        title = card.title,
        description = card.description,
        adr = adr_content,
    )
}

/// Parse the worker envelope, tolerating fenced code blocks around the JSON.
fn parse_envelope(content: &str) -> Result<WorkerEnvelope, String> {
    let stripped = strip_code_fences(content);
    serde_json::from_str(stripped.trim()).map_err(|e| e.to_string())
}

fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. "json") and the closing fence.
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or(rest);
    body.rsplit_once("```").map(|(b, _)| b).unwrap_or(body)
}

fn persist_files(worker_dir: &Path, files: &[SolutionFile]) -> anyhow::Result<()> {
    use anyhow::Context;
    for file in files {
        // Worker-chosen paths stay inside the worker directory.
        if file.path.starts_with('/') || file.path.contains("..") {
            anyhow::bail!("unsafe file path from worker: {}", file.path);
        }
        let target = worker_dir.join(&file.path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&target, &file.content)
            .with_context(|| format!("Failed to write {}", target.display()))?;
    }
    Ok(())
}

/// Concatenate implementation files then test files into one runnable script.
pub fn combine_files(files: &[SolutionFile]) -> String {
    let mut combined = String::new();
    for file in files.iter().filter(|f| f.kind == FileKind::Implementation) {
        combined.push_str(&file.content);
        combined.push('\n');
    }
    for file in files.iter().filter(|f| f.kind == FileKind::Test) {
        combined.push_str(&file.content);
        combined.push('\n');
    }
    combined
}

pub fn detect_language(files: &[SolutionFile]) -> Language {
    if files.iter().any(|f| f.path.ends_with(".js")) {
        Language::Javascript
    } else if files.iter().any(|f| f.path.ends_with(".sh")) {
        Language::Shell
    } else {
        Language::Python
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ResponseCache, ScriptedProvider};
    use crate::supervisor::budget::{BudgetConfig, CostTracker};
    use tempfile::tempdir;

    fn envelope_json() -> String {
        serde_json::json!({
            "implementation_files": [
                {"path": "greeter.py", "content": "def greet(name):\n    return f'hello {name}'\n"}
            ],
            "test_files": [
                {"path": "test_greeter.py", "content": "assert greet('x') == 'hello x'\nprint('ok')\n"}
            ],
            "notes": "kept it minimal"
        })
        .to_string()
    }

    fn invoker(dir: &Path, provider: ScriptedProvider) -> DeveloperInvoker {
        let tracker = Arc::new(CostTracker::new(BudgetConfig::default()));
        let cache = ResponseCache::with_default_ttl(&dir.join("cache")).unwrap();
        DeveloperInvoker {
            gateway: Arc::new(LlmGateway::new(Box::new(provider), cache, tracker)),
            sandbox: Arc::new(SandboxExecutor::with_defaults()),
            work_dir: dir.join("work"),
            model: "test-model".to_string(),
            max_tokens: 512,
        }
    }

    fn card() -> Card {
        Card::new("c-2", "Integrate OAuth2 refresh")
            .with_acceptance_criteria(["tokens rotate", "no downtime"])
    }

    #[tokio::test]
    async fn test_three_workers_collated_ascending() {
        let dir = tempdir().unwrap();
        let provider = ScriptedProvider::new().with_default(&envelope_json());
        let inv = invoker(dir.path(), provider);

        let (results, exchanges) = inv
            .invoke(&card(), "use token rotation", 3, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(
            results.iter().map(|r| r.worker_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(results.iter().all(DeveloperResult::succeeded));
        assert!(!exchanges.is_empty());

        // Files persisted under worker-private directories.
        assert!(dir.path().join("work/workers/worker-1/greeter.py").exists());
        assert!(dir.path().join("work/workers/worker-3/test_greeter.py").exists());
    }

    #[tokio::test]
    async fn test_malformed_envelope_fails_only_that_worker() {
        let dir = tempdir().unwrap();
        // Worker prompts differ only by worker id in the system message, so
        // all workers get the same (broken) default here.
        let provider = ScriptedProvider::new().with_default("this is not json");
        let inv = invoker(dir.path(), provider);

        let err = inv
            .invoke(&card(), "adr", 2, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::errors::FailureKind::ContractViolation);
    }

    #[tokio::test]
    async fn test_forbidden_code_disqualifies_candidate() {
        let dir = tempdir().unwrap();
        let hostile = serde_json::json!({
            "implementation_files": [
                {"path": "bad.py", "content": "import socket\ns = socket.socket()\ns.connect(('evil.example.com', 80))\n"}
            ],
            "test_files": [],
            "notes": ""
        })
        .to_string();
        let provider = ScriptedProvider::new().with_default(&hostile);
        let inv = invoker(dir.path(), provider);

        let err = inv
            .invoke(&card(), "adr", 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::errors::FailureKind::SandboxViolation);
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}\n");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}\n");
    }

    #[test]
    fn test_language_detection() {
        let js = vec![SolutionFile {
            path: "index.js".to_string(),
            content: String::new(),
            kind: FileKind::Implementation,
        }];
        assert_eq!(detect_language(&js), Language::Javascript);
        assert_eq!(detect_language(&[]), Language::Python);
    }
}
