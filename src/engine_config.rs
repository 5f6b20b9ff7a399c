//! Engine configuration: `artemis.toml`, environment, then CLI overrides,
//! in that precedence order.
//!
//! Validation failures here happen before any stage runs; the CLI maps them
//! to exit code 2.

use crate::planner::PlannerConfig;
use crate::supervisor::budget::{BudgetConfig, ModelRate};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Which completion backend the gateway uses.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// HTTP chat-completions endpoint; needs an API key.
    Http,
    /// Deterministic offline provider, for tests and dry runs.
    #[default]
    Scripted,
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(ProviderKind::Http),
            "scripted" => Ok(ProviderKind::Scripted),
            other => Err(format!("unknown provider '{other}' (expected http or scripted)")),
        }
    }
}

/// Fully resolved configuration for one engine invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub project_dir: PathBuf,
    pub board_file: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub artifact_store_dir: PathBuf,
    pub mailbox_root: PathBuf,
    pub workspace_dir: PathBuf,
    pub llm_cache_dir: PathBuf,

    pub provider: ProviderKind,
    pub model: String,
    pub api_base: String,
    /// Environment variable holding the provider key (never the key itself).
    pub api_key_env: String,
    pub llm_max_tokens: u32,
    pub cache_ttl_days: i64,

    pub daily_limit: f64,
    pub monthly_limit: f64,
    #[serde(default)]
    pub per_model_rate: BTreeMap<String, ModelRate>,

    pub supervision: bool,
    pub approval_required: bool,
    pub approval_timeout_secs: u64,
    #[serde(default)]
    pub incompatible_dependencies: Vec<String>,
    /// Per-stage timeout overrides (stage name → seconds).
    #[serde(default)]
    pub stage_timeouts: BTreeMap<String, u64>,
    /// Per-stage retry overrides (stage name → max retries).
    #[serde(default)]
    pub stage_max_retries: BTreeMap<String, u32>,

    #[serde(default)]
    pub planner: PlannerConfig,
}

impl EngineConfig {
    /// Defaults rooted at a project directory; all state lives under
    /// `.artemis/`.
    pub fn defaults(project_dir: &Path) -> Self {
        let root = project_dir.join(".artemis");
        Self {
            project_dir: project_dir.to_path_buf(),
            board_file: project_dir.join("board.json"),
            checkpoint_dir: root.join("checkpoints"),
            artifact_store_dir: root.join("artifacts"),
            mailbox_root: root.join("mailboxes"),
            workspace_dir: root.join("workspaces"),
            llm_cache_dir: root.join("llm_cache"),
            provider: ProviderKind::default(),
            model: "artemis-default".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            api_key_env: "ARTEMIS_API_KEY".to_string(),
            llm_max_tokens: 2048,
            cache_ttl_days: 7,
            daily_limit: 10.0,
            monthly_limit: 100.0,
            per_model_rate: BTreeMap::new(),
            supervision: true,
            approval_required: false,
            approval_timeout_secs: 60,
            incompatible_dependencies: Vec::new(),
            stage_timeouts: BTreeMap::new(),
            stage_max_retries: BTreeMap::new(),
            planner: PlannerConfig::default(),
        }
    }

    /// Load `artemis.toml` from the project directory (or an explicit path),
    /// overlaying the defaults. A missing file yields plain defaults.
    pub fn load(project_dir: &Path, config_path: Option<&Path>) -> Result<Self> {
        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| project_dir.join("artemis.toml"));
        let mut config = Self::defaults(project_dir);
        if !path.exists() {
            return Ok(config);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let toml: EngineToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        if let Some(engine) = toml.engine {
            if let Some(board) = engine.board_file {
                config.board_file = project_dir.join(board);
            }
            if let Some(dir) = engine.state_dir {
                let root = project_dir.join(dir);
                config.checkpoint_dir = root.join("checkpoints");
                config.artifact_store_dir = root.join("artifacts");
                config.mailbox_root = root.join("mailboxes");
                config.workspace_dir = root.join("workspaces");
                config.llm_cache_dir = root.join("llm_cache");
            }
            if let Some(supervision) = engine.supervision {
                config.supervision = supervision;
            }
            if let Some(required) = engine.approval_required {
                config.approval_required = required;
            }
            if let Some(secs) = engine.approval_timeout_secs {
                config.approval_timeout_secs = secs;
            }
            if let Some(deps) = engine.incompatible_dependencies {
                config.incompatible_dependencies = deps;
            }
        }
        if let Some(llm) = toml.llm {
            if let Some(provider) = llm.provider {
                config.provider = provider.parse().map_err(anyhow::Error::msg)?;
            }
            if let Some(model) = llm.model {
                config.model = model;
            }
            if let Some(api_base) = llm.api_base {
                config.api_base = api_base;
            }
            if let Some(api_key_env) = llm.api_key_env {
                config.api_key_env = api_key_env;
            }
            if let Some(max_tokens) = llm.max_tokens {
                config.llm_max_tokens = max_tokens;
            }
            if let Some(ttl) = llm.cache_ttl_days {
                config.cache_ttl_days = ttl;
            }
        }
        if let Some(budget) = toml.budget {
            if let Some(daily) = budget.daily_limit {
                config.daily_limit = daily;
            }
            if let Some(monthly) = budget.monthly_limit {
                config.monthly_limit = monthly;
            }
            if let Some(rates) = budget.per_model_rate {
                config.per_model_rate = rates;
            }
        }
        if let Some(stages) = toml.stages {
            if let Some(timeouts) = stages.timeouts {
                config.stage_timeouts = timeouts;
            }
            if let Some(retries) = stages.max_retries {
                config.stage_max_retries = retries;
            }
        }
        if let Some(planner) = toml.planner {
            if let Some(complex) = planner.complex_keywords {
                config.planner.complex_keywords = complex;
            }
            if let Some(simple) = planner.simple_keywords {
                config.planner.simple_keywords = simple;
            }
        }

        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            anyhow::bail!("llm.model must not be empty");
        }
        if self.daily_limit <= 0.0 || self.monthly_limit <= 0.0 {
            anyhow::bail!("budget limits must be positive");
        }
        if self.daily_limit > self.monthly_limit {
            anyhow::bail!(
                "daily limit (${:.2}) exceeds monthly limit (${:.2})",
                self.daily_limit,
                self.monthly_limit
            );
        }
        if self.cache_ttl_days < 0 {
            anyhow::bail!("llm.cache_ttl_days must not be negative");
        }
        for stage in self.stage_timeouts.keys().chain(self.stage_max_retries.keys()) {
            stage
                .parse::<crate::stage::StageName>()
                .map_err(anyhow::Error::msg)?;
        }
        if self.provider == ProviderKind::Http && std::env::var(&self.api_key_env).is_err() {
            anyhow::bail!(
                "provider 'http' needs an API key in the {} environment variable",
                self.api_key_env
            );
        }
        Ok(())
    }

    pub fn budget_config(&self) -> BudgetConfig {
        BudgetConfig {
            daily_limit: self.daily_limit,
            monthly_limit: self.monthly_limit,
            per_model_rate: self.per_model_rate.clone(),
        }
    }

    /// Per-card workspace directory.
    pub fn card_work_dir(&self, card_id: &str) -> PathBuf {
        self.workspace_dir.join(card_id)
    }
}

// ── Raw TOML shape ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EngineToml {
    engine: Option<EngineSection>,
    llm: Option<LlmSection>,
    budget: Option<BudgetSection>,
    stages: Option<StagesSection>,
    planner: Option<PlannerSection>,
}

#[derive(Debug, Deserialize)]
struct EngineSection {
    board_file: Option<String>,
    state_dir: Option<String>,
    supervision: Option<bool>,
    approval_required: Option<bool>,
    approval_timeout_secs: Option<u64>,
    incompatible_dependencies: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct LlmSection {
    provider: Option<String>,
    model: Option<String>,
    api_base: Option<String>,
    api_key_env: Option<String>,
    max_tokens: Option<u32>,
    cache_ttl_days: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct BudgetSection {
    daily_limit: Option<f64>,
    monthly_limit: Option<f64>,
    per_model_rate: Option<BTreeMap<String, ModelRate>>,
}

#[derive(Debug, Deserialize)]
struct StagesSection {
    timeouts: Option<BTreeMap<String, u64>>,
    max_retries: Option<BTreeMap<String, u32>>,
}

#[derive(Debug, Deserialize)]
struct PlannerSection {
    complex_keywords: Option<Vec<String>>,
    simple_keywords: Option<Vec<String>>,
}
