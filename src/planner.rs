//! Workflow planner: maps card attributes to an execution plan.
//!
//! The scoring algorithm is fixed (priority weight + story-point weight +
//! keyword adjustments, with 6/3 thresholds); only the keyword sets are
//! configurable.

use crate::card::Card;
use crate::stage::StageName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Task complexity tier derived from the score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Medium => "medium",
            Complexity::Complex => "complex",
        }
    }

    /// Number of competing developer workers for this tier.
    pub fn parallel_developers(&self) -> u32 {
        match self {
            Complexity::Simple => 1,
            Complexity::Medium => 2,
            Complexity::Complex => 3,
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse task classification, keyword-driven.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Feature,
    Bugfix,
    Refactor,
    Documentation,
    #[default]
    Other,
}

impl TaskType {
    /// Classify a card from its labels first, then its text.
    pub fn classify(card: &Card) -> Self {
        for label in &card.labels {
            match label.to_lowercase().as_str() {
                "bug" | "bugfix" => return TaskType::Bugfix,
                "refactor" => return TaskType::Refactor,
                "documentation" | "docs" => return TaskType::Documentation,
                "feature" | "enhancement" => return TaskType::Feature,
                _ => {}
            }
        }

        let text = card.task_text().to_lowercase();
        if text.contains("fix")
            || text.contains("bug")
            || text.contains("hotfix")
            || text.contains("patch")
            || text.contains("repair")
        {
            return TaskType::Bugfix;
        }
        if text.contains("refactor")
            || text.contains("cleanup")
            || text.contains("restructure")
            || text.contains("simplify")
        {
            return TaskType::Refactor;
        }
        if text.contains("documentation")
            || text.contains("write docs")
            || text.contains("docstring")
            || text.contains("changelog")
        {
            return TaskType::Documentation;
        }
        if text.contains("add")
            || text.contains("implement")
            || text.contains("integrate")
            || text.contains("create")
            || text.contains("build")
            || text.contains("support")
        {
            return TaskType::Feature;
        }
        TaskType::Other
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Feature => "feature",
            TaskType::Bugfix => "bugfix",
            TaskType::Refactor => "refactor",
            TaskType::Documentation => "documentation",
            TaskType::Other => "other",
        }
    }
}

/// Whether developer workers run one at a time or concurrently.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStrategy {
    Sequential,
    Parallel,
}

/// The planner's output: which stages run and with what parallelism.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPlan {
    pub complexity: Complexity,
    pub task_type: TaskType,
    pub stages: Vec<StageName>,
    pub skip_stages: BTreeSet<StageName>,
    pub parallel_developers: u32,
    pub execution_strategy: ExecutionStrategy,
    pub reasoning: Vec<String>,
}

impl WorkflowPlan {
    /// The stages the orchestrator will actually execute, in order.
    pub fn executable_stages(&self) -> Vec<StageName> {
        self.stages
            .iter()
            .copied()
            .filter(|s| !self.skip_stages.contains(s))
            .collect()
    }
}

/// Configurable keyword sets. The scoring algorithm itself is fixed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub complex_keywords: Vec<String>,
    pub simple_keywords: Vec<String>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            complex_keywords: [
                "integrate",
                "integration",
                "oauth",
                "authentication",
                "distributed",
                "concurrent",
                "migration",
                "protocol",
                "encryption",
                "across service",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            simple_keywords: [
                "typo",
                "spelling",
                "readme",
                "comment",
                "rename",
                "whitespace",
                "formatting",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Maximum score adjustment contributed by either keyword set.
const KEYWORD_CAP: i32 = 4;

/// Derives a [`WorkflowPlan`] from a card, once, at run start.
#[derive(Debug, Clone, Default)]
pub struct Planner {
    config: PlannerConfig,
}

impl Planner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn plan(&self, card: &Card) -> WorkflowPlan {
        let mut reasoning = Vec::new();

        let score = self.complexity_score(card, &mut reasoning);
        let complexity = if score >= 6 {
            Complexity::Complex
        } else if score >= 3 {
            Complexity::Medium
        } else {
            Complexity::Simple
        };
        reasoning.push(format!("score {score} -> {complexity}"));

        let task_type = TaskType::classify(card);
        reasoning.push(format!("classified as {}", task_type.as_str()));

        let parallel_developers = complexity.parallel_developers();
        let execution_strategy = if parallel_developers > 1 {
            ExecutionStrategy::Parallel
        } else {
            ExecutionStrategy::Sequential
        };

        let mut stages = vec![
            StageName::Analysis,
            StageName::Architecture,
            StageName::Dependencies,
            StageName::Development,
        ];
        if parallel_developers > 1 {
            stages.push(StageName::Arbitration);
            reasoning.push(format!(
                "{parallel_developers} competing developers -> arbitration stage included"
            ));
        } else {
            reasoning.push("single developer -> arbitration omitted".to_string());
        }
        stages.extend([
            StageName::Review,
            StageName::Validation,
            StageName::Integration,
            StageName::Testing,
        ]);

        let mut skip_stages = BTreeSet::new();
        if task_type == TaskType::Documentation {
            skip_stages.insert(StageName::Testing);
            reasoning.push("documentation task -> testing skipped".to_string());
        }

        WorkflowPlan {
            complexity,
            task_type,
            stages,
            skip_stages,
            parallel_developers,
            execution_strategy,
            reasoning,
        }
    }

    fn complexity_score(&self, card: &Card, reasoning: &mut Vec<String>) -> i32 {
        let priority_weight = card.priority.weight();
        reasoning.push(format!(
            "priority {} -> +{priority_weight}",
            card.priority.as_str()
        ));

        let points_weight = match card.story_points {
            0..=2 => 0,
            3..=4 => 1,
            5..=7 => 2,
            _ => 3,
        };
        reasoning.push(format!(
            "{} story points -> +{points_weight}",
            card.story_points
        ));

        let text = card.task_text().to_lowercase();

        let complex_hits = self
            .config
            .complex_keywords
            .iter()
            .filter(|kw| text.contains(kw.as_str()))
            .count() as i32;
        let complex_adjust = (complex_hits * 2).min(KEYWORD_CAP);
        if complex_adjust > 0 {
            reasoning.push(format!(
                "{complex_hits} complexity keyword(s) -> +{complex_adjust}"
            ));
        }

        let simple_hits = self
            .config
            .simple_keywords
            .iter()
            .filter(|kw| text.contains(kw.as_str()))
            .count() as i32;
        let simple_adjust = (simple_hits * 2).min(KEYWORD_CAP);
        if simple_adjust > 0 {
            reasoning.push(format!(
                "{simple_hits} simplicity keyword(s) -> -{simple_adjust}"
            ));
        }

        priority_weight + points_weight + complex_adjust - simple_adjust
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::Priority;

    fn planner() -> Planner {
        Planner::default()
    }

    #[test]
    fn test_low_priority_typo_card_is_simple() {
        let card = Card::new("c-1", "Fix typo")
            .with_description("Correct spelling in README")
            .with_priority(Priority::Low)
            .with_story_points(1);

        let plan = planner().plan(&card);
        assert_eq!(plan.complexity, Complexity::Simple);
        assert_eq!(plan.parallel_developers, 1);
        assert_eq!(plan.execution_strategy, ExecutionStrategy::Sequential);
        assert!(!plan.stages.contains(&StageName::Arbitration));
        assert_eq!(
            plan.stages,
            vec![
                StageName::Analysis,
                StageName::Architecture,
                StageName::Dependencies,
                StageName::Development,
                StageName::Review,
                StageName::Validation,
                StageName::Integration,
                StageName::Testing,
            ]
        );
    }

    #[test]
    fn test_high_priority_oauth_card_is_complex() {
        let card = Card::new("c-2", "Integrate OAuth2 refresh")
            .with_description("Add refresh-token rotation across service boundaries")
            .with_priority(Priority::High)
            .with_story_points(13);

        let plan = planner().plan(&card);
        assert_eq!(plan.complexity, Complexity::Complex);
        assert_eq!(plan.parallel_developers, 3);
        assert_eq!(plan.execution_strategy, ExecutionStrategy::Parallel);
        assert!(plan.stages.contains(&StageName::Arbitration));
    }

    #[test]
    fn test_zero_points_no_keywords_is_simple() {
        let card = Card::new("c-3", "Misc chore").with_story_points(0);
        let plan = planner().plan(&card);
        assert_eq!(plan.complexity, Complexity::Simple);
    }

    #[test]
    fn test_medium_tier() {
        let card = Card::new("c-4", "Improve cache eviction heuristics")
            .with_priority(Priority::Medium)
            .with_story_points(5);
        let plan = planner().plan(&card);
        assert_eq!(plan.complexity, Complexity::Medium);
        assert_eq!(plan.parallel_developers, 2);
    }

    #[test]
    fn test_documentation_task_skips_testing() {
        let card = Card::new("c-5", "Update API documentation")
            .with_labels(["documentation"])
            .with_story_points(2);
        let plan = planner().plan(&card);
        assert_eq!(plan.task_type, TaskType::Documentation);
        assert!(plan.skip_stages.contains(&StageName::Testing));
        assert!(!plan.executable_stages().contains(&StageName::Testing));
    }

    #[test]
    fn test_fix_beats_documentation_keywords() {
        // "Fix typo ... README" mentions the README but it is a bugfix, not a
        // documentation task; testing must still run.
        let card = Card::new("c-1", "Fix typo").with_description("Correct spelling in README");
        let plan = planner().plan(&card);
        assert_eq!(plan.task_type, TaskType::Bugfix);
        assert!(plan.executable_stages().contains(&StageName::Testing));
    }

    #[test]
    fn test_stages_disjoint_from_skip_set() {
        let card = Card::new("c-6", "Write changelog entry").with_labels(["docs"]);
        let plan = planner().plan(&card);
        for stage in plan.executable_stages() {
            assert!(!plan.skip_stages.contains(&stage));
        }
    }

    #[test]
    fn test_parallel_implies_arbitration() {
        let card = Card::new("c-7", "Add distributed cache invalidation protocol")
            .with_priority(Priority::High)
            .with_story_points(8);
        let plan = planner().plan(&card);
        if plan.parallel_developers > 1 {
            assert!(plan.stages.contains(&StageName::Arbitration));
        }
    }

    #[test]
    fn test_reasoning_is_recorded() {
        let card = Card::new("c-8", "Integrate payment protocol")
            .with_priority(Priority::High)
            .with_story_points(13);
        let plan = planner().plan(&card);
        assert!(!plan.reasoning.is_empty());
        assert!(plan.reasoning.iter().any(|r| r.contains("priority")));
    }
}
