//! Retired specialists and the lessons taken from them.
//!
//! When a specialist is culled, its recent failures are classified into a
//! small fixed set of [`FailurePattern`]s. Each distinct pattern becomes an
//! avoidance [`Learning`] for the domain, and the specialist itself is
//! archived as a [`GraveyardEntry`] so it can be inspected or restored.

use crate::specialist::{Specialist, SpecialistConfig};
use crate::types::{Domain, SpecialistId};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Window spread above which a specialist counts as inconsistent.
const CONSISTENCY_SPREAD: f64 = 0.2;

/// Evidence snippets kept per learning.
const MAX_EVIDENCE: usize = 5;

/// Fixed failure categories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FailurePattern {
    PromptWeakness,
    ToolMisuse,
    Consistency,
    EdgeCases,
}

impl FailurePattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePattern::PromptWeakness => "prompt_weakness",
            FailurePattern::ToolMisuse => "tool_misuse",
            FailurePattern::Consistency => "consistency",
            FailurePattern::EdgeCases => "edge_cases",
        }
    }

    /// Avoidance instruction injected into future specialists.
    pub fn avoidance(&self) -> &'static str {
        match self {
            FailurePattern::PromptWeakness => {
                "Restate the task requirements and the expected output format before answering; do not leave parts of the request unaddressed"
            }
            FailurePattern::ToolMisuse => {
                "Validate tool arguments before every call and check each tool result before relying on it"
            }
            FailurePattern::Consistency => {
                "Follow the same procedure for similar tasks and verify the answer against the requirements before returning it"
            }
            FailurePattern::EdgeCases => {
                "Handle empty, missing, boundary and oversized inputs explicitly instead of assuming the common case"
            }
        }
    }
}

/// Patterns found in one specialist's failure history.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FailureAnalysis {
    /// Number of failures attributed to each pattern
    pub counts: BTreeMap<FailurePattern, usize>,
    /// Sample error texts per pattern
    pub evidence: BTreeMap<FailurePattern, Vec<String>>,
}

impl FailureAnalysis {
    pub fn patterns(&self) -> Vec<FailurePattern> {
        self.counts.keys().copied().collect()
    }

    fn add(&mut self, pattern: FailurePattern, evidence: Option<&str>) {
        *self.counts.entry(pattern).or_default() += 1;
        if let Some(text) = evidence.filter(|t| !t.trim().is_empty()) {
            let samples = self.evidence.entry(pattern).or_default();
            if samples.len() < MAX_EVIDENCE {
                samples.push(text.trim().to_string());
            }
        }
    }
}

/// Classifies recent failures with keyword rules.
#[derive(Debug, Clone)]
pub struct FailureAnalyzer {
    tool: Option<Regex>,
    edge: Option<Regex>,
    consistency: Option<Regex>,
    prompt: Option<Regex>,
}

impl Default for FailureAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureAnalyzer {
    pub fn new() -> Self {
        Self {
            tool: rule(r"(?i)\b(tool|function call|invalid arguments?|unknown command|permission denied|not allowed)\b"),
            edge: rule(r"(?i)\b(edge case|empty|null|none|nil|boundary|overflow|underflow|out of (range|bounds)|unicode|timed? ?out|division by zero)\b"),
            consistency: rule(r"(?i)\b(inconsistent|contradict\w*|flaky|non-?deterministic|different (answer|result)s?)\b"),
            prompt: rule(r"(?i)\b(misunderstood|off[- ]topic|ignored instructions?|wrong format|incomplete|missing section)\b"),
        }
    }

    /// Classify the specialist's recent failures.
    pub fn analyze(&self, specialist: &Specialist) -> FailureAnalysis {
        let mut analysis = FailureAnalysis::default();

        for failure in &specialist.recent_failures {
            let error = failure.error.as_deref().unwrap_or("");
            let checks = failure.failed_checks.join(" ");
            let text = format!("{} {}", error, checks);
            let evidence = failure.error.as_deref().or(failure.tool_errors.first().map(String::as_str));
            let mut matched = false;

            if !failure.tool_errors.is_empty() || matches(&self.tool, &text) {
                analysis.add(FailurePattern::ToolMisuse, evidence);
                matched = true;
            }
            if matches(&self.edge, &text) {
                analysis.add(FailurePattern::EdgeCases, evidence);
                matched = true;
            }
            if matches(&self.consistency, &text) {
                analysis.add(FailurePattern::Consistency, evidence);
                matched = true;
            }
            if matches(&self.prompt, &text) || !matched {
                analysis.add(FailurePattern::PromptWeakness, evidence);
            }
        }

        if !specialist.recent_failures.is_empty()
            && (specialist.stats.spread() > CONSISTENCY_SPREAD || has_mixed_outcomes(specialist))
        {
            analysis.add(FailurePattern::Consistency, None);
        }

        analysis
    }
}

fn rule(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::error!("Invalid failure rule {}: {}", pattern, e);
            None
        }
    }
}

fn matches(rule: &Option<Regex>, text: &str) -> bool {
    rule.as_ref().map(|re| re.is_match(text)).unwrap_or(false)
}

/// A task kind the specialist has both failed and succeeded at.
fn has_mixed_outcomes(specialist: &Specialist) -> bool {
    specialist
        .recent_failures
        .iter()
        .filter_map(|f| f.task_kind.as_deref())
        .any(|kind| specialist.succeeded_kinds.contains(kind))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum LearningKind {
    Avoidance,
    Enhancement,
}

/// An instruction distilled from past specialists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Learning {
    pub kind: LearningKind,
    pub instruction: String,
    /// Failure patterns this learning came from (empty for enhancements)
    #[serde(default)]
    pub provenance: Vec<FailurePattern>,
    #[serde(default)]
    pub evidence: Vec<String>,
    pub source_specialist: Option<SpecialistId>,
    pub created_at: DateTime<Utc>,
}

impl Learning {
    pub fn avoidance(pattern: FailurePattern, source: Option<SpecialistId>) -> Self {
        Self {
            kind: LearningKind::Avoidance,
            instruction: pattern.avoidance().to_string(),
            provenance: vec![pattern],
            evidence: Vec::new(),
            source_specialist: source,
            created_at: Utc::now(),
        }
    }

    pub fn enhancement(instruction: impl Into<String>, source: Option<SpecialistId>) -> Self {
        Self {
            kind: LearningKind::Enhancement,
            instruction: instruction.into(),
            provenance: Vec::new(),
            evidence: Vec::new(),
            source_specialist: source,
            created_at: Utc::now(),
        }
    }
}

/// Accumulated learnings of one domain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearningBook {
    pub domain: Domain,
    learnings: Vec<Learning>,
}

impl LearningBook {
    pub fn new(domain: impl Into<Domain>) -> Self {
        Self {
            domain: domain.into(),
            learnings: Vec::new(),
        }
    }

    /// Add a learning unless one with the same kind and instruction exists;
    /// duplicates merge their evidence instead. Returns `true` when added.
    pub fn add(&mut self, learning: Learning) -> bool {
        if let Some(existing) = self
            .learnings
            .iter_mut()
            .find(|l| l.kind == learning.kind && l.instruction == learning.instruction)
        {
            for sample in learning.evidence {
                if existing.evidence.len() < MAX_EVIDENCE && !existing.evidence.contains(&sample) {
                    existing.evidence.push(sample);
                }
            }
            return false;
        }
        self.learnings.push(learning);
        true
    }

    pub fn learnings(&self) -> &[Learning] {
        &self.learnings
    }

    pub fn of_kind(&self, kind: LearningKind) -> impl Iterator<Item = &Learning> {
        self.learnings.iter().filter(move |l| l.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.learnings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.learnings.is_empty()
    }
}

/// Archived record of a retired specialist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraveyardEntry {
    pub specialist_id: SpecialistId,
    pub domain: Domain,
    pub generation: u64,
    pub final_average: f64,
    pub lifetime_tasks: u64,
    pub final_happiness: f64,
    pub config_snapshot: SpecialistConfig,
    pub failure_patterns: Vec<FailurePattern>,
    pub reason: String,
    pub retired_at: DateTime<Utc>,
}

impl GraveyardEntry {
    pub fn from_specialist(
        specialist: &Specialist,
        analysis: &FailureAnalysis,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            specialist_id: specialist.id.clone(),
            domain: specialist.domain.clone(),
            generation: specialist.generation,
            final_average: specialist.average(),
            lifetime_tasks: specialist.task_count(),
            final_happiness: specialist.happiness,
            config_snapshot: specialist.config.clone(),
            failure_patterns: analysis.patterns(),
            reason: reason.into(),
            retired_at: Utc::now(),
        }
    }
}

/// Append-only archive of retired specialists.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Graveyard {
    entries: Vec<GraveyardEntry>,
}

impl Graveyard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: GraveyardEntry) {
        tracing::info!(
            "Archived specialist {} of {} (generation {}, average {:.3})",
            entry.specialist_id,
            entry.domain,
            entry.generation,
            entry.final_average
        );
        self.entries.push(entry);
    }

    /// Entries, optionally filtered by domain, oldest first.
    pub fn list(&self, domain: Option<&str>) -> Vec<GraveyardEntry> {
        self.entries
            .iter()
            .filter(|e| domain.map(|d| e.domain == d).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Most recent entry for a specialist.
    pub fn find(&self, specialist_id: &str) -> Option<&GraveyardEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.specialist_id == specialist_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specialist::{test_config, FailureRecord, SpecialistStatus};

    fn failing_specialist(failures: &[(&str, Option<&str>, Vec<&str>)]) -> Specialist {
        let mut s = Specialist::new(
            "support",
            1,
            test_config("Help."),
            SpecialistStatus::Active,
            20,
            60.0,
        );
        for (i, (task_id, error, tool_errors)) in failures.iter().enumerate() {
            s.record_score(*task_id, 0.3 + i as f64 * 0.001);
            s.record_failure(
                FailureRecord {
                    task_id: task_id.to_string(),
                    score: 0.3,
                    error: error.map(str::to_string),
                    failed_checks: vec![],
                    tool_errors: tool_errors.iter().map(|t| t.to_string()).collect(),
                    task_kind: None,
                    at: Utc::now(),
                },
                20,
            );
        }
        s
    }

    #[test]
    fn test_classification_rules() {
        let s = failing_specialist(&[
            ("t1", Some("search tool returned 403"), vec![]),
            ("t2", None, vec!["invalid arguments for grep"]),
            ("t3", Some("panicked on empty input"), vec![]),
            ("t4", Some("answer was off-topic"), vec![]),
            ("t5", Some("something went wrong"), vec![]),
        ]);
        let analysis = FailureAnalyzer::new().analyze(&s);
        assert_eq!(analysis.counts.get(&FailurePattern::ToolMisuse), Some(&2));
        assert_eq!(analysis.counts.get(&FailurePattern::EdgeCases), Some(&1));
        assert_eq!(analysis.counts.get(&FailurePattern::PromptWeakness), Some(&2));
        assert!(!analysis.counts.contains_key(&FailurePattern::Consistency));
    }

    #[test]
    fn test_high_spread_flags_consistency() {
        let mut s = failing_specialist(&[("t1", Some("wrong format"), vec![])]);
        s.record_score("t2", 1.0);
        s.record_score("t3", 0.0);
        s.record_score("t4", 1.0);
        let analysis = FailureAnalyzer::new().analyze(&s);
        assert!(analysis.counts.contains_key(&FailurePattern::Consistency));
    }

    #[test]
    fn test_mixed_outcomes_flag_consistency() {
        let mut s = failing_specialist(&[("t1", Some("wrong format"), vec![])]);
        s.recent_failures[0].task_kind = Some("refund".into());
        assert!(!FailureAnalyzer::new()
            .analyze(&s)
            .counts
            .contains_key(&FailurePattern::Consistency));

        s.record_success_kind("refund");
        assert!(FailureAnalyzer::new()
            .analyze(&s)
            .counts
            .contains_key(&FailurePattern::Consistency));
    }

    #[test]
    fn test_no_failures_no_patterns() {
        let s = failing_specialist(&[]);
        assert!(FailureAnalyzer::new().analyze(&s).counts.is_empty());
    }

    #[test]
    fn test_learning_book_deduplicates() {
        let mut book = LearningBook::new("support");
        assert!(book.add(Learning::avoidance(FailurePattern::EdgeCases, None)));
        let mut again = Learning::avoidance(FailurePattern::EdgeCases, Some("x".into()));
        again.evidence.push("empty input".into());
        assert!(!book.add(again));
        assert_eq!(book.len(), 1);
        assert_eq!(book.learnings()[0].evidence, vec!["empty input".to_string()]);
        assert!(book.add(Learning::enhancement("Cite sources", None)));
        assert_eq!(book.of_kind(LearningKind::Enhancement).count(), 1);
    }

    #[test]
    fn test_graveyard_is_append_only_and_filterable() {
        let mut graveyard = Graveyard::new();
        let s = failing_specialist(&[("t1", Some("timeout"), vec![])]);
        let analysis = FailureAnalyzer::new().analyze(&s);
        let entry = GraveyardEntry::from_specialist(&s, &analysis, "below threshold");
        assert_eq!(entry.failure_patterns, vec![FailurePattern::EdgeCases]);
        graveyard.append(entry.clone());
        graveyard.append(entry);

        assert_eq!(graveyard.len(), 2);
        assert_eq!(graveyard.list(Some("support")).len(), 2);
        assert!(graveyard.list(Some("billing")).is_empty());
        assert!(graveyard.find(&s.id).is_some());
    }
}
