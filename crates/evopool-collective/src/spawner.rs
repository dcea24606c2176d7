//! Creating specialists from domain templates.

use crate::graveyard::{GraveyardEntry, LearningBook, LearningKind};
use crate::specialist::{
    InjectedInstruction, InstructionKind, Specialist, SpecialistConfig, SpecialistStatus,
};
use crate::types::{EngineError, Result};
use evopool_config::{DomainDocument, PoolSettings};

/// Builds specialist configurations from a domain template plus the
/// domain's accumulated learnings.
#[derive(Debug, Clone)]
pub struct Spawner {
    window_size: usize,
    default_happiness: f64,
}

impl Spawner {
    pub fn new(window_size: usize, default_happiness: f64) -> Self {
        Self {
            window_size,
            default_happiness,
        }
    }

    pub fn from_settings(settings: &PoolSettings) -> Self {
        Self::new(settings.score_window, settings.default_happiness)
    }

    /// Compose the configuration a new specialist of this domain gets.
    ///
    /// Fails with [`EngineError::SpawnFailed`] when the template is unusable.
    pub fn compose(
        &self,
        domain: &str,
        document: Option<&DomainDocument>,
        learnings: Option<&LearningBook>,
    ) -> Result<SpecialistConfig> {
        let document = document.ok_or_else(|| EngineError::SpawnFailed {
            domain: domain.to_string(),
            reason: "no domain document registered".to_string(),
        })?;
        document
            .validate(&document.name)
            .map_err(|e| EngineError::SpawnFailed {
                domain: domain.to_string(),
                reason: e.to_string(),
            })?;

        let mut injected: Vec<InjectedInstruction> = Vec::new();
        let mut push = |kind: InstructionKind, text: &str| {
            let text = text.trim();
            if !text.is_empty() && !injected.iter().any(|i| i.kind == kind && i.text == text) {
                injected.push(InjectedInstruction {
                    kind,
                    text: text.to_string(),
                });
            }
        };

        if let Some(book) = learnings {
            for learning in book.of_kind(LearningKind::Avoidance) {
                push(InstructionKind::Avoid, &learning.instruction);
            }
            for learning in book.of_kind(LearningKind::Enhancement) {
                push(InstructionKind::Always, &learning.instruction);
            }
        }
        for seed in &document.enhancements {
            push(InstructionKind::Always, seed);
        }

        Ok(SpecialistConfig {
            instructions: render(&document.template.instructions, &injected),
            temperature: document.template.temperature,
            capabilities: document.template.capabilities.clone(),
            injected,
        })
    }

    pub fn spawn(
        &self,
        domain: &str,
        document: Option<&DomainDocument>,
        learnings: Option<&LearningBook>,
        generation: u64,
        status: SpecialistStatus,
    ) -> Result<Specialist> {
        let config = self.compose(domain, document, learnings)?;
        let specialist = Specialist::new(
            domain,
            generation,
            config,
            status,
            self.window_size,
            self.default_happiness,
        );
        tracing::info!(
            "Spawned specialist {} for {} (generation {}, {} injected instructions)",
            specialist.id,
            domain,
            generation,
            specialist.config.injected.len()
        );
        Ok(specialist)
    }

    /// Bring a retired specialist back on probation with its archived configuration.
    pub fn restore(&self, entry: &GraveyardEntry, generation: u64) -> Specialist {
        Specialist::new(
            entry.domain.clone(),
            generation,
            entry.config_snapshot.clone(),
            SpecialistStatus::Probation,
            self.window_size,
            self.default_happiness,
        )
        .with_id(entry.specialist_id.clone())
    }
}

/// Base instructions followed by "Avoid" and "Always" blocks.
fn render(base: &str, injected: &[InjectedInstruction]) -> String {
    let mut out = base.trim_end().to_string();
    for (kind, heading) in [
        (InstructionKind::Avoid, "Avoid:"),
        (InstructionKind::Always, "Always:"),
    ] {
        let items: Vec<&str> = injected
            .iter()
            .filter(|i| i.kind == kind)
            .map(|i| i.text.as_str())
            .collect();
        if items.is_empty() {
            continue;
        }
        out.push_str("\n\n");
        out.push_str(heading);
        for item in items {
            out.push_str("\n- ");
            out.push_str(item);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graveyard::{FailureAnalysis, FailurePattern, Learning};

    fn spawner() -> Spawner {
        Spawner::new(20, 60.0)
    }

    #[test]
    fn test_plain_template() {
        let doc = DomainDocument::new("support", "Help users.");
        let config = spawner().compose("support", Some(&doc), None).unwrap();
        assert_eq!(config.instructions, "Help users.");
        assert!(config.injected.is_empty());
    }

    #[test]
    fn test_learnings_are_appended_as_blocks() {
        let doc = DomainDocument::new("support", "Help users.")
            .with_enhancements(vec!["Link the relevant help article".into()]);
        let mut book = LearningBook::new("support");
        book.add(Learning::avoidance(FailurePattern::EdgeCases, None));
        book.add(Learning::enhancement("Confirm the account id first", None));

        let config = spawner().compose("support", Some(&doc), Some(&book)).unwrap();
        let expected = format!(
            "Help users.\n\nAvoid:\n- {}\n\nAlways:\n- Confirm the account id first\n- Link the relevant help article",
            FailurePattern::EdgeCases.avoidance()
        );
        assert_eq!(config.instructions, expected);
        assert_eq!(config.injected.len(), 3);
    }

    #[test]
    fn test_missing_document_fails() {
        let err = spawner().compose("support", None, None).unwrap_err();
        assert!(matches!(err, EngineError::SpawnFailed { .. }));
    }

    #[test]
    fn test_invalid_template_fails() {
        let doc = DomainDocument::new("support", "  ");
        let err = spawner()
            .spawn("support", Some(&doc), None, 2, SpecialistStatus::Probation)
            .unwrap_err();
        assert!(matches!(err, EngineError::SpawnFailed { .. }));
    }

    #[test]
    fn test_restore_keeps_snapshot_and_id() {
        let doc = DomainDocument::new("support", "Help users.");
        let original = spawner()
            .spawn("support", Some(&doc), None, 1, SpecialistStatus::Active)
            .unwrap();
        let entry =
            GraveyardEntry::from_specialist(&original, &FailureAnalysis::default(), "culled");

        let restored = spawner().restore(&entry, 7);
        assert_eq!(restored.id, original.id);
        assert_eq!(restored.config, entry.config_snapshot);
        assert_eq!(restored.status, SpecialistStatus::Probation);
        assert_eq!(restored.generation, 7);
        assert_eq!(restored.task_count(), 0);
    }
}
