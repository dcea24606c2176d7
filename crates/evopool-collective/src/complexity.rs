//! Complexity classification and cost-tier routing.
//!
//! Classification is a pure function of the task and the configured rules:
//!
//! | Step | Effect |
//! |------|--------|
//! | Priority + payload size | base tier (tiny low-priority payloads are trivial) |
//! | Declared tier | tier is never below it |
//! | Financial impact ≥ threshold | critical |
//! | Expected output ≥ threshold | at least high |
//!
//! The tier then maps to a cost tier through the configured table, or the
//! local override table when local capacity is available.

use crate::budget::{BudgetCategory, Usd};
use crate::pool::SelectionMode;
use crate::task::{Task, TaskPriority};
use evopool_config::{ComplexitySettings, ComplexityTier, CostTier};

/// Where and how a task runs, and what it is expected to cost.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutePlan {
    pub complexity: ComplexityTier,
    pub cost_tier: CostTier,
    pub estimated_cost: Usd,
    pub selection: SelectionMode,
}

#[derive(Debug, Clone)]
pub struct ComplexityRouter {
    settings: ComplexitySettings,
}

impl ComplexityRouter {
    pub fn new(settings: ComplexitySettings) -> Self {
        Self { settings }
    }

    pub fn classify(&self, task: &Task) -> ComplexityTier {
        let tiny = task.payload_chars() < self.settings.trivial_payload_chars;
        let mut tier = match task.priority {
            TaskPriority::Low if tiny => ComplexityTier::Trivial,
            TaskPriority::Low => ComplexityTier::Low,
            TaskPriority::Normal if tiny => ComplexityTier::Low,
            TaskPriority::Normal => ComplexityTier::Medium,
            TaskPriority::High => ComplexityTier::High,
            TaskPriority::Critical => ComplexityTier::Critical,
        };

        let signals = &task.signals;
        if let Some(declared) = signals.declared {
            tier = tier.max(declared);
        }
        if signals
            .financial_impact
            .is_some_and(|impact| impact >= self.settings.critical_financial_impact)
        {
            tier = ComplexityTier::Critical;
        }
        if signals
            .expected_output_tokens
            .is_some_and(|tokens| tokens >= self.settings.high_output_tokens)
        {
            tier = tier.max(ComplexityTier::High);
        }
        tier
    }

    pub fn cost_tier(&self, tier: ComplexityTier, local_available: bool) -> CostTier {
        let overridden = local_available
            .then(|| self.settings.local_overrides.get(&tier))
            .flatten();
        overridden
            .or_else(|| self.settings.tier_table.get(&tier))
            .copied()
            .unwrap_or(CostTier::Standard)
    }

    pub fn estimated_cost(&self, cost_tier: CostTier) -> Usd {
        self.settings
            .tier_costs
            .get(&cost_tier)
            .map(|dollars| Usd::from_dollars(*dollars))
            .unwrap_or(Usd::ZERO)
    }

    /// Critical work goes to the best specialist, benchmark traffic rotates,
    /// everything else is drawn by weight.
    pub fn selection_mode(&self, task: &Task, tier: ComplexityTier) -> SelectionMode {
        if tier == ComplexityTier::Critical {
            SelectionMode::Best
        } else if task.category == BudgetCategory::Benchmark {
            SelectionMode::RoundRobin
        } else {
            SelectionMode::Weighted
        }
    }

    pub fn route(&self, task: &Task, local_available: bool) -> RoutePlan {
        let complexity = self.classify(task);
        let cost_tier = self.cost_tier(complexity, local_available);
        RoutePlan {
            complexity,
            cost_tier,
            estimated_cost: self.estimated_cost(cost_tier),
            selection: self.selection_mode(task, complexity),
        }
    }

    /// The same plan on the next cheaper cost tier.
    pub fn downgrade(&self, plan: &RoutePlan) -> Option<RoutePlan> {
        let cost_tier = plan.cost_tier.cheaper()?;
        Some(RoutePlan {
            cost_tier,
            estimated_cost: self.estimated_cost(cost_tier),
            ..plan.clone()
        })
    }
}
