//! Plain-text rendering for the CLI.

use evopool_collective::budget::WindowState;
use evopool_collective::{ComparisonSummary, DomainStatus, GraveyardEntry};
use std::fmt::Write;

pub fn pools(statuses: &[DomainStatus]) -> String {
    let mut out = String::new();
    for status in statuses {
        let _ = writeln!(
            out,
            "{} (generation {}, {} of {}..{} specialists, best {:.3}, average {:.3}){}",
            status.domain,
            status.generation,
            status.pool_size,
            status.min_size,
            status.max_size,
            status.best_score,
            status.average_score,
            match &status.pause_reason {
                Some(reason) if status.evolution_paused => format!(" paused: {}", reason),
                _ if status.evolution_paused => " paused".to_string(),
                _ => String::new(),
            }
        );
        for s in &status.specialists {
            let _ = writeln!(
                out,
                "  {:<38} gen {:<3} {:<9} avg {:.3} tasks {:<5} happiness {:.0} {:?}",
                s.id,
                s.generation,
                s.status.as_str(),
                s.average,
                s.task_count,
                s.happiness,
                s.trend
            );
        }
    }
    out
}

pub fn graveyard(entries: &[GraveyardEntry]) -> String {
    if entries.is_empty() {
        return "Graveyard is empty\n".to_string();
    }
    let mut out = String::new();
    for entry in entries {
        let patterns: Vec<&str> = entry.failure_patterns.iter().map(|p| p.as_str()).collect();
        let _ = writeln!(
            out,
            "{} {} gen {} avg {:.3} after {} tasks, retired {} ({}){}",
            entry.domain,
            entry.specialist_id,
            entry.generation,
            entry.final_average,
            entry.lifetime_tasks,
            entry.retired_at.format("%Y-%m-%d %H:%M"),
            entry.reason,
            if patterns.is_empty() {
                String::new()
            } else {
                format!(" [{}]", patterns.join(", "))
            }
        );
    }
    out
}

pub fn budget(windows: &[WindowState]) -> String {
    let mut out = String::new();
    for w in windows {
        let utilization = if w.limit.is_zero() {
            1.0
        } else {
            w.spent.as_dollars() / w.limit.as_dollars()
        };
        let _ = writeln!(
            out,
            "{:<10} {:<7} {} of {} ({:.0}%), resets {}",
            w.category,
            w.window,
            w.spent,
            w.limit,
            utilization * 100.0,
            w.resets_at.format("%Y-%m-%d %H:%M UTC")
        );
    }
    out
}

pub fn comparison(summary: &ComparisonSummary) -> String {
    if summary.pairs == 0 {
        return "No committee/council comparisons recorded\n".to_string();
    }
    format!(
        "{} comparisons, {:.0}% agreement, mean difference {:+.3}, correlation {}\n",
        summary.pairs,
        summary.agreement_rate * 100.0,
        summary.mean_difference,
        summary
            .correlation
            .map(|c| format!("{:.3}", c))
            .unwrap_or_else(|| "n/a".to_string())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use evopool_collective::{BudgetCategory, BudgetWindow, DomainPool, Usd};

    #[test]
    fn test_paused_pool_shows_reason() {
        let mut pool = DomainPool::new("support", 3, 8);
        pool.pause("converged", chrono::Utc::now());
        let text = pools(&[pool.status()]);
        assert!(text.starts_with("support (generation 1"));
        assert!(text.contains("paused: converged"));
    }

    #[test]
    fn test_budget_lines() {
        let now = chrono::Utc::now();
        let window = WindowState {
            category: BudgetCategory::Production,
            window: BudgetWindow::Daily,
            limit: Usd::from_dollars(20.0),
            spent: Usd::from_dollars(5.0),
            resets_at: now,
        };
        let text = budget(&[window]);
        assert!(text.contains("$5.00 of $20.00 (25%)"));
    }

    #[test]
    fn test_empty_comparison() {
        let summary = ComparisonSummary {
            pairs: 0,
            agreement_rate: 0.0,
            mean_difference: 0.0,
            correlation: None,
        };
        assert!(comparison(&summary).starts_with("No committee"));
        assert_eq!(graveyard(&[]), "Graveyard is empty\n");
    }
}
