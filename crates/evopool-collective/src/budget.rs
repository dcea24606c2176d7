//! Spend tracking and admission control.
//!
//! Every paid operation is admitted through [`BudgetController::try_admit`],
//! which checks every window of the task's category and commits the charge
//! in one step. [`BudgetStore`] puts the controller behind a single async
//! mutex so concurrent tasks cannot both pass a check against the same
//! remaining budget.
//!
//! Amounts are integer micro-dollars; windows reset on UTC calendar
//! boundaries.

use crate::types::{EngineError, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use evopool_config::{BudgetSettings, CategoryLimits, OverflowBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::Mutex;

const MICROS_PER_DOLLAR: u64 = 1_000_000;

/// A dollar amount stored as micro-dollars.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Usd(u64);

impl Usd {
    pub const ZERO: Usd = Usd(0);

    pub fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Convert from dollars; negative or non-finite amounts become zero.
    pub fn from_dollars(dollars: f64) -> Self {
        if !dollars.is_finite() || dollars <= 0.0 {
            return Self::ZERO;
        }
        Self((dollars * MICROS_PER_DOLLAR as f64).round() as u64)
    }

    pub fn micros(&self) -> u64 {
        self.0
    }

    pub fn as_dollars(&self) -> f64 {
        self.0 as f64 / MICROS_PER_DOLLAR as f64
    }

    pub fn saturating_add(self, other: Usd) -> Usd {
        Usd(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Usd) -> Usd {
        Usd(self.0.saturating_sub(other.0))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Usd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.2}", self.as_dollars())
    }
}

/// Independent spend categories.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum BudgetCategory {
    #[default]
    Production,
    Benchmark,
}

impl BudgetCategory {
    pub const ALL: [BudgetCategory; 2] = [BudgetCategory::Production, BudgetCategory::Benchmark];

    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetCategory::Production => "production",
            BudgetCategory::Benchmark => "benchmark",
        }
    }
}

impl fmt::Display for BudgetCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetWindow {
    Daily,
    Weekly,
    Monthly,
}

impl BudgetWindow {
    pub const ALL: [BudgetWindow; 3] = [BudgetWindow::Daily, BudgetWindow::Weekly, BudgetWindow::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetWindow::Daily => "daily",
            BudgetWindow::Weekly => "weekly",
            BudgetWindow::Monthly => "monthly",
        }
    }

    /// Start of the next window after `now`: next midnight, next Monday,
    /// or the first of next month, all UTC.
    pub fn next_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive();
        let date = match self {
            BudgetWindow::Daily => today + Duration::days(1),
            BudgetWindow::Weekly => {
                let days = 7 - i64::from(today.weekday().num_days_from_monday());
                today + Duration::days(days)
            }
            BudgetWindow::Monthly => {
                let (year, month) = if today.month() == 12 {
                    (today.year() + 1, 1)
                } else {
                    (today.year(), today.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(today + Duration::days(31))
            }
        };
        Utc.from_utc_datetime(&date.and_time(NaiveTime::default()))
    }

    fn limit_of(&self, limits: &CategoryLimits) -> f64 {
        match self {
            BudgetWindow::Daily => limits.daily,
            BudgetWindow::Weekly => limits.weekly,
            BudgetWindow::Monthly => limits.monthly,
        }
    }
}

impl fmt::Display for BudgetWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Spend in one window of one category.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowState {
    pub category: BudgetCategory,
    pub window: BudgetWindow,
    pub limit: Usd,
    pub spent: Usd,
    pub resets_at: DateTime<Utc>,
}

impl WindowState {
    fn new(category: BudgetCategory, window: BudgetWindow, limit: Usd, now: DateTime<Utc>) -> Self {
        Self {
            category,
            window,
            limit,
            spent: Usd::ZERO,
            resets_at: window.next_reset(now),
        }
    }

    /// Spend as seen at `now`; a window past its reset counts as empty.
    fn spent_at(&self, now: DateTime<Utc>) -> Usd {
        if now >= self.resets_at {
            Usd::ZERO
        } else {
            self.spent
        }
    }

    fn resets_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if now >= self.resets_at {
            self.window.next_reset(now)
        } else {
            self.resets_at
        }
    }

    fn utilization(&self, spent: Usd) -> f64 {
        if self.limit.is_zero() {
            return 1.0;
        }
        spent.micros() as f64 / self.limit.micros() as f64
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SignalLevel {
    Warning,
    Critical,
}

/// Non-fatal threshold notice for external alerting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetSignal {
    pub category: BudgetCategory,
    pub window: BudgetWindow,
    pub level: SignalLevel,
    pub utilization: f64,
}

/// A committed charge.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub category: BudgetCategory,
    pub cost: Usd,
    pub signals: Vec<BudgetSignal>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowStatus {
    pub window: BudgetWindow,
    pub limit: Usd,
    pub spent: Usd,
    pub remaining: Usd,
    pub utilization: f64,
    pub level: Option<SignalLevel>,
    pub resets_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryStatus {
    pub category: BudgetCategory,
    pub windows: Vec<WindowStatus>,
}

/// Budget state per category and window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetSnapshot {
    pub taken_at: DateTime<Utc>,
    pub overflow: OverflowBehavior,
    pub categories: Vec<CategoryStatus>,
}

impl BudgetSnapshot {
    pub fn window(&self, category: BudgetCategory, window: BudgetWindow) -> Option<&WindowStatus> {
        self.categories
            .iter()
            .find(|c| c.category == category)
            .and_then(|c| c.windows.iter().find(|w| w.window == window))
    }
}

/// Rolling daily/weekly/monthly spend limits per category.
#[derive(Debug, Clone)]
pub struct BudgetController {
    warning_ratio: f64,
    critical_ratio: f64,
    overflow: OverflowBehavior,
    windows: BTreeMap<(BudgetCategory, BudgetWindow), WindowState>,
}

impl BudgetController {
    pub fn new(settings: &BudgetSettings, now: DateTime<Utc>) -> Self {
        let mut windows = BTreeMap::new();
        for category in BudgetCategory::ALL {
            let limits = match category {
                BudgetCategory::Production => &settings.production,
                BudgetCategory::Benchmark => &settings.benchmark,
            };
            for window in BudgetWindow::ALL {
                let limit = Usd::from_dollars(window.limit_of(limits));
                windows.insert(
                    (category, window),
                    WindowState::new(category, window, limit, now),
                );
            }
        }
        Self {
            warning_ratio: settings.warning_ratio,
            critical_ratio: settings.critical_ratio,
            overflow: settings.overflow,
            windows,
        }
    }

    pub fn overflow(&self) -> OverflowBehavior {
        self.overflow
    }

    fn category_windows(&self, category: BudgetCategory) -> impl Iterator<Item = &WindowState> {
        self.windows.values().filter(move |w| w.category == category)
    }

    /// Whether `cost` fits in every window of `category`. Does not mutate.
    pub fn can_afford(&self, cost: Usd, category: BudgetCategory, now: DateTime<Utc>) -> bool {
        self.check(cost, category, now).is_ok()
    }

    /// Whether `cost` is larger than some window of `category` can ever hold.
    pub fn exceeds_limit(&self, cost: Usd, category: BudgetCategory) -> bool {
        self.category_windows(category).any(|state| cost > state.limit)
    }

    /// Like [`can_afford`](Self::can_afford) but reports the first window
    /// that would be exceeded.
    pub fn check(&self, cost: Usd, category: BudgetCategory, now: DateTime<Utc>) -> Result<()> {
        for state in self.category_windows(category) {
            let spent = state.spent_at(now);
            if spent.saturating_add(cost) > state.limit {
                return Err(EngineError::BudgetExceeded {
                    category,
                    window: state.window,
                    spent,
                    limit: state.limit,
                    remaining: state.limit.saturating_sub(spent),
                    resets_at: state.resets_after(now),
                });
            }
        }
        Ok(())
    }

    /// Commit a charge without checking limits.
    pub fn record_spend(
        &mut self,
        cost: Usd,
        category: BudgetCategory,
        now: DateTime<Utc>,
    ) -> Vec<BudgetSignal> {
        self.roll_windows(now);
        let warning = self.warning_ratio;
        let critical = self.critical_ratio;
        let mut signals = Vec::new();
        for state in self.windows.values_mut().filter(|w| w.category == category) {
            let before = level(state.utilization(state.spent), warning, critical);
            state.spent = state.spent.saturating_add(cost);
            let utilization = state.utilization(state.spent);
            let Some(after) = level(utilization, warning, critical) else {
                continue;
            };
            if before != Some(after) {
                tracing::warn!(
                    "Budget {} {} at {:.0}% ({} of {})",
                    category,
                    state.window,
                    utilization * 100.0,
                    state.spent,
                    state.limit
                );
            }
            signals.push(BudgetSignal {
                category,
                window: state.window,
                level: after,
                utilization,
            });
        }
        signals
    }

    /// Check and commit in one step.
    pub fn try_admit(
        &mut self,
        cost: Usd,
        category: BudgetCategory,
        now: DateTime<Utc>,
    ) -> Result<Admission> {
        self.roll_windows(now);
        self.check(cost, category, now)?;
        let signals = self.record_spend(cost, category, now);
        tracing::debug!("Admitted {} against {} budget", cost, category);
        Ok(Admission {
            category,
            cost,
            signals,
            at: now,
        })
    }

    /// Give back a charge for a task that never started. Windows that
    /// reset since the admission are left alone.
    pub fn refund(&mut self, admission: &Admission, now: DateTime<Utc>) {
        self.roll_windows(now);
        for state in self
            .windows
            .values_mut()
            .filter(|w| w.category == admission.category)
        {
            if state.window.next_reset(admission.at) == state.resets_at {
                state.spent = state.spent.saturating_sub(admission.cost);
            }
        }
        tracing::debug!("Refunded {} to {} budget", admission.cost, admission.category);
    }

    /// Reset every window whose boundary has passed.
    pub fn roll_windows(&mut self, now: DateTime<Utc>) {
        for state in self.windows.values_mut() {
            if now >= state.resets_at {
                if !state.spent.is_zero() {
                    tracing::info!(
                        "Budget {} {} window reset (was {})",
                        state.category,
                        state.window,
                        state.spent
                    );
                }
                state.spent = Usd::ZERO;
                state.resets_at = state.window.next_reset(now);
            }
        }
    }

    /// Earliest time any exhausted window of `category` resets.
    pub fn earliest_reset(&self, category: BudgetCategory, now: DateTime<Utc>) -> DateTime<Utc> {
        self.category_windows(category)
            .map(|w| w.resets_after(now))
            .min()
            .unwrap_or_else(|| BudgetWindow::Daily.next_reset(now))
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> BudgetSnapshot {
        let categories = BudgetCategory::ALL
            .iter()
            .map(|&category| CategoryStatus {
                category,
                windows: self
                    .category_windows(category)
                    .map(|state| {
                        let spent = state.spent_at(now);
                        let utilization = state.utilization(spent);
                        WindowStatus {
                            window: state.window,
                            limit: state.limit,
                            spent,
                            remaining: state.limit.saturating_sub(spent),
                            utilization,
                            level: level(utilization, self.warning_ratio, self.critical_ratio),
                            resets_at: state.resets_after(now),
                        }
                    })
                    .collect(),
            })
            .collect();
        BudgetSnapshot {
            taken_at: now,
            overflow: self.overflow,
            categories,
        }
    }

    /// Persisted spend, for snapshots.
    pub fn ledger(&self) -> Vec<WindowState> {
        self.windows.values().cloned().collect()
    }

    /// Restore persisted spend. Limits keep their configured values.
    pub fn restore_ledger(&mut self, ledger: &[WindowState], now: DateTime<Utc>) {
        for saved in ledger {
            if let Some(state) = self.windows.get_mut(&(saved.category, saved.window)) {
                state.spent = saved.spent;
                state.resets_at = saved.resets_at;
            }
        }
        self.roll_windows(now);
    }
}

fn level(utilization: f64, warning: f64, critical: f64) -> Option<SignalLevel> {
    if utilization >= critical {
        Some(SignalLevel::Critical)
    } else if utilization >= warning {
        Some(SignalLevel::Warning)
    } else {
        None
    }
}

/// The shared budget, owned by whoever wires the engine together.
#[derive(Debug)]
pub struct BudgetStore {
    inner: Mutex<BudgetController>,
}

impl BudgetStore {
    pub fn new(controller: BudgetController) -> Self {
        Self {
            inner: Mutex::new(controller),
        }
    }

    pub async fn try_admit(&self, cost: Usd, category: BudgetCategory) -> Result<Admission> {
        self.try_admit_at(cost, category, Utc::now()).await
    }

    pub async fn try_admit_at(
        &self,
        cost: Usd,
        category: BudgetCategory,
        now: DateTime<Utc>,
    ) -> Result<Admission> {
        self.inner.lock().await.try_admit(cost, category, now)
    }

    pub async fn refund(&self, admission: &Admission) {
        self.inner.lock().await.refund(admission, Utc::now());
    }

    pub async fn exceeds_limit(&self, cost: Usd, category: BudgetCategory) -> bool {
        self.inner.lock().await.exceeds_limit(cost, category)
    }

    pub async fn can_afford(&self, cost: Usd, category: BudgetCategory) -> bool {
        self.inner.lock().await.can_afford(cost, category, Utc::now())
    }

    pub async fn overflow(&self) -> OverflowBehavior {
        self.inner.lock().await.overflow()
    }

    pub async fn earliest_reset(&self, category: BudgetCategory) -> DateTime<Utc> {
        let now = Utc::now();
        self.inner.lock().await.earliest_reset(category, now)
    }

    pub async fn snapshot(&self) -> BudgetSnapshot {
        self.inner.lock().await.snapshot(Utc::now())
    }

    pub async fn ledger(&self) -> Vec<WindowState> {
        self.inner.lock().await.ledger()
    }

    pub async fn restore_ledger(&self, ledger: &[WindowState]) {
        self.inner.lock().await.restore_ledger(ledger, Utc::now());
    }
}
