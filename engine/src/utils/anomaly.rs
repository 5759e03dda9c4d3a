use crate::form::{coerce_number, FieldDefinition, InventoryAction, ValueMap};
use crate::resolver::FormulaContext;
use crate::utils::inventory::InventoryResult;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/* ------------------------------ Form anomalies ---------------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyThresholds {
    /// A count above `(starting + intake) * overcount_margin` is an overcount.
    pub overcount_margin: f64,
    /// A count below `starting * depletion_ratio` is a severe depletion.
    pub depletion_ratio: f64,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        AnomalyThresholds {
            overcount_margin: 1.2,
            depletion_ratio: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum AnomalyClass {
    Normal,
    Overcount {
        counted: f64,
        starting: f64,
        intake: f64,
        expected_max: f64,
    },
    SevereDepletion {
        counted: f64,
        starting: f64,
        intake: f64,
        consumption_percent: f64,
    },
}

impl AnomalyClass {
    pub fn is_normal(&self) -> bool {
        matches!(self, AnomalyClass::Normal)
    }

    /// Text shown to the person submitting the count.
    pub fn message(&self) -> Option<String> {
        match self {
            AnomalyClass::Normal => None,
            AnomalyClass::Overcount {
                counted,
                starting,
                intake,
                ..
            } => Some(format!(
                "Counted {counted:.1} units but only {starting:.1} were in stock and {intake:.1} were received. \
                 Please recheck the count."
            )),
            AnomalyClass::SevereDepletion {
                counted,
                consumption_percent,
                ..
            } => Some(format!(
                "Only {counted:.1} units remain, {consumption_percent:.0}% of stock used since the last count. \
                 Please confirm this consumption."
            )),
        }
    }
}

pub fn detect_anomaly(counted: f64, starting: f64, intake: f64) -> AnomalyClass {
    detect_anomaly_with(&AnomalyThresholds::default(), counted, starting, intake)
}

pub fn detect_anomaly_with(
    thresholds: &AnomalyThresholds,
    counted: f64,
    starting: f64,
    intake: f64,
) -> AnomalyClass {
    let expected_max = (starting + intake) * thresholds.overcount_margin;
    if counted > expected_max {
        return AnomalyClass::Overcount {
            counted,
            starting,
            intake,
            expected_max,
        };
    }
    if starting > 0.0 && counted < starting * thresholds.depletion_ratio {
        return AnomalyClass::SevereDepletion {
            counted,
            starting,
            intake,
            consumption_percent: (starting - counted + intake) / starting * 100.0,
        };
    }
    AnomalyClass::Normal
}

/// Starting quantity for a form: `mapped.starting_inventory`, falling back
/// to `mapped.current_inventory` when that is zero or absent.
pub fn starting_quantity(mapped: &FormulaContext) -> f64 {
    let starting = mapped.mapped("starting_inventory");
    if starting != 0.0 {
        starting
    } else {
        mapped.mapped("current_inventory")
    }
}

/// Sum of every `add` field's value.
pub fn intake_quantity(values: &ValueMap, fields: &[FieldDefinition]) -> f64 {
    fields
        .iter()
        .filter(|f| f.inventory_action == InventoryAction::Add)
        .filter_map(|f| values.get(&f.id))
        .map(coerce_number)
        .sum()
}

/// Classify a submitted form. Forms without a `set` field carry no count
/// and are not assessed.
pub fn assess_form(
    thresholds: &AnomalyThresholds,
    values: &ValueMap,
    fields: &[FieldDefinition],
    mapped: &FormulaContext,
) -> Option<AnomalyClass> {
    let count_field = fields
        .iter()
        .find(|f| f.inventory_action == InventoryAction::Set)?;
    let counted = values.get(&count_field.id).map(coerce_number).unwrap_or(0.0);
    Some(detect_anomaly_with(
        thresholds,
        counted,
        starting_quantity(mapped),
        intake_quantity(values, fields),
    ))
}

/// Classify a resolved inventory change using its raw, unclamped quantity.
pub fn assess_resolution(
    thresholds: &AnomalyThresholds,
    result: &InventoryResult,
    starting: f64,
    intake: f64,
) -> AnomalyClass {
    detect_anomaly_with(thresholds, result.new_quantity, starting, intake)
}

/* ------------------------------ Count events ------------------------------ */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountEvent {
    pub quantity: f64,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub check_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl CountEvent {
    pub fn new(quantity: f64, event_type: &str) -> Self {
        CountEvent {
            quantity,
            event_type: event_type.to_string(),
            check_date: None,
            user_id: None,
        }
    }

    pub fn checked_at(mut self, date: DateTime<Utc>) -> Self {
        self.check_date = Some(date);
        self
    }

    pub fn by(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    fn expects_increase(&self) -> bool {
        matches!(self.event_type.as_str(), "intake" | "addition" | "transfer")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetCategory {
    Coating,
    Hardware,
    General,
}

impl AssetCategory {
    pub fn from_name(name: Option<&str>) -> Self {
        let Some(name) = name else {
            return AssetCategory::General;
        };
        match name.to_lowercase().as_str() {
            "paint" | "chemical" | "coating" => AssetCategory::Coating,
            "parts" | "hardware" | "consumable" => AssetCategory::Hardware,
            _ => AssetCategory::General,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CountThresholds {
    pub massive_increase: f64,
    pub percentage_ratio: f64,
    pub unexpected_increase: f64,
}

impl CountThresholds {
    pub fn for_category(category: AssetCategory, previous_quantity: f64) -> Self {
        let base = if previous_quantity != 0.0 {
            (previous_quantity * 0.5).max(20.0)
        } else {
            50.0
        };
        match category {
            AssetCategory::Coating => CountThresholds {
                massive_increase: base.max(30.0),
                percentage_ratio: 2.0,
                unexpected_increase: 15.0,
            },
            AssetCategory::Hardware => CountThresholds {
                massive_increase: (base * 5.0).max(100.0),
                percentage_ratio: 3.0,
                unexpected_increase: 50.0,
            },
            AssetCategory::General => CountThresholds {
                massive_increase: base,
                percentage_ratio: 2.5,
                unexpected_increase: 20.0,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CountAnomalyKind {
    MassiveIncrease,
    ExactHundred,
    UnexpectedIncrease,
    PercentageJump,
    SystematicError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountAnomaly {
    pub kind: CountAnomalyKind,
    pub severity: Severity,
    pub message: String,
    pub suggested_fix: Option<f64>,
    pub confidence: u8,
    pub auto_fixable: bool,
}

fn is_whole(value: f64) -> bool {
    value.is_finite() && value.fract() == 0.0
}

/// Likely keying mistake behind `current`, and the quantity probably meant.
fn typing_fix(current: f64, previous: f64) -> Option<f64> {
    let change = current - previous;
    if change <= 0.0 {
        return None;
    }

    if previous > 0.0 {
        let ratio = current / previous;
        if (9.5..=10.5).contains(&ratio) {
            return Some((current / 10.0).floor());
        }
    }

    if current > 100.0 && is_whole(current) && is_whole(previous) {
        let current_digits = format!("{current}");
        let previous_digits = format!("{previous}");
        if current_digits.starts_with('1') && previous_digits.len() + 1 == current_digits.len() {
            if let Ok(without) = current_digits[1..].parse::<f64>() {
                if (without - previous).abs() <= 5.0 {
                    return Some(without);
                }
            }
        }
    }

    if change == 100.0 || change == 1000.0 {
        return Some(previous);
    }

    None
}

/// Same user behind this many recent events is reported as a possible
/// systematic error.
pub const SYSTEMATIC_EVENT_COUNT: usize = 3;

/// Heuristics over two consecutive counts of the same item.
pub fn detect_count_anomalies(
    current: &CountEvent,
    previous: &CountEvent,
    category: Option<&str>,
) -> Vec<CountAnomaly> {
    detect_count_anomalies_with_history(current, previous, category, &[])
}

/// [`detect_count_anomalies`], also checking `recent` events for a run of
/// entries by the user behind `current`.
pub fn detect_count_anomalies_with_history(
    current: &CountEvent,
    previous: &CountEvent,
    category: Option<&str>,
    recent: &[CountEvent],
) -> Vec<CountAnomaly> {
    let thresholds = CountThresholds::for_category(AssetCategory::from_name(category), previous.quantity);
    let change = current.quantity - previous.quantity;
    let mut anomalies = Vec::new();

    if change > thresholds.massive_increase {
        let fix = typing_fix(current.quantity, previous.quantity);
        anomalies.push(CountAnomaly {
            kind: CountAnomalyKind::MassiveIncrease,
            severity: if change > thresholds.massive_increase * 2.0 {
                Severity::Critical
            } else {
                Severity::High
            },
            message: format!(
                "Quantity jumped from {} to {} (+{})",
                previous.quantity, current.quantity, change
            ),
            suggested_fix: fix,
            confidence: if fix.is_some() { 85 } else { 70 },
            auto_fixable: fix.is_some(),
        });
    }

    if change.abs() == 100.0 || change.abs() == 1000.0 {
        anomalies.push(CountAnomaly {
            kind: CountAnomalyKind::ExactHundred,
            severity: Severity::Medium,
            message: format!("Change of exactly {} looks like a keying error", change.abs()),
            suggested_fix: Some(previous.quantity),
            confidence: 75,
            auto_fixable: true,
        });
    }

    if change > thresholds.unexpected_increase && !current.expects_increase() {
        anomalies.push(CountAnomaly {
            kind: CountAnomalyKind::UnexpectedIncrease,
            severity: Severity::Medium,
            message: format!(
                "Quantity rose by {} on a '{}' event, which should not add stock",
                change, current.event_type
            ),
            suggested_fix: None,
            confidence: 80,
            auto_fixable: false,
        });
    }

    if previous.quantity > 0.0 {
        let ratio = current.quantity / previous.quantity;
        if ratio > thresholds.percentage_ratio {
            let percent = (ratio * 100.0).round();
            anomalies.push(CountAnomaly {
                kind: CountAnomalyKind::PercentageJump,
                severity: if percent > 400.0 {
                    Severity::Critical
                } else {
                    Severity::High
                },
                message: format!("Quantity is {}% of the previous count", percent),
                suggested_fix: None,
                confidence: if percent > 300.0 { 90 } else { 70 },
                auto_fixable: false,
            });
        }
    }

    if let Some(user) = current.user_id.as_deref() {
        let same_user = recent
            .iter()
            .filter(|e| e.user_id.as_deref() == Some(user))
            .count();
        if recent.len() >= SYSTEMATIC_EVENT_COUNT && same_user >= SYSTEMATIC_EVENT_COUNT {
            anomalies.push(CountAnomaly {
                kind: CountAnomalyKind::SystematicError,
                severity: Severity::Medium,
                message: "Multiple large changes by same user - check for systematic error".to_string(),
                suggested_fix: None,
                confidence: 60,
                auto_fixable: false,
            });
        }
    }

    if !anomalies.is_empty() {
        log::debug!(
            "{} anomaly(ies) between counts {} and {}",
            anomalies.len(),
            previous.quantity,
            current.quantity
        );
    }
    anomalies
}

/* ------------------------------ Usage trend ------------------------------- */

pub const TREND_WINDOW_DAYS: i64 = 30;
/// Days of usage the reorder point keeps in stock.
pub const REORDER_BUFFER_DAYS: f64 = 14.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPrediction {
    /// Units per day, rounded to 2 dp.
    pub daily_usage: f64,
    pub days_until_empty: Option<u64>,
    pub reorder_point: f64,
    pub should_reorder: bool,
    pub trend: Trend,
}

pub fn predict_trend(events: &[CountEvent]) -> Option<TrendPrediction> {
    predict_trend_at(events, Utc::now())
}

/// Usage forecast from `events` ordered newest first.
///
/// Only dated events from the last [`TREND_WINDOW_DAYS`] before `now` are
/// used. A fall between two consecutive counts is usage over the days
/// between them (at least one); restocks are skipped. Returns `None` for
/// fewer than three events, fewer than two in the window, or no usage.
pub fn predict_trend_at(events: &[CountEvent], now: DateTime<Utc>) -> Option<TrendPrediction> {
    if events.len() < 3 {
        return None;
    }

    let cutoff = now - Duration::days(TREND_WINDOW_DAYS);
    let window: Vec<(f64, DateTime<Utc>)> = events
        .iter()
        .filter_map(|e| e.check_date.filter(|d| *d >= cutoff).map(|d| (e.quantity, d)))
        .collect();
    if window.len() < 2 {
        return None;
    }

    let mut total_usage = 0.0;
    let mut days = 0;
    for pair in window.windows(2) {
        let (newer, newer_date) = pair[0];
        let (older, older_date) = pair[1];
        let usage = older - newer;
        if usage > 0.0 {
            total_usage += usage;
            days += (newer_date - older_date).num_days().max(1);
        }
    }
    if days == 0 {
        return None;
    }

    let daily_usage = total_usage / days as f64;
    let current_stock = events[0].quantity;
    let days_until_empty =
        (daily_usage > 0.0).then(|| (current_stock / daily_usage).floor().max(0.0) as u64);
    let reorder_point = (daily_usage * REORDER_BUFFER_DAYS).ceil();

    Some(TrendPrediction {
        daily_usage: (daily_usage * 100.0).round() / 100.0,
        days_until_empty,
        reorder_point,
        should_reorder: current_stock <= reorder_point,
        trend: if daily_usage > 0.0 {
            Trend::Decreasing
        } else {
            Trend::Stable
        },
    })
}
