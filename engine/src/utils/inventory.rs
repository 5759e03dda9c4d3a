use crate::form::{parse_numeric, FieldDefinition, FieldId, InventoryAction, ValueMap};
use serde::Serialize;
use thiserror::Error;

/// Share of the starting quantity a single submission may move before it is
/// flagged as a large change.
pub const LARGE_CHANGE_PERCENT: f64 = 50.0;
/// Flag a change larger than this multiple of the recent average variation.
pub const FLUCTUATION_FACTOR: f64 = 2.0;
/// How many recent quantities (newest first) feed the variation average.
pub const HISTORY_WINDOW: usize = 3;

/// One inventory_action field that moved the quantity.
///
/// `previous_value` is the running quantity just before this record was
/// applied, so a chain of records can be replayed in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeRecord {
    pub action: InventoryAction,
    pub field_id: FieldId,
    pub label: String,
    pub value: f64,
    pub previous_value: f64,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InventoryWarning {
    #[error("resulting quantity {raw} is negative and will be stored as 0")]
    NegativeQuantity { raw: f64 },
    #[error("large change of {percent:.1}% (from {from} to {to})")]
    LargeChange { from: f64, to: f64, percent: f64 },
    #[error("change of {change} is unusual against a recent average variation of {average:.2}")]
    UnusualFluctuation { change: f64, average: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InventoryResult {
    /// Raw result, possibly negative. See [`InventoryResult::persisted_quantity`].
    pub new_quantity: f64,
    pub action_found: bool,
    pub changes: Vec<ChangeRecord>,
    pub warnings: Vec<InventoryWarning>,
}

impl InventoryResult {
    /// The quantity to store. Negative results are clamped here and only here.
    pub fn persisted_quantity(&self) -> f64 {
        self.new_quantity.max(0.0)
    }
}

fn quantity(value: f64) -> String {
    format!("{}", (value * 100.0).round() / 100.0)
}

fn set_description(value: f64, base: f64) -> String {
    let mut description = format!("Stock count set to {} (was {})", quantity(value), quantity(base));
    if value < base {
        description.push_str(&format!(". {} units used/consumed", quantity(base - value)));
    } else if value > base {
        description.push_str(&format!(". {} units added", quantity(value - base)));
    }
    description
}

fn record(field: &FieldDefinition, value: f64, previous_value: f64, description: String) -> ChangeRecord {
    ChangeRecord {
        action: field.inventory_action,
        field_id: field.id.clone(),
        label: field.display_name().to_string(),
        value,
        previous_value,
        description,
        formula: field.formula.clone(),
    }
}

/// Apply the inventory actions of a submitted form to `base_quantity`.
///
/// The first `set` field carrying a numeric value decides the quantity on
/// its own; every add/subtract field is then ignored. Otherwise add and
/// subtract fields fold over the base in declaration order. Blank values are
/// ignored. A zero still counts as an action but leaves no record.
pub fn resolve_inventory(
    base_quantity: f64,
    values: &ValueMap,
    fields: &[FieldDefinition],
) -> InventoryResult {
    let value_of = |field: &FieldDefinition| values.get(&field.id).and_then(parse_numeric);
    let mut changes = Vec::new();
    let mut action_found = false;

    let set = fields
        .iter()
        .filter(|f| f.inventory_action == InventoryAction::Set)
        .find_map(|f| value_of(f).map(|v| (f, v)));

    let new_quantity = match set {
        Some((field, value)) => {
            changes.push(record(field, value, base_quantity, set_description(value, base_quantity)));
            action_found = true;
            value
        }
        None => {
            let mut running = base_quantity;
            for field in fields {
                let delta = match field.inventory_action {
                    InventoryAction::Add => 1.0,
                    InventoryAction::Subtract => -1.0,
                    _ => continue,
                };
                let Some(value) = value_of(field) else {
                    continue;
                };
                action_found = true;
                if value == 0.0 {
                    continue;
                }
                let sign = if delta > 0.0 { '+' } else { '-' };
                let description = format!("{}: {}{}", field.display_name(), sign, quantity(value));
                changes.push(record(field, value, running, description));
                running += delta * value;
            }
            running
        }
    };

    let mut warnings = Vec::new();
    if new_quantity < 0.0 {
        log::warn!(
            "inventory resolved to {} from base {}, storing 0",
            new_quantity,
            base_quantity
        );
        warnings.push(InventoryWarning::NegativeQuantity { raw: new_quantity });
    }

    InventoryResult {
        new_quantity,
        action_found,
        changes,
        warnings,
    }
}

/// [`resolve_inventory`] followed by [`review_change`] against recent
/// quantities (newest first).
pub fn resolve_inventory_with_history(
    base_quantity: f64,
    values: &ValueMap,
    fields: &[FieldDefinition],
    recent: &[f64],
) -> InventoryResult {
    let mut result = resolve_inventory(base_quantity, values, fields);
    if result.action_found {
        result.warnings = review_change(base_quantity, result.new_quantity, recent);
    }
    result
}

/// Sanity checks on a proposed quantity change.
pub fn review_change(base_quantity: f64, new_quantity: f64, recent: &[f64]) -> Vec<InventoryWarning> {
    let mut warnings = Vec::new();

    if new_quantity < 0.0 {
        warnings.push(InventoryWarning::NegativeQuantity { raw: new_quantity });
    }

    let stored = new_quantity.max(0.0);
    let change = (stored - base_quantity).abs();

    if base_quantity > 0.0 {
        let percent = change / base_quantity * 100.0;
        if percent > LARGE_CHANGE_PERCENT {
            warnings.push(InventoryWarning::LargeChange {
                from: base_quantity,
                to: stored,
                percent,
            });
        }
    }

    let window = &recent[..recent.len().min(HISTORY_WINDOW)];
    if window.len() >= 2 {
        let variations: Vec<f64> = window.windows(2).map(|w| (w[0] - w[1]).abs()).collect();
        let average = variations.iter().sum::<f64>() / variations.len() as f64;
        if change > average * FLUCTUATION_FACTOR {
            warnings.push(InventoryWarning::UnusualFluctuation { change, average });
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn values(pairs: &[(&str, Value)]) -> ValueMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn add(id: &str) -> FieldDefinition {
        FieldDefinition::input(id).with_action(InventoryAction::Add)
    }

    fn subtract(id: &str) -> FieldDefinition {
        FieldDefinition::input(id).with_action(InventoryAction::Subtract)
    }

    fn set(id: &str) -> FieldDefinition {
        FieldDefinition::input(id).with_action(InventoryAction::Set)
    }

    #[test]
    fn test_set_wins_over_add() {
        let fields = vec![set("count").with_label("Physical count"), add("delivered")];
        let result = resolve_inventory(
            100.0,
            &values(&[("count", json!("80")), ("delivered", json!("20"))]),
            &fields,
        );

        assert_eq!(result.new_quantity, 80.0);
        assert!(result.action_found);
        assert_eq!(result.changes.len(), 1);
        let change = &result.changes[0];
        assert_eq!(change.action, InventoryAction::Set);
        assert_eq!(change.label, "Physical count");
        assert_eq!(change.previous_value, 100.0);
        assert_eq!(
            change.description,
            "Stock count set to 80 (was 100). 20 units used/consumed"
        );
    }

    #[test]
    fn test_first_set_with_a_value_wins() {
        let fields = vec![set("empty"), set("second"), set("third")];
        let result = resolve_inventory(
            10.0,
            &values(&[("empty", json!("")), ("second", json!(25)), ("third", json!(5))]),
            &fields,
        );
        assert_eq!(result.new_quantity, 25.0);
        assert_eq!(result.changes[0].field_id, "second");
        assert_eq!(
            result.changes[0].description,
            "Stock count set to 25 (was 10). 15 units added"
        );
    }

    #[test]
    fn test_negative_result_is_clamped_only_when_persisted() {
        let fields = vec![add("in"), subtract("out")];
        let result = resolve_inventory(
            50.0,
            &values(&[("in", json!("10")), ("out", json!("65"))]),
            &fields,
        );

        assert_eq!(result.new_quantity, -5.0);
        assert_eq!(result.persisted_quantity(), 0.0);
        assert_eq!(result.warnings, vec![InventoryWarning::NegativeQuantity { raw: -5.0 }]);
        assert_eq!(result.changes[0].previous_value, 50.0);
        assert_eq!(result.changes[1].previous_value, 60.0);
        assert_eq!(result.changes[1].description, "out: -65");
    }

    #[test]
    fn test_no_action_fields() {
        let fields = vec![FieldDefinition::input("note"), add("in")];
        let result = resolve_inventory(
            7.0,
            &values(&[("note", json!("3")), ("in", json!(""))]),
            &fields,
        );
        assert_eq!(result.new_quantity, 7.0);
        assert!(!result.action_found);
        assert!(result.changes.is_empty());
    }

    #[test]
    fn test_zero_delta_is_an_action_without_a_record() {
        let fields = vec![add("in"), subtract("out")];
        let result = resolve_inventory(
            7.0,
            &values(&[("in", json!("0")), ("out", json!(0))]),
            &fields,
        );
        assert_eq!(result.new_quantity, 7.0);
        assert!(result.action_found);
        assert!(result.changes.is_empty());

        let reviewed = resolve_inventory_with_history(
            7.0,
            &values(&[("in", json!("0"))]),
            &fields,
            &[7.0, 7.0, 7.0],
        );
        assert!(reviewed.action_found);
        assert!(reviewed.warnings.is_empty());
    }

    #[test]
    fn test_calculated_set_field_keeps_its_formula() {
        let fields = vec![FieldDefinition::calculated("closing", "{a} - {b}")
            .with_action(InventoryAction::Set)];
        let result = resolve_inventory(40.0, &values(&[("closing", json!("40.00"))]), &fields);
        assert_eq!(result.changes[0].formula.as_deref(), Some("{a} - {b}"));
        assert_eq!(result.changes[0].description, "Stock count set to 40 (was 40)");
    }

    #[test]
    fn test_review_change() {
        assert_eq!(
            review_change(100.0, 40.0, &[]),
            vec![InventoryWarning::LargeChange {
                from: 100.0,
                to: 40.0,
                percent: 60.0
            }]
        );
        assert!(review_change(100.0, 90.0, &[]).is_empty());

        // recent variations of 2 and 4 average to 3
        assert_eq!(
            review_change(100.0, 107.0, &[100.0, 102.0, 98.0, 10.0]),
            vec![InventoryWarning::UnusualFluctuation {
                change: 7.0,
                average: 3.0
            }]
        );
        assert!(review_change(100.0, 105.0, &[100.0, 102.0, 98.0]).is_empty());
    }

    #[test]
    fn test_resolve_with_history() {
        let fields = vec![subtract("used")];
        let result = resolve_inventory_with_history(
            10.0,
            &values(&[("used", json!(12))]),
            &fields,
            &[],
        );
        assert_eq!(result.new_quantity, -2.0);
        assert_eq!(
            result.warnings,
            vec![
                InventoryWarning::NegativeQuantity { raw: -2.0 },
                InventoryWarning::LargeChange {
                    from: 10.0,
                    to: 0.0,
                    percent: 100.0
                },
            ]
        );
    }
}
