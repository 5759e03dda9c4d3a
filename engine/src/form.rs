// form.rs
// Field definitions and raw form values as they arrive from the client.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub type FieldId = String;

/// Raw form values keyed by field id. Values may be strings, numbers,
/// booleans or null; calculated fields are written back as 2-dp strings.
pub type ValueMap = HashMap<FieldId, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputType {
    Number,
    Other(String),
}

/// `type` of a field definition. "calculated" and "formula" both mark a
/// calculated field; every other type is user input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldKind {
    Input(InputType),
    Calculated,
}

impl From<String> for FieldKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "calculated" | "formula" => FieldKind::Calculated,
            "number" => FieldKind::Input(InputType::Number),
            _ => FieldKind::Input(InputType::Other(raw)),
        }
    }
}

impl From<FieldKind> for String {
    fn from(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Calculated => "calculated".to_string(),
            FieldKind::Input(InputType::Number) => "number".to_string(),
            FieldKind::Input(InputType::Other(raw)) => raw,
        }
    }
}

/// How a field's value moves the stored inventory quantity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<String>", rename_all = "lowercase")]
pub enum InventoryAction {
    #[default]
    None,
    Add,
    Subtract,
    Set,
}

impl From<Option<String>> for InventoryAction {
    fn from(raw: Option<String>) -> Self {
        match raw.as_deref().map(str::trim) {
            None | Some("") | Some("none") => InventoryAction::None,
            Some("add") => InventoryAction::Add,
            Some("subtract") => InventoryAction::Subtract,
            Some("set") => InventoryAction::Set,
            Some(other) => {
                log::warn!("ignoring unknown inventory_action '{}'", other);
                InventoryAction::None
            }
        }
    }
}

impl InventoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InventoryAction::None => "none",
            InventoryAction::Add => "add",
            InventoryAction::Subtract => "subtract",
            InventoryAction::Set => "set",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub id: FieldId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(default)]
    pub inventory_action: InventoryAction,
    #[serde(default)]
    pub required: bool,
}

impl FieldDefinition {
    pub fn input(id: &str) -> Self {
        FieldDefinition {
            id: id.to_string(),
            label: None,
            kind: FieldKind::Input(InputType::Number),
            formula: None,
            inventory_action: InventoryAction::None,
            required: false,
        }
    }

    pub fn calculated(id: &str, formula: &str) -> Self {
        FieldDefinition {
            kind: FieldKind::Calculated,
            formula: Some(formula.to_string()),
            ..Self::input(id)
        }
    }

    pub fn with_action(mut self, action: InventoryAction) -> Self {
        self.inventory_action = action;
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn is_calculated(&self) -> bool {
        self.kind == FieldKind::Calculated
    }

    /// Label when present, id otherwise.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }

    /// The formula to run during recalculation, if any.
    pub fn active_formula(&self) -> Option<&str> {
        if !self.is_calculated() {
            return None;
        }
        self.formula.as_deref().filter(|f| !f.trim().is_empty())
    }
}

/* ------------------------------- Coercion -------------------------------- */

/// A value that was actually supplied: numbers, or strings parsing to a
/// finite number. Null, blank strings and everything else are `None`.
pub fn parse_numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
        }
        _ => None,
    }
}

/// Numeric view used by formulas. Booleans are 1/0 and anything without a
/// number in it reads as 0.
pub fn coerce_number(value: &Value) -> f64 {
    match value {
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        other => parse_numeric(other).unwrap_or(0.0),
    }
}

pub fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        _ => false,
    }
}

/// Fixed-point rendering. Values that round to zero never carry a sign.
pub fn format_fixed(value: f64, precision: usize) -> String {
    let shown = format!("{:.*}", precision, value);
    match shown.strip_prefix('-') {
        Some(rest) if rest.chars().all(|c| c == '0' || c == '.') => rest.to_string(),
        _ => shown,
    }
}

/* ------------------------------ Validation ------------------------------- */

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FormDataIssue {
    MissingRequired { field_id: FieldId, label: String },
    NotANumber { field_id: FieldId, label: String },
    NegativeSetValue { field_id: FieldId, value: f64 },
    MissingFormula { field_id: FieldId },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FormDataReport {
    pub errors: Vec<FormDataIssue>,
    pub warnings: Vec<FormDataIssue>,
}

impl FormDataReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Pre-submit checks on raw values. Errors block the submission, warnings
/// are shown alongside it.
pub fn validate_form_data(values: &ValueMap, fields: &[FieldDefinition]) -> FormDataReport {
    let mut report = FormDataReport::default();

    for field in fields {
        let value = values.get(&field.id);

        if field.required && !field.is_calculated() && is_blank(value) {
            report.errors.push(FormDataIssue::MissingRequired {
                field_id: field.id.clone(),
                label: field.display_name().to_string(),
            });
        }

        if field.kind == FieldKind::Input(InputType::Number) && !is_blank(value) {
            if value.and_then(parse_numeric).is_none() {
                report.errors.push(FormDataIssue::NotANumber {
                    field_id: field.id.clone(),
                    label: field.display_name().to_string(),
                });
            }
        }

        if field.inventory_action == InventoryAction::Set {
            if let Some(v) = value.and_then(parse_numeric).filter(|v| *v < 0.0) {
                report.warnings.push(FormDataIssue::NegativeSetValue {
                    field_id: field.id.clone(),
                    value: v,
                });
            }
        }

        if field.is_calculated() && field.active_formula().is_none() {
            report.warnings.push(FormDataIssue::MissingFormula {
                field_id: field.id.clone(),
            });
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use serde_json::json;

    #[test]
    fn test_field_definitions_from_json() {
        let src = indoc! {r#"
            [
                { "id": "opening", "label": "Opening stock", "type": "number", "required": true },
                { "id": "delivered", "type": "number", "inventory_action": "add" },
                { "id": "used", "type": "number", "inventory_action": "SUBTRACT" },
                { "id": "closing", "type": "formula", "formula": "{opening}+{delivered}",
                  "inventory_action": "set", "unit": "gal" },
                { "id": "notes", "type": "text", "inventory_action": null }
            ]
        "#};
        let fields: Vec<FieldDefinition> = serde_json::from_str(src).unwrap();

        assert_eq!(fields[0].display_name(), "Opening stock");
        assert!(fields[0].required);
        assert_eq!(fields[1].inventory_action, InventoryAction::Add);
        // action names are lowercase only
        assert_eq!(fields[2].inventory_action, InventoryAction::None);
        assert!(fields[3].is_calculated());
        assert_eq!(fields[3].active_formula(), Some("{opening}+{delivered}"));
        assert_eq!(fields[3].inventory_action, InventoryAction::Set);
        assert_eq!(
            fields[4].kind,
            FieldKind::Input(InputType::Other("text".to_string()))
        );
        assert_eq!(fields[4].display_name(), "notes");
    }

    #[test]
    fn test_field_kind_round_trips_its_name() {
        let json = serde_json::to_value(FieldDefinition::calculated("c", "1")).unwrap();
        assert_eq!(json["type"], "calculated");
        assert_eq!(json["inventory_action"], "none");
        let back: FieldDefinition = serde_json::from_value(json).unwrap();
        assert!(back.is_calculated());
    }

    #[test]
    fn test_blank_formula_is_inactive() {
        assert_eq!(FieldDefinition::calculated("c", "   ").active_formula(), None);
        let mut input = FieldDefinition::input("i");
        input.formula = Some("{a}".to_string());
        assert_eq!(input.active_formula(), None);
    }

    #[test]
    fn test_coercion() {
        assert_eq!(coerce_number(&json!(4)), 4.0);
        assert_eq!(coerce_number(&json!(" 2.5 ")), 2.5);
        assert_eq!(coerce_number(&json!("")), 0.0);
        assert_eq!(coerce_number(&json!("12abc")), 0.0);
        assert_eq!(coerce_number(&json!("NaN")), 0.0);
        assert_eq!(coerce_number(&json!(false)), 0.0);
        assert_eq!(coerce_number(&json!(null)), 0.0);
        assert_eq!(coerce_number(&json!([1, 2])), 0.0);

        assert_eq!(parse_numeric(&json!("80.00")), Some(80.0));
        assert_eq!(parse_numeric(&json!("")), None);
        assert_eq!(parse_numeric(&json!(null)), None);
        assert_eq!(parse_numeric(&json!(true)), None);
    }

    #[test]
    fn test_format_fixed() {
        assert_eq!(format_fixed(1.0 / 3.0, 2), "0.33");
        assert_eq!(format_fixed(80.0, 2), "80.00");
        assert_eq!(format_fixed(2.5, 0), "2");
        assert_eq!(format_fixed(-0.001, 2), "0.00");
        assert_eq!(format_fixed(-0.0, 2), "0.00");
        assert_eq!(format_fixed(-0.4, 0), "0");
        assert_eq!(format_fixed(-0.005, 2), "-0.01");
        assert_eq!(format_fixed(-1.25, 1), "-1.2");
    }

    #[test]
    fn test_validate_form_data() {
        let fields = vec![
            FieldDefinition::input("opening").with_label("Opening").required(),
            FieldDefinition::input("count").with_action(InventoryAction::Set),
            FieldDefinition::input("delivered"),
            FieldDefinition::calculated("total", ""),
        ];
        let mut values = ValueMap::new();
        values.insert("count".to_string(), json!("-4"));
        values.insert("delivered".to_string(), json!("lots"));

        let report = validate_form_data(&values, &fields);
        assert!(!report.is_valid());
        assert_eq!(
            report.errors,
            vec![
                FormDataIssue::MissingRequired {
                    field_id: "opening".to_string(),
                    label: "Opening".to_string()
                },
                FormDataIssue::NotANumber {
                    field_id: "delivered".to_string(),
                    label: "delivered".to_string()
                },
            ]
        );
        assert_eq!(
            report.warnings,
            vec![
                FormDataIssue::NegativeSetValue {
                    field_id: "count".to_string(),
                    value: -4.0
                },
                FormDataIssue::MissingFormula {
                    field_id: "total".to_string()
                },
            ]
        );
    }
}
