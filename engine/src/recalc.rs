// recalc.rs
// -----------------------------------------------------------------------------
// Cascading recalculation of calculated fields.
// -----------------------------------------------------------------------------
// Calculated fields are evaluated in declaration order, pass after pass,
// until a pass changes nothing or the pass limit is reached. Each field sees
// the values written earlier in the same pass. Results are stored as fixed
// precision strings; a failed or non-finite evaluation stores zero and the
// cause is kept in `issues`.
// -----------------------------------------------------------------------------

use crate::form::{coerce_number, format_fixed, FieldDefinition, FieldId, ValueMap};
use crate::resolver::FormulaContext;
use crate::{evaluate, FormulaError};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt::Display;
use thiserror::Error;

pub const MAX_ITERATIONS: usize = 10;
pub const DISPLAY_PRECISION: usize = 2;

/// Value-map key holding per-form conversion-rate overrides. Each entry
/// `k: v` replaces `mapped.k` for the duration of a recalculation.
pub const HISTORICAL_RATES_KEY: &str = "_historical_conversion_rates";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecalcOptions {
    pub max_iterations: usize,
    pub precision: usize,
}

impl Default for RecalcOptions {
    fn default() -> Self {
        RecalcOptions {
            max_iterations: MAX_ITERATIONS,
            precision: DISPLAY_PRECISION,
        }
    }
}

fn display_error<S: Serializer, T: Display>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum IssueKind {
    Formula(#[serde(serialize_with = "display_error")] FormulaError),
    NonFinite(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldIssue {
    pub field_id: FieldId,
    pub pass: usize,
    #[serde(flatten)]
    pub kind: IssueKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecalcWarning {
    #[error("calculated fields did not settle after {iterations} passes")]
    NonConvergent { iterations: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassTrace {
    pub pass: usize,
    pub changed: Vec<FieldId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecalcResult {
    pub values: ValueMap,
    pub non_convergent: bool,
    pub iterations: usize,
    pub trace: Vec<PassTrace>,
    /// Failures from the final pass, the one that produced `values`.
    pub issues: Vec<FieldIssue>,
    pub warnings: Vec<RecalcWarning>,
}

impl RecalcResult {
    pub fn number(&self, id: &str) -> f64 {
        self.values.get(id).map(coerce_number).unwrap_or(0.0)
    }

    pub fn is_converged(&self) -> bool {
        !self.non_convergent
    }
}

fn rounded(value: f64, precision: usize) -> f64 {
    format_fixed(value, precision).parse().unwrap_or(0.0)
}

fn build_context(values: &ValueMap, mapped: &FormulaContext) -> FormulaContext {
    let mut context = FormulaContext::from_values(values);
    context.mapped_fields = mapped.mapped_fields.clone();
    if let Some(Value::Object(rates)) = values.get(HISTORICAL_RATES_KEY) {
        for (key, rate) in rates {
            context.insert_mapped(key, coerce_number(rate));
        }
    }
    context
}

pub fn recalculate_with(
    options: &RecalcOptions,
    fields: &[FieldDefinition],
    values: ValueMap,
    mapped: &FormulaContext,
) -> RecalcResult {
    let mut values = values;
    let mut context = build_context(&values, mapped);
    let calculated: Vec<(&FieldDefinition, &str)> = fields
        .iter()
        .filter_map(|field| field.active_formula().map(|formula| (field, formula)))
        .collect();

    let mut trace = Vec::new();
    let mut issues = Vec::new();
    let mut iterations = 0;
    let mut converged = false;

    while iterations < options.max_iterations {
        iterations += 1;
        let mut changed = Vec::new();
        let mut pass_issues = Vec::new();

        for (field, formula) in &calculated {
            let result = match evaluate(formula, &context) {
                Ok(v) if v.is_finite() => v,
                Ok(v) => {
                    log::warn!("field '{}' evaluated to {}, storing 0", field.id, v);
                    pass_issues.push(FieldIssue {
                        field_id: field.id.clone(),
                        pass: iterations,
                        kind: IssueKind::NonFinite(v),
                    });
                    0.0
                }
                Err(e) => {
                    log::warn!("field '{}' failed to evaluate: {}", field.id, e);
                    pass_issues.push(FieldIssue {
                        field_id: field.id.clone(),
                        pass: iterations,
                        kind: IssueKind::Formula(e),
                    });
                    0.0
                }
            };

            let display = format_fixed(result, options.precision);
            let next = rounded(result, options.precision);
            let previous = values.get(&field.id).map(coerce_number).unwrap_or(0.0);
            if rounded(previous, options.precision) != next {
                changed.push(field.id.clone());
            }

            values.insert(field.id.clone(), Value::String(display));
            context.insert_field(field.id.as_str(), next);
        }

        log::debug!("recalc pass {}: {} field(s) changed", iterations, changed.len());
        let settled = changed.is_empty();
        trace.push(PassTrace {
            pass: iterations,
            changed,
        });
        issues = pass_issues;
        if settled {
            converged = true;
            break;
        }
    }

    let non_convergent = !converged && !calculated.is_empty();
    let mut warnings = Vec::new();
    if non_convergent {
        log::warn!(
            "recalculation stopped after {} passes without settling",
            iterations
        );
        warnings.push(RecalcWarning::NonConvergent { iterations });
    }

    RecalcResult {
        values,
        non_convergent,
        iterations,
        trace,
        issues,
        warnings,
    }
}
