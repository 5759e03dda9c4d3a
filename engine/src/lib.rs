pub mod calculation;
pub mod form;
pub mod lexer;
pub mod parser;
pub mod recalc;
pub mod resolver;
pub mod utils;

use thiserror::Error;

use calculation::{Calculation, EvaluationError};
use lexer::LexError;
use parser::CompileError;

pub use calculation::{available_functions, Arity, FnId, FunctionInfo};
pub use form::{FieldDefinition, FieldId, FieldKind, InventoryAction, ValueMap};
pub use recalc::{recalculate_with, RecalcOptions, RecalcResult, MAX_ITERATIONS};
pub use resolver::{
    extract_field_references, validate, validate_with_mapped, FieldReferences, FormulaContext,
    ValidationError,
};
pub use utils::anomaly::{detect_anomaly, detect_anomaly_with, AnomalyClass, AnomalyThresholds};
pub use utils::inventory::{resolve_inventory, ChangeRecord, InventoryResult};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
}

/// Evaluate a formula against `context`.
///
/// Placeholders are substituted first, then the text is tokenized, compiled
/// to postfix and run. A formula with nothing to evaluate yields 0. Division
/// by zero is not an error: the result is whatever the float arithmetic
/// gives, and callers decide what to do with a non-finite value.
pub fn evaluate(formula: &str, context: &FormulaContext) -> Result<f64, FormulaError> {
    if formula.trim().is_empty() {
        return Ok(0.0);
    }
    let resolved = resolver::resolve(formula, context);
    let tokens = lexer::tokenize(&resolved)?;
    if tokens.is_empty() {
        return Ok(0.0);
    }
    let program = parser::compile(&tokens)?;
    Ok(Calculation::new(&program).calculate()?)
}

/// Recalculate every calculated field with the default pass limit and
/// precision.
pub fn recalculate(
    fields: &[FieldDefinition],
    values: ValueMap,
    mapped: &FormulaContext,
) -> RecalcResult {
    recalc::recalculate_with(&RecalcOptions::default(), fields, values, mapped)
}
