// resolver.rs
// -----------------------------------------------------------------------------
// Placeholder handling: `{field_id}` and `{mapped.field_id}`.
// -----------------------------------------------------------------------------
// A placeholder is always the full `{...}` span with no nested braces, so an
// identifier that is a prefix of a longer one can never match partially.
// Substitution and validation both walk the same span list.
// -----------------------------------------------------------------------------

use crate::calculation::Calculation;
use crate::form::{coerce_number, FieldId, ValueMap};
use crate::lexer;
use crate::parser::{self, CompileError};
use crate::FormulaError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use thiserror::Error;

pub const MAPPED_PREFIX: &str = "mapped.";

/* ----------------------------- FormulaContext ---------------------------- */

/// Numeric values a formula can see. `mapped_fields` is keyed by the full
/// `mapped.<id>` name. Every value is finite: anything else is stored as 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormulaContext {
    #[serde(default)]
    pub fields: HashMap<FieldId, f64>,
    #[serde(default, rename = "mappedFields", alias = "mapped_fields")]
    pub mapped_fields: HashMap<String, f64>,
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn mapped_key(id: &str) -> String {
    if id.starts_with(MAPPED_PREFIX) {
        id.to_string()
    } else {
        format!("{MAPPED_PREFIX}{id}")
    }
}

impl FormulaContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context over a raw form value map, every value coerced to a number.
    pub fn from_values(values: &ValueMap) -> Self {
        Self {
            fields: values
                .iter()
                .map(|(id, value)| (id.clone(), coerce_number(value)))
                .collect(),
            mapped_fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, id: impl Into<FieldId>, value: f64) -> Self {
        self.insert_field(id, value);
        self
    }

    /// `id` may be given with or without the `mapped.` prefix.
    pub fn with_mapped(mut self, id: &str, value: f64) -> Self {
        self.insert_mapped(id, value);
        self
    }

    pub fn insert_field(&mut self, id: impl Into<FieldId>, value: f64) {
        self.fields.insert(id.into(), finite_or_zero(value));
    }

    pub fn insert_mapped(&mut self, id: &str, value: f64) {
        self.mapped_fields.insert(mapped_key(id), finite_or_zero(value));
    }

    pub fn field(&self, id: &str) -> f64 {
        self.fields.get(id).copied().unwrap_or(0.0)
    }

    pub fn mapped(&self, id: &str) -> f64 {
        self.mapped_fields
            .get(&mapped_key(id))
            .copied()
            .unwrap_or(0.0)
    }

    fn lookup(&self, reference: &Reference<'_>) -> f64 {
        match reference {
            Reference::Field(id) => self.field(id),
            Reference::Mapped(id) => self.mapped(id),
        }
    }
}

/* ------------------------------ Placeholders ----------------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reference<'a> {
    Field(&'a str),
    /// Name without the `mapped.` prefix.
    Mapped(&'a str),
}

impl<'a> Reference<'a> {
    fn parse(inner: &'a str) -> Self {
        match inner.strip_prefix(MAPPED_PREFIX) {
            Some(name) => Reference::Mapped(name),
            None => Reference::Field(inner),
        }
    }
}

struct Placeholder<'a> {
    span: Range<usize>,
    reference: Reference<'a>,
}

fn placeholders(formula: &str) -> Vec<Placeholder<'_>> {
    let mut out = Vec::new();
    let mut cursor = 0;
    while let Some(open) = formula[cursor..].find('{').map(|i| cursor + i) {
        let rest = &formula[open + 1..];
        match rest.find(['{', '}']) {
            Some(close) if close > 0 && rest.as_bytes()[close] == b'}' => {
                out.push(Placeholder {
                    span: open..open + close + 2,
                    reference: Reference::parse(&rest[..close]),
                });
                cursor = open + close + 2;
            }
            // stray `{`, left for the lexer to reject
            _ => cursor = open + 1,
        }
    }
    out
}

fn substitute(formula: &str, mut value: impl FnMut(&Reference<'_>) -> f64) -> String {
    let mut out = String::with_capacity(formula.len());
    let mut cursor = 0;
    for placeholder in placeholders(formula) {
        out.push_str(&formula[cursor..placeholder.span.start]);
        let literal = number_literal(value(&placeholder.reference), out.chars().last());
        out.push_str(&literal);
        cursor = placeholder.span.end;
    }
    out.push_str(&formula[cursor..]);
    out
}

/// Literal text for a substituted value, given the character written just
/// before it.
///
/// A substituted value reads exactly like the same number typed inline:
/// `-{x}^2` with x = 2 is `-2^2`, i.e. 4. Negative values are parenthesised
/// so `2^{x}` and `-{x}` keep their meaning. A trailing space, plus a leading
/// one after a digit or identifier, keeps the literal from fusing with its
/// neighbours (`{a}{b}`, `5{x}`).
fn number_literal(value: f64, previous: Option<char>) -> String {
    if value.is_sign_negative() {
        return format!("({value})");
    }
    match previous {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' || c == '.' => format!(" {value} "),
        _ => format!("{value} "),
    }
}

/// Replace every placeholder with the numeric value it names (0 when absent).
pub fn resolve(formula: &str, context: &FormulaContext) -> String {
    substitute(formula, |reference| context.lookup(reference))
}

/* ------------------------------- References ------------------------------ */

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FieldReferences {
    pub fields: Vec<FieldId>,
    /// Names without the `mapped.` prefix.
    pub mapped_fields: Vec<String>,
}

impl FieldReferences {
    pub fn all(&self) -> Vec<String> {
        self.fields
            .iter()
            .chain(self.mapped_fields.iter())
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.mapped_fields.is_empty()
    }
}

/// Referenced ids in first-occurrence order, without duplicates.
pub fn extract_field_references(formula: &str) -> FieldReferences {
    let mut refs = FieldReferences::default();
    for placeholder in placeholders(formula) {
        let (list, id) = match placeholder.reference {
            Reference::Field(id) => (&mut refs.fields, id),
            Reference::Mapped(id) => (&mut refs.mapped_fields, id),
        };
        if !list.iter().any(|existing| existing == id) {
            list.push(id.to_string());
        }
    }
    refs
}

/* ------------------------------- Validation ------------------------------ */

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("unknown field reference: {0}")]
    UnknownFieldReference(String),
    #[error("unknown mapped field reference: {0}")]
    UnknownMappedFieldReference(String),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("formula syntax error: {0}")]
    Syntax(#[from] FormulaError),
}

/// Check a formula before it is persisted. Plain references must be in
/// `known_ids`; mapped references must appear there as `mapped.<id>`.
pub fn validate(formula: &str, known_ids: &[FieldId]) -> Result<(), ValidationError> {
    validate_references(
        formula,
        |id| known_ids.iter().any(|known| known == id),
        |name| known_ids.iter().any(|known| *known == mapped_key(name)),
    )?;
    check_syntax(formula)
}

/// Like [`validate`], with a separate allow-list for mapped fields. Entries
/// of `known_mapped` may be bare names or `mapped.`-prefixed.
pub fn validate_with_mapped(
    formula: &str,
    known_ids: &[FieldId],
    known_mapped: &[String],
) -> Result<(), ValidationError> {
    validate_references(
        formula,
        |id| known_ids.iter().any(|known| known == id),
        |name| {
            known_mapped
                .iter()
                .any(|known| known == name || *known == mapped_key(name))
        },
    )?;
    check_syntax(formula)
}

fn validate_references(
    formula: &str,
    field_known: impl Fn(&str) -> bool,
    mapped_known: impl Fn(&str) -> bool,
) -> Result<(), ValidationError> {
    for placeholder in placeholders(formula) {
        match placeholder.reference {
            Reference::Field(id) if !field_known(id) => {
                return Err(ValidationError::UnknownFieldReference(id.to_string()))
            }
            Reference::Mapped(name) if !mapped_known(name) => {
                return Err(ValidationError::UnknownMappedFieldReference(mapped_key(
                    name,
                )))
            }
            _ => {}
        }
    }
    Ok(())
}

/// Dry run with every placeholder set to 1. Operand and argument counts do
/// not depend on values, so any evaluation error here would hit every real
/// evaluation too. Non-finite results (`{a} / ({b} - 1)`) are accepted.
fn check_syntax(formula: &str) -> Result<(), ValidationError> {
    let stubbed = substitute(formula, |_| 1.0);
    let tokens = lexer::tokenize(&stubbed).map_err(FormulaError::from)?;
    if tokens.is_empty() {
        return Ok(());
    }
    let program = match parser::compile(&tokens) {
        Ok(program) => program,
        Err(CompileError::UnknownFunction(name)) => {
            return Err(ValidationError::UnknownFunction(name))
        }
        Err(e) => return Err(FormulaError::from(e).into()),
    };
    Calculation::new(&program)
        .calculate()
        .map(|_| ())
        .map_err(|e| FormulaError::from(e).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculation::EvaluationError;
    use crate::lexer::LexError;
    use serde_json::json;

    #[test]
    fn test_resolve_fields_and_mapped() {
        let ctx = FormulaContext::new()
            .with_field("a", 3.0)
            .with_mapped("rate", 1.5);
        assert_eq!(resolve("{a}*{mapped.rate}", &ctx), "3 *1.5 ");
    }

    #[test]
    fn test_missing_references_default_to_zero() {
        let ctx = FormulaContext::new();
        assert_eq!(resolve("{nope} + {mapped.gone}", &ctx), "0  + 0 ");
    }

    #[test]
    fn test_prefix_identifiers_do_not_collide() {
        let ctx = FormulaContext::new()
            .with_field("field_1", 1.0)
            .with_field("field_10", 10.0);
        assert_eq!(resolve("{field_10}-{field_1}", &ctx), "10 -1 ");
    }

    #[test]
    fn test_metacharacters_in_identifiers() {
        let ctx = FormulaContext::new().with_field("a.b*(c)", 7.0);
        assert_eq!(resolve("{a.b*(c)}", &ctx), "7 ");
    }

    #[test]
    fn test_negative_values_are_parenthesised() {
        let ctx = FormulaContext::new().with_field("x", -2.0);
        assert_eq!(resolve("2^{x}", &ctx), "2^(-2)");
    }

    #[test]
    fn test_substitution_reads_like_an_inline_literal() {
        let ctx = FormulaContext::new().with_field("x", 2.0).with_field("y", 3.0);
        assert_eq!(resolve("-{x}^2", &ctx), "-2 ^2");
        assert_eq!(resolve("5{x}", &ctx), "5 2 ");
        assert_eq!(resolve("{x}{y}", &ctx), "2 3 ");
    }

    #[test]
    fn test_stray_braces_are_left_alone() {
        let ctx = FormulaContext::new().with_field("b", 2.0);
        assert_eq!(resolve("{a{b}", &ctx), "{a 2 ");
        assert_eq!(resolve("{} + 1", &ctx), "{} + 1");
    }

    #[test]
    fn test_context_coerces_non_finite_and_raw_values() {
        let mut values = ValueMap::new();
        values.insert("n".to_string(), json!("12.5"));
        values.insert("empty".to_string(), json!(""));
        values.insert("junk".to_string(), json!("abc"));
        values.insert("flag".to_string(), json!(true));
        let mut ctx = FormulaContext::from_values(&values);
        ctx.insert_field("inf", f64::INFINITY);
        assert_eq!(ctx.field("n"), 12.5);
        assert_eq!(ctx.field("empty"), 0.0);
        assert_eq!(ctx.field("junk"), 0.0);
        assert_eq!(ctx.field("flag"), 1.0);
        assert_eq!(ctx.field("inf"), 0.0);
        assert_eq!(ctx.field("absent"), 0.0);
    }

    #[test]
    fn test_mapped_key_normalisation() {
        let ctx = FormulaContext::new().with_mapped("mapped.rate", 2.0);
        assert_eq!(ctx.mapped("rate"), 2.0);
        assert_eq!(ctx.mapped_fields.get("mapped.rate"), Some(&2.0));
    }

    #[test]
    fn test_extract_field_references() {
        let refs = extract_field_references("{a} + {mapped.rate} * {a} - {b} / {mapped.rate}");
        assert_eq!(refs.fields, vec!["a", "b"]);
        assert_eq!(refs.mapped_fields, vec!["rate"]);
        assert_eq!(refs.all(), vec!["a", "b", "rate"]);
        assert!(extract_field_references("1 + 2").is_empty());
    }

    #[test]
    fn test_validate_unknown_reference() {
        let known = vec!["a".to_string()];
        assert_eq!(
            validate("{unknown}+1", &known),
            Err(ValidationError::UnknownFieldReference("unknown".to_string()))
        );
        assert_eq!(validate("{a} + 1", &known), Ok(()));
    }

    #[test]
    fn test_validate_mapped_references() {
        let known = vec!["a".to_string(), "mapped.rate".to_string()];
        assert_eq!(validate("{a} * {mapped.rate}", &known), Ok(()));
        assert_eq!(
            validate("{mapped.other}", &known),
            Err(ValidationError::UnknownMappedFieldReference(
                "mapped.other".to_string()
            ))
        );

        let mapped = vec!["rate".to_string()];
        assert_eq!(
            validate_with_mapped("{a} * {mapped.rate}", &["a".to_string()], &mapped),
            Ok(())
        );
    }

    #[test]
    fn test_validate_syntax() {
        let known = vec!["a".to_string()];
        assert_eq!(
            validate("foo({a})", &known),
            Err(ValidationError::UnknownFunction("foo".to_string()))
        );
        assert_eq!(
            validate("({a} + 1", &known),
            Err(ValidationError::Syntax(FormulaError::Compile(
                CompileError::MismatchedParentheses
            )))
        );
        assert!(matches!(
            validate("{a} # 2", &known),
            Err(ValidationError::Syntax(FormulaError::Lex(
                LexError::UnexpectedCharacter { character: '#', .. }
            )))
        ));
        // non-finite results are left to evaluation
        assert_eq!(validate("{a} / 0", &known), Ok(()));
        assert_eq!(validate("{a} / ({a} - 1)", &known), Ok(()));
        assert_eq!(validate("", &known), Ok(()));
    }

    #[test]
    fn test_validate_rejects_what_evaluation_always_rejects() {
        let known = vec!["a".to_string()];
        let evaluation_error = |formula: &str| match validate(formula, &known) {
            Err(ValidationError::Syntax(FormulaError::Evaluation(e))) => Some(e),
            _ => None,
        };

        assert!(matches!(
            evaluation_error("pow({a})"),
            Some(EvaluationError::NotEnoughArguments { function: "pow", .. })
        ));
        assert!(matches!(
            evaluation_error("{a} +"),
            Some(EvaluationError::NotEnoughOperands { operator: '+', .. })
        ));
        assert_eq!(
            evaluation_error("{a} {a}"),
            Some(EvaluationError::MalformedExpression(2))
        );
        assert!(matches!(
            evaluation_error("min({a}, 1, 2)"),
            Some(EvaluationError::TooManyArguments { function: "min", .. })
        ));
        assert!(matches!(
            evaluation_error("count()"),
            Some(EvaluationError::NotEnoughArguments { function: "count", .. })
        ));
    }
}
