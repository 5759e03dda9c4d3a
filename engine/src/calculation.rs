use crate::parser::{OpCode, PostfixInstruction};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use thiserror::Error;

/* ---------------------------- Function catalog --------------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arity {
    Fixed(usize),
    /// At least this many arguments.
    Variadic(usize),
    /// Between `min` and `max` arguments inclusive; the rest take defaults.
    Range(usize, usize),
}

impl Arity {
    fn check(&self, function: &'static str, argc: usize) -> Result<(), EvaluationError> {
        match *self {
            Arity::Fixed(n) if argc < n => Err(EvaluationError::NotEnoughArguments {
                function,
                expected: n,
                found: argc,
            }),
            Arity::Fixed(n) if argc > n => Err(EvaluationError::TooManyArguments {
                function,
                expected: n,
                found: argc,
            }),
            Arity::Variadic(min) | Arity::Range(min, _) if argc < min => {
                Err(EvaluationError::NotEnoughArguments {
                    function,
                    expected: min,
                    found: argc,
                })
            }
            Arity::Range(_, max) if argc > max => Err(EvaluationError::TooManyArguments {
                function,
                expected: max,
                found: argc,
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FnId {
    Min,
    Max,
    Abs,
    Round,
    Floor,
    Ceil,
    Sqrt,
    Pow,
    Sum,
    Avg,
    Count,
    Median,
    Clamp,
    If,
    GallonsFromInches,
    VolumeCylinder,
    VolumeRectangle,
    InchesToFeet,
    FeetToInches,
    GallonsToLiters,
    LitersToGallons,
    PoundsToKg,
    KgToPounds,
    Markup,
    Margin,
    Discount,
    PercentOf,
    PercentChange,
}

const LITERS_PER_GALLON: f64 = 3.78541;
const KG_PER_POUND: f64 = 0.453592;

impl FnId {
    pub const ALL: [FnId; 28] = [
        FnId::Min,
        FnId::Max,
        FnId::Abs,
        FnId::Round,
        FnId::Floor,
        FnId::Ceil,
        FnId::Sqrt,
        FnId::Pow,
        FnId::Sum,
        FnId::Avg,
        FnId::Count,
        FnId::Median,
        FnId::Clamp,
        FnId::If,
        FnId::GallonsFromInches,
        FnId::VolumeCylinder,
        FnId::VolumeRectangle,
        FnId::InchesToFeet,
        FnId::FeetToInches,
        FnId::GallonsToLiters,
        FnId::LitersToGallons,
        FnId::PoundsToKg,
        FnId::KgToPounds,
        FnId::Markup,
        FnId::Margin,
        FnId::Discount,
        FnId::PercentOf,
        FnId::PercentChange,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        FnId::ALL.iter().copied().find(|f| f.name() == name)
    }

    pub fn name(&self) -> &'static str {
        use FnId::*;
        match self {
            Min => "min",
            Max => "max",
            Abs => "abs",
            Round => "round",
            Floor => "floor",
            Ceil => "ceil",
            Sqrt => "sqrt",
            Pow => "pow",
            Sum => "sum",
            Avg => "avg",
            Count => "count",
            Median => "median",
            Clamp => "clamp",
            If => "if",
            GallonsFromInches => "gallons_from_inches",
            VolumeCylinder => "volume_cylinder",
            VolumeRectangle => "volume_rectangle",
            InchesToFeet => "inches_to_feet",
            FeetToInches => "feet_to_inches",
            GallonsToLiters => "gallons_to_liters",
            LitersToGallons => "liters_to_gallons",
            PoundsToKg => "pounds_to_kg",
            KgToPounds => "kg_to_pounds",
            Markup => "markup",
            Margin => "margin",
            Discount => "discount",
            PercentOf => "percent_of",
            PercentChange => "percent_change",
        }
    }

    /// Explicit arity table. Variadic functions get their actual argument
    /// count from the compiler.
    pub fn arity(&self) -> Arity {
        use FnId::*;
        match self {
            Abs | Round | Floor | Ceil | Sqrt => Arity::Fixed(1),
            InchesToFeet | FeetToInches | GallonsToLiters | LitersToGallons | PoundsToKg
            | KgToPounds => Arity::Fixed(1),
            Min | Max | Pow | VolumeCylinder | Markup | Margin | Discount | PercentOf
            | PercentChange => Arity::Fixed(2),
            Clamp | If | VolumeRectangle => Arity::Fixed(3),
            // rate defaults to 1
            GallonsFromInches => Arity::Range(1, 2),
            Sum | Avg | Count | Median => Arity::Variadic(1),
        }
    }

    /// Apply to exactly the arguments the arity check admitted.
    fn apply(&self, args: &[f64]) -> f64 {
        use FnId::*;
        match self {
            Min => args[0].min(args[1]),
            Max => args[0].max(args[1]),
            Abs => args[0].abs(),
            Round => round_half_up(args[0]),
            Floor => args[0].floor(),
            Ceil => args[0].ceil(),
            Sqrt => args[0].sqrt(),
            Pow => args[0].powf(args[1]),
            Sum => args.iter().sum(),
            Avg => args.iter().sum::<f64>() / args.len() as f64,
            Count => args.len() as f64,
            Median => median(args),
            Clamp => args[1].max(args[2].min(args[0])),
            If => {
                if args[0] > 0.0 {
                    args[1]
                } else {
                    args[2]
                }
            }
            GallonsFromInches => args[0] * args.get(1).copied().unwrap_or(1.0),
            VolumeCylinder => PI * args[0] * args[0] * args[1],
            VolumeRectangle => args[0] * args[1] * args[2],
            InchesToFeet => args[0] / 12.0,
            FeetToInches => args[0] * 12.0,
            GallonsToLiters => args[0] * LITERS_PER_GALLON,
            LitersToGallons => args[0] / LITERS_PER_GALLON,
            PoundsToKg => args[0] * KG_PER_POUND,
            KgToPounds => args[0] / KG_PER_POUND,
            Markup => args[0] * (1.0 + args[1] / 100.0),
            Margin => (args[0] - args[1]) / args[0] * 100.0,
            Discount => args[0] * (1.0 - args[1] / 100.0),
            PercentOf => args[0] / args[1] * 100.0,
            PercentChange => (args[1] - args[0]) / args[0] * 100.0,
        }
    }

    fn describe(&self) -> (&'static str, &'static str) {
        use FnId::*;
        match self {
            Min => ("Smaller of two values", "min({a}, {b})"),
            Max => ("Larger of two values", "max({a}, {b})"),
            Abs => ("Absolute value", "abs(-5)"),
            Round => ("Round to nearest integer", "round(3.7)"),
            Floor => ("Round down", "floor(3.7)"),
            Ceil => ("Round up", "ceil(3.2)"),
            Sqrt => ("Square root", "sqrt(16)"),
            Pow => ("Power function", "pow(2, 3)"),
            Sum => ("Sum of values", "sum(1, 2, 3, 4)"),
            Avg => ("Average of values", "avg(1, 2, 3, 4)"),
            Count => ("Count of values", "count(1, 2, 3)"),
            Median => ("Median value", "median(1, 2, 3, 4, 5)"),
            Clamp => ("Clamp value between min and max", "clamp({value}, 0, 100)"),
            If => ("Second argument when the first is positive, else the third", "if({quantity}, {price}, 0)"),
            GallonsFromInches => (
                "Convert a tank reading in inches to gallons",
                "gallons_from_inches({tank_inches}, {mapped.conversion_rate})",
            ),
            VolumeCylinder => ("Cylindrical volume", "volume_cylinder({radius}, {height})"),
            VolumeRectangle => ("Rectangular volume", "volume_rectangle({length}, {width}, {height})"),
            InchesToFeet => ("Convert inches to feet", "inches_to_feet(24)"),
            FeetToInches => ("Convert feet to inches", "feet_to_inches(2)"),
            GallonsToLiters => ("Convert gallons to liters", "gallons_to_liters(5)"),
            LitersToGallons => ("Convert liters to gallons", "liters_to_gallons(20)"),
            PoundsToKg => ("Convert pounds to kilograms", "pounds_to_kg(10)"),
            KgToPounds => ("Convert kilograms to pounds", "kg_to_pounds(10)"),
            Markup => ("Apply markup percentage", "markup(100, 20)"),
            Margin => ("Margin percentage of a price", "margin(120, 100)"),
            Discount => ("Apply discount percentage", "discount(100, 10)"),
            PercentOf => ("Value as a percentage of a total", "percent_of({used}, {total})"),
            PercentChange => ("Percentage change from old to new", "percent_change({previous}, {current})"),
        }
    }
}

/// `round` rounds halves towards positive infinity, so `round(-2.5) == -2`.
fn round_half_up(x: f64) -> f64 {
    if (x - x.trunc()).abs() == 0.5 {
        x.ceil()
    } else {
        x.round()
    }
}

fn median(args: &[f64]) -> f64 {
    let mut sorted = args.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub example: &'static str,
    pub arity: Arity,
}

/// Every function a formula may call, for formula builders and help screens.
pub fn available_functions() -> Vec<FunctionInfo> {
    FnId::ALL
        .iter()
        .map(|f| {
            let (description, example) = f.describe();
            FunctionInfo {
                name: f.name(),
                description,
                example,
                arity: f.arity(),
            }
        })
        .collect()
}

/* ---------------------------- EvaluationError ---------------------------- */

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    #[error("operator '{operator}' requires {required} operands, but only {available} available")]
    NotEnoughOperands {
        operator: char,
        required: usize,
        available: usize,
    },
    #[error("function {function} requires {expected} arguments, but got {found}")]
    NotEnoughArguments {
        function: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("function {function} takes {expected} arguments, but got {found}")]
    TooManyArguments {
        function: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("invalid expression: expected 1 result but got {0}")]
    MalformedExpression(usize),
}

/* ------------------------------ Calculation ------------------------------ */

/// Stack machine over a compiled postfix program.
pub struct Calculation<'a>(&'a [PostfixInstruction]);

impl<'a> Calculation<'a> {
    pub fn new(program: &'a [PostfixInstruction]) -> Self {
        Calculation(program)
    }

    pub fn calculate(&self) -> Result<f64, EvaluationError> {
        let mut stack: Vec<f64> = Vec::with_capacity(self.0.len());

        for instruction in self.0 {
            match instruction {
                PostfixInstruction::Number(n) => stack.push(*n),
                PostfixInstruction::Operator(op) if op.is_unary() => {
                    let a = stack.pop().ok_or(EvaluationError::NotEnoughOperands {
                        operator: op.symbol(),
                        required: 1,
                        available: 0,
                    })?;
                    stack.push(-a);
                }
                PostfixInstruction::Operator(op) => {
                    if stack.len() < 2 {
                        return Err(EvaluationError::NotEnoughOperands {
                            operator: op.symbol(),
                            required: 2,
                            available: stack.len(),
                        });
                    }
                    let b = stack.pop().unwrap_or_default();
                    let a = stack.pop().unwrap_or_default();
                    stack.push(apply_operator(*op, a, b));
                }
                PostfixInstruction::Function { id, argc } => {
                    id.arity().check(id.name(), *argc)?;
                    if stack.len() < *argc {
                        return Err(EvaluationError::NotEnoughArguments {
                            function: id.name(),
                            expected: *argc,
                            found: stack.len(),
                        });
                    }
                    let args = stack.split_off(stack.len() - argc);
                    stack.push(id.apply(&args));
                }
            }
        }

        match stack.as_slice() {
            [result] => Ok(*result),
            rest => Err(EvaluationError::MalformedExpression(rest.len())),
        }
    }
}

fn apply_operator(op: OpCode, a: f64, b: f64) -> f64 {
    match op {
        OpCode::Add => a + b,
        OpCode::Subtract => a - b,
        OpCode::Multiply => a * b,
        OpCode::Divide => a / b,
        OpCode::Modulo => a % b,
        OpCode::Power => a.powf(b),
        OpCode::Negate => -b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::compile;

    fn run(src: &str) -> Result<f64, EvaluationError> {
        let program = compile(&tokenize(src).unwrap()).unwrap();
        Calculation::new(&program).calculate()
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run("3 + 4 * 2").unwrap(), 11.0);
        assert_eq!(run("(3 + 4) * 2").unwrap(), 14.0);
        assert_eq!(run("10 % 4").unwrap(), 2.0);
        assert_eq!(run("2 ^ 3 ^ 2").unwrap(), 512.0);
        assert_eq!(run("-(2) ^ 2").unwrap(), -4.0);
        assert_eq!(run("2 ^ -(1 + 1)").unwrap(), 0.25);
        assert_eq!(run("5 - -3").unwrap(), 8.0);
    }

    #[test]
    fn test_division_follows_float_semantics() {
        assert_eq!(run("1 / 0").unwrap(), f64::INFINITY);
        assert!(run("0 / 0").unwrap().is_nan());
        assert!(run("5 % 0").unwrap().is_nan());
    }

    #[test]
    fn test_variadic_aggregates() {
        assert_eq!(run("sum(1, 2, 3)").unwrap(), 6.0);
        assert_eq!(run("avg(2, 4, 6)").unwrap(), 4.0);
        assert_eq!(run("count(7, 8, 9, 10)").unwrap(), 4.0);
        assert_eq!(run("median(5, 1, 3)").unwrap(), 3.0);
        assert_eq!(run("median(4, 1, 3, 2)").unwrap(), 2.5);
        // operands outside the call are left alone
        assert_eq!(run("10 + sum(1, 2)").unwrap(), 13.0);
        assert_eq!(run("sum(sum(1, 2), avg(3))").unwrap(), 6.0);
    }

    #[test]
    fn test_fixed_functions() {
        assert_eq!(run("min(3, 9)").unwrap(), 3.0);
        assert_eq!(run("max(3, 9)").unwrap(), 9.0);
        assert_eq!(run("round(2.5)").unwrap(), 3.0);
        assert_eq!(run("round(-2.5)").unwrap(), -2.0);
        assert_eq!(run("round(2.4)").unwrap(), 2.0);
        assert_eq!(run("floor(3.7) + ceil(3.2)").unwrap(), 7.0);
        assert_eq!(run("sqrt(16)").unwrap(), 4.0);
        assert_eq!(run("pow(2, 10)").unwrap(), 1024.0);
        assert_eq!(run("clamp(150, 0, 100)").unwrap(), 100.0);
        assert_eq!(run("if(0, 1, 2)").unwrap(), 2.0);
        assert_eq!(run("markup(100, 20)").unwrap(), 120.0);
        assert_eq!(run("feet_to_inches(2)").unwrap(), 24.0);
    }

    #[test]
    fn test_gallons_from_inches_rate_is_optional() {
        assert_eq!(run("gallons_from_inches(10, 2)").unwrap(), 20.0);
        assert_eq!(run("gallons_from_inches(10)").unwrap(), 10.0);
        assert_eq!(
            run("gallons_from_inches()"),
            Err(EvaluationError::NotEnoughArguments {
                function: "gallons_from_inches",
                expected: 1,
                found: 0
            })
        );
        assert_eq!(
            run("gallons_from_inches(10, 2, 3)"),
            Err(EvaluationError::TooManyArguments {
                function: "gallons_from_inches",
                expected: 2,
                found: 3
            })
        );
    }

    #[test]
    fn test_argument_errors() {
        assert_eq!(
            run("count()"),
            Err(EvaluationError::NotEnoughArguments {
                function: "count",
                expected: 1,
                found: 0
            })
        );
        assert_eq!(
            run("pow(2)"),
            Err(EvaluationError::NotEnoughArguments {
                function: "pow",
                expected: 2,
                found: 1
            })
        );
        assert_eq!(
            run("min(5, 10, 3)"),
            Err(EvaluationError::TooManyArguments {
                function: "min",
                expected: 2,
                found: 3
            })
        );
    }

    #[test]
    fn test_operand_errors() {
        assert_eq!(
            run("1 +"),
            Err(EvaluationError::NotEnoughOperands {
                operator: '+',
                required: 2,
                available: 1
            })
        );
        assert_eq!(run("2 3"), Err(EvaluationError::MalformedExpression(2)));
        assert_eq!(run(""), Err(EvaluationError::MalformedExpression(0)));
    }

    #[test]
    fn test_catalog_is_complete() {
        let catalog = available_functions();
        assert_eq!(catalog.len(), FnId::ALL.len());
        for info in &catalog {
            assert_eq!(FnId::from_name(info.name).map(|f| f.arity()), Some(info.arity));
        }
        assert_eq!(FnId::from_name("eval"), None);
    }
}
