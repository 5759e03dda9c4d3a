mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use config::Config;
use stockform_engine::form::{validate_form_data, FormDataReport};
use stockform_engine::utils::anomaly::{assess_form, starting_quantity};
use stockform_engine::utils::inventory::resolve_inventory_with_history;
use stockform_engine::{
    available_functions, evaluate, recalculate_with, validate, validate_with_mapped,
    AnomalyClass, FieldDefinition, FormulaContext, InventoryResult, RecalcResult, ValueMap,
};

#[derive(Parser)]
#[command(name = "stockform")]
#[command(about = "Formula evaluation and inventory resolution for stock forms")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a single formula
    Eval {
        formula: String,

        /// Field value, as id=value
        #[arg(long = "field", value_parser = parse_assignment)]
        fields: Vec<(String, f64)>,

        /// Mapped field value, as id=value
        #[arg(long = "mapped", value_parser = parse_assignment)]
        mapped: Vec<(String, f64)>,
    },

    /// Check a formula's references and syntax without evaluating it
    Validate {
        formula: String,

        /// Known field id (use mapped.<id> for mapped fields)
        #[arg(long = "known")]
        known: Vec<String>,

        /// Known mapped field id
        #[arg(long = "known-mapped")]
        known_mapped: Vec<String>,
    },

    /// Recalculate a form, resolve its inventory change and classify the count
    Recalc {
        /// Form JSON: { fields, values, mapped?, base_quantity?, recent_quantities? }
        path: PathBuf,
    },

    /// List the built-in formula functions
    Functions,
}

fn parse_assignment(raw: &str) -> Result<(String, f64), String> {
    let (id, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected id=value, got '{raw}'"))?;
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid number for '{id}': {e}"))?;
    Ok((id.trim().to_string(), value))
}

#[derive(Debug, Deserialize)]
struct FormInput {
    fields: Vec<FieldDefinition>,
    #[serde(default)]
    values: ValueMap,
    #[serde(default)]
    mapped: HashMap<String, f64>,
    /// Defaults to the form's starting quantity.
    #[serde(default)]
    base_quantity: Option<f64>,
    /// Newest first.
    #[serde(default)]
    recent_quantities: Vec<f64>,
}

#[derive(Debug, Serialize)]
struct RecalcReport {
    calculated_at: String,
    validation: FormDataReport,
    recalc: RecalcResult,
    inventory: InventoryResult,
    persisted_quantity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    anomaly: Option<AnomalyClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    anomaly_message: Option<String>,
}

fn run_recalc(config: &Config, path: &Path) -> Result<RecalcReport> {
    let src = fs::read_to_string(path)
        .with_context(|| format!("failed to read form {}", path.display()))?;
    let input: FormInput = serde_json::from_str(&src)
        .with_context(|| format!("failed to parse form {}", path.display()))?;

    let mapped = input
        .mapped
        .iter()
        .fold(FormulaContext::new(), |ctx, (id, value)| ctx.with_mapped(id, *value));

    let validation = validate_form_data(&input.values, &input.fields);
    for issue in &validation.errors {
        log::warn!("form error: {:?}", issue);
    }

    let recalc = recalculate_with(&config.recalc, &input.fields, input.values, &mapped);
    let base_quantity = input
        .base_quantity
        .unwrap_or_else(|| starting_quantity(&mapped));
    let inventory = resolve_inventory_with_history(
        base_quantity,
        &recalc.values,
        &input.fields,
        &input.recent_quantities,
    );
    let anomaly = assess_form(&config.thresholds, &recalc.values, &input.fields, &mapped);
    let anomaly_message = anomaly.as_ref().and_then(AnomalyClass::message);

    Ok(RecalcReport {
        calculated_at: chrono::Utc::now().to_rfc3339(),
        validation,
        persisted_quantity: inventory.persisted_quantity(),
        recalc,
        inventory,
        anomaly,
        anomaly_message,
    })
}

fn main() -> Result<()> {
    dotenv().ok();

    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = Config::from_env()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Eval {
            formula,
            fields,
            mapped,
        } => {
            let mut ctx = FormulaContext::new();
            for (id, value) in fields {
                ctx.insert_field(id, value);
            }
            for (id, value) in mapped {
                ctx.insert_mapped(&id, value);
            }
            let value = evaluate(&formula, &ctx)
                .with_context(|| format!("failed to evaluate '{formula}'"))?;
            println!("{value}");
        }

        Commands::Validate {
            formula,
            known,
            known_mapped,
        } => {
            let checked = if known_mapped.is_empty() {
                validate(&formula, &known)
            } else {
                validate_with_mapped(&formula, &known, &known_mapped)
            };
            checked.with_context(|| format!("'{formula}' is not valid"))?;
            println!("ok");
        }

        Commands::Recalc { path } => {
            let report = run_recalc(&config, &path)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Functions => {
            for info in available_functions() {
                println!("{:<18} {:<28} {}", info.name, info.example, info.description);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment() {
        assert_eq!(parse_assignment("a=3.5"), Ok(("a".to_string(), 3.5)));
        assert_eq!(parse_assignment(" rate = 2 "), Ok(("rate".to_string(), 2.0)));
        assert!(parse_assignment("a").is_err());
        assert!(parse_assignment("a=x").is_err());
    }

    #[test]
    fn test_cli_shape() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
