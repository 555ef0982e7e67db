//! entql command line
//!
//! Compiles one query against a JSON schema and prints the plan as JSON.
//!
//! Usage: entql <schema.json> "<query>" [name=value ...]
//!
//! Environment variables:
//! - ENTQL_DISTINCT: auto, on or off (default: auto)
//! - ENTQL_PLAN_CACHE_CAPACITY, ENTQL_PLAN_CACHE_TTL_SECS, ENTQL_SIMPLE_ALIASES
//! - RUST_LOG: Log level (default: entql=info)

use entql::data::{Bindings, Value};
use entql::query::QueryTree;
use entql::schema::Schema;
use entql::translate::{DistinctMode, Translator, TranslatorConfig};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Literal of a `name=value` argument: integer, float, or string
fn parse_binding(arg: &str) -> Result<(String, Value), String> {
    let (name, raw) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{}'", arg))?;
    let value = if let Ok(i) = raw.parse::<i64>() {
        Value::Int64(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        Value::Float64(f)
    } else if raw == "None" {
        Value::Null
    } else {
        Value::from(raw.trim_matches('\''))
    };
    Ok((name.to_string(), value))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "entql=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (schema_path, text) = match args.as_slice() {
        [schema, query, ..] => (schema, query),
        _ => {
            eprintln!("usage: entql <schema.json> \"<query>\" [name=value ...]");
            std::process::exit(2);
        }
    };

    let mut bindings = Bindings::new();
    for arg in &args[2..] {
        let (name, value) = parse_binding(arg)?;
        bindings.insert(name, value);
    }

    let mode: DistinctMode = std::env::var("ENTQL_DISTINCT")
        .ok()
        .map(|m| m.parse())
        .transpose()?
        .unwrap_or_default();

    let schema = Schema::from_path(schema_path)?;
    let config = TranslatorConfig::from_env();
    tracing::info!(?config, "loaded schema from {}", schema_path);

    let translator = Translator::with_config(Arc::new(schema), config);
    let tree = QueryTree::parse(text)?;
    let plan = translator.compile(&tree, &bindings, mode)?;

    println!("{}", serde_json::to_string_pretty(plan.as_ref())?);
    Ok(())
}
