//! Plugin commands

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;
use goplug_core::{LifecycleState, Manager, Mechanism};
use goplug_plugin_api::Value;

use super::{manager, print_warnings};
use crate::config::Overrides;

#[derive(Args)]
pub struct ListArgs {
    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct LoadArgs {
    /// Plugin file (shared library or executable)
    pub path: PathBuf,
}

#[derive(Args)]
pub struct CallArgs {
    /// Plugin name or path
    pub plugin: String,
    /// Hook name
    pub hook: String,
    /// Arguments; integers, floats, true/false and nil are typed, anything else is a string
    pub args: Vec<String>,
}

#[derive(Args)]
pub struct InfoArgs {
    /// Plugin name or path
    pub plugin: String,
}

/// Parse a command-line argument into the narrowest value it spells
pub fn parse_arg(raw: &str) -> Value {
    if raw == "nil" {
        return Value::Nil;
    }
    if let Ok(b) = raw.parse::<bool>() {
        return Value::Bool(b);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::Float(f);
    }
    Value::String(raw.to_string())
}

/// Register everything, run `f`, then unload everything
async fn with_plugins<T>(
    overrides: &Overrides,
    f: impl AsyncFnOnce(&Manager) -> Result<T>,
) -> Result<T> {
    let manager = manager(overrides)?;
    let report = manager.register_plugins().await?;
    for failure in &report.failed {
        eprintln!("error: {failure}");
    }
    print_warnings(&manager);

    let result = f(&manager).await;
    if let Err(e) = manager.dispose().await {
        tracing::warn!(error = %e, "Dispose failed");
    }
    result
}

pub async fn list(overrides: &Overrides, args: ListArgs) -> Result<()> {
    with_plugins(overrides, async move |manager| {
        let plugins = manager.list();
        if args.json {
            println!("{}", serde_json::to_string_pretty(&plugins)?);
            return Ok(());
        }
        if plugins.is_empty() {
            println!("No plugins loaded from {}", manager.directory().display());
            println!();
            println!("Plugin files must match '{}'.", manager.file_glob());
            return Ok(());
        }
        for p in plugins {
            let status = match p.state {
                LifecycleState::Initialized | LifecycleState::Loaded => "✓",
                LifecycleState::Failed => "✗",
                _ => "○",
            };
            let mechanism = match p.mechanism {
                Mechanism::Native => "native",
                Mechanism::Rpc => "rpc",
            };
            println!(
                "{} {} v{}  [{}]  {} hook(s)  {}",
                status,
                p.name,
                p.version,
                mechanism,
                p.hooks,
                p.key.display()
            );
        }
        Ok(())
    })
    .await
}

pub fn scan(overrides: &Overrides) -> Result<()> {
    let manager = manager(overrides)?;
    let report = manager.scan()?;
    print_warnings(&manager);
    if report.candidates.is_empty() {
        println!("No candidates under {}", manager.directory().display());
    }
    for candidate in &report.candidates {
        let cached = candidate
            .cached_identity
            .as_ref()
            .map(|i| format!("  ({}@{})", i.name, i.version))
            .unwrap_or_default();
        println!(
            "{:<6}  {}{}",
            candidate.mechanism.to_string(),
            candidate.path.display(),
            cached
        );
    }
    Ok(())
}

pub async fn load(overrides: &Overrides, args: LoadArgs) -> Result<()> {
    let manager = manager(overrides)?;
    let handle = manager.load(&args.path).await?;
    print_warnings(&manager);
    let snapshot = handle.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    manager.dispose().await?;
    Ok(())
}

pub async fn identify(overrides: &Overrides, args: LoadArgs) -> Result<()> {
    let manager = manager(overrides)?;
    let handle = manager.load(&args.path).await?;
    let json = handle.identify_string().await;
    manager.dispose().await?;
    println!("{}", json?);
    Ok(())
}

pub async fn call(overrides: &Overrides, args: CallArgs) -> Result<()> {
    let values: Vec<Value> = args.args.iter().map(|a| parse_arg(a)).collect();
    with_plugins(overrides, async move |manager| {
        let response = manager.call_hook(&args.plugin, &args.hook, values).await?;
        println!("{} ({})", response.value, response.type_tag);
        Ok(())
    })
    .await
}

pub async fn info(overrides: &Overrides, args: InfoArgs) -> Result<()> {
    with_plugins(overrides, async move |manager| {
        let Ok(handle) = manager.get_by_name(&args.plugin).or_else(|_| manager.get(&args.plugin))
        else {
            bail!("plugin '{}' is not loaded", args.plugin);
        };
        let snapshot = handle.snapshot().await;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arg_picks_narrowest_type() {
        assert_eq!(parse_arg("42"), Value::Int(42));
        assert_eq!(parse_arg("-7"), Value::Int(-7));
        assert_eq!(parse_arg("1.5"), Value::Float(1.5));
        assert_eq!(parse_arg("true"), Value::Bool(true));
        assert_eq!(parse_arg("nil"), Value::Nil);
        assert_eq!(parse_arg("hello"), Value::from("hello"));
        assert_eq!(parse_arg(""), Value::from(""));
    }
}
