//! `busline config`: Configuration inspection commands.

use busline_config::{BusConfig, ConfigError};
use std::path::{Path, PathBuf};

fn load(file: Option<&Path>) -> Result<BusConfig, ConfigError> {
    match file {
        Some(path) => BusConfig::load_with_env(path),
        None => BusConfig::load(),
    }
}

/// Resolve the config file a command should read.
pub fn config_path(file: Option<&Path>) -> PathBuf {
    file.map(Path::to_path_buf)
        .unwrap_or_else(|| BusConfig::config_dir().join("config.toml"))
}

pub async fn validate(file: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating {}", config_path(file.as_deref()).display());

    match load(file.as_deref()) {
        Ok(config) => {
            println!("   ✅ Config parsed and validated");

            let mut warnings = Vec::new();
            if config.producer.dead_letter_topic.is_none() {
                warnings.push("No producer dead-letter topic: failed writes leave no audit trail");
            }
            if config.consumer.dead_letter_topic.is_none() {
                warnings.push("No consumer dead-letter topic: failed messages are dropped");
            }
            if config.consumer.max_retries == 0 {
                warnings.push("consumer.max_retries = 0: transient failures are never retried");
            }
            if !config.interceptors.enabled {
                warnings.push("Interceptors disabled: no per-envelope logs or metrics");
            }

            if warnings.is_empty() {
                println!("   ✅ All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   ⚠️  {w}");
                }
            }

            println!();
            println!("   Brokers:   {}", config.brokers.join(", "));
            println!("   Produce:   {}", config.producer.topic);
            println!(
                "   Consume:   {} (group {})",
                config.consumer.topic, config.consumer.group_id
            );
            println!("   Retries:   {}", config.consumer.max_retries);
            println!("   Commit:    {:?}", config.consumer.commit_policy);
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub async fn show(file: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load(file.as_deref()).map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path(file: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", config_path(file.as_deref()).display());
    Ok(())
}

pub async fn defaults() -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", BusConfig::default_toml());
    Ok(())
}
