//! Configuration management commands.

use turnstore_core::config::IssueSeverity;
use turnstore_core::error::format_error_with_suggestion;
use turnstore_core::Config;

use crate::ConfigAction;

pub fn handle(action: ConfigAction, config: &Config) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            println!("# Config file: {}", Config::config_dir().join("config.toml").display());
            println!("# Data directory: {}", config.data_dir().display());
            println!();
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Validate => {
            let result = config.validate();
            if result.issues.is_empty() {
                println!("Configuration is valid.");
                return Ok(());
            }

            for issue in &result.issues {
                let label = match issue.severity {
                    IssueSeverity::Error => "error",
                    IssueSeverity::Warning => "warning",
                };
                println!("{:<8} {}: {}", label, issue.field, issue.message);
            }

            if let Err(e) = config.clone().into_validated() {
                anyhow::bail!("{}", format_error_with_suggestion(&e));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        assert!(handle(ConfigAction::Validate, &Config::default()).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_backend() {
        let mut config = Config::default();
        config.storage.backend = "postgres".into();
        assert!(handle(ConfigAction::Validate, &config).is_err());
    }
}
