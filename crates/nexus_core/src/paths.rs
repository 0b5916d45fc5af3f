use std::path::PathBuf;

use anyhow::{Context, Result};

/// Returns the base data directory: `~/.nexus/`
pub fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".nexus"))
}

/// Returns the config file path: `~/.nexus/config.json`
pub fn config_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("config.json"))
}

/// Returns the logs directory: `~/.nexus/logs/`
pub fn logs_dir() -> Result<PathBuf> {
    Ok(base_dir()?.join("logs"))
}

/// Ensures the base and logs directories exist.
pub fn ensure_dirs() -> Result<()> {
    for dir in [base_dir()?, logs_dir()?] {
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_nest_under_base_dir() {
        let Ok(base) = base_dir() else {
            // No home directory in this environment.
            return;
        };
        assert!(base.ends_with(".nexus"));
        assert_eq!(config_path().unwrap(), base.join("config.json"));
        assert_eq!(logs_dir().unwrap(), base.join("logs"));
    }
}
