use std::path::Path;

use anyhow::{Context, bail};
use shipway_core::ShipConfig;

/// Write a starter ship.toml into `dir`. Refuses to replace an existing one.
pub fn init(dir: &str, name: &str) -> anyhow::Result<i32> {
    let output = Path::new(dir).join("ship.toml");
    if output.exists() {
        bail!("{} already exists", output.display());
    }
    let config = ShipConfig::scaffold(name).to_toml_string()?;
    std::fs::write(&output, config).with_context(|| format!("writing {}", output.display()))?;
    println!("✓ Generated {}", output.display());
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_a_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        assert_eq!(init(path, "web").unwrap(), 0);

        let config = ShipConfig::from_file(&dir.path().join("ship.toml")).unwrap();
        assert_eq!(config.service.name, "web");
        assert!(config.resolve().is_ok());
    }

    #[test]
    fn keeps_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("ship.toml");
        std::fs::write(&target, "# mine\n").unwrap();

        let err = init(dir.path().to_str().unwrap(), "web").unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "# mine\n");
    }
}
