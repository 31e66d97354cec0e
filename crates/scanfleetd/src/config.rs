//! Config file loading.

use std::path::Path;

use anyhow::Context;

use scanfleet_core::FleetConfig;

/// Read and validate a TOML fleet config.
pub fn load_config(path: &Path) -> anyhow::Result<FleetConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: FleetConfig =
        toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_the_example_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../scanfleet.example.toml");
        let config = load_config(&path).unwrap();
        assert!(!config.tiers.is_empty());
        assert!(config.billing_interval_secs > 0);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = load_config(Path::new("/nonexistent/scanfleet.toml")).unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }
}
