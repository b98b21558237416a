//! Configuration loading and schema definitions.

pub mod schema;

pub use schema::*;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::build::{BuildInfo, StubBuildProvider};
use crate::testtype::ShellTest;

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    validate_config(&config)?;
    Ok(config)
}

/// Load configuration from a string.
pub fn load_config_str(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(content).context("Failed to parse config")?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &ConfigFile) -> Result<()> {
    let inv = &config.invocation;
    if inv.test_tag.is_empty() {
        bail!("invocation.test_tag must not be empty");
    }
    if let (Some(count), Some(index)) = (inv.shard_count, inv.shard_index) {
        if index >= count {
            bail!(
                "invocation.shard_index ({}) must be below shard_count ({})",
                index,
                count
            );
        }
    }
    if inv.shard_index.is_some() && inv.shard_count.is_none() {
        bail!("invocation.shard_index requires shard_count");
    }
    if let Some(count) = inv.shard_count {
        if count == 0 {
            bail!("invocation.shard_count must be at least 1");
        }
    }
    if config.retry.max_attempts == 0 {
        bail!("retry.max_attempts must be at least 1");
    }
    if config.delegation.mode == RunMode::Remote && config.delegation.remote.host.is_none() {
        bail!("delegation.mode = \"remote\" requires delegation.remote.host");
    }
    Ok(())
}

/// Build the runtime object graph from a parsed config file.
///
/// The CLI has no real lab behind it, so builds come from a stub provider
/// and tests are host shell commands. Embedders assemble their own
/// [`Configuration`] with real providers and preparers instead.
pub fn build_configuration(file: &ConfigFile) -> Configuration {
    let options = file
        .invocation
        .to_command_options(file.delegation.mode);

    let mut config = Configuration::new(
        file.invocation.test_tag.clone(),
        Arc::new(StubBuildProvider::with_build(BuildInfo::new(
            "local", "host", "local",
        ))),
    );
    config.options = options;
    config.shardable = file.invocation.shardable;
    config.retry = file.retry.clone();
    config.delegation = file.delegation.clone();
    config.device_setups.push(DeviceSetup::new("device1"));
    config.tests = file
        .tests
        .iter()
        .map(|t| Box::new(ShellTest::from_section(t)) as Box<_>)
        .collect();
    config
}

/// Reduce a config file to the sections named by the subprocess allowlist.
///
/// The result is what gets written to disk and handed to a delegated child
/// process. Unknown allowlist entries are ignored.
pub fn filter_for_delegation(content: &str, allowlist: &[String]) -> Result<String> {
    let value: toml::Value = toml::from_str(content).context("Failed to parse config")?;
    let table = match value {
        toml::Value::Table(table) => table,
        _ => bail!("Config root must be a table"),
    };

    let mut kept = toml::map::Map::new();
    for (key, val) in table {
        if allowlist.iter().any(|a| a == &key) {
            kept.insert(key, val);
        }
    }

    toml::to_string_pretty(&toml::Value::Table(kept)).context("Failed to serialize config")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [invocation]
        test_tag = "smoke"
        shard_count = 4
        replicate_setup = true

        [retry]
        strategy = "retry_until_pass"
        max_attempts = 3

        [delegation]
        mode = "subprocess"

        [[tests]]
        name = "host-checks"
        cases = { truthy = "true" }
    "#;

    #[test]
    fn parses_full_config() {
        let config = load_config_str(SAMPLE).unwrap();
        assert_eq!(config.invocation.test_tag, "smoke");
        assert_eq!(config.invocation.shard_count, Some(4));
        assert!(config.invocation.replicate_setup);
        assert_eq!(config.retry.strategy, RetryStrategyKind::RetryUntilPass);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.delegation.mode, RunMode::Subprocess);
        assert_eq!(config.tests.len(), 1);
    }

    #[test]
    fn defaults_fill_optional_sections() {
        let config = load_config_str(
            r#"
            [invocation]
            test_tag = "minimal"
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.strategy, RetryStrategyKind::NoRetry);
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(config.delegation.mode, RunMode::Regular);
        assert!(config.report.junit);
        assert!(config.invocation.shardable);
    }

    #[test]
    fn rejects_shard_index_out_of_range() {
        let err = load_config_str(
            r#"
            [invocation]
            test_tag = "bad"
            shard_count = 2
            shard_index = 2
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("shard_index"));
    }

    #[test]
    fn rejects_index_without_count() {
        assert!(load_config_str(
            r#"
            [invocation]
            test_tag = "bad"
            shard_index = 0
            "#,
        )
        .is_err());
    }

    #[test]
    fn rejects_remote_mode_without_host() {
        assert!(load_config_str(
            r#"
            [invocation]
            test_tag = "bad"

            [delegation]
            mode = "remote"
            "#,
        )
        .is_err());
    }

    #[test]
    fn allowlist_filter_drops_unlisted_sections() {
        let allow = vec!["invocation".to_string(), "tests".to_string()];
        let filtered = filter_for_delegation(SAMPLE, &allow).unwrap();
        assert!(filtered.contains("test_tag"));
        assert!(filtered.contains("host-checks"));
        assert!(!filtered.contains("retry_until_pass"));
        assert!(!filtered.contains("subprocess"));
    }

    #[test]
    fn runtime_graph_carries_cli_tests() {
        let file = load_config_str(SAMPLE).unwrap();
        let config = build_configuration(&file);
        assert_eq!(config.test_tag, "smoke");
        assert_eq!(config.options.shard_count, Some(4));
        assert_eq!(config.tests.len(), 1);
        assert!(config.shardable);
    }
}
