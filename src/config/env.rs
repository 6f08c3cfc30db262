use super::{Config, ConfigError};
use duration_string::DurationString;
use log::debug;
use std::time::Duration;

const POLL_INTERVAL: &str = "POLL_INTERVAL";
const GITHUB_TOKEN: &str = "GITHUB_TOKEN";
const GITHUB_ALLOW_DEPLOYMENTS: &str = "GITHUB_ALLOW_DEPLOYMENTS";
const GITHUB_ALLOW_COMMENTS: &str = "GITHUB_ALLOW_COMMENTS";

/// Override the configuration from the process environment.
///
/// No `.env` file is read, secrets belong to the `[reporting]` table of the
/// configuration file or to the environment of the daemon.
pub fn apply_process_env(config: &mut Config) -> Result<(), ConfigError> {
    apply_env(config, |key| std::env::var(key).ok())
}

/// Override the configuration from the variables returned by `var`.
///
///   - `POLL_INTERVAL`: poll interval in seconds,
///   - `GITHUB_TOKEN`: the API token,
///   - `GITHUB_ALLOW_DEPLOYMENTS`, `GITHUB_ALLOW_COMMENTS`: toggle reporting,
///     these are true unless empty, `0` or `false`.
pub fn apply_env<F>(config: &mut Config, var: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(interval) = var(POLL_INTERVAL) {
        let seconds: u64 = interval
            .trim()
            .parse()
            .ok()
            .filter(|seconds| *seconds > 0)
            .ok_or_else(|| ConfigError::InvalidEnvironment(POLL_INTERVAL, interval.clone()))?;
        debug!("Using poll interval of {seconds}s from {POLL_INTERVAL}.");
        config.monitor.interval = DurationString::new(Duration::from_secs(seconds));
    }

    if let Some(token) = var(GITHUB_TOKEN).filter(|token| !token.trim().is_empty()) {
        config.reporting.token = Some(token);
    }

    if let Some(allow) = var(GITHUB_ALLOW_DEPLOYMENTS) {
        config.reporting.deployments = is_truthy(&allow);
    }

    if let Some(allow) = var(GITHUB_ALLOW_COMMENTS) {
        config.reporting.comments = is_truthy(&allow);
    }

    Ok(())
}

fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    !(value.is_empty() || value == "0" || value.eq_ignore_ascii_case("false"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config() -> Config {
        Config::parse(
            "test",
            r#"
            [reporting]
            comments = true

            [[project]]
            name = "api"
            repo = "/srv/api"
            branch = "main"

            [project.options]
            script = "npm"
            "#,
        )
        .unwrap()
    }

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn it_should_keep_the_config_without_variables() -> Result<(), ConfigError> {
        let mut config = config();
        apply_env(&mut config, |_| None)?;

        assert_eq!(Duration::from_secs(10), config.monitor.interval());
        assert_eq!(None, config.reporting.token);
        assert!(!config.reporting.deployments);
        assert!(config.reporting.comments);

        Ok(())
    }

    #[test]
    fn it_should_override_from_variables() -> Result<(), ConfigError> {
        let mut config = config();
        let env = vars(&[
            ("POLL_INTERVAL", "25"),
            ("GITHUB_TOKEN", "ghp_test"),
            ("GITHUB_ALLOW_DEPLOYMENTS", "1"),
            ("GITHUB_ALLOW_COMMENTS", "false"),
        ]);
        apply_env(&mut config, |key| env.get(key).cloned())?;

        assert_eq!(Duration::from_secs(25), config.monitor.interval());
        assert_eq!(Some(String::from("ghp_test")), config.reporting.token);
        assert!(config.reporting.deployments);
        assert!(!config.reporting.comments);

        Ok(())
    }

    #[test]
    fn it_should_prefer_the_token_from_the_environment() -> Result<(), ConfigError> {
        let mut config = config();
        config.reporting.token = Some(String::from("from-file"));
        let env = vars(&[("GITHUB_TOKEN", "from-env")]);
        apply_env(&mut config, |key| env.get(key).cloned())?;

        assert_eq!(Some(String::from("from-env")), config.reporting.token);

        Ok(())
    }

    #[test]
    fn it_should_ignore_an_empty_token() -> Result<(), ConfigError> {
        let mut config = config();
        config.reporting.token = Some(String::from("from-file"));
        let env = vars(&[("GITHUB_TOKEN", "")]);
        apply_env(&mut config, |key| env.get(key).cloned())?;

        assert_eq!(Some(String::from("from-file")), config.reporting.token);

        Ok(())
    }

    #[test]
    fn it_should_fail_on_an_invalid_interval() {
        for interval in ["ten", "0", "-5"] {
            let mut config = config();
            let env = vars(&[("POLL_INTERVAL", interval)]);
            let result = apply_env(&mut config, |key| env.get(key).cloned());

            assert!(
                matches!(result, Err(ConfigError::InvalidEnvironment("POLL_INTERVAL", _))),
                "{result:?} should be InvalidEnvironment"
            );
        }
    }

    #[test]
    fn it_should_parse_truthy_values() {
        assert!(is_truthy("true"));
        assert!(is_truthy("yes"));
        assert!(is_truthy("1"));
        assert!(!is_truthy(""));
        assert!(!is_truthy("0"));
        assert!(!is_truthy("FALSE"));
    }
}
