// ABOUTME: Aggregated validation rules for every configuration section
// ABOUTME: Collects all problems so startup reports them in a single error

use super::{
    parse_memory_limit, CacheConfig, DockerConfig, ExecutorConfig, FeesConfig, LanguageConfig,
    MonitoringConfig, PoolConfig, ValidationConfig,
};
use regex::Regex;
use std::sync::LazyLock;

static DOCKER_IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*(?::[a-z0-9]+(?:[._-][a-z0-9]+)*)?$",
    )
    .expect("docker image pattern is a valid regex")
});

const NETWORK_MODES: [&str; 4] = ["bridge", "host", "none", "default"];

pub(super) fn collect_errors(config: &ExecutorConfig) -> Vec<String> {
    let mut errors = Vec::new();

    push_section(&mut errors, "fees config", validate_fees(&config.fees));
    push_section(&mut errors, "cache config", validate_cache(&config.cache));
    push_section(
        &mut errors,
        "validation config",
        validate_validation(&config.validation),
    );
    push_section(
        &mut errors,
        "monitoring config",
        validate_monitoring(&config.monitoring),
    );

    if config.languages.is_empty() {
        errors.push("languages config error: at least one language must be configured".into());
    }
    for (language, lang_config) in &config.languages {
        push_section(
            &mut errors,
            &format!("language config '{}'", language),
            validate_language(lang_config),
        );
    }

    if config.http.timeout_secs == 0 {
        errors.push("http config error: timeout must be positive".to_string());
    }
    if config.manager.shutdown_timeout_secs == 0 {
        errors.push("manager config error: shutdown timeout must be positive".to_string());
    }

    errors
}

fn push_section(errors: &mut Vec<String>, section: &str, problems: Vec<String>) {
    if !problems.is_empty() {
        errors.push(format!("{} error: {}", section, problems.join(", ")));
    }
}

fn validate_fees(fees: &FeesConfig) -> Vec<String> {
    let fields = [
        ("price per TG", fees.price_per_tg),
        ("fixed cost", fees.fixed_cost),
        ("transaction cost", fees.transaction_cost),
        ("static complexity factor", fees.static_complexity_factor),
        ("dynamic complexity factor", fees.dynamic_complexity_factor),
    ];

    fields
        .iter()
        .filter(|(_, value)| !value.is_finite() || *value < 0.0)
        .map(|(name, _)| format!("{} must be non-negative", name))
        .collect()
}

fn validate_cache(cache: &CacheConfig) -> Vec<String> {
    let mut problems = Vec::new();
    if cache.cache_dir.as_os_str().is_empty() {
        problems.push("cache directory is required".to_string());
    }
    if cache.max_cache_size == 0 {
        problems.push("max cache size must be positive".to_string());
    }
    if cache.eviction_size >= cache.max_cache_size {
        problems.push("eviction size must be less than max cache size".to_string());
    }
    if cache.max_file_size == 0 {
        problems.push("max file size must be positive".to_string());
    }
    problems
}

fn validate_validation(validation: &ValidationConfig) -> Vec<String> {
    let mut problems = Vec::new();
    if validation.max_file_size == 0 {
        problems.push("max file size must be positive".to_string());
    }
    if validation.allowed_extensions.is_empty() {
        problems.push("at least one allowed extension is required".to_string());
    }
    for ext in &validation.allowed_extensions {
        if !ext.starts_with('.') {
            problems.push(format!("extension must start with '.': {}", ext));
        }
    }
    if validation.max_complexity < 0.0 {
        problems.push("max complexity must be non-negative".to_string());
    }
    if validation.timeout_secs == 0 {
        problems.push("timeout must be positive".to_string());
    }
    problems
}

fn validate_monitoring(monitoring: &MonitoringConfig) -> Vec<String> {
    let mut problems = Vec::new();
    if monitoring.health_check_interval_secs == 0 {
        problems.push("health check interval must be positive".to_string());
    }
    if monitoring.max_execution_time_secs == 0 {
        problems.push("max execution time must be positive".to_string());
    }
    if !(0.0..=1.0).contains(&monitoring.min_success_rate) {
        problems.push("min success rate must be between 0 and 1".to_string());
    }
    if monitoring.max_average_execution_time_secs == 0 {
        problems.push("max average execution time must be positive".to_string());
    }
    if monitoring.max_alerts == 0 {
        problems.push("max alerts must be positive".to_string());
    }
    if monitoring.alert_retention_secs == 0 {
        problems.push("alert retention must be positive".to_string());
    }
    if monitoring.critical_alert_penalty < 0.0 || monitoring.warning_alert_penalty < 0.0 {
        problems.push("alert penalties must be non-negative".to_string());
    }

    let thresholds = 0.0..=100.0;
    if !thresholds.contains(&monitoring.critical_threshold)
        || !thresholds.contains(&monitoring.warning_threshold)
    {
        problems.push("health thresholds must be between 0 and 100".to_string());
    } else if monitoring.critical_threshold >= monitoring.warning_threshold {
        problems.push("critical threshold must be below warning threshold".to_string());
    }
    problems
}

fn validate_language(language: &LanguageConfig) -> Vec<String> {
    let mut problems = validate_pool(&language.pool);
    problems.extend(validate_docker(&language.docker));

    if language.run_command.trim().is_empty() {
        problems.push("run command is required".to_string());
    }
    if language.extensions.is_empty() {
        problems.push("at least one extension is required".to_string());
    }
    problems
}

fn validate_pool(pool: &PoolConfig) -> Vec<String> {
    let mut problems = Vec::new();
    if pool.max_environments == 0 {
        problems.push("max environments must be positive".to_string());
    }
    if pool.min_environments > pool.max_environments {
        problems.push("min environments cannot exceed max environments".to_string());
    }
    if pool.max_wait_secs == 0 {
        problems.push("max wait time must be positive".to_string());
    }
    if pool.health_check_interval_secs == 0 {
        problems.push("health check interval must be positive".to_string());
    }
    problems
}

fn validate_docker(docker: &DockerConfig) -> Vec<String> {
    let mut problems = Vec::new();
    if docker.image.is_empty() {
        problems.push("image is required".to_string());
    } else if !is_valid_docker_image(&docker.image) {
        problems.push(format!("invalid docker image format: {}", docker.image));
    }
    if docker.timeout_secs == 0 {
        problems.push("timeout must be positive".to_string());
    }
    if let Err(e) = parse_memory_limit(&docker.memory_limit) {
        problems.push(e);
    }
    if !docker.cpu_limit.is_finite() || docker.cpu_limit <= 0.0 {
        problems.push("cpu limit must be positive".to_string());
    }
    if !is_valid_network_mode(&docker.network_mode) {
        problems.push(format!("invalid network mode: {}", docker.network_mode));
    }
    for entry in &docker.environment {
        if !entry.contains('=') {
            problems.push(format!("invalid environment variable format: {}", entry));
        }
    }
    problems
}

pub(crate) fn is_valid_docker_image(image: &str) -> bool {
    DOCKER_IMAGE_RE.is_match(image)
}

pub(crate) fn is_valid_network_mode(mode: &str) -> bool {
    NETWORK_MODES.contains(&mode) || mode.starts_with("container:")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Language;
    use rstest::rstest;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ExecutorConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case("golang:1.21-alpine", true)]
    #[case("python:3.12-alpine", true)]
    #[case("registry/org/node:22", true)]
    #[case("alpine", true)]
    #[case("Invalid:Image", false)]
    #[case("node:", false)]
    #[case("", false)]
    fn test_docker_image_format(#[case] image: &str, #[case] valid: bool) {
        assert_eq!(is_valid_docker_image(image), valid);
    }

    #[rstest]
    #[case("bridge", true)]
    #[case("host", true)]
    #[case("none", true)]
    #[case("default", true)]
    #[case("container:sidecar", true)]
    #[case("overlay", false)]
    fn test_network_modes(#[case] mode: &str, #[case] valid: bool) {
        assert_eq!(is_valid_network_mode(mode), valid);
    }

    #[test]
    fn test_errors_are_aggregated_across_sections() {
        let mut config = ExecutorConfig::default();
        config.fees.price_per_tg = -1.0;
        config.cache.eviction_size = config.cache.max_cache_size;
        config.monitoring.min_success_rate = 1.5;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.starts_with("configuration validation failed: fees config error:"));
        assert!(err.contains("price per TG must be non-negative"));
        assert!(err.contains("cache config error: eviction size must be less than max cache size"));
        assert!(err.contains("monitoring config error: min success rate must be between 0 and 1"));
    }

    #[test]
    fn test_language_errors_name_the_language() {
        let mut config = ExecutorConfig::default();
        if let Some(py) = config.languages.get_mut(&Language::Py) {
            py.pool.min_environments = 10;
            py.pool.max_environments = 2;
            py.docker.memory_limit = "lots".to_string();
            py.docker.environment = vec!["NOEQUALS".to_string()];
        }

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("language config 'py' error:"));
        assert!(err.contains("min environments cannot exceed max environments"));
        assert!(err.contains("invalid memory limit format: lots"));
        assert!(err.contains("invalid environment variable format: NOEQUALS"));
    }

    #[test]
    fn test_thresholds_must_be_ordered() {
        let mut config = ExecutorConfig::default();
        config.monitoring.critical_threshold = 90.0;
        config.monitoring.warning_threshold = 80.0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("critical threshold must be below warning threshold"));
    }

    #[test]
    fn test_extensions_need_leading_dot() {
        let mut config = ExecutorConfig::default();
        config.validation.allowed_extensions = vec!["py".to_string()];

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("extension must start with '.': py"));
    }
}
