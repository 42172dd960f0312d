use super::*;
use serial_test::serial;

fn clear_env() {
    for key in [
        "ORCHESTRATOR_SECRET",
        "ORCHESTRATOR_PORT",
        "ORCHESTRATOR_HOST",
        "ALLOWED_ORIGINS",
        "WORKING_DIRECTORY",
        "MAX_CONCURRENT_REPOS",
        "CODEX_CLI_COMMAND",
        "CODEX_CLI_ARGS",
        "ANTHROPIC_API_KEY",
        "GITHUB_ORG",
        "CLAUDE_TOKEN_LIMIT",
        "CLAUDE_TOKEN_WARNING_RATIO",
    ] {
        std::env::remove_var(key);
    }
}

fn set_secret() {
    std::env::set_var(
        "ORCHESTRATOR_SECRET",
        "0123456789abcdef0123456789abcdef0123456789abcdef",
    );
}

#[test]
#[serial]
fn load_fails_without_secret() {
    clear_env();
    let result = Config::load();
    assert!(matches!(
        result,
        Err(ConductorError::ConfigurationError(_))
    ));
}

#[test]
#[serial]
fn load_rejects_short_secret() {
    clear_env();
    std::env::set_var("ORCHESTRATOR_SECRET", "too-short");
    assert!(Config::load().is_err());
}

#[test]
#[serial]
fn load_applies_defaults() {
    clear_env();
    set_secret();
    let config = Config::load().unwrap();
    assert_eq!(config.api.port, 8200);
    assert_eq!(config.api.host, "127.0.0.1");
    assert_eq!(config.agent.command, constants::DEFAULT_AGENT_COMMAND);
    assert!(config.agent.extra_args.is_empty());
    assert_eq!(
        config.orchestrator.max_concurrent_repos,
        constants::DEFAULT_MAX_CONCURRENT_REPOS
    );
    assert_eq!(
        config.orchestrator.working_directory,
        constants::DEFAULT_WORKING_DIRECTORY
    );
    assert!(config.orchestrator.github_org.is_none());
}

#[test]
#[serial]
fn load_reads_agent_overrides() {
    clear_env();
    set_secret();
    std::env::set_var("CODEX_CLI_COMMAND", "codex");
    std::env::set_var("CODEX_CLI_ARGS", "--profile fast --sandbox off");
    std::env::set_var("MAX_CONCURRENT_REPOS", "5");
    std::env::set_var("GITHUB_ORG", "acme");
    std::env::set_var("CLAUDE_TOKEN_LIMIT", "50000");

    let config = Config::load().unwrap();
    assert_eq!(config.agent.command, "codex");
    assert_eq!(
        config.agent.extra_args,
        vec!["--profile", "fast", "--sandbox", "off"]
    );
    assert_eq!(config.orchestrator.max_concurrent_repos, 5);
    assert_eq!(config.orchestrator.github_org.as_deref(), Some("acme"));
    assert_eq!(config.agent.token_limit, 50_000);
    clear_env();
}

#[test]
#[serial]
fn load_ignores_invalid_numeric_values() {
    clear_env();
    set_secret();
    std::env::set_var("MAX_CONCURRENT_REPOS", "zero");
    std::env::set_var("CLAUDE_TOKEN_WARNING_RATIO", "7.5");

    let config = Config::load().unwrap();
    assert_eq!(
        config.orchestrator.max_concurrent_repos,
        constants::DEFAULT_MAX_CONCURRENT_REPOS
    );
    assert_eq!(
        config.agent.token_warning_ratio,
        constants::DEFAULT_TOKEN_WARNING_RATIO
    );
    clear_env();
}
