use ruche_domain::config::{Config, ConfigSeverity};

#[test]
fn default_config_has_no_errors() {
    let config = Config::default();
    let errors: Vec<_> = config
        .validate()
        .into_iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .collect();
    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
}

#[test]
fn full_example_config_parses() {
    let config: Config = toml::from_str(
        r#"
        [server]
        host = "0.0.0.0"
        port = 9000

        [concurrency]
        strategy = "CANCEL_IN_PROGRESS"

        [aggregation]
        window_ms_default = 2000

        [aggregation.per_channel.whatsapp]
        window_ms = 3000

        [aggregation.per_channel.web]
        window_ms = 0
        strategy = "GROUP_ROUND_ROBIN"

        [timeouts]
        brain_ms = 30000
        tool_ms = 15000
        total_ms = 60000
        mutex_ms = 5000

        [scenario_navigator]
        transition_threshold = 0.7

        [webhooks]
        require_https = true
        failure_threshold = 10
        "#,
    )
    .unwrap();

    assert_eq!(config.server.port, 9000);
    assert_eq!(config.aggregation.window_ms("web"), 0);
    assert_eq!(config.aggregation.window_ms("sms"), 2000);
    assert_eq!(config.timeouts.mutex_ms, Some(5000));
    assert_eq!(config.scenario_navigator.transition_threshold, 0.7);
}
