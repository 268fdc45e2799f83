//! Tests for layered settings loading.

use super::*;
use serial_test::serial;
use std::io::Write;

const CONNECTION_STRING: &str =
    "Endpoint=sb://orders.servicebus.windows.net/;SharedAccessKeyName=Root;SharedAccessKey=abc123";

fn write_settings(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

/// Remove every variable the loader could pick up
fn clear_env() {
    for (key, _) in std::env::vars() {
        if key.starts_with("QUEUE_BRIDGE") {
            std::env::remove_var(key);
        }
    }
}

fn valid_settings() -> BridgeSettings {
    BridgeSettings {
        connection_string: CONNECTION_STRING.to_string(),
        ..Default::default()
    }
}

mod defaults {
    use super::*;

    #[test]
    fn test_defaults_match_factory_defaults() {
        let settings = BridgeSettings::default();

        assert_eq!(settings.transport, TransportType::Https);
        assert_eq!(settings.receive_mode, ReceiveMode::PeekLock);
        assert_eq!(settings.retry_policy().unwrap(), RetryPolicy::default());
        assert_eq!(settings.listener.max_concurrent_calls, 1);
        assert!(!settings.listener.auto_complete);
    }

    #[test]
    fn test_handler_options_follow_listener_settings() {
        let settings = BridgeSettings {
            listener: ListenerSettings {
                max_concurrent_calls: 8,
                auto_complete: true,
                receive_timeout_secs: 5,
            },
            ..valid_settings()
        };

        let options = settings.handler_options();

        assert_eq!(options.max_concurrent_calls, 8);
        assert!(options.auto_complete);
        assert_eq!(options.receive_timeout, Duration::from_secs(5));
    }
}

mod validation {
    use super::*;

    #[test]
    fn test_valid_settings_pass() {
        assert!(valid_settings().validate().is_ok());
    }

    #[test]
    fn test_empty_connection_string_is_missing() {
        let result = BridgeSettings::default().validate();

        assert!(matches!(
            result,
            Err(ConfigurationError::Missing { key }) if key == "connection_string"
        ));
    }

    #[test]
    fn test_inverted_backoff_is_rejected() {
        let settings = BridgeSettings {
            retry: RetrySettings {
                min_backoff_secs: 60.0,
                max_backoff_secs: 1.0,
                max_retries: 3,
            },
            ..valid_settings()
        };

        assert!(matches!(
            settings.validate(),
            Err(ConfigurationError::InvalidRetryPolicy { .. })
        ));
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let mut settings = valid_settings();
        settings.listener.max_concurrent_calls = 0;

        assert!(matches!(
            settings.validate(),
            Err(ConfigurationError::Invalid { .. })
        ));
    }

    #[test]
    fn test_unbounded_receive_timeout_is_rejected() {
        let mut settings = valid_settings();
        settings.listener.receive_timeout_secs = u64::MAX;

        assert!(matches!(
            settings.validate(),
            Err(ConfigurationError::Invalid { .. })
        ));
    }

    #[test]
    fn test_invalid_queue_name_is_rejected() {
        let settings = BridgeSettings {
            queue_name: Some("-bad-".to_string()),
            ..valid_settings()
        };

        assert!(matches!(
            settings.validate(),
            Err(ConfigurationError::Invalid { .. })
        ));
    }

    #[test]
    fn test_requested_queue_overrides_configured_queue() {
        let settings = BridgeSettings {
            queue_name: Some("orders".to_string()),
            ..valid_settings()
        };

        assert_eq!(settings.resolve_queue_name(Some("invoices")).unwrap(), "invoices");
        assert_eq!(settings.resolve_queue_name(None).unwrap(), "orders");
        assert!(valid_settings().resolve_queue_name(None).is_err());
    }
}

mod redaction {
    use super::*;

    #[test]
    fn test_redacted_masks_only_the_key() {
        let redacted = valid_settings().redacted();

        assert!(!redacted.connection_string.contains("abc123"));
        assert!(redacted.connection_string.contains("SharedAccessKeyName=Root"));
        assert!(redacted.connection_string.contains("SharedAccessKey=<redacted>"));
    }

    #[test]
    fn test_debug_never_prints_key() {
        let debug = format!("{:?}", valid_settings());

        assert!(!debug.contains("abc123"));
    }
}

mod loading {
    use super::*;

    #[test]
    #[serial]
    fn test_load_without_sources_yields_defaults() {
        clear_env();

        let settings = BridgeSettings::load(None).unwrap();

        assert!(settings.connection_string.is_empty());
        assert_eq!(settings.retry, RetrySettings::default());
    }

    #[test]
    #[serial]
    fn test_load_reads_yaml_file() {
        clear_env();
        let file = write_settings(&format!(
            "connection_string: \"{}\"\nqueue_name: orders\ntransport: amqp\nreceive_mode: receive_and_delete\nretry:\n  max_retries: 3\nlistener:\n  max_concurrent_calls: 4\n",
            CONNECTION_STRING
        ));

        let settings = BridgeSettings::load(Some(file.path())).unwrap();

        assert_eq!(settings.connection_string, CONNECTION_STRING);
        assert_eq!(settings.queue_name.as_deref(), Some("orders"));
        assert_eq!(settings.transport, TransportType::Amqp);
        assert_eq!(settings.receive_mode, ReceiveMode::ReceiveAndDelete);
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.retry.min_backoff_secs, 5.0);
        assert_eq!(settings.listener.max_concurrent_calls, 4);
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        clear_env();
        let file = write_settings("retry:\n  max_retries: 3\nlistener:\n  auto_complete: false\n");
        std::env::set_var("QUEUE_BRIDGE__RETRY__MAX_RETRIES", "7");
        std::env::set_var("QUEUE_BRIDGE__LISTENER__AUTO_COMPLETE", "true");

        let result = BridgeSettings::load(Some(file.path()));
        clear_env();

        let settings = result.unwrap();
        assert_eq!(settings.retry.max_retries, 7);
        assert!(settings.listener.auto_complete);
    }

    #[test]
    #[serial]
    fn test_config_file_variable_names_explicit_file() {
        clear_env();
        let file = write_settings("queue_name: invoices\n");
        std::env::set_var(CONFIG_FILE_ENV, file.path());

        let result = BridgeSettings::load(None);
        clear_env();

        assert_eq!(result.unwrap().queue_name.as_deref(), Some("invoices"));
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();

        let result = BridgeSettings::load(Some(&dir.path().join("absent.yaml")));

        assert!(matches!(result, Err(ConfigurationError::Parsing { .. })));
    }

    #[test]
    #[serial]
    fn test_wrong_type_is_an_error() {
        clear_env();
        let file = write_settings("listener:\n  max_concurrent_calls: many\n");

        let result = BridgeSettings::load(Some(file.path()));

        assert!(matches!(result, Err(ConfigurationError::Parsing { .. })));
    }
}
