use std::io::Write;
use std::time::Duration;

use rstest::rstest;
use tempfile::NamedTempFile;
use wirepool::{AppError, AppResult, GatewayConfig};

fn config_file(content: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_get_static_config() -> AppResult<()> {
    let file = config_file(
        r#"
[network]
ip = "0.0.0.0"
max_connection = 16
keepalive_interval_secs = 30

[connection]
read_buffer_size = 4096
max_frame_size = 1048576

[proxy]
enabled = true
backend_address = "10.0.0.7:7000"
"#,
    );
    let config = GatewayConfig::set_up_config(file.path())?;
    assert_eq!(config.network.ip, "0.0.0.0");
    assert_eq!(config.network.max_connection, 16);
    assert_eq!(config.keepalive_interval(), Some(Duration::from_secs(30)));
    assert_eq!(config.connection.read_buffer_size, 4096);
    assert_eq!(config.connection.max_frame_size, 1_048_576);
    // untouched keys keep their defaults
    assert_eq!(config.connection.outbound_queue_capacity, 128);
    assert!(config.proxy.enabled);
    assert_eq!(config.proxy.backend_address, "10.0.0.7:7000");
    Ok(())
}

#[test]
fn missing_file_is_an_error_unless_optional() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    assert!(matches!(
        GatewayConfig::set_up_config(&path),
        Err(AppError::ConfigFileError(_))
    ));
    let config = GatewayConfig::set_up_optional_config(&path).unwrap();
    assert_eq!(config.network.max_connection, 2048);
}

#[rstest]
#[case::zero_connections("[network]\nmax_connection = 0\n")]
#[case::zero_queue("[connection]\ninbound_queue_capacity = 0\n")]
#[case::proxy_without_backend("[proxy]\nenabled = true\n")]
fn invalid_values_are_rejected(#[case] content: &str) {
    let file = config_file(content);
    assert!(matches!(
        GatewayConfig::set_up_config(file.path()),
        Err(AppError::InvalidValue(_))
    ));
}

#[test]
fn environment_overrides_the_file() {
    let file = config_file("[proxy]\ninitial_connections = 2\n");
    std::env::set_var("WIREPOOL__PROXY__INITIAL_CONNECTIONS", "7");
    let config = GatewayConfig::set_up_config(file.path());
    std::env::remove_var("WIREPOOL__PROXY__INITIAL_CONNECTIONS");
    assert_eq!(config.unwrap().proxy.initial_connections, 7);
}
