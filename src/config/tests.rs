use super::*;

#[test]
fn defaults() {
    let cfg = GatewayConfig::default();
    assert_eq!(cfg.port, 3000);
    assert!(cfg.admin_api_key.is_none());
    assert!(cfg.base_url.is_none());
    assert!(cfg.cors_origins.is_empty());
    assert!(!cfg.trusted_proxy);
    assert_eq!(cfg.max_registrations, 500);
    assert_eq!(cfg.fetch_timeout_ms, 10_000);
    assert_eq!(cfg.session_ttl_secs, 3600);
    assert_eq!(cfg.register_body_limit_bytes, 100 * 1024);
}

#[test]
fn toml_round_trip() {
    let toml_src = r#"
        port = 8080
        admin_api_key = "secret"
        base_url = "https://door.example.com"
        cors_origins = ["https://app.example.com"]
        trusted_proxy = true
        max_registrations = 10
    "#;
    let cfg: GatewayConfig = toml::from_str(toml_src).unwrap();
    assert_eq!(cfg.port, 8080);
    assert_eq!(cfg.admin_api_key.as_deref(), Some("secret"));
    assert_eq!(cfg.base_url.as_deref(), Some("https://door.example.com"));
    assert_eq!(cfg.cors_origins, vec!["https://app.example.com"]);
    assert!(cfg.trusted_proxy);
    assert_eq!(cfg.max_registrations, 10);
    // Unset keys fall back to defaults.
    assert_eq!(cfg.fetch_timeout_ms, 10_000);
}

#[test]
fn json_parses() {
    let cfg: GatewayConfig = serde_json::from_str(r#"{"port": 4000}"#).unwrap();
    assert_eq!(cfg.port, 4000);
}

#[test]
fn public_base_url_prefers_configured() {
    let cfg = GatewayConfig {
        base_url: Some("https://door.example.com/".to_string()),
        ..GatewayConfig::default()
    };
    assert_eq!(cfg.public_base_url(), "https://door.example.com");
}

#[test]
fn public_base_url_derives_from_listen_addr() {
    let cfg = GatewayConfig {
        port: 3100,
        ..GatewayConfig::default()
    };
    assert_eq!(cfg.public_base_url(), "http://127.0.0.1:3100");
}

#[test]
fn cors_empty_allowlist_allows_all() {
    let cfg = GatewayConfig::default();
    assert!(cfg.cors_allows("https://anything.example"));
}

#[test]
fn cors_allowlist_is_exact() {
    let cfg = GatewayConfig {
        cors_origins: vec!["https://app.example.com".to_string()],
        ..GatewayConfig::default()
    };
    assert!(cfg.cors_allows("https://app.example.com"));
    assert!(!cfg.cors_allows("https://evil.example.com"));
}

#[test]
fn validate_rejects_zero_caps() {
    let cfg = GatewayConfig {
        max_registrations: 0,
        ..GatewayConfig::default()
    };
    assert!(cfg.validate().is_err());

    let cfg = GatewayConfig {
        fetch_timeout_ms: 0,
        ..GatewayConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn validate_rejects_bad_base_url() {
    let cfg = GatewayConfig {
        base_url: Some("not a url".to_string()),
        ..GatewayConfig::default()
    };
    assert!(cfg.validate().is_err());
}
