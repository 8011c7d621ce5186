use std::path::PathBuf;
use std::time::Duration;

use picproxy::config::{self, Bootstrap, DEFAULT_URL_ALPHABET};

#[test]
fn test_defaults() {
    let (cfg, ignored) = config::parse("{}").unwrap();
    assert!(ignored.is_empty());
    assert_eq!(cfg.server.addr, ":2537");
    assert_eq!(cfg.server.alphabet(), Some(DEFAULT_URL_ALPHABET));
    assert_eq!(cfg.upstream.max_attempts, 2);
    assert_eq!(cfg.upstream.backoff_unit, Duration::from_millis(500));
    assert_eq!(cfg.upstream.attempt_timeout, Duration::from_secs(30));
    assert_eq!(cfg.upstream.terminal_status, vec![404]);
    assert_eq!(cfg.coordinator.failure_cooldown, Duration::ZERO);
    assert_eq!(cfg.tally.threshold, 5);
    assert_eq!(cfg.tally.poll_timeout, Duration::from_secs(30));
    assert!(!cfg.strict);
}

#[test]
fn test_parse_full() {
    let raw = r#"
strict: true
pidfile: /tmp/picproxy.pid
logger:
  level: debug
  caller: true
server:
  addr: 127.0.0.1:8080
  url_alphabet: ""
upstream:
  max_attempts: 4
  backoff_unit: 250ms
  attempt_timeout: 10s
  terminal_status: [404, 410]
  max_connections_per_server: 8
  user_agent: picproxy-test
storage:
  path: /var/cache/picproxy
coordinator:
  failure_cooldown: 1m
tally:
  threshold: 3
  poll_timeout: 5s
"#;
    let (cfg, ignored) = config::parse(raw).unwrap();
    assert!(ignored.is_empty(), "{ignored:?}");
    assert!(cfg.strict);
    assert_eq!(cfg.pidfile.as_deref(), Some("/tmp/picproxy.pid"));
    assert_eq!(cfg.logger.level, "debug");
    assert_eq!(cfg.server.addr, "127.0.0.1:8080");
    assert_eq!(cfg.server.alphabet(), None);
    assert_eq!(cfg.upstream.max_attempts, 4);
    assert_eq!(cfg.upstream.backoff_unit, Duration::from_millis(250));
    assert_eq!(cfg.upstream.attempt_timeout, Duration::from_secs(10));
    assert_eq!(cfg.upstream.terminal_status, vec![404, 410]);
    assert_eq!(cfg.upstream.max_connections_per_server, 8);
    assert_eq!(cfg.upstream.user_agent.as_deref(), Some("picproxy-test"));
    assert_eq!(cfg.storage.path, PathBuf::from("/var/cache/picproxy"));
    assert_eq!(cfg.coordinator.failure_cooldown, Duration::from_secs(60));
    assert_eq!(cfg.tally.threshold, 3);
    assert_eq!(cfg.tally.poll_timeout, Duration::from_secs(5));
    cfg.validate().unwrap();
}

#[test]
fn test_unknown_fields_collected() {
    let raw = "server:\n  addr: ':9000'\n  listen: x\ncolour: blue\n";
    let (cfg, ignored) = config::parse(raw).unwrap();
    assert_eq!(cfg.server.addr, ":9000");
    assert_eq!(ignored.len(), 2);
    assert!(ignored.iter().any(|p| p == "server.listen"));
    assert!(ignored.iter().any(|p| p == "colour"));
}

#[test]
fn test_bad_duration_rejected() {
    assert!(config::parse("upstream:\n  backoff_unit: soon\n").is_err());
}

#[test]
fn test_validate() {
    let mut cfg = Bootstrap::default();
    assert!(cfg.validate().is_err(), "empty storage path");

    cfg.resolve_storage_path().unwrap();
    assert!(cfg.storage.path.ends_with("cache"));
    cfg.validate().unwrap();

    cfg.upstream.max_attempts = 0;
    assert!(cfg.validate().is_err());
    cfg.upstream.max_attempts = 1;

    cfg.server.url_alphabet = Some("abc".to_string());
    assert!(cfg.validate().is_err());
    cfg.server.url_alphabet = Some(String::new());
    cfg.validate().unwrap();

    cfg.server.addr = " ".to_string();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_load_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    assert!(config::load(&dir.path().join("absent.yaml")).is_err());

    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "tally:\n  threshold: 9\n").unwrap();
    let (cfg, _) = config::load(&path).unwrap();
    assert_eq!(cfg.tally.threshold, 9);
}
