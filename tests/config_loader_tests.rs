use batched_migrations::config::{ConfigError, ConfigLoader};
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    let keys: Vec<String> = env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("BGM_"))
        .collect();
    for key in keys {
        unsafe {
            env::remove_var(key);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

fn loader(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::with_base_dir(PathBuf::from(dir.path()))
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let cfg = loader(&temp_dir).load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.log_level, "info");
    assert!(cfg.scheduler.enabled);
    assert_eq!(cfg.scheduler.tick_interval_seconds, 10);
    assert_eq!(cfg.runner.max_attempts, 3);
    assert!(cfg.partitioning.tables.is_empty());
    assert_eq!(cfg.database_configs().len(), 1);
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "BGM_RUNNER_MAX_ATTEMPTS=4\n");
    write_env_file(&temp_dir, ".env.test", "BGM_RUNNER_MAX_ATTEMPTS=5\n");
    write_env_file(&temp_dir, ".env.test.local", "BGM_RUNNER_MAX_ATTEMPTS=6\n");

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "BGM_PROFILE=test\nBGM_SCHEDULER_TICK_INTERVAL_SECONDS=30\n",
    );

    let cfg = loader(&temp_dir)
        .load()
        .expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.runner.max_attempts, 6);
    assert_eq!(cfg.scheduler.tick_interval_seconds, 30);
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "BGM_SCHEDULER_ENABLED=true\n");

    unsafe {
        env::set_var("BGM_SCHEDULER_ENABLED", "false");
    }

    let cfg = loader(&temp_dir).load().expect("config loads with env override");
    assert!(!cfg.scheduler.enabled);

    clear_env();
}

#[test]
fn databases_and_partitioned_tables_decode_from_json() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        concat!(
            r#"BGM_DATABASES='[{"name":"main","url":"postgres://app:secret@db:5432/app"},"#,
            r#"{"name":"ci","url":"postgres://app:secret@db:5432/ci","share_with":"main"}]'"#,
            "\n",
            r#"BGM_PARTITIONED_TABLES='[{"table":"audit_events","partitioning_key":"created_at","strategy":"monthly","retain_months":6},"#,
            r#"{"table":"job_logs","database":"ci","partitioning_key":"partition_id","strategy":"sliding_list","partition_size":1000,"next_partition_threshold":100}]'"#,
            "\n",
        ),
    );

    let cfg = loader(&temp_dir).load().expect("json sections decode");

    let databases = cfg.database_configs();
    assert_eq!(databases.len(), 2);
    assert_eq!(databases[1].share_with.as_deref(), Some("main"));

    assert_eq!(cfg.partitioning.tables.len(), 2);
    assert_eq!(cfg.partitioning.tables[0].database, "main");
    assert_eq!(cfg.partitioning.tables[0].retain_months, Some(6));
    assert_eq!(cfg.partitioning.tables[1].partition_size, Some(1000));

    let redacted = cfg.redacted_json().expect("config serializes");
    assert!(!redacted.contains("secret"));
    clear_env();
}

#[test]
fn invalid_json_names_the_variable() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("BGM_PARTITIONED_TABLES", "[{not json");
    }
    let temp_dir = TempDir::new().unwrap();
    let err = loader(&temp_dir).load().expect_err("invalid json should fail");
    assert!(matches!(err, ConfigError::InvalidJson { ref key, .. } if key == "BGM_PARTITIONED_TABLES"));

    clear_env();
}

#[test]
fn unknown_strategy_fails_validation() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var(
            "BGM_PARTITIONED_TABLES",
            r#"[{"table":"audit_events","partitioning_key":"created_at","strategy":"weekly"}]"#,
        );
    }
    let temp_dir = TempDir::new().unwrap();
    let err = loader(&temp_dir).load().expect_err("unknown strategy should fail");
    assert!(format!("{err}").contains("weekly"));

    clear_env();
}

#[test]
fn invalid_log_format_returns_error() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("BGM_LOG_FORMAT", "xml");
    }
    let temp_dir = TempDir::new().unwrap();
    let err = loader(&temp_dir).load().expect_err("invalid log format should fail");
    assert!(matches!(err, ConfigError::InvalidLogFormat { .. }));

    clear_env();
}
