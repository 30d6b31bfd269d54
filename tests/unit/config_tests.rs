use crackq::{config::GlobalConfig, AppError};

struct Dirs {
    _temp: tempfile::TempDir,
    wordlists: String,
    rules: String,
    data: String,
}

fn dirs() -> Dirs {
    let temp = tempfile::tempdir().expect("tempdir");
    let wordlists = temp.path().join("wordlists");
    let rules = temp.path().join("rules");
    std::fs::create_dir_all(&wordlists).expect("mkdir");
    std::fs::create_dir_all(&rules).expect("mkdir");
    Dirs {
        wordlists: wordlists.display().to_string(),
        rules: rules.display().to_string(),
        // Created on load.
        data: temp.path().join("state").display().to_string(),
        _temp: temp,
    }
}

fn minimal_toml(d: &Dirs) -> String {
    format!(
        r#"
[engine]
binary = "/usr/bin/hashcat"

[paths]
wordlists_dir = '{}'
rules_dir = '{}'
data_dir = '{}'
"#,
        d.wordlists, d.rules, d.data
    )
}

fn sample_toml(d: &Dirs) -> String {
    format!(
        r#"
ipc_name = "crackq-test"
retention_days = 7

[engine]
binary = "/usr/bin/hashcat"
status_interval_seconds = 2
workload_profile = 4
optimized_kernels = true
allowed_hash_types = [0, 100, 1000]

[paths]
wordlists_dir = '{}'
rules_dir = '{}'
data_dir = '{}'

[scheduler]
max_concurrent_jobs = 3

[supervisor]
grace_period_seconds = 5
inactivity_timeout_seconds = 30
stall_limit = 2
malformed_threshold = 4
autosave_interval_seconds = 15
io_timeout_seconds = 3
history_capacity = 10
potfile_poll_millis = 250

[events]
subscriber_backlog = 16
"#,
        d.wordlists, d.rules, d.data
    )
}

#[test]
fn parses_valid_config() {
    let d = dirs();
    let config = GlobalConfig::from_toml_str(&sample_toml(&d)).expect("config parses");

    assert_eq!(config.ipc_name, "crackq-test");
    assert_eq!(config.retention_days, 7);
    assert_eq!(config.engine.workload_profile, Some(4));
    assert_eq!(config.engine.allowed_hash_types, vec![0, 100, 1000]);
    assert_eq!(config.scheduler.max_concurrent_jobs, 3);
    assert_eq!(config.supervisor.stall_limit, 2);
    assert_eq!(config.events.subscriber_backlog, 16);
    assert_eq!(config.grace_period().as_secs(), 5);
    assert_eq!(config.inactivity_timeout().as_secs(), 30);
    assert_eq!(config.autosave_interval().as_secs(), 15);
    assert_eq!(config.io_timeout().as_secs(), 3);
}

#[test]
fn minimal_config_uses_defaults() {
    let d = dirs();
    let config = GlobalConfig::from_toml_str(&minimal_toml(&d)).expect("config parses");

    assert_eq!(config.ipc_name, "crackq");
    assert_eq!(config.retention_days, 30);
    assert_eq!(config.engine.status_interval_seconds, 5);
    assert_eq!(config.scheduler.max_concurrent_jobs, 1);
    assert_eq!(config.supervisor.grace_period_seconds, 10);
    assert_eq!(config.supervisor.malformed_threshold, 5);
    assert_eq!(config.events.subscriber_backlog, 256);
    assert!(config.engine.allowed_hash_types.is_empty());
}

#[test]
fn data_dir_is_created_and_derived_paths_live_under_it() {
    let d = dirs();
    let config = GlobalConfig::from_toml_str(&minimal_toml(&d)).expect("config parses");

    assert!(config.paths.data_dir.is_dir());
    assert!(config.sessions_dir().starts_with(&config.paths.data_dir));
    assert!(config.db_path().starts_with(&config.paths.data_dir));
}

#[test]
fn zero_concurrency_is_rejected() {
    let d = dirs();
    let toml = format!("{}\n[scheduler]\nmax_concurrent_jobs = 0\n", minimal_toml(&d));
    let err = GlobalConfig::from_toml_str(&toml).expect_err("invalid");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn out_of_range_workload_profile_is_rejected() {
    let d = dirs();
    let toml = minimal_toml(&d).replace(
        "binary = \"/usr/bin/hashcat\"",
        "binary = \"/usr/bin/hashcat\"\nworkload_profile = 5",
    );
    assert!(GlobalConfig::from_toml_str(&toml).is_err());
}

#[test]
fn missing_wordlists_dir_is_rejected() {
    let d = dirs();
    let toml = minimal_toml(&d).replace(&d.wordlists, "/definitely/not/here");
    let err = GlobalConfig::from_toml_str(&toml).expect_err("invalid");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn missing_engine_section_is_rejected() {
    assert!(GlobalConfig::from_toml_str("ipc_name = \"x\"").is_err());
}

#[test]
fn load_from_path_reads_file() {
    let d = dirs();
    let file = tempfile::NamedTempFile::new().expect("tempfile");
    std::fs::write(file.path(), minimal_toml(&d)).expect("write");

    let config = GlobalConfig::load_from_path(file.path()).expect("load");
    assert_eq!(config.engine.binary, std::path::PathBuf::from("/usr/bin/hashcat"));

    let err = GlobalConfig::load_from_path("/nonexistent/crackq.toml").expect_err("missing");
    assert!(matches!(err, AppError::Config(_)));
}
