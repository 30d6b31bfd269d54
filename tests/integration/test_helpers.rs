//! Shared helpers for orchestration integration tests.
//!
//! Tests run the real coordinator against a scripted stand-in for the
//! engine: a small bash program that understands the handful of engine
//! arguments the orchestrator passes, prints machine-readable status
//! records, writes its restore file when asked to checkpoint, and appends
//! to its potfile.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crackq::config::GlobalConfig;
use crackq::models::job::{AttackMode, HashTarget, JobSpec};
use crackq::models::session::{SessionState, SessionView};
use crackq::orchestrator::coordinator::Orchestrator;
use crackq::persistence::db;
use crackq::persistence::session_repo::SessionRepo;

/// Digest the scripted engine "recovers".
pub const TARGET_HASH: &str = "5f4dcc3b5aa765d61d8327deb882cf99";

const PREAMBLE: &str = r#"#!/usr/bin/env bash
restore=""; pot=""; resume=0
while [ $# -gt 0 ]; do
  case "$1" in
    --restore-file-path) restore="$2"; shift 2 ;;
    --potfile-path) pot="$2"; shift 2 ;;
    --restore) resume=1; shift ;;
    *) shift ;;
  esac
done
p=0
if [ "$resume" = 1 ]; then
  read -r pot p < "$restore" || exit 255
fi
status() {
  printf 'STATUS\t3\tSPEED\t1000\t1000\tPROGRESS\t%d\t100\tRECHASH\t%d\t1\n' "$1" "${2:-0}"
}
"#;

/// Runs until asked to checkpoint, advancing one percent per record.
pub const LOOP_ENGINE: &str = r#"
while true; do
  status "$p"
  if read -t 0.1 -r cmd; then
    if [ "$cmd" = "c" ]; then
      printf '%s %d\n' "$pot" "$p" > "$restore"
      exit 3
    fi
  fi
  if [ "$p" -lt 90 ]; then p=$((p + 1)); fi
done
"#;

/// Recovers [`TARGET_HASH`] and exits with the "cracked" code.
pub const CRACKING_ENGINE: &str = r#"
status 50
sleep 0.2
printf '%s:%s\n' "5f4dcc3b5aa765d61d8327deb882cf99" "password" >> "$pot"
status 100 1
sleep 0.3
exit 0
"#;

/// Exhausts the keyspace without recovering anything.
pub const EXHAUSTING_ENGINE: &str = r#"
status 40
status 100
exit 1
"#;

/// Exits on its own with an abort code.
pub const CRASHING_ENGINE: &str = r#"
status 10
sleep 0.2
exit 2
"#;

/// Records its pid beside the restore file, then behaves like
/// [`LOOP_ENGINE`].
pub const PID_LOOP_ENGINE: &str = r#"
echo $$ > "$(dirname "$restore")/engine.pid"
while true; do
  status "$p"
  read -t 0.1 -r _
  if [ "$p" -lt 90 ]; then p=$((p + 1)); fi
done
"#;

/// Ignores the checkpoint command and has to be killed.
pub const STUBBORN_ENGINE: &str = r#"
while true; do
  status "$p"
  read -t 0.1 -r _
  if [ "$p" -lt 90 ]; then p=$((p + 1)); fi
done
"#;

/// Prints one record, a line longer than the reader accepts, then keeps
/// reporting progress.
pub const OVERLONG_LINE_ENGINE: &str = r#"
status 5
head -c 70000 /dev/zero | tr ' ' 'x'
printf '
'
p=5
while true; do
  if [ "$p" -lt 90 ]; then p=$((p + 1)); fi
  status "$p"
  read -t 0.1 -r _
done
"#;

/// Reports a device failure and then idles.
pub const DEVICE_FAILURE_ENGINE: &str = r#"
status 5
echo "* Device #1: ATTENTION! OpenCL kernel self-test failed."
while true; do read -t 1 -r _; done
"#;

/// Emits nothing but broken status records.
pub const MALFORMED_ENGINE: &str = r#"
while true; do
  printf 'STATUS\tbogus\n'
  read -t 0.05 -r _
done
"#;

/// Stays alive without printing anything.
pub const SILENT_ENGINE: &str = r#"
while true; do read -t 1 -r _; done
"#;

/// Per-test workspace with configuration and a scripted engine.
pub struct TestEnv {
    pub temp: tempfile::TempDir,
    pub config: Arc<GlobalConfig>,
}

impl TestEnv {
    /// Build an environment running `engine_body` with extra TOML appended
    /// to the `[supervisor]` section.
    pub fn new(engine_body: &str, supervisor_toml: &str) -> Self {
        Self::with_sections(engine_body, supervisor_toml, "")
    }

    /// Like [`TestEnv::new`], with additional top-level sections.
    pub fn with_sections(engine_body: &str, supervisor_toml: &str, extra_toml: &str) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        for dir in ["wordlists", "rules", "data"] {
            std::fs::create_dir_all(root.join(dir)).expect("mkdir");
        }
        std::fs::write(root.join("wordlists/words.txt"), "password\n").expect("wordlist");
        let engine = write_engine(root, engine_body);

        let toml = format!(
            r#"
ipc_name = "crackq-test-{ipc}"

[engine]
binary = '{engine}'
status_interval_seconds = 1

[paths]
wordlists_dir = '{w}'
rules_dir = '{r}'
data_dir = '{d}'

[supervisor]
{grace}
autosave_interval_seconds = 60
io_timeout_seconds = 5
potfile_poll_millis = 50
{supervisor_toml}

{extra_toml}
"#,
            ipc = uuid::Uuid::new_v4().simple(),
            grace = if supervisor_toml.contains("grace_period_seconds") {
                ""
            } else {
                "grace_period_seconds = 3"
            },
            engine = engine.display(),
            w = root.join("wordlists").display(),
            r = root.join("rules").display(),
            d = root.join("data").display(),
        );
        let config = GlobalConfig::from_toml_str(&toml).expect("valid test config");
        Self {
            temp,
            config: Arc::new(config),
        }
    }

    /// Repository backed by a file database inside the workspace, so a
    /// second coordinator can reopen it.
    pub async fn repo(&self) -> SessionRepo {
        let pool = db::connect(&self.config.db_path()).await.expect("db connect");
        SessionRepo::new(Arc::new(pool))
    }

    /// Pid the scripted engine recorded for `session_id`.
    pub async fn engine_pid(&self, session_id: &str) -> u32 {
        let path = self.session_dir(session_id).join("engine.pid");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Ok(raw) = std::fs::read_to_string(&path) {
                if let Ok(pid) = raw.trim().parse() {
                    return pid;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "engine never wrote {}",
                path.display()
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Directory of `session_id`.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.config.sessions_dir().join(session_id)
    }
}

fn write_engine(root: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = root.join("fake-hashcat");
    std::fs::write(&path, format!("{PREAMBLE}{body}")).expect("write engine");
    let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
    path
}

/// Dictionary job against [`TARGET_HASH`].
pub fn dictionary_job(priority: Option<i32>) -> JobSpec {
    JobSpec {
        target: HashTarget::Inline(vec![TARGET_HASH.into()]),
        hash_type: 0,
        attack_mode: AttackMode::Dictionary,
        wordlists: vec!["words.txt".into()],
        rules: Vec::new(),
        mask: None,
        priority,
        devices: None,
    }
}

/// Poll until `check` accepts the session view, or panic after 15 s.
pub async fn wait_until(
    orchestrator: &Orchestrator,
    session_id: &str,
    what: &str,
    check: impl Fn(&SessionView) -> bool,
) -> SessionView {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let view = orchestrator.get(session_id).await.expect("session exists");
        if check(&view) {
            return view;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}; last view: {view:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll until the session reaches `state`.
pub async fn wait_for_state(
    orchestrator: &Orchestrator,
    session_id: &str,
    state: SessionState,
) -> SessionView {
    wait_until(orchestrator, session_id, state.as_str(), |v| v.state == state).await
}
