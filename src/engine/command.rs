//! Job-to-invocation translation.
//!
//! Every job is validated against the configured directories and the
//! engine's argument rules before a session is created; anything that cannot
//! be expressed as a valid argument combination is rejected with
//! [`AppError::InvalidJobSpec`].

use std::path::{Component, Path, PathBuf};

use crate::config::{GlobalConfig, MAX_HASH_TYPE};
use crate::models::job::{AttackMode, HashTarget, Job, JobSpec};
use crate::{AppError, Result};

/// Deterministic per-session file layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    /// Session directory.
    pub dir: PathBuf,
    /// Engine-owned restore file (`--restore-file-path`).
    pub restore_file: PathBuf,
    /// Session potfile (`--potfile-path`).
    pub potfile: PathBuf,
    /// Inline hash material written at submission.
    pub target_file: PathBuf,
    /// Our checkpoint record.
    pub checkpoint_file: PathBuf,
}

impl SessionPaths {
    /// Layout for `session_id` under `sessions_dir`.
    #[must_use]
    pub fn new(sessions_dir: &Path, session_id: &str) -> Self {
        let dir = sessions_dir.join(session_id);
        Self {
            restore_file: dir.join("engine.restore"),
            potfile: dir.join("engine.potfile"),
            target_file: dir.join("target.hashes"),
            checkpoint_file: dir.join("checkpoint.json"),
            dir,
        }
    }
}

/// How the engine should start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Start the job from the beginning.
    Fresh,
    /// Continue from the session's restore file.
    Restore,
}

/// A fully resolved engine command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Engine binary.
    pub program: PathBuf,
    /// Ordered arguments.
    pub args: Vec<String>,
    /// Working directory for the process.
    pub working_dir: PathBuf,
}

/// Job references resolved to absolute paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedJob {
    /// Canonical path of a file target; `None` for inline material.
    pub target_file: Option<PathBuf>,
    /// Wordlist files in operand order.
    pub wordlists: Vec<PathBuf>,
    /// Rule files in `-r` order.
    pub rules: Vec<PathBuf>,
    /// Mask operand.
    pub mask: Option<String>,
    /// Device ids for `-d`.
    pub devices: Option<Vec<u32>>,
}

/// Validate a job spec against the configuration.
///
/// # Errors
///
/// Returns `AppError::InvalidJobSpec` for an unknown hash type, an operand
/// set that does not fit the attack mode, a reference escaping its
/// directory, a missing file, or an invalid device selection.
pub fn validate(spec: &JobSpec, config: &GlobalConfig) -> Result<ResolvedJob> {
    validate_hash_type(spec.hash_type, config)?;
    let target_file = validate_target(&spec.target)?;

    let wordlists = spec
        .wordlists
        .iter()
        .map(|name| resolve_reference("wordlist", name, &config.paths.wordlists_dir))
        .collect::<Result<Vec<_>>>()?;
    let rules = spec
        .rules
        .iter()
        .map(|name| resolve_reference("rule", name, &config.paths.rules_dir))
        .collect::<Result<Vec<_>>>()?;

    let mask = match spec.mask.as_deref().map(str::trim) {
        Some("") => return Err(invalid("mask must not be empty")),
        Some(m) if m.chars().any(char::is_whitespace) => {
            return Err(invalid("mask must not contain whitespace"));
        }
        other => other.map(ToOwned::to_owned),
    };

    match spec.attack_mode {
        AttackMode::Dictionary => {
            require(!wordlists.is_empty(), "dictionary attack needs a wordlist")?;
            require(mask.is_none(), "dictionary attack takes no mask")?;
        }
        AttackMode::Combinator => {
            require(wordlists.len() == 2, "combinator attack needs exactly two wordlists")?;
            require(rules.is_empty(), "combinator attack takes no rules")?;
            require(mask.is_none(), "combinator attack takes no mask")?;
        }
        AttackMode::Mask => {
            require(mask.is_some(), "mask attack needs a mask")?;
            require(wordlists.is_empty(), "mask attack takes no wordlists")?;
            require(rules.is_empty(), "mask attack takes no rules")?;
        }
        AttackMode::HybridWordlistMask | AttackMode::HybridMaskWordlist => {
            require(wordlists.len() == 1, "hybrid attack needs exactly one wordlist")?;
            require(mask.is_some(), "hybrid attack needs a mask")?;
            require(rules.is_empty(), "hybrid attack takes no rules")?;
        }
    }

    let devices = match spec.devices {
        Some(ref ids) if ids.is_empty() => {
            return Err(invalid("device selection must not be empty"));
        }
        Some(ref ids) if ids.contains(&0) => {
            return Err(invalid("device ids are 1-based"));
        }
        Some(ref ids) => {
            let mut ids = ids.clone();
            ids.sort_unstable();
            ids.dedup();
            Some(ids)
        }
        None => None,
    };

    Ok(ResolvedJob {
        target_file,
        wordlists,
        rules,
        mask,
        devices,
    })
}

/// Path of the hash file handed to the engine.
#[must_use]
pub fn target_path(job: &Job, paths: &SessionPaths) -> PathBuf {
    match job.spec.target {
        HashTarget::File(ref path) => path.clone(),
        HashTarget::Inline(_) => paths.target_file.clone(),
    }
}

/// Build the engine command line for a session.
///
/// # Errors
///
/// Returns `AppError::InvalidJobSpec` if the job no longer validates or a
/// path is not valid UTF-8.
pub fn build_invocation(
    job: &Job,
    session_id: &str,
    paths: &SessionPaths,
    config: &GlobalConfig,
    mode: LaunchMode,
) -> Result<Invocation> {
    let mut args: Vec<String> = vec!["--session".into(), session_id.to_owned()];

    if mode == LaunchMode::Restore {
        args.push("--restore".into());
        args.push("--restore-file-path".into());
        args.push(path_arg(&paths.restore_file)?);
        return Ok(Invocation {
            program: config.engine.binary.clone(),
            args,
            working_dir: paths.dir.clone(),
        });
    }

    let resolved = validate(&job.spec, config)?;

    args.push("--restore-file-path".into());
    args.push(path_arg(&paths.restore_file)?);
    args.push("--potfile-path".into());
    args.push(path_arg(&paths.potfile)?);
    args.push("--status".into());
    args.push("--status-timer".into());
    args.push(config.engine.status_interval_seconds.to_string());
    args.push("--machine-readable".into());
    args.push("--quiet".into());

    if let Some(profile) = config.engine.workload_profile {
        args.push("-w".into());
        args.push(profile.to_string());
    }
    if config.engine.optimized_kernels {
        args.push("-O".into());
    }
    if config.engine.hwmon_disable {
        args.push("--hwmon-disable".into());
    }

    args.push("-m".into());
    args.push(job.spec.hash_type.to_string());
    args.push("-a".into());
    args.push(job.spec.attack_mode.code().to_string());

    if let Some(ref devices) = resolved.devices {
        args.push("-d".into());
        args.push(
            devices
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
        );
    }

    for rule in &resolved.rules {
        args.push("-r".into());
        args.push(path_arg(rule)?);
    }

    let target = resolved
        .target_file
        .clone()
        .unwrap_or_else(|| target_path(job, paths));
    args.push(path_arg(&target)?);

    let mask = resolved.mask.clone().unwrap_or_default();
    match job.spec.attack_mode {
        AttackMode::Dictionary | AttackMode::Combinator => {
            for wordlist in &resolved.wordlists {
                args.push(path_arg(wordlist)?);
            }
        }
        AttackMode::Mask => args.push(mask),
        AttackMode::HybridWordlistMask => {
            for wordlist in &resolved.wordlists {
                args.push(path_arg(wordlist)?);
            }
            args.push(mask);
        }
        AttackMode::HybridMaskWordlist => {
            args.push(mask);
            for wordlist in &resolved.wordlists {
                args.push(path_arg(wordlist)?);
            }
        }
    }

    Ok(Invocation {
        program: config.engine.binary.clone(),
        args,
        working_dir: paths.dir.clone(),
    })
}

fn validate_hash_type(code: u32, config: &GlobalConfig) -> Result<()> {
    let allowed = if config.engine.allowed_hash_types.is_empty() {
        code <= MAX_HASH_TYPE
    } else {
        config.engine.allowed_hash_types.contains(&code)
    };
    if allowed {
        Ok(())
    } else {
        Err(invalid(&format!("unknown hash type {code}")))
    }
}

/// The engine runs inside its session directory, so a file target is
/// resolved to an absolute path here.
fn validate_target(target: &HashTarget) -> Result<Option<PathBuf>> {
    match target {
        HashTarget::File(path) => {
            let canonical = path
                .canonicalize()
                .ok()
                .filter(|p| p.is_file())
                .ok_or_else(|| {
                    invalid(&format!("hash file {} does not exist", path.display()))
                })?;
            Ok(Some(canonical))
        }
        HashTarget::Inline(hashes) => {
            if hashes.is_empty() {
                return Err(invalid("inline target needs at least one hash"));
            }
            if hashes
                .iter()
                .any(|h| h.trim().is_empty() || h.contains(['\n', '\r']))
            {
                return Err(invalid("inline hashes must be single non-empty lines"));
            }
            Ok(None)
        }
    }
}

/// Resolve `name` inside `root`, refusing anything that escapes it.
fn resolve_reference(kind: &str, name: &str, root: &Path) -> Result<PathBuf> {
    let relative = Path::new(name);
    let escapes = name.trim().is_empty()
        || relative.is_absolute()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
    if escapes {
        return Err(invalid(&format!("invalid {kind} reference {name:?}")));
    }

    let candidate = root.join(relative);
    let canonical = candidate
        .canonicalize()
        .map_err(|_| invalid(&format!("{kind} {name:?} not found")))?;
    if !canonical.starts_with(root) || !canonical.is_file() {
        return Err(invalid(&format!("invalid {kind} reference {name:?}")));
    }
    Ok(canonical)
}

fn path_arg(path: &Path) -> Result<String> {
    path.to_str()
        .map(ToOwned::to_owned)
        .ok_or_else(|| invalid(&format!("path {} is not valid UTF-8", path.display())))
}

fn require(condition: bool, detail: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(invalid(detail))
    }
}

fn invalid(detail: &str) -> AppError {
    AppError::InvalidJobSpec(detail.to_owned())
}
