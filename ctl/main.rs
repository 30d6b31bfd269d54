#![forbid(unsafe_code)]

//! `crackq-ctl` — local CLI companion for `crackq`.
//!
//! Connects to the IPC socket and sends JSON commands to the server.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

#[derive(Debug, Parser)]
#[command(
    name = "crackq-ctl",
    about = "Local CLI for the crackq server",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match server's `ipc_name` config).
    #[arg(long, default_value = "crackq")]
    ipc_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit a job. Either `--file` or the inline flags describe it.
    Submit {
        /// JSON job specification file.
        #[arg(long, conflicts_with_all = ["hash_file", "hashes"])]
        file: Option<PathBuf>,
        /// File of target hashes, one per line.
        #[arg(long)]
        hash_file: Option<PathBuf>,
        /// Target hash given inline (repeatable).
        #[arg(long = "hash")]
        hashes: Vec<String>,
        /// Engine hash-type code.
        #[arg(short = 'm', long, default_value_t = 0)]
        hash_type: u32,
        /// Attack mode code (0, 1, 3, 6, 7).
        #[arg(short = 'a', long, default_value_t = 0)]
        attack_mode: u8,
        /// Wordlist name (repeatable).
        #[arg(long = "wordlist")]
        wordlists: Vec<String>,
        /// Rule file name (repeatable).
        #[arg(long = "rule")]
        rules: Vec<String>,
        /// Mask for mask and hybrid attacks.
        #[arg(long)]
        mask: Option<String>,
        /// Admission priority; higher runs first.
        #[arg(long)]
        priority: Option<i32>,
        /// Compute device id (repeatable).
        #[arg(long = "device")]
        devices: Vec<u32>,
    },

    /// Cancel a session.
    Cancel {
        /// Session ID.
        id: String,
    },

    /// Pause a running session with a checkpoint.
    Pause {
        /// Session ID.
        id: String,
    },

    /// Resume a paused session from its checkpoint.
    Resume {
        /// Session ID.
        id: String,
    },

    /// Show one session, or every session when no ID is given.
    Status {
        /// Session ID.
        id: Option<String>,
    },

    /// List all sessions.
    List,

    /// Print recovered hash/plaintext pairs for a session.
    Results {
        /// Session ID.
        id: String,
    },

    /// Stream events until interrupted.
    Subscribe {
        /// Only events for this session.
        #[arg(long)]
        session: Option<String>,
    },
}

fn main() {
    let args = Cli::parse();

    let request_json = match build_request(&args.command) {
        Ok(req) => req,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(2);
        }
    };

    if matches!(args.command, Command::Subscribe { .. }) {
        if let Err(err) = stream_events(&args.ipc_name, &request_json) {
            eprintln!("Subscription ended: {err}");
            std::process::exit(1);
        }
        return;
    }

    match send_ipc_command(&args.ipc_name, &request_json) {
        Ok(response) => {
            if let Some(obj) = response.as_object() {
                let ok = obj
                    .get("ok")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if ok {
                    if let Some(data) = obj.get("data") {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    } else {
                        println!("OK");
                    }
                } else {
                    let err_msg = obj
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error");
                    eprintln!("Error: {err_msg}");
                    std::process::exit(1);
                }
            } else {
                println!("{response}");
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to server: {err}");
            eprintln!("Is crackq running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
}

fn build_request(
    command: &Command,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let req = match command {
        Command::Submit {
            file: Some(path), ..
        } => {
            let raw = std::fs::read_to_string(path)?;
            let job: serde_json::Value = serde_json::from_str(&raw)?;
            serde_json::json!({ "command": "submit", "job": job })
        }
        Command::Submit {
            file: None,
            hash_file,
            hashes,
            hash_type,
            attack_mode,
            wordlists,
            rules,
            mask,
            priority,
            devices,
        } => {
            let target = match (hash_file, hashes.is_empty()) {
                (Some(path), true) => serde_json::json!({ "file": path }),
                (None, false) => serde_json::json!({ "inline": hashes }),
                _ => return Err("exactly one of --hash-file or --hash is required".into()),
            };
            let mut job = serde_json::json!({
                "target": target,
                "hash_type": hash_type,
                "attack_mode": attack_mode,
                "wordlists": wordlists,
                "rules": rules,
            });
            if let Some(m) = mask {
                job["mask"] = serde_json::Value::String(m.clone());
            }
            if let Some(p) = priority {
                job["priority"] = serde_json::json!(p);
            }
            if !devices.is_empty() {
                job["devices"] = serde_json::json!(devices);
            }
            serde_json::json!({ "command": "submit", "job": job })
        }
        Command::Cancel { id } => serde_json::json!({ "command": "cancel", "id": id }),
        Command::Pause { id } => serde_json::json!({ "command": "pause", "id": id }),
        Command::Resume { id } => serde_json::json!({ "command": "resume", "id": id }),
        Command::Status { id } => {
            let mut req = serde_json::json!({ "command": "status" });
            if let Some(id) = id {
                req["id"] = serde_json::Value::String(id.clone());
            }
            req
        }
        Command::List => serde_json::json!({ "command": "list" }),
        Command::Results { id } => serde_json::json!({ "command": "results", "id": id }),
        Command::Subscribe { session } => {
            let mut req = serde_json::json!({ "command": "subscribe" });
            if let Some(id) = session {
                req["id"] = serde_json::Value::String(id.clone());
            }
            req
        }
    };
    Ok(req)
}

fn connect_and_send(
    ipc_name: &str,
    request: &serde_json::Value,
) -> std::result::Result<Stream, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    // Send request as a single JSON line.
    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;
    Ok(stream)
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &serde_json::Value,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let stream = connect_and_send(ipc_name, request)?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: serde_json::Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}

/// Print every line the server streams back until it closes the connection.
fn stream_events(
    ipc_name: &str,
    request: &serde_json::Value,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let stream = connect_and_send(ipc_name, request)?;
    let reader = BufReader::new(&stream);
    let stdout = std::io::stdout();
    for line in reader.lines() {
        let line = line?;
        let mut out = stdout.lock();
        writeln!(out, "{line}")?;
        out.flush()?;
    }
    Ok(())
}
