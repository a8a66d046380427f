//! Instance-level logging.
//!
//! Each engine instance writes its own log file, so multiple plugin
//! instances in one host never interleave.
//!
//! # Real-time safety
//! `info`/`warn`/`error` push onto a bounded channel with `try_send` and
//! never block; file IO happens on a dedicated background thread. A full
//! queue drops the entry rather than stalling the caller.

use chrono::Local;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Error,
    Warn,
    Info,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Error => write!(f, "ERROR"),
            Level::Warn => write!(f, "WARN "),
            Level::Info => write!(f, "INFO "),
        }
    }
}

enum LogMsg {
    Entry {
        level: Level,
        module: &'static str,
        message: String,
    },
    Flush,
}

pub fn generate_instance_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{:08x}", (nanos & 0xFFFF_FFFF) as u32)
}

pub struct InstanceLogger {
    tx: Sender<LogMsg>,
    pub instance_id: String,
    log_path: PathBuf,
    _thread_handle: Option<thread::JoinHandle<()>>,
}

impl InstanceLogger {
    fn parse_env_bool(name: &str) -> Option<bool> {
        let value = std::env::var(name).ok()?;
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => Some(true),
            "0" | "false" | "off" | "no" => Some(false),
            _ => None,
        }
    }

    fn detailed_logging_enabled() -> bool {
        static ENABLED: OnceLock<bool> = OnceLock::new();
        *ENABLED.get_or_init(|| Self::parse_env_bool("IRLOAD_DETAILED_LOG").unwrap_or(false))
    }

    /// Create a logger for one engine instance and start its writer thread.
    pub fn new(instance_id: &str) -> Arc<Self> {
        let path = Self::get_log_path(instance_id);
        let path_for_thread = path.clone();
        let (tx, rx) = bounded::<LogMsg>(4096);
        let instance_id_clone = instance_id.to_string();

        let thread_handle = thread::spawn(move || {
            Self::log_worker(rx, path_for_thread, instance_id_clone);
        });

        Arc::new(Self {
            tx,
            instance_id: instance_id.to_string(),
            log_path: path,
            _thread_handle: Some(thread_handle),
        })
    }

    fn log_worker(rx: Receiver<LogMsg>, path: PathBuf, instance_id: String) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| eprintln!("[IRLoad] Failed to open log: {}", e))
            .ok();

        if let Some(ref mut f) = file {
            let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let _ = writeln!(f, "[{}] [INFO ] IRLoad Logger Initialized", timestamp);
            let _ = writeln!(f, "[{}] [INFO ] Instance ID: {}", timestamp, instance_id);
        }

        while let Ok(msg) = rx.recv() {
            match msg {
                LogMsg::Entry {
                    level,
                    module,
                    message,
                } => {
                    if let Some(ref mut f) = file {
                        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                        let _ = writeln!(f, "[{}] [{}] [{}] {}", timestamp, level, module, message);
                    }
                }
                LogMsg::Flush => {
                    if let Some(ref mut f) = file {
                        let _ = f.flush();
                    }
                }
            }
        }
    }

    fn get_log_path(instance_id: &str) -> PathBuf {
        let mut candidates: Vec<PathBuf> = Vec::new();

        if let Ok(env_dir) = std::env::var("IRLOAD_LOG_DIR") {
            if !env_dir.trim().is_empty() {
                candidates.push(PathBuf::from(env_dir.trim()));
            }
        }

        if let Some(base_dir) = dirs::data_local_dir() {
            candidates.push(base_dir.join("IRLoad").join("Logs"));
        }

        for dir in candidates {
            if let Err(e) = fs::create_dir_all(&dir) {
                eprintln!("[IRLoad] Failed to create log dir {:?}: {}", dir, e);
                continue;
            }
            let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
            return dir.join(format!("Instance_{}_{}.log", timestamp, instance_id));
        }

        std::env::temp_dir()
            .join("IRLoad_Logs")
            .join(format!("IRLoad_{}.log", instance_id))
    }

    fn log(&self, level: Level, module: &'static str, message: String) {
        let _ = self.tx.try_send(LogMsg::Entry {
            level,
            module,
            message,
        });
    }

    pub fn log_path(&self) -> &PathBuf {
        &self.log_path
    }

    pub fn detailed_enabled(&self) -> bool {
        Self::detailed_logging_enabled()
    }

    pub fn info(&self, module: &'static str, message: &str) {
        self.log(Level::Info, module, message.to_string());
    }

    pub fn detailed_info(&self, module: &'static str, message: &str) {
        if Self::detailed_logging_enabled() {
            self.log(Level::Info, module, message.to_string());
        }
    }

    pub fn warn(&self, module: &'static str, message: &str) {
        self.log(Level::Warn, module, message.to_string());
    }

    pub fn error(&self, module: &'static str, message: &str) {
        self.log(Level::Error, module, message.to_string());
    }

    pub fn flush(&self) {
        let _ = self.tx.send(LogMsg::Flush);
    }
}

impl Drop for InstanceLogger {
    fn drop(&mut self) {
        let _ = self.tx.send(LogMsg::Flush);
    }
}
