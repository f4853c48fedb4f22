use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use tracing::warn;

use crate::config::BurrowConfig;

/// Mutable counters shared across an engine run. Progress reporting takes
/// them by reference; the exit code is derived from `errors`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineStats {
    pub file_cnt: u64,
    pub dir_cnt: u64,
    pub errors: u64,
}

/// Emits the marker lines the supervisor parses, and optionally tees every
/// line into the per-host log.
pub struct Progress {
    quiet: bool,
    tee: Option<File>,
}

impl Progress {
    pub fn new(quiet: bool) -> Self {
        Self { quiet, tee: None }
    }

    /// Attach the per-host log so every emitted line is also appended to
    /// `<LogDir>/<host>/LOG`.
    pub fn with_host_log(mut self, config: &BurrowConfig, host: &str) -> Self {
        if config.log_dir.is_empty() {
            return self;
        }
        let dir = Path::new(&config.log_dir).join(host);
        let opened = fs::create_dir_all(&dir)
            .map_err(|e| e.to_string())
            .and_then(|_| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join("LOG"))
                    .map_err(|e| e.to_string())
            });
        match opened {
            Ok(file) => self.tee = Some(file),
            Err(e) => warn!(host, error = %e, "cannot open per-host log"),
        }
        self
    }

    fn emit(&mut self, line: &str) {
        println!("{line}");
        if let Some(tee) = &mut self.tee {
            if let Err(e) = writeln!(tee, "{line}") {
                warn!(error = %e, "per-host log write failed, dropping tee");
                self.tee = None;
            }
        }
    }

    /// Always emitted, even with progress suppressed: the supervisor keys
    /// process tracking off these.
    pub fn pid_start(&mut self) {
        let pid = std::process::id();
        self.emit(&format!("__bpc_pidStart__ {pid}"));
        self.emit(&format!("xferPids {pid}"));
    }

    pub fn pid_end(&mut self) {
        self.emit(&format!("__bpc_pidEnd__ {}", std::process::id()));
    }

    pub fn state(&mut self, state: &str) {
        if !self.quiet {
            self.emit(&format!("__bpc_progress_state__ {state}"));
        }
    }

    pub fn file_count(&mut self, stats: &EngineStats) {
        if !self.quiet {
            self.emit(&format!("__bpc_progress_fileCnt__ {}", stats.file_cnt));
        }
    }

    pub fn note(&mut self, line: &str) {
        self.emit(line);
    }
}
