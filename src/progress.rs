use std::io::{self, IsTerminal, Write};

/// TSV lines written to stdout for a parent process to parse, only when
/// stdout is piped (interactive runs get human-readable `tracing` output instead).
pub struct ProgressStream {
    enabled: bool,
}

impl ProgressStream {
    pub fn new() -> Self {
        Self {
            enabled: !io::stdout().is_terminal(),
        }
    }

    pub fn resume_skip(&self, already: usize, total: usize) {
        self.emit(&format!("RESUME_SKIP\t{already}\t{total}"));
    }

    pub fn cumulative_metrics(&self, success: i64, failed: i64, total: i64) {
        self.emit(&format!(
            "CUMULATIVE_METRICS\tsuccess={success},failed={failed},total={total}"
        ));
    }

    pub fn log(&self, message: &str) {
        self.emit(&format!("LOG\t{message}"));
    }

    fn emit(&self, line: &str) {
        if !self.enabled {
            return;
        }
        let mut out = io::stdout();
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    }
}

impl Default for ProgressStream {
    fn default() -> Self {
        Self::new()
    }
}
