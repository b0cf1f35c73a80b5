use std::sync::Mutex;

use chrono::Utc;

/// Process-wide, append-only, timestamped message buffer.
///
/// Reset at the start of each pipeline run; the only channel by which an
/// external poller observes progress. Unbounded within a run.
#[derive(Debug, Default)]
pub struct LogSink {
    lines: Mutex<Vec<String>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the buffer. Called once at the start of every run.
    pub fn reset(&self) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.clear();
        }
    }

    pub fn append(&self, message: impl AsRef<str>) {
        let line = format!(
            "[{}] {}",
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            message.as_ref()
        );
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line);
        }
    }

    /// Current buffer contents, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().map(|lines| lines.clone()).unwrap_or_default()
    }
}
