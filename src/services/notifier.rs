use std::io::{self, Write};
use std::sync::Mutex;

use serde::Serialize;

/// Receives human-readable status strings. Fire-and-forget.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

#[derive(Serialize)]
struct Notification<'a> {
    message: &'a str,
}

/// Writes `[{"message": "..."}]` lines, the format the device agent
/// picks up from an act's stdout.
pub struct ActcastNotifier<W = io::Stdout> {
    out: Mutex<W>,
}

impl ActcastNotifier<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> ActcastNotifier<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_line(&self, message: &str) -> io::Result<()> {
        let line = serde_json::to_string(&[Notification { message }])?;
        let mut out = self
            .out
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        writeln!(out, "{line}")?;
        out.flush()
    }
}

impl<W: Write + Send> Notifier for ActcastNotifier<W> {
    fn notify(&self, message: &str) {
        if let Err(e) = self.write_line(message) {
            tracing::warn!(error = %e, message, "Failed to write notification");
        }
    }
}

/// Routes status messages into the tracing pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        tracing::info!(target: "lp_sender::status", "{message}");
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actcast_notifier_writes_json_line() {
        let notifier = ActcastNotifier::new(Vec::new());
        notifier.notify("test message");
        notifier.notify("second \"quoted\"");

        let out = String::from_utf8(notifier.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], r#"[{"message":"test message"}]"#);
        assert_eq!(lines[1], r#"[{"message":"second \"quoted\""}]"#);
    }
}
