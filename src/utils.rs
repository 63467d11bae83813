use anyhow::Result;
use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record};
use std::fs::OpenOptions;
use std::io::{self, LineWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use chatsync::models::{Message, MessageStatus};

// Logger and terminal formatting helpers for the command line client.

/// Line-buffered logger writing to a file, or to stderr without one.
pub struct SimpleLogger {
    out: Mutex<Box<dyn Write + Send>>,
}

impl SimpleLogger {
    pub fn new(log_file: Option<&Path>) -> Result<Self> {
        let out: Box<dyn Write + Send> = match log_file {
            Some(path) => Box::new(LineWriter::new(
                OpenOptions::new().create(true).append(true).open(path)?,
            )),
            None => Box::new(io::stderr()),
        };
        Ok(Self { out: Mutex::new(out) })
    }
}

/// `[YYYY-mm-dd HH:MM:SS] LEVEL [file:line] message`
fn format_record(record: &Record) -> String {
    format!(
        "[{}] {} [{}:{}] {}",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        record.level(),
        record.file().unwrap_or("unknown"),
        record.line().unwrap_or(0),
        record.args()
    )
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_record(record);
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{}", line);
        }
    }

    fn flush(&self) {
        if let Ok(mut out) = self.out.lock() {
            let _ = out.flush();
        }
    }
}

pub fn setup_logging(log_file: Option<&Path>, level: LevelFilter) -> Result<()> {
    log::set_boxed_logger(Box::new(SimpleLogger::new(log_file)?))?;
    log::set_max_level(level);
    log::info!(
        "{} {} logging at {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        level
    );
    Ok(())
}

/// One timeline row for the terminal.
pub fn format_message(message: &Message) -> String {
    let time = message
        .created_at
        .map(|ts| ts.with_timezone(&Local).format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string());
    let who = if message.is_own { "me" } else { message.sender_id.as_str() };
    let body = match (message.visible_text(), message.visible_attachment()) {
        (None, _) => "<message deleted>".to_string(),
        (Some(text), Some(attachment)) if text.is_empty() => {
            format!("[{} {}]", attachment.kind.as_str(), attachment.name)
        }
        (Some(text), Some(attachment)) => format!("{} [{} {}]", text, attachment.kind.as_str(), attachment.name),
        (Some(text), None) => text.to_string(),
    };
    let status = if message.is_own {
        match message.status {
            MessageStatus::Sending => " …",
            MessageStatus::Sent => " ✓",
            MessageStatus::Read => " ✓✓",
            MessageStatus::Error => " ✗",
        }
    } else {
        ""
    };
    format!("[{}] {}: {}{}  ({})", time, who, body, status, message.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use log::Level;

    #[test]
    fn test_record_format() {
        let line = format_record(
            &Record::builder()
                .args(format_args!("socket closed"))
                .level(Level::Warn)
                .file(Some("src/chat/connection.rs"))
                .line(Some(42))
                .build(),
        );
        assert!(line.starts_with('['));
        assert!(line.ends_with("] WARN [src/chat/connection.rs:42] socket closed"));
    }

    #[test]
    fn test_format_own_and_deleted_messages() {
        let mut message = Message::outgoing("corr-1", "me", "hello", Utc::now());
        let row = format_message(&message);
        assert!(row.contains("me: hello …"));
        assert!(row.ends_with("(corr-1)"));

        message.deleted_for_everyone = true;
        message.advance_status(MessageStatus::Sent);
        assert!(format_message(&message).contains("<message deleted> ✓"));
    }
}
