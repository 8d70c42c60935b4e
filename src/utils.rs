use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Keeps printable ASCII and whitespace only
pub fn filter_printable_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_graphic() || c.is_ascii_whitespace())
        .collect()
}

/// Escapes control and non-ASCII characters
pub fn safe_log_string(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\0' => result.push_str("\\0"),
            '\x01'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f' | '\x7f' => {
                result.push_str(&format!("\\x{:02x}", c as u32));
            }
            _ if c.is_ascii_graphic() || c.is_ascii_whitespace() => result.push(c),
            _ => result.push_str(&format!("\\u{{{:x}}}", c as u32)),
        }
    }
    result
}

/// Connection transcript written to stdout and optionally to a file
pub struct Logger {
    writer: Option<Arc<Mutex<BufWriter<File>>>>,
    raw_display: bool,
    verbose: bool,
}

impl Logger {
    pub fn new(log_file: Option<PathBuf>, raw_display: bool, verbose: bool) -> anyhow::Result<Self> {
        let writer = if let Some(path) = log_file {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                    eprintln!("[INFO] Created log directory: {:?}", parent);
                }
            }

            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(Arc::new(Mutex::new(BufWriter::new(file))))
        } else {
            None
        };

        Ok(Self {
            writer,
            raw_display,
            verbose,
        })
    }

    /// Stdout only, used by tests and embedders
    pub fn stdout() -> Self {
        Self {
            writer: None,
            raw_display: false,
            verbose: false,
        }
    }

    fn format_line(&self, peer: Option<&SocketAddr>, message: &str) -> String {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        match peer {
            Some(peer) => format!("{} {} {}\n", timestamp, peer, message),
            None => format!("{} server {}\n", timestamp, message),
        }
    }

    async fn emit(&self, peer: Option<&SocketAddr>, message: &str) {
        let log_line = self.format_line(peer, message);

        if self.raw_display {
            print!("{}", log_line);
        } else {
            print!("{}", filter_printable_chars(&log_line));
        }

        if let Some(writer) = &self.writer {
            let mut writer = writer.lock().await;
            let _ = writer.write_all(self.format_line(peer, &safe_log_string(message)).as_bytes());
            let _ = writer.flush();
        }
    }

    pub async fn log(&self, client_addr: &SocketAddr, message: &str) {
        self.emit(Some(client_addr), message).await;
    }

    /// Listener level messages that belong to no connection
    pub async fn log_server(&self, message: &str) {
        self.emit(None, message).await;
    }

    /// Framed multi-line block, only in verbose mode
    pub async fn log_verbose(&self, client_addr: &SocketAddr, title: &str, details: &str) {
        if !self.verbose {
            return;
        }

        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let separator = "─".repeat(60);
        let frame = |details: &str| {
            format!(
                "{}\n{} VERBOSE: {} {}\n{}\n{}\n{}\n\n",
                separator, timestamp, client_addr, title, separator, details, separator
            )
        };

        if self.raw_display {
            print!("{}", frame(details));
        } else {
            print!("{}", frame(&safe_log_string(details)));
        }

        if let Some(writer) = &self.writer {
            let mut writer = writer.lock().await;
            let _ = writer.write_all(frame(&safe_log_string(details)).as_bytes());
            let _ = writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters() {
        assert_eq!(filter_printable_chars("ok\x07 line\u{e9}\r\n"), "ok line\r\n");
        assert_eq!(safe_log_string("a\0b\x1bc\u{e9}"), "a\\0b\\x1bc\\u{e9}");
    }

    #[tokio::test]
    async fn test_log_file() {
        let dir = std::env::temp_dir().join(format!("mailreceiver-log-{}", std::process::id()));
        let path = dir.join("logs").join("smtp.log");
        let logger = Logger::new(Some(path.clone()), false, true).unwrap();
        let peer: SocketAddr = "10.0.0.1:25".parse().unwrap();

        logger.log(&peer, ">> EHLO x\x00").await;
        logger.log_server("Listening").await;
        logger.log_verbose(&peer, "MESSAGE", "body").await;

        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
        assert!(content.contains("10.0.0.1:25 >> EHLO x\\0\n"));
        assert!(content.contains(" server Listening\n"));
        assert!(content.contains("VERBOSE: 10.0.0.1:25 MESSAGE"));
    }
}
