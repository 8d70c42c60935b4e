use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;

/// A completed message handed over at the end of DATA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub peer: SocketAddr,
    pub mail_from: String,
    pub recipients: Vec<String>,
    pub body: Vec<u8>,
    /// Hostname from HELO/EHLO
    pub helo: Option<String>,
    /// User that passed AUTH on this connection
    pub auth_user: Option<String>,
}

/// Receives completed messages.
///
/// Returning `None` accepts the message with `250 OK`, returning a reply
/// line sends that line to the client instead. The connection awaits the
/// handler before reading the next line.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Option<String>;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(Message) -> Option<String> + Send + Sync,
{
    async fn handle(&self, message: Message) -> Option<String> {
        self(message)
    }
}

/// Writes every message as an `.eml` file into a directory
pub struct SpoolWriter {
    dir: PathBuf,
}

impl SpoolWriter {
    pub fn new(dir: PathBuf) -> Result<Self> {
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create spool directory: {:?}", dir))?;
            eprintln!("[INFO] Spool directory created: {:?}", dir);
        }
        Ok(Self { dir })
    }

    pub async fn write(&self, message: &Message) -> Result<PathBuf> {
        let now = Local::now();
        let filename = format!(
            "{}_{}_{}.eml",
            now.format("%Y%m%d_%H%M%S%.6f"),
            message.peer.ip().to_string().replace(['.', ':'], "_"),
            message.peer.port()
        );
        let path = self.dir.join(filename);

        let mut content = Vec::with_capacity(message.body.len() + 256);
        content.extend_from_slice(format!("X-Received-Peer: {}\r\n", message.peer).as_bytes());
        content.extend_from_slice(format!("X-Received-Date: {}\r\n", now.to_rfc2822()).as_bytes());
        if let Some(helo) = &message.helo {
            content.extend_from_slice(format!("X-Received-HELO: {}\r\n", helo).as_bytes());
        }
        if let Some(user) = &message.auth_user {
            content.extend_from_slice(format!("X-Received-Auth: {}\r\n", user).as_bytes());
        }
        content.extend_from_slice(format!("X-Received-MailFrom: {}\r\n", message.mail_from).as_bytes());
        for rcpt in &message.recipients {
            content.extend_from_slice(format!("X-Received-RcptTo: {}\r\n", rcpt).as_bytes());
        }
        content.extend_from_slice(&message.body);

        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write message: {:?}", path))?;
        Ok(path)
    }
}

#[async_trait]
impl MessageHandler for SpoolWriter {
    async fn handle(&self, message: Message) -> Option<String> {
        match self.write(&message).await {
            Ok(path) => {
                eprintln!("[INFO] Message from {} saved to {:?}", message.peer, path);
                None
            }
            Err(e) => {
                eprintln!("[ERROR] {:#}", e);
                Some("451 Requested action aborted: local error in processing".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message {
            peer: "192.0.2.7:4242".parse().unwrap(),
            mail_from: "sender@example.org".to_string(),
            recipients: vec!["a@example.com".to_string(), "b@example.com".to_string()],
            body: b"Subject: test\n\nhello".to_vec(),
            helo: Some("client.example.org".to_string()),
            auth_user: Some("alice".to_string()),
        }
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let handler = |message: Message| {
            if message.recipients.is_empty() {
                Some("550 nobody".to_string())
            } else {
                None
            }
        };
        assert_eq!(handler.handle(message()).await, None);

        let mut message = message();
        message.recipients.clear();
        assert_eq!(handler.handle(message).await.as_deref(), Some("550 nobody"));
    }

    #[tokio::test]
    async fn test_spool_writer() {
        let dir = std::env::temp_dir().join(format!("mailreceiver-spool-{}", std::process::id()));
        let spool = SpoolWriter::new(dir.clone()).unwrap();

        let path = spool.write(&message()).await.unwrap();
        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(saved.starts_with("X-Received-Peer: 192.0.2.7:4242\r\n"));
        assert!(saved.contains("X-Received-Auth: alice\r\n"));
        assert!(saved.contains("X-Received-RcptTo: b@example.com\r\n"));
        assert!(saved.ends_with("Subject: test\n\nhello"));

        assert_eq!(spool.handle(message()).await, None);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_spool_write_failure() {
        let dir = std::env::temp_dir().join(format!("mailreceiver-gone-{}", std::process::id()));
        let spool = SpoolWriter::new(dir.clone()).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert!(spool.write(&message()).await.is_err());
        assert_eq!(
            spool.handle(message()).await.as_deref(),
            Some("451 Requested action aborted: local error in processing")
        );
    }
}
