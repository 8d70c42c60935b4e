//! Minimal SMTP receiver: AUTH PLAIN/LOGIN against a credential table,
//! opportunistic STARTTLS, and hand-over of completed messages to a
//! handler.

pub mod auth;
pub mod codec;
pub mod commands;
pub mod config;
pub mod delivery;
pub mod limits;
pub mod server;
pub mod session;
pub mod tls;
pub mod transport;
pub mod utils;

pub use auth::{CredentialValidator, PasswordFileValidator};
pub use config::Settings;
pub use delivery::{Message, MessageHandler, SpoolWriter};
pub use server::SmtpServer;
pub use session::Session;
