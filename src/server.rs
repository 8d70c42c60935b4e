use crate::auth::CredentialValidator;
use crate::config::Settings;
use crate::delivery::MessageHandler;
use crate::session::{Action, Event, Session};
use crate::transport::{Transport, UpgradeError, HANDSHAKE_TIMEOUT};
use crate::utils::Logger;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tokio_rustls::TlsAcceptor;

/// Port on which connections start with a TLS handshake
pub const SMTPS_PORT: u16 = 465;

pub struct SmtpServer {
    settings: Arc<Settings>,
    logger: Arc<Logger>,
    validator: Option<Arc<dyn CredentialValidator>>,
    handler: Arc<dyn MessageHandler>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl SmtpServer {
    /// Without a validator every client may send mail; without an
    /// acceptor STARTTLS is not offered.
    pub fn new(
        settings: Settings,
        logger: Logger,
        validator: Option<Arc<dyn CredentialValidator>>,
        handler: Arc<dyn MessageHandler>,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Result<Self> {
        settings.validate()?;
        if settings.starttls && tls_acceptor.is_none() {
            eprintln!("[WARNING] STARTTLS requested but no certificate configured");
        }

        Ok(Self {
            settings: Arc::new(settings),
            logger: Arc::new(logger),
            validator,
            handler,
            tls_acceptor,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn starttls_available(&self) -> bool {
        self.settings.starttls && self.tls_acceptor.is_some()
    }

    async fn log_event(&self, peer: &SocketAddr, event: Event) {
        match event {
            Event::Authenticated(user) => {
                self.logger.log(peer, &format!("Authenticated as '{}'", user)).await;
            }
            Event::AuthFailed(Some(user)) => {
                self.logger.log(peer, &format!("auth validation failed for '{}'", user)).await;
            }
            Event::AuthFailed(None) => {
                self.logger.log(peer, "auth validation failed (malformed credentials)").await;
            }
            Event::Delivered {
                mail_from,
                recipients,
                size,
                reply,
            } => {
                let outcome = reply.unwrap_or_else(|| "accepted".to_string());
                let summary = format!(
                    "Message from <{}> to {} recipient(s), {} bytes: {}",
                    mail_from, recipients, size, outcome
                );
                self.logger.log(peer, &summary).await;

                let details = format!("From: {}\nRecipients: {}\nSize: {}", mail_from, recipients, size);
                self.logger.log_verbose(peer, "MESSAGE", &details).await;
            }
            Event::TooMuchData(size) => {
                let line = format!("Message rejected, {} bytes over the size limit", size);
                self.logger.log(peer, &line).await;
            }
        }
    }

    /// Logs pending events and writes every queued reply
    async fn flush_session(
        &self,
        transport: &mut Transport,
        session: &mut Session,
        peer: &SocketAddr,
    ) -> Result<()> {
        for event in session.take_events() {
            self.log_event(peer, event).await;
        }
        for reply in session.take_replies() {
            self.logger.log(peer, &format!("<< {}", reply)).await;
            transport.send(&reply).await?;
        }
        transport.flush().await?;
        Ok(())
    }

    async fn start_tls(
        &self,
        transport: Transport,
        session: &mut Session,
        peer: &SocketAddr,
    ) -> Result<Transport> {
        let acceptor = match &self.tls_acceptor {
            Some(acceptor) => acceptor,
            None => {
                let mut transport = transport;
                session.tls_failed();
                self.flush_session(&mut transport, session, peer).await?;
                return Ok(transport);
            }
        };

        if transport.pending() > 0 {
            self.logger
                .log(peer, &format!("Discarding {} bytes sent after STARTTLS", transport.pending()))
                .await;
        }
        self.logger.log(peer, "Starting STARTTLS handshake").await;

        match transport.upgrade(acceptor).await {
            Ok(transport) => {
                session.tls_established();
                self.logger.log(peer, "TLS session established").await;
                Ok(transport)
            }
            Err(UpgradeError::Handshake(e, mut transport)) => {
                self.logger.log(peer, &format!("TLS handshake failed: {}", e)).await;
                session.tls_failed();
                self.flush_session(&mut transport, session, peer).await?;
                Ok(transport)
            }
            Err(e @ UpgradeError::TimedOut) => Err(anyhow::anyhow!("{}", e)),
        }
    }

    /// Runs one session until QUIT, a failed AUTH or the peer hanging up
    pub async fn serve_connection(&self, mut transport: Transport, peer: SocketAddr) -> Result<()> {
        let mut session = Session::new(
            peer,
            self.settings.clone(),
            self.validator.clone(),
            self.starttls_available(),
            transport.is_tls(),
        );

        let banner = session.banner();
        self.logger.log(&peer, &format!("<< {}", banner)).await;
        transport.send(&banner).await?;
        transport.flush().await?;

        loop {
            let line = match transport.read_line(session.read_limit()).await? {
                Some(line) => line,
                None => break,
            };
            self.logger.log(&peer, &format!(">> {}", session.redact(&line))).await;

            let action = session.handle_line(&line);
            self.flush_session(&mut transport, &mut session, &peer).await?;

            match action {
                Action::Continue => {}
                Action::Close => break,
                Action::StartTls => {
                    transport = self.start_tls(transport, &mut session, &peer).await?;
                }
                Action::Deliver => {
                    if let Some(message) = session.take_message() {
                        let reply = self.handler.handle(message).await;
                        session.delivered(reply);
                    }
                    self.flush_session(&mut transport, &mut session, &peer).await?;
                }
            }
        }

        let _ = transport.shutdown().await;
        self.logger.log(&peer, "Connection closed").await;
        Ok(())
    }

    pub async fn handle_client(
        &self,
        stream: TcpStream,
        client_addr: SocketAddr,
        implicit_tls: bool,
    ) -> Result<()> {
        self.logger.log(&client_addr, "New connection").await;

        let transport = match (&self.tls_acceptor, implicit_tls) {
            (Some(acceptor), true) => {
                self.logger.log(&client_addr, "Starting TLS handshake (implicit)").await;
                match time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                    Ok(Ok(tls_stream)) => Transport::tls(Box::new(tls_stream)),
                    Ok(Err(e)) => {
                        self.logger.log(&client_addr, &format!("TLS handshake failed: {}", e)).await;
                        return Ok(());
                    }
                    Err(_) => {
                        self.logger.log(&client_addr, "TLS handshake timed out").await;
                        return Ok(());
                    }
                }
            }
            _ => Transport::plain(Box::new(stream)),
        };

        self.serve_connection(transport, client_addr).await
    }

    /// Accept loop for one listening socket
    pub async fn serve(self: Arc<Self>, listener: TcpListener, implicit_tls: bool) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, client_addr)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_client(stream, client_addr, implicit_tls).await {
                            this.logger.log(&client_addr, &format!("Error: {:#}", e)).await;
                        }
                    });
                }
                Err(e) => {
                    self.logger.log_server(&format!("Accept error: {}", e)).await;
                    time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Binds every port first, then serves them all
    pub async fn run(self: Arc<Self>, address: &str, ports: &[u16]) -> Result<()> {
        let mut handles = vec![];

        for &port in ports {
            let addr = format!("{}:{}", address, port);
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind to {}", addr))?;

            let implicit_tls = port == SMTPS_PORT && self.tls_acceptor.is_some();
            let mode = if implicit_tls { " (implicit TLS)" } else { "" };
            let auth = if self.validator.is_some() { " (with auth)" } else { "" };
            self.logger
                .log_server(&format!("mail server listening on {}{}{}", addr, mode, auth))
                .await;

            let this = self.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = this.serve(listener, implicit_tls).await {
                    eprintln!("[ERROR] Server on port {} failed: {}", port, e);
                }
            }));
        }

        for handle in handles {
            handle.await?;
        }

        Ok(())
    }
}
