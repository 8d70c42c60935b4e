use mailreceiver::utils::Logger;
use mailreceiver::{
    CredentialValidator, Message, MessageHandler, PasswordFileValidator, Settings, SmtpServer,
    SpoolWriter,
};

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "mailreceiver",
    about = "A minimal SMTP receiver with AUTH PLAIN/LOGIN and STARTTLS"
)]
pub struct Opt {
    /// Listening ports (can be specified multiple times, default: 25)
    #[structopt(short = "p", long = "port", default_value = "25", number_of_values = 1)]
    pub ports: Vec<u16>,

    /// Listening address (default: 0.0.0.0)
    #[structopt(short = "a", long = "address", default_value = "0.0.0.0")]
    pub address: String,

    /// Hostname announced in the banner and HELO/EHLO replies
    #[structopt(long = "hostname", default_value = "localhost")]
    pub hostname: String,

    /// Password file with one username:password per line
    #[structopt(long = "passwords", parse(from_os_str))]
    pub password_file: Option<PathBuf>,

    /// Space separated username:password pairs
    #[structopt(long = "credentials")]
    pub credentials: Option<String>,

    /// TLS certificate file (PEM)
    #[structopt(long = "tls-cert", parse(from_os_str))]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key file (PKCS#8 PEM)
    #[structopt(long = "tls-key", parse(from_os_str))]
    pub tls_key: Option<PathBuf>,

    /// Offer STARTTLS on plaintext connections
    #[structopt(long = "starttls")]
    pub starttls: bool,

    /// Maximum message size in bytes, 0 disables the limit
    #[structopt(long = "max-size", default_value = "33554432")]
    pub max_size: usize,

    /// Advertise and accept SMTPUTF8
    #[structopt(long = "smtputf8")]
    pub smtputf8: bool,

    /// Deliver message bodies as UTF-8 text, do not offer 8BITMIME
    #[structopt(long = "decode-data")]
    pub decode_data: bool,

    /// Log file path
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Directory to save received messages
    #[structopt(long = "data", parse(from_os_str))]
    pub data_dir: Option<PathBuf>,

    /// Verbose mode - display message details
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Enable raw display (not filtered) - DANGEROUS
    #[structopt(short = "r", long = "raw")]
    pub raw_display: bool,
}

impl Opt {
    fn settings(&self) -> Settings {
        Settings {
            hostname: self.hostname.clone(),
            data_size_limit: if self.max_size == 0 { None } else { Some(self.max_size) },
            enable_smtputf8: self.smtputf8,
            decode_data: self.decode_data,
            starttls: self.starttls,
        }
    }

    fn validator(&self) -> Result<Option<Arc<dyn CredentialValidator>>> {
        if self.password_file.is_none() && self.credentials.is_none() {
            return Ok(None);
        }

        let mut validator = PasswordFileValidator::default();
        if let Some(path) = &self.password_file {
            validator.merge(PasswordFileValidator::from_file(path)?);
        }
        if let Some(pairs) = &self.credentials {
            validator.merge(PasswordFileValidator::from_pairs(pairs));
        }
        if validator.is_empty() {
            eprintln!("[WARNING] Authentication enabled but no credentials loaded, nobody can send mail");
        }
        Ok(Some(Arc::new(validator)))
    }

    fn handler(&self) -> Result<Arc<dyn MessageHandler>> {
        match &self.data_dir {
            Some(dir) => Ok(Arc::new(SpoolWriter::new(dir.clone())?)),
            None => Ok(Arc::new(|message: Message| -> Option<String> {
                eprintln!(
                    "[INFO] Message from {} <{}> for {:?} ({} bytes) discarded, no --data directory",
                    message.peer,
                    message.mail_from,
                    message.recipients,
                    message.body.len()
                );
                None
            })),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::from_args();

    println!("==========================================");
    println!("mailreceiver v{}", env!("CARGO_PKG_VERSION"));
    println!("==========================================");
    eprintln!("[INFO] PID: {}", std::process::id());

    let tls_acceptor = match (&opt.tls_cert, &opt.tls_key) {
        (Some(cert), Some(key)) => {
            let acceptor = mailreceiver::tls::load_acceptor(cert, key)?;
            eprintln!("[INFO] TLS enabled with certificate: {:?}", cert);
            Some(acceptor)
        }
        (None, None) => None,
        _ => {
            eprintln!("[ERROR] --tls-cert and --tls-key must be given together");
            std::process::exit(1);
        }
    };

    let logger = Logger::new(opt.log_file.clone(), opt.raw_display, opt.verbose)?;
    let validator = opt.validator()?;
    let handler = opt.handler()?;
    let server = match SmtpServer::new(opt.settings(), logger, validator, handler, tls_acceptor) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            eprintln!("[ERROR] Failed to create server: {}", e);
            std::process::exit(1);
        }
    };

    let settings = server.settings();
    println!("[INFO] Ports: {:?}", opt.ports);
    println!("[INFO] Hostname: {}", settings.hostname);
    match settings.data_size_limit {
        Some(limit) => println!("[INFO] Maximum message size: {} bytes", limit),
        None => println!("[INFO] Maximum message size: unlimited"),
    }
    if opt.starttls {
        println!("[INFO] STARTTLS enabled");
    }
    println!("[INFO] Waiting for connections...");
    println!("[INFO] Press Ctrl+C to stop");

    server.run(&opt.address, &opt.ports).await?;

    Ok(())
}
