use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::auth::CredentialValidator;
use crate::codec;
use crate::commands::Command;
use crate::config::Settings;
use crate::delivery::Message;
use crate::limits::{
    CommandLimits, Line, MessageBuffer, COMMAND_SIZE_LIMIT, DATA_SIZE_DEFAULT,
    SIZE_EXTENSION_ROOM, SMTPUTF8_EXTENSION_ROOM,
};

/// Where an AUTH exchange stands while waiting for the next client line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// `AUTH PLAIN` sent without an initial response
    PlainResponse,
    /// `AUTH LOGIN`, username not given yet
    Username,
    /// `AUTH LOGIN`, username known
    Password { username: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Command,
    Auth(AuthStep),
    Data,
    /// Final reply queued, no further input is interpreted
    Closing,
}

/// What the connection has to do once the queued replies are written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    /// Upgrade the transport, then call `tls_established` or `tls_failed`
    StartTls,
    /// Close after the replies are flushed
    Close,
    /// Hand `take_message` to the message handler, then call `delivered`
    Deliver,
}

/// Things worth a transcript entry that the replies alone don't tell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Authenticated(String),
    AuthFailed(Option<String>),
    Delivered {
        mail_from: String,
        recipients: usize,
        size: usize,
        reply: Option<String>,
    },
    TooMuchData(usize),
}

/// SMTP protocol engine for one connection.
///
/// It never touches the socket: every received line goes through
/// `handle_line`, replies are collected with `take_replies` and the
/// returned `Action` tells the connection what to do with the transport
/// or with a completed message.
pub struct Session {
    peer: SocketAddr,
    settings: Arc<Settings>,
    validator: Option<Arc<dyn CredentialValidator>>,
    starttls: bool,
    state: State,
    tls_active: bool,
    extended: bool,
    greeting: Option<String>,
    auth_user: Option<String>,
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
    message: MessageBuffer,
    outgoing: Option<Message>,
    /// Sender, recipient count and size of the message being handled
    in_flight: Option<(String, usize, usize)>,
    limits: CommandLimits,
    replies: Vec<String>,
    events: Vec<Event>,
}

impl Session {
    /// `starttls` says whether the server can upgrade this connection at
    /// all; `tls_active` is set for connections that start encrypted.
    pub fn new(
        peer: SocketAddr,
        settings: Arc<Settings>,
        validator: Option<Arc<dyn CredentialValidator>>,
        starttls: bool,
        tls_active: bool,
    ) -> Self {
        let message = MessageBuffer::new(settings.data_size_limit);
        Self {
            peer,
            settings,
            validator,
            starttls,
            state: State::Command,
            tls_active,
            extended: false,
            greeting: None,
            auth_user: None,
            mail_from: None,
            rcpt_to: Vec::new(),
            message,
            outgoing: None,
            in_flight: None,
            limits: CommandLimits::default(),
            replies: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn banner(&self) -> String {
        format!(
            "220 {} {} {}",
            self.settings.hostname,
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        )
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_user.is_some()
    }

    pub fn auth_user(&self) -> Option<&str> {
        self.auth_user.as_deref()
    }

    pub fn greeting(&self) -> Option<&str> {
        self.greeting.as_deref()
    }

    pub fn is_tls(&self) -> bool {
        self.tls_active
    }

    pub fn mail_from(&self) -> Option<&str> {
        self.mail_from.as_deref()
    }

    pub fn recipients(&self) -> &[String] {
        &self.rcpt_to
    }

    /// How many bytes of the next line are worth keeping
    pub fn read_limit(&self) -> usize {
        match self.state {
            State::Data => self.settings.data_size_limit.unwrap_or(DATA_SIZE_DEFAULT),
            _ => self.limits.max(),
        }
    }

    pub fn take_replies(&mut self) -> Vec<String> {
        std::mem::take(&mut self.replies)
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// The message completed by the last `.`, once per `Action::Deliver`
    pub fn take_message(&mut self) -> Option<Message> {
        self.outgoing.take()
    }

    /// Outcome of the message handler; `None` accepts with `250 OK`.
    /// Ends the DATA phase and the mail transaction.
    pub fn delivered(&mut self, reply: Option<String>) {
        if let Some((mail_from, recipients, size)) = self.in_flight.take() {
            self.events.push(Event::Delivered {
                mail_from,
                recipients,
                size,
                reply: reply.clone(),
            });
        }

        self.outgoing = None;
        self.reset_transaction();
        self.state = State::Command;
        self.push(reply.unwrap_or_else(|| "250 OK".to_string()));
    }

    /// Text of a received line fit for the transcript, with credentials
    /// masked
    pub fn redact(&self, line: &Line) -> String {
        if let State::Auth(_) = self.state {
            return "<credentials hidden>".to_string();
        }

        let text = String::from_utf8_lossy(&line.bytes);
        if self.state != State::Data {
            let is_auth = text
                .get(..4)
                .map_or(false, |token| token.eq_ignore_ascii_case("AUTH"));
            if is_auth {
                let mut parts = text.split_whitespace();
                let command = parts.next().unwrap_or("");
                return match (parts.next(), parts.next()) {
                    (Some(mechanism), Some(_)) => format!("{} {} <credentials hidden>", command, mechanism),
                    _ => text.to_string(),
                };
            }
        }
        text.into_owned()
    }

    pub fn handle_line(&mut self, line: &Line) -> Action {
        match self.state {
            State::Closing => Action::Close,
            State::Data => self.data_line(line),
            State::Command | State::Auth(_) => self.command_line(line),
        }
    }

    /// The transport is encrypted now. Everything negotiated in plaintext
    /// is forgotten, including authentication.
    pub fn tls_established(&mut self) {
        self.tls_active = true;
        self.state = State::Command;
        self.extended = false;
        self.greeting = None;
        self.auth_user = None;
        self.limits = CommandLimits::default();
        self.reset_transaction();
    }

    /// The handshake failed, the session continues on the old transport
    pub fn tls_failed(&mut self) {
        self.push("454 TLS not available due to temporary reason");
    }

    fn push(&mut self, reply: impl Into<String>) {
        self.replies.push(reply.into());
    }

    fn reset_transaction(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
        self.message.clear();
    }

    fn command_line(&mut self, line: &Line) -> Action {
        if line.len == 0 {
            self.push("500 Error: bad syntax");
            return Action::Continue;
        }

        let text = String::from_utf8_lossy(&line.bytes);
        let (token, arg) = if let State::Auth(_) = self.state {
            ("AUTH".to_string(), Some(text.trim()))
        } else {
            match text.split_once(' ') {
                Some((token, arg)) => (token.to_ascii_uppercase(), Some(arg.trim())),
                None => (text.to_ascii_uppercase(), None),
            }
        };
        let arg = arg.filter(|arg| !arg.is_empty());

        let max = if self.extended {
            self.limits.get(&token)
        } else {
            COMMAND_SIZE_LIMIT
        };
        if line.is_truncated() || line.len > max {
            self.push("500 Error: line too long");
            return Action::Continue;
        }
        if std::str::from_utf8(&line.bytes).is_err() {
            self.push("500 Error: bad syntax");
            return Action::Continue;
        }

        let command = match Command::lookup(&token) {
            Some(Command::StartTls) if !self.starttls => None,
            other => other,
        };
        let command = match command {
            Some(command) => command,
            None => {
                self.push(format!("500 Error: command \"{}\" not recognized", token));
                return Action::Continue;
            }
        };

        if !command.allowed_before_auth() && self.validator.is_some() && !self.is_authenticated() {
            self.push("530 Authentication required");
            return Action::Continue;
        }

        self.dispatch(command, arg)
    }

    fn dispatch(&mut self, command: Command, arg: Option<&str>) -> Action {
        match command {
            Command::Helo | Command::Ehlo => self.smtp_helo(command, arg),
            Command::Auth => self.smtp_auth(arg),
            Command::StartTls => self.smtp_starttls(arg),
            Command::Mail => self.smtp_mail(arg),
            Command::Rcpt => self.smtp_rcpt(arg),
            Command::Data => self.smtp_data(arg),
            Command::Rset => self.smtp_rset(arg),
            Command::Noop => self.smtp_noop(arg),
            Command::Quit => self.smtp_quit(),
            Command::Vrfy => self.smtp_vrfy(arg),
            Command::Expn => self.smtp_expn(),
            Command::Help => self.smtp_help(arg),
        }
    }

    fn smtp_helo(&mut self, command: Command, arg: Option<&str>) -> Action {
        let extended = command == Command::Ehlo;
        let hostname = match arg {
            Some(hostname) => hostname,
            None => {
                self.push(format!("501 Syntax: {} hostname", command.name()));
                return Action::Continue;
            }
        };
        if self.greeting.is_some() {
            self.push("503 Duplicate HELO/EHLO");
            return Action::Continue;
        }

        self.reset_transaction();
        self.greeting = Some(hostname.to_string());

        let fqdn = self.settings.hostname.clone();
        if !extended {
            self.push(format!("250 {}", fqdn));
            return Action::Continue;
        }

        self.extended = true;
        self.push(format!("250-{}", fqdn));
        self.push("250-AUTH LOGIN PLAIN");
        if self.starttls && !self.tls_active {
            self.push("250-STARTTLS");
        }
        if let Some(limit) = self.settings.data_size_limit {
            self.push(format!("250-SIZE {}", limit));
            self.limits.grow("MAIL", SIZE_EXTENSION_ROOM);
        }
        if !self.settings.decode_data {
            self.push("250-8BITMIME");
        }
        if self.settings.enable_smtputf8 {
            self.push("250-SMTPUTF8");
            self.limits.grow("MAIL", SMTPUTF8_EXTENSION_ROOM);
        }
        self.push("250 HELP");
        Action::Continue
    }

    fn smtp_auth(&mut self, arg: Option<&str>) -> Action {
        if self.validator.is_none() {
            self.push("502 Error: authentication not enabled");
            return Action::Continue;
        }

        if let State::Auth(step) = std::mem::replace(&mut self.state, State::Command) {
            return self.auth_continue(step, arg.unwrap_or(""));
        }

        let arg = match arg {
            Some(arg) => arg,
            None => {
                self.push("501 Syntax: AUTH <mechanism>");
                return Action::Continue;
            }
        };
        let mut parts = arg.split_whitespace();
        let mechanism = parts.next().unwrap_or("").to_ascii_uppercase();
        let initial = parts.next();

        match (mechanism.as_str(), initial) {
            ("PLAIN", Some(response)) => self.auth_plain(response),
            ("PLAIN", None) => {
                self.state = State::Auth(AuthStep::PlainResponse);
                self.push("334 ");
                Action::Continue
            }
            // Some clients send the username along with the mechanism
            ("LOGIN", Some(username)) => self.auth_username(username),
            ("LOGIN", None) => {
                self.state = State::Auth(AuthStep::Username);
                self.push(format!("334 {}", codec::encode("Username")));
                Action::Continue
            }
            _ => {
                self.push("504 Unrecognized authentication type");
                Action::Continue
            }
        }
    }

    fn auth_continue(&mut self, step: AuthStep, response: &str) -> Action {
        if response == "*" {
            self.push("501 Authentication cancelled");
            return Action::Continue;
        }

        match step {
            AuthStep::PlainResponse => self.auth_plain(response),
            AuthStep::Username => self.auth_username(response),
            AuthStep::Password { username } => match codec::decode(response) {
                Ok(password) => self.check_credentials(username, &password),
                Err(_) => self.auth_failed(Some(username)),
            },
        }
    }

    fn auth_username(&mut self, encoded: &str) -> Action {
        match codec::decode(encoded) {
            Ok(username) => {
                self.state = State::Auth(AuthStep::Password { username });
                self.push(format!("334 {}", codec::encode("Password")));
                Action::Continue
            }
            Err(_) => self.auth_failed(None),
        }
    }

    /// `[authzid] NUL authcid NUL password`
    fn auth_plain(&mut self, encoded: &str) -> Action {
        let decoded = match codec::decode(encoded) {
            Ok(decoded) => decoded,
            Err(_) => return self.auth_failed(None),
        };

        let mut bits = decoded.splitn(3, '\0');
        let _authzid = bits.next();
        match (bits.next(), bits.next()) {
            (Some(username), Some(password)) => {
                let username = username.to_string();
                self.check_credentials(username, password)
            }
            _ => self.auth_failed(None),
        }
    }

    fn check_credentials(&mut self, username: String, password: &str) -> Action {
        let valid = self
            .validator
            .as_ref()
            .map_or(false, |validator| validator.validate(&username, password));
        if !valid {
            return self.auth_failed(Some(username));
        }

        self.events.push(Event::Authenticated(username.clone()));
        self.auth_user = Some(username);
        self.push("235 Authentication successful.");
        Action::Continue
    }

    fn auth_failed(&mut self, username: Option<String>) -> Action {
        self.events.push(Event::AuthFailed(username));
        self.state = State::Closing;
        self.push("454 Temporary authentication failure.");
        Action::Close
    }

    fn smtp_starttls(&mut self, arg: Option<&str>) -> Action {
        if arg.is_some() {
            self.push("501 Syntax error (no parameters allowed)");
            return Action::Continue;
        }
        if !self.starttls || self.tls_active {
            self.push("454 TLS not available due to temporary reason");
            return Action::Continue;
        }
        self.push("220 Ready to start TLS");
        Action::StartTls
    }

    fn smtp_mail(&mut self, arg: Option<&str>) -> Action {
        if self.greeting.is_none() {
            self.push("503 Error: send HELO first");
            return Action::Continue;
        }
        let syntax_error = format!("501 Syntax: {}", Command::Mail.syntax(self.extended));

        let path = arg.and_then(|arg| strip_keyword("FROM:", arg)).and_then(parse_path);
        let (address, params) = match path {
            Some(path) => path,
            None => {
                self.push(syntax_error);
                return Action::Continue;
            }
        };
        if !self.extended && !params.is_empty() {
            self.push(syntax_error);
            return Action::Continue;
        }
        if self.mail_from.is_some() {
            self.push("503 Error: nested MAIL command");
            return Action::Continue;
        }

        let mut params = match parse_params(params) {
            Some(params) => params,
            None => {
                self.push(syntax_error);
                return Action::Continue;
            }
        };

        if !self.settings.decode_data {
            match params.remove("BODY") {
                None => {}
                Some(Some(body)) if body == "7BIT" || body == "8BITMIME" => {}
                Some(_) => {
                    self.push("501 Error: BODY can only be one of 7BIT, 8BITMIME");
                    return Action::Continue;
                }
            }
        }
        if self.settings.enable_smtputf8 {
            if let Some(Some(_)) = params.remove("SMTPUTF8") {
                self.push("501 Error: SMTPUTF8 takes no arguments");
                return Action::Continue;
            }
        }
        match params.remove("SIZE") {
            None => {}
            Some(Some(size)) if !size.is_empty() && size.bytes().all(|b| b.is_ascii_digit()) => {
                let too_big = match (size.parse::<usize>(), self.settings.data_size_limit) {
                    (Ok(size), Some(limit)) => size > limit,
                    (Err(_), Some(_)) => true,
                    (_, None) => false,
                };
                if too_big {
                    self.push("552 Error: message size exceeds fixed maximum message size");
                    return Action::Continue;
                }
            }
            Some(_) => {
                self.push(syntax_error);
                return Action::Continue;
            }
        }
        if !params.is_empty() {
            self.push("555 MAIL FROM parameters not recognized or not implemented");
            return Action::Continue;
        }

        self.mail_from = Some(address);
        self.push("250 OK");
        Action::Continue
    }

    fn smtp_rcpt(&mut self, arg: Option<&str>) -> Action {
        if self.greeting.is_none() {
            self.push("503 Error: send HELO first");
            return Action::Continue;
        }
        if self.mail_from.is_none() {
            self.push("503 Error: need MAIL command");
            return Action::Continue;
        }
        let syntax_error = format!("501 Syntax: {}", Command::Rcpt.syntax(self.extended));

        let path = arg.and_then(|arg| strip_keyword("TO:", arg)).and_then(parse_path);
        let (address, params) = match path {
            Some((address, params)) if address != "<>" => (address, params),
            _ => {
                self.push(syntax_error);
                return Action::Continue;
            }
        };
        if !self.extended && !params.is_empty() {
            self.push(syntax_error);
            return Action::Continue;
        }
        match parse_params(params) {
            None => {
                self.push(syntax_error);
                return Action::Continue;
            }
            Some(params) if !params.is_empty() => {
                self.push("555 RCPT TO parameters not recognized or not implemented");
                return Action::Continue;
            }
            Some(_) => {}
        }

        self.rcpt_to.push(address);
        self.push("250 OK");
        Action::Continue
    }

    fn smtp_data(&mut self, arg: Option<&str>) -> Action {
        if self.greeting.is_none() {
            self.push("503 Error: send HELO first");
            return Action::Continue;
        }
        if self.rcpt_to.is_empty() {
            self.push("503 Error: need RCPT command");
            return Action::Continue;
        }
        if arg.is_some() {
            self.push("501 Syntax: DATA");
            return Action::Continue;
        }
        self.message.clear();
        self.state = State::Data;
        self.push("354 End data with <CR><LF>.<CR><LF>");
        Action::Continue
    }

    fn smtp_rset(&mut self, arg: Option<&str>) -> Action {
        if arg.is_some() {
            self.push("501 Syntax: RSET");
            return Action::Continue;
        }
        self.reset_transaction();
        self.push("250 OK");
        Action::Continue
    }

    fn smtp_noop(&mut self, arg: Option<&str>) -> Action {
        if arg.is_some() {
            self.push("501 Syntax: NOOP");
        } else {
            self.push("250 OK");
        }
        Action::Continue
    }

    fn smtp_quit(&mut self) -> Action {
        self.state = State::Closing;
        self.push("221 Bye");
        Action::Close
    }

    fn smtp_vrfy(&mut self, arg: Option<&str>) -> Action {
        if arg.is_some() {
            self.push("252 Cannot VRFY user, but will accept message and attempt delivery");
        } else {
            self.push("501 Syntax: VRFY <address>");
        }
        Action::Continue
    }

    fn smtp_expn(&mut self) -> Action {
        self.push("502 EXPN not implemented");
        Action::Continue
    }

    fn smtp_help(&mut self, arg: Option<&str>) -> Action {
        let reply = match arg {
            None => format!("250 Supported commands: {}", SUPPORTED),
            Some(arg) => match Command::lookup(&arg.to_ascii_uppercase()) {
                Some(command) => format!("250 Syntax: {}", command.syntax(self.extended)),
                None => format!("501 Supported commands: {}", SUPPORTED),
            },
        };
        self.push(reply);
        Action::Continue
    }

    fn data_line(&mut self, line: &Line) -> Action {
        if line.len != 1 || line.bytes != b"." {
            self.message.push_line(line);
            return Action::Continue;
        }

        // The data phase is kept after an oversized message, only the
        // counter starts over.
        if self.message.exceeded() {
            self.events.push(Event::TooMuchData(self.message.num_bytes()));
            self.message.clear();
            self.push("552 Error: Too much mail data");
            return Action::Continue;
        }

        let mut body = self.message.take();
        if self.settings.decode_data {
            body = String::from_utf8_lossy(&body).into_owned().into_bytes();
        }
        let size = body.len();
        let message = Message {
            peer: self.peer,
            mail_from: self.mail_from.take().unwrap_or_default(),
            recipients: std::mem::take(&mut self.rcpt_to),
            body,
            helo: self.greeting.clone(),
            auth_user: self.auth_user.clone(),
        };
        self.in_flight = Some((message.mail_from.clone(), message.recipients.len(), size));
        self.outgoing = Some(message);
        Action::Deliver
    }
}

const SUPPORTED: &str = "EHLO HELO AUTH STARTTLS MAIL RCPT DATA RSET NOOP QUIT VRFY";

fn strip_keyword<'a>(keyword: &str, arg: &'a str) -> Option<&'a str> {
    let head = arg.get(..keyword.len())?;
    if head.eq_ignore_ascii_case(keyword) {
        Some(arg[keyword.len()..].trim())
    } else {
        None
    }
}

/// Splits `<address> params` (or a bare address) into its parts. The null
/// path is returned as `<>`.
fn parse_path(arg: &str) -> Option<(String, &str)> {
    let arg = arg.trim_start();
    if let Some(rest) = arg.strip_prefix('<') {
        let end = rest.find('>')?;
        let address = &rest[..end];
        let address = if address.is_empty() { "<>" } else { address };
        return Some((address.to_string(), rest[end + 1..].trim()));
    }

    let mut parts = arg.splitn(2, char::is_whitespace);
    let address = parts.next().filter(|address| !address.is_empty())?;
    Some((address.to_string(), parts.next().unwrap_or("").trim()))
}

/// `KEY[=VALUE]` parameters, upper-cased. `None` when one is malformed.
fn parse_params(params: &str) -> Option<HashMap<String, Option<String>>> {
    let mut result = HashMap::new();
    for param in params.split_whitespace() {
        let param = param.to_ascii_uppercase();
        let (key, value) = match param.split_once('=') {
            Some((_, "")) => return None,
            Some((key, value)) => (key.to_string(), Some(value.to_string())),
            None => (param.clone(), None),
        };
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        result.insert(key, value);
    }
    Some(result)
}
