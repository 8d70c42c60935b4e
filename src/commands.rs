/// Commands understood by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Helo,
    Ehlo,
    Auth,
    StartTls,
    Mail,
    Rcpt,
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy,
    Expn,
    Help,
}

const TABLE: &[(&str, Command)] = &[
    ("HELO", Command::Helo),
    ("EHLO", Command::Ehlo),
    ("AUTH", Command::Auth),
    ("STARTTLS", Command::StartTls),
    ("MAIL", Command::Mail),
    ("RCPT", Command::Rcpt),
    ("DATA", Command::Data),
    ("RSET", Command::Rset),
    ("NOOP", Command::Noop),
    ("QUIT", Command::Quit),
    ("VRFY", Command::Vrfy),
    ("EXPN", Command::Expn),
    ("HELP", Command::Help),
];

impl Command {
    /// Looks up an already upper-cased command token
    pub fn lookup(token: &str) -> Option<Command> {
        TABLE
            .iter()
            .find(|(name, _)| *name == token)
            .map(|(_, command)| *command)
    }

    pub fn name(self) -> &'static str {
        TABLE
            .iter()
            .find(|(_, command)| *command == self)
            .map(|(name, _)| *name)
            .unwrap_or("")
    }

    /// Whether the command may run before AUTH succeeded
    pub fn allowed_before_auth(self) -> bool {
        matches!(
            self,
            Command::Auth
                | Command::Ehlo
                | Command::Helo
                | Command::Noop
                | Command::Rset
                | Command::StartTls
                | Command::Quit
        )
    }

    /// Usage line returned by `HELP <command>`
    pub fn syntax(self, extended: bool) -> &'static str {
        match (self, extended) {
            (Command::Helo, _) => "HELO hostname",
            (Command::Ehlo, _) => "EHLO hostname",
            (Command::Auth, _) => "AUTH <mechanism> [initial-response]",
            (Command::StartTls, _) => "STARTTLS",
            (Command::Mail, false) => "MAIL FROM:<address>",
            (Command::Mail, true) => "MAIL FROM:<address> [SP <mail-parameters>]",
            (Command::Rcpt, false) => "RCPT TO: <address>",
            (Command::Rcpt, true) => "RCPT TO: <address> [SP <mail-parameters>]",
            (Command::Data, _) => "DATA",
            (Command::Rset, _) => "RSET",
            (Command::Noop, _) => "NOOP",
            (Command::Quit, _) => "QUIT",
            (Command::Vrfy, _) => "VRFY <address>",
            (Command::Expn, _) => "EXPN <address>",
            (Command::Help, _) => "HELP [command]",
        }
    }
}
