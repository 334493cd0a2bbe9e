//! SMTP session and transaction tracking
//!
//! A session is the ordered record of one SMTP conversation: the
//! statements issued by the client (commands and message content), the
//! responses sent by the server, and the mail transactions they form.
//! A transaction opens with MAIL and closes with the termination
//! sequence or RSET, acknowledged by a server response.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tcp::TcpSession;

use super::command::{SmtpCommand, SmtpCommandKind, SmtpResponse};
use super::message::ImfMessage;

#[derive(Debug, Error)]
pub enum SmtpError {
    #[error("cannot build an SMTP session on an empty TCP session")]
    EmptyTcpSession,
    #[error("refusing to record an empty session statement")]
    EmptyStatement,
}

/// A statement issued by the client, in arrival order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientStatement {
    Command(SmtpCommand),
    Message(ImfMessage),
}

impl ClientStatement {
    /// The text signature patterns are matched against.
    pub fn text(&self) -> &str {
        match self {
            ClientStatement::Command(cmd) => &cmd.raw,
            ClientStatement::Message(msg) => msg.text(),
        }
    }

    pub fn as_command(&self) -> Option<&SmtpCommand> {
        match self {
            ClientStatement::Command(cmd) => Some(cmd),
            ClientStatement::Message(_) => None,
        }
    }

    pub fn as_message(&self) -> Option<&ImfMessage> {
        match self {
            ClientStatement::Message(msg) => Some(msg),
            ClientStatement::Command(_) => None,
        }
    }
}

/// One mail transaction, as index ranges into the command and response
/// lists.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Transaction {
    pub first_cmd: Option<usize>,
    pub last_cmd: Option<usize>,
    pub first_res: Option<usize>,
    pub last_res: Option<usize>,
}

impl Transaction {
    fn contains_command(&self, index: usize) -> bool {
        match (self.first_cmd, self.last_cmd) {
            (Some(first), Some(last)) => index >= first && index <= last,
            _ => false,
        }
    }

    fn contains_response(&self, index: usize) -> bool {
        match (self.first_res, self.last_res) {
            (Some(first), Some(last)) => index >= first && index <= last,
            _ => false,
        }
    }

    /// The client has closed the transaction (message sent or RSET).
    fn is_cmd_closed(&self) -> bool {
        self.first_cmd.is_some() && self.last_cmd.is_some()
    }

    /// The server has acknowledged the close.
    fn is_res_closed(&self) -> bool {
        self.first_res.is_some() && self.last_res.is_some()
    }
}

/// The reconstructed SMTP conversation of one TCP session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpSession {
    client: (IpAddr, u16),
    server: (IpAddr, u16),
    commands: Vec<ClientStatement>,
    responses: Vec<SmtpResponse>,
    transactions: Vec<Transaction>,
    #[serde(skip)]
    current: Option<Transaction>,
    tcp_has_syn: bool,
    tcp_has_fin: bool,
    tcp_has_rst: bool,
    tcp_packet_count: usize,
}

impl SmtpSession {
    /// Capture the identity and state of the underlying TCP session.
    pub fn from_tcp(tcp: &TcpSession) -> Result<Self, SmtpError> {
        let (client, server) = match (tcp.client(), tcp.server()) {
            (Some(c), Some(s)) => ((c.addr, c.port), (s.addr, s.port)),
            _ => return Err(SmtpError::EmptyTcpSession),
        };
        Ok(Self::new(
            client,
            server,
            (tcp.has_syn(), tcp.has_fin(), tcp.has_rst()),
            tcp.len(),
        ))
    }

    pub(crate) fn new(
        client: (IpAddr, u16),
        server: (IpAddr, u16),
        tcp_flags: (bool, bool, bool),
        tcp_packet_count: usize,
    ) -> Self {
        Self {
            client,
            server,
            commands: Vec::new(),
            responses: Vec::new(),
            transactions: Vec::new(),
            current: None,
            tcp_has_syn: tcp_flags.0,
            tcp_has_fin: tcp_flags.1,
            tcp_has_rst: tcp_flags.2,
            tcp_packet_count,
        }
    }

    pub fn client(&self) -> (IpAddr, u16) {
        self.client
    }

    pub fn server(&self) -> (IpAddr, u16) {
        self.server
    }

    pub fn commands(&self) -> &[ClientStatement] {
        &self.commands
    }

    pub fn responses(&self) -> &[SmtpResponse] {
        &self.responses
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.responses.is_empty()
    }

    /// Number of SMTP payloads recorded on the session.
    pub fn len(&self) -> usize {
        self.commands.len() + self.responses.len()
    }

    pub fn tcp_has_syn(&self) -> bool {
        self.tcp_has_syn
    }

    pub fn tcp_has_fin(&self) -> bool {
        self.tcp_has_fin
    }

    pub fn tcp_has_rst(&self) -> bool {
        self.tcp_has_rst
    }

    pub fn tcp_packet_count(&self) -> usize {
        self.tcp_packet_count
    }

    /// The transaction covering the given command index, if any.
    pub fn transaction_of_command(&self, index: usize) -> Option<usize> {
        self.transactions
            .iter()
            .position(|t| t.contains_command(index))
    }

    /// The transaction covering the given response index, if any.
    pub fn transaction_of_response(&self, index: usize) -> Option<usize> {
        self.transactions
            .iter()
            .position(|t| t.contains_response(index))
    }

    /// Record a client command and apply its effect on the open
    /// transaction: MAIL opens one, RSET closes the command side,
    /// HELO/QUIT/extension commands abandon it.
    pub fn add_command(&mut self, command: SmtpCommand) -> Result<(), SmtpError> {
        if command.is_empty() {
            return Err(SmtpError::EmptyStatement);
        }
        match command.kind {
            SmtpCommandKind::Mail => {
                self.current = Some(Transaction {
                    first_cmd: Some(self.commands.len()),
                    ..Default::default()
                });
            }
            SmtpCommandKind::Rset => {
                if let Some(current) = self.current.as_mut() {
                    current.last_cmd = Some(self.commands.len());
                }
            }
            SmtpCommandKind::Helo | SmtpCommandKind::Quit | SmtpCommandKind::Extension => {
                self.current = None;
            }
            _ => {}
        }
        self.commands.push(ClientStatement::Command(command));
        Ok(())
    }

    /// Record message content; it closes the command side of the open
    /// transaction the same way RSET does.
    pub fn add_message(&mut self, message: ImfMessage) -> Result<(), SmtpError> {
        if message.is_empty() {
            return Err(SmtpError::EmptyStatement);
        }
        if let Some(current) = self.current.as_mut() {
            current.last_cmd = Some(self.commands.len());
        }
        self.commands.push(ClientStatement::Message(message));
        Ok(())
    }

    /// Mutable access to message content already recorded, so header
    /// spans found later can be attached to it.
    pub(crate) fn message_at_mut(&mut self, index: usize) -> Option<&mut ImfMessage> {
        match self.commands.get_mut(index) {
            Some(ClientStatement::Message(msg)) => Some(msg),
            _ => None,
        }
    }

    /// Record a server response. The first response inside an open
    /// transaction marks its response start; once the command side has
    /// closed, the next response finalizes the transaction.
    pub fn add_response(&mut self, response: SmtpResponse) {
        if let Some(current) = self.current.as_mut() {
            if current.first_res.is_none() {
                current.first_res = Some(self.responses.len());
            }
            if current.is_cmd_closed() && !current.is_res_closed() {
                current.last_res = Some(self.responses.len());
                let finished = *current;
                self.transactions.push(finished);
                self.current = None;
            }
        }
        self.responses.push(response);
    }
}

impl std::fmt::Display for SmtpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(C){}:{} --> (S){}:{} [{} cmds, {} resps, {} trans]",
            self.client.0,
            self.client.1,
            self.server.0,
            self.server.1,
            self.commands.len(),
            self.responses.len(),
            self.transactions.len(),
        )
    }
}
