//! Interactive commands read from stdin by the two binaries.
//!
//! ```text
//! client: status | close | to <id> <text...>
//! server: status | show-all-conn | show-conn <id> | to <id> <text...>
//! ```
//!
//! Words are split on whitespace; the message text is re-joined with single
//! spaces.

use crate::types::{ConnId, CryptoTcpError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Status,
    Close,
    To { id: ConnId, text: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCommand {
    Status,
    ShowAllConn,
    ShowConn(ConnId),
    To { id: ConnId, text: String },
}

pub const CLIENT_USAGE: &str = "Usage:\n    status - show connection status\n    close - close the connection\n    to [id] [msg] - send msg to user, eg: to 1000 hello";

pub const SERVER_USAGE: &str = "Usage:\n    status - show connection count\n    show-all-conn - list every connection\n    show-conn [id] - show one connection\n    to [id] [msg] - send msg to user, eg: to 1001 hello";

/// Parse one client input line. Blank lines yield `None`.
pub fn parse_client_command(line: &str) -> Result<Option<ClientCommand>> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&name, args)) = words.split_first() else {
        return Ok(None);
    };
    let cmd = match name {
        "status" => ClientCommand::Status,
        "close" => ClientCommand::Close,
        "to" => {
            let (id, text) = parse_to(args)?;
            ClientCommand::To { id, text }
        }
        other => return Err(unknown(other)),
    };
    Ok(Some(cmd))
}

/// Parse one server console line. Blank lines yield `None`.
pub fn parse_server_command(line: &str) -> Result<Option<ServerCommand>> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&name, args)) = words.split_first() else {
        return Ok(None);
    };
    let cmd = match name {
        "status" => ServerCommand::Status,
        "show-all-conn" => ServerCommand::ShowAllConn,
        "show-conn" => match args {
            [id] => ServerCommand::ShowConn(parse_id(id)?),
            _ => return Err(CryptoTcpError::InvalidCommand("id is needed".to_string())),
        },
        "to" => {
            let (id, text) = parse_to(args)?;
            ServerCommand::To { id, text }
        }
        other => return Err(unknown(other)),
    };
    Ok(Some(cmd))
}

fn parse_to(args: &[&str]) -> Result<(ConnId, String)> {
    if args.len() < 2 {
        return Err(CryptoTcpError::InvalidCommand(
            "id or msg body is needed".to_string(),
        ));
    }
    Ok((parse_id(args[0])?, args[1..].join(" ")))
}

fn parse_id(word: &str) -> Result<ConnId> {
    word.parse()
        .map_err(|_| CryptoTcpError::InvalidCommand(format!("invalid id: {}", word)))
}

fn unknown(name: &str) -> CryptoTcpError {
    CryptoTcpError::InvalidCommand(format!("unknown command: {}", name))
}
