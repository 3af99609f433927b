//! Text command grammar.
//!
//! ```text
//! PUT <key> <value> [EX <seconds> | EXAT <epoch-ms>] [<key> <value> ...]
//! GET <key> [<key> ...]
//! DELETE <key> [<key> ...]
//! NODE PRIMARIZE <host>@<port> [<host>@<port> ...]
//! NODE REPLICATE <host>@<port>
//! INFO NODE ID|ALL|MAX_QPS|CURRENT_QPS
//! INFO BUCKET MAP
//! INFO CLUSTER MAP
//! ```
//!
//! Keys and values may be wrapped in single or double quotes to carry
//! spaces. Inside quotes a backslash escapes the next character.

use serde::{Deserialize, Serialize};
use std::fmt;
use storage::{CacheEntry, Expiry};

use crate::protocol::Operation;
use crate::NodeAddress;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The command is recognised but its arguments are wrong.
    #[error("{0}")]
    Malformed(String),

    /// Unknown sub-command or info type.
    #[error("{0}")]
    Unsupported(String),
}

type ParseResult<T> = std::result::Result<T, ParseError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutEntry {
    pub key: String,
    pub value: String,
    pub expiry: Expiry,
}

impl PutEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>, expiry: Expiry) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            expiry,
        }
    }

    pub fn to_cache_entry(&self, now: i64) -> CacheEntry {
        CacheEntry::new(self.key.clone(), self.value.clone(), self.expiry.to_ttl(now))
    }

    /// Pins the entry's deadline so a replica stores the same TTL.
    pub fn from_cache_entry(entry: &CacheEntry) -> Self {
        Self::new(
            entry.key.clone(),
            entry.value_string(),
            Expiry::At(entry.ttl),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeCommand {
    Primarize(Vec<NodeAddress>),
    Replicate(NodeAddress),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeInfoKind {
    Id,
    All,
    MaxQps,
    CurrentQps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfoCommand {
    Node(NodeInfoKind),
    BucketMap,
    ClusterMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Put(Vec<PutEntry>),
    Get(Vec<String>),
    Delete(Vec<String>),
    Node(NodeCommand),
    Info(InfoCommand),
    Unknown(String),
}

impl Command {
    pub fn parse(input: &str) -> ParseResult<Self> {
        let tokens = tokenize(input);
        let Some((head, args)) = tokens.split_first() else {
            return Err(ParseError::Malformed("command cannot be empty".to_string()));
        };

        match head.to_ascii_uppercase().as_str() {
            "PUT" => parse_put(args).map(Command::Put),
            "GET" => parse_keys("GET", args).map(Command::Get),
            "DELETE" | "DEL" => parse_keys("DELETE", args).map(Command::Delete),
            "NODE" => parse_node(args).map(Command::Node),
            "INFO" => parse_info(args).map(Command::Info),
            _ => Ok(Command::Unknown(head.clone())),
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Command::Put(_) => Operation::Put,
            Command::Get(_) => Operation::Get,
            Command::Delete(_) => Operation::Delete,
            Command::Node(_) => Operation::Node,
            Command::Info(_) => Operation::Info,
            Command::Unknown(_) => Operation::Unknown,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Command::Put(_) | Command::Delete(_))
    }

    pub fn put_entries(entries: &[CacheEntry]) -> Self {
        Command::Put(entries.iter().map(PutEntry::from_cache_entry).collect())
    }
}

fn parse_keys(op: &str, args: &[String]) -> ParseResult<Vec<String>> {
    if args.is_empty() {
        return Err(ParseError::Malformed(format!(
            "{} requires at least one key",
            op
        )));
    }
    Ok(args.iter().map(|key| unquote(key)).collect())
}

fn parse_put(args: &[String]) -> ParseResult<Vec<PutEntry>> {
    if args.len() < 2 {
        return Err(ParseError::Malformed(
            "PUT requires at least one key-value pair".to_string(),
        ));
    }

    let mut entries = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let key = unquote(&args[i]);
        let value = args.get(i + 1).ok_or_else(|| {
            ParseError::Malformed(format!("PUT is missing a value for key '{}'", key))
        })?;
        i += 2;

        let mut expiry = Expiry::None;
        if let Some(flag) = args.get(i) {
            let flag = flag.to_ascii_uppercase();
            if flag == "EX" || flag == "EXAT" {
                let raw = args.get(i + 1).ok_or_else(|| {
                    ParseError::Malformed(format!("{} requires a value", flag))
                })?;
                let amount = raw.parse::<i64>().map_err(|_| {
                    ParseError::Malformed(format!("invalid {} value '{}'", flag, raw))
                })?;
                expiry = if flag == "EX" {
                    Expiry::In(amount)
                } else {
                    Expiry::At(amount)
                };
                i += 2;
            }
        }

        entries.push(PutEntry::new(key, unquote(value), expiry));
    }
    Ok(entries)
}

fn parse_node(args: &[String]) -> ParseResult<NodeCommand> {
    let Some((sub, addresses)) = args.split_first() else {
        return Err(ParseError::Malformed(
            "NODE requires a sub-command (PRIMARIZE or REPLICATE)".to_string(),
        ));
    };

    let parse_address = |raw: &String| {
        raw.parse::<NodeAddress>()
            .map_err(|e| ParseError::Malformed(e.to_string()))
    };

    match sub.to_ascii_uppercase().as_str() {
        "PRIMARIZE" => {
            if addresses.is_empty() {
                return Err(ParseError::Malformed(
                    "usage: NODE PRIMARIZE <host@port> [<host@port> ...]".to_string(),
                ));
            }
            let addresses = addresses
                .iter()
                .map(parse_address)
                .collect::<ParseResult<Vec<_>>>()?;
            Ok(NodeCommand::Primarize(addresses))
        }
        "REPLICATE" => match addresses {
            [address] => Ok(NodeCommand::Replicate(parse_address(address)?)),
            _ => Err(ParseError::Malformed(
                "usage: NODE REPLICATE <host@port>".to_string(),
            )),
        },
        other => Err(ParseError::Unsupported(format!(
            "unsupported NODE sub-command '{}'",
            other
        ))),
    }
}

fn parse_info(args: &[String]) -> ParseResult<InfoCommand> {
    let [category, kind] = args else {
        return Err(ParseError::Malformed(
            "usage: INFO <NODE|BUCKET|CLUSTER> <TYPE>".to_string(),
        ));
    };
    let category = category.to_ascii_uppercase();
    let kind = kind.to_ascii_uppercase();

    match (category.as_str(), kind.as_str()) {
        ("NODE", "ID") => Ok(InfoCommand::Node(NodeInfoKind::Id)),
        ("NODE", "ALL") => Ok(InfoCommand::Node(NodeInfoKind::All)),
        ("NODE", "MAX_QPS") => Ok(InfoCommand::Node(NodeInfoKind::MaxQps)),
        ("NODE", "CURRENT_QPS") => Ok(InfoCommand::Node(NodeInfoKind::CurrentQps)),
        ("BUCKET", "MAP") => Ok(InfoCommand::BucketMap),
        ("CLUSTER", "MAP") => Ok(InfoCommand::ClusterMap),
        _ => Err(ParseError::Unsupported(format!(
            "invalid INFO type '{}' for category '{}'",
            kind, category
        ))),
    }
}

/// Splits on whitespace, keeping `'...'` and `"..."` runs as single tokens.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c == '\'' || c == '"' {
            if let Some(offset) = closing_quote(&input[start..], c) {
                let end = start + offset;
                tokens.push(input[start..=end].to_string());
                while chars.next_if(|&(idx, _)| idx <= end).is_some() {}
                continue;
            }
            // unbalanced quote: treat as an ordinary word
        }

        let mut end = input.len();
        for (idx, ch) in chars.by_ref() {
            if ch.is_whitespace() {
                end = idx;
                break;
            }
        }
        tokens.push(input[start..end].to_string());
    }
    tokens
}

/// Byte offset of the quote closing the run that `run` opens. A backslash
/// inside the run escapes the next character.
fn closing_quote(run: &str, quote: char) -> Option<usize> {
    let mut escaped = false;
    for (idx, ch) in run.char_indices().skip(1) {
        if escaped {
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == quote {
            return Some(idx);
        }
    }
    None
}

fn unquote(token: &str) -> String {
    let Some(first) = token.chars().next().filter(|c| *c == '\'' || *c == '"') else {
        return token.to_string();
    };
    if closing_quote(token, first) != Some(token.len() - 1) {
        return token.to_string();
    }

    let mut value = String::with_capacity(token.len());
    let mut chars = token[1..token.len() - 1].chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => value.extend(chars.next()),
            _ => value.push(ch),
        }
    }
    value
}

/// Inverse of [`unquote`]: bare when the token survives tokenizing as is,
/// otherwise single-quoted with `'` and `\` escaped.
fn quote(value: &str) -> String {
    let bare = !value.is_empty()
        && !value.contains(char::is_whitespace)
        && !value.starts_with(['\'', '"']);
    if bare {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' || ch == '\\' {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('\'');
    quoted
}

fn write_keys(f: &mut fmt::Formatter<'_>, op: &str, keys: &[String]) -> fmt::Result {
    f.write_str(op)?;
    for key in keys {
        write!(f, " {}", quote(key))?;
    }
    Ok(())
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Put(entries) => {
                f.write_str("PUT")?;
                for entry in entries {
                    write!(f, " {} {}", quote(&entry.key), quote(&entry.value))?;
                    match entry.expiry {
                        Expiry::None => {}
                        Expiry::In(secs) => write!(f, " EX {}", secs)?,
                        Expiry::At(ms) => write!(f, " EXAT {}", ms)?,
                    }
                }
                Ok(())
            }
            Command::Get(keys) => write_keys(f, "GET", keys),
            Command::Delete(keys) => write_keys(f, "DELETE", keys),
            Command::Node(NodeCommand::Primarize(addresses)) => {
                f.write_str("NODE PRIMARIZE")?;
                for address in addresses {
                    write!(f, " {}", address)?;
                }
                Ok(())
            }
            Command::Node(NodeCommand::Replicate(address)) => {
                write!(f, "NODE REPLICATE {}", address)
            }
            Command::Info(info) => match info {
                InfoCommand::Node(NodeInfoKind::Id) => f.write_str("INFO NODE ID"),
                InfoCommand::Node(NodeInfoKind::All) => f.write_str("INFO NODE ALL"),
                InfoCommand::Node(NodeInfoKind::MaxQps) => f.write_str("INFO NODE MAX_QPS"),
                InfoCommand::Node(NodeInfoKind::CurrentQps) => {
                    f.write_str("INFO NODE CURRENT_QPS")
                }
                InfoCommand::BucketMap => f.write_str("INFO BUCKET MAP"),
                InfoCommand::ClusterMap => f.write_str("INFO CLUSTER MAP"),
            },
            Command::Unknown(word) => f.write_str(word),
        }
    }
}
