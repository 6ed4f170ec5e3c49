//! Command definitions
//!
//! The subset of backing-store commands the cache issues. Keys are record
//! keys (`<name>_v`, `<name>_d`); values are opaque bytes.

use bytes::Bytes;

use crate::error::{CacheError, Result};

/// Command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    Get,
    MGet,
    Set,
    SetEx,
    MSet,
    Del,
    Auth,
    Select,
    Ping,
    Quit,
    ClusterSlots,
}

impl CommandType {
    /// Wire name of the command
    pub fn name(&self) -> &'static str {
        match self {
            CommandType::Get => "GET",
            CommandType::MGet => "MGET",
            CommandType::Set => "SET",
            CommandType::SetEx => "SETEX",
            CommandType::MSet => "MSET",
            CommandType::Del => "DEL",
            CommandType::Auth => "AUTH",
            CommandType::Select => "SELECT",
            CommandType::Ping => "PING",
            CommandType::Quit => "QUIT",
            CommandType::ClusterSlots => "CLUSTER",
        }
    }
}

/// A command for the backing store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Get one value
    Get { key: String },

    /// Get several values, answered as one array in key order
    MGet { keys: Vec<String> },

    /// Set a value with no expiry
    Set { key: String, value: Bytes },

    /// Set a value that expires after `ttl` seconds
    SetEx { key: String, ttl: u64, value: Bytes },

    /// Set several values at once
    MSet { pairs: Vec<(String, Bytes)> },

    /// Delete keys, answered with the number removed
    Del { keys: Vec<String> },

    /// Authenticate the link
    Auth { password: String },

    /// Switch database index
    Select { db: u32 },

    /// Health check
    Ping,

    /// Ask the server to close the link
    Quit,

    /// Cluster slot layout
    ClusterSlots,
}

impl Command {
    /// Get the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Get { .. } => CommandType::Get,
            Command::MGet { .. } => CommandType::MGet,
            Command::Set { .. } => CommandType::Set,
            Command::SetEx { .. } => CommandType::SetEx,
            Command::MSet { .. } => CommandType::MSet,
            Command::Del { .. } => CommandType::Del,
            Command::Auth { .. } => CommandType::Auth,
            Command::Select { .. } => CommandType::Select,
            Command::Ping => CommandType::Ping,
            Command::Quit => CommandType::Quit,
            Command::ClusterSlots => CommandType::ClusterSlots,
        }
    }

    /// Keys touched by this command, in argument order
    pub fn keys(&self) -> Vec<&str> {
        match self {
            Command::Get { key } | Command::Set { key, .. } | Command::SetEx { key, .. } => {
                vec![key.as_str()]
            }
            Command::MGet { keys } | Command::Del { keys } => {
                keys.iter().map(String::as_str).collect()
            }
            Command::MSet { pairs } => pairs.iter().map(|(k, _)| k.as_str()).collect(),
            _ => Vec::new(),
        }
    }

    /// Flatten into wire arguments, command name first
    pub fn to_args(&self) -> Vec<Bytes> {
        let mut args = vec![Bytes::from_static(self.command_type().name().as_bytes())];
        match self {
            Command::Get { key } => args.push(key_bytes(key)),
            Command::MGet { keys } | Command::Del { keys } => {
                args.extend(keys.iter().map(|k| key_bytes(k)));
            }
            Command::Set { key, value } => {
                args.push(key_bytes(key));
                args.push(value.clone());
            }
            Command::SetEx { key, ttl, value } => {
                args.push(key_bytes(key));
                args.push(Bytes::from(ttl.to_string()));
                args.push(value.clone());
            }
            Command::MSet { pairs } => {
                for (key, value) in pairs {
                    args.push(key_bytes(key));
                    args.push(value.clone());
                }
            }
            Command::Auth { password } => args.push(Bytes::from(password.clone())),
            Command::Select { db } => args.push(Bytes::from(db.to_string())),
            Command::ClusterSlots => args.push(Bytes::from_static(b"SLOTS")),
            Command::Ping | Command::Quit => {}
        }
        args
    }

    /// Rebuild a command from wire arguments (the server side of `to_args`)
    pub fn from_args(args: Vec<Bytes>) -> Result<Command> {
        let mut args = args.into_iter();
        let name = args
            .next()
            .ok_or_else(|| CacheError::Protocol("Empty command".to_string()))?;
        let name = String::from_utf8_lossy(&name).to_ascii_uppercase();
        let rest: Vec<Bytes> = args.collect();

        let arity = |min: usize| -> Result<()> {
            if rest.len() < min {
                Err(CacheError::Protocol(format!(
                    "{} command: expected at least {} arguments, got {}",
                    name,
                    min,
                    rest.len()
                )))
            } else {
                Ok(())
            }
        };

        match name.as_str() {
            "GET" => {
                arity(1)?;
                Ok(Command::Get { key: text(&rest[0])? })
            }
            "MGET" => {
                arity(1)?;
                Ok(Command::MGet { keys: texts(&rest)? })
            }
            "DEL" => {
                arity(1)?;
                Ok(Command::Del { keys: texts(&rest)? })
            }
            "SET" => {
                arity(2)?;
                Ok(Command::Set {
                    key: text(&rest[0])?,
                    value: rest[1].clone(),
                })
            }
            "SETEX" => {
                arity(3)?;
                Ok(Command::SetEx {
                    key: text(&rest[0])?,
                    ttl: number(&rest[1])?,
                    value: rest[2].clone(),
                })
            }
            "MSET" => {
                arity(2)?;
                if rest.len() % 2 != 0 {
                    return Err(CacheError::Protocol(
                        "MSET command: odd number of arguments".to_string(),
                    ));
                }
                let pairs = rest
                    .chunks(2)
                    .map(|pair| Ok((text(&pair[0])?, pair[1].clone())))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Command::MSet { pairs })
            }
            "AUTH" => {
                arity(1)?;
                Ok(Command::Auth {
                    // AUTH [username] password
                    password: text(&rest[rest.len() - 1])?,
                })
            }
            "SELECT" => {
                arity(1)?;
                Ok(Command::Select { db: number(&rest[0])? })
            }
            "PING" => Ok(Command::Ping),
            "QUIT" => Ok(Command::Quit),
            "CLUSTER" => {
                arity(1)?;
                if rest[0].eq_ignore_ascii_case(b"SLOTS") {
                    Ok(Command::ClusterSlots)
                } else {
                    Err(CacheError::Protocol(format!(
                        "Unknown CLUSTER subcommand: {}",
                        String::from_utf8_lossy(&rest[0])
                    )))
                }
            }
            other => Err(CacheError::Protocol(format!("Unknown command: {}", other))),
        }
    }
}

fn key_bytes(key: &str) -> Bytes {
    Bytes::copy_from_slice(key.as_bytes())
}

fn text(bytes: &Bytes) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| CacheError::Protocol("Argument is not valid UTF-8".to_string()))
}

fn texts(args: &[Bytes]) -> Result<Vec<String>> {
    args.iter().map(text).collect()
}

fn number<T: std::str::FromStr>(bytes: &Bytes) -> Result<T> {
    text(bytes)?
        .parse()
        .map_err(|_| CacheError::Protocol("Argument is not an integer".to_string()))
}
