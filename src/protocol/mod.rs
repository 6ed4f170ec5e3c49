//! Protocol Module
//!
//! Defines the commands the cache sends to the backing store, the replies it
//! gets back, and the RESP2 framing used by the TCP transport.
//!
//! ## Protocol Format (RESP2)
//!
//! ### Request Format
//! ```text
//! ┌──────────┬───────────────────────────────────────────┐
//! │ *<argc>  │  $<len> <arg>   ...   $<len> <arg>         │
//! └──────────┴───────────────────────────────────────────┘
//! ```
//!
//! ### Commands
//! - GET / MGET          - read `<name>_v` / `<name>_d`
//! - SET / SETEX / MSET  - write both halves of a record
//! - DEL                 - remove records
//! - AUTH / SELECT       - link setup
//! - PING / QUIT         - health check and graceful close
//! - CLUSTER SLOTS       - slot layout for cluster routing
//!
//! ### Reply Types
//! - `+` status, `-` error, `:` integer, `$` bulk, `*` array

mod command;
mod reply;
mod codec;

pub use command::{Command, CommandType};
pub use reply::Reply;
pub use codec::{
    decode_command, decode_reply, encode_command, encode_command_into, encode_reply,
    encode_reply_into, read_command, read_reply, write_reply,
};
