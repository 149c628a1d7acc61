mod server;
mod sets;

use crate::error::ReplyError;
use crate::resp::Reply;
use crate::Shared;
use bstr::ByteSlice;
use bytes::Bytes;
use std::fmt::Display;

/// Parses, arity-checks and runs one decoded command line.
pub fn dispatch(shared: &Shared, command: &[u8], args: &[Bytes]) -> Reply {
    let command = match Command::parse(&command.to_ascii_uppercase()) {
        Some(command) => command,
        None => {
            return Err(ReplyError::Client(format!(
                "Command not supported: {:?}",
                command.as_bstr()
            )))
        }
    };
    match command.arity() {
        Arity::Fixed(n) if args.len() == n => (),
        Arity::AtLeast(n) if args.len() >= n => (),
        _ => return Err(ReplyError::bad_args()),
    }
    command.call(shared, args)
}

pub enum Arity {
    Fixed(usize),
    AtLeast(usize),
}

macro_rules! commands {
    ($($id:ident,)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum Command {
            $($id,)*
        }

        impl Display for Command {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", match self {
                    $(Self::$id => $id::NAME,)*
                })
            }
        }

        impl Command {
            #[allow(non_upper_case_globals)]
            fn parse(bytes: &[u8]) -> Option<Self> {
                $(const $id: &[u8] = $id::NAME.as_bytes();)*
                match bytes {
                    $($id => Some(Self::$id),)*
                    _ => None,
                }
            }

            const fn arity(&self) -> Arity {
                match self {
                    $(Self::$id => $id::ARITY,)*
                }
            }

            fn call(&self, shared: &Shared, args: &[Bytes]) -> Reply {
                match self {
                    $(Self::$id => $id::call(shared, args),)*
                }
            }
        }

        $(pub(crate) enum $id {})*
    }
}

commands! {
    Clear,
    Close,
    Create,
    Detail,
    Drop,
    Echo,
    Flush,
    Info,
    List,
    ShAdd,
    ShCard,
    ShUnion,
}

pub(crate) trait CommandSpec {
    const NAME: &'static str;
    const ARITY: Arity;
}

pub(crate) trait CommandHandler: CommandSpec {
    fn call(shared: &Shared, args: &[Bytes]) -> Reply;
}

fn parse_arg<T: std::str::FromStr>(bytes: &[u8]) -> Result<T, ReplyError> {
    bytes
        .to_str()
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(ReplyError::bad_args)
}

/// Timestamps are strictly positive on the wire.
fn parse_timestamp(bytes: &[u8]) -> Result<i64, ReplyError> {
    match parse_arg::<i64>(bytes)? {
        ts if ts > 0 => Ok(ts),
        _ => Err(ReplyError::bad_args()),
    }
}

/// Window lengths are strictly positive on the wire.
fn parse_window(bytes: &[u8]) -> Result<u64, ReplyError> {
    match parse_arg::<u64>(bytes)? {
        window if window > 0 => Ok(window),
        _ => Err(ReplyError::bad_args()),
    }
}

fn set_name(bytes: &[u8]) -> Result<&str, ReplyError> {
    std::str::from_utf8(bytes).map_err(|_| ReplyError::bad_args())
}
