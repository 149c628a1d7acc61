//! Server-wide commands.

use super::{set_name, Arity, CommandHandler, CommandSpec};
use crate::command;
use crate::error::ReplyError;
use crate::resp::{Reply, Value};
use crate::Shared;
use bytes::Bytes;

impl CommandSpec for command::List {
    const NAME: &'static str = "LIST";
    const ARITY: Arity = Arity::AtLeast(0);
}

impl CommandHandler for command::List {
    fn call(shared: &Shared, args: &[Bytes]) -> Reply {
        let prefix = match args {
            [] => None,
            [prefix] => Some(set_name(prefix)?),
            _ => return Err(ReplyError::bad_args()),
        };
        let entries = shared.manager.list_sets(prefix);
        let lines = entries
            .into_iter()
            .map(|entry| {
                Ok(Value::Simple(format!(
                    "{} {:.6} {} {} {}",
                    entry.name, entry.eps, entry.precision, entry.bytes, entry.size
                )))
            })
            .collect();
        Ok(Value::Array(lines))
    }
}

impl CommandSpec for command::Info {
    const NAME: &'static str = "INFO";
    const ARITY: Arity = Arity::Fixed(0);
}

impl CommandHandler for command::Info {
    fn call(_shared: &Shared, _args: &[Bytes]) -> Reply {
        Ok(Value::Bulk(Bytes::from_static(b"role:master\r\n")))
    }
}

impl CommandSpec for command::Echo {
    const NAME: &'static str = "ECHO";
    const ARITY: Arity = Arity::Fixed(1);
}

impl CommandHandler for command::Echo {
    fn call(_shared: &Shared, args: &[Bytes]) -> Reply {
        match args {
            [message] => Ok(message.clone().into()),
            _ => Err(ReplyError::bad_args()),
        }
    }
}
