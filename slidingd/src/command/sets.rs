//! Commands that route to a named set.

use super::{parse_arg, parse_timestamp, parse_window, set_name, Arity, CommandHandler, CommandSpec};
use crate::command;
use crate::error::ReplyError;
use crate::resp::{Reply, Value};
use crate::Shared;
use bytes::Bytes;
use slidingd_store::{CreateOptions, MULTI_OP_SIZE};
use std::io::Write;

impl CommandSpec for command::Create {
    const NAME: &'static str = "CREATE";
    const ARITY: Arity = Arity::AtLeast(1);
}

impl CommandHandler for command::Create {
    fn call(shared: &Shared, args: &[Bytes]) -> Reply {
        let name = set_name(&args[0])?;
        let mut opts = CreateOptions::default();
        let mut pairs = args[1..].chunks_exact(2);
        for pair in pairs.by_ref() {
            match pair[0].to_ascii_lowercase().as_slice() {
                b"precision" => opts.precision = Some(parse_arg(&pair[1])?),
                b"eps" => opts.eps = Some(parse_arg(&pair[1])?),
                b"in_memory" => {
                    opts.in_memory = Some(match pair[1].as_ref() {
                        b"1" => true,
                        b"0" => false,
                        _ => return Err(ReplyError::bad_args()),
                    })
                }
                _ => return Err(ReplyError::bad_args()),
            }
        }
        if !pairs.remainder().is_empty() {
            return Err(ReplyError::bad_args());
        }
        shared.manager.create_set(name, opts)?;
        Ok(Value::done())
    }
}

impl CommandSpec for command::ShAdd {
    const NAME: &'static str = "SHADD";
    const ARITY: Arity = Arity::AtLeast(3);
}

impl CommandHandler for command::ShAdd {
    fn call(shared: &Shared, args: &[Bytes]) -> Reply {
        let name = set_name(&args[0])?;
        let timestamp = parse_timestamp(&args[1])?;
        let keys = &args[2..];
        if keys.iter().any(|key| key.is_empty()) {
            return Err(ReplyError::bad_args());
        }
        // chunk so no single call holds the set's locks for too long
        for chunk in keys.chunks(MULTI_OP_SIZE) {
            let chunk: Vec<&[u8]> = chunk.iter().map(|key| key.as_ref()).collect();
            shared.manager.set_keys(name, &chunk, timestamp)?;
        }
        Ok(Value::done())
    }
}

impl CommandSpec for command::ShCard {
    const NAME: &'static str = "SHCARD";
    const ARITY: Arity = Arity::Fixed(3);
}

impl CommandHandler for command::ShCard {
    fn call(shared: &Shared, args: &[Bytes]) -> Reply {
        let name = set_name(&args[0])?;
        let timestamp = parse_timestamp(&args[1])?;
        let window = parse_window(&args[2])?;
        Ok(shared.manager.set_size(name, timestamp, window)?.into())
    }
}

impl CommandSpec for command::ShUnion {
    const NAME: &'static str = "SHUNION";
    const ARITY: Arity = Arity::AtLeast(3);
}

impl CommandHandler for command::ShUnion {
    fn call(shared: &Shared, args: &[Bytes]) -> Reply {
        let timestamp = parse_timestamp(&args[0])?;
        let window = parse_window(&args[1])?;
        let names = args[2..]
            .iter()
            .map(|arg| set_name(arg))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(shared.manager.union_size(&names, timestamp, window)?.into())
    }
}

impl CommandSpec for command::Drop {
    const NAME: &'static str = "DROP";
    const ARITY: Arity = Arity::Fixed(1);
}

impl CommandHandler for command::Drop {
    fn call(shared: &Shared, args: &[Bytes]) -> Reply {
        shared.manager.drop_set(set_name(&args[0])?)?;
        Ok(Value::done())
    }
}

impl CommandSpec for command::Close {
    const NAME: &'static str = "CLOSE";
    const ARITY: Arity = Arity::Fixed(1);
}

impl CommandHandler for command::Close {
    fn call(shared: &Shared, args: &[Bytes]) -> Reply {
        shared.manager.unmap_set(set_name(&args[0])?)?;
        Ok(Value::done())
    }
}

impl CommandSpec for command::Clear {
    const NAME: &'static str = "CLEAR";
    const ARITY: Arity = Arity::Fixed(1);
}

impl CommandHandler for command::Clear {
    fn call(shared: &Shared, args: &[Bytes]) -> Reply {
        shared.manager.clear_set(set_name(&args[0])?)?;
        Ok(Value::done())
    }
}

impl CommandSpec for command::Detail {
    const NAME: &'static str = "DETAIL";
    const ARITY: Arity = Arity::Fixed(1);
}

impl CommandHandler for command::Detail {
    fn call(shared: &Shared, args: &[Bytes]) -> Reply {
        let name = set_name(&args[0])?;
        // best-effort: a concurrent unmap or drop leaves the last value
        let size = shared.manager.set_size_total(name).unwrap_or(0);
        let block = shared.manager.with_set(name, |set| {
            let counters = set.counters();
            let config = set.config();
            let mut out = Vec::new();
            let _ = write!(
                out,
                "in_memory:{}\npage_ins:{}\npage_outs:{}\nepsilon:{:.6}\nprecision:{}\nsets:{}\nsize:{}\nstorage:{}\n",
                u8::from(!set.is_proxied()),
                counters.page_ins,
                counters.page_outs,
                config.eps,
                config.precision,
                counters.sets,
                size,
                set.byte_size(),
            );
            out
        })?;
        Ok(Value::Bulk(block.into()))
    }
}

impl CommandSpec for command::Flush {
    const NAME: &'static str = "FLUSH";
    const ARITY: Arity = Arity::AtLeast(0);
}

impl CommandHandler for command::Flush {
    fn call(shared: &Shared, args: &[Bytes]) -> Reply {
        match args {
            [] => shared.manager.flush_all(),
            [name] => shared.manager.flush_set(set_name(name)?)?,
            _ => return Err(ReplyError::bad_args()),
        }
        Ok(Value::done())
    }
}
