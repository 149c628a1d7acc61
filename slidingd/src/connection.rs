use crate::command;
use crate::error::{ConnectionError, ReplyError};
use crate::resp::Codec;
use crate::Shared;
use bstr::ByteSlice;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::TryAcquireError;
use tokio_util::codec::Framed;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

pub async fn serve(shared: Arc<Shared>, mut conn: TcpStream) -> std::io::Result<()> {
    match shared.conn_limit.clone().try_acquire_owned() {
        Ok(_permit) => Connection::new(shared, conn).serve().await,
        Err(TryAcquireError::Closed) => unreachable!(),
        Err(TryAcquireError::NoPermits) => {
            use tokio::io::AsyncWriteExt;
            conn.write_all(b"-Client Error: max number of clients reached\r\n")
                .await
        }
    }
}

struct Connection {
    shared: Arc<Shared>,
    framed: Framed<TcpStream, Codec>,
    client_id: u64,
}

impl Connection {
    fn new(shared: Arc<Shared>, conn: TcpStream) -> Self {
        Self {
            shared,
            framed: Framed::new(conn, Codec::default()),
            client_id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    async fn serve(mut self) -> std::io::Result<()> {
        let result = self.run().await;
        // unblock the vacuum thread no matter how the connection ended
        self.shared.manager.client_leave(self.client_id);
        result
    }

    async fn run(&mut self) -> std::io::Result<()> {
        while let Some(decoded) = self.framed.next().await {
            let tokens = match decoded {
                Ok(tokens) => tokens,
                Err(ConnectionError::Io(err)) => return Err(err),
                Err(ConnectionError::Protocol(detail)) => {
                    return self.framed.send(Err(ReplyError::Client(detail))).await;
                }
            };
            tracing::trace!("received {:?}", DebugQuery(&tokens));
            let Some((command, args)) = tokens.split_first() else {
                continue;
            };

            // publish our checkpoint so vacuum knows what this call may
            // still reference
            self.shared.manager.client_checkpoint(self.client_id);

            let reply = command::dispatch(&self.shared, command, args);
            let fatal = matches!(&reply, Err(err) if err.is_fatal());
            self.framed.send(reply).await?;
            if fatal {
                break;
            }
        }
        Ok(())
    }
}

struct DebugQuery<'a>(&'a [Bytes]);

impl std::fmt::Debug for DebugQuery<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str("(empty)");
        }
        for s in self.0 {
            if s.len() > 30 {
                write!(f, "{:?}... ", &s[..30].as_bstr())?;
            } else {
                write!(f, "{:?} ", s.as_bstr())?;
            }
        }
        Ok(())
    }
}
