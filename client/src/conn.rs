use std::{io, time::Duration};

use comms::{
    msg::{Message, Reply},
    MsgReceiver, MsgSender,
};
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpStream,
};

use crate::ClientError;

/// A reply with the borrowed payloads copied out, so callers never hold the
/// receive buffer.
#[derive(Debug)]
pub enum Response {
    Ack,
    Refused(String),
    Reply(Reply),
    FileChunk {
        path: String,
        is_last: bool,
        data: Vec<u8>,
    },
}

/// One framed connection plus its receive buffer.
pub struct Connection {
    rx: MsgReceiver<OwnedReadHalf>,
    tx: MsgSender<OwnedWriteHalf>,
    buf: Vec<u8>,
}

impl Connection {
    pub async fn open(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (rx, tx) = stream.into_split();
        let (rx, tx) = comms::channel(rx, tx);
        Ok(Self {
            rx,
            tx,
            buf: Vec::new(),
        })
    }

    /// One request, one reply, bounded by `timeout`.
    pub async fn request(
        &mut self,
        msg: &Message<'_>,
        timeout: Duration,
    ) -> crate::Result<Response> {
        self.tx.send(msg).await?;
        let reply = self
            .rx
            .recv_timeout_into::<Message>(&mut self.buf, timeout)
            .await
            .map_err(|e| {
                if e.kind() == io::ErrorKind::TimedOut {
                    ClientError::Timeout(format!("a reply to {}", msg.kind()))
                } else {
                    ClientError::Io(e)
                }
            })?;

        match reply {
            Message::Ack => Ok(Response::Ack),
            Message::NotAck(reason) => Ok(Response::Refused(reason.into_owned())),
            Message::Reply(reply) => Ok(Response::Reply(reply)),
            Message::FileChunk(chunk) => Ok(Response::FileChunk {
                path: chunk.path.into_owned(),
                is_last: chunk.is_last,
                data: chunk.data.into_owned(),
            }),
            other => Err(ClientError::Protocol(format!(
                "a {} is not a reply",
                other.kind()
            ))),
        }
    }
}
