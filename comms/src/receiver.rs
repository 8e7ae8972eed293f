use std::{io, time::Duration};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Deserialize, LEN_TYPE_SIZE, LenType};

/// Frames larger than this are refused before allocating a buffer for them.
/// Bounds peak memory against a corrupt or hostile length header.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// The receiving end handle of the communication.
///
/// Receives are cancellation safe: partially read frame state is kept on the
/// handle, so a receive dropped by a `select!` can be resumed by the next
/// call, provided the same buffer is passed again.
pub struct MsgReceiver<R: AsyncRead + Unpin> {
    rx: R,
    len_buf: [u8; LEN_TYPE_SIZE],
    len_filled: usize,
    body_len: Option<usize>,
    body_filled: usize,
}

impl<R: AsyncRead + Unpin> MsgReceiver<R> {
    /// Creates a new `MsgReceiver` instance.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    pub(super) fn new(rx: R) -> Self {
        Self {
            rx,
            len_buf: [0; LEN_TYPE_SIZE],
            len_filled: 0,
            body_len: None,
            body_filled: 0,
        }
    }

    /// Waits to receive a new message from the inner receiver.
    ///
    /// # Arguments
    /// * `buf` - The buffer to use for deserialization, the returned
    ///           `T`'s lifetimes will be tied to this buffer.
    ///
    /// # Returns
    /// A result object that returns `T` on success or `io::Error` on failure.
    pub async fn recv_into<'buf, T>(&mut self, buf: &'buf mut Vec<u8>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
    {
        if self.body_len.is_none() {
            while self.len_filled < LEN_TYPE_SIZE {
                let read = self.rx.read(&mut self.len_buf[self.len_filled..]).await?;
                if read == 0 {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                self.len_filled += read;
            }

            let len = LenType::from_be_bytes(self.len_buf) as usize;
            if len > MAX_FRAME_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame length {len} exceeds the {MAX_FRAME_SIZE} byte bound"),
                ));
            }

            self.len_filled = 0;
            self.body_len = Some(len);
            self.body_filled = 0;
        }

        // The option was just filled if it was empty.
        let len = self.body_len.unwrap();
        buf.resize(len, 0);

        while self.body_filled < len {
            let read = self.rx.read(&mut buf[self.body_filled..len]).await?;
            if read == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            self.body_filled += read;
        }

        self.body_len = None;
        self.body_filled = 0;

        T::deserialize(&buf[..len])
    }

    /// Like [`recv_into`](Self::recv_into) but gives up after `timeout`,
    /// returning an `io::ErrorKind::TimedOut` error. A transport timeout is a
    /// normal recoverable event for the callers, not a failure of the
    /// underlying stream; bytes already read stay buffered for the next call.
    pub async fn recv_timeout_into<'buf, T>(
        &mut self,
        buf: &'buf mut Vec<u8>,
        timeout: Duration,
    ) -> io::Result<T>
    where
        T: Deserialize<'buf>,
    {
        match tokio::time::timeout(timeout, self.recv_into(buf)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "timeout in receive",
            )),
        }
    }
}
