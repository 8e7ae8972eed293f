//! Wire protocol shared by the dispatch processes: the message catalog,
//! the length-prefixed framing and the chunked file-transfer helpers.

mod deserialize;
pub mod msg;
mod receiver;
mod sender;
mod serialize;
pub mod transfer;

use tokio::io::{AsyncRead, AsyncWrite};

pub use deserialize::Deserialize;
pub use receiver::MsgReceiver;
pub use sender::MsgSender;
pub use serialize::Serialize;

type LenType = u32;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Creates both `MsgReceiver` and `MsgSender` channel parts.
///
/// Given a reader and a writer creates and returns both ends of the
/// communication.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// A communication stream in the form of a receiver and a sender.
pub fn channel<R, W>(rx: R, tx: W) -> (MsgReceiver<R>, MsgSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (MsgReceiver::new(rx), MsgSender::new(tx))
}
