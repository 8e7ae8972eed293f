use std::io;

/// Parses a message from a received frame. Borrowing variants (file chunks)
/// tie their lifetime to the receive buffer.
pub trait Deserialize<'a>: Sized {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self>;
}
