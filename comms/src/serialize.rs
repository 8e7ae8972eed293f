use std::io;

/// Writes the message header and payload into `buf`, optionally returning a
/// trailing byte slice that is sent as-is without copying (used for file
/// chunk data). Fails when the message can not be framed, for example a
/// file path longer than its length field can express.
pub trait Serialize<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}
