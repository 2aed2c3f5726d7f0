mod bitset;

pub use bitset::CompressedBitset;

use std::borrow::Cow;
use std::io::{self, Error, ErrorKind};
use std::time::{SystemTime, UNIX_EPOCH};

pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Current wall-clock time in microseconds since the epoch. Timed suspensions
/// store absolute deadlines in this unit.
pub fn unix_time_us() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_micros() as u64,
        Err(_) => 0,
    }
}

/// Decode a modified UTF-8 (CESU-8 with encoded nulls) byte sequence as found
/// in class file constant pools.
pub fn decode_modified_utf8(bytes: &[u8]) -> io::Result<Cow<str>> {
    cesu8::from_java_cesu8(bytes)
        .map_err(|e| Error::new(ErrorKind::InvalidData, format!("invalid modified UTF-8: {}", e)))
}

pub fn encode_modified_utf8(text: &str) -> Cow<[u8]> {
    cesu8::to_java_cesu8(text)
}

/// `java/lang/Object` -> `java.lang.Object`, as used in exception messages.
pub fn binary_to_dotted(name: &str) -> String {
    name.replace('/', ".")
}

pub fn dotted_to_binary(name: &str) -> String {
    name.replace('.', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_multiples() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(17, 8), 24);
        assert_eq!(align_up(3, 4), 4);
    }

    #[test]
    fn modified_utf8_round_trip() {
        for text in ["", "hello", "na\u{ef}ve", "\u{0}embedded\u{0}nul", "\u{10348}"] {
            let encoded = encode_modified_utf8(text);
            assert_eq!(decode_modified_utf8(&encoded).unwrap(), text);
        }
    }

    #[test]
    fn modified_utf8_rejects_plain_null_byte() {
        // Modified UTF-8 encodes U+0000 as 0xC0 0x80; a raw zero byte is invalid
        assert!(decode_modified_utf8(&[b'a', 0x00, b'b']).is_err());
    }
}
