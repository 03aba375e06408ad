//! The typed serialization spine (§4.2). Items are encoded as a flat run of
//! bytes with no self-describing type tag: fixed-width little-endian for
//! plain-old-data, a varint length prefix for anything variable-sized, and
//! field concatenation for tuples and vectors. An item's encoded run may
//! straddle a block boundary; [`ItemDecode::decode`] reports [`Incomplete`]
//! rather than panicking so [`crate::reader::Reader`] can top up its
//! accumulator and retry.
//!
//! [`Incomplete`]: DecodeResult::Incomplete

/// An item type that can be written to a block.
pub trait ItemEncode {
    /// Append this item's encoded bytes to `buf`.
    fn encode(&self, buf: &mut Vec<u8>);
}

/// Outcome of attempting to decode one item from a byte prefix that may not
/// yet contain the whole encoding.
pub enum DecodeResult<T> {
    /// `value` was fully decoded, consuming `consumed` bytes of the input.
    Complete { value: T, consumed: usize },
    /// Not enough bytes are present yet; try again once more have arrived.
    Incomplete,
}

/// An item type that can be read back from a block.
pub trait ItemDecode: Sized {
    fn decode(buf: &[u8]) -> DecodeResult<Self>;
}

macro_rules! impl_fixed_width {
    ($ty:ty, $width:expr, $to_bytes:ident, $from_bytes:ident) => {
        impl ItemEncode for $ty {
            fn encode(&self, buf: &mut Vec<u8>) {
                buf.extend_from_slice(&self.$to_bytes());
            }
        }

        impl ItemDecode for $ty {
            fn decode(buf: &[u8]) -> DecodeResult<Self> {
                if buf.len() < $width {
                    return DecodeResult::Incomplete;
                }
                let mut raw = [0u8; $width];
                raw.copy_from_slice(&buf[..$width]);
                DecodeResult::Complete { value: <$ty>::$from_bytes(raw), consumed: $width }
            }
        }
    };
}

impl_fixed_width!(u8, 1, to_le_bytes, from_le_bytes);
impl_fixed_width!(i8, 1, to_le_bytes, from_le_bytes);
impl_fixed_width!(u16, 2, to_le_bytes, from_le_bytes);
impl_fixed_width!(i16, 2, to_le_bytes, from_le_bytes);
impl_fixed_width!(u32, 4, to_le_bytes, from_le_bytes);
impl_fixed_width!(i32, 4, to_le_bytes, from_le_bytes);
impl_fixed_width!(u64, 8, to_le_bytes, from_le_bytes);
impl_fixed_width!(i64, 8, to_le_bytes, from_le_bytes);
impl_fixed_width!(f32, 4, to_le_bytes, from_le_bytes);
impl_fixed_width!(f64, 8, to_le_bytes, from_le_bytes);

impl ItemEncode for bool {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(if *self { 1 } else { 0 });
    }
}

impl ItemDecode for bool {
    fn decode(buf: &[u8]) -> DecodeResult<Self> {
        match buf.first() {
            Some(&b) => DecodeResult::Complete { value: b != 0, consumed: 1 },
            None => DecodeResult::Incomplete,
        }
    }
}

/// LEB128-style unsigned varint: 7 payload bits per byte, high bit set on
/// every byte but the last. No external framing crate for this; same
/// hand-rolled-wire-format approach as this crate's fixed-width codecs and
/// `flux-net`'s block header.
fn encode_varint_u64(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

/// Returns `(value, bytes_consumed)`, or `None` if the varint's continuation
/// bit never clears within the given buffer.
fn decode_varint_u64(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().enumerate() {
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Reads a varint-prefixed byte run: a u64 length followed by that many raw
/// bytes. Returns `None` if either the length prefix or the payload is not
/// fully present yet.
fn decode_varint_bytes(buf: &[u8]) -> Option<(Vec<u8>, usize)> {
    let (len, prefix_width) = decode_varint_u64(buf)?;
    let len = len as usize;
    let total = prefix_width + len;
    if buf.len() < total {
        return None;
    }
    Some((buf[prefix_width..total].to_vec(), total))
}

impl ItemEncode for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        let len = self.len() as u64;
        encode_varint_u64(len, buf);
        buf.extend_from_slice(self.as_bytes());
    }
}

impl ItemDecode for String {
    fn decode(buf: &[u8]) -> DecodeResult<Self> {
        match decode_varint_bytes(buf) {
            Some((raw, consumed)) => match String::from_utf8(raw) {
                Ok(value) => DecodeResult::Complete { value, consumed },
                Err(_) => DecodeResult::Incomplete,
            },
            None => DecodeResult::Incomplete,
        }
    }
}

impl ItemEncode for Vec<u8> {
    fn encode(&self, buf: &mut Vec<u8>) {
        let len = self.len() as u64;
        encode_varint_u64(len, buf);
        buf.extend_from_slice(self);
    }
}

impl ItemDecode for Vec<u8> {
    fn decode(buf: &[u8]) -> DecodeResult<Self> {
        match decode_varint_bytes(buf) {
            Some((raw, consumed)) => DecodeResult::Complete { value: raw, consumed },
            None => DecodeResult::Incomplete,
        }
    }
}

impl<T: ItemEncode> ItemEncode for Vec<T> {
    fn encode(&self, buf: &mut Vec<u8>) {
        let len = self.len() as u64;
        encode_varint_u64(len, buf);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: ItemDecode> ItemDecode for Vec<T> {
    fn decode(buf: &[u8]) -> DecodeResult<Self> {
        let (count, mut offset) = match decode_varint_u64(buf) {
            Some(v) => v,
            None => return DecodeResult::Incomplete,
        };
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match T::decode(&buf[offset..]) {
                DecodeResult::Complete { value, consumed } => {
                    items.push(value);
                    offset += consumed;
                }
                DecodeResult::Incomplete => return DecodeResult::Incomplete,
            }
        }
        DecodeResult::Complete { value: items, consumed: offset }
    }
}

impl<A: ItemEncode, B: ItemEncode> ItemEncode for (A, B) {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.0.encode(buf);
        self.1.encode(buf);
    }
}

impl<A: ItemDecode, B: ItemDecode> ItemDecode for (A, B) {
    fn decode(buf: &[u8]) -> DecodeResult<Self> {
        let (a, consumed_a) = match A::decode(buf) {
            DecodeResult::Complete { value, consumed } => (value, consumed),
            DecodeResult::Incomplete => return DecodeResult::Incomplete,
        };
        match B::decode(&buf[consumed_a..]) {
            DecodeResult::Complete { value: b, consumed: consumed_b } => {
                DecodeResult::Complete { value: (a, b), consumed: consumed_a + consumed_b }
            }
            DecodeResult::Incomplete => DecodeResult::Incomplete,
        }
    }
}

impl<A: ItemEncode, B: ItemEncode, C: ItemEncode> ItemEncode for (A, B, C) {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.0.encode(buf);
        self.1.encode(buf);
        self.2.encode(buf);
    }
}

impl<A: ItemDecode, B: ItemDecode, C: ItemDecode> ItemDecode for (A, B, C) {
    fn decode(buf: &[u8]) -> DecodeResult<Self> {
        let (a, consumed_a) = match A::decode(buf) {
            DecodeResult::Complete { value, consumed } => (value, consumed),
            DecodeResult::Incomplete => return DecodeResult::Incomplete,
        };
        let (b, consumed_b) = match B::decode(&buf[consumed_a..]) {
            DecodeResult::Complete { value, consumed } => (value, consumed),
            DecodeResult::Incomplete => return DecodeResult::Incomplete,
        };
        match C::decode(&buf[consumed_a + consumed_b..]) {
            DecodeResult::Complete { value: c, consumed: consumed_c } => DecodeResult::Complete {
                value: (a, b, c),
                consumed: consumed_a + consumed_b + consumed_c,
            },
            DecodeResult::Incomplete => DecodeResult::Incomplete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: ItemEncode + ItemDecode + PartialEq + std::fmt::Debug>(value: T) {
        let mut buf = Vec::new();
        value.encode(&mut buf);
        match T::decode(&buf) {
            DecodeResult::Complete { value: got, consumed } => {
                assert_eq!(got, value);
                assert_eq!(consumed, buf.len());
            }
            DecodeResult::Incomplete => panic!("decode of a fully present buffer reported Incomplete"),
        }
    }

    #[test]
    fn primitives_roundtrip() {
        roundtrip(42u64);
        roundtrip(-7i32);
        roundtrip(3.5f64);
        roundtrip(true);
        roundtrip(false);
    }

    #[test]
    fn string_and_bytes_roundtrip() {
        roundtrip("hello flux".to_string());
        roundtrip(String::new());
        roundtrip(vec![1u8, 2, 3, 255]);
    }

    #[test]
    fn composite_types_roundtrip() {
        roundtrip((1u32, "word".to_string()));
        roundtrip((1u8, 2u16, 3u32));
        roundtrip(vec!["a".to_string(), "bb".to_string(), "ccc".to_string()]);
    }

    #[test]
    fn varint_roundtrips_across_byte_widths() {
        for &v in &[0u64, 1, 127, 128, 16383, 16384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            encode_varint_u64(v, &mut buf);
            let (decoded, consumed) = decode_varint_u64(&buf).expect("full varint must decode");
            assert_eq!(decoded, v);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn truncated_buffer_reports_incomplete() {
        let mut buf = Vec::new();
        "a longer string than one byte".to_string().encode(&mut buf);
        match String::decode(&buf[..buf.len() - 1]) {
            DecodeResult::Incomplete => {}
            DecodeResult::Complete { .. } => panic!("truncated buffer should not decode"),
        }
        match u64::decode(&buf[..4]) {
            DecodeResult::Incomplete => {}
            DecodeResult::Complete { .. } => panic!("4 bytes is not enough for a u64"),
        }
    }
}
