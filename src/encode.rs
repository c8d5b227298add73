//! Serialize values into the Kafka wire format.
//!
//! Fixed-width integers are big endian. Strings carry an i16 length and byte
//! blobs an i32 length; `None` is written as a length of -1. Record batches
//! additionally use zig-zag varints, see [`encode_varint`] and [`encode_varlong`].
use bytes::{BufMut, Bytes};

use crate::error::{Error, Result};

pub trait ToByte {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()>;
}

impl<'a, T: ToByte + 'a + ?Sized> ToByte for &'a T {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (*self).encode(buffer)
    }
}

macro_rules! impl_to_byte_fixed {
    ($($ty:ty => $put:ident),+ $(,)?) => {
        $(
            impl ToByte for $ty {
                fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
                    buffer.$put(*self);
                    Ok(())
                }
            }
        )+
    };
}

impl_to_byte_fixed!(i8 => put_i8, i16 => put_i16, i32 => put_i32, u32 => put_u32, i64 => put_i64);

impl ToByte for bool {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i8(*self as i8);
        Ok(())
    }
}

impl ToByte for str {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        let len = i16::try_from(self.len())
            .map_err(|_| Error::Config(format!("string of {} bytes exceeds i16", self.len())))?;
        buffer.put_i16(len);
        buffer.put(self.as_bytes());
        Ok(())
    }
}

impl ToByte for String {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.as_str().encode(buffer)
    }
}

impl<V: ToByte> ToByte for [V] {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        encode_as_array(buffer, self, |buffer, x| x.encode(buffer))
    }
}

impl ToByte for [u8] {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        put_blob_len(buffer, self.len())?;
        buffer.put(self);
        Ok(())
    }
}

impl ToByte for Bytes {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.as_ref().encode(buffer)
    }
}

impl ToByte for Option<Bytes> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        match self {
            Some(xs) => xs.encode(buffer),
            None => (-1i32).encode(buffer),
        }
    }
}

impl ToByte for Option<String> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        match self {
            Some(xs) => xs.encode(buffer),
            // NULLABLE_STRING uses an i16 length prefix
            None => (-1i16).encode(buffer),
        }
    }
}

fn put_blob_len<W: BufMut>(buffer: &mut W, len: usize) -> Result<()> {
    let len = i32::try_from(len)
        .map_err(|_| Error::Config(format!("blob of {len} bytes exceeds i32")))?;
    buffer.put_i32(len);
    Ok(())
}

/// Renders the length of `xs` to `buffer` as the start of a
/// protocol array and then for each element of `xs` invokes `f`
/// assuming that function will render the element to the buffer.
pub fn encode_as_array<T, F, W>(buffer: &mut W, xs: &[T], mut f: F) -> Result<()>
where
    F: FnMut(&mut W, &T) -> Result<()>,
    W: BufMut,
{
    put_blob_len(buffer, xs.len())?;
    for x in xs {
        f(buffer, x)?;
    }
    Ok(())
}

/// Encode a slice of ToByte items as a Kafka protocol array.
pub fn encode_array<T: ToByte, W: BufMut>(buffer: &mut W, items: &[T]) -> Result<()> {
    encode_as_array(buffer, items, |buffer, item| item.encode(buffer))
}

/// Encode an unsigned varint. Used by flexible encoding formats (KIP-482).
pub fn encode_unsigned_varint<W: BufMut>(buffer: &mut W, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buffer.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Encode a zig-zag signed varint, as used inside v2 records.
pub fn encode_varint<W: BufMut>(buffer: &mut W, value: i32) {
    encode_unsigned_varint(buffer, ((value << 1) ^ (value >> 31)) as u32 as u64);
}

/// Encode a zig-zag signed varlong, as used for record timestamp deltas.
pub fn encode_varlong<W: BufMut>(buffer: &mut W, value: i64) {
    encode_unsigned_varint(buffer, ((value << 1) ^ (value >> 63)) as u64);
}

/// Encode a compact array: unsigned varint of `len + 1`, then the items.
pub fn encode_compact_array<T, F, W>(buffer: &mut W, items: &[T], mut f: F) -> Result<()>
where
    F: FnMut(&mut W, &T) -> Result<()>,
    W: BufMut,
{
    encode_unsigned_varint(buffer, (items.len() + 1) as u64);
    for item in items {
        f(buffer, item)?;
    }
    Ok(())
}

/// An empty tagged field section is a single varint zero.
pub fn encode_empty_tagged_fields<W: BufMut>(buffer: &mut W) {
    buffer.put_u8(0);
}
