use std::io;
use std::io::Write;

/// Maximum number of bytes a varint-coded `u64` can occupy.
pub const MAX_VARINT_LEN: usize = 10;

const STOP_BIT: u8 = 128;

/// Wrapper over a `u64` that serializes as a variable int (unsigned LEB128).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VInt(pub u64);

impl VInt {
    pub fn val(&self) -> u64 {
        self.0
    }

    pub fn serialize_into_vec(&self, output: &mut Vec<u8>) {
        let mut buffer = [0u8; MAX_VARINT_LEN];
        let num_bytes = self.serialize_into(&mut buffer);
        output.extend_from_slice(&buffer[0..num_bytes]);
    }

    pub fn serialize_into(&self, buffer: &mut [u8; MAX_VARINT_LEN]) -> usize {
        let mut remaining = self.0;
        for (i, b) in buffer.iter_mut().enumerate() {
            let next_byte: u8 = (remaining % 128u64) as u8;
            remaining /= 128u64;
            if remaining == 0u64 {
                *b = next_byte | STOP_BIT;
                return i + 1;
            } else {
                *b = next_byte;
            }
        }
        unreachable!();
    }
}

/// Writes `val` as a varint, returning the number of bytes written.
pub fn write_uvarint<W: Write>(writer: &mut W, val: u64) -> io::Result<usize> {
    let mut buffer = [0u8; MAX_VARINT_LEN];
    let num_bytes = VInt(val).serialize_into(&mut buffer);
    writer.write_all(&buffer[0..num_bytes])?;
    Ok(num_bytes)
}

/// Writes several varints back to back.
pub fn write_uvarints<W: Write>(writer: &mut W, vals: &[u64]) -> io::Result<usize> {
    let mut written = 0;
    for &val in vals {
        written += write_uvarint(writer, val)?;
    }
    Ok(written)
}

/// Reads a varint from the front of `data`, consuming its payload.
pub fn read_uvarint(data: &mut &[u8]) -> io::Result<u64> {
    let buf = *data;
    let mut result = 0u64;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate().take(MAX_VARINT_LEN) {
        result |= u64::from(b % 128u8) << shift;
        if b >= STOP_BIT {
            *data = &buf[i + 1..];
            return Ok(result);
        }
        shift += 7;
    }
    Err(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "reached end of buffer while reading VInt",
    ))
}

/// Reads a varint from `data` at cursor `pos`, advancing the cursor.
pub fn read_uvarint_at(data: &[u8], pos: &mut usize) -> io::Result<u64> {
    let mut slice = data.get(*pos..).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "VInt cursor beyond end of buffer",
        )
    })?;
    let before = slice.len();
    let val = read_uvarint(&mut slice)?;
    *pos += before - slice.len();
    Ok(val)
}

#[cfg(test)]
mod tests {
    use super::{read_uvarint, read_uvarint_at, write_uvarint, VInt, MAX_VARINT_LEN};

    fn aux_test_vint(val: u64) {
        let mut v = [14u8; MAX_VARINT_LEN];
        let num_bytes = VInt(val).serialize_into(&mut v);
        for b in &v[num_bytes..] {
            assert_eq!(*b, 14u8);
        }
        assert!(num_bytes > 0);
        if num_bytes < 10 {
            assert!(1u64 << (7 * num_bytes) > val);
        }
        if num_bytes > 1 {
            assert!(1u64 << (7 * (num_bytes - 1)) <= val);
        }
        let mut data = &v[..];
        let serdeser_val = read_uvarint(&mut data).unwrap();
        assert_eq!(val, serdeser_val);
        assert_eq!(data.len(), MAX_VARINT_LEN - num_bytes);
    }

    #[test]
    fn test_vint() {
        aux_test_vint(0);
        aux_test_vint(1);
        aux_test_vint(5);
        aux_test_vint(u64::MAX);
        for i in 1..9 {
            let power_of_128 = 1u64 << (7 * i);
            aux_test_vint(power_of_128 - 1u64);
            aux_test_vint(power_of_128);
            aux_test_vint(power_of_128 + 1u64);
        }
        aux_test_vint(10);
    }

    #[test]
    fn test_write_then_read_cursor() {
        let mut buffer: Vec<u8> = Vec::new();
        for val in [0u64, 1, 127, 128, 300_000, u64::MAX] {
            write_uvarint(&mut buffer, val).unwrap();
        }
        let mut pos = 0;
        for val in [0u64, 1, 127, 128, 300_000, u64::MAX] {
            assert_eq!(read_uvarint_at(&buffer, &mut pos).unwrap(), val);
        }
        assert_eq!(pos, buffer.len());
    }

    #[test]
    fn test_read_truncated() {
        let mut buffer: Vec<u8> = Vec::new();
        write_uvarint(&mut buffer, 1u64 << 40).unwrap();
        buffer.pop();
        let mut data = &buffer[..];
        assert!(read_uvarint(&mut data).is_err());
    }
}
