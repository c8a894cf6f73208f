use std::io;
use std::io::Write;

use crc32fast::Hasher;

/// A sink that forwards bytes to an underlying writer while counting them
/// and folding them into a running crc32.
///
/// Every persist function takes it as an explicit parameter; offsets recorded
/// in the segment are snapshots of [`count`](CountingHashWriter::count) taken
/// right before the referenced bytes are written.
pub struct CountingHashWriter<W> {
    underlying: W,
    written_bytes: u64,
    hasher: Hasher,
}

impl<W: Write> CountingHashWriter<W> {
    pub fn wrap(underlying: W) -> CountingHashWriter<W> {
        CountingHashWriter {
            underlying,
            written_bytes: 0,
            hasher: Hasher::new(),
        }
    }

    /// Number of bytes written so far.
    pub fn count(&self) -> u64 {
        self.written_bytes
    }

    /// crc32 of the bytes written so far.
    pub fn sum32(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Returns the underlying write object.
    /// Note that this method does not trigger any flushing.
    pub fn finish(self) -> W {
        self.underlying
    }
}

impl<W: Write> Write for CountingHashWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written_size = self.underlying.write(buf)?;
        self.hasher.update(&buf[..written_size]);
        self.written_bytes += written_size as u64;
        Ok(written_size)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.underlying.write_all(buf)?;
        self.hasher.update(buf);
        self.written_bytes += buf.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.underlying.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::CountingHashWriter;

    #[test]
    fn test_counting_hash_writer() {
        let buffer: Vec<u8> = vec![];
        let mut counting_writer = CountingHashWriter::wrap(buffer);
        let bytes = (0u8..10u8).collect::<Vec<u8>>();
        counting_writer.write_all(&bytes).unwrap();
        let len = counting_writer.count();
        let crc = counting_writer.sum32();
        let buffer_restituted: Vec<u8> = counting_writer.finish();
        assert_eq!(len, 10u64);
        assert_eq!(buffer_restituted.len(), 10);
        assert_eq!(crc, crc32fast::hash(&buffer_restituted));
    }

    #[test]
    fn test_sum32_is_a_snapshot() {
        let mut counting_writer = CountingHashWriter::wrap(Vec::new());
        counting_writer.write_all(b"abc").unwrap();
        let crc_abc = counting_writer.sum32();
        assert_eq!(crc_abc, counting_writer.sum32());
        counting_writer.write_all(b"def").unwrap();
        assert_ne!(crc_abc, counting_writer.sum32());
        assert_eq!(counting_writer.sum32(), crc32fast::hash(b"abcdef"));
    }
}
