use std::io;
use std::io::Write;

use crate::common::{write_uvarint, VInt};

/// Produces a varint-coded integer stream partitioned into fixed-size docNum
/// chunks.
///
/// The serialized form is `uvarint(num_chunks)`, one `uvarint` byte length
/// per chunk, then the concatenated chunk bodies. The table is dense over
/// every chunk up to `max_doc_num`; chunks that received no value keep
/// length 0. DocNums must be added in non-decreasing order.
pub struct ChunkedIntCoder {
    chunk_size: u64,
    curr_chunk: u64,
    chunk_lens: Vec<u64>,
    chunk_buf: Vec<u8>,
    body: Vec<u8>,
}

impl ChunkedIntCoder {
    /// Returns a coder for docNums in `[0, max_doc_num]` chunked every
    /// `chunk_size` docNums.
    pub fn new(chunk_size: u64, max_doc_num: u64) -> ChunkedIntCoder {
        let total_chunks = max_doc_num / chunk_size + 1;
        ChunkedIntCoder {
            chunk_size,
            curr_chunk: 0,
            chunk_lens: vec![0u64; total_chunks as usize],
            chunk_buf: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Clears the coder for reuse, keeping its chunk dimensions.
    pub fn reset(&mut self) {
        self.curr_chunk = 0;
        self.chunk_buf.clear();
        self.body.clear();
        for chunk_len in self.chunk_lens.iter_mut() {
            *chunk_len = 0;
        }
    }

    /// Appends the varint-coded `vals` to the chunk owning `doc_num`.
    pub fn add(&mut self, doc_num: u64, vals: &[u64]) {
        let chunk = doc_num / self.chunk_size;
        if chunk != self.curr_chunk {
            self.flush_chunk();
            self.curr_chunk = chunk;
        }
        for &val in vals {
            VInt(val).serialize_into_vec(&mut self.chunk_buf);
        }
    }

    /// Appends pre-encoded bytes to the chunk owning `doc_num`. Entry point
    /// of the byte-copying merge path.
    pub fn add_bytes(&mut self, doc_num: u64, bytes: &[u8]) {
        let chunk = doc_num / self.chunk_size;
        if chunk != self.curr_chunk {
            self.flush_chunk();
            self.curr_chunk = chunk;
        }
        self.chunk_buf.extend_from_slice(bytes);
    }

    /// Flushes the pending chunk. Must be called before [`write`](Self::write).
    pub fn close(&mut self) {
        self.flush_chunk();
    }

    /// Body length accumulated so far. Zero means no value was ever added.
    pub fn final_size(&self) -> usize {
        self.body.len()
    }

    /// Commits the coder to `w`, returning the number of bytes written.
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        let mut written = write_uvarint(w, self.chunk_lens.len() as u64)?;
        for &chunk_len in &self.chunk_lens {
            written += write_uvarint(w, chunk_len)?;
        }
        w.write_all(&self.body)?;
        Ok(written + self.body.len())
    }

    fn flush_chunk(&mut self) {
        if self.chunk_buf.is_empty() {
            return;
        }
        self.chunk_lens[self.curr_chunk as usize] = self.chunk_buf.len() as u64;
        self.body.extend_from_slice(&self.chunk_buf);
        self.chunk_buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::ChunkedIntCoder;
    use crate::common::read_uvarint_at;

    fn decode(buf: &[u8]) -> (Vec<u64>, Vec<u64>) {
        let mut pos = 0;
        let num_chunks = read_uvarint_at(buf, &mut pos).unwrap();
        let mut chunk_lens = Vec::new();
        for _ in 0..num_chunks {
            chunk_lens.push(read_uvarint_at(buf, &mut pos).unwrap());
        }
        let mut vals = Vec::new();
        while pos < buf.len() {
            vals.push(read_uvarint_at(buf, &mut pos).unwrap());
        }
        (chunk_lens, vals)
    }

    #[test]
    fn test_single_chunk() {
        let mut coder = ChunkedIntCoder::new(4, 3);
        coder.add(0, &[3, 7]);
        coder.add(2, &[11]);
        coder.close();
        let mut buf = Vec::new();
        coder.write(&mut buf).unwrap();
        let (chunk_lens, vals) = decode(&buf);
        assert_eq!(chunk_lens, vec![3]);
        assert_eq!(vals, vec![3, 7, 11]);
    }

    #[test]
    fn test_skipped_chunk_keeps_zero_length() {
        let mut coder = ChunkedIntCoder::new(2, 5);
        coder.add(0, &[1]);
        coder.add(5, &[9]);
        coder.close();
        let mut buf = Vec::new();
        coder.write(&mut buf).unwrap();
        let (chunk_lens, vals) = decode(&buf);
        assert_eq!(chunk_lens, vec![1, 0, 1]);
        assert_eq!(vals, vec![1, 9]);
    }

    #[test]
    fn test_add_bytes_matches_add() {
        let mut coder = ChunkedIntCoder::new(2, 3);
        coder.add(0, &[300]);
        coder.add(3, &[4, 5]);
        coder.close();
        let mut expected = Vec::new();
        coder.write(&mut expected).unwrap();

        let mut donor = ChunkedIntCoder::new(2, 3);
        donor.add(3, &[4, 5]);
        donor.close();

        let mut copier = ChunkedIntCoder::new(2, 3);
        copier.add(0, &[300]);
        copier.add_bytes(3, &donor.body);
        copier.close();
        let mut actual = Vec::new();
        copier.write(&mut actual).unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_reset() {
        let mut coder = ChunkedIntCoder::new(2, 3);
        coder.add(1, &[42]);
        coder.close();
        assert!(coder.final_size() > 0);
        coder.reset();
        assert_eq!(coder.final_size(), 0);
        coder.close();
        let mut buf = Vec::new();
        coder.write(&mut buf).unwrap();
        let (chunk_lens, vals) = decode(&buf);
        assert_eq!(chunk_lens, vec![0, 0]);
        assert!(vals.is_empty());
    }
}
