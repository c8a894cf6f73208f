use std::io;
use std::io::Write;

use crate::common::{write_uvarint, VInt};

/// Chunked coder for arbitrary per-doc byte payloads, used by the doc-value
/// columns. Same chunking discipline and outer layout as
/// [`ChunkedIntCoder`](super::intcoder::ChunkedIntCoder).
///
/// Each chunk body is `uvarint(num_docs)`, one `(uvarint(doc_num),
/// uvarint(payload_len))` pair per doc, then the concatenated payloads.
pub struct ChunkedContentCoder {
    chunk_size: u64,
    curr_chunk: u64,
    chunk_lens: Vec<u64>,
    chunk_meta: Vec<(u64, u64)>,
    chunk_buf: Vec<u8>,
    body: Vec<u8>,
}

impl ChunkedContentCoder {
    pub fn new(chunk_size: u64, max_doc_num: u64) -> ChunkedContentCoder {
        let total_chunks = max_doc_num / chunk_size + 1;
        ChunkedContentCoder {
            chunk_size,
            curr_chunk: 0,
            chunk_lens: vec![0u64; total_chunks as usize],
            chunk_meta: Vec::new(),
            chunk_buf: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.curr_chunk = 0;
        self.chunk_meta.clear();
        self.chunk_buf.clear();
        self.body.clear();
        for chunk_len in self.chunk_lens.iter_mut() {
            *chunk_len = 0;
        }
    }

    /// Records `payload` for `doc_num`. DocNums must be non-decreasing.
    pub fn add(&mut self, doc_num: u64, payload: &[u8]) {
        let chunk = doc_num / self.chunk_size;
        if chunk != self.curr_chunk {
            self.flush_chunk();
            self.curr_chunk = chunk;
        }
        self.chunk_meta.push((doc_num, payload.len() as u64));
        self.chunk_buf.extend_from_slice(payload);
    }

    pub fn close(&mut self) {
        self.flush_chunk();
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        let mut written = write_uvarint(w, self.chunk_lens.len() as u64)?;
        for &chunk_len in &self.chunk_lens {
            written += write_uvarint(w, chunk_len)?;
        }
        w.write_all(&self.body)?;
        Ok(written + self.body.len())
    }

    fn flush_chunk(&mut self) {
        if self.chunk_meta.is_empty() {
            return;
        }
        let chunk_start = self.body.len();
        VInt(self.chunk_meta.len() as u64).serialize_into_vec(&mut self.body);
        for &(doc_num, payload_len) in &self.chunk_meta {
            VInt(doc_num).serialize_into_vec(&mut self.body);
            VInt(payload_len).serialize_into_vec(&mut self.body);
        }
        self.body.extend_from_slice(&self.chunk_buf);
        self.chunk_lens[self.curr_chunk as usize] = (self.body.len() - chunk_start) as u64;
        self.chunk_meta.clear();
        self.chunk_buf.clear();
    }
}
