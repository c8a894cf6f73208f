use ownedbytes::OwnedBytes;
use roaring::RoaringBitmap;

use crate::common::{read_uvarint_at, VInt};
use crate::segment::format::{decode_freq_has_locs, encode_freq_has_locs};
use crate::{Error, Result};

/// Positional occurrence of a term within a field of a document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    /// FieldID under the numbering of the segment the posting was read from.
    pub field_id: u16,
    pub pos: u64,
    pub start: u64,
    pub end: u64,
    pub array_positions: Vec<u64>,
}

/// One `(docNum, freq, norm, locations)` record of a term's postings.
#[derive(Clone, Debug, PartialEq)]
pub struct Posting {
    pub doc_num: u64,
    pub freq: u64,
    pub norm: f32,
    pub locations: Vec<Location>,
}

/// The postings of one term, opened from a dictionary value.
///
/// Holds the term's docNum bitmap plus the offsets of its term-frequency and
/// location chunk streams. A 1-hit dictionary value is materialized as a
/// synthetic singleton list with no backing streams.
pub struct PostingsList<'a> {
    mem: OwnedBytes,
    chunk_factor: u32,
    docs: RoaringBitmap,
    except: Option<&'a RoaringBitmap>,
    freq_offset: u64,
    loc_offset: u64,
    norm_bits_1hit: Option<u64>,
}

impl<'a> PostingsList<'a> {
    pub(crate) fn open(
        mem: OwnedBytes,
        chunk_factor: u32,
        postings_offset: u64,
        except: Option<&'a RoaringBitmap>,
    ) -> Result<PostingsList<'a>> {
        let mut pos = postings_offset as usize;
        let freq_offset = read_uvarint_at(&mem, &mut pos)?;
        let loc_offset = read_uvarint_at(&mem, &mut pos)?;
        let bitmap_len = read_uvarint_at(&mem, &mut pos)? as usize;
        if pos + bitmap_len > mem.len() {
            return Err(Error::corruption("postings bitmap out of bounds"));
        }
        let docs = RoaringBitmap::deserialize_from(&mem[pos..pos + bitmap_len])
            .map_err(|e| Error::corruption(format!("postings bitmap unreadable: {e}")))?;
        Ok(PostingsList {
            mem,
            chunk_factor,
            docs,
            except,
            freq_offset,
            loc_offset,
            norm_bits_1hit: None,
        })
    }

    pub(crate) fn one_hit(
        mem: OwnedBytes,
        chunk_factor: u32,
        doc_num: u64,
        norm_bits: u64,
        except: Option<&'a RoaringBitmap>,
    ) -> PostingsList<'a> {
        let mut docs = RoaringBitmap::new();
        docs.insert(doc_num as u32);
        PostingsList {
            mem,
            chunk_factor,
            docs,
            except,
            freq_offset: 0,
            loc_offset: 0,
            norm_bits_1hit: Some(norm_bits),
        }
    }

    /// Number of docNums the iterator will yield, tombstones elided.
    pub fn doc_count(&self) -> u64 {
        match self.except {
            Some(except) => self.docs.len() - self.docs.intersection_len(except),
            None => self.docs.len(),
        }
    }

    pub fn iterator(&self) -> Result<PostingsIterator> {
        PostingsIterator::new(self)
    }
}

/// Iterates a postings list in ascending docNum order.
///
/// Tombstoned docNums are skipped, but their stream entries still have to be
/// consumed when they share a chunk with a surviving hit, so the iterator
/// walks the full bitmap alongside the filtered one.
pub struct PostingsIterator {
    mem: OwnedBytes,
    chunk_factor: u64,
    norm_bits_1hit: Option<u64>,
    all: roaring::bitmap::IntoIter,
    actual: roaring::bitmap::IntoIter,
    freq_chunk_lens: Vec<u64>,
    freq_data_start: u64,
    loc_chunk_lens: Vec<u64>,
    loc_data_start: u64,
    curr_chunk: Option<u64>,
    freq_chunk: OwnedBytes,
    freq_pos: usize,
    loc_chunk: OwnedBytes,
    loc_pos: usize,
    buf_1hit: Vec<u8>,
}

impl PostingsIterator {
    fn new(list: &PostingsList<'_>) -> Result<PostingsIterator> {
        let actual = match list.except {
            Some(except) => &list.docs - except,
            None => list.docs.clone(),
        };
        let mut freq_chunk_lens = Vec::new();
        let mut freq_data_start = 0u64;
        let mut loc_chunk_lens = Vec::new();
        let mut loc_data_start = 0u64;
        if list.norm_bits_1hit.is_none() {
            (freq_chunk_lens, freq_data_start) = parse_chunk_table(&list.mem, list.freq_offset)?;
            (loc_chunk_lens, loc_data_start) = parse_chunk_table(&list.mem, list.loc_offset)?;
        }
        Ok(PostingsIterator {
            mem: list.mem.clone(),
            chunk_factor: u64::from(list.chunk_factor),
            norm_bits_1hit: list.norm_bits_1hit,
            all: list.docs.clone().into_iter(),
            actual: actual.into_iter(),
            freq_chunk_lens,
            freq_data_start,
            loc_chunk_lens,
            loc_data_start,
            curr_chunk: None,
            freq_chunk: OwnedBytes::empty(),
            freq_pos: 0,
            loc_chunk: OwnedBytes::empty(),
            loc_pos: 0,
            buf_1hit: Vec::new(),
        })
    }

    /// Returns the next surviving posting, decoded.
    pub fn next(&mut self) -> Result<Option<Posting>> {
        let doc_num = match self.next_doc_num()? {
            Some(doc_num) => doc_num,
            None => return Ok(None),
        };
        if let Some(norm_bits) = self.norm_bits_1hit {
            return Ok(Some(Posting {
                doc_num,
                freq: 1,
                norm: f32::from_bits(norm_bits as u32),
                locations: Vec::new(),
            }));
        }
        let (word, norm_bits) = self.read_freq_norm()?;
        let (freq, has_locs) = decode_freq_has_locs(word);
        let mut locations = Vec::new();
        if has_locs {
            locations.reserve(freq as usize);
            for _ in 0..freq {
                locations.push(self.read_location()?);
            }
        }
        Ok(Some(Posting {
            doc_num,
            freq,
            norm: f32::from_bits(norm_bits as u32),
            locations,
        }))
    }

    /// Returns the next surviving posting along with the raw encoded
    /// freq/norm and location bytes, for byte-copying merges.
    pub fn next_bytes(&mut self) -> Result<Option<(u64, u64, u64, &[u8], &[u8])>> {
        let doc_num = match self.next_doc_num()? {
            Some(doc_num) => doc_num,
            None => return Ok(None),
        };
        if let Some(norm_bits) = self.norm_bits_1hit {
            self.buf_1hit.clear();
            VInt(encode_freq_has_locs(1, false)).serialize_into_vec(&mut self.buf_1hit);
            VInt(norm_bits).serialize_into_vec(&mut self.buf_1hit);
            return Ok(Some((doc_num, 1, norm_bits, self.buf_1hit.as_slice(), &[])));
        }
        let freq_start = self.freq_pos;
        let (word, norm_bits) = self.read_freq_norm()?;
        let (freq, has_locs) = decode_freq_has_locs(word);
        let freq_end = self.freq_pos;
        let loc_start = self.loc_pos;
        if has_locs {
            for _ in 0..freq {
                self.skip_location()?;
            }
        }
        let loc_end = self.loc_pos;
        Ok(Some((
            doc_num,
            freq,
            norm_bits,
            &self.freq_chunk[freq_start..freq_end],
            &self.loc_chunk[loc_start..loc_end],
        )))
    }

    fn next_doc_num(&mut self) -> Result<Option<u64>> {
        let n = match self.actual.next() {
            Some(doc) => u64::from(doc),
            None => return Ok(None),
        };
        if self.norm_bits_1hit.is_some() {
            return Ok(Some(n));
        }
        let n_chunk = n / self.chunk_factor;
        loop {
            let all_n = match self.all.next() {
                Some(doc) => u64::from(doc),
                None => {
                    return Err(Error::corruption(
                        "postings iterator lost sync with its bitmap",
                    ))
                }
            };
            if all_n == n {
                break;
            }
            // A doc hidden by the tombstones. Its entries only occupy our
            // cursor when it lives in the chunk we are about to read.
            if all_n / self.chunk_factor == n_chunk {
                self.ensure_chunk(n_chunk)?;
                let (word, _) = self.read_freq_norm()?;
                let (freq, has_locs) = decode_freq_has_locs(word);
                if has_locs {
                    for _ in 0..freq {
                        self.skip_location()?;
                    }
                }
            }
        }
        self.ensure_chunk(n_chunk)?;
        Ok(Some(n))
    }

    fn ensure_chunk(&mut self, chunk: u64) -> Result<()> {
        if self.curr_chunk != Some(chunk) {
            self.load_chunk(chunk)?;
        }
        Ok(())
    }

    fn load_chunk(&mut self, chunk: u64) -> Result<()> {
        self.freq_chunk = chunk_slice(
            &self.mem,
            &self.freq_chunk_lens,
            self.freq_data_start,
            chunk,
        )?;
        self.freq_pos = 0;
        self.loc_chunk = chunk_slice(&self.mem, &self.loc_chunk_lens, self.loc_data_start, chunk)?;
        self.loc_pos = 0;
        self.curr_chunk = Some(chunk);
        Ok(())
    }

    fn read_freq_norm(&mut self) -> Result<(u64, u64)> {
        let word = read_uvarint_at(&self.freq_chunk, &mut self.freq_pos)?;
        let norm_bits = read_uvarint_at(&self.freq_chunk, &mut self.freq_pos)?;
        Ok((word, norm_bits))
    }

    fn read_location(&mut self) -> Result<Location> {
        let field_id = read_uvarint_at(&self.loc_chunk, &mut self.loc_pos)?;
        let pos = read_uvarint_at(&self.loc_chunk, &mut self.loc_pos)?;
        let start = read_uvarint_at(&self.loc_chunk, &mut self.loc_pos)?;
        let end = read_uvarint_at(&self.loc_chunk, &mut self.loc_pos)?;
        let num_array_positions = read_uvarint_at(&self.loc_chunk, &mut self.loc_pos)?;
        let mut array_positions = Vec::with_capacity(num_array_positions as usize);
        for _ in 0..num_array_positions {
            array_positions.push(read_uvarint_at(&self.loc_chunk, &mut self.loc_pos)?);
        }
        Ok(Location {
            field_id: field_id as u16,
            pos,
            start,
            end,
            array_positions,
        })
    }

    fn skip_location(&mut self) -> Result<()> {
        for _ in 0..4 {
            read_uvarint_at(&self.loc_chunk, &mut self.loc_pos)?;
        }
        let num_array_positions = read_uvarint_at(&self.loc_chunk, &mut self.loc_pos)?;
        for _ in 0..num_array_positions {
            read_uvarint_at(&self.loc_chunk, &mut self.loc_pos)?;
        }
        Ok(())
    }
}

fn parse_chunk_table(mem: &[u8], offset: u64) -> Result<(Vec<u64>, u64)> {
    let mut pos = offset as usize;
    let num_chunks = read_uvarint_at(mem, &mut pos)?;
    let mut chunk_lens = Vec::with_capacity(num_chunks as usize);
    for _ in 0..num_chunks {
        chunk_lens.push(read_uvarint_at(mem, &mut pos)?);
    }
    Ok((chunk_lens, pos as u64))
}

fn chunk_slice(
    mem: &OwnedBytes,
    chunk_lens: &[u64],
    data_start: u64,
    chunk: u64,
) -> Result<OwnedBytes> {
    if chunk as usize >= chunk_lens.len() {
        return Err(Error::corruption("chunk index beyond chunk table"));
    }
    let skipped: u64 = chunk_lens[..chunk as usize].iter().sum();
    let start = (data_start + skipped) as usize;
    let end = start + chunk_lens[chunk as usize] as usize;
    if end > mem.len() {
        return Err(Error::corruption("chunk data out of bounds"));
    }
    Ok(mem.slice(start..end))
}
