use fst::Streamer;
use ownedbytes::OwnedBytes;
use roaring::RoaringBitmap;

use crate::common::read_uvarint_at;
use crate::error::convert_fst_error;
use crate::segment::format;
use crate::segment::postings::PostingsList;
use crate::Result;

/// A field's term dictionary: an FST mapping each term to either the offset
/// of its postings record or, for unique terms, a packed 1-hit value.
pub struct Dictionary {
    fst: fst::Map<OwnedBytes>,
    mem: OwnedBytes,
    chunk_factor: u32,
}

impl Dictionary {
    /// Opens the dictionary record found at `dict_offset` in `mem`.
    pub(crate) fn open(mem: &OwnedBytes, dict_offset: u64, chunk_factor: u32) -> Result<Dictionary> {
        let mut pos = dict_offset as usize;
        let fst_len = read_uvarint_at(mem, &mut pos)? as usize;
        if pos + fst_len > mem.len() {
            return Err(crate::Error::corruption("dictionary fst out of bounds"));
        }
        let fst = fst::Map::new(mem.slice(pos..pos + fst_len)).map_err(convert_fst_error)?;
        Ok(Dictionary {
            fst,
            mem: mem.clone(),
            chunk_factor,
        })
    }

    /// Number of terms in the dictionary.
    pub fn num_terms(&self) -> usize {
        self.fst.len()
    }

    /// Returns the raw dictionary value for `term`, if present.
    pub fn get<K: AsRef<[u8]>>(&self, term: K) -> Option<u64> {
        self.fst.get(term)
    }

    /// A streamer over the dictionary's terms in lexicographic order.
    pub fn streamer(&self) -> DictionaryStreamer<'_> {
        DictionaryStreamer::new(self.fst.stream())
    }

    /// Opens the postings list behind `dict_value`, eliding the docNums of
    /// `except` during iteration.
    pub fn postings_list<'a>(
        &self,
        dict_value: u64,
        except: Option<&'a RoaringBitmap>,
    ) -> Result<PostingsList<'a>> {
        if format::fst_val_is_1hit(dict_value) {
            let (doc_num, norm_bits) = format::fst_val_decode_1hit(dict_value);
            return Ok(PostingsList::one_hit(
                self.mem.clone(),
                self.chunk_factor,
                doc_num,
                norm_bits,
                except,
            ));
        }
        PostingsList::open(self.mem.clone(), self.chunk_factor, dict_value, except)
    }
}

/// Streams a dictionary's `(term, value)` pairs, buffering the current term
/// so it stays addressable between advances.
pub struct DictionaryStreamer<'a> {
    stream: fst::map::Stream<'a>,
    current_key: Vec<u8>,
    current_value: u64,
}

impl<'a> DictionaryStreamer<'a> {
    pub(crate) fn new(stream: fst::map::Stream<'a>) -> DictionaryStreamer<'a> {
        DictionaryStreamer {
            stream,
            current_key: Vec::with_capacity(100),
            current_value: 0u64,
        }
    }

    /// Positions the streamer on the next term. Returns false once exhausted.
    pub fn advance(&mut self) -> bool {
        if let Some((term, value)) = self.stream.next() {
            self.current_key.clear();
            self.current_key.extend_from_slice(term);
            self.current_value = value;
            true
        } else {
            false
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.current_key
    }

    pub fn value(&self) -> u64 {
        self.current_value
    }
}
