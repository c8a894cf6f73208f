use std::fs;
use std::io;
use std::io::Write;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use ownedbytes::OwnedBytes;
use rustc_hash::FxHashMap;

use crate::common::{read_uvarint_at, CountingHashWriter};
use crate::segment::dictionary::Dictionary;
use crate::segment::footer;
use crate::segment::format::{FIELD_NOT_UNINVERTED, FOOTER_LEN, TERM_SEPARATOR};
use crate::{Error, Result};

/// An immutable segment, opened for reading.
///
/// The whole file is held as one sliceable byte view; every access resolves
/// offsets recorded at write time. Opening validates the footer checksum.
pub struct Segment {
    mem: OwnedBytes,
    num_docs: u64,
    stored_index_offset: u64,
    doc_value_offset: u64,
    chunk_factor: u32,
    fields_inv: Vec<String>,
    fields_map: FxHashMap<String, u16>,
    dict_locs: Vec<u64>,
    dv_locs: Vec<u64>,
}

impl Segment {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Segment> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|io_error| {
            if io_error.kind() == io::ErrorKind::NotFound {
                Error::PathDoesNotExist(path.to_path_buf())
            } else {
                Error::Io(io_error)
            }
        })?;
        Segment::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Segment> {
        Segment::from_owned_bytes(OwnedBytes::new(bytes))
    }

    pub fn from_owned_bytes(mem: OwnedBytes) -> Result<Segment> {
        let footer = footer::parse_footer(&mem)?;
        let fields_index_end = (mem.len() - FOOTER_LEN) as u64;
        if footer.fields_index_offset > fields_index_end {
            return Err(Error::corruption("fields index beyond footer"));
        }
        // The fields index immediately precedes the footer, which is how the
        // number of fields is recovered.
        let num_fields = ((fields_index_end - footer.fields_index_offset) / 8) as usize;
        let mut fields_inv = Vec::with_capacity(num_fields);
        let mut dict_locs = Vec::with_capacity(num_fields);
        for field_id in 0..num_fields {
            let entry = footer.fields_index_offset as usize + 8 * field_id;
            let mut pos = BigEndian::read_u64(&mem[entry..entry + 8]) as usize;
            let dict_loc = read_uvarint_at(&mem, &mut pos)?;
            let name_len = read_uvarint_at(&mem, &mut pos)? as usize;
            if pos + name_len > mem.len() {
                return Err(Error::corruption("field name out of bounds"));
            }
            let name = std::str::from_utf8(&mem[pos..pos + name_len])
                .map_err(|_| Error::corruption("field name is not utf-8"))?
                .to_string();
            fields_inv.push(name);
            dict_locs.push(dict_loc);
        }
        let mut fields_map = FxHashMap::default();
        for (field_id, name) in fields_inv.iter().enumerate() {
            fields_map.insert(name.clone(), field_id as u16 + 1);
        }
        let dv_locs = if footer.doc_value_offset != FIELD_NOT_UNINVERTED {
            let mut pos = footer.doc_value_offset as usize;
            let mut dv_locs = Vec::with_capacity(num_fields);
            for _ in 0..num_fields {
                dv_locs.push(read_uvarint_at(&mem, &mut pos)?);
            }
            dv_locs
        } else {
            Vec::new()
        };
        Ok(Segment {
            mem,
            num_docs: footer.num_docs,
            stored_index_offset: footer.stored_index_offset,
            doc_value_offset: footer.doc_value_offset,
            chunk_factor: footer.chunk_factor,
            fields_inv,
            fields_map,
            dict_locs,
            dv_locs,
        })
    }

    /// Number of documents in the segment.
    pub fn num_docs(&self) -> u64 {
        self.num_docs
    }

    pub fn chunk_factor(&self) -> u32 {
        self.chunk_factor
    }

    /// Field names in fieldID order.
    pub fn fields(&self) -> &[String] {
        &self.fields_inv
    }

    /// Resolves a field name to its fieldID.
    pub fn field_id(&self, field: &str) -> Option<u16> {
        self.fields_map.get(field).map(|&id_plus_one| id_plus_one - 1)
    }

    /// Opens the field's term dictionary, or `None` when the segment has no
    /// terms for it.
    pub fn dictionary(&self, field: &str) -> Result<Option<Dictionary>> {
        let field_id = match self.field_id(field) {
            Some(field_id) => field_id,
            None => return Ok(None),
        };
        let dict_loc = self.dict_locs[field_id as usize];
        if dict_loc == 0 {
            return Ok(None);
        }
        Dictionary::open(&self.mem, dict_loc, self.chunk_factor).map(Some)
    }

    /// Calls `visitor` for every stored value of the document, with the field
    /// name, the type byte, the value bytes and the array positions. The
    /// visitor returns false to stop early.
    pub fn visit_document<V>(&self, doc_num: u64, mut visitor: V) -> Result<()>
    where
        V: FnMut(&str, u8, &[u8], &[u64]) -> bool,
    {
        if doc_num >= self.num_docs {
            return Err(Error::invalid_argument(format!(
                "doc {doc_num} beyond segment of {} docs",
                self.num_docs
            )));
        }
        let (_, stored_offset, read_len, meta_len, data_len) = self.doc_stored_offsets(doc_num)?;
        let meta_start = (stored_offset + read_len) as usize;
        let data_start = meta_start + meta_len as usize;
        let data_end = data_start + data_len as usize;
        if data_end > self.mem.len() {
            return Err(Error::corruption("stored doc out of bounds"));
        }
        let meta = &self.mem[meta_start..data_start];
        let uncompressed = snap::raw::Decoder::new()
            .decompress_vec(&self.mem[data_start..data_end])
            .map_err(|e| Error::corruption(format!("stored data undecodable: {e}")))?;

        let mut pos = 0;
        let mut array_positions: Vec<u64> = Vec::new();
        while pos < meta.len() {
            let field_id = read_uvarint_at(meta, &mut pos)? as usize;
            let value_type = read_uvarint_at(meta, &mut pos)? as u8;
            let offset = read_uvarint_at(meta, &mut pos)? as usize;
            let value_len = read_uvarint_at(meta, &mut pos)? as usize;
            let num_array_positions = read_uvarint_at(meta, &mut pos)?;
            array_positions.clear();
            for _ in 0..num_array_positions {
                array_positions.push(read_uvarint_at(meta, &mut pos)?);
            }
            let field_name = self
                .fields_inv
                .get(field_id)
                .ok_or_else(|| Error::corruption("stored value names an unknown field"))?;
            let value = uncompressed
                .get(offset..offset + value_len)
                .ok_or_else(|| Error::corruption("stored value out of bounds"))?;
            if !visitor(field_name, value_type, value, &array_positions) {
                break;
            }
        }
        Ok(())
    }

    /// Terms recorded in the field's doc-value column for `doc_num`.
    pub fn doc_value_terms(&self, field: &str, doc_num: u64) -> Result<Vec<Vec<u8>>> {
        let field_id = match self.field_id(field) {
            Some(field_id) => field_id as usize,
            None => return Ok(Vec::new()),
        };
        if self.dv_locs.is_empty() {
            return Ok(Vec::new());
        }
        let mut pos = self.dv_locs[field_id] as usize;
        let num_chunks = read_uvarint_at(&self.mem, &mut pos)?;
        let mut chunk_lens = Vec::with_capacity(num_chunks as usize);
        for _ in 0..num_chunks {
            chunk_lens.push(read_uvarint_at(&self.mem, &mut pos)?);
        }
        let chunk = doc_num / u64::from(self.chunk_factor);
        if chunk >= num_chunks || chunk_lens[chunk as usize] == 0 {
            return Ok(Vec::new());
        }
        let skipped: u64 = chunk_lens[..chunk as usize].iter().sum();
        let chunk_start = pos + skipped as usize;
        let chunk_end = chunk_start + chunk_lens[chunk as usize] as usize;
        if chunk_end > self.mem.len() {
            return Err(Error::corruption("doc value chunk out of bounds"));
        }
        let chunk_data = &self.mem[chunk_start..chunk_end];

        let mut pos = 0;
        let num_docs_in_chunk = read_uvarint_at(chunk_data, &mut pos)?;
        let mut payload_start = 0usize;
        let mut found: Option<(usize, usize)> = None;
        for _ in 0..num_docs_in_chunk {
            let entry_doc_num = read_uvarint_at(chunk_data, &mut pos)?;
            let payload_len = read_uvarint_at(chunk_data, &mut pos)? as usize;
            if entry_doc_num == doc_num {
                found = Some((payload_start, payload_len));
            }
            payload_start += payload_len;
        }
        let (start, len) = match found {
            Some(span) => span,
            None => return Ok(Vec::new()),
        };
        let payload = chunk_data
            .get(pos + start..pos + start + len)
            .ok_or_else(|| Error::corruption("doc value payload out of bounds"))?;
        Ok(payload
            .split(|&b| b == TERM_SEPARATOR)
            .filter(|term| !term.is_empty())
            .map(<[u8]>::to_vec)
            .collect())
    }

    /// Raw byte view of the whole segment.
    pub fn mem(&self) -> &OwnedBytes {
        &self.mem
    }

    pub(crate) fn doc_stored_offsets(&self, doc_num: u64) -> Result<(u64, u64, u64, u64, u64)> {
        let index_offset = self.stored_index_offset + 8 * doc_num;
        if index_offset as usize + 8 > self.mem.len() {
            return Err(Error::corruption("stored index out of bounds"));
        }
        let stored_offset = BigEndian::read_u64(&self.mem[index_offset as usize..][..8]);
        let mut pos = stored_offset as usize;
        let meta_len = read_uvarint_at(&self.mem, &mut pos)?;
        let data_len = read_uvarint_at(&self.mem, &mut pos)?;
        let read_len = pos as u64 - stored_offset;
        Ok((index_offset, stored_offset, read_len, meta_len, data_len))
    }

    /// Writes out the segment's whole stored-docs region with a single write,
    /// filling `new_doc_num_offsets` with each doc's rebased offset.
    ///
    /// Only sound because stored docs are laid out contiguously in docNum
    /// order, directly followed by the stored index.
    pub(crate) fn copy_stored_docs<W: Write>(
        &self,
        mut new_doc_num: u64,
        new_doc_num_offsets: &mut [u64],
        w: &mut CountingHashWriter<W>,
    ) -> Result<()> {
        if self.num_docs == 0 {
            return Ok(());
        }
        let (index_offset0, stored_offset0, _, _, _) = self.doc_stored_offsets(0)?;
        let (index_offset_n, stored_offset_n, read_n, meta_len_n, data_len_n) =
            self.doc_stored_offsets(self.num_docs - 1)?;
        let region_end = (stored_offset_n + read_n + meta_len_n + data_len_n) as usize;
        if region_end > self.stored_index_offset as usize {
            return Err(Error::corruption("stored region overlaps its index"));
        }
        let stored_offset0_new = w.count();
        w.write_all(&self.mem[stored_offset0 as usize..region_end])?;

        let mut index_offset = index_offset0;
        while index_offset <= index_offset_n {
            let stored_offset = BigEndian::read_u64(&self.mem[index_offset as usize..][..8]);
            let stored_offset_new = stored_offset - stored_offset0 + stored_offset0_new;
            new_doc_num_offsets[new_doc_num as usize] = stored_offset_new;
            new_doc_num += 1;
            index_offset += 8;
        }
        Ok(())
    }
}
