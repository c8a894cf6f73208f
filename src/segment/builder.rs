//! Building a new segment from in-memory documents.
//!
//! The builder shares its persist primitives with the merger, so a freshly
//! built segment and a merged one are byte-compatible by construction.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::{fs, mem};

use byteorder::{BigEndian, WriteBytesExt};
use roaring::RoaringBitmap;
use rustc_hash::FxHashMap;

use crate::common::{write_uvarint, write_uvarints, CountingHashWriter};
use crate::error::convert_fst_error;
use crate::segment::contentcoder::ChunkedContentCoder;
use crate::segment::footer::{persist_fields, persist_footer};
use crate::segment::format::{self, FIELD_NOT_UNINVERTED, ID_FIELD_NAME, TERM_SEPARATOR};
use crate::segment::intcoder::ChunkedIntCoder;
use crate::segment::merge::{map_fields, write_postings};
use crate::segment::stored::{compress, persist_stored_field_values};
use crate::{Error, Result};

/// One indexed occurrence of a term within a field.
#[derive(Clone, Debug)]
pub struct Token {
    pub term: Vec<u8>,
    /// 1-based token position.
    pub pos: u64,
    /// Byte offset of the occurrence's start.
    pub start: u64,
    /// Byte offset one past the occurrence's end.
    pub end: u64,
    pub array_positions: Vec<u64>,
}

impl Token {
    pub fn new<T: Into<Vec<u8>>>(term: T, pos: u64, start: u64, end: u64) -> Token {
        Token {
            term: term.into(),
            pos,
            start,
            end,
            array_positions: Vec::new(),
        }
    }
}

/// A value kept in the stored-docs region.
#[derive(Clone, Debug)]
pub struct StoredValue {
    pub value: Vec<u8>,
    /// Caller-defined type byte, `b't'` for text by convention.
    pub value_type: u8,
    pub array_positions: Vec<u64>,
}

/// Everything a document carries for one field: an optional stored value
/// plus the tokens to index. `term_vectors` controls whether token
/// locations are kept in the postings.
#[derive(Clone, Debug)]
pub struct FieldContent {
    pub name: String,
    pub stored: Option<StoredValue>,
    pub tokens: Vec<Token>,
    pub term_vectors: bool,
}

impl FieldContent {
    pub fn new<S: Into<String>>(name: S) -> FieldContent {
        FieldContent {
            name: name.into(),
            stored: None,
            tokens: Vec::new(),
            term_vectors: false,
        }
    }

    /// Text field convenience: stores `text` and indexes its
    /// whitespace-separated tokens with positions and offsets.
    pub fn text<S: Into<String>>(name: S, text: &str) -> FieldContent {
        let mut tokens = Vec::new();
        let mut pos = 0u64;
        let mut offset = 0usize;
        for part in text.split(' ') {
            if !part.is_empty() {
                pos += 1;
                tokens.push(Token::new(
                    part.as_bytes().to_vec(),
                    pos,
                    offset as u64,
                    (offset + part.len()) as u64,
                ));
            }
            offset += part.len() + 1;
        }
        FieldContent {
            name: name.into(),
            stored: Some(StoredValue {
                value: text.as_bytes().to_vec(),
                value_type: b't',
                array_positions: Vec::new(),
            }),
            tokens,
            term_vectors: true,
        }
    }

    pub fn with_stored(mut self, value: Vec<u8>, value_type: u8) -> FieldContent {
        self.stored = Some(StoredValue {
            value,
            value_type,
            array_positions: Vec::new(),
        });
        self
    }

    pub fn with_token(mut self, token: Token) -> FieldContent {
        self.tokens.push(token);
        self
    }

    pub fn with_term_vectors(mut self, term_vectors: bool) -> FieldContent {
        self.term_vectors = term_vectors;
        self
    }
}

/// A document to index: an identifier plus field contents.
#[derive(Clone, Debug)]
pub struct Document {
    pub id: String,
    pub fields: Vec<FieldContent>,
}

impl Document {
    pub fn new<S: Into<String>>(id: S) -> Document {
        Document {
            id: id.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: FieldContent) -> Document {
        self.fields.push(field);
        self
    }
}

struct Hit {
    doc_num: u64,
    freq: u64,
    norm_bits: u64,
    locs: Vec<(u64, u64, u64, Vec<u64>)>,
}

/// Accumulates documents and serializes them into a new segment.
///
/// DocNums are assigned in insertion order. The `_id` field becomes field 0,
/// indexed untokenized so every unique identifier lands in the dictionary
/// with the 1-hit encoding.
pub struct SegmentBuilder {
    chunk_factor: u32,
    docs: Vec<Document>,
}

impl SegmentBuilder {
    pub fn new(chunk_factor: u32) -> Result<SegmentBuilder> {
        if chunk_factor == 0 {
            return Err(Error::invalid_argument("chunk factor must be nonzero"));
        }
        Ok(SegmentBuilder {
            chunk_factor,
            docs: Vec::new(),
        })
    }

    pub fn add_document(&mut self, doc: Document) {
        self.docs.push(doc);
    }

    pub fn num_docs(&self) -> u64 {
        self.docs.len() as u64
    }

    /// Serializes the segment into memory.
    pub fn build(self) -> Result<Vec<u8>> {
        let mut w = CountingHashWriter::wrap(Vec::new());
        self.build_into(&mut w)?;
        Ok(w.finish())
    }

    /// Serializes the segment to `path`, fsyncing before returning the file
    /// size. The partial file is removed on error.
    pub fn build_to_path<P: AsRef<Path>>(self, path: P) -> Result<u64> {
        let path = path.as_ref();
        let bytes = self.build()?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        match file.write_all(&bytes).and_then(|_| file.sync_all()) {
            Ok(()) => Ok(bytes.len() as u64),
            Err(io_error) => {
                drop(file);
                let _ = fs::remove_file(path);
                Err(io_error.into())
            }
        }
    }

    fn build_into<W: Write>(self, w: &mut CountingHashWriter<W>) -> Result<()> {
        let num_docs = self.docs.len() as u64;
        let chunk_factor = self.chunk_factor;

        let (fields_inv, fields_map) = self.field_inventory()?;
        let stored_index_offset = self.persist_stored(&fields_inv, &fields_map, w)?;

        let mut dict_locs = vec![0u64; fields_inv.len()];
        let mut doc_value_offset = FIELD_NOT_UNINVERTED;
        if num_docs > 0 {
            let inverted = self.invert(&fields_inv, &fields_map);
            doc_value_offset = persist_inverted(
                &inverted,
                num_docs,
                chunk_factor,
                &mut dict_locs,
                w,
            )?;
        }

        let fields_index_offset = persist_fields(&fields_inv, &dict_locs, w)?;
        persist_footer(
            num_docs,
            stored_index_offset,
            fields_index_offset,
            doc_value_offset,
            chunk_factor,
            w,
        )?;
        Ok(())
    }

    fn field_inventory(&self) -> Result<(Vec<String>, FxHashMap<String, u16>)> {
        let mut names: std::collections::BTreeSet<&str> = std::collections::BTreeSet::new();
        for doc in &self.docs {
            for field in &doc.fields {
                if field.name == ID_FIELD_NAME {
                    return Err(Error::invalid_argument("the _id field name is reserved"));
                }
                names.insert(&field.name);
            }
        }
        let mut fields_inv = Vec::with_capacity(names.len() + 1);
        fields_inv.push(ID_FIELD_NAME.to_string());
        fields_inv.extend(names.into_iter().map(str::to_string));
        let fields_map = map_fields(&fields_inv);
        Ok((fields_inv, fields_map))
    }

    fn persist_stored<W: Write>(
        &self,
        fields_inv: &[String],
        fields_map: &FxHashMap<String, u16>,
        w: &mut CountingHashWriter<W>,
    ) -> Result<u64> {
        let mut doc_num_offsets = vec![0u64; self.docs.len()];
        let mut meta_buf: Vec<u8> = Vec::new();
        let mut data: Vec<u8> = Vec::new();
        let mut vals: Vec<Vec<Vec<u8>>> = vec![Vec::new(); fields_inv.len()];
        let mut typs: Vec<Vec<u8>> = vec![Vec::new(); fields_inv.len()];
        let mut poss: Vec<Vec<Vec<u64>>> = vec![Vec::new(); fields_inv.len()];

        for (doc_num, doc) in self.docs.iter().enumerate() {
            meta_buf.clear();
            data.clear();
            for field_id in 0..fields_inv.len() {
                vals[field_id].clear();
                typs[field_id].clear();
                poss[field_id].clear();
            }

            vals[0].push(doc.id.as_bytes().to_vec());
            typs[0].push(b't');
            poss[0].push(Vec::new());
            for field in &doc.fields {
                if let Some(stored) = &field.stored {
                    let field_id = (fields_map[&field.name] - 1) as usize;
                    vals[field_id].push(stored.value.clone());
                    typs[field_id].push(stored.value_type);
                    poss[field_id].push(stored.array_positions.clone());
                }
            }

            let mut curr = 0usize;
            for field_id in 0..fields_inv.len() {
                curr = persist_stored_field_values(
                    field_id as u16,
                    &vals[field_id],
                    &typs[field_id],
                    &poss[field_id],
                    curr,
                    &mut meta_buf,
                    &mut data,
                );
            }
            let compressed = compress(&data)?;

            doc_num_offsets[doc_num] = w.count();
            write_uvarints(w, &[meta_buf.len() as u64, compressed.len() as u64])?;
            w.write_all(&meta_buf)?;
            w.write_all(&compressed)?;
        }

        let stored_index_offset = w.count();
        for &doc_num_offset in &doc_num_offsets {
            w.write_u64::<BigEndian>(doc_num_offset)?;
        }
        Ok(stored_index_offset)
    }

    /// Builds the in-memory inverted index: per field, per term, the hits in
    /// ascending docNum order.
    fn invert(
        &self,
        fields_inv: &[String],
        fields_map: &FxHashMap<String, u16>,
    ) -> Vec<BTreeMap<Vec<u8>, Vec<Hit>>> {
        let mut inverted: Vec<BTreeMap<Vec<u8>, Vec<Hit>>> =
            (0..fields_inv.len()).map(|_| BTreeMap::new()).collect();
        let id_norm_bits = u64::from(1.0f32.to_bits());

        for (doc_num, doc) in self.docs.iter().enumerate() {
            let doc_num = doc_num as u64;
            inverted[0].entry(doc.id.as_bytes().to_vec()).or_default().push(Hit {
                doc_num,
                freq: 1,
                norm_bits: id_norm_bits,
                locs: Vec::new(),
            });

            // Field contents sharing a name within one doc feed a single
            // token population, hence a single norm.
            let mut per_field: FxHashMap<usize, (Vec<&Token>, bool)> = FxHashMap::default();
            for field in &doc.fields {
                let field_id = (fields_map[&field.name] - 1) as usize;
                let entry = per_field.entry(field_id).or_default();
                entry.0.extend(field.tokens.iter());
                entry.1 |= field.term_vectors;
            }

            for (field_id, (tokens, term_vectors)) in per_field {
                if tokens.is_empty() {
                    continue;
                }
                let norm = 1.0f32 / (tokens.len() as f32).sqrt();
                let norm_bits = u64::from(norm.to_bits());
                let mut by_term: BTreeMap<&[u8], Vec<&Token>> = BTreeMap::new();
                for token in tokens {
                    by_term.entry(&token.term).or_default().push(token);
                }
                for (term, occurrences) in by_term {
                    let locs = if term_vectors {
                        occurrences
                            .iter()
                            .map(|token| {
                                (token.pos, token.start, token.end, token.array_positions.clone())
                            })
                            .collect()
                    } else {
                        Vec::new()
                    };
                    inverted[field_id].entry(term.to_vec()).or_default().push(Hit {
                        doc_num,
                        freq: occurrences.len() as u64,
                        norm_bits,
                        locs,
                    });
                }
            }
        }
        inverted
    }
}

/// Writes every field's postings, dictionary and doc-value column, then the
/// doc-value locator table. Returns the locator table's offset.
fn persist_inverted<W: Write>(
    inverted: &[BTreeMap<Vec<u8>, Vec<Hit>>],
    num_docs: u64,
    chunk_factor: u32,
    dict_locs: &mut [u64],
    w: &mut CountingHashWriter<W>,
) -> Result<u64> {
    let mut tf_encoder = ChunkedIntCoder::new(u64::from(chunk_factor), num_docs - 1);
    let mut loc_encoder = ChunkedIntCoder::new(u64::from(chunk_factor), num_docs - 1);
    let mut doc_term_map: Vec<Vec<u8>> = vec![Vec::new(); num_docs as usize];
    let mut new_bitmap = RoaringBitmap::new();
    let mut buf_loc: Vec<u64> = Vec::new();
    let mut fst_buf: Vec<u8> = Vec::new();
    let mut field_dv_locs = vec![0u64; inverted.len()];

    for (field_id, terms) in inverted.iter().enumerate() {
        let mut builder =
            fst::MapBuilder::new(mem::take(&mut fst_buf)).map_err(convert_fst_error)?;
        for doc_terms in doc_term_map.iter_mut() {
            doc_terms.clear();
        }

        for (term, hits) in terms {
            let (mut last_doc_num, mut last_freq, mut last_norm) = (0u64, 0u64, 0u64);
            for hit in hits {
                new_bitmap.insert(hit.doc_num as u32);
                let has_locs = !hit.locs.is_empty();
                tf_encoder.add(
                    hit.doc_num,
                    &[format::encode_freq_has_locs(hit.freq, has_locs), hit.norm_bits],
                );
                for (pos, start, end, array_positions) in &hit.locs {
                    buf_loc.clear();
                    buf_loc.extend_from_slice(&[
                        field_id as u64,
                        *pos,
                        *start,
                        *end,
                        array_positions.len() as u64,
                    ]);
                    buf_loc.extend_from_slice(array_positions);
                    loc_encoder.add(hit.doc_num, &buf_loc);
                }
                let doc_terms = &mut doc_term_map[hit.doc_num as usize];
                doc_terms.extend_from_slice(term);
                doc_terms.push(TERM_SEPARATOR);

                last_doc_num = hit.doc_num;
                last_freq = hit.freq;
                last_norm = hit.norm_bits;
            }

            tf_encoder.close();
            loc_encoder.close();
            let loc_empty = loc_encoder.final_size() == 0;
            let min_doc = u64::from(new_bitmap.min().unwrap_or(0));
            let use_1hit_encoding = |term_cardinality: u64| -> Option<(u64, u64)> {
                if term_cardinality == 1
                    && loc_empty
                    && format::under_32_bits(min_doc)
                    && min_doc == last_doc_num
                    && last_freq == 1
                {
                    Some((min_doc, last_norm))
                } else {
                    None
                }
            };
            let postings_offset =
                write_postings(&new_bitmap, &tf_encoder, &loc_encoder, use_1hit_encoding, w)?;
            if postings_offset > 0 {
                builder.insert(term, postings_offset).map_err(convert_fst_error)?;
            }
            new_bitmap.clear();
            tf_encoder.reset();
            loc_encoder.reset();
        }

        let dict_offset = w.count();
        let fst_bytes = builder.into_inner().map_err(convert_fst_error)?;
        write_uvarint(w, fst_bytes.len() as u64)?;
        w.write_all(&fst_bytes)?;
        dict_locs[field_id] = dict_offset;
        fst_buf = fst_bytes;
        fst_buf.clear();

        let mut fdv_encoder = ChunkedContentCoder::new(u64::from(chunk_factor), num_docs - 1);
        for (doc_num, doc_terms) in doc_term_map.iter().enumerate() {
            if !doc_terms.is_empty() {
                fdv_encoder.add(doc_num as u64, doc_terms);
            }
        }
        fdv_encoder.close();
        field_dv_locs[field_id] = w.count();
        fdv_encoder.write(w)?;
    }

    let field_dv_locs_offset = w.count();
    for &field_dv_loc in &field_dv_locs {
        write_uvarint(w, field_dv_loc)?;
    }
    Ok(field_dv_locs_offset)
}

#[cfg(test)]
mod tests {
    use super::{Document, FieldContent, SegmentBuilder, Token};
    use crate::segment::format;
    use crate::Segment;

    fn two_doc_segment() -> Segment {
        let mut builder = SegmentBuilder::new(4).unwrap();
        builder.add_document(
            Document::new("a").with_field(FieldContent::text("body", "hello world hello")),
        );
        builder.add_document(Document::new("b").with_field(FieldContent::text("body", "world")));
        Segment::from_bytes(builder.build().unwrap()).unwrap()
    }

    #[test]
    fn test_build_and_read_back() {
        let segment = two_doc_segment();
        assert_eq!(segment.num_docs(), 2);
        assert_eq!(segment.chunk_factor(), 4);
        assert_eq!(segment.fields(), &["_id".to_string(), "body".to_string()]);

        let mut stored: Vec<(String, Vec<u8>)> = Vec::new();
        segment
            .visit_document(0, |field, _typ, value, _pos| {
                stored.push((field.to_string(), value.to_vec()));
                true
            })
            .unwrap();
        assert_eq!(
            stored,
            vec![
                ("_id".to_string(), b"a".to_vec()),
                ("body".to_string(), b"hello world hello".to_vec()),
            ]
        );
    }

    #[test]
    fn test_unique_ids_are_one_hit() {
        let segment = two_doc_segment();
        let dict = segment.dictionary("_id").unwrap().unwrap();
        assert_eq!(dict.num_terms(), 2);
        let val = dict.get(b"b").unwrap();
        assert!(format::fst_val_is_1hit(val));
        let (doc_num, norm_bits) = format::fst_val_decode_1hit(val);
        assert_eq!(doc_num, 1);
        assert_eq!(f32::from_bits(norm_bits as u32), 1.0);
    }

    #[test]
    fn test_postings_with_locations() {
        let segment = two_doc_segment();
        let dict = segment.dictionary("body").unwrap().unwrap();
        let postings = dict.postings_list(dict.get(b"hello").unwrap(), None).unwrap();
        assert_eq!(postings.doc_count(), 1);
        let mut itr = postings.iterator().unwrap();
        let posting = itr.next().unwrap().unwrap();
        assert_eq!(posting.doc_num, 0);
        assert_eq!(posting.freq, 2);
        assert!((posting.norm - 1.0 / 3.0f32.sqrt()).abs() < 1e-6);
        assert_eq!(posting.locations.len(), 2);
        assert_eq!(posting.locations[0].pos, 1);
        assert_eq!(posting.locations[0].start, 0);
        assert_eq!(posting.locations[0].end, 5);
        assert_eq!(posting.locations[1].pos, 3);
        assert!(itr.next().unwrap().is_none());
    }

    #[test]
    fn test_doc_values_round_trip() {
        let segment = two_doc_segment();
        assert_eq!(
            segment.doc_value_terms("body", 0).unwrap(),
            vec![b"hello".to_vec(), b"world".to_vec()]
        );
        assert_eq!(
            segment.doc_value_terms("body", 1).unwrap(),
            vec![b"world".to_vec()]
        );
        assert_eq!(
            segment.doc_value_terms("_id", 1).unwrap(),
            vec![b"b".to_vec()]
        );
    }

    #[test]
    fn test_empty_builder_is_a_valid_segment() {
        let builder = SegmentBuilder::new(16).unwrap();
        let segment = Segment::from_bytes(builder.build().unwrap()).unwrap();
        assert_eq!(segment.num_docs(), 0);
        assert_eq!(segment.fields(), &["_id".to_string()]);
        assert!(segment.dictionary("_id").unwrap().is_none());
    }

    #[test]
    fn test_reserved_id_field_rejected() {
        let mut builder = SegmentBuilder::new(16).unwrap();
        builder.add_document(Document::new("a").with_field(FieldContent::new("_id")));
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_untokenized_field_without_term_vectors() {
        let mut builder = SegmentBuilder::new(4).unwrap();
        builder.add_document(
            Document::new("a").with_field(
                FieldContent::new("tag")
                    .with_stored(b"exact".to_vec(), b't')
                    .with_token(Token::new("exact", 1, 0, 5)),
            ),
        );
        let segment = Segment::from_bytes(builder.build().unwrap()).unwrap();
        let dict = segment.dictionary("tag").unwrap().unwrap();
        let val = dict.get(b"exact").unwrap();
        // freq 1, no locations, single doc: the 1-hit shortcut applies.
        assert!(format::fst_val_is_1hit(val));
    }
}
