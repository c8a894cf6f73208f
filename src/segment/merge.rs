//! Merging several segments into one.
//!
//! The merger walks the inputs exactly once and produces the output file
//! append-only: stored docs first, then every field's dictionary, postings
//! and doc-value column, then the fields index and the footer. Tombstoned
//! docs are dropped and the survivors renumbered into a dense docNum space
//! shared by every output stream.

use std::collections::BTreeSet;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::{fs, mem};

use roaring::RoaringBitmap;
use rustc_hash::FxHashMap;

use crate::common::{write_uvarint, CountingHashWriter};
use crate::error::convert_fst_error;
use crate::segment::contentcoder::ChunkedContentCoder;
use crate::segment::dictionary::Dictionary;
use crate::segment::footer::{persist_fields, persist_footer};
use crate::segment::format::{
    self, DOC_DROPPED, FIELD_NOT_UNINVERTED, ID_FIELD_NAME, TERM_SEPARATOR,
};
use crate::segment::intcoder::ChunkedIntCoder;
use crate::segment::postings::PostingsIterator;
use crate::segment::reader::Segment;
use crate::segment::stored::merge_stored_and_remap;
use crate::segment::term_merger::TermMerger;
use crate::{Error, Result};

/// Size of the buffer sitting between the merger and the output file.
pub const DEFAULT_MERGE_BUFFER_SIZE: usize = 1024 * 1024;

/// Merges `segments`, each paired with an optional bitmap of docNums to
/// drop, into a new segment file at `path`.
///
/// Returns one remap table per input segment (old docNum to new docNum, with
/// [`DOC_DROPPED`] marking deleted docs) and the size of the file written.
/// On error the partial output file is removed.
pub fn merge(
    segments: &[&Segment],
    drops: &[Option<&RoaringBitmap>],
    path: &Path,
    chunk_factor: u32,
) -> Result<(Vec<Vec<u64>>, u64)> {
    if chunk_factor == 0 {
        return Err(Error::invalid_argument("chunk factor must be nonzero"));
    }
    if segments.len() != drops.len() {
        return Err(Error::invalid_argument(
            "one tombstone bitmap slot is required per segment",
        ));
    }
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    match merge_to_file(&file, segments, drops, chunk_factor) {
        Ok((new_doc_nums, file_size)) => {
            log::info!(
                "merged {} segments into {:?}: {} bytes",
                segments.len(),
                path,
                file_size
            );
            Ok((new_doc_nums, file_size))
        }
        Err(e) => {
            drop(file);
            let _ = fs::remove_file(path);
            Err(e)
        }
    }
}

fn merge_to_file(
    file: &fs::File,
    segments: &[&Segment],
    drops: &[Option<&RoaringBitmap>],
    chunk_factor: u32,
) -> Result<(Vec<Vec<u64>>, u64)> {
    let buffered = BufWriter::with_capacity(DEFAULT_MERGE_BUFFER_SIZE, file);
    let mut w = CountingHashWriter::wrap(buffered);
    let merged = merge_to_writer(segments, drops, chunk_factor, &mut w)?;
    persist_footer(
        merged.num_docs,
        merged.stored_index_offset,
        merged.fields_index_offset,
        merged.doc_value_offset,
        chunk_factor,
        &mut w,
    )?;
    let file_size = w.count();
    let mut buffered = w.finish();
    buffered.flush()?;
    file.sync_all()?;
    Ok((merged.new_doc_nums, file_size))
}

/// What [`merge_to_writer`] produced, section offsets included, so callers
/// embedding the merger in a larger file can write their own footer.
pub struct MergedSegment {
    pub new_doc_nums: Vec<Vec<u64>>,
    pub num_docs: u64,
    pub stored_index_offset: u64,
    pub fields_index_offset: u64,
    pub doc_value_offset: u64,
    pub dict_locs: Vec<u64>,
    pub fields_inv: Vec<String>,
}

/// Runs the whole merge against an arbitrary counting writer: field
/// unification, stored-doc remapping, per-field postings and doc values,
/// then the fields index. The footer is left to the caller.
pub fn merge_to_writer<W: Write>(
    segments: &[&Segment],
    drops: &[Option<&RoaringBitmap>],
    chunk_factor: u32,
    w: &mut CountingHashWriter<W>,
) -> Result<MergedSegment> {
    let mut doc_value_offset = FIELD_NOT_UNINVERTED;
    let (fields_same, fields_inv) = merge_fields(segments);
    let fields_map = map_fields(&fields_inv);
    let num_docs = compute_new_doc_count(segments, drops);
    log::debug!(
        "merging {} segments: {} docs, {} fields, fields_same={}",
        segments.len(),
        num_docs,
        fields_inv.len(),
        fields_same
    );

    let new_doc_nums: Vec<Vec<u64>>;
    let dict_locs: Vec<u64>;
    let mut stored_index_offset = 0u64;
    if num_docs > 0 {
        let (offset, remapped) = merge_stored_and_remap(
            segments,
            drops,
            &fields_map,
            &fields_inv,
            fields_same,
            num_docs,
            w,
        )?;
        stored_index_offset = offset;
        let (locs, dv_offset) = persist_merged_rest(
            segments,
            drops,
            &fields_inv,
            &fields_map,
            fields_same,
            &remapped,
            num_docs,
            chunk_factor,
            w,
        )?;
        new_doc_nums = remapped;
        dict_locs = locs;
        doc_value_offset = dv_offset;
    } else {
        // Nothing survives. The remap tables still answer for every input
        // doc, and the fields index still lists the merged inventory.
        new_doc_nums = segments
            .iter()
            .map(|segment| vec![DOC_DROPPED; segment.num_docs() as usize])
            .collect();
        dict_locs = vec![0u64; fields_inv.len()];
    }

    let fields_index_offset = persist_fields(&fields_inv, &dict_locs, w)?;

    Ok(MergedSegment {
        new_doc_nums,
        num_docs,
        stored_index_offset,
        fields_index_offset,
        doc_value_offset,
        dict_locs,
        fields_inv,
    })
}

/// Builds the unified field list across all input segments and reports
/// whether every segment carries the exact same ordered list.
///
/// `fields_same` does not say anything about the merged numbering; it only
/// asserts stored and location records need no remapping.
pub(crate) fn merge_fields(segments: &[&Segment]) -> (bool, Vec<String>) {
    let mut fields_same = true;

    let segment0_fields: &[String] = segments
        .first()
        .map(|segment| segment.fields())
        .unwrap_or(&[]);

    let mut fields_exist: BTreeSet<&str> = BTreeSet::new();
    for segment in segments {
        let fields = segment.fields();
        for (field_i, field) in fields.iter().enumerate() {
            fields_exist.insert(field);
            if segment0_fields.len() != fields.len() || &segment0_fields[field_i] != field {
                fields_same = false;
            }
        }
    }

    // _id stays first; everything else follows in lexicographic order.
    let mut rv = Vec::with_capacity(fields_exist.len() + 1);
    rv.push(ID_FIELD_NAME.to_string());
    for field in fields_exist {
        if field != ID_FIELD_NAME {
            rv.push(field.to_string());
        }
    }

    (fields_same, rv)
}

/// Maps each field name to fieldID+1, zero staying reserved for "unknown".
pub(crate) fn map_fields(fields: &[String]) -> FxHashMap<String, u16> {
    let mut rv = FxHashMap::default();
    rv.reserve(fields.len());
    for (field_i, field) in fields.iter().enumerate() {
        rv.insert(field.clone(), field_i as u16 + 1);
    }
    rv
}

/// How many documents the merged segment will hold once obsoleted docs are
/// dropped.
pub(crate) fn compute_new_doc_count(
    segments: &[&Segment],
    drops: &[Option<&RoaringBitmap>],
) -> u64 {
    segments
        .iter()
        .zip(drops)
        .map(|(segment, seg_drops)| segment.num_docs() - seg_drops.map_or(0, RoaringBitmap::len))
        .sum()
}

/// Merges dictionaries, postings and doc values for every field, then the
/// trailing per-field doc-value locator table.
///
/// Returns the dictionary offsets (indexed by fieldID) and the locator
/// table's offset.
#[allow(clippy::too_many_arguments)]
pub(crate) fn persist_merged_rest<W: Write>(
    segments: &[&Segment],
    drops: &[Option<&RoaringBitmap>],
    fields_inv: &[String],
    fields_map: &FxHashMap<String, u16>,
    fields_same: bool,
    new_doc_nums_in: &[Vec<u64>],
    new_seg_doc_count: u64,
    chunk_factor: u32,
    w: &mut CountingHashWriter<W>,
) -> Result<(Vec<u64>, u64)> {
    let mut rv = vec![0u64; fields_inv.len()];
    let mut field_dv_locs = vec![0u64; fields_inv.len()];

    let mut tf_encoder = ChunkedIntCoder::new(u64::from(chunk_factor), new_seg_doc_count - 1);
    let mut loc_encoder = ChunkedIntCoder::new(u64::from(chunk_factor), new_seg_doc_count - 1);

    // Keyed by new docNum. An array beats a sparse map here since docs tend
    // to share structure, and the buffers are reused field after field.
    let mut doc_term_map: Vec<Vec<u8>> = vec![Vec::new(); new_seg_doc_count as usize];

    let mut buf_loc: Vec<u64> = Vec::new();
    let mut fst_buf: Vec<u8> = Vec::new();
    let mut new_bitmap = RoaringBitmap::new();

    for (field_id, field_name) in fields_inv.iter().enumerate() {
        // Collect, per segment carrying this field, its remap table, its
        // tombstones, its source field list and its dictionary.
        let mut new_doc_nums: Vec<&[u64]> = Vec::with_capacity(segments.len());
        let mut seg_drops: Vec<Option<&RoaringBitmap>> = Vec::with_capacity(segments.len());
        let mut seg_fields: Vec<&[String]> = Vec::with_capacity(segments.len());
        let mut dicts: Vec<Dictionary> = Vec::with_capacity(segments.len());
        for (seg_i, segment) in segments.iter().enumerate() {
            if let Some(dict) = segment.dictionary(field_name)? {
                new_doc_nums.push(&new_doc_nums_in[seg_i]);
                seg_drops.push(drops[seg_i].filter(|d| !d.is_empty()));
                seg_fields.push(segment.fields());
                dicts.push(dict);
            }
        }

        for doc_terms in doc_term_map.iter_mut() {
            doc_terms.clear();
        }

        let mut builder =
            fst::MapBuilder::new(mem::take(&mut fst_buf)).map_err(convert_fst_error)?;
        new_bitmap.clear();
        tf_encoder.reset();
        loc_encoder.reset();

        let mut term_count = 0u64;
        let (mut last_doc_num, mut last_freq, mut last_norm) = (0u64, 0u64, 0u64);

        let mut merger = TermMerger::new(dicts.iter().map(Dictionary::streamer).collect());
        while merger.advance() {
            let term = merger.key();
            for item in merger.current_kvs() {
                let ord = item.segment_ord;
                let postings = dicts[ord].postings_list(item.value(), seg_drops[ord])?;
                let mut post_itr = postings.iterator()?;
                let run_last = if fields_same {
                    // The on-disk field numbering matches the output's, so
                    // the encoded freq/norm/loc bytes move as they are.
                    merge_term_freq_norm_locs_by_copying(
                        term,
                        &mut post_itr,
                        new_doc_nums[ord],
                        &mut new_bitmap,
                        &mut tf_encoder,
                        &mut loc_encoder,
                        &mut doc_term_map,
                    )?
                } else {
                    merge_term_freq_norm_locs(
                        fields_map,
                        seg_fields[ord],
                        term,
                        &mut post_itr,
                        new_doc_nums[ord],
                        &mut new_bitmap,
                        &mut tf_encoder,
                        &mut loc_encoder,
                        &mut doc_term_map,
                        &mut buf_loc,
                    )?
                };
                // A fully tombstoned run yields nothing and must not clobber
                // the trackers backing the 1-hit decision.
                if let Some((doc_num, freq, norm)) = run_last {
                    last_doc_num = doc_num;
                    last_freq = freq;
                    last_norm = norm;
                }
            }

            // Close out the term.
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
            last_doc_num = 0;
            last_freq = 0;
            last_norm = 0;
            term_count += 1;
        }

        let dict_offset = w.count();
        let fst_bytes = builder.into_inner().map_err(convert_fst_error)?;
        write_uvarint(w, fst_bytes.len() as u64)?;
        w.write_all(&fst_bytes)?;
        rv[field_id] = dict_offset;
        log::debug!("field '{}': {} terms merged", field_name, term_count);

        // Reuse the fst scratch allocation for the next field.
        fst_buf = fst_bytes;
        fst_buf.clear();

        // Uninvert this field's terms into its doc-value column.
        let mut fdv_encoder =
            ChunkedContentCoder::new(u64::from(chunk_factor), new_seg_doc_count - 1);
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

    Ok((rv, field_dv_locs_offset))
}

/// Re-encoding per-term merge: every hit is decoded, remapped and fed back
/// through the coders, with location fieldIDs translated into the merged
/// numbering. Returns the last `(docNum, freq, normBits)` seen, or `None`
/// for an empty run.
#[allow(clippy::too_many_arguments)]
fn merge_term_freq_norm_locs(
    fields_map: &FxHashMap<String, u16>,
    src_fields: &[String],
    term: &[u8],
    post_itr: &mut PostingsIterator,
    new_doc_nums: &[u64],
    new_bitmap: &mut RoaringBitmap,
    tf_encoder: &mut ChunkedIntCoder,
    loc_encoder: &mut ChunkedIntCoder,
    doc_term_map: &mut [Vec<u8>],
    buf_loc: &mut Vec<u64>,
) -> Result<Option<(u64, u64, u64)>> {
    let mut last = None;
    while let Some(next) = post_itr.next()? {
        let hit_new_doc_num = new_doc_nums[next.doc_num as usize];
        if hit_new_doc_num == DOC_DROPPED {
            return Err(Error::corruption("saw hit with dropped docNum"));
        }
        new_bitmap.insert(hit_new_doc_num as u32);

        let norm_bits = u64::from(next.norm.to_bits());
        let has_locs = !next.locations.is_empty();
        tf_encoder.add(
            hit_new_doc_num,
            &[format::encode_freq_has_locs(next.freq, has_locs), norm_bits],
        );

        for loc in &next.locations {
            let loc_field_name = src_fields
                .get(usize::from(loc.field_id))
                .ok_or_else(|| Error::corruption("location names an unknown source field"))?;
            let loc_field_id = fields_map
                .get(loc_field_name)
                .map(|&field_id_plus_one| u64::from(field_id_plus_one) - 1)
                .ok_or_else(|| {
                    Error::corruption("location field missing from the merged inventory")
                })?;
            buf_loc.clear();
            buf_loc.extend_from_slice(&[
                loc_field_id,
                loc.pos,
                loc.start,
                loc.end,
                loc.array_positions.len() as u64,
            ]);
            buf_loc.extend_from_slice(&loc.array_positions);
            loc_encoder.add(hit_new_doc_num, buf_loc);
        }

        let doc_terms = &mut doc_term_map[hit_new_doc_num as usize];
        doc_terms.extend_from_slice(term);
        doc_terms.push(TERM_SEPARATOR);

        last = Some((hit_new_doc_num, next.freq, norm_bits));
    }
    Ok(last)
}

/// Byte-copying per-term merge, valid when the field numbering is shared:
/// the source's encoded freq/norm and loc chunk bytes are appended without
/// re-encoding.
fn merge_term_freq_norm_locs_by_copying(
    term: &[u8],
    post_itr: &mut PostingsIterator,
    new_doc_nums: &[u64],
    new_bitmap: &mut RoaringBitmap,
    tf_encoder: &mut ChunkedIntCoder,
    loc_encoder: &mut ChunkedIntCoder,
    doc_term_map: &mut [Vec<u8>],
) -> Result<Option<(u64, u64, u64)>> {
    let mut last = None;
    while let Some((doc_num, freq, norm_bits, freq_norm_bytes, loc_bytes)) =
        post_itr.next_bytes()?
    {
        let hit_new_doc_num = new_doc_nums[doc_num as usize];
        if hit_new_doc_num == DOC_DROPPED {
            return Err(Error::corruption("saw hit with dropped docNum"));
        }
        new_bitmap.insert(hit_new_doc_num as u32);
        tf_encoder.add_bytes(hit_new_doc_num, freq_norm_bytes);
        if !loc_bytes.is_empty() {
            loc_encoder.add_bytes(hit_new_doc_num, loc_bytes);
        }

        let doc_terms = &mut doc_term_map[hit_new_doc_num as usize];
        doc_terms.extend_from_slice(term);
        doc_terms.push(TERM_SEPARATOR);

        last = Some((hit_new_doc_num, freq, norm_bits));
    }
    Ok(last)
}

/// Serializes one term's postings: the TF stream, the loc stream, then the
/// postings record referencing both plus the length-prefixed bitmap.
///
/// Returns 0 for an empty bitmap, a packed dictionary value when the 1-hit
/// predicate accepts, and the postings record offset otherwise.
pub(crate) fn write_postings<W, F>(
    postings: &RoaringBitmap,
    tf_encoder: &ChunkedIntCoder,
    loc_encoder: &ChunkedIntCoder,
    use_1hit_encoding: F,
    w: &mut CountingHashWriter<W>,
) -> Result<u64>
where
    W: Write,
    F: FnOnce(u64) -> Option<(u64, u64)>,
{
    let term_cardinality = postings.len();
    if term_cardinality == 0 {
        return Ok(0);
    }
    if let Some((doc_num_1hit, norm_bits_1hit)) = use_1hit_encoding(term_cardinality) {
        return Ok(format::fst_val_encode_1hit(doc_num_1hit, norm_bits_1hit));
    }

    let tf_offset = w.count();
    tf_encoder.write(w)?;
    let loc_offset = w.count();
    loc_encoder.write(w)?;

    let postings_offset = w.count();
    write_uvarint(w, tf_offset)?;
    write_uvarint(w, loc_offset)?;
    write_uvarint(w, postings.serialized_size() as u64)?;
    postings
        .serialize_into(&mut *w)
        .map_err(|e| Error::corruption(format!("bitmap serialization failed: {e}")))?;
    Ok(postings_offset)
}

#[cfg(test)]
mod tests {
    use super::{compute_new_doc_count, map_fields, merge_fields};
    use crate::{Document, FieldContent, Segment, SegmentBuilder};
    use roaring::RoaringBitmap;

    fn segment_with_fields(id: &str, fields: &[&str]) -> Segment {
        let mut builder = SegmentBuilder::new(4).unwrap();
        let mut doc = Document::new(id);
        for field in fields {
            doc = doc.with_field(FieldContent::text(*field, "x"));
        }
        builder.add_document(doc);
        Segment::from_bytes(builder.build().unwrap()).unwrap()
    }

    #[test]
    fn test_merge_fields_same_order() {
        let a = segment_with_fields("a", &["body", "title"]);
        let b = segment_with_fields("b", &["body", "title"]);
        let (fields_same, fields_inv) = merge_fields(&[&a, &b]);
        assert!(fields_same);
        assert_eq!(fields_inv, vec!["_id", "body", "title"]);
    }

    #[test]
    fn test_merge_fields_disjoint() {
        let a = segment_with_fields("a", &["title"]);
        let b = segment_with_fields("b", &["body"]);
        let (fields_same, fields_inv) = merge_fields(&[&a, &b]);
        assert!(!fields_same);
        assert_eq!(fields_inv, vec!["_id", "body", "title"]);
    }

    #[test]
    fn test_map_fields_reserves_zero() {
        let fields = vec!["_id".to_string(), "title".to_string()];
        let map = map_fields(&fields);
        assert_eq!(map.get("_id"), Some(&1));
        assert_eq!(map.get("title"), Some(&2));
        assert_eq!(map.get("nope"), None);
    }

    #[test]
    fn test_compute_new_doc_count() {
        let a = segment_with_fields("a", &["title"]);
        let b = segment_with_fields("b", &["title"]);
        let mut drop_a = RoaringBitmap::new();
        drop_a.insert(0);
        assert_eq!(compute_new_doc_count(&[&a, &b], &[None, None]), 2);
        assert_eq!(compute_new_doc_count(&[&a, &b], &[Some(&drop_a), None]), 1);
    }
}
