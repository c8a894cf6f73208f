use std::io;
use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};
use roaring::RoaringBitmap;
use rustc_hash::FxHashMap;

use crate::common::{write_uvarints, CountingHashWriter, VInt};
use crate::segment::format::DOC_DROPPED;
use crate::segment::reader::Segment;
use crate::{Error, Result};

pub(crate) fn compress(data: &[u8]) -> Result<Vec<u8>> {
    snap::raw::Encoder::new()
        .compress_vec(data)
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}

/// Encodes one field's stored values: a meta descriptor per value (fieldID,
/// type, offset, length, array positions) and the value bytes appended to
/// the doc's data buffer. Returns the advanced data cursor.
pub(crate) fn persist_stored_field_values(
    field_id: u16,
    stored_field_values: &[Vec<u8>],
    value_types: &[u8],
    value_array_positions: &[Vec<u64>],
    mut curr: usize,
    meta: &mut Vec<u8>,
    data: &mut Vec<u8>,
) -> usize {
    for i in 0..stored_field_values.len() {
        let value = &stored_field_values[i];
        VInt(u64::from(field_id)).serialize_into_vec(meta);
        VInt(u64::from(value_types[i])).serialize_into_vec(meta);
        VInt(curr as u64).serialize_into_vec(meta);
        VInt(value.len() as u64).serialize_into_vec(meta);
        VInt(value_array_positions[i].len() as u64).serialize_into_vec(meta);
        for &array_position in &value_array_positions[i] {
            VInt(array_position).serialize_into_vec(meta);
        }
        data.extend_from_slice(value);
        curr += value.len();
    }
    curr
}

/// First merge pass: walks every input segment in order, drops tombstoned
/// docs, assigns dense new docNums and rewrites the stored-docs region.
///
/// Returns the stored index offset and one remap table per input segment.
pub(crate) fn merge_stored_and_remap<W: Write>(
    segments: &[&Segment],
    drops: &[Option<&RoaringBitmap>],
    fields_map: &FxHashMap<String, u16>,
    fields_inv: &[String],
    fields_same: bool,
    new_seg_doc_count: u64,
    w: &mut CountingHashWriter<W>,
) -> Result<(u64, Vec<Vec<u64>>)> {
    let mut rv: Vec<Vec<u64>> = Vec::with_capacity(segments.len());
    let mut new_doc_num = 0u64;

    let mut meta_buf: Vec<u8> = Vec::new();
    let mut data: Vec<u8> = Vec::new();
    let mut vals: Vec<Vec<Vec<u8>>> = vec![Vec::new(); fields_inv.len()];
    let mut typs: Vec<Vec<u8>> = vec![Vec::new(); fields_inv.len()];
    let mut poss: Vec<Vec<Vec<u64>>> = vec![Vec::new(); fields_inv.len()];

    let mut doc_num_offsets = vec![0u64; new_seg_doc_count as usize];

    for (seg_i, segment) in segments.iter().enumerate() {
        let drops_i = drops[seg_i];
        let mut seg_new_doc_nums: Vec<u64> = Vec::with_capacity(segment.num_docs() as usize);

        // When the field numbering matches and nothing is dropped the
        // segment's stored bytes can move verbatim with one write.
        if fields_same && drops_i.map_or(true, RoaringBitmap::is_empty) {
            segment.copy_stored_docs(new_doc_num, &mut doc_num_offsets, w)?;
            for _ in 0..segment.num_docs() {
                seg_new_doc_nums.push(new_doc_num);
                new_doc_num += 1;
            }
            rv.push(seg_new_doc_nums);
            continue;
        }

        for doc_num in 0..segment.num_docs() {
            if drops_i.map_or(false, |d| d.contains(doc_num as u32)) {
                seg_new_doc_nums.push(DOC_DROPPED);
                continue;
            }
            seg_new_doc_nums.push(new_doc_num);

            meta_buf.clear();
            data.clear();
            for field_id in 0..fields_inv.len() {
                vals[field_id].clear();
                typs[field_id].clear();
                poss[field_id].clear();
            }

            let mut unknown_field = false;
            segment.visit_document(doc_num, |field, value_type, value, array_positions| {
                match fields_map.get(field) {
                    Some(&field_id_plus_one) => {
                        let field_id = (field_id_plus_one - 1) as usize;
                        vals[field_id].push(value.to_vec());
                        typs[field_id].push(value_type);
                        poss[field_id].push(array_positions.to_vec());
                        true
                    }
                    None => {
                        unknown_field = true;
                        false
                    }
                }
            })?;
            if unknown_field {
                return Err(Error::corruption(
                    "stored doc names a field missing from the merged inventory",
                ));
            }

            // Walk the fields in order so descriptors come out sorted by the
            // merged numbering.
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

            doc_num_offsets[new_doc_num as usize] = w.count();
            write_uvarints(w, &[meta_buf.len() as u64, compressed.len() as u64])?;
            w.write_all(&meta_buf)?;
            w.write_all(&compressed)?;

            new_doc_num += 1;
        }

        rv.push(seg_new_doc_nums);
    }

    let stored_index_offset = w.count();
    for &doc_num_offset in &doc_num_offsets {
        w.write_u64::<BigEndian>(doc_num_offset)?;
    }
    Ok((stored_index_offset, rv))
}

#[cfg(test)]
mod tests {
    use super::persist_stored_field_values;
    use crate::common::read_uvarint_at;

    #[test]
    fn test_persist_stored_field_values_layout() {
        let mut meta = Vec::new();
        let mut data = Vec::new();
        let values = vec![b"north".to_vec(), b"south".to_vec()];
        let types = vec![b't', b't'];
        let positions = vec![vec![], vec![0u64, 2u64]];
        let curr = persist_stored_field_values(3, &values, &types, &positions, 0, &mut meta, &mut data);
        assert_eq!(curr, 10);
        assert_eq!(data, b"northsouth");

        let mut pos = 0;
        // first value: no array positions
        assert_eq!(read_uvarint_at(&meta, &mut pos).unwrap(), 3);
        assert_eq!(read_uvarint_at(&meta, &mut pos).unwrap(), u64::from(b't'));
        assert_eq!(read_uvarint_at(&meta, &mut pos).unwrap(), 0);
        assert_eq!(read_uvarint_at(&meta, &mut pos).unwrap(), 5);
        assert_eq!(read_uvarint_at(&meta, &mut pos).unwrap(), 0);
        // second value: two array positions
        assert_eq!(read_uvarint_at(&meta, &mut pos).unwrap(), 3);
        assert_eq!(read_uvarint_at(&meta, &mut pos).unwrap(), u64::from(b't'));
        assert_eq!(read_uvarint_at(&meta, &mut pos).unwrap(), 5);
        assert_eq!(read_uvarint_at(&meta, &mut pos).unwrap(), 5);
        assert_eq!(read_uvarint_at(&meta, &mut pos).unwrap(), 2);
        assert_eq!(read_uvarint_at(&meta, &mut pos).unwrap(), 0);
        assert_eq!(read_uvarint_at(&meta, &mut pos).unwrap(), 2);
        assert_eq!(pos, meta.len());
    }
}
