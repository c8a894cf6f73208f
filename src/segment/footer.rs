use std::io::Write;

use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};

use crate::common::{write_uvarints, CountingHashWriter};
use crate::segment::format::FOOTER_LEN;
use crate::{Error, Result};

/// Writes one record per field (dictionary offset, then the length-prefixed
/// field name), then the big-endian record-offset table the footer points at.
pub(crate) fn persist_fields<W: Write>(
    fields_inv: &[String],
    dict_locs: &[u64],
    w: &mut CountingHashWriter<W>,
) -> Result<u64> {
    let mut fields_offsets = Vec::with_capacity(fields_inv.len());
    for (field_id, field_name) in fields_inv.iter().enumerate() {
        fields_offsets.push(w.count());
        write_uvarints(w, &[dict_locs[field_id], field_name.len() as u64])?;
        w.write_all(field_name.as_bytes())?;
    }
    let fields_index_offset = w.count();
    for &offset in &fields_offsets {
        w.write_u64::<BigEndian>(offset)?;
    }
    Ok(fields_index_offset)
}

/// Writes the fixed little-endian footer. The checksum is the writer's
/// running crc32 at the moment the checksum field begins.
pub(crate) fn persist_footer<W: Write>(
    num_docs: u64,
    stored_index_offset: u64,
    fields_index_offset: u64,
    doc_value_offset: u64,
    chunk_factor: u32,
    w: &mut CountingHashWriter<W>,
) -> Result<()> {
    w.write_u64::<LittleEndian>(num_docs)?;
    w.write_u64::<LittleEndian>(stored_index_offset)?;
    w.write_u64::<LittleEndian>(fields_index_offset)?;
    w.write_u64::<LittleEndian>(doc_value_offset)?;
    w.write_u32::<LittleEndian>(chunk_factor)?;
    let checksum = w.sum32();
    w.write_u32::<LittleEndian>(checksum)?;
    Ok(())
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Footer {
    pub num_docs: u64,
    pub stored_index_offset: u64,
    pub fields_index_offset: u64,
    pub doc_value_offset: u64,
    pub chunk_factor: u32,
    pub checksum: u32,
}

/// Parses and validates the footer at the end of `mem`.
pub(crate) fn parse_footer(mem: &[u8]) -> Result<Footer> {
    if mem.len() < FOOTER_LEN {
        return Err(Error::corruption(format!(
            "file of {} bytes is smaller than the footer",
            mem.len()
        )));
    }
    let footer_bytes = &mem[mem.len() - FOOTER_LEN..];
    let footer = Footer {
        num_docs: LittleEndian::read_u64(&footer_bytes[0..8]),
        stored_index_offset: LittleEndian::read_u64(&footer_bytes[8..16]),
        fields_index_offset: LittleEndian::read_u64(&footer_bytes[16..24]),
        doc_value_offset: LittleEndian::read_u64(&footer_bytes[24..32]),
        chunk_factor: LittleEndian::read_u32(&footer_bytes[32..36]),
        checksum: LittleEndian::read_u32(&footer_bytes[36..40]),
    };
    let computed = crc32fast::hash(&mem[..mem.len() - 4]);
    if computed != footer.checksum {
        return Err(Error::corruption(format!(
            "checksum mismatch: footer says {}, file sums to {}",
            footer.checksum, computed
        )));
    }
    if footer.chunk_factor == 0 {
        return Err(Error::corruption("footer chunk factor is zero"));
    }
    Ok(footer)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use byteorder::{BigEndian, ByteOrder};

    use super::{parse_footer, persist_fields, persist_footer};
    use crate::common::{read_uvarint_at, CountingHashWriter};

    #[test]
    fn test_fields_and_footer_round_trip() {
        let mut w = CountingHashWriter::wrap(Vec::new());
        w.write_all(b"stored region placeholder").unwrap();
        let fields = vec!["_id".to_string(), "title".to_string()];
        let dict_locs = vec![7u64, 1234u64];
        let fields_index_offset = persist_fields(&fields, &dict_locs, &mut w).unwrap();
        persist_footer(2, 25, fields_index_offset, u64::MAX, 1024, &mut w).unwrap();
        let buf = w.finish();

        let footer = parse_footer(&buf).unwrap();
        assert_eq!(footer.num_docs, 2);
        assert_eq!(footer.stored_index_offset, 25);
        assert_eq!(footer.fields_index_offset, fields_index_offset);
        assert_eq!(footer.doc_value_offset, u64::MAX);
        assert_eq!(footer.chunk_factor, 1024);

        for (field_id, (name, dict_loc)) in fields.iter().zip(&dict_locs).enumerate() {
            let entry = footer.fields_index_offset as usize + 8 * field_id;
            let mut pos = BigEndian::read_u64(&buf[entry..entry + 8]) as usize;
            assert_eq!(read_uvarint_at(&buf, &mut pos).unwrap(), *dict_loc);
            let name_len = read_uvarint_at(&buf, &mut pos).unwrap() as usize;
            assert_eq!(&buf[pos..pos + name_len], name.as_bytes());
        }
    }

    #[test]
    fn test_corrupted_byte_fails_checksum() {
        let mut w = CountingHashWriter::wrap(Vec::new());
        w.write_all(b"some segment body").unwrap();
        persist_footer(1, 0, 0, 0, 16, &mut w).unwrap();
        let mut buf = w.finish();
        buf[3] ^= 0xff;
        let err = parse_footer(&buf).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_too_small_file() {
        assert!(parse_footer(b"tiny").is_err());
    }
}
