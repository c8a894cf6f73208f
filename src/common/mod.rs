mod counting_writer;
mod vint;

pub use self::counting_writer::CountingHashWriter;
pub use self::vint::{
    read_uvarint, read_uvarint_at, write_uvarint, write_uvarints, VInt, MAX_VARINT_LEN,
};
