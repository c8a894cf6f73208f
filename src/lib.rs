//! Shale is an immutable, on-disk inverted-index segment format.
//!
//! A segment is a single file holding, in order, the stored documents of the
//! segment, one term dictionary with postings and a doc-value column per
//! field, a fields index, and a self-identifying footer. Segments are written
//! once and never modified; deletions are expressed as tombstone bitmaps kept
//! next to a segment by the enclosing index.
//!
//! The crate offers three entry points:
//!
//! - [`SegmentBuilder`] turns in-memory documents into a new segment,
//! - [`Segment`] opens an existing segment for reading,
//! - [`merge`] combines several segments (and their tombstone bitmaps) into
//!   one new segment, dropping deleted documents and renumbering the
//!   survivors into a dense docNum space.
//!
//! ```no_run
//! use shale::{Document, Segment, SegmentBuilder};
//!
//! # fn main() -> shale::Result<()> {
//! let mut builder = SegmentBuilder::new(1024)?;
//! builder.add_document(Document::new("doc-1"));
//! let segment = Segment::from_bytes(builder.build()?)?;
//! assert_eq!(segment.num_docs(), 1);
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod segment;

mod error;

pub use crate::error::{Error, Result};
pub use crate::segment::builder::{Document, FieldContent, SegmentBuilder, StoredValue, Token};
pub use crate::segment::merge::{merge, merge_to_writer, MergedSegment};
pub use crate::segment::reader::Segment;
