//! The segment file format: writing, reading and merging.
//!
//! A segment file is produced append-only. Four regions follow each other:
//! stored documents, then one dictionary + postings + doc-value column per
//! field, then the fields index, then a fixed footer. Every cross-reference
//! is a backward byte offset recorded at the moment the referee was written.

pub mod builder;
pub mod merge;
pub mod reader;

pub(crate) mod contentcoder;
pub(crate) mod dictionary;
pub(crate) mod footer;
pub(crate) mod format;
pub(crate) mod intcoder;
pub(crate) mod postings;
pub(crate) mod stored;
pub(crate) mod term_merger;

pub use self::dictionary::{Dictionary, DictionaryStreamer};
pub use self::format::{DOC_DROPPED, FIELD_NOT_UNINVERTED, TERM_SEPARATOR};
pub use self::postings::{Location, Posting, PostingsIterator, PostingsList};
