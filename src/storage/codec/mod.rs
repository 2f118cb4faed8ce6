mod btree_page;
mod common;

pub use btree_page::{
    BPlusTreeHeaderPageCodec, BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec,
    BPlusTreePageCodec, RecordIdCodec,
};
pub use common::CommonCodec;

/// A decoded value plus the number of bytes consumed.
pub type DecodedData<T> = (T, usize);
