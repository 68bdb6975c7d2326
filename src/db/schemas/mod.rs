//! Database schemas
//!
//! MongoDB document structures for stored keysets.

mod keyset;
mod metadata;

pub use keyset::{KeysetDoc, KEYSET_COLLECTION};
pub use metadata::Metadata;
