//! Iterators over committed storage state
//!
//! All iterators are cheap to create and safe to use concurrently with open
//! transactions; they observe the state as of their last block load (an
//! iterator should be short-lived relative to commits or be re-created).

mod docset;
mod ff;
mod forward;
mod posinfo;
mod posting;
mod structure;

pub use docset::{IndexSetIterator, InvAclIterator};
pub use ff::FfPostingIterator;
pub use forward::ForwardIndexIterator;
pub use posinfo::{read_document_frequency, PosinfoIterator};
pub use posting::PostingIterator;
pub use structure::StructIterator;
