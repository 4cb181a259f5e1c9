#![cfg_attr(docsrs, doc = include_str!("../README.md"))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg, doc_cfg_hide))]
#![cfg_attr(docsrs, doc(cfg_hide(docsrs, loom)))]
#![cfg_attr(docsrs, deny(missing_docs))]
#![cfg_attr(not(test), no_std)]
#![warn(missing_debug_implementations)]

extern crate alloc;
#[cfg(test)]
extern crate std;

#[macro_use]
pub(crate) mod util;

mod cursor;
mod error;
mod node;
pub mod queue;

pub(crate) mod loom;

#[doc(inline)]
pub use self::error::Error;
#[doc(inline)]
pub use self::node::FILLER;
#[doc(inline)]
pub use self::queue::{Handle, Queue, RECORD_CAPACITY};
