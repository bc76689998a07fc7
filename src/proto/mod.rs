//! wire level request decoding and response encoding.

pub mod decode;

pub(crate) mod encode;

pub use self::decode::{Events, Head, Parser};
