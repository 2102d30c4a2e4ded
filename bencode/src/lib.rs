#![allow(unused)]

// Convention from https://serde.rs/conventions.html
pub mod decode;
pub mod encode;
mod error;
mod raw;

pub use decode::{decode_bytes, decode_str, DecodedType};
pub use encode::{encode_to_raw, encode_to_string};
pub use error::{Error, Result};
pub use raw::{find_raw_value, RawScanError};
