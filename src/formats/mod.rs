//! Binary format decoders.

pub mod macho;
