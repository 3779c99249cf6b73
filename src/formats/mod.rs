//! Binary container formats

pub mod macho;
