//! Deterministic signals decoded from national identifiers.
//!
//! This module provides:
//! - Birth-date decoding with a fixed two-digit pivot rule
//! - The gender block read from digits 7-10
//! - A mask solver that enumerates identifiers matching a wildcard pattern

mod birth_date;
mod mask;

pub use birth_date::{
    first_digit_block, gender_block, gender_from_identifier, BirthDateDecoder,
    MALE_BLOCK_THRESHOLD,
};
pub use mask::{
    check_digit, has_valid_check_digit, GenderFilter, IdMask, MaskSolutions, IDENTIFIER_LEN,
};
