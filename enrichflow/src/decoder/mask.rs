//! Enumeration of 13-digit identifiers matching a wildcard mask.
//!
//! A mask is 13 characters of `0-9` or `*`. Each candidate must carry a valid
//! birth date, a gender block matching the requested filter and a check digit
//! produced by [`check_digit`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::birth_date::{BirthDateDecoder, MALE_BLOCK_THRESHOLD};
use crate::errors::ConfigError;

/// Identifier length including the check digit.
pub const IDENTIFIER_LEN: usize = 13;

/// Gender filter applied to candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GenderFilter {
    /// Gender block at or above 5000.
    Male,
    /// Gender block below 5000.
    Female,
    /// Accept either.
    #[default]
    Unknown,
}

impl GenderFilter {
    /// Returns true if the four-digit gender block passes the filter.
    #[must_use]
    pub const fn accepts(self, block: u32) -> bool {
        match self {
            Self::Male => block >= MALE_BLOCK_THRESHOLD,
            Self::Female => block < MALE_BLOCK_THRESHOLD,
            Self::Unknown => true,
        }
    }
}

impl FromStr for GenderFilter {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "M" => Ok(Self::Male),
            "F" => Ok(Self::Female),
            "U" => Ok(Self::Unknown),
            other => Err(ConfigError::invalid("gender", format!("expected M, F or U, got '{other}'"))),
        }
    }
}

impl fmt::Display for GenderFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Male => write!(f, "M"),
            Self::Female => write!(f, "F"),
            Self::Unknown => write!(f, "U"),
        }
    }
}

/// A validated identifier mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdMask {
    slots: [Option<u8>; IDENTIFIER_LEN],
}

impl IdMask {
    /// Parses a mask of 13 characters drawn from `0-9` and `*`.
    pub fn parse(mask: &str) -> Result<Self, ConfigError> {
        let bytes = mask.as_bytes();
        if bytes.len() != IDENTIFIER_LEN {
            return Err(ConfigError::invalid(
                "mask",
                format!("must be {IDENTIFIER_LEN} characters, got {}", bytes.len()),
            ));
        }

        let mut slots = [None; IDENTIFIER_LEN];
        for (slot, &b) in slots.iter_mut().zip(bytes) {
            *slot = match b {
                b'0'..=b'9' => Some(b - b'0'),
                b'*' => None,
                _ => {
                    return Err(ConfigError::invalid(
                        "mask",
                        format!("unexpected character '{}'", b as char),
                    ))
                }
            };
        }
        Ok(Self { slots })
    }

    /// Number of wildcard positions.
    #[must_use]
    pub fn wildcard_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_none()).count()
    }

    /// Iterates every identifier that matches the mask and passes validation.
    #[must_use]
    pub fn solutions(&self, decoder: BirthDateDecoder, gender: GenderFilter) -> MaskSolutions<'_> {
        MaskSolutions {
            mask: self,
            decoder,
            gender,
            wildcards: self
                .slots
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.is_none().then_some(i))
                .collect(),
            counter: Some(vec![0; self.wildcard_count()]),
        }
    }
}

/// Check digit over a 12-digit stem.
///
/// The digits at even indices are summed directly. The digits at odd indices
/// are read as one decimal number, doubled, and the digits of the product are
/// summed. This folding order is fixed by the issuing authority.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn check_digit(stem: &[u8; IDENTIFIER_LEN - 1]) -> u8 {
    let direct: u32 = stem.iter().step_by(2).map(|&d| u32::from(d)).sum();
    let folded = stem
        .iter()
        .skip(1)
        .step_by(2)
        .fold(0u64, |acc, &d| acc * 10 + u64::from(d));
    let doubled = digit_sum(folded * 2);
    ((10 - (direct + doubled) % 10) % 10) as u8
}

fn digit_sum(mut n: u64) -> u32 {
    let mut sum = 0;
    while n > 0 {
        // n % 10 < 10
        #[allow(clippy::cast_possible_truncation)]
        let digit = (n % 10) as u32;
        sum += digit;
        n /= 10;
    }
    sum
}

/// Returns true if a full 13-digit identifier has a matching check digit.
#[must_use]
pub fn has_valid_check_digit(id: &str) -> bool {
    let Some(digits) = to_digits(id) else {
        return false;
    };
    let mut stem = [0u8; IDENTIFIER_LEN - 1];
    stem.copy_from_slice(&digits[..IDENTIFIER_LEN - 1]);
    check_digit(&stem) == digits[IDENTIFIER_LEN - 1]
}

fn to_digits(id: &str) -> Option<[u8; IDENTIFIER_LEN]> {
    let bytes = id.as_bytes();
    if bytes.len() != IDENTIFIER_LEN {
        return None;
    }
    let mut out = [0u8; IDENTIFIER_LEN];
    for (o, &b) in out.iter_mut().zip(bytes) {
        if !b.is_ascii_digit() {
            return None;
        }
        *o = b - b'0';
    }
    Some(out)
}

/// Lazy iterator over the identifiers matching a mask.
///
/// Wildcards are filled in odometer order, so output is ascending.
#[derive(Debug)]
pub struct MaskSolutions<'a> {
    mask: &'a IdMask,
    decoder: BirthDateDecoder,
    gender: GenderFilter,
    wildcards: Vec<usize>,
    counter: Option<Vec<u8>>,
}

impl MaskSolutions<'_> {
    fn candidate(&self, counter: &[u8]) -> [u8; IDENTIFIER_LEN] {
        let mut digits = [0u8; IDENTIFIER_LEN];
        for (i, slot) in self.mask.slots.iter().enumerate() {
            if let Some(d) = slot {
                digits[i] = *d;
            }
        }
        for (&pos, &value) in self.wildcards.iter().zip(counter) {
            digits[pos] = value;
        }
        digits
    }

    fn accepts(&self, digits: &[u8; IDENTIFIER_LEN]) -> bool {
        let block: String = digits[..6].iter().map(|d| char::from(b'0' + d)).collect();
        if self.decoder.decode_block(&block).is_err() {
            return false;
        }

        let gender_block = digits[6..10]
            .iter()
            .fold(0u32, |acc, &d| acc * 10 + u32::from(d));
        if !self.gender.accepts(gender_block) {
            return false;
        }

        let mut stem = [0u8; IDENTIFIER_LEN - 1];
        stem.copy_from_slice(&digits[..IDENTIFIER_LEN - 1]);
        check_digit(&stem) == digits[IDENTIFIER_LEN - 1]
    }
}

fn advance(counter: &mut [u8]) -> bool {
    for digit in counter.iter_mut().rev() {
        if *digit < 9 {
            *digit += 1;
            return true;
        }
        *digit = 0;
    }
    false
}

impl Iterator for MaskSolutions<'_> {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut counter = self.counter.take()?;
            let digits = self.candidate(&counter);
            if advance(&mut counter) {
                self.counter = Some(counter);
            }
            if self.accepts(&digits) {
                return Some(digits.iter().map(|d| char::from(b'0' + d)).collect());
            }
        }
    }
}
