//! Birth-date and gender signals carried by a national identifier.

use chrono::{Datelike, Local, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::errors::DecodeError;
use crate::prediction::Gender;

static DIGIT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new("[0-9]{6}").unwrap()
});

/// Gender block values at or above this threshold are male-coded.
pub const MALE_BLOCK_THRESHOLD: u32 = 5000;

/// Returns the first run of six ASCII digits and its byte offset.
#[must_use]
pub fn first_digit_block(raw: &str) -> Option<(usize, &str)> {
    DIGIT_BLOCK.find(raw).map(|m| (m.start(), m.as_str()))
}

/// Decodes `YYMMDD` blocks into calendar dates using a two-digit pivot year.
///
/// `YY` strictly greater than the pivot selects the 1900s; anything else,
/// including `YY == pivot`, selects the 2000s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BirthDateDecoder {
    pivot: u32,
}

impl BirthDateDecoder {
    /// Creates a decoder pivoting on the current local year.
    #[must_use]
    pub fn for_today() -> Self {
        Self::for_date(Local::now().date_naive())
    }

    /// Creates a decoder pivoting on the year of `today`.
    #[must_use]
    pub fn for_date(today: NaiveDate) -> Self {
        Self::with_pivot(today.year().rem_euclid(100).unsigned_abs())
    }

    /// Creates a decoder with an explicit two-digit pivot.
    #[must_use]
    pub const fn with_pivot(pivot: u32) -> Self {
        Self { pivot: pivot % 100 }
    }

    /// The two-digit pivot year.
    #[must_use]
    pub const fn pivot(&self) -> u32 {
        self.pivot
    }

    /// Century base for a two-digit year.
    #[must_use]
    pub const fn century_for(&self, yy: u32) -> i32 {
        if yy > self.pivot {
            1900
        } else {
            2000
        }
    }

    /// Decodes the first six-digit block of `raw` as a birth date.
    pub fn decode(&self, raw: &str) -> Result<NaiveDate, DecodeError> {
        let (_, block) = first_digit_block(raw).ok_or_else(|| DecodeError::NoDigitBlock {
            raw: raw.to_string(),
        })?;
        self.decode_block(block)
    }

    /// Decodes an exact `YYMMDD` block.
    pub fn decode_block(&self, block: &str) -> Result<NaiveDate, DecodeError> {
        let invalid = || DecodeError::InvalidDate {
            block: block.to_string(),
        };
        if block.len() != 6 || !block.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let yy: u32 = block[0..2].parse().map_err(|_| invalid())?;
        let mm: u32 = block[2..4].parse().map_err(|_| invalid())?;
        let dd: u32 = block[4..6].parse().map_err(|_| invalid())?;

        // yy < 100 so the cast cannot truncate
        #[allow(clippy::cast_possible_wrap)]
        let year = self.century_for(yy) + yy as i32;
        NaiveDate::from_ymd_opt(year, mm, dd).ok_or_else(invalid)
    }
}

impl Default for BirthDateDecoder {
    fn default() -> Self {
        Self::for_today()
    }
}

/// Reads the gender block (the four digits after the date block).
#[must_use]
pub fn gender_block(raw: &str) -> Option<u32> {
    let (start, _) = first_digit_block(raw)?;
    let digits = raw.get(start + 6..start + 10)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Gender encoded in the identifier: below 5000 is female, otherwise male.
#[must_use]
pub fn gender_from_identifier(raw: &str) -> Option<Gender> {
    gender_block(raw).map(|block| {
        if block >= MALE_BLOCK_THRESHOLD {
            Gender::Male
        } else {
            Gender::Female
        }
    })
}
