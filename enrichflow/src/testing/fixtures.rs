//! Record fixtures for pipeline tests.

use chrono::{Datelike, Duration, NaiveDate};

use crate::decoder::{check_digit, IDENTIFIER_LEN};
use crate::errors::StoreError;
use crate::prediction::Gender;
use crate::store::{MasterRecord, SqliteStore};

/// Builds a valid 13-digit identifier for `birth_date` and `gender`.
///
/// The sequence number picks the gender block within its half of the range.
#[must_use]
pub fn identifier_for(birth_date: NaiveDate, gender: Gender, sequence: u32) -> String {
    let block = match gender {
        Gender::Female => sequence % 5000,
        Gender::Male => 5000 + sequence % 5000,
    };
    let stem_text = format!(
        "{:02}{:02}{:02}{block:04}08",
        birth_date.year().rem_euclid(100),
        birth_date.month(),
        birth_date.day()
    );
    let mut stem = [0u8; IDENTIFIER_LEN - 1];
    for (digit, byte) in stem.iter_mut().zip(stem_text.bytes()) {
        *digit = byte - b'0';
    }
    format!("{stem_text}{}", check_digit(&stem))
}

/// `count` records with ids `1..=count`, distinct names and valid identifiers.
///
/// Birth dates step one day at a time from 1990-01-01; genders alternate.
#[must_use]
pub fn master_records(count: usize) -> Vec<MasterRecord> {
    let epoch = NaiveDate::from_ymd_opt(1990, 1, 1).unwrap_or_default();
    (1..=count)
        .map(|n| {
            let id = i64::try_from(n).unwrap_or(i64::MAX);
            let gender = if n % 2 == 0 { Gender::Male } else { Gender::Female };
            let birth_date = epoch + Duration::days(id - 1);
            let sequence = u32::try_from(n).unwrap_or(0);
            MasterRecord::new(
                id,
                format!("Name{n}"),
                format!("Surname{n}"),
                Some(&identifier_for(birth_date, gender, sequence)),
            )
        })
        .collect()
}

/// An in-memory SQLite store holding `records`.
pub async fn seeded_sqlite_store(records: &[MasterRecord]) -> Result<SqliteStore, StoreError> {
    let store = SqliteStore::in_memory().await?;
    store.insert_master_records(records).await?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{gender_from_identifier, has_valid_check_digit, BirthDateDecoder};

    #[test]
    fn test_identifier_round_trips_through_decoder() {
        let date = NaiveDate::from_ymd_opt(1997, 4, 20).unwrap();
        let id = identifier_for(date, Gender::Male, 12);
        assert_eq!(id.len(), IDENTIFIER_LEN);
        assert!(has_valid_check_digit(&id));
        assert_eq!(gender_from_identifier(&id), Some(Gender::Male));
        assert_eq!(BirthDateDecoder::with_pivot(25).decode(&id).unwrap(), date);
    }

    #[test]
    fn test_master_records_are_ascending() {
        let records = master_records(4);
        assert_eq!(records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert!(records.iter().all(MasterRecord::has_names));
    }
}
