//! SQLite implementation of [`EnrichmentStore`].

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use tracing::{debug, info};

use super::{
    shift_back_one_century, BirthDateChange, CorrectionMode, Destination, Eligibility,
    EnrichmentCounts, EnrichmentStore, MasterRecord, PageQuery, ReconcileBatch, TableWrite,
    UpsertReport, WatermarkUpdate,
};
use crate::config::DatabaseConfig;
use crate::errors::StoreError;

/// Rows per multi-row statement; three binds each stays under SQLite's
/// host-parameter limit.
const MAX_ROWS_PER_STATEMENT: usize = 5_000;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS master_items (
    id INTEGER PRIMARY KEY,
    full_name TEXT,
    surname TEXT,
    id_number TEXT
);

CREATE TABLE IF NOT EXISTS birth_dates (
    id INTEGER PRIMARY KEY,
    master_item_id INTEGER NOT NULL UNIQUE REFERENCES master_items (id),
    birth_date TEXT,
    CHECK (id = master_item_id)
);

CREATE TABLE IF NOT EXISTS genders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    master_item_id INTEGER NOT NULL UNIQUE REFERENCES master_items (id),
    description TEXT NOT NULL,
    date_created TEXT
);

CREATE TABLE IF NOT EXISTS languages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    master_item_id INTEGER NOT NULL UNIQUE REFERENCES master_items (id),
    description TEXT NOT NULL,
    date_created TEXT
);

CREATE TABLE IF NOT EXISTS enrichment_watermarks (
    pipeline TEXT PRIMARY KEY,
    last_processed_id INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
";

const MISSING_BIRTH_DATE_PAGE: &str = r"
SELECT mi.id, COALESCE(mi.full_name, ''), COALESCE(mi.surname, ''), mi.id_number
FROM master_items AS mi
LEFT JOIN birth_dates AS bd ON bd.id = mi.id
WHERE (bd.id IS NULL OR bd.birth_date IS NULL)
  AND mi.id > ?
  AND mi.id_number IS NOT NULL
ORDER BY mi.id ASC
LIMIT ?
";

const MISSING_DEMOGRAPHICS_PAGE: &str = r"
SELECT mi.id, mi.full_name, mi.surname, mi.id_number
FROM master_items AS mi
LEFT JOIN genders AS g ON g.master_item_id = mi.id
LEFT JOIN languages AS l ON l.master_item_id = mi.id
WHERE (g.master_item_id IS NULL OR l.master_item_id IS NULL)
  AND mi.id > ?
  AND mi.full_name IS NOT NULL AND TRIM(mi.full_name) <> ''
  AND mi.surname IS NOT NULL AND TRIM(mi.surname) <> ''
ORDER BY mi.id ASC
LIMIT ?
";

type MasterRow = (i64, String, String, Option<String>);

fn to_record((id, full_name, surname, raw_identifier): MasterRow) -> MasterRecord {
    MasterRecord {
        id,
        full_name,
        surname,
        raw_identifier,
    }
}

fn to_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn to_limit(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// SQLite-backed store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens a pool and creates any missing tables.
    ///
    /// `sqlite::memory:` URLs get a single long-lived connection so every
    /// query sees the same database.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| StoreError::Connection(format!("{}: {e}", config.url)))?
            .create_if_missing(true);

        let in_memory = config.url.contains(":memory:");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.bootstrap().await?;
        info!(url = %config.url, "Connected to store");
        Ok(store)
    }

    /// Opens a fresh private in-memory database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        })
        .await
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn bootstrap(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Loads master records, e.g. from an upstream import or a fixture.
    pub async fn insert_master_records(&self, records: &[MasterRecord]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for chunk in records.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO master_items (id, full_name, surname, id_number) ");
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.id)
                    .push_bind(&r.full_name)
                    .push_bind(&r.surname)
                    .push_bind(&r.raw_identifier);
            });
            inserted += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Reads the stored text value of one attribute, if the row exists.
    pub async fn stored_value(
        &self,
        destination: Destination,
        master_id: i64,
    ) -> Result<Option<String>, StoreError> {
        let sql = match destination {
            Destination::BirthDates => "SELECT birth_date FROM birth_dates WHERE id = ?",
            Destination::Genders => "SELECT description FROM genders WHERE master_item_id = ?",
            Destination::Languages => "SELECT description FROM languages WHERE master_item_id = ?",
        };
        let value: Option<Option<String>> = sqlx::query_scalar(sql)
            .bind(master_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value.flatten())
    }

    /// Row count of a destination table.
    pub async fn row_count(&self, destination: Destination) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", destination.table());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(to_count(count))
    }
}

async fn merge_birth_dates(
    tx: &mut Transaction<'_, Sqlite>,
    rows: &[(i64, NaiveDate)],
) -> Result<TableWrite, StoreError> {
    let mut written = 0;
    for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
        // the birth-date key is the master key, assigned explicitly; the
        // schema's CHECK keeps id and master_item_id equal, so a conflict on
        // id is the only conflict this insert can hit
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("INSERT INTO birth_dates (id, master_item_id, birth_date) ");
        qb.push_values(chunk, |mut b, (id, date)| {
            b.push_bind(*id).push_bind(*id).push_bind(*date);
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET birth_date = excluded.birth_date \
             WHERE birth_dates.birth_date IS NOT excluded.birth_date",
        );
        written += qb.build().execute(&mut **tx).await?.rows_affected();
    }
    Ok(TableWrite {
        submitted: rows.len() as u64,
        written,
    })
}

async fn merge_descriptions(
    tx: &mut Transaction<'_, Sqlite>,
    destination: Destination,
    rows: &[(i64, &'static str)],
) -> Result<TableWrite, StoreError> {
    let table = destination.table();
    let mut written = 0;
    for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "INSERT INTO {table} (master_item_id, description, date_created) "
        ));
        qb.push_values(chunk, |mut b, (id, description)| {
            b.push_bind(*id)
                .push_bind(*description)
                .push("CURRENT_TIMESTAMP");
        });
        qb.push(format!(
            " ON CONFLICT (master_item_id) DO UPDATE SET description = excluded.description \
             WHERE {table}.description IS NOT excluded.description"
        ));
        written += qb.build().execute(&mut **tx).await?.rows_affected();
    }
    Ok(TableWrite {
        submitted: rows.len() as u64,
        written,
    })
}

async fn write_watermark(
    tx: &mut Transaction<'_, Sqlite>,
    update: &WatermarkUpdate,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO enrichment_watermarks (pipeline, last_processed_id, updated_at) \
         VALUES (?, ?, CURRENT_TIMESTAMP) \
         ON CONFLICT (pipeline) DO UPDATE SET \
         last_processed_id = excluded.last_processed_id, updated_at = excluded.updated_at",
    )
    .bind(&update.pipeline)
    .bind(update.last_processed_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl EnrichmentStore for SqliteStore {
    async fn fetch_page(&self, query: PageQuery) -> Result<Vec<MasterRecord>, StoreError> {
        let sql = match query.eligibility {
            Eligibility::MissingBirthDate => MISSING_BIRTH_DATE_PAGE,
            Eligibility::MissingGenderOrLanguage => MISSING_DEMOGRAPHICS_PAGE,
        };
        let rows: Vec<MasterRow> = sqlx::query_as(sql)
            .bind(query.after)
            .bind(to_limit(query.limit))
            .fetch_all(&self.pool)
            .await?;
        debug!(after = query.after, limit = query.limit, fetched = rows.len(), "Fetched page");
        Ok(rows.into_iter().map(to_record).collect())
    }

    async fn reconcile(&self, batch: &ReconcileBatch) -> Result<UpsertReport, StoreError> {
        let mut tx = self.pool.begin().await?;

        let birth_dates = merge_birth_dates(&mut tx, &batch.birth_dates).await?;
        let genders: Vec<(i64, &'static str)> =
            batch.genders.iter().map(|(id, g)| (*id, g.as_str())).collect();
        let genders = merge_descriptions(&mut tx, Destination::Genders, &genders).await?;
        let languages: Vec<(i64, &'static str)> =
            batch.languages.iter().map(|(id, l)| (*id, l.as_str())).collect();
        let languages = merge_descriptions(&mut tx, Destination::Languages, &languages).await?;

        if let Some(update) = &batch.watermark {
            write_watermark(&mut tx, update).await?;
        }

        tx.commit().await?;
        Ok(UpsertReport {
            birth_dates,
            genders,
            languages,
        })
    }

    async fn load_watermark(&self, pipeline: &str) -> Result<Option<i64>, StoreError> {
        let value: Option<i64> = sqlx::query_scalar(
            "SELECT last_processed_id FROM enrichment_watermarks WHERE pipeline = ?",
        )
        .bind(pipeline)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn save_watermark(&self, pipeline: &str, last_processed_id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        write_watermark(
            &mut tx,
            &WatermarkUpdate {
                pipeline: pipeline.to_string(),
                last_processed_id,
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn master_record(&self, id: i64) -> Result<Option<MasterRecord>, StoreError> {
        let row: Option<MasterRow> = sqlx::query_as(
            "SELECT id, COALESCE(full_name, ''), COALESCE(surname, ''), id_number \
             FROM master_items WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(to_record))
    }

    async fn correct_birth_dates(
        &self,
        threshold: NaiveDate,
        mode: CorrectionMode,
    ) -> Result<Vec<BirthDateChange>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<(i64, i64, NaiveDate)> = sqlx::query_as(
            "SELECT id, master_item_id, birth_date FROM birth_dates \
             WHERE birth_date IS NOT NULL AND birth_date > ? \
             ORDER BY birth_date ASC, id ASC",
        )
        .bind(threshold)
        .fetch_all(&mut *tx)
        .await?;

        let changes = rows
            .into_iter()
            .map(|(id, master_item_id, old)| {
                let new = shift_back_one_century(old).ok_or_else(|| {
                    StoreError::Integrity(format!("cannot shift birth date {old} of row {id}"))
                })?;
                Ok(BirthDateChange {
                    id,
                    master_item_id,
                    old_birth_date: old,
                    new_birth_date: new,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let mut updated = 0;
        for chunk in changes.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("WITH shifted (id, new_date) AS (");
            qb.push_values(chunk, |mut b, change| {
                b.push_bind(change.id).push_bind(change.new_birth_date);
            });
            qb.push(
                ") UPDATE birth_dates \
                 SET birth_date = (SELECT new_date FROM shifted WHERE shifted.id = birth_dates.id) \
                 WHERE id IN (SELECT id FROM shifted)",
            );
            updated += qb.build().execute(&mut *tx).await?.rows_affected();
        }

        if updated != changes.len() as u64 {
            // dropping the transaction rolls it back
            return Err(StoreError::Integrity(format!(
                "expected to update {} birth dates, updated {updated}",
                changes.len()
            )));
        }

        match mode {
            CorrectionMode::Commit => tx.commit().await?,
            CorrectionMode::Rehearsal => tx.rollback().await?,
        }
        info!(rows = changes.len(), mode = ?mode, "Birth-date correction transaction finished");
        Ok(changes)
    }

    async fn enrichment_counts(&self) -> Result<EnrichmentCounts, StoreError> {
        let (total, birth, gender, language, both): (i64, i64, i64, i64, i64) = sqlx::query_as(
            r"
            SELECT
                (SELECT COUNT(*) FROM master_items),
                (SELECT COUNT(*) FROM master_items AS mi
                    LEFT JOIN birth_dates AS bd ON bd.id = mi.id
                    WHERE bd.id IS NULL OR bd.birth_date IS NULL),
                (SELECT COUNT(*) FROM master_items AS mi
                    WHERE NOT EXISTS (SELECT 1 FROM genders AS g WHERE g.master_item_id = mi.id)),
                (SELECT COUNT(*) FROM master_items AS mi
                    WHERE NOT EXISTS (SELECT 1 FROM languages AS l WHERE l.master_item_id = mi.id)),
                (SELECT COUNT(*) FROM master_items AS mi
                    WHERE NOT EXISTS (SELECT 1 FROM genders AS g WHERE g.master_item_id = mi.id)
                      AND NOT EXISTS (SELECT 1 FROM languages AS l WHERE l.master_item_id = mi.id))
            ",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(EnrichmentCounts {
            total_records: to_count(total),
            missing_birth_date: to_count(birth),
            missing_gender: to_count(gender),
            missing_language: to_count(language),
            missing_gender_and_language: to_count(both),
        })
    }

    async fn sample_missing_birth_dates(&self, limit: usize) -> Result<Vec<MasterRecord>, StoreError> {
        let rows: Vec<MasterRow> = sqlx::query_as(
            "SELECT mi.id, COALESCE(mi.full_name, ''), COALESCE(mi.surname, ''), mi.id_number \
             FROM master_items AS mi \
             LEFT JOIN birth_dates AS bd ON bd.id = mi.id \
             WHERE bd.id IS NULL OR bd.birth_date IS NULL \
             ORDER BY mi.id ASC LIMIT ?",
        )
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(to_record).collect())
    }
}
