//! End-to-end runs of the page loop against real and in-memory stores.

#[cfg(test)]
mod tests {
    use crate::cancellation::CancellationToken;
    use crate::config::PipelineConfig;
    use crate::decoder::BirthDateDecoder;
    use crate::errors::{EnrichflowError, PredictionError};
    use crate::events::CollectingEventSink;
    use crate::pipeline::{
        BatchCursor, BirthDateEnricher, CursorStep, DemographicEnricher, DriverSettings,
        PipelineDriver, RetryPolicy, Scheduler, SchedulingStrategy, StopReason,
    };
    use crate::prediction::{Gender, Language, Prediction};
    use crate::store::{Destination, Eligibility, EnrichmentStore, InMemoryStore, SqliteStore};
    use crate::testing::{master_records, seeded_sqlite_store, ScriptedPredictionClient};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn quick_config(page_size: usize) -> PipelineConfig {
        PipelineConfig::default()
            .with_page_size(page_size)
            .with_concurrency(4)
            .with_retry_attempts(2)
            .without_pauses()
    }

    fn birth_date_driver<S: EnrichmentStore + ?Sized>(
        store: Arc<S>,
        config: &PipelineConfig,
    ) -> PipelineDriver<S, BirthDateEnricher> {
        PipelineDriver::new(
            store,
            BirthDateEnricher::new(BirthDateDecoder::with_pivot(25)),
            DriverSettings::from_config(config),
        )
    }

    fn demographic_driver<S: EnrichmentStore + ?Sized>(
        store: Arc<S>,
        client: Arc<ScriptedPredictionClient>,
        config: &PipelineConfig,
    ) -> PipelineDriver<S, DemographicEnricher<Arc<ScriptedPredictionClient>>> {
        PipelineDriver::new(
            store,
            DemographicEnricher::new(
                client,
                RetryPolicy::from_config(config),
                Scheduler::from_config(config),
            ),
            DriverSettings::from_config(config),
        )
    }

    #[tokio::test]
    async fn test_birth_dates_backfilled_on_sqlite() {
        let store = Arc::new(seeded_sqlite_store(&master_records(25)).await.unwrap());
        let config = quick_config(10);

        let stats = birth_date_driver(store.clone(), &config)
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.stop_reason, Some(StopReason::Exhausted));
        assert_eq!(stats.pages, 3);
        assert_eq!(stats.succeeded, 25);
        assert_eq!(stats.upserted.birth_dates.written, 25);
        assert_eq!(store.row_count(Destination::BirthDates).await.unwrap(), 25);
        assert_eq!(
            store.stored_value(Destination::BirthDates, 1).await.unwrap(),
            Some("1990-01-01".to_string())
        );

        // nothing is eligible any more
        let again = birth_date_driver(store.clone(), &config)
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.fetched, 0);
        assert_eq!(again.upserted.total_written(), 0);
        assert_eq!(store.row_count(Destination::BirthDates).await.unwrap(), 25);
    }

    #[tokio::test]
    async fn test_budgeted_runs_resume_without_gaps_or_duplicates() {
        let store = Arc::new(seeded_sqlite_store(&master_records(25)).await.unwrap());
        let budgeted = quick_config(5).with_max_records(Some(10));

        let first = birth_date_driver(store.clone(), &budgeted)
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.stop_reason, Some(StopReason::BudgetReached));
        assert_eq!(first.final_watermark, 10);
        assert_eq!(store.load_watermark("birthdates").await.unwrap(), Some(10));

        let second = birth_date_driver(store.clone(), &budgeted)
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.start_watermark, 10);
        assert_eq!(second.final_watermark, 20);

        let rest = birth_date_driver(store.clone(), &quick_config(5))
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(rest.succeeded, 5);
        assert_eq!(rest.stop_reason, Some(StopReason::Exhausted));

        assert_eq!(store.row_count(Destination::BirthDates).await.unwrap(), 25);
        assert_eq!(store.load_watermark("birthdates").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_demographics_on_sqlite_with_failing_row() {
        let store = Arc::new(seeded_sqlite_store(&master_records(6)).await.unwrap());
        let config = quick_config(4);
        let client = Arc::new(
            ScriptedPredictionClient::new()
                .with_prediction("Name1", Prediction::new(Language::IsiXhosa, Gender::Male, 0.92))
                .with_always_failing("Name3", PredictionError::TransportError("timeout".into())),
        );
        let events = Arc::new(CollectingEventSink::new());

        let stats = demographic_driver(store.clone(), client.clone(), &config)
            .with_event_sink(events.clone())
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.succeeded, 5);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.failure_codes.get("RETRIES_EXHAUSTED"), Some(&1));
        assert_eq!(client.calls_for("Name3"), 2);
        assert_eq!(store.row_count(Destination::Genders).await.unwrap(), 5);
        assert_eq!(store.row_count(Destination::Languages).await.unwrap(), 5);
        assert_eq!(
            store.stored_value(Destination::Languages, 1).await.unwrap(),
            Some("isiXhosa".to_string())
        );
        assert_eq!(
            store.stored_value(Destination::Genders, 1).await.unwrap(),
            Some("MALE".to_string())
        );
        assert_eq!(events.events_of_type("page.reconciled").len(), 2);

        // the watermark was reset, so the failed row is picked up next run
        let healthy = Arc::new(ScriptedPredictionClient::new());
        let retry = demographic_driver(store.clone(), healthy.clone(), &config)
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(retry.fetched, 1);
        assert_eq!(retry.succeeded, 1);
        assert_eq!(healthy.total_calls(), 1);
        assert_eq!(store.row_count(Destination::Genders).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let store = Arc::new(seeded_sqlite_store(&master_records(7)).await.unwrap());
        let config = quick_config(3).with_dry_run(true);

        let stats = birth_date_driver(store.clone(), &config)
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert!(stats.dry_run);
        assert_eq!(stats.succeeded, 7);
        assert_eq!(stats.upserted.birth_dates.submitted, 7);
        assert_eq!(stats.upserted.total_written(), 0);
        assert_eq!(store.row_count(Destination::BirthDates).await.unwrap(), 0);
        assert_eq!(store.load_watermark("birthdates").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_same_watermark_reproduces_same_page() {
        let store = seeded_sqlite_store(&master_records(12)).await.unwrap();
        let cursor = BatchCursor::new(Eligibility::MissingBirthDate, 5);

        let first = cursor.next_page(&store, 5, 0).await.unwrap();
        let second = cursor.next_page(&store, 5, 0).await.unwrap();
        assert_eq!(first, second);
        let CursorStep::Page(page) = first else {
            panic!("expected a page");
        };
        assert_eq!(
            page.records.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![6, 7, 8, 9, 10]
        );
    }

    #[tokio::test]
    async fn test_failed_write_leaves_page_for_next_run() {
        let store = Arc::new(InMemoryStore::with_records(master_records(4)));
        store.fail_next_reconciles(1);
        let mut settings = DriverSettings::from_config(&quick_config(2));
        settings.max_consecutive_store_errors = 1;

        let driver = PipelineDriver::new(
            store.clone(),
            BirthDateEnricher::new(BirthDateDecoder::with_pivot(25)),
            settings,
        );
        let err = driver.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EnrichflowError::Store(_)));
        assert_eq!(store.row_counts(), (0, 0, 0));
        assert_eq!(store.load_watermark("birthdates").await.unwrap(), None);

        let stats = driver.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(stats.succeeded, 4);
        // both runs started with the same page
        assert_eq!(store.calls().fetches[..2], [0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_page_discards_page() {
        let store = Arc::new(InMemoryStore::with_records(master_records(6)));
        let config = PipelineConfig::default()
            .with_page_size(6)
            .with_concurrency(2)
            .with_strategy(SchedulingStrategy::Chunked);
        let client = Arc::new(ScriptedPredictionClient::new());
        let driver = demographic_driver(store.clone(), client.clone(), &config);

        let cancel = Arc::new(CancellationToken::new());
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel("Interrupted");
        });

        let stats = driver.run(&cancel).await.unwrap();

        assert_eq!(stats.stop_reason, Some(StopReason::Cancelled));
        assert_eq!(stats.pages, 0);
        assert_eq!(client.total_calls(), 2);
        assert_eq!(store.row_counts(), (0, 0, 0));
        assert_eq!(store.calls().reconciles, 0);
    }

    #[tokio::test]
    async fn test_sliding_strategy_end_to_end() {
        let store = Arc::new(InMemoryStore::with_records(master_records(9)));
        let config = quick_config(4).with_strategy(SchedulingStrategy::Sliding);
        let client = Arc::new(ScriptedPredictionClient::new().with_delay(Duration::from_millis(1)));

        let stats = demographic_driver(store.clone(), client.clone(), &config)
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.succeeded, 9);
        assert_eq!(client.total_calls(), 9);
        assert_eq!(store.row_counts(), (0, 9, 9));
    }

    #[tokio::test]
    async fn test_sqlite_store_survives_arc_dyn() {
        let store: Arc<dyn EnrichmentStore> =
            Arc::new(seeded_sqlite_store(&master_records(3)).await.unwrap());
        let stats = birth_date_driver(store, &quick_config(2))
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.succeeded, 3);
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_stores_are_thread_safe() {
        assert_send_sync::<SqliteStore>();
        assert_send_sync::<InMemoryStore>();
    }
}
