use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::catalog::{CatalogClient, CatalogTransport, LookupResult, RequestBuilder};
use crate::pacing::{Pacer, RetryPolicy};
use crate::scanner::RowScanner;
use crate::term::{CourseCode, Term};
use crate::workbook::{Enrichment, RecordStore};

/// One row that could not be enriched in this run.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub course_code: String,
    pub term: String,
    pub reason: String,
}

/// Append-only JSON-lines sink for failed rows.
pub struct FailureLog {
    out: Option<BufWriter<File>>,
    records: Vec<FailureRecord>,
}

impl FailureLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open failure log {:?}", path))?;
        Ok(Self {
            out: Some(BufWriter::new(file)),
            records: Vec::new(),
        })
    }

    /// Keeps records in memory only.
    #[cfg(test)]
    pub fn discard() -> Self {
        Self {
            out: None,
            records: Vec::new(),
        }
    }

    pub fn record(&mut self, course_code: &str, term: &str, reason: &str) -> Result<()> {
        warn!("Failed to process course #{} ({}): {}", course_code, term, reason);
        let record = FailureRecord {
            timestamp: Utc::now(),
            course_code: course_code.to_string(),
            term: term.to_string(),
            reason: reason.to_string(),
        };
        if let Some(out) = self.out.as_mut() {
            serde_json::to_writer(&mut *out, &record)?;
            out.write_all(b"\n")?;
            out.flush()?;
        }
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[FailureRecord] {
        &self.records
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnrichStats {
    pub attempted: usize,
    pub enriched: usize,
    pub failed: usize,
    /// Split-term rows where more than one session matched.
    pub collisions: usize,
    pub interrupted: bool,
}

/// Resolves once `true` is published on the channel. Never resolves if the sender is gone.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Drives scanner → request builder → catalog client → commit for every sheet.
pub struct Enricher<'a, S, T> {
    store: &'a mut S,
    client: CatalogClient<T>,
    builder: RequestBuilder,
    row_pacer: Pacer,
    max_attempts: u32,
    failures: FailureLog,
    shutdown: watch::Receiver<bool>,
    progress: ProgressBar,
}

impl<'a, S: RecordStore, T: CatalogTransport> Enricher<'a, S, T> {
    pub fn new(
        store: &'a mut S,
        transport: T,
        builder: RequestBuilder,
        policy: RetryPolicy,
        failures: FailureLog,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            client: CatalogClient::new(transport, policy.session_pause),
            builder,
            row_pacer: Pacer::new("row", policy.row_pause),
            max_attempts: policy.max_attempts_per_run.max(1),
            failures,
            shutdown,
            progress: ProgressBar::hidden(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn failures(&self) -> &FailureLog {
        &self.failures
    }

    #[cfg(test)]
    pub fn row_pacer(&self) -> &Pacer {
        &self.row_pacer
    }

    #[cfg(test)]
    pub fn client(&self) -> &CatalogClient<T> {
        &self.client
    }

    /// Enrich every pending row. Per-row failures are logged and skipped; only store errors abort.
    /// On shutdown the in-flight row is abandoned and stays pending.
    pub async fn run(&mut self) -> Result<EnrichStats> {
        let mut stats = EnrichStats::default();

        'sheets: for sheet in self.store.sheet_names()? {
            let term = match Term::parse(&sheet) {
                Ok(term) => term,
                Err(e) => {
                    warn!(sheet = %sheet, "Skipping sheet: {}", e);
                    continue;
                }
            };

            let mut scanner = RowScanner::new(&*self.store, &sheet)?;
            while let Some(row) = scanner.next(&*self.store)? {
                if *self.shutdown.borrow() {
                    stats.interrupted = true;
                    break 'sheets;
                }
                stats.attempted += 1;

                let code = match CourseCode::normalize(&row.course_code) {
                    Ok(code) => code,
                    Err(e) => {
                        self.failures.record(&row.course_code, &sheet, &e.to_string())?;
                        stats.failed += 1;
                        self.progress.inc(1);
                        continue;
                    }
                };
                let requests = self.builder.build_requests(&term, &code);

                let mut attempt = 0;
                let result = loop {
                    attempt += 1;
                    tokio::select! {
                        _ = self.row_pacer.before_call() => {}
                        _ = wait_for_shutdown(&mut self.shutdown) => {
                            stats.attempted -= 1;
                            stats.interrupted = true;
                            break 'sheets;
                        }
                    }

                    info!("Processing course #{} ({}).", code, sheet);
                    let result = tokio::select! {
                        result = self.client.execute(&requests, &code) => result,
                        _ = wait_for_shutdown(&mut self.shutdown) => {
                            info!(
                                course_code = %code,
                                sheet = %sheet,
                                "Interrupted, row left pending"
                            );
                            stats.attempted -= 1;
                            stats.interrupted = true;
                            break 'sheets;
                        }
                    };
                    match result {
                        LookupResult::TransientFailure { reason }
                            if attempt < self.max_attempts =>
                        {
                            warn!(
                                course_code = %code,
                                sheet = %sheet,
                                attempt,
                                "Retrying after transient failure: {}", reason
                            );
                        }
                        result => break result,
                    }
                };

                match result.into_record(code.as_str(), &sheet) {
                    Ok(record) if record.is_complete() => {
                        if record.collided_with.is_some() {
                            stats.collisions += 1;
                        }
                        let enrichment = Enrichment {
                            course_code: code.to_string(),
                            department: record.department,
                            course_number: record.course_number,
                            course_title: record.course_title,
                            instructors: record.instructors,
                        };
                        self.store
                            .commit_enrichment(&sheet, row.row, &enrichment)
                            .with_context(|| {
                                format!("Failed to save row {} of {}", row.row, sheet)
                            })?;
                        self.store.save()?;
                        stats.enriched += 1;
                    }
                    Ok(_) => {
                        self.failures.record(
                            code.as_str(),
                            &sheet,
                            "Catalog record is missing department, course number or title",
                        )?;
                        stats.failed += 1;
                    }
                    Err(e) => {
                        self.failures.record(code.as_str(), &sheet, &e.to_string())?;
                        stats.failed += 1;
                    }
                }
                self.progress.inc(1);
            }
        }

        self.progress.finish_and_clear();
        let paused: Duration = self.row_pacer.pauses().iter().sum();
        info!(
            attempted = stats.attempted,
            enriched = stats.enriched,
            failed = stats.failed,
            collisions = stats.collisions,
            interrupted = stats.interrupted,
            lookups = self.row_pacer.calls(),
            paused_secs = paused.as_secs_f64(),
            "Enrichment run finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::catalog::testing::{course_xml, FakeTransport};
    use crate::catalog::client::TransportError;
    use crate::catalog::CatalogRequest;
    use crate::pacing::Window;
    use crate::workbook::tests::row;
    use crate::workbook::{Processed, SqliteWorkbook};

    const G: [&str; 7] = ["10", "8", "3", "1", "0", "2", "0"];

    fn policy(ms: u64) -> RetryPolicy {
        let w = Window::new(Duration::from_millis(ms), Duration::from_millis(ms)).unwrap();
        RetryPolicy {
            max_attempts_per_run: 1,
            row_pause: w,
            session_pause: Window::new(Duration::ZERO, Duration::ZERO).unwrap(),
        }
    }

    fn builder() -> RequestBuilder {
        RequestBuilder::new("http://catalog.test/WebSoc", "test-agent")
    }

    fn seed(wb: &mut SqliteWorkbook, sheet: &str, codes: &[&str]) {
        let rows: Vec<_> = codes.iter().map(|c| row(c, G, None)).collect();
        wb.insert_sheet(sheet, None, &rows).unwrap();
    }

    fn found(code: &str) -> Result<String, TransportError> {
        let instructors = ["\n", "STAFF", "Jane Doe", "John Roe"];
        Ok(course_xml("COMPSCI", "161", "ALGORITHMS", code, &instructors))
    }

    #[tokio::test]
    async fn enriches_pending_rows_and_logs_failures() {
        let mut wb = SqliteWorkbook::open_in_memory().unwrap();
        seed(&mut wb, "Fall 2019", &["1234", "99999", "12a4"]);
        seed(&mut wb, "Summer 2020", &["500"]);

        let fake = FakeTransport::new()
            .respond_code("2019-92", "01234", found("01234"))
            .respond_code("2020-39", "00500", found("00500"));
        let (_tx, rx) = watch::channel(false);
        let mut enricher = Enricher::new(
            &mut wb,
            fake,
            builder(),
            policy(1),
            FailureLog::discard(),
            rx,
        );
        let stats = enricher.run().await.unwrap();

        assert_eq!(
            stats,
            EnrichStats {
                attempted: 4,
                enriched: 2,
                failed: 2,
                collisions: 0,
                interrupted: false,
            }
        );
        let failures = enricher.failures().records();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].course_code, "99999");
        assert!(failures[0].reason.contains("not found"));
        assert_eq!(failures[1].course_code, "12a4");
        // invalid code never reaches the catalog: 1 + 1 + 3 requests
        assert_eq!(
            enricher.client().transport().sent_codes(),
            vec!["01234", "99999", "00500", "00500", "00500"]
        );
        // three catalog lookups, two pauses between them
        assert_eq!(enricher.row_pacer().pauses().len(), 2);

        let r = wb.row("Fall 2019", 2).unwrap().unwrap();
        assert_eq!(r.processed, Processed::Done);
        assert_eq!(r.course_code, "01234");
        assert_eq!(r.instructors.as_deref(), Some("Jane Doe; John Roe"));
        assert_eq!(r.gpa.as_deref(), Some("0"));
        assert_eq!(wb.row("Fall 2019", 3).unwrap().unwrap().processed, Processed::Pending);
        assert_eq!(wb.row("Summer 2020", 2).unwrap().unwrap().processed, Processed::Done);
    }

    #[tokio::test]
    async fn second_run_only_queries_pending_rows() {
        let mut wb = SqliteWorkbook::open_in_memory().unwrap();
        seed(&mut wb, "Fall 2019", &["1", "2", "3"]);

        let fake = FakeTransport::new()
            .respond_code("2019-92", "00001", found("00001"))
            .respond_code("2019-92", "00003", found("00003"));
        let (_tx, rx) = watch::channel(false);
        Enricher::new(&mut wb, fake, builder(), policy(0), FailureLog::discard(), rx)
            .run()
            .await
            .unwrap();

        let fake = FakeTransport::new().respond("2019-92", Err(TransportError::Status(503)));
        let (_tx, rx) = watch::channel(false);
        let mut enricher = Enricher::new(
            &mut wb,
            fake,
            builder(),
            policy(0),
            FailureLog::discard(),
            rx,
        );
        let stats = enricher.run().await.unwrap();
        assert_eq!(stats.attempted, 1);
        assert_eq!(enricher.client().transport().sent_codes(), vec!["00002"]);
        assert!(enricher.failures().records()[0].reason.contains("503"));
    }

    #[tokio::test]
    async fn incomplete_catalog_record_is_a_failure() {
        let mut wb = SqliteWorkbook::open_in_memory().unwrap();
        seed(&mut wb, "Fall 2019", &["1"]);
        let fake = FakeTransport::new()
            .respond("2019-92", Ok(course_xml("", "161", "ALGORITHMS", "00001", &[])));
        let (_tx, rx) = watch::channel(false);
        let stats = Enricher::new(&mut wb, fake, builder(), policy(0), FailureLog::discard(), rx)
            .run()
            .await
            .unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(wb.row("Fall 2019", 2).unwrap().unwrap().processed, Processed::Pending);
    }

    #[tokio::test]
    async fn shutdown_before_start_touches_nothing() {
        let mut wb = SqliteWorkbook::open_in_memory().unwrap();
        seed(&mut wb, "Fall 2019", &["1"]);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let mut enricher = Enricher::new(
            &mut wb,
            FakeTransport::new(),
            builder(),
            policy(0),
            FailureLog::discard(),
            rx,
        );
        let stats = enricher.run().await.unwrap();
        assert!(stats.interrupted);
        assert_eq!(stats.attempted, 0);
        assert!(enricher.client().transport().sent().is_empty());
    }

    #[tokio::test]
    async fn split_term_collision_is_counted() {
        let mut wb = SqliteWorkbook::open_in_memory().unwrap();
        seed(&mut wb, "Summer 2019", &["1"]);
        let fake = FakeTransport::new()
            .respond("2019-25", found("00001"))
            .respond("2019-76", found("00001"));
        let (_tx, rx) = watch::channel(false);
        let stats = Enricher::new(&mut wb, fake, builder(), policy(0), FailureLog::discard(), rx)
            .run()
            .await
            .unwrap();
        assert_eq!(stats.enriched, 1);
        assert_eq!(stats.collisions, 1);
    }

    /// Fails the first `failures` calls with a network error, then answers normally.
    struct FlakyTransport {
        failures: usize,
        calls: Cell<usize>,
    }

    impl CatalogTransport for FlakyTransport {
        async fn send(&self, request: &CatalogRequest) -> Result<String, TransportError> {
            let n = self.calls.get() + 1;
            self.calls.set(n);
            if n <= self.failures {
                return Err(TransportError::Network("connection reset".into()));
            }
            found(request.course_code.as_str())
        }
    }

    #[tokio::test]
    async fn transient_failure_is_retried_up_to_max_attempts() {
        let mut wb = SqliteWorkbook::open_in_memory().unwrap();
        seed(&mut wb, "Fall 2019", &["1"]);
        let transport = FlakyTransport { failures: 1, calls: Cell::new(0) };
        let policy = RetryPolicy { max_attempts_per_run: 2, ..policy(1) };
        let (_tx, rx) = watch::channel(false);
        let mut enricher = Enricher::new(
            &mut wb,
            transport,
            builder(),
            policy,
            FailureLog::discard(),
            rx,
        );
        let stats = enricher.run().await.unwrap();
        assert_eq!(stats.enriched, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(enricher.client().transport().calls.get(), 2);
        // the retry is paced like any other lookup
        assert_eq!(enricher.row_pacer().pauses().len(), 1);
        assert_eq!(wb.row("Fall 2019", 2).unwrap().unwrap().processed, Processed::Done);
    }

    #[tokio::test]
    async fn single_attempt_leaves_transient_failure_pending() {
        let mut wb = SqliteWorkbook::open_in_memory().unwrap();
        seed(&mut wb, "Fall 2019", &["1"]);
        let transport = FlakyTransport { failures: 1, calls: Cell::new(0) };
        let (_tx, rx) = watch::channel(false);
        let mut enricher = Enricher::new(
            &mut wb,
            transport,
            builder(),
            policy(0),
            FailureLog::discard(),
            rx,
        );
        let stats = enricher.run().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(enricher.client().transport().calls.get(), 1);
        assert!(enricher.failures().records()[0].reason.contains("connection reset"));
        assert_eq!(wb.row("Fall 2019", 2).unwrap().unwrap().processed, Processed::Pending);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let mut wb = SqliteWorkbook::open_in_memory().unwrap();
        seed(&mut wb, "Fall 2019", &["1"]);
        let fake = FakeTransport::new().respond("2019-92", Err(TransportError::Status(500)));
        let policy = RetryPolicy { max_attempts_per_run: 3, ..policy(0) };
        let (_tx, rx) = watch::channel(false);
        let mut enricher = Enricher::new(
            &mut wb,
            fake,
            builder(),
            policy,
            FailureLog::discard(),
            rx,
        );
        let stats = enricher.run().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(enricher.client().transport().sent().len(), 1);
    }

    /// Answers every request until call `hang_at`, which publishes shutdown and never returns.
    struct InterruptingTransport {
        tx: watch::Sender<bool>,
        hang_at: usize,
        calls: Cell<usize>,
    }

    impl CatalogTransport for InterruptingTransport {
        async fn send(&self, request: &CatalogRequest) -> Result<String, TransportError> {
            let n = self.calls.get() + 1;
            self.calls.set(n);
            if n == self.hang_at {
                self.tx.send(true).unwrap();
                std::future::pending::<()>().await;
            }
            found(request.course_code.as_str())
        }
    }

    #[tokio::test]
    async fn crash_mid_row_leaves_previous_rows_durable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2019.sqlite");
        let log_path = dir.path().join("failures.jsonl");
        {
            let mut wb = SqliteWorkbook::open(&path).unwrap();
            seed(&mut wb, "Fall 2019", &["1", "2", "3"]);

            let (tx, rx) = watch::channel(false);
            let transport = InterruptingTransport { tx, hang_at: 2, calls: Cell::new(0) };
            let failures = FailureLog::open(&log_path).unwrap();
            let stats = Enricher::new(&mut wb, transport, builder(), policy(0), failures, rx)
                .run()
                .await
                .unwrap();
            assert!(stats.interrupted);
            assert_eq!(stats.enriched, 1);
        }

        let wb = SqliteWorkbook::open(&path).unwrap();
        assert_eq!(wb.row("Fall 2019", 2).unwrap().unwrap().processed, Processed::Done);
        assert_eq!(wb.row("Fall 2019", 3).unwrap().unwrap().processed, Processed::Pending);
        assert_eq!(crate::scanner::find_resume_point(&wb, "Fall 2019").unwrap(), Some(3));
    }

    #[test]
    fn failure_log_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/failures.jsonl");
        let mut log = FailureLog::open(&path).unwrap();
        log.record("01234", "Fall 2019", "Server returns error code (500)").unwrap();
        drop(log);
        let mut log = FailureLog::open(&path).unwrap();
        log.record("00007", "Spring 2020", "timed out").unwrap();
        drop(log);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["course_code"], "01234");
        assert_eq!(lines[1]["term"], "Spring 2020");
        assert!(lines[1]["timestamp"].is_string());
    }
}
