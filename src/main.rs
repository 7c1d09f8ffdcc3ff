mod catalog;
mod db;
mod enrich;
mod error;
mod normalize;
mod pacing;
mod scanner;
mod settings;
mod term;
mod workbook;

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::bail;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tracing::{error, info, warn};

use catalog::{HttpTransport, RequestBuilder};
use enrich::{Enricher, FailureLog};
use normalize::{
    IdentityKind, IdentityStrategy, MalformedPolicy, NormalizedSheet, Normalizer, SequenceGenerator,
};
use settings::Settings;
use workbook::import::{import_csv, ImportOutcome};
use workbook::{RecordStore, SqliteWorkbook};

/// Failed course codes listed after an enrichment run; the rest are in the failure log.
const MAX_FAILURES_SHOWN: usize = 10;

#[derive(Parser)]
#[command(
    name = "course_grades",
    about = "Enrich course grade sheets from WebSoc and load them into SQLite"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import CSV exports (one per term sheet) into a workbook
    Import {
        /// Workbook file to create or extend
        workbook: PathBuf,
        /// CSV files named after their term, e.g. "Fall 2019.csv"
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Sheet name to use instead of the file stem (single file only)
        #[arg(short, long)]
        sheet: Option<String>,
        /// Read the fixed column order C..P instead of header names
        #[arg(long)]
        legacy_columns: bool,
    },
    /// Look up pending rows in WebSoc and write results back
    Enrich {
        workbook: PathBuf,
        /// Override the failure log path
        #[arg(long)]
        failure_log: Option<PathBuf>,
        /// Override the catalog endpoint
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// Show per-sheet enrichment progress
    Status { workbook: PathBuf },
    /// Normalize enriched workbooks into the grades database
    Load {
        #[arg(required = true)]
        workbooks: Vec<PathBuf>,
        /// How course rows are identified
        #[arg(long, value_enum, default_value = "surrogate")]
        identity: IdentityKind,
        /// What to do with a row whose grade or GPA cells are not numbers
        #[arg(long, value_enum, default_value = "skip-row")]
        on_malformed: MalformedPolicy,
        /// Override the database path
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Query loaded courses
    Courses {
        /// Filter by department (e.g. "COMPSCI")
        #[arg(short, long)]
        department: Option<String>,
        /// Filter by course number (e.g. "161")
        #[arg(long)]
        number: Option<String>,
        /// Filter by course code
        #[arg(long)]
        code: Option<i64>,
        #[arg(short, long)]
        year: Option<i32>,
        /// FALL, WINTER, SPRING or SUMMER
        #[arg(short, long)]
        quarter: Option<String>,
        /// Substring of an instructor name
        #[arg(short, long)]
        instructor: Option<String>,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load()?;

    let result = match cli.command {
        Commands::Import {
            workbook,
            files,
            sheet,
            legacy_columns,
        } => {
            if sheet.is_some() && files.len() > 1 {
                bail!("--sheet can only be used with a single file");
            }
            let mut wb = SqliteWorkbook::open(&workbook)?;
            let mut imported = 0;
            for file in &files {
                match import_csv(&mut wb, file, sheet.as_deref(), legacy_columns)? {
                    ImportOutcome::Imported { sheet, rows } => {
                        println!("{}: {} rows", sheet, rows);
                        imported += 1;
                    }
                    ImportOutcome::AlreadyPresent { sheet } => {
                        println!("{}: already imported, left unchanged", sheet);
                    }
                }
            }
            wb.save()?;
            println!("Imported {} of {} files into {:?}", imported, files.len(), workbook);
            Ok(())
        }
        Commands::Enrich {
            workbook,
            failure_log,
            endpoint,
        } => {
            if let Some(path) = failure_log {
                settings.failure_log = path;
            }
            if let Some(url) = endpoint {
                settings.endpoint = url;
            }
            run_enrich(&workbook, &settings).await
        }
        Commands::Status { workbook } => {
            let wb = SqliteWorkbook::open_existing(&workbook)?;
            let progress = wb.progress()?;
            if progress.is_empty() {
                println!("No sheets. Run 'import' first.");
                return Ok(());
            }
            println!("{:<16} | {:>6} | {:>6} | {:>7}", "Sheet", "Rows", "Done", "Pending");
            println!("{}", "-".repeat(44));
            for p in &progress {
                println!(
                    "{:<16} | {:>6} | {:>6} | {:>7}",
                    truncate(&p.sheet, 16),
                    p.total,
                    p.done,
                    p.total - p.done
                );
            }
            Ok(())
        }
        Commands::Load {
            workbooks,
            identity,
            on_malformed,
            db: db_path,
        } => {
            if let Some(path) = db_path {
                settings.db_path = path;
            }
            run_load(&workbooks, identity, on_malformed, &settings.db_path)
        }
        Commands::Courses {
            department,
            number,
            code,
            year,
            quarter,
            instructor,
            limit,
            db: db_path,
        } => {
            let path = db_path.unwrap_or(settings.db_path);
            let conn = db::connect(&path)?;
            let Some(kind) = db::existing_identity(&conn)? else {
                println!("No courses loaded. Run 'load' first.");
                return Ok(());
            };
            let filter = db::CourseFilter {
                department,
                course_number: number,
                course_code: code,
                year,
                quarter,
                instructor,
                limit,
            };
            let rows = db::query_courses(&conn, kind, &filter)?;
            if rows.is_empty() {
                println!("No courses found.");
                return Ok(());
            }

            println!(
                "{:<12} | {:>5} | {:<10} | {:<7} | {:<24} | {:>4} | {:>4} | {:<24}",
                "Term", "Code", "Dept", "Number", "Title", "GPA", "A", "Instructors"
            );
            println!("{}", "-".repeat(110));
            for r in &rows {
                println!(
                    "{:<12} | {:05} | {:<10} | {:<7} | {:<24} | {:>4.2} | {:>4} | {:<24}",
                    r.term,
                    r.course_code,
                    truncate(&r.department, 10),
                    truncate(&r.course_number, 7),
                    truncate(&r.course_title, 24),
                    r.gpa_avg,
                    r.grades[0],
                    truncate(&r.instructors, 24),
                );
            }

            let stats = db::get_stats(&conn)?;
            println!(
                "\n{} shown | {} courses, {} instructor rows, {} terms in {:?}",
                rows.len(),
                stats.courses,
                stats.instructors,
                stats.terms,
                path
            );
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn run_enrich(path: &Path, settings: &Settings) -> anyhow::Result<()> {
    let mut wb = SqliteWorkbook::open_existing(path)?;
    let pending: usize = wb.progress()?.iter().map(|p| p.total - p.done).sum();
    if pending == 0 {
        println!("No pending rows. Run 'import' first or every row is enriched.");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current row");
            let _ = shutdown_tx.send(true);
        }
    });

    let transport = HttpTransport::new(settings.timeout())?;
    let builder = RequestBuilder::new(settings.endpoint.clone(), settings.user_agent.clone());
    let failures = FailureLog::open(&settings.failure_log)?;

    let pb = ProgressBar::new(pending as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )?
            .progress_chars("#>-"),
    );

    println!("Enriching {} pending rows from {:?}...", pending, path);
    let mut enricher = Enricher::new(
        &mut wb,
        transport,
        builder,
        settings.retry_policy()?,
        failures,
        shutdown_rx,
    )
    .with_progress(pb.clone());
    let stats = enricher.run().await?;
    pb.finish_and_clear();

    println!(
        "Done: {} attempted ({} enriched, {} failed).",
        stats.attempted, stats.enriched, stats.failed
    );
    if stats.collisions > 0 {
        println!(
            "{} split-term rows matched more than one session; the first match was kept.",
            stats.collisions
        );
    }
    if stats.failed > 0 {
        let failures = enricher.failures().records();
        let shown: Vec<String> = failures
            .iter()
            .take(MAX_FAILURES_SHOWN)
            .map(|f| format!("#{} ({})", f.course_code, f.term))
            .collect();
        let more = failures.len().saturating_sub(MAX_FAILURES_SHOWN);
        if more > 0 {
            println!("Failed: {} and {} more", shown.join(", "), more);
        } else {
            println!("Failed: {}", shown.join(", "));
        }
        println!("Failures appended to {:?}", settings.failure_log);
    }
    if stats.interrupted {
        println!("Interrupted. Run 'enrich' again to resume.");
    }
    Ok(())
}

fn run_load(
    workbooks: &[PathBuf],
    identity: IdentityKind,
    policy: MalformedPolicy,
    db_path: &Path,
) -> anyhow::Result<()> {
    let books = workbooks
        .iter()
        .map(|path| SqliteWorkbook::open_existing(path).map(|wb| (path, wb)))
        .collect::<Result<Vec<_>, _>>()?;

    let conn = db::connect(db_path)?;
    match db::existing_identity(&conn)? {
        Some(existing) if existing != identity => {
            bail!("{:?} already uses {:?} course ids, not {:?}", db_path, existing, identity)
        }
        Some(_) => {}
        None => db::create_schema(&conn, identity)?,
    }
    db::create_indexes(&conn)?;
    db::create_view(&conn, identity)?;

    let strategy = match identity {
        IdentityKind::Surrogate => {
            IdentityStrategy::Surrogate(SequenceGenerator::starting_at(db::next_course_id(&conn)?))
        }
        IdentityKind::Composite => IdentityStrategy::Composite,
    };
    let mut normalizer = Normalizer::new(strategy, policy);

    let mut failed = 0;
    for (path, wb) in &books {
        let t_file = Instant::now();
        normalizer.start_file();

        let mut file = NormalizedSheet::default();
        let mut aborted = false;
        for sheet in wb.sheet_names()? {
            let rows = wb.rows(&sheet)?;
            match normalizer.normalize(&sheet, &rows) {
                Ok(out) => file.extend(out),
                Err(e) => {
                    error!(file = %path.display(), sheet = %sheet, "Skipping file: {}", e);
                    aborted = true;
                    break;
                }
            }
        }
        if aborted {
            failed += 1;
            continue;
        }

        match db::load(&conn, path, &file.courses, &file.instructors) {
            Ok(counts) => {
                info!(elapsed = ?t_file.elapsed(), "Finished {:?}", path);
                println!(
                    "{:?}: {} courses, {} instructors \
                     ({} malformed, {} unenriched, {} duplicate rows skipped)",
                    path,
                    counts.courses,
                    counts.instructors,
                    file.malformed.len(),
                    file.unenriched,
                    file.duplicates
                );
            }
            Err(e) => {
                error!("{}", e);
                failed += 1;
            }
        }
    }

    let stats = db::get_stats(&conn)?;
    println!(
        "Database {:?}: {} courses, {} instructor rows, {} terms",
        db_path, stats.courses, stats.instructors, stats.terms
    );
    if failed > 0 {
        bail!("{} of {} files were not loaded", failed, workbooks.len());
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate("ALGORITHMS", 20), "ALGORITHMS");
        assert_eq!(truncate("ÉCOLE NORMALE", 5), "ÉCOLE...");
    }

    #[test]
    fn formats_durations() {
        use std::time::Duration;
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn cli_parses_load_options() {
        let cli = Cli::try_parse_from([
            "course_grades",
            "load",
            "a.sqlite",
            "b.sqlite",
            "--identity",
            "composite",
            "--on-malformed",
            "abort-file",
        ])
        .unwrap();
        match cli.command {
            Commands::Load {
                workbooks,
                identity,
                on_malformed,
                db: db_path,
            } => {
                assert_eq!(workbooks.len(), 2);
                assert_eq!(identity, IdentityKind::Composite);
                assert_eq!(on_malformed, MalformedPolicy::AbortFile);
                assert!(db_path.is_none());
            }
            _ => panic!("expected load"),
        }
    }

    fn enriched_workbook(path: &Path, sheets: &[(&str, &str, &str)]) {
        use crate::workbook::tests::row;
        use crate::workbook::SourceRow;

        let mut wb = SqliteWorkbook::open(path).unwrap();
        for (sheet, code, grade_a) in sheets {
            let source = SourceRow {
                department: Some("COMPSCI".into()),
                course_number: Some("161".into()),
                course_title: Some("ALGORITHMS".into()),
                instructors: Some("Jane Doe".into()),
                ..row(code, [*grade_a, "1", "1", "1", "1", "1", "1"], Some("3.0"))
            };
            wb.insert_sheet(sheet, None, &[source]).unwrap();
        }
    }

    #[test]
    fn load_rejects_missing_workbook_without_creating_it() {
        let dir = tempfile::tempdir().unwrap();
        let typo = dir.path().join("fal_2019.sqlite");
        let db_path = dir.path().join("grades.sqlite");

        let result = run_load(
            &[typo.clone()],
            IdentityKind::Surrogate,
            MalformedPolicy::SkipRow,
            &db_path,
        );
        assert!(result.is_err());
        assert!(!typo.exists());
        assert!(!db_path.exists());
    }

    #[test]
    fn rejected_file_does_not_hide_courses_from_later_files() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.sqlite");
        let second = dir.path().join("second.sqlite");
        let db_path = dir.path().join("grades.sqlite");
        enriched_workbook(&first, &[("FALL 2019", "1234", "5"), ("WINTER 2020", "7", "x")]);
        enriched_workbook(&second, &[("FALL 2019", "1234", "5")]);

        let result = run_load(
            &[first, second],
            IdentityKind::Composite,
            MalformedPolicy::AbortFile,
            &db_path,
        );
        assert!(result.is_err());

        let conn = db::connect(&db_path).unwrap();
        assert_eq!(db::course_count(&conn).unwrap(), 1);
        assert_eq!(db::instructor_count(&conn).unwrap(), 1);
    }
}
