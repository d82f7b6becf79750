use std::fmt;
use std::fs;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};

use crate::archive::ArchiveSource;
use crate::config::{BotConfig, Credentials, RunOptions};
use crate::extract::extract_titles;
use crate::lua_table::{last_issue_in, render_titles_module, validate_module};
use crate::overlay::{apply_corrections, standard_corrections};
use crate::publish::{EditOutcome, EditPlan, EditRejection, WikiPageApi, plan_edit};

const INITIAL_BACKOFF: Duration = Duration::from_secs(30);
const BACKOFF_CEILING: Duration = Duration::from_secs(1920);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Downloading,
    Parsing,
    Reconciling,
    Publishing,
    BackingOff,
    Done,
    Failed,
}

/// Injectable time source so the backoff schedule is testable without real
/// delays.
pub trait Clock {
    fn now_unix(&self) -> u64;
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs())
            .unwrap_or(0)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Doubling delay with a fixed ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    ceiling: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        Self {
            current: initial,
            ceiling,
        }
    }

    /// Delay to sleep before the next attempt; doubles for the one after,
    /// saturating at the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.ceiling);
        self.current = (self.current * 2).min(self.ceiling);
        delay
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Yes,
    No,
    Quit,
}

/// Operator interaction seam. Confirmation is never consulted in `--auto`
/// mode; progress lines go through [`Prompter::notify`] so the core stays
/// silent and the CLI owns all terminal output.
pub trait Prompter {
    fn confirm(&mut self, summary: &str, diff: &str) -> Result<Confirmation>;

    fn notify(&mut self, _message: &str) {}
}

/// Explicit operator quit during the prompt. Terminates the run immediately,
/// never retried.
#[derive(Debug)]
pub struct UserAbort;

impl fmt::Display for UserAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user quit bot run")
    }
}

impl std::error::Error for UserAbort {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Published { summary: String },
    /// Published text already matched the rendered table.
    NoChange,
    /// Operator answered no at the prompt.
    Declined,
    Rejected { reason: EditRejection, detail: String },
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    /// States entered, in order. Ends with Done or Failed.
    pub states: Vec<CycleState>,
    pub missing: Vec<u32>,
    pub corrections_applied: usize,
    pub table_len: usize,
    pub last_issue: Option<u32>,
}

impl CycleReport {
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, CycleOutcome::Rejected { .. })
    }
}

/// One download-parse-reconcile-publish pass.
pub fn run_cycle<A, W, P>(
    options: &RunOptions,
    credentials: &Credentials,
    archive: &A,
    wiki: &mut W,
    prompter: &mut P,
) -> Result<CycleReport>
where
    A: ArchiveSource,
    W: WikiPageApi,
    P: Prompter,
{
    let mut states = vec![CycleState::Idle];

    states.push(CycleState::Downloading);
    let listing = archive.load(options.no_download)?;
    if let Some(warning) = &listing.warning {
        prompter.notify(&format!("warning: {warning}"));
    }

    states.push(CycleState::Parsing);
    let extraction = extract_titles(&listing.text)?;
    for number in &extraction.missing {
        prompter.notify(&format!("warning: missing comic #{number}"));
    }

    states.push(CycleState::Reconciling);
    let mut table = extraction.table;
    let applied = apply_corrections(&mut table, standard_corrections())?;
    let rendered = render_titles_module(&table);
    validate_module(&rendered)?;
    fs::write(&options.data_file, &rendered)
        .with_context(|| format!("failed to write {}", options.data_file.display()))?;

    states.push(CycleState::Publishing);
    wiki.login(&credentials.username, &credentials.password)?;
    let old_text = match wiki.fetch_page_text(&options.page)? {
        Some(text) => text,
        None => bail!("page '{}' does not exist, aborting", options.page),
    };

    let base_report = |outcome: CycleOutcome, states: Vec<CycleState>| CycleReport {
        outcome,
        states,
        missing: extraction.missing.clone(),
        corrections_applied: applied.len(),
        table_len: table.len(),
        last_issue: last_issue_in(&rendered),
    };

    match plan_edit(&old_text, &rendered, options.summary_note.as_deref()) {
        EditPlan::NoChange => {
            states.push(CycleState::Done);
            Ok(base_report(CycleOutcome::NoChange, states))
        }
        EditPlan::Update { summary, diff } => {
            if !options.auto {
                match prompter.confirm(&summary, &diff)? {
                    Confirmation::Yes => {}
                    Confirmation::No => {
                        states.push(CycleState::Done);
                        return Ok(base_report(CycleOutcome::Declined, states));
                    }
                    Confirmation::Quit => return Err(UserAbort.into()),
                }
            }

            match wiki.submit_edit(&options.page, &rendered, &summary)? {
                EditOutcome::Saved => {
                    states.push(CycleState::Done);
                    Ok(base_report(CycleOutcome::Published { summary }, states))
                }
                EditOutcome::Rejected { reason, detail } => {
                    states.push(CycleState::Failed);
                    Ok(base_report(CycleOutcome::Rejected { reason, detail }, states))
                }
            }
        }
    }
}

/// Repeat cycles with doubling backoff until one succeeds, the operator
/// quits, or the cycle budget runs out. Every attempt leaves a timestamp in
/// the marker file; a write failure there is a warning, never fatal.
pub fn run_until_published<A, W, P, C>(
    config: &BotConfig,
    options: &RunOptions,
    credentials: &Credentials,
    archive: &A,
    wiki: &mut W,
    prompter: &mut P,
    clock: &C,
) -> Result<CycleReport>
where
    A: ArchiveSource,
    W: WikiPageApi,
    P: Prompter,
    C: Clock,
{
    let mut backoff = Backoff::new(INITIAL_BACKOFF, BACKOFF_CEILING);

    for cycle in 1..=options.max_cycles {
        match run_cycle(options, credentials, archive, wiki, prompter) {
            Ok(report) if report.is_success() => {
                write_marker(config, clock, true, prompter);
                return Ok(report);
            }
            Ok(report) => {
                write_marker(config, clock, false, prompter);
                if cycle == options.max_cycles {
                    return Ok(report);
                }
            }
            Err(error) => {
                write_marker(config, clock, false, prompter);
                if error.downcast_ref::<UserAbort>().is_some() {
                    return Err(error);
                }
                prompter.notify(&format!("cycle {cycle} failed: {error:#}"));
                if cycle == options.max_cycles {
                    return Err(error);
                }
            }
        }

        let delay = backoff.next_delay();
        prompter.notify(&format!(
            "backing off for {}s before retrying",
            delay.as_secs()
        ));
        clock.sleep(delay);
    }

    bail!("no cycle completed within {} attempts", options.max_cycles)
}

fn write_marker<C: Clock, P: Prompter>(
    config: &BotConfig,
    clock: &C,
    success: bool,
    prompter: &mut P,
) {
    let label = if success { "success" } else { "failure" };
    let line = format!("{label} {}\n", clock.now_unix());
    if let Err(error) = fs::write(config.marker_file(), line) {
        prompter.notify(&format!(
            "warning: failed to write marker {}: {error}",
            config.marker_file().display()
        ));
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use tempfile::tempdir;

    use super::*;
    use crate::archive::{ArchiveOrigin, ArchiveText};
    use crate::config::ArchiveSection;

    struct FakeArchive {
        text: String,
        warning: Option<String>,
    }

    impl ArchiveSource for FakeArchive {
        fn load(&self, _no_download: bool) -> Result<ArchiveText> {
            Ok(ArchiveText {
                text: self.text.clone(),
                origin: ArchiveOrigin::LocalOnly,
                warning: self.warning.clone(),
            })
        }
    }

    #[derive(Default)]
    struct MockWiki {
        page_text: Option<String>,
        edits: Vec<(String, String, String)>,
        reject_first: usize,
        logged_in: bool,
        request_count: usize,
    }

    impl WikiPageApi for MockWiki {
        fn login(&mut self, _username: &str, _password: &str) -> Result<()> {
            self.request_count += 1;
            self.logged_in = true;
            Ok(())
        }

        fn fetch_page_text(&mut self, _title: &str) -> Result<Option<String>> {
            self.request_count += 1;
            Ok(self.page_text.clone())
        }

        fn submit_edit(&mut self, title: &str, text: &str, summary: &str) -> Result<EditOutcome> {
            self.request_count += 1;
            assert!(self.logged_in, "edit before login");
            if self.reject_first > 0 {
                self.reject_first -= 1;
                return Ok(EditOutcome::Rejected {
                    reason: EditRejection::Conflict,
                    detail: "editconflict".to_string(),
                });
            }
            self.edits
                .push((title.to_string(), text.to_string(), summary.to_string()));
            self.page_text = Some(text.to_string());
            Ok(EditOutcome::Saved)
        }

        fn request_count(&self) -> usize {
            self.request_count
        }
    }

    struct FixedPrompter {
        answer: Confirmation,
        calls: usize,
        notes: Vec<String>,
    }

    impl FixedPrompter {
        fn new(answer: Confirmation) -> Self {
            Self {
                answer,
                calls: 0,
                notes: Vec::new(),
            }
        }
    }

    impl Prompter for FixedPrompter {
        fn confirm(&mut self, _summary: &str, _diff: &str) -> Result<Confirmation> {
            self.calls += 1;
            Ok(self.answer)
        }

        fn notify(&mut self, message: &str) {
            self.notes.push(message.to_string());
        }
    }

    struct PanicPrompter;

    impl Prompter for PanicPrompter {
        fn confirm(&mut self, _summary: &str, _diff: &str) -> Result<Confirmation> {
            panic!("prompter consulted in auto mode");
        }
    }

    struct FakeClock {
        now: u64,
        sleeps: RefCell<Vec<Duration>>,
    }

    impl FakeClock {
        fn new() -> Self {
            Self {
                now: 1_756_000_000,
                sleeps: RefCell::new(Vec::new()),
            }
        }
    }

    impl Clock for FakeClock {
        fn now_unix(&self) -> u64 {
            self.now
        }

        fn sleep(&self, duration: Duration) {
            self.sleeps.borrow_mut().push(duration);
        }
    }

    fn listing(range: std::ops::RangeInclusive<u32>) -> String {
        range
            .map(|number| {
                format!("<a href=\"view.php?comic={number}\">Comic {number}: Title {number}</a>")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn test_setup(marker_dir: &std::path::Path) -> (BotConfig, RunOptions, Credentials) {
        let config = BotConfig {
            archive: ArchiveSection {
                marker_file: Some(marker_dir.join("last-run")),
                ..ArchiveSection::default()
            },
            ..BotConfig::default()
        };
        let options = RunOptions {
            page: "Module:QC/titles".to_string(),
            data_file: marker_dir.join("data.lua"),
            summary_note: None,
            auto: true,
            no_download: false,
            max_cycles: 1,
        };
        let credentials = Credentials {
            username: "BotUser".to_string(),
            password: "hunter2".to_string(),
        };
        (config, options, credentials)
    }

    #[test]
    fn full_cycle_publishes_and_writes_data_file() {
        let temp = tempdir().expect("tempdir");
        let (_, options, credentials) = test_setup(temp.path());
        let archive = FakeArchive {
            text: listing(1..=3),
            warning: None,
        };
        // The correction overlay tops out at issue 3911, so a published table
        // ending at 3910 means exactly one new issue.
        let mut wiki = MockWiki {
            page_text: Some(
                "local titles = {\n[3910]=\"Almost There\",\n}\nreturn titles\n".to_string(),
            ),
            ..MockWiki::default()
        };
        let mut prompter = PanicPrompter;

        let report = run_cycle(
            &options,
            &credentials,
            &archive,
            &mut wiki,
            &mut prompter,
        )
        .expect("cycle");

        assert_eq!(
            report.states,
            vec![
                CycleState::Idle,
                CycleState::Downloading,
                CycleState::Parsing,
                CycleState::Reconciling,
                CycleState::Publishing,
                CycleState::Done,
            ]
        );
        match &report.outcome {
            CycleOutcome::Published { summary } => assert_eq!(summary, "add comic title 3911"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(wiki.edits.len(), 1);
        assert!(options.data_file.exists());
        let written = fs::read_to_string(&options.data_file).expect("read data file");
        assert!(written.contains("[3]=\"Title 3\","));
        assert!(written.contains("[570]=\"She Missed It All\","));
    }

    #[test]
    fn identical_published_text_is_a_no_op() {
        let temp = tempdir().expect("tempdir");
        let (_, options, credentials) = test_setup(temp.path());
        let archive = FakeArchive {
            text: listing(1..=3),
            warning: None,
        };

        // Prime the mock with exactly what the cycle will render.
        let mut priming = MockWiki {
            page_text: Some(String::new()),
            ..MockWiki::default()
        };
        run_cycle(
            &options,
            &credentials,
            &archive,
            &mut priming,
            &mut PanicPrompter,
        )
        .expect("priming cycle");
        let rendered = priming.edits[0].1.clone();

        let mut wiki = MockWiki {
            page_text: Some(rendered),
            ..MockWiki::default()
        };
        let report = run_cycle(
            &options,
            &credentials,
            &archive,
            &mut wiki,
            &mut PanicPrompter,
        )
        .expect("cycle");

        assert_eq!(report.outcome, CycleOutcome::NoChange);
        assert!(wiki.edits.is_empty());
    }

    #[test]
    fn rejected_edit_ends_in_failed_state() {
        let temp = tempdir().expect("tempdir");
        let (_, options, credentials) = test_setup(temp.path());
        let archive = FakeArchive {
            text: listing(1..=3),
            warning: None,
        };
        let mut wiki = MockWiki {
            page_text: Some("old".to_string()),
            reject_first: 1,
            ..MockWiki::default()
        };

        let report = run_cycle(
            &options,
            &credentials,
            &archive,
            &mut wiki,
            &mut PanicPrompter,
        )
        .expect("cycle");

        assert_eq!(report.states.last(), Some(&CycleState::Failed));
        assert!(!report.is_success());
        match report.outcome {
            CycleOutcome::Rejected { reason, .. } => assert_eq!(reason, EditRejection::Conflict),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn prompter_no_declines_without_editing() {
        let temp = tempdir().expect("tempdir");
        let (_, mut options, credentials) = test_setup(temp.path());
        options.auto = false;
        let archive = FakeArchive {
            text: listing(1..=3),
            warning: None,
        };
        let mut wiki = MockWiki {
            page_text: Some("old".to_string()),
            ..MockWiki::default()
        };
        let mut prompter = FixedPrompter::new(Confirmation::No);

        let report = run_cycle(
            &options,
            &credentials,
            &archive,
            &mut wiki,
            &mut prompter,
        )
        .expect("cycle");

        assert_eq!(report.outcome, CycleOutcome::Declined);
        assert_eq!(prompter.calls, 1);
        assert!(wiki.edits.is_empty());
    }

    #[test]
    fn prompter_quit_aborts_the_run() {
        let temp = tempdir().expect("tempdir");
        let (_, mut options, credentials) = test_setup(temp.path());
        options.auto = false;
        let archive = FakeArchive {
            text: listing(1..=3),
            warning: None,
        };
        let mut wiki = MockWiki {
            page_text: Some("old".to_string()),
            ..MockWiki::default()
        };
        let mut prompter = FixedPrompter::new(Confirmation::Quit);

        let error = run_cycle(
            &options,
            &credentials,
            &archive,
            &mut wiki,
            &mut prompter,
        )
        .expect_err("must abort");
        assert!(error.downcast_ref::<UserAbort>().is_some());
    }

    #[test]
    fn gap_warnings_are_reported_not_fatal() {
        let temp = tempdir().expect("tempdir");
        let (_, options, credentials) = test_setup(temp.path());
        let text = (1..=10u32)
            .filter(|number| *number != 5)
            .map(|number| {
                format!("<a href=\"view.php?comic={number}\">Comic {number}: Title {number}</a>")
            })
            .collect::<Vec<_>>()
            .join("\n");
        let archive = FakeArchive {
            text,
            warning: None,
        };
        let mut wiki = MockWiki {
            page_text: Some("old".to_string()),
            ..MockWiki::default()
        };
        let mut prompter = FixedPrompter::new(Confirmation::Yes);

        let report = run_cycle(&options, &credentials, &archive, &mut wiki, &mut prompter)
            .expect("cycle");

        assert_eq!(report.missing, vec![5]);
        assert_eq!(report.outcome, CycleOutcome::Published {
            summary: "update comic titles".to_string(),
        });
        // Auto mode never prompts, but the gap warning still reaches the
        // operator seam.
        assert_eq!(prompter.calls, 0);
        assert!(
            prompter
                .notes
                .iter()
                .any(|note| note == "warning: missing comic #5")
        );
    }

    #[test]
    fn cache_warning_is_routed_to_the_prompter() {
        let temp = tempdir().expect("tempdir");
        let (_, options, credentials) = test_setup(temp.path());
        let archive = FakeArchive {
            text: listing(1..=3),
            warning: Some("failed to update cache archive.php: disk full".to_string()),
        };
        let mut wiki = MockWiki {
            page_text: Some("old".to_string()),
            ..MockWiki::default()
        };
        let mut prompter = FixedPrompter::new(Confirmation::Yes);

        run_cycle(&options, &credentials, &archive, &mut wiki, &mut prompter).expect("cycle");

        assert!(
            prompter
                .notes
                .iter()
                .any(|note| note == "warning: failed to update cache archive.php: disk full")
        );
    }

    #[test]
    fn backoff_doubles_then_saturates() {
        let mut backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(120));
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
        assert_eq!(backoff.next_delay(), Duration::from_secs(120));
        assert_eq!(backoff.next_delay(), Duration::from_secs(120));
    }

    #[test]
    fn retry_loop_backs_off_between_failed_cycles() {
        let temp = tempdir().expect("tempdir");
        let (config, mut options, credentials) = test_setup(temp.path());
        options.max_cycles = 5;
        let archive = FakeArchive {
            text: listing(1..=3),
            warning: None,
        };
        let mut wiki = MockWiki {
            page_text: Some("old".to_string()),
            reject_first: 2,
            ..MockWiki::default()
        };
        let clock = FakeClock::new();
        let mut prompter = FixedPrompter::new(Confirmation::Yes);

        let report = run_until_published(
            &config,
            &options,
            &credentials,
            &archive,
            &mut wiki,
            &mut prompter,
            &clock,
        )
        .expect("run");

        assert!(report.is_success());
        assert_eq!(wiki.edits.len(), 1);
        assert_eq!(
            *clock.sleeps.borrow(),
            vec![Duration::from_secs(30), Duration::from_secs(60)]
        );
        assert_eq!(prompter.notes, vec![
            "backing off for 30s before retrying".to_string(),
            "backing off for 60s before retrying".to_string(),
        ]);
    }

    #[test]
    fn marker_file_records_the_outcome() {
        let temp = tempdir().expect("tempdir");
        let (config, options, credentials) = test_setup(temp.path());
        let archive = FakeArchive {
            text: listing(1..=3),
            warning: None,
        };
        let mut wiki = MockWiki {
            page_text: Some("old".to_string()),
            ..MockWiki::default()
        };
        let clock = FakeClock::new();

        run_until_published(
            &config,
            &options,
            &credentials,
            &archive,
            &mut wiki,
            &mut PanicPrompter,
            &clock,
        )
        .expect("run");

        let marker = fs::read_to_string(config.marker_file()).expect("read marker");
        assert_eq!(marker, format!("success {}\n", clock.now_unix()));
    }

    #[test]
    fn exhausted_cycle_budget_returns_the_last_report() {
        let temp = tempdir().expect("tempdir");
        let (config, mut options, credentials) = test_setup(temp.path());
        options.max_cycles = 2;
        let archive = FakeArchive {
            text: listing(1..=3),
            warning: None,
        };
        let mut wiki = MockWiki {
            page_text: Some("old".to_string()),
            reject_first: 10,
            ..MockWiki::default()
        };
        let clock = FakeClock::new();

        let report = run_until_published(
            &config,
            &options,
            &credentials,
            &archive,
            &mut wiki,
            &mut PanicPrompter,
            &clock,
        )
        .expect("run returns the failed report");

        assert!(!report.is_success());
        assert_eq!(clock.sleeps.borrow().len(), 1);
        let marker = fs::read_to_string(config.marker_file()).expect("read marker");
        assert!(marker.starts_with("failure "));
    }
}
