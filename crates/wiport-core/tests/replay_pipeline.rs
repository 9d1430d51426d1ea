//! End-to-end replay against the in-memory destination and journals.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use wiport_core::classification::ClassificationResolver;
use wiport_core::config::MigrationConfig;
use wiport_core::destination::memory::InMemoryDestination;
use wiport_core::destination::{EndKind, LinkType, RelatedLink, TreeKind};
use wiport_core::journal::{Journal, MemoryJournal, open_journal};
use wiport_core::links::LinkResolver;
use wiport_core::model::fields;
use wiport_core::model::{
    AttachmentChange, ChangeKind, FieldChange, FieldValue, LinkChange, Revision, WorkItemHistory,
};
use wiport_core::replay::RevisionOutcome;
use wiport_core::{EntityState, RevisionReplayer, run};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn at(offset_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + offset_secs, 0)
        .single()
        .expect("valid timestamp")
}

fn text(reference: &str, value: &str) -> FieldChange {
    FieldChange {
        reference_name: reference.to_string(),
        value: Some(FieldValue::String(value.to_string())),
    }
}

fn link(change: ChangeKind, link_type: &str, source: &str, target: &str) -> LinkChange {
    LinkChange {
        change,
        link_type: link_type.to_string(),
        source_origin_id: source.to_string(),
        target_origin_id: target.to_string(),
    }
}

fn attachment(change: ChangeKind, origin_id: &str, file_path: &str) -> AttachmentChange {
    AttachmentChange {
        change,
        origin_id: origin_id.to_string(),
        file_path: file_path.to_string(),
        comment: String::new(),
    }
}

fn revision(origin: &str, index: u32, offset_secs: i64) -> Revision {
    Revision {
        index,
        origin_id: origin.to_string(),
        time: at(offset_secs),
        author: "alice".to_string(),
        fields: Vec::new(),
        links: Vec::new(),
        attachments: Vec::new(),
        attachment_references: false,
    }
}

fn history(origin: &str, work_item_type: &str, revisions: Vec<Revision>) -> WorkItemHistory {
    WorkItemHistory {
        origin_id: origin.to_string(),
        work_item_type: work_item_type.to_string(),
        revisions,
    }
}

/// Destination, resolvers, and config with a project registered.
struct Harness {
    destination: InMemoryDestination,
    classifications: ClassificationResolver,
    links: LinkResolver,
    config: MigrationConfig,
}

impl Harness {
    fn new(config: MigrationConfig) -> Self {
        let destination = InMemoryDestination::new().with_project(&config.project);
        Self::with_destination(destination, config)
    }

    fn with_destination(destination: InMemoryDestination, config: MigrationConfig) -> Self {
        let classifications =
            ClassificationResolver::initialize(&destination).expect("classification caches");
        let links = LinkResolver::load(&destination, config.ignore_failed_links)
            .expect("link types");
        Self {
            destination,
            classifications,
            links,
            config,
        }
    }

    fn replayer<'a, J: Journal + ?Sized>(
        &'a self,
        journal: &'a J,
    ) -> RevisionReplayer<'a, InMemoryDestination, J> {
        RevisionReplayer::new(
            &self.destination,
            journal,
            &self.classifications,
            &self.links,
            &self.config,
        )
    }
}

fn based_config() -> MigrationConfig {
    MigrationConfig {
        base_area_path: "Base".to_string(),
        base_iteration_path: "Base".to_string(),
        ..MigrationConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Scenario
// ---------------------------------------------------------------------------

fn scenario_history() -> WorkItemHistory {
    let mut rev0 = revision("WI-1", 0, 0);
    rev0.fields = vec![
        text(fields::TITLE, "Scenario"),
        text(fields::AREA_PATH, "A"),
        text(fields::ITERATION_PATH, "I"),
    ];
    let spec = attachment(ChangeKind::Added, "att1", "/export/att1/spec.png");
    rev0.attachments = vec![spec];

    let mut rev1 = revision("WI-1", 1, 60);
    rev1.links = vec![link(
        ChangeKind::Added,
        "System.LinkTypes.Related",
        "WI-1",
        "WI-404",
    )];

    history("WI-1", "Task", vec![rev0, rev1])
}

fn assert_scenario(ignore_failed_links: bool) {
    let config = MigrationConfig {
        ignore_failed_links,
        ..based_config()
    };
    let harness = Harness::new(config);
    let journal = MemoryJournal::new();
    let replayer = harness.replayer(&journal);

    let outcome = replayer.replay_item(&scenario_history());

    assert_eq!(outcome.state, EntityState::Completed);
    assert_eq!(outcome.applied, vec![0, 1]);
    assert_eq!(outcome.incomplete, vec![1]);

    let id = outcome.destination_id.expect("destination id");
    let stored = harness.destination.item(id).expect("stored item");
    assert_eq!(stored.text(fields::AREA_PATH), Some("Migrated\\Base\\A"));
    assert_eq!(
        stored.text(fields::ITERATION_PATH),
        Some("Migrated\\Base\\I")
    );
    assert!(stored.links.is_empty());
    assert_eq!(stored.attachments.len(), 1);
    assert_eq!(stored.revision, 2, "revision 1 is still saved");

    let classifications = &harness.classifications;
    assert!(classifications.cached(TreeKind::Area, "Base/A").is_some());
    assert_eq!(classifications.len(TreeKind::Area), 2);
    assert_eq!(classifications.len(TreeKind::Iteration), 2);

    let attachment_id = stored.attachments[0]
        .persisted
        .as_ref()
        .map(|p| p.id);
    assert_eq!(
        journal.migrated_attachment("att1").expect("journal read"),
        attachment_id
    );
    for index in [0, 1] {
        let processed = journal.is_revision_processed("WI-1", index);
        assert!(processed.expect("journal read"));
    }
}

#[test]
fn scenario_missing_link_target_is_incomplete_but_saved() {
    assert_scenario(false);
}

#[test]
fn scenario_with_ignored_link_failures_is_still_incomplete() {
    assert_scenario(true);
}

// ---------------------------------------------------------------------------
// Resume
// ---------------------------------------------------------------------------

fn resume_history() -> WorkItemHistory {
    let mut rev0 = revision("WI-1", 0, 0);
    rev0.fields = vec![
        text(fields::TITLE, "Resumable"),
        text(fields::AREA_PATH, "Team"),
    ];

    let mut rev1 = revision("WI-1", 1, 10);
    let log = attachment(ChangeKind::Added, "att-log", "/export/build.log");
    rev1.attachments = vec![log];

    let mut rev2 = revision("WI-1", 2, 20);
    rev2.links = vec![link(
        ChangeKind::Added,
        "System.LinkTypes.Related",
        "WI-1",
        "WI-2",
    )];
    rev2.fields = vec![text(fields::TITLE, "Resumable, linked")];

    let mut rev3 = revision("WI-1", 3, 30);
    rev3.fields = vec![text(fields::ITERATION_PATH, "Sprint 2")];
    let removed = attachment(ChangeKind::Removed, "att-log", "/export/build.log");
    rev3.attachments = vec![removed];

    history("WI-1", "Task", vec![rev0, rev1, rev2, rev3])
}

/// Seeds the link target `WI-2` so ids line up across destinations.
fn seeded_harness(journal: &MemoryJournal) -> Harness {
    let harness = Harness::new(MigrationConfig::default());
    let target = harness.destination.seed_item("Task", Vec::new());
    journal.record_item("WI-2", target);
    harness
}

#[test]
fn resume_after_crash_matches_uninterrupted_replay() {
    let history = resume_history();

    let once_journal = MemoryJournal::new();
    let once = seeded_harness(&once_journal);
    let uninterrupted = once.replayer(&once_journal).replay_item(&history);
    assert_eq!(uninterrupted.state, EntityState::Completed);
    assert!(uninterrupted.incomplete.is_empty());

    for crash_after in 1..history.revisions.len() {
        let journal = MemoryJournal::new();
        let harness = seeded_harness(&journal);
        let replayer = harness.replayer(&journal);

        for revision in &history.revisions[..crash_after] {
            let applied = replayer
                .replay_revision(&history, revision)
                .expect("revision before crash");
            assert!(matches!(applied, RevisionOutcome::Applied { .. }));
        }

        let resumed = replayer.replay_item(&history);
        let expected_skipped: Vec<u32> = (0..).take(crash_after).collect();
        assert_eq!(resumed.skipped, expected_skipped);
        assert_eq!(resumed.state, EntityState::Completed);
        assert_eq!(resumed.destination_id, uninterrupted.destination_id);

        let id = resumed.destination_id.expect("destination id");
        assert_eq!(harness.destination.item(id), once.destination.item(id));
    }
}

#[test]
fn rerunning_a_finished_item_changes_nothing() {
    let journal = MemoryJournal::new();
    let harness = seeded_harness(&journal);
    let replayer = harness.replayer(&journal);
    let history = resume_history();

    let first = replayer.replay_item(&history);
    let saves = harness.destination.save_count();
    let second = replayer.replay_item(&history);

    assert_eq!(second.skipped, first.applied);
    assert!(second.applied.is_empty());
    assert_eq!(harness.destination.save_count(), saves);
}

#[test]
fn sqlite_journal_resumes_across_reopen() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("journal.sqlite3");
    let history = resume_history();

    let harness = Harness::new(MigrationConfig::default());
    let target = harness.destination.seed_item("Task", Vec::new());

    {
        let journal = open_journal(&path).expect("open journal");
        journal
            .mark_revision_processed("WI-2", target, 0)
            .expect("record link target");
        let replayer = harness.replayer(&journal);
        for revision in &history.revisions[..2] {
            replayer
                .replay_revision(&history, revision)
                .expect("first run");
        }
    }

    let journal = open_journal(&path).expect("reopen journal");
    let outcome = harness.replayer(&journal).replay_item(&history);
    assert_eq!(outcome.skipped, vec![0, 1]);
    assert_eq!(outcome.applied, vec![2, 3]);
    assert_eq!(
        journal.processed_revisions("WI-1").expect("journal read"),
        vec![0, 1, 2, 3]
    );
    let log = journal.migrated_attachment("att-log").expect("read");
    assert!(log.is_some());
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

#[test]
fn closing_a_hierarchy_cycle_uses_the_reverse_end() {
    let journal = MemoryJournal::new();
    let harness = Harness::new(MigrationConfig::default());
    let hierarchy = LinkType::new("System.LinkTypes.Hierarchy", true, true);
    let forward = hierarchy.forward_end();

    let dest = &harness.destination;
    let c = dest.seed_item("Task", Vec::new());
    let b = dest.seed_item(
        "Task",
        vec![RelatedLink {
            end: forward.clone(),
            target: c,
        }],
    );
    let a = dest.seed_item(
        "Task",
        vec![RelatedLink {
            end: forward.clone(),
            target: b,
        }],
    );
    for (origin, id) in [("A", a), ("B", b), ("C", c)] {
        journal.record_item(origin, id);
    }

    let mut rev0 = revision("C", 0, 0);
    rev0.links = vec![link(
        ChangeKind::Added,
        "System.LinkTypes.Hierarchy-Forward",
        "C",
        "A",
    )];
    let outcome = harness
        .replayer(&journal)
        .replay_item(&history("C", "Task", vec![rev0]));
    assert_eq!(outcome.state, EntityState::Completed);
    assert!(outcome.incomplete.is_empty());

    let stored = dest.item(c).expect("stored C");
    assert_eq!(stored.links.len(), 1);
    assert_eq!(stored.links[0].target, a);
    assert_eq!(stored.links[0].end.kind, EndKind::Reverse);
    assert_ne!(stored.links[0].end, forward);
}

#[test]
fn removing_a_link_that_was_never_added_fails_only_that_link() {
    let journal = MemoryJournal::new();
    let harness = seeded_harness(&journal);

    let mut rev0 = revision("WI-1", 0, 0);
    rev0.fields = vec![text(fields::TITLE, "Unlinked")];
    let mut rev1 = revision("WI-1", 1, 10);
    rev1.links = vec![link(
        ChangeKind::Removed,
        "System.LinkTypes.Related",
        "WI-1",
        "WI-2",
    )];
    rev1.fields = vec![text(fields::TITLE, "Still saved")];
    let mut rev2 = revision("WI-1", 2, 20);
    rev2.fields = vec![text(fields::TITLE, "Kept going")];

    let outcome = harness
        .replayer(&journal)
        .replay_item(&history("WI-1", "Task", vec![rev0, rev1, rev2]));

    assert_eq!(outcome.state, EntityState::Completed);
    assert_eq!(outcome.applied, vec![0, 1, 2]);
    assert_eq!(outcome.incomplete, vec![1]);
    let stored = harness
        .destination
        .item(outcome.destination_id.expect("id"))
        .expect("stored");
    assert_eq!(stored.text(fields::TITLE), Some("Kept going"));
    assert!(
        stored
            .text(fields::HISTORY)
            .is_some_and(|h| h.starts_with("Removed link(s):"))
    );
}

// ---------------------------------------------------------------------------
// Attachments
// ---------------------------------------------------------------------------

fn changed_date(harness: &Harness, id: i64) -> DateTime<Utc> {
    match harness
        .destination
        .item(id)
        .and_then(|s| s.field(fields::CHANGED_DATE).cloned())
    {
        Some(FieldValue::Date(date)) => date,
        other => panic!("changed date missing: {other:?}"),
    }
}

#[test]
fn description_correction_on_the_adding_revision() {
    let journal = MemoryJournal::new();
    let harness = Harness::new(MigrationConfig::default());

    let mut rev0 = revision("BUG-1", 0, 0);
    rev0.fields = vec![
        text(fields::TITLE, "Crash"),
        text(fields::REPRO_STEPS, "Crash, see C:\\export\\shot.png"),
    ];
    let shot = attachment(ChangeKind::Added, "att-shot", "C:\\export\\shot.png");
    rev0.attachments = vec![shot];
    rev0.attachment_references = true;
    let rev1 = revision("BUG-1", 1, 10);
    let history = history("BUG-1", "Bug", vec![rev0, rev1]);

    let replayer = harness.replayer(&journal);
    let first = replayer
        .replay_revision(&history, &history.revisions[0])
        .expect("revision 0");
    let RevisionOutcome::Applied { destination_id, .. } = first else {
        panic!("revision 0 was skipped");
    };

    let stored = harness.destination.item(destination_id).expect("stored");
    let uri = stored.attachments[0]
        .persisted
        .as_ref()
        .map(|p| p.uri.clone())
        .expect("persisted attachment");
    let steps = stored.text(fields::REPRO_STEPS).expect("repro steps");
    assert_eq!(steps.matches(uri.as_str()).count(), 1);
    assert!(!steps.contains("C:\\export\\shot.png"));
    assert_eq!(stored.revision, 2, "correction is a separate save");

    let changed = changed_date(&harness, destination_id);
    assert!(changed > history.revisions[0].time);
    assert!(changed < history.revisions[1].time);
    let offset = changed - history.revisions[0].time;
    assert_eq!(offset, TimeDelta::milliseconds(50));
}

#[test]
fn description_correction_through_the_journal() {
    let journal = MemoryJournal::new();
    let harness = Harness::new(MigrationConfig::default());

    let mut rev0 = revision("BUG-2", 0, 0);
    rev0.fields = vec![text(fields::TITLE, "Layout")];
    let png = attachment(ChangeKind::Added, "att-png", "/export/layout.png");
    rev0.attachments = vec![png];
    let mut rev1 = revision("BUG-2", 1, 10);
    rev1.fields = vec![text(fields::REPRO_STEPS, "Compare with /export/layout.png")];
    rev1.attachment_references = true;
    // Too close for the preferred delta.
    let rev2 = Revision {
        time: at(10) + TimeDelta::milliseconds(20),
        ..revision("BUG-2", 2, 0)
    };
    let history = history("BUG-2", "Bug", vec![rev0, rev1, rev2]);

    let outcome = harness.replayer(&journal).replay_item(&history);
    assert_eq!(outcome.state, EntityState::Completed);
    let id = outcome.destination_id.expect("id");

    let stored = harness.destination.item(id).expect("stored");
    assert_eq!(
        stored.text(fields::REPRO_STEPS),
        Some("Compare with memory://attachments/1/layout.png")
    );

    // Revision 2 overwrote the changed date; replay revision 1 alone to see
    // the corrected stamp.
    let journal = MemoryJournal::new();
    let harness = Harness::new(MigrationConfig::default());
    let replayer = harness.replayer(&journal);
    for revision in &history.revisions[..2] {
        replayer
            .replay_revision(&history, revision)
            .expect("replay");
    }
    let changed = changed_date(&harness, id);
    assert_eq!(changed, at(10) + TimeDelta::milliseconds(10));
}

#[test]
fn rejected_attachment_is_dropped_and_save_retried() {
    let journal = MemoryJournal::new();
    let harness = Harness::new(MigrationConfig::default());
    harness.destination.reject_attachment("huge.zip");

    let mut rev0 = revision("WI-9", 0, 0);
    rev0.fields = vec![text(fields::TITLE, "Big upload")];
    rev0.attachments = vec![
        attachment(ChangeKind::Added, "att-huge", "/export/huge.zip"),
        attachment(ChangeKind::Added, "att-ok", "/export/ok.txt"),
    ];

    let outcome = harness
        .replayer(&journal)
        .replay_item(&history("WI-9", "Task", vec![rev0]));
    assert_eq!(outcome.state, EntityState::Completed);

    let stored = harness
        .destination
        .item(outcome.destination_id.expect("id"))
        .expect("stored");
    let names: Vec<&str> = stored
        .attachments
        .iter()
        .map(|a| a.file_path.as_str())
        .collect();
    assert_eq!(names, ["/export/ok.txt"]);
    assert_eq!(harness.destination.save_count(), 1);
    let huge = journal.migrated_attachment("att-huge").expect("read");
    let ok = journal.migrated_attachment("att-ok").expect("read");
    assert!(huge.is_none());
    assert!(ok.is_some());
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[test]
fn fatal_destination_error_stops_the_run() {
    let journal = MemoryJournal::new();
    let harness = Harness::new(MigrationConfig::default());
    harness.destination.fail_saves_fatally(true);

    let histories: Vec<WorkItemHistory> = ["WI-1", "WI-2", "WI-3"]
        .into_iter()
        .map(|origin| history(origin, "Task", vec![revision(origin, 0, 0)]))
        .collect();

    let summary = run(&harness.replayer(&journal), &histories, 1);

    assert!(summary.aborted);
    assert!(!summary.is_clean());
    assert_eq!(summary.items[0].state, EntityState::AbortedFatal(0));
    assert!(
        summary.items[0]
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("E9001"))
    );
    assert_eq!(summary.not_started(), 2);
    assert_eq!(journal.progress().expect("progress").revisions, 0);
}

#[test]
fn parallel_workers_share_classification_nodes() {
    let journal = MemoryJournal::new();
    let harness = Harness::new(MigrationConfig::default());

    let histories: Vec<WorkItemHistory> = (0..12)
        .map(|n| {
            let origin = format!("WI-{n}");
            let mut rev0 = revision(&origin, 0, 0);
            rev0.fields = vec![
                text(fields::TITLE, "Parallel"),
                text(fields::AREA_PATH, "Platform/Storage"),
                text(fields::ITERATION_PATH, "2024/Q1"),
            ];
            history(&origin, "Task", vec![rev0])
        })
        .collect();

    let summary = run(&harness.replayer(&journal), &histories, 4);

    assert!(summary.is_clean());
    assert_eq!(summary.completed(), 12);
    assert_eq!(harness.destination.node_creation_count(), 4);
    assert_eq!(harness.destination.item_count(), 12);
    let origins: Vec<&str> = summary
        .items
        .iter()
        .map(|outcome| outcome.origin_id.as_str())
        .collect();
    let expected: Vec<String> = (0..12).map(|n| format!("WI-{n}")).collect();
    assert_eq!(origins, expected);
}

#[test]
fn item_without_journal_entry_cannot_start_mid_history() {
    let journal = MemoryJournal::new();
    let harness = Harness::new(MigrationConfig::default());
    let history = history("WI-5", "Task", vec![revision("WI-5", 3, 0)]);

    let outcome = harness.replayer(&journal).replay_item(&history);
    assert_eq!(outcome.state, EntityState::Failed(3));
    assert!(outcome.destination_id.is_none());
    assert!(
        outcome
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("E5002"))
    );
    assert_eq!(harness.destination.item_count(), 0);
}
