use anyhow::anyhow;
use chrono::{Duration as TimeDelta, NaiveDate, NaiveDateTime};

use super::*;
use crate::config::Settings;
use crate::demo::{self, Animal, Seminar};
use crate::error::{ConsistencyError, DefinitionError, Error, UsageError};
use crate::model::{Model, RelatedLookups};
use crate::registry::RegistryBuilder;
use crate::results::{Failures, PkQuery};
use crate::store::StatusUpdate;
use crate::validator::DataValidator;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Gadget {
    id: i64,
    weight: i64,
}

impl Model for Gadget {
    const APP_LABEL: &'static str = "workshop";
    const MODEL_NAME: &'static str = "Gadget";
    const TABLE: &'static str = "workshop_gadget";

    fn pk(&self) -> i64 {
        self.id
    }

    fn data_validators() -> Result<Vec<DataValidator<Self>>, DefinitionError> {
        Ok(vec![
            DataValidator::instance("raises_on_five", raises_on_five),
            DataValidator::instance("panics_on_five", panics_on_five),
            DataValidator::instance("returns_nothing", returns_nothing),
            DataValidator::instance("is_light", is_light).doc("Gadgets weigh ten or less."),
            DataValidator::class("class_raises", class_raises),
            DataValidator::class("class_returns_nothing", class_returns_nothing),
            DataValidator::class("bad_query", bad_query),
        ])
    }

    fn fetch_chunk(
        conn: &Connection,
        after_pk: Option<i64>,
        limit: usize,
        _related: &RelatedLookups,
    ) -> rusqlite::Result<Vec<Self>> {
        let mut statement = conn.prepare_cached(
            "SELECT id, weight FROM workshop_gadget
             WHERE ?1 IS NULL OR id > ?1 ORDER BY id LIMIT ?2",
        )?;
        let rows = statement.query_map(rusqlite::params![after_pk, limit as i64], |row| {
            Ok(Gadget {
                id: row.get(0)?,
                weight: row.get(1)?,
            })
        })?;
        rows.collect()
    }
}

fn raises_on_five(gadget: &Gadget, _conn: &Connection) -> anyhow::Result<ReturnValue> {
    if gadget.id == 5 {
        return Err(anyhow!("gadget 5 is cursed"));
    }
    Ok(ReturnValue::Pass)
}

fn panics_on_five(gadget: &Gadget, _conn: &Connection) -> anyhow::Result<ReturnValue> {
    assert_ne!(gadget.id, 5, "gadget five exploded");
    Ok(true.into())
}

fn returns_nothing(_gadget: &Gadget, _conn: &Connection) -> anyhow::Result<ReturnValue> {
    Ok(ReturnValue::Nothing)
}

fn class_raises(_conn: &Connection) -> anyhow::Result<ReturnValue> {
    Err(anyhow!("class method hit an exception"))
}

fn class_returns_nothing(_conn: &Connection) -> anyhow::Result<ReturnValue> {
    Ok(().into())
}

fn bad_query(_conn: &Connection) -> anyhow::Result<ReturnValue> {
    Ok(Failures::Query(PkQuery::new("SELECT nope FROM missing_table")).into())
}

fn is_light(gadget: &Gadget, _conn: &Connection) -> anyhow::Result<ReturnValue> {
    if gadget.weight <= 10 {
        Ok(ReturnValue::Pass)
    } else {
        Ok(ReturnValue::fail("too heavy"))
    }
}

/// Class-only view over the gadget table, used to produce many failures at once.
struct Shipment;

impl Model for Shipment {
    const APP_LABEL: &'static str = "workshop";
    const MODEL_NAME: &'static str = "Shipment";
    const TABLE: &'static str = "workshop_gadget";

    fn pk(&self) -> i64 {
        0
    }

    fn data_validators() -> Result<Vec<DataValidator<Self>>, DefinitionError> {
        Ok(vec![DataValidator::class("no_heavy_gadgets", no_heavy_gadgets)])
    }

    fn fetch_chunk(
        _conn: &Connection,
        _after_pk: Option<i64>,
        _limit: usize,
        _related: &RelatedLookups,
    ) -> rusqlite::Result<Vec<Self>> {
        Ok(Vec::new())
    }
}

fn no_heavy_gadgets(_conn: &Connection) -> anyhow::Result<ReturnValue> {
    Ok(Failures::Query(PkQuery::new("SELECT id FROM workshop_gadget WHERE weight > 3 ORDER BY id")).into())
}

fn gadget_registry() -> Registry {
    RegistryBuilder::new(Settings {
        chunk_size: 3,
        ..Settings::default()
    })
    .model::<Gadget>()
    .discover()
    .expect("gadget registry")
}

fn gadget_connection(count: i64) -> Connection {
    let conn = Connection::open_in_memory().expect("in-memory DB should open");
    store::prepare(&conn).expect("ledger schema");
    conn.execute_batch(
        "CREATE TABLE workshop_gadget (id INTEGER PRIMARY KEY, weight INTEGER NOT NULL);",
    )
    .expect("gadget table");
    for id in 1..=count {
        conn.execute(
            "INSERT INTO workshop_gadget (id, weight) VALUES (?1, ?2)",
            [id, id],
        )
        .expect("insert gadget");
    }
    conn
}

fn demo_connection() -> Connection {
    let conn = Connection::open_in_memory().expect("in-memory DB should open");
    store::prepare(&conn).expect("ledger schema");
    demo::ensure_schema(&conn).expect("demo schema");
    conn
}

fn demo_registry() -> Registry {
    demo::registry(Settings::default()).expect("demo registry")
}

fn run_model<M: Model>(registry: &Registry, conn: &Connection, names: &[&str]) -> Vec<ValidationOutcome> {
    let names = (!names.is_empty()).then(|| names.iter().map(|name| name.to_string()).collect());
    ModelValidationRunner::<M>::new(registry, conn, names)
        .expect("runner")
        .run(false)
        .expect("run")
}

fn only(outcomes: Vec<ValidationOutcome>) -> SummaryEx {
    assert_eq!(outcomes.len(), 1);
    outcomes.into_iter().next().map(|(_, summary)| summary).expect("one outcome")
}

fn validator_id<M: Model>(registry: &Registry, conn: &Connection, name: &str) -> i64 {
    let info = registry
        .lookup::<M>()
        .expect("registered")
        .get(name)
        .cloned()
        .expect("validator");
    registry.validator_id(conn, &info).expect("validator id")
}

fn at(hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, 3)
        .and_then(|day| day.and_hms_opt(hour, 0, 0))
        .expect("valid time")
}

type Fingerprint = (String, Status, Option<i64>, Option<i64>, Vec<i64>);

fn fingerprint(outcomes: &[ValidationOutcome]) -> Vec<Fingerprint> {
    outcomes
        .iter()
        .map(|(info, summary)| {
            (
                info.method_name.clone(),
                summary.status(),
                summary.num_passing,
                summary.num_na,
                summary.failure_ids().to_vec(),
            )
        })
        .collect()
}

#[test]
fn alliteration_failure_is_recorded_for_the_new_animal() {
    let conn = demo_connection();
    let registry = demo_registry();
    demo::seed(&conn, 100, 0).expect("seed");
    let bob = demo::add_animal(&conn, "Ant", "Bob", false, 1, &[]).expect("add");

    let summary = only(run_model::<Animal>(&registry, &conn, &["check_alliteration"]));
    assert_eq!(summary.status(), Status::Failing);
    assert_eq!(summary.num_passing, Some(100));
    assert_eq!(summary.num_na, Some(0));
    assert_eq!(summary.failure_ids(), &[bob]);

    let id = validator_id::<Animal>(&registry, &conn, "check_alliteration");
    let row = store::load_failure(&conn, id, bob).expect("load").expect("failing record");
    assert_eq!(row.comment, "not an alliteration");
    assert!(!row.is_exception);

    let validator = store::load_validator(&conn, id).expect("load").expect("validator");
    assert_eq!(validator.status, Status::Failing);
    assert_eq!(validator.num_passing, Some(100));
    assert!(validator.last_run_time.is_some());
}

#[test]
fn reversed_seminar_fails_the_class_validator_without_counters() {
    let conn = demo_connection();
    let registry = demo_registry();
    demo::seed(&conn, 30, 3).expect("seed");
    let host: i64 = conn
        .query_row(
            "SELECT id FROM animalconference_animal WHERE carnivorous = 1 ORDER BY id LIMIT 1",
            [],
            |row| row.get(0),
        )
        .expect("host");
    let reversed =
        demo::add_seminar(&conn, "Time travel", host, at(15), Some(at(14)), &[]).expect("add");

    let summary = only(run_model::<Seminar>(
        &registry,
        &conn,
        &["check_start_time_before_end_time"],
    ));
    assert_eq!(summary.status(), Status::Failing);
    assert_eq!(summary.num_passing, None);
    assert_eq!(summary.num_na, None);
    assert_eq!(summary.failure_ids(), &[reversed]);

    let id = validator_id::<Seminar>(&registry, &conn, "check_start_time_before_end_time");
    assert_eq!(store::load_failing_pks(&conn, id).expect("pks"), vec![reversed]);
}

#[test]
fn rerunning_without_changes_is_idempotent() {
    let conn = demo_connection();
    let registry = demo_registry();
    demo::seed(&conn, 40, 6).expect("seed");
    demo::add_animal(&conn, "Ant", "Bob", false, 1, &[]).expect("add");

    let first = run_model::<Animal>(&registry, &conn, &[]);
    let second = run_model::<Animal>(&registry, &conn, &[]);
    assert_eq!(fingerprint(&first), fingerprint(&second));

    let first = run_model::<Seminar>(&registry, &conn, &[]);
    let second = run_model::<Seminar>(&registry, &conn, &[]);
    assert_eq!(fingerprint(&first), fingerprint(&second));
}

#[test]
fn outcomes_follow_the_requested_order() {
    let conn = demo_connection();
    let registry = demo_registry();
    demo::seed(&conn, 10, 2).expect("seed");

    let outcomes = run_model::<Seminar>(
        &registry,
        &conn,
        &["check_max_attendees", "check_host_is_carnivorous", "check_unique_topics"],
    );
    let names: Vec<&str> = outcomes
        .iter()
        .map(|(info, _)| info.method_name.as_str())
        .collect();
    assert_eq!(
        names,
        vec!["check_max_attendees", "check_host_is_carnivorous", "check_unique_topics"]
    );
    assert!(
        outcomes
            .iter()
            .all(|(_, summary)| summary.status() == Status::Passing)
    );
}

#[test]
fn allowed_to_fail_is_sticky_across_runs() {
    let conn = demo_connection();
    let registry = demo_registry();
    demo::seed(&conn, 10, 0).expect("seed");
    let bob = demo::add_animal(&conn, "Ant", "Bob", false, 1, &[]).expect("add");
    let id = validator_id::<Animal>(&registry, &conn, "check_alliteration");

    let failing = only(run_model::<Animal>(&registry, &conn, &["check_alliteration"]));
    assert_eq!(failing.status(), Status::Failing);

    assert!(store::set_allowed_to_fail(&conn, id, bob, true, Some("grandfathered")).expect("pin"));
    let condoned = only(run_model::<Animal>(&registry, &conn, &["check_alliteration"]));
    assert_eq!(condoned.status(), Status::Passing);
    assert_eq!(condoned.failure_ids(), &[bob]);
    assert_eq!(condoned.num_allowed_to_fail, Some(1));

    let row = store::load_failure(&conn, id, bob).expect("load").expect("still recorded");
    assert!(row.allowed_to_fail);
    assert!(row.is_valid);
    assert_eq!(row.allowed_to_fail_justification, "grandfathered");
}

#[test]
fn fixed_records_are_cleaned_up_unless_pinned() {
    let conn = demo_connection();
    let registry = demo_registry();
    let bob = demo::add_animal(&conn, "Ant", "Bob", false, 1, &[]).expect("add");
    let cat = demo::add_animal(&conn, "Cat", "Dave", false, 1, &[]).expect("add");
    let id = validator_id::<Animal>(&registry, &conn, "check_alliteration");

    run_model::<Animal>(&registry, &conn, &["check_alliteration"]);
    store::set_allowed_to_fail(&conn, id, cat, true, None).expect("pin");
    conn.execute(
        "UPDATE animalconference_animal SET name = 'Anna' WHERE id = ?1",
        [bob],
    )
    .expect("fix bob");
    conn.execute(
        "UPDATE animalconference_animal SET name = 'Cleo' WHERE id = ?1",
        [cat],
    )
    .expect("fix cat");

    let summary = only(run_model::<Animal>(&registry, &conn, &["check_alliteration"]));
    assert_eq!(summary.status(), Status::Passing);
    assert!(summary.failure_ids().is_empty());
    assert!(store::load_failure(&conn, id, bob).expect("load").is_none());

    let pinned = store::load_failure(&conn, id, cat).expect("load").expect("pinned row");
    assert!(!pinned.is_valid);
    assert!(pinned.allowed_to_fail);
}

#[test]
fn validator_condoned_failures_count_as_allowed() {
    let conn = demo_connection();
    let registry = demo_registry();
    demo::seed(&conn, 20, 0).expect("seed");
    let mantis: i64 = conn
        .query_row(
            "SELECT id FROM animalconference_animal WHERE species = 'Mantis'",
            [],
            |row| row.get(0),
        )
        .expect("mantis");

    // the foobar / foobaz hints are invalid and dropped with a warning
    let summary = only(run_model::<Animal>(&registry, &conn, &["check_no_cannibals"]));
    assert_eq!(summary.status(), Status::Passing);
    assert_eq!(summary.failure_ids(), &[mantis]);
    assert_eq!(summary.num_allowed_to_fail, Some(1));
    assert_eq!(summary.num_passing, Some(19));

    let id = validator_id::<Animal>(&registry, &conn, "check_no_cannibals");
    let row = store::load_failure(&conn, id, mantis).expect("load").expect("row");
    assert_eq!(row.allowed_to_fail_justification, "weirdos");
}

#[test]
fn predator_hierarchy_counts_herbivores_as_not_applicable() {
    let conn = demo_connection();
    let registry = demo_registry();
    demo::seed(&conn, 8, 0).expect("seed");
    let herbivores: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM animalconference_animal WHERE carnivorous = 0",
            [],
            |row| row.get(0),
        )
        .expect("count");

    let summary = only(run_model::<Animal>(&registry, &conn, &["check_predator_hierarchy"]));
    assert_eq!(summary.status(), Status::Passing);
    assert_eq!(summary.num_na, Some(herbivores));
    assert_eq!(summary.num_passing, Some(8 - herbivores));
}

#[test]
fn an_exception_on_one_record_is_isolated() {
    let conn = gadget_connection(8);
    let registry = gadget_registry();

    let outcomes = run_model::<Gadget>(&registry, &conn, &["raises_on_five", "is_light"]);
    let (raises, light) = (&outcomes[0].1, &outcomes[1].1);

    assert_eq!(raises.status(), Status::Exception);
    assert_eq!(raises.num_passing, None);
    assert_eq!(raises.num_na, None);
    assert_eq!(raises.num_allowed_to_fail, None);
    assert!(raises.failures.is_none());
    let info = raises.exception_info.as_ref().expect("exception info");
    assert_eq!(info.exc_type, "gadget 5 is cursed");
    assert_eq!(info.exc_obj_pk, Some(5));

    let id = validator_id::<Gadget>(&registry, &conn, "raises_on_five");
    let page = store::list_failing_records(&conn, Some(id), 1, 50).expect("page");
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].record_pk, 5);
    assert!(page.items[0].is_exception);
    assert_eq!(page.items[0].comment, "gadget 5 is cursed");

    assert_eq!(light.status(), Status::Passing);
    assert_eq!(light.num_passing, Some(8));

    let row = store::load_validator(&conn, id).expect("load").expect("validator");
    assert_eq!(row.status, Status::Exception);
    assert_eq!(row.exc_obj_pk, Some(5));
    assert_eq!(row.num_passing, None);
}

#[test]
fn panics_and_uninterpretable_returns_become_exceptions() {
    let conn = gadget_connection(6);
    let registry = gadget_registry();

    let outcomes = run_model::<Gadget>(&registry, &conn, &["panics_on_five", "returns_nothing"]);
    let panicked = outcomes[0].1.exception_info.as_ref().expect("panic captured");
    assert!(panicked.exc_type.starts_with("panic: "));
    assert!(panicked.exc_type.contains("gadget five exploded"));
    assert_eq!(panicked.exc_obj_pk, Some(5));

    let nothing = outcomes[1].1.exception_info.as_ref().expect("type error");
    assert!(nothing.exc_type.starts_with("TypeError("));
    assert_eq!(nothing.exc_obj_pk, Some(1));
}

#[test]
fn class_method_exceptions_are_captured() {
    let conn = gadget_connection(3);
    let registry = gadget_registry();

    let outcomes = run_model::<Gadget>(
        &registry,
        &conn,
        &["class_raises", "class_returns_nothing", "bad_query"],
    );
    for (info, summary) in &outcomes {
        assert_eq!(summary.status(), Status::Exception, "{info}");
        assert_eq!(summary.num_passing, None);
    }
    let bad_query = outcomes[2].1.exception_info.as_ref().expect("exception");
    assert!(bad_query.exc_type.contains("failed to resolve failing records query"));
    assert_eq!(bad_query.exc_obj_pk, None);
}

#[test]
fn class_failures_honour_pinned_rows() {
    let conn = demo_connection();
    let registry = demo_registry();
    demo::seed(&conn, 12, 0).expect("seed");
    let host: i64 = conn
        .query_row(
            "SELECT id FROM animalconference_animal WHERE carnivorous = 1 LIMIT 1",
            [],
            |row| row.get(0),
        )
        .expect("host");
    let reversed =
        demo::add_seminar(&conn, "Backwards", host, at(12), Some(at(11)), &[]).expect("add");
    let id = validator_id::<Seminar>(&registry, &conn, "check_start_time_before_end_time");

    run_model::<Seminar>(&registry, &conn, &["check_start_time_before_end_time"]);
    store::set_allowed_to_fail(&conn, id, reversed, true, Some("daylight saving")).expect("pin");

    let summary = only(run_model::<Seminar>(
        &registry,
        &conn,
        &["check_start_time_before_end_time"],
    ));
    assert_eq!(summary.status(), Status::Passing);
    assert_eq!(summary.num_allowed_to_fail, Some(1));
    assert_eq!(summary.failure_ids(), &[reversed]);
}

#[test]
fn class_failures_are_persisted_across_batches() {
    let conn = gadget_connection(9);
    let registry = RegistryBuilder::new(Settings {
        failure_batch_size: 2,
        ..Settings::default()
    })
    .model::<Shipment>()
    .discover()
    .expect("shipment registry");
    let id = validator_id::<Shipment>(&registry, &conn, "no_heavy_gadgets");

    let summary = only(run_model::<Shipment>(&registry, &conn, &[]));
    assert_eq!(summary.status(), Status::Failing);
    assert_eq!(summary.num_allowed_to_fail, Some(0));
    assert_eq!(store::load_failing_pks(&conn, id).expect("pks"), vec![4, 5, 6, 7, 8, 9]);

    store::set_allowed_to_fail(&conn, id, 7, true, Some("known heavy")).expect("pin");
    let summary = only(run_model::<Shipment>(&registry, &conn, &[]));
    assert_eq!(summary.status(), Status::Failing);
    assert_eq!(summary.failure_ids().len(), 6);
    assert_eq!(summary.num_allowed_to_fail, Some(1));
    assert_eq!(store::load_failing_pks(&conn, id).expect("pks"), vec![4, 5, 6, 7, 8, 9]);

    let validator = store::load_validator(&conn, id).expect("load").expect("row");
    assert_eq!(validator.num_failing, 5);
    assert_eq!(validator.num_allowed_to_fail, 1);
}

#[test]
fn objects_validate_inside_the_callers_transaction() {
    let conn = demo_connection();
    let registry = demo_registry();
    registry.sync_to_storage(&conn).expect("sync");
    let id = validator_id::<Animal>(&registry, &conn, "check_alliteration");

    let tx = conn.unchecked_transaction().expect("begin");
    let bob = demo::add_animal(&tx, "Ant", "Bob", false, 1, &[]).expect("add");
    let counts = validate_object(&registry, &tx, "animalconference.animal", bob, false)
        .expect("run")
        .expect("animal exists");
    assert_eq!(counts.failing, 1);
    tx.commit().expect("commit");

    let row = store::load_failure(&conn, id, bob).expect("load").expect("failing record");
    assert!(row.is_valid);
    let validator = store::load_validator(&conn, id).expect("load").expect("row");
    assert_eq!(validator.status, Status::Failing);

    // a rolled back save takes its ledger changes with it
    let tx = conn.unchecked_transaction().expect("begin");
    tx.execute(
        "UPDATE animalconference_animal SET name = 'Abe' WHERE id = ?1",
        [bob],
    )
    .expect("fix");
    let counts = validate_object(&registry, &tx, "animalconference.animal", bob, false)
        .expect("run")
        .expect("animal exists");
    assert!(counts.is_clean());
    drop(tx);

    assert!(store::load_failure(&conn, id, bob).expect("load").is_some());
    let validator = store::load_validator(&conn, id).expect("load").expect("row");
    assert_eq!(validator.status, Status::Failing);
}

#[test]
fn overloaded_validators_use_class_for_models_and_instance_for_objects() {
    let conn = demo_connection();
    let registry = demo_registry();
    demo::seed(&conn, 30, 2).expect("seed");
    let host: i64 = conn
        .query_row(
            "SELECT host_id FROM animalconference_seminar ORDER BY id LIMIT 1",
            [],
            |row| row.get(0),
        )
        .expect("host");
    let empty = demo::add_seminar(
        &conn,
        "Nobody came",
        host,
        at(10),
        Some(at(10) + TimeDelta::minutes(30)),
        &[],
    )
    .expect("add");
    let id = validator_id::<Seminar>(&registry, &conn, "check_has_attendees");

    // the class implementation only answers yes or no
    let summary = only(run_model::<Seminar>(&registry, &conn, &["check_has_attendees"]));
    assert_eq!(summary.status(), Status::Failing);
    assert!(summary.failures.is_none());
    assert!(store::load_failing_pks(&conn, id).expect("pks").is_empty());

    // a passing object cannot tell whether the class-level failure is gone
    let full = Seminar::get(&conn, 1, &RelatedLookups::default())
        .expect("load")
        .expect("seminar 1");
    let counts = ObjectValidationRunner::new(&registry, &conn, &full)
        .expect("runner")
        .run(false)
        .expect("run");
    assert!(counts.is_clean());
    let validator = store::load_validator(&conn, id).expect("load").expect("row");
    assert_eq!(validator.status, Status::Failing);

    // the instance implementation materialises the failing seminar
    let lonely = Seminar::get(&conn, empty, &RelatedLookups::default())
        .expect("load")
        .expect("empty seminar");
    let counts = ObjectValidationRunner::new(&registry, &conn, &lonely)
        .expect("runner")
        .run(false)
        .expect("run");
    assert_eq!(counts.failing, 1);
    assert_eq!(store::load_failing_pks(&conn, id).expect("pks"), vec![empty]);
}

#[test]
fn object_runs_re_derive_status_from_failing_rows() {
    let conn = demo_connection();
    let registry = demo_registry();
    let bob = demo::add_animal(&conn, "Ant", "Bob", false, 1, &[]).expect("add");
    demo::add_animal(&conn, "Bee", "Bea", false, 1, &[]).expect("add");
    let id = validator_id::<Animal>(&registry, &conn, "check_alliteration");

    run_model::<Animal>(&registry, &conn, &[]);
    let validator = store::load_validator(&conn, id).expect("load").expect("row");
    assert_eq!(validator.status, Status::Failing);

    conn.execute(
        "UPDATE animalconference_animal SET name = 'Abe' WHERE id = ?1",
        [bob],
    )
    .expect("fix");
    let counts = validate_object(&registry, &conn, "animalconference.animal", bob, false)
        .expect("run")
        .expect("animal exists");
    assert!(counts.is_clean());
    assert_eq!(counts.passing, 4);
    assert!(counts.warning().is_none());

    let validator = store::load_validator(&conn, id).expect("load").expect("row");
    assert_eq!(validator.status, Status::Passing);
    assert!(store::load_failure(&conn, id, bob).expect("load").is_none());
}

#[test]
fn object_run_reports_a_warning_for_new_failures() {
    let conn = demo_connection();
    let registry = demo_registry();
    let bob = demo::add_animal(&conn, "Ant", "Bob", false, 1, &[]).expect("add");

    let counts = validate_object(&registry, &conn, "animalconference.Animal", bob, false)
        .expect("run")
        .expect("animal exists");
    assert_eq!(counts.failing, 1);
    assert_eq!(
        counts.warning().as_deref(),
        Some(format!("Animal {bob} failed 1 data validator(s)").as_str())
    );

    let id = validator_id::<Animal>(&registry, &conn, "check_alliteration");
    let validator = store::load_validator(&conn, id).expect("load").expect("row");
    assert_eq!(validator.status, Status::Failing);

    assert!(
        validate_object(&registry, &conn, "animalconference.Animal", 999, false)
            .expect("run")
            .is_none()
    );
}

#[test]
fn object_runs_cannot_clear_a_validator_exception() {
    let conn = gadget_connection(6);
    let registry = gadget_registry();
    let id = validator_id::<Gadget>(&registry, &conn, "raises_on_five");
    run_model::<Gadget>(&registry, &conn, &["raises_on_five"]);

    let gadget = Gadget::get(&conn, 1, &RelatedLookups::default())
        .expect("load")
        .expect("gadget 1");
    let update = store::update_validator_for_object(&conn, id, false, &InstanceResult::Pass)
        .expect("update");
    assert_eq!(update, StatusUpdate::SkippedException);

    let counts = ObjectValidationRunner::new(&registry, &conn, &gadget)
        .expect("runner")
        .run(false)
        .expect("run");
    // returns_nothing raises for every gadget
    assert_eq!(counts.exception, 1);
    let validator = store::load_validator(&conn, id).expect("load").expect("row");
    assert_eq!(validator.status, Status::Exception);
    assert_eq!(validator.exc_obj_pk, Some(5));
}

#[test]
fn object_run_exception_marks_the_validator() {
    let conn = gadget_connection(6);
    let registry = gadget_registry();
    let gadget = Gadget::get(&conn, 5, &RelatedLookups::default())
        .expect("load")
        .expect("gadget 5");

    let counts = ObjectValidationRunner::new(&registry, &conn, &gadget)
        .expect("runner")
        .run(true)
        .expect("run");
    // raises_on_five, panics_on_five, returns_nothing and the three class methods
    assert_eq!(counts.exception, 6);
    assert_eq!(counts.passing, 1);

    let id = validator_id::<Gadget>(&registry, &conn, "raises_on_five");
    let validator = store::load_validator(&conn, id).expect("load").expect("row");
    assert_eq!(validator.status, Status::Exception);
    assert_eq!(validator.exc_obj_pk, Some(5));
    let row = store::load_failure(&conn, id, 5).expect("load").expect("row");
    assert!(row.is_exception);
}

#[test]
fn a_model_runner_runs_only_once() {
    let conn = gadget_connection(2);
    let registry = gadget_registry();
    let mut runner = ModelValidationRunner::<Gadget>::new(
        &registry,
        &conn,
        Some(vec!["is_light".to_string()]),
    )
    .expect("runner");
    runner.run(false).expect("first run");
    assert!(matches!(
        runner.run(false),
        Err(Error::Consistency(ConsistencyError::AlreadyRun))
    ));
}

#[test]
fn unknown_models_and_names_are_usage_errors() {
    let conn = gadget_connection(1);
    let registry = gadget_registry();
    assert!(matches!(
        ModelValidationRunner::<Gadget>::new(&registry, &conn, Some(vec!["nope".to_string()])),
        Err(Error::Usage(UsageError::UnknownValidator { .. }))
    ));
    match ModelValidationRunner::<Animal>::new(&registry, &conn, None) {
        Err(Error::Usage(err)) => {
            assert_eq!(err.to_string(), "no data validation methods on model animalconference.Animal")
        }
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}

#[test]
fn run_validation_reports_totals_and_exit_code() {
    let conn = demo_connection();
    let registry = demo_registry();
    demo::seed(&conn, 40, 5).expect("seed");

    let everything = registry.select_all::<&str>(&[]).expect("selections");
    let report = run_validation(&registry, &conn, &everything, false).expect("run");
    assert!(registry.is_synced());
    let totals = report.totals();
    assert_eq!(totals.total(), registry.validators().count());
    assert_eq!(totals.passing, totals.total());
    assert_eq!(report.exit_code(), 0);

    demo::add_animal(&conn, "Ant", "Bob", false, 1, &[]).expect("add");
    let animals = registry.select("animalconference.Animal").expect("label");
    let report = run_validation(&registry, &conn, &animals, false).expect("run");
    assert_eq!(report.totals().failing, 1);
    assert_eq!(report.exit_code(), 1);

    assert_eq!(StatusTotals::default().exit_code(), 0);
}

#[test]
fn run_validation_checks_every_selection_before_running() {
    let conn = demo_connection();
    let registry = demo_registry();
    demo::seed(&conn, 5, 0).expect("seed");
    let selections = vec![
        Selection {
            model: ModelKey::of::<Animal>(),
            names: None,
        },
        Selection {
            model: ModelKey::of::<Seminar>(),
            names: Some(vec!["missing".to_string()]),
        },
    ];
    assert!(matches!(
        run_validation(&registry, &conn, &selections, false),
        Err(Error::Usage(UsageError::UnknownValidator { .. }))
    ));
    let ran: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM datavalidation_validator WHERE last_run_time IS NOT NULL",
            [],
            |row| row.get(0),
        )
        .expect("count");
    assert_eq!(ran, 0);
}
