use chrono::{Duration, NaiveDate, NaiveDateTime};
use rusqlite::{Connection, params};
use serde::Serialize;
use tracing::info;

use super::seminars::MAX_ATTENDEES;

// Index-aligned so every seeded animal is an alliteration.
const SPECIES: [&str; 20] = [
    "Ant", "Bear", "Cat", "Dog", "Eagle", "Fox", "Gorilla", "Hawk", "Ibis", "Jaguar", "Koala",
    "Lion", "Mantis", "Newt", "Owl", "Panda", "Quail", "Rabbit", "Snake", "Tiger",
];
const NAMES: [&str; 20] = [
    "Alma", "Boris", "Clara", "Dexter", "Elsa", "Felix", "Greta", "Hugo", "Iris", "Jonas", "Kira",
    "Luna", "Milo", "Nina", "Otto", "Pia", "Quinn", "Rosa", "Sven", "Tara",
];
const TOPICS: [&str; 8] = [
    "Ethics of the food chain",
    "Camouflage for beginners",
    "Migratory scheduling",
    "Nocturnal productivity",
    "Burrow architecture",
    "Pack leadership",
    "Venom safety",
    "Hibernation planning",
];
const MAX_PREDATOR_INDEX: usize = 4;
const SESSION_MINUTES: [i64; 3] = [30, 60, 90];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub animals: usize,
    pub seminars: usize,
}

fn conference_start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, 3)
        .and_then(|day| day.and_hms_opt(9, 0, 0))
        .unwrap_or_default()
}

/// Insert `animals` animals and `seminars` seminars that pass every
/// validator (Mantises excepted, which are allowed to fail).
pub fn seed(conn: &Connection, animals: usize, seminars: usize) -> rusqlite::Result<SeedReport> {
    let tx = conn.unchecked_transaction()?;
    let mut report = SeedReport::default();

    for index in 0..animals {
        let slot = index % SPECIES.len();
        let mut predator_index = 1 + (index % MAX_PREDATOR_INDEX) as i64;
        let prey = if predator_index > 1 {
            animals_with_index(&tx, predator_index - 1, None, 2)?
        } else {
            Vec::new()
        };
        if prey.is_empty() {
            predator_index = 1;
        }
        add_animal(
            &tx,
            SPECIES[slot],
            NAMES[slot],
            !prey.is_empty(),
            predator_index,
            &prey,
        )?;
        report.animals += 1;
    }

    let hosts: Vec<(i64, i64)> = {
        let mut statement = tx.prepare(
            "SELECT id, predator_index FROM animalconference_animal
             WHERE carnivorous = 1 ORDER BY id",
        )?;
        statement
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?
    };

    if !hosts.is_empty() {
        for index in 0..seminars {
            let (host_id, predator_index) = hosts[index % hosts.len()];
            let topic = match index / TOPICS.len() {
                0 => TOPICS[index].to_string(),
                round => format!("{} ({})", TOPICS[index % TOPICS.len()], round + 1),
            };
            let start_time = conference_start() + Duration::hours(index as i64);
            let end_time =
                start_time + Duration::minutes(SESSION_MINUTES[index % SESSION_MINUTES.len()]);
            let attendees =
                animals_with_index(&tx, predator_index, Some(host_id), MAX_ATTENDEES)?;
            add_seminar(&tx, &topic, host_id, start_time, Some(end_time), &attendees)?;
            report.seminars += 1;
        }
    }

    tx.commit()?;
    info!(
        animals = report.animals,
        seminars = report.seminars,
        "seeded animal conference"
    );
    Ok(report)
}

fn animals_with_index(
    conn: &Connection,
    predator_index: i64,
    exclude: Option<i64>,
    limit: usize,
) -> rusqlite::Result<Vec<i64>> {
    let mut statement = conn.prepare_cached(
        "SELECT id FROM animalconference_animal
         WHERE predator_index = ?1 AND (?2 IS NULL OR id <> ?2)
         ORDER BY id LIMIT ?3",
    )?;
    let rows = statement.query_map(params![predator_index, exclude, limit as i64], |row| {
        row.get(0)
    })?;
    rows.collect()
}

pub fn add_animal(
    conn: &Connection,
    species: &str,
    name: &str,
    carnivorous: bool,
    predator_index: i64,
    prey: &[i64],
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO animalconference_animal (species, name, carnivorous, predator_index)
         VALUES (?1, ?2, ?3, ?4)",
        params![species, name, carnivorous, predator_index],
    )?;
    let id = conn.last_insert_rowid();
    let mut statement = conn.prepare_cached(
        "INSERT OR IGNORE INTO animalconference_animal_prey (predator_id, prey_id) VALUES (?1, ?2)",
    )?;
    for prey_id in prey {
        statement.execute(params![id, prey_id])?;
    }
    Ok(id)
}

pub fn add_seminar(
    conn: &Connection,
    topic: &str,
    host_id: i64,
    start_time: NaiveDateTime,
    end_time: Option<NaiveDateTime>,
    attendees: &[i64],
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO animalconference_seminar (topic, host_id, start_time, end_time)
         VALUES (?1, ?2, ?3, ?4)",
        params![topic, host_id, start_time, end_time],
    )?;
    let id = conn.last_insert_rowid();
    let mut statement = conn.prepare_cached(
        "INSERT OR IGNORE INTO animalconference_seminar_attendee (seminar_id, animal_id)
         VALUES (?1, ?2)",
    )?;
    for animal_id in attendees {
        statement.execute(params![id, animal_id])?;
    }
    Ok(id)
}
