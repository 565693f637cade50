use std::collections::HashMap;

use anyhow::Context;
use chrono::NaiveDateTime;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::DefinitionError;
use crate::model::{Model, RelatedLookups, Relation};
use crate::results::{Failures, PkQuery, RecordRef, ReturnValue, Summary};
use crate::validator::DataValidator;

pub const MAX_ATTENDEES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Host {
    pub id: i64,
    pub carnivorous: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seminar {
    pub id: i64,
    pub topic: String,
    pub host_id: i64,
    pub start_time: NaiveDateTime,
    pub end_time: Option<NaiveDateTime>,
    host: Option<Host>,
    attendees: Option<Vec<i64>>,
}

impl Seminar {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            topic: row.get(1)?,
            host_id: row.get(2)?,
            start_time: row.get(3)?,
            end_time: row.get(4)?,
            host: None,
            attendees: None,
        })
    }

    fn from_row_with_host(row: &Row<'_>) -> rusqlite::Result<Self> {
        let mut seminar = Self::from_row(row)?;
        seminar.host = Some(Host {
            id: seminar.host_id,
            carnivorous: row.get(5)?,
        });
        Ok(seminar)
    }

    pub fn host(&self, conn: &Connection) -> anyhow::Result<Host> {
        if let Some(host) = self.host {
            return Ok(host);
        }
        conn.query_row(
            "SELECT id, carnivorous FROM animalconference_animal WHERE id = ?1",
            [self.host_id],
            |row| {
                Ok(Host {
                    id: row.get(0)?,
                    carnivorous: row.get(1)?,
                })
            },
        )
        .optional()?
        .with_context(|| format!("seminar {} has no host {}", self.id, self.host_id))
    }

    pub fn attendees(&self, conn: &Connection) -> rusqlite::Result<Vec<i64>> {
        match &self.attendees {
            Some(attendees) => Ok(attendees.clone()),
            None => Ok(load_attendees(conn, self.id, self.id)?
                .remove(&self.id)
                .unwrap_or_default()),
        }
    }
}

fn load_attendees(
    conn: &Connection,
    first_id: i64,
    last_id: i64,
) -> rusqlite::Result<HashMap<i64, Vec<i64>>> {
    let mut statement = conn.prepare_cached(
        "SELECT seminar_id, animal_id FROM animalconference_seminar_attendee
         WHERE seminar_id BETWEEN ?1 AND ?2
         ORDER BY seminar_id, animal_id",
    )?;
    let rows = statement.query_map(params![first_id, last_id], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut grouped: HashMap<i64, Vec<i64>> = HashMap::new();
    for row in rows {
        let (seminar_id, animal_id) = row?;
        grouped.entry(seminar_id).or_default().push(animal_id);
    }
    Ok(grouped)
}

const RELATIONS: &[Relation] = &[Relation::to_one("host"), Relation::to_many("attendees")];

impl Model for Seminar {
    const APP_LABEL: &'static str = super::APP_LABEL;
    const MODEL_NAME: &'static str = "Seminar";
    const TABLE: &'static str = "animalconference_seminar";

    fn pk(&self) -> i64 {
        self.id
    }

    fn relations() -> &'static [Relation] {
        RELATIONS
    }

    fn data_validators() -> Result<Vec<DataValidator<Self>>, DefinitionError> {
        Ok(vec![
            DataValidator::instance("check_host_is_carnivorous", check_host_is_carnivorous)
                .doc("Only carnivorous hosts at this conference apparently.")
                .select_related(["host"]),
            DataValidator::class(
                "check_start_time_before_end_time",
                check_start_time_before_end_time,
            ),
            DataValidator::class("check_max_attendees", check_max_attendees)
                .doc("Check that each seminar has at most ten attendees."),
            DataValidator::class("check_unique_topics", check_unique_topics)
                .doc("No two seminars share a topic."),
            DataValidator::instance("check_has_attendees", has_attendees)
                .doc("Every seminar needs an audience.")
                .prefetch_related(["attendees"])
                .overload_class("check_has_attendees", all_have_attendees)?,
        ])
    }

    fn fetch_chunk(
        conn: &Connection,
        after_pk: Option<i64>,
        limit: usize,
        related: &RelatedLookups,
    ) -> rusqlite::Result<Vec<Self>> {
        let mut seminars = if related.selects("host") {
            let mut statement = conn.prepare_cached(
                "SELECT s.id, s.topic, s.host_id, s.start_time, s.end_time, a.carnivorous
                 FROM animalconference_seminar s
                 JOIN animalconference_animal a ON a.id = s.host_id
                 WHERE ?1 IS NULL OR s.id > ?1
                 ORDER BY s.id
                 LIMIT ?2",
            )?;
            statement
                .query_map(params![after_pk, limit as i64], Seminar::from_row_with_host)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            let mut statement = conn.prepare_cached(
                "SELECT id, topic, host_id, start_time, end_time
                 FROM animalconference_seminar
                 WHERE ?1 IS NULL OR id > ?1
                 ORDER BY id
                 LIMIT ?2",
            )?;
            statement
                .query_map(params![after_pk, limit as i64], Seminar::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        if related.prefetches("attendees")
            && let (Some(first), Some(last)) = (seminars.first(), seminars.last())
        {
            let mut grouped = load_attendees(conn, first.id, last.id)?;
            for seminar in &mut seminars {
                seminar.attendees = Some(grouped.remove(&seminar.id).unwrap_or_default());
            }
        }
        Ok(seminars)
    }
}

fn check_host_is_carnivorous(seminar: &Seminar, conn: &Connection) -> anyhow::Result<ReturnValue> {
    Ok(seminar.host(conn)?.carnivorous.into())
}

fn check_start_time_before_end_time(conn: &Connection) -> anyhow::Result<ReturnValue> {
    let mut statement = conn.prepare(
        "SELECT id FROM animalconference_seminar
         WHERE end_time IS NOT NULL AND start_time > end_time
         ORDER BY id",
    )?;
    let ids = statement
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids.into())
}

fn check_max_attendees(conn: &Connection) -> anyhow::Result<ReturnValue> {
    let mut statement = conn.prepare(
        "SELECT s.id, COUNT(sa.animal_id)
         FROM animalconference_seminar s
         LEFT JOIN animalconference_seminar_attendee sa ON sa.seminar_id = s.id
         GROUP BY s.id
         ORDER BY s.id",
    )?;
    let rows = statement.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;

    let mut num_passing = 0;
    let mut failures = Vec::new();
    for row in rows {
        let (id, attendees) = row?;
        if attendees > MAX_ATTENDEES as i64 {
            failures.push(RecordRef { pk: id });
        } else {
            num_passing += 1;
        }
    }
    Ok(Summary {
        num_passing: Some(num_passing),
        num_na: Some(0),
        failures: Failures::Records(failures),
    }
    .into())
}

fn check_unique_topics(_conn: &Connection) -> anyhow::Result<ReturnValue> {
    let query = PkQuery::new(
        "SELECT s.id FROM animalconference_seminar s
         WHERE EXISTS (
           SELECT 1 FROM animalconference_seminar other
           WHERE other.topic = s.topic AND other.id <> s.id
         )
         ORDER BY s.id",
    );
    Ok(Failures::Query(query).into())
}

fn has_attendees(seminar: &Seminar, conn: &Connection) -> anyhow::Result<ReturnValue> {
    Ok((!seminar.attendees(conn)?.is_empty()).into())
}

fn all_have_attendees(conn: &Connection) -> anyhow::Result<ReturnValue> {
    let empty: i64 = conn.query_row(
        "SELECT COUNT(*) FROM animalconference_seminar s
         WHERE NOT EXISTS (
           SELECT 1 FROM animalconference_seminar_attendee sa WHERE sa.seminar_id = s.id
         )",
        [],
        |row| row.get(0),
    )?;
    Ok((empty == 0).into())
}
