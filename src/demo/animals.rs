use std::borrow::Cow;
use std::collections::HashMap;

use rusqlite::{Connection, Row, params};

use crate::error::DefinitionError;
use crate::model::{Model, RelatedLookups, Relation};
use crate::results::ReturnValue;
use crate::validator::DataValidator;

/// The slice of an animal other animals need when they eat it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prey {
    pub id: i64,
    pub species: String,
    pub predator_index: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Animal {
    pub id: i64,
    pub species: String,
    pub name: String,
    pub carnivorous: bool,
    pub predator_index: i64,
    prey: Option<Vec<Prey>>,
}

impl Animal {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            species: row.get(1)?,
            name: row.get(2)?,
            carnivorous: row.get(3)?,
            predator_index: row.get(4)?,
            prey: None,
        })
    }

    /// Prefetched prey, or a query when `prey` was not prefetched.
    pub fn prey(&self, conn: &Connection) -> rusqlite::Result<Cow<'_, [Prey]>> {
        match &self.prey {
            Some(prey) => Ok(Cow::Borrowed(prey.as_slice())),
            None => {
                let mut grouped = load_prey(conn, self.id, self.id)?;
                Ok(Cow::Owned(grouped.remove(&self.id).unwrap_or_default()))
            }
        }
    }
}

impl std::fmt::Display for Animal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} the {}", self.name, self.species)
    }
}

fn load_prey(
    conn: &Connection,
    first_id: i64,
    last_id: i64,
) -> rusqlite::Result<HashMap<i64, Vec<Prey>>> {
    let mut statement = conn.prepare_cached(
        "SELECT p.predator_id, a.id, a.species, a.predator_index
         FROM animalconference_animal_prey p
         JOIN animalconference_animal a ON a.id = p.prey_id
         WHERE p.predator_id BETWEEN ?1 AND ?2
         ORDER BY p.predator_id, a.id",
    )?;
    let rows = statement.query_map(params![first_id, last_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            Prey {
                id: row.get(1)?,
                species: row.get(2)?,
                predator_index: row.get(3)?,
            },
        ))
    })?;

    let mut grouped: HashMap<i64, Vec<Prey>> = HashMap::new();
    for row in rows {
        let (predator_id, prey) = row?;
        grouped.entry(predator_id).or_default().push(prey);
    }
    Ok(grouped)
}

const RELATIONS: &[Relation] = &[Relation::to_many("prey")];

impl Model for Animal {
    const APP_LABEL: &'static str = super::APP_LABEL;
    const MODEL_NAME: &'static str = "Animal";
    const TABLE: &'static str = "animalconference_animal";

    fn pk(&self) -> i64 {
        self.id
    }

    fn relations() -> &'static [Relation] {
        RELATIONS
    }

    fn data_validators() -> Result<Vec<DataValidator<Self>>, DefinitionError> {
        Ok(vec![
            DataValidator::instance("check_alliteration", check_alliteration)
                .doc("Check that the animal's name and species start with the same letter."),
            DataValidator::instance("check_carnivorous", check_carnivorous)
                .doc("Carnivorous animals have prey and herbivores do not.")
                .prefetch_related(["prey"]),
            DataValidator::instance("check_no_cannibals", check_no_cannibals)
                .doc("Check that no animal preys on itself.")
                .select_related(["foobar"])
                .prefetch_related(["foobaz"]),
            DataValidator::instance("check_predator_hierarchy", check_predator_hierarchy)
                .prefetch_related(["prey"]),
        ])
    }

    fn fetch_chunk(
        conn: &Connection,
        after_pk: Option<i64>,
        limit: usize,
        related: &RelatedLookups,
    ) -> rusqlite::Result<Vec<Self>> {
        let mut statement = conn.prepare_cached(
            "SELECT id, species, name, carnivorous, predator_index
             FROM animalconference_animal
             WHERE ?1 IS NULL OR id > ?1
             ORDER BY id
             LIMIT ?2",
        )?;
        let mut animals = statement
            .query_map(params![after_pk, limit as i64], Animal::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if related.prefetches("prey")
            && let (Some(first), Some(last)) = (animals.first(), animals.last())
        {
            let mut grouped = load_prey(conn, first.id, last.id)?;
            for animal in &mut animals {
                animal.prey = Some(grouped.remove(&animal.id).unwrap_or_default());
            }
        }
        Ok(animals)
    }
}

fn check_alliteration(animal: &Animal, _conn: &Connection) -> anyhow::Result<ReturnValue> {
    let species = animal.species.chars().next();
    let name = animal.name.chars().next();
    if species.is_some() && species == name {
        Ok(ReturnValue::Pass)
    } else {
        Ok(ReturnValue::fail("not an alliteration"))
    }
}

fn check_carnivorous(animal: &Animal, conn: &Connection) -> anyhow::Result<ReturnValue> {
    let has_prey = !animal.prey(conn)?.is_empty();
    Ok((animal.carnivorous == has_prey).into())
}

fn check_no_cannibals(animal: &Animal, conn: &Connection) -> anyhow::Result<ReturnValue> {
    if animal.species == "Mantis" {
        return Ok(ReturnValue::fail_allowed("weirdos"));
    }
    let eats_itself = animal.prey(conn)?.iter().any(|prey| prey.id == animal.id);
    Ok((!eats_itself).into())
}

fn check_predator_hierarchy(animal: &Animal, conn: &Connection) -> anyhow::Result<ReturnValue> {
    if !animal.carnivorous {
        return Ok(ReturnValue::na());
    }
    let punches_up = animal
        .prey(conn)?
        .iter()
        .any(|prey| prey.predator_index >= animal.predator_index);
    Ok((!punches_up).into())
}
