//! A small animal conference: the record types the CLI validates and the
//! fixtures the engine's tests run against.

pub mod animals;
pub mod seed;
pub mod seminars;

use rusqlite::Connection;

use crate::config::Settings;
use crate::error::DefinitionError;
use crate::registry::{Registry, RegistryBuilder};

pub use animals::Animal;
pub use seed::{SeedReport, add_animal, add_seminar, seed};
pub use seminars::Seminar;

pub const APP_LABEL: &str = "animalconference";

pub fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS animalconference_animal (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          species TEXT NOT NULL,
          name TEXT NOT NULL,
          carnivorous INTEGER NOT NULL DEFAULT 0,
          predator_index INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS animalconference_animal_prey (
          predator_id INTEGER NOT NULL,
          prey_id INTEGER NOT NULL,
          PRIMARY KEY(predator_id, prey_id),
          FOREIGN KEY(predator_id) REFERENCES animalconference_animal(id) ON DELETE CASCADE,
          FOREIGN KEY(prey_id) REFERENCES animalconference_animal(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS animalconference_seminar (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          topic TEXT NOT NULL,
          host_id INTEGER NOT NULL,
          start_time TEXT NOT NULL,
          end_time TEXT,
          FOREIGN KEY(host_id) REFERENCES animalconference_animal(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS animalconference_seminar_attendee (
          seminar_id INTEGER NOT NULL,
          animal_id INTEGER NOT NULL,
          PRIMARY KEY(seminar_id, animal_id),
          FOREIGN KEY(seminar_id) REFERENCES animalconference_seminar(id) ON DELETE CASCADE,
          FOREIGN KEY(animal_id) REFERENCES animalconference_animal(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_animal_predator_index
          ON animalconference_animal(predator_index);
        ",
    )
}

/// Registry holding every conference model.
pub fn registry(settings: Settings) -> Result<Registry, DefinitionError> {
    RegistryBuilder::new(settings)
        .model::<Animal>()
        .model::<Seminar>()
        .discover()
}
