use std::collections::BTreeSet;
use std::fmt;

use rusqlite::Connection;
use serde::Serialize;

use crate::config::ModelConfig;
use crate::error::DefinitionError;
use crate::validator::DataValidator;

/// Identity of a record type: `app_label.model_name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ModelKey {
    pub app_label: String,
    pub model_name: String,
}

impl ModelKey {
    pub fn new(app_label: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            app_label: app_label.into(),
            model_name: model_name.into(),
        }
    }

    pub fn of<M: Model>() -> Self {
        Self::new(M::APP_LABEL, M::MODEL_NAME)
    }

    pub fn label(&self) -> String {
        self.to_string()
    }

    pub fn matches(&self, app_label: &str, model_name: &str) -> bool {
        self.app_label.eq_ignore_ascii_case(app_label)
            && self.model_name.eq_ignore_ascii_case(model_name)
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.app_label, self.model_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    ToOne,
    ToMany,
}

/// A relation path a model knows how to load eagerly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relation {
    pub path: &'static str,
    pub kind: RelationKind,
}

impl Relation {
    pub const fn to_one(path: &'static str) -> Self {
        Self {
            path,
            kind: RelationKind::ToOne,
        }
    }

    pub const fn to_many(path: &'static str) -> Self {
        Self {
            path,
            kind: RelationKind::ToMany,
        }
    }
}

/// The eager-loading hints that survived validation for one model run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelatedLookups {
    pub select_related: BTreeSet<String>,
    pub prefetch_related: BTreeSet<String>,
}

impl RelatedLookups {
    pub fn selects(&self, path: &str) -> bool {
        self.select_related.contains(path)
    }

    pub fn prefetches(&self, path: &str) -> bool {
        self.prefetch_related.contains(path)
    }

    pub fn is_empty(&self) -> bool {
        self.select_related.is_empty() && self.prefetch_related.is_empty()
    }

    /// select_related only follows to-one relations.
    pub fn check_select<M: Model>(path: &str) -> Result<(), String> {
        match M::relations().iter().find(|relation| relation.path == path) {
            Some(relation) if relation.kind == RelationKind::ToOne => Ok(()),
            Some(_) => Err(format!(
                "'{path}' is a to-many relation on {} and cannot be used in select_related",
                ModelKey::of::<M>()
            )),
            None => Err(format!(
                "invalid field name given in select_related: '{path}' on {}",
                ModelKey::of::<M>()
            )),
        }
    }

    pub fn check_prefetch<M: Model>(path: &str) -> Result<(), String> {
        if M::relations().iter().any(|relation| relation.path == path) {
            Ok(())
        } else {
            Err(format!(
                "cannot find '{path}' on {}, an invalid parameter to prefetch_related",
                ModelKey::of::<M>()
            ))
        }
    }
}

/// An application record type whose rows can be validated.
///
/// Implementors describe where their rows live and how to read them in
/// primary-key order; the engine never writes to the model's own tables.
pub trait Model: Sized + 'static {
    const APP_LABEL: &'static str;
    const MODEL_NAME: &'static str;
    const TABLE: &'static str;

    fn pk(&self) -> i64;

    /// The validators declared on this type. Overload mistakes surface here
    /// and abort registry discovery.
    fn data_validators() -> Result<Vec<DataValidator<Self>>, DefinitionError>;

    fn config() -> ModelConfig {
        ModelConfig::default()
    }

    /// Relations that `select_related` / `prefetch_related` hints may name.
    fn relations() -> &'static [Relation] {
        &[]
    }

    /// Read up to `limit` rows with `pk > after_pk` in ascending pk order,
    /// eagerly loading whatever `related` names.
    fn fetch_chunk(
        conn: &Connection,
        after_pk: Option<i64>,
        limit: usize,
        related: &RelatedLookups,
    ) -> rusqlite::Result<Vec<Self>>;

    fn get(conn: &Connection, pk: i64, related: &RelatedLookups) -> rusqlite::Result<Option<Self>> {
        let rows = Self::fetch_chunk(conn, pk.checked_sub(1), 1, related)?;
        Ok(rows.into_iter().find(|row| row.pk() == pk))
    }

    fn count(conn: &Connection) -> rusqlite::Result<i64> {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", Self::TABLE), [], |row| {
            row.get(0)
        })
    }
}

/// Streams every row of `M` in chunks so memory stays bounded by
/// `chunk_size` regardless of table size.
pub struct Records<'c, M: Model> {
    conn: &'c Connection,
    related: &'c RelatedLookups,
    chunk_size: usize,
    after_pk: Option<i64>,
    buffer: std::vec::IntoIter<M>,
    exhausted: bool,
}

pub fn iterate_records<'c, M: Model>(
    conn: &'c Connection,
    related: &'c RelatedLookups,
    chunk_size: usize,
) -> Records<'c, M> {
    Records {
        conn,
        related,
        chunk_size: chunk_size.max(1),
        after_pk: None,
        buffer: Vec::new().into_iter(),
        exhausted: false,
    }
}

impl<M: Model> Iterator for Records<'_, M> {
    type Item = rusqlite::Result<M>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(record) = self.buffer.next() {
            return Some(Ok(record));
        }
        if self.exhausted {
            return None;
        }

        let chunk = match M::fetch_chunk(self.conn, self.after_pk, self.chunk_size, self.related) {
            Ok(chunk) => chunk,
            Err(err) => {
                self.exhausted = true;
                return Some(Err(err));
            }
        };

        if chunk.len() < self.chunk_size {
            self.exhausted = true;
        }
        let last_pk = chunk.last()?.pk();
        tracing::debug!(
            model = %ModelKey::of::<M>(),
            rows = chunk.len(),
            last_pk,
            "fetched record chunk"
        );
        self.after_pk = Some(last_pk);
        self.buffer = chunk.into_iter();
        self.buffer.next().map(Ok)
    }
}
