//! Declaring data validators on a [`Model`].
//!
//! A validator has a name and up to two implementations: an instance method
//! run once per record, and a class method run once per model. Declaring both
//! under one name ("overloading") lets a full model run use the set-based
//! class method while single-record validation uses the instance method.

use std::collections::BTreeSet;
use std::fmt;

use rusqlite::Connection;

use crate::error::DefinitionError;
use crate::model::{Model, ModelKey};
use crate::results::ReturnValue;

pub type InstanceMethod<M> = fn(&M, &Connection) -> anyhow::Result<ReturnValue>;
pub type ClassMethod = fn(&Connection) -> anyhow::Result<ReturnValue>;

pub struct DataValidator<M> {
    pub(crate) name: String,
    pub(crate) doc: Option<String>,
    pub(crate) select_related: BTreeSet<String>,
    pub(crate) prefetch_related: BTreeSet<String>,
    pub(crate) instance_method: Option<InstanceMethod<M>>,
    pub(crate) class_method: Option<ClassMethod>,
}

impl<M: Model> DataValidator<M> {
    pub fn instance(name: impl Into<String>, method: InstanceMethod<M>) -> Self {
        Self {
            instance_method: Some(method),
            ..Self::empty(name.into())
        }
    }

    pub fn class(name: impl Into<String>, method: ClassMethod) -> Self {
        Self {
            class_method: Some(method),
            ..Self::empty(name.into())
        }
    }

    fn empty(name: String) -> Self {
        Self {
            name,
            doc: None,
            select_related: BTreeSet::new(),
            prefetch_related: BTreeSet::new(),
            instance_method: None,
            class_method: None,
        }
    }

    /// Documentation; its first paragraph becomes the stored description.
    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn select_related<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select_related.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn prefetch_related<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefetch_related.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Attach the implementation(s) of `other` to this validator.
    pub fn overload(mut self, other: DataValidator<M>) -> Result<Self, DefinitionError> {
        let owner = ModelKey::of::<M>().label();
        if other.name != self.name {
            return Err(DefinitionError::NameMismatch {
                owner,
                name: self.name,
                other: other.name,
            });
        }
        if other.instance_method.is_some() && self.instance_method.is_some() {
            return Err(DefinitionError::DuplicateInstance {
                owner,
                name: self.name,
            });
        }
        if other.class_method.is_some() && self.class_method.is_some() {
            return Err(DefinitionError::DuplicateClass {
                owner,
                name: self.name,
            });
        }

        self.instance_method = self.instance_method.or(other.instance_method);
        self.class_method = self.class_method.or(other.class_method);
        self.doc = self.doc.or(other.doc);
        self.select_related.extend(other.select_related);
        self.prefetch_related.extend(other.prefetch_related);
        Ok(self)
    }

    pub fn overload_instance(
        self,
        name: impl Into<String>,
        method: InstanceMethod<M>,
    ) -> Result<Self, DefinitionError> {
        self.overload(Self::instance(name, method))
    }

    pub fn overload_class(
        self,
        name: impl Into<String>,
        method: ClassMethod,
    ) -> Result<Self, DefinitionError> {
        self.overload(Self::class(name, method))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_instance_method(&self) -> bool {
        self.instance_method.is_some()
    }

    pub fn has_class_method(&self) -> bool {
        self.class_method.is_some()
    }

    pub fn is_overloaded(&self) -> bool {
        self.has_instance_method() && self.has_class_method()
    }
}

impl<M> fmt::Debug for DataValidator<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataValidator")
            .field("name", &self.name)
            .field("instance_method", &self.instance_method.is_some())
            .field("class_method", &self.class_method.is_some())
            .field("select_related", &self.select_related)
            .field("prefetch_related", &self.prefetch_related)
            .finish()
    }
}
