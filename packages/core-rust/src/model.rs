//! Entity model boundary.
//!
//! The server never knows the concrete types it moves around. It sees
//! [`Entity`] trait objects, built from wire payloads by a [`ModelManager`]
//! that also answers which operations are legal between an identity and
//! its parent. [`ModelRegistry`] is the stock manager: register each entity
//! type once with its identity, declare the parent relationships, and hand
//! it to the server.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::encoding::{CodecError, Encoding};
use crate::error::ApiError;
use crate::operation::Operation;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Identity of an entity type: its singular name and plural category.
///
/// The name tags events (`"list"`), the category appears in routes (`"lists"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub category: String,
}

impl Identity {
    #[must_use]
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
        }
    }

    /// The implicit parent of top-level objects.
    #[must_use]
    pub fn root() -> Self {
        Self::new("root", "root")
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.name == "root"
    }

    /// Identity of the [`Assignation`] payload used by patch operations.
    #[must_use]
    pub fn assignation() -> Self {
        Self::new("assignation", "assignations")
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// Access to `Any` for trait objects; implemented for every `'static` type.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A typed, serializable object managed by a processor.
pub trait Entity: AsAny + erased_serde::Serialize + fmt::Debug + Send + Sync + 'static {
    /// Identity of the entity type.
    fn identity(&self) -> Identity;

    /// Unique identifier of this instance. Empty until assigned.
    fn identifier(&self) -> String;

    /// Validates the entity after decoding. Errors are surfaced verbatim.
    ///
    /// # Errors
    ///
    /// Returns the validation failure to report to the client.
    fn validate(&self) -> Result<(), ApiError> {
        Ok(())
    }
}

erased_serde::serialize_trait_object!(Entity);

impl dyn Entity {
    /// Downcasts to a concrete entity type.
    #[must_use]
    pub fn downcast_ref<T: Entity>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Serializes a slice of shared entities as a sequence.
pub struct EntityList<'a>(pub &'a [Arc<dyn Entity>]);

impl Serialize for EntityList<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter().map(|e| &**e))
    }
}

// ---------------------------------------------------------------------------
// Assignation
// ---------------------------------------------------------------------------

/// How an assignation changes a relationship set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignationType {
    Add,
    Remove,
    Set,
}

/// Payload of a patch operation: a change to the members of a relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignation {
    #[serde(rename = "type")]
    pub kind: AssignationType,
    #[serde(default)]
    pub ids: Vec<String>,
    /// Name of the identity the ids refer to.
    #[serde(default)]
    pub members_identity: String,
}

impl Entity for Assignation {
    fn identity(&self) -> Identity {
        Identity::assignation()
    }

    fn identifier(&self) -> String {
        String::new()
    }

    fn validate(&self) -> Result<(), ApiError> {
        if self.kind != AssignationType::Set && self.ids.is_empty() {
            return Err(ApiError::validation(
                "an add or remove assignation needs at least one id",
                "assignation",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ModelManager
// ---------------------------------------------------------------------------

/// Factory and relationship oracle for entities.
pub trait ModelManager: Send + Sync {
    /// Looks up an identity by its singular name.
    fn identity_from_name(&self, name: &str) -> Option<Identity>;

    /// Looks up an identity by its plural category.
    fn identity_from_category(&self, category: &str) -> Option<Identity>;

    /// Decodes a payload into a fresh instance of `identity`.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::EmptyBody` or a malformed variant when the
    /// payload cannot be decoded.
    fn decode(
        &self,
        identity: &Identity,
        encoding: Encoding,
        data: &[u8],
    ) -> Result<Box<dyn Entity>, CodecError>;

    /// Whether `operation` is legal on `identity` under `parent`.
    fn relationship_allowed(
        &self,
        identity: &Identity,
        parent: &Identity,
        operation: Operation,
    ) -> bool;
}

type Decoder = fn(Encoding, &[u8]) -> Result<Box<dyn Entity>, CodecError>;

fn decode_as<T: Entity + DeserializeOwned>(
    encoding: Encoding,
    data: &[u8],
) -> Result<Box<dyn Entity>, CodecError> {
    let entity: T = encoding.decode(data)?;
    Ok(Box::new(entity))
}

/// Stock [`ModelManager`] backed by registered Rust types.
///
/// Every registered identity may be operated on at the root. Parent
/// relationships must be declared with [`ModelRegistry::allow`].
#[derive(Default)]
pub struct ModelRegistry {
    by_name: HashMap<String, (Identity, Decoder)>,
    by_category: HashMap<String, String>,
    relations: HashMap<(String, String), HashSet<Operation>>,
}

impl ModelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under `identity`, allowing every operation at the root.
    #[must_use]
    pub fn register<T: Entity + DeserializeOwned>(mut self, identity: Identity) -> Self {
        tracing::debug!(identity = %identity.name, category = %identity.category, "model registered");
        self.by_category
            .insert(identity.category.clone(), identity.name.clone());
        self.relations.insert(
            (identity.name.clone(), Identity::root().name),
            Operation::ALL.into_iter().collect(),
        );
        self.by_name
            .insert(identity.name.clone(), (identity, decode_as::<T>));
        self
    }

    /// Allows `operations` on `identity` when nested under `parent`.
    #[must_use]
    pub fn allow(
        mut self,
        identity: &Identity,
        parent: &Identity,
        operations: impl IntoIterator<Item = Operation>,
    ) -> Self {
        self.relations
            .entry((identity.name.clone(), parent.name.clone()))
            .or_default()
            .extend(operations);
        self
    }

    /// Removes every relationship of `identity` under `parent`, including root.
    #[must_use]
    pub fn deny(mut self, identity: &Identity, parent: &Identity) -> Self {
        self.relations
            .remove(&(identity.name.clone(), parent.name.clone()));
        self
    }
}

impl ModelManager for ModelRegistry {
    fn identity_from_name(&self, name: &str) -> Option<Identity> {
        self.by_name.get(name).map(|(identity, _)| identity.clone())
    }

    fn identity_from_category(&self, category: &str) -> Option<Identity> {
        self.by_category
            .get(category)
            .and_then(|name| self.identity_from_name(name))
    }

    fn decode(
        &self,
        identity: &Identity,
        encoding: Encoding,
        data: &[u8],
    ) -> Result<Box<dyn Entity>, CodecError> {
        match self.by_name.get(&identity.name) {
            Some((_, decoder)) => decoder(encoding, data),
            None => Err(CodecError::UnknownIdentity(identity.name.clone())),
        }
    }

    fn relationship_allowed(
        &self,
        identity: &Identity,
        parent: &Identity,
        operation: Operation,
    ) -> bool {
        self.relations
            .get(&(identity.name.clone(), parent.name.clone()))
            .is_some_and(|ops| ops.contains(&operation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Task {
        #[serde(default)]
        id: String,
        name: String,
    }

    impl Entity for Task {
        fn identity(&self) -> Identity {
            Identity::new("task", "tasks")
        }

        fn identifier(&self) -> String {
            self.id.clone()
        }

        fn validate(&self) -> Result<(), ApiError> {
            if self.name.is_empty() {
                return Err(ApiError::validation("name is required", "task"));
            }
            Ok(())
        }
    }

    fn registry() -> ModelRegistry {
        let task = Identity::new("task", "tasks");
        let list = Identity::new("list", "lists");
        ModelRegistry::new()
            .register::<Task>(task.clone())
            .allow(&task, &list, [Operation::RetrieveMany, Operation::Create])
    }

    #[test]
    fn lookup_by_name_and_category() {
        let registry = registry();
        assert_eq!(registry.identity_from_name("task").unwrap().category, "tasks");
        assert_eq!(registry.identity_from_category("tasks").unwrap().name, "task");
        assert!(registry.identity_from_name("tasks").is_none());
    }

    #[test]
    fn decode_builds_a_downcastable_entity() {
        let registry = registry();
        let identity = Identity::new("task", "tasks");
        let entity = registry
            .decode(&identity, Encoding::Json, br#"{"name":"write docs"}"#)
            .unwrap();
        let task = entity.downcast_ref::<Task>().unwrap();
        assert_eq!(task.name, "write docs");
        assert!(entity.downcast_ref::<Assignation>().is_none());
    }

    #[test]
    fn decode_reports_empty_body() {
        let registry = registry();
        let err = registry
            .decode(&Identity::new("task", "tasks"), Encoding::Json, b"")
            .unwrap_err();
        assert!(matches!(err, CodecError::EmptyBody));
    }

    #[test]
    fn relationships() {
        let registry = registry();
        let task = Identity::new("task", "tasks");
        let list = Identity::new("list", "lists");
        assert!(registry.relationship_allowed(&task, &Identity::root(), Operation::Delete));
        assert!(registry.relationship_allowed(&task, &list, Operation::Create));
        assert!(!registry.relationship_allowed(&task, &list, Operation::Delete));

        let denied = registry.deny(&task, &Identity::root());
        assert!(!denied.relationship_allowed(&task, &Identity::root(), Operation::Retrieve));
    }

    #[test]
    fn entity_trait_objects_serialize() {
        let items: Vec<Arc<dyn Entity>> = vec![
            Arc::new(Task { id: "1".into(), name: "a".into() }),
            Arc::new(Task { id: "2".into(), name: "b".into() }),
        ];
        let json = serde_json::to_value(EntityList(&items)).unwrap();
        assert_eq!(json[1]["name"], "b");
    }

    #[test]
    fn assignation_validation() {
        let empty_add = Assignation {
            kind: AssignationType::Add,
            ids: vec![],
            members_identity: "task".into(),
        };
        assert_eq!(empty_add.validate().unwrap_err().code, 422);

        let clear = Assignation {
            kind: AssignationType::Set,
            ids: vec![],
            members_identity: "task".into(),
        };
        assert!(clear.validate().is_ok());
    }
}
