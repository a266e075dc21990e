//! Declared and observed access operations.
//!
//! Handlers declare up front which store resources each execution unit (the
//! ante phase or one message) touches. The store branch records what actually
//! happened, and [`MsgValidator`] reports accesses that were not declared.

use crate::store::{AccessEvent, AccessMode, StoreKey};
use crate::tx::{Msg, Tx};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessType {
    Read,
    Write,
    /// Matches any access; declared when a footprint cannot be known.
    Unknown,
    /// End-of-declaration marker.
    Commit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Origin {
    Declared,
    Observed,
}

/// Key-range part of a resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Identifier {
    /// Every key of the store.
    Any,
    /// Every key starting with the given bytes.
    Prefix(Vec<u8>),
}

impl Identifier {
    pub fn matches(&self, key: &[u8]) -> bool {
        match self {
            Identifier::Any => true,
            Identifier::Prefix(prefix) => key.starts_with(prefix),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Any => f.write_str("*"),
            Identifier::Prefix(prefix) => f.write_str(&hex::encode(prefix)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccessOperation {
    pub access_type: AccessType,
    /// `None` targets every store.
    pub store: Option<StoreKey>,
    pub identifier: Identifier,
    pub origin: Origin,
}

impl AccessOperation {
    pub fn declared(access_type: AccessType, store: &StoreKey, identifier: Identifier) -> Self {
        Self {
            access_type,
            store: Some(store.clone()),
            identifier,
            origin: Origin::Declared,
        }
    }

    pub fn read(store: &StoreKey, prefix: &[u8]) -> Self {
        Self::declared(AccessType::Read, store, Identifier::Prefix(prefix.to_vec()))
    }

    pub fn write(store: &StoreKey, prefix: &[u8]) -> Self {
        Self::declared(AccessType::Write, store, Identifier::Prefix(prefix.to_vec()))
    }

    /// Matches every access to every store.
    pub fn unknown() -> Self {
        Self {
            access_type: AccessType::Unknown,
            store: None,
            identifier: Identifier::Any,
            origin: Origin::Declared,
        }
    }

    pub fn commit() -> Self {
        Self {
            access_type: AccessType::Commit,
            store: None,
            identifier: Identifier::Any,
            origin: Origin::Declared,
        }
    }

    /// Exact operation recorded by a store branch.
    pub fn observed(event: &AccessEvent) -> Self {
        Self {
            access_type: match event.mode {
                AccessMode::Read => AccessType::Read,
                AccessMode::Write => AccessType::Write,
            },
            store: Some(event.store.clone()),
            identifier: Identifier::Prefix(event.key.clone()),
            origin: Origin::Observed,
        }
    }

    /// Whether this declaration permits the observed access.
    fn covers(&self, event: &AccessEvent) -> bool {
        let type_matches = match (self.access_type, event.mode) {
            (AccessType::Unknown, _) => true,
            (AccessType::Read, AccessMode::Read) | (AccessType::Write, AccessMode::Write) => true,
            _ => false,
        };
        let store_matches = self.store.as_ref().map_or(true, |store| *store == event.store);
        type_matches && store_matches && self.identifier.matches(&event.key)
    }

    fn is_concrete(&self) -> bool {
        matches!(self.access_type, AccessType::Read | AccessType::Write)
    }
}

impl fmt::Display for AccessOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let store = self.store.as_ref().map_or("*", StoreKey::name);
        write!(f, "{:?} {}/{} ({:?})", self.access_type, store, self.identifier, self.origin)
    }
}

/// Execution unit a declaration belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MsgIndex {
    Ante,
    Msg(usize),
}

impl fmt::Display for MsgIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MsgIndex::Ante => f.write_str("ante"),
            MsgIndex::Msg(index) => write!(f, "{index}"),
        }
    }
}

/// Declared operations of one transaction, per execution unit.
pub type TxAccessOps = BTreeMap<MsgIndex, Vec<AccessOperation>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationMode {
    /// Only undeclared accesses fail validation.
    #[default]
    Permissive,
    /// Declared reads/writes that never happened fail validation too.
    Strict,
}

/// Compares declared access operations with the accesses a branch recorded.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgValidator {
    mode: ValidationMode,
}

impl MsgValidator {
    pub fn new(mode: ValidationMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    /// Returns the operations that break the declaration: every observed
    /// access no declaration covers, and in strict mode every concrete
    /// declaration that nothing observed used. Empty means valid.
    pub fn validate_access_operations(
        &self,
        declared: &[AccessOperation],
        events: &[AccessEvent],
    ) -> BTreeSet<AccessOperation> {
        let mut missing: BTreeSet<AccessOperation> = events
            .iter()
            .filter(|event| !declared.iter().any(|op| op.covers(event)))
            .map(AccessOperation::observed)
            .collect();

        if self.mode == ValidationMode::Strict {
            missing.extend(
                declared
                    .iter()
                    .filter(|op| op.is_concrete())
                    .filter(|op| !events.iter().any(|event| op.covers(event)))
                    .cloned(),
            );
        }
        missing
    }
}

pub type DependencyGenerator = Arc<dyn Fn(&dyn Msg) -> Vec<AccessOperation> + Send + Sync>;
pub type AnteDependencyGenerator = Arc<dyn Fn(&dyn Tx) -> Vec<AccessOperation> + Send + Sync>;

/// Per-message-type declaration generators.
///
/// A message type without a generator declares [`AccessOperation::unknown`],
/// which accepts any footprint.
#[derive(Clone, Default)]
pub struct AccessControl {
    generators: HashMap<String, DependencyGenerator>,
    ante: Option<AnteDependencyGenerator>,
}

impl AccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    ///
    /// If a generator is already registered for `type_url`.
    pub fn register(&mut self, type_url: &str, generator: DependencyGenerator) {
        if self.generators.insert(type_url.to_string(), generator).is_some() {
            panic!("dependency generator for {type_url} already registered");
        }
    }

    pub fn set_ante_generator(&mut self, generator: AnteDependencyGenerator) {
        self.ante = Some(generator);
    }

    fn default_ops() -> Vec<AccessOperation> {
        vec![AccessOperation::unknown(), AccessOperation::commit()]
    }

    pub fn msg_ops(&self, msg: &dyn Msg) -> Vec<AccessOperation> {
        match self.generators.get(msg.type_url()) {
            Some(generator) => generator(msg),
            None => Self::default_ops(),
        }
    }

    /// Declarations for the ante phase and every message of `tx`.
    pub fn tx_ops(&self, tx: &dyn Tx) -> TxAccessOps {
        let mut ops = TxAccessOps::new();
        ops.insert(
            MsgIndex::Ante,
            match &self.ante {
                Some(generator) => generator(tx),
                None => Self::default_ops(),
            },
        );
        for (index, msg) in tx.msgs().iter().enumerate() {
            ops.insert(MsgIndex::Msg(index), self.msg_ops(msg.as_ref()));
        }
        ops
    }
}

impl fmt::Debug for AccessControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessControl")
            .field("generators", &self.generators.keys().collect::<Vec<_>>())
            .field("ante", &self.ante.is_some())
            .finish()
    }
}
