//! Transaction and unit of work.
//!
//! # Responsibility
//! - Keep exactly one in-memory instance per object id while active.
//! - Record creations, modifications, associations and deletions, and write
//!   them in one SQL transaction at commit.
//! - Enforce pessimistic locks of other owners and optimistic snapshots.
//!
//! # Invariants
//! - No SQL write is issued before `commit()`.
//! - Inserts run parents first; dummy ids are replaced everywhere they are
//!   referenced before dependent rows are written.
//! - A failed commit rolls back every statement and discards the cache.
//! - Pessimistic locks taken here are released only after a successful
//!   commit; rollback keeps them.

use crate::concurrency::lock::{Lock, LockOwner, LockType};
use crate::concurrency::lock_manager::LockManager;
use crate::concurrency::optimistic::OptimisticSnapshot;
use crate::error::{PersistenceError, PersistenceResult};
use crate::mapper::criteria::Criteria;
use crate::mapper::rdb_mapper::{execute_statement, INTERNAL_ID_COLUMN};
use crate::mapper::registry::MapperRegistry;
use crate::model::object::{ObjectState, PersistentObject};
use crate::model::oid::{KeyValue, ObjectId};
use crate::model::relation::{AggregationKind, RelationDescription, RelationKind};
use crate::model::schema::{OrderTerm, SortDirection};
use crate::model::value::Value;
use crate::query::paging::PagingInfo;
use crate::service::collaborators::{Action, Authorizer, Localization, Resource};
use log::{error, info, warn};
use rusqlite::{Connection, TransactionBehavior};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Inactive,
    Active,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        }
    }
}

/// Stable reference to an object cached in one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(usize);

/// How far relations are loaded from the requested objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildDepth {
    /// Only the object itself (many-to-one ids come from its foreign keys).
    Single,
    /// Related objects up to `n` hops away.
    Levels(u32),
    /// The whole reachable graph.
    Infinite,
}

impl BuildDepth {
    fn max_levels(&self) -> u32 {
        match self {
            Self::Single => 0,
            Self::Levels(levels) => *levels,
            Self::Infinite => u32::MAX,
        }
    }
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub linked: usize,
    pub unlinked: usize,
    /// Dummy id to persistent id, for every inserted object.
    pub id_map: BTreeMap<ObjectId, ObjectId>,
    /// Every removed row, cascaded children included.
    pub deleted_oids: Vec<ObjectId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingLink {
    source: ObjectHandle,
    role: String,
    target: ObjectHandle,
}

pub struct Transaction<'a> {
    conn: &'a Connection,
    registry: MapperRegistry,
    owner: LockOwner,
    authorizer: &'a dyn Authorizer,
    state: TransactionState,
    objects: Vec<Option<PersistentObject>>,
    index: HashMap<ObjectId, ObjectHandle>,
    pending_links: Vec<PendingLink>,
    pending_unlinks: Vec<PendingLink>,
    held_locks: Vec<ObjectId>,
    snapshots: HashMap<ObjectId, OptimisticSnapshot>,
}

impl<'a> Transaction<'a> {
    pub fn new(
        conn: &'a Connection,
        registry: MapperRegistry,
        owner: LockOwner,
        authorizer: &'a dyn Authorizer,
    ) -> Self {
        Self {
            conn,
            registry,
            owner,
            authorizer,
            state: TransactionState::Inactive,
            objects: Vec::new(),
            index: HashMap::new(),
            pending_links: Vec::new(),
            pending_unlinks: Vec::new(),
            held_locks: Vec::new(),
            snapshots: HashMap::new(),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    pub fn registry(&self) -> &MapperRegistry {
        &self.registry
    }

    pub(crate) fn connection(&self) -> &'a Connection {
        self.conn
    }

    /// Starts a new unit of work with an empty cache.
    pub fn begin(&mut self) -> PersistenceResult<()> {
        if self.state == TransactionState::Active {
            return Err(PersistenceError::InvalidTransactionState {
                expected: "not active",
                actual: self.state.as_str(),
            });
        }
        self.clear_cache();
        self.held_locks.clear();
        self.state = TransactionState::Active;
        info!(
            "event=tx_begin module=tx status=ok owner={}",
            self.owner
        );
        Ok(())
    }

    pub fn object(&self, handle: ObjectHandle) -> PersistenceResult<&PersistentObject> {
        self.objects
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| stale_handle(handle))
    }

    /// Handle of the cached instance of `oid`.
    pub fn find(&self, oid: &ObjectId) -> Option<ObjectHandle> {
        self.index.get(oid).copied()
    }

    /// Number of cached objects.
    pub fn cached_count(&self) -> usize {
        self.objects.iter().flatten().count()
    }

    /// Creates a `New` object with a dummy id.
    pub fn create(&mut self, type_name: &str) -> PersistenceResult<ObjectHandle> {
        self.ensure_active()?;
        let object = PersistentObject::new(self.registry.entity(type_name)?);
        self.authorize(&Resource::Type(type_name.to_string()), Action::Create)?;
        Ok(self.insert_cached(object))
    }

    /// Creates a `New` object whose key values the caller provides.
    pub fn create_with_oid(&mut self, oid: ObjectId) -> PersistenceResult<ObjectHandle> {
        self.ensure_active()?;
        if self.index.contains_key(&oid) {
            return Err(PersistenceError::InvalidData(format!(
                "`{oid}` is already part of the transaction"
            )));
        }
        let object = PersistentObject::with_oid(self.registry.entity(oid.type_name())?, oid)?;
        self.authorize(
            &Resource::Type(object.type_name().to_string()),
            Action::Create,
        )?;
        Ok(self.insert_cached(object))
    }

    /// Loads `oid`, returning the cached instance when present.
    ///
    /// # Errors
    /// - `PessimisticLockConflict` when another owner locked the object; the
    ///   transaction is rolled back.
    /// - `AuthorizationDenied` when reading is not permitted.
    pub fn load(
        &mut self,
        oid: &ObjectId,
        depth: BuildDepth,
    ) -> PersistenceResult<Option<ObjectHandle>> {
        self.ensure_active()?;
        if let Some(handle) = self.find(oid) {
            return match self.object(handle)?.state() {
                ObjectState::Deleted => Ok(None),
                _ => Ok(Some(handle)),
            };
        }

        self.guard_foreign_lock(oid)?;
        self.authorize(&Resource::Object(oid.clone()), Action::Read)?;

        let registry = self.registry.clone();
        let mapper = registry.mapper(oid.type_name())?;
        let Some(object) = mapper.load_current(self.conn, oid)? else {
            return Ok(None);
        };
        let Some(handle) = self.register_loaded(object) else {
            return Ok(None);
        };
        self.load_relations(vec![handle], depth)?;
        Ok(Some(handle))
    }

    /// Loads all objects of `type_name` matching `criteria`.
    ///
    /// With `paging`, only the requested page is loaded and the total count
    /// is filled in.
    pub fn load_objects(
        &mut self,
        type_name: &str,
        criteria: &[Criteria],
        order: Option<&[OrderTerm]>,
        paging: Option<&mut PagingInfo>,
        depth: BuildDepth,
    ) -> PersistenceResult<Vec<ObjectHandle>> {
        self.ensure_active()?;
        self.authorize(&Resource::Type(type_name.to_string()), Action::Read)?;

        let registry = self.registry.clone();
        let mapper = registry.mapper(type_name)?;
        let mut select = mapper.select_sql(criteria, None, None, order)?;
        if let Some(paging) = paging {
            paging.set_total_count(mapper.count(self.conn, &select)?);
            select.limit = Some(u64::from(paging.page_size()));
            select.offset = paging.offset();
        }

        let rows = mapper.fetch(self.conn, &select)?;
        self.adopt_rows(rows.into_iter().map(|row| row.object).collect(), depth)
    }

    /// Loads one logical page across several types.
    ///
    /// Each type contributes its first `offset + page_size` rows; the union
    /// is sorted by `order` and the page is sliced from it. The total count
    /// is the sum of the per-type counts. Criteria apply to their own type.
    pub fn load_objects_multi(
        &mut self,
        type_names: &[&str],
        criteria: &[Criteria],
        order: &[OrderTerm],
        paging: Option<&mut PagingInfo>,
        depth: BuildDepth,
    ) -> PersistenceResult<Vec<ObjectHandle>> {
        self.ensure_active()?;
        let registry = self.registry.clone();
        let window = paging
            .as_ref()
            .map(|paging| (paging.offset(), u64::from(paging.page_size())));

        let mut merged = Vec::new();
        let mut total = 0;
        for type_name in type_names {
            self.authorize(&Resource::Type(type_name.to_string()), Action::Read)?;
            let mapper = registry.mapper(type_name)?;
            let type_criteria: Vec<Criteria> = criteria
                .iter()
                .filter(|criterion| criterion.type_name == *type_name)
                .cloned()
                .collect();
            let type_order: Vec<OrderTerm> = order
                .iter()
                .filter(|term| {
                    term.qualifier
                        .as_deref()
                        .map_or(true, |qualifier| qualifier == *type_name)
                })
                .map(|term| OrderTerm {
                    qualifier: None,
                    ..term.clone()
                })
                .collect();

            let type_order = (!type_order.is_empty()).then_some(type_order.as_slice());
            let mut select = mapper.select_sql(&type_criteria, None, None, type_order)?;
            if let Some((offset, page_size)) = window {
                total += mapper.count(self.conn, &select)?;
                select.limit = Some(offset + page_size);
            }
            merged.extend(mapper.fetch(self.conn, &select)?.into_iter().map(|row| row.object));
        }

        merged.sort_by(|left, right| compare_objects(left, right, order));
        let page: Vec<PersistentObject> = match window {
            Some((offset, page_size)) => merged
                .into_iter()
                .skip(usize::try_from(offset).unwrap_or(usize::MAX))
                .take(usize::try_from(page_size).unwrap_or(usize::MAX))
                .collect(),
            None => merged,
        };
        if let Some(paging) = paging {
            paging.set_total_count(total);
        }
        self.adopt_rows(page, depth)
    }

    /// Sets an attribute; foreign key attributes also update the relation.
    pub fn set_value(
        &mut self,
        handle: ObjectHandle,
        attribute: &str,
        value: impl Into<Value>,
    ) -> PersistenceResult<()> {
        self.ensure_active()?;
        self.object_mut(handle)?.set_value(attribute, value)
    }

    /// Associates `child` with `parent`.
    ///
    /// `role` selects the relation when several relations connect the two
    /// types.
    pub fn add_node(
        &mut self,
        parent: ObjectHandle,
        child: ObjectHandle,
        role: Option<&str>,
    ) -> PersistenceResult<()> {
        self.ensure_active()?;
        let relation = self.relation_between(parent, child, role)?;
        match relation.kind() {
            RelationKind::ManyToOne => self.point_to(parent, &relation, Some(child)),
            RelationKind::OneToMany => self.point_to(child, &relation.inverse(), Some(parent)),
            RelationKind::ManyToMany => {
                let parent_oid = self.object(parent)?.oid().clone();
                let child_oid = self.object(child)?.oid().clone();
                self.object_mut(parent)?
                    .add_related(&relation.other_role, child_oid);
                self.object_mut(child)?
                    .add_related(&relation.this_role, parent_oid);

                let link = PendingLink {
                    source: parent,
                    role: relation.other_role.clone(),
                    target: child,
                };
                let inverse = PendingLink {
                    source: child,
                    role: relation.this_role.clone(),
                    target: parent,
                };
                self.pending_unlinks
                    .retain(|pending| *pending != link && *pending != inverse);
                if !self.pending_links.contains(&link) && !self.pending_links.contains(&inverse) {
                    self.pending_links.push(link);
                }
                Ok(())
            }
        }
    }

    /// Removes the association between `parent` and `child`.
    pub fn delete_node(
        &mut self,
        parent: ObjectHandle,
        child: ObjectHandle,
        role: Option<&str>,
    ) -> PersistenceResult<()> {
        self.ensure_active()?;
        let relation = self.relation_between(parent, child, role)?;
        let parent_oid = self.object(parent)?.oid().clone();
        let child_oid = self.object(child)?.oid().clone();

        match relation.kind() {
            RelationKind::ManyToOne => {
                if self.object(parent)?.related(&relation.other_role).contains(&child_oid) {
                    self.point_to(parent, &relation, None)?;
                }
                Ok(())
            }
            RelationKind::OneToMany => {
                let inverse = relation.inverse();
                if self.object(child)?.related(&inverse.other_role).contains(&parent_oid) {
                    self.point_to(child, &inverse, None)?;
                }
                Ok(())
            }
            RelationKind::ManyToMany => {
                self.object_mut(parent)?
                    .remove_related(&relation.other_role, &child_oid);
                self.object_mut(child)?
                    .remove_related(&relation.this_role, &parent_oid);

                let link = PendingLink {
                    source: parent,
                    role: relation.other_role.clone(),
                    target: child,
                };
                let inverse = PendingLink {
                    source: child,
                    role: relation.this_role.clone(),
                    target: parent,
                };
                self.pending_links
                    .retain(|pending| *pending != link && *pending != inverse);
                if !parent_oid.is_dummy()
                    && !child_oid.is_dummy()
                    && !self.pending_unlinks.contains(&link)
                {
                    self.pending_unlinks.push(link);
                }
                Ok(())
            }
        }
    }

    /// Marks an object for deletion at commit.
    ///
    /// Objects that were never persisted leave the transaction, and every
    /// cached object stops referencing them.
    pub fn delete(&mut self, handle: ObjectHandle) -> PersistenceResult<()> {
        self.ensure_active()?;
        if self.object(handle)?.state() == ObjectState::New {
            let object = self.detach(handle)?;
            self.forget_references(object.oid())?;
            return Ok(());
        }
        self.object_mut(handle)?.mark_deleted();
        Ok(())
    }

    /// Removes an object from the transaction and returns it.
    ///
    /// Later changes to the returned object are not tracked until it is
    /// handed back with `save`.
    pub fn detach(&mut self, handle: ObjectHandle) -> PersistenceResult<PersistentObject> {
        let object = self
            .objects
            .get_mut(handle.0)
            .and_then(Option::take)
            .ok_or_else(|| stale_handle(handle))?;
        self.index.remove(object.oid());
        self.pending_links
            .retain(|link| link.source != handle && link.target != handle);
        self.pending_unlinks
            .retain(|link| link.source != handle && link.target != handle);
        Ok(object)
    }

    /// Attaches an externally built or detached object.
    ///
    /// A cached instance with the same id is replaced.
    pub fn save(&mut self, object: PersistentObject) -> PersistenceResult<ObjectHandle> {
        self.ensure_active()?;
        self.registry.entity(object.type_name())?;
        if let Some(handle) = self.find(object.oid()) {
            self.objects[handle.0] = Some(object);
            return Ok(handle);
        }
        Ok(self.insert_cached(object))
    }

    /// Acquires a lock on `oid` for this transaction's owner.
    ///
    /// Pessimistic locks are stored immediately and survive the transaction
    /// until released. Optimistic locks snapshot the object's persisted
    /// values, loading it when needed.
    pub fn acquire_lock(&mut self, oid: &ObjectId, lock_type: LockType) -> PersistenceResult<Lock> {
        self.ensure_active()?;
        match lock_type {
            LockType::Pessimistic => {
                match LockManager::new(self.conn).acquire(oid, &self.owner) {
                    Ok(lock) => {
                        if !self.held_locks.contains(oid) {
                            self.held_locks.push(oid.clone());
                        }
                        Ok(lock)
                    }
                    Err(err) => {
                        if err.is_lock_conflict() {
                            self.rollback_after_conflict(&err);
                        }
                        Err(err)
                    }
                }
            }
            LockType::Optimistic => {
                let handle = match self.find(oid) {
                    Some(handle) => handle,
                    None => self.load(oid, BuildDepth::Single)?.ok_or_else(|| {
                        PersistenceError::InvalidData(format!("`{oid}` does not exist"))
                    })?,
                };
                let snapshot = OptimisticSnapshot::capture(self.object(handle)?);
                self.snapshots.insert(oid.clone(), snapshot.clone());
                Ok(Lock {
                    oid: oid.clone(),
                    owner: self.owner.clone(),
                    lock_type,
                    acquired_at: now_millis(),
                    snapshot: Some(snapshot),
                })
            }
        }
    }

    /// Releases a lock taken by this owner. Returns `false` when none was held.
    pub fn release_lock(&mut self, oid: &ObjectId, lock_type: LockType) -> PersistenceResult<bool> {
        match lock_type {
            LockType::Pessimistic => {
                self.held_locks.retain(|held| held != oid);
                LockManager::new(self.conn).release(oid, &self.owner)
            }
            LockType::Optimistic => Ok(self.snapshots.remove(oid).is_some()),
        }
    }

    /// Localized copy of a cached object; the cached instance is untouched.
    pub fn load_translated(
        &self,
        handle: ObjectHandle,
        localization: &dyn Localization,
        language: &str,
    ) -> PersistenceResult<PersistentObject> {
        let mut copy = self.object(handle)?.clone();
        localization.load_translation(&mut copy, language)?;
        Ok(copy)
    }

    /// Hands a localized copy to `localization` for storage.
    ///
    /// Translations bypass the unit of work, so the update permission and
    /// foreign locks are checked here rather than at commit.
    pub fn save_translated(
        &mut self,
        translated: &PersistentObject,
        localization: &dyn Localization,
        language: &str,
    ) -> PersistenceResult<()> {
        self.ensure_active()?;
        if translated.oid().is_dummy() {
            return Err(PersistenceError::InvalidData(format!(
                "`{}` has no stored canonical instance to translate",
                translated.oid()
            )));
        }
        self.guard_foreign_lock(translated.oid())?;
        self.authorize(&Resource::Object(translated.oid().clone()), Action::Update)?;
        localization.save_translation(translated, language)?;
        info!(
            "event=translation_save module=tx status=ok oid={} language={}",
            translated.oid(),
            language
        );
        Ok(())
    }

    /// Writes all recorded changes atomically.
    pub fn commit(&mut self) -> PersistenceResult<CommitSummary> {
        self.ensure_active()?;
        let started_at = Instant::now();
        info!(
            "event=tx_commit module=tx status=start owner={}",
            self.owner
        );

        match self.write_changes() {
            Ok(summary) => {
                self.finish_commit(&summary);
                info!(
                    "event=tx_commit module=tx status=ok owner={} inserted={} updated={} deleted={} linked={} unlinked={} duration_ms={}",
                    self.owner,
                    summary.inserted,
                    summary.updated,
                    summary.deleted,
                    summary.linked,
                    summary.unlinked,
                    started_at.elapsed().as_millis()
                );
                Ok(summary)
            }
            Err(err) => {
                error!(
                    "event=tx_commit module=tx status=error owner={} duration_ms={} error={}",
                    self.owner,
                    started_at.elapsed().as_millis(),
                    err
                );
                self.discard(TransactionState::RolledBack);
                Err(err)
            }
        }
    }

    /// Discards every recorded change and the object cache.
    pub fn rollback(&mut self) -> PersistenceResult<()> {
        self.ensure_active()?;
        self.discard(TransactionState::RolledBack);
        info!("event=tx_rollback module=tx status=ok owner={}", self.owner);
        Ok(())
    }

    /// Registers query results and loads their relations.
    pub(crate) fn adopt_rows(
        &mut self,
        rows: Vec<PersistentObject>,
        depth: BuildDepth,
    ) -> PersistenceResult<Vec<ObjectHandle>> {
        let handles: Vec<ObjectHandle> = rows
            .into_iter()
            .filter_map(|object| self.register_loaded(object))
            .collect();
        self.load_relations(handles.clone(), depth)?;
        Ok(handles)
    }

    pub(crate) fn ensure_active(&self) -> PersistenceResult<()> {
        if self.state != TransactionState::Active {
            return Err(PersistenceError::InvalidTransactionState {
                expected: TransactionState::Active.as_str(),
                actual: self.state.as_str(),
            });
        }
        Ok(())
    }

    pub(crate) fn authorize(&self, resource: &Resource, action: Action) -> PersistenceResult<()> {
        if self.authorizer.authorize(resource, &self.owner, action) {
            return Ok(());
        }
        warn!(
            "event=authorize module=tx status=denied owner={} action={} resource={}",
            self.owner, action, resource
        );
        Err(PersistenceError::AuthorizationDenied {
            resource: resource.to_string(),
            action,
        })
    }

    fn object_mut(&mut self, handle: ObjectHandle) -> PersistenceResult<&mut PersistentObject> {
        self.objects
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| stale_handle(handle))
    }

    fn insert_cached(&mut self, object: PersistentObject) -> ObjectHandle {
        let handle = ObjectHandle(self.objects.len());
        self.index.insert(object.oid().clone(), handle);
        self.objects.push(Some(object));
        handle
    }

    /// Returns the cached instance for a freshly read row, caching it if new.
    fn register_loaded(&mut self, object: PersistentObject) -> Option<ObjectHandle> {
        match self.find(object.oid()) {
            Some(handle) => match self.objects[handle.0].as_ref() {
                Some(cached) if cached.state() == ObjectState::Deleted => None,
                _ => Some(handle),
            },
            None => Some(self.insert_cached(object)),
        }
    }

    fn load_relations(
        &mut self,
        roots: Vec<ObjectHandle>,
        depth: BuildDepth,
    ) -> PersistenceResult<()> {
        let max_levels = depth.max_levels();
        let registry = self.registry.clone();
        let mut visited: HashSet<ObjectHandle> = roots.iter().copied().collect();
        let mut frontier = roots;
        let mut level = 0;

        while level < max_levels && !frontier.is_empty() {
            let mut by_type: BTreeMap<String, Vec<ObjectHandle>> = BTreeMap::new();
            for handle in &frontier {
                let object = self.object(*handle)?;
                if object.state() != ObjectState::New {
                    by_type
                        .entry(object.type_name().to_string())
                        .or_default()
                        .push(*handle);
                }
            }

            let mut next = Vec::new();
            for (type_name, parents) in by_type {
                let entity = registry.entity(&type_name)?;
                let mapper = registry.mapper(&type_name)?;
                for relation in entity.relations() {
                    if !relation.other_navigable {
                        continue;
                    }
                    let role = relation.other_role.as_str();
                    let (rows, select) = {
                        let parent_objects = parents
                            .iter()
                            .map(|handle| self.object(*handle))
                            .collect::<PersistenceResult<Vec<_>>>()?;
                        let select = mapper.relation_select_sql(&parent_objects, role, &[], None)?;
                        let other = registry.mapper(&relation.other_type)?;
                        (other.fetch(self.conn, &select.statement)?, select)
                    };

                    for row in rows {
                        let match_value = if select.object_value_column == INTERNAL_ID_COLUMN {
                            row.extra.get(INTERNAL_ID_COLUMN).cloned().unwrap_or_default()
                        } else {
                            row.object.value(&select.object_value_column)?.clone()
                        };
                        let Some(match_key) = KeyValue::from_value(&match_value) else {
                            continue;
                        };
                        let child_oid = row.object.oid().clone();
                        if !self.authorizer.authorize(
                            &Resource::Object(child_oid.clone()),
                            &self.owner,
                            Action::Read,
                        ) {
                            continue;
                        }
                        let Some(child) = self.register_loaded(row.object) else {
                            continue;
                        };

                        for parent in &parents {
                            let parent_object = self.object(*parent)?;
                            let parent_key = KeyValue::from_value(
                                parent_object.value(&select.relation_value_column)?,
                            );
                            if parent_key.as_ref() != Some(&match_key) {
                                continue;
                            }
                            let parent_oid = parent_object.oid().clone();
                            self.object_mut(*parent)?.add_related(role, child_oid.clone());
                            self.object_mut(child)?
                                .add_related(&relation.this_role, parent_oid);
                        }
                        if visited.insert(child) {
                            next.push(child);
                        }
                    }

                    for parent in &parents {
                        let parent_object = self.object_mut(*parent)?;
                        if !parent_object.has_relation_role(role) {
                            parent_object.set_related(role, Vec::new());
                        }
                    }
                }
            }
            frontier = next;
            level += 1;
        }
        Ok(())
    }

    fn relation_between(
        &self,
        parent: ObjectHandle,
        child: ObjectHandle,
        role: Option<&str>,
    ) -> PersistenceResult<RelationDescription> {
        let parent_type = self.object(parent)?.type_name();
        let child_type = self.object(child)?.type_name();
        Ok(self
            .registry
            .entity(parent_type)?
            .resolve_relation(child_type, role)?
            .clone())
    }

    /// Points the many-to-one `relation` of `holder` at `target`.
    fn point_to(
        &mut self,
        holder: ObjectHandle,
        relation: &RelationDescription,
        target: Option<ObjectHandle>,
    ) -> PersistenceResult<()> {
        let Some(fk_attribute) = relation.fk_column_on_this() else {
            return Err(PersistenceError::InvalidSchema(format!(
                "role `{}` of `{}` has no foreign key",
                relation.other_role, relation.this_type
            )));
        };
        let holder_oid = self.object(holder)?.oid().clone();
        let previous = self.object(holder)?.related(&relation.other_role).to_vec();
        for old_target in previous {
            if let Some(handle) = self.find(&old_target) {
                self.object_mut(handle)?
                    .remove_related(&relation.this_role, &holder_oid);
            }
        }

        let target_oid = match target {
            Some(handle) => Some(self.object(handle)?.oid().clone()),
            None => None,
        };
        let fk_value = match &target_oid {
            Some(oid) if !oid.is_dummy() => oid.first_id().to_value(),
            _ => Value::Null,
        };

        let object = self.object_mut(holder)?;
        object.set_related(&relation.other_role, target_oid.iter().cloned().collect());
        object.set_value_unchecked(fk_attribute, fk_value);
        object.mark_dirty();

        if let (Some(handle), Some(_)) = (target, &target_oid) {
            self.object_mut(handle)?
                .add_related(&relation.this_role, holder_oid);
        }
        Ok(())
    }

    /// Drops `oid` from every cached relation, clearing foreign keys that
    /// pointed at it.
    fn forget_references(&mut self, oid: &ObjectId) -> PersistenceResult<()> {
        let registry = self.registry.clone();
        for object in self.objects.iter_mut().flatten() {
            let entity = registry.entity(object.type_name())?;
            for relation in entity.relations() {
                let Some(fk_attribute) = relation.fk_column_on_this() else {
                    continue;
                };
                if object.related(&relation.other_role).contains(oid) {
                    object.set_value_unchecked(fk_attribute, Value::Null);
                    object.mark_dirty();
                }
            }
            object.remove_oid_refs(oid);
        }
        Ok(())
    }

    fn guard_foreign_lock(&mut self, oid: &ObjectId) -> PersistenceResult<()> {
        if let Err(err) = LockManager::new(self.conn).check_access(oid, &self.owner) {
            if err.is_lock_conflict() {
                self.rollback_after_conflict(&err);
            }
            return Err(err);
        }
        Ok(())
    }

    fn rollback_after_conflict(&mut self, err: &PersistenceError) {
        if self.state == TransactionState::Active {
            warn!(
                "event=tx_rollback module=tx status=ok owner={} reason=lock_conflict error={}",
                self.owner, err
            );
            self.discard(TransactionState::RolledBack);
        }
    }

    fn live_handles(&self) -> Vec<ObjectHandle> {
        self.objects
            .iter()
            .enumerate()
            .filter(|(_, object)| object.is_some())
            .map(|(index, _)| ObjectHandle(index))
            .collect()
    }

    fn handles_in_state(&self, state: ObjectState) -> PersistenceResult<Vec<ObjectHandle>> {
        let mut handles = Vec::new();
        for handle in self.live_handles() {
            if self.object(handle)?.state() == state {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    /// Lock and permission checks run inside the write transaction, so no
    /// other connection can take a lock between the check and the write.
    fn write_changes(&mut self) -> PersistenceResult<CommitSummary> {
        let registry = self.registry.clone();
        let sql_tx =
            rusqlite::Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let locks = LockManager::new(self.conn);
        for handle in self.live_handles() {
            let object = self.object(handle)?;
            match object.state() {
                ObjectState::New => self.authorize(
                    &Resource::Type(object.type_name().to_string()),
                    Action::Create,
                )?,
                ObjectState::Dirty => {
                    locks.check_access(object.oid(), &self.owner)?;
                    self.authorize(&Resource::Object(object.oid().clone()), Action::Update)?;
                }
                ObjectState::Deleted => {
                    locks.check_access(object.oid(), &self.owner)?;
                    self.authorize(&Resource::Object(object.oid().clone()), Action::Delete)?;
                }
                ObjectState::Clean => {}
            }
        }

        let mut summary = CommitSummary::default();
        self.insert_new_objects(&registry, &mut summary)?;
        self.update_dirty_objects(&registry, &mut summary)?;
        self.write_links(&registry, &mut summary)?;
        self.delete_objects(&registry, &mut summary)?;
        sql_tx.commit()?;
        Ok(summary)
    }

    fn insert_new_objects(
        &mut self,
        registry: &MapperRegistry,
        summary: &mut CommitSummary,
    ) -> PersistenceResult<()> {
        let mut pending = self.handles_in_state(ObjectState::New)?;
        while !pending.is_empty() {
            let mut ready = None;
            for (position, handle) in pending.iter().enumerate() {
                if !self.references_unsaved(registry, *handle)? {
                    ready = Some(position);
                    break;
                }
            }
            let Some(position) = ready else {
                let blocked: Vec<String> = pending
                    .iter()
                    .filter_map(|handle| self.object(*handle).ok())
                    .map(|object| object.oid().to_string())
                    .collect();
                return Err(PersistenceError::InvalidData(format!(
                    "unsaved objects reference each other in a cycle: {}",
                    blocked.join(", ")
                )));
            };
            let handle = pending.remove(position);

            let type_name = self.object(handle)?.type_name().to_string();
            let mapper = registry.mapper(&type_name)?;
            let old_oid = self.object(handle)?.oid().clone();
            if old_oid.is_dummy() {
                let new_oid = mapper.allocate_oid(self.conn)?;
                self.replace_oid(handle, &old_oid, &new_oid)?;
                summary.id_map.insert(old_oid, new_oid);
            }

            self.refresh_foreign_keys(registry, handle)?;
            let statement = mapper.insert_sql(self.object(handle)?)?;
            execute_statement(self.conn, &statement)?;
            if let Some(version) = mapper.entity().version_attribute() {
                let object = self.object_mut(handle)?;
                if object.value(version)?.is_null() {
                    object.set_value_unchecked(version, Value::Integer(1));
                }
            }
            summary.inserted += 1;
        }
        Ok(())
    }

    fn references_unsaved(
        &self,
        registry: &MapperRegistry,
        handle: ObjectHandle,
    ) -> PersistenceResult<bool> {
        let object = self.object(handle)?;
        let entity = registry.entity(object.type_name())?;
        Ok(entity
            .relations()
            .iter()
            .filter(|relation| relation.this_role_is_fk())
            .any(|relation| {
                object
                    .related(&relation.other_role)
                    .iter()
                    .any(ObjectId::is_dummy)
            }))
    }

    fn replace_oid(
        &mut self,
        handle: ObjectHandle,
        old_oid: &ObjectId,
        new_oid: &ObjectId,
    ) -> PersistenceResult<()> {
        self.object_mut(handle)?.replace_oid(new_oid.clone());
        self.index.remove(old_oid);
        self.index.insert(new_oid.clone(), handle);
        for object in self.objects.iter_mut().flatten() {
            object.replace_oid_refs(old_oid, new_oid);
        }
        if let Some(snapshot) = self.snapshots.remove(old_oid) {
            self.snapshots.insert(new_oid.clone(), snapshot);
        }
        Ok(())
    }

    /// Copies many-to-one relation targets into their foreign key attributes.
    fn refresh_foreign_keys(
        &mut self,
        registry: &MapperRegistry,
        handle: ObjectHandle,
    ) -> PersistenceResult<()> {
        let object = self.object_mut(handle)?;
        let entity = registry.entity(object.type_name())?;
        for relation in entity.relations() {
            let Some(fk_attribute) = relation.fk_column_on_this() else {
                continue;
            };
            if !object.has_relation_role(&relation.other_role) {
                continue;
            }
            let value = object
                .related(&relation.other_role)
                .first()
                .filter(|target| !target.is_dummy())
                .map_or(Value::Null, |target| target.first_id().to_value());
            object.set_value_unchecked(fk_attribute, value);
        }
        Ok(())
    }

    fn update_dirty_objects(
        &mut self,
        registry: &MapperRegistry,
        summary: &mut CommitSummary,
    ) -> PersistenceResult<()> {
        for handle in self.handles_in_state(ObjectState::Dirty)? {
            self.refresh_foreign_keys(registry, handle)?;
            let object = self.object(handle)?;
            let mapper = registry.mapper(object.type_name())?;
            let statement = mapper.update_sql(object, self.snapshots.get(object.oid()))?;
            let next_version = mapper.next_version(object)?;

            if execute_statement(self.conn, &statement)? == 0 {
                let oid = object.oid().clone();
                let current = mapper.load_current(self.conn, &oid)?;
                return Err(PersistenceError::OptimisticLockConflict {
                    oid,
                    current: current.map(Box::new),
                });
            }
            if let (Some(version), Some(attribute)) =
                (next_version, mapper.entity().version_attribute())
            {
                self.object_mut(handle)?
                    .set_value_unchecked(attribute, Value::Integer(version));
            }
            summary.updated += 1;
        }
        Ok(())
    }

    fn write_links(
        &mut self,
        registry: &MapperRegistry,
        summary: &mut CommitSummary,
    ) -> PersistenceResult<()> {
        for link in &self.pending_unlinks {
            let (Ok(source), Ok(target)) = (self.object(link.source), self.object(link.target))
            else {
                continue;
            };
            let mapper = registry.mapper(source.type_name())?;
            summary.unlinked += mapper.delete_associations(
                self.conn,
                &link.role,
                source.oid(),
                Some(target.oid()),
            )?;
        }
        for link in &self.pending_links {
            let (Ok(source), Ok(target)) = (self.object(link.source), self.object(link.target))
            else {
                continue;
            };
            if source.state() == ObjectState::Deleted || target.state() == ObjectState::Deleted {
                continue;
            }
            let mapper = registry.mapper(source.type_name())?;
            if mapper.insert_association(self.conn, &link.role, source.oid(), target.oid())? {
                summary.linked += 1;
            }
        }
        Ok(())
    }

    fn delete_objects(
        &mut self,
        registry: &MapperRegistry,
        summary: &mut CommitSummary,
    ) -> PersistenceResult<()> {
        let mut deleted = Vec::new();
        for handle in self.handles_in_state(ObjectState::Deleted)? {
            let oid = self.object(handle)?.oid().clone();
            self.cascade_delete(registry, &oid, &mut deleted)?;
        }
        summary.deleted = deleted.len();
        summary.deleted_oids = deleted;
        Ok(())
    }

    /// Deletes `oid` with its composite children, detaching everything else.
    fn cascade_delete(
        &self,
        registry: &MapperRegistry,
        oid: &ObjectId,
        deleted: &mut Vec<ObjectId>,
    ) -> PersistenceResult<()> {
        if deleted.contains(oid) {
            return Ok(());
        }
        deleted.push(oid.clone());

        let mapper = registry.mapper(oid.type_name())?;
        for relation in mapper.entity().relations() {
            let role = relation.other_role.as_str();
            match relation.kind() {
                RelationKind::OneToMany
                    if relation.this_aggregation == AggregationKind::Composite =>
                {
                    for child in mapper.child_oids(self.conn, role, oid)? {
                        LockManager::new(self.conn).check_access(&child, &self.owner)?;
                        self.authorize(&Resource::Object(child.clone()), Action::Delete)?;
                        self.cascade_delete(registry, &child, deleted)?;
                    }
                }
                RelationKind::OneToMany => {
                    mapper.nullify_children(self.conn, role, oid)?;
                }
                RelationKind::ManyToMany => {
                    mapper.delete_associations(self.conn, role, oid, None)?;
                }
                RelationKind::ManyToOne => {}
            }
        }
        execute_statement(self.conn, &mapper.delete_sql(oid)?)?;
        Ok(())
    }

    fn finish_commit(&mut self, summary: &CommitSummary) {
        for oid in &summary.deleted_oids {
            if let Some(handle) = self.index.remove(oid) {
                self.objects[handle.0] = None;
            }
        }
        for object in self.objects.iter_mut().flatten() {
            for oid in &summary.deleted_oids {
                object.remove_oid_refs(oid);
            }
            object.mark_persisted();
        }

        let locks = LockManager::new(self.conn);
        for oid in std::mem::take(&mut self.held_locks) {
            let oid = summary.id_map.get(&oid).cloned().unwrap_or(oid);
            if let Err(err) = locks.release(&oid, &self.owner) {
                warn!(
                    "event=lock_release module=tx status=error oid={} owner={} error={}",
                    oid, self.owner, err
                );
            }
        }
        self.pending_links.clear();
        self.pending_unlinks.clear();
        self.snapshots.clear();
        self.state = TransactionState::Committed;
    }

    fn discard(&mut self, state: TransactionState) {
        self.clear_cache();
        self.held_locks.clear();
        self.state = state;
    }

    fn clear_cache(&mut self) {
        self.objects.clear();
        self.index.clear();
        self.pending_links.clear();
        self.pending_unlinks.clear();
        self.snapshots.clear();
    }
}

fn stale_handle(handle: ObjectHandle) -> PersistenceError {
    PersistenceError::InvalidData(format!(
        "object handle {} is not part of the transaction",
        handle.0
    ))
}

fn compare_objects(
    left: &PersistentObject,
    right: &PersistentObject,
    order: &[OrderTerm],
) -> Ordering {
    for term in order {
        let left_value = left.value(&term.attribute).unwrap_or(&Value::Null);
        let right_value = right.value(&term.attribute).unwrap_or(&Value::Null);
        let ordering = match term.direction {
            SortDirection::Asc => left_value.compare(right_value),
            SortDirection::Desc => right_value.compare(left_value),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.oid().cmp(right.oid())
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
