//! `SubscriptionStore`: an ordered, versioned, mutable set of query
//! descriptors with state-machine notifications (spec §3, §4.6).
//!
//! Two tables back this, both ordinary `Group` tables: `sync_sets` (keyed by
//! version) and `sync_subscriptions` (keyed by an internal monotonic row
//! id). A set's row carries the ordered list of its subscriptions' row keys
//! as a `Binary` cell rather than a `BackLink` column -- `BackLink`'s
//! cascade-on-erase semantics (spec §4.4) are for a row that is *targeted*
//! by other tables' rows, the inverse of what a set needs (an ordered,
//! set-owned list it alone reads). Each committed set's subscriptions are
//! physically distinct rows from every other set's, even when they
//! represent "the same" named subscription carried forward unchanged --
//! sets are immutable once committed (spec §3), so a later set's edits can
//! never be observed by reading an earlier one.
//!
//! The waiter registry is a single `parking_lot::Mutex<Vec<Waiter>>`, the
//! one lock spec §5 grants the storage core, matching the teacher's own
//! single-mutex-per-subsystem habit (e.g. `db/transaction.rs`'s lock
//! scoped to just the active-transaction set).

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::cluster::{CascadeState, ColumnSpec, ColumnType, ObjKey, Schema, Value};
use crate::error::{Error, Result};
use crate::group::Group;
use crate::types::TableKey;

use super::{binary_or_empty, decode_key_list, encode_key_list, next_key, required_int, required_string, string_or_none};

/// Table names (spec §4.6).
pub const SETS_TABLE: &str = "sync_sets";
pub const SUBSCRIPTIONS_TABLE: &str = "sync_subscriptions";

/// A `SubscriptionSet`'s lifecycle state (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Uncommitted,
    Pending,
    Bootstrapping,
    AwaitingMark,
    Complete,
    Error,
    Superseded,
}

impl SubscriptionState {
    fn encode(self) -> i64 {
        match self {
            SubscriptionState::Uncommitted => 0,
            SubscriptionState::Pending => 1,
            SubscriptionState::Bootstrapping => 2,
            SubscriptionState::AwaitingMark => 3,
            SubscriptionState::Complete => 4,
            SubscriptionState::Error => 5,
            SubscriptionState::Superseded => 6,
        }
    }

    fn decode(raw: i64) -> Result<Self> {
        Ok(match raw {
            0 => SubscriptionState::Uncommitted,
            1 => SubscriptionState::Pending,
            2 => SubscriptionState::Bootstrapping,
            3 => SubscriptionState::AwaitingMark,
            4 => SubscriptionState::Complete,
            5 => SubscriptionState::Error,
            6 => SubscriptionState::Superseded,
            other => return Err(Error::InvalidDatabase(format!("unknown subscription state tag {other}"))),
        })
    }

    /// Progression rank along the normal Uncommitted -> ... -> Complete
    /// path. `Error` and `Superseded` are absorbing states handled by
    /// their own checks in [`SubscriptionStore::get_state_change_notification`]
    /// and [`SubscriptionStore::resolve_waiters`] rather than by rank
    /// comparison -- they don't sit "above" `Complete` in any progression
    /// sense, they end it.
    fn rank(self) -> u8 {
        match self {
            SubscriptionState::Uncommitted => 0,
            SubscriptionState::Pending => 1,
            SubscriptionState::Bootstrapping => 2,
            SubscriptionState::AwaitingMark => 3,
            SubscriptionState::Complete => 4,
            SubscriptionState::Error | SubscriptionState::Superseded => 4,
        }
    }
}

/// Permitted state transitions (spec §4.6): `Pending -> Bootstrapping`,
/// `Bootstrapping -> AwaitingMark`, and `any -> Complete` / `any -> Error`.
fn validate_transition(from: SubscriptionState, to: SubscriptionState) -> Result<()> {
    use SubscriptionState::*;
    let ok = matches!(
        (from, to),
        (Pending, Bootstrapping) | (Bootstrapping, AwaitingMark) | (_, Complete) | (_, Error)
    );
    if ok {
        Ok(())
    } else {
        Err(Error::IllegalCombination(format!(
            "illegal subscription set state transition {from:?} -> {to:?}"
        )))
    }
}

/// One query descriptor (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// 128-bit stable identity, assigned once at creation and carried
    /// forward unchanged across every set that includes this subscription.
    pub id: u128,
    /// Unique among a set's subscriptions where present; anonymous (`None`)
    /// subscriptions are always distinct objects (spec §3 invariant).
    pub name: Option<String>,
    pub object_class_name: String,
    pub query_string: String,
    pub created_at: i64,
    pub last_update_timestamp: i64,
}

/// An immutable, committed (or still-building) snapshot of one version
/// (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSet {
    pub version: u64,
    pub state: SubscriptionState,
    pub error_string: Option<String>,
    pub created_at: i64,
    pub last_update_timestamp: i64,
    pub subscriptions: Vec<Subscription>,
}

impl SubscriptionSet {
    pub fn find_by_name(&self, name: &str) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| s.name.as_deref() == Some(name))
    }
}

/// A pending `get_state_change_notification` result (spec §4.6). Already
/// resolved when registered past the target state or when the set is
/// already in a terminal state; otherwise backed by a [`oneshot::Receiver`]
/// a future `commit`/`update_state` call on the same store fulfills.
pub struct StateChangeNotification {
    inner: NotificationInner,
}

enum NotificationInner {
    Ready(Option<Result<SubscriptionState>>),
    Pending(oneshot::Receiver<Result<SubscriptionState>>),
}

impl StateChangeNotification {
    fn ready(outcome: Result<SubscriptionState>) -> Self {
        Self {
            inner: NotificationInner::Ready(Some(outcome)),
        }
    }

    fn pending(rx: oneshot::Receiver<Result<SubscriptionState>>) -> Self {
        Self {
            inner: NotificationInner::Pending(rx),
        }
    }
}

impl Future for StateChangeNotification {
    type Output = Result<SubscriptionState>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.inner {
            NotificationInner::Ready(slot) => {
                Poll::Ready(slot.take().expect("StateChangeNotification polled after completion"))
            }
            NotificationInner::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
                Poll::Ready(Err(_)) => Poll::Ready(Err(Error::SubscriptionFailed(
                    "subscription store dropped before this waiter resolved".into(),
                ))),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

struct Waiter {
    target_version: u64,
    target_state: SubscriptionState,
    sender: oneshot::Sender<Result<SubscriptionState>>,
}

/// The versioned query-descriptor catalog (spec §4.6).
pub struct SubscriptionStore {
    group: Group,
    sets_table: TableKey,
    subscriptions_table: TableKey,
    waiters: Mutex<Vec<Waiter>>,
}

impl SubscriptionStore {
    fn sets_schema() -> Schema {
        Schema {
            columns: vec![
                ColumnSpec { name: "state".into(), col_type: ColumnType::Int },
                ColumnSpec { name: "error".into(), col_type: ColumnType::String },
                ColumnSpec { name: "created_at".into(), col_type: ColumnType::Timestamp },
                ColumnSpec { name: "updated_at".into(), col_type: ColumnType::Timestamp },
                ColumnSpec { name: "subscription_ids".into(), col_type: ColumnType::Binary },
            ],
        }
    }

    fn subscriptions_schema() -> Schema {
        Schema {
            columns: vec![
                ColumnSpec { name: "id".into(), col_type: ColumnType::Binary },
                ColumnSpec { name: "name".into(), col_type: ColumnType::String },
                ColumnSpec { name: "object_class_name".into(), col_type: ColumnType::String },
                ColumnSpec { name: "query_string".into(), col_type: ColumnType::String },
                ColumnSpec { name: "created_at".into(), col_type: ColumnType::Timestamp },
                ColumnSpec { name: "updated_at".into(), col_type: ColumnType::Timestamp },
            ],
        }
    }

    /// Open (creating the two backing tables on first use) the store
    /// layered over `group`.
    pub fn open(mut group: Group) -> Result<Self> {
        let sets_table = match group.find_table(SETS_TABLE) {
            Some(k) => k,
            None => group.create_table(SETS_TABLE, Self::sets_schema())?,
        };
        let subscriptions_table = match group.find_table(SUBSCRIPTIONS_TABLE) {
            Some(k) => k,
            None => group.create_table(SUBSCRIPTIONS_TABLE, Self::subscriptions_schema())?,
        };
        Ok(Self {
            group,
            sets_table,
            subscriptions_table,
            waiters: Mutex::new(Vec::new()),
        })
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn group_mut(&mut self) -> &mut Group {
        &mut self.group
    }

    /// Flush the store's in-memory edits to durable storage. A thin
    /// passthrough to [`Group::commit`] -- this module never manages
    /// file durability itself, it only arranges rows inside tables the
    /// commit writer (component E) already knows how to relocate.
    pub fn flush(&mut self) -> Result<crate::commit::CommitStats> {
        self.group.commit()
    }

    fn all_versions(&self) -> Result<Vec<u64>> {
        let mut versions: Vec<u64> = self
            .group
            .cluster_tree(self.sets_table)?
            .keys(self.group.alloc())?
            .into_iter()
            .map(|k| k.0 as u64)
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    fn decode_subscription(&self, key: ObjKey) -> Result<Subscription> {
        let tree = self.group.cluster_tree(self.subscriptions_table)?;
        let row = tree.get_row(self.group.alloc(), key)?;
        let id_bytes = binary_or_empty(&row[0])?;
        let id = u128::from_le_bytes(id_bytes.try_into().map_err(|_| {
            Error::InvalidDatabase("subscription id cell was not 16 bytes".into())
        })?);
        Ok(Subscription {
            id,
            name: string_or_none(&row[1])?,
            object_class_name: required_string(&row[2])?,
            query_string: required_string(&row[3])?,
            created_at: required_timestamp(&row[4])?,
            last_update_timestamp: required_timestamp(&row[5])?,
        })
    }

    fn decode_set(&self, version: u64, row: Vec<Value>) -> Result<SubscriptionSet> {
        let state = SubscriptionState::decode(required_int(&row[0])?)?;
        let error_string = string_or_none(&row[1])?;
        let created_at = required_timestamp(&row[2])?;
        let last_update_timestamp = required_timestamp(&row[3])?;
        let ids = decode_key_list(&binary_or_empty(&row[4])?);
        let subscriptions = ids
            .into_iter()
            .map(|k| self.decode_subscription(k))
            .collect::<Result<Vec<_>>>()?;
        Ok(SubscriptionSet {
            version,
            state,
            error_string,
            created_at,
            last_update_timestamp,
            subscriptions,
        })
    }

    /// Snapshot of one version, or `None` if it was never committed (or has
    /// since been erased by [`Self::terminate`]).
    pub fn get_by_version(&self, version: u64) -> Result<Option<SubscriptionSet>> {
        let tree = self.group.cluster_tree(self.sets_table)?;
        let key = ObjKey(version as i64);
        if !tree.contains(self.group.alloc(), key)? {
            return Ok(None);
        }
        let row = tree.get_row(self.group.alloc(), key)?;
        Ok(Some(self.decode_set(version, row)?))
    }

    /// The highest committed (`Pending` or later) version.
    pub fn get_latest(&self) -> Result<Option<SubscriptionSet>> {
        for v in self.all_versions()?.into_iter().rev() {
            let set = self.get_by_version(v)?.expect("version came from keys()");
            if set.state != SubscriptionState::Uncommitted {
                return Ok(Some(set));
            }
        }
        Ok(None)
    }

    /// The highest version currently `Complete` -- per spec §3, only one
    /// set is ever active at a time.
    pub fn get_active(&self) -> Result<Option<SubscriptionSet>> {
        for v in self.all_versions()?.into_iter().rev() {
            let set = self.get_by_version(v)?.expect("version came from keys()");
            if set.state == SubscriptionState::Complete {
                return Ok(Some(set));
            }
        }
        Ok(None)
    }

    /// The smallest version strictly greater than `after` that is
    /// `Pending` or `Bootstrapping` -- the uploader's enumeration primitive
    /// (spec §4.6).
    pub fn get_next_pending_version(&self, after: u64) -> Result<Option<SubscriptionSet>> {
        for v in self.all_versions()? {
            if v <= after {
                continue;
            }
            let set = self.get_by_version(v)?.expect("version came from keys()");
            if matches!(set.state, SubscriptionState::Pending | SubscriptionState::Bootstrapping) {
                return Ok(Some(set));
            }
        }
        Ok(None)
    }

    /// Object-class-names referenced by the latest set's subscriptions
    /// (spec §4.6) -- callers use this to skip schema work for tables no
    /// subscription currently mentions.
    pub fn get_tables_for_latest(&self) -> Result<std::collections::HashSet<String>> {
        Ok(self
            .get_latest()?
            .map(|set| set.subscriptions.into_iter().map(|s| s.object_class_name).collect())
            .unwrap_or_default())
    }

    /// Begin a new `Uncommitted` set, seeded with a copy of the latest
    /// committed set's subscriptions (or empty, if none exists yet).
    pub fn make_mutable_copy(&mut self) -> Result<MutableSubscriptionSet<'_>> {
        let subscriptions = self.get_latest()?.map(|s| s.subscriptions).unwrap_or_default();
        Ok(MutableSubscriptionSet {
            store: self,
            version: None,
            state: SubscriptionState::Uncommitted,
            subscriptions,
            consumed: false,
        })
    }

    /// A write-cursor onto an already-committed version, for
    /// [`MutableSubscriptionSet::update_state`]. Does not permit editing
    /// the subscription list -- per spec §3, committed sets are immutable;
    /// editing the list itself always goes through [`Self::make_mutable_copy`].
    pub fn get_mutable_by_version(&mut self, version: u64) -> Result<MutableSubscriptionSet<'_>> {
        let set = self
            .get_by_version(version)?
            .ok_or(Error::InvalidKey(ObjKey(version as i64)))?;
        Ok(MutableSubscriptionSet {
            store: self,
            version: Some(version),
            state: set.state,
            subscriptions: set.subscriptions,
            consumed: false,
        })
    }

    fn next_version(&self) -> Result<u64> {
        Ok(self.all_versions()?.into_iter().max().map(|m| m + 1).unwrap_or(1))
    }

    fn insert_subscription_rows(&mut self, subs: &[Subscription]) -> Result<Vec<ObjKey>> {
        let table = self.subscriptions_table;
        let mut ids = Vec::with_capacity(subs.len());
        self.group.with_table_mut(table, |alloc, tree| {
            for sub in subs {
                let key = next_key(tree, alloc)?;
                tree.insert(
                    alloc,
                    key,
                    &[
                        Value::Binary(sub.id.to_le_bytes().to_vec()),
                        sub.name.clone().map(Value::String).unwrap_or(Value::Null),
                        Value::String(sub.object_class_name.clone()),
                        Value::String(sub.query_string.clone()),
                        Value::Timestamp(sub.created_at),
                        Value::Timestamp(sub.last_update_timestamp),
                    ],
                )?;
                ids.push(key);
            }
            Ok(())
        })?;
        Ok(ids)
    }

    fn write_new_set(
        &mut self,
        version: u64,
        state: SubscriptionState,
        created_at: i64,
        updated_at: i64,
        subs: &[Subscription],
    ) -> Result<()> {
        let ids = self.insert_subscription_rows(subs)?;
        let table = self.sets_table;
        self.group.with_table_mut(table, |alloc, tree| {
            tree.insert(
                alloc,
                ObjKey(version as i64),
                &[
                    Value::Int(state.encode()),
                    Value::Null,
                    Value::Timestamp(created_at),
                    Value::Timestamp(updated_at),
                    Value::Binary(encode_key_list(&ids)),
                ],
            )
        })
    }

    /// Overwrite only `state`/`error`/`updated_at` on an existing row,
    /// preserving its `created_at` and subscription-list columns exactly.
    fn write_set_state(
        &mut self,
        version: u64,
        state: SubscriptionState,
        error: Option<String>,
        updated_at: i64,
    ) -> Result<()> {
        let key = ObjKey(version as i64);
        let existing = {
            let tree = self.group.cluster_tree(self.sets_table)?;
            tree.get_row(self.group.alloc(), key)?
        };
        let created_at = existing[2].clone();
        let ids_cell = existing[4].clone();
        let table = self.sets_table;
        self.group.with_table_mut(table, |alloc, tree| {
            tree.set_row(
                alloc,
                key,
                &[
                    Value::Int(state.encode()),
                    error.map(Value::String).unwrap_or(Value::Null),
                    created_at,
                    Value::Timestamp(updated_at),
                    ids_cell,
                ],
            )
        })
    }

    /// Spec §3 invariant: "only one committed `SubscriptionSet` is active
    /// ... all older Complete sets are Superseded." Run whenever a set
    /// reaches `Complete`: every strictly-older set not already `Error`
    /// (a terminal failure is left alone) moves to `Superseded`.
    fn supersede_older_sets(&mut self, new_version: u64, now: i64) -> Result<()> {
        for v in self.all_versions()? {
            if v >= new_version {
                continue;
            }
            let set = self.get_by_version(v)?.expect("version came from keys()");
            if matches!(set.state, SubscriptionState::Error | SubscriptionState::Superseded) {
                continue;
            }
            self.write_set_state(v, SubscriptionState::Superseded, set.error_string.clone(), now)?;
        }
        Ok(())
    }

    fn rank(state: SubscriptionState) -> u8 {
        state.rank()
    }

    /// Resolve every waiter registered against `version` whose target is
    /// at or below `new_state`'s rank, or -- if `new_state` is `Error` --
    /// every waiter on `version` unconditionally (spec §4.6).
    fn resolve_waiters(waiters: &Mutex<Vec<Waiter>>, version: u64, new_state: SubscriptionState, error: Option<&str>) {
        let mut guard = waiters.lock();
        let drained: Vec<Waiter> = guard.drain(..).collect();
        let mut remaining = Vec::with_capacity(drained.len());
        for w in drained {
            if w.target_version != version {
                remaining.push(w);
                continue;
            }
            let fires = new_state == SubscriptionState::Error || Self::rank(new_state) >= Self::rank(w.target_state);
            if fires {
                let outcome = if new_state == SubscriptionState::Error {
                    Err(Error::SubscriptionFailed(error.unwrap_or_default().to_string()))
                } else {
                    Ok(new_state)
                };
                let _ = w.sender.send(outcome);
            } else {
                remaining.push(w);
            }
        }
        *guard = remaining;
    }

    /// Every waiter on a strictly-older version resolves with `Superseded`
    /// the instant `new_version` reaches `Complete`, regardless of what
    /// state it was waiting for (spec §4.6).
    fn supersede_waiters(waiters: &Mutex<Vec<Waiter>>, new_version: u64) {
        let mut guard = waiters.lock();
        let drained: Vec<Waiter> = guard.drain(..).collect();
        let mut remaining = Vec::with_capacity(drained.len());
        for w in drained {
            if w.target_version < new_version {
                let _ = w.sender.send(Ok(SubscriptionState::Superseded));
            } else {
                remaining.push(w);
            }
        }
        *guard = remaining;
    }

    /// Register (or immediately resolve) a waiter for `version` reaching
    /// `target_state` (spec §4.6).
    pub fn get_state_change_notification(
        &self,
        version: u64,
        target_state: SubscriptionState,
    ) -> Result<StateChangeNotification> {
        let current = self
            .get_by_version(version)?
            .ok_or(Error::InvalidKey(ObjKey(version as i64)))?;
        if current.state == SubscriptionState::Error {
            return Ok(StateChangeNotification::ready(Err(Error::SubscriptionFailed(
                current.error_string.unwrap_or_default(),
            ))));
        }
        if current.state == SubscriptionState::Superseded {
            return Ok(StateChangeNotification::ready(Ok(SubscriptionState::Superseded)));
        }
        if Self::rank(current.state) >= Self::rank(target_state) {
            return Ok(StateChangeNotification::ready(Ok(current.state)));
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push(Waiter {
            target_version: version,
            target_state,
            sender: tx,
        });
        Ok(StateChangeNotification::pending(rx))
    }

    /// Resolve every outstanding waiter with `Superseded` and erase every
    /// set (and its subscription rows) this store holds (spec §4.6).
    pub fn terminate(&mut self) -> Result<()> {
        warn!("terminating subscription store: resolving all waiters as superseded");
        {
            let mut guard = self.waiters.lock();
            for w in guard.drain(..) {
                let _ = w.sender.send(Ok(SubscriptionState::Superseded));
            }
        }
        for v in self.all_versions()? {
            self.erase_set(v)?;
        }
        Ok(())
    }

    /// Resolve every outstanding waiter with `reason` as a
    /// [`Error::SubscriptionFailed`], without altering any persisted state
    /// (spec §4.6) -- distinct from [`Self::terminate`], which also erases
    /// the sets.
    pub fn notify_all_state_change_notifications(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut guard = self.waiters.lock();
        for w in guard.drain(..) {
            let _ = w.sender.send(Err(Error::SubscriptionFailed(reason.clone())));
        }
    }

    fn erase_set(&mut self, version: u64) -> Result<()> {
        let key = ObjKey(version as i64);
        let ids = {
            let tree = self.group.cluster_tree(self.sets_table)?;
            let row = tree.get_row(self.group.alloc(), key)?;
            decode_key_list(&binary_or_empty(&row[4])?)
        };
        let subs_table = self.subscriptions_table;
        self.group.with_table_mut(subs_table, |alloc, tree| {
            let mut cascade = CascadeState::default();
            for id in &ids {
                tree.erase(alloc, *id, &mut cascade)?;
            }
            Ok(())
        })?;
        let sets_table = self.sets_table;
        self.group.with_table_mut(sets_table, |alloc, tree| {
            let mut cascade = CascadeState::default();
            tree.erase(alloc, key, &mut cascade)
        })
    }
}

fn required_timestamp(value: &Value) -> Result<i64> {
    match value {
        Value::Timestamp(t) => Ok(*t),
        other => Err(Error::IllegalType(format!("expected Timestamp cell, found {other:?}"))),
    }
}

/// Write-cursor produced by [`SubscriptionStore::make_mutable_copy`] (a
/// fresh, not-yet-committed set) or [`SubscriptionStore::get_mutable_by_version`]
/// (an existing committed set, for [`Self::update_state`] only).
pub struct MutableSubscriptionSet<'s> {
    store: &'s mut SubscriptionStore,
    version: Option<u64>,
    state: SubscriptionState,
    subscriptions: Vec<Subscription>,
    consumed: bool,
}

impl<'s> MutableSubscriptionSet<'s> {
    fn ensure_editable(&self) -> Result<()> {
        if self.consumed {
            return Err(Error::IllegalCombination(
                "mutable subscription-set cursor used after commit()/update_state() returned".into(),
            ));
        }
        if self.version.is_some() {
            return Err(Error::IllegalCombination(
                "cannot edit the subscription list of an already-committed set; call make_mutable_copy() for a new version".into(),
            ));
        }
        Ok(())
    }

    /// Anonymous inserts (`name: None`) always create a new entry (spec
    /// §4.6); named inserts update the existing entry with that name in
    /// place, preserving its `id`. Returns the entry's position and
    /// whether it was freshly inserted.
    pub fn insert_or_assign(
        &mut self,
        name: Option<String>,
        object_class_name: impl Into<String>,
        query_string: impl Into<String>,
        now: i64,
    ) -> Result<(usize, bool)> {
        self.ensure_editable()?;
        let object_class_name = object_class_name.into();
        let query_string = query_string.into();

        if let Some(name) = &name {
            if let Some(idx) = self
                .subscriptions
                .iter()
                .position(|s| s.name.as_deref() == Some(name.as_str()))
            {
                let id = self.subscriptions[idx].id;
                let created_at = self.subscriptions[idx].created_at;
                self.subscriptions[idx] = Subscription {
                    id,
                    name: Some(name.clone()),
                    object_class_name,
                    query_string,
                    created_at,
                    last_update_timestamp: now,
                };
                return Ok((idx, false));
            }
        }

        let id = new_subscription_id();
        self.subscriptions.push(Subscription {
            id,
            name,
            object_class_name,
            query_string,
            created_at: now,
            last_update_timestamp: now,
        });
        Ok((self.subscriptions.len() - 1, true))
    }

    /// Erase the named subscription, if present. Anonymous subscriptions
    /// can't be targeted by name (spec §3: "anonymous subscriptions are
    /// always distinct objects") -- erase them by filtering `subscriptions()`
    /// and calling [`Self::clear`] plus re-inserting, or extend this type
    /// with an id-keyed erase if that access pattern is needed.
    pub fn erase(&mut self, name: &str) -> Result<bool> {
        self.ensure_editable()?;
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.name.as_deref() != Some(name));
        Ok(self.subscriptions.len() != before)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.ensure_editable()?;
        self.subscriptions.clear();
        Ok(())
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Transition `Uncommitted -> Pending`, assign the next version, and
    /// persist the subscription list (spec §4.6). Only valid on a cursor
    /// from [`SubscriptionStore::make_mutable_copy`].
    pub fn commit(mut self, now: i64) -> Result<SubscriptionSet> {
        if self.consumed {
            return Err(Error::IllegalCombination(
                "mutable subscription-set cursor used after commit()/update_state() returned".into(),
            ));
        }
        if self.version.is_some() {
            return Err(Error::IllegalCombination(
                "commit() is only valid on a fresh copy from make_mutable_copy()".into(),
            ));
        }
        let version = self.store.next_version()?;
        self.store
            .write_new_set(version, SubscriptionState::Pending, now, now, &self.subscriptions)?;
        self.consumed = true;
        info!(version, subscriptions = self.subscriptions.len(), "subscription set committed as pending");
        Ok(SubscriptionSet {
            version,
            state: SubscriptionState::Pending,
            error_string: None,
            created_at: now,
            last_update_timestamp: now,
            subscriptions: std::mem::take(&mut self.subscriptions),
        })
    }

    /// Transition an already-committed set's state (spec §4.6). Only valid
    /// on a cursor from [`SubscriptionStore::get_mutable_by_version`].
    pub fn update_state(mut self, new_state: SubscriptionState, error: Option<String>, now: i64) -> Result<SubscriptionSet> {
        if self.consumed {
            return Err(Error::IllegalCombination(
                "mutable subscription-set cursor used after commit()/update_state() returned".into(),
            ));
        }
        let version = self
            .version
            .ok_or_else(|| Error::IllegalCombination("update_state() requires a cursor from get_mutable_by_version()".into()))?;
        validate_transition(self.state, new_state)?;

        self.store.write_set_state(version, new_state, error.clone(), now)?;
        if new_state == SubscriptionState::Complete {
            self.store.supersede_older_sets(version, now)?;
        }
        SubscriptionStore::resolve_waiters(&self.store.waiters, version, new_state, error.as_deref());
        if new_state == SubscriptionState::Complete {
            SubscriptionStore::supersede_waiters(&self.store.waiters, version);
        }
        self.consumed = true;
        info!(version, ?new_state, "subscription set state updated");
        self.store
            .get_by_version(version)?
            .ok_or_else(|| Error::LogicError("set vanished immediately after its own state update".into()))
    }
}

fn new_subscription_id() -> u128 {
    rand::random::<u128>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::mem::SlabAlloc;

    fn store() -> SubscriptionStore {
        let group = Group::create(SlabAlloc::open_buffer(vec![0u8; 24], DatabaseConfig::in_memory())).unwrap();
        SubscriptionStore::open(group).unwrap()
    }

    /// S4: empty store -> commit v1 -> commit v2 -> mark v2 Complete ->
    /// `get_active().version() == 2`, `get_by_version(1).state() == Superseded`.
    #[test]
    fn s4_subscription_versions() {
        let mut store = store();
        assert!(store.get_latest().unwrap().is_none());

        let mut m1 = store.make_mutable_copy().unwrap();
        m1.insert_or_assign(Some("a".into()), "Table", "TRUEPREDICATE", 1).unwrap();
        let v1 = m1.commit(1).unwrap();
        assert_eq!(v1.version, 1);

        let mut m2 = store.make_mutable_copy().unwrap();
        m2.insert_or_assign(Some("b".into()), "Table", "TRUEPREDICATE", 2).unwrap();
        let v2 = m2.commit(2).unwrap();
        assert_eq!(v2.version, 2);
        // make_mutable_copy() seeded from the latest (v1)'s subscriptions.
        assert_eq!(v2.subscriptions.len(), 2);

        let cursor = store.get_mutable_by_version(2).unwrap();
        cursor.update_state(SubscriptionState::Complete, None, 3).unwrap();

        assert_eq!(store.get_active().unwrap().unwrap().version, 2);
        assert_eq!(
            store.get_by_version(1).unwrap().unwrap().state,
            SubscriptionState::Superseded
        );
    }

    /// S5: register a v1 waiter, mark v2 Complete first -> v1's waiter
    /// resolves `Superseded`; a v2 waiter registered after resolves `Complete`.
    #[tokio::test]
    async fn s5_subscription_notification() {
        let mut store = store();
        let mut m1 = store.make_mutable_copy().unwrap();
        m1.insert_or_assign(None, "Table", "TRUEPREDICATE", 1).unwrap();
        m1.commit(1).unwrap();
        let mut m2 = store.make_mutable_copy().unwrap();
        m2.insert_or_assign(None, "Table", "TRUEPREDICATE", 2).unwrap();
        m2.commit(2).unwrap();

        let waiter_v1 = store
            .get_state_change_notification(1, SubscriptionState::Complete)
            .unwrap();

        let cursor = store.get_mutable_by_version(2).unwrap();
        cursor.update_state(SubscriptionState::Complete, None, 3).unwrap();

        assert_eq!(waiter_v1.await.unwrap(), SubscriptionState::Superseded);

        let waiter_v2 = store
            .get_state_change_notification(2, SubscriptionState::Complete)
            .unwrap();
        assert_eq!(waiter_v2.await.unwrap(), SubscriptionState::Complete);
    }

    #[tokio::test]
    async fn error_state_resolves_waiters_with_subscription_failed() {
        let mut store = store();
        let mut m1 = store.make_mutable_copy().unwrap();
        m1.insert_or_assign(None, "Table", "TRUEPREDICATE", 1).unwrap();
        m1.commit(1).unwrap();

        let waiter = store
            .get_state_change_notification(1, SubscriptionState::Complete)
            .unwrap();
        let cursor = store.get_mutable_by_version(1).unwrap();
        cursor
            .update_state(SubscriptionState::Error, Some("server rejected query".into()), 2)
            .unwrap();

        match waiter.await {
            Err(Error::SubscriptionFailed(msg)) => assert_eq!(msg, "server rejected query"),
            other => panic!("expected SubscriptionFailed, got {other:?}"),
        }
    }

    #[test]
    fn named_insert_preserves_id_across_edits() {
        let mut store = store();
        let mut m1 = store.make_mutable_copy().unwrap();
        m1.insert_or_assign(Some("q".into()), "Table", "a > 0", 1).unwrap();
        let id = m1.subscriptions()[0].id;
        let v1 = m1.commit(1).unwrap();
        assert_eq!(v1.subscriptions[0].id, id);

        let mut m2 = store.make_mutable_copy().unwrap();
        m2.insert_or_assign(Some("q".into()), "Table", "a > 1", 2).unwrap();
        let v2 = m2.commit(2).unwrap();
        assert_eq!(v2.subscriptions.len(), 1);
        assert_eq!(v2.subscriptions[0].id, id);
        assert_eq!(v2.subscriptions[0].query_string, "a > 1");
    }

    #[test]
    fn terminate_resolves_waiters_and_erases_sets() {
        let mut store = store();
        let mut m1 = store.make_mutable_copy().unwrap();
        m1.insert_or_assign(None, "Table", "TRUEPREDICATE", 1).unwrap();
        m1.commit(1).unwrap();
        store.terminate().unwrap();
        assert!(store.get_by_version(1).unwrap().is_none());
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut store = store();
        let mut m1 = store.make_mutable_copy().unwrap();
        m1.insert_or_assign(None, "Table", "TRUEPREDICATE", 1).unwrap();
        m1.commit(1).unwrap();
        let cursor = store.get_mutable_by_version(1).unwrap();
        assert!(matches!(
            cursor.update_state(SubscriptionState::AwaitingMark, None, 2),
            Err(Error::IllegalCombination(_))
        ));
    }
}
