//! Natural-key reconciliation of backup entities against a live store.
//!
//! Each reconciled collection is matched by its natural key, case-insensitively.
//! When a backup row matches a live row under a different id, the backup id is
//! relabeled to the live id throughout the envelope before anything is written.
//! All substitutions of one collection are applied together, so a live id that is
//! also another backup row's id is never rewritten a second time.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::TableName;
use crate::context::RestoreContext;
use crate::envelope::Envelope;
use crate::relabel::IdMap;
use crate::restore::RestoreError;
use crate::store::{StoreFailure, TableStore};
use crate::Record;

/// Which parts of the envelope an id substitution rewrites.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RelabelScan {
    /// Only fields declared as references to the reconciled table, plus the
    /// entity's own `id`.
    #[default]
    Declared,
    /// Every string and map key in every table.
    Everywhere,
}

impl RelabelScan {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Declared => "declared",
            Self::Everywhere => "everywhere",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "declared" => Some(Self::Declared),
            "everywhere" => Some(Self::Everywhere),
            _ => None,
        }
    }
}

/// What to do when several backup rows resolve to one live id.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Relabel them all; the last one written wins. Logged as a warning.
    #[default]
    LastWins,
    /// Abort before any write.
    Reject,
}

impl CollisionPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LastWins => "last_wins",
            Self::Reject => "reject",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "last_wins" | "last-wins" => Some(Self::LastWins),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IdSubstitution {
    pub table: TableName,
    pub natural_key: String,
    pub old_id: String,
    pub new_id: String,
    /// Positions rewritten across the envelope, the entity's own id included.
    pub rewrites: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CollisionKind {
    /// Several backup rows match the same live row.
    SharedLiveRow,
    /// A backup row without a live match already uses the id another backup row is
    /// relabeled to.
    IdTakeover,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Collision {
    pub table: TableName,
    pub kind: CollisionKind,
    pub live_id: String,
    /// For [`CollisionKind::IdTakeover`] the unmatched row's id comes last.
    pub backup_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReconcileReport {
    pub substitutions: Vec<IdSubstitution>,
    pub collisions: Vec<Collision>,
    /// Collections whose live lookup was denied.
    pub skipped: Vec<TableName>,
}

impl ReconcileReport {
    /// `(table, backup id) -> live id`.
    #[must_use]
    pub fn id_map(&self) -> BTreeMap<(TableName, String), String> {
        self.substitutions
            .iter()
            .map(|sub| ((sub.table, sub.old_id.clone()), sub.new_id.clone()))
            .collect()
    }
}

struct Match {
    index: usize,
    natural_key: String,
    backup_id: Option<String>,
    live_id: String,
}

/// Reconcile every natural-keyed collection, in [`TableName::RECONCILE_ORDER`].
///
/// # Errors
/// Returns [`RestoreError::Lookup`] when a live lookup fails for a reason other
/// than a permission denial, and [`RestoreError::AmbiguousMatch`] under
/// [`CollisionPolicy::Reject`] when two backup rows resolve to one live row.
pub async fn reconcile<S: TableStore>(
    envelope: &mut Envelope,
    store: &S,
    scan: RelabelScan,
    policy: CollisionPolicy,
    context: &mut RestoreContext,
) -> Result<ReconcileReport, RestoreError> {
    let mut report = ReconcileReport::default();

    for table in TableName::RECONCILE_ORDER {
        let Some(key_field) = table.descriptor().natural_key else {
            continue;
        };
        if envelope.rows(table).is_empty() {
            continue;
        }

        let live_rows = match store.fetch_all(table).await {
            Ok(rows) => rows,
            Err(error) if error.failure() == StoreFailure::PermissionDenied => {
                context.warn(format!("Cannot read live {table} ({error}); keeping backup ids"));
                report.skipped.push(table);
                continue;
            }
            Err(source) => return Err(RestoreError::Lookup { table, source }),
        };
        let live_ids = live_index(&live_rows, key_field);
        tracing::debug!(%table, live = live_ids.len(), "loaded live natural keys");

        let matches = find_matches(envelope.rows(table), key_field, &live_ids);
        let mut flagged = collisions(table, &matches);
        flagged.extend(id_takeovers(table, envelope.rows(table), &matches));
        for collision in flagged {
            if policy == CollisionPolicy::Reject {
                return Err(RestoreError::AmbiguousMatch {
                    table,
                    live_id: collision.live_id,
                    backup_ids: collision.backup_ids,
                });
            }
            context.warn(collision_warning(&collision));
            report.collisions.push(collision);
        }

        let mut ids = IdMap::new();
        let mut pending = Vec::new();
        for matched in matches {
            if matched.backup_id.as_deref() == Some(matched.live_id.as_str()) {
                continue;
            }
            if let Some(old_id) = &matched.backup_id {
                ids.insert(old_id.clone(), matched.live_id.clone());
            }
            pending.push(matched);
        }
        let rewritten = relabel_envelope(envelope, table, &mut ids, scan);
        tracing::debug!(%table, rewritten, "applied id substitutions");

        let substituted = pending.len();
        for matched in pending {
            let own_id = set_own_id(envelope, table, matched.index, &matched.live_id);
            let rewrites = matched.backup_id.as_deref().map_or(0, |old_id| ids.rewrites(old_id));
            report.substitutions.push(IdSubstitution {
                table,
                natural_key: matched.natural_key,
                old_id: matched.backup_id.unwrap_or_default(),
                new_id: matched.live_id,
                rewrites: rewrites + usize::from(own_id),
            });
        }
        context.info(format!("Reconciled {table}: {substituted} id substitution(s)"));
    }

    Ok(report)
}

fn natural_key(row: &Record, key_field: &str) -> Option<String> {
    let key = row.get(key_field)?.as_str()?.trim();
    (!key.is_empty()).then(|| key.to_lowercase())
}

/// Lowercased natural key to live id; the first live row with a key wins.
fn live_index(rows: &[Record], key_field: &str) -> HashMap<String, String> {
    let mut index = HashMap::with_capacity(rows.len());
    for row in rows {
        let (Some(key), Some(id)) = (natural_key(row, key_field), row.get("id").and_then(Value::as_str))
        else {
            continue;
        };
        index.entry(key).or_insert_with(|| id.to_string());
    }
    index
}

fn find_matches(rows: &[Record], key_field: &str, live_ids: &HashMap<String, String>) -> Vec<Match> {
    rows.iter()
        .enumerate()
        .filter_map(|(index, row)| {
            let natural_key = natural_key(row, key_field)?;
            let live_id = live_ids.get(&natural_key)?.clone();
            let backup_id = row.get("id").and_then(Value::as_str).map(str::to_string);
            Some(Match { index, natural_key, backup_id, live_id })
        })
        .collect()
}

fn collisions(table: TableName, matches: &[Match]) -> Vec<Collision> {
    let mut by_live: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for matched in matches {
        let backup_id = matched.backup_id.clone().unwrap_or_default();
        let ids = by_live.entry(matched.live_id.as_str()).or_default();
        if !ids.contains(&backup_id) {
            ids.push(backup_id);
        }
    }
    by_live
        .into_iter()
        .filter(|(_, backup_ids)| backup_ids.len() > 1)
        .map(|(live_id, backup_ids)| Collision {
            table,
            kind: CollisionKind::SharedLiveRow,
            live_id: live_id.to_string(),
            backup_ids,
        })
        .collect()
}

/// Unmatched backup rows whose id is the live id some other backup row is being
/// relabeled to. Left alone, both rows would be upserted under one id.
fn id_takeovers(table: TableName, rows: &[Record], matches: &[Match]) -> Vec<Collision> {
    let matched: HashSet<usize> = matches.iter().map(|matched| matched.index).collect();
    let mut incoming: HashMap<&str, Vec<String>> = HashMap::new();
    for matched in matches {
        if matched.backup_id.as_deref() != Some(matched.live_id.as_str()) {
            incoming
                .entry(matched.live_id.as_str())
                .or_default()
                .push(matched.backup_id.clone().unwrap_or_default());
        }
    }

    rows.iter()
        .enumerate()
        .filter(|(index, _)| !matched.contains(index))
        .filter_map(|(_, row)| {
            let id = row.get("id").and_then(Value::as_str)?;
            let mut backup_ids = incoming.get(id)?.clone();
            backup_ids.push(id.to_string());
            Some(Collision { table, kind: CollisionKind::IdTakeover, live_id: id.to_string(), backup_ids })
        })
        .collect()
}

fn collision_warning(collision: &Collision) -> String {
    let Collision { table, kind, live_id, backup_ids } = collision;
    match kind {
        CollisionKind::SharedLiveRow => format!(
            "{table}: backup ids {} all match live id {live_id}; the last one wins",
            backup_ids.join(", ")
        ),
        CollisionKind::IdTakeover => {
            let relabeled = &backup_ids[..backup_ids.len().saturating_sub(1)];
            format!(
                "{table}: backup id {live_id} has no live match but {} is relabeled onto it; \
                 the last one wins",
                relabeled.join(", ")
            )
        }
    }
}

fn relabel_envelope(
    envelope: &mut Envelope,
    target: TableName,
    ids: &mut IdMap,
    scan: RelabelScan,
) -> usize {
    if ids.is_empty() {
        return 0;
    }
    let mut rewrites = 0;
    for (table, rows) in &mut envelope.tables {
        match scan {
            RelabelScan::Declared => {
                let fields: Vec<&str> = table.descriptor().references_to(target).collect();
                if fields.is_empty() {
                    continue;
                }
                for row in rows.iter_mut() {
                    for field in &fields {
                        if let Some(value) = row.get_mut(*field) {
                            rewrites += ids.apply(value);
                        }
                    }
                }
            }
            RelabelScan::Everywhere => {
                for row in rows.iter_mut() {
                    let mut value = Value::Object(std::mem::take(row));
                    rewrites += ids.apply(&mut value);
                    if let Value::Object(relabeled) = value {
                        *row = relabeled;
                    }
                }
            }
        }
    }
    rewrites
}

/// Point the matched row at its live id. Returns whether the field changed.
fn set_own_id(envelope: &mut Envelope, table: TableName, index: usize, live_id: &str) -> bool {
    let Some(row) = envelope.tables.get_mut(&table).and_then(|rows| rows.get_mut(index)) else {
        return false;
    };
    if row.get("id").and_then(Value::as_str) == Some(live_id) {
        return false;
    }
    row.insert("id".to_string(), Value::String(live_id.to_string()));
    true
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::store::{MemoryStore, StoreError};

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture is not an object: {other}"),
        }
    }

    fn envelope(tables: Value) -> Envelope {
        let Value::Object(tables) = tables else {
            panic!("fixture is not an object");
        };
        let tables: BTreeMap<TableName, Vec<Record>> = tables
            .into_iter()
            .map(|(name, rows)| {
                let table = TableName::parse(&name).unwrap_or_else(|| panic!("unknown table {name}"));
                let rows = match rows {
                    Value::Array(rows) => rows.into_iter().map(record).collect(),
                    other => panic!("rows are not a list: {other}"),
                };
                (table, rows)
            })
            .collect();
        Envelope::new("test", tables)
    }

    fn live_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.seed(TableName::Roles, [record(json!({ "id": "live-r1", "name": "manager" }))]);
        store.seed(TableName::Departments, [record(json!({ "id": "live-d1", "name": "Flight Ops" }))]);
        store.seed(
            TableName::Staff,
            [record(json!({ "id": "live-s1", "email": "ana@example.com", "name": "Ana" }))],
        );
        store
    }

    fn backup() -> Envelope {
        envelope(json!({
            "roles": [{ "id": "r1", "name": "Manager" }, { "id": "r2", "name": "Dispatcher" }],
            "departments": [{ "id": "d1", "name": " flight ops ", "manager_id": "s1" }],
            "staff": [
                { "id": "s1", "email": "ANA@example.com", "role_id": "r1", "department_id": "d1",
                  "supervisor_id": null, "leave_balances": { "lt1": 3 } },
                { "id": "s2", "email": "ben@example.com", "role_id": "r2", "supervisor_id": "s1",
                  "notes": "r1" }
            ],
            "rosters": [{ "month": "2024-05", "department_id": "d1", "grid": { "s1": { "2024-05-01": "D" } } }]
        }))
    }

    #[tokio::test]
    async fn natural_keys_match_case_insensitively_and_relabel_references() -> Result<(), RestoreError> {
        let store = live_store();
        let mut snapshot = backup();
        let mut context = RestoreContext::new();

        let report = reconcile(
            &mut snapshot,
            &store,
            RelabelScan::Declared,
            CollisionPolicy::LastWins,
            &mut context,
        )
        .await?;

        assert_eq!(report.substitutions.len(), 3);
        assert_eq!(report.substitutions[0].natural_key, "manager");
        let roles = snapshot.rows(TableName::Roles);
        assert_eq!(roles[0]["id"], "live-r1");
        assert_eq!(roles[1]["id"], "r2");

        let staff = snapshot.rows(TableName::Staff);
        assert_eq!(staff[0]["id"], "live-s1");
        assert_eq!(staff[0]["role_id"], "live-r1");
        assert_eq!(staff[0]["department_id"], "live-d1");
        assert_eq!(staff[1]["supervisor_id"], "live-s1");
        assert_eq!(staff[1]["notes"], "r1", "undeclared fields are left alone");

        assert_eq!(snapshot.rows(TableName::Departments)[0]["manager_id"], "live-s1");
        let roster = &snapshot.rows(TableName::Rosters)[0];
        assert_eq!(roster["department_id"], "live-d1");
        assert_eq!(roster["grid"], json!({ "live-s1": { "2024-05-01": "D" } }));

        assert!(context.lines().iter().any(|line| line.ends_with("Reconciled roles: 1 id substitution(s)")));
        Ok(())
    }

    #[tokio::test]
    async fn blind_scan_rewrites_undeclared_fields_too() -> Result<(), RestoreError> {
        let store = live_store();
        let mut snapshot = backup();
        let mut context = RestoreContext::new();

        reconcile(&mut snapshot, &store, RelabelScan::Everywhere, CollisionPolicy::LastWins, &mut context)
            .await?;

        assert_eq!(snapshot.rows(TableName::Staff)[1]["notes"], "live-r1");
        assert_eq!(snapshot.rows(TableName::Staff)[0]["role_id"], "live-r1");
        Ok(())
    }

    #[tokio::test]
    async fn reconciliation_is_deterministic() -> Result<(), RestoreError> {
        let store = live_store();
        let mut first = backup();
        let mut second = backup();

        let a = reconcile(&mut first, &store, RelabelScan::Declared, CollisionPolicy::LastWins, &mut RestoreContext::new())
            .await?;
        let b = reconcile(&mut second, &store, RelabelScan::Declared, CollisionPolicy::LastWins, &mut RestoreContext::new())
            .await?;

        assert_eq!(a.id_map(), b.id_map());
        assert_eq!(first.tables, second.tables);
        Ok(())
    }

    #[tokio::test]
    async fn collisions_warn_or_abort_by_policy() -> Result<(), RestoreError> {
        let store = live_store();
        let colliding = || {
            envelope(json!({
                "roles": [{ "id": "r1", "name": "Manager" }, { "id": "r9", "name": "MANAGER " }]
            }))
        };

        let mut context = RestoreContext::new();
        let mut snapshot = colliding();
        let report =
            reconcile(&mut snapshot, &store, RelabelScan::Declared, CollisionPolicy::LastWins, &mut context)
                .await?;
        assert_eq!(
            report.collisions,
            vec![Collision {
                table: TableName::Roles,
                kind: CollisionKind::SharedLiveRow,
                live_id: "live-r1".to_string(),
                backup_ids: vec!["r1".to_string(), "r9".to_string()],
            }]
        );
        assert_eq!(context.warnings().len(), 1);
        assert!(snapshot.rows(TableName::Roles).iter().all(|row| row["id"] == "live-r1"));

        let mut snapshot = colliding();
        let rejected =
            reconcile(&mut snapshot, &store, RelabelScan::Declared, CollisionPolicy::Reject, &mut RestoreContext::new())
                .await;
        assert!(matches!(
            rejected,
            Err(RestoreError::AmbiguousMatch { table: TableName::Roles, ref live_id, .. }) if live_id == "live-r1"
        ));
        Ok(())
    }

    fn roles_store(roles: Value) -> MemoryStore {
        let store = MemoryStore::new();
        let Value::Array(roles) = roles else {
            panic!("roles fixture is not a list");
        };
        store.seed(TableName::Roles, roles.into_iter().map(record));
        store
    }

    fn crew(roles: Value) -> Envelope {
        envelope(json!({
            "roles": roles,
            "staff": [
                { "id": "s1", "name": "Ana", "role_id": "role-1" },
                { "id": "s2", "name": "Ben", "role_id": "role-2" }
            ]
        }))
    }

    fn ids(rows: &[Record], field: &str) -> Vec<String> {
        rows.iter().map(|row| row[field].as_str().unwrap_or_default().to_string()).collect()
    }

    #[tokio::test]
    async fn chained_ids_keep_references_apart() -> Result<(), RestoreError> {
        let store = roles_store(json!([
            { "id": "role-2", "name": "Captain" },
            { "id": "role-3", "name": "Dispatcher" }
        ]));

        for scan in [RelabelScan::Declared, RelabelScan::Everywhere] {
            let mut snapshot = crew(json!([
                { "id": "role-1", "name": "Captain" },
                { "id": "role-2", "name": "Dispatcher" }
            ]));
            let report =
                reconcile(&mut snapshot, &store, scan, CollisionPolicy::Reject, &mut RestoreContext::new())
                    .await?;

            assert_eq!(ids(snapshot.rows(TableName::Roles), "id"), ["role-2", "role-3"], "{scan:?}");
            assert_eq!(ids(snapshot.rows(TableName::Staff), "role_id"), ["role-2", "role-3"], "{scan:?}");
            assert!(report.collisions.is_empty());
            assert!(report.substitutions.iter().all(|substitution| substitution.rewrites == 2), "{scan:?}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn swapped_ids_trade_places() -> Result<(), RestoreError> {
        let store = roles_store(json!([
            { "id": "role-1", "name": "Dispatcher" },
            { "id": "role-2", "name": "Captain" }
        ]));

        for scan in [RelabelScan::Declared, RelabelScan::Everywhere] {
            let mut snapshot = crew(json!([
                { "id": "role-1", "name": "Captain" },
                { "id": "role-2", "name": "Dispatcher" }
            ]));
            let report =
                reconcile(&mut snapshot, &store, scan, CollisionPolicy::Reject, &mut RestoreContext::new())
                    .await?;

            assert_eq!(ids(snapshot.rows(TableName::Roles), "id"), ["role-2", "role-1"], "{scan:?}");
            assert_eq!(ids(snapshot.rows(TableName::Staff), "role_id"), ["role-2", "role-1"], "{scan:?}");
            assert_eq!(report.substitutions.len(), 2);
        }
        Ok(())
    }

    #[tokio::test]
    async fn relabeling_onto_an_unmatched_backup_id_is_flagged() -> Result<(), RestoreError> {
        let store = roles_store(json!([{ "id": "role-2", "name": "Captain" }]));
        let taken = || {
            crew(json!([
                { "id": "role-1", "name": "Captain" },
                { "id": "role-2", "name": "Dispatcher" }
            ]))
        };

        for scan in [RelabelScan::Declared, RelabelScan::Everywhere] {
            let mut context = RestoreContext::new();
            let mut snapshot = taken();
            let report = reconcile(&mut snapshot, &store, scan, CollisionPolicy::LastWins, &mut context).await?;
            assert_eq!(
                report.collisions,
                vec![Collision {
                    table: TableName::Roles,
                    kind: CollisionKind::IdTakeover,
                    live_id: "role-2".to_string(),
                    backup_ids: vec!["role-1".to_string(), "role-2".to_string()],
                }]
            );
            assert!(
                context.warnings().iter().any(|line| line
                    .contains("backup id role-2 has no live match but role-1 is relabeled onto it")),
                "{scan:?}: {:?}",
                context.warnings()
            );

            let rejected = reconcile(
                &mut taken(),
                &store,
                scan,
                CollisionPolicy::Reject,
                &mut RestoreContext::new(),
            )
            .await;
            assert!(matches!(
                rejected,
                Err(RestoreError::AmbiguousMatch { table: TableName::Roles, ref backup_ids, .. })
                    if backup_ids == &["role-1", "role-2"]
            ));
        }
        Ok(())
    }

    #[tokio::test]
    async fn denied_lookups_skip_and_other_failures_abort() -> Result<(), RestoreError> {
        let store = live_store();
        store.deny_reads(TableName::Roles);
        let mut context = RestoreContext::new();
        let mut snapshot = backup();

        let report =
            reconcile(&mut snapshot, &store, RelabelScan::Declared, CollisionPolicy::LastWins, &mut context)
                .await?;
        assert_eq!(report.skipped, vec![TableName::Roles]);
        assert_eq!(snapshot.rows(TableName::Roles)[0]["id"], "r1");
        assert_eq!(snapshot.rows(TableName::Staff)[0]["id"], "live-s1");
        Ok(())
    }

    #[test]
    fn lookup_failures_name_the_collection() {
        let error = RestoreError::Lookup { table: TableName::Staff, source: StoreError::other("timeout") };
        assert_eq!(error.to_string(), "failed to look up live staff: timeout");
    }
}
