use crate::concurrency::{advance_token, ConcurrencyController, ConflictToken, RecordRef, VersionedWrite};
use crate::error::{Result, StoreError};
use crate::session::SessionBinding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeMap;

const PARTIES: &str = "parties";

/// Whether a party is an individual or an organization. Both share one table
/// and one role set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyKind {
    Person,
    Organization,
}

impl PartyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartyKind::Person => "person",
            PartyKind::Organization => "organization",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Supplier,
    Employee,
    Contact,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Supplier => "supplier",
            Role::Employee => "employee",
            Role::Contact => "contact",
        }
    }
}

/// Where a role applies. Stored as JSON; the `type` field is the
/// discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoleContext {
    Global,
    Organization { party_id: i64 },
    Project { code: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub id: i64,
    pub role: Role,
    pub context: RoleContext,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Party {
    pub id: i64,
    pub kind: PartyKind,
    pub display_name: String,
    pub email: Option<String>,
    pub notes: Option<String>,
    /// Pass back unchanged with the next write to this party.
    pub token: ConflictToken,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub roles: Vec<RoleAssignment>,
}

impl Party {
    pub fn has_role(&self, role: Role, context: &RoleContext) -> bool {
        self.roles
            .iter()
            .any(|r| r.role == role && &r.context == context)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewParty {
    pub kind: PartyKind,
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Field changes for [`PartyStore::update`]. `None` leaves a field alone;
/// `Some(None)` clears a nullable one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartyUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub email: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub notes: Option<Option<String>>,
}

// A present key, null included, is a change; only a missing key is `None`.
fn deserialize_present<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

/// Parties and their roles in the store bound to a session.
///
/// Every mutation runs through the concurrency controller: lock contention
/// is retried, a stale token fails with `Conflict`.
#[derive(Debug, Clone, Default)]
pub struct PartyStore {
    controller: ConcurrencyController,
}

impl PartyStore {
    pub fn new(controller: ConcurrencyController) -> Self {
        Self { controller }
    }

    pub async fn create(&self, binding: &SessionBinding, new: &NewParty) -> Result<Party> {
        let lease = binding.lease().await?;
        let pool = lease.pool();

        let id = self
            .controller
            .run(|| async move {
                let now = Utc::now();
                let id: i64 = sqlx::query_scalar(
                    "INSERT INTO parties
                        (kind, display_name, email, notes, row_version, last_modified, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?)
                     RETURNING id",
                )
                .bind(new.kind.as_str())
                .bind(&new.display_name)
                .bind(&new.email)
                .bind(&new.notes)
                .bind(ConflictToken::INITIAL.value())
                .bind(now)
                .bind(now)
                .fetch_one(pool)
                .await?;
                Ok::<_, StoreError>(id)
            })
            .await?;

        tracing::debug!("Created party {} in {}", id, lease.handle().path());
        self.fetch(pool, id).await
    }

    pub async fn get(&self, binding: &SessionBinding, id: i64) -> Result<Party> {
        let lease = binding.lease().await?;
        self.fetch(lease.pool(), id).await
    }

    pub async fn list(&self, binding: &SessionBinding) -> Result<Vec<Party>> {
        let lease = binding.lease().await?;
        let pool = lease.pool();

        let (party_rows, role_rows) = self
            .controller
            .run(|| async move {
                let parties = sqlx::query(
                    "SELECT id, kind, display_name, email, notes, row_version, created_at, last_modified
                     FROM parties ORDER BY display_name, id",
                )
                .fetch_all(pool)
                .await?;
                let roles = sqlx::query(
                    "SELECT id, party_id, role, context_json, assigned_at
                     FROM party_roles ORDER BY party_id, id",
                )
                .fetch_all(pool)
                .await?;
                Ok::<_, StoreError>((parties, roles))
            })
            .await?;

        let mut roles: BTreeMap<i64, Vec<RoleAssignment>> = BTreeMap::new();
        for row in &role_rows {
            let party_id: i64 = row.try_get("party_id")?;
            roles.entry(party_id).or_default().push(role_from_row(row)?);
        }

        party_rows
            .iter()
            .map(|row| {
                let mut party = party_from_row(row)?;
                party.roles = roles.remove(&party.id).unwrap_or_default();
                Ok(party)
            })
            .collect()
    }

    /// Applies `changes` if the party still carries `expected`.
    pub async fn update(
        &self,
        binding: &SessionBinding,
        id: i64,
        expected: ConflictToken,
        changes: &PartyUpdate,
    ) -> Result<Party> {
        let lease = binding.lease().await?;

        let mut write = VersionedWrite::new(RecordRef::new(PARTIES, id)?, expected);
        if let Some(name) = &changes.display_name {
            write = write.set("display_name", name.as_str())?;
        }
        if let Some(email) = &changes.email {
            write = write.set("email", email.clone())?;
        }
        if let Some(notes) = &changes.notes {
            write = write.set("notes", notes.clone())?;
        }

        let token = self.controller.write_versioned(&lease, &write).await?;
        tracing::debug!("Updated party {} to token {}", id, token);
        self.fetch(lease.pool(), id).await
    }

    /// Adds a role to a party. Counts as a write to the party, so it needs
    /// the party's current token and advances it.
    pub async fn assign_role(
        &self,
        binding: &SessionBinding,
        party_id: i64,
        expected: ConflictToken,
        role: Role,
        context: &RoleContext,
    ) -> Result<(ConflictToken, RoleAssignment)> {
        let lease = binding.lease().await?;
        let pool = lease.pool();
        let record = &RecordRef::new(PARTIES, party_id)?;
        let context_json = &serde_json::to_string(context)?;

        self.controller
            .run(|| async move {
                let mut tx = pool.begin().await?;
                let token = advance_token(&mut *tx, record, expected).await?;

                let assigned_at = Utc::now();
                let id: i64 = sqlx::query_scalar(
                    "INSERT INTO party_roles (party_id, role, context_json, assigned_at)
                     VALUES (?, ?, ?, ?)
                     RETURNING id",
                )
                .bind(party_id)
                .bind(role.as_str())
                .bind(context_json)
                .bind(assigned_at)
                .fetch_one(&mut *tx)
                .await?;
                tx.commit().await?;

                Ok::<_, StoreError>((
                    token,
                    RoleAssignment {
                        id,
                        role,
                        context: context.clone(),
                        assigned_at,
                    },
                ))
            })
            .await
    }

    pub async fn remove_role(
        &self,
        binding: &SessionBinding,
        party_id: i64,
        expected: ConflictToken,
        assignment_id: i64,
    ) -> Result<ConflictToken> {
        let lease = binding.lease().await?;
        let pool = lease.pool();
        let record = &RecordRef::new(PARTIES, party_id)?;

        self.controller
            .run(|| async move {
                let mut tx = pool.begin().await?;
                let token = advance_token(&mut *tx, record, expected).await?;
                let removed = sqlx::query("DELETE FROM party_roles WHERE id = ? AND party_id = ?")
                    .bind(assignment_id)
                    .bind(party_id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                if removed == 0 {
                    return Err(StoreError::RecordNotFound {
                        table: "party_roles".to_string(),
                        key: assignment_id,
                    });
                }
                tx.commit().await?;
                Ok::<_, StoreError>(token)
            })
            .await
    }

    async fn fetch(&self, pool: &sqlx::SqlitePool, id: i64) -> Result<Party> {
        let (row, role_rows) = self
            .controller
            .run(|| async move {
                let row = sqlx::query(
                    "SELECT id, kind, display_name, email, notes, row_version, created_at, last_modified
                     FROM parties WHERE id = ?",
                )
                .bind(id)
                .fetch_optional(pool)
                .await?;
                let roles = sqlx::query(
                    "SELECT id, party_id, role, context_json, assigned_at
                     FROM party_roles WHERE party_id = ? ORDER BY id",
                )
                .bind(id)
                .fetch_all(pool)
                .await?;
                Ok::<_, StoreError>((row, roles))
            })
            .await?;

        let row = row.ok_or_else(|| StoreError::RecordNotFound {
            table: PARTIES.to_string(),
            key: id,
        })?;
        let mut party = party_from_row(&row)?;
        party.roles = role_rows
            .iter()
            .map(role_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(party)
    }
}

fn party_from_row(row: &SqliteRow) -> Result<Party> {
    let kind: String = row.try_get("kind")?;
    Ok(Party {
        id: row.try_get("id")?,
        kind: serde_json::from_value(serde_json::Value::String(kind))?,
        display_name: row.try_get("display_name")?,
        email: row.try_get("email")?,
        notes: row.try_get("notes")?,
        token: ConflictToken(row.try_get("row_version")?),
        created_at: row.try_get("created_at")?,
        last_modified: row.try_get("last_modified")?,
        roles: Vec::new(),
    })
}

fn role_from_row(row: &SqliteRow) -> Result<RoleAssignment> {
    let role: String = row.try_get("role")?;
    let context: String = row.try_get("context_json")?;
    Ok(RoleAssignment {
        id: row.try_get("id")?,
        role: serde_json::from_value(serde_json::Value::String(role))?,
        context: serde_json::from_str(&context)?,
        assigned_at: row.try_get("assigned_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_context_serialization() {
        let context = RoleContext::Organization { party_id: 7 };
        let json = serde_json::to_string(&context).unwrap();
        assert_eq!(json, r#"{"type":"organization","party_id":7}"#);

        let parsed: RoleContext = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, context);

        let global = serde_json::to_string(&RoleContext::Global).unwrap();
        assert_eq!(global, r#"{"type":"global"}"#);
    }

    #[test]
    fn test_project_context_requires_code() {
        let result: std::result::Result<RoleContext, _> =
            serde_json::from_str(r#"{"type":"project"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_kind_and_role_strings_match_serde() {
        for kind in [PartyKind::Person, PartyKind::Organization] {
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                serde_json::Value::String(kind.as_str().to_string())
            );
        }
        for role in [Role::Customer, Role::Supplier, Role::Employee, Role::Contact] {
            assert_eq!(
                serde_json::to_value(role).unwrap(),
                serde_json::Value::String(role.as_str().to_string())
            );
        }
    }

    #[test]
    fn test_update_distinguishes_clear_from_unchanged() {
        let update: PartyUpdate = serde_json::from_str(r#"{"email": null}"#).unwrap();
        assert_eq!(update.email, Some(None));
        assert_eq!(update.notes, None);
        assert_eq!(update.display_name, None);

        let update: PartyUpdate =
            serde_json::from_str(r#"{"notes": "vip"}"#).unwrap();
        assert_eq!(update.notes, Some(Some("vip".to_string())));
        assert_eq!(update.email, None);

        let clear_notes = PartyUpdate {
            notes: Some(None),
            ..Default::default()
        };
        let json = serde_json::to_string(&clear_notes).unwrap();
        assert_eq!(json, r#"{"notes":null}"#);
        let parsed: PartyUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, clear_notes);
    }
}
