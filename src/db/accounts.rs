//! Account repository: durable record of each known contact.
//!
//! The one operation that matters here is [`AccountRepository::reconcile`],
//! a create-or-update keyed by a chosen subset of fields. It must be safe
//! under concurrent callers racing on the same match key: the insert path
//! can lose to a concurrent insert, in which case the whole
//! lookup-then-insert-or-update runs again inside a bounded loop.

use super::DbError;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

/// Bound on the reconcile retry loop. A second consecutive loss of the
/// insert race on the same key requires contention this deployment never
/// sees; the bound exists so the loop cannot spin forever.
const MAX_RECONCILE_ATTEMPTS: u32 = 5;

/// A contact's reported availability.
///
/// The wire values follow the federated presence protocol (`chat`, `away`,
/// `xa`, `dnd`); anything unrecognized is preserved verbatim so the feed can
/// display whatever a nonstandard client reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceState {
    Online,
    Chat,
    Away,
    ExtendedAway,
    DoNotDisturb,
    Offline,
    Unknown,
    Other(String),
}

impl PresenceState {
    /// Parse a stored or reported state string.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "online" => Self::Online,
            "chat" => Self::Chat,
            "away" => Self::Away,
            "xa" => Self::ExtendedAway,
            "dnd" => Self::DoNotDisturb,
            "offline" => Self::Offline,
            "unknown" => Self::Unknown,
            other => Self::Other(other.to_string()),
        }
    }

    /// The raw state string as stored and exposed in the feed.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Online => "online",
            Self::Chat => "chat",
            Self::Away => "away",
            Self::ExtendedAway => "xa",
            Self::DoNotDisturb => "dnd",
            Self::Offline => "offline",
            Self::Unknown => "unknown",
            Self::Other(raw) => raw,
        }
    }

    /// Human-readable state for the feed; unknown values pass through.
    pub fn friendly(&self) -> &str {
        match self {
            Self::Online => "Online",
            Self::Chat => "Free to chat",
            Self::Away => "Away",
            Self::ExtendedAway => "Extended away",
            Self::DoNotDisturb => "Do not disturb",
            Self::Offline => "Offline",
            Self::Unknown => "Unknown",
            Self::Other(raw) => raw,
        }
    }

    /// Status icon name for this state.
    pub fn icon(&self) -> &'static str {
        match self {
            Self::Online | Self::Chat => "online",
            Self::DoNotDisturb => "busy",
            Self::Away | Self::ExtendedAway => "away",
            _ => "offline",
        }
    }
}

/// Optional capability flags tracked per account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Video,
    Voice,
}

impl Feature {
    const fn bit(self) -> i64 {
        match self {
            Self::Video => 1 << 0,
            Self::Voice => 1 << 1,
        }
    }
}

/// Set of capability flags. Each flag is set or cleared independently;
/// touching one never clobbers the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureSet(i64);

impl FeatureSet {
    /// The empty set (no capabilities reported).
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Reconstruct from stored bits, masking anything unrecognized.
    pub fn from_bits(bits: i64) -> Self {
        Self(bits & (Feature::Video.bit() | Feature::Voice.bit()))
    }

    /// Raw bits for storage.
    pub fn bits(self) -> i64 {
        self.0
    }

    /// Whether the flag is set.
    pub fn contains(self, feature: Feature) -> bool {
        self.0 & feature.bit() != 0
    }

    /// Set or clear one flag, leaving the others untouched.
    pub fn set(&mut self, feature: Feature, on: bool) {
        if on {
            self.0 |= feature.bit();
        } else {
            self.0 &= !feature.bit();
        }
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, feature: Feature, on: bool) -> Self {
        self.set(feature, on);
        self
    }
}

/// A known contact.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    /// Bare chat address; unique, immutable once set.
    pub address: String,
    /// Claimed feed name; unique when present.
    pub username: Option<String>,
    pub state: PresenceState,
    pub status_text: Option<String>,
    /// Opaque registration token; generated once, never overwritten.
    pub account_code: Option<String>,
    pub features: FeatureSet,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields a reconcile call supplies. `None` means "not supplied, leave
/// alone"; `status_text` carries an inner `Option` so callers can
/// explicitly set it to NULL.
#[derive(Debug, Clone, Default)]
pub struct AccountPatch {
    pub address: Option<String>,
    pub username: Option<String>,
    pub state: Option<PresenceState>,
    pub status_text: Option<Option<String>>,
    pub account_code: Option<String>,
    pub features: Option<FeatureSet>,
}

impl AccountPatch {
    /// Patch carrying only an address (the common match base).
    pub fn for_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }
}

/// Fields reconcile can match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKey {
    Address,
    Username,
    AccountCode,
}

impl MatchKey {
    fn column(self) -> &'static str {
        match self {
            Self::Address => "address",
            Self::Username => "username",
            Self::AccountCode => "account_code",
        }
    }

    fn value<'p>(self, patch: &'p AccountPatch) -> Result<&'p str, DbError> {
        let value = match self {
            Self::Address => patch.address.as_deref(),
            Self::Username => patch.username.as_deref(),
            Self::AccountCode => patch.account_code.as_deref(),
        };
        value.ok_or(DbError::MissingMatchValue(self.column()))
    }
}

const ROW_COLUMNS: &str =
    "id, address, username, state, status_text, account_code, features, created_at, updated_at";

type AccountRow = (
    i64,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    i64,
    i64,
    i64,
);

fn row_to_account(row: AccountRow) -> Account {
    let (id, address, username, state, status_text, account_code, features, created_at, updated_at) =
        row;
    Account {
        id,
        address,
        username,
        state: PresenceState::parse(&state),
        status_text,
        account_code,
        features: FeatureSet::from_bits(features),
        created_at,
        updated_at,
    }
}

fn is_unique_violation(err: &DbError) -> bool {
    matches!(err, DbError::Sqlx(sqlx::Error::Database(db_err)) if db_err.is_unique_violation())
}

/// Repository for account operations.
pub struct AccountRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> AccountRepository<'a> {
    /// Create a new account repository.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Find account by bare address.
    pub async fn find_by_address(&self, address: &str) -> Result<Option<Account>, DbError> {
        self.find_by_column("address", address).await
    }

    /// Find account by claimed username.
    pub async fn find_by_username(&self, username: &str) -> Result<Option<Account>, DbError> {
        self.find_by_column("username", username).await
    }

    /// Find account by registration code.
    pub async fn find_by_account_code(&self, code: &str) -> Result<Option<Account>, DbError> {
        self.find_by_column("account_code", code).await
    }

    async fn find_by_column(
        &self,
        column: &'static str,
        value: &str,
    ) -> Result<Option<Account>, DbError> {
        let sql = format!("SELECT {ROW_COLUMNS} FROM accounts WHERE {column} = ?");
        let row = sqlx::query_as::<_, AccountRow>(&sql)
            .bind(value)
            .fetch_optional(self.pool)
            .await?;
        Ok(row.map(row_to_account))
    }

    /// Create-or-update keyed by `match_keys`.
    ///
    /// Looks up a row whose match-key columns equal the corresponding patch
    /// values. If found, applies the remaining supplied fields as an update
    /// (match-key fields are never rewritten, and `account_code` keeps its
    /// first non-NULL value). If not found, inserts a new row; an insert that
    /// loses a uniqueness race to a concurrent caller restarts the whole
    /// operation.
    pub async fn reconcile(
        &self,
        match_keys: &[MatchKey],
        patch: &AccountPatch,
    ) -> Result<Account, DbError> {
        if match_keys.is_empty() {
            return Err(DbError::Internal(
                "reconcile requires at least one match key".to_string(),
            ));
        }

        for attempt in 0..MAX_RECONCILE_ATTEMPTS {
            if attempt > 0 {
                crate::metrics::record_reconcile_retry();
            }

            if let Some(existing) = self.find_by_match(match_keys, patch).await? {
                return self.apply_update(existing.id, match_keys, patch).await;
            }

            match self.try_insert(patch).await {
                Ok(account) => return Ok(account),
                Err(err) if is_unique_violation(&err) => {
                    // A concurrent caller inserted a matching row between the
                    // lookup and the insert. Loop and take the update path.
                    tracing::debug!(attempt, "Reconcile insert lost a race, retrying");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(DbError::RetriesExhausted)
    }

    async fn find_by_match(
        &self,
        match_keys: &[MatchKey],
        patch: &AccountPatch,
    ) -> Result<Option<Account>, DbError> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {ROW_COLUMNS} FROM accounts WHERE "));
        let mut clause = qb.separated(" AND ");
        for key in match_keys {
            let value = key.value(patch)?.to_string();
            clause.push(key.column());
            clause.push_unseparated(" = ");
            clause.push_bind_unseparated(value);
        }

        let row = qb
            .build_query_as::<AccountRow>()
            .fetch_optional(self.pool)
            .await?;
        Ok(row.map(row_to_account))
    }

    async fn apply_update(
        &self,
        id: i64,
        match_keys: &[MatchKey],
        patch: &AccountPatch,
    ) -> Result<Account, DbError> {
        let now = chrono::Utc::now().timestamp();
        let skip = |key: MatchKey| match_keys.contains(&key);

        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("UPDATE accounts SET ");
        let mut assignments = qb.separated(", ");
        assignments.push("updated_at = ");
        assignments.push_bind_unseparated(now);

        if let Some(username) = &patch.username
            && !skip(MatchKey::Username)
        {
            assignments.push("username = ");
            assignments.push_bind_unseparated(username.clone());
        }
        if let Some(state) = &patch.state {
            assignments.push("state = ");
            assignments.push_bind_unseparated(state.as_str().to_string());
        }
        if let Some(status_text) = &patch.status_text {
            assignments.push("status_text = ");
            assignments.push_bind_unseparated(status_text.clone());
        }
        if let Some(code) = &patch.account_code
            && !skip(MatchKey::AccountCode)
        {
            // First write wins: a stored code is never overwritten.
            assignments.push("account_code = COALESCE(account_code, ");
            assignments.push_bind_unseparated(code.clone());
            assignments.push_unseparated(")");
        }
        if let Some(features) = &patch.features {
            assignments.push("features = ");
            assignments.push_bind_unseparated(features.bits());
        }

        qb.push(" WHERE id = ");
        qb.push_bind(id);

        qb.build().execute(self.pool).await.map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                // Update collided with another row on a unique column
                // (e.g. claiming a taken username). Not the recoverable
                // insert race; surfaced to the caller.
                return DbError::Conflict(db_err.message().to_string());
            }
            DbError::from(e)
        })?;

        let sql = format!("SELECT {ROW_COLUMNS} FROM accounts WHERE id = ?");
        let row = sqlx::query_as::<_, AccountRow>(&sql)
            .bind(id)
            .fetch_one(self.pool)
            .await?;
        Ok(row_to_account(row))
    }

    async fn try_insert(&self, patch: &AccountPatch) -> Result<Account, DbError> {
        let address = patch.address.as_deref().ok_or_else(|| {
            DbError::Internal("reconcile insert requires an address".to_string())
        })?;
        let now = chrono::Utc::now().timestamp();
        let state = patch
            .state
            .clone()
            .unwrap_or(PresenceState::Unknown);
        let status_text = patch.status_text.clone().flatten();
        let features = patch.features.unwrap_or_default();

        let result = sqlx::query(
            r#"
            INSERT INTO accounts (address, username, state, status_text, account_code, features, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(address)
        .bind(&patch.username)
        .bind(state.as_str())
        .bind(&status_text)
        .bind(&patch.account_code)
        .bind(features.bits())
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await?;

        Ok(Account {
            id: result.last_insert_rowid(),
            address: address.to_string(),
            username: patch.username.clone(),
            state,
            status_text,
            account_code: patch.account_code.clone(),
            features,
            created_at: now,
            updated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_state_round_trips_known_values() {
        for raw in ["online", "chat", "away", "xa", "dnd", "offline", "unknown"] {
            assert_eq!(PresenceState::parse(raw).as_str(), raw);
        }
    }

    #[test]
    fn presence_state_preserves_unknown_verbatim() {
        let state = PresenceState::parse("streaming");
        assert_eq!(state, PresenceState::Other("streaming".to_string()));
        assert_eq!(state.as_str(), "streaming");
        assert_eq!(state.friendly(), "streaming");
        assert_eq!(state.icon(), "offline");
    }

    #[test]
    fn presence_state_icons() {
        assert_eq!(PresenceState::Online.icon(), "online");
        assert_eq!(PresenceState::Chat.icon(), "online");
        assert_eq!(PresenceState::DoNotDisturb.icon(), "busy");
        assert_eq!(PresenceState::Away.icon(), "away");
        assert_eq!(PresenceState::ExtendedAway.icon(), "away");
        assert_eq!(PresenceState::Offline.icon(), "offline");
    }

    #[test]
    fn feature_set_flags_are_independent() {
        let mut features = FeatureSet::empty();
        features.set(Feature::Voice, true);
        assert!(features.contains(Feature::Voice));
        assert!(!features.contains(Feature::Video));

        // Setting video must not clobber voice
        features.set(Feature::Video, true);
        assert!(features.contains(Feature::Voice));
        assert!(features.contains(Feature::Video));

        // Clearing actually clears
        features.set(Feature::Video, false);
        assert!(!features.contains(Feature::Video));
        assert!(features.contains(Feature::Voice));
    }

    #[test]
    fn feature_set_masks_unknown_bits() {
        let features = FeatureSet::from_bits(0b1111);
        assert_eq!(features.bits(), 0b11);
    }

    #[test]
    fn match_key_requires_value_in_patch() {
        let patch = AccountPatch::default();
        assert!(matches!(
            MatchKey::Address.value(&patch),
            Err(DbError::MissingMatchValue("address"))
        ));
    }
}
