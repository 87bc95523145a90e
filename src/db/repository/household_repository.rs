use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::db::models::{HouseholdMember, MemberRole, RemoteCalendarConfig, TimeWindows};
use crate::error::{AppError, AppResult};

// ============================================================================
// Household Repository
// ============================================================================

/// Read access to household membership. The household module owns these
/// tables; nothing here writes to them outside of tests.
pub struct HouseholdRepository;

impl HouseholdRepository {
    /// All members of the household `user_id` belongs to, including the user.
    ///
    /// A user without a household yields just themselves (see
    /// [`HouseholdMember::solo`]).
    pub async fn members_for_user(
        pool: &SqlitePool,
        user_id: &str,
    ) -> AppResult<Vec<HouseholdMember>> {
        let rows = sqlx::query(
            r#"
            SELECT m.household_id, m.user_id, m.role
            FROM household_members m
            WHERE m.household_id = (
                SELECT household_id FROM household_members WHERE user_id = ? LIMIT 1
            )
            ORDER BY m.user_id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        if rows.is_empty() {
            return Ok(vec![HouseholdMember::solo(user_id)]);
        }

        rows.into_iter()
            .map(|r| {
                let role: String = r.try_get("role")?;
                Ok(HouseholdMember {
                    household_id: r.try_get("household_id")?,
                    user_id: r.try_get("user_id")?,
                    role: MemberRole::parse(&role).unwrap_or(MemberRole::Member),
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(AppError::Database)
    }
}

// ============================================================================
// Remote Calendar Config Repository
// ============================================================================

fn map_config(row: SqliteRow) -> Result<RemoteCalendarConfig, sqlx::Error> {
    let user_id: String = row.try_get("user_id")?;
    let windows_json: String = row.try_get("time_windows")?;
    let time_windows = serde_json::from_str::<TimeWindows>(&windows_json).unwrap_or_else(|e| {
        tracing::warn!(
            "Invalid time windows for user {} ({}); using defaults",
            user_id,
            e
        );
        TimeWindows::default()
    });

    Ok(RemoteCalendarConfig {
        user_id,
        server_url: row.try_get("server_url")?,
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        enabled: row.try_get("enabled")?,
        time_windows,
        timezone: row.try_get("timezone")?,
    })
}

/// Read access to per-user remote calendar settings.
pub struct RemoteCalendarRepository;

impl RemoteCalendarRepository {
    /// Enabled configs for the given users, ordered by user id.
    pub async fn find_enabled_for_users(
        pool: &SqlitePool,
        user_ids: &[String],
    ) -> AppResult<Vec<RemoteCalendarConfig>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            SELECT user_id, server_url, username, password, enabled, time_windows, timezone
            FROM remote_calendar_configs
            WHERE enabled = 1 AND user_id IN (
            "#,
        );
        let mut separated = builder.separated(", ");
        for id in user_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(") ORDER BY user_id ASC");

        let rows = builder
            .build()
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)?;

        rows.into_iter()
            .map(map_config)
            .collect::<Result<Vec<_>, _>>()
            .map_err(AppError::Database)
    }
}
