use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::db::models::{household_key, HouseholdMember, MemberRole, RemoteCalendarConfig};
use crate::db::repository::{HouseholdRepository, RemoteCalendarRepository};
use crate::error::AppResult;
use crate::services::caldav::CalDavTarget;

/// Read-only view of household membership and remote calendar settings,
/// owned by the household and settings modules.
#[async_trait]
pub trait HouseholdDirectory: Send + Sync {
    /// Members of the user's household, the user included. A user without a
    /// household is returned alone.
    async fn household_member_ids(&self, user_id: &str) -> AppResult<Vec<HouseholdMember>>;

    /// Enabled, decrypted remote calendar configs of the given users.
    async fn enabled_remote_calendars(
        &self,
        user_ids: &[String],
    ) -> AppResult<Vec<RemoteCalendarConfig>>;
}

/// [`HouseholdDirectory`] over the local SQLite tables.
#[derive(Clone)]
pub struct SqliteHouseholdDirectory {
    pool: SqlitePool,
}

impl SqliteHouseholdDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HouseholdDirectory for SqliteHouseholdDirectory {
    async fn household_member_ids(&self, user_id: &str) -> AppResult<Vec<HouseholdMember>> {
        HouseholdRepository::members_for_user(&self.pool, user_id).await
    }

    async fn enabled_remote_calendars(
        &self,
        user_ids: &[String],
    ) -> AppResult<Vec<RemoteCalendarConfig>> {
        RemoteCalendarRepository::find_enabled_for_users(&self.pool, user_ids).await
    }
}

/// One server that must receive the event, with the config chosen to reach it.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub config: RemoteCalendarConfig,
    pub target: CalDavTarget,
}

/// Result of [`HouseholdTargetResolver::resolve`].
#[derive(Debug, Clone, Default)]
pub struct ResolvedTargets {
    /// Pub/sub scope of the user's household.
    pub household_key: String,
    /// Member ids of the household, the user included.
    pub member_ids: Vec<String>,
    /// One entry per server identity (normalized collection URL).
    pub targets: BTreeMap<String, ResolvedTarget>,
}

impl ResolvedTargets {
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Collapses the household's enabled calendars into distinct servers.
///
/// When several members point at the same server, the household admin's
/// config wins; between equals the lowest user id wins. The winner supplies
/// the credentials and the time windows for that server.
#[derive(Clone)]
pub struct HouseholdTargetResolver {
    directory: Arc<dyn HouseholdDirectory>,
}

impl HouseholdTargetResolver {
    pub fn new(directory: Arc<dyn HouseholdDirectory>) -> Self {
        Self { directory }
    }

    pub async fn resolve(&self, user_id: &str) -> AppResult<ResolvedTargets> {
        let members = self.directory.household_member_ids(user_id).await?;

        let household_id = members
            .iter()
            .find_map(|m| m.household_id.as_deref())
            .map(str::to_string);
        let member_ids: Vec<String> = members.iter().map(|m| m.user_id.clone()).collect();

        let configs = self.directory.enabled_remote_calendars(&member_ids).await?;

        let role_of = |uid: &str| {
            members
                .iter()
                .find(|m| m.user_id == uid)
                .map(|m| m.role)
                .unwrap_or(MemberRole::Member)
        };

        let mut targets: BTreeMap<String, (MemberRole, ResolvedTarget)> = BTreeMap::new();
        for config in configs {
            if !config.enabled {
                continue;
            }

            let target = match CalDavTarget::new(&config.server_url, &config.username, &config.password) {
                Ok(target) => target,
                Err(e) => {
                    tracing::warn!(
                        "Skipping remote calendar of user {}: {}",
                        config.user_id,
                        e
                    );
                    continue;
                }
            };

            let rank = role_of(&config.user_id);
            let identity = target.identity().to_string();
            let candidate = ResolvedTarget { config, target };

            let replace = match targets.get(&identity) {
                Some((best_rank, best)) => {
                    (rank, candidate.config.user_id.as_str())
                        < (*best_rank, best.config.user_id.as_str())
                }
                None => true,
            };
            if replace {
                targets.insert(identity, (rank, candidate));
            }
        }

        tracing::debug!(
            "Resolved {} remote calendar target(s) for user {}",
            targets.len(),
            user_id
        );

        Ok(ResolvedTargets {
            household_key: household_key(household_id.as_deref(), user_id),
            member_ids,
            targets: targets
                .into_iter()
                .map(|(identity, (_, resolved))| (identity, resolved))
                .collect(),
        })
    }
}
