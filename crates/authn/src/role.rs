//! Role storage and the cache-aside role layer.
//!
//! [`RoleCache`] answers the two questions request authorization asks:
//! "does the user hold any of these tags" ([`RoleCache::intersect_roles`]) and
//! "what does the user hold" ([`RoleCache::get_role_summary`]). Both read the
//! key-value cache first and fall back to the [`RoleRepository`]:
//!
//! ```text
//! roleset:<userid>:<tag>  -> "y" | "n"
//! summary:<userid>        -> "admin,user,usr.g"
//! ```
//!
//! Mutations go to the repository first and then clear the touched entries.
//! Cache entries are never updated in place. Cache failures are logged with
//! an `actiontype` field and never fail the call.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use warden_kvstore::{Batch, KvStore, Slot, Subtree};

use crate::{error::Result, rank::Rank};

/// Cache subtree of per-tag membership flags.
pub const ROLESET_CACHE_PREFIX: &str = "roleset";
/// Cache subtree of role summaries.
pub const SUMMARY_CACHE_PREFIX: &str = "summary";
/// Most roles read into a summary.
pub const ROLE_SUMMARY_LIMIT: usize = 256;
/// Most rows touched by a bulk role deletion.
pub const ROLE_BULK_LIMIT: usize = 65536;

const CACHE_MEMBER: &str = "y";
const CACHE_NOT_MEMBER: &str = "n";

/// Durable storage of user roles, one row per `(userid, role)`.
#[async_trait]
pub trait RoleRepository: Send + Sync {
    /// The subset of `roles` the user holds.
    async fn intersect_roles(&self, userid: &str, roles: &Rank) -> Result<Rank>;

    /// A page of the user's roles in tag order.
    async fn get_user_roles(&self, userid: &str, limit: usize, offset: usize) -> Result<Rank>;

    /// A page of the holders of `role` in userid order.
    async fn get_by_role(&self, role: &str, limit: usize, offset: usize) -> Result<Vec<String>>;

    /// Grants roles. Already held roles are ignored.
    async fn insert_roles(&self, userid: &str, roles: &Rank) -> Result<()>;

    /// Revokes roles. Roles not held are ignored.
    async fn delete_roles(&self, userid: &str, roles: &Rank) -> Result<()>;

    /// Revokes every role of the user.
    async fn delete_user_roles(&self, userid: &str) -> Result<()>;

    /// Revokes `role` from every holder.
    async fn delete_by_role(&self, role: &str) -> Result<()>;
}

/// Row id of a role grant.
#[must_use]
pub fn role_id(userid: &str, role: &str) -> String {
    format!("{userid}|{role}")
}

/// In-memory [`RoleRepository`] that counts calls.
#[derive(Default)]
pub struct MemoryRoleRepository {
    rows: RwLock<BTreeMap<String, (String, String)>>,
    calls: AtomicU64,
}

impl MemoryRoleRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of repository calls made so far.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Resets the call counter.
    pub fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn holders(&self, role: &str) -> BTreeSet<String> {
        self.rows.read().values().filter(|(_, r)| r == role).map(|(u, _)| u.clone()).collect()
    }
}

#[async_trait]
impl RoleRepository for MemoryRoleRepository {
    async fn intersect_roles(&self, userid: &str, roles: &Rank) -> Result<Rank> {
        self.count();
        let rows = self.rows.read();
        Ok(roles.iter().filter(|role| rows.contains_key(&role_id(userid, role))).collect())
    }

    async fn get_user_roles(&self, userid: &str, limit: usize, offset: usize) -> Result<Rank> {
        self.count();
        let rows = self.rows.read();
        let mut roles: Vec<&str> =
            rows.values().filter(|(u, _)| u == userid).map(|(_, r)| r.as_str()).collect();
        roles.sort_unstable();
        Ok(roles.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_by_role(&self, role: &str, limit: usize, offset: usize) -> Result<Vec<String>> {
        self.count();
        Ok(self.holders(role).into_iter().skip(offset).take(limit).collect())
    }

    async fn insert_roles(&self, userid: &str, roles: &Rank) -> Result<()> {
        self.count();
        let mut rows = self.rows.write();
        for role in roles {
            rows.insert(role_id(userid, role), (userid.to_owned(), role.clone()));
        }
        Ok(())
    }

    async fn delete_roles(&self, userid: &str, roles: &Rank) -> Result<()> {
        self.count();
        let mut rows = self.rows.write();
        for role in roles {
            rows.remove(&role_id(userid, role));
        }
        Ok(())
    }

    async fn delete_user_roles(&self, userid: &str) -> Result<()> {
        self.count();
        self.rows.write().retain(|_, (u, _)| u != userid);
        Ok(())
    }

    async fn delete_by_role(&self, role: &str) -> Result<()> {
        self.count();
        self.rows.write().retain(|_, (_, r)| r != role);
        Ok(())
    }
}

/// Cache-aside layer over a [`RoleRepository`].
pub struct RoleCache {
    repo: Arc<dyn RoleRepository>,
    roleset: Subtree,
    summary: Subtree,
    cache_time: Duration,
}

impl RoleCache {
    /// Creates a cache whose entries live for `cache_time`.
    #[must_use]
    pub fn new(repo: Arc<dyn RoleRepository>, kv: Arc<dyn KvStore>, cache_time: Duration) -> Self {
        Self {
            repo,
            roleset: Subtree::new(Arc::clone(&kv), ROLESET_CACHE_PREFIX),
            summary: Subtree::new(kv, SUMMARY_CACHE_PREFIX),
            cache_time,
        }
    }

    /// The subset of `roles` the user holds.
    ///
    /// All tags are read from the cache in one batch. Tags the cache does not
    /// know are asked of the repository, and the answers are written back.
    /// If the batch fails as a whole, the repository answers for every tag.
    ///
    /// # Errors
    ///
    /// Returns repository failures.
    #[tracing::instrument(skip(self, roles), fields(roles = %roles))]
    pub async fn intersect_roles(&self, userid: &str, roles: &Rank) -> Result<Rank> {
        if roles.is_empty() {
            return Ok(Rank::new());
        }
        let user_kv = self.roleset.subtree(userid);

        let mut batch = Batch::multi();
        let slots: Vec<(&str, Slot<Option<String>>)> =
            roles.iter().map(|tag| (tag, batch.get(tag))).collect();
        let mut replies = match user_kv.exec(batch).await {
            Ok(replies) => replies,
            Err(err) => {
                tracing::error!(
                    actiontype = "getroleset",
                    error = %err,
                    "Failed to get user roles from cache"
                );
                return self.repo.intersect_roles(userid, roles).await;
            },
        };

        let mut held = Rank::new();
        let mut uncached = Rank::new();
        for (tag, slot) in slots {
            match replies.take(slot) {
                Ok(Some(value)) => {
                    if value == CACHE_MEMBER {
                        held.add(tag);
                    }
                },
                Ok(None) => {
                    uncached.add(tag);
                },
                Err(err) => {
                    tracing::error!(
                        actiontype = "getroleresult",
                        error = %err,
                        "Failed to get user role result from cache"
                    );
                    uncached.add(tag);
                },
            }
        }

        if uncached.is_empty() {
            return Ok(held);
        }

        let found = self.repo.intersect_roles(userid, &uncached).await?;

        let mut write_back = Batch::tx();
        for tag in uncached.iter() {
            let value = if found.has(tag) { CACHE_MEMBER } else { CACHE_NOT_MEMBER };
            write_back.set(tag, value, Some(self.cache_time));
        }
        if let Err(err) = user_kv.exec(write_back).await {
            tracing::error!(
                actiontype = "setroleset",
                error = %err,
                "Failed to set user roles in cache"
            );
        }

        held.extend(&found);
        Ok(held)
    }

    /// Grants roles and clears the user's affected cache entries.
    ///
    /// # Errors
    ///
    /// Returns repository failures.
    pub async fn insert_roles(&self, userid: &str, roles: &Rank) -> Result<()> {
        self.repo.insert_roles(userid, roles).await?;
        self.clear_cache(userid, roles).await;
        Ok(())
    }

    /// Revokes roles and clears the user's affected cache entries.
    ///
    /// # Errors
    ///
    /// Returns repository failures.
    pub async fn delete_roles(&self, userid: &str, roles: &Rank) -> Result<()> {
        self.repo.delete_roles(userid, roles).await?;
        self.clear_cache(userid, roles).await;
        Ok(())
    }

    /// Revokes every role of the user and clears their cache entries.
    ///
    /// # Errors
    ///
    /// Returns repository failures.
    pub async fn delete_all_roles(&self, userid: &str) -> Result<()> {
        let roles = self.get_roles(userid, ROLE_BULK_LIMIT, 0).await?;
        self.repo.delete_user_roles(userid).await?;
        self.clear_cache(userid, &roles).await;
        Ok(())
    }

    /// A page of the user's roles, read from the repository.
    ///
    /// # Errors
    ///
    /// Returns repository failures.
    pub async fn get_roles(&self, userid: &str, limit: usize, offset: usize) -> Result<Rank> {
        self.repo.get_user_roles(userid, limit, offset).await
    }

    /// A page of the holders of `role`, read from the repository.
    ///
    /// # Errors
    ///
    /// Returns repository failures.
    pub async fn get_by_role(&self, role: &str, limit: usize, offset: usize) -> Result<Vec<String>> {
        self.repo.get_by_role(role, limit, offset).await
    }

    /// Revokes `role` from every holder and clears each holder's summary and
    /// flag for that role.
    ///
    /// # Errors
    ///
    /// Returns repository failures.
    pub async fn delete_by_role(&self, role: &str) -> Result<()> {
        let userids = self.get_by_role(role, ROLE_BULK_LIMIT, 0).await?;
        self.repo.delete_by_role(role).await?;
        self.clear_cache_roles(role, &userids).await;
        Ok(())
    }

    /// Everything the user holds, up to [`ROLE_SUMMARY_LIMIT`] roles.
    ///
    /// # Errors
    ///
    /// Returns repository failures.
    #[tracing::instrument(skip(self))]
    pub async fn get_role_summary(&self, userid: &str) -> Result<Rank> {
        let cached = match self.summary.get(userid).await {
            Ok(cached) => cached,
            Err(err) => {
                tracing::error!(
                    actiontype = "getcachesummary",
                    error = %err,
                    "Failed to get role summary from cache"
                );
                None
            },
        };
        let Some(cached) = cached else {
            return self.get_role_summary_repo(userid).await;
        };

        match Rank::parse(&cached) {
            Ok(roles) => Ok(roles),
            Err(err) => {
                tracing::error!(
                    actiontype = "parsecachesummary",
                    error = %err,
                    "Invalid role summary"
                );
                self.get_role_summary_repo(userid).await
            },
        }
    }

    async fn get_role_summary_repo(&self, userid: &str) -> Result<Rank> {
        let roles = self.get_roles(userid, ROLE_SUMMARY_LIMIT, 0).await?;
        if let Err(err) =
            self.summary.set(userid, &roles.to_string(), Some(self.cache_time)).await
        {
            tracing::error!(
                actiontype = "cachesummary",
                error = %err,
                "Failed to cache role summary"
            );
        }
        Ok(roles)
    }

    async fn clear_cache(&self, userid: &str, roles: &Rank) {
        if let Err(err) = self.summary.del(&[userid.to_owned()]).await {
            tracing::error!(
                actiontype = "clearcachesummary",
                error = %err,
                "Failed to clear role summary from cache"
            );
        }

        if roles.is_empty() {
            return;
        }

        if let Err(err) = self.roleset.subtree(userid).del(&roles.to_slice()).await {
            tracing::error!(
                actiontype = "clearroleset",
                error = %err,
                "Failed to clear role set from cache"
            );
        }
    }

    async fn clear_cache_roles(&self, role: &str, userids: &[String]) {
        if userids.is_empty() {
            return;
        }

        if let Err(err) = self.summary.del(userids).await {
            tracing::error!(
                actiontype = "clearcachesummary",
                error = %err,
                "Failed to clear role summary from cache"
            );
        }

        let mut batch = Batch::tx();
        for userid in userids {
            batch.subtree(userid).del(&[role]);
        }
        if let Err(err) = self.roleset.exec(batch).await {
            tracing::error!(
                actiontype = "clearroleset",
                error = %err,
                "Failed to clear role set from cache"
            );
        }
    }
}

impl fmt::Debug for RoleCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleCache")
            .field("roleset", &self.roleset)
            .field("summary", &self.summary)
            .field("cache_time", &self.cache_time)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use warden_kvstore::{MemoryKv, testutil::FlakyKv};

    use super::*;

    const CACHE_TIME: Duration = Duration::from_secs(600);

    struct Fixture {
        cache: RoleCache,
        repo: Arc<MemoryRoleRepository>,
        kv: Arc<FlakyKv>,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(MemoryRoleRepository::new());
        let kv = Arc::new(FlakyKv::new(MemoryKv::new()));
        let cache = RoleCache::new(repo.clone(), kv.clone(), CACHE_TIME);
        Fixture { cache, repo, kv }
    }

    fn rank(s: &str) -> Rank {
        Rank::parse(s).unwrap()
    }

    async fn cached(kv: &FlakyKv, key: &str) -> Option<String> {
        kv.inner().get(key).await.unwrap()
    }

    #[tokio::test]
    async fn test_intersect_roles_caches_hits_and_misses() {
        let f = fixture();
        f.repo.insert_roles("u1", &rank("admin")).await.unwrap();
        f.repo.reset_calls();

        let held = f.cache.intersect_roles("u1", &rank("admin,mod.x")).await.unwrap();
        assert_eq!(held, rank("admin"));
        assert_eq!(f.repo.calls(), 1);
        assert_eq!(cached(&f.kv, "roleset:u1:admin").await.as_deref(), Some("y"));
        assert_eq!(cached(&f.kv, "roleset:u1:mod.x").await.as_deref(), Some("n"));

        let held = f.cache.intersect_roles("u1", &rank("admin,mod.x")).await.unwrap();
        assert_eq!(held, rank("admin"));
        assert_eq!(f.repo.calls(), 1, "second call must be served from the cache");
    }

    #[tokio::test]
    async fn test_intersect_roles_only_queries_uncached_tags() {
        let f = fixture();
        f.repo.insert_roles("u1", &rank("admin,usr.g")).await.unwrap();
        f.cache.intersect_roles("u1", &rank("admin")).await.unwrap();
        f.repo.reset_calls();

        let held = f.cache.intersect_roles("u1", &rank("admin,usr.g")).await.unwrap();
        assert_eq!(held, rank("admin,usr.g"));
        assert_eq!(f.repo.calls(), 1);
        assert_eq!(cached(&f.kv, "roleset:u1:usr.g").await.as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn test_intersect_roles_treats_unknown_values_as_non_member() {
        let f = fixture();
        f.repo.insert_roles("u1", &rank("admin")).await.unwrap();
        f.kv.inner().set("roleset:u1:admin", "garbage", None).await.unwrap();
        f.repo.reset_calls();

        let held = f.cache.intersect_roles("u1", &rank("admin")).await.unwrap();
        assert!(held.is_empty());
        assert_eq!(f.repo.calls(), 0);
    }

    #[tokio::test]
    async fn test_intersect_roles_falls_back_when_batch_fails() {
        let f = fixture();
        f.repo.insert_roles("u1", &rank("admin")).await.unwrap();
        f.kv.faults().fail_exec(true);
        f.repo.reset_calls();

        let held = f.cache.intersect_roles("u1", &rank("admin,user")).await.unwrap();
        assert_eq!(held, rank("admin"));
        assert_eq!(f.repo.calls(), 1);
        assert!(f.kv.inner().is_empty(), "nothing is written back after a failed read");
    }

    #[tokio::test]
    async fn test_intersect_roles_empty_does_no_io() {
        let f = fixture();
        assert!(f.cache.intersect_roles("u1", &Rank::new()).await.unwrap().is_empty());
        assert_eq!(f.repo.calls(), 0);
        assert_eq!(f.kv.faults().exec_calls(), 0);
    }

    #[tokio::test]
    async fn test_mutations_clear_only_touched_entries() {
        let f = fixture();
        f.repo.insert_roles("u1", &rank("admin,usr.g")).await.unwrap();
        f.repo.insert_roles("u2", &rank("admin")).await.unwrap();
        f.cache.intersect_roles("u1", &rank("admin,usr.g")).await.unwrap();
        f.cache.intersect_roles("u2", &rank("admin")).await.unwrap();
        f.cache.get_role_summary("u1").await.unwrap();
        f.cache.get_role_summary("u2").await.unwrap();

        f.cache.delete_roles("u1", &rank("admin")).await.unwrap();

        assert_eq!(cached(&f.kv, "roleset:u1:admin").await, None);
        assert_eq!(cached(&f.kv, "summary:u1").await, None);
        assert_eq!(cached(&f.kv, "roleset:u1:usr.g").await.as_deref(), Some("y"));
        assert_eq!(cached(&f.kv, "roleset:u2:admin").await.as_deref(), Some("y"));
        assert_eq!(cached(&f.kv, "summary:u2").await.as_deref(), Some("admin"));

        let held = f.cache.intersect_roles("u1", &rank("admin,usr.g")).await.unwrap();
        assert_eq!(held, rank("usr.g"));
    }

    #[tokio::test]
    async fn test_insert_roles_invalidates_negative_entries() {
        let f = fixture();
        assert!(f.cache.intersect_roles("u1", &rank("admin")).await.unwrap().is_empty());
        assert_eq!(cached(&f.kv, "roleset:u1:admin").await.as_deref(), Some("n"));

        f.cache.insert_roles("u1", &rank("admin")).await.unwrap();
        assert_eq!(f.cache.intersect_roles("u1", &rank("admin")).await.unwrap(), rank("admin"));
    }

    #[tokio::test]
    async fn test_delete_all_roles() {
        let f = fixture();
        f.cache.insert_roles("u1", &rank("admin,user")).await.unwrap();
        f.cache.intersect_roles("u1", &rank("admin,user")).await.unwrap();

        f.cache.delete_all_roles("u1").await.unwrap();

        assert!(f.cache.get_roles("u1", 10, 0).await.unwrap().is_empty());
        assert!(f.kv.inner().keys_with_prefix("roleset:u1:").is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_role_clears_every_holder() {
        let f = fixture();
        f.cache.insert_roles("u1", &rank("mod.g,user")).await.unwrap();
        f.cache.insert_roles("u2", &rank("mod.g")).await.unwrap();
        f.cache.insert_roles("u3", &rank("user")).await.unwrap();
        for u in ["u1", "u2", "u3"] {
            f.cache.intersect_roles(u, &rank("mod.g,user")).await.unwrap();
            f.cache.get_role_summary(u).await.unwrap();
        }

        f.cache.delete_by_role("mod.g").await.unwrap();

        assert!(f.cache.get_by_role("mod.g", 10, 0).await.unwrap().is_empty());
        assert_eq!(cached(&f.kv, "roleset:u1:mod.g").await, None);
        assert_eq!(cached(&f.kv, "roleset:u2:mod.g").await, None);
        assert_eq!(cached(&f.kv, "summary:u1").await, None);
        assert_eq!(cached(&f.kv, "summary:u2").await, None);
        assert_eq!(cached(&f.kv, "roleset:u1:user").await.as_deref(), Some("y"));
        assert_eq!(cached(&f.kv, "roleset:u3:mod.g").await.as_deref(), Some("n"));
        assert_eq!(cached(&f.kv, "summary:u3").await.as_deref(), Some("user"));
    }

    #[tokio::test]
    async fn test_role_summary_is_cache_aside() {
        let f = fixture();
        f.repo.insert_roles("u1", &rank("admin,user")).await.unwrap();
        f.repo.reset_calls();

        assert_eq!(f.cache.get_role_summary("u1").await.unwrap(), rank("admin,user"));
        assert_eq!(cached(&f.kv, "summary:u1").await.as_deref(), Some("admin,user"));
        assert_eq!(f.cache.get_role_summary("u1").await.unwrap(), rank("admin,user"));
        assert_eq!(f.repo.calls(), 1);
    }

    #[tokio::test]
    async fn test_role_summary_refetches_unparseable_entry() {
        let f = fixture();
        f.repo.insert_roles("u1", &rank("user")).await.unwrap();
        f.kv.inner().set("summary:u1", "not a rank!", None).await.unwrap();

        assert_eq!(f.cache.get_role_summary("u1").await.unwrap(), rank("user"));
        assert_eq!(cached(&f.kv, "summary:u1").await.as_deref(), Some("user"));
    }

    #[tokio::test]
    async fn test_role_summary_survives_cache_outage() {
        let f = fixture();
        f.repo.insert_roles("u1", &rank("user")).await.unwrap();
        f.kv.faults().fail_all(true);

        assert_eq!(f.cache.get_role_summary("u1").await.unwrap(), rank("user"));
    }

    #[tokio::test]
    async fn test_role_summary_is_bounded() {
        let f = fixture();
        let many: Rank = (0..300).map(|i| format!("usr.g{i:03}")).collect();
        f.repo.insert_roles("u1", &many).await.unwrap();

        let summary = f.cache.get_role_summary("u1").await.unwrap();
        assert_eq!(summary.len(), ROLE_SUMMARY_LIMIT);
    }

    #[tokio::test]
    async fn test_repository_pagination() {
        let repo = MemoryRoleRepository::new();
        repo.insert_roles("u1", &rank("admin,user,usr.a")).await.unwrap();
        repo.insert_roles("u2", &rank("user")).await.unwrap();

        assert_eq!(repo.get_user_roles("u1", 2, 1).await.unwrap(), rank("user,usr.a"));
        assert_eq!(repo.get_by_role("user", 10, 0).await.unwrap(), vec!["u1", "u2"]);
        assert_eq!(repo.get_by_role("user", 1, 1).await.unwrap(), vec!["u2"]);
        assert_eq!(role_id("u1", "admin"), "u1|admin");
    }
}
