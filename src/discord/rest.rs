use std::{cmp, collections::HashSet, future::Future, sync::Arc, time::Duration};

use serenity::{
    async_trait,
    cache::Cache,
    http::Http,
    model::id::RoleId,
};
use tokio::{
    sync::Mutex,
    time::{sleep, sleep_until, Instant},
};

use crate::{discord::roles::MemberKey, error::RoleError};

pub const DEFAULT_REQUEST_SPACING: Duration = Duration::from_millis(250);

/// The REST calls the role engine needs. Kept narrow so the engine can be
/// driven without a live Discord connection.
#[async_trait]
pub trait RoleClient: Send + Sync {
    async fn member_roles(&self, member: MemberKey) -> Result<HashSet<RoleId>, RoleError>;
    async fn add_role(&self, member: MemberKey, role: RoleId, reason: &str)
        -> Result<(), RoleError>;
    async fn remove_role(
        &self,
        member: MemberKey,
        role: RoleId,
        reason: &str,
    ) -> Result<(), RoleError>;
}

pub struct SerenityRoleClient {
    cache: Arc<Cache>,
    http: Arc<Http>,
}

impl SerenityRoleClient {
    pub fn new(cache: Arc<Cache>, http: Arc<Http>) -> Self {
        SerenityRoleClient { cache, http }
    }
}

#[async_trait]
impl RoleClient for SerenityRoleClient {
    async fn member_roles(&self, member: MemberKey) -> Result<HashSet<RoleId>, RoleError> {
        // the cache lags behind our own mutations so we only trust it when the
        // API is unavailable
        match self
            .http
            .get_member(*member.guild.as_u64(), *member.user.as_u64())
            .await
        {
            Ok(m) => Ok(m.roles.into_iter().collect()),
            Err(e) => {
                let err = RoleError::from(e);
                if !err.is_retryable() {
                    return Err(err);
                }
                match self.cache.member(member.guild, member.user) {
                    Some(m) => {
                        debug!("Falling back to cached roles for {}: {}", member, err);
                        Ok(m.roles.into_iter().collect())
                    }
                    None => Err(err),
                }
            }
        }
    }

    async fn add_role(
        &self,
        member: MemberKey,
        role: RoleId,
        reason: &str,
    ) -> Result<(), RoleError> {
        self.http
            .add_member_role(
                *member.guild.as_u64(),
                *member.user.as_u64(),
                *role.as_u64(),
                Some(reason),
            )
            .await?;

        Ok(())
    }

    async fn remove_role(
        &self,
        member: MemberKey,
        role: RoleId,
        reason: &str,
    ) -> Result<(), RoleError> {
        self.http
            .remove_member_role(
                *member.guild.as_u64(),
                *member.user.as_u64(),
                *role.as_u64(),
                Some(reason),
            )
            .await?;

        Ok(())
    }
}

/// Spaces REST calls out so bursts of gateway events (a popular reaction
/// message, a raid of joins) don't run into Discord's bucket limits.
pub struct RateLimiter {
    spacing: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(spacing: Duration) -> Self {
        RateLimiter {
            spacing,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let slot = cmp::max(*next, Instant::now());
            *next = slot + self.spacing;
            slot
        };
        sleep_until(slot).await;
    }

    /// Holds back every caller until `delay` has passed.
    pub async fn pause_for(&self, delay: Duration) {
        let mut next = self.next_slot.lock().await;
        let until = Instant::now() + delay;
        if until > *next {
            *next = until;
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        RateLimiter::new(DEFAULT_REQUEST_SPACING)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        cmp::min(self.base.saturating_mul(factor), self.max)
    }

    pub async fn run<T, F, Fut>(&self, limiter: &RateLimiter, mut op: F) -> Result<T, RoleError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RoleError>>,
    {
        let mut attempt: u32 = 1;
        loop {
            limiter.acquire().await;
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    // a 429 means the whole bucket is exhausted, not just this call
                    if e == RoleError::RateLimited {
                        limiter.pause_for(delay).await;
                    }
                    warn!(
                        "Role request failed (attempt {}/{}), retrying in {}ms: {}",
                        attempt,
                        self.max_attempts,
                        delay.as_millis(),
                        e
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
