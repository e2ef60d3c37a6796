use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
    sync::Arc,
};

use serenity::model::id::{GuildId, MessageId, RoleId, UserId};
use tokio::sync::{Mutex, RwLock};

use crate::{
    discord::{
        rest::{RateLimiter, RetryPolicy, RoleClient},
        rules::{EmojiKey, RoleRules},
    },
    error::RoleError,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MemberKey {
    pub guild: GuildId,
    pub user: UserId,
}

impl MemberKey {
    pub fn new(guild: GuildId, user: UserId) -> Self {
        MemberKey { guild, user }
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "user {} in guild {}", self.user.as_u64(), self.guild.as_u64())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoleEvent {
    MemberJoined {
        member: MemberKey,
        is_bot: bool,
    },
    ReactionAdded {
        member: MemberKey,
        message: MessageId,
        emoji: EmojiKey,
    },
    ReactionRemoved {
        member: MemberKey,
        message: MessageId,
        emoji: EmojiKey,
    },
}

impl RoleEvent {
    pub fn member(&self) -> MemberKey {
        match self {
            RoleEvent::MemberJoined { member, .. }
            | RoleEvent::ReactionAdded { member, .. }
            | RoleEvent::ReactionRemoved { member, .. } => *member,
        }
    }

    /// Shows up in the guild audit log next to every mutation we make.
    fn audit_reason(&self) -> &'static str {
        match self {
            RoleEvent::MemberJoined { .. } => "Join role",
            RoleEvent::ReactionAdded { .. } => "Reaction role added",
            RoleEvent::ReactionRemoved { .. } => "Reaction role removed",
        }
    }

    /// Whether any rule could apply; lets us skip the member lookup for
    /// reactions on unrelated messages.
    fn is_relevant(&self, rules: &RoleRules) -> bool {
        match self {
            RoleEvent::MemberJoined { is_bot, .. } => {
                !rules.join_roles.is_empty() && !(*is_bot && rules.ignore_bots)
            }
            RoleEvent::ReactionAdded { message, emoji, .. }
            | RoleEvent::ReactionRemoved { message, emoji, .. } => {
                rules.role_for(*message, emoji).is_some()
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleDelta {
    pub add: BTreeSet<RoleId>,
    pub remove: BTreeSet<RoleId>,
}

impl RoleDelta {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }

    pub fn len(&self) -> usize {
        self.add.len() + self.remove.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationOutcome {
    pub applied: RoleDelta,
    /// Mutations that turned out to be satisfied already, e.g. a role that
    /// was deleted from the guild before we could remove it.
    pub skipped: RoleDelta,
}

/// Works out which roles `event` should change for a member currently
/// holding `current`. Only ever adds missing roles and removes held ones.
pub fn compute_delta(rules: &RoleRules, event: &RoleEvent, current: &HashSet<RoleId>) -> RoleDelta {
    let mut delta = RoleDelta::default();
    match event {
        RoleEvent::MemberJoined { is_bot, .. } => {
            if *is_bot && rules.ignore_bots {
                return delta;
            }
            delta.add.extend(
                rules
                    .join_roles
                    .iter()
                    .filter(|r| !current.contains(*r))
                    .copied(),
            );
        }
        RoleEvent::ReactionAdded { message, emoji, .. } => {
            let reaction_message = match rules.reaction_message(*message) {
                Some(m) => m,
                None => return delta,
            };
            let role = match reaction_message.role_for(emoji) {
                Some(r) => r,
                None => return delta,
            };
            if !current.contains(&role) {
                delta.add.insert(role);
            }
            if reaction_message.exclusive {
                delta.remove.extend(
                    reaction_message
                        .role_ids()
                        .filter(|r| *r != role && current.contains(r)),
                );
            }
        }
        RoleEvent::ReactionRemoved { message, emoji, .. } => {
            let reaction_message = match rules.reaction_message(*message) {
                Some(m) => m,
                None => return delta,
            };
            if !reaction_message.remove_on_unreact {
                return delta;
            }
            if let Some(role) = reaction_message.role_for(emoji) {
                if current.contains(&role) {
                    delta.remove.insert(role);
                }
            }
        }
    }

    // a role configured twice must not be both granted and taken away
    let add = delta.add.clone();
    delta.remove.retain(|r| !add.contains(r));

    delta
}

/// Hands out one async mutex per member so events for the same member are
/// applied in arrival order while different members proceed in parallel.
#[derive(Default)]
struct MemberLocks {
    locks: std::sync::Mutex<HashMap<MemberKey, Arc<Mutex<()>>>>,
}

impl MemberLocks {
    fn get(&self, member: MemberKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(member).or_default().clone()
    }

    fn release(&self, member: MemberKey) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = locks.get(&member) {
            // the map holds one reference; anything above that is a waiter
            if Arc::strong_count(lock) == 1 {
                locks.remove(&member);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

pub struct RoleEngine {
    rules: RwLock<Arc<RoleRules>>,
    client: Arc<dyn RoleClient>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    locks: MemberLocks,
}

impl RoleEngine {
    pub fn new(rules: RoleRules, client: Arc<dyn RoleClient>) -> Self {
        RoleEngine::with_policy(rules, client, RateLimiter::default(), RetryPolicy::default())
    }

    pub fn with_policy(
        rules: RoleRules,
        client: Arc<dyn RoleClient>,
        limiter: RateLimiter,
        retry: RetryPolicy,
    ) -> Self {
        RoleEngine {
            rules: RwLock::new(Arc::new(rules)),
            client,
            limiter,
            retry,
            locks: MemberLocks::default(),
        }
    }

    pub async fn rules(&self) -> Arc<RoleRules> {
        self.rules.read().await.clone()
    }

    pub async fn replace_rules(&self, rules: RoleRules) {
        *self.rules.write().await = Arc::new(rules);
    }

    pub async fn handle(&self, event: &RoleEvent) -> Result<MutationOutcome, RoleError> {
        let rules = self.rules().await;
        if !event.is_relevant(&rules) {
            return Ok(MutationOutcome::default());
        }

        let member = event.member();
        let lock = self.locks.get(member);
        let result = {
            let _guard = lock.lock().await;
            self.apply(&rules, event, member).await
        };
        drop(lock);
        self.locks.release(member);

        result
    }

    async fn apply(
        &self,
        rules: &RoleRules,
        event: &RoleEvent,
        member: MemberKey,
    ) -> Result<MutationOutcome, RoleError> {
        let client = self.client.as_ref();
        let current = self
            .retry
            .run(&self.limiter, move || client.member_roles(member))
            .await?;
        let delta = compute_delta(rules, event, &current);
        let mut outcome = MutationOutcome::default();
        if delta.is_empty() {
            debug!("Nothing to change for {}", member);
            return Ok(outcome);
        }
        let reason = event.audit_reason();

        // removals first so an exclusive group never holds two roles at once
        for role in delta.remove {
            let result = self
                .retry
                .run(&self.limiter, move || client.remove_role(member, role, reason))
                .await;
            match result {
                Ok(()) => {
                    outcome.applied.remove.insert(role);
                }
                Err(RoleError::NotFound(details)) => {
                    debug!(
                        "Role {} already gone for {}: {}",
                        role.as_u64(),
                        member,
                        details
                    );
                    outcome.skipped.remove.insert(role);
                }
                Err(e) => return Err(e),
            }
        }
        for role in delta.add {
            self.retry
                .run(&self.limiter, move || client.add_role(member, role, reason))
                .await?;
            outcome.applied.add.insert(role);
        }
        info!(
            "Updated roles for {}: +{:?} -{:?}",
            member,
            outcome.applied.add.iter().map(|r| r.as_u64()).collect::<Vec<_>>(),
            outcome.applied.remove.iter().map(|r| r.as_u64()).collect::<Vec<_>>()
        );

        Ok(outcome)
    }

    #[cfg(test)]
    fn tracked_members(&self) -> usize {
        self.locks.len()
    }
}
