use serenity::{
    async_trait,
    model::{
        channel::{Message, Reaction},
        event::{MessageUpdateEvent, ResumedEvent},
        gateway::Ready,
        guild::Member,
        id::{ChannelId, GuildId, MessageId},
    },
    prelude::*,
};

use crate::{
    components::handle_edit,
    config::BotConfig,
    discord::{
        roles::{MemberKey, RoleEvent},
        rules::EmojiKey,
    },
    helpers::*,
};

pub struct Handler;

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        let config = get_config(&ctx).await;
        let guilds: Vec<GuildId> = ready.guilds.iter().map(|g| g.id).collect();
        let working_guild = resolve_guild(config.guild_id, &guilds);
        match (config.guild_id, working_guild) {
            (Some(configured), Some(found)) if configured == found => (),
            (_, Some(found)) => info!(
                "BOT_GUILD_ID unset or specified guild not found; using bot's first guild: {}",
                found.as_u64()
            ),
            (_, None) => warn!("Connected without any guilds"),
        }
        get_status(&ctx).await.record_ready(working_guild);
        info!("{} is connected!", ready.user.name);
    }

    async fn resume(&self, ctx: Context, _: ResumedEvent) {
        get_status(&ctx).await.record_resume();
        info!("Resumed");
    }

    async fn guild_member_addition(&self, ctx: Context, new_member: Member) {
        let event = RoleEvent::MemberJoined {
            member: MemberKey::new(new_member.guild_id, new_member.user.id),
            is_bot: new_member.user.bot,
        };
        dispatch(&ctx, event).await;
    }

    async fn reaction_add(&self, ctx: Context, add_reaction: Reaction) {
        if let Some(member) = reaction_member(&ctx, &add_reaction) {
            let event = RoleEvent::ReactionAdded {
                member,
                message: add_reaction.message_id,
                emoji: EmojiKey::from(&add_reaction.emoji),
            };
            dispatch(&ctx, event).await;
        }
    }

    async fn reaction_remove(&self, ctx: Context, removed_reaction: Reaction) {
        if let Some(member) = reaction_member(&ctx, &removed_reaction) {
            let event = RoleEvent::ReactionRemoved {
                member,
                message: removed_reaction.message_id,
                emoji: EmojiKey::from(&removed_reaction.emoji),
            };
            dispatch(&ctx, event).await;
        }
    }

    async fn message_delete(
        &self,
        ctx: Context,
        _channel_id: ChannelId,
        deleted_message_id: MessageId,
        _guild_id: Option<GuildId>,
    ) {
        let replies = {
            let links = get_linker(&ctx).await;
            let mut links = links.lock().await;
            links.take_all(deleted_message_id)
        };
        for (channel, reply_id) in replies {
            if let Err(e) = channel.delete_message(&ctx.http, reply_id).await {
                warn!("Error deleting linked reply: {}", e);
            }
        }
    }

    async fn message_update(
        &self,
        ctx: Context,
        old_if_available: Option<Message>,
        _new: Option<Message>,
        event: MessageUpdateEvent,
    ) {
        handle_edit(&ctx, old_if_available.as_ref(), &event).await;
    }
}

/// The configured guild if the bot is in it, otherwise the first guild the
/// gateway told us about.
pub fn resolve_guild(configured: Option<GuildId>, guilds: &[GuildId]) -> Option<GuildId> {
    match configured {
        Some(id) if guilds.contains(&id) => Some(id),
        _ => guilds.first().copied(),
    }
}

#[inline]
fn in_scope(config: &BotConfig, guild: GuildId) -> bool {
    config.guild_id.map_or(true, |configured| configured == guild)
}

fn reaction_member(ctx: &Context, reaction: &Reaction) -> Option<MemberKey> {
    // DM reactions and partial events without a user carry nothing we can act on
    let guild = reaction.guild_id?;
    let user = reaction.user_id?;
    if user == ctx.cache.current_user_id() {
        return None;
    }

    Some(MemberKey::new(guild, user))
}

async fn dispatch(ctx: &Context, event: RoleEvent) {
    let config = get_config(ctx).await;
    let member = event.member();
    if !in_scope(&config, member.guild) {
        return;
    }

    let engine = get_engine(ctx).await;
    match engine.handle(&event).await {
        Ok(outcome) => {
            if !outcome.skipped.is_empty() {
                debug!(
                    "Skipped {} already satisfied role change(s) for {}",
                    outcome.skipped.len(),
                    member
                );
            }
        }
        Err(e) => {
            warn!("Couldn't update roles for {}: {}", member, e);
            let report = format!(
                "Couldn't update roles for <@{}>: {}",
                member.user.as_u64(),
                e
            );
            report_failure(ctx, &config, &report).await;
        }
    }
}

async fn report_failure(ctx: &Context, config: &BotConfig, text: &str) {
    let channel = match config.log_channel_id {
        Some(c) => c,
        None => return,
    };
    let _ = channel
        .send_message(&ctx.http, |m| {
            m.content(text).allowed_mentions(|am| am.empty_parse())
        })
        .await
        .map_err(|e| warn!("Error reporting to log channel: {}", e));
}
