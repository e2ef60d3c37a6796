use anyhow::{anyhow, Result};
use serenity::{
    framework::standard::{
        macros::{command, group, hook},
        CommandError, CommandResult,
    },
    model::{
        channel::{Message, ReactionType},
        id::{GuildId, RoleId, UserId},
    },
    prelude::*,
    utils::MessageBuilder,
};

use crate::{
    components::{handle_message, is_regular_message},
    discord::{rules::RoleRules, session::StatusSnapshot},
    helpers::*,
};

// commands that get a thumbs up/down instead of (or as well as) a reply
const REACT_COMMANDS: [&str; 1] = ["reloadroles"];

#[derive(Debug, Copy, Clone, PartialEq, PartialOrd)]
pub enum Permission {
    None,
    Mod,
}

pub fn determine_permission(
    owner: UserId,
    user: UserId,
    roles: &[RoleId],
    mod_role: Option<RoleId>,
    is_admin: bool,
) -> Permission {
    if owner == user || is_admin {
        return Permission::Mod;
    }
    match mod_role {
        Some(role) if roles.contains(&role) => Permission::Mod,
        _ => Permission::None,
    }
}

async fn check_permissions(ctx: &Context, msg: &Message) -> Result<Permission> {
    let guild = msg
        .guild(&ctx)
        .ok_or_else(|| anyhow!("Guild for message {} isn't cached", msg.id.as_u64()))?;
    if guild.owner_id == msg.author.id {
        return Ok(Permission::Mod); // owner can do any command
    }
    let member = msg.member(&ctx).await?;
    let is_admin = guild
        .member_permissions(ctx, msg.author.id)
        .await?
        .administrator();
    let config = get_config(ctx).await;

    Ok(determine_permission(
        guild.owner_id,
        msg.author.id,
        &member.roles,
        config.mod_role_id,
        is_admin,
    ))
}

#[hook]
pub async fn before_hook(ctx: &Context, msg: &Message, cmd_name: &str) -> bool {
    // every command here changes or exposes bot state, so they are all
    // moderator-only and guild-only
    if msg.guild_id.is_none() {
        return false;
    }
    match check_permissions(ctx, msg).await {
        Ok(Permission::Mod) => true,
        Ok(Permission::None) => {
            info!(
                "User \"{}\" does not have permission to run \"{}\"",
                &msg.author.name, cmd_name
            );
            false
        }
        Err(e) => {
            warn!("Error checking permissions for \"{}\": {}", cmd_name, e);
            false
        }
    }
}

#[hook]
pub async fn after_hook(
    ctx: &Context,
    msg: &Message,
    cmd_name: &str,
    error: Result<(), CommandError>,
) {
    let mut successful: bool = true;
    if let Err(e) = error {
        successful = false;
        warn!(
            "Error running \"{}\" command from user \"{}\": {:?}",
            cmd_name, &msg.author.name, e
        );
    }
    if REACT_COMMANDS.iter().any(|&c| c == cmd_name) {
        let reaction = match successful {
            true => ReactionType::Unicode("\u{1f44d}".to_string()),
            false => ReactionType::Unicode("\u{1f44e}".to_string()),
        };
        if let Err(e) = msg.react(&ctx, reaction).await {
            warn!(
                "Error reacting to command \"{}\" from user \"{}\": {}",
                cmd_name, &msg.author.name, e
            );
        }
    }
    if successful {
        info!("Successfully executed command: {}", cmd_name);
    }
}

/// Liveness probe over DM. Anything else sent in a DM is handled like a guild
/// message.
#[inline]
pub fn is_dm_ping(guild: Option<GuildId>, content: &str) -> bool {
    guild.is_none() && content == "ping"
}

#[hook]
pub async fn normal_message_hook(ctx: &Context, msg: &Message) {
    if msg.author.bot || !is_regular_message(msg) {
        return;
    }
    if is_dm_ping(msg.guild_id, &msg.content) {
        debug!("ping sent by {}", &msg.author.name);
        if let Err(e) = msg.channel_id.say(&ctx.http, "pong").await {
            warn!("Error answering ping from \"{}\": {}", &msg.author.name, e);
        }
        return;
    }

    handle_message(ctx, msg).await;
}

#[group]
#[commands(reloadroles, status)]
struct General;

#[command]
pub async fn reloadroles(ctx: &Context, msg: &Message) -> CommandResult {
    let config = get_config(ctx).await;
    let rules = RoleRules::load(&config.role_config)?;
    let summary = format!(
        "Loaded {} join role(s) and {} reaction message(s) from {}",
        rules.join_roles.len(),
        rules.reaction_messages.len(),
        config.role_config.display()
    );
    get_engine(ctx).await.replace_rules(rules).await;
    info!("{}", summary);
    msg.reply(&ctx, summary).await?;

    Ok(())
}

#[command]
pub async fn status(ctx: &Context, msg: &Message) -> CommandResult {
    let snapshot = get_status(ctx).await.snapshot();
    let reply = MessageBuilder::new()
        .push_codeblock(format_status(&snapshot), None)
        .build();
    msg.channel_id.say(&ctx.http, reply).await?;

    Ok(())
}

pub fn format_status(snapshot: &StatusSnapshot) -> String {
    let uptime = snapshot.uptime;
    let never = || "never".to_string();
    let latency = snapshot
        .latency
        .map(|l| format!("{}ms", l.as_millis()))
        .unwrap_or_else(|| "unknown".to_string());

    format!(
        "uptime: {}d {}h {}m\nlast login: {}\nlast resume: {}\nguild: {}\nreconnects: {}\nshards: {}\nlatency: {}",
        uptime.num_days(),
        uptime.num_hours() % 24,
        uptime.num_minutes() % 60,
        snapshot
            .last_ready
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(never),
        snapshot
            .last_resume
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(never),
        snapshot
            .working_guild
            .map(|g| g.as_u64().to_string())
            .unwrap_or_else(|| "none".to_string()),
        snapshot.reconnects,
        snapshot.shards_connected,
        latency,
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;

    #[test]
    fn owners_admins_and_mods_have_permission() {
        let owner = UserId(1);
        let user = UserId(2);
        let mod_role = Some(RoleId(50));

        assert_eq!(
            determine_permission(owner, owner, &[], mod_role, false),
            Permission::Mod
        );
        assert_eq!(
            determine_permission(owner, user, &[], mod_role, true),
            Permission::Mod
        );
        assert_eq!(
            determine_permission(owner, user, &[RoleId(7), RoleId(50)], mod_role, false),
            Permission::Mod
        );
        assert_eq!(
            determine_permission(owner, user, &[RoleId(7)], mod_role, false),
            Permission::None
        );
        assert_eq!(
            determine_permission(owner, user, &[RoleId(50)], None, false),
            Permission::None
        );
    }

    #[test]
    fn only_exact_dm_pings_are_answered_directly() {
        assert!(is_dm_ping(None, "ping"));
        assert!(!is_dm_ping(Some(GuildId(1)), "ping"));
        // other DMs still reach the message components
        assert!(!is_dm_ping(None, "ping https://x.com/u/status/1"));
        assert!(!is_dm_ping(None, "xkcd#927"));
    }

    #[test]
    fn formats_status_report() {
        let snapshot = StatusSnapshot {
            uptime: chrono::Duration::minutes(60 * 26 + 5),
            last_ready: Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()),
            last_resume: None,
            working_guild: Some(GuildId(77)),
            reconnects: 2,
            shards_connected: 1,
            latency: Some(Duration::from_millis(42)),
        };
        assert_eq!(
            format_status(&snapshot),
            "uptime: 1d 2h 5m\nlast login: 2024-01-02 03:04:05 UTC\nlast resume: never\nguild: 77\nreconnects: 2\nshards: 1\nlatency: 42ms"
        );
    }
}
