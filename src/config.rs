use std::{env, path::PathBuf};

use anyhow::{anyhow, Result};
use serenity::model::id::{ChannelId, GuildId, RoleId};

pub const DEFAULT_ROLE_CONFIG: &str = "roles.yaml";

/// Process configuration, read from the environment (and `.env`, which
/// `main` loads before anything else).
#[derive(Debug, Clone, PartialEq)]
pub struct BotConfig {
    pub token: String,
    pub guild_id: Option<GuildId>,
    pub log_channel_id: Option<ChannelId>,
    pub mod_role_id: Option<RoleId>,
    pub role_config: PathBuf,
}

impl BotConfig {
    pub fn from_env() -> Result<Self> {
        BotConfig::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = lookup("DISCORD_TOKEN")
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| anyhow!("Expected DISCORD_TOKEN in the environment"))?;

        Ok(BotConfig {
            token,
            guild_id: parse_id(&lookup, "BOT_GUILD_ID")?.map(GuildId),
            log_channel_id: parse_id(&lookup, "BOT_LOG_CHANNEL_ID")?.map(ChannelId),
            mod_role_id: parse_id(&lookup, "BOT_MOD_ROLE_ID")?.map(RoleId),
            role_config: lookup("ROLE_CONFIG")
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_ROLE_CONFIG.to_string())
                .into(),
        })
    }
}

fn parse_id<F>(lookup: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| anyhow!("Error parsing {} \"{}\": {}", key, raw, e)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn reads_required_and_optional_values() {
        let config = BotConfig::from_lookup(lookup(&[
            ("DISCORD_TOKEN", "abc"),
            ("BOT_GUILD_ID", " 42 "),
            ("BOT_MOD_ROLE_ID", "7"),
            ("BOT_LOG_CHANNEL_ID", ""),
        ]))
        .unwrap();
        assert_eq!(config.token, "abc");
        assert_eq!(config.guild_id, Some(GuildId(42)));
        assert_eq!(config.mod_role_id, Some(RoleId(7)));
        assert_eq!(config.log_channel_id, None);
        assert_eq!(config.role_config, PathBuf::from(DEFAULT_ROLE_CONFIG));
    }

    #[test]
    fn missing_token_is_an_error() {
        assert!(BotConfig::from_lookup(lookup(&[])).is_err());
        assert!(BotConfig::from_lookup(lookup(&[("DISCORD_TOKEN", "  ")])).is_err());
    }

    #[test]
    fn malformed_ids_are_errors() {
        let result = BotConfig::from_lookup(lookup(&[
            ("DISCORD_TOKEN", "abc"),
            ("BOT_GUILD_ID", "my-guild"),
        ]));
        assert!(result.is_err());
    }
}
