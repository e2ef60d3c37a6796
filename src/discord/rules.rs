use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::Path,
    str::FromStr,
};

use anyhow::{anyhow, Result};
use serde::Deserialize;
use serenity::model::{
    channel::ReactionType,
    id::{EmojiId, MessageId, RoleId},
};

/// An emoji as it appears in the rule file or on a gateway reaction event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EmojiKey {
    Unicode(String),
    Custom(EmojiId),
}

impl EmojiKey {
    fn unicode(raw: &str) -> Self {
        // clients disagree about sending the emoji presentation selector
        EmojiKey::Unicode(raw.trim().replace('\u{fe0f}', ""))
    }
}

impl FromStr for EmojiKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(anyhow!("Empty emoji in role rules"));
        }
        if let Ok(id) = s.parse::<u64>() {
            return Ok(EmojiKey::Custom(EmojiId(id)));
        }
        // <:name:id> or <a:name:id>
        if s.starts_with('<') && s.ends_with('>') {
            let id = s
                .trim_end_matches('>')
                .rsplit(':')
                .next()
                .and_then(|id| id.parse::<u64>().ok())
                .ok_or_else(|| anyhow!("Malformed custom emoji \"{}\"", s))?;
            return Ok(EmojiKey::Custom(EmojiId(id)));
        }

        Ok(EmojiKey::unicode(s))
    }
}

impl From<&ReactionType> for EmojiKey {
    fn from(reaction: &ReactionType) -> Self {
        match reaction {
            ReactionType::Custom { id, .. } => EmojiKey::Custom(*id),
            ReactionType::Unicode(s) => EmojiKey::unicode(s),
            other => EmojiKey::unicode(&other.to_string()),
        }
    }
}

impl fmt::Display for EmojiKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EmojiKey::Unicode(s) => write!(f, "{}", s),
            EmojiKey::Custom(id) => write!(f, "<:_:{}>", id.as_u64()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RoleRulesYaml {
    #[serde(default = "default_true")]
    ignore_bots: bool,
    #[serde(default)]
    join_roles: Vec<u64>,
    #[serde(default)]
    reaction_messages: Vec<ReactionMessageYaml>,
}

#[derive(Debug, Deserialize)]
struct ReactionMessageYaml {
    message_id: u64,
    #[serde(default)]
    exclusive: bool,
    #[serde(default = "default_true")]
    remove_on_unreact: bool,
    roles: Vec<ReactionRoleYaml>,
}

#[derive(Debug, Deserialize)]
struct ReactionRoleYaml {
    emoji: String,
    role_id: u64,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReactionMessage {
    pub exclusive: bool,
    pub remove_on_unreact: bool,
    pub roles: Vec<(EmojiKey, RoleId)>,
}

impl ReactionMessage {
    pub fn role_for(&self, emoji: &EmojiKey) -> Option<RoleId> {
        self.roles
            .iter()
            .find(|(e, _)| e == emoji)
            .map(|(_, role)| *role)
    }

    pub fn role_ids(&self) -> impl Iterator<Item = RoleId> + '_ {
        self.roles.iter().map(|(_, role)| *role)
    }
}

/// Declarative description of which roles the bot hands out and when.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleRules {
    pub ignore_bots: bool,
    pub join_roles: Vec<RoleId>,
    pub reaction_messages: HashMap<MessageId, ReactionMessage>,
}

impl Default for RoleRules {
    fn default() -> Self {
        RoleRules {
            ignore_bots: true,
            join_roles: Vec::new(),
            reaction_messages: HashMap::new(),
        }
    }
}

impl RoleRules {
    pub fn from_yaml(yaml_bytes: &[u8]) -> Result<Self> {
        // an empty file is a valid, if useless, configuration
        if yaml_bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(RoleRules::default());
        }
        let yaml: RoleRulesYaml = serde_yaml::from_slice(yaml_bytes)?;

        let mut join_roles: Vec<RoleId> = Vec::with_capacity(yaml.join_roles.len());
        for id in yaml.join_roles {
            let role = RoleId(id);
            if !join_roles.contains(&role) {
                join_roles.push(role);
            }
        }

        let mut reaction_messages = HashMap::with_capacity(yaml.reaction_messages.len());
        for message in yaml.reaction_messages {
            let message_id = MessageId(message.message_id);
            if reaction_messages.contains_key(&message_id) {
                return Err(anyhow!(
                    "Message {} appears more than once in role rules",
                    message.message_id
                ));
            }
            if message.roles.is_empty() {
                return Err(anyhow!(
                    "Message {} has no reaction roles",
                    message.message_id
                ));
            }

            let mut seen: HashSet<EmojiKey> = HashSet::with_capacity(message.roles.len());
            let mut roles = Vec::with_capacity(message.roles.len());
            for role in message.roles {
                let emoji: EmojiKey = role.emoji.parse()?;
                if !seen.insert(emoji.clone()) {
                    return Err(anyhow!(
                        "Emoji {} is used twice on message {}",
                        emoji,
                        message.message_id
                    ));
                }
                roles.push((emoji, RoleId(role.role_id)));
            }

            reaction_messages.insert(
                message_id,
                ReactionMessage {
                    exclusive: message.exclusive,
                    remove_on_unreact: message.remove_on_unreact,
                    roles,
                },
            );
        }

        Ok(RoleRules {
            ignore_bots: yaml.ignore_bots,
            join_roles,
            reaction_messages,
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| anyhow!("Couldn't read role rules at {}: {}", path.display(), e))?;

        RoleRules::from_yaml(&bytes)
    }

    #[inline]
    pub fn reaction_message(&self, message: MessageId) -> Option<&ReactionMessage> {
        self.reaction_messages.get(&message)
    }

    pub fn role_for(&self, message: MessageId, emoji: &EmojiKey) -> Option<RoleId> {
        self.reaction_message(message)
            .and_then(|m| m.role_for(emoji))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
join_roles: [10, 11, 10]
reaction_messages:
  - message_id: 500
    exclusive: true
    roles:
      - emoji: "🔴"
        role_id: 20
      - emoji: "<:rust:900>"
        role_id: 21
  - message_id: 501
    remove_on_unreact: false
    roles:
      - emoji: "✅"
        role_id: 30
"#;

    #[test]
    fn parses_rules_with_defaults() {
        let rules = RoleRules::from_yaml(RULES.as_bytes()).unwrap();
        assert!(rules.ignore_bots);
        assert_eq!(rules.join_roles, vec![RoleId(10), RoleId(11)]);

        let colors = rules.reaction_message(MessageId(500)).unwrap();
        assert!(colors.exclusive);
        assert!(colors.remove_on_unreact);
        assert_eq!(
            colors.role_for(&EmojiKey::Custom(EmojiId(900))),
            Some(RoleId(21))
        );

        let verify = rules.reaction_message(MessageId(501)).unwrap();
        assert!(!verify.exclusive);
        assert!(!verify.remove_on_unreact);
        assert_eq!(
            rules.role_for(MessageId(501), &"✅".parse().unwrap()),
            Some(RoleId(30))
        );
        assert_eq!(rules.role_for(MessageId(502), &"✅".parse().unwrap()), None);
    }

    #[test]
    fn empty_file_is_default() {
        assert_eq!(RoleRules::from_yaml(b"  \n").unwrap(), RoleRules::default());
    }

    #[test]
    fn rejects_duplicate_messages_and_emoji() {
        let dup_message = r#"
reaction_messages:
  - message_id: 1
    roles: [{ emoji: "a", role_id: 2 }]
  - message_id: 1
    roles: [{ emoji: "b", role_id: 3 }]
"#;
        assert!(RoleRules::from_yaml(dup_message.as_bytes()).is_err());

        let dup_emoji = r#"
reaction_messages:
  - message_id: 1
    roles:
      - { emoji: "<:x:7>", role_id: 2 }
      - { emoji: "7", role_id: 3 }
"#;
        assert!(RoleRules::from_yaml(dup_emoji.as_bytes()).is_err());
    }

    #[test]
    fn emoji_keys_from_strings_and_reactions() {
        assert_eq!(
            "<a:party:42>".parse::<EmojiKey>().unwrap(),
            EmojiKey::Custom(EmojiId(42))
        );
        assert_eq!(
            "42".parse::<EmojiKey>().unwrap(),
            EmojiKey::Custom(EmojiId(42))
        );
        assert!("<:broken:>".parse::<EmojiKey>().is_err());
        assert!("".parse::<EmojiKey>().is_err());

        let reaction = ReactionType::Unicode("\u{2764}\u{fe0f}".to_string());
        assert_eq!(
            EmojiKey::from(&reaction),
            "\u{2764}".parse::<EmojiKey>().unwrap()
        );
        let custom = ReactionType::Custom {
            animated: false,
            id: EmojiId(42),
            name: Some("party".to_string()),
        };
        assert_eq!(EmojiKey::from(&custom), EmojiKey::Custom(EmojiId(42)));
    }
}
