use serenity::model::gateway::GatewayIntents;

pub mod commands;
pub mod handler;
pub mod rest;
pub mod roles;
pub mod rules;
pub mod session;

/// GUILD_MEMBERS and MESSAGE_CONTENT are privileged: they have to be enabled
/// for the application in the developer portal or the gateway refuses to
/// identify.
pub fn intents() -> GatewayIntents {
    let mut intents: GatewayIntents = GatewayIntents::empty();
    intents.insert(GatewayIntents::GUILDS);
    intents.insert(GatewayIntents::GUILD_MEMBERS);
    intents.insert(GatewayIntents::GUILD_MESSAGES);
    intents.insert(GatewayIntents::GUILD_MESSAGE_REACTIONS);
    intents.insert(GatewayIntents::DIRECT_MESSAGES);
    intents.insert(GatewayIntents::MESSAGE_CONTENT);

    intents
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_member_and_reaction_events() {
        let intents = intents();
        assert!(intents.contains(GatewayIntents::GUILD_MEMBERS));
        assert!(intents.contains(GatewayIntents::GUILD_MESSAGE_REACTIONS));
        assert!(intents.contains(GatewayIntents::MESSAGE_CONTENT));
    }
}
