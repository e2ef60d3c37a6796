#[macro_use]
extern crate log;

mod components;
mod config;
mod discord;
mod error;
mod helpers;

use dotenv::dotenv;

use crate::{config::BotConfig, discord::rules::RoleRules, error::BotError};

#[tokio::main]
async fn main() -> Result<(), BotError> {
    dotenv().ok();
    env_logger::init();

    let config = BotConfig::from_env()?;
    let rules = RoleRules::load(&config.role_config)?;
    info!(
        "Loaded {} join role(s) and {} reaction message(s) from {}",
        rules.join_roles.len(),
        rules.reaction_messages.len(),
        config.role_config.display()
    );

    discord::session::run(config, rules).await
}
