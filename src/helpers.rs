use std::sync::Arc;

use serenity::{client::Context, prelude::*};

use crate::{
    components::{linker::ReplyLinks, xkcd::XkcdCache},
    config::BotConfig,
    discord::{roles::RoleEngine, session::SessionStatus},
};

pub struct EngineContainer;

impl TypeMapKey for EngineContainer {
    type Value = Arc<RoleEngine>;
}

pub struct StatusContainer;

impl TypeMapKey for StatusContainer {
    type Value = Arc<SessionStatus>;
}

pub struct ConfigContainer;

impl TypeMapKey for ConfigContainer {
    type Value = Arc<BotConfig>;
}

// source message id -> our replies, per component
pub struct LinkerContainer;

impl TypeMapKey for LinkerContainer {
    type Value = Arc<Mutex<ReplyLinks>>;
}

pub struct XkcdContainer;

impl TypeMapKey for XkcdContainer {
    type Value = Arc<XkcdCache>;
}

// everything below is inserted by session::run before the client starts, so
// a missing entry is a programming error rather than something to recover from

#[inline]
pub async fn get_engine(ctx: &Context) -> Arc<RoleEngine> {
    let data = ctx.data.read().await;
    data.get::<EngineContainer>()
        .cloned()
        .expect("Expected role engine in share map")
}

#[inline]
pub async fn get_status(ctx: &Context) -> Arc<SessionStatus> {
    let data = ctx.data.read().await;
    data.get::<StatusContainer>()
        .cloned()
        .expect("Expected session status in share map")
}

#[inline]
pub async fn get_config(ctx: &Context) -> Arc<BotConfig> {
    let data = ctx.data.read().await;
    data.get::<ConfigContainer>()
        .cloned()
        .expect("Expected bot config in share map")
}

#[inline]
pub async fn get_linker(ctx: &Context) -> Arc<Mutex<ReplyLinks>> {
    let data = ctx.data.read().await;
    data.get::<LinkerContainer>()
        .cloned()
        .expect("Expected message linker in share map")
}

#[inline]
pub async fn get_xkcd(ctx: &Context) -> Arc<XkcdCache> {
    let data = ctx.data.read().await;
    data.get::<XkcdContainer>()
        .cloned()
        .expect("Expected xkcd cache in share map")
}
