use std::{collections::HashMap, time::Duration};

use anyhow::Result;
use chrono::NaiveDate;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serenity::{
    builder::CreateEmbed,
    model::id::{ChannelId, MessageId},
    prelude::*,
    utils::Colour,
};
use tokio::time::Instant;
use url::Url;

use crate::{
    components::linker::{plan_edit, Component, LinkedEdit},
    helpers::*,
};

const XKCD_BASE: &str = "https://xkcd.com/";
const CACHE_TTL: Duration = Duration::from_secs(12 * 60 * 60);
const MAX_EMBEDS: usize = 10;
const SUPPORTED_IMAGE_FORMATS: [&str; 6] = ["avif", "gif", "jpeg", "jpg", "png", "webp"];

const RED: u32 = 0xE74C3C;
const ORANGE: u32 = 0xE67E22;
const YELLOW: u32 = 0xF1C40F;

static XKCD_MENTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bxkcd#(\d+)").expect("xkcd pattern is valid"));

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Comic {
    pub num: u32,
    pub day: String,
    pub month: String,
    pub year: String,
    pub title: String,
    pub img: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub transcript: String,
    pub alt: String,
    #[serde(default)]
    pub extra_parts: Option<serde_json::Value>,
}

impl Comic {
    pub fn url(&self) -> String {
        format!("{}{}", XKCD_BASE, self.num)
    }

    fn date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(
            self.year.parse().ok()?,
            self.month.parse().ok()?,
            self.day.parse().ok()?,
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum XkcdResult {
    Found(Box<Comic>),
    Unknown(u32),
    FetchFailed(u32),
}

/// Plain description of an embed, turned into a serenity builder only when
/// sending.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbedSpec {
    pub title: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub footer: String,
    pub color: Option<u32>,
    pub notes: Vec<String>,
}

impl EmbedSpec {
    fn footer_only(footer: String, color: u32) -> Self {
        EmbedSpec {
            footer,
            color: Some(color),
            ..Default::default()
        }
    }

    fn to_builder(&self) -> CreateEmbed {
        let mut embed = CreateEmbed::default();
        if let Some(title) = &self.title {
            embed.title(title);
        }
        if let Some(url) = &self.url {
            embed.url(url);
        }
        if let Some(description) = &self.description {
            embed.description(description);
        }
        if let Some(image) = &self.image {
            embed.image(image);
        }
        if let Some(color) = self.color {
            embed.colour(Colour::new(color));
        }
        for note in &self.notes {
            embed.field("\u{200b}", note, false);
        }
        embed.footer(|f| f.text(&self.footer));

        embed
    }
}

/// Comic ids mentioned as `xkcd#N`, deduplicated in order of appearance.
pub fn mentions(content: &str) -> Vec<u32> {
    let mut ids: Vec<u32> = Vec::new();
    for caps in XKCD_MENTION.captures_iter(content) {
        if let Ok(id) = caps[1].parse::<u32>() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }

    ids
}

pub fn embed_for(result: &XkcdResult) -> EmbedSpec {
    match result {
        XkcdResult::Found(comic) => {
            let footer = match comic.date() {
                Some(date) => format!("{} • {}", comic.alt, date.format("%B %-d, %Y")),
                None => comic.alt.clone(),
            };
            let mut embed = EmbedSpec {
                title: Some(comic.title.clone()),
                url: Some(comic.url()),
                footer,
                ..Default::default()
            };
            // interactive comics sometimes point `img` at a directory, so
            // check the extension instead of trusting the field
            let ext = comic.img.rsplit('.').next().unwrap_or_default();
            if comic.img.contains('.') && SUPPORTED_IMAGE_FORMATS.contains(&ext) {
                embed.image = Some(comic.img.clone());
            } else if !comic.transcript.is_empty() {
                embed.description = Some(comic.transcript.clone());
            }
            if comic.extra_parts.is_some() {
                embed.notes.push(format!(
                    "*This is an interactive comic; [press here]({}) to view it on xkcd.com.*",
                    comic.url()
                ));
                embed.color = Some(YELLOW);
            }
            if !comic.link.is_empty() {
                embed
                    .notes
                    .push(format!("[Press here]({}) to view the image's link.", comic.link));
            }
            embed
        }
        XkcdResult::Unknown(id) => {
            EmbedSpec::footer_only(format!("xkcd #{} does not exist", id), RED)
        }
        XkcdResult::FetchFailed(id) => {
            EmbedSpec::footer_only(format!("Unable to fetch xkcd #{}", id), RED)
        }
    }
}

/// Keeps a message under Discord's embed limit, replacing the tail with a
/// note saying how many comics were left out.
pub fn limit_embeds(mut embeds: Vec<EmbedSpec>) -> Vec<EmbedSpec> {
    if embeds.len() <= MAX_EMBEDS {
        return embeds;
    }
    let omitted = embeds.len() - (MAX_EMBEDS - 1);
    embeds.truncate(MAX_EMBEDS - 1);
    embeds.push(EmbedSpec::footer_only(
        format!("{} xkcd comics were omitted", omitted),
        ORANGE,
    ));

    embeds
}

/// Comic lookups, including failed ones, kept for `CACHE_TTL`.
pub struct XkcdCache {
    client: reqwest::Client,
    ttl: Duration,
    entries: Mutex<HashMap<u32, (Instant, XkcdResult)>>,
}

impl XkcdCache {
    pub fn new(ttl: Duration) -> Self {
        XkcdCache {
            client: reqwest::Client::new(),
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn cached(&self, id: u32) -> Option<XkcdResult> {
        let entries = self.entries.lock().await;
        entries
            .get(&id)
            .filter(|(stored, _)| stored.elapsed() < self.ttl)
            .map(|(_, result)| result.clone())
    }

    async fn store(&self, id: u32, result: XkcdResult) {
        let mut entries = self.entries.lock().await;
        entries.retain(|_, (stored, _)| stored.elapsed() < self.ttl);
        entries.insert(id, (Instant::now(), result));
    }

    pub async fn get(&self, id: u32) -> XkcdResult {
        if let Some(result) = self.cached(id).await {
            return result;
        }
        let result = self.fetch(id).await;
        self.store(id, result.clone()).await;

        result
    }

    async fn fetch(&self, id: u32) -> XkcdResult {
        let url = match Url::parse(XKCD_BASE).and_then(|u| u.join(&format!("{}/info.0.json", id)))
        {
            Ok(u) => u,
            Err(_) => return XkcdResult::FetchFailed(id),
        };
        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("Error fetching xkcd #{}: {}", id, e);
                return XkcdResult::FetchFailed(id);
            }
        };
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return XkcdResult::Unknown(id);
        }
        if !response.status().is_success() {
            return XkcdResult::FetchFailed(id);
        }
        match response.json::<Comic>().await {
            Ok(comic) => XkcdResult::Found(Box::new(comic)),
            Err(e) => {
                warn!("Error parsing xkcd #{}: {}", id, e);
                XkcdResult::FetchFailed(id)
            }
        }
    }

    #[cfg(test)]
    async fn insert_at(&self, id: u32, stored: Instant, result: XkcdResult) {
        self.entries.lock().await.insert(id, (stored, result));
    }
}

impl Default for XkcdCache {
    fn default() -> Self {
        XkcdCache::new(CACHE_TTL)
    }
}

/// Embeds for every comic mentioned in `content`, `None` when there are no
/// mentions.
async fn process(ctx: &Context, content: &str) -> Option<Vec<CreateEmbed>> {
    let ids = mentions(content);
    if ids.is_empty() {
        return None;
    }

    let cache = get_xkcd(ctx).await;
    let results = join_all(ids.iter().map(|id| cache.get(*id))).await;
    let embeds = limit_embeds(results.iter().map(embed_for).collect())
        .iter()
        .map(EmbedSpec::to_builder)
        .collect();

    Some(embeds)
}

pub async fn handle(
    ctx: &Context,
    channel: ChannelId,
    source: MessageId,
    content: &str,
) -> Result<()> {
    match process(ctx, content).await {
        Some(embeds) => send(ctx, channel, source, embeds).await,
        None => Ok(()),
    }
}

/// Brings the reply in line with an edited source message.
pub async fn handle_edit(
    ctx: &Context,
    channel: ChannelId,
    source: MessageId,
    content: &str,
) -> Result<()> {
    let links = get_linker(ctx).await;
    let linked = links.lock().await.linker(Component::Xkcd).get(source);
    match plan_edit(linked, process(ctx, content).await) {
        LinkedEdit::Unchanged => (),
        LinkedEdit::Send(embeds) => send(ctx, channel, source, embeds).await?,
        LinkedEdit::Update((reply_channel, reply_id), embeds) => {
            reply_channel
                .edit_message(&ctx.http, reply_id, |m| m.set_embeds(embeds))
                .await?;
        }
        LinkedEdit::Remove((reply_channel, reply_id)) => {
            links.lock().await.linker(Component::Xkcd).take(source);
            reply_channel.delete_message(&ctx.http, reply_id).await?;
        }
    }

    Ok(())
}

async fn send(
    ctx: &Context,
    channel: ChannelId,
    source: MessageId,
    embeds: Vec<CreateEmbed>,
) -> Result<()> {
    let sent = channel
        .send_message(&ctx.http, |m| {
            m.add_embeds(embeds)
                .reference_message((channel, source))
                .allowed_mentions(|am| am.empty_parse().replied_user(false))
        })
        .await?;
    {
        let links = get_linker(ctx).await;
        let mut links = links.lock().await;
        links
            .linker(Component::Xkcd)
            .link(source, sent.channel_id, sent.id);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comic() -> Comic {
        serde_json::from_str(
            r#"{
                "month": "3", "num": 353, "link": "", "year": "2007", "news": "",
                "safe_title": "Python", "transcript": "[[ Guy 1 is talking to Guy 2 ]]",
                "alt": "I wrote 20 short programs in Python yesterday.",
                "img": "https://imgs.xkcd.com/comics/python.png",
                "title": "Python", "day": "5"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn finds_unique_mentions() {
        assert_eq!(mentions("see XKCD#353 and xkcd#927, also xkcd#353"), vec![353, 927]);
        assert!(mentions("myxkcd#1 xkcd#").is_empty());
    }

    #[test]
    fn builds_comic_embeds() {
        let embed = embed_for(&XkcdResult::Found(Box::new(comic())));
        assert_eq!(embed.title.as_deref(), Some("Python"));
        assert_eq!(embed.url.as_deref(), Some("https://xkcd.com/353"));
        assert_eq!(
            embed.image.as_deref(),
            Some("https://imgs.xkcd.com/comics/python.png")
        );
        assert_eq!(embed.description, None);
        assert_eq!(
            embed.footer,
            "I wrote 20 short programs in Python yesterday. • March 5, 2007"
        );
        assert!(embed.notes.is_empty());
    }

    #[test]
    fn interactive_comics_fall_back_to_transcript() {
        let mut interactive = comic();
        interactive.img = "https://imgs.xkcd.com/comics/".to_string();
        interactive.extra_parts = Some(serde_json::json!({ "pre": "" }));
        let embed = embed_for(&XkcdResult::Found(Box::new(interactive)));
        assert_eq!(embed.image, None);
        assert_eq!(
            embed.description.as_deref(),
            Some("[[ Guy 1 is talking to Guy 2 ]]")
        );
        assert_eq!(embed.color, Some(YELLOW));
        assert_eq!(embed.notes.len(), 1);
    }

    #[test]
    fn failed_lookups_get_red_footers() {
        assert_eq!(
            embed_for(&XkcdResult::Unknown(99999)).footer,
            "xkcd #99999 does not exist"
        );
        let failed = embed_for(&XkcdResult::FetchFailed(1));
        assert_eq!(failed.footer, "Unable to fetch xkcd #1");
        assert_eq!(failed.color, Some(RED));
    }

    #[test]
    fn limits_embed_count() {
        let embeds: Vec<EmbedSpec> = (0..12)
            .map(|i| embed_for(&XkcdResult::Unknown(i)))
            .collect();
        let limited = limit_embeds(embeds);
        assert_eq!(limited.len(), 10);
        assert_eq!(limited[9].footer, "3 xkcd comics were omitted");

        let exact: Vec<EmbedSpec> = (0..10)
            .map(|i| embed_for(&XkcdResult::Unknown(i)))
            .collect();
        assert_eq!(limit_embeds(exact).len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_serves_fresh_entries() {
        let cache = XkcdCache::new(Duration::from_secs(60));
        cache
            .insert_at(5, Instant::now(), XkcdResult::Unknown(5))
            .await;
        assert_eq!(cache.cached(5).await, Some(XkcdResult::Unknown(5)));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.cached(5).await, None);
    }
}
