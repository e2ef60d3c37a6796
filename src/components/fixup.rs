use anyhow::Result;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serenity::{
    model::id::{ChannelId, MessageId},
    prelude::*,
};

use crate::{
    components::linker::{plan_edit, Component, LinkedEdit},
    helpers::*,
};

const MAX_LINKS: usize = 5;
const MAX_CONTENT: usize = 2000;
const OMITTED_NOTE: &str = "\n-# Some posts were omitted";

// characters allowed in a URI; `-` last so it isn't read as a range
const URI: &str = r"[A-Za-z0-9._~:/?#\[\]@!$&'()*+,;%=-]";

type Transformer = fn(&Captures) -> Option<String>;

static EMBED_SITES: Lazy<Vec<(Regex, Transformer)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(&format!(
                r"https://(?:(?:www|(?P<skin>old|new)|\w\w|(?P<subdomain>[A-Za-z0-9_]+))\.)?reddit\.com/+(?P<subreddit>r/+[A-Za-z0-9_]+/+)?(?P<post>{}+)",
                URI
            ))
            .expect("reddit pattern is valid"),
            reddit as Transformer,
        ),
        (
            Regex::new(&format!(
                r"https://(?:www\.)?(?P<site>x|twitter)\.com/(?P<post>{uri}+/status/{uri}+)",
                uri = URI
            ))
            .expect("twitter pattern is valid"),
            twitter as Transformer,
        ),
        (
            Regex::new(&format!(
                r"https://(?:www\.)?pixiv\.net/(?P<post>{uri}+/{uri}+)",
                uri = URI
            ))
            .expect("pixiv pattern is valid"),
            pixiv as Transformer,
        ),
    ]
});

static IGNORED_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"<https://{}+>", URI)).expect("ignored link pattern is valid")
});

fn group<'a>(caps: &'a Captures, name: &str) -> Option<&'a str> {
    caps.name(name).map(|m| m.as_str()).filter(|s| !s.is_empty())
}

fn reddit(caps: &Captures) -> Option<String> {
    // post links carry either a subdomain (the subreddit) or an /r/ path
    let subdomain = group(caps, "subdomain");
    let subreddit = group(caps, "subreddit");
    if subdomain.is_some() == subreddit.is_some() {
        return None;
    }
    let skin = group(caps, "skin")
        .map(|s| format!("{}.", s))
        .unwrap_or_default();
    let subreddit = match (subreddit, subdomain) {
        (Some(path), _) => format!(
            "r/{}",
            path.strip_prefix('r').unwrap_or(path).trim_matches('/')
        ),
        (None, Some(sub)) => format!("r/{}", sub),
        (None, None) => return None,
    };

    Some(format!(
        "https://{}rxddit.com/{}/{}",
        skin,
        subreddit,
        group(caps, "post")?
    ))
}

fn twitter(caps: &Captures) -> Option<String> {
    let mirror = match group(caps, "site")? {
        "x" => "fixupx",
        _ => "fxtwitter",
    };
    Some(format!("https://{}.com/{}", mirror, group(caps, "post")?))
}

fn pixiv(caps: &Captures) -> Option<String> {
    Some(format!("https://phixiv.net/{}", group(caps, "post")?))
}

#[derive(Debug, Clone, PartialEq)]
pub struct FixupReply {
    pub content: String,
    pub item_count: usize,
}

/// Rewrites social media links in `content` to mirrors that embed properly.
/// Returns `None` when there is nothing to rewrite.
pub fn process(content: &str) -> Option<FixupReply> {
    let content = IGNORED_LINK.replace_all(content, "");
    let mut links: Vec<String> = Vec::new();
    for (pattern, transformer) in EMBED_SITES.iter() {
        for caps in pattern.captures_iter(&content) {
            if let Some(link) = transformer(&caps) {
                if !links.contains(&link) {
                    links.push(link);
                }
            }
        }
    }
    if links.is_empty() {
        return None;
    }

    let mut omitted = false;
    if links.len() > MAX_LINKS {
        links.truncate(MAX_LINKS);
        omitted = true;
    }
    let mut joined = links.join(" ");
    while joined.len() > MAX_CONTENT {
        links.pop();
        omitted = true;
        joined = links.join(" ");
    }
    if links.is_empty() {
        return None;
    }
    if omitted {
        joined.push_str(OMITTED_NOTE);
    }

    Some(FixupReply {
        content: joined,
        item_count: links.len(),
    })
}

pub async fn handle(
    ctx: &Context,
    channel: ChannelId,
    source: MessageId,
    content: &str,
) -> Result<()> {
    match process(content) {
        Some(reply) => send(ctx, channel, source, &reply).await,
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
    let linked = links.lock().await.linker(Component::Fixup).get(source);
    match plan_edit(linked, process(content)) {
        LinkedEdit::Unchanged => (),
        LinkedEdit::Send(reply) => send(ctx, channel, source, &reply).await?,
        LinkedEdit::Update((reply_channel, reply_id), reply) => {
            suppress_embeds(ctx, channel, source).await;
            reply_channel
                .edit_message(&ctx.http, reply_id, |m| m.content(&reply.content))
                .await?;
        }
        LinkedEdit::Remove((reply_channel, reply_id)) => {
            links.lock().await.linker(Component::Fixup).take(source);
            reply_channel.delete_message(&ctx.http, reply_id).await?;
        }
    }

    Ok(())
}

async fn suppress_embeds(ctx: &Context, channel: ChannelId, source: MessageId) {
    if let Err(e) = channel
        .edit_message(&ctx.http, source, |m| m.suppress_embeds(true))
        .await
    {
        warn!("Error suppressing embeds: {}", e);
    }
}

async fn send(
    ctx: &Context,
    channel: ChannelId,
    source: MessageId,
    reply: &FixupReply,
) -> Result<()> {
    suppress_embeds(ctx, channel, source).await;
    let sent = channel
        .send_message(&ctx.http, |m| {
            m.content(&reply.content)
                .reference_message((channel, source))
                .allowed_mentions(|am| am.empty_parse().replied_user(false))
        })
        .await?;
    {
        let links = get_linker(ctx).await;
        let mut links = links.lock().await;
        links
            .linker(Component::Fixup)
            .link(source, sent.channel_id, sent.id);
    }
    debug!(
        "Fixed up {} link(s) in message {}",
        reply.item_count,
        source.as_u64()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_reddit_links() {
        let reply = process("look https://www.reddit.com/r/rust/comments/abc/title").unwrap();
        assert_eq!(reply.content, "https://rxddit.com/r/rust/comments/abc/title");

        let reply = process("https://old.reddit.com/r/rust/comments/abc").unwrap();
        assert_eq!(reply.content, "https://old.rxddit.com/r/rust/comments/abc");

        let reply = process("https://rust.reddit.com/comments/abc").unwrap();
        assert_eq!(reply.content, "https://rxddit.com/r/rust/comments/abc");

        // neither a subreddit nor a subreddit subdomain
        assert_eq!(process("https://reddit.com/comments/abc"), None);
    }

    #[test]
    fn rewrites_twitter_and_pixiv_links() {
        let reply = process(
            "https://x.com/user/status/1 https://twitter.com/user/status/2 https://www.pixiv.net/en/artworks/3",
        )
        .unwrap();
        assert_eq!(
            reply.content,
            "https://fixupx.com/user/status/1 https://fxtwitter.com/user/status/2 https://phixiv.net/en/artworks/3"
        );
        assert_eq!(reply.item_count, 3);
    }

    #[test]
    fn skips_suppressed_links_and_duplicates() {
        assert_eq!(process("<https://x.com/user/status/1>"), None);

        let reply = process("https://x.com/a/status/1 https://x.com/a/status/1").unwrap();
        assert_eq!(reply.item_count, 1);
        assert_eq!(process("https://x.com/user/likes"), None);
    }

    #[test]
    fn caps_link_count() {
        let content: Vec<String> = (0..7)
            .map(|i| format!("https://x.com/u/status/{}", i))
            .collect();
        let reply = process(&content.join(" ")).unwrap();
        assert_eq!(reply.item_count, 5);
        assert!(reply.content.ends_with(OMITTED_NOTE));
    }

    #[test]
    fn caps_content_length() {
        let long_id = "9".repeat(900);
        let content: Vec<String> = (0..3)
            .map(|i| format!("https://x.com/u/status/{}{}", i, long_id))
            .collect();
        let reply = process(&content.join(" ")).unwrap();
        assert_eq!(reply.item_count, 2);
        assert!(reply.content.ends_with(OMITTED_NOTE));
    }
}
