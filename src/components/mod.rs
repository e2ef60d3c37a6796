use futures::join;
use serenity::{
    model::{
        channel::{Message, MessageType},
        event::MessageUpdateEvent,
    },
    prelude::*,
};

pub mod fixup;
pub mod linker;
pub mod xkcd;

#[inline]
fn is_regular_kind(kind: MessageType) -> bool {
    matches!(kind, MessageType::Regular | MessageType::InlineReply)
}

#[inline]
pub fn is_regular_message(msg: &Message) -> bool {
    is_regular_kind(msg.kind)
}

/// Runs a user message through every message-side component.
pub async fn handle_message(ctx: &Context, msg: &Message) {
    let (fixup_result, xkcd_result) = join!(
        fixup::handle(ctx, msg.channel_id, msg.id, &msg.content),
        xkcd::handle(ctx, msg.channel_id, msg.id, &msg.content)
    );
    if let Err(e) = fixup_result {
        warn!("Error fixing up links for \"{}\": {}", &msg.author.name, e);
    }
    if let Err(e) = xkcd_result {
        warn!("Error replying to xkcd mention from \"{}\": {}", &msg.author.name, e);
    }
}

/// The new content of an edit the components should look at again. Partial
/// updates (embeds resolving, our own suppression) carry no content, and
/// edits that leave the text alone change nothing for us.
pub fn edited_content<'a>(
    author_is_bot: bool,
    kind: Option<MessageType>,
    previous: Option<&str>,
    content: Option<&'a str>,
) -> Option<&'a str> {
    if author_is_bot || !kind.map_or(true, is_regular_kind) {
        return None;
    }
    let content = content?;
    match previous {
        Some(previous) if previous == content => None,
        _ => Some(content),
    }
}

/// Re-runs an edited message through every component so their replies
/// follow the new content.
pub async fn handle_edit(
    ctx: &Context,
    previous: Option<&Message>,
    event: &MessageUpdateEvent,
) {
    let author_is_bot = event.author.as_ref().map_or(false, |a| a.bot);
    let content = match edited_content(
        author_is_bot,
        event.kind,
        previous.map(|m| m.content.as_str()),
        event.content.as_deref(),
    ) {
        Some(c) => c,
        None => return,
    };

    let (fixup_result, xkcd_result) = join!(
        fixup::handle_edit(ctx, event.channel_id, event.id, content),
        xkcd::handle_edit(ctx, event.channel_id, event.id, content)
    );
    if let Err(e) = fixup_result {
        warn!("Error updating link fixups for message {}: {}", event.id.as_u64(), e);
    }
    if let Err(e) = xkcd_result {
        warn!("Error updating xkcd reply for message {}: {}", event.id.as_u64(), e);
    }
}
