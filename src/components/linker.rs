use std::collections::{HashMap, VecDeque};

use serenity::model::id::{ChannelId, MessageId};

const MAX_LINKS: usize = 1000;

pub type Reply = (ChannelId, MessageId);

/// Remembers which bot reply belongs to which user message so the reply can
/// be cleaned up when the original goes away. Oldest links are forgotten
/// first once `MAX_LINKS` is reached.
#[derive(Debug)]
pub struct MessageLinker {
    capacity: usize,
    links: HashMap<MessageId, Reply>,
    order: VecDeque<MessageId>,
}

impl MessageLinker {
    pub fn with_capacity(capacity: usize) -> Self {
        MessageLinker {
            capacity,
            links: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn link(&mut self, original: MessageId, channel: ChannelId, reply: MessageId) {
        if self.links.insert(original, (channel, reply)).is_none() {
            self.order.push_back(original);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.links.remove(&oldest);
            }
        }
    }

    pub fn get(&self, original: MessageId) -> Option<Reply> {
        self.links.get(&original).copied()
    }

    pub fn take(&mut self, original: MessageId) -> Option<Reply> {
        let reply = self.links.remove(&original)?;
        self.order.retain(|m| *m != original);
        Some(reply)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }
}

impl Default for MessageLinker {
    fn default() -> Self {
        MessageLinker::with_capacity(MAX_LINKS)
    }
}

/// Components that answer user messages with a reply of their own.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Component {
    Fixup,
    Xkcd,
}

/// One linker per component, since a single message can get a reply from
/// each of them.
#[derive(Debug, Default)]
pub struct ReplyLinks {
    fixup: MessageLinker,
    xkcd: MessageLinker,
}

impl ReplyLinks {
    pub fn linker(&mut self, component: Component) -> &mut MessageLinker {
        match component {
            Component::Fixup => &mut self.fixup,
            Component::Xkcd => &mut self.xkcd,
        }
    }

    /// Forgets every reply linked to `original` and returns them.
    pub fn take_all(&mut self, original: MessageId) -> Vec<Reply> {
        [Component::Fixup, Component::Xkcd]
            .into_iter()
            .filter_map(|c| self.linker(c).take(original))
            .collect()
    }
}

/// What to do with a component's reply after its source message was edited.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkedEdit<T> {
    Unchanged,
    Send(T),
    Update(Reply, T),
    Remove(Reply),
}

/// `output` is what the component makes of the edited content, `None` when
/// there is nothing left to reply with.
pub fn plan_edit<T>(linked: Option<Reply>, output: Option<T>) -> LinkedEdit<T> {
    match (linked, output) {
        (None, None) => LinkedEdit::Unchanged,
        (None, Some(output)) => LinkedEdit::Send(output),
        (Some(reply), Some(output)) => LinkedEdit::Update(reply, output),
        (Some(reply), None) => LinkedEdit::Remove(reply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_returns_reply_once() {
        let mut linker = MessageLinker::default();
        linker.link(MessageId(1), ChannelId(9), MessageId(2));
        assert_eq!(linker.get(MessageId(1)), Some((ChannelId(9), MessageId(2))));
        assert_eq!(linker.take(MessageId(1)), Some((ChannelId(9), MessageId(2))));
        assert_eq!(linker.take(MessageId(1)), None);
        assert_eq!(linker.len(), 0);
    }

    #[test]
    fn forgets_oldest_links_past_capacity() {
        let mut linker = MessageLinker::with_capacity(2);
        linker.link(MessageId(1), ChannelId(9), MessageId(11));
        linker.link(MessageId(2), ChannelId(9), MessageId(12));
        linker.link(MessageId(3), ChannelId(9), MessageId(13));
        assert_eq!(linker.len(), 2);
        assert_eq!(linker.take(MessageId(1)), None);
        assert!(linker.take(MessageId(3)).is_some());
    }

    #[test]
    fn replies_from_both_components_are_kept() {
        let mut links = ReplyLinks::default();
        links
            .linker(Component::Fixup)
            .link(MessageId(1), ChannelId(9), MessageId(11));
        links
            .linker(Component::Xkcd)
            .link(MessageId(1), ChannelId(9), MessageId(12));

        assert_eq!(
            links.take_all(MessageId(1)),
            vec![
                (ChannelId(9), MessageId(11)),
                (ChannelId(9), MessageId(12))
            ]
        );
        assert_eq!(links.take_all(MessageId(1)), vec![]);
    }

    #[test]
    fn edits_send_update_or_remove_replies() {
        let reply = (ChannelId(9), MessageId(11));
        assert_eq!(plan_edit::<&str>(None, None), LinkedEdit::Unchanged);
        assert_eq!(plan_edit(None, Some("new")), LinkedEdit::Send("new"));
        assert_eq!(
            plan_edit(Some(reply), Some("new")),
            LinkedEdit::Update(reply, "new")
        );
        assert_eq!(plan_edit::<&str>(Some(reply), None), LinkedEdit::Remove(reply));
    }
}
