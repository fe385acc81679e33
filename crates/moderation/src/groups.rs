//! The three moderation processing groups
//!
//! - the block group keeps one [`BlockList`] per receiver
//! - the ban group keeps one `true` per banned word
//! - the filter group joins chat messages against views of both tables

use chatflow_types::events::parse_user_id;
use chatflow_types::{normalize_word, BlockList, ChatMessage, MASK};
use processor::{BoolCodec, GroupBuilder, GroupGraph, HandlerError, JsonCodec, View};
use tracing::debug;

use crate::error::Result;
use crate::topics::Topics;

/// Group maintaining the per-receiver block lists.
///
/// Events are keyed by receiver id and carry the blocked user id. An id
/// written in any other form than its decimal rendering (`"05"`, `"+5"`) is
/// re-published under the canonical key, which is the one the filter reads.
pub fn block_group(topics: &Topics) -> Result<GroupGraph<BlockList>> {
    let blocked_users = topics.blocked_users.clone();
    let graph = GroupBuilder::<BlockList>::new(topics.names().blocked_users_group.as_str())
        .input(topics.blocked_users.clone(), move |ctx, blocked: String| {
            let receiver = parse_user_id(ctx.key()).map_err(|e| HandlerError::invalid_input(e.to_string()))?;
            let blocked = parse_user_id(&blocked).map_err(|e| HandlerError::invalid_input(e.to_string()))?;

            let key = receiver.to_string();
            if key != ctx.key() {
                debug!(key = ctx.key(), receiver, "re-keying block");
                return ctx.emit(&blocked_users, key, &blocked.to_string());
            }

            let mut list = ctx.value_or_default();
            if !list.block(blocked) {
                debug!(receiver, blocked, "user already blocked");
                return Ok(());
            }
            ctx.set_value(list)
        })
        .persist(JsonCodec::<BlockList>::new())
        .build()?;
    Ok(graph)
}

/// Group maintaining the banned-word table, keyed by the lower-cased word.
///
/// A word arriving under a key that is not in canonical form is re-published
/// under its canonical key, so the table never holds two spellings.
pub fn ban_group(topics: &Topics) -> Result<GroupGraph<bool>> {
    let banned_words = topics.banned_words.clone();
    let graph = GroupBuilder::<bool>::new(topics.names().banned_words_group.as_str())
        .input(topics.banned_words.clone(), move |ctx, _word: String| {
            let word = normalize_word(ctx.key()).map_err(|e| HandlerError::invalid_input(e.to_string()))?;
            if word != ctx.key() {
                debug!(key = ctx.key(), word = %word, "re-keying banned word");
                return ctx.emit(&banned_words, word.clone(), &word);
            }
            if ctx.value() == Some(&true) {
                return Ok(());
            }
            ctx.set_value(true)
        })
        .persist(BoolCodec)
        .build()?;
    Ok(graph)
}

/// Stateless group forwarding masked chat messages keyed by receiver
pub fn filter_group(
    topics: &Topics,
    blocked: View<BlockList>,
    banned: View<bool>,
) -> Result<GroupGraph<()>> {
    let output = topics.filtered_messages.clone();
    let graph = GroupBuilder::<()>::new(topics.names().filter_group.as_str())
        .input(topics.messages.clone(), move |ctx, message: ChatMessage| {
            let sender_blocked = blocked
                .get(&message.receiver_key())
                .map(|list| list.is_blocked(message.sender_id))
                .unwrap_or(false);

            match filter_message(message, sender_blocked, |word| banned.get(word).unwrap_or(false)) {
                Some(filtered) => {
                    let key = filtered.receiver_key();
                    ctx.emit(&output, key, &filtered)
                }
                None => {
                    debug!(key = ctx.key(), offset = ctx.offset(), "dropping message from blocked sender");
                    Ok(())
                }
            }
        })
        .build()?;
    Ok(graph)
}

/// Apply block and ban rules to one message.
///
/// Returns `None` when the sender is blocked by the receiver. Otherwise the
/// text is split on whitespace, tokens whose lower-case form is banned are
/// replaced by [`MASK`], and the tokens are re-joined with single spaces.
pub fn filter_message(
    mut message: ChatMessage,
    sender_blocked: bool,
    is_banned: impl Fn(&str) -> bool,
) -> Option<ChatMessage> {
    if sender_blocked {
        return None;
    }

    message.text = message
        .text
        .split_whitespace()
        .map(|token| {
            if is_banned(&token.to_lowercase()) {
                MASK
            } else {
                token
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    Some(message)
}
