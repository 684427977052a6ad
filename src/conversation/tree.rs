//! Branch derivation over a flat set of parent-linked messages
//!
//! Every function here is a pure function of the message slice it is given,
//! except [`switch_branch`], which stamps `selected_at` on exactly one
//! message. Callers own synchronization: `switch_branch` must not run
//! concurrently with itself on the same message set.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};

use super::types::{Message, Role};

/// Direction of a branch switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards older siblings
    Previous,
    /// Towards newer siblings
    Next,
}

impl Direction {
    fn offset(self) -> isize {
        match self {
            Self::Previous => -1,
            Self::Next => 1,
        }
    }
}

/// Derives the active root-to-leaf path
///
/// The root is the parentless message with the newest `created_at`. From
/// there the walk follows, at every level, the child with the greatest
/// `selected_at ?? created_at`. Ties are broken by message id so the result
/// is deterministic.
///
/// If several roots exist only the newest one is live; the others are not
/// reachable from the active view.
///
/// # Examples
///
/// ```
/// use forkchat::conversation::{tree, Message};
///
/// let root = Message::user("c", None, "hi");
/// let reply = Message::model("c", Some(root.id.clone()));
/// let messages = vec![root.clone(), reply.clone()];
///
/// let branch = tree::active_branch(&messages);
/// assert_eq!(branch.len(), 2);
/// assert_eq!(branch[1].id, reply.id);
/// ```
pub fn active_branch(messages: &[Message]) -> Vec<&Message> {
    let mut children: HashMap<&str, Vec<&Message>> = HashMap::with_capacity(messages.len());
    let mut root: Option<&Message> = None;

    for message in messages {
        match message.parent_id.as_deref() {
            Some(parent) => children.entry(parent).or_default().push(message),
            None => {
                let newer = root
                    .map(|r| (message.created_at, &message.id) > (r.created_at, &r.id))
                    .unwrap_or(true);
                if newer {
                    root = Some(message);
                }
            }
        }
    }

    let Some(root) = root else {
        return Vec::new();
    };

    let mut path = vec![root];
    let mut visited: HashSet<&str> = HashSet::from([root.id.as_str()]);
    let mut current = root;

    while let Some(next) = children
        .get(current.id.as_str())
        .and_then(|kids| kids.iter().copied().max_by(|a, b| compare_branch_key(a, b)))
    {
        if !visited.insert(next.id.as_str()) {
            tracing::warn!(message_id = %next.id, "Cycle detected while walking active branch");
            break;
        }
        path.push(next);
        current = next;
    }

    path
}

fn compare_branch_key(a: &Message, b: &Message) -> std::cmp::Ordering {
    (a.branch_key(), &a.id).cmp(&(b.branch_key(), &b.id))
}

/// Returns the siblings of `message`, oldest first
///
/// Siblings share the same parent and the same role. The result always
/// contains `message` itself, even when it is not part of `messages` (an
/// in-flight reply, for instance).
pub fn siblings<'a>(message: &'a Message, messages: &'a [Message]) -> Vec<&'a Message> {
    let mut result: Vec<&Message> = messages
        .iter()
        .filter(|m| {
            m.id != message.id && m.parent_id == message.parent_id && m.role == message.role
        })
        .collect();
    result.push(message);
    result.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
    result
}

/// Position of `message` among its siblings as `(1-based index, count)`
///
/// Used for "2 / 3" style indicators.
pub fn branch_info(message: &Message, messages: &[Message]) -> (usize, usize) {
    let sibs = siblings(message, messages);
    let index = sibs
        .iter()
        .position(|m| m.id == message.id)
        .unwrap_or(0);
    (index + 1, sibs.len())
}

/// Switches to the previous or next sibling of `message_id`
///
/// Stamps `selected_at = now` on the sibling at the new index and on nothing
/// else. Moving before the first or past the last sibling is a no-op.
/// Returns the id of the newly selected sibling.
pub fn switch_branch(
    messages: &mut [Message],
    message_id: &str,
    direction: Direction,
) -> Option<String> {
    switch_branch_at(messages, message_id, direction, Utc::now())
}

/// [`switch_branch`] with an explicit clock
pub fn switch_branch_at(
    messages: &mut [Message],
    message_id: &str,
    direction: Direction,
    now: DateTime<Utc>,
) -> Option<String> {
    let target_id = {
        let message = messages.iter().find(|m| m.id == message_id)?;
        let sibs = siblings(message, messages);
        let index = sibs.iter().position(|m| m.id == message_id)? as isize;
        let new_index = index + direction.offset();
        if new_index < 0 || new_index >= sibs.len() as isize {
            return None;
        }
        sibs[new_index as usize].id.clone()
    };

    let target = messages.iter_mut().find(|m| m.id == target_id)?;
    target.selected_at = Some(now.max(target.created_at));
    tracing::debug!(message_id = %target.id, "Switched active branch");
    Some(target_id)
}

/// Collects `root_id` and every descendant, breadth first
///
/// Used for cascading deletes. Only previously unseen ids ever enter the
/// frontier, so malformed or cyclic parent links still terminate.
///
/// # Examples
///
/// ```
/// use forkchat::conversation::{tree, Message};
///
/// let a = Message::user("c", None, "a");
/// let b = Message::model("c", Some(a.id.clone()));
/// let c = Message::user("c", Some(b.id.clone()), "c");
/// let ids = tree::subtree_ids(&a.id, &[a.clone(), b.clone(), c.clone()]);
/// assert_eq!(ids, vec![a.id, b.id, c.id]);
/// ```
pub fn subtree_ids(root_id: &str, messages: &[Message]) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::from([root_id]);
    let mut result = vec![root_id.to_string()];
    let mut frontier: VecDeque<&str> = VecDeque::from([root_id]);

    while !frontier.is_empty() {
        let current: HashSet<&str> = frontier.drain(..).collect();
        for message in messages {
            let Some(parent) = message.parent_id.as_deref() else {
                continue;
            };
            if current.contains(parent) && seen.insert(message.id.as_str()) {
                result.push(message.id.clone());
                frontier.push_back(message.id.as_str());
            }
        }
    }

    result
}

/// The part of `branch` up to and including `message_id`
pub fn branch_prefix<'a>(branch: &'a [Message], message_id: &str) -> Option<&'a [Message]> {
    let index = branch.iter().position(|m| m.id == message_id)?;
    Some(&branch[..=index])
}

/// The context for regenerating the last reply of `branch`
///
/// Ends at the last user message; a new model reply started from this
/// prefix becomes a sibling of the replies it replaces.
pub fn regenerate_context(branch: &[Message]) -> Option<&[Message]> {
    let index = branch.iter().rposition(|m| m.role == Role::User)?;
    Some(&branch[..=index])
}

/// Creates an edited copy of a user message as a new sibling
///
/// The fork keeps the original's parent, so it shows up next to the
/// original in [`siblings`] and, being newest, becomes the active branch.
pub fn fork_user_message(original: &Message, new_text: impl Into<String>) -> Message {
    let mut fork = Message::user(
        original.conversation_id.clone(),
        original.parent_id.clone(),
        new_text,
    );
    fork.media = original.media.clone();
    fork
}
