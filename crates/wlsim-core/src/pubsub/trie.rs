// ── Subscription trie ──
//
// Maps topic paths to subscription ids. Lookup walks the published topic
// once, collecting ids from every node on the path, so the cost is the
// topic depth, independent of how many subscriptions exist elsewhere.

use std::collections::HashMap;

use super::broker::SubscriptionId;
use super::topic::Topic;

#[derive(Debug, Default)]
struct Node {
    children: HashMap<String, Node>,
    ids: Vec<SubscriptionId>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.children.is_empty()
    }
}

#[derive(Debug, Default)]
pub(super) struct TopicTrie {
    root: Node,
}

impl TopicTrie {
    pub(super) fn insert(&mut self, topic: &Topic, id: SubscriptionId) {
        let mut node = &mut self.root;
        for segment in topic.segments() {
            node = node.children.entry(segment.clone()).or_default();
        }
        node.ids.push(id);
    }

    /// Removes `id` from `topic`, pruning branches left empty.
    pub(super) fn remove(&mut self, topic: &Topic, id: SubscriptionId) -> bool {
        remove_at(&mut self.root, topic.segments(), id)
    }

    /// Ids subscribed to `topic` or any of its ancestors, shallowest first.
    pub(super) fn matching(&self, topic: &Topic) -> Vec<SubscriptionId> {
        let mut found = self.root.ids.clone();
        let mut node = &self.root;
        for segment in topic.segments() {
            match node.children.get(segment) {
                Some(child) => {
                    found.extend_from_slice(&child.ids);
                    node = child;
                }
                None => break,
            }
        }
        found
    }

    pub(super) fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

fn remove_at(node: &mut Node, segments: &[String], id: SubscriptionId) -> bool {
    let Some((head, rest)) = segments.split_first() else {
        return match node.ids.iter().position(|x| *x == id) {
            Some(pos) => {
                node.ids.remove(pos);
                true
            }
            None => false,
        };
    };
    let Some(child) = node.children.get_mut(head) else {
        return false;
    };
    let removed = remove_at(child, rest, id);
    if child.is_empty() {
        node.children.remove(head);
    }
    removed
}
