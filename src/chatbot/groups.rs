//! Registry of groups the bot has seen, with human-facing numbers.
//!
//! Numbers are handed out once, in first-seen order, and never reused.

use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub number: u32,
    pub chat_id: i64,
    pub title: String,
}

#[derive(Default)]
struct Registry {
    by_chat: HashMap<i64, GroupEntry>,
    next_number: u32,
}

#[derive(Default)]
pub struct GroupRegistry {
    inner: Mutex<Registry>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a group, keeping its number and refreshing its title.
    /// Returns the group's number.
    pub async fn observe(&self, chat_id: i64, title: &str) -> u32 {
        let mut registry = self.inner.lock().await;
        if let Some(entry) = registry.by_chat.get_mut(&chat_id) {
            if !title.is_empty() && entry.title != title {
                entry.title = title.to_string();
            }
            return entry.number;
        }

        registry.next_number += 1;
        let number = registry.next_number;
        registry.by_chat.insert(
            chat_id,
            GroupEntry {
                number,
                chat_id,
                title: title.to_string(),
            },
        );
        info!("📋 New group #{}: {} ({})", number, title, chat_id);
        number
    }

    /// All groups ordered by number.
    pub async fn list(&self) -> Vec<GroupEntry> {
        let registry = self.inner.lock().await;
        let mut groups: Vec<GroupEntry> = registry.by_chat.values().cloned().collect();
        groups.sort_by_key(|g| g.number);
        groups
    }

    pub async fn chat_for_number(&self, number: u32) -> Option<GroupEntry> {
        let registry = self.inner.lock().await;
        registry.by_chat.values().find(|g| g.number == number).cloned()
    }

    pub async fn get(&self, chat_id: i64) -> Option<GroupEntry> {
        self.inner.lock().await.by_chat.get(&chat_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.by_chat.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_numbers_follow_first_seen_order() {
        let registry = GroupRegistry::new();
        assert_eq!(registry.observe(-10, "A").await, 1);
        assert_eq!(registry.observe(-20, "B").await, 2);
        assert_eq!(registry.observe(-30, "C").await, 3);

        // Out-of-order traffic afterwards keeps the numbers
        assert_eq!(registry.observe(-30, "C").await, 3);
        assert_eq!(registry.observe(-10, "A").await, 1);
        assert_eq!(registry.observe(-20, "B").await, 2);

        let numbers: Vec<(u32, i64)> = registry.list().await.iter().map(|g| (g.number, g.chat_id)).collect();
        assert_eq!(numbers, vec![(1, -10), (2, -20), (3, -30)]);
    }

    #[tokio::test]
    async fn test_title_updates_keep_number() {
        let registry = GroupRegistry::new();
        registry.observe(-10, "Old name").await;
        assert_eq!(registry.observe(-10, "New name").await, 1);
        assert_eq!(registry.get(-10).await.unwrap().title, "New name");

        // Empty titles don't erase the known one
        registry.observe(-10, "").await;
        assert_eq!(registry.get(-10).await.unwrap().title, "New name");
    }

    #[tokio::test]
    async fn test_lookup_by_number() {
        let registry = GroupRegistry::new();
        registry.observe(-10, "A").await;
        registry.observe(-20, "B").await;

        assert_eq!(registry.chat_for_number(2).await.unwrap().chat_id, -20);
        assert!(registry.chat_for_number(3).await.is_none());
        assert_eq!(registry.len().await, 2);
    }
}
