//! Name-keyed membership cache with a derived leader pointer.
//!
//! The leader is the member with the smallest `create_revision`. Revisions
//! only grow, so a full rescan is needed only when the leader itself goes away.

use std::collections::HashMap;

use bytes::Bytes;

use crate::models::{Change, EventKind, Member, RangeSnapshot, WatchEvent, member_name};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberCache {
    prefix: String,
    members: HashMap<String, Member>,
    leader: Option<String>,
}

impl MemberCache {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            members: HashMap::new(),
            leader: None,
        }
    }

    /// Seed a cache from a range read.
    pub fn from_snapshot(prefix: impl Into<String>, snapshot: &RangeSnapshot) -> Self {
        let mut cache = Self::new(prefix);
        for kv in &snapshot.entries {
            if let Some(member) = Member::from_kv(&cache.prefix, kv) {
                cache.members.insert(member.name.clone(), member);
            }
        }
        cache.recompute_leader();
        cache
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Apply one watch event. Returns the change to publish, or `None` for a
    /// key outside the prefix.
    pub fn apply(&mut self, event: &WatchEvent) -> Option<Change> {
        let name = member_name(&self.prefix, &event.key)?.to_owned();
        match event.kind {
            EventKind::Put => {
                let member = Member {
                    name: name.clone(),
                    value: event.value.clone(),
                    create_revision: event.create_revision,
                };
                self.members.insert(name.clone(), member);
                self.on_put(&name, event.create_revision);
            }
            EventKind::Delete => {
                self.members.remove(&name);
                if self.leader.as_deref() == Some(name.as_str()) {
                    self.recompute_leader();
                }
            }
        }
        Some(Change {
            name,
            op: event.kind,
        })
    }

    fn on_put(&mut self, name: &str, create_revision: i64) {
        let current = self
            .leader
            .as_deref()
            .and_then(|leader| self.members.get(leader))
            .map(|m| (m.name == name, m.create_revision));
        match current {
            None => self.leader = Some(name.to_owned()),
            // the leader's own key was rewritten, its revision may have moved
            Some((true, _)) => self.recompute_leader(),
            Some((false, leader_rev)) if create_revision < leader_rev => {
                self.leader = Some(name.to_owned())
            }
            Some(_) => {}
        }
    }

    fn recompute_leader(&mut self) {
        self.leader = self
            .members
            .values()
            .min_by(|a, b| {
                a.create_revision
                    .cmp(&b.create_revision)
                    .then_with(|| a.name.cmp(&b.name))
            })
            .map(|m| m.name.clone());
    }

    pub fn leader(&self) -> Option<&Member> {
        self.leader.as_deref().and_then(|name| self.members.get(name))
    }

    pub fn leader_name(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members ordered by creation, oldest first.
    pub fn members_by_age(&self) -> Vec<&Member> {
        let mut members: Vec<&Member> = self.members.values().collect();
        members.sort_by_key(|m| m.create_revision);
        members
    }

    /// Name → value copy of the whole cache.
    pub fn to_map(&self) -> HashMap<String, Bytes> {
        self.members
            .iter()
            .map(|(name, m)| (name.clone(), m.value.clone()))
            .collect()
    }
}
