//! Topic names, subscription filters and the routing table.
//!
//! Topics are `/` separated levels. In a subscription, a level ending in `*`
//! matches any level starting with the part before the `*`, and a final level
//! of exactly `>` matches one or more remaining levels. Anywhere else both
//! characters are literal.
//!
//! Concurrency note: callers synchronize access to `SubscriptionTable` through
//! the broker lock.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::{Error, Result};

const MAX_TOPIC_LEN: usize = 250;

/// One receiver inside one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId {
    pub session: String,
    pub receiver: u64,
}

impl SubscriberId {
    pub fn new(session: impl Into<String>, receiver: u64) -> Self {
        Self {
            session: session.into(),
            receiver,
        }
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session, self.receiver)
    }
}

/// Checks a topic a message is published to.
pub fn validate_topic(topic: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidTopic {
        topic: topic.to_string(),
        reason: reason.to_string(),
    };

    if topic.is_empty() {
        return Err(invalid("empty"));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(invalid("longer than 250 bytes"));
    }
    for level in topic.split('/') {
        if level.is_empty() {
            return Err(invalid("empty level"));
        }
        if level == ">" || level.ends_with('*') {
            return Err(invalid("wildcards are only allowed in subscriptions"));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    Literal(String),
    Prefix(String),
    Rest,
}

/// A parsed subscription expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSubscription {
    expression: String,
    levels: Vec<Level>,
}

impl TopicSubscription {
    pub fn parse(expression: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidTopic {
            topic: expression.to_string(),
            reason: reason.to_string(),
        };

        if expression.is_empty() {
            return Err(invalid("empty subscription"));
        }
        if expression.len() > MAX_TOPIC_LEN {
            return Err(invalid("longer than 250 bytes"));
        }

        let raw: Vec<&str> = expression.split('/').collect();
        let last = raw.len() - 1;
        let mut levels = Vec::with_capacity(raw.len());
        for (i, level) in raw.iter().enumerate() {
            if level.is_empty() {
                return Err(invalid("empty level"));
            }
            if *level == ">" && i == last {
                levels.push(Level::Rest);
            } else if let Some(prefix) = level.strip_suffix('*') {
                levels.push(Level::Prefix(prefix.to_string()));
            } else {
                levels.push(Level::Literal(level.to_string()));
            }
        }

        Ok(Self {
            expression: expression.to_string(),
            levels,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn matches(&self, topic: &str) -> bool {
        let topic_levels: Vec<&str> = topic.split('/').collect();

        for (i, level) in self.levels.iter().enumerate() {
            match level {
                Level::Rest => return topic_levels.len() > i,
                Level::Prefix(prefix) => match topic_levels.get(i) {
                    Some(t) if t.starts_with(prefix.as_str()) => {}
                    _ => return false,
                },
                Level::Literal(literal) => match topic_levels.get(i) {
                    Some(t) if t == literal => {}
                    _ => return false,
                },
            }
        }

        topic_levels.len() == self.levels.len()
    }
}

impl fmt::Display for TopicSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// A subscription expression and the receivers registered on it.
///
/// With a share name, each matching message goes to one subscriber,
/// chosen round-robin; otherwise every subscriber gets a copy.
#[derive(Debug)]
pub struct TopicFilter {
    pub filter: TopicSubscription,
    pub share: Option<String>,
    pub subscribers: BTreeSet<SubscriberId>,
    cursor: usize,
}

impl TopicFilter {
    pub fn new(filter: TopicSubscription, share: Option<String>) -> Self {
        Self {
            filter,
            share,
            subscribers: BTreeSet::new(),
            cursor: 0,
        }
    }

    /// Duplicate adds are ignored.
    pub fn subscribe(&mut self, id: SubscriberId) {
        self.subscribers.insert(id);
    }

    pub fn unsubscribe(&mut self, id: &SubscriberId) {
        self.subscribers.remove(id);
    }

    fn next_shared(&mut self) -> Option<SubscriberId> {
        if self.subscribers.is_empty() {
            return None;
        }
        let index = self.cursor % self.subscribers.len();
        self.cursor = self.cursor.wrapping_add(1);
        self.subscribers.iter().nth(index).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FilterKey {
    expression: String,
    share: Option<String>,
}

/// Maps subscription expressions to subscribers.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    filters: HashMap<FilterKey, TopicFilter>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        filter: TopicSubscription,
        share: Option<String>,
        subscriber: SubscriberId,
    ) {
        let key = FilterKey {
            expression: filter.expression().to_string(),
            share: share.clone(),
        };
        self.filters
            .entry(key)
            .or_insert_with(|| TopicFilter::new(filter, share))
            .subscribe(subscriber);
    }

    /// If the filter does not exist, nothing happens.
    pub fn unsubscribe(&mut self, expression: &str, share: Option<&str>, subscriber: &SubscriberId) {
        let key = FilterKey {
            expression: expression.to_string(),
            share: share.map(str::to_string),
        };
        if let Some(filter) = self.filters.get_mut(&key) {
            filter.unsubscribe(subscriber);
            if filter.subscribers.is_empty() {
                self.filters.remove(&key);
            }
        }
    }

    /// Drops every subscription owned by `session`.
    pub fn remove_session(&mut self, session: &str) {
        for filter in self.filters.values_mut() {
            filter.subscribers.retain(|s| s.session != session);
        }
        self.filters.retain(|_, f| !f.subscribers.is_empty());
    }

    /// Subscribers that should get a message published on `topic`.
    /// A receiver matched by several filters is listed once.
    pub fn route(&mut self, topic: &str) -> BTreeSet<SubscriberId> {
        let mut targets = BTreeSet::new();
        for filter in self.filters.values_mut() {
            if !filter.filter.matches(topic) {
                continue;
            }
            if filter.share.is_some() {
                if let Some(id) = filter.next_shared() {
                    targets.insert(id);
                }
            } else {
                targets.extend(filter.subscribers.iter().cloned());
            }
        }
        targets
    }

    pub fn contains(&self, expression: &str, subscriber: &SubscriberId) -> bool {
        self.filters
            .iter()
            .any(|(k, f)| k.expression == expression && f.subscribers.contains(subscriber))
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}
