//! `eventType` → destination topic mapping

use std::collections::HashMap;

/// Where an event type is published
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination<'a> {
    /// Matched an exact or prefix route
    Mapped(&'a str),
    /// No route matched; published to the default destination
    Fallback(&'a str),
}

impl<'a> Destination<'a> {
    pub fn topic(&self) -> &'a str {
        match self {
            Destination::Mapped(topic) | Destination::Fallback(topic) => topic,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Destination::Fallback(_))
    }
}

/// Deterministic routing table
///
/// Resolution order: exact `eventType` route, then the longest matching
/// `prefix.*` route, then the default destination.
#[derive(Debug, Clone)]
pub struct DestinationMap {
    exact: HashMap<String, String>,
    /// (prefix including the trailing dot, topic), longest prefix first
    prefixes: Vec<(String, String)>,
    default: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid route '{0}': expected eventType=topic or prefix.*=topic")]
pub struct InvalidRoute(pub String);

impl DestinationMap {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            exact: HashMap::new(),
            prefixes: Vec::new(),
            default: default.into(),
        }
    }

    /// Add a route; `pattern` is an exact event type or `prefix.*`
    pub fn route(mut self, pattern: impl Into<String>, topic: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let topic = topic.into();

        match pattern.strip_suffix('*') {
            Some(prefix) => {
                self.prefixes.retain(|(p, _)| p != prefix);
                self.prefixes.push((prefix.to_string(), topic));
                self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
            }
            None => {
                self.exact.insert(pattern, topic);
            }
        }
        self
    }

    /// Parse `trade.booked=trades,position.*=positions`
    pub fn parse(routes: &str, default: impl Into<String>) -> Result<Self, InvalidRoute> {
        let mut map = Self::new(default);

        for route in routes.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            let (pattern, topic) = route
                .split_once('=')
                .map(|(p, t)| (p.trim(), t.trim()))
                .filter(|(p, t)| !p.is_empty() && !t.is_empty())
                .ok_or_else(|| InvalidRoute(route.to_string()))?;

            if pattern.contains('*') && !(pattern.ends_with(".*") && pattern.matches('*').count() == 1)
            {
                return Err(InvalidRoute(route.to_string()));
            }
            map = map.route(pattern, topic);
        }

        Ok(map)
    }

    pub fn default_destination(&self) -> &str {
        &self.default
    }

    pub fn resolve(&self, event_type: &str) -> Destination<'_> {
        if let Some(topic) = self.exact.get(event_type) {
            return Destination::Mapped(topic);
        }

        self.prefixes
            .iter()
            .find(|(prefix, _)| event_type.starts_with(prefix.as_str()))
            .map(|(_, topic)| Destination::Mapped(topic.as_str()))
            .unwrap_or(Destination::Fallback(self.default.as_str()))
    }
}
