//! Subscription filters

use super::types::{DiscoveryEvent, EventPriority, EventType};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

type Predicate = Arc<dyn Fn(&DiscoveryEvent) -> bool + Send + Sync>;

/// Criteria an event must meet to reach a subscriber.
///
/// Every criterion that is set must match; an empty filter matches all events.
#[derive(Clone, Default)]
pub struct EventFilter {
    event_types: Option<HashSet<EventType>>,
    sources: Option<HashSet<String>>,
    min_priority: Option<EventPriority>,
    predicate: Option<Predicate>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_types<I: IntoIterator<Item = EventType>>(mut self, types: I) -> Self {
        self.event_types = Some(types.into_iter().collect());
        self
    }

    pub fn sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = Some(sources.into_iter().map(Into::into).collect());
        self
    }

    pub fn min_priority(mut self, priority: EventPriority) -> Self {
        self.min_priority = Some(priority);
        self
    }

    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&DiscoveryEvent) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, event: &DiscoveryEvent) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type()) {
                return false;
            }
        }
        if let Some(sources) = &self.sources {
            if !sources.contains(&event.source) {
                return false;
            }
        }
        if let Some(min) = self.min_priority {
            if event.priority < min {
                return false;
            }
        }
        match &self.predicate {
            Some(predicate) => predicate(event),
            None => true,
        }
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFilter")
            .field("event_types", &self.event_types)
            .field("sources", &self.sources)
            .field("min_priority", &self.min_priority)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::EventKind;

    fn lost_event() -> DiscoveryEvent {
        DiscoveryEvent::new(
            EventKind::DeviceLost {
                device_id: "ip:10.0.0.1".into(),
                last_seen: chrono::Utc::now(),
                reason: "timeout".into(),
            },
            "engine",
        )
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(EventFilter::new().matches(&lost_event()));
    }

    #[test]
    fn test_all_criteria_must_match() {
        let filter = EventFilter::new()
            .event_types([EventType::DeviceLost])
            .sources(["engine"])
            .min_priority(EventPriority::High);
        assert!(filter.matches(&lost_event()));

        let filter = filter.sources(["scheduler"]);
        assert!(!filter.matches(&lost_event()));
    }

    #[test]
    fn test_min_priority_excludes_lower() {
        let filter = EventFilter::new().min_priority(EventPriority::High);
        let event = lost_event().with_priority(EventPriority::Normal);
        assert!(!filter.matches(&event));
    }

    #[test]
    fn test_predicate() {
        let filter = EventFilter::new().predicate(|e| e.metadata.contains_key("trace"));
        assert!(!filter.matches(&lost_event()));
        assert!(filter.matches(&lost_event().with_metadata("trace", "abc")));
    }
}
