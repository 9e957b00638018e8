//! Business-version compatibility gate.
//!
//! Agents running older software may not understand every event. Rules are
//! checked in order against the calling agent's version; the first rule
//! matching an event's category decides whether it is suppressed or
//! transformed before leaving the service.

use localmachine_protocol::{BusinessVersion, Event};
use std::fmt;
use std::sync::Arc;

type Transform = Arc<dyn Fn(Event) -> Event + Send + Sync>;

enum CompatAction {
    Suppress,
    Transform(Transform),
}

struct CompatRule {
    category: String,
    below: BusinessVersion,
    action: CompatAction,
}

/// Ordered compatibility rules.
#[derive(Default)]
pub struct CompatibilityGate {
    rules: Vec<CompatRule>,
}

impl CompatibilityGate {
    /// Creates a gate that lets everything through.
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppresses `category` for agents older than `below`.
    pub fn suppress_below(mut self, category: impl Into<String>, below: BusinessVersion) -> Self {
        self.rules.push(CompatRule {
            category: category.into(),
            below,
            action: CompatAction::Suppress,
        });
        self
    }

    /// Rewrites events of `category` for agents older than `below`.
    pub fn transform_below<F>(
        mut self,
        category: impl Into<String>,
        below: BusinessVersion,
        transform: F,
    ) -> Self
    where
        F: Fn(Event) -> Event + Send + Sync + 'static,
    {
        self.rules.push(CompatRule {
            category: category.into(),
            below,
            action: CompatAction::Transform(Arc::new(transform)),
        });
        self
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if there are no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Applies the rules to one event for an agent at `version`.
    ///
    /// Returns `None` if the event must not be sent.
    pub fn admit(&self, version: BusinessVersion, event: Event) -> Option<Event> {
        let rule = self
            .rules
            .iter()
            .find(|r| r.category == event.category && version < r.below);

        match rule.map(|r| &r.action) {
            None => Some(event),
            Some(CompatAction::Suppress) => None,
            Some(CompatAction::Transform(transform)) => Some(transform(event)),
        }
    }

    /// Applies the rules to a batch, keeping order.
    pub fn filter(&self, version: BusinessVersion, events: Vec<Event>) -> Vec<Event> {
        events
            .into_iter()
            .filter_map(|e| self.admit(version, e))
            .collect()
    }
}

impl fmt::Debug for CompatibilityGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rules: Vec<String> = self
            .rules
            .iter()
            .map(|r| {
                let action = match r.action {
                    CompatAction::Suppress => "suppress",
                    CompatAction::Transform(_) => "transform",
                };
                format!("{action} {} below {}", r.category, r.below)
            })
            .collect();
        f.debug_struct("CompatibilityGate")
            .field("rules", &rules)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localmachine_protocol::{EventPayload, FacilityId};

    fn event(category: &str, version: u32) -> Event {
        Event::new(
            "g",
            category,
            EventPayload::new(version, vec![1, 2, 3]),
            FacilityId::new(),
            FacilityId::new(),
        )
    }

    fn gate() -> CompatibilityGate {
        CompatibilityGate::new()
            .suppress_below("REQUISITION_APPROVED", BusinessVersion::new(2, 0, 0))
            .transform_below("STOCK_MOVED", BusinessVersion::new(1, 5, 0), |mut e| {
                e.payload = EventPayload::new(1, e.payload.bytes);
                e
            })
    }

    #[test]
    fn suppresses_for_old_agents_only() {
        let gate = gate();
        let old = BusinessVersion::new(1, 9, 9);
        let new = BusinessVersion::new(2, 0, 0);

        assert!(gate.admit(old, event("REQUISITION_APPROVED", 1)).is_none());
        assert!(gate.admit(new, event("REQUISITION_APPROVED", 1)).is_some());
    }

    #[test]
    fn transforms_for_old_agents() {
        let gate = gate();
        let out = gate
            .admit(BusinessVersion::new(1, 4, 0), event("STOCK_MOVED", 2))
            .unwrap();
        assert_eq!(out.payload.version, 1);

        let untouched = gate
            .admit(BusinessVersion::new(1, 5, 0), event("STOCK_MOVED", 2))
            .unwrap();
        assert_eq!(untouched.payload.version, 2);
    }

    #[test]
    fn filter_keeps_order() {
        let gate = gate();
        let events = vec![
            event("A", 1),
            event("REQUISITION_APPROVED", 1),
            event("B", 1),
        ];
        let ids = [events[0].id, events[2].id];

        let out = gate.filter(BusinessVersion::new(1, 0, 0), events);
        assert_eq!(out.iter().map(|e| e.id).collect::<Vec<_>>(), ids);
    }
}
