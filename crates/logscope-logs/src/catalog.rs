use std::collections::HashMap;

use logscope_types::{LogEvent, PropertyKind, PropertyModel};

/// Every property name seen so far, with the union of its observed shapes
///
/// Entries are created on first sighting and only ever grow; a shape that was
/// recorded once is never removed, even if later events lack it.
#[derive(Debug, Default)]
pub struct PropertyCatalog {
    by_name: HashMap<String, usize>,
    properties: Vec<PropertyModel>,
}

impl PropertyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the properties of an event
    ///
    /// Returns true if a new property name or a new shape was observed.
    pub fn observe(&mut self, event: &LogEvent) -> bool {
        let mut changed = false;
        for (name, value) in &event.properties {
            changed |= self.observe_kind(name, value.kind());
        }
        changed
    }

    fn observe_kind(&mut self, name: &str, kind: PropertyKind) -> bool {
        let index = match self.by_name.get(name) {
            Some(&index) => index,
            None => {
                let index = self.properties.len();
                self.properties
                    .push(PropertyModel::new(index as u64, name.to_string()));
                self.by_name.insert(name.to_string(), index);
                // The new model has no kinds yet, so the insert below always reports a change
                index
            }
        };
        self.properties[index].kinds.insert(kind)
    }

    pub fn get(&self, name: &str) -> Option<&PropertyModel> {
        self.by_name.get(name).map(|&index| &self.properties[index])
    }

    /// Whether the property exists and was seen with the given shape
    pub fn has_kind(&self, name: &str, kind: PropertyKind) -> bool {
        self.get(name).is_some_and(|p| p.has_kind(kind))
    }

    /// All properties in order of first sighting
    pub fn properties(&self) -> &[PropertyModel] {
        &self.properties
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_name.clear();
        self.properties.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use logscope_types::{LogLevel, PropertyValue, ScalarValue};

    fn event() -> LogEvent {
        LogEvent::new(Utc::now(), LogLevel::Information, "test")
    }

    #[test]
    fn test_new_property_reports_change() {
        let mut catalog = PropertyCatalog::new();
        let e = event().with_property("App", PropertyValue::string("a"));

        assert!(catalog.observe(&e));
        assert!(!catalog.observe(&e));
        assert!(catalog.has_kind("App", PropertyKind::String));
        assert_eq!(catalog.get("App").map(|p| p.id), Some(0));
    }

    #[test]
    fn test_shapes_only_grow() {
        let mut catalog = PropertyCatalog::new();
        catalog.observe(&event().with_property("N", PropertyValue::string("x")));
        assert!(catalog.observe(&event().with_property("N", PropertyValue::Scalar(ScalarValue::Int(1)))));

        // An event without the property retracts nothing
        assert!(!catalog.observe(&event()));

        let model = catalog.get("N").unwrap();
        assert!(model.has_kind(PropertyKind::String));
        assert!(model.has_kind(PropertyKind::Integer));
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_clear() {
        let mut catalog = PropertyCatalog::new();
        catalog.observe(&event().with_property("A", PropertyValue::string("x")));
        catalog.clear();
        assert!(catalog.is_empty());
        assert!(catalog.get("A").is_none());
    }
}
