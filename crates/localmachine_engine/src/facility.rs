//! Facility lookup.

use localmachine_protocol::FacilityId;
use std::collections::HashMap;

/// A known facility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Facility {
    /// Facility id.
    pub id: FacilityId,
    /// Short code used in file names.
    pub code: String,
    /// Display name.
    pub name: String,
}

/// Resolves facilities by id or code.
pub trait FacilityDirectory: Send + Sync {
    /// Looks up a facility by id.
    fn by_id(&self, id: FacilityId) -> Option<Facility>;

    /// Looks up a facility by code.
    fn by_code(&self, code: &str) -> Option<Facility>;

    /// Code of `id`, or the id itself when the facility is unknown.
    fn code_of(&self, id: FacilityId) -> String {
        self.by_id(id)
            .map(|f| f.code)
            .unwrap_or_else(|| id.to_string())
    }
}

/// A fixed, in-memory directory.
#[derive(Debug, Clone, Default)]
pub struct StaticFacilityDirectory {
    facilities: HashMap<FacilityId, Facility>,
}

impl StaticFacilityDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a facility.
    pub fn with_facility(
        mut self,
        id: FacilityId,
        code: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        self.facilities.insert(
            id,
            Facility {
                id,
                code: code.into(),
                name: name.into(),
            },
        );
        self
    }
}

impl FacilityDirectory for StaticFacilityDirectory {
    fn by_id(&self, id: FacilityId) -> Option<Facility> {
        self.facilities.get(&id).cloned()
    }

    fn by_code(&self, code: &str) -> Option<Facility> {
        self.facilities.values().find(|f| f.code == code).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups() {
        let id = FacilityId::new();
        let directory = StaticFacilityDirectory::new().with_facility(id, "HC01", "Health Centre 1");

        assert_eq!(directory.by_code("HC01").unwrap().id, id);
        assert_eq!(directory.code_of(id), "HC01");

        let unknown = FacilityId::new();
        assert_eq!(directory.code_of(unknown), unknown.to_string());
        assert!(directory.by_code("nope").is_none());
    }
}
