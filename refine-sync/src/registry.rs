//! Documents by guid, owned by one provider.

use std::collections::HashMap;

use yrs::Doc;

use crate::error::{SyncError, SyncResult};

#[derive(Default)]
pub struct DocRegistry {
    docs: HashMap<String, Doc>,
}

impl DocRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `doc` under its guid. Registering a guid twice is a bug in
    /// the caller and is reported as [`SyncError::DocumentAlreadySetup`].
    pub fn insert(&mut self, doc: Doc) -> SyncResult<()> {
        let guid = doc.guid().to_string();
        if self.docs.contains_key(&guid) {
            return Err(SyncError::DocumentAlreadySetup(guid));
        }
        self.docs.insert(guid, doc);
        Ok(())
    }

    pub fn get(&self, guid: &str) -> Option<Doc> {
        self.docs.get(guid).cloned()
    }

    pub fn remove(&mut self, guid: &str) -> SyncResult<Doc> {
        self.docs
            .remove(guid)
            .ok_or_else(|| SyncError::DocumentNotSetup(guid.to_string()))
    }

    pub fn contains(&self, guid: &str) -> bool {
        self.docs.contains_key(guid)
    }

    pub fn guids(&self) -> Vec<String> {
        self.docs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn clear(&mut self) {
        self.docs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::new_doc;

    #[test]
    fn test_insert_and_lookup() {
        let mut registry = DocRegistry::new();
        registry.insert(new_doc("root")).unwrap();
        assert!(registry.contains("root"));
        assert_eq!(registry.get("root").unwrap().guid().to_string(), "root");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_double_setup_fails() {
        let mut registry = DocRegistry::new();
        registry.insert(new_doc("root")).unwrap();
        let err = registry.insert(new_doc("root")).unwrap_err();
        assert!(matches!(err, SyncError::DocumentAlreadySetup(g) if g == "root"));
    }

    #[test]
    fn test_remove_unknown_fails() {
        let mut registry = DocRegistry::new();
        assert!(matches!(registry.remove("nope"), Err(SyncError::DocumentNotSetup(_))));
    }

    #[test]
    fn test_clear() {
        let mut registry = DocRegistry::new();
        registry.insert(new_doc("a")).unwrap();
        registry.insert(new_doc("b")).unwrap();
        assert_eq!(registry.len(), 2);
        registry.clear();
        assert!(registry.is_empty());
    }
}
