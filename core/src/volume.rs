use crate::{Error, Result, SnapshotID, VolumeID};
use serde::{Deserialize, Serialize};

/// Named group of snapshot ids. Holds ids only, never snapshot data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeID,
    pub name: String,
    pub description: String,
    pub snapshots: Vec<SnapshotID>,
}

impl Volume {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            name: name.into(),
            description: description.into(),
            snapshots: Vec::new(),
        }
    }

    /// Appends a snapshot id. Adding an id twice is a no-op.
    pub fn add_snapshot(&mut self, id: impl Into<SnapshotID>) {
        let id = id.into();
        if !self.snapshots.contains(&id) {
            self.snapshots.push(id);
        }
    }

    pub fn remove_snapshot(&mut self, id: &str) -> Result<()> {
        let position = self
            .snapshots
            .iter()
            .position(|s| s == id)
            .ok_or_else(|| Error::SnapshotNotFound { id: id.to_string() })?;
        self.snapshots.remove(position);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.snapshots.iter().any(|s| s == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_remove_snapshots() {
        let mut volume = Volume::new("test_name", "test_description");
        assert_eq!(volume.id.len(), 8);

        volume.add_snapshot("s1");
        volume.add_snapshot("s2");
        volume.add_snapshot("s1");
        assert_eq!(volume.snapshots, vec!["s1", "s2"]);

        volume.remove_snapshot("s1").unwrap();
        assert!(!volume.contains("s1"));
        assert!(volume.remove_snapshot("s1").unwrap_err().is_not_found());
    }
}
