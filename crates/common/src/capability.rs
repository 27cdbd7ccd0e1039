//! Capability registry
//!
//! A capability is a named guarantee a target makes about the operations it
//! supports. The well-known names live here as constants; backends are free
//! to declare their own extensions with [`Capability::new`].

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;

/// Opaque capability tag
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(Cow<'static, str>);

/// Command execution returning exit code and output
pub const EXEC: Capability = Capability::from_static("exec");
/// Scoped remote sessions over SSH
pub const SSH: Capability = Capability::from_static("ssh");
/// File transfer over SFTP
pub const SFTP: Capability = Capability::from_static("sftp");
/// Generic upload/download
pub const FILE_TRANSFER: Capability = Capability::from_static("file_transfer");
/// Restart of the whole target environment
pub const RESTART: Capability = Capability::from_static("restart");
/// ICMP reachability
pub const PING: Capability = Capability::from_static("ping");

/// Capabilities with a dedicated operation in the target's operation table
pub const KNOWN: &[Capability] = &[EXEC, SSH, SFTP, FILE_TRANSFER, RESTART, PING];

impl Capability {
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Create a capability from a runtime name (backend-defined extensions)
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        match KNOWN.iter().find(|c| c.as_str() == name) {
            Some(known) => known.clone(),
            None => Self(Cow::Owned(name)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is one of the conventional tags
    pub fn is_known(&self) -> bool {
        KNOWN.contains(self)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(name: &str) -> Self {
        Capability::new(name)
    }
}

impl From<String> for Capability {
    fn from(name: String) -> Self {
        Capability::new(name)
    }
}

/// Ordered set of capabilities
///
/// There is no public way to remove a member; a set handed to a target is
/// frozen for the target's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, capability: &Capability) -> bool {
        self.0.contains(capability)
    }

    pub fn is_subset(&self, other: &CapabilitySet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn intersects(&self, other: &CapabilitySet) -> bool {
        self.0.intersection(&other.0).next().is_some()
    }

    /// Members of `self` that `available` lacks, sorted
    pub fn missing_from(&self, available: &CapabilitySet) -> Vec<Capability> {
        self.0.difference(&available.0).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }
}

impl<C: Into<Capability>> FromIterator<C> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = C>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(Capability::as_str).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_name_resolves_to_known_constant() {
        let cap = Capability::new("ssh");
        assert_eq!(cap, SSH);
        assert!(cap.is_known());
        assert!(!Capability::new("can_bus").is_known());
    }

    #[test]
    fn test_missing_is_sorted_difference() {
        let required: CapabilitySet = ["sftp", "exec", "ssh"].into_iter().collect();
        let available: CapabilitySet = ["exec"].into_iter().collect();
        assert_eq!(required.missing_from(&available), vec![SFTP, SSH]);
        assert!(!required.is_subset(&available));
        assert!(required.intersects(&available));
    }

    #[test]
    fn test_set_serializes_as_string_list() {
        let set: CapabilitySet = ["restart", "exec"].into_iter().collect();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["exec","restart"]"#);
        let back: CapabilitySet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
        assert_eq!(set.to_string(), "{exec, restart}");
    }
}
