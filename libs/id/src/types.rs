//! Handle and team identifier definitions.

use crate::define_handle;

// =============================================================================
// Runtime Objects
// =============================================================================

define_handle!(ContainerHandle, "ctr");
define_handle!(VolumeHandle, "vol");

// =============================================================================
// Teams
// =============================================================================

/// Identifier of the team owning a worker or requesting a container.
///
/// Team `0` is reserved: a worker owned by team `0` is a shared,
/// general-purpose worker that serves every team.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TeamId(i32);

impl TeamId {
    /// The owner of shared workers.
    pub const UNOWNED: Self = Self(0);

    #[must_use]
    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(&self) -> i32 {
        self.0
    }

    /// Returns true for the shared-worker sentinel.
    #[must_use]
    pub const fn is_unowned(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for TeamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for TeamId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

impl From<TeamId> for i32 {
    fn from(id: TeamId) -> Self {
        id.0
    }
}

impl serde::Serialize for TeamId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i32(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for TeamId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        i32::deserialize(deserializer).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_handle_prefix() {
        let handle = ContainerHandle::new();
        assert!(handle.to_string().starts_with("ctr_"));
    }

    #[test]
    fn test_container_handle_parse() {
        let handle = ContainerHandle::new();
        let parsed: ContainerHandle = handle.to_string().parse().unwrap();
        assert_eq!(handle, parsed);
    }

    #[test]
    fn test_volume_handle_rejects_container_prefix() {
        let handle = ContainerHandle::new().to_string();
        let err = handle.parse::<VolumeHandle>().unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_handle_missing_separator() {
        let result: Result<VolumeHandle, _> = "vol01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result, Err(crate::IdError::MissingSeparator)));
    }

    #[test]
    fn test_handle_empty() {
        let result: Result<VolumeHandle, _> = "".parse();
        assert!(matches!(result, Err(crate::IdError::Empty)));
    }

    #[test]
    fn test_handle_invalid_ulid() {
        let result: Result<ContainerHandle, _> = "ctr_not-a-ulid".parse();
        assert!(matches!(result, Err(crate::IdError::InvalidUlid(_))));
    }

    #[test]
    fn test_handle_json_is_string() {
        let handle = VolumeHandle::new();
        let json = serde_json::to_string(&handle).unwrap();
        assert_eq!(json, format!("\"{}\"", handle));
    }

    #[test]
    fn test_team_unowned() {
        assert!(TeamId::UNOWNED.is_unowned());
        assert!(TeamId::default().is_unowned());
        assert!(!TeamId::new(7).is_unowned());
    }

    #[test]
    fn test_team_json_is_integer() {
        let json = serde_json::to_string(&TeamId::new(42)).unwrap();
        assert_eq!(json, "42");
        let parsed: TeamId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.value(), 42);
    }
}
