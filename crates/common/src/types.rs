//! Core types for edharness

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of the test worker driving one editor instance.
///
/// The primary worker reuses the canonical project; every other worker gets
/// its own project copy and port derived from its ordinal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerId {
    Primary,
    Worker { label: String, ordinal: u16 },
}

impl WorkerId {
    pub fn is_primary(&self) -> bool {
        matches!(self, WorkerId::Primary)
    }

    pub fn label(&self) -> &str {
        match self {
            WorkerId::Primary => "master",
            WorkerId::Worker { label, .. } => label,
        }
    }

    pub fn ordinal(&self) -> Option<u16> {
        match self {
            WorkerId::Primary => None,
            WorkerId::Worker { ordinal, .. } => Some(*ordinal),
        }
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::Primary
    }
}

impl FromStr for WorkerId {
    type Err = crate::Error;

    /// Parse a worker label. `master`, `primary` and the empty string name the
    /// primary; anything else must end in a decimal ordinal (`gw3`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim();
        if label.is_empty() || label == "master" || label == "primary" {
            return Ok(WorkerId::Primary);
        }

        let digits = label.len() - label.trim_end_matches(|c: char| c.is_ascii_digit()).len();
        let ordinal = label[label.len() - digits..]
            .parse::<u16>()
            .map_err(|_| {
                crate::Error::InvalidConfig(format!(
                    "worker label '{}' has no numeric ordinal",
                    label
                ))
            })?;

        Ok(WorkerId::Worker {
            label: label.to_string(),
            ordinal,
        })
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Intensity of the state resync applied after a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupLevel {
    Noop,
    Minimal,
    Full,
}

impl CleanupLevel {
    /// Level declared by a test's metadata. Protocol-only tests never touch
    /// editor state; structural tests change the project layout.
    pub fn for_test(meta: &TestMetadata) -> Self {
        if meta.categories.contains(&TestCategory::Protocol) {
            CleanupLevel::Noop
        } else if meta.categories.contains(&TestCategory::Structural) {
            CleanupLevel::Full
        } else {
            CleanupLevel::Minimal
        }
    }

    /// Level to apply after the test ran. A failure always escalates to Full.
    pub fn after_outcome(self, outcome: TestOutcome) -> Self {
        match outcome {
            TestOutcome::Failed => CleanupLevel::Full,
            TestOutcome::Passed | TestOutcome::Skipped => self,
        }
    }
}

impl Default for CleanupLevel {
    fn default() -> Self {
        Self::Minimal
    }
}

impl fmt::Display for CleanupLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupLevel::Noop => write!(f, "noop"),
            CleanupLevel::Minimal => write!(f, "minimal"),
            CleanupLevel::Full => write!(f, "full"),
        }
    }
}

impl FromStr for CleanupLevel {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "noop" => Ok(CleanupLevel::Noop),
            "minimal" => Ok(CleanupLevel::Minimal),
            "full" => Ok(CleanupLevel::Full),
            other => Err(crate::Error::InvalidConfig(format!(
                "unknown cleanup level '{}'",
                other
            ))),
        }
    }
}

/// Declared category of a test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCategory {
    /// Pure RPC traffic, no editor state involved
    Protocol,
    /// Creates, moves or deletes project files
    Structural,
    /// Compiles scripts or shaders
    Compilation,
    /// Drives the editor's test runner
    TestRunner,
}

/// Structured metadata a test case declares up front
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestMetadata {
    pub name: String,
    #[serde(default)]
    pub categories: Vec<TestCategory>,
}

impl TestMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            categories: Vec::new(),
        }
    }

    pub fn with_category(mut self, category: TestCategory) -> Self {
        if !self.categories.contains(&category) {
            self.categories.push(category);
        }
        self
    }

    pub fn cleanup_level(&self) -> CleanupLevel {
        CleanupLevel::for_test(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestOutcome::Passed => write!(f, "passed"),
            TestOutcome::Failed => write!(f, "failed"),
            TestOutcome::Skipped => write!(f, "skipped"),
        }
    }
}

/// Editor instance state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Starting,
    Ready,
    Stopping,
    Stopped,
}

impl Default for InstanceState {
    fn default() -> Self {
        Self::Stopped
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Starting => write!(f, "starting"),
            InstanceState::Ready => write!(f, "ready"),
            InstanceState::Stopping => write!(f, "stopping"),
            InstanceState::Stopped => write!(f, "stopped"),
        }
    }
}

/// How far a worker's project copy is from the canonical project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Absent,
    FullCopyNeeded,
    IncrementalSyncNeeded,
    UpToDate,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Absent => write!(f, "absent"),
            SyncState::FullCopyNeeded => write!(f, "full copy needed"),
            SyncState::IncrementalSyncNeeded => write!(f, "incremental sync needed"),
            SyncState::UpToDate => write!(f, "up to date"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_parsing() {
        assert_eq!("master".parse::<WorkerId>().unwrap(), WorkerId::Primary);
        assert_eq!("primary".parse::<WorkerId>().unwrap(), WorkerId::Primary);
        assert_eq!("".parse::<WorkerId>().unwrap(), WorkerId::Primary);

        let gw3: WorkerId = "gw3".parse().unwrap();
        assert_eq!(gw3.ordinal(), Some(3));
        assert_eq!(gw3.label(), "gw3");
        assert_eq!(gw3.to_string(), "gw3");

        let gw12: WorkerId = "gw12".parse().unwrap();
        assert_eq!(gw12.ordinal(), Some(12));

        assert!("worker".parse::<WorkerId>().is_err());
    }

    #[test]
    fn test_cleanup_level_from_metadata() {
        let plain = TestMetadata::new("test_compile");
        assert_eq!(plain.cleanup_level(), CleanupLevel::Minimal);

        let structural =
            TestMetadata::new("test_create_script").with_category(TestCategory::Structural);
        assert_eq!(structural.cleanup_level(), CleanupLevel::Full);

        let protocol = TestMetadata::new("test_list_tools")
            .with_category(TestCategory::Structural)
            .with_category(TestCategory::Protocol);
        assert_eq!(protocol.cleanup_level(), CleanupLevel::Noop);
    }

    #[test]
    fn test_failure_escalates_to_full() {
        assert_eq!(CleanupLevel::Noop.after_outcome(TestOutcome::Failed), CleanupLevel::Full);
        assert_eq!(CleanupLevel::Minimal.after_outcome(TestOutcome::Failed), CleanupLevel::Full);
        assert_eq!(CleanupLevel::Noop.after_outcome(TestOutcome::Passed), CleanupLevel::Noop);
        assert_eq!(CleanupLevel::Full.after_outcome(TestOutcome::Passed), CleanupLevel::Full);
    }

    #[test]
    fn test_cleanup_level_round_trips_through_display() {
        for level in [CleanupLevel::Noop, CleanupLevel::Minimal, CleanupLevel::Full] {
            assert_eq!(level.to_string().parse::<CleanupLevel>().unwrap(), level);
        }
        assert!("aggressive".parse::<CleanupLevel>().is_err());
    }
}
