//! Per-node traceroute bookkeeping and its on-disk form
//!
//! [`TracerouteSchedule`] is pure: every method takes the current time, so
//! the eligibility and backoff rules can be exercised without a clock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::backoff::ExponentialBackoff;
use crate::config::TracerouteConfig;
use crate::error::{BridgeError, Result};
use crate::node::NodeId;

/// Traceroute history of one node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TracerouteTarget {
    /// The node
    pub node_id: NodeId,
    /// When the last attempt finished
    pub last_attempt_time: Option<DateTime<Utc>>,
    /// Consecutive failures, capped at the configured maximum
    pub retry_count: u32,
    /// Wait after the last failure before the next attempt
    #[serde(with = "duration_secs")]
    pub current_backoff: Duration,
    /// When the last successful traceroute finished
    pub last_success_time: Option<DateTime<Utc>>,
}

impl TracerouteTarget {
    fn new(node_id: NodeId, base: Duration) -> Self {
        Self {
            node_id,
            last_attempt_time: None,
            retry_count: 0,
            current_backoff: base,
            last_success_time: None,
        }
    }

    /// Whether no traceroute was ever attempted
    pub fn is_new(&self) -> bool {
        self.last_attempt_time.is_none()
    }

    /// Whether the node is waiting out a failure backoff at `now`
    pub fn in_backoff(&self, now: DateTime<Utc>) -> bool {
        self.retry_count > 0 && self.next_eligible_at_unchecked().is_some_and(|at| at > now)
    }

    fn next_eligible_at_unchecked(&self) -> Option<DateTime<Utc>> {
        let last = self.last_attempt_time?;
        Some(last + to_chrono(self.current_backoff))
    }

    /// Earliest time the node may be traced again; `None` means now
    pub fn next_eligible_at(&self, interval: Duration) -> Option<DateTime<Utc>> {
        let last_attempt = self.last_attempt_time?;
        if self.retry_count > 0 {
            return Some(last_attempt + to_chrono(self.current_backoff));
        }
        let last_success = self.last_success_time.unwrap_or(last_attempt);
        Some(last_success + to_chrono(interval))
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Retry and refresh rules
#[derive(Debug, Clone)]
pub struct SchedulePolicy {
    /// Refresh period after a success
    pub interval: Duration,
    /// Failures before backing off at the maximum
    pub max_retries: u32,
    /// Failure backoff
    pub backoff: ExponentialBackoff,
}

impl SchedulePolicy {
    /// Policy from the daemon configuration
    pub fn from_config(config: &TracerouteConfig) -> Self {
        Self {
            interval: config.interval,
            max_retries: config.max_retries,
            backoff: ExponentialBackoff::new(config.retry_base, config.max_backoff),
        }
    }
}

/// Which node to trace next
#[derive(Debug, Clone)]
pub struct TracerouteSchedule {
    policy: SchedulePolicy,
    targets: BTreeMap<NodeId, TracerouteTarget>,
    /// Never-attempted nodes in discovery order
    new_nodes: VecDeque<NodeId>,
    /// Manually requested nodes in request order
    requested: VecDeque<NodeId>,
}

impl TracerouteSchedule {
    /// Empty schedule
    pub fn new(policy: SchedulePolicy) -> Self {
        Self {
            policy,
            targets: BTreeMap::new(),
            new_nodes: VecDeque::new(),
            requested: VecDeque::new(),
        }
    }

    /// Schedule seeded with persisted targets
    pub fn with_targets(
        policy: SchedulePolicy,
        targets: impl IntoIterator<Item = TracerouteTarget>,
    ) -> Self {
        let mut schedule = Self::new(policy);
        for target in targets {
            if target.is_new() {
                schedule.new_nodes.push_back(target.node_id);
            }
            schedule.targets.insert(target.node_id, target);
        }
        schedule
    }

    /// All targets, ordered by node id
    pub fn targets(&self) -> impl Iterator<Item = &TracerouteTarget> {
        self.targets.values()
    }

    /// Target for `node`
    pub fn get(&self, node: &NodeId) -> Option<&TracerouteTarget> {
        self.targets.get(node)
    }

    /// Number of known nodes
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether no nodes are known
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Register a node; returns whether it was new
    pub fn observe(&mut self, node: NodeId) -> bool {
        if self.targets.contains_key(&node) {
            return false;
        }
        self.targets
            .insert(node, TracerouteTarget::new(node, self.policy.backoff.base()));
        self.new_nodes.push_back(node);
        true
    }

    fn is_due(&self, target: &TracerouteTarget, now: DateTime<Utc>) -> bool {
        target
            .next_eligible_at(self.policy.interval)
            .map_or(true, |at| at <= now)
    }

    /// Ask for an out-of-schedule traceroute
    ///
    /// Refused for unknown nodes, nodes in failure backoff, and nodes that
    /// are already due or requested.
    pub fn request(&mut self, node: NodeId, now: DateTime<Utc>) -> bool {
        let Some(target) = self.targets.get(&node) else {
            return false;
        };
        if target.in_backoff(now) || self.is_due(target, now) || self.requested.contains(&node) {
            return false;
        }
        self.requested.push_back(node);
        true
    }

    /// Next node to trace at `now`, skipping `exclude`
    ///
    /// New nodes first in discovery order, then manual requests, then
    /// due nodes with the oldest success first.
    pub fn next_due(&self, now: DateTime<Utc>, exclude: Option<NodeId>) -> Option<NodeId> {
        let allowed = |node: &NodeId| Some(*node) != exclude;

        if let Some(node) = self.new_nodes.iter().find(|n| allowed(n)) {
            return Some(*node);
        }
        if let Some(node) = self.requested.iter().find(|n| allowed(n)) {
            return Some(*node);
        }

        self.targets
            .values()
            .filter(|t| allowed(&t.node_id) && self.is_due(t, now))
            .min_by_key(|t| (t.last_success_time, t.last_attempt_time, t.node_id))
            .map(|t| t.node_id)
    }

    /// A traceroute to `node` is starting
    pub fn start(&mut self, node: NodeId) {
        self.new_nodes.retain(|n| *n != node);
        self.requested.retain(|n| *n != node);
    }

    /// A traceroute to `node` succeeded at `now`
    pub fn record_success(&mut self, node: NodeId, now: DateTime<Utc>) {
        let base = self.policy.backoff.base();
        let target = self
            .targets
            .entry(node)
            .or_insert_with(|| TracerouteTarget::new(node, base));
        target.last_attempt_time = Some(now);
        target.last_success_time = Some(now);
        target.retry_count = 0;
        target.current_backoff = base;
    }

    /// A traceroute to `node` failed at `now`
    pub fn record_failure(&mut self, node: NodeId, now: DateTime<Utc>) -> &TracerouteTarget {
        let base = self.policy.backoff.base();
        let max_retries = self.policy.max_retries;
        let backoff = self.policy.backoff;

        let target = self
            .targets
            .entry(node)
            .or_insert_with(|| TracerouteTarget::new(node, base));
        target.last_attempt_time = Some(now);
        if target.retry_count >= max_retries {
            target.current_backoff = backoff.max();
        } else {
            target.retry_count += 1;
            target.current_backoff = backoff.delay(target.retry_count);
        }
        target
    }
}

/// Persisted form of a target; the node id is the map key
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedTarget {
    #[serde(default)]
    retry_count: u32,
    #[serde(with = "duration_secs", default)]
    current_backoff: Duration,
    #[serde(default)]
    last_attempt_time: Option<DateTime<Utc>>,
    #[serde(default)]
    last_success_time: Option<DateTime<Utc>>,
}

impl From<&TracerouteTarget> for PersistedTarget {
    fn from(target: &TracerouteTarget) -> Self {
        Self {
            retry_count: target.retry_count,
            current_backoff: target.current_backoff,
            last_attempt_time: target.last_attempt_time,
            last_success_time: target.last_success_time,
        }
    }
}

/// State file keys are canonical ids; plain decimal node numbers are
/// accepted too
fn parse_key(key: &str) -> Result<NodeId> {
    match key.parse::<u32>() {
        Ok(num) => Ok(NodeId::new(num)),
        Err(_) => key.parse(),
    }
}

/// Read the state file; a missing file is an empty state
pub async fn load(path: &Path) -> Result<Vec<TracerouteTarget>> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No traceroute state file");
            return Ok(Vec::new());
        }
        Err(e) => return Err(BridgeError::persistence(path, e)),
    };

    let entries: BTreeMap<String, PersistedTarget> =
        serde_json::from_slice(&data).map_err(|e| BridgeError::persistence(path, e))?;

    let mut targets = Vec::with_capacity(entries.len());
    for (key, entry) in entries {
        let node_id = match parse_key(&key) {
            Ok(id) => id,
            Err(e) => {
                warn!(key = %key, error = %e, "Skipping persisted entry with bad node id");
                continue;
            }
        };
        targets.push(TracerouteTarget {
            node_id,
            last_attempt_time: entry.last_attempt_time,
            retry_count: entry.retry_count,
            current_backoff: entry.current_backoff,
            last_success_time: entry.last_success_time,
        });
    }
    Ok(targets)
}

/// Write the state file: temp file, fsync, rename
pub async fn save<'a>(
    path: &Path,
    targets: impl IntoIterator<Item = &'a TracerouteTarget>,
) -> Result<()> {
    let entries: BTreeMap<String, PersistedTarget> = targets
        .into_iter()
        .map(|t| (t.node_id.canonical(), PersistedTarget::from(t)))
        .collect();
    let data = serde_json::to_vec_pretty(&entries).map_err(|e| BridgeError::persistence(path, e))?;

    let tmp = temp_path(path);
    let write = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    };

    if let Err(e) = write.await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(BridgeError::persistence(path, e));
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("backoff must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy() -> SchedulePolicy {
        SchedulePolicy {
            interval: Duration::from_secs(43200),
            max_retries: 3,
            backoff: ExponentialBackoff::new(Duration::from_secs(60), Duration::from_secs(86400)),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn test_new_nodes_first_in_discovery_order() {
        let mut schedule = TracerouteSchedule::new(policy());
        let a = NodeId::new(0xa);
        let b = NodeId::new(0xb);
        let c = NodeId::new(0xc);
        schedule.observe(c);
        schedule.observe(a);
        assert!(!schedule.observe(c));

        // b has a success older than the interval and is due, but new nodes win
        schedule.record_success(b, t0() - secs(50_000));
        assert_eq!(schedule.next_due(t0(), None), Some(c));
        schedule.start(c);
        schedule.record_success(c, t0());
        assert_eq!(schedule.next_due(t0(), None), Some(a));
        schedule.start(a);
        schedule.record_success(a, t0());
        assert_eq!(schedule.next_due(t0(), None), Some(b));
    }

    #[test]
    fn test_failure_backoff_sequence() {
        let mut schedule = TracerouteSchedule::new(policy());
        let node = NodeId::new(0x42);
        schedule.observe(node);

        let backoffs: Vec<u64> = (0..5)
            .map(|_| {
                schedule.start(node);
                schedule.record_failure(node, t0()).current_backoff.as_secs()
            })
            .collect();
        assert_eq!(backoffs, vec![120, 240, 480, 86400, 86400]);
        assert_eq!(schedule.get(&node).unwrap().retry_count, 3);
    }

    #[test]
    fn test_third_failure_waits_480s() {
        let mut schedule = TracerouteSchedule::new(policy());
        let node = NodeId::new(0x42);
        schedule.observe(node);
        for _ in 0..3 {
            schedule.start(node);
            schedule.record_failure(node, t0());
        }
        assert_eq!(schedule.get(&node).unwrap().retry_count, 3);
        assert_eq!(schedule.next_due(t0() + secs(479), None), None);
        assert_eq!(schedule.next_due(t0() + secs(480), None), Some(node));
    }

    #[test]
    fn test_success_resets() {
        let mut schedule = TracerouteSchedule::new(policy());
        let node = NodeId::new(0x42);
        schedule.observe(node);
        schedule.start(node);
        schedule.record_failure(node, t0());
        schedule.record_success(node, t0() + secs(200));

        let target = schedule.get(&node).unwrap();
        assert_eq!(target.retry_count, 0);
        assert_eq!(target.current_backoff, Duration::from_secs(60));
        assert_eq!(target.last_success_time, Some(t0() + secs(200)));
        assert_eq!(schedule.next_due(t0() + secs(43_000), None), None);
        assert_eq!(schedule.next_due(t0() + secs(43_400), None), Some(node));
    }

    #[test]
    fn test_refresh_oldest_success_first() {
        let mut schedule = TracerouteSchedule::new(policy());
        let older = NodeId::new(0x2);
        let newer = NodeId::new(0x1);
        schedule.record_success(older, t0() - secs(90_000));
        schedule.record_success(newer, t0() - secs(50_000));
        assert_eq!(schedule.next_due(t0(), None), Some(older));
    }

    #[test]
    fn test_exclude_gateway() {
        let mut schedule = TracerouteSchedule::new(policy());
        let gateway = NodeId::new(0x1);
        schedule.observe(gateway);
        assert_eq!(schedule.next_due(t0(), Some(gateway)), None);
    }

    #[test]
    fn test_manual_request() {
        let mut schedule = TracerouteSchedule::new(policy());
        let node = NodeId::new(0x7);
        assert!(!schedule.request(node, t0()));

        schedule.observe(node);
        // Already due as a new node
        assert!(!schedule.request(node, t0()));

        schedule.start(node);
        schedule.record_success(node, t0());
        assert!(schedule.request(node, t0()));
        assert!(!schedule.request(node, t0()));
        assert_eq!(schedule.next_due(t0(), None), Some(node));

        schedule.start(node);
        schedule.record_failure(node, t0());
        assert!(!schedule.request(node, t0() + secs(10)));
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traceroute_state.json");

        let mut schedule = TracerouteSchedule::new(policy());
        let failed = NodeId::new(0x1a2b3c4d);
        let ok = NodeId::new(0x00000abc);
        let fresh = NodeId::new(0x00000def);
        schedule.observe(failed);
        schedule.observe(ok);
        schedule.observe(fresh);
        for _ in 0..3 {
            schedule.start(failed);
            schedule.record_failure(failed, t0());
        }
        schedule.start(ok);
        schedule.record_success(ok, t0());

        save(&path, schedule.targets()).await.unwrap();
        let reloaded = TracerouteSchedule::with_targets(policy(), load(&path).await.unwrap());

        assert_eq!(reloaded.get(&failed), schedule.get(&failed));
        assert_eq!(reloaded.get(&ok), schedule.get(&ok));
        assert_eq!(reloaded.next_due(t0(), None), Some(fresh));
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut schedule = TracerouteSchedule::new(policy());
        schedule.observe(NodeId::new(0x42));
        schedule.start(NodeId::new(0x42));
        schedule.record_failure(NodeId::new(0x42), t0());
        save(&path, schedule.targets()).await.unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let entry = &value["!00000042"];
        assert_eq!(entry["retry_count"], 1);
        assert_eq!(entry["current_backoff"], 120);
        assert!(entry["last_success_time"].is_null());
    }

    #[tokio::test]
    async fn test_load_tolerates_unknown_fields_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        assert!(load(&path).await.unwrap().is_empty());

        std::fs::write(
            &path,
            r#"{
                "!00000042": {"retry_count": 2, "current_backoff": 240.0, "saved_by": "v1",
                              "last_attempt_time": "2024-05-01T12:00:00Z"},
                "not-a-node": {"retry_count": 1}
            }"#,
        )
        .unwrap();
        let targets = load(&path).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].retry_count, 2);
        assert_eq!(targets[0].current_backoff, Duration::from_secs(240));
    }

    #[tokio::test]
    async fn test_load_decimal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"66": {"retry_count": 1, "current_backoff": 120}}"#).unwrap();

        let targets = load(&path).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].node_id, NodeId::new(0x42));
        assert_eq!(targets[0].current_backoff, Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();
        let err = load(&path).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Persistence);
    }

    #[tokio::test]
    async fn test_save_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("state.json");
        let schedule = TracerouteSchedule::new(policy());
        assert!(matches!(
            save(&path, schedule.targets()).await,
            Err(BridgeError::Persistence { .. })
        ));
    }
}
