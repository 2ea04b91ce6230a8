//! In-memory agent registry.
//!
//! A copy-on-write snapshot loaded from the store at startup and rebuilt on
//! registration events. Readers are lock-free; updates swap the whole
//! snapshot atomically.

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
const OFFLINE_MULTIPLIER: i64 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: Uuid,
    pub agent_type: String,
    /// `None` for globally available agents.
    pub platform_id: Option<Uuid>,
    pub enabled: bool,
    pub heartbeat_interval_secs: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub online: bool,
}

impl AgentRecord {
    pub fn global(agent_type: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_type: agent_type.to_string(),
            platform_id: None,
            enabled: true,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            last_heartbeat: None,
            online: true,
        }
    }
}

/// Result of an agent lookup. On a miss, `suggestion` carries the closest
/// registered type at edit distance one, for the caller's error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLookup {
    pub exists: bool,
    pub suggestion: Option<String>,
}

type AgentKey = (Option<Uuid>, String);

#[derive(Default)]
struct Snapshot {
    agents: HashMap<AgentKey, AgentRecord>,
}

#[derive(Default)]
pub struct AgentRegistry {
    snapshot: ArcSwap<Snapshot>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole snapshot, e.g. after loading registry rows.
    pub fn rebuild(&self, records: Vec<AgentRecord>) {
        let mut agents = HashMap::with_capacity(records.len());
        for record in records {
            agents.insert((record.platform_id, record.agent_type.clone()), record);
        }
        let count = agents.len();
        self.snapshot.store(Arc::new(Snapshot { agents }));
        info!(agents = count, "agent registry snapshot rebuilt");
    }

    pub fn all(&self) -> Vec<AgentRecord> {
        self.snapshot.load().agents.values().cloned().collect()
    }

    pub fn known_types(&self) -> Vec<String> {
        let snapshot = self.snapshot.load();
        let mut types: Vec<String> =
            snapshot.agents.values().map(|a| a.agent_type.clone()).collect();
        types.sort();
        types.dedup();
        types
    }

    /// Lookup precedence: platform-scoped agent first, then global.
    pub fn validate_agent(&self, agent_type: &str, platform_id: Option<Uuid>) -> AgentLookup {
        let snapshot = self.snapshot.load();

        let scoped = platform_id
            .and_then(|pid| snapshot.agents.get(&(Some(pid), agent_type.to_string())))
            .filter(|a| a.enabled);
        let global =
            snapshot.agents.get(&(None, agent_type.to_string())).filter(|a| a.enabled);

        if scoped.or(global).is_some() {
            return AgentLookup { exists: true, suggestion: None };
        }

        let suggestion = snapshot
            .agents
            .values()
            .filter(|a| a.enabled)
            .filter(|a| a.platform_id.is_none() || a.platform_id == platform_id)
            .map(|a| a.agent_type.as_str())
            .filter(|candidate| edit_distance(agent_type, candidate) <= 1)
            .min_by_key(|candidate| edit_distance(agent_type, candidate))
            .map(|s| s.to_string());

        AgentLookup { exists: false, suggestion }
    }

    /// Record a heartbeat, registering the agent on first sight.
    pub fn record_heartbeat(
        &self,
        agent_type: &str,
        platform_id: Option<Uuid>,
        heartbeat_interval_secs: Option<u64>,
        now: DateTime<Utc>,
    ) {
        let current = self.snapshot.load();
        let mut agents = current.agents.clone();

        let key = (platform_id, agent_type.to_string());
        let record = agents.entry(key).or_insert_with(|| AgentRecord {
            id: Uuid::new_v4(),
            agent_type: agent_type.to_string(),
            platform_id,
            enabled: true,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            last_heartbeat: None,
            online: true,
        });
        if let Some(interval) = heartbeat_interval_secs {
            record.heartbeat_interval_secs = interval;
        }
        record.last_heartbeat = Some(now);
        record.online = true;

        self.snapshot.store(Arc::new(Snapshot { agents }));
    }

    /// Mark agents offline whose last heartbeat is older than three times
    /// their declared interval. Returns the agents that just went offline.
    pub fn sweep_offline(&self, now: DateTime<Utc>) -> Vec<AgentRecord> {
        let current = self.snapshot.load();
        let mut agents = current.agents.clone();
        let mut newly_offline = Vec::new();

        for record in agents.values_mut() {
            if !record.online {
                continue;
            }
            let Some(last) = record.last_heartbeat else { continue };
            let threshold =
                ChronoDuration::seconds(record.heartbeat_interval_secs as i64 * OFFLINE_MULTIPLIER);
            if now - last > threshold {
                record.online = false;
                newly_offline.push(record.clone());
            }
        }

        if !newly_offline.is_empty() {
            self.snapshot.store(Arc::new(Snapshot { agents }));
        }
        newly_offline
    }
}

/// Levenshtein distance, used only for near-miss suggestions.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edit_distance_basics() {
        assert_eq!(edit_distance("scaffold", "scaffold"), 0);
        assert_eq!(edit_distance("ml-trainng", "ml-training"), 1);
        assert_eq!(edit_distance("a", "abc"), 2);
        assert_eq!(edit_distance("", "xy"), 2);
    }

    #[test]
    fn lookup_prefers_platform_scoped_agents() {
        let registry = AgentRegistry::new();
        let platform = Uuid::new_v4();
        let mut scoped = AgentRecord::global("validation");
        scoped.platform_id = Some(platform);
        registry.rebuild(vec![scoped, AgentRecord::global("scaffold")]);

        assert!(registry.validate_agent("validation", Some(platform)).exists);
        assert!(registry.validate_agent("scaffold", Some(platform)).exists);
        assert!(registry.validate_agent("scaffold", None).exists);
        // Platform-scoped agents are invisible to other platforms.
        assert!(!registry.validate_agent("validation", Some(Uuid::new_v4())).exists);
    }

    #[test]
    fn lookup_suggests_near_misses() {
        let registry = AgentRegistry::new();
        registry.rebuild(vec![AgentRecord::global("ml-training")]);

        let lookup = registry.validate_agent("ml-trainng", None);
        assert!(!lookup.exists);
        assert_eq!(lookup.suggestion.as_deref(), Some("ml-training"));

        let lookup = registry.validate_agent("completely-different", None);
        assert!(lookup.suggestion.is_none());
    }

    #[test]
    fn disabled_agents_do_not_resolve() {
        let registry = AgentRegistry::new();
        let mut record = AgentRecord::global("scaffold");
        record.enabled = false;
        registry.rebuild(vec![record]);

        assert!(!registry.validate_agent("scaffold", None).exists);
    }

    #[test]
    fn heartbeat_sweep_marks_stale_agents_offline() {
        let registry = AgentRegistry::new();
        let now = Utc::now();

        registry.record_heartbeat("scaffold", None, Some(30), now);
        assert!(registry.sweep_offline(now + ChronoDuration::seconds(60)).is_empty());

        let offline = registry.sweep_offline(now + ChronoDuration::seconds(91));
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0].agent_type, "scaffold");

        // Already offline: not reported twice.
        assert!(registry.sweep_offline(now + ChronoDuration::seconds(120)).is_empty());

        // A fresh heartbeat brings it back.
        registry.record_heartbeat("scaffold", None, None, now + ChronoDuration::seconds(130));
        assert!(registry.sweep_offline(now + ChronoDuration::seconds(140)).is_empty());
    }
}
