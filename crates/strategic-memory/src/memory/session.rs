//! Session continuity layer: snapshot capture, restore, restart detection,
//! and the session lifecycle state machine.
//!
//! Snapshotting reads its fields under one coordinator read transaction and
//! never suspends concurrent writers; a session stays writable while being
//! captured.

use crate::coordinator::UnifiedCoordinator;
use crate::error::{Result, StorageError};
use crate::record_store::{
    EntityProfile, SessionSnapshot, REQUIRED_SNAPSHOT_FIELDS,
};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use lazy_static::lazy_static;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Turns considered "recent" when capturing context segments.
const RECENT_TURN_WINDOW: usize = 10;

lazy_static! {
    static ref STOP_WORDS: Vec<&'static str> = vec![
        "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for",
        "of", "with", "by", "is", "am", "are", "was", "were", "be", "been",
        "being", "have", "has", "had", "do", "does", "did", "will", "would",
        "shall", "should", "may", "might", "must", "can", "could", "this",
        "that", "these", "those", "about", "what", "when", "where",
    ];
    static ref ACTION_MARKERS: Vec<&'static str> =
        vec!["todo", "action item", "follow up", "follow-up", "need to", "next step"];
}

/// Lifecycle of one session. `Expired` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Snapshotted,
    Restored,
    Expired,
}

pub struct SessionContinuity {
    coordinator: Arc<UnifiedCoordinator>,
    states: DashMap<String, SessionState>,
}

impl SessionContinuity {
    pub fn new(coordinator: Arc<UnifiedCoordinator>) -> Self {
        Self {
            coordinator,
            states: DashMap::new(),
        }
    }

    /// Current lifecycle state, if this session has been seen.
    pub fn state(&self, session_id: &str) -> Option<SessionState> {
        self.states.get(session_id).map(|s| *s)
    }

    /// Conversation-layer writes keep the session in `Active`.
    pub fn note_activity(&self, session_id: &str) {
        self.transition(session_id, SessionState::Active);
    }

    fn transition(&self, session_id: &str, next: SessionState) {
        let mut entry = self
            .states
            .entry(session_id.to_string())
            .or_insert(SessionState::Active);
        if *entry == SessionState::Expired {
            warn!("Session {} is expired; ignoring transition to {:?}", session_id, next);
            return;
        }
        *entry = next;
    }

    /// Capture a point-in-time snapshot. Non-blocking for writers: the
    /// captured fields come from one read transaction, and appends landing
    /// after it began are simply not part of this snapshot.
    pub fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot> {
        let view = self
            .coordinator
            .capture_session_view(session_id, RECENT_TURN_WINDOW)?;

        let mut fields: BTreeMap<String, serde_json::Value> = BTreeMap::new();

        if !view.turns.is_empty() {
            let turns: Vec<serde_json::Value> = view
                .turns
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "turn_index": t.turn_index,
                        "role": t.role,
                        "content": t.content,
                    })
                })
                .collect();
            fields.insert("recent_turns".into(), serde_json::Value::Array(turns));
        }

        let recent_text = view
            .turns
            .iter()
            .map(|t| t.content.to_lowercase())
            .collect::<Vec<_>>()
            .join("\n");

        let mut active_entities = Vec::new();
        for record in &view.entities {
            if let Ok(profile) = EntityProfile::from_record(record) {
                let mentioned = recent_text.contains(&profile.name)
                    || profile
                        .aliases
                        .iter()
                        .any(|alias| recent_text.contains(&alias.to_lowercase()));
                if mentioned {
                    active_entities.push(serde_json::json!(profile.name));
                }
            }
        }
        if !active_entities.is_empty() {
            fields.insert("active_entities".into(), serde_json::Value::Array(active_entities));
        }

        let open_threads = open_threads(&view.turns);
        if !open_threads.is_empty() {
            fields.insert("open_threads".into(), serde_json::json!(open_threads));
        }

        let pending_actions = pending_actions(&view.turns);
        if !pending_actions.is_empty() {
            fields.insert("pending_actions".into(), serde_json::json!(pending_actions));
        }

        let focus_topics = extract_keywords(&recent_text, 5);
        if !focus_topics.is_empty() {
            fields.insert("focus_topics".into(), serde_json::json!(focus_topics));
        }

        let quality_score = compute_quality(&fields);
        let state_hash = SessionSnapshot::compute_hash(&fields)?;
        let snapshot = SessionSnapshot {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            captured_fields: fields,
            quality_score,
            state_hash,
            captured_at: Utc::now(),
        };

        self.coordinator.insert_snapshot(&snapshot)?;
        let pruned = self
            .coordinator
            .prune_snapshots(self.coordinator.config().snapshot_keep_max)?;
        if pruned > 0 {
            debug!("Pruned {} superseded snapshot(s)", pruned);
        }

        let threshold = self.coordinator.config().quality_threshold;
        if quality_score < threshold {
            let gaps = recovery_gaps(&snapshot.captured_fields);
            warn!(
                "Snapshot {} for session {} below quality threshold ({:.2} < {:.2}), missing: {}",
                snapshot.id,
                session_id,
                quality_score,
                threshold,
                gaps.join(", ")
            );
        }

        self.transition(session_id, SessionState::Snapshotted);
        info!(
            "Captured snapshot {} for session {} (quality {:.2})",
            snapshot.id, session_id, quality_score
        );
        Ok(snapshot)
    }

    /// Load the newest snapshot for a session. Absence means "no prior
    /// session", not an error. The content hash is re-verified so a restore
    /// reproduces the captured fields byte for byte or fails loudly.
    pub fn restore(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        let Some(snapshot) = self.coordinator.latest_snapshot(session_id)? else {
            debug!("No snapshot for session {}", session_id);
            return Ok(None);
        };

        let recomputed = SessionSnapshot::compute_hash(&snapshot.captured_fields)?;
        if recomputed != snapshot.state_hash {
            return Err(StorageError::Validation(format!(
                "snapshot {} failed hash verification",
                snapshot.id
            )));
        }

        self.transition(session_id, SessionState::Restored);

        let threshold = self.coordinator.config().quality_threshold;
        if snapshot.quality_score >= threshold {
            self.transition(session_id, SessionState::Active);
        } else {
            let gaps = recovery_gaps(&snapshot.captured_fields);
            warn!(
                "Restored snapshot {} below quality threshold, recovery gaps: {}",
                snapshot.id,
                gaps.join(", ")
            );
        }

        info!("Restored session {} from snapshot {}", session_id, snapshot.id);
        Ok(Some(snapshot))
    }

    /// True when a prior session left state behind but nothing was
    /// snapshotted within the activity window - the signature of a process
    /// restart rather than a cold start or a live handoff.
    pub fn detect_restart(&self) -> Result<bool> {
        if !self.coordinator.any_session_exists()? {
            return Ok(false);
        }
        let window = ChronoDuration::seconds(self.coordinator.config().activity_window_seconds);
        match self.coordinator.latest_snapshot_any()? {
            Some(snapshot) => Ok(Utc::now() - snapshot.captured_at > window),
            None => Ok(true),
        }
    }

    /// Garbage-collect snapshots past the retention window and mark sessions
    /// that lost their last snapshot as expired.
    pub fn expire_stale(&self) -> Result<usize> {
        let deleted = self
            .coordinator
            .cleanup_old_data(self.coordinator.config().retention_days)?;

        let tracked: Vec<(String, SessionState)> = self
            .states
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        for (session_id, state) in tracked {
            if state == SessionState::Snapshotted || state == SessionState::Restored {
                if self.coordinator.latest_snapshot(&session_id)?.is_none() {
                    self.states.insert(session_id.clone(), SessionState::Expired);
                    info!("Session {} expired", session_id);
                }
            }
        }
        Ok(deleted)
    }
}

/// Fraction of the required context segments that are populated.
pub fn compute_quality(fields: &BTreeMap<String, serde_json::Value>) -> f32 {
    let populated = REQUIRED_SNAPSHOT_FIELDS
        .iter()
        .filter(|name| fields.get(**name).map(is_populated).unwrap_or(false))
        .count();
    populated as f32 / REQUIRED_SNAPSHOT_FIELDS.len() as f32
}

/// Required fields missing from a snapshot, in checklist order.
pub fn recovery_gaps(fields: &BTreeMap<String, serde_json::Value>) -> Vec<String> {
    REQUIRED_SNAPSHOT_FIELDS
        .iter()
        .filter(|name| !fields.get(**name).map(is_populated).unwrap_or(false))
        .map(|name| name.to_string())
        .collect()
}

fn is_populated(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
        _ => true,
    }
}

/// User questions with no assistant turn after them.
fn open_threads(turns: &[crate::record_store::ConversationTurn]) -> Vec<String> {
    turns
        .iter()
        .filter(|turn| turn.role == "user" && turn.content.trim().ends_with('?'))
        .filter(|turn| {
            !turns
                .iter()
                .any(|later| later.turn_index > turn.turn_index && later.role == "assistant")
        })
        .map(|turn| turn.content.clone())
        .collect()
}

fn pending_actions(turns: &[crate::record_store::ConversationTurn]) -> Vec<String> {
    turns
        .iter()
        .filter(|turn| {
            let lower = turn.content.to_lowercase();
            ACTION_MARKERS.iter().any(|marker| lower.contains(marker))
        })
        .map(|turn| turn.content.clone())
        .collect()
}

fn extract_keywords(text: &str, limit: usize) -> Vec<String> {
    let mut keywords: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect();
    keywords.sort();
    keywords.dedup();
    keywords.truncate(limit);
    keywords
}
