//! Stakeholder/entity intelligence layer.
//!
//! Deterministic mention detection over raw text, then a merge per candidate
//! against the record store. Exactly one profile exists per normalized name;
//! concurrent merges serialize through compare-and-swap with a bounded
//! optimistic retry.

use crate::coordinator::UnifiedCoordinator;
use crate::error::{Result, StorageError};
use crate::record_store::{EntityProfile, RecordKind};
use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

lazy_static! {
    static ref NAME_PATTERN: Regex =
        Regex::new(r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)\b").unwrap();
    static ref ROLE_PATTERN: Regex = Regex::new(
        r"(?i)\b(ceo|cto|cfo|coo|vp|founder|director|manager|lead|engineer|analyst|consultant|sponsor)\b"
    )
    .unwrap();
    static ref SENIOR_ROLES: Vec<&'static str> =
        vec!["ceo", "cto", "cfo", "coo", "vp", "founder", "director"];
    static ref POSITIVE_WORDS: Vec<&'static str> = vec![
        "great", "good", "excellent", "helpful", "supportive", "positive", "agree",
        "aligned", "trust", "champion", "win", "success",
    ];
    static ref NEGATIVE_WORDS: Vec<&'static str> = vec![
        "bad", "poor", "blocker", "blocked", "difficult", "negative", "disagree",
        "risk", "concern", "hostile", "oppose", "fail",
    ];
    static ref NAME_STOP_WORDS: Vec<&'static str> = vec![
        "the", "this", "that", "next", "last", "monday", "tuesday", "wednesday",
        "thursday", "friday", "saturday", "sunday", "january", "february", "march",
        "april", "may", "june", "july", "august", "september", "october", "november",
        "december", "new", "our", "their",
    ];
}

/// One detected mention, not yet reconciled against stored profiles.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityCandidate {
    pub display_name: String,
    pub normalized: String,
    pub aliases: BTreeSet<String>,
    pub role: Option<String>,
    pub influence: f32,
    pub sentiment: f32,
}

impl EntityCandidate {
    /// A bare candidate from a display name, for callers merging without
    /// running detection.
    pub fn from_name(display_name: &str) -> Self {
        Self {
            display_name: display_name.to_string(),
            normalized: normalize_name(display_name),
            aliases: BTreeSet::new(),
            role: None,
            influence: 0.5,
            sentiment: 0.0,
        }
    }
}

/// Lowercased, whitespace-collapsed dedup key.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic pattern-based mention extraction. No model, no randomness:
/// the same text always yields the same candidate set.
pub struct EntityDetector;

impl EntityDetector {
    pub fn detect(&self, text: &str) -> Vec<EntityCandidate> {
        let sentiment = text_sentiment(text);
        let mut candidates: Vec<EntityCandidate> = Vec::new();

        for captures in NAME_PATTERN.captures_iter(text) {
            let matched = captures.get(1).unwrap();
            let display_name = matched.as_str();
            if is_stop_name(display_name) {
                continue;
            }
            let normalized = normalize_name(display_name);

            let role = role_near(text, matched.start(), matched.end());
            let influence = influence_for(&role);

            match candidates.iter_mut().find(|c| c.normalized == normalized) {
                Some(existing) => {
                    existing.aliases.insert(display_name.to_string());
                    if existing.role.is_none() {
                        existing.role = role;
                        existing.influence = existing.influence.max(influence);
                    }
                }
                None => {
                    candidates.push(EntityCandidate {
                        display_name: display_name.to_string(),
                        normalized,
                        aliases: BTreeSet::new(),
                        role,
                        influence,
                        sentiment,
                    });
                }
            }
        }

        candidates.sort_by(|a, b| a.normalized.cmp(&b.normalized));
        candidates
    }
}

fn is_stop_name(display_name: &str) -> bool {
    display_name
        .split_whitespace()
        .all(|w| NAME_STOP_WORDS.contains(&w.to_lowercase().as_str()))
}

/// Role keyword within a small window around the mention.
fn role_near(text: &str, start: usize, end: usize) -> Option<String> {
    let window_start = text[..start]
        .char_indices()
        .rev()
        .take(60)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(start);
    let window_end = text[end..]
        .char_indices()
        .take(60)
        .last()
        .map(|(i, c)| end + i + c.len_utf8())
        .unwrap_or(end);
    let window = &text[window_start..window_end.min(text.len())];
    ROLE_PATTERN
        .find(window)
        .map(|m| m.as_str().to_lowercase())
}

fn influence_for(role: &Option<String>) -> f32 {
    match role {
        Some(r) if SENIOR_ROLES.contains(&r.as_str()) => 0.7,
        Some(_) => 0.6,
        None => 0.5,
    }
}

fn text_sentiment(text: &str) -> f32 {
    let lower = text.to_lowercase();
    let mut positive = 0i32;
    let mut negative = 0i32;
    for word in lower.split(|c: char| !c.is_alphanumeric()) {
        if POSITIVE_WORDS.contains(&word) {
            positive += 1;
        } else if NEGATIVE_WORDS.contains(&word) {
            negative += 1;
        }
    }
    if positive + negative == 0 {
        0.0
    } else {
        ((positive - negative) as f32 / (positive + negative) as f32).clamp(-1.0, 1.0)
    }
}

pub struct EntityLayer {
    coordinator: Arc<UnifiedCoordinator>,
    detector: EntityDetector,
    retry_limit: u32,
}

impl EntityLayer {
    pub fn new(coordinator: Arc<UnifiedCoordinator>) -> Self {
        let retry_limit = coordinator.config().merge_retry_limit;
        Self {
            coordinator,
            detector: EntityDetector,
            retry_limit,
        }
    }

    /// Run detection over a conversational turn and merge every candidate.
    /// Re-processing the same text increments each profile's mention count
    /// exactly once per call and never duplicates a profile.
    pub async fn detect_and_merge(&self, text: &str) -> Result<Vec<EntityProfile>> {
        let candidates = self.detector.detect(text);
        debug!("Detected {} entity candidate(s)", candidates.len());

        let mut profiles = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            profiles.push(self.merge(candidate).await?);
        }
        Ok(profiles)
    }

    /// Merge one candidate into its profile. A losing writer re-reads the
    /// winner's version and retries up to the configured budget, then
    /// surfaces `Contention` for the caller to re-issue.
    pub async fn merge(&self, candidate: EntityCandidate) -> Result<EntityProfile> {
        let record_id = EntityProfile::record_id(&candidate.normalized);

        for attempt in 1..=self.retry_limit {
            let existing = self
                .coordinator
                .record_read(RecordKind::Entity, &record_id)
                .await?;

            let (profile, expected_version) = match &existing {
                Some(record) => {
                    let current = EntityProfile::from_record(record)?;
                    (merge_profile(current, &candidate), Some(record.version))
                }
                None => (new_profile(&candidate), None),
            };

            let payload = profile.to_payload()?;
            match self
                .coordinator
                .record_cas(RecordKind::Entity, &record_id, payload, expected_version)
            {
                Ok(version) => {
                    debug!(
                        "Merged entity '{}' at version {} ({} mention(s))",
                        profile.name, version, profile.mention_count
                    );
                    return Ok(profile);
                }
                Err(StorageError::Contention { .. }) if attempt < self.retry_limit => {
                    self.coordinator.counters().inc_contention_retries();
                    debug!(
                        "Merge for '{}' lost race on attempt {}, retrying",
                        candidate.normalized, attempt
                    );
                }
                Err(StorageError::Contention { key, .. }) => {
                    info!(
                        "Merge for '{}' exhausted {} attempts",
                        candidate.normalized, self.retry_limit
                    );
                    return Err(StorageError::Contention {
                        key,
                        attempts: self.retry_limit,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("merge loop returns within the retry budget");
    }

    pub async fn get_profile(&self, name: &str) -> Result<Option<EntityProfile>> {
        let record_id = EntityProfile::record_id(&normalize_name(name));
        match self
            .coordinator
            .record_read(RecordKind::Entity, &record_id)
            .await?
        {
            Some(record) => Ok(Some(EntityProfile::from_record(&record)?)),
            None => Ok(None),
        }
    }
}

fn new_profile(candidate: &EntityCandidate) -> EntityProfile {
    let now = Utc::now();
    let mut aliases = candidate.aliases.clone();
    aliases.insert(candidate.display_name.clone());
    EntityProfile {
        name: candidate.normalized.clone(),
        display_name: candidate.display_name.clone(),
        aliases,
        role: candidate.role.clone(),
        influence: candidate.influence.clamp(0.0, 1.0),
        sentiment: candidate.sentiment.clamp(-1.0, 1.0),
        first_seen: now,
        last_seen: now,
        mention_count: 1,
    }
}

/// The single mutation path for profiles: union aliases, bump the mention
/// count once, fold sentiment into a mention-weighted running average.
fn merge_profile(mut profile: EntityProfile, candidate: &EntityCandidate) -> EntityProfile {
    profile.aliases.insert(candidate.display_name.clone());
    profile.aliases.extend(candidate.aliases.iter().cloned());

    if profile.role.is_none() {
        profile.role = candidate.role.clone();
    }
    profile.influence = profile.influence.max(candidate.influence).clamp(0.0, 1.0);

    let prior = profile.mention_count as f32;
    profile.sentiment =
        ((profile.sentiment * prior + candidate.sentiment) / (prior + 1.0)).clamp(-1.0, 1.0);

    profile.mention_count += 1;
    profile.last_seen = Utc::now();
    profile
}
