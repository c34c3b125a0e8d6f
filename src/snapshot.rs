//! Wire model of flag snapshots and the immutable [`ToggleSet`] built from them.
//!
//! Two document shapes are accepted:
//! - a full snapshot `{"version": 1, "features": [...], "segments": [...]}` as served by the
//!   polling endpoint and stored in backup files;
//! - an event envelope `{"events": [...]}` as pushed by the streaming endpoint, where a
//!   `hydration` event replaces the whole state and the other events patch it.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ParseError;

/// A flag definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub strategies: Vec<serde_json::Value>,
    #[serde(default)]
    pub variants: Vec<VariantDefinition>,
}

/// A variant as defined on a flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantDefinition {
    pub name: String,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub payload: Option<Payload>,
}

/// Opaque variant payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "type")]
    pub payload_type: String,
    pub value: String,
}

/// A reusable constraint group. Kept as-is, segment evaluation is the engine's business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub constraints: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SnapshotDocument {
    Events(EventEnvelope),
    Full(FullSnapshot),
}

#[derive(Debug, Deserialize)]
struct FullSnapshot {
    #[serde(default)]
    version: u64,
    features: Vec<Feature>,
    #[serde(default)]
    segments: Vec<Segment>,
}

#[derive(Serialize)]
struct FullSnapshotRef<'a> {
    version: u64,
    features: Vec<&'a Feature>,
    segments: Vec<&'a Segment>,
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    events: Vec<DeltaEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
enum DeltaEvent {
    Hydration {
        features: Vec<Feature>,
        #[serde(default)]
        segments: Vec<Segment>,
    },
    FeatureUpdated {
        feature: Feature,
    },
    FeatureRemoved {
        feature_name: String,
    },
    SegmentUpdated {
        segment: Segment,
    },
    SegmentRemoved {
        segment_id: i64,
    },
    #[serde(other)]
    Unknown,
}

/// Immutable set of flag definitions at a point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToggleSet {
    /// Version ordinal of the document this set was built from. Event envelopes bump it by one.
    pub version: u64,
    pub features: HashMap<String, Feature>,
    pub segments: HashMap<i64, Segment>,
}

impl ToggleSet {
    /// Parse `raw` and return the state it produces on top of `self`.
    ///
    /// `self` is never modified, so a payload that fails to parse leaves the current state intact.
    pub fn apply(&self, raw: &str) -> Result<ToggleSet, ParseError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        if !value.is_object()
            || (value.get("features").is_none() && value.get("events").is_none())
        {
            return Err(ParseError::UnrecognizedDocument);
        }

        match serde_json::from_value(value)? {
            SnapshotDocument::Full(snapshot) => Ok(ToggleSet::from_full(snapshot)),
            SnapshotDocument::Events(envelope) => Ok(self.patched(envelope.events)),
        }
    }

    /// Serialize the whole set as a full snapshot document, the shape backup files hold.
    ///
    /// Features are ordered by name and segments by id so equal sets serialize identically.
    pub fn to_snapshot(&self) -> Result<String, ParseError> {
        let mut features: Vec<&Feature> = self.features.values().collect();
        features.sort_by(|a, b| a.name.cmp(&b.name));
        let mut segments: Vec<&Segment> = self.segments.values().collect();
        segments.sort_by_key(|segment| segment.id);

        Ok(serde_json::to_string(&FullSnapshotRef {
            version: self.version,
            features,
            segments,
        })?)
    }

    fn from_full(snapshot: FullSnapshot) -> ToggleSet {
        ToggleSet {
            version: snapshot.version,
            features: by_name(snapshot.features),
            segments: by_id(snapshot.segments),
        }
    }

    fn patched(&self, events: Vec<DeltaEvent>) -> ToggleSet {
        let mut next = self.clone();
        next.version += 1;

        for event in events {
            match event {
                DeltaEvent::Hydration { features, segments } => {
                    next.features = by_name(features);
                    next.segments = by_id(segments);
                }
                DeltaEvent::FeatureUpdated { feature } => {
                    next.features.insert(feature.name.clone(), feature);
                }
                DeltaEvent::FeatureRemoved { feature_name } => {
                    next.features.remove(&feature_name);
                }
                DeltaEvent::SegmentUpdated { segment } => {
                    next.segments.insert(segment.id, segment);
                }
                DeltaEvent::SegmentRemoved { segment_id } => {
                    next.segments.remove(&segment_id);
                }
                DeltaEvent::Unknown => {
                    log::debug!(target: "flagsync", "skipping unknown delta event");
                }
            }
        }

        next
    }
}

fn by_name(features: Vec<Feature>) -> HashMap<String, Feature> {
    features
        .into_iter()
        .map(|feature| (feature.name.clone(), feature))
        .collect()
}

fn by_id(segments: Vec<Segment>) -> HashMap<i64, Segment> {
    segments
        .into_iter()
        .map(|segment| (segment.id, segment))
        .collect()
}
