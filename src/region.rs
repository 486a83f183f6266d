//! The authoritative set of annotation regions for the clip being edited.
//!
//! `RegionSet` is plain data: it knows nothing about how regions are drawn. Rendering goes
//! through the [`RegionSurface`] capability, and changes the user makes directly on the
//! rendered waveform come back as [`RegionEvent`]s.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Span of a region created from the playback position.
pub const DEFAULT_REGION_SECONDS: f64 = 2.0;

/// Opaque region handle, unique within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionId(String);

impl RegionId {
    pub fn generate() -> Self {
        Self(format!("region-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RegionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A labeled time span on the current clip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Region {
    pub id: RegionId,
    pub start: f64,
    pub end: f64,
    /// Presentation only.
    pub color: String,
    pub annotation: String,
    pub comment: String,
}

impl Region {
    pub fn has_label(&self) -> bool {
        !self.annotation.trim().is_empty()
    }

    pub fn has_comment(&self) -> bool {
        !self.comment.trim().is_empty()
    }
}

/// A region proposed by an assistive model, delivered alongside a clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedRegion {
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub annotation: String,
}

/// Which regions count as complete when submitting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum ValidityPolicy {
    /// Every region needs a class label.
    LabelRequired,

    /// Every region needs a class label or a comment (or both).
    #[default]
    LabelOrComment,
}

impl ValidityPolicy {
    pub fn accepts(self, region: &Region) -> bool {
        match self {
            ValidityPolicy::LabelRequired => region.has_label(),
            ValidityPolicy::LabelOrComment => region.has_label() || region.has_comment(),
        }
    }
}

/// Result of checking a region set against a [`ValidityPolicy`].
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub accepted: Vec<Region>,
    pub all_valid: bool,
}

impl Validation {
    pub fn rejected(&self, total: usize) -> usize {
        total - self.accepted.len()
    }
}

/// Rendering capability for regions (the waveform's regions layer).
pub trait RegionSurface {
    /// Draw a region. Returning an error means the region could not be rendered.
    fn add(&mut self, region: &Region) -> anyhow::Result<()>;

    /// Stop drawing a region. Unknown ids are ignored.
    fn remove(&mut self, id: &RegionId);
}

/// Changes that originate on the rendered surface.
#[derive(Debug, Clone, PartialEq)]
pub enum RegionEvent {
    /// The user deleted the region on the surface itself.
    Removed(RegionId),

    /// The user finished dragging or resizing a region.
    UpdateEnd { id: RegionId, start: f64, end: f64 },
}

#[derive(Debug, Clone)]
pub struct RegionSet {
    regions: Vec<Region>,
    clip_duration: Option<f64>,
    default_span: f64,
}

impl Default for RegionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionSet {
    pub fn new() -> Self {
        Self::with_default_span(DEFAULT_REGION_SECONDS)
    }

    pub fn with_default_span(default_span: f64) -> Self {
        Self {
            regions: Vec::new(),
            clip_duration: None,
            default_span,
        }
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn get(&self, id: &RegionId) -> Option<&Region> {
        self.regions.iter().find(|r| &r.id == id)
    }

    pub fn clip_duration(&self) -> Option<f64> {
        self.clip_duration
    }

    /// Create a region anchored at the playback position and return the updated set.
    ///
    /// The new region is always the last element.
    pub fn create_region(&mut self, current_playback_time: f64) -> Result<&[Region]> {
        if !current_playback_time.is_finite() || current_playback_time < 0.0 {
            return Err(Error::msg(format!(
                "invalid playback time for a new region: {current_playback_time}"
            )));
        }

        let mut start = current_playback_time;
        let mut end = start + self.default_span;
        if let Some(duration) = self.clip_duration {
            end = end.min(duration);
            if end <= start {
                // Anchored at (or past) the end of the clip: keep the span, end at the clip end.
                end = duration;
                start = (duration - self.default_span).max(0.0);
            }
        }
        if end <= start {
            return Err(Error::msg("clip is too short to hold a region"));
        }

        let region = Region {
            id: RegionId::generate(),
            start,
            end,
            color: random_color(),
            annotation: String::new(),
            comment: String::new(),
        };
        debug!(id = %region.id, start, end, "region created");
        self.regions.push(region);
        Ok(&self.regions)
    }

    /// Materialize model-suggested regions, skipping (and logging) malformed ones.
    ///
    /// Returns how many regions were created.
    pub fn create_regions_from_suggestions(&mut self, suggested: &[SuggestedRegion]) -> usize {
        let mut created = 0;
        for (idx, suggestion) in suggested.iter().enumerate() {
            if let Err(reason) = self.check_bounds(suggestion.start, suggestion.end) {
                warn!(
                    index = idx,
                    start = suggestion.start,
                    end = suggestion.end,
                    %reason,
                    "skipping malformed suggested region"
                );
                continue;
            }

            self.regions.push(Region {
                id: RegionId::generate(),
                start: suggestion.start,
                end: suggestion.end,
                color: random_color(),
                annotation: suggestion.annotation.clone(),
                comment: String::new(),
            });
            created += 1;
        }
        debug!(created, offered = suggested.len(), "suggested regions materialized");
        created
    }

    /// Replace a region's class label. Unknown ids are a no-op.
    pub fn update_annotation(&mut self, id: &RegionId, label: impl Into<String>) -> bool {
        match self.get_mut(id) {
            Some(region) => {
                region.annotation = label.into();
                true
            }
            None => false,
        }
    }

    /// Replace a region's comment. Unknown ids are a no-op.
    pub fn update_comment(&mut self, id: &RegionId, text: impl Into<String>) -> bool {
        match self.get_mut(id) {
            Some(region) => {
                region.comment = text.into();
                true
            }
            None => false,
        }
    }

    /// Remove a region. Unknown ids are a no-op.
    pub fn remove_region(&mut self, id: &RegionId) -> Option<Region> {
        let idx = self.regions.iter().position(|r| &r.id == id)?;
        Some(self.regions.remove(idx))
    }

    /// Apply a change the user made on the rendered surface.
    pub fn apply_event(&mut self, event: &RegionEvent) {
        match event {
            RegionEvent::Removed(id) => {
                self.remove_region(id);
            }
            RegionEvent::UpdateEnd { id, start, end } => {
                if let Err(reason) = self.check_bounds(*start, *end) {
                    warn!(%id, start, end, %reason, "ignoring region update with invalid bounds");
                    return;
                }
                if let Some(region) = self.get_mut(id) {
                    region.start = *start;
                    region.end = *end;
                }
            }
        }
    }

    /// Record the clip duration once it is known, fitting existing regions into it.
    ///
    /// Returns the ids of regions that were dropped because they start at or past the end.
    pub fn set_clip_duration(&mut self, duration: f64) -> Vec<RegionId> {
        self.clip_duration = Some(duration);

        let mut dropped = Vec::new();
        self.regions.retain_mut(|region| {
            if region.start >= duration {
                warn!(id = %region.id, start = region.start, duration, "dropping region past clip end");
                dropped.push(region.id.clone());
                return false;
            }
            if region.end > duration {
                region.end = duration;
            }
            true
        });
        dropped
    }

    pub fn validate_for_submission(&self, policy: ValidityPolicy) -> Validation {
        let accepted: Vec<Region> = self
            .regions
            .iter()
            .filter(|r| policy.accepts(r))
            .cloned()
            .collect();
        let all_valid = accepted.len() == self.regions.len();
        Validation {
            accepted,
            all_valid,
        }
    }

    pub fn clear(&mut self) {
        self.regions.clear();
        self.clip_duration = None;
    }

    fn get_mut(&mut self, id: &RegionId) -> Option<&mut Region> {
        self.regions.iter_mut().find(|r| &r.id == id)
    }

    fn check_bounds(&self, start: f64, end: f64) -> std::result::Result<(), &'static str> {
        if !start.is_finite() || !end.is_finite() {
            return Err("bounds are not finite");
        }
        if start < 0.0 {
            return Err("start is negative");
        }
        if start >= end {
            return Err("start is not before end");
        }
        if let Some(duration) = self.clip_duration {
            if end > duration {
                return Err("end is past the clip duration");
            }
        }
        Ok(())
    }
}

/// Semi-transparent random display color.
pub fn random_color() -> String {
    let mut rng = rand::thread_rng();
    let r: u8 = rng.gen_range(0..=255);
    let g: u8 = rng.gen_range(0..=255);
    let b: u8 = rng.gen_range(0..=255);
    format!("rgba({r}, {g}, {b}, 0.5)")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labeled(set: &mut RegionSet, at: f64, label: &str) -> RegionId {
        let id = set.create_region(at).unwrap().last().unwrap().id.clone();
        set.update_annotation(&id, label);
        id
    }

    #[test]
    fn create_region_uses_default_span_and_fresh_ids() -> anyhow::Result<()> {
        let mut set = RegionSet::new();
        let first = set.create_region(1.5)?.last().cloned().expect("region");
        let second = set.create_region(1.5)?.last().cloned().expect("region");

        assert_eq!(first.start, 1.5);
        assert_eq!(first.end, 3.5);
        assert!(first.annotation.is_empty());
        assert!(first.color.starts_with("rgba("));
        assert_ne!(first.id, second.id);
        assert_eq!(set.len(), 2);
        Ok(())
    }

    #[test]
    fn create_region_fits_inside_known_duration() -> anyhow::Result<()> {
        let mut set = RegionSet::new();
        set.set_clip_duration(5.0);

        let near_end = set.create_region(4.0)?.last().cloned().expect("region");
        assert_eq!((near_end.start, near_end.end), (4.0, 5.0));

        let at_end = set.create_region(5.0)?.last().cloned().expect("region");
        assert_eq!((at_end.start, at_end.end), (3.0, 5.0));
        Ok(())
    }

    #[test]
    fn create_region_rejects_bad_playback_time() {
        let mut set = RegionSet::new();
        assert!(set.create_region(f64::NAN).is_err());
        assert!(set.create_region(-0.1).is_err());
        assert!(set.is_empty());
    }

    #[test]
    fn suggestions_skip_malformed_entries() {
        let mut set = RegionSet::new();
        let created = set.create_regions_from_suggestions(&[
            SuggestedRegion {
                start: 0.0,
                end: 1.0,
                annotation: "dog".into(),
            },
            SuggestedRegion {
                start: 3.0,
                end: 2.0,
                annotation: "backwards".into(),
            },
            SuggestedRegion {
                start: f64::INFINITY,
                end: f64::INFINITY,
                annotation: "inf".into(),
            },
            SuggestedRegion {
                start: 2.0,
                end: 4.5,
                annotation: "cat".into(),
            },
        ]);

        assert_eq!(created, 2);
        let labels: Vec<&str> = set.regions().iter().map(|r| r.annotation.as_str()).collect();
        assert_eq!(labels, ["dog", "cat"]);
        assert_ne!(set.regions()[0].id, set.regions()[1].id);
    }

    #[test]
    fn updates_and_removal_ignore_unknown_ids() {
        let mut set = RegionSet::new();
        let id = labeled(&mut set, 0.0, "dog");
        let ghost = RegionId::from("region-ghost");

        assert!(!set.update_annotation(&ghost, "cat"));
        assert!(!set.update_comment(&ghost, "hm"));
        assert!(set.remove_region(&ghost).is_none());
        assert_eq!(set.len(), 1);

        assert!(set.update_comment(&id, "barking twice"));
        let region = set.get(&id).expect("region");
        assert_eq!(region.annotation, "dog");
        assert_eq!(region.comment, "barking twice");

        assert!(set.remove_region(&id).is_some());
        assert!(set.is_empty());
    }

    #[test]
    fn label_or_comment_policy_accepts_comment_only_regions() -> anyhow::Result<()> {
        let mut set = RegionSet::new();
        labeled(&mut set, 0.0, "dog");
        let commented = set.create_region(2.0)?.last().unwrap().id.clone();
        set.update_comment(&commented, "unclear sound");
        let blank = set.create_region(4.0)?.last().unwrap().id.clone();
        set.update_annotation(&blank, "   ");

        let v = set.validate_for_submission(ValidityPolicy::LabelOrComment);
        assert!(!v.all_valid);
        assert_eq!(v.accepted.len(), 2);
        assert!(v.accepted.iter().all(|r| r.id != blank));
        assert_eq!(v.rejected(set.len()), 1);

        set.remove_region(&blank);
        let v = set.validate_for_submission(ValidityPolicy::LabelOrComment);
        assert!(v.all_valid);

        let strict = set.validate_for_submission(ValidityPolicy::LabelRequired);
        assert!(!strict.all_valid);
        assert_eq!(strict.accepted.len(), 1);
        Ok(())
    }

    #[test]
    fn empty_set_is_vacuously_valid() {
        let v = RegionSet::new().validate_for_submission(ValidityPolicy::LabelRequired);
        assert!(v.all_valid);
        assert!(v.accepted.is_empty());
    }

    #[test]
    fn surface_events_remove_and_resize() {
        let mut set = RegionSet::new();
        let id = labeled(&mut set, 1.0, "dog");

        set.apply_event(&RegionEvent::UpdateEnd {
            id: id.clone(),
            start: 0.5,
            end: 0.25,
        });
        assert_eq!(set.get(&id).map(|r| (r.start, r.end)), Some((1.0, 3.0)));

        set.apply_event(&RegionEvent::UpdateEnd {
            id: id.clone(),
            start: 0.5,
            end: 1.25,
        });
        assert_eq!(set.get(&id).map(|r| (r.start, r.end)), Some((0.5, 1.25)));

        set.apply_event(&RegionEvent::Removed(id));
        assert!(set.is_empty());
    }

    #[test]
    fn clip_duration_clamps_and_drops() {
        let mut set = RegionSet::new();
        let inside = labeled(&mut set, 0.0, "a");
        let straddling = labeled(&mut set, 2.5, "b");
        let outside = labeled(&mut set, 4.0, "c");

        let dropped = set.set_clip_duration(3.0);
        assert_eq!(dropped, vec![outside]);
        assert_eq!(set.get(&inside).map(|r| r.end), Some(2.0));
        assert_eq!(set.get(&straddling).map(|r| r.end), Some(3.0));
    }

    #[test]
    fn clear_empties_the_set() {
        let mut set = RegionSet::new();
        labeled(&mut set, 0.0, "a");
        set.set_clip_duration(10.0);
        set.clear();
        assert!(set.is_empty());
        assert_eq!(set.clip_duration(), None);
    }
}
