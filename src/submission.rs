//! The payload persisted for one annotated clip.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clip::{AiClass, ClipContext, ClipId};
use crate::region::{Region, SuggestedRegion};
use crate::telemetry::{MousePosition, TelemetrySnapshot};

/// One accepted region, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationEntry {
    pub start: f64,
    pub end: f64,
    pub annotation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationSubmission {
    pub audio_file_id: ClipId,
    pub annotated_by: String,
    pub annotations: Vec<AnnotationEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_classes: Option<Vec<AiClass>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_regions: Option<Vec<SuggestedRegion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_interface: Option<u32>,

    /// Milliseconds from clip load to submission.
    pub labeling_time: u64,
    #[serde(default)]
    pub mouse_path: Vec<MousePosition>,
    #[serde(default)]
    pub hover_durations: BTreeMap<String, u64>,
    #[serde(default)]
    pub ai_hover_count: u32,
    #[serde(default)]
    pub click_delays: Vec<u64>,
}

/// Round to 6 decimal places, the precision boundaries are persisted with.
pub fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

impl AnnotationEntry {
    pub fn from_region(region: &Region) -> Self {
        let comment = region.comment.trim();
        Self {
            start: round6(region.start),
            end: round6(region.end),
            annotation: region.annotation.clone(),
            comment: (!comment.is_empty()).then(|| comment.to_owned()),
        }
    }
}

/// Build the submission for `clip` from the accepted regions and a telemetry snapshot.
pub fn assemble(
    clip: &ClipContext,
    user_id: &str,
    accepted: &[Region],
    telemetry: &TelemetrySnapshot,
    labeling_time_ms: u64,
) -> AnnotationSubmission {
    let ai = clip.ai.as_ref();
    AnnotationSubmission {
        audio_file_id: clip.id.clone(),
        annotated_by: user_id.to_owned(),
        annotations: accepted.iter().map(AnnotationEntry::from_region).collect(),
        ai_classes: ai.map(|a| a.classes.clone()),
        ai_regions: ai.map(|a| a.regions.clone()),
        ai_interface: ai.and_then(|a| a.interface_version),
        labeling_time: labeling_time_ms,
        mouse_path: telemetry.mouse_path.clone(),
        hover_durations: telemetry.hover_durations.clone(),
        ai_hover_count: telemetry.ai_hover_count,
        click_delays: telemetry.click_delays(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::{AiAssistance, ClipMetadata};
    use crate::region::RegionId;
    use crate::waveform::AudioSource;

    fn clip(ai: Option<AiAssistance>) -> ClipContext {
        ClipContext::new(
            ClipMetadata {
                id: ClipId::new("clip-1"),
                file_path: None,
                annotated: false,
                ai,
            },
            AudioSource::from(Vec::new()),
        )
    }

    fn region(start: f64, end: f64, annotation: &str, comment: &str) -> Region {
        Region {
            id: RegionId::generate(),
            start,
            end,
            color: "rgba(0, 0, 0, 0.5)".into(),
            annotation: annotation.into(),
            comment: comment.into(),
        }
    }

    #[test]
    fn boundaries_are_rounded_to_six_places() {
        assert_eq!(round6(1.23456789), 1.234568);
        assert_eq!(round6(2.0), 2.0);
        assert_eq!(round6(0.0000004), 0.0);
    }

    #[test]
    fn assemble_maps_regions_and_telemetry() -> anyhow::Result<()> {
        let telemetry = TelemetrySnapshot {
            hover_durations: [("class-dog".to_string(), 120)].into_iter().collect(),
            ai_hover_count: 3,
            click_timestamps: vec![1_100, 1_600],
            clip_loaded_at: Some(1_000),
            ..Default::default()
        };
        let regions = [
            region(0.1234567, 1.0, "dog", "  "),
            region(1.0, 2.0, "", "maybe a cat"),
        ];

        let sub = assemble(&clip(None), "42", &regions, &telemetry, 4_200);
        assert_eq!(sub.annotated_by, "42");
        assert_eq!(sub.labeling_time, 4_200);
        assert_eq!(sub.click_delays, vec![100, 600]);
        assert_eq!(sub.annotations[0].start, 0.123457);
        assert_eq!(sub.annotations[0].comment, None);
        assert_eq!(sub.annotations[1].comment.as_deref(), Some("maybe a cat"));

        let json = serde_json::to_value(&sub)?;
        assert_eq!(json["audioFileId"], "clip-1");
        assert_eq!(json["hoverDurations"]["class-dog"], 120);
        assert!(json.get("aiClasses").is_none());
        assert!(json["annotations"][0].get("comment").is_none());
        Ok(())
    }

    #[test]
    fn ai_assistance_is_echoed_back() -> anyhow::Result<()> {
        let ai = AiAssistance {
            classes: vec![AiClass {
                label: "dog".into(),
                prob: 0.8,
            }],
            regions: vec![SuggestedRegion {
                start: 0.0,
                end: 1.0,
                annotation: "dog".into(),
            }],
            interface_version: Some(2),
        };
        let sub = assemble(
            &clip(Some(ai)),
            "7",
            &[region(0.0, 1.0, "dog", "")],
            &TelemetrySnapshot::default(),
            0,
        );

        let json = serde_json::to_value(&sub)?;
        assert_eq!(json["aiInterface"], 2);
        assert_eq!(json["aiClasses"][0]["label"], "dog");
        assert_eq!(json["aiRegions"][0]["end"], 1.0);

        let back: AnnotationSubmission = serde_json::from_value(json)?;
        assert_eq!(back, sub);
        Ok(())
    }
}
