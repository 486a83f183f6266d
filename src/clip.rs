//! The clip currently being annotated and the metadata the server sends with it.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::ApiError;
use crate::identity::Identity;
use crate::region::SuggestedRegion;
use crate::waveform::AudioSource;

pub const CLIP_ID_HEADER: &str = "x-clip-id";
pub const CLIP_PATH_HEADER: &str = "x-clip-path";
pub const CLIP_ANNOTATED_HEADER: &str = "x-clip-annotated";
pub const AI_CLASSES_HEADER: &str = "x-ai-classes";
pub const AI_INTERFACE_HEADER: &str = "x-ai-interface";
pub const AI_REGIONS_HEADER: &str = "x-ai-regions";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClipId(String);

impl ClipId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClipId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A class proposed by an assistive model, with its confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiClass {
    pub label: String,
    pub prob: f64,
}

/// Model assistance delivered for one specific clip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AiAssistance {
    pub classes: Vec<AiClass>,
    pub regions: Vec<SuggestedRegion>,
    pub interface_version: Option<u32>,
}

/// Everything the server told us about a clip, minus the audio bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipMetadata {
    pub id: ClipId,
    pub file_path: Option<String>,
    pub annotated: bool,
    pub ai: Option<AiAssistance>,
}

impl ClipMetadata {
    /// Read clip metadata from response headers.
    ///
    /// `lookup` returns a header value by lowercase name. A missing clip id makes the response
    /// malformed; unparseable AI headers are logged and ignored so a bad suggestion payload
    /// never blocks the clip itself.
    pub fn from_headers<F>(lookup: F) -> Result<Self, ApiError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let id = lookup(CLIP_ID_HEADER)
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::Malformed(format!("missing {CLIP_ID_HEADER} header")))?;

        let file_path = lookup(CLIP_PATH_HEADER).filter(|v| !v.trim().is_empty());
        let annotated = lookup(CLIP_ANNOTATED_HEADER)
            .map(|v| parse_flag(&v))
            .unwrap_or(false);

        let classes = lookup(AI_CLASSES_HEADER).map(|raw| parse_ai_classes(&raw));
        let regions = lookup(AI_REGIONS_HEADER).map(|raw| parse_ai_regions(&raw));
        let interface_version = lookup(AI_INTERFACE_HEADER).and_then(|raw| {
            match raw.trim().parse::<u32>() {
                Ok(v) => Some(v),
                Err(err) => {
                    warn!(header = AI_INTERFACE_HEADER, %raw, error = %err, "ignoring malformed header");
                    None
                }
            }
        });

        let ai = if classes.is_none() && regions.is_none() && interface_version.is_none() {
            None
        } else {
            Some(AiAssistance {
                classes: classes.unwrap_or_default(),
                regions: regions.unwrap_or_default(),
                interface_version,
            })
        };

        Ok(Self {
            id: ClipId::new(id),
            file_path,
            annotated,
            ai,
        })
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

fn parse_ai_classes(raw: &str) -> Vec<AiClass> {
    match serde_json::from_str::<Vec<AiClass>>(raw) {
        Ok(classes) => classes,
        Err(err) => {
            warn!(header = AI_CLASSES_HEADER, error = %err, "ignoring malformed header");
            Vec::new()
        }
    }
}

// Parsed element by element so one bad entry doesn't discard its siblings.
fn parse_ai_regions(raw: &str) -> Vec<SuggestedRegion> {
    let values = match serde_json::from_str::<Vec<serde_json::Value>>(raw) {
        Ok(values) => values,
        Err(err) => {
            warn!(header = AI_REGIONS_HEADER, error = %err, "ignoring malformed header");
            return Vec::new();
        }
    };

    values
        .into_iter()
        .enumerate()
        .filter_map(|(idx, value)| match serde_json::from_value(value) {
            Ok(region) => Some(region),
            Err(err) => {
                warn!(index = idx, error = %err, "skipping malformed suggested region");
                None
            }
        })
        .collect()
}

/// The clip currently loaded into a session. Replaced wholesale on every advance.
#[derive(Debug, Clone)]
pub struct ClipContext {
    pub id: ClipId,
    pub file_path: Option<String>,
    pub audio: AudioSource,
    /// Known once the waveform surface reports ready.
    pub duration: Option<f64>,
    pub annotated: bool,
    pub ai: Option<AiAssistance>,
}

impl ClipContext {
    pub fn new(metadata: ClipMetadata, audio: AudioSource) -> Self {
        Self {
            id: metadata.id,
            file_path: metadata.file_path,
            audio,
            duration: None,
            annotated: metadata.annotated,
            ai: metadata.ai,
        }
    }
}

/// Which pool the next clip is drawn from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipSelection {
    /// `GET /clip/random/file[?annotated=bool]`.
    Random { annotated: Option<bool> },

    /// `GET /clip/random/file?userId=..[&username=..]`: clips this user hasn't annotated,
    /// optionally narrowed to the user's own selection pool.
    ForUser { scope_by_username: bool },

    /// `GET /clip/{pool}?userId=..`: a named, specialized pool.
    Pool(String),
}

impl Default for ClipSelection {
    fn default() -> Self {
        ClipSelection::ForUser {
            scope_by_username: false,
        }
    }
}

/// A clip request, independent of any HTTP library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipRequest {
    pub path: String,
    pub query: Vec<(&'static str, String)>,
}

impl ClipSelection {
    /// Build the request for this selection.
    ///
    /// Per-user selections need an identity; `None` is returned without one.
    pub fn request(&self, identity: Option<&Identity>) -> Option<ClipRequest> {
        match self {
            ClipSelection::Random { annotated } => Some(ClipRequest {
                path: "/clip/random/file".to_owned(),
                query: annotated
                    .map(|flag| vec![("annotated", flag.to_string())])
                    .unwrap_or_default(),
            }),
            ClipSelection::ForUser { scope_by_username } => {
                let identity = identity?;
                let mut query = vec![("userId", identity.user_id.clone())];
                if *scope_by_username {
                    query.push(("username", identity.username.clone()));
                }
                Some(ClipRequest {
                    path: "/clip/random/file".to_owned(),
                    query,
                })
            }
            ClipSelection::Pool(pool) => {
                let identity = identity?;
                Some(ClipRequest {
                    path: format!("/clip/{pool}"),
                    query: vec![("userId", identity.user_id.clone())],
                })
            }
        }
    }
}

impl std::str::FromStr for ClipSelection {
    type Err = String;

    /// `random`, `random:annotated`, `random:unannotated`, `user`, `user:scoped`, `pool:<name>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (kind, arg) = match s.split_once(':') {
            Some((kind, arg)) => (kind, Some(arg)),
            None => (s, None),
        };
        match (kind, arg) {
            ("random", None) => Ok(ClipSelection::Random { annotated: None }),
            ("random", Some("annotated")) => Ok(ClipSelection::Random {
                annotated: Some(true),
            }),
            ("random", Some("unannotated")) => Ok(ClipSelection::Random {
                annotated: Some(false),
            }),
            ("user", None) => Ok(ClipSelection::ForUser {
                scope_by_username: false,
            }),
            ("user", Some("scoped")) => Ok(ClipSelection::ForUser {
                scope_by_username: true,
            }),
            ("pool", Some(name)) if !name.is_empty() && !name.contains('/') => {
                Ok(ClipSelection::Pool(name.to_owned()))
            }
            _ => Err(format!("unknown clip selection '{s}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn parse(pairs: &[(&str, &str)]) -> Result<ClipMetadata, ApiError> {
        let map = headers(pairs);
        ClipMetadata::from_headers(|name| map.get(name).cloned())
    }

    fn identity() -> Identity {
        Identity {
            user_id: "42".into(),
            username: "ana".into(),
            token: "tok".into(),
        }
    }

    #[test]
    fn plain_clip_has_no_assistance() -> anyhow::Result<()> {
        let meta = parse(&[
            (CLIP_ID_HEADER, "clip-7"),
            (CLIP_PATH_HEADER, "clips/clip-7.wav"),
            (CLIP_ANNOTATED_HEADER, "false"),
        ])?;
        assert_eq!(meta.id.as_str(), "clip-7");
        assert_eq!(meta.file_path.as_deref(), Some("clips/clip-7.wav"));
        assert!(!meta.annotated);
        assert!(meta.ai.is_none());
        Ok(())
    }

    #[test]
    fn missing_clip_id_is_malformed() {
        let err = parse(&[(CLIP_PATH_HEADER, "a.wav")]).unwrap_err();
        assert!(matches!(err, ApiError::Malformed(_)));
    }

    #[test]
    fn ai_headers_are_parsed() -> anyhow::Result<()> {
        let meta = parse(&[
            (CLIP_ID_HEADER, "c1"),
            (CLIP_ANNOTATED_HEADER, "TRUE"),
            (AI_CLASSES_HEADER, r#"[{"label":"dog","prob":0.91}]"#),
            (AI_INTERFACE_HEADER, "2"),
            (
                AI_REGIONS_HEADER,
                r#"[{"start":0.5,"end":1.5,"annotation":"dog"},{"start":"x"},{"start":2,"end":3}]"#,
            ),
        ])?;

        assert!(meta.annotated);
        let ai = meta.ai.expect("assistance");
        assert_eq!(ai.interface_version, Some(2));
        assert_eq!(ai.classes.len(), 1);
        assert_eq!(ai.classes[0].label, "dog");
        assert_eq!(ai.regions.len(), 2);
        assert_eq!(ai.regions[1].annotation, "");
        Ok(())
    }

    #[test]
    fn malformed_ai_headers_do_not_reject_the_clip() -> anyhow::Result<()> {
        let meta = parse(&[
            (CLIP_ID_HEADER, "c1"),
            (AI_CLASSES_HEADER, "not json"),
            (AI_INTERFACE_HEADER, "v2"),
        ])?;
        let ai = meta.ai.expect("headers were present");
        assert!(ai.classes.is_empty());
        assert_eq!(ai.interface_version, None);
        Ok(())
    }

    #[test]
    fn selection_maps_to_requests() {
        let who = identity();

        let random = ClipSelection::Random {
            annotated: Some(false),
        }
        .request(None)
        .expect("random needs no identity");
        assert_eq!(random.path, "/clip/random/file");
        assert_eq!(random.query, vec![("annotated", "false".to_string())]);

        let scoped = ClipSelection::ForUser {
            scope_by_username: true,
        }
        .request(Some(&who))
        .expect("request");
        assert_eq!(
            scoped.query,
            vec![("userId", "42".to_string()), ("username", "ana".to_string())]
        );

        let pool = ClipSelection::Pool("marko".into())
            .request(Some(&who))
            .expect("request");
        assert_eq!(pool.path, "/clip/marko");

        assert!(ClipSelection::default().request(None).is_none());
    }

    #[test]
    fn selection_parses_from_flags() {
        assert_eq!(
            "pool:marko".parse::<ClipSelection>(),
            Ok(ClipSelection::Pool("marko".into()))
        );
        assert_eq!(
            "random:annotated".parse::<ClipSelection>(),
            Ok(ClipSelection::Random {
                annotated: Some(true)
            })
        );
        assert!("pool:".parse::<ClipSelection>().is_err());
        assert!("everything".parse::<ClipSelection>().is_err());
    }
}
