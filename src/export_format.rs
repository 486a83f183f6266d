/// The supported formats for exporting a session's accepted submissions.
///
/// Each variant maps to a concrete `SubmissionEncoder` implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum ExportFormat {
    /// Submissions as a single JSON array, exactly as they were sent.
    #[default]
    Json,

    /// Regions as WebVTT cues, one block per clip.
    Vtt,
}
