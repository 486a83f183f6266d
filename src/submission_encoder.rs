use anyhow::Result;

use crate::submission::AnnotationSubmission;

pub trait SubmissionEncoder {
    fn write_submission(&mut self, submission: &AnnotationSubmission) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}
