use crate::{access_unit::AccessUnit, error::PipelineResult, format::MediaFormat};

/// Demuxer over a pre-encoded media file.
///
/// Samples of all selected tracks come out interleaved in file order.
pub trait SampleExtractor: Send {
    fn track_formats(&self) -> Vec<MediaFormat>;

    fn select_track(&mut self, index: usize) -> PipelineResult<()>;

    /// Timestamp of the current sample, None at end of file.
    fn sample_time_us(&self) -> Option<i64>;

    /// Copies the current sample together with the file track it belongs to.
    fn read_sample(&mut self) -> PipelineResult<(usize, AccessUnit)>;

    /// Moves to the next sample; false at end of file.
    fn advance(&mut self) -> bool;
}
