pub mod log_buffer;
pub mod merge;
pub mod progress;
pub mod records;
pub mod wire;

pub use log_buffer::{
    Ingest, LogBuffer, LogDelta, LogSourceState, LogView, DEFAULT_LOG_BUFFER_CHARS,
};
pub use merge::{
    merge_field, reconcile, FilteredCollection, Keyed, Reconcile, Reconciled, RecordCollection,
};
pub use progress::{progress, RUNNING_PROGRESS_CAP};
pub use records::{
    Author, ExternalLink, ParentRef, Run, RunResult, RunUpdate, Status, TestRecord, TestUpdate,
    Timestamp,
};
pub use wire::{
    encode_event, from_payload, DecodeReport, LogChunk, LogSourceRef, ProtocolError, SseFrame,
    SseFrameDecoder, BUILD_LOG_UPDATE, BUILD_UPDATE, DEFAULT_MAX_FRAME_BYTES, JOB_UPDATE,
    TEST_GROUP_UPDATE, TEST_UPDATE,
};
