//! Deduplicated, cancellable downloads with progressive previews.

mod coordinator;

pub use coordinator::{
    CancelToken, CoalescerStats, CompletionFn, DownloadCoordinator, DownloadProgress, ProgressFn,
};
