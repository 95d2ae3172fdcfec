mod janitor;
mod services;

pub use janitor::{MediaJanitor, RetryPolicy};
pub use services::{upload, MediaError, MediaKind, UploadItem};
