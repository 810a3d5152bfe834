//! Local staging directory for slides read from slow storage.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::annotations::shortname;
use crate::source::path_to_name;

/// Default wait between failed copy attempts.
pub const DEFAULT_BUFFER_BACKOFF: Duration = Duration::from_secs(1);

/// Copies slides into a buffer directory ahead of extraction.
#[derive(Debug)]
pub struct SlideBuffer {
    dir: PathBuf,
    backoff: Duration,

    /// Set after the first copy failure so the warning is logged once
    warned: AtomicBool,
}

impl SlideBuffer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            backoff: DEFAULT_BUFFER_BACKOFF,
            warned: AtomicBool::new(false),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy `slide` into the buffer, retrying until it fits.
    ///
    /// Returns `None` if `cancel` fires before the copy succeeds.
    pub async fn stage(&self, slide: &Path, cancel: &watch::Receiver<bool>) -> Option<PathBuf> {
        let file_name = slide.file_name()?;
        let dest = self.dir.join(file_name);
        loop {
            match tokio::fs::copy(slide, &dest).await {
                Ok(bytes) => {
                    debug!("Buffered {} ({} bytes)", dest.display(), bytes);
                    return Some(dest);
                }
                Err(e) => {
                    if !self.warned.swap(true, Ordering::Relaxed) {
                        warn!(
                            "Unable to buffer slide {}: {}; buffer likely full, retrying",
                            shortname(&path_to_name(slide)),
                            e
                        );
                    }
                    let _ = tokio::fs::remove_file(&dest).await;
                }
            }
            if *cancel.borrow() {
                return None;
            }
            tokio::time::sleep(self.backoff).await;
        }
    }

    /// Remove a buffered copy.
    pub async fn release(&self, buffered: &Path) {
        if let Err(e) = tokio::fs::remove_file(buffered).await {
            info!("Unable to remove buffered slide {}: {}", buffered.display(), e);
        }
    }
}
