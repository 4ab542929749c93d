// Cleanup policy: one object decides whether temporaries are removed or
// retained. Debug runs keep everything and log where it went.

use std::path::Path;

use super::planner::Job;
use crate::{log_debug, log_info};

#[derive(Debug, Clone, Copy)]
pub struct CleanupPolicy {
    retain: bool,
}

impl CleanupPolicy {
    pub fn new(retain: bool) -> Self {
        Self { retain }
    }

    pub fn retains(&self) -> bool {
        self.retain
    }

    /// Remove one temporary, or log its location when retaining.
    pub fn dispose(&self, path: &Path) {
        if self.retain {
            if path.exists() {
                log_info!("retaining temporary: {}", path.display());
            }
            return;
        }
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                log_debug!("could not remove {}: {e}", path.display());
            }
        }
    }

    /// Dispose of every temporary a job may have produced. Single-source
    /// groups alias `cat` to the source itself, which is never touched.
    pub fn dispose_job(&self, job: &Job) {
        for group in &job.groups {
            let t = &group.templates;
            if group.needs_concat() {
                self.dispose(&t.cat);
            }
            self.dispose(&t.lst);
            for slot in 0..super::planner::SLOTS {
                self.dispose(&t.tmp[slot]);
                self.dispose(&t.iup[slot]);
                self.dispose(&t.idn[slot]);
                self.dispose(&t.prgu[slot]);
                self.dispose(&t.prgd[slot]);
            }
        }
        self.dispose(&job.assembly_list);
        self.dispose(&job.audio_list);
    }
}
