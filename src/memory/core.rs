//! Core working memory: a single markdown document prepended to every engine
//! call.
//!
//! The document is hard-capped at [`CORE_MEMORY_LIMIT`] characters.  Any
//! write that would exceed the cap is truncated on disk with
//! [`TRUNCATION_MARKER`] appended; `append` additionally reports that the
//! content wants distilling so the caller can enqueue a `distill_memory`
//! heavy task.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

/// Maximum size of the working memory document, in characters.
pub const CORE_MEMORY_LIMIT: usize = 4_000;

/// Appended to the document whenever a write was truncated.
pub const TRUNCATION_MARKER: &str = "\n[TRUNCATED]";

const DEFAULT_TEMPLATE: &str = "\
# Core Memory

## Active Goals

## User Context

## Critical Facts

## Active Tasks
";

/// Outcome of an [`CoreMemory::append`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// The pre-truncation content exceeded the cap; a distillation pass
    /// should be scheduled.
    pub needs_distillation: bool,
}

/// Fixed-size markdown working memory backed by `core-memory.md`.
///
/// Writes are serialised daemon-wide through the internal mutex; reads
/// return the cached in-RAM copy.
pub struct CoreMemory {
    path: PathBuf,
    content: Mutex<String>,
}

impl CoreMemory {
    /// Load the document at `path`, seeding the section template when the
    /// file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, io::Error> {
        let path = path.into();
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::write(&path, DEFAULT_TEMPLATE)?;
                DEFAULT_TEMPLATE.to_owned()
            }
            Err(e) => return Err(e),
        };
        Ok(Self {
            path: path.clone(),
            content: Mutex::new(content),
        })
    }

    /// Current document contents.
    pub fn read(&self) -> String {
        self.content
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Atomically swap the document for `text`, hard-truncating at the cap.
    pub fn replace(&self, text: &str) -> Result<(), io::Error> {
        let stored = truncate_with_marker(text);
        let mut guard = match self.content.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.write_disk(&stored)?;
        *guard = stored;
        Ok(())
    }

    /// Append `fact` on a new line.  Returns whether the content has
    /// outgrown the cap and wants distilling.
    pub fn append(&self, fact: &str) -> Result<AppendOutcome, io::Error> {
        let mut guard = match self.content.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut combined = guard.clone();
        // Strip a previous truncation marker before growing the document.
        if let Some(stripped) = combined.strip_suffix(TRUNCATION_MARKER) {
            combined.truncate(stripped.len());
        }
        if !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(fact);

        let needs_distillation = combined.chars().count() > CORE_MEMORY_LIMIT;
        let stored = truncate_with_marker(&combined);
        self.write_disk(&stored)?;
        *guard = stored;
        Ok(AppendOutcome { needs_distillation })
    }

    fn write_disk(&self, content: &str) -> Result<(), io::Error> {
        let tmp = self.path.with_extension("md.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Truncate `text` to [`CORE_MEMORY_LIMIT`] characters, appending the marker
/// when anything was cut.
fn truncate_with_marker(text: &str) -> String {
    let mut count = 0usize;
    for (byte_idx, _) in text.char_indices() {
        if count == CORE_MEMORY_LIMIT {
            let mut out = text[..byte_idx].to_owned();
            out.push_str(TRUNCATION_MARKER);
            return out;
        }
        count += 1;
    }
    text.to_owned()
}
