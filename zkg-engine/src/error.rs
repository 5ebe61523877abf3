// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Domain error kinds for the package lifecycle engine.
//!
//! Every fallible public operation returns `anyhow::Result`, matching the
//! convention used throughout this crate's teacher; callers that need to
//! distinguish a specific failure kind can `downcast_ref::<EngineError>()`
//! on the returned `anyhow::Error`.

use std::fmt;

use thiserror::Error;

/// A named domain error, one variant per kind in the error handling design.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed package metadata; aborts the package's inclusion in the plan.
    #[error("bad metadata for {entity}: {reason}")]
    BadMetadata { entity: String, reason: String },

    /// Unsatisfiable constraint intersection, missing dependency, or circular dependency.
    #[error("dependency error for {entity}: {reason}")]
    Dependency { entity: String, reason: String },

    /// Alias collides with an already-installed package.
    #[error("alias {alias:?} of {entity} conflicts with already-installed package {owner}")]
    AliasConflict {
        entity: String,
        alias: String,
        owner: String,
    },

    /// No version of a candidate satisfies constraints.
    #[error("no version of {entity} satisfies constraints: {reason}")]
    VersionResolution { entity: String, reason: String },

    /// `build_command` returned non-zero.
    #[error("build failed for {entity} (exit {exit_code:?}), see {log_path}")]
    BuildFailed {
        entity: String,
        exit_code: Option<i32>,
        log_path: String,
    },

    /// `test_command` returned non-zero.
    #[error("test failed for {entity} (exit {exit_code:?})")]
    TestFailed {
        entity: String,
        exit_code: Option<i32>,
    },

    /// A filesystem operation in the staging pipeline failed.
    #[error("stage error for {entity}: {reason}")]
    Stage { entity: String, reason: String },

    /// On-disk manifest is corrupt or its schema is unreadable.
    #[error("manifest error: {reason}")]
    Manifest { reason: String },

    /// Another instance holds the state directory lock.
    #[error("state directory is locked by another instance: {reason}")]
    Lock { reason: String },
}

impl EngineError {
    pub fn bad_metadata(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BadMetadata {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    pub fn dependency(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Dependency {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    pub fn version_resolution(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::VersionResolution {
            entity: entity.into(),
            reason: reason.into(),
        }
    }
}

/// A non-fatal problem surfaced alongside a successful result, per §7's
/// "Warnings (non-fatal)" list. Collected in a `Vec<Warning>` rather than
/// logged-and-forgotten so callers (and tests) can assert on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub entity: String,
    pub message: String,
}

impl Warning {
    pub fn new(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.entity, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_offending_entity() {
        let err = EngineError::version_resolution("bar", "no tag satisfies >=2.0.0");
        assert!(err.to_string().contains("bar"));
    }

    #[test]
    fn warning_display_includes_entity_and_message() {
        let w = Warning::new("spicy-plugin", "built-in capability version mismatch");
        assert_eq!(
            w.to_string(),
            "spicy-plugin: built-in capability version mismatch"
        );
    }
}
