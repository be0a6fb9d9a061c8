// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Strongly-typed identifiers.
//!
//! Runs, pauses, events and queue items are keyed by ULIDs: they sort by creation
//! time and expose that time through `created_at()`, which the cancellation
//! checker uses to decide whether a rule covers a run.
//!
//! Environments and accounts are UUIDs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ulid::Ulid;
use uuid::Uuid;

use crate::error::{Component, CoreError};

/// Environment identifier.
pub type EnvId = Uuid;

/// Account identifier.
pub type AccountId = Uuid;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a new id stamped with the current wall-clock time.
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Generates a new id stamped with `at`.
            #[must_use]
            pub fn generate_at(at: DateTime<Utc>) -> Self {
                Self(Ulid::from_datetime(at.into()))
            }

            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// The creation time encoded in the id.
            #[must_use]
            pub fn created_at(&self) -> DateTime<Utc> {
                let ms = self.0.timestamp_ms();
                DateTime::from_timestamp_millis(ms as i64).unwrap_or(DateTime::UNIX_EPOCH)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(s).map(Self).map_err(|e| CoreError::Validation {
                    component: Component::Api,
                    message: format!("invalid {} id '{s}': {e}", $label),
                })
            }
        }
    };
}

ulid_id!(
    /// One execution of a function.
    RunId,
    "run"
);
ulid_id!(
    /// A suspended run waiting for an event, an invocation or a timeout.
    PauseId,
    "pause"
);
ulid_id!(
    /// An ingested event.
    EventId,
    "event"
);
ulid_id!(QueueItemId, "queue item");
ulid_id!(CancellationId, "cancellation");
ulid_id!(BatchId, "batch");
ulid_id!(
    /// A function, stable across versions of the same `(env, slug)`.
    FunctionId,
    "function"
);

impl FunctionId {
    /// Derive the id for `slug` in `env`. Syncing the same slug again yields the
    /// same id, so queued work survives redeploys and restarts.
    #[must_use]
    pub fn for_slug(env_id: EnvId, slug: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(env_id.as_bytes());
        hasher.update(slug.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(Ulid::from_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ids_sort_by_time() {
        let early = RunId::generate_at(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let late = RunId::generate_at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        assert!(early < late);
        assert_eq!(
            early.created_at(),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_round_trip_string() {
        let id = PauseId::generate();
        let parsed: PauseId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-ulid".parse::<PauseId>().is_err());
    }

    #[test]
    fn test_function_id_is_stable() {
        let env = Uuid::nil();
        assert_eq!(FunctionId::for_slug(env, "a"), FunctionId::for_slug(env, "a"));
        assert_ne!(FunctionId::for_slug(env, "a"), FunctionId::for_slug(env, "b"));
    }

    #[test]
    fn test_serde_transparent() {
        let id = EventId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }
}
