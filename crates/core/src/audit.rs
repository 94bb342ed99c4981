//! Audit logging: tamper-evident append-only event store with cryptographic
//! hash chaining. Every state-changing action in the control plane lands
//! here; entries are never mutated or deleted. This is the only persistence
//! mechanism trusted for compliance evidence.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

/// A single audit entry. `entry_hash` covers the previous entry's hash, so
/// retroactive tampering breaks verification for every subsequent entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Who performed the action: an operator name or `"system"`.
    pub actor: String,
    pub action: String,
    /// Which control-plane component produced the entry.
    pub component: String,
    pub payload: serde_json::Value,
    /// Hash of the previous entry ("genesis" for the first).
    pub previous_hash: String,
    pub entry_hash: String,
}

impl AuditEntry {
    /// Content digest for this entry given a previous-hash value.
    fn compute_hash(&self, previous_hash: &str) -> String {
        let content = format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.sequence,
            self.actor,
            self.action,
            self.component,
            self.payload,
            self.timestamp.to_rfc3339(),
            previous_hash,
        );
        sha256_hex(&content)
    }
}

/// Result of verifying the audit chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainVerification {
    pub total_entries: usize,
    pub valid_entries: usize,
    /// Sequence numbers that fail verification. Once one entry is tampered,
    /// every later sequence appears here as well.
    pub invalid_sequences: Vec<u64>,
    pub chain_intact: bool,
}

/// Append-only hash-chained audit log.
pub struct AuditLog {
    entries: RwLock<Vec<AuditEntry>>,
    sequence: Mutex<u64>,
    last_hash: Mutex<String>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            sequence: Mutex::new(0),
            last_hash: Mutex::new("genesis".to_string()),
        }
    }

    /// Append an entry, chaining it to the previous one.
    pub fn append(
        &self,
        actor: impl Into<String>,
        action: impl Into<String>,
        component: impl Into<String>,
        payload: serde_json::Value,
    ) -> AuditEntry {
        let mut seq = self.sequence.lock();
        *seq += 1;

        let mut entry = AuditEntry {
            id: Uuid::new_v4(),
            sequence: *seq,
            timestamp: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            component: component.into(),
            payload,
            previous_hash: String::new(),
            entry_hash: String::new(),
        };

        let mut prev_hash = self.last_hash.lock();
        entry.previous_hash = prev_hash.clone();
        entry.entry_hash = entry.compute_hash(&prev_hash);
        *prev_hash = entry.entry_hash.clone();

        info!(
            sequence = entry.sequence,
            actor = %entry.actor,
            action = %entry.action,
            component = %entry.component,
            "Audit entry appended"
        );

        self.entries.write().push(entry.clone());
        entry
    }

    /// Verify the whole chain by recomputing it from genesis. A tampered
    /// entry invalidates itself and every entry after it, because the
    /// recomputed chain diverges from the stored hashes from that point on.
    pub fn verify_chain(&self) -> ChainVerification {
        verify_entries(&self.entries.read())
    }

    /// Most recent `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.read();
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Entries filtered by component, newest first.
    pub fn by_component(&self, component: &str, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.read();
        entries
            .iter()
            .rev()
            .filter(|e| e.component == component)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of all entries, in sequence order.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().clone()
    }
}

/// Verify a sequence-ordered slice of entries against a recomputed chain.
pub fn verify_entries(entries: &[AuditEntry]) -> ChainVerification {
    let total = entries.len();
    let mut invalid = Vec::new();
    let mut recomputed_prev = "genesis".to_string();
    let mut broken = false;

    for entry in entries {
        let expected_hash = entry.compute_hash(&recomputed_prev);
        if broken || entry.previous_hash != recomputed_prev || entry.entry_hash != expected_hash {
            invalid.push(entry.sequence);
            broken = true;
        }
        recomputed_prev = expected_hash;
    }

    let valid = total - invalid.len();
    ChainVerification {
        total_entries: total,
        valid_entries: valid,
        invalid_sequences: invalid,
        chain_intact: valid == total,
    }
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
