// ── Multipart message reassembly ──

use std::collections::{BTreeMap, HashMap};

use gsmfleet_at::DecodedSms;

/// Glues concatenated SMS parts back together.
///
/// One buffer per device: concatenation reference numbers are only unique
/// per sender modem, so buffers must never be shared across devices. A
/// message is released exactly once, when its last outstanding part lands;
/// duplicate parts overwrite in place and never double-release.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    pending: HashMap<u16, BTreeMap<u8, String>>,
}

/// A message ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledText {
    pub text: String,
    pub parts: u8,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one decoded SMS. Plain messages come straight back; parts of a
    /// concatenated message are buffered until the set is complete.
    pub fn push(&mut self, sms: &DecodedSms) -> Option<AssembledText> {
        let Some(concat) = sms.udh else {
            return Some(AssembledText {
                text: sms.text.clone(),
                parts: 1,
            });
        };

        // Degenerate headers (total 0 or 1) are treated as plain messages.
        if concat.total <= 1 {
            return Some(AssembledText {
                text: sms.text.clone(),
                parts: 1,
            });
        }

        let parts = self.pending.entry(concat.reference).or_default();
        parts.insert(concat.index, sms.text.clone());

        if parts.len() < usize::from(concat.total) {
            return None;
        }

        // Complete: flush in index order and forget the reference.
        let parts = self.pending.remove(&concat.reference)?;
        Some(AssembledText {
            text: parts.values().cloned().collect(),
            parts: concat.total,
        })
    }

    /// Number of concatenation sets still waiting for parts.
    pub fn pending_sets(&self) -> usize {
        self.pending.len()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
