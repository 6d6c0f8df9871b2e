//! Alert Port - Outbound Notification Interface
//!
//! The rule engine fans emitted signals out to an alert transport. The
//! transport is an external collaborator: it may drop, dedupe, or dry-run
//! a message, but it must never fail the evaluation cycle.

use async_trait::async_trait;

/// What the transport did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertOutcome {
  /// Delivered to the real transport.
  Sent,
  /// Transport disabled; payload logged instead.
  DryRun,
  /// Suppressed by the transport's own dedupe window.
  Deduped,
  /// Delivery failed; callers count this, never propagate it.
  Failed,
}

impl AlertOutcome {
  /// Tag recorded in the signal payload's `transport` field.
  pub fn transport_tag(self) -> &'static str {
    match self {
      Self::Sent => "telegram",
      Self::DryRun => "dry-run",
      Self::Deduped => "deduped",
      Self::Failed => "failed",
    }
  }
}

/// Trait for alert transports.
#[async_trait]
pub trait AlertTransport: Send + Sync + 'static {
  /// Deliver a text payload (≤ 4 KB). `dedupe_key` suppresses repeats of
  /// the same signal source within `cooldown_secs`.
  async fn send(&self, text: &str, dedupe_key: &str, cooldown_secs: u64) -> AlertOutcome;
}

/// No-op transport used when alerting is disabled outright.
pub struct NullTransport;

#[async_trait]
impl AlertTransport for NullTransport {
  async fn send(&self, _text: &str, _dedupe_key: &str, _cooldown_secs: u64) -> AlertOutcome {
    AlertOutcome::DryRun
  }
}
