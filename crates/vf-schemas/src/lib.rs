//! vf-schemas
//!
//! Shared vocabulary for the vidforge workspace: asset/operation enums,
//! the closed parameter union, queue/bus event shapes and the canonical
//! parameter fingerprint. This crate owns no I/O.

pub mod events;
pub mod fingerprint;
pub mod params;

use serde::{Deserialize, Serialize};

pub use events::{
    EventEnvelope, QueueEvent, QueueNotice, SocketMessage, TraceContext, TraceEnvelope,
};
pub use fingerprint::params_fingerprint;
pub use params::{OperationParameters, ParamError};

// ---------------------------------------------------------------------------
// AssetKind
// ---------------------------------------------------------------------------

/// The two asset families. Operations, storage paths and socket payload
/// field names (`videoId` / `imageId`) all branch on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Video,
    Image,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Video => "video",
            AssetKind::Image => "image",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "video" => Ok(AssetKind::Video),
            "image" => Ok(AssetKind::Image),
            other => Err(format!("invalid asset kind: {other}")),
        }
    }

    /// Socket payload id field for this kind.
    pub fn payload_id_field(&self) -> &'static str {
        match self {
            AssetKind::Video => "videoId",
            AssetKind::Image => "imageId",
        }
    }
}

// ---------------------------------------------------------------------------
// OperationType
// ---------------------------------------------------------------------------

/// Queueable transformation types.
///
/// `extract-audio` is deliberately absent: it runs synchronously in the API
/// process with a synthetic request id and never enters the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    Resize,
    Convert,
    Crop,
    ResizeImage,
    ConvertImage,
}

impl OperationType {
    pub const ALL: [OperationType; 5] = [
        OperationType::Resize,
        OperationType::Convert,
        OperationType::Crop,
        OperationType::ResizeImage,
        OperationType::ConvertImage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Resize => "resize",
            OperationType::Convert => "convert",
            OperationType::Crop => "crop",
            OperationType::ResizeImage => "resize-image",
            OperationType::ConvertImage => "convert-image",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "resize" => Ok(OperationType::Resize),
            "convert" => Ok(OperationType::Convert),
            "crop" => Ok(OperationType::Crop),
            "resize-image" => Ok(OperationType::ResizeImage),
            "convert-image" => Ok(OperationType::ConvertImage),
            other => Err(format!("invalid operation type: {other}")),
        }
    }

    /// Which asset family this operation applies to.
    pub fn asset_kind(&self) -> AssetKind {
        match self {
            OperationType::Resize | OperationType::Convert | OperationType::Crop => {
                AssetKind::Video
            }
            OperationType::ResizeImage | OperationType::ConvertImage => AssetKind::Image,
        }
    }

    /// Image operations finish in seconds; video transcodes can run minutes.
    /// Used to pick the wall-clock timeout class.
    pub fn is_short_running(&self) -> bool {
        matches!(
            self,
            OperationType::ResizeImage | OperationType::ConvertImage
        )
    }
}

// ---------------------------------------------------------------------------
// OperationStatus
// ---------------------------------------------------------------------------

/// Forward-only operation lifecycle: `pending → processing → {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "processing" => Ok(OperationStatus::Processing),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(format!("invalid operation status: {other}")),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }

    /// Legal forward transitions. `failed` is reachable from any non-terminal
    /// state (pre-flight failures terminate a `pending` operation directly).
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Pending, Failed) | (Processing, Completed) | (Processing, Failed)
        )
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Queue priority class. Lower class number wins; FIFO inside a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Integer class, 1 = highest, 10 = lowest.
    pub fn class(&self) -> u8 {
        match self {
            Priority::High => 1,
            Priority::Normal => 5,
            Priority::Low => 10,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

// ---------------------------------------------------------------------------
// Ledger vocabulary
// ---------------------------------------------------------------------------

/// Ledger entry types.
///
/// Amount signs are trigger-enforced: `addition` > 0, `deduction` < 0,
/// `reservation` < 0, `debit_capture` == 0 (marker), `refund` > 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    Addition,
    Deduction,
    Reservation,
    DebitCapture,
    Refund,
}

impl LedgerEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryType::Addition => "addition",
            LedgerEntryType::Deduction => "deduction",
            LedgerEntryType::Reservation => "reservation",
            LedgerEntryType::DebitCapture => "debit_capture",
            LedgerEntryType::Refund => "refund",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "addition" => Ok(LedgerEntryType::Addition),
            "deduction" => Ok(LedgerEntryType::Deduction),
            "reservation" => Ok(LedgerEntryType::Reservation),
            "debit_capture" => Ok(LedgerEntryType::DebitCapture),
            "refund" => Ok(LedgerEntryType::Refund),
            other => Err(format!("invalid ledger entry type: {other}")),
        }
    }
}

/// Ledger-side operation id for an operation row: `op-<uuid>`.
pub fn ledger_op_id(operation_id: uuid::Uuid) -> String {
    format!("op-{operation_id}")
}

// ---------------------------------------------------------------------------
// User tier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserTier {
    Free,
    Pro,
}

impl UserTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserTier::Free => "free",
            UserTier::Pro => "pro",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "free" => Ok(UserTier::Free),
            "pro" => Ok(UserTier::Pro),
            other => Err(format!("invalid user tier: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_machine_is_forward_only() {
        use OperationStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        // No backward or terminal-exit edges.
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Completed), "must pass through processing");
    }

    #[test]
    fn op_type_round_trips_and_maps_kind() {
        for t in OperationType::ALL {
            assert_eq!(OperationType::parse(t.as_str()).unwrap(), t);
        }
        assert_eq!(OperationType::Crop.asset_kind(), AssetKind::Video);
        assert_eq!(OperationType::ResizeImage.asset_kind(), AssetKind::Image);
        assert!(OperationType::ConvertImage.is_short_running());
        assert!(!OperationType::Convert.is_short_running());
    }

    #[test]
    fn priority_classes_are_ordered() {
        assert!(Priority::High.class() < Priority::Normal.class());
        assert!(Priority::Normal.class() < Priority::Low.class());
    }

    #[test]
    fn ledger_op_id_is_prefixed() {
        let id = uuid::Uuid::nil();
        assert_eq!(ledger_op_id(id), format!("op-{id}"));
    }
}
