//! Typestate request lifecycle.
//!
//! A request is created `Pending` on submission and moves to `Approved`,
//! `Rejected` or `Cancelled`. A `Rejected` request that holds a queue position
//! sits on the slot's waitlist and may later be promoted to `Approved`.
//! Transitions are only defined on the states that allow them, so invalid
//! moves do not compile; [`AnyRequest`] is the erased form used by storage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FairslotError, Result};
use crate::types::{RequestId, RequesterId, SlotId};

/// Marker trait for valid request states.
pub trait RequestState: Send + Sync {}

/// An allocation request in state `T`.
#[derive(Debug, Clone, PartialEq)]
pub struct Request<T: RequestState> {
    pub state: T,
    pub data: RequestData,
}

/// Fields fixed at submission.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestData {
    pub id: RequestId,
    pub requester_id: RequesterId,
    pub slot_id: SlotId,
    /// Captured from the requester's stats at submission, never recomputed.
    pub priority_weight: f64,
    pub applied_at: DateTime<Utc>,
}

// ============================================================================
// Request States
// ============================================================================

/// Waiting for the next allocation round.
#[derive(Debug, Clone, PartialEq)]
pub struct Pending {}

impl RequestState for Pending {}

/// Won the slot, either in a round or by waitlist promotion.
#[derive(Debug, Clone, PartialEq)]
pub struct Approved {
    pub processed_at: DateTime<Utc>,
}

impl RequestState for Approved {}

/// Lost the slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    pub processed_at: DateTime<Utc>,
    /// Waitlist rank; `None` when the request was invalidated rather than queued.
    pub queue_position: Option<u32>,
}

impl RequestState for Rejected {}

/// Withdrawn by the requester.
#[derive(Debug, Clone, PartialEq)]
pub struct Cancelled {
    pub processed_at: DateTime<Utc>,
}

impl RequestState for Cancelled {}

/// Terminal state with no inbound transition; records in this state are
/// only ever loaded, never produced by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Completed {
    pub processed_at: DateTime<Utc>,
}

impl RequestState for Completed {}

impl Request<Pending> {
    pub fn new(
        requester_id: RequesterId,
        slot_id: SlotId,
        priority_weight: f64,
        applied_at: DateTime<Utc>,
    ) -> Self {
        Request {
            state: Pending {},
            data: RequestData {
                id: RequestId::new(),
                requester_id,
                slot_id,
                priority_weight,
                applied_at,
            },
        }
    }
}

impl Request<Rejected> {
    /// Whether this request is on the waitlist.
    pub fn is_queued(&self) -> bool {
        self.state.queue_position.is_some()
    }
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
    Completed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = FairslotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "approved" => Ok(RequestStatus::Approved),
            "rejected" => Ok(RequestStatus::Rejected),
            "cancelled" => Ok(RequestStatus::Cancelled),
            "completed" => Ok(RequestStatus::Completed),
            other => Err(FairslotError::Other(anyhow::anyhow!(
                "unknown request status '{other}'"
            ))),
        }
    }
}

// ============================================================================
// Unified Request Representation
// ============================================================================

/// A request in any state.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyRequest {
    Pending(Request<Pending>),
    Approved(Request<Approved>),
    Rejected(Request<Rejected>),
    Cancelled(Request<Cancelled>),
    Completed(Request<Completed>),
}

impl AnyRequest {
    /// Rebuilds a request from its stored columns.
    pub fn from_parts(
        data: RequestData,
        status: RequestStatus,
        queue_position: Option<u32>,
        processed_at: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let id = data.id;
        let processed = || {
            processed_at.ok_or_else(|| {
                FairslotError::Other(anyhow::anyhow!(
                    "request {id} is {status} but has no processed_at"
                ))
            })
        };
        Ok(match status {
            RequestStatus::Pending => Request {
                state: Pending {},
                data,
            }
            .into(),
            RequestStatus::Approved => Request {
                state: Approved {
                    processed_at: processed()?,
                },
                data,
            }
            .into(),
            RequestStatus::Rejected => Request {
                state: Rejected {
                    processed_at: processed()?,
                    queue_position,
                },
                data,
            }
            .into(),
            RequestStatus::Cancelled => Request {
                state: Cancelled {
                    processed_at: processed()?,
                },
                data,
            }
            .into(),
            RequestStatus::Completed => Request {
                state: Completed {
                    processed_at: processed()?,
                },
                data,
            }
            .into(),
        })
    }

    pub fn data(&self) -> &RequestData {
        match self {
            AnyRequest::Pending(r) => &r.data,
            AnyRequest::Approved(r) => &r.data,
            AnyRequest::Rejected(r) => &r.data,
            AnyRequest::Cancelled(r) => &r.data,
            AnyRequest::Completed(r) => &r.data,
        }
    }

    pub fn id(&self) -> RequestId {
        self.data().id
    }

    pub fn status(&self) -> RequestStatus {
        match self {
            AnyRequest::Pending(_) => RequestStatus::Pending,
            AnyRequest::Approved(_) => RequestStatus::Approved,
            AnyRequest::Rejected(_) => RequestStatus::Rejected,
            AnyRequest::Cancelled(_) => RequestStatus::Cancelled,
            AnyRequest::Completed(_) => RequestStatus::Completed,
        }
    }

    pub fn queue_position(&self) -> Option<u32> {
        match self {
            AnyRequest::Rejected(r) => r.state.queue_position,
            _ => None,
        }
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            AnyRequest::Pending(_) => None,
            AnyRequest::Approved(r) => Some(r.state.processed_at),
            AnyRequest::Rejected(r) => Some(r.state.processed_at),
            AnyRequest::Cancelled(r) => Some(r.state.processed_at),
            AnyRequest::Completed(r) => Some(r.state.processed_at),
        }
    }

    /// Pending, Approved, or Rejected while still on the waitlist.
    pub fn is_active(&self) -> bool {
        match self {
            AnyRequest::Pending(_) | AnyRequest::Approved(_) => true,
            AnyRequest::Rejected(r) => r.is_queued(),
            AnyRequest::Cancelled(_) | AnyRequest::Completed(_) => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, AnyRequest::Pending(_))
    }

    pub fn into_pending(self) -> Option<Request<Pending>> {
        match self {
            AnyRequest::Pending(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_rejected(self) -> Option<Request<Rejected>> {
        match self {
            AnyRequest::Rejected(r) => Some(r),
            _ => None,
        }
    }
}

// Conversion traits for going from typed Request to AnyRequest

impl From<Request<Pending>> for AnyRequest {
    fn from(r: Request<Pending>) -> Self {
        AnyRequest::Pending(r)
    }
}

impl From<Request<Approved>> for AnyRequest {
    fn from(r: Request<Approved>) -> Self {
        AnyRequest::Approved(r)
    }
}

impl From<Request<Rejected>> for AnyRequest {
    fn from(r: Request<Rejected>) -> Self {
        AnyRequest::Rejected(r)
    }
}

impl From<Request<Cancelled>> for AnyRequest {
    fn from(r: Request<Cancelled>) -> Self {
        AnyRequest::Cancelled(r)
    }
}

impl From<Request<Completed>> for AnyRequest {
    fn from(r: Request<Completed>) -> Self {
        AnyRequest::Completed(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> RequestData {
        RequestData {
            id: RequestId::new(),
            requester_id: RequesterId::new(),
            slot_id: SlotId::new(),
            priority_weight: 0.5,
            applied_at: Utc::now(),
        }
    }

    #[test]
    fn test_from_parts_restores_state() {
        let now = Utc::now();
        let any = AnyRequest::from_parts(data(), RequestStatus::Rejected, Some(2), Some(now))
            .unwrap();
        assert_eq!(any.status(), RequestStatus::Rejected);
        assert_eq!(any.queue_position(), Some(2));
        assert_eq!(any.processed_at(), Some(now));
        assert!(any.is_active());

        let pending = AnyRequest::from_parts(data(), RequestStatus::Pending, None, None).unwrap();
        assert!(pending.is_pending());
        assert_eq!(pending.processed_at(), None);
    }

    #[test]
    fn test_from_parts_requires_processed_at() {
        let err = AnyRequest::from_parts(data(), RequestStatus::Approved, None, None);
        assert!(err.is_err());
    }

    #[test]
    fn test_active_states() {
        let now = Utc::now();
        let invalidated =
            AnyRequest::from_parts(data(), RequestStatus::Rejected, None, Some(now)).unwrap();
        assert!(!invalidated.is_active());

        let cancelled =
            AnyRequest::from_parts(data(), RequestStatus::Cancelled, None, Some(now)).unwrap();
        assert!(!cancelled.is_active());

        let approved =
            AnyRequest::from_parts(data(), RequestStatus::Approved, None, Some(now)).unwrap();
        assert!(approved.is_active());
    }

    #[test]
    fn test_status_strings() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Approved,
            RequestStatus::Rejected,
            RequestStatus::Cancelled,
            RequestStatus::Completed,
        ] {
            assert_eq!(status.as_str().parse::<RequestStatus>().unwrap(), status);
        }
    }
}
