use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;
use crate::store::Document;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    Requested,
    Assigned,
    InProgress,
    Done,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 5] = [
        OrderStatus::Requested,
        OrderStatus::Assigned,
        OrderStatus::InProgress,
        OrderStatus::Done,
        OrderStatus::Cancelled,
    ];

    /// Statuses reachable from `self` in one step.
    pub fn allowed_next(self) -> &'static [OrderStatus] {
        match self {
            OrderStatus::Requested => &[OrderStatus::Assigned, OrderStatus::Cancelled],
            OrderStatus::Assigned => &[OrderStatus::InProgress, OrderStatus::Cancelled],
            OrderStatus::InProgress => &[OrderStatus::Done, OrderStatus::Cancelled],
            OrderStatus::Done | OrderStatus::Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Done | OrderStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: String,
    pub customer_id: String,
    pub worker_id: Option<String>,
    pub service_category: String,
    pub description: String,
    pub origin: GeoPoint,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Applies `next` and stamps the matching lifecycle timestamp. Callers
    /// must have checked the transition table first.
    pub fn apply_status(&mut self, next: OrderStatus, now: DateTime<Utc>) {
        match next {
            OrderStatus::Assigned => self.accepted_at = Some(now),
            OrderStatus::InProgress => self.started_at = Some(now),
            OrderStatus::Done => self.completed_at = Some(now),
            OrderStatus::Cancelled => self.cancelled_at = Some(now),
            OrderStatus::Requested => {}
        }
        self.status = next;
        self.updated_at = now;
    }
}

impl Document for Order {
    fn doc_id(&self) -> &str {
        &self.id
    }
}
