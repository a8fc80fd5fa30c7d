//! Record state machines for durable retryable units.
//!
//! Transitions are pure functions of `(state, event)` so the lanes, the
//! broadcast path and the ack watcher all agree on what may move where.
//! The store enforces the same tables through conditional updates.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublishStatus {
    Pending,
    Enqueued,
    Failed,
    Compensating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishEvent {
    Enqueued,
    PublishFailed,
    Claim,
    ReleaseStaleClaim,
}

impl PublishStatus {
    pub const ALL: [PublishStatus; 4] = [
        PublishStatus::Pending,
        PublishStatus::Enqueued,
        PublishStatus::Failed,
        PublishStatus::Compensating,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PublishStatus::Pending => "PENDING",
            PublishStatus::Enqueued => "ENQUEUED",
            PublishStatus::Failed => "FAILED",
            PublishStatus::Compensating => "COMPENSATING",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(PublishStatus::Pending),
            "ENQUEUED" => Some(PublishStatus::Enqueued),
            "FAILED" => Some(PublishStatus::Failed),
            "COMPENSATING" => Some(PublishStatus::Compensating),
            _ => None,
        }
    }

    /// States the producer lane may claim from.
    pub fn claimable() -> &'static [PublishStatus] {
        &[PublishStatus::Pending, PublishStatus::Failed]
    }

    pub fn next(self, event: PublishEvent) -> Option<PublishStatus> {
        use PublishEvent as E;
        use PublishStatus as S;
        match (self, event) {
            (S::Pending | S::Failed | S::Compensating, E::Enqueued) => Some(S::Enqueued),
            (S::Pending | S::Failed | S::Compensating, E::PublishFailed) => Some(S::Failed),
            (S::Pending | S::Failed, E::Claim) => Some(S::Compensating),
            (S::Compensating, E::ReleaseStaleClaim) => Some(S::Pending),
            _ => None,
        }
    }

    /// Whether the record is finished for the producer lane given its
    /// retry accounting.
    pub fn is_terminal(self, retries: u32, max_retries: u32) -> bool {
        match self {
            PublishStatus::Enqueued => true,
            PublishStatus::Failed => retries >= max_retries,
            _ => false,
        }
    }
}

pub fn can_claim_publish(status: PublishStatus, retries: u32, max_retries: u32) -> bool {
    retries < max_retries && status.next(PublishEvent::Claim).is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    Sending,
    Delivered,
    Failed,
    AckReceived,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationEvent {
    Send,
    Delivered,
    SendFailed,
    Ack,
    AckTimeout,
    ReleaseStaleClaim,
}

impl NotificationStatus {
    pub const ALL: [NotificationStatus; 6] = [
        NotificationStatus::Pending,
        NotificationStatus::Sending,
        NotificationStatus::Delivered,
        NotificationStatus::Failed,
        NotificationStatus::AckReceived,
        NotificationStatus::Expired,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationStatus::Pending => "PENDING",
            NotificationStatus::Sending => "SENDING",
            NotificationStatus::Delivered => "DELIVERED",
            NotificationStatus::Failed => "FAILED",
            NotificationStatus::AckReceived => "ACK_RECEIVED",
            NotificationStatus::Expired => "EXPIRED",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(NotificationStatus::Pending),
            "SENDING" => Some(NotificationStatus::Sending),
            "DELIVERED" => Some(NotificationStatus::Delivered),
            "FAILED" => Some(NotificationStatus::Failed),
            "ACK_RECEIVED" => Some(NotificationStatus::AckReceived),
            "EXPIRED" => Some(NotificationStatus::Expired),
            _ => None,
        }
    }

    pub fn resendable() -> &'static [NotificationStatus] {
        &[
            NotificationStatus::Pending,
            NotificationStatus::Failed,
            NotificationStatus::Expired,
        ]
    }

    pub fn awaiting_ack() -> &'static [NotificationStatus] {
        &[NotificationStatus::Sending, NotificationStatus::Delivered]
    }

    pub fn next(self, event: NotificationEvent) -> Option<NotificationStatus> {
        use NotificationEvent as E;
        use NotificationStatus as S;
        match (self, event) {
            (S::Pending | S::Failed | S::Expired, E::Send) => Some(S::Sending),
            (S::Sending, E::Delivered) => Some(S::Delivered),
            (S::Pending | S::Sending, E::SendFailed) => Some(S::Failed),
            (S::Sending | S::Delivered, E::Ack) => Some(S::AckReceived),
            (S::Sending | S::Delivered, E::AckTimeout) => Some(S::Expired),
            (S::Sending, E::ReleaseStaleClaim) => Some(S::Pending),
            _ => None,
        }
    }

    pub fn is_terminal(self, retries: u32, max_retries: u32) -> bool {
        match self {
            NotificationStatus::AckReceived => true,
            NotificationStatus::Failed | NotificationStatus::Expired => retries >= max_retries,
            _ => false,
        }
    }
}

pub fn can_resend_notification(status: NotificationStatus, retries: u32, max_retries: u32) -> bool {
    retries < max_retries && status.next(NotificationEvent::Send).is_some()
}

/// Lanes recorded in the compensation task log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationTaskType {
    Producer,
    Consumer,
    Notification,
    Monitoring,
}

impl CompensationTaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            CompensationTaskType::Producer => "PRODUCER",
            CompensationTaskType::Consumer => "CONSUMER",
            CompensationTaskType::Notification => "NOTIFICATION",
            CompensationTaskType::Monitoring => "MONITORING",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "PRODUCER" => Some(CompensationTaskType::Producer),
            "CONSUMER" => Some(CompensationTaskType::Consumer),
            "NOTIFICATION" => Some(CompensationTaskType::Notification),
            "MONITORING" => Some(CompensationTaskType::Monitoring),
            _ => None,
        }
    }
}
