use std::fmt;

#[derive(Debug)]
pub enum QueueError {
    Unavailable(String),
    Serialize(serde_json::Error),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Unavailable(e) => write!(f, "coordination store unavailable: {}", e),
            QueueError::Serialize(e) => write!(f, "queue item serialization failed: {}", e),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Serialize(e)
    }
}

#[derive(Debug)]
pub enum LedgerError {
    Unavailable(String),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::Unavailable(e) => write!(f, "ledger unavailable: {}", e),
        }
    }
}

impl std::error::Error for LedgerError {}

#[derive(Debug)]
pub enum ProcessorError {
    InvalidPayment,
    Unavailable,
    Timeout,
}

impl fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessorError::InvalidPayment => write!(f, "invalid payment"),
            ProcessorError::Unavailable => write!(f, "processor is unavailable"),
            ProcessorError::Timeout => write!(f, "processor call timed out"),
        }
    }
}

impl std::error::Error for ProcessorError {}

#[derive(Debug)]
pub enum HealthError {
    Unavailable(String),
}

impl fmt::Display for HealthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthError::Unavailable(e) => write!(f, "health store unavailable: {}", e),
        }
    }
}

impl std::error::Error for HealthError {}

#[derive(Debug)]
pub enum DispatchError {
    InvalidInput(String),
    EnqueueFailed(QueueError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::InvalidInput(e) => write!(f, "invalid input: {}", e),
            DispatchError::EnqueueFailed(e) => write!(f, "enqueue failed: {}", e),
        }
    }
}

impl std::error::Error for DispatchError {}

#[derive(Debug)]
pub enum SummaryError {
    Unavailable(String),
}

impl fmt::Display for SummaryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SummaryError::Unavailable(e) => write!(f, "summary store unavailable: {}", e),
        }
    }
}

impl std::error::Error for SummaryError {}
