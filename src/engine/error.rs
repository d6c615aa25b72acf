use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    SlotNotFound(Ulid),
    BookingNotFound(Ulid),
    AlreadyExists(Ulid),
    /// Claim rejected: the slot cannot cover the requested units.
    CapacityExceeded { requested: u32, available: u32 },
    /// No identity bound to the request. The ledger is never consulted.
    Unauthenticated,
    /// The actor is neither the owner nor privileged.
    Forbidden,
    Validation(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::SlotNotFound(id) => write!(f, "slot not found: {id}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::CapacityExceeded {
                requested,
                available,
            } => {
                write!(f, "capacity exceeded: requested {requested}, available {available}")
            }
            EngineError::Unauthenticated => write!(f, "not authenticated"),
            EngineError::Forbidden => write!(f, "forbidden"),
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
