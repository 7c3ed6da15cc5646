//! Stream lifecycle: one live agent loop per conversation, a bounded
//! follow-up queue, and reclamation of abandoned sessions.

mod manager;

pub use manager::{StreamManager, SubmitOutcome};
