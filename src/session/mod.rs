pub mod model;
pub mod tracker;

pub use model::{Cursor, Item, ScrapeKind, ScrapeProgress, ScrapeTarget, Session, SessionId, SessionStatus};
pub use tracker::{PageOutcome, PageReport, SessionTracker};
