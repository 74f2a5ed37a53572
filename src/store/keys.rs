//! Well-known store keys shared by the dispatcher, agents and UI surfaces.

pub const AUTH_TOKEN: &str = "auth-token";

/// One of `running`, `paused`, `terminated`, `error`.
pub const LISTING_STATUS: &str = "listing-status";
pub const LISTING_TASK: &str = "listing-task";
pub const IS_BULK_LISTING: &str = "is-bulk-listing";
pub const CLOSE_ON_ERROR: &str = "close-on-error";

pub const EOL_RUN_COUNTERS: &str = "eol-run-counters";

pub fn session(kind: &str) -> String {
    format!("session:{}", kind)
}

pub fn scraping_progress(kind: &str) -> String {
    format!("scraping-progress:{}", kind)
}

pub fn scraped_products(user: &str) -> String {
    format!("scraped-products:{}", user)
}

pub fn alarm(name: &str) -> String {
    format!("alarm:{}", name)
}
