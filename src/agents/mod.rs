pub mod agent;
pub mod extract;
pub mod lister;
pub mod scraper;


pub use agent::{Agent, AgentContext, AgentId, AgentMessage, AgentRole, AgentStatus, Outbox};
pub use extract::{ExtractedPage, HtmlItemExtractor};
pub use lister::{ListingStatus, ListingTask, ListingWizard, RunSignal, WizardState};
pub use scraper::{ResumeInstruction, ScraperAgent};
