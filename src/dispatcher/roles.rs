use regex::Regex;

use crate::agents::AgentRole;
use crate::config::MarketplaceConfig;
use crate::error::{RelayError, Result};

/// Decides which agent belongs on a page from its URL alone.
#[derive(Debug, Clone)]
pub struct RoleClassifier {
    scraper: Vec<Regex>,
    lister: Vec<Regex>,
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| RelayError::Config(format!("Invalid role pattern '{}': {}", p, e)).into()))
        .collect()
}

impl RoleClassifier {
    pub fn new(config: &MarketplaceConfig) -> Result<Self> {
        Ok(Self {
            scraper: compile(&config.scraper_patterns)?,
            lister: compile(&config.lister_patterns)?,
        })
    }

    pub fn classify(&self, url: &str) -> AgentRole {
        if self.scraper.iter().any(|re| re.is_match(url)) {
            AgentRole::Scraper
        } else if self.lister.iter().any(|re| re.is_match(url)) {
            AgentRole::Lister
        } else {
            AgentRole::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_default_patterns() {
        let classifier = RoleClassifier::new(&Config::default().marketplace).unwrap();

        assert_eq!(classifier.classify("https://www.amazon.com/s?k=desk+lamp"), AgentRole::Scraper);
        assert_eq!(classifier.classify("https://www.amazon.co.uk/stores/page/ABC"), AgentRole::Scraper);
        assert_eq!(classifier.classify("https://www.ebay.com/sl/prelist/suggest"), AgentRole::Lister);
        assert_eq!(classifier.classify("https://www.ebay.de/lstng?draftId=1"), AgentRole::Lister);
        assert_eq!(classifier.classify("https://www.amazon.com/dp/B000"), AgentRole::None);
        assert_eq!(classifier.classify("about:blank"), AgentRole::None);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let mut market = Config::default().marketplace;
        market.lister_patterns.push("([".to_string());
        assert!(RoleClassifier::new(&market).is_err());
    }
}
