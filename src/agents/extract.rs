use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use crate::config::ItemSelectors;
use crate::error::{RelayError, Result};
use crate::session::{Item, SessionId};

/// What one results page yields.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedPage {
    pub items: Vec<Item>,
    /// href of the next results page, if the page links one
    pub next_page: Option<String>,
}

/// Pulls product cards out of a results page with CSS selectors.
pub struct HtmlItemExtractor {
    item_selector: Selector,
    title_selector: Selector,
    price_selector: Selector,
    image_selector: Selector,
    next_page_selector: Selector,
    id_attribute: String,
}

fn parse_selector(name: &str, css: &str) -> Result<Selector> {
    Selector::parse(css)
        .map_err(|e| RelayError::Config(format!("Invalid {} selector '{}': {}", name, css, e)).into())
}

impl HtmlItemExtractor {
    pub fn new(selectors: &ItemSelectors) -> Result<Self> {
        Ok(Self {
            item_selector: parse_selector("item", &selectors.item)?,
            title_selector: parse_selector("title", &selectors.title)?,
            price_selector: parse_selector("price", &selectors.price)?,
            image_selector: parse_selector("image", &selectors.image)?,
            next_page_selector: parse_selector("next page", &selectors.next_page)?,
            id_attribute: selectors.id_attribute.clone(),
        })
    }

    pub fn extract(&self, html: &str, session_id: SessionId) -> ExtractedPage {
        let document = Html::parse_document(html);
        let mut items = Vec::new();

        for card in document.select(&self.item_selector) {
            match self.parse_card(&card, session_id) {
                Some(item) => items.push(item),
                None => debug!("Skipping product card without a title"),
            }
        }

        let next_page = document
            .select(&self.next_page_selector)
            .next()
            .and_then(|link| link.value().attr("href"))
            .map(|href| href.trim().to_string())
            .filter(|href| !href.is_empty());

        if items.is_empty() {
            warn!("No product cards found on page");
        }
        debug!("Extracted {} items, next page: {:?}", items.len(), next_page);

        ExtractedPage { items, next_page }
    }

    fn parse_card(&self, card: &ElementRef, session_id: SessionId) -> Option<Item> {
        let title = text_of(card, &self.title_selector)?;
        let price = text_of(card, &self.price_selector);
        let media: Vec<String> = card
            .select(&self.image_selector)
            .filter_map(|img| img.value().attr("src"))
            .map(str::to_string)
            .collect();

        let source_id = card
            .value()
            .attr(&self.id_attribute)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Item::content_id(&title, price.as_deref(), &media));

        Some(Item {
            source_id,
            title,
            price,
            media,
            source_session_id: session_id,
        })
    }
}

fn text_of(element: &ElementRef, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .next()
        .map(|e| e.text().collect::<String>().trim().to_string())
        .filter(|text| !text.is_empty())
}
