use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agents::RunSignal;
use crate::browser::TabId;
use crate::error::{RelayError, Result};
use crate::session::{ScrapeKind, ScrapeTarget};

/// Wire form of every request: `{ callback, payload }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub callback: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(callback: &str, payload: Value) -> Self {
        Self {
            callback: callback.to_string(),
            payload,
        }
    }
}

/// Calls forwarded to the backend service as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendCall {
    SignIn,
    AddUser,
    GetUserStatus,
    GetAllUsers,
    UpdateUserStatus,
    AddListing,
    GetListing,
    GetAllListing,
    DeleteListing,
    DeleteListingWithId,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenPage {
    pub url: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub wait_for_load: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClosePage {
    pub tab_id: TabId,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartScrape {
    pub kind: ScrapeKind,
    pub url: String,
    #[serde(default)]
    pub target: ScrapeTarget,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ScrapeKindOnly {
    pub kind: ScrapeKind,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartListing {
    pub source_id: String,
    pub sku: String,
    pub url: String,
    pub draft_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SetListingStatus {
    pub status: RunSignal,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BulkOptions {
    pub is_bulk_listing: bool,
    pub close_on_error: bool,
}

/// The closed set of requests the dispatcher answers.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Backend(BackendCall, Value),
    OpenPage(OpenPage),
    ClosePage(ClosePage),
    StartScrape(StartScrape),
    StopScrape(ScrapeKindOnly),
    ResumeScrape(ScrapeKindOnly),
    GetScrapeProgress(ScrapeKindOnly),
    ClearScrape(ScrapeKindOnly),
    StartListing(StartListing),
    SetListingStatus(SetListingStatus),
    GetListingTask,
    SetBulkOptions(BulkOptions),
    StartEolSweep,
}

fn payload<T: DeserializeOwned>(callback: &str, payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| RelayError::Encoding(format!("Invalid payload for {}: {}", callback, e)).into())
}

impl Request {
    /// `Ok(None)` for callbacks this process has no handler for.
    pub fn parse(envelope: Envelope) -> Result<Option<Request>> {
        let Envelope { callback, payload: body } = envelope;
        let name = callback.as_str();

        let request = match name {
            "sign-in" => Request::Backend(BackendCall::SignIn, body),
            "add-user" => Request::Backend(BackendCall::AddUser, body),
            "get-user-status" => Request::Backend(BackendCall::GetUserStatus, body),
            "get-all-users" => Request::Backend(BackendCall::GetAllUsers, body),
            "update-user-status" => Request::Backend(BackendCall::UpdateUserStatus, body),
            "add-listing" => Request::Backend(BackendCall::AddListing, body),
            "get-listing" => Request::Backend(BackendCall::GetListing, body),
            "get-all-listing" => Request::Backend(BackendCall::GetAllListing, body),
            "delete-listing" => Request::Backend(BackendCall::DeleteListing, body),
            "delete-listing-with-id" => Request::Backend(BackendCall::DeleteListingWithId, body),
            "open-page" => Request::OpenPage(payload(name, body)?),
            "close-page" => Request::ClosePage(payload(name, body)?),
            "start-scrape" => Request::StartScrape(payload(name, body)?),
            "stop-scrape" => Request::StopScrape(payload(name, body)?),
            "resume-scrape" => Request::ResumeScrape(payload(name, body)?),
            "get-scrape-progress" => Request::GetScrapeProgress(payload(name, body)?),
            "clear-scrape" => Request::ClearScrape(payload(name, body)?),
            "start-listing" => Request::StartListing(payload(name, body)?),
            "set-listing-status" => Request::SetListingStatus(payload(name, body)?),
            "get-listing-task" => Request::GetListingTask,
            "set-bulk-options" => Request::SetBulkOptions(payload(name, body)?),
            "start-eol-sweep" => Request::StartEolSweep,
            _ => return Ok(None),
        };
        Ok(Some(request))
    }
}

/// `{ success: true, ...fields }` or `{ success: false, error }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub needs_subscription: bool,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Response {
    /// Object results are spread into the envelope; anything else lands under `data`.
    pub fn ok(result: Value) -> Self {
        let fields = match result {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        let mut response = Self {
            success: true,
            error: None,
            needs_subscription: false,
            fields,
        };
        // a backend reply already carries its own flag
        response.fields.remove("success");
        response
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            needs_subscription: false,
            fields: Map::new(),
        }
    }

    pub fn from_error(err: &(dyn std::error::Error + Send + Sync + 'static)) -> Self {
        match err.downcast_ref::<RelayError>() {
            Some(RelayError::Request {
                message,
                needs_subscription,
            }) => Self {
                needs_subscription: *needs_subscription,
                ..Self::error(message.clone())
            },
            _ => Self::error(err.to_string()),
        }
    }
}
