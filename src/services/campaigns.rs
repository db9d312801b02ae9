//! Campaigns service.

use crate::client::{MarketingClient, RequestOptions};
use crate::errors::MarketingResult;
use crate::pagination::{PageIterator, PaginationStrategy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

const DEFAULT_PAGE_SIZE: u32 = 50;

/// An email campaign
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Campaign {
    /// Campaign ID
    #[serde(deserialize_with = "super::string_or_number")]
    pub id: String,
    /// Display name
    pub name: String,
    /// Lifecycle status, e.g. `draft`, `scheduled`, `sent`
    #[serde(default)]
    pub status: Option<String>,
    /// Subject line
    #[serde(default)]
    pub subject: Option<String>,
    /// Sender address
    #[serde(default)]
    pub from_email: Option<String>,
    /// Target list IDs
    #[serde(default)]
    pub list_ids: Vec<serde_json::Value>,
    /// Scheduled send time
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Creation time
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Fields for a new campaign
#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateCampaignRequest {
    /// Display name
    pub name: String,
    /// Subject line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Sender address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_email: Option<String>,
    /// Target list IDs
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub list_ids: Vec<String>,
    /// HTML content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html_content: Option<String>,
}

impl CreateCampaignRequest {
    /// Create a request
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set subject
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set sender address
    pub fn from_email(mut self, from: impl Into<String>) -> Self {
        self.from_email = Some(from.into());
        self
    }

    /// Add a target list
    pub fn list(mut self, list_id: impl Into<String>) -> Self {
        self.list_ids.push(list_id.into());
        self
    }

    /// Set HTML content
    pub fn html_content(mut self, html: impl Into<String>) -> Self {
        self.html_content = Some(html.into());
        self
    }
}

/// Filters for listing campaigns
#[derive(Debug, Clone, Default)]
pub struct ListCampaignsParams {
    /// Only campaigns in this status
    pub status: Option<String>,
    /// Items per page
    pub page_size: Option<u32>,
    /// Account to list; defaults to the current account
    pub account_id: Option<String>,
}

/// Campaign operations, scoped to the current account
#[derive(Debug, Clone)]
pub struct CampaignsService {
    client: MarketingClient,
}

impl CampaignsService {
    /// Create the service on a client
    pub fn new(client: MarketingClient) -> Self {
        Self { client }
    }

    /// Pages of campaigns
    pub fn list(&self, params: ListCampaignsParams) -> PageIterator {
        let options =
            scoped(RequestOptions::get(), params.account_id).query_opt("status", params.status);
        self.client
            .paginate(
                "campaigns",
                PaginationStrategy::offset(params.page_size.unwrap_or(DEFAULT_PAGE_SIZE)),
            )
            .options(options)
            .items_at("/data")
            .total_at("/total")
    }

    /// Fetch one campaign
    #[instrument(skip(self))]
    pub async fn get(&self, campaign_id: &str) -> MarketingResult<Campaign> {
        self.client
            .request(
                &format!("campaigns/{}", campaign_id),
                RequestOptions::get().account_scoped(),
            )
            .await
    }

    /// Create a draft campaign
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create(&self, request: &CreateCampaignRequest) -> MarketingResult<Campaign> {
        self.client
            .request("campaigns", RequestOptions::post(request).account_scoped())
            .await
    }

    /// Send a campaign now
    #[instrument(skip(self))]
    pub async fn send(&self, campaign_id: &str) -> MarketingResult<serde_json::Value> {
        self.client
            .make_request(
                &format!("campaigns/{}/send", campaign_id),
                RequestOptions::post(serde_json::json!({})).account_scoped(),
            )
            .await
    }

    /// Delete a campaign
    #[instrument(skip(self))]
    pub async fn delete(&self, campaign_id: &str) -> MarketingResult<()> {
        self.client
            .make_request(
                &format!("campaigns/{}", campaign_id),
                RequestOptions::delete().account_scoped(),
            )
            .await
            .map(|_| ())
    }
}

fn scoped(options: RequestOptions, account_id: Option<String>) -> RequestOptions {
    match account_id {
        Some(account) => options.account(account),
        None => options.account_scoped(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarketingConfig;
    use crate::mocks::{header, json_body, MockHttpTransport, MockResponse};
    use crate::resilience::RateLimitConfig;
    use crate::ACCOUNT_ID_HEADER;
    use serde_json::json;
    use std::sync::Arc;

    fn service(transport: Arc<MockHttpTransport>) -> CampaignsService {
        transport.set_default(
            "oauth/token",
            MockResponse::ok(json!({"access_token": "tok", "expires_in": 3600, "accounts": [31]})),
        );
        let config = MarketingConfig::builder()
            .base_url("https://api.mailer.test/v3")
            .unwrap()
            .username_password("ops@example.com", "hunter2")
            .rate_limit(RateLimitConfig::new().enabled(false))
            .build()
            .unwrap();
        CampaignsService::new(MarketingClient::with_transport(config, transport))
    }

    #[tokio::test]
    async fn test_get_parses_numeric_id() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default(
            "campaigns/7",
            MockResponse::ok(json!({"id": 7, "name": "Welcome", "status": "draft", "extra": true})),
        );
        let campaigns = service(transport.clone());

        let campaign = campaigns.get("7").await.unwrap();

        assert_eq!(campaign.id, "7");
        assert_eq!(campaign.status.as_deref(), Some("draft"));
        let sent = &transport.requests_matching("campaigns/7")[0];
        assert_eq!(header(sent, ACCOUNT_ID_HEADER), Some("31"));
    }

    #[tokio::test]
    async fn test_create_posts_only_set_fields() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default(
            "campaigns",
            MockResponse::json(201, json!({"id": "c-1", "name": "Launch"})),
        );
        let campaigns = service(transport.clone());

        let created = campaigns
            .create(&CreateCampaignRequest::new("Launch").subject("We are live").list("l-1"))
            .await
            .unwrap();

        assert_eq!(created.id, "c-1");
        let sent = &transport.requests_matching("campaigns")[0];
        assert_eq!(
            json_body(sent),
            Some(json!({"name": "Launch", "subject": "We are live", "list_ids": ["l-1"]}))
        );
    }

    #[tokio::test]
    async fn test_list_uses_explicit_account_and_filter() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default("campaigns", MockResponse::ok(json!({"data": [], "total": 0})));
        let campaigns = service(transport.clone());

        let mut pages = campaigns.list(ListCampaignsParams {
            status: Some("sent".to_string()),
            page_size: Some(25),
            account_id: Some("99".to_string()),
        });
        let page = pages.next_page().await.unwrap().unwrap();

        assert!(page.is_empty());
        let sent = &transport.requests_matching("campaigns")[0];
        assert_eq!(sent.url, "https://api.mailer.test/v3/campaigns?status=sent&limit=25&offset=0");
        assert_eq!(header(sent, ACCOUNT_ID_HEADER), Some("99"));
    }

    #[tokio::test]
    async fn test_delete_accepts_empty_body() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default("campaigns/3", MockResponse::empty(204));
        let campaigns = service(transport);

        campaigns.delete("3").await.unwrap();
    }
}
