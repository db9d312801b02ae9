//! Pagination over list endpoints.
//!
//! Each endpoint pages one of three ways, described by [`PaginationStrategy`].
//! [`PageIterator`] walks any of them lazily and can be restarted.

use crate::client::{MarketingClient, RequestOptions};
use crate::errors::MarketingResult;
use futures::stream::{self, Stream};
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

/// Keys tried for the item array when no pointer is configured
const ITEM_KEYS: [&str; 3] = ["data", "items", "results"];

/// How an endpoint splits its results into pages
#[derive(Debug, Clone, PartialEq)]
pub enum PaginationStrategy {
    /// `limit` + numeric `offset`
    Offset {
        /// Items requested per page
        page_size: u32,
        /// Name of the page-size parameter
        limit_param: String,
        /// Name of the offset parameter
        offset_param: String,
    },
    /// Opaque cursor returned in the body, with an optional "more" flag
    Cursor {
        /// Items requested per page
        page_size: u32,
        /// Name of the page-size parameter
        limit_param: String,
        /// Name of the cursor parameter
        cursor_param: String,
        /// JSON pointer to the next cursor in the response
        next_cursor_pointer: String,
        /// JSON pointer to a boolean that is false on the last page
        has_more_pointer: Option<String>,
    },
    /// Continuation token returned in the body
    Token {
        /// Items requested per page
        page_size: u32,
        /// Name of the page-size parameter
        limit_param: String,
        /// Name of the token parameter
        token_param: String,
        /// JSON pointer to the next token in the response
        next_token_pointer: String,
    },
}

impl PaginationStrategy {
    /// `?limit=N&offset=M`
    pub fn offset(page_size: u32) -> Self {
        Self::Offset {
            page_size,
            limit_param: "limit".to_string(),
            offset_param: "offset".to_string(),
        }
    }

    /// `?limit=N&cursor=C`, next cursor at `/next_cursor`, flag at `/has_more`
    pub fn cursor(page_size: u32) -> Self {
        Self::Cursor {
            page_size,
            limit_param: "limit".to_string(),
            cursor_param: "cursor".to_string(),
            next_cursor_pointer: "/next_cursor".to_string(),
            has_more_pointer: Some("/has_more".to_string()),
        }
    }

    /// `?limit=N&page_token=T`, next token at `/next_page_token`
    pub fn token(page_size: u32) -> Self {
        Self::Token {
            page_size,
            limit_param: "limit".to_string(),
            token_param: "page_token".to_string(),
            next_token_pointer: "/next_page_token".to_string(),
        }
    }

    /// Items requested per page
    pub fn page_size(&self) -> u32 {
        match self {
            Self::Offset { page_size, .. }
            | Self::Cursor { page_size, .. }
            | Self::Token { page_size, .. } => *page_size,
        }
    }

    fn limit_param(&self) -> &str {
        match self {
            Self::Offset { limit_param, .. }
            | Self::Cursor { limit_param, .. }
            | Self::Token { limit_param, .. } => limit_param,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Position {
    Start,
    Offset(u64),
    Marker(String),
    Exhausted,
}

/// One page of results
#[derive(Debug, Clone)]
pub struct Page {
    /// Items on this page
    pub items: Vec<Value>,
    /// 1-based page number
    pub number: u32,
    /// Whether another page follows
    pub has_next: bool,
    /// Total item count, when the response reports one
    pub total: Option<u64>,
    /// Full response body
    pub raw: Value,
}

impl Page {
    /// Number of items on this page
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if the page has no items
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Lazy, restartable walk over the pages of one endpoint
pub struct PageIterator {
    client: MarketingClient,
    endpoint: String,
    strategy: PaginationStrategy,
    options: RequestOptions,
    items_pointer: Option<String>,
    total_pointer: Option<String>,
    max_pages: Option<u32>,
    position: Position,
    seen_markers: HashSet<String>,
    pages_fetched: u32,
}

impl PageIterator {
    /// Iterate `endpoint` with the given strategy
    pub fn new(client: MarketingClient, endpoint: impl Into<String>, strategy: PaginationStrategy) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            strategy,
            options: RequestOptions::get(),
            items_pointer: None,
            total_pointer: None,
            max_pages: None,
            position: Position::Start,
            seen_markers: HashSet::new(),
            pages_fetched: 0,
        }
    }

    /// Base options for every page request (filters, account scoping)
    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// JSON pointer to the item array; `""` for a bare array body
    pub fn items_at(mut self, pointer: impl Into<String>) -> Self {
        self.items_pointer = Some(pointer.into());
        self
    }

    /// JSON pointer to a total item count
    pub fn total_at(mut self, pointer: impl Into<String>) -> Self {
        self.total_pointer = Some(pointer.into());
        self
    }

    /// Stop after this many pages
    pub fn max_pages(mut self, max: u32) -> Self {
        self.max_pages = Some(max);
        self
    }

    /// Pages fetched since creation or the last reset
    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    /// Start again from the first page
    pub fn reset(&mut self) {
        self.position = Position::Start;
        self.seen_markers.clear();
        self.pages_fetched = 0;
    }

    /// Fetch the next page, or `None` once the sequence is exhausted.
    ///
    /// A failed fetch leaves the position unchanged, so calling again
    /// retries the same page.
    pub async fn next_page(&mut self) -> MarketingResult<Option<Page>> {
        if self.position == Position::Exhausted {
            return Ok(None);
        }
        if self.max_pages.is_some_and(|max| self.pages_fetched >= max) {
            self.position = Position::Exhausted;
            return Ok(None);
        }

        let raw = self
            .client
            .make_request(&self.endpoint, self.page_options())
            .await?;
        let items = extract_items(&raw, self.items_pointer.as_deref());
        let total = self
            .total_pointer
            .as_deref()
            .and_then(|p| raw.pointer(p))
            .and_then(Value::as_u64);
        let next = self.next_position(&raw, items.len(), total);

        self.pages_fetched += 1;
        debug!(
            endpoint = %self.endpoint,
            page = self.pages_fetched,
            items = items.len(),
            "Fetched page"
        );

        let has_next = next != Position::Exhausted;
        if let Position::Marker(marker) = &next {
            self.seen_markers.insert(marker.clone());
        }
        self.position = next;
        Ok(Some(Page {
            items,
            number: self.pages_fetched,
            has_next,
            total,
            raw,
        }))
    }

    /// Fetch every remaining page and concatenate the items
    pub async fn collect_items(mut self) -> MarketingResult<Vec<Value>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page.items);
        }
        Ok(all)
    }

    /// Pages as a stream; the stream ends after the first error
    pub fn into_stream(self) -> impl Stream<Item = MarketingResult<Page>> {
        stream::unfold(Some(self), |state| async move {
            let mut pages = state?;
            match pages.next_page().await {
                Ok(Some(page)) => Some((Ok(page), Some(pages))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    fn page_options(&self) -> RequestOptions {
        let options = self
            .options
            .clone()
            .query(self.strategy.limit_param(), self.strategy.page_size());

        match (&self.strategy, &self.position) {
            (PaginationStrategy::Offset { offset_param, .. }, Position::Start) => {
                options.query(offset_param.as_str(), 0)
            }
            (PaginationStrategy::Offset { offset_param, .. }, Position::Offset(offset)) => {
                options.query(offset_param.as_str(), offset)
            }
            (PaginationStrategy::Cursor { cursor_param, .. }, Position::Marker(marker)) => {
                options.query(cursor_param.as_str(), marker)
            }
            (PaginationStrategy::Token { token_param, .. }, Position::Marker(marker)) => {
                options.query(token_param.as_str(), marker)
            }
            _ => options,
        }
    }

    fn next_position(&self, raw: &Value, item_count: usize, total: Option<u64>) -> Position {
        if item_count == 0 {
            return Position::Exhausted;
        }

        match &self.strategy {
            PaginationStrategy::Offset { page_size, .. } => {
                let current = match self.position {
                    Position::Offset(offset) => offset,
                    _ => 0,
                };
                let next = current + item_count as u64;
                let short_page = (item_count as u64) < u64::from(*page_size);
                if short_page || total.is_some_and(|t| next >= t) {
                    Position::Exhausted
                } else {
                    Position::Offset(next)
                }
            }
            PaginationStrategy::Cursor {
                next_cursor_pointer,
                has_more_pointer,
                ..
            } => {
                let more = has_more_pointer
                    .as_deref()
                    .and_then(|p| raw.pointer(p))
                    .and_then(Value::as_bool);
                if more == Some(false) {
                    return Position::Exhausted;
                }
                self.marker_after(raw, next_cursor_pointer)
            }
            PaginationStrategy::Token {
                next_token_pointer, ..
            } => self.marker_after(raw, next_token_pointer),
        }
    }

    /// Next marker from the body; a missing marker or one already followed ends the walk
    fn marker_after(&self, raw: &Value, pointer: &str) -> Position {
        let marker = match raw.pointer(pointer) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Position::Exhausted,
        };
        if self.seen_markers.contains(&marker) {
            debug!(endpoint = %self.endpoint, marker = %marker, "Marker already followed, stopping");
            return Position::Exhausted;
        }
        Position::Marker(marker)
    }
}

impl std::fmt::Debug for PageIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageIterator")
            .field("endpoint", &self.endpoint)
            .field("strategy", &self.strategy)
            .field("position", &self.position)
            .field("pages_fetched", &self.pages_fetched)
            .finish()
    }
}

fn extract_items(raw: &Value, pointer: Option<&str>) -> Vec<Value> {
    let found = match pointer {
        Some(p) => raw.pointer(p),
        None if raw.is_array() => Some(raw),
        None => ITEM_KEYS.iter().find_map(|k| raw.get(*k).filter(|v| v.is_array())),
    };
    found
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarketingConfig;
    use crate::mocks::{MockHttpTransport, MockResponse};
    use crate::resilience::RateLimitConfig;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::Arc;

    fn client(transport: Arc<MockHttpTransport>) -> MarketingClient {
        let config = MarketingConfig::builder()
            .base_url("https://api.mailer.test/v3")
            .unwrap()
            .api_key("key-1")
            .rate_limit(RateLimitConfig::new().enabled(false))
            .build()
            .unwrap();
        MarketingClient::with_transport(config, transport)
    }

    fn query_of(transport: &MockHttpTransport, pattern: &str) -> Vec<String> {
        transport
            .requests_matching(pattern)
            .iter()
            .map(|r| r.url.split_once('?').map(|(_, q)| q.to_string()).unwrap_or_default())
            .collect()
    }

    #[tokio::test]
    async fn test_offset_pages_until_short_page() {
        let transport = Arc::new(MockHttpTransport::new());
        transport
            .enqueue("contacts", MockResponse::ok(json!({"data": [1, 2]})))
            .enqueue("contacts", MockResponse::ok(json!({"data": [3, 4]})))
            .enqueue("contacts", MockResponse::ok(json!({"data": [5]})));
        let client = client(transport.clone());

        let items = client
            .paginate("contacts", PaginationStrategy::offset(2))
            .collect_items()
            .await
            .unwrap();

        assert_eq!(items, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);
        assert_eq!(
            query_of(&transport, "contacts"),
            vec!["limit=2&offset=0", "limit=2&offset=2", "limit=2&offset=4"]
        );
    }

    #[tokio::test]
    async fn test_offset_stops_at_total() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.enqueue("contacts", MockResponse::ok(json!({"data": [1, 2], "total": 2})));
        let client = client(transport.clone());

        let mut pages = client
            .paginate("contacts", PaginationStrategy::offset(2))
            .total_at("/total");

        let page = pages.next_page().await.unwrap().unwrap();
        assert!(!page.has_next);
        assert_eq!(page.total, Some(2));
        assert!(pages.next_page().await.unwrap().is_none());
        assert_eq!(transport.request_count("contacts"), 1);
    }

    #[tokio::test]
    async fn test_cursor_follows_next_cursor() {
        let transport = Arc::new(MockHttpTransport::new());
        transport
            .enqueue(
                "lists",
                MockResponse::ok(json!({"items": [{"id": 1}], "next_cursor": "c2", "has_more": true})),
            )
            .enqueue(
                "lists",
                MockResponse::ok(json!({"items": [{"id": 2}], "next_cursor": "c3", "has_more": false})),
            );
        let client = client(transport.clone());

        let items = client
            .paginate("lists", PaginationStrategy::cursor(50))
            .collect_items()
            .await
            .unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(
            query_of(&transport, "lists"),
            vec!["limit=50", "limit=50&cursor=c2"]
        );
    }

    #[tokio::test]
    async fn test_cycling_cursor_stops_at_first_repeat() {
        let transport = Arc::new(MockHttpTransport::new());
        transport
            .enqueue("lists", MockResponse::ok(json!({"items": [1], "next_cursor": "A"})))
            .enqueue("lists", MockResponse::ok(json!({"items": [2], "next_cursor": "B"})))
            .enqueue("lists", MockResponse::ok(json!({"items": [3], "next_cursor": "A"})))
            .set_default("lists", MockResponse::ok(json!({"items": [4], "next_cursor": "A"})));
        let client = client(transport.clone());

        let items = client
            .paginate("lists", PaginationStrategy::cursor(1))
            .collect_items()
            .await
            .unwrap();

        assert_eq!(items, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(
            query_of(&transport, "lists"),
            vec!["limit=1", "limit=1&cursor=A", "limit=1&cursor=B"]
        );
    }

    #[tokio::test]
    async fn test_reset_forgets_followed_markers() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default(
            "lists",
            MockResponse::ok(json!({"items": [1], "next_cursor": "A", "has_more": true})),
        );
        let client = client(transport.clone());
        let mut pages = client.paginate("lists", PaginationStrategy::cursor(1));

        assert!(pages.next_page().await.unwrap().unwrap().has_next);
        assert!(!pages.next_page().await.unwrap().unwrap().has_next);

        pages.reset();
        assert!(pages.next_page().await.unwrap().unwrap().has_next);
    }

    #[tokio::test]
    async fn test_token_strategy_with_custom_pointer() {
        let transport = Arc::new(MockHttpTransport::new());
        transport
            .enqueue(
                "templates",
                MockResponse::ok(json!({"results": {"rows": ["a"]}, "next_page_token": "t-2"})),
            )
            .enqueue("templates", MockResponse::ok(json!({"results": {"rows": ["b"]}})));
        let client = client(transport.clone());

        let pages: Vec<_> = client
            .paginate("templates", PaginationStrategy::token(1))
            .items_at("/results/rows")
            .into_stream()
            .collect()
            .await;

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1].as_ref().unwrap().items, vec![json!("b")]);
        assert_eq!(query_of(&transport, "templates")[1], "limit=1&page_token=t-2");
    }

    #[tokio::test]
    async fn test_reset_restarts_from_first_page() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default("segments", MockResponse::ok(json!([{"id": 1}])));
        let client = client(transport.clone());

        let mut pages = client.paginate("segments", PaginationStrategy::offset(10));
        pages.next_page().await.unwrap();
        assert!(pages.next_page().await.unwrap().is_none());

        pages.reset();
        let again = pages.next_page().await.unwrap().unwrap();

        assert_eq!(again.number, 1);
        assert_eq!(query_of(&transport, "segments")[1], "limit=10&offset=0");
    }

    #[tokio::test]
    async fn test_error_leaves_position_for_retry() {
        let transport = Arc::new(MockHttpTransport::new());
        transport
            .enqueue("contacts", MockResponse::ok(json!({"data": [1, 2]})))
            .enqueue("contacts", MockResponse::json(404, json!({"message": "gone"})))
            .enqueue("contacts", MockResponse::ok(json!({"data": [3]})));
        let client = client(transport.clone());
        let mut pages = client.paginate("contacts", PaginationStrategy::offset(2));

        pages.next_page().await.unwrap();
        assert!(pages.next_page().await.is_err());
        let page = pages.next_page().await.unwrap().unwrap();

        assert_eq!(page.items, vec![json!(3)]);
        let queries = query_of(&transport, "contacts");
        assert_eq!(queries[1], queries[2]);
    }

    #[tokio::test]
    async fn test_max_pages() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default("contacts", MockResponse::ok(json!({"data": [1, 2]})));
        let client = client(transport.clone());

        let items = client
            .paginate("contacts", PaginationStrategy::offset(2))
            .max_pages(3)
            .collect_items()
            .await
            .unwrap();

        assert_eq!(items.len(), 6);
        assert_eq!(transport.request_count("contacts"), 3);
    }
}
