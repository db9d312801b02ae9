//! Resource services built on [`crate::MarketingClient`].
//!
//! Services hold a clone of the client, so every service created from the
//! same client shares its token, account and resilience state.

pub mod campaigns;

pub use campaigns::{Campaign, CampaignsService, CreateCampaignRequest, ListCampaignsParams};

use serde::{Deserialize, Deserializer};

/// Identifiers arrive as strings or numbers depending on the endpoint
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}
