//! OAuth2 Client entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "oauth2_client")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub secret: String,
    /// Human-readable client name
    pub name: String,
    /// JSON array of allowed redirect URIs
    pub redirect_uris: String,
    pub created_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Parse redirect URIs from JSON string
    pub fn redirect_uris_list(&self) -> Result<Vec<String>, serde_json::Error> {
        serde_json::from_str(&self.redirect_uris)
    }

    /// Check if a redirect URI is registered for this client. An empty list
    /// places no restriction beyond the global pattern; an unreadable one
    /// allows nothing.
    pub fn is_redirect_uri_allowed(&self, uri: &str) -> bool {
        match self.redirect_uris_list() {
            Ok(uris) => uris.is_empty() || uris.iter().any(|allowed| allowed == uri),
            Err(_) => false,
        }
    }
}
