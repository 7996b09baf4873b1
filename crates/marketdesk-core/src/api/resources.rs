//! CRUD wrappers for the backend collections.
//!
//! All collections share the same REST layout (`/{collection}` and
//! `/{collection}/{id}`) and opaque JSON payloads, so one facade serves them
//! all. Every call goes through [`ApiClient::send`] and therefore benefits
//! from transparent credential refresh.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;

use super::{ApiClient, ApiError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Listings,
    Cards,
    Products,
    ProductDetails,
    Media,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Listings,
        ResourceKind::Cards,
        ResourceKind::Products,
        ResourceKind::ProductDetails,
        ResourceKind::Media,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            ResourceKind::Listings => "/listings",
            ResourceKind::Cards => "/cards",
            ResourceKind::Products => "/products",
            ResourceKind::ProductDetails => "/product-details",
            ResourceKind::Media => "/media",
        }
    }

    /// Listings are published elsewhere and only readable here.
    pub fn is_writable(&self) -> bool {
        !matches!(self, ResourceKind::Listings)
    }

    /// `id` is encoded as a single path segment.
    fn item_path(&self, id: &str) -> String {
        format!("{}/{}", self.path(), urlencoding::encode(id))
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path().trim_start_matches('/'))
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().trim_start_matches('/').to_ascii_lowercase();
        ResourceKind::ALL
            .into_iter()
            .find(|kind| kind.to_string() == wanted)
            .ok_or_else(|| format!("Unknown resource: {}", s))
    }
}

/// CRUD operations on one collection.
pub struct Resources<'a> {
    client: &'a ApiClient,
    kind: ResourceKind,
}

impl ApiClient {
    pub fn resource(&self, kind: ResourceKind) -> Resources<'_> {
        Resources { client: self, kind }
    }
}

impl Resources<'_> {
    pub async fn list(&self) -> Result<Value, ApiError> {
        self.client.get_json(self.kind.path()).await
    }

    pub async fn get(&self, id: &str) -> Result<Value, ApiError> {
        self.client.get_json(&self.kind.item_path(id)).await
    }

    pub async fn create<B: Serialize + ?Sized>(&self, body: &B) -> Result<Value, ApiError> {
        self.ensure_writable()?;
        self.client.post_json(self.kind.path(), body).await
    }

    pub async fn update<B: Serialize + ?Sized>(&self, id: &str, body: &B) -> Result<Value, ApiError> {
        self.ensure_writable()?;
        self.client.put_json(&self.kind.item_path(id), body).await
    }

    pub async fn delete(&self, id: &str) -> Result<Value, ApiError> {
        self.ensure_writable()?;
        self.client.delete(&self.kind.item_path(id)).await
    }

    fn ensure_writable(&self) -> Result<(), ApiError> {
        if self.kind.is_writable() {
            Ok(())
        } else {
            Err(ApiError::InvalidRequest(format!("{} are read-only", self.kind)))
        }
    }
}
