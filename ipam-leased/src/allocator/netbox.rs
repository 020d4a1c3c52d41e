use std::time::Duration;
use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use shared::types::PoolContainer;
use crate::config::NetboxConfig;
use super::dto::{custom_fields, NetboxChoiceSet, NetboxList, NetboxPrefix, ReservePayload, StampPayload};
use super::{AllocatedAddress, Allocator, AllocatorError};

const PREFIXES_PATH: &str = "/api/ipam/prefixes/";
const CHOICE_SETS_PATH: &str = "/api/extras/custom-field-choice-sets/";
const STATUS_PATH: &str = "/api/status/";
const PAGE_SIZE: usize = 500;

type Query = [(String, String)];

/// Netbox REST client. Every call is bounded by the configured timeout.
pub struct NetboxClient {
    http: reqwest::Client,
    base_url: String,
    zone_choice_set: String,
    zone_field: String,
    constraint_tag: Option<String>,
}

impl NetboxClient {
    pub fn new(config: &NetboxConfig) -> Result<Self> {
        let token = config.resolve_token()?;

        let mut auth = HeaderValue::from_str(&format!("Token {}", token))
            .context("Netbox token is not a valid header value")?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, auth);
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            zone_choice_set: config.zone_choice_set.clone(),
            zone_field: config.zone_field.clone(),
            constraint_tag: config.constraint_tag.clone(),
        })
    }

    /// Poll Netbox until it answers, or until cancelled.
    pub async fn wait_until_ready(&self, retry: Duration, cancel: &CancellationToken) -> Result<()> {
        loop {
            match self.send::<()>(Method::GET, STATUS_PATH, &[], None).await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    tracing::info!(
                        "Netbox responded with status {}. Retrying in {:?}...",
                        resp.status(),
                        retry
                    );
                }
                Err(e) => {
                    tracing::info!("Error reaching Netbox: {}. Retrying in {:?}...", e, retry);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(retry) => {}
                _ = cancel.cancelled() => anyhow::bail!("Cancelled while waiting for Netbox"),
            }
        }
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        query: &Query,
        body: Option<&B>,
    ) -> Result<Response, AllocatorError> {
        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        request.send().await.map_err(|source| AllocatorError::Transport {
            path: path.to_string(),
            source,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &Query) -> Result<T, AllocatorError> {
        let resp = self.send::<()>(Method::GET, path, query, None).await?;
        decode(path, ensure_success(path, resp).await?).await
    }

    /// Follows offset pagination until the last page.
    async fn list_prefixes(&self, query: &Query) -> Result<Vec<NetboxPrefix>, AllocatorError> {
        let mut prefixes = Vec::new();
        let mut offset = 0usize;

        loop {
            let mut page_query = query.to_vec();
            page_query.push(("limit".to_string(), PAGE_SIZE.to_string()));
            page_query.push(("offset".to_string(), offset.to_string()));

            let page: NetboxList<NetboxPrefix> = self.get_json(PREFIXES_PATH, &page_query).await?;
            let fetched = page.results.len();
            prefixes.extend(page.results);

            if page.next.is_none() || fetched == 0 {
                break;
            }
            offset += fetched;
        }

        Ok(prefixes)
    }

    async fn create(&self, path: &str, payload: &ReservePayload) -> Result<Response, AllocatorError> {
        self.send(Method::POST, path, &[], Some(payload)).await
    }
}

#[async_trait]
impl Allocator for NetboxClient {
    async fn list_zones(&self) -> Result<Vec<String>, AllocatorError> {
        let query = [("name".to_string(), self.zone_choice_set.clone())];
        let sets: NetboxList<NetboxChoiceSet> = self.get_json(CHOICE_SETS_PATH, &query).await?;

        let set = sets
            .results
            .into_iter()
            .find(|s| s.name == self.zone_choice_set)
            .ok_or_else(|| {
                AllocatorError::Unexpected(format!("choice set {} not found", self.zone_choice_set))
            })?;

        Ok(set
            .extra_choices
            .into_iter()
            .filter_map(|choice| choice.into_iter().next())
            .collect())
    }

    async fn list_containers(&self, zone: &str) -> Result<Vec<PoolContainer>, AllocatorError> {
        let mut query = vec![
            ("status".to_string(), "container".to_string()),
            (format!("cf_{}", self.zone_field), zone.to_string()),
        ];
        if let Some(tag) = &self.constraint_tag {
            query.push(("tag".to_string(), tag.clone()));
        }

        let containers = self
            .list_prefixes(&query)
            .await?
            .into_iter()
            .filter_map(|p| match p.prefix.parse::<IpNet>() {
                Ok(prefix) => Some(PoolContainer {
                    id: p.id,
                    prefix,
                    zone: zone.to_string(),
                    vrf_id: p.vrf.map(|v| v.id),
                    tenant_id: p.tenant.map(|t| t.id),
                }),
                Err(e) => {
                    tracing::warn!("Skipping container {} with bad prefix {}: {}", p.id, p.prefix, e);
                    None
                }
            })
            .collect();

        Ok(containers)
    }

    async fn check_available(&self, container_id: i64) -> Result<bool, AllocatorError> {
        let path = format!("{}{}/available-prefixes/", PREFIXES_PATH, container_id);
        let available: Vec<serde_json::Value> = self.get_json(&path, &[]).await?;
        Ok(!available.is_empty())
    }

    async fn address_free(&self, address: &str, vrf_id: Option<i64>) -> Result<bool, AllocatorError> {
        let mut query = vec![("prefix".to_string(), address.to_string())];
        if let Some(vrf) = vrf_id {
            query.push(("vrf_id".to_string(), vrf.to_string()));
        }

        let existing: NetboxList<NetboxPrefix> = self.get_json(PREFIXES_PATH, &query).await?;
        Ok(existing.results.is_empty())
    }

    async fn reserve_next_available(
        &self,
        container: &PoolContainer,
        prefix_length: u8,
    ) -> Result<AllocatedAddress, AllocatorError> {
        let path = format!("{}{}/available-prefixes/", PREFIXES_PATH, container.id);
        let payload = ReservePayload {
            prefix: None,
            prefix_length: Some(prefix_length),
            status: "active",
            vrf: container.vrf_id,
            tenant: container.tenant_id,
            custom_fields: custom_fields(None),
        };

        let resp = self.create(&path, &payload).await?;
        // Netbox answers 409 when the container cannot fit the request, and
        // 204 when there is nothing left at all.
        if matches!(resp.status(), StatusCode::CONFLICT | StatusCode::NO_CONTENT) {
            return Err(AllocatorError::Exhausted(container.id));
        }

        let prefix: NetboxPrefix = decode(&path, ensure_success(&path, resp).await?).await?;
        Ok(AllocatedAddress {
            id: prefix.id,
            prefix: prefix.prefix,
        })
    }

    async fn create_specific(
        &self,
        address: &str,
        container: &PoolContainer,
    ) -> Result<AllocatedAddress, AllocatorError> {
        let payload = ReservePayload {
            prefix: Some(address.to_string()),
            prefix_length: None,
            status: "active",
            vrf: container.vrf_id,
            tenant: container.tenant_id,
            custom_fields: custom_fields(None),
        };

        let resp = self.create(PREFIXES_PATH, &payload).await?;
        let prefix: NetboxPrefix = decode(PREFIXES_PATH, ensure_success(PREFIXES_PATH, resp).await?).await?;
        Ok(AllocatedAddress {
            id: prefix.id,
            prefix: prefix.prefix,
        })
    }

    async fn update_metadata(&self, allocated: &AllocatedAddress, record_id: i64) -> Result<(), AllocatorError> {
        let path = format!("{}{}/", PREFIXES_PATH, allocated.id);
        let payload = StampPayload {
            prefix: allocated.prefix.clone(),
            custom_fields: custom_fields(Some(record_id)),
        };

        let resp = self.send(Method::PATCH, &path, &[], Some(&payload)).await?;
        ensure_success(&path, resp).await?;
        Ok(())
    }

    async fn release(&self, allocated_id: i64) -> Result<(), AllocatorError> {
        let path = format!("{}{}/", PREFIXES_PATH, allocated_id);
        let resp = self.send::<()>(Method::DELETE, &path, &[], None).await?;

        // Already gone counts as released
        if resp.status() == StatusCode::NOT_FOUND {
            tracing::debug!("Prefix {} was already deleted in Netbox", allocated_id);
            return Ok(());
        }

        ensure_success(&path, resp).await?;
        Ok(())
    }
}

async fn ensure_success(path: &str, resp: Response) -> Result<Response, AllocatorError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    Err(AllocatorError::Status {
        path: path.to_string(),
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(path: &str, resp: Response) -> Result<T, AllocatorError> {
    resp.json::<T>().await.map_err(|e| AllocatorError::Decode {
        path: path.to_string(),
        message: e.to_string(),
    })
}
