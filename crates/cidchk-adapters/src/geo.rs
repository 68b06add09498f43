//! Geo Resolver: provider id -> advertised multiaddrs -> IPs -> first routable geolocation.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cidchk_core::Location;
use cidchk_storage::{FetchError, HttpClient, MemoCache, RetryPolicy};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::multiaddr::{decode_host, is_bogon, Host};

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("chain rpc: {0}")]
    Rpc(#[source] FetchError),
    #[error("geolocation lookup for {ip}: {source}")]
    Lookup {
        ip: IpAddr,
        #[source]
        source: FetchError,
    },
}

/// Name resolution seam so tests do not depend on real DNS.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> std::io::Result<Vec<IpAddr>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, name: &str) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((name, 0)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

#[derive(Debug, Clone)]
pub struct GeoConfig {
    pub lotus_rpc_url: String,
    pub ipinfo_url: String,
    pub ipinfo_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MinerInfo {
    #[serde(rename = "PeerId", default)]
    pub peer_id: Option<String>,
    #[serde(rename = "Multiaddrs", default)]
    pub multiaddrs: Option<Vec<String>>,
    #[serde(rename = "SectorSize", default)]
    pub sector_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct IpInfo {
    #[serde(default)]
    bogon: bool,
    city: Option<String>,
    region: Option<String>,
    country: Option<String>,
    loc: Option<String>,
    org: Option<String>,
}

impl IpInfo {
    fn into_location(self) -> Location {
        let (latitude, longitude) = self
            .loc
            .as_deref()
            .and_then(parse_loc)
            .map_or((None, None), |(lat, long)| (Some(lat), Some(long)));
        Location {
            city: non_blank(self.city),
            region: non_blank(self.region),
            country: non_blank(self.country),
            latitude,
            longitude,
            org_name: self.org.as_deref().and_then(strip_asn),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// `"39.9075,116.3972"` -> `(39.9075, 116.3972)`.
pub fn parse_loc(loc: &str) -> Option<(f64, f64)> {
    let (lat, long) = loc.split_once(',')?;
    Some((lat.trim().parse().ok()?, long.trim().parse().ok()?))
}

/// Drop the leading `AS1234` token from an organization string.
pub fn strip_asn(org: &str) -> Option<String> {
    let org = org.trim();
    let rest = match org.split_once(' ') {
        Some((first, rest)) if is_asn(first) => rest.trim(),
        None if is_asn(org) => "",
        _ => org,
    };
    (!rest.is_empty()).then(|| rest.to_string())
}

fn is_asn(token: &str) -> bool {
    token
        .strip_prefix("AS")
        .is_some_and(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
}

/// What the orchestrator needs from geolocation.
#[async_trait]
pub trait LocationLookup: Send + Sync {
    async fn resolve_location(&self, provider: &str) -> Result<Option<Location>, GeoError>;
}

pub struct GeoResolver {
    http: Arc<HttpClient>,
    config: GeoConfig,
    retry: RetryPolicy,
    resolver: Arc<dyn HostResolver>,
    cache: MemoCache<String, Option<Location>>,
}

impl GeoResolver {
    pub fn new(http: Arc<HttpClient>, config: GeoConfig, retry: RetryPolicy) -> Self {
        Self::with_resolver(http, config, retry, Arc::new(SystemResolver))
    }

    pub fn with_resolver(
        http: Arc<HttpClient>,
        config: GeoConfig,
        retry: RetryPolicy,
        resolver: Arc<dyn HostResolver>,
    ) -> Self {
        Self {
            http,
            config,
            retry,
            resolver,
            cache: MemoCache::new(),
        }
    }

    /// Best-effort location for a storage provider. `Ok(None)` when nothing
    /// routable could be placed; errors only for exhausted transport retries.
    #[instrument(skip_all, fields(provider = %provider))]
    pub async fn resolve_location(&self, provider: &str) -> Result<Option<Location>, GeoError> {
        self.cache
            .get_or_try_insert_with(provider.to_string(), || self.resolve_uncached(provider))
            .await
    }

    async fn resolve_uncached(&self, provider: &str) -> Result<Option<Location>, GeoError> {
        let Some(info) = self.miner_info(provider).await? else {
            return Ok(None);
        };
        let multiaddrs = info.multiaddrs.unwrap_or_default();
        if multiaddrs.is_empty() {
            info!("provider advertises no multiaddrs");
            return Ok(None);
        }

        for ip in self.collect_ips(&multiaddrs).await {
            if is_bogon(&ip) {
                debug!(%ip, "skipping bogon address");
                continue;
            }
            if let Some(location) = self.lookup_ip(ip).await? {
                return Ok(Some(location));
            }
        }
        info!("no routable address could be geolocated");
        Ok(None)
    }

    pub async fn miner_info(&self, provider: &str) -> Result<Option<MinerInfo>, GeoError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": "Filecoin.StateMinerInfo",
            "params": [provider, null],
            "id": 1,
        });
        let response: RpcResponse<MinerInfo> = self
            .retry
            .run("state_miner_info", || {
                self.http.execute_json(
                    self.http
                        .request(Method::POST, &self.config.lotus_rpc_url)
                        .json(&body),
                )
            })
            .await
            .map_err(GeoError::Rpc)?;

        if let Some(err) = response.error {
            warn!(code = err.code, message = %err.message, "chain rpc rejected miner lookup");
            return Ok(None);
        }
        Ok(response.result)
    }

    async fn collect_ips(&self, multiaddrs: &[String]) -> Vec<IpAddr> {
        let mut ips = Vec::new();
        for encoded in multiaddrs {
            let bytes = match STANDARD.decode(encoded) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(multiaddr = %encoded, error = %err, "multiaddr is not base64");
                    continue;
                }
            };
            match decode_host(&bytes) {
                Ok(Host::Ip(ip)) => push_unique(&mut ips, ip),
                Ok(Host::Dns { name, family }) => match self.resolver.resolve(&name).await {
                    Ok(resolved) => resolved
                        .into_iter()
                        .filter(|ip| family.admits(ip))
                        .for_each(|ip| push_unique(&mut ips, ip)),
                    Err(err) => warn!(host = %name, error = %err, "dns resolution failed"),
                },
                Err(err) => warn!(multiaddr = %encoded, error = %err, "skipping multiaddr"),
            }
        }
        ips
    }

    async fn lookup_ip(&self, ip: IpAddr) -> Result<Option<Location>, GeoError> {
        let url = format!("{}/{}", self.config.ipinfo_url.trim_end_matches('/'), ip);
        let info: IpInfo = self
            .retry
            .run("ipinfo_lookup", || {
                let mut request = self.http.request(Method::GET, &url);
                if let Some(token) = &self.config.ipinfo_token {
                    request = request.bearer_auth(token);
                }
                self.http.execute_json(request)
            })
            .await
            .map_err(|source| GeoError::Lookup { ip, source })?;

        if info.bogon {
            debug!(%ip, "lookup service reports bogon");
            return Ok(None);
        }
        Ok(Some(info.into_location()))
    }
}

#[async_trait]
impl LocationLookup for GeoResolver {
    async fn resolve_location(&self, provider: &str) -> Result<Option<Location>, GeoError> {
        GeoResolver::resolve_location(self, provider).await
    }
}

fn push_unique(ips: &mut Vec<IpAddr>, ip: IpAddr) {
    if !ips.contains(&ip) {
        ips.push(ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cidchk_storage::HttpClientConfig;
    use httpmock::prelude::*;
    use std::collections::HashMap;

    struct FixedResolver(HashMap<String, Vec<IpAddr>>);

    #[async_trait]
    impl HostResolver for FixedResolver {
        async fn resolve(&self, name: &str) -> std::io::Result<Vec<IpAddr>> {
            self.0
                .get(name)
                .cloned()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, name.to_string()))
        }
    }

    fn ip4_multiaddr(ip: [u8; 4]) -> String {
        let mut bytes = vec![0x04];
        bytes.extend_from_slice(&ip);
        bytes.extend_from_slice(&[0x06, 0x5d, 0xc0]);
        STANDARD.encode(bytes)
    }

    fn dns4_multiaddr(name: &str) -> String {
        let mut bytes = vec![0x36, name.len() as u8];
        bytes.extend_from_slice(name.as_bytes());
        STANDARD.encode(bytes)
    }

    fn resolver_for(server: &MockServer, dns: HashMap<String, Vec<IpAddr>>) -> GeoResolver {
        let http = Arc::new(HttpClient::new(HttpClientConfig::default()).unwrap());
        GeoResolver::with_resolver(
            http,
            GeoConfig {
                lotus_rpc_url: server.url("/rpc/v0"),
                ipinfo_url: server.url("/ipinfo"),
                ipinfo_token: Some("token".into()),
            },
            RetryPolicy::immediate(3),
            Arc::new(FixedResolver(dns)),
        )
    }

    async fn mock_miner<'a>(server: &'a MockServer, provider: &str, multiaddrs: Vec<String>) -> httpmock::Mock<'a> {
        let provider = provider.to_string();
        server.mock_async(move |when, then| {
            when.method(POST)
                .path("/rpc/v0")
                .body_contains("Filecoin.StateMinerInfo")
                .body_contains(provider.as_str());
            then.status(200).json_body(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": { "PeerId": "12D3KooW", "Multiaddrs": multiaddrs, "SectorSize": 34359738368u64 }
            }));
        }).await
    }

    #[tokio::test]
    async fn first_routable_ip_wins_and_is_cached() {
        let server = MockServer::start_async().await;
        let miner = mock_miner(
            &server,
            "f01234",
            vec![ip4_multiaddr([10, 0, 0, 1]), ip4_multiaddr([1, 2, 3, 4]), ip4_multiaddr([5, 6, 7, 8])],
        ).await;
        let first = server.mock_async(|when, then| {
            when.method(GET).path("/ipinfo/1.2.3.4").header("authorization", "Bearer token");
            then.status(200).json_body(json!({
                "ip": "1.2.3.4",
                "city": "Hong Kong",
                "region": "Central and Western",
                "country": "HK",
                "loc": "22.2783,114.1747",
                "org": "AS4134 CHINANET-BACKBONE"
            }));
        }).await;
        let second = server.mock_async(|when, then| {
            when.method(GET).path("/ipinfo/5.6.7.8");
            then.status(200).json_body(json!({"ip": "5.6.7.8", "country": "DE"}));
        }).await;

        let geo = resolver_for(&server, HashMap::new());
        let location = geo.resolve_location("f01234").await.unwrap().unwrap();
        assert_eq!(location.country.as_deref(), Some("HK"));
        assert_eq!(location.org_name.as_deref(), Some("CHINANET-BACKBONE"));
        assert_eq!(location.latitude, Some(22.2783));

        geo.resolve_location("f01234").await.unwrap();
        miner.assert_hits_async(1).await;
        first.assert_hits_async(1).await;
        second.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn only_bogons_resolve_to_none() {
        let server = MockServer::start_async().await;
        mock_miner(
            &server,
            "f05555",
            vec![ip4_multiaddr([192, 168, 1, 10]), dns4_multiaddr("miner.internal")],
        ).await;
        let lookups = server.mock_async(|when, then| {
            when.method(GET).path_contains("/ipinfo/");
            then.status(200).json_body(json!({"bogon": true}));
        }).await;
        let dns = HashMap::from([(
            "miner.internal".to_string(),
            vec!["10.1.2.3".parse().unwrap(), "fd00::5".parse().unwrap()],
        )]);

        let geo = resolver_for(&server, dns);
        assert_eq!(geo.resolve_location("f05555").await.unwrap(), None);
        lookups.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn lookup_bogon_flag_falls_through_to_next_ip() {
        let server = MockServer::start_async().await;
        mock_miner(&server, "f07777", vec![dns4_multiaddr("sp.example.org")]).await;
        server.mock_async(|when, then| {
            when.method(GET).path("/ipinfo/1.1.1.1");
            then.status(200).json_body(json!({"ip": "1.1.1.1", "bogon": true}));
        }).await;
        server.mock_async(|when, then| {
            when.method(GET).path("/ipinfo/9.9.9.9");
            then.status(200).json_body(json!({"ip": "9.9.9.9", "country": "US", "org": "AS19281 Quad9"}));
        }).await;
        let dns = HashMap::from([(
            "sp.example.org".to_string(),
            vec![
                "1.1.1.1".parse().unwrap(),
                "2001:4860::8888".parse().unwrap(),
                "9.9.9.9".parse().unwrap(),
            ],
        )]);

        let geo = resolver_for(&server, dns);
        let location = geo.resolve_location("f07777").await.unwrap().unwrap();
        assert_eq!(location.country.as_deref(), Some("US"));
        assert_eq!(location.org_name.as_deref(), Some("Quad9"));
    }

    #[tokio::test]
    async fn rpc_error_and_missing_multiaddrs_are_not_failures() {
        let server = MockServer::start_async().await;
        server.mock_async(|when, then| {
            when.method(POST).path("/rpc/v0").body_contains("f0404");
            then.status(200).json_body(json!({
                "jsonrpc": "2.0", "id": 1,
                "error": { "code": 1, "message": "actor not found" }
            }));
        }).await;
        server.mock_async(|when, then| {
            when.method(POST).path("/rpc/v0").body_contains("f0999");
            then.status(200).json_body(json!({
                "jsonrpc": "2.0", "id": 1,
                "result": { "PeerId": null, "Multiaddrs": null, "SectorSize": 0 }
            }));
        }).await;
        let geo = resolver_for(&server, HashMap::new());
        assert_eq!(geo.resolve_location("f0404").await.unwrap(), None);
        assert_eq!(geo.resolve_location("f0999").await.unwrap(), None);
    }

    #[tokio::test]
    async fn transient_rpc_failures_are_retried_then_surface() {
        let server = MockServer::start_async().await;
        let rpc = server.mock_async(|when, then| {
            when.method(POST).path("/rpc/v0");
            then.status(502);
        }).await;
        let geo = resolver_for(&server, HashMap::new());
        let err = geo.resolve_location("f01000").await.unwrap_err();
        assert!(matches!(err, GeoError::Rpc(FetchError::HttpStatus { status: 502, .. })));
        rpc.assert_hits_async(3).await;
    }

    #[test]
    fn org_and_loc_parsing() {
        assert_eq!(strip_asn("AS4134 CHINANET-BACKBONE").as_deref(), Some("CHINANET-BACKBONE"));
        assert_eq!(strip_asn("Hetzner Online").as_deref(), Some("Hetzner Online"));
        assert_eq!(strip_asn("AS24940"), None);
        assert_eq!(parse_loc("51.5, -0.12"), Some((51.5, -0.12)));
        assert_eq!(parse_loc("garbage"), None);
    }
}
