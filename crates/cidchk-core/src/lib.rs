//! Core domain model for the DataCap allocation compliance checker.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "cidchk-core";

/// Unix timestamp of the Filecoin mainnet genesis block.
pub const GENESIS_UNIX_SECS: i64 = 1_598_306_400;
pub const EPOCH_DURATION_SECS: i64 = 30;

/// Chain epoch for a wall-clock instant.
pub fn epoch_at(at: DateTime<Utc>) -> i64 {
    (at.timestamp() - GENESIS_UNIX_SECS).div_euclid(EPOCH_DURATION_SECS)
}

/// Chain epoch right now. Recomputed on every call; never cache the result.
pub fn current_epoch() -> i64 {
    epoch_at(Utc::now())
}

/// `value / total`, or zero when the total is zero.
pub fn fraction_of(value: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        value as f64 / total as f64
    }
}

/// One on-chain storage deal. Read-only input; never mutated here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealRecord {
    pub deal_id: u64,
    pub piece_cid: String,
    pub piece_size: u64,
    /// Robust client address (`f1…`), already mapped from the id address.
    pub client: String,
    pub provider: String,
    pub verified_deal: bool,
    pub sector_start_epoch: i64,
    pub end_epoch: i64,
    /// Negative when the deal was never slashed.
    pub slash_epoch: i64,
}

impl DealRecord {
    /// Verified, unslashed, sealed before `epoch` and not yet expired.
    pub fn is_active_at(&self, epoch: i64) -> bool {
        self.verified_deal
            && self.slash_epoch < 0
            && self.sector_start_epoch > 0
            && self.sector_start_epoch < epoch
            && self.end_epoch > epoch
    }
}

/// A single retrieval attempt recorded by the retrieval bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalAttempt {
    pub client: String,
    pub provider: String,
    pub protocol: String,
    pub outcome: String,
    pub attempted_at: DateTime<Utc>,
}

/// Addresses treated as one entity for aggregation. The first address is the
/// one named by the application; the rest are operator-supplied aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientGroup {
    addresses: Vec<String>,
}

impl ClientGroup {
    pub fn new(primary: impl Into<String>, aliases: impl IntoIterator<Item = String>) -> Self {
        let mut addresses: Vec<String> = Vec::new();
        let primary = primary.into().trim().to_string();
        for address in std::iter::once(primary).chain(aliases) {
            let address = address.trim().to_string();
            if !address.is_empty() && !addresses.contains(&address) {
                addresses.push(address);
            }
        }
        Self { addresses }
    }

    pub fn primary(&self) -> &str {
        self.addresses.first().map(String::as_str).unwrap_or_default()
    }

    pub fn others(&self) -> &[String] {
        self.addresses.get(1..).unwrap_or_default()
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.addresses.iter().any(|a| a == address)
    }
}

/// Best-effort geographic position of a storage provider.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Network owner with the leading AS number removed.
    pub org_name: Option<String>,
}

impl Location {
    pub fn has_country(&self) -> bool {
        self.country.as_deref().is_some_and(|c| !c.trim().is_empty())
    }

    /// "City, Region, Country", skipping blank parts.
    pub fn place(&self) -> Option<String> {
        let parts: Vec<&str> = [&self.city, &self.region, &self.country]
            .into_iter()
            .filter_map(|part| part.as_deref())
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDistributionEntry {
    pub provider: String,
    pub total_deal_size: u64,
    pub unique_data_size: u64,
    /// `(total - unique) / total`.
    pub duplication_fraction: f64,
    /// Share of the client group's total sealed bytes.
    pub share: f64,
    pub location: Option<Location>,
    pub is_first_client_for_provider: bool,
}

impl ProviderDistributionEntry {
    pub fn has_known_location(&self) -> bool {
        self.location.as_ref().is_some_and(Location::has_country)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationDistributionEntry {
    pub num_of_replicas: u32,
    pub unique_data_size: u64,
    pub total_deal_size: u64,
    pub share: f64,
}

/// Content also sealed under a different client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidSharingEntry {
    pub other_client_address: String,
    pub unique_cid_count: u64,
    pub total_deal_size: u64,
}

/// Registry view of a DataCap application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub client_address: String,
    pub organization_name: String,
    /// Audit trail URL, usually the application issue.
    pub url: Option<String>,
    pub verifier_name: Option<String>,
    /// `owner/name` parsed from a tracker audit trail URL.
    pub issue_repository: Option<String>,
    pub issue_number: Option<u64>,
}

/// Thresholds applied for one allocation round. Fractions are in `0.0..=1.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriteriaProfile {
    pub max_provider_deal_percentage: f64,
    pub max_duplication_percentage: f64,
    pub low_replica_threshold: u32,
    pub max_percentage_for_low_replica: f64,
    #[serde(default)]
    pub min_retrieval_success_ratio: Option<f64>,
}

impl Default for CriteriaProfile {
    fn default() -> Self {
        Self {
            max_provider_deal_percentage: 0.25,
            max_duplication_percentage: 0.20,
            low_replica_threshold: 3,
            max_percentage_for_low_replica: 0.25,
            min_retrieval_success_ratio: None,
        }
    }
}

/// Attempt count for one provider/protocol/outcome triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalStat {
    pub provider: String,
    pub protocol: String,
    /// `"success"` or the failure code reported by the retrieval bot.
    pub outcome: String,
    pub count: u64,
}

impl RetrievalStat {
    pub const SUCCESS: &'static str = "success";

    pub fn is_success(&self) -> bool {
        self.outcome == Self::SUCCESS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalWeek {
    pub week_start: NaiveDate,
    pub success_count: u64,
    pub total_count: u64,
}

impl RetrievalWeek {
    pub fn success_rate(&self) -> f64 {
        fraction_of(self.success_count, self.total_count)
    }
}

/// Success ratio per transfer protocol, sorted by protocol name.
pub fn protocol_success_ratios(stats: &[RetrievalStat]) -> Vec<(String, f64)> {
    let mut totals: std::collections::BTreeMap<&str, (u64, u64)> = Default::default();
    for stat in stats {
        let entry = totals.entry(stat.protocol.as_str()).or_default();
        entry.1 += stat.count;
        if stat.is_success() {
            entry.0 += stat.count;
        }
    }
    totals
        .into_iter()
        .map(|(protocol, (ok, total))| (protocol.to_string(), fraction_of(ok, total)))
        .collect()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("issue number must be positive")]
    MissingIssueNumber,
    #[error("repository must be `owner/name`, got `{0}`")]
    InvalidRepository(String),
    #[error("`{0}` is not a filecoin address")]
    InvalidAddress(String),
}

/// One check invocation, decoupled from the issue tracker's webhook payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub issue_number: u64,
    /// `owner/name` of the repository holding the issue.
    pub repository: String,
    #[serde(default)]
    pub issue_title: String,
    #[serde(default)]
    pub issue_body: String,
    #[serde(default)]
    pub other_addresses: Vec<String>,
}

impl CheckRequest {
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.issue_number == 0 {
            return Err(RequestError::MissingIssueNumber);
        }
        let mut parts = self.repository.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => {}
            _ => return Err(RequestError::InvalidRepository(self.repository.clone())),
        }
        for address in &self.other_addresses {
            if !looks_like_address(address) {
                return Err(RequestError::InvalidAddress(address.clone()));
            }
        }
        Ok(())
    }

    pub fn owner(&self) -> &str {
        self.repository.split('/').next().unwrap_or_default()
    }

    pub fn repo(&self) -> &str {
        self.repository.split('/').nth(1).unwrap_or_default()
    }
}

/// Cheap shape check for `f1…`/`t3…`-style addresses.
pub fn looks_like_address(address: &str) -> bool {
    let mut chars = address.chars();
    matches!(chars.next(), Some('f' | 't'))
        && matches!(chars.next(), Some('0'..='4'))
        && address.len() > 2
        && address.chars().all(|c| c.is_ascii_alphanumeric())
}
