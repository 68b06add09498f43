//! Aggregation Store Client: deal-history and retrieval-metrics queries.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate};
use cidchk_core::{
    current_epoch, fraction_of, CidSharingEntry, ClientGroup, DealRecord, ProviderDistributionEntry,
    ReplicationDistributionEntry, RetrievalAttempt, RetrievalStat, RetrievalWeek,
};
use cidchk_storage::{RetryDisposition, RetryPolicy, Retryable};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("query `{query}` failed: {source}")]
    Query {
        query: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("connecting to store: {0}")]
    Connect(#[source] sqlx::Error),
}

impl Retryable for StoreError {
    fn disposition(&self) -> RetryDisposition {
        let source = match self {
            StoreError::Query { source, .. } | StoreError::Connect(source) => source,
        };
        match source {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::WorkerCrashed => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }
}

/// Which deals count when deciding whether a client group was a provider's first client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NewProviderScope {
    /// Only other clients' deals that are still active.
    #[default]
    ActiveDeals,
    /// Every sealed deal the provider ever made.
    FullHistory,
}

impl FromStr for NewProviderScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active-deals" | "active" => Ok(Self::ActiveDeals),
            "full-history" | "full" => Ok(Self::FullHistory),
            other => Err(format!("unknown new-provider scope `{other}`")),
        }
    }
}

#[async_trait]
pub trait DealStore: Send + Sync {
    async fn provider_distribution(
        &self,
        group: &ClientGroup,
        epoch: i64,
    ) -> Result<Vec<ProviderDistributionEntry>, StoreError>;

    async fn replication_distribution(
        &self,
        group: &ClientGroup,
        epoch: i64,
    ) -> Result<Vec<ReplicationDistributionEntry>, StoreError>;

    async fn cid_sharing(&self, group: &ClientGroup) -> Result<Vec<CidSharingEntry>, StoreError>;
}

#[async_trait]
pub trait RetrievalStore: Send + Sync {
    async fn retrieval_stats(&self, group: &ClientGroup) -> Result<Vec<RetrievalStat>, StoreError>;

    async fn retrieval_weeks(&self, group: &ClientGroup) -> Result<Vec<RetrievalWeek>, StoreError>;
}

/// Provider aggregate before shares are derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderTotals {
    pub provider: String,
    pub total_deal_size: u64,
    pub unique_data_size: u64,
    pub is_new: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaTotals {
    pub num_of_replicas: u32,
    pub total_deal_size: u64,
    pub unique_data_size: u64,
}

/// Derive duplication and share fractions. Empty input yields empty output.
pub fn provider_distribution(rows: Vec<ProviderTotals>) -> Vec<ProviderDistributionEntry> {
    let total: u64 = rows.iter().map(|r| r.total_deal_size).sum();
    rows.into_iter()
        .map(|row| ProviderDistributionEntry {
            duplication_fraction: fraction_of(
                row.total_deal_size.saturating_sub(row.unique_data_size),
                row.total_deal_size,
            ),
            share: fraction_of(row.total_deal_size, total),
            provider: row.provider,
            total_deal_size: row.total_deal_size,
            unique_data_size: row.unique_data_size,
            location: None,
            is_first_client_for_provider: row.is_new,
        })
        .collect()
}

pub fn replication_distribution(rows: Vec<ReplicaTotals>) -> Vec<ReplicationDistributionEntry> {
    let total: u64 = rows.iter().map(|r| r.total_deal_size).sum();
    rows.into_iter()
        .map(|row| ReplicationDistributionEntry {
            num_of_replicas: row.num_of_replicas.max(1),
            unique_data_size: row.unique_data_size.min(row.total_deal_size),
            total_deal_size: row.total_deal_size,
            share: fraction_of(row.total_deal_size, total),
        })
        .collect()
}

/// Monday of the week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - ChronoDuration::days(i64::from(date.weekday().num_days_from_monday()))
}

const ACTIVE_DEALS_CTE: &str = r#"
    active AS (
        SELECT cs.provider, cs.piece_cid, cs.piece_size, cs.sector_start_epoch
          FROM current_state cs
          JOIN client_mapping cm ON cs.client = cm.client
         WHERE cm.client_address = ANY($1)
           AND cs.verified_deal = true
           AND cs.slash_epoch < 0
           AND cs.sector_start_epoch > 0
           AND cs.sector_start_epoch < $2
           AND cs.end_epoch > $2
    )"#;

/// Postgres-backed deal store over the `current_state` and `client_mapping` tables.
#[derive(Debug, Clone)]
pub struct PgDealStore {
    pool: PgPool,
    new_provider_scope: NewProviderScope,
}

impl PgDealStore {
    pub fn new(pool: PgPool, new_provider_scope: NewProviderScope) -> Self {
        Self {
            pool,
            new_provider_scope,
        }
    }

    pub async fn connect(database_url: &str, scope: NewProviderScope) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(StoreError::Connect)?;
        Ok(Self::new(pool, scope))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DealStore for PgDealStore {
    async fn provider_distribution(
        &self,
        group: &ClientGroup,
        epoch: i64,
    ) -> Result<Vec<ProviderDistributionEntry>, StoreError> {
        const QUERY: &str = "provider_distribution";
        let sql = format!(
            r#"
            WITH {ACTIVE_DEALS_CTE},
            provider_pieces AS (
                SELECT provider, piece_cid,
                       SUM(piece_size) AS total_deal_size,
                       MIN(piece_size) AS piece_size,
                       MIN(sector_start_epoch) AS first_epoch
                  FROM active
                 GROUP BY provider, piece_cid
            ),
            providers AS (
                SELECT provider,
                       SUM(total_deal_size)::BIGINT AS total_deal_size,
                       SUM(piece_size)::BIGINT AS unique_data_size,
                       MIN(first_epoch) AS first_epoch
                  FROM provider_pieces
                 GROUP BY provider
            )
            SELECT p.provider, p.total_deal_size, p.unique_data_size,
                   NOT EXISTS (
                       SELECT 1
                         FROM current_state other
                         JOIN client_mapping om ON other.client = om.client
                        WHERE other.provider = p.provider
                          AND NOT (om.client_address = ANY($1))
                          AND other.sector_start_epoch > 0
                          AND other.sector_start_epoch < p.first_epoch
                          AND ($3 OR (other.verified_deal = true
                                      AND other.slash_epoch < 0
                                      AND other.end_epoch > $2))
                   ) AS is_new
              FROM providers p
             ORDER BY p.total_deal_size DESC, p.provider
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(group.addresses().to_vec())
            .bind(epoch)
            .bind(self.new_provider_scope == NewProviderScope::FullHistory)
            .fetch_all(&self.pool)
            .await
            .map_err(|source| StoreError::Query { query: QUERY, source })?;

        let mut totals = Vec::with_capacity(rows.len());
        for row in rows {
            let decode = |source| StoreError::Query { query: QUERY, source };
            totals.push(ProviderTotals {
                provider: row.try_get("provider").map_err(decode)?,
                total_deal_size: row.try_get::<i64, _>("total_deal_size").map_err(decode)?.max(0) as u64,
                unique_data_size: row.try_get::<i64, _>("unique_data_size").map_err(decode)?.max(0) as u64,
                is_new: row.try_get("is_new").map_err(decode)?,
            });
        }
        debug!(rows = totals.len(), epoch, "provider distribution fetched");
        Ok(provider_distribution(totals))
    }

    async fn replication_distribution(
        &self,
        group: &ClientGroup,
        epoch: i64,
    ) -> Result<Vec<ReplicationDistributionEntry>, StoreError> {
        const QUERY: &str = "replication_distribution";
        let sql = format!(
            r#"
            WITH {ACTIVE_DEALS_CTE},
            replicas AS (
                SELECT piece_cid,
                       COUNT(DISTINCT provider) AS num_of_replicas,
                       SUM(piece_size) AS total_deal_size,
                       MAX(piece_size) AS piece_size
                  FROM active
                 GROUP BY piece_cid
            )
            SELECT num_of_replicas::INT AS num_of_replicas,
                   SUM(total_deal_size)::BIGINT AS total_deal_size,
                   SUM(piece_size)::BIGINT AS unique_data_size
              FROM replicas
             GROUP BY num_of_replicas
             ORDER BY num_of_replicas ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(group.addresses().to_vec())
            .bind(epoch)
            .fetch_all(&self.pool)
            .await
            .map_err(|source| StoreError::Query { query: QUERY, source })?;

        let mut totals = Vec::with_capacity(rows.len());
        for row in rows {
            let decode = |source| StoreError::Query { query: QUERY, source };
            totals.push(ReplicaTotals {
                num_of_replicas: row.try_get::<i32, _>("num_of_replicas").map_err(decode)?.max(1) as u32,
                total_deal_size: row.try_get::<i64, _>("total_deal_size").map_err(decode)?.max(0) as u64,
                unique_data_size: row.try_get::<i64, _>("unique_data_size").map_err(decode)?.max(0) as u64,
            });
        }
        Ok(replication_distribution(totals))
    }

    async fn cid_sharing(&self, group: &ClientGroup) -> Result<Vec<CidSharingEntry>, StoreError> {
        const QUERY: &str = "cid_sharing";
        let rows = sqlx::query(
            r#"
            WITH cids AS (
                SELECT DISTINCT cs.piece_cid
                  FROM current_state cs
                  JOIN client_mapping cm ON cs.client = cm.client
                 WHERE cm.client_address = ANY($1)
                   AND cs.verified_deal = true
            )
            SELECT cm.client_address AS other_client_address,
                   SUM(cs.piece_size)::BIGINT AS total_deal_size,
                   COUNT(DISTINCT cs.piece_cid)::BIGINT AS unique_cid_count
              FROM cids
              JOIN current_state cs ON cs.piece_cid = cids.piece_cid
              JOIN client_mapping cm ON cs.client = cm.client
             WHERE NOT (cm.client_address = ANY($1))
             GROUP BY cm.client_address
             ORDER BY total_deal_size DESC, other_client_address
            "#,
        )
        .bind(group.addresses().to_vec())
        .fetch_all(&self.pool)
        .await
        .map_err(|source| StoreError::Query { query: QUERY, source })?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let decode = |source| StoreError::Query { query: QUERY, source };
            out.push(CidSharingEntry {
                other_client_address: row.try_get("other_client_address").map_err(decode)?,
                total_deal_size: row.try_get::<i64, _>("total_deal_size").map_err(decode)?.max(0) as u64,
                unique_cid_count: row.try_get::<i64, _>("unique_cid_count").map_err(decode)?.max(0) as u64,
            });
        }
        Ok(out)
    }
}

/// Postgres-backed retrieval metrics over the `retrieval_attempts` table.
#[derive(Debug, Clone)]
pub struct PgRetrievalStore {
    pool: PgPool,
}

impl PgRetrievalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RetrievalStore for PgRetrievalStore {
    async fn retrieval_stats(&self, group: &ClientGroup) -> Result<Vec<RetrievalStat>, StoreError> {
        const QUERY: &str = "retrieval_stats";
        let rows = sqlx::query(
            r#"
            SELECT provider, protocol, outcome, COUNT(*)::BIGINT AS count
              FROM retrieval_attempts
             WHERE client_address = ANY($1)
             GROUP BY provider, protocol, outcome
             ORDER BY provider, protocol, outcome
            "#,
        )
        .bind(group.addresses().to_vec())
        .fetch_all(&self.pool)
        .await
        .map_err(|source| StoreError::Query { query: QUERY, source })?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let decode = |source| StoreError::Query { query: QUERY, source };
            out.push(RetrievalStat {
                provider: row.try_get("provider").map_err(decode)?,
                protocol: row.try_get("protocol").map_err(decode)?,
                outcome: row.try_get("outcome").map_err(decode)?,
                count: row.try_get::<i64, _>("count").map_err(decode)?.max(0) as u64,
            });
        }
        Ok(out)
    }

    async fn retrieval_weeks(&self, group: &ClientGroup) -> Result<Vec<RetrievalWeek>, StoreError> {
        const QUERY: &str = "retrieval_weeks";
        let rows = sqlx::query(
            r#"
            SELECT date_trunc('week', attempted_at)::DATE AS week_start,
                   (COUNT(*) FILTER (WHERE outcome = 'success'))::BIGINT AS success_count,
                   COUNT(*)::BIGINT AS total_count
              FROM retrieval_attempts
             WHERE client_address = ANY($1)
             GROUP BY 1
             ORDER BY 1
            "#,
        )
        .bind(group.addresses().to_vec())
        .fetch_all(&self.pool)
        .await
        .map_err(|source| StoreError::Query { query: QUERY, source })?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let decode = |source| StoreError::Query { query: QUERY, source };
            out.push(RetrievalWeek {
                week_start: row.try_get("week_start").map_err(decode)?,
                success_count: row.try_get::<i64, _>("success_count").map_err(decode)?.max(0) as u64,
                total_count: row.try_get::<i64, _>("total_count").map_err(decode)?.max(0) as u64,
            });
        }
        Ok(out)
    }
}

/// In-process store over deal and retrieval records, used for fixtures and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    pub deals: Vec<DealRecord>,
    pub attempts: Vec<RetrievalAttempt>,
    pub new_provider_scope: NewProviderScope,
}

impl MemoryStore {
    pub fn new(deals: Vec<DealRecord>) -> Self {
        Self {
            deals,
            ..Default::default()
        }
    }

    fn active<'a>(&'a self, group: &'a ClientGroup, epoch: i64) -> impl Iterator<Item = &'a DealRecord> {
        self.deals
            .iter()
            .filter(move |d| group.contains(&d.client) && d.is_active_at(epoch))
    }
}

#[async_trait]
impl DealStore for MemoryStore {
    async fn provider_distribution(
        &self,
        group: &ClientGroup,
        epoch: i64,
    ) -> Result<Vec<ProviderDistributionEntry>, StoreError> {
        // provider -> piece -> (sum, min), plus first sealing epoch
        let mut pieces: BTreeMap<&str, BTreeMap<&str, (u64, u64)>> = BTreeMap::new();
        let mut first_epoch: HashMap<&str, i64> = HashMap::new();
        for deal in self.active(group, epoch) {
            let entry = pieces
                .entry(deal.provider.as_str())
                .or_default()
                .entry(deal.piece_cid.as_str())
                .or_insert((0, u64::MAX));
            entry.0 += deal.piece_size;
            entry.1 = entry.1.min(deal.piece_size);
            let first = first_epoch.entry(deal.provider.as_str()).or_insert(i64::MAX);
            *first = (*first).min(deal.sector_start_epoch);
        }

        let full_history = self.new_provider_scope == NewProviderScope::FullHistory;
        let mut totals: Vec<ProviderTotals> = pieces
            .into_iter()
            .map(|(provider, pieces)| {
                let first = first_epoch.get(provider).copied().unwrap_or(i64::MAX);
                let served_earlier = self.deals.iter().any(|other| {
                    other.provider == provider
                        && !group.contains(&other.client)
                        && other.sector_start_epoch > 0
                        && other.sector_start_epoch < first
                        && (full_history
                            || (other.verified_deal && other.slash_epoch < 0 && other.end_epoch > epoch))
                });
                ProviderTotals {
                    provider: provider.to_string(),
                    total_deal_size: pieces.values().map(|(sum, _)| sum).sum(),
                    unique_data_size: pieces.values().map(|(_, min)| min).sum(),
                    is_new: !served_earlier,
                }
            })
            .collect();
        totals.sort_by(|a, b| {
            b.total_deal_size
                .cmp(&a.total_deal_size)
                .then_with(|| a.provider.cmp(&b.provider))
        });
        Ok(provider_distribution(totals))
    }

    async fn replication_distribution(
        &self,
        group: &ClientGroup,
        epoch: i64,
    ) -> Result<Vec<ReplicationDistributionEntry>, StoreError> {
        // piece -> (providers, sum, max)
        let mut pieces: HashMap<&str, (BTreeSet<&str>, u64, u64)> = HashMap::new();
        for deal in self.active(group, epoch) {
            let entry = pieces.entry(deal.piece_cid.as_str()).or_default();
            entry.0.insert(deal.provider.as_str());
            entry.1 += deal.piece_size;
            entry.2 = entry.2.max(deal.piece_size);
        }
        let mut buckets: BTreeMap<u32, (u64, u64)> = BTreeMap::new();
        for (providers, total, piece_size) in pieces.into_values() {
            let bucket = buckets.entry(providers.len() as u32).or_default();
            bucket.0 += total;
            bucket.1 += piece_size;
        }
        Ok(replication_distribution(
            buckets
                .into_iter()
                .map(|(num_of_replicas, (total_deal_size, unique_data_size))| ReplicaTotals {
                    num_of_replicas,
                    total_deal_size,
                    unique_data_size,
                })
                .collect(),
        ))
    }

    async fn cid_sharing(&self, group: &ClientGroup) -> Result<Vec<CidSharingEntry>, StoreError> {
        let cids: BTreeSet<&str> = self
            .deals
            .iter()
            .filter(|d| group.contains(&d.client) && d.verified_deal)
            .map(|d| d.piece_cid.as_str())
            .collect();
        let mut shared: BTreeMap<&str, (u64, BTreeSet<&str>)> = BTreeMap::new();
        for deal in &self.deals {
            if group.contains(&deal.client) || !cids.contains(deal.piece_cid.as_str()) {
                continue;
            }
            let entry = shared.entry(deal.client.as_str()).or_default();
            entry.0 += deal.piece_size;
            entry.1.insert(deal.piece_cid.as_str());
        }
        let mut out: Vec<CidSharingEntry> = shared
            .into_iter()
            .map(|(client, (total, pieces))| CidSharingEntry {
                other_client_address: client.to_string(),
                unique_cid_count: pieces.len() as u64,
                total_deal_size: total,
            })
            .collect();
        out.sort_by(|a, b| {
            b.total_deal_size
                .cmp(&a.total_deal_size)
                .then_with(|| a.other_client_address.cmp(&b.other_client_address))
        });
        Ok(out)
    }
}

#[async_trait]
impl RetrievalStore for MemoryStore {
    async fn retrieval_stats(&self, group: &ClientGroup) -> Result<Vec<RetrievalStat>, StoreError> {
        let mut counts: BTreeMap<(&str, &str, &str), u64> = BTreeMap::new();
        for attempt in self.attempts.iter().filter(|a| group.contains(&a.client)) {
            *counts
                .entry((attempt.provider.as_str(), attempt.protocol.as_str(), attempt.outcome.as_str()))
                .or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((provider, protocol, outcome), count)| RetrievalStat {
                provider: provider.to_string(),
                protocol: protocol.to_string(),
                outcome: outcome.to_string(),
                count,
            })
            .collect())
    }

    async fn retrieval_weeks(&self, group: &ClientGroup) -> Result<Vec<RetrievalWeek>, StoreError> {
        let mut weeks: BTreeMap<NaiveDate, (u64, u64)> = BTreeMap::new();
        for attempt in self.attempts.iter().filter(|a| group.contains(&a.client)) {
            let week = weeks.entry(week_start(attempt.attempted_at.date_naive())).or_default();
            week.1 += 1;
            if attempt.outcome == RetrievalStat::SUCCESS {
                week.0 += 1;
            }
        }
        Ok(weeks
            .into_iter()
            .map(|(week_start, (success_count, total_count))| RetrievalWeek {
                week_start,
                success_count,
                total_count,
            })
            .collect())
    }
}

/// The aggregation surface the orchestrator talks to. Every call runs under the
/// shared retry policy and computes a fresh chain epoch.
#[derive(Clone)]
pub struct AggregationClient {
    deals: Arc<dyn DealStore>,
    retrievals: Arc<dyn RetrievalStore>,
    retry: RetryPolicy,
}

impl AggregationClient {
    pub fn new(deals: Arc<dyn DealStore>, retrievals: Arc<dyn RetrievalStore>, retry: RetryPolicy) -> Self {
        Self {
            deals,
            retrievals,
            retry,
        }
    }

    pub async fn get_provider_distribution(
        &self,
        group: &ClientGroup,
    ) -> Result<Vec<ProviderDistributionEntry>, StoreError> {
        let epoch = current_epoch();
        self.retry
            .run("provider_distribution", || self.deals.provider_distribution(group, epoch))
            .await
    }

    pub async fn get_replication_distribution(
        &self,
        group: &ClientGroup,
    ) -> Result<Vec<ReplicationDistributionEntry>, StoreError> {
        let epoch = current_epoch();
        self.retry
            .run("replication_distribution", || {
                self.deals.replication_distribution(group, epoch)
            })
            .await
    }

    pub async fn get_cid_sharing(&self, group: &ClientGroup) -> Result<Vec<CidSharingEntry>, StoreError> {
        self.retry
            .run("cid_sharing", || self.deals.cid_sharing(group))
            .await
    }

    pub async fn get_retrieval_stats(&self, group: &ClientGroup) -> Result<Vec<RetrievalStat>, StoreError> {
        self.retry
            .run("retrieval_stats", || self.retrievals.retrieval_stats(group))
            .await
    }

    pub async fn get_retrieval_time_series(
        &self,
        group: &ClientGroup,
    ) -> Result<Vec<RetrievalWeek>, StoreError> {
        self.retry
            .run("retrieval_weeks", || self.retrievals.retrieval_weeks(group))
            .await
    }
}
