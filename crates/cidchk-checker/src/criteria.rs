//! Criteria Engine: round-based profile selection and metric evaluation.

use std::collections::BTreeSet;

use cidchk_core::{
    protocol_success_ratios, CidSharingEntry, CriteriaProfile, ProviderDistributionEntry,
    ReplicationDistributionEntry, RetrievalStat,
};
use serde::Serialize;

/// Profile for an allocation round: `profiles[min(round - 1, len - 1)]`.
/// Round 0 maps to the first profile; `None` only when no profiles exist.
pub fn select_profile(profiles: &[CriteriaProfile], round: u32) -> Option<&CriteriaProfile> {
    let last = profiles.len().checked_sub(1)?;
    let index = (round.saturating_sub(1) as usize).min(last);
    profiles.get(index)
}

/// Whether the round is still on a profile earlier than the last one.
pub fn is_relaxed(profiles: &[CriteriaProfile], round: u32) -> bool {
    (round as usize) < profiles.len()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    ProviderShareExceeded {
        provider: String,
        share: f64,
        limit: f64,
    },
    DuplicationExceeded {
        provider: String,
        duplication: f64,
        limit: f64,
    },
    UnknownLocation {
        provider: String,
    },
    NoGeographicDiversity {
        distinct_locations: usize,
    },
    LowReplicaShareExceeded {
        share: f64,
        threshold: u32,
        limit: f64,
    },
    CidSharingObserved {
        other_clients: usize,
    },
    RetrievalBelowMinimum {
        protocol: String,
        ratio: f64,
        minimum: f64,
    },
}

impl Finding {
    pub fn section(&self) -> Section {
        match self {
            Finding::ProviderShareExceeded { .. }
            | Finding::DuplicationExceeded { .. }
            | Finding::UnknownLocation { .. }
            | Finding::NoGeographicDiversity { .. } => Section::ProviderDistribution,
            Finding::LowReplicaShareExceeded { .. } => Section::Replication,
            Finding::CidSharingObserved { .. } => Section::CidSharing,
            Finding::RetrievalBelowMinimum { .. } => Section::Retrieval,
        }
    }

    pub fn provider(&self) -> Option<&str> {
        match self {
            Finding::ProviderShareExceeded { provider, .. }
            | Finding::DuplicationExceeded { provider, .. }
            | Finding::UnknownLocation { provider } => Some(provider),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    ProviderDistribution,
    Replication,
    CidSharing,
    Retrieval,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub findings: Vec<Finding>,
    pub low_replica_share: f64,
    pub distinct_locations: usize,
}

impl Evaluation {
    pub fn passes(&self, section: Section) -> bool {
        !self.findings.iter().any(|f| f.section() == section)
    }

    pub fn for_provider<'a>(&'a self, provider: &'a str) -> impl Iterator<Item = &'a Finding> + 'a {
        self.findings.iter().filter(move |f| f.provider() == Some(provider))
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Every metric is checked; nothing short-circuits.
pub fn evaluate(
    profile: &CriteriaProfile,
    providers: &[ProviderDistributionEntry],
    replication: &[ReplicationDistributionEntry],
    sharing: &[CidSharingEntry],
    retrieval: &[RetrievalStat],
) -> Evaluation {
    let mut findings = Vec::new();

    for entry in providers {
        if entry.share > profile.max_provider_deal_percentage {
            findings.push(Finding::ProviderShareExceeded {
                provider: entry.provider.clone(),
                share: entry.share,
                limit: profile.max_provider_deal_percentage,
            });
        }
        if entry.duplication_fraction > profile.max_duplication_percentage {
            findings.push(Finding::DuplicationExceeded {
                provider: entry.provider.clone(),
                duplication: entry.duplication_fraction,
                limit: profile.max_duplication_percentage,
            });
        }
        if !entry.has_known_location() {
            findings.push(Finding::UnknownLocation {
                provider: entry.provider.clone(),
            });
        }
    }

    let distinct_locations = providers
        .iter()
        .filter(|entry| entry.has_known_location())
        .filter_map(|entry| entry.location.as_ref().and_then(|l| l.place()))
        .collect::<BTreeSet<_>>()
        .len();
    if distinct_locations <= 1 {
        findings.push(Finding::NoGeographicDiversity { distinct_locations });
    }

    let low_replica_share: f64 = replication
        .iter()
        .filter(|bucket| bucket.num_of_replicas <= profile.low_replica_threshold)
        .map(|bucket| bucket.share)
        .sum();
    if low_replica_share > profile.max_percentage_for_low_replica {
        findings.push(Finding::LowReplicaShareExceeded {
            share: low_replica_share,
            threshold: profile.low_replica_threshold,
            limit: profile.max_percentage_for_low_replica,
        });
    }

    if !sharing.is_empty() {
        findings.push(Finding::CidSharingObserved {
            other_clients: sharing.len(),
        });
    }

    if let Some(minimum) = profile.min_retrieval_success_ratio {
        for (protocol, ratio) in protocol_success_ratios(retrieval) {
            if ratio < minimum {
                findings.push(Finding::RetrievalBelowMinimum {
                    protocol,
                    ratio,
                    minimum,
                });
            }
        }
    }

    Evaluation {
        findings,
        low_replica_share,
        distinct_locations,
    }
}
