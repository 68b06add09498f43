//! Report Synthesizer: full report, condensed summary, retrieval report and
//! the fixed-template reports for aborted checks.

use cidchk_core::{
    protocol_success_ratios, ApplicationInfo, CidSharingEntry, ClientGroup, CriteriaProfile,
    ProviderDistributionEntry, ReplicationDistributionEntry, RetrievalStat, RetrievalWeek,
};
use serde::Serialize;

use crate::criteria::{Evaluation, Finding, Section};
use crate::markdown::{gfm_table, iec_bytes, link, percent, provider_link, thousands, wrap_in_code, Align};

pub const REPORT_TITLE: &str = "## DataCap and CID Checker Report";
const WARNING: &str = "⚠️";
const OK: &str = "✅";

/// A client that shares piece CIDs with the checked group, annotated with
/// its own registry entry and approval history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OtherClient {
    pub entry: CidSharingEntry,
    pub application: Option<ApplicationInfo>,
    pub approvers: Vec<(String, usize)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChartLinks {
    pub provider_distribution: Option<String>,
    pub provider_map: Option<String>,
    pub replication: Option<String>,
    pub retrieval: Option<String>,
}

/// Everything a report needs, already fetched and evaluated.
#[derive(Debug, Clone)]
pub struct ReportData {
    pub application: ApplicationInfo,
    pub project_name: Option<String>,
    pub group: ClientGroup,
    pub round: u32,
    pub relaxed: bool,
    pub profile: CriteriaProfile,
    pub approvers: Vec<(String, usize)>,
    pub providers: Vec<ProviderDistributionEntry>,
    pub replication: Vec<ReplicationDistributionEntry>,
    pub sharing: Vec<OtherClient>,
    pub retrieval_stats: Vec<RetrievalStat>,
    pub retrieval_weeks: Vec<RetrievalWeek>,
    pub evaluation: Evaluation,
    pub charts: ChartLinks,
    pub fake_links: bool,
}

/// Why a check stopped before producing a compliance report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    NoPreviousAllocation,
    InvalidClientAddress,
    ApplicationNotFound { client_address: String },
    NoActiveDeals { addresses: Vec<String> },
}

/// Providers ordered by resolved network owner, unknown owners last.
pub fn sort_for_presentation(providers: &mut [ProviderDistributionEntry]) {
    providers.sort_by(|a, b| {
        let key = |p: &ProviderDistributionEntry| {
            p.location
                .as_ref()
                .and_then(|l| l.org_name.clone())
                .map(|org| org.to_lowercase())
        };
        match (key(a), key(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
        .then_with(|| a.provider.cmp(&b.provider))
    });
}

/// The one-line warning for a finding. Each line carries the exact metric
/// that triggered it.
pub fn warning_line(finding: &Finding, fake_links: bool) -> String {
    match finding {
        Finding::ProviderShareExceeded { provider, share, .. } => format!(
            "{WARNING} {} has sealed {} of total datacap.",
            provider_link(provider, fake_links),
            percent(*share)
        ),
        Finding::DuplicationExceeded {
            provider,
            duplication,
            ..
        } => format!(
            "{WARNING} {} has sealed {} duplicate data.",
            provider_link(provider, fake_links),
            percent(*duplication)
        ),
        Finding::UnknownLocation { provider } => format!(
            "{WARNING} {} has unknown IP location.",
            provider_link(provider, fake_links)
        ),
        Finding::NoGeographicDiversity { .. } => {
            format!("{WARNING} All storage providers are located in the same region.")
        }
        Finding::LowReplicaShareExceeded { share, threshold, .. } => format!(
            "{WARNING} {} of deals are for data replicated across less than {} storage providers.",
            percent(*share),
            threshold + 1
        ),
        Finding::CidSharingObserved { .. } => format!("{WARNING} CID sharing has been observed."),
        Finding::RetrievalBelowMinimum {
            protocol,
            ratio,
            minimum,
        } => format!(
            "{WARNING} {protocol} retrieval success rate is {}, below the expected {}.",
            percent(*ratio),
            percent(*minimum)
        ),
    }
}

fn push_header(content: &mut Vec<String>, data: &ReportData) {
    content.push(REPORT_TITLE.to_string());
    content.push(format!(
        " - Organization: {}",
        wrap_in_code(&data.application.organization_name)
    ));
    if let Some(project) = data.project_name.as_deref().filter(|p| !p.is_empty()) {
        content.push(format!(" - Project: {}", wrap_in_code(project)));
    }
    content.push(format!(" - Client: {}", wrap_in_code(data.group.primary())));
    if let Some(url) = &data.application.url {
        content.push(format!(" - Application: {}", link("audit trail", url, data.fake_links)));
    }
    content.push(format!(" - Allocation round: {}", data.round));
    if data.approvers.is_empty() {
        content.push(" - Approvers: none recorded".to_string());
    } else {
        content.push(" - Approvers:".to_string());
        for (login, count) in &data.approvers {
            content.push(format!("   - {}: {count}", wrap_in_code(login)));
        }
    }
    content.push(String::new());

    if data.group.len() > 1 {
        content.push("### Other Addresses".to_string());
        content.push("The below addresses are checked together with the client address above.".to_string());
        for address in data.group.others() {
            content.push(format!(" - {}", wrap_in_code(address)));
        }
        content.push(String::new());
    }
}

fn push_relaxed_note(content: &mut Vec<String>, data: &ReportData) {
    if data.relaxed {
        content.push(format!(
            "Since this is allocation round {}, the restrictions below are relaxed. Later rounds use stricter thresholds.",
            data.round
        ));
    } else {
        content.push("For most of the datacap application, below restrictions should apply.".to_string());
    }
}

fn push_chart(content: &mut Vec<String>, alt: &str, url: Option<&String>) {
    if let Some(url) = url {
        content.push(format!("![{alt}]({url})"));
        content.push(String::new());
    }
}

fn location_cell(entry: &ProviderDistributionEntry) -> String {
    let location = entry.location.as_ref();
    let place = location
        .and_then(|l| l.place())
        .filter(|_| entry.has_known_location())
        .unwrap_or_else(|| "Unknown".to_string());
    match location.and_then(|l| l.org_name.as_deref()) {
        Some(org) => format!("{place}<br/>`{org}`"),
        None => place,
    }
}

fn push_provider_section(content: &mut Vec<String>, data: &ReportData) {
    let profile = &data.profile;
    content.push("### Storage Provider Distribution".to_string());
    content.push(
        "The below table shows the distribution of storage providers that have stored data for this client."
            .to_string(),
    );
    content.push(String::new());
    content.push(
        "If this is the first time a provider takes verified deal, it will be marked as `new`.".to_string(),
    );
    content.push(String::new());
    push_relaxed_note(content, data);
    content.push(format!(
        " - Storage provider should not exceed {} of total datacap.",
        percent(profile.max_provider_deal_percentage)
    ));
    content.push(format!(
        " - Storage provider should not be storing duplicate data for more than {}.",
        percent(profile.max_duplication_percentage)
    ));
    content.push(" - Storage provider should have published its public IP address.".to_string());
    content.push(" - All storage providers should be located in different regions.".to_string());
    content.push(String::new());

    for provider in &data.providers {
        for finding in data.evaluation.for_provider(&provider.provider) {
            content.push(warning_line(finding, data.fake_links));
            content.push(String::new());
        }
    }
    for finding in &data.evaluation.findings {
        if matches!(finding, Finding::NoGeographicDiversity { .. }) {
            content.push(warning_line(finding, data.fake_links));
            content.push(String::new());
        }
    }

    let rows: Vec<Vec<String>> = data
        .providers
        .iter()
        .map(|p| {
            let mut name = provider_link(&p.provider, data.fake_links);
            if p.is_first_client_for_provider {
                name.push_str(" `new`");
            }
            vec![
                name,
                location_cell(p),
                iec_bytes(p.total_deal_size),
                percent(p.share),
                iec_bytes(p.unique_data_size),
                percent(p.duplication_fraction),
            ]
        })
        .collect();
    content.push(gfm_table(
        &[
            ("Provider", Align::Left),
            ("Location", Align::Right),
            ("Total Deals Sealed", Align::Right),
            ("Percentage", Align::Right),
            ("Unique Data", Align::Right),
            ("Duplicate Deals", Align::Right),
        ],
        &rows,
    ));
    content.push(String::new());
    push_chart(content, "Provider Distribution", data.charts.provider_distribution.as_ref());
    push_chart(content, "Provider Locations", data.charts.provider_map.as_ref());
}

fn push_replication_section(content: &mut Vec<String>, data: &ReportData) {
    let profile = &data.profile;
    content.push("### Deal Data Replication".to_string());
    content.push(
        "The below table shows how each many unique data are replicated across storage providers.".to_string(),
    );
    content.push(String::new());
    push_relaxed_note(content, data);
    content.push(format!(
        " - No more than {} of unique data are stored with less than {} providers.",
        percent(profile.max_percentage_for_low_replica),
        profile.low_replica_threshold + 1
    ));
    content.push(String::new());

    for finding in &data.evaluation.findings {
        if finding.section() == Section::Replication {
            content.push(warning_line(finding, data.fake_links));
            content.push(String::new());
        }
    }

    let rows: Vec<Vec<String>> = data
        .replication
        .iter()
        .map(|b| {
            vec![
                iec_bytes(b.unique_data_size),
                iec_bytes(b.total_deal_size),
                b.num_of_replicas.to_string(),
                percent(b.share),
            ]
        })
        .collect();
    content.push(gfm_table(
        &[
            ("Unique Data Size", Align::Right),
            ("Total Deals Made", Align::Right),
            ("Number of Providers", Align::Right),
            ("Deal Percentage", Align::Right),
        ],
        &rows,
    ));
    content.push(String::new());
    push_chart(content, "Replication Distribution", data.charts.replication.as_ref());
}

fn approvers_cell(approvers: &[(String, usize)]) -> String {
    approvers
        .iter()
        .map(|(login, count)| format!("`{login}`: {count}"))
        .collect::<Vec<_>>()
        .join("<br/>")
}

fn push_sharing_section(content: &mut Vec<String>, data: &ReportData) {
    content.push("### Deal Data Shared with other Clients".to_string());
    content.push("The below table shows how many unique data are shared with other clients.".to_string());
    content.push(
        "Usually different applications owns different data and should not resolve to the same CID.".to_string(),
    );
    content.push(String::new());

    if data.sharing.is_empty() {
        content.push(format!("{OK} No CID sharing has been observed."));
        content.push(String::new());
        return;
    }

    content.push(
        "However, this could be possible if all below clients use same software to prepare for the exact same dataset or they belong to a series of LDN applications for the same dataset."
            .to_string(),
    );
    content.push(String::new());
    for finding in &data.evaluation.findings {
        if finding.section() == Section::CidSharing {
            content.push(warning_line(finding, data.fake_links));
            content.push(String::new());
        }
    }

    let rows: Vec<Vec<String>> = data
        .sharing
        .iter()
        .map(|other| {
            let application = match &other.application {
                Some(info) => match &info.url {
                    Some(url) => link(&info.organization_name, url, data.fake_links),
                    None => info.organization_name.clone(),
                },
                None => "Unknown".to_string(),
            };
            vec![
                wrap_in_code(&other.entry.other_client_address),
                application,
                iec_bytes(other.entry.total_deal_size),
                thousands(other.entry.unique_cid_count),
                approvers_cell(&other.approvers),
            ]
        })
        .collect();
    content.push(gfm_table(
        &[
            ("Other Client", Align::Left),
            ("Application", Align::Left),
            ("Total Deals Affected", Align::Right),
            ("Unique CIDs", Align::Right),
            ("Approvers", Align::Left),
        ],
        &rows,
    ));
    content.push(String::new());
}

fn push_retrieval_section(content: &mut Vec<String>, data: &ReportData) {
    content.push("### Retrieval Statistics".to_string());
    if data.retrieval_stats.is_empty() {
        content.push("No retrieval attempts have been recorded for this client.".to_string());
        content.push(String::new());
        return;
    }

    for (protocol, ratio) in protocol_success_ratios(&data.retrieval_stats) {
        content.push(format!(" - Overall {protocol} retrieval success rate: {}", percent(ratio)));
    }
    content.push(String::new());
    for finding in &data.evaluation.findings {
        if finding.section() == Section::Retrieval {
            content.push(warning_line(finding, data.fake_links));
            content.push(String::new());
        }
    }
    push_chart(content, "Retrieval Success Rate", data.charts.retrieval.as_ref());

    let rows: Vec<Vec<String>> = data
        .retrieval_stats
        .iter()
        .map(|stat| {
            vec![
                provider_link(&stat.provider, data.fake_links),
                stat.protocol.clone(),
                stat.outcome.clone(),
                thousands(stat.count),
            ]
        })
        .collect();
    content.push(gfm_table(
        &[
            ("Provider", Align::Left),
            ("Protocol", Align::Left),
            ("Outcome", Align::Left),
            ("Attempts", Align::Right),
        ],
        &rows,
    ));
    content.push(String::new());
}

/// The complete compliance report, in fixed section order.
pub fn render_full(data: &ReportData) -> String {
    let mut content = Vec::new();
    push_header(&mut content, data);
    push_provider_section(&mut content, data);
    push_replication_section(&mut content, data);
    push_sharing_section(&mut content, data);
    push_retrieval_section(&mut content, data);
    content.join("\n")
}

pub fn render_retrieval(data: &ReportData) -> String {
    let mut content = Vec::new();
    push_header(&mut content, data);
    push_retrieval_section(&mut content, data);
    content.join("\n")
}

/// Headline verdicts plus links to the full and retrieval reports.
pub fn render_summary(data: &ReportData, report_url: &str, retrieval_url: &str) -> String {
    let mut content = vec![
        format!("{REPORT_TITLE} Summary"),
        format!(" - Client: {}", wrap_in_code(data.group.primary())),
        format!(" - Allocation round: {}", data.round),
        String::new(),
    ];
    let sections = [
        (Section::ProviderDistribution, "Storage Provider Distribution", "Storage provider distribution looks healthy."),
        (Section::Replication, "Deal Data Replication", "Data replication looks healthy."),
        (Section::CidSharing, "Deal Data Shared with other Clients", "No CID sharing has been observed."),
        (Section::Retrieval, "Retrieval Statistics", "Retrieval success rate looks healthy."),
    ];
    for (section, heading, healthy) in sections {
        content.push(format!("### {heading}"));
        content.push(String::new());
        if data.evaluation.passes(section) {
            content.push(format!("{OK} {healthy}"));
            content.push(String::new());
        }
        for finding in data.evaluation.findings.iter().filter(|f| f.section() == section) {
            content.push(warning_line(finding, data.fake_links));
            content.push(String::new());
        }
    }
    content.push(format!("[Full report]({report_url})"));
    content.push(String::new());
    content.push(format!("[Retrieval report]({retrieval_url})"));
    content.join("\n")
}

/// Fixed-template report for a check that stopped early.
pub fn render_abort(reason: &AbortReason, repository: &str, issue_number: u64) -> String {
    let mut content = vec![
        REPORT_TITLE.to_string(),
        format!(" - Issue: {} #{issue_number}", wrap_in_code(repository)),
        String::new(),
    ];
    match reason {
        AbortReason::NoPreviousAllocation => {
            content.push(format!(
                "{WARNING} No previous allocation was found for this application."
            ));
            content.push(String::new());
            content.push(
                "The report is generated once at least one DataCap allocation has been granted.".to_string(),
            );
        }
        AbortReason::InvalidClientAddress => {
            content.push(format!(
                "{WARNING} The on-chain client address could not be found in the application."
            ));
            content.push(String::new());
            content.push(
                "Please make sure the `On-chain address for first allocation` field holds a valid address."
                    .to_string(),
            );
        }
        AbortReason::ApplicationNotFound { client_address } => {
            content.push(format!(
                "{WARNING} Client {} was not found in the verified-client registry.",
                wrap_in_code(client_address)
            ));
        }
        AbortReason::NoActiveDeals { addresses } => {
            let listed = addresses
                .iter()
                .map(|a| wrap_in_code(a))
                .collect::<Vec<_>>()
                .join(", ");
            content.push(format!(
                "{WARNING} No active verified deals were found for {listed}."
            ));
        }
    }
    content.push(String::new());
    content.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::evaluate;
    use crate::markdown::parse_percent;
    use cidchk_core::Location;

    fn provider(id: &str, total: u64, share: f64, org: Option<&str>) -> ProviderDistributionEntry {
        ProviderDistributionEntry {
            provider: id.into(),
            total_deal_size: total,
            unique_data_size: total,
            duplication_fraction: 0.0,
            share,
            location: Some(Location {
                city: Some(format!("City {id}")),
                country: Some("US".into()),
                org_name: org.map(str::to_string),
                ..Default::default()
            }),
            is_first_client_for_provider: id == "f05",
        }
    }

    fn data(providers: Vec<ProviderDistributionEntry>, sharing: Vec<OtherClient>) -> ReportData {
        let profile = CriteriaProfile::default();
        let entries: Vec<CidSharingEntry> = sharing.iter().map(|o| o.entry.clone()).collect();
        let replication = vec![ReplicationDistributionEntry {
            num_of_replicas: 4,
            unique_data_size: 100,
            total_deal_size: 400,
            share: 1.0,
        }];
        let evaluation = evaluate(&profile, &providers, &replication, &entries, &[]);
        ReportData {
            application: ApplicationInfo {
                client_address: "f1client".into(),
                organization_name: "Acme Labs".into(),
                url: Some("https://github.com/acme/ldn/issues/42".into()),
                verifier_name: None,
                issue_repository: Some("acme/ldn".into()),
                issue_number: Some(42),
            },
            project_name: Some("Genomes".into()),
            group: ClientGroup::new("f1client", vec!["f1alias".to_string()]),
            round: 2,
            relaxed: true,
            profile,
            approvers: vec![("adam".into(), 1), ("zoe".into(), 2)],
            providers,
            replication,
            sharing,
            retrieval_stats: Vec::new(),
            retrieval_weeks: Vec::new(),
            evaluation,
            charts: ChartLinks {
                provider_distribution: Some("https://cdn/p.svg".into()),
                provider_map: Some("https://cdn/map.svg".into()),
                ..Default::default()
            },
            fake_links: false,
        }
    }

    #[test]
    fn sections_appear_in_fixed_order() {
        let report = render_full(&data(vec![provider("f01", 100, 1.0, None)], Vec::new()));
        let order = [
            REPORT_TITLE,
            " - Organization: `Acme Labs`",
            " - Approvers:",
            "### Other Addresses",
            "### Storage Provider Distribution",
            "![Provider Distribution](https://cdn/p.svg)",
            "![Provider Locations](https://cdn/map.svg)",
            "### Deal Data Replication",
            "### Deal Data Shared with other Clients",
            "### Retrieval Statistics",
        ];
        let mut cursor = 0;
        for marker in order {
            let found = report[cursor..]
                .find(marker)
                .unwrap_or_else(|| panic!("missing or out of order: {marker}"));
            cursor += found + marker.len();
        }
        assert!(report.contains("restrictions below are relaxed"));
        assert!(report.contains("No CID sharing has been observed."));
        assert!(report.contains("No retrieval attempts have been recorded"));
    }

    #[test]
    fn share_warning_carries_the_exact_percentage() {
        let report = render_full(&data(
            vec![
                provider("f01", 400, 0.4, Some("Zeta")),
                provider("f02", 100, 0.1, Some("Alpha")),
                provider("f03", 100, 0.1, None),
                provider("f04", 200, 0.2, Some("Beta")),
                provider("f05", 200, 0.2, Some("Gamma")),
            ],
            Vec::new(),
        ));
        let warnings: Vec<&str> = report
            .lines()
            .filter(|l| l.contains("of total datacap.") && l.starts_with(WARNING))
            .collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("[f01]"));
        assert!(warnings[0].contains("40.00%"));

        let pct = warnings[0]
            .split_whitespace()
            .find(|w| w.ends_with('%'))
            .and_then(parse_percent)
            .unwrap();
        assert!((pct - 0.4).abs() < 0.005);
        assert!(report.contains("[f05](https://filfox.info/en/address/f05) `new`"));
    }

    #[test]
    fn providers_sort_by_network_owner() {
        let mut providers = vec![
            provider("f03", 1, 0.2, None),
            provider("f01", 1, 0.2, Some("zeta")),
            provider("f02", 1, 0.2, Some("Alpha")),
        ];
        sort_for_presentation(&mut providers);
        let order: Vec<&str> = providers.iter().map(|p| p.provider.as_str()).collect();
        assert_eq!(order, ["f02", "f01", "f03"]);
    }

    #[test]
    fn sharing_rows_are_annotated() {
        let other = OtherClient {
            entry: CidSharingEntry {
                other_client_address: "f1other".into(),
                unique_cid_count: 1200,
                total_deal_size: 2048,
            },
            application: Some(ApplicationInfo {
                client_address: "f1other".into(),
                organization_name: "Other Org".into(),
                url: Some("https://github.com/acme/ldn/issues/7".into()),
                verifier_name: None,
                issue_repository: Some("acme/ldn".into()),
                issue_number: Some(7),
            }),
            approvers: vec![("zoe".into(), 3)],
        };
        let report = render_full(&data(vec![provider("f01", 100, 1.0, None)], vec![other]));
        assert!(report.contains("⚠️ CID sharing has been observed."));
        assert!(report.contains("[Other Org](https://github.com/acme/ldn/issues/7)"));
        assert!(report.contains("1,200"));
        assert!(report.contains("2.00 KiB"));
        assert!(report.contains("`zoe`: 3"));
    }

    #[test]
    fn summary_links_both_reports() {
        let summary = render_summary(
            &data(vec![provider("f01", 100, 1.0, None)], Vec::new()),
            "https://cdn/report.md",
            "https://cdn/retrieval.md",
        );
        assert!(summary.starts_with("## DataCap and CID Checker Report Summary"));
        assert!(summary.contains("[Full report](https://cdn/report.md)"));
        assert!(summary.contains("[Retrieval report](https://cdn/retrieval.md)"));
        assert!(summary.contains("✅ No CID sharing has been observed."));
        assert!(summary.contains("has sealed 100.00% of total datacap."));
    }

    #[test]
    fn abort_reports_explain_the_condition() {
        let text = render_abort(&AbortReason::NoPreviousAllocation, "acme/ldn", 42);
        assert!(text.starts_with(REPORT_TITLE));
        assert!(text.contains("No previous allocation"));
        let text = render_abort(
            &AbortReason::NoActiveDeals {
                addresses: vec!["f1a".into(), "f1b".into()],
            },
            "acme/ldn",
            42,
        );
        assert!(text.contains("`f1a`, `f1b`"));
    }
}
