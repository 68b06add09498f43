//! The `check` orchestrator: one linear run per issue event.

use std::future::Future;
use std::sync::Arc;

use cidchk_adapters::{
    parse_issue_body, project_name_from_title, AggregationClient, ApplicationDirectory, GeoError,
    IdentityError, LocationLookup, StoreError,
};
use cidchk_core::{ApplicationInfo, CheckRequest, ClientGroup, CriteriaProfile, RequestError};
use cidchk_storage::{artifact_path, ArtifactUploader, FetchError, UploadError};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::charts::{
    provider_map_points, provider_share_series, replication_series, retrieval_series, ChartError, ChartImage,
    ChartRenderer,
};
use crate::criteria::{evaluate, is_relaxed, select_profile, Evaluation};
use crate::report::{
    render_abort, render_full, render_retrieval, render_summary, sort_for_presentation, AbortReason,
    ChartLinks, OtherClient, ReportData,
};

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("invalid check request: {0}")]
    InvalidRequest(#[from] RequestError),
    #[error("aggregation store: {0}")]
    Store(#[from] StoreError),
    #[error("geo resolution: {0}")]
    Geo(#[from] GeoError),
    #[error("identity resolution: {0}")]
    Identity(#[from] IdentityError),
    #[error("chart rendering: {0}")]
    Chart(#[from] ChartError),
    #[error("artifact upload: {0}")]
    Upload(#[from] UploadError),
    #[error("issue tracker: {0}")]
    Tracker(#[from] FetchError),
    #[error("check cancelled")]
    Cancelled,
}

/// Uploaded compliance report with its companions.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub round: u32,
    pub client_address: String,
    pub report: String,
    pub report_url: String,
    pub retrieval_report: String,
    pub retrieval_report_url: String,
    pub summary: String,
    pub summary_url: String,
    pub evaluation: Evaluation,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckOutcome {
    Report(Box<CheckReport>),
    Aborted {
        reason: AbortReason,
        report: String,
        report_url: String,
    },
}

impl CheckOutcome {
    /// Text to post back on the issue.
    pub fn comment_body(&self) -> &str {
        match self {
            CheckOutcome::Report(report) => &report.summary,
            CheckOutcome::Aborted { report, .. } => report,
        }
    }
}

pub struct Checker {
    aggregation: AggregationClient,
    geo: Arc<dyn LocationLookup>,
    directory: Arc<dyn ApplicationDirectory>,
    uploader: Arc<dyn ArtifactUploader>,
    charts: Arc<dyn ChartRenderer>,
    profiles: Vec<CriteriaProfile>,
    fake_links: bool,
}

impl Checker {
    pub fn new(
        aggregation: AggregationClient,
        geo: Arc<dyn LocationLookup>,
        directory: Arc<dyn ApplicationDirectory>,
        uploader: Arc<dyn ArtifactUploader>,
        charts: Arc<dyn ChartRenderer>,
        profiles: Vec<CriteriaProfile>,
    ) -> Self {
        let profiles = if profiles.is_empty() {
            vec![CriteriaProfile::default()]
        } else {
            profiles
        };
        Self {
            aggregation,
            geo,
            directory,
            uploader,
            charts,
            profiles,
            fake_links: false,
        }
    }

    pub fn with_fake_links(mut self, fake_links: bool) -> Self {
        self.fake_links = fake_links;
        self
    }

    pub fn profiles(&self) -> &[CriteriaProfile] {
        &self.profiles
    }

    #[instrument(skip_all, fields(repository = %request.repository, issue = request.issue_number))]
    pub async fn check(
        &self,
        request: &CheckRequest,
        cancel: &CancellationToken,
    ) -> Result<CheckOutcome, CheckError> {
        request.validate()?;

        let round = guarded(
            cancel,
            self.directory
                .allocation_round(&request.repository, request.issue_number),
        )
        .await?;
        info!(round, "resolved allocation round");
        if round == 0 {
            return self.abort(request, AbortReason::NoPreviousAllocation, cancel).await;
        }

        let parsed = parse_issue_body(&request.issue_body);
        let Some(client_address) = parsed.client_address else {
            return self.abort(request, AbortReason::InvalidClientAddress, cancel).await;
        };

        let application = guarded(cancel, self.directory.find_application_info(&client_address)).await?;
        let Some(mut application) = application else {
            let reason = AbortReason::ApplicationNotFound { client_address };
            return self.abort(request, reason, cancel).await;
        };
        if application.organization_name.trim().is_empty() {
            if let Some(name) = parsed.organization_name {
                application.organization_name = name;
            }
        }

        let group = ClientGroup::new(client_address, request.other_addresses.iter().cloned());
        let aggregation = &self.aggregation;
        let (mut providers, replication, sharing, retrieval_stats, retrieval_weeks) = guarded(cancel, async {
            tokio::try_join!(
                aggregation.get_provider_distribution(&group),
                aggregation.get_replication_distribution(&group),
                aggregation.get_cid_sharing(&group),
                aggregation.get_retrieval_stats(&group),
                aggregation.get_retrieval_time_series(&group),
            )
        })
        .await?;
        info!(
            providers = providers.len(),
            buckets = replication.len(),
            shared_with = sharing.len(),
            "aggregated deal data"
        );
        if providers.is_empty() {
            let reason = AbortReason::NoActiveDeals {
                addresses: group.addresses().to_vec(),
            };
            return self.abort(request, reason, cancel).await;
        }

        for entry in providers.iter_mut() {
            entry.location = guarded(cancel, self.geo.resolve_location(&entry.provider)).await?;
            if entry.location.is_none() {
                warn!(provider = %entry.provider, "no location for provider");
            }
        }

        let approvers = guarded(
            cancel,
            self.directory
                .approvers(&request.repository, request.issue_number),
        )
        .await?;
        let mut others = Vec::with_capacity(sharing.len());
        for entry in &sharing {
            others.push(self.annotate_other_client(entry.clone(), cancel).await?);
        }

        let profile = select_profile(&self.profiles, round).cloned().unwrap_or_default();
        let evaluation = evaluate(&profile, &providers, &replication, &sharing, &retrieval_stats);
        info!(findings = evaluation.findings.len(), "evaluated criteria");
        sort_for_presentation(&mut providers);

        let mut charts = ChartLinks::default();
        charts.provider_distribution = Some(
            self.upload_chart(request, self.charts.bar_chart(&provider_share_series(&providers))?, cancel)
                .await?,
        );
        let map_points = provider_map_points(&providers);
        if !map_points.is_empty() {
            let image = self.charts.map_chart("Storage Provider Locations", &map_points)?;
            charts.provider_map = Some(self.upload_chart(request, image, cancel).await?);
        }
        if !replication.is_empty() {
            let image = self.charts.bar_chart(&replication_series(&replication))?;
            charts.replication = Some(self.upload_chart(request, image, cancel).await?);
        }
        if !retrieval_weeks.is_empty() {
            let image = self.charts.line_chart(&retrieval_series(&retrieval_weeks))?;
            charts.retrieval = Some(self.upload_chart(request, image, cancel).await?);
        }

        let data = ReportData {
            application,
            project_name: Some(project_name_from_title(&request.issue_title)).filter(|p| !p.is_empty()),
            group,
            round,
            relaxed: is_relaxed(&self.profiles, round),
            profile,
            approvers,
            providers,
            replication,
            sharing: others,
            retrieval_stats,
            retrieval_weeks,
            evaluation,
            charts,
            fake_links: self.fake_links,
        };

        let report = render_full(&data);
        let report_url = self
            .upload_markdown(request, &report, "CID checker report", cancel)
            .await?;
        let retrieval_report = render_retrieval(&data);
        let retrieval_report_url = self
            .upload_markdown(request, &retrieval_report, "retrieval report", cancel)
            .await?;
        let summary = render_summary(&data, &report_url, &retrieval_report_url);
        let summary_url = self
            .upload_markdown(request, &summary, "CID checker summary", cancel)
            .await?;
        info!(%report_url, "check complete");

        Ok(CheckOutcome::Report(Box::new(CheckReport {
            round,
            client_address: data.group.primary().to_string(),
            report,
            report_url,
            retrieval_report,
            retrieval_report_url,
            summary,
            summary_url,
            evaluation: data.evaluation,
        })))
    }

    async fn annotate_other_client(
        &self,
        entry: cidchk_core::CidSharingEntry,
        cancel: &CancellationToken,
    ) -> Result<OtherClient, CheckError> {
        let application: Option<ApplicationInfo> = guarded(
            cancel,
            self.directory.find_application_info(&entry.other_client_address),
        )
        .await?;
        let approvers = match application
            .as_ref()
            .and_then(|info| Some((info.issue_repository.as_deref()?, info.issue_number?)))
        {
            Some((repository, number)) => {
                guarded(cancel, self.directory.approvers(repository, number)).await?
            }
            None => Vec::new(),
        };
        Ok(OtherClient {
            entry,
            application,
            approvers,
        })
    }

    async fn abort(
        &self,
        request: &CheckRequest,
        reason: AbortReason,
        cancel: &CancellationToken,
    ) -> Result<CheckOutcome, CheckError> {
        info!(?reason, "check aborted");
        let report = render_abort(&reason, &request.repository, request.issue_number);
        let report_url = self
            .upload_markdown(request, &report, "CID checker report", cancel)
            .await?;
        Ok(CheckOutcome::Aborted {
            reason,
            report,
            report_url,
        })
    }

    async fn upload_chart(
        &self,
        request: &CheckRequest,
        image: ChartImage,
        cancel: &CancellationToken,
    ) -> Result<String, CheckError> {
        let path = artifact_path(&request.repository, request.issue_number, image.extension);
        let message = format!("Upload chart for issue #{}", request.issue_number);
        guarded(cancel, self.uploader.upload(&path, &image.bytes, &message)).await
    }

    async fn upload_markdown(
        &self,
        request: &CheckRequest,
        text: &str,
        what: &str,
        cancel: &CancellationToken,
    ) -> Result<String, CheckError> {
        let path = artifact_path(&request.repository, request.issue_number, "md");
        let message = format!("Upload {what} for issue #{}", request.issue_number);
        guarded(cancel, self.uploader.upload(&path, text.as_bytes(), &message)).await
    }
}

/// Race a suspension point against cancellation.
pub(crate) async fn guarded<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T, CheckError>
where
    F: Future<Output = Result<T, E>>,
    CheckError: From<E>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CheckError::Cancelled),
        result = fut => result.map_err(CheckError::from),
    }
}
