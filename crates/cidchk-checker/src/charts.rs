//! Chart artifacts embedded in reports. Rendering sits behind [`ChartRenderer`];
//! the bundled renderer writes plain SVG.

use std::fmt::Write as _;

use cidchk_core::{ProviderDistributionEntry, ReplicationDistributionEntry, RetrievalWeek};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChartError {
    #[error("chart `{0}` has no data points")]
    Empty(String),
    #[error("formatting chart: {0}")]
    Format(#[from] std::fmt::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub title: String,
    pub y_label: String,
    /// Label and value in `0.0..=1.0`.
    pub points: Vec<(String, f64)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartImage {
    pub bytes: Vec<u8>,
    pub extension: &'static str,
}

/// A provider location on the world map, weighted by its share of deals.
#[derive(Debug, Clone, PartialEq)]
pub struct MapPoint {
    pub label: String,
    pub longitude: f64,
    pub latitude: f64,
    pub weight: f64,
}

pub trait ChartRenderer: Send + Sync {
    fn bar_chart(&self, series: &Series) -> Result<ChartImage, ChartError>;
    fn line_chart(&self, series: &Series) -> Result<ChartImage, ChartError>;
    fn map_chart(&self, title: &str, points: &[MapPoint]) -> Result<ChartImage, ChartError>;
}

/// Providers with coordinates, one point per distinct position. Providers
/// sharing a position are merged and their shares summed.
pub fn provider_map_points(providers: &[ProviderDistributionEntry]) -> Vec<MapPoint> {
    let mut points: Vec<MapPoint> = Vec::new();
    for entry in providers {
        let Some((latitude, longitude)) = entry
            .location
            .as_ref()
            .and_then(|l| Some((l.latitude?, l.longitude?)))
        else {
            continue;
        };
        match points
            .iter_mut()
            .find(|p| p.latitude == latitude && p.longitude == longitude)
        {
            Some(point) => {
                point.label = format!("{}, {}", point.label, entry.provider);
                point.weight += entry.share;
            }
            None => points.push(MapPoint {
                label: entry.provider.clone(),
                longitude,
                latitude,
                weight: entry.share,
            }),
        }
    }
    points
}

pub fn provider_share_series(providers: &[ProviderDistributionEntry]) -> Series {
    Series {
        title: "Storage Provider Distribution".into(),
        y_label: "Share of total deals".into(),
        points: providers.iter().map(|p| (p.provider.clone(), p.share)).collect(),
    }
}

pub fn replication_series(buckets: &[ReplicationDistributionEntry]) -> Series {
    Series {
        title: "Deal Data Replication".into(),
        y_label: "Share of total deals".into(),
        points: buckets
            .iter()
            .map(|b| (b.num_of_replicas.to_string(), b.share))
            .collect(),
    }
}

pub fn retrieval_series(weeks: &[RetrievalWeek]) -> Series {
    Series {
        title: "Retrieval Success Rate".into(),
        y_label: "Weekly success rate".into(),
        points: weeks
            .iter()
            .map(|w| (w.week_start.format("%Y-%m-%d").to_string(), w.success_rate()))
            .collect(),
    }
}

const WIDTH: f64 = 800.0;
const HEIGHT: f64 = 400.0;
const MARGIN: f64 = 60.0;

#[derive(Debug, Default, Clone, Copy)]
pub struct SvgChartRenderer;

impl SvgChartRenderer {
    fn frame(out: &mut String, series: &Series) -> Result<(), ChartError> {
        write!(
            out,
            r##"<svg xmlns="http://www.w3.org/2000/svg" width="{WIDTH}" height="{HEIGHT}" viewBox="0 0 {WIDTH} {HEIGHT}" font-family="sans-serif" font-size="12">"##
        )?;
        write!(out, r##"<rect width="100%" height="100%" fill="#ffffff"/>"##)?;
        write!(
            out,
            r##"<text x="{}" y="24" text-anchor="middle" font-size="16">{}</text>"##,
            WIDTH / 2.0,
            xml_escape(&series.title)
        )?;
        write!(
            out,
            r##"<text x="16" y="{}" transform="rotate(-90 16 {})" text-anchor="middle">{}</text>"##,
            HEIGHT / 2.0,
            HEIGHT / 2.0,
            xml_escape(&series.y_label)
        )?;
        for tick in 0..=4 {
            let fraction = f64::from(tick) / 4.0;
            let y = plot_y(fraction);
            write!(
                out,
                r##"<line x1="{MARGIN}" x2="{}" y1="{y:.1}" y2="{y:.1}" stroke="#e2e8f0"/><text x="{}" y="{:.1}" text-anchor="end">{:.0}%</text>"##,
                WIDTH - MARGIN / 2.0,
                MARGIN - 6.0,
                y + 4.0,
                fraction * 100.0
            )?;
        }
        Ok(())
    }

    fn check_nonempty(series: &Series) -> Result<(), ChartError> {
        if series.points.is_empty() {
            return Err(ChartError::Empty(series.title.clone()));
        }
        Ok(())
    }
}

fn plot_y(fraction: f64) -> f64 {
    let clamped = fraction.clamp(0.0, 1.0);
    HEIGHT - MARGIN - clamped * (HEIGHT - 2.0 * MARGIN)
}

fn slot_width(points: usize) -> f64 {
    (WIDTH - 1.5 * MARGIN) / points.max(1) as f64
}

impl ChartRenderer for SvgChartRenderer {
    fn bar_chart(&self, series: &Series) -> Result<ChartImage, ChartError> {
        Self::check_nonempty(series)?;
        let mut out = String::new();
        Self::frame(&mut out, series)?;
        let slot = slot_width(series.points.len());
        for (i, (label, value)) in series.points.iter().enumerate() {
            let x = MARGIN + slot * i as f64 + slot * 0.1;
            let top = plot_y(*value);
            write!(
                out,
                r##"<rect x="{x:.1}" y="{top:.1}" width="{:.1}" height="{:.1}" fill="#0ea5e9"/>"##,
                slot * 0.8,
                HEIGHT - MARGIN - top
            )?;
            write!(
                out,
                r##"<text x="{:.1}" y="{:.1}" text-anchor="middle">{}</text>"##,
                x + slot * 0.4,
                HEIGHT - MARGIN + 16.0,
                xml_escape(label)
            )?;
        }
        out.push_str("</svg>");
        Ok(ChartImage {
            bytes: out.into_bytes(),
            extension: "svg",
        })
    }

    fn line_chart(&self, series: &Series) -> Result<ChartImage, ChartError> {
        Self::check_nonempty(series)?;
        let mut out = String::new();
        Self::frame(&mut out, series)?;
        let slot = slot_width(series.points.len());
        let coords: Vec<(f64, f64)> = series
            .points
            .iter()
            .enumerate()
            .map(|(i, (_, value))| (MARGIN + slot * (i as f64 + 0.5), plot_y(*value)))
            .collect();
        let path = coords
            .iter()
            .map(|(x, y)| format!("{x:.1},{y:.1}"))
            .collect::<Vec<_>>()
            .join(" ");
        write!(
            out,
            r##"<polyline points="{path}" fill="none" stroke="#0ea5e9" stroke-width="2"/>"##
        )?;
        // label every point when sparse, otherwise roughly eight labels
        let every = (series.points.len() / 8).max(1);
        for (i, ((label, _), (x, y))) in series.points.iter().zip(&coords).enumerate() {
            write!(out, r##"<circle cx="{x:.1}" cy="{y:.1}" r="3" fill="#0369a1"/>"##)?;
            if i % every == 0 {
                write!(
                    out,
                    r##"<text x="{x:.1}" y="{:.1}" text-anchor="middle">{}</text>"##,
                    HEIGHT - MARGIN + 16.0,
                    xml_escape(label)
                )?;
            }
        }
        out.push_str("</svg>");
        Ok(ChartImage {
            bytes: out.into_bytes(),
            extension: "svg",
        })
    }

    fn map_chart(&self, title: &str, points: &[MapPoint]) -> Result<ChartImage, ChartError> {
        if points.is_empty() {
            return Err(ChartError::Empty(title.to_string()));
        }
        Ok(ChartImage {
            bytes: Self::render_map(title, points)?.into_bytes(),
            extension: "svg",
        })
    }
}

const MAP_WIDTH: f64 = 720.0;
const MAP_HEIGHT: f64 = 360.0;
const MAP_TOP: f64 = 40.0;

/// Equirectangular projection onto the map area below the title.
fn project(longitude: f64, latitude: f64) -> (f64, f64) {
    let x = (longitude.clamp(-180.0, 180.0) + 180.0) / 360.0 * MAP_WIDTH;
    let y = MAP_TOP + (90.0 - latitude.clamp(-90.0, 90.0)) / 180.0 * MAP_HEIGHT;
    (x, y)
}

impl SvgChartRenderer {
    fn render_map(title: &str, points: &[MapPoint]) -> Result<String, ChartError> {
        let mut out = String::new();
        write!(
            out,
            r##"<svg xmlns="http://www.w3.org/2000/svg" width="{MAP_WIDTH}" height="{}" viewBox="0 0 {MAP_WIDTH} {}" font-family="sans-serif" font-size="12">"##,
            MAP_TOP + MAP_HEIGHT,
            MAP_TOP + MAP_HEIGHT
        )?;
        write!(out, r##"<rect width="100%" height="100%" fill="#ffffff"/>"##)?;
        write!(
            out,
            r##"<text x="{}" y="24" text-anchor="middle" font-size="16">{}</text>"##,
            MAP_WIDTH / 2.0,
            xml_escape(title)
        )?;
        write!(
            out,
            r##"<rect x="0" y="{MAP_TOP}" width="{MAP_WIDTH}" height="{MAP_HEIGHT}" fill="#f1f5f9"/>"##
        )?;
        // 30 degree graticule
        for step in 1..12 {
            let (x, _) = project(-180.0 + 30.0 * f64::from(step), 0.0);
            write!(
                out,
                r##"<line x1="{x:.1}" x2="{x:.1}" y1="{MAP_TOP}" y2="{}" stroke="#e2e8f0"/>"##,
                MAP_TOP + MAP_HEIGHT
            )?;
        }
        for step in 1..6 {
            let (_, y) = project(0.0, 90.0 - 30.0 * f64::from(step));
            write!(
                out,
                r##"<line x1="0" x2="{MAP_WIDTH}" y1="{y:.1}" y2="{y:.1}" stroke="#e2e8f0"/>"##
            )?;
        }
        for point in points {
            let (x, y) = project(point.longitude, point.latitude);
            let radius = 4.0 + point.weight.clamp(0.0, 1.0).sqrt() * 26.0;
            write!(
                out,
                r##"<circle cx="{x:.1}" cy="{y:.1}" r="{radius:.1}" fill="#0ea5e9" fill-opacity="0.6" stroke="#0369a1"><title>{} ({:.2}%)</title></circle>"##,
                xml_escape(&point.label),
                point.weight * 100.0
            )?;
        }
        out.push_str("</svg>");
        Ok(out)
    }
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn bar_chart_has_one_rect_per_point() {
        let series = Series {
            title: "Shares <test>".into(),
            y_label: "share".into(),
            points: vec![("f01".into(), 0.75), ("f02".into(), 0.25)],
        };
        let image = SvgChartRenderer.bar_chart(&series).unwrap();
        let svg = String::from_utf8(image.bytes).unwrap();
        assert_eq!(image.extension, "svg");
        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert!(svg.contains("Shares &lt;test&gt;"));
        assert_eq!(svg.matches("fill=\"#0ea5e9\"").count(), 2);
    }

    #[test]
    fn line_chart_plots_weekly_rates() {
        let weeks = vec![
            RetrievalWeek {
                week_start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                success_count: 1,
                total_count: 2,
            },
            RetrievalWeek {
                week_start: NaiveDate::from_ymd_opt(2024, 1, 8).unwrap(),
                success_count: 2,
                total_count: 2,
            },
        ];
        let svg = String::from_utf8(
            SvgChartRenderer
                .line_chart(&retrieval_series(&weeks))
                .unwrap()
                .bytes,
        )
        .unwrap();
        assert!(svg.contains("<polyline"));
        assert!(svg.contains("2024-01-08"));
        assert_eq!(svg.matches("<circle").count(), 2);
    }

    fn located(provider: &str, share: f64, coords: Option<(f64, f64)>) -> ProviderDistributionEntry {
        ProviderDistributionEntry {
            provider: provider.into(),
            total_deal_size: 100,
            unique_data_size: 100,
            duplication_fraction: 0.0,
            share,
            location: Some(cidchk_core::Location {
                country: Some("US".into()),
                latitude: coords.map(|(lat, _)| lat),
                longitude: coords.map(|(_, lon)| lon),
                ..Default::default()
            }),
            is_first_client_for_provider: false,
        }
    }

    #[test]
    fn map_points_merge_shared_positions_and_skip_unplaced() {
        let providers = vec![
            located("f01", 0.5, Some((37.77, -122.42))),
            located("f02", 0.2, Some((37.77, -122.42))),
            located("f03", 0.2, Some((48.86, 2.35))),
            located("f04", 0.1, None),
        ];
        let points = provider_map_points(&providers);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].label, "f01, f02");
        assert!((points[0].weight - 0.7).abs() < 1e-9);
        assert_eq!(points[1].label, "f03");
    }

    #[test]
    fn map_chart_scales_markers_by_share() {
        let points = vec![
            MapPoint {
                label: "f01".into(),
                longitude: 0.0,
                latitude: 0.0,
                weight: 1.0,
            },
            MapPoint {
                label: "f02 <edge>".into(),
                longitude: 180.0,
                latitude: -90.0,
                weight: 0.0,
            },
        ];
        let svg = String::from_utf8(SvgChartRenderer.map_chart("Provider Locations", &points).unwrap().bytes).unwrap();
        assert!(svg.starts_with("<svg") && svg.ends_with("</svg>"));
        // centre of the map for (0, 0), bottom right corner for (180, -90)
        assert!(svg.contains(r#"<circle cx="360.0" cy="220.0" r="30.0""#));
        assert!(svg.contains(r#"<circle cx="720.0" cy="400.0" r="4.0""#));
        assert!(svg.contains("f02 &lt;edge&gt; (0.00%)"));
        assert!(matches!(
            SvgChartRenderer.map_chart("Provider Locations", &[]),
            Err(ChartError::Empty(_))
        ));
    }

    #[test]
    fn empty_series_is_an_error() {
        let err = SvgChartRenderer.bar_chart(&replication_series(&[])).unwrap_err();
        assert!(matches!(err, ChartError::Empty(_)));
    }
}
