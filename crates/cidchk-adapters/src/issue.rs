//! Extract the client address and organization from an application issue.

use cidchk_core::looks_like_address;

const ORGANIZATION_LABELS: [&str; 3] = ["Data Owner Name", "Organization Name", "Name"];
const ADDRESS_LABELS: [&str; 2] = [
    "On-chain address for first allocation",
    "On-chain Address for first allocation",
];
const NO_RESPONSE: &str = "_No response_";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedApplication {
    pub organization_name: Option<String>,
    pub client_address: Option<String>,
}

/// Handles both form layouts: `### Label` followed by a value line, and the
/// older `- Label: value` bullets.
pub fn parse_issue_body(body: &str) -> ParsedApplication {
    let fields = collect_fields(body);
    let lookup = |labels: &[&str]| {
        labels.iter().find_map(|label| {
            fields
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(label))
                .map(|(_, value)| value.clone())
        })
    };
    ParsedApplication {
        organization_name: lookup(&ORGANIZATION_LABELS),
        client_address: lookup(&ADDRESS_LABELS).filter(|address| looks_like_address(address)),
    }
}

fn collect_fields(body: &str) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    let mut lines = body.lines().map(str::trim).peekable();
    while let Some(line) = lines.next() {
        if let Some(label) = line.strip_prefix("###") {
            let label = label.trim();
            // value is the next non-blank line that is not another heading
            while lines.peek().is_some_and(|next| next.is_empty()) {
                lines.next();
            }
            let value = if lines.peek().is_some_and(|next| !next.starts_with('#')) {
                lines.next().unwrap_or_default()
            } else {
                ""
            };
            push_field(&mut fields, label, value);
        } else if let Some(bullet) = line.strip_prefix('-') {
            if let Some((label, value)) = bullet.split_once(':') {
                push_field(&mut fields, label.trim(), value);
            }
        }
    }
    fields
}

fn push_field(fields: &mut Vec<(String, String)>, label: &str, value: &str) {
    let value = value.trim();
    if label.is_empty() || value.is_empty() || value == NO_RESPONSE {
        return;
    }
    fields.push((label.to_string(), value.to_string()));
}

/// Project name from an application title such as
/// `[DataCap Application] <company> - <project>`.
pub fn project_name_from_title(title: &str) -> String {
    const PREFIX: &str = "[datacap application]";
    let mut rest = title.trim();
    if let Some(idx) = rest.to_ascii_lowercase().find(PREFIX) {
        rest = &rest[idx + PREFIX.len()..];
    }
    let project = rest.split_once('-').map_or(rest, |(_, project)| project);
    project
        .chars()
        .filter(|c| *c != '<' && *c != '>')
        .collect::<String>()
        .trim()
        .to_string()
}
