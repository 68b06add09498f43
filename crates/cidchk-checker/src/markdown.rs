//! GitHub-flavored markdown helpers shared by every report variant.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Center,
    Right,
}

pub const EXPLORER_ADDRESS_URL: &str = "https://filfox.info/en/address/";

/// Render a padded GFM table. Rows shorter than the header are padded with
/// empty cells; `|` inside a cell is escaped.
pub fn gfm_table(columns: &[(&str, Align)], rows: &[Vec<String>]) -> String {
    let rows: Vec<Vec<String>> = rows
        .iter()
        .map(|row| row.iter().map(|cell| escape_cell(cell)).collect())
        .collect();
    let mut widths: Vec<usize> = columns
        .iter()
        .map(|(name, _)| name.chars().count().max(3))
        .collect();
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let header: Vec<String> = columns.iter().map(|(name, _)| name.to_string()).collect();
    let mut lines = vec![render_row(&header, columns, &widths)];
    lines.push(format!(
        "| {} |",
        columns
            .iter()
            .zip(&widths)
            .map(|((_, align), width)| delimiter(*align, *width))
            .collect::<Vec<_>>()
            .join(" | ")
    ));
    for row in &rows {
        lines.push(render_row(row, columns, &widths));
    }
    lines.join("\n")
}

fn render_row(cells: &[String], columns: &[(&str, Align)], widths: &[usize]) -> String {
    let padded: Vec<String> = columns
        .iter()
        .zip(widths)
        .enumerate()
        .map(|(i, ((_, align), width))| pad(cells.get(i).map(String::as_str).unwrap_or(""), *align, *width))
        .collect();
    format!("| {} |", padded.join(" | "))
}

fn escape_cell(cell: &str) -> String {
    let mut out = String::with_capacity(cell.len());
    let mut escaped = false;
    for c in cell.chars() {
        if c == '|' && !escaped {
            out.push('\\');
        }
        escaped = c == '\\' && !escaped;
        out.push(c);
    }
    out
}

fn pad(cell: &str, align: Align, width: usize) -> String {
    let fill = width.saturating_sub(cell.chars().count());
    match align {
        Align::Left => format!("{cell}{}", " ".repeat(fill)),
        Align::Right => format!("{}{cell}", " ".repeat(fill)),
        Align::Center => {
            let left = fill / 2;
            format!("{}{cell}{}", " ".repeat(left), " ".repeat(fill - left))
        }
    }
}

fn delimiter(align: Align, width: usize) -> String {
    match align {
        Align::Left => format!(":{}", "-".repeat(width - 1)),
        Align::Right => format!("{}:", "-".repeat(width - 1)),
        Align::Center => format!(":{}:", "-".repeat(width - 2)),
    }
}

pub fn wrap_in_code(text: &str) -> String {
    format!("`{}`", text.replace('`', "'"))
}

/// Markdown link. A fake link drops the scheme and the first `/` so the
/// tracker does not back-reference the target.
pub fn link(text: &str, url: &str, fake: bool) -> String {
    if fake {
        format!("[{text}]({})", url.replacen("https://", "", 1).replacen('/', "#", 1))
    } else {
        format!("[{text}]({url})")
    }
}

pub fn provider_link(provider: &str, fake: bool) -> String {
    link(provider, &format!("{EXPLORER_ADDRESS_URL}{provider}"), fake)
}

/// `0.4` -> `"40.00%"`.
pub fn percent(fraction: f64) -> String {
    format!("{:.2}%", fraction * 100.0)
}

/// Parse a rendered percentage back into a fraction.
pub fn parse_percent(text: &str) -> Option<f64> {
    text.trim().strip_suffix('%')?.trim().parse::<f64>().ok().map(|v| v / 100.0)
}

const IEC_UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

/// IEC byte size with two decimals, e.g. `1.50 TiB`.
pub fn iec_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < IEC_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", IEC_UNITS[unit])
}

/// `1234567` -> `"1,234,567"`.
pub fn thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_pads_and_aligns() {
        let table = gfm_table(
            &[("Name", Align::Left), ("Age", Align::Right)],
            &[
                vec!["foo".into(), "10".into()],
                vec!["bar".into(), "20".into()],
            ],
        );
        assert_eq!(table, "| Name | Age |\n| :--- | --: |\n| foo  |  10 |\n| bar  |  20 |");
    }

    #[test]
    fn pipes_inside_cells_are_escaped() {
        let table = gfm_table(
            &[("Organization", Align::Left)],
            &[vec!["Acme | Labs".into()], vec![r"Kept \| as is".into()]],
        );
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[2].trim_end_matches(" |").trim_end(), r"| Acme \| Labs");
        assert_eq!(lines[3].trim_end_matches(" |").trim_end(), r"| Kept \| as is");
        assert!(lines.iter().all(|line| line.split(" | ").count() == 1));
    }

    #[test]
    fn fake_links_lose_scheme() {
        assert_eq!(
            provider_link("f01234", false),
            "[f01234](https://filfox.info/en/address/f01234)"
        );
        assert_eq!(provider_link("f01234", true), "[f01234](filfox.info#en/address/f01234)");
        assert_eq!(wrap_in_code("a`b`"), "`a'b'`");
    }

    #[test]
    fn sizes_and_numbers() {
        assert_eq!(iec_bytes(512), "512 B");
        assert_eq!(iec_bytes(1536), "1.50 KiB");
        assert_eq!(iec_bytes(3 * 1024u64.pow(4) / 2), "1.50 TiB");
        assert_eq!(thousands(1_234_567), "1,234,567");
        assert_eq!(thousands(999), "999");
    }

    #[test]
    fn percentages_round_trip_within_two_decimals() {
        for fraction in [0.0, 0.123456, 0.4, 0.99994, 1.0] {
            let parsed = parse_percent(&percent(fraction)).unwrap();
            assert!((parsed - fraction).abs() < 0.0001, "{fraction} -> {parsed}");
        }
    }
}
