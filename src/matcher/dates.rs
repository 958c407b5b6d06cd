//! Literal date artifacts in question text.
//!
//! Extraction is deliberately shallow: four-digit years, month names,
//! numeric m/d(/y) patterns, quarter tags, and deadline qualifiers, taken
//! verbatim from the question string. The score only compares artifact sets;
//! it never tries to resolve actual calendar dates.

use std::collections::BTreeSet;

const MONTHS: &[(&str, &str)] = &[
    ("january", "january"),
    ("jan", "january"),
    ("february", "february"),
    ("feb", "february"),
    ("march", "march"),
    ("mar", "march"),
    ("april", "april"),
    ("apr", "april"),
    ("may", "may"),
    ("june", "june"),
    ("jun", "june"),
    ("july", "july"),
    ("jul", "july"),
    ("august", "august"),
    ("aug", "august"),
    ("september", "september"),
    ("sept", "september"),
    ("sep", "september"),
    ("october", "october"),
    ("oct", "october"),
    ("november", "november"),
    ("nov", "november"),
    ("december", "december"),
    ("dec", "december"),
];

const QUALIFIERS: &[&str] = &["by", "before", "after", "until"];

/// Extract the set of date artifacts from a question string.
pub fn extract_date_artifacts(text: &str) -> BTreeSet<String> {
    let mut artifacts = BTreeSet::new();
    let lowered = text.to_lowercase();

    for raw in lowered.split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | '(' | ')')) {
        let token = raw.trim_matches(|c: char| !c.is_alphanumeric() && c != '/');
        if token.is_empty() {
            continue;
        }

        // Four-digit years.
        if token.len() == 4 && token.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(year) = token.parse::<u32>() {
                if (1900..=2100).contains(&year) {
                    artifacts.insert(token.to_string());
                }
            }
            continue;
        }

        // Quarter tags: q1..q4.
        if token.len() == 2 && token.starts_with('q') {
            if matches!(&token[1..], "1" | "2" | "3" | "4") {
                artifacts.insert(token.to_string());
            }
            continue;
        }

        // m/d or m/d/y numeric patterns.
        if token.contains('/') {
            let parts: Vec<&str> = token.split('/').collect();
            if parts.len() >= 2 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit())) {
                let month: u32 = parts[0].parse().unwrap_or(0);
                let day: u32 = parts[1].parse().unwrap_or(0);
                if (1..=12).contains(&month) && (1..=31).contains(&day) {
                    artifacts.insert(format!("{}/{}", month, day));
                    if let Some(year_part) = parts.get(2) {
                        let year = normalize_year(year_part);
                        if let Some(year) = year {
                            artifacts.insert(year);
                        }
                    }
                }
            }
            continue;
        }

        // Month names and deadline qualifiers.
        if let Some((_, canonical)) = MONTHS.iter().find(|(name, _)| *name == token) {
            artifacts.insert(canonical.to_string());
            continue;
        }
        if QUALIFIERS.contains(&token) {
            artifacts.insert(token.to_string());
        }
    }

    artifacts
}

fn normalize_year(part: &str) -> Option<String> {
    match part.len() {
        4 => {
            let year: u32 = part.parse().ok()?;
            (1900..=2100).contains(&year).then(|| part.to_string())
        }
        2 => {
            let short: u32 = part.parse().ok()?;
            Some(format!("20{:02}", short))
        }
        _ => None,
    }
}

/// Date sub-score per the artifact-set rules:
/// both sides dated and overlapping → `|∩| / max(|A|, |B|)`;
/// neither dated → 0.5; one-sided → 0.3; both dated but disjoint → 0.1.
pub fn date_score(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => 0.5,
        (true, false) | (false, true) => 0.3,
        (false, false) => {
            let intersection = a.intersection(b).count();
            if intersection == 0 {
                0.1
            } else {
                intersection as f64 / a.len().max(b.len()) as f64
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_years_months_and_qualifiers() {
        let artifacts =
            extract_date_artifacts("Will Bitcoin reach $100k by December 31, 2024?");
        assert!(artifacts.contains("2024"));
        assert!(artifacts.contains("december"));
        assert!(artifacts.contains("by"));
    }

    #[test]
    fn extracts_slash_dates() {
        let artifacts = extract_date_artifacts("Winner announced 11/5/2024 (election day)");
        assert!(artifacts.contains("11/5"));
        assert!(artifacts.contains("2024"));

        let short_year = extract_date_artifacts("Due 3/15/25");
        assert!(short_year.contains("3/15"));
        assert!(short_year.contains("2025"));
    }

    #[test]
    fn extracts_quarters() {
        let artifacts = extract_date_artifacts("GDP growth above 3% in Q2 2025?");
        assert!(artifacts.contains("q2"));
        assert!(artifacts.contains("2025"));
    }

    #[test]
    fn rejects_non_calendar_numbers() {
        let artifacts = extract_date_artifacts("Will it trade above 5000 points at 13/45?");
        assert!(!artifacts.contains("5000"));
        assert!(!artifacts.contains("13/45"));
    }

    #[test]
    fn score_bands() {
        let a = extract_date_artifacts("by November 2024");
        let b = extract_date_artifacts("in November 2024");
        // a = {by, november, 2024}, b = {november, 2024}: 2/3.
        assert!((date_score(&a, &b) - 2.0 / 3.0).abs() < 1e-12);

        let empty = BTreeSet::new();
        assert_eq!(date_score(&empty, &empty), 0.5);
        assert_eq!(date_score(&a, &empty), 0.3);

        let c = extract_date_artifacts("in March 2026");
        assert_eq!(date_score(&b, &c), 0.1);
    }
}
