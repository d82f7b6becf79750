use std::collections::BTreeMap;
use std::sync::OnceLock;

use anyhow::{Result, bail};
use regex::Regex;

/// Mapping from comic issue number to title. Lookup by key only; the
/// serializer decides presentation order.
pub type TitleTable = BTreeMap<u32, String>;

#[derive(Debug, Clone)]
pub struct Extraction {
    pub table: TitleTable,
    /// Lines carrying a full record, counted before deduplication.
    pub raw_records: usize,
    /// Issue numbers absent from 1..=max. Warnings, never fatal.
    pub missing: Vec<u32>,
}

static LINK_PATTERN: OnceLock<Regex> = OnceLock::new();
static CAPTION_PATTERN: OnceLock<Regex> = OnceLock::new();

fn link_pattern() -> &'static Regex {
    LINK_PATTERN.get_or_init(|| {
        Regex::new(r"view\.php\?comic=([0-9]{1,4})").expect("link pattern is valid")
    })
}

fn caption_pattern() -> &'static Regex {
    CAPTION_PATTERN
        .get_or_init(|| Regex::new(r"Comic ([0-9]{1,4}): ").expect("caption pattern is valid"))
}

/// Archive rows look like
/// `<a href="view.php?comic=42">Comic 42: Some Title</a>`. The listing
/// restates the issue number in the caption; a line carries a record only
/// when the link target number agrees with a caption number. Captions are
/// scanned right to left so a title that itself contains a `Comic <n>: `
/// fragment stays intact, and the title runs to the last `</a>` on the line.
fn parse_record(line: &str) -> Option<(u32, &str)> {
    let link = link_pattern().captures(line)?;
    let link_number = link.get(1)?;
    let close = line.rfind("</a>")?;
    let tail = &line[link_number.end()..];

    let captions: Vec<_> = caption_pattern().captures_iter(tail).collect();
    for caption in captions.iter().rev() {
        if &caption[1] != link_number.as_str() {
            continue;
        }
        let title_start = link_number.end() + caption.get(0)?.end();
        if title_start > close {
            continue;
        }
        let number = link_number.as_str().parse().ok()?;
        return Some((number, &line[title_start..close]));
    }
    None
}

/// Scan the archive listing line by line and build the title table.
/// Later occurrences of an issue number overwrite earlier ones; the listing
/// is known to contain duplicated and broken rows.
pub fn extract_titles(text: &str) -> Result<Extraction> {
    let mut table = TitleTable::new();
    let mut raw_records = 0usize;

    for line in text.lines() {
        let Some((number, title)) = parse_record(line) else {
            continue;
        };
        raw_records += 1;
        table.insert(number, title.to_string());
    }

    if table.is_empty() {
        bail!("no comic records extracted from archive listing");
    }

    let missing = missing_issues(&table);
    Ok(Extraction {
        table,
        raw_records,
        missing,
    })
}

/// Every issue number from 1 to the highest key that has no entry.
pub fn missing_issues(table: &TitleTable) -> Vec<u32> {
    let Some(max) = table.keys().next_back().copied() else {
        return Vec::new();
    };
    (1..=max).filter(|number| !table.contains_key(number)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive_line(number: u32, title: &str) -> String {
        format!(
            "<li><a href=\"view.php?comic={number}\">Comic {number}: {title}</a></li>"
        )
    }

    #[test]
    fn extracts_number_and_title_pairs() {
        let text = [
            "<html><body>".to_string(),
            archive_line(1, "Employment Sucks"),
            archive_line(2, "A Name Seemed Appropriate"),
            "</body></html>".to_string(),
        ]
        .join("\n");

        let extraction = extract_titles(&text).expect("extract");
        assert_eq!(extraction.raw_records, 2);
        assert_eq!(extraction.table[&1], "Employment Sucks");
        assert_eq!(extraction.table[&2], "A Name Seemed Appropriate");
        assert!(extraction.missing.is_empty());
    }

    #[test]
    fn ignores_lines_without_a_record() {
        let text = [
            "<p>Random markup</p>".to_string(),
            "view.php?comic=7 but no caption".to_string(),
            archive_line(1, "Only Real Row"),
        ]
        .join("\n");

        let extraction = extract_titles(&text).expect("extract");
        assert_eq!(extraction.table.len(), 1);
    }

    #[test]
    fn mismatched_link_and_caption_numbers_are_skipped() {
        let line = "<a href=\"view.php?comic=931\">Comic 971: Clean Freak</a>";
        let text = [line.to_string(), archive_line(1, "Anchor")].join("\n");
        let extraction = extract_titles(&text).expect("extract");
        assert!(!extraction.table.contains_key(&931));
        assert!(!extraction.table.contains_key(&971));
    }

    #[test]
    fn last_occurrence_wins_on_duplicates() {
        let text = [
            archive_line(42, "Hello World"),
            archive_line(42, "Hello World v2"),
        ]
        .join("\n");

        let extraction = extract_titles(&text).expect("extract");
        assert_eq!(extraction.table[&42], "Hello World v2");
        assert_eq!(extraction.raw_records, 2);
    }

    #[test]
    fn title_containing_a_comic_fragment_still_matches() {
        let line = "<a href=\"view.php?comic=42\">Comic 42: Foo Comic 43: Bar</a>";
        let extraction = extract_titles(line).expect("extract");
        assert_eq!(extraction.table[&42], "Foo Comic 43: Bar");
    }

    #[test]
    fn repeated_matching_caption_keeps_the_rightmost_tail() {
        let line = "<a href=\"view.php?comic=42\">Comic 42: Foo Comic 42: Bar</a>";
        let extraction = extract_titles(line).expect("extract");
        assert_eq!(extraction.table[&42], "Bar");
    }

    #[test]
    fn gap_detection_reports_exactly_the_missing_issue() {
        let text = (1..=10u32)
            .filter(|number| *number != 5)
            .map(|number| archive_line(number, "Title"))
            .collect::<Vec<_>>()
            .join("\n");

        let extraction = extract_titles(&text).expect("extract");
        assert_eq!(extraction.missing, vec![5]);
    }

    #[test]
    fn empty_scrape_is_a_fatal_error() {
        let error = extract_titles("<html>nothing here</html>").expect_err("must fail");
        assert!(error.to_string().contains("no comic records"));
    }

    #[test]
    fn titles_keep_embedded_markup_verbatim() {
        let text = archive_line(100, "He said &quot;hi&quot;");
        let extraction = extract_titles(&text).expect("extract");
        assert_eq!(extraction.table[&100], "He said &quot;hi&quot;");
    }

    #[test]
    fn five_digit_numbers_never_match() {
        let text = [
            "<a href=\"view.php?comic=12345\">Comic 12345: Too Big</a>".to_string(),
            archive_line(1, "Anchor"),
        ]
        .join("\n");
        let extraction = extract_titles(&text).expect("extract");
        assert!(!extraction.table.contains_key(&12345));
    }
}
