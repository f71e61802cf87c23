//! Record extraction from roster result pages.
//!
//! Pure functions over response bodies: no network, no session state. A page
//! without the results grid fails loudly as `Extraction` — the portal serves
//! challenge pages with a 200, and those must never read as "zero results".

use std::collections::HashMap;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::error::{ScrapeError, ScrapeResult};
use crate::models::{Address, Attorney, CaseRecord, Party};

/// Hidden state tokens the portal round-trips on every form submission.
const FORM_TOKEN_FIELDS: [&str; 5] = [
    "__VIEWSTATE",
    "__VIEWSTATEGENERATOR",
    "__EVENTVALIDATION",
    "__EVENTTARGET",
    "__EVENTARGUMENT",
];

/// Pull the hidden validation tokens out of a response body.
pub fn extract_form_tokens(html: &str) -> HashMap<String, String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("input[type='hidden']").unwrap();

    let mut tokens = HashMap::new();
    for input in document.select(&selector) {
        let Some(name) = input.value().attr("name") else {
            continue;
        };
        if FORM_TOKEN_FIELDS.contains(&name) {
            tokens.insert(
                name.to_string(),
                input.value().attr("value").unwrap_or("").to_string(),
            );
        }
    }
    tokens
}

/// Locate the disclaimer accept button, if this is the disclaimer page.
pub fn find_accept_submit(html: &str) -> Option<(String, String)> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("input[type='submit']").unwrap();

    document.select(&selector).find_map(|input| {
        let value = input.value().attr("value")?;
        if value.to_lowercase().contains("accept") {
            Some((
                input.value().attr("name").unwrap_or("btnAccept").to_string(),
                value.to_string(),
            ))
        } else {
            None
        }
    })
}

/// Extract case records and a has-more-pages signal from a results page.
///
/// Malformed rows are skipped; a missing results grid fails the whole page.
pub fn extract_cases(html: &str, source_url: &str) -> ScrapeResult<(Vec<CaseRecord>, bool)> {
    let document = Html::parse_document(html);

    let grid_selector = Selector::parse("table.searchResultsGrid").unwrap();
    let Some(grid) = document.select(&grid_selector).next() else {
        return Err(ScrapeError::extraction(
            "results grid missing from page; likely a challenge response",
        ));
    };

    let row_selector = Selector::parse("tr.standardRow, tr.altRow").unwrap();
    let mut cases = Vec::new();
    for row in grid.select(&row_selector) {
        match parse_case_row(row, source_url) {
            Some(case) => cases.push(case),
            None => debug!("skipping malformed roster row"),
        }
    }

    Ok((cases, has_next_page(&document)))
}

/// Roster grid columns: # | case/caption | plaintiff atty | defendant atty |
/// filed date | sub type | status | tax map | notes.
fn parse_case_row(row: ElementRef<'_>, source_url: &str) -> Option<CaseRecord> {
    let cell_selector = Selector::parse("td").unwrap();
    let cells: Vec<ElementRef<'_>> = row.select(&cell_selector).collect();
    if cells.len() < 9 {
        return None;
    }

    let link_selector = Selector::parse("a").unwrap();
    let case_number = cells[1]
        .select(&link_selector)
        .next()
        .map(|a| cell_text(a))?
        .trim()
        .to_string();
    if case_number.is_empty() {
        return None;
    }

    let mut case = CaseRecord::new(case_number.clone(), source_url);

    let caption = cell_text(cells[1]);
    let caption = caption.trim_start_matches(&case_number).trim().to_string();
    if let Some((plaintiff, defendant)) = parse_caption(&caption) {
        case.plaintiff = plaintiff;
        case.defendant = defendant;
    }

    if let Some(attorney) = parse_attorney(&cell_text(cells[2])) {
        case.plaintiff.attorney = Some(attorney);
    }
    if let Some(attorney) = parse_attorney(&cell_text(cells[3])) {
        case.defendant.attorney = Some(attorney);
    }

    let filed = cell_text(cells[4]).trim().to_string();
    if !filed.is_empty() {
        case.filing_date = Some(filed);
    }

    let sub_type = cell_text(cells[5]).trim().to_string();
    if !sub_type.is_empty() {
        case.case_type = sub_type;
    }

    let notes = cell_text(cells[8]);
    parse_notes(&notes, &mut case);

    Some(case)
}

/// Split a "Plaintiff VS Defendant" caption into parties.
///
/// A "Last, First" defendant counts as source-separated names; a plain
/// combined name populates `full_name` only.
fn parse_caption(caption: &str) -> Option<(Party, Party)> {
    let re = Regex::new(r"(?i)^(.+?)\s+VS\.?\s+(.+?)(?:\s*,\s*defendant.*|\s*,\s*et\s+al.*)?$")
        .unwrap();
    let captures = re.captures(caption.trim())?;

    let plaintiff = Party::from_combined_name(&captures[1]);
    let defendant_text = captures[2].trim();

    let defendant = match defendant_text.split_once(',') {
        Some((last, first))
            if !first.trim().is_empty() && !first.contains(',') && !last.trim().is_empty() =>
        {
            Party::from_split_name(first, last)
        }
        _ => Party::from_combined_name(defendant_text),
    };

    Some((plaintiff, defendant))
}

/// Parse "Jane Q. Counsel (803) 329-8244" style attorney cells.
fn parse_attorney(text: &str) -> Option<Attorney> {
    let re = Regex::new(r"([A-Za-z.\s]+?)\s*\((\d{3})\)\s*(\d{3})-?(\d{4})").unwrap();
    let captures = re.captures(text)?;
    Some(Attorney {
        name: Some(captures[1].trim().to_string()),
        phone: Some(format!("({}) {}-{}", &captures[2], &captures[3], &captures[4])),
    })
}

/// Pull property address, hearing date and court room out of the notes cell.
fn parse_notes(notes: &str, case: &mut CaseRecord) {
    let addr_re = Regex::new(r"(?i)Property Address:\s*(.+?)\s*(?:Judgment|Hearing|Court\s*Room|$)")
        .unwrap();
    if let Some(captures) = addr_re.captures(notes) {
        case.property_address = parse_address(captures[1].trim());
    }

    let hearing_re = Regex::new(r"(?i)Hearing(?:\s*Date)?:\s*(\d{1,2}/\d{1,2}/\d{2,4})").unwrap();
    if let Some(captures) = hearing_re.captures(notes) {
        case.hearing_date = Some(captures[1].to_string());
    }

    let room_re = Regex::new(r"(?i)Court\s*Room:\s*([A-Za-z0-9-]+)").unwrap();
    if let Some(captures) = room_re.captures(notes) {
        case.court_room = Some(captures[1].to_string());
    }
}

/// Parse "875 Rolling Green Drive, Rock Hill, SC 29732" into components.
pub fn parse_address(raw: &str) -> Address {
    let raw = raw.trim();
    let mut address = Address {
        state: "SC".to_string(),
        ..Default::default()
    };

    let zip_re = Regex::new(r"\b(\d{5})(?:-\d{4})?\b").unwrap();
    if let Some(captures) = zip_re.captures(raw) {
        address.zip = captures[1].to_string();
    }

    let city_re = Regex::new(r"(?i),\s*([A-Za-z .]+?)\s*,?\s*(?:SC|South Carolina)\b").unwrap();
    if let Some(captures) = city_re.captures(raw) {
        address.city = captures[1].trim().to_string();
    }

    if !address.city.is_empty() {
        if let Some(prefix) = raw.split(&address.city).next() {
            address.street = prefix.trim().trim_end_matches(',').trim().to_string();
        }
    } else if let Some(prefix) = raw.split(',').next() {
        address.street = prefix.trim().to_string();
    }

    address
}

/// The pager renders the current page as a span and other pages as
/// `Page$N` postback links; more pages exist when a link points past the
/// current page.
fn has_next_page(document: &Html) -> bool {
    let page_re = Regex::new(r"Page\$(\d+)").unwrap();
    let link_selector = Selector::parse("a[href]").unwrap();
    let span_selector = Selector::parse("tr.pagerRow span, td.pager span").unwrap();

    let current: u32 = document
        .select(&span_selector)
        .find_map(|span| cell_text(span).trim().parse().ok())
        .unwrap_or(1);

    document
        .select(&link_selector)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| page_re.captures(href))
        .filter_map(|c| c[1].parse::<u32>().ok())
        .any(|page| page > current)
}

fn cell_text(el: ElementRef<'_>) -> String {
    el.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROSTER_PAGE: &str = r#"<html><body>
    <form method="post" action="./CourtRosters.aspx">
      <input type="hidden" name="__VIEWSTATE" value="vs-token" />
      <input type="hidden" name="__VIEWSTATEGENERATOR" value="CA0B0334" />
      <input type="hidden" name="__EVENTVALIDATION" value="ev-token" />
      <table class="searchResultsGrid">
        <tr><th>#</th><th>Case</th><th>Plaintiff Attorney</th><th>Defendant Attorney</th>
            <th>Filed</th><th>Sub Type</th><th>Status</th><th>Tax Map</th><th>Notes</th></tr>
        <tr class="standardRow">
          <td>1</td>
          <td><a href="CaseDetails.aspx?id=1">2025CP4601197</a> First Portfolio Llc VS Kenneth Roach, defendant, et al</td>
          <td>Jane Q. Counsel (803) 329-8244</td>
          <td></td>
          <td>01/15/2025</td>
          <td>Foreclosure</td>
          <td>Open</td>
          <td>685-01-01-001</td>
          <td>Property Address: 875 Rolling Green Drive, Rock Hill, SC 29732 Hearing: 03/10/2025 Court Room: 2B</td>
        </tr>
        <tr class="altRow">
          <td>2</td>
          <td><a href="CaseDetails.aspx?id=2">2025CP4601204</a> Palmetto Bank VS SMITH, JANE, defendant</td>
          <td></td>
          <td>R. Defender (803) 555-0101</td>
          <td>02/01/2025</td>
          <td>Foreclosure</td>
          <td>Open</td>
          <td>685-01-01-002</td>
          <td>Property Address: 12 Oak St, Fort Mill, SC 29715</td>
        </tr>
        <tr class="standardRow">
          <td>3</td>
          <td>no case link here</td>
          <td></td><td></td><td></td><td></td><td></td><td></td><td></td>
        </tr>
        <tr class="pagerRow">
          <td colspan="9">
            <span>1</span>
            <a href="javascript:__doPostBack('gvRoster','Page$2')">2</a>
          </td>
        </tr>
      </table>
    </form>
    </body></html>"#;

    #[test]
    fn extracts_cases_and_next_page_signal() {
        let (cases, has_next) =
            extract_cases(ROSTER_PAGE, "https://portal.example/courtrosters/").unwrap();

        assert_eq!(cases.len(), 2);
        assert!(has_next);

        let first = &cases[0];
        assert_eq!(first.case_number, "2025CP4601197");
        assert_eq!(first.case_type, "Foreclosure");
        assert_eq!(first.filing_date.as_deref(), Some("01/15/2025"));
        assert_eq!(first.hearing_date.as_deref(), Some("03/10/2025"));
        assert_eq!(first.court_room.as_deref(), Some("2B"));
        assert_eq!(first.plaintiff.full_name, "First Portfolio Llc");
        // Combined name: full only, no guessed split
        assert_eq!(first.defendant.full_name, "Kenneth Roach");
        assert!(first.defendant.first_name.is_empty());
        assert_eq!(first.property_address.street, "875 Rolling Green Drive");
        assert_eq!(first.property_address.city, "Rock Hill");
        assert_eq!(first.property_address.zip, "29732");

        let attorney = first.plaintiff.attorney.as_ref().unwrap();
        assert_eq!(attorney.name.as_deref(), Some("Jane Q. Counsel"));
        assert_eq!(attorney.phone.as_deref(), Some("(803) 329-8244"));
        assert!(first.defendant.attorney.is_none());
    }

    #[test]
    fn comma_separated_defendant_is_source_split() {
        let (cases, _) =
            extract_cases(ROSTER_PAGE, "https://portal.example/courtrosters/").unwrap();
        let second = &cases[1];
        assert_eq!(second.defendant.first_name, "JANE");
        assert_eq!(second.defendant.last_name, "SMITH");
        assert_eq!(second.defendant.full_name, "JANE SMITH");
    }

    #[test]
    fn missing_grid_is_extraction_error_not_empty() {
        let challenge = "<html><body><h1>Checking your browser</h1></body></html>";
        let err = extract_cases(challenge, "https://portal.example/").unwrap_err();
        assert!(matches!(err, ScrapeError::Extraction(_)));
    }

    #[test]
    fn last_page_has_no_next_signal() {
        let last_page = ROSTER_PAGE.replace(
            "<span>1</span>",
            "<a href=\"javascript:__doPostBack('gvRoster','Page$1')\">1</a>",
        );
        let last_page = last_page.replace(
            "<a href=\"javascript:__doPostBack('gvRoster','Page$2')\">2</a>",
            "<span>2</span>",
        );
        let (_, has_next) =
            extract_cases(&last_page, "https://portal.example/courtrosters/").unwrap();
        assert!(!has_next);
    }

    #[test]
    fn form_tokens_round_trip() {
        let tokens = extract_form_tokens(ROSTER_PAGE);
        assert_eq!(tokens.get("__VIEWSTATE").map(String::as_str), Some("vs-token"));
        assert_eq!(
            tokens.get("__EVENTVALIDATION").map(String::as_str),
            Some("ev-token")
        );
        assert!(!tokens.contains_key("__EVENTTARGET"));
    }

    #[test]
    fn accept_submit_found_on_disclaimer_page() {
        let disclaimer = r#"<html><form>
            <input type="hidden" name="__VIEWSTATE" value="d1" />
            <input type="submit" name="btnContinue" value="Accept" />
        </form></html>"#;
        let (name, value) = find_accept_submit(disclaimer).unwrap();
        assert_eq!(name, "btnContinue");
        assert_eq!(value, "Accept");

        assert!(find_accept_submit(ROSTER_PAGE).is_none());
    }

    #[test]
    fn address_parsing_handles_missing_city() {
        let addr = parse_address("875 Rolling Green Drive, Rock Hill, SC 29732");
        assert_eq!(addr.street, "875 Rolling Green Drive");
        assert_eq!(addr.city, "Rock Hill");
        assert_eq!(addr.state, "SC");
        assert_eq!(addr.zip, "29732");

        let bare = parse_address("12 Oak St");
        assert_eq!(bare.street, "12 Oak St");
        assert!(bare.city.is_empty());
        assert!(bare.zip.is_empty());
    }
}
