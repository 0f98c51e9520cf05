use crate::error::ParseError;
use crate::models::{RawFacilityRow, RawTimeSlot};
use scraper::{ElementRef, Html, Selector};
use tracing::warn;
use url::Url;

fn selector(s: &str) -> Result<Selector, ParseError> {
    Selector::parse(s).map_err(|_| ParseError::Selector(s.to_string()))
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text().map(str::trim).collect::<String>()
}

// ── Listing page ──────────────────────────────────────────────────────────────

pub fn parse_listing_page(html: &str) -> Result<Vec<RawFacilityRow>, ParseError> {
    let doc = Html::parse_document(html);

    let item_sel = selector("li.reserve_box_item")?;
    let link_sel = selector("div.btn_wrap a[href*='selectFcltyRceptResveViewU.do']")?;
    let title_sel = selector("div.reserve_title")?;
    let pos_sel = selector("div.reserve_position")?;

    let mut rows = Vec::new();
    for item in doc.select(&item_sel) {
        let href = item
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(|h| h.to_string());

        let title_div = item.select(&title_sel).next();
        let position = title_div.and_then(|t| t.select(&pos_sel).next());

        // Title text is the title block minus its nested position block.
        let title = title_div.map(|t| {
            t.descendants()
                .filter(|n| match position {
                    Some(pos) => !n.ancestors().any(|a| a.id() == pos.id()),
                    None => true,
                })
                .filter_map(|n| n.value().as_text().map(|s| s.trim().to_string()))
                .collect::<String>()
        });

        rows.push(RawFacilityRow {
            href,
            title,
            location: position.map(text_of),
        });
    }

    Ok(rows)
}

/// Largest page index advertised by the pagination widget, if any. Detail
/// links also carry `pageIndex`, so only pager containers are inspected.
///
/// Understands both `href="...?pageIndex=N"` links and `onclick="fn_link_page(N)"`
/// style handlers.
pub fn parse_page_count(html: &str, base_url: &str) -> Option<u32> {
    let doc = Html::parse_document(html);
    let a_sel = selector(".pagination a, .paging a, .paginate a, .board_paging a").ok()?;
    let base = Url::parse(base_url).ok()?;

    doc.select(&a_sel)
        .filter_map(|a| {
            let from_href = a
                .value()
                .attr("href")
                .and_then(|h| base.join(h).ok())
                .and_then(|u| {
                    u.query_pairs()
                        .find(|(k, _)| k == "pageIndex")
                        .and_then(|(_, v)| v.parse::<u32>().ok())
                });
            from_href.or_else(|| a.value().attr("onclick").and_then(page_call_arg))
        })
        .max()
}

/// `fn_egov_link_page(7); return false;` → 7
fn page_call_arg(onclick: &str) -> Option<u32> {
    let start = onclick.find("page(")? + "page(".len();
    let digits: String = onclick[start..]
        .chars()
        .skip_while(|c| *c == '\'' || *c == '"' || c.is_whitespace())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

// ── Time table ────────────────────────────────────────────────────────────────

/// Reads `resveTmList` from the time-table JSON. A malformed document is an
/// error; malformed individual entries are skipped.
pub fn parse_time_table(body: &str) -> Result<Vec<RawTimeSlot>, ParseError> {
    let doc: serde_json::Value = serde_json::from_str(body)?;

    let Some(items) = doc.get("resveTmList").and_then(|v| v.as_array()) else {
        return Ok(vec![]);
    };

    Ok(items
        .iter()
        .filter_map(|item| match serde_json::from_value::<RawTimeSlot>(item.clone()) {
            Ok(slot) => Some(slot),
            Err(e) => {
                warn!(error = %e, "skipping malformed time-table entry");
                None
            }
        })
        .collect())
}
