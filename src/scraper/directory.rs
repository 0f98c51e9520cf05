//! Facility directory scan over the paginated listing.
//!
//! Page 1 is mandatory. When it advertises a page count the remaining pages
//! are fetched concurrently; otherwise pages are walked one by one until an
//! empty (or failed) page.

use super::ReservationSource;
use super::cleaner::clean_facility_rows;
use super::parsers::{parse_listing_page, parse_page_count};
use crate::error::CrawlError;
use crate::models::{Facilities, Facility};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Listing entries on one page: raw entry count (for end-of-listing
/// detection) and the facilities that survived cleaning.
fn read_page(html: &str, page: u32, base_url: &str) -> (usize, Vec<Facility>) {
    match parse_listing_page(html) {
        Ok(rows) => {
            let n = rows.len();
            (n, clean_facility_rows(rows, base_url))
        }
        Err(e) => {
            warn!(page, error = %e, "unreadable listing page");
            (0, vec![])
        }
    }
}

/// Later pages overwrite earlier ones on duplicate ids.
fn merge<F>(into: &mut Facilities, found: Vec<Facility>, filter: &F)
where
    F: Fn(&Facility) -> bool,
{
    for facility in found.into_iter().filter(|f| filter(f)) {
        into.insert(facility.id.clone(), facility);
    }
}

pub async fn scan_facilities<S, F>(
    source: Arc<S>,
    filter: F,
    max_pages: u32,
) -> Result<Facilities, CrawlError>
where
    S: ReservationSource + ?Sized,
    F: Fn(&Facility) -> bool + Send + Sync,
{
    let base_url = source.base_url().to_string();
    let first = source
        .fetch_listing_page(1)
        .await
        .map_err(CrawlError::DirectoryUnavailable)?;

    let mut facilities = Facilities::new();
    let (first_entries, found) = read_page(&first, 1, &base_url);
    merge(&mut facilities, found, &filter);
    info!("Listing page 1: {} entries", first_entries);

    match parse_page_count(&first, &base_url) {
        Some(total) => {
            let last = total.min(max_pages.max(1));
            if total > last {
                warn!(total, last, "listing advertises more pages than max_pages");
            }

            let mut tasks = JoinSet::new();
            for page in 2..=last {
                let source = Arc::clone(&source);
                tasks.spawn(async move { (page, source.fetch_listing_page(page).await) });
            }

            let mut pages = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((page, Ok(html))) => pages.push((page, html)),
                    Ok((page, Err(e))) => warn!(page, error = %e, "listing page failed, skipping"),
                    Err(e) => warn!(error = %e, "listing task failed"),
                }
            }
            pages.sort_by_key(|(page, _)| *page);
            for (page, html) in pages {
                let (entries, found) = read_page(&html, page, &base_url);
                debug!(page, entries, "listing page read");
                merge(&mut facilities, found, &filter);
            }
        }
        None if first_entries > 0 => {
            for page in 2..=max_pages {
                let html = match source.fetch_listing_page(page).await {
                    Ok(html) => html,
                    Err(e) => {
                        warn!(page, error = %e, "listing page failed, treating as end of listing");
                        break;
                    }
                };
                let (entries, found) = read_page(&html, page, &base_url);
                if entries == 0 {
                    debug!("Empty page {}, stopping pagination", page);
                    break;
                }
                merge(&mut facilities, found, &filter);
                if page == max_pages {
                    warn!("Reached page limit ({}), stopping", max_pages);
                }
            }
        }
        None => {}
    }

    info!("Total facilities discovered: {}", facilities.len());
    Ok(facilities)
}
