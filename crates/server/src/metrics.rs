use std::sync::OnceLock;

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static ARCHIVE_REQUESTS_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static FETCH_REQUESTS_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static ARCHIVED_ROWS_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static LATEST_RECORD_ID: OnceLock<IntGauge> = OnceLock::new();
static ISSUES_TOTAL: OnceLock<IntCounter> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn archive_requests_total() -> &'static IntCounter {
    ARCHIVE_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new("arkiv_archive_requests_total", "Requests posted to /arkiv.")
                .expect("create arkiv_archive_requests_total"),
        )
    })
}

fn fetch_requests_total() -> &'static IntCounter {
    FETCH_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new("arkiv_fetch_requests_total", "Requests posted to /hente.")
                .expect("create arkiv_fetch_requests_total"),
        )
    })
}

fn archived_rows_total() -> &'static IntCounter {
    ARCHIVED_ROWS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "arkiv_archived_rows_total",
                "Rows written to the current generation table.",
            )
            .expect("create arkiv_archived_rows_total"),
        )
    })
}

fn latest_record_id() -> &'static IntGauge {
    LATEST_RECORD_ID.get_or_init(|| {
        register_collector(
            IntGauge::new(
                "arkiv_latest_record_id",
                "Highest record id returned by an archive insert.",
            )
            .expect("create arkiv_latest_record_id"),
        )
    })
}

fn issues_total() -> &'static IntCounter {
    ISSUES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "arkiv_issues_total",
                "Archive and fetch requests that ended in a server error.",
            )
            .expect("create arkiv_issues_total"),
        )
    })
}

pub fn inc_archive_request() {
    archive_requests_total().inc();
}

pub fn inc_fetch_request() {
    fetch_requests_total().inc();
}

pub fn observe_inserted(rows: u64, latest_id: i64) {
    archived_rows_total().inc_by(rows);
    latest_record_id().set(latest_id);
}

pub fn inc_issue() {
    issues_total().inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = archive_requests_total();
    let _ = fetch_requests_total();
    let _ = archived_rows_total();
    let _ = latest_record_id();
    let _ = issues_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_exposes_every_series() {
        inc_archive_request();
        inc_fetch_request();
        inc_issue();
        observe_inserted(3, 42);

        let (body, content_type) = render().expect("render metrics");
        let text = String::from_utf8(body).expect("utf8 exposition");
        assert!(text.contains("arkiv_archive_requests_total"));
        assert!(text.contains("arkiv_fetch_requests_total"));
        assert!(text.contains("arkiv_archived_rows_total"));
        assert!(text.contains("arkiv_latest_record_id 42"));
        assert!(text.contains("arkiv_issues_total"));
        assert!(content_type.starts_with("text/plain"));
    }
}
