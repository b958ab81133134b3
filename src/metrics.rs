use std::sync::LazyLock;

use prometheus::*;

static METRIC_SYNC_CYCLE_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("meal_sync_cycle_count", "count of index sync cycles", &["result"])
        .unwrap()
});

static METRIC_SYNC_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "meal_sync_duration",
        "duration of a full sync cycle in seconds",
        exponential_buckets(0.5, 2., 12).unwrap()
    )
    .unwrap()
});

static METRIC_DOWNLOAD_FAILURE_COUNT: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("meal_download_failure_count", "count of failed image downloads")
        .unwrap()
});

static METRIC_INDEX_SIZE: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("meal_index_size", "number of images in the live index").unwrap()
});

static METRIC_SEARCH_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "meal_search_duration",
        "duration of the per-image search in seconds",
        &["top_n"]
    )
    .unwrap()
});

/// 记录一轮同步的结果
pub fn inc_sync_cycle(success: bool, duration: f32) {
    let result = if success { "ok" } else { "error" };
    METRIC_SYNC_CYCLE_COUNT.with_label_values(&[result]).inc();
    METRIC_SYNC_DURATION.observe(duration as f64);
}

pub fn inc_download_failure() {
    METRIC_DOWNLOAD_FAILURE_COUNT.inc();
}

pub fn set_index_size(size: usize) {
    METRIC_INDEX_SIZE.set(size as i64);
}

pub fn inc_search_duration(top_n: usize, duration: f32) {
    METRIC_SEARCH_DURATION
        .with_label_values(&[to_fixed_top_n(top_n)])
        .observe(duration as f64);
}

/// 将结果数量调整到几个固定值，避免标签数量无限增长
fn to_fixed_top_n(top_n: usize) -> &'static str {
    if top_n <= 5 {
        "5"
    } else if top_n <= 10 {
        "10"
    } else if top_n <= 20 {
        "20"
    } else if top_n <= 50 {
        "50"
    } else {
        "50+"
    }
}
