use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec, TextEncoder,
};

lazy_static! {
    pub static ref MEASUREMENTS: CounterVec = register_counter_vec!(
        "diagnoser_measurements_total",
        "Benchmark measurements taken",
        &["run_id", "label", "result"] // result: ok, failed
    ).unwrap();

    pub static ref MEASUREMENT_REUSES: CounterVec = register_counter_vec!(
        "diagnoser_measurement_reuses_total",
        "Tests answered from the run history instead of the benchmark",
        &["run_id", "label"]
    ).unwrap();

    pub static ref MEASUREMENT_DURATION: HistogramVec = register_histogram_vec!(
        "diagnoser_measurement_duration_seconds",
        "Wall-clock duration of a single benchmark measurement",
        &["run_id", "label"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    ).unwrap();

    pub static ref SUSPECT_NODES: GaugeVec = register_gauge_vec!(
        "diagnoser_suspect_nodes",
        "Nodes flagged per detection method in the last run",
        &["run_id", "method"]
    ).unwrap();

    pub static ref RUN_DURATION: HistogramVec = register_histogram_vec!(
        "diagnoser_run_duration_seconds",
        "Wall-clock duration of a full diagnosis run",
        &["run_id", "mode"],
        vec![60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 14400.0]
    ).unwrap();
}

pub fn export_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families)
}

#[derive(Clone, Debug)]
pub struct MetricsContext {
    pub run_id: String,
}

impl MetricsContext {
    pub fn new(run_id: String) -> Self {
        Self { run_id }
    }

    pub fn record_measurement(&self, label: &str, result: &str, duration_s: f64) {
        MEASUREMENTS
            .with_label_values(&[self.run_id.as_str(), label, result])
            .inc();
        MEASUREMENT_DURATION
            .with_label_values(&[self.run_id.as_str(), label])
            .observe(duration_s);
    }

    pub fn record_reuse(&self, label: &str) {
        MEASUREMENT_REUSES
            .with_label_values(&[self.run_id.as_str(), label])
            .inc();
    }

    pub fn record_suspects(&self, method: &str, count: usize) {
        SUSPECT_NODES
            .with_label_values(&[self.run_id.as_str(), method])
            .set(count as f64);
    }

    pub fn record_run_duration(&self, mode: &str, duration_s: f64) {
        RUN_DURATION
            .with_label_values(&[self.run_id.as_str(), mode])
            .observe(duration_s);
    }
}
