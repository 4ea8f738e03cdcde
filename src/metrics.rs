//! Prometheus metrics.
//!
//! All series are registered against one registry that the metrics
//! listener renders. Label values are drawn from fixed vocabularies
//! (error reasons, apply modes, results); nothing user-controlled or
//! secret-derived ever becomes a label.

use prometheus::{
    Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub reconciles_total: IntCounterVec,
    pub apply_total: IntCounterVec,
    pub ssh_failures_total: IntCounterVec,
    pub reconcile_duration_seconds: Histogram,
    pub apply_duration_seconds: Histogram,
    pub managed_machines: IntGauge,
    pub machines_reachable: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciles_total = IntCounterVec::new(
            Opts::new("reconciles_total", "Reconcile outcomes"),
            &["result"],
        )?;
        let apply_total = IntCounterVec::new(
            Opts::new("apply_total", "Apply invocations by mode and result"),
            &["mode", "result"],
        )?;
        let ssh_failures_total = IntCounterVec::new(
            Opts::new("ssh_failures_total", "SSH failures by classification"),
            &["kind"],
        )?;
        let reconcile_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("reconcile_duration_seconds", "Reconcile wall time")
                .buckets(vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]),
        )?;
        let apply_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("apply_duration_seconds", "Apply wall time")
                .buckets(vec![60.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0, 7200.0]),
        )?;
        let managed_machines = IntGauge::new("managed_machines", "Machines known to the operator")?;
        let machines_reachable =
            IntGauge::new("machines_reachable", "Machines currently reachable")?;

        registry.register(Box::new(reconciles_total.clone()))?;
        registry.register(Box::new(apply_total.clone()))?;
        registry.register(Box::new(ssh_failures_total.clone()))?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;
        registry.register(Box::new(apply_duration_seconds.clone()))?;
        registry.register(Box::new(managed_machines.clone()))?;
        registry.register(Box::new(machines_reachable.clone()))?;

        Ok(Self {
            registry,
            reconciles_total,
            apply_total,
            ssh_failures_total,
            reconcile_duration_seconds,
            apply_duration_seconds,
            managed_machines,
            machines_reachable,
        })
    }

    pub fn observe_reconcile(&self, result: &str, seconds: f64) {
        self.reconciles_total.with_label_values(&[result]).inc();
        self.reconcile_duration_seconds.observe(seconds);
    }

    pub fn observe_apply(&self, mode: &str, result: &str, seconds: f64) {
        self.apply_total.with_label_values(&[mode, result]).inc();
        if result == "success" {
            self.apply_duration_seconds.observe(seconds);
        }
    }

    pub fn ssh_failure(&self, kind: &str) {
        self.ssh_failures_total.with_label_values(&[kind]).inc();
    }

    /// Render the registry in the text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}
