use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
};

use log::info;
use serde::Serialize;

use crate::{error::Result, loss::LossReport};

/// Consumes one merged record per training step.
pub trait MetricsSink: Send {
    fn record_step(&mut self, step: u64, replicas: &[LossReport]);
}

/// One step's scalar summary, merged across replicas.
#[derive(Debug, Serialize)]
struct StepRecord<'a> {
    step: u64,
    g_mse_loss: f32,
    g_l2_loss: f32,
    g_loss: f32,
    replicas: &'a [LossReport],
}

/// Logs the merged losses through the `log` facade.
#[derive(Debug, Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn record_step(&mut self, step: u64, replicas: &[LossReport]) {
        let merged = LossReport::merge(replicas);
        info!(
            step = step;
            "g_mse_loss={:.6} g_l2_loss={:.6} g_loss={:.6}",
            merged.mse, merged.l2, merged.total
        );
    }
}

/// Appends one JSON object per step under `{save_dir}/train`.
pub struct JsonlSink {
    out: BufWriter<File>,
}

impl JsonlSink {
    /// Opens (or continues) the metrics stream below `save_dir`.
    pub fn create(save_dir: &Path) -> Result<Self> {
        let dir = save_dir.join("train");
        fs::create_dir_all(&dir)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("metrics.jsonl"))?;

        Ok(Self {
            out: BufWriter::new(file),
        })
    }
}

impl MetricsSink for JsonlSink {
    fn record_step(&mut self, step: u64, replicas: &[LossReport]) {
        let merged = LossReport::merge(replicas);
        let record = StepRecord {
            step,
            g_mse_loss: merged.mse,
            g_l2_loss: merged.l2,
            g_loss: merged.total,
            replicas,
        };

        // A failed metrics write never fails the step.
        if serde_json::to_writer(&mut self.out, &record).is_ok() {
            let _ = self.out.write_all(b"\n");
            let _ = self.out.flush();
        }
    }
}

/// Discards everything; used by evaluation-only sessions and tests.
#[derive(Debug, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record_step(&mut self, _step: u64, _replicas: &[LossReport]) {}
}
