use std::{num::NonZeroUsize, path::PathBuf, process};

use log::{error, info};
use ndarray::Array3;
use ndarray_rand::{RandomExt, rand_distr::Normal};

use denoise_trainer::{
    OptimizerKind, TrainerConfig, TrainSession,
    device::Device,
    generator::GeneratorKind,
    metrics::JsonlSink,
};

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        error!("training failed: {e}");
        process::exit(1);
    }
}

fn run() -> denoise_trainer::Result<()> {
    let config = TrainerConfig {
        learning_rate: 1e-3,
        batch_size: NonZeroUsize::new(8).unwrap(),
        keep_prob: 0.8,
        batch_norm: false,
        l2_scale: 1e-5,
        input_dim: 40,
        output_dim: 40,
        left_context: 2,
        right_context: 2,
        hidden_units: 128,
        generator: GeneratorKind::Lstm,
        optimizer: OptimizerKind::default(),
        devices: vec![Device::Lane(0), Device::Lane(1)],
        save_dir: PathBuf::from("exp/denoise"),
        seed: None,
    };

    let sink = JsonlSink::create(&config.save_dir)?;
    let batch = config.batch_size.get();
    let window_dim = config.window_dim();
    let output_dim = config.output_dim;

    let mut session = TrainSession::new(config, false, Box::new(sink))?;

    if session.load(None, false)? {
        info!("resumed from step {}", session.global_step());
    }

    let steps = 100;
    let frames = 20;
    let lengths = vec![frames; batch];

    for _ in 0..steps {
        // Synthetic noisy/clean pairs stand in for a feature pipeline.
        let clean = Array3::random((batch, frames, output_dim), Normal::new(0.0, 1.0).unwrap());
        let noise = Array3::random((batch, frames, window_dim), Normal::new(0.0, 0.3).unwrap());
        let noisy = stack_context(&clean, window_dim) + noise;

        let outcome = session.train_step(noisy.view(), clean.view(), &lengths)?;
        if session.global_step() % 20 == 0 {
            let merged = denoise_trainer::loss::LossReport::merge(&outcome.losses);
            info!(step = session.global_step(); "g_loss={:.6}", merged.total);
        }
    }

    let path = session.save()?;
    info!("saved {}", path.display());
    Ok(())
}

/// Tiles the clean features across the context window to fake the stacked
/// input a real frontend would produce.
fn stack_context(clean: &Array3<f32>, window_dim: usize) -> Array3<f32> {
    let (batch, frames, dim) = clean.dim();
    let copies = window_dim / dim;

    let mut stacked = Array3::<f32>::zeros((batch, frames, window_dim));
    for c in 0..copies {
        stacked
            .slice_mut(ndarray::s![.., .., c * dim..(c + 1) * dim])
            .assign(clean);
    }
    stacked
}
