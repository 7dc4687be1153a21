mod cell;
mod norm;
mod proj;
mod stacked;

pub use cell::{CellTrace, LstmCell};
pub use norm::{BatchNorm, NormUpdate};
pub use proj::Projection;
pub use stacked::{Forward, SkipMode, StackedLstm};

use std::{fmt, str::FromStr};

use ndarray::{Array3, ArrayView3};

use crate::{
    config::TrainerConfig,
    error::{Result, TrainErr},
    params::{BuildContext, GradientRecord, ParameterSet},
};

/// The generator call contract every variant implements.
///
/// Registration resolves parameters through the shared registry (create on
/// replica 0, reuse afterwards); forward and backward are stateless with
/// respect to the generator itself, so one instance serves every replica
/// concurrently.
pub trait Generator: Send + Sync {
    fn register(&mut self, ctx: &mut BuildContext) -> Result<()>;

    fn forward(
        &self,
        params: &ParameterSet,
        inputs: ArrayView3<f32>,
        lengths: &[usize],
        training: bool,
    ) -> Result<Forward>;

    fn backward(
        &self,
        params: &ParameterSet,
        fwd: &Forward,
        d_output: &Array3<f32>,
        record: &mut GradientRecord,
    ) -> Result<()>;

    /// Running-statistic updates owed by `fwd`, committed with the apply.
    fn norm_updates(&self, fwd: &Forward) -> Result<Vec<NormUpdate>>;
}

/// The closed set of generator variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorKind {
    Lstm,
    BnLstm,
    ResLstmI,
    ResLstmL,
    ResLstmBase,
}

impl GeneratorKind {
    pub fn tag(self) -> &'static str {
        match self {
            GeneratorKind::Lstm => "lstm",
            GeneratorKind::BnLstm => "bnlstm",
            GeneratorKind::ResLstmI => "res_lstm_i",
            GeneratorKind::ResLstmL => "res_lstm_l",
            GeneratorKind::ResLstmBase => "res_lstm_base",
        }
    }
}

impl fmt::Display for GeneratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for GeneratorKind {
    type Err = TrainErr;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lstm" => Ok(GeneratorKind::Lstm),
            "bnlstm" => Ok(GeneratorKind::BnLstm),
            "res_lstm_i" => Ok(GeneratorKind::ResLstmI),
            "res_lstm_l" => Ok(GeneratorKind::ResLstmL),
            "res_lstm_base" => Ok(GeneratorKind::ResLstmBase),
            other => Err(TrainErr::Configuration {
                detail: format!("unrecognized generator type {other}"),
            }),
        }
    }
}

/// Constructs the generator named by `kind`.
///
/// Batch normalization is on for `bnlstm` and whenever the config asks for
/// it; the residual variants differ only in their skip wiring.
pub fn build(kind: GeneratorKind, config: &TrainerConfig, keep_prob: f32) -> Box<dyn Generator> {
    let in_dim = config.window_dim();
    let hidden = config.hidden_units;
    let out_dim = config.output_dim;

    let (layers, skip, batch_norm) = match kind {
        GeneratorKind::Lstm => (2, SkipMode::None, config.batch_norm),
        GeneratorKind::BnLstm => (2, SkipMode::None, true),
        GeneratorKind::ResLstmBase => (3, SkipMode::Layer, config.batch_norm),
        GeneratorKind::ResLstmI => (3, SkipMode::Input, config.batch_norm),
        GeneratorKind::ResLstmL => (3, SkipMode::Span, config.batch_norm),
    };

    Box::new(StackedLstm::new(
        in_dim, hidden, out_dim, layers, skip, batch_norm, keep_prob,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tag_round_trips() {
        for kind in [
            GeneratorKind::Lstm,
            GeneratorKind::BnLstm,
            GeneratorKind::ResLstmI,
            GeneratorKind::ResLstmL,
            GeneratorKind::ResLstmBase,
        ] {
            assert_eq!(kind.tag().parse::<GeneratorKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_tag_is_a_configuration_error() {
        let err = "gru".parse::<GeneratorKind>().unwrap_err();
        assert!(matches!(err, TrainErr::Configuration { .. }));
    }
}
