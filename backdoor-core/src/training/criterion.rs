//! Loss functions used by the poisoning and defense experiments.

use crate::error::BackdoorError;
use crate::training::variant::VariantConfig;
use ndarray::{Array2, Array3, ArrayView1, ArrayView2, Axis, concatenate};
use serde::{Deserialize, Serialize};

/// Criterion selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionConfig {
    CrossEntropy(CrossEntropyOptions),
    Simclr(SimClrOptions),
    Sce(SceOptions),
    Mixmatch(MixMatchOptions),
}

impl Default for CriterionConfig {
    fn default() -> Self {
        Self::CrossEntropy(CrossEntropyOptions::default())
    }
}

impl VariantConfig for CriterionConfig {
    const KIND: &'static str = "criterion";
    const VARIANTS: &'static [&'static str] = &["cross_entropy", "simclr", "sce", "mixmatch"];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    #[default]
    Mean,
    Sum,
}

impl Reduction {
    fn reduce(self, values: impl ExactSizeIterator<Item = f32>) -> f32 {
        let n = values.len();
        let total: f32 = values.sum();
        match self {
            Reduction::Mean if n > 0 => total / n as f32,
            Reduction::Mean => 0.0,
            Reduction::Sum => total,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrossEntropyOptions {
    #[serde(default)]
    pub reduction: Reduction,
    #[serde(default)]
    pub label_smoothing: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimClrOptions {
    pub temperature: f32,
    #[serde(default)]
    pub reduction: Reduction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceOptions {
    pub alpha: f32,
    pub beta: f32,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixMatchOptions {
    pub rampup_length: f32,
    #[serde(default = "default_lambda_u")]
    pub lambda_u: f32,
}

fn default_num_classes() -> usize {
    10
}

fn default_lambda_u() -> f32 {
    75.0
}

/// What a criterion is evaluated on.
#[derive(Debug, Clone)]
pub enum LossInput {
    /// Logits `[batch, classes]` with one hard label per row.
    Classification {
        logits: Array2<f32>,
        labels: Vec<usize>,
    },
    /// L2-normalised projections of two augmented views, `[batch, 2, dim]`.
    Contrastive { features: Array3<f32> },
    /// Labeled and unlabeled logits with soft targets; `epoch` may be
    /// fractional (epoch + batch / batches).
    SemiSupervised {
        x_logits: Array2<f32>,
        x_targets: Array2<f32>,
        u_logits: Array2<f32>,
        u_targets: Array2<f32>,
        epoch: f32,
    },
}

impl LossInput {
    fn kind(&self) -> &'static str {
        match self {
            LossInput::Classification { .. } => "classification",
            LossInput::Contrastive { .. } => "contrastive",
            LossInput::SemiSupervised { .. } => "semi-supervised",
        }
    }
}

pub trait Criterion: Send + Sync {
    fn name(&self) -> &'static str;

    fn loss(&self, input: &LossInput) -> Result<f32, BackdoorError>;
}

pub fn build_criterion(config: &CriterionConfig) -> Result<Box<dyn Criterion>, BackdoorError> {
    Ok(match config {
        CriterionConfig::CrossEntropy(options) => {
            if !(0.0..=1.0).contains(&options.label_smoothing) {
                return Err(BackdoorError::config(format!(
                    "label_smoothing must be in [0, 1], got {}",
                    options.label_smoothing
                )));
            }
            Box::new(CrossEntropyLoss::new(options.clone()))
        }
        CriterionConfig::Simclr(options) => {
            if options.temperature <= 0.0 {
                return Err(BackdoorError::config("simclr temperature must be positive"));
            }
            Box::new(SimClrLoss::new(options.clone()))
        }
        CriterionConfig::Sce(options) => Box::new(SceLoss::new(options.clone())),
        CriterionConfig::Mixmatch(options) => Box::new(MixMatchLoss::new(options.clone())),
    })
}

fn wrong_input(criterion: &str, input: &LossInput) -> BackdoorError {
    BackdoorError::invalid_input(format!(
        "{criterion} loss cannot be computed on {} input",
        input.kind()
    ))
}

fn log_softmax(row: ArrayView1<f32>) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = row.iter().map(|&x| (x - max).exp()).sum();
    let lse = max + sum.ln();
    row.iter().map(|&x| x - lse).collect()
}

fn check_labels(logits: ArrayView2<f32>, labels: &[usize]) -> Result<(), BackdoorError> {
    let (batch, classes) = logits.dim();
    if batch != labels.len() {
        return Err(BackdoorError::invalid_input(format!(
            "{batch} logit rows but {} labels",
            labels.len()
        )));
    }
    if let Some(bad) = labels.iter().find(|&&l| l >= classes) {
        return Err(BackdoorError::invalid_input(format!(
            "label {bad} out of range for {classes} classes"
        )));
    }
    Ok(())
}

fn same_shape(a: &Array2<f32>, b: &Array2<f32>, what: &str) -> Result<(), BackdoorError> {
    if a.dim() != b.dim() {
        return Err(BackdoorError::invalid_input(format!(
            "{what}: logits {:?} and targets {:?} differ in shape",
            a.dim(),
            b.dim()
        )));
    }
    Ok(())
}

/// Per-sample negative log-likelihood, with optional label smoothing.
fn cross_entropy_terms(
    logits: ArrayView2<f32>,
    labels: &[usize],
    smoothing: f32,
) -> Vec<f32> {
    logits
        .outer_iter()
        .zip(labels)
        .map(|(row, &label)| {
            let log_p = log_softmax(row);
            let nll = -log_p[label];
            if smoothing > 0.0 {
                let uniform = -log_p.iter().sum::<f32>() / log_p.len() as f32;
                (1.0 - smoothing) * nll + smoothing * uniform
            } else {
                nll
            }
        })
        .collect()
}

pub struct CrossEntropyLoss {
    options: CrossEntropyOptions,
}

impl CrossEntropyLoss {
    pub fn new(options: CrossEntropyOptions) -> Self {
        Self { options }
    }
}

impl Criterion for CrossEntropyLoss {
    fn name(&self) -> &'static str {
        "cross_entropy"
    }

    fn loss(&self, input: &LossInput) -> Result<f32, BackdoorError> {
        let LossInput::Classification { logits, labels } = input else {
            return Err(wrong_input(self.name(), input));
        };
        check_labels(logits.view(), labels)?;
        let terms = cross_entropy_terms(logits.view(), labels, self.options.label_smoothing);
        Ok(self.options.reduction.reduce(terms.into_iter()))
    }
}

/// Symmetric cross entropy: `alpha * CE + beta * reverse CE`.
pub struct SceLoss {
    options: SceOptions,
}

impl SceLoss {
    pub fn new(options: SceOptions) -> Self {
        Self { options }
    }
}

impl Criterion for SceLoss {
    fn name(&self) -> &'static str {
        "sce"
    }

    fn loss(&self, input: &LossInput) -> Result<f32, BackdoorError> {
        let LossInput::Classification { logits, labels } = input else {
            return Err(wrong_input(self.name(), input));
        };
        check_labels(logits.view(), labels)?;
        if logits.ncols() != self.options.num_classes {
            return Err(BackdoorError::invalid_input(format!(
                "sce configured for {} classes, logits have {}",
                self.options.num_classes,
                logits.ncols()
            )));
        }

        let ce = Reduction::Mean.reduce(cross_entropy_terms(logits.view(), labels, 0.0).into_iter());
        // log(clamp(one_hot, 1e-4, 1)) is 0 on the label and ln(1e-4) elsewhere.
        let log_floor = 1e-4f32.ln();
        let rce = logits.outer_iter().zip(labels).map(|(row, &label)| {
            let log_p = log_softmax(row);
            -log_p
                .iter()
                .enumerate()
                .filter(|&(c, _)| c != label)
                .map(|(_, &lp)| lp.exp().clamp(1e-7, 1.0) * log_floor)
                .sum::<f32>()
        });
        let rce = Reduction::Mean.reduce(rce.collect::<Vec<_>>().into_iter());
        Ok(self.options.alpha * ce + self.options.beta * rce)
    }
}

/// NT-Xent over two views: each first-view anchor is contrasted against all
/// `2 * batch` features except itself, with its second view as the positive.
pub struct SimClrLoss {
    options: SimClrOptions,
}

impl SimClrLoss {
    pub fn new(options: SimClrOptions) -> Self {
        Self { options }
    }
}

impl Criterion for SimClrLoss {
    fn name(&self) -> &'static str {
        "simclr"
    }

    fn loss(&self, input: &LossInput) -> Result<f32, BackdoorError> {
        let LossInput::Contrastive { features } = input else {
            return Err(wrong_input(self.name(), input));
        };
        let (batch, views, _) = features.dim();
        if views != 2 {
            return Err(BackdoorError::invalid_input(format!(
                "simclr expects 2 views per sample, got {views}"
            )));
        }

        let anchor = features.index_axis(Axis(1), 0);
        let other = features.index_axis(Axis(1), 1);
        let contrast = concatenate(Axis(0), &[anchor, other])
            .map_err(|e| BackdoorError::invalid_input(e.to_string()))?;
        let logits = anchor.dot(&contrast.t()) / self.options.temperature;

        let terms = logits.outer_iter().enumerate().map(|(i, row)| {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let denom: f32 = row
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(_, &x)| (x - max).exp())
                .sum();
            -((row[batch + i] - max) - denom.ln())
        });
        Ok(self.options.reduction.reduce(terms.collect::<Vec<_>>().into_iter()))
    }
}

/// Components of the MixMatch objective.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixMatchTerms {
    /// Soft-target cross entropy on the labeled batch.
    pub lx: f32,
    /// Mean squared error between unlabeled predictions and guesses.
    pub lu: f32,
    /// Ramped weight applied to `lu`.
    pub lambda_u: f32,
}

pub struct MixMatchLoss {
    options: MixMatchOptions,
}

impl MixMatchLoss {
    pub fn new(options: MixMatchOptions) -> Self {
        Self { options }
    }

    pub fn linear_rampup(&self, epoch: f32) -> f32 {
        if self.options.rampup_length == 0.0 {
            return 1.0;
        }
        (epoch / self.options.rampup_length).clamp(0.0, 1.0)
    }

    pub fn terms(&self, input: &LossInput) -> Result<MixMatchTerms, BackdoorError> {
        let LossInput::SemiSupervised {
            x_logits,
            x_targets,
            u_logits,
            u_targets,
            epoch,
        } = input
        else {
            return Err(wrong_input("mixmatch", input));
        };
        same_shape(x_logits, x_targets, "labeled batch")?;
        same_shape(u_logits, u_targets, "unlabeled batch")?;

        let lx = x_logits.outer_iter().zip(x_targets.outer_iter()).map(|(row, target)| {
            -log_softmax(row)
                .iter()
                .zip(target.iter())
                .map(|(lp, t)| lp * t)
                .sum::<f32>()
        });
        let lx = Reduction::Mean.reduce(lx.collect::<Vec<_>>().into_iter());

        let squared = u_logits.outer_iter().zip(u_targets.outer_iter()).flat_map(|(row, target)| {
            log_softmax(row)
                .into_iter()
                .zip(target.iter())
                .map(|(lp, &t)| (lp.exp() - t).powi(2))
                .collect::<Vec<_>>()
        });
        let lu = Reduction::Mean.reduce(squared.collect::<Vec<_>>().into_iter());

        Ok(MixMatchTerms {
            lx,
            lu,
            lambda_u: self.options.lambda_u * self.linear_rampup(*epoch),
        })
    }
}

impl Criterion for MixMatchLoss {
    fn name(&self) -> &'static str {
        "mixmatch"
    }

    fn loss(&self, input: &LossInput) -> Result<f32, BackdoorError> {
        let t = self.terms(input)?;
        Ok(t.lx + t.lambda_u * t.lu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn classification(logits: Array2<f32>, labels: Vec<usize>) -> LossInput {
        LossInput::Classification { logits, labels }
    }

    #[test]
    fn test_cross_entropy_uniform_logits() {
        let ce = build_criterion(&CriterionConfig::default()).unwrap();
        let loss = ce
            .loss(&classification(Array2::zeros((4, 10)), vec![0, 1, 2, 3]))
            .unwrap();
        assert!((loss - 10f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_cross_entropy_sum_reduction() {
        let ce = CrossEntropyLoss::new(CrossEntropyOptions {
            reduction: Reduction::Sum,
            label_smoothing: 0.0,
        });
        let loss = ce
            .loss(&classification(Array2::zeros((3, 2)), vec![0, 1, 0]))
            .unwrap();
        assert!((loss - 3.0 * 2f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_cross_entropy_label_out_of_range() {
        let ce = CrossEntropyLoss::new(CrossEntropyOptions::default());
        let err = ce
            .loss(&classification(Array2::zeros((1, 3)), vec![3]))
            .unwrap_err();
        assert!(matches!(err, BackdoorError::InvalidInput(_)));
    }

    #[test]
    fn test_sce_confident_prediction_has_small_reverse_term() {
        let sce = SceLoss::new(SceOptions {
            alpha: 0.0,
            beta: 1.0,
            num_classes: 3,
        });
        let confident = sce
            .loss(&classification(array![[20.0, 0.0, 0.0]], vec![0]))
            .unwrap();
        let wrong = sce
            .loss(&classification(array![[0.0, 20.0, 0.0]], vec![0]))
            .unwrap();
        assert!(confident < 1e-3);
        // Mass on a wrong class costs -ln(1e-4) per unit.
        assert!((wrong - 9.2103).abs() < 1e-2);
    }

    #[test]
    fn test_simclr_prefers_aligned_views() {
        let simclr = SimClrLoss::new(SimClrOptions {
            temperature: 0.5,
            reduction: Reduction::Mean,
        });
        let aligned = Array3::from_shape_vec(
            (2, 2, 2),
            vec![1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0],
        )
        .unwrap();
        let swapped = Array3::from_shape_vec(
            (2, 2, 2),
            vec![1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0],
        )
        .unwrap();
        let good = simclr.loss(&LossInput::Contrastive { features: aligned }).unwrap();
        let bad = simclr.loss(&LossInput::Contrastive { features: swapped }).unwrap();
        assert!(good < bad);
    }

    #[test]
    fn test_mixmatch_rampup_and_terms() {
        let mm = MixMatchLoss::new(MixMatchOptions {
            rampup_length: 10.0,
            lambda_u: 75.0,
        });
        assert_eq!(mm.linear_rampup(5.0), 0.5);
        assert_eq!(mm.linear_rampup(20.0), 1.0);

        let input = LossInput::SemiSupervised {
            x_logits: Array2::zeros((2, 2)),
            x_targets: array![[1.0, 0.0], [0.0, 1.0]],
            u_logits: Array2::zeros((1, 2)),
            u_targets: array![[0.5, 0.5]],
            epoch: 5.0,
        };
        let terms = mm.terms(&input).unwrap();
        assert!((terms.lx - 2f32.ln()).abs() < 1e-5);
        assert!(terms.lu.abs() < 1e-7);
        assert!((terms.lambda_u - 37.5).abs() < 1e-5);
        assert!((mm.loss(&input).unwrap() - 2f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_wrong_input_kind() {
        let simclr = SimClrLoss::new(SimClrOptions {
            temperature: 0.5,
            reduction: Reduction::Mean,
        });
        let err = simclr
            .loss(&classification(Array2::zeros((1, 2)), vec![0]))
            .unwrap_err();
        assert!(err.to_string().contains("classification"));
    }

    #[test]
    fn test_unsupported_criterion() {
        let err = CriterionConfig::from_value(&serde_json::json!({"focal": {"gamma": 2}}))
            .unwrap_err();
        assert!(matches!(
            err,
            BackdoorError::UnsupportedVariant { kind: "criterion", .. }
        ));
    }
}
