//! Conditioning signals and classifier-free guidance modes.
//!
//! A generation call is conditioned on at most one kind of signal:
//!
//! - `label`: one class id per batch element, `[B]`
//! - `action`: one action id per frame, `[B, T]`; unroll step `s` sees the
//!   prefix of length `s + 1`
//!
//! The null id of each kind (one past its last valid id) stands for "no
//! condition" in the unconditional branch of classifier-free guidance.

use std::str::FromStr;

use candle_core::Tensor;

use crate::config::ConditionConfig;
use crate::{Error, Result};

/// The supported condition kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    Label,
    Action,
}

impl ConditionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionKind::Label => "label",
            ConditionKind::Action => "action",
        }
    }
}

impl FromStr for ConditionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "label" => Ok(ConditionKind::Label),
            "action" => Ok(ConditionKind::Action),
            other => Err(Error::UnsupportedCondition(other.to_string())),
        }
    }
}

/// Conditioning payload for one generation call.
#[derive(Debug, Clone)]
pub enum Conditions {
    /// Class ids, `[B]`.
    Label(Tensor),
    /// Action ids, `[B, T]`.
    Action(Tensor),
}

impl Conditions {
    /// Build conditions from `(kind, tensor)` pairs, e.g. loaded from a dataset
    /// sample. No pairs means unconditional generation.
    pub fn from_named<I, S>(entries: I) -> Result<Option<Self>>
    where
        I: IntoIterator<Item = (S, Tensor)>,
        S: AsRef<str>,
    {
        let mut found: Option<Self> = None;
        for (name, tensor) in entries {
            let cond = match name.as_ref().parse::<ConditionKind>()? {
                ConditionKind::Label => Conditions::Label(tensor),
                ConditionKind::Action => Conditions::Action(tensor),
            };
            if let Some(prev) = &found {
                return Err(Error::Config(format!(
                    "only one condition kind may be set, got '{}' and '{}'",
                    prev.kind().as_str(),
                    cond.kind().as_str()
                )));
            }
            found = Some(cond);
        }
        Ok(found)
    }

    pub fn kind(&self) -> ConditionKind {
        match self {
            Conditions::Label(_) => ConditionKind::Label,
            Conditions::Action(_) => ConditionKind::Action,
        }
    }

    pub fn tensor(&self) -> &Tensor {
        match self {
            Conditions::Label(t) | Conditions::Action(t) => t,
        }
    }

    /// Conditions seen by absolute frame index `step`.
    ///
    /// Actions are cut to the prefix `0..=step`; labels are passed through.
    /// The result is a fresh value, so nothing done to it leaks into later steps.
    pub fn for_step(&self, step: usize) -> Result<Self> {
        Ok(match self {
            Conditions::Label(labels) => Conditions::Label(labels.clone()),
            Conditions::Action(actions) => Conditions::Action(actions.narrow(1, 0, step + 1)?),
        })
    }

    /// Apply the guidance mode: prepend a null batch for classifier-free
    /// guidance, or replace everything with null ids for unconditional runs.
    pub fn apply_guidance(&self, guidance: Guidance, cfg: &ConditionConfig) -> Result<Self> {
        match self {
            Conditions::Label(labels) => {
                let labels = labels.flatten_all()?;
                let null_id = cfg.null_label_id()?;
                Ok(Conditions::Label(with_null(&labels, null_id, guidance)?))
            }
            Conditions::Action(actions) => {
                let null_id = cfg.null_action_id()?;
                Ok(Conditions::Action(with_null(actions, null_id, guidance)?))
            }
        }
    }
}

fn with_null(ids: &Tensor, null_id: u32, guidance: Guidance) -> Result<Tensor> {
    let null = || -> Result<Tensor> {
        Ok(Tensor::full(null_id, ids.shape(), ids.device())?.to_dtype(ids.dtype())?)
    };
    match guidance {
        Guidance::ClassifierFree(_) => Ok(Tensor::cat(&[&null()?, ids], 0)?),
        Guidance::Unconditional => null(),
        Guidance::Unguided => Ok(ids.clone()),
    }
}

/// Guidance regime selected by the guidance scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Guidance {
    /// Scale `<= 1`: conditions used as-is, single pass.
    Unguided,
    /// Scale `> 1`: batch doubled as `[uncond, cond]` and combined with this scale.
    ClassifierFree(f64),
    /// Scale `== -1`: single pass with null conditions.
    Unconditional,
}

impl Guidance {
    pub fn from_scale(scale: f64) -> Self {
        if scale > 1.0 {
            Guidance::ClassifierFree(scale)
        } else if scale == -1.0 {
            Guidance::Unconditional
        } else {
            Guidance::Unguided
        }
    }

    /// How many copies of the batch the denoiser sees.
    pub fn batch_multiplier(&self) -> usize {
        match self {
            Guidance::ClassifierFree(_) => 2,
            Guidance::Unguided | Guidance::Unconditional => 1,
        }
    }

    /// Duplicate `xs` along the batch axis when guidance needs both branches.
    pub fn expand_batch(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Guidance::ClassifierFree(_) => Ok(Tensor::cat(&[xs, xs], 0)?),
            Guidance::Unguided | Guidance::Unconditional => Ok(xs.clone()),
        }
    }

    /// Fold a `[uncond; cond]` prediction into `uncond + s * (cond - uncond)`.
    pub fn combine(&self, noise_pred: &Tensor) -> Result<Tensor> {
        match self {
            Guidance::ClassifierFree(scale) => {
                let halves = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&halves[0], &halves[1]);
                Ok((uncond + ((cond - uncond)? * *scale)?)?)
            }
            Guidance::Unguided | Guidance::Unconditional => Ok(noise_pred.clone()),
        }
    }
}

impl std::fmt::Display for Guidance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Guidance::Unguided => write!(f, "unguided"),
            Guidance::ClassifierFree(s) => write!(f, "cfg({s})"),
            Guidance::Unconditional => write!(f, "unconditional"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn cfg() -> ConditionConfig {
        ConditionConfig {
            num_classes: Some(10),
            num_action_classes: Some(4),
        }
    }

    #[test]
    fn test_from_named() {
        let dev = Device::Cpu;
        let labels = Tensor::new(&[1u32, 2], &dev).unwrap();
        let cond = Conditions::from_named([("label", labels)]).unwrap().unwrap();
        assert_eq!(cond.kind(), ConditionKind::Label);

        let none = Conditions::from_named(Vec::<(&str, Tensor)>::new()).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_unsupported_kind() {
        let dev = Device::Cpu;
        let t = Tensor::new(&[1u32], &dev).unwrap();
        let err = Conditions::from_named([("foo", t)]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedCondition(ref k) if k == "foo"));
    }

    #[test]
    fn test_two_kinds_rejected() {
        let dev = Device::Cpu;
        let t = Tensor::new(&[1u32], &dev).unwrap();
        let err = Conditions::from_named([("label", t.clone()), ("action", t)]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_guidance_from_scale() {
        assert_eq!(Guidance::from_scale(4.0), Guidance::ClassifierFree(4.0));
        assert_eq!(Guidance::from_scale(1.0), Guidance::Unguided);
        assert_eq!(Guidance::from_scale(0.0), Guidance::Unguided);
        assert_eq!(Guidance::from_scale(-1.0), Guidance::Unconditional);
        assert_eq!(Guidance::from_scale(-0.5), Guidance::Unguided);
        assert_eq!(Guidance::from_scale(4.0).batch_multiplier(), 2);
    }

    #[test]
    fn test_action_prefix() {
        let dev = Device::Cpu;
        let actions = Tensor::new(&[[0u32, 1, 2, 3], [3, 2, 1, 0]], &dev).unwrap();
        let cond = Conditions::Action(actions);
        let step = cond.for_step(2).unwrap();
        let ids: Vec<Vec<u32>> = step.tensor().to_vec2().unwrap();
        assert_eq!(ids, vec![vec![0, 1, 2], vec![3, 2, 1]]);
    }

    #[test]
    fn test_cfg_label_batch() {
        let dev = Device::Cpu;
        let cond = Conditions::Label(Tensor::new(&[[3u32], [5]], &dev).unwrap());
        let out = cond
            .apply_guidance(Guidance::ClassifierFree(2.0), &cfg())
            .unwrap();
        let ids: Vec<u32> = out.tensor().to_vec1().unwrap();
        assert_eq!(ids, vec![10, 10, 3, 5]);
    }

    #[test]
    fn test_unconditional_actions() {
        let dev = Device::Cpu;
        let cond = Conditions::Action(Tensor::new(&[[0u32, 1]], &dev).unwrap());
        let out = cond.apply_guidance(Guidance::Unconditional, &cfg()).unwrap();
        let ids: Vec<Vec<u32>> = out.tensor().to_vec2().unwrap();
        assert_eq!(ids, vec![vec![4, 4]]);
    }

    #[test]
    fn test_unguided_passthrough() {
        let dev = Device::Cpu;
        let cond = Conditions::Action(Tensor::new(&[[0u32, 1]], &dev).unwrap());
        let out = cond.apply_guidance(Guidance::Unguided, &cfg()).unwrap();
        assert_eq!(out.tensor().dims(), &[1, 2]);
    }

    #[test]
    fn test_combine() {
        let dev = Device::Cpu;
        // uncond = 1, cond = 3, scale 2 -> 1 + 2 * (3 - 1) = 5
        let pred = Tensor::new(&[[1f32], [3f32]], &dev).unwrap();
        let out = Guidance::ClassifierFree(2.0).combine(&pred).unwrap();
        let v: Vec<Vec<f32>> = out.to_vec2().unwrap();
        assert_eq!(v, vec![vec![5.0]]);
    }
}
