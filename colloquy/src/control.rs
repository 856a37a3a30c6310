//! Turn-taking control: the event vocabulary, the per-session state machine and
//! the classifier head that scores events from the backbone hidden state.
//!
//! ```text
//! h_t [batch, hidden] → fc1 → ReLU → fc2 → logits [batch, 4] → softmax
//! ```

use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder, linear};
use serde::Deserialize;
use std::fmt;

use crate::rng::SessionRng;

/// What the backbone wants to happen after the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlEvent {
    Continue,
    EndTurn,
    SwitchSpeaker,
    EndOfUtterance,
}

impl ControlEvent {
    pub const COUNT: usize = 4;
    pub const ALL: [ControlEvent; Self::COUNT] = [
        ControlEvent::Continue,
        ControlEvent::EndTurn,
        ControlEvent::SwitchSpeaker,
        ControlEvent::EndOfUtterance,
    ];

    pub fn index(self) -> usize {
        match self {
            ControlEvent::Continue => 0,
            ControlEvent::EndTurn => 1,
            ControlEvent::SwitchSpeaker => 2,
            ControlEvent::EndOfUtterance => 3,
        }
    }

    /// Every event except `Continue` closes the current utterance.
    pub fn ends_utterance(self) -> bool {
        self != ControlEvent::Continue
    }
}

/// Per-session generation state. `SessionEnd` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlState {
    #[default]
    Generating,
    SpeakerSwitchPending,
    UtteranceEnd,
    SessionEnd,
}

impl ControlState {
    /// Apply one frame's decision. Which boundary state an ending event leads to
    /// is fixed by the script: a different next speaker means a switch.
    pub fn on_event(self, event: ControlEvent, next_speaker_differs: bool) -> ControlState {
        match self {
            ControlState::SessionEnd => ControlState::SessionEnd,
            _ if !event.ends_utterance() => ControlState::Generating,
            _ if next_speaker_differs => ControlState::SpeakerSwitchPending,
            _ => ControlState::UtteranceEnd,
        }
    }

    /// Boundary states resolve once the next utterance is primed.
    pub fn resolve(self) -> ControlState {
        match self {
            ControlState::SpeakerSwitchPending | ControlState::UtteranceEnd => {
                ControlState::Generating
            }
            other => other,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ControlState::SessionEnd
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlState::Generating => "generating",
            ControlState::SpeakerSwitchPending => "speaker-switch-pending",
            ControlState::UtteranceEnd => "utterance-end",
            ControlState::SessionEnd => "session-end",
        };
        f.write_str(name)
    }
}

/// How a control event is chosen from the head's distribution.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ControlDecoding {
    #[default]
    Greedy,
    Sampled { temperature: f32 },
}

/// Probabilities over [`ControlEvent::ALL`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlDistribution {
    probs: [f32; ControlEvent::COUNT],
}

impl ControlDistribution {
    pub fn from_logits(logits: &[f32]) -> Result<Self> {
        if logits.len() != ControlEvent::COUNT {
            anyhow::bail!(
                "Control head produced {} logits, expected {}",
                logits.len(),
                ControlEvent::COUNT
            );
        }
        let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut probs = [0.0f32; ControlEvent::COUNT];
        for (p, &l) in probs.iter_mut().zip(logits) {
            *p = (l - max).exp();
        }
        let sum: f32 = probs.iter().sum();
        if !(sum.is_finite() && sum > 0.0) {
            anyhow::bail!("Control logits are not finite: {:?}", logits);
        }
        probs.iter_mut().for_each(|p| *p /= sum);
        Ok(Self { probs })
    }

    pub fn prob(&self, event: ControlEvent) -> f32 {
        self.probs[event.index()]
    }

    pub fn probs(&self) -> &[f32; ControlEvent::COUNT] {
        &self.probs
    }

    /// Most likely event; ties go to the earlier event in [`ControlEvent::ALL`].
    pub fn argmax(&self) -> ControlEvent {
        let mut best = 0;
        for i in 1..ControlEvent::COUNT {
            if self.probs[i] > self.probs[best] {
                best = i;
            }
        }
        ControlEvent::ALL[best]
    }

    /// All mass on `Continue`, used while an utterance is still too short to end.
    pub fn mask_end_events(&self) -> Self {
        let mut probs = [0.0; ControlEvent::COUNT];
        probs[ControlEvent::Continue.index()] = 1.0;
        Self { probs }
    }

    /// Draw with `p_i ∝ p_i^(1 / temperature)`.
    pub fn sample(&self, temperature: f32, rng: &mut SessionRng) -> ControlEvent {
        let weights: Vec<f64> = self
            .probs
            .iter()
            .map(|&p| (p as f64).powf(1.0 / temperature as f64))
            .collect();
        let total: f64 = weights.iter().sum();
        if !(total.is_finite() && total > 0.0) {
            return self.argmax();
        }
        let mut u = rng.uniform() * total;
        for (event, w) in ControlEvent::ALL.iter().zip(&weights) {
            if u < *w {
                return *event;
            }
            u -= w;
        }
        self.argmax()
    }

    pub fn decide(&self, decoding: ControlDecoding, rng: &mut SessionRng) -> ControlEvent {
        match decoding {
            ControlDecoding::Greedy => self.argmax(),
            ControlDecoding::Sampled { temperature } => self.sample(temperature, rng),
        }
    }
}

/// Event classifier on top of the backbone (`control_head.fc1`, `control_head.fc2`).
pub struct ControlHead {
    fc1: Linear,
    fc2: Linear,
}

impl ControlHead {
    pub fn new(vb: VarBuilder, hidden_size: usize) -> Result<Self> {
        Ok(Self {
            fc1: linear(hidden_size, hidden_size, vb.pp("fc1"))?,
            fc2: linear(hidden_size, ControlEvent::COUNT, vb.pp("fc2"))?,
        })
    }

    /// Raw logits `[batch, 4]`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.fc1.forward(x)?.relu()?;
        Ok(self.fc2.forward(&x)?)
    }

    /// Distribution for a single hidden state `[1, hidden]` or `[hidden]`.
    pub fn distribution(&self, hidden: &Tensor) -> Result<ControlDistribution> {
        let hidden = if hidden.rank() == 1 {
            hidden.unsqueeze(0)?
        } else {
            hidden.clone()
        };
        let logits = self.forward(&hidden)?.flatten_all()?.to_vec1::<f32>()?;
        ControlDistribution::from_logits(&logits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_state_transitions() {
        let s = ControlState::Generating;
        assert_eq!(s.on_event(ControlEvent::Continue, true), ControlState::Generating);
        assert_eq!(
            s.on_event(ControlEvent::EndTurn, true),
            ControlState::SpeakerSwitchPending
        );
        assert_eq!(
            s.on_event(ControlEvent::SwitchSpeaker, false),
            ControlState::UtteranceEnd
        );
        assert_eq!(
            s.on_event(ControlEvent::EndOfUtterance, false).resolve(),
            ControlState::Generating
        );

        let end = ControlState::SessionEnd;
        assert_eq!(end.on_event(ControlEvent::Continue, false), end);
        assert_eq!(end.resolve(), end);
        assert!(end.is_terminal());
    }

    #[test]
    fn test_distribution_softmax_and_argmax() {
        let dist = ControlDistribution::from_logits(&[0.0, 2.0, 0.0, 2.0]).unwrap();
        let total: f32 = dist.probs().iter().sum();
        assert!((total - 1.0).abs() < 1e-6);
        // tie resolves to the earlier event
        assert_eq!(dist.argmax(), ControlEvent::EndTurn);

        let masked = dist.mask_end_events();
        assert_eq!(masked.argmax(), ControlEvent::Continue);
        assert_eq!(masked.prob(ControlEvent::EndTurn), 0.0);

        assert!(ControlDistribution::from_logits(&[0.0; 3]).is_err());
        assert!(ControlDistribution::from_logits(&[f32::NAN; 4]).is_err());
    }

    #[test]
    fn test_sampling_is_seeded() {
        let dist = ControlDistribution::from_logits(&[0.1, 0.2, 0.3, 0.4]).unwrap();
        let draw = |seed| {
            let mut rng = SessionRng::new(seed);
            (0..16).map(|_| dist.sample(1.0, &mut rng)).collect::<Vec<_>>()
        };
        assert_eq!(draw(5), draw(5));

        // near-zero temperature collapses onto the argmax
        let mut rng = SessionRng::new(1);
        for _ in 0..8 {
            assert_eq!(dist.sample(0.01, &mut rng), ControlEvent::EndOfUtterance);
        }
    }

    #[test]
    fn test_control_head_shapes() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let head = ControlHead::new(vb, 16).unwrap();
        let h = Tensor::randn(0f32, 1.0, (2, 16), &Device::Cpu).unwrap();
        assert_eq!(head.forward(&h).unwrap().dims(), &[2, 4]);

        let dist = head.distribution(&h.get(0).unwrap()).unwrap();
        let total: f32 = dist.probs().iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_decoding_deserializes() {
        let greedy: ControlDecoding = serde_json::from_str(r#"{"mode": "greedy"}"#).unwrap();
        assert_eq!(greedy, ControlDecoding::Greedy);
        let sampled: ControlDecoding =
            serde_json::from_str(r#"{"mode": "sampled", "temperature": 0.7}"#).unwrap();
        assert_eq!(sampled, ControlDecoding::Sampled { temperature: 0.7 });
    }
}
