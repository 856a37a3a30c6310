//! Tiny random-init models for unit tests.

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use serde_json::json;
use std::sync::{Arc, OnceLock};

use crate::config::ModelConfig;
use crate::model::ModelWeights;
use crate::speaker::SpeakerProfile;

/// Real 3200× hop with a few filters per stage and a 2-layer backbone.
pub fn tiny_config() -> ModelConfig {
    let tokenizer = |vae_dim: usize, std_dist_type: &str, fix_std: f64| {
        json!({
            "vae_dim": vae_dim,
            "std_dist_type": std_dist_type,
            "fix_std": fix_std,
            "pad_mode": "constant",
            "encoder_n_filters": 2,
            "encoder_ratios": [8, 5, 5, 4, 2, 2],
            "encoder_depths": "1-1-1-1-1-1-1"
        })
    };
    serde_json::from_value(json!({
        "model_type": "colloquy-tiny",
        "backbone_config": {
            "hidden_size": 32,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "num_hidden_layers": 2,
            "vocab_size": 300,
            "intermediate_size": 64,
            "max_position_embeddings": 65536,
            "rope_theta": 1000000.0,
            "rms_norm_eps": 1e-6
        },
        "diffusion_head_config": {
            "hidden_size": 32,
            "latent_size": 8,
            "head_layers": 2
        },
        "acoustic_tokenizer_config": tokenizer(8, "gaussian", 0.5),
        "semantic_tokenizer_config": tokenizer(8, "none", 0.0),
        "acoustic_vae_dim": 8,
        "semantic_vae_dim": 8
    }))
    .expect("tiny config deserializes")
}

/// Shared random-init weights for [`tiny_config`], built once per test binary.
pub fn tiny_weights() -> Arc<ModelWeights> {
    static WEIGHTS: OnceLock<Arc<ModelWeights>> = OnceLock::new();
    WEIGHTS
        .get_or_init(|| {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            Arc::new(ModelWeights::new(vb, tiny_config()).expect("tiny weights build"))
        })
        .clone()
}

/// Preset profile for `speaker_id` with a seed-derived embedding.
pub fn tiny_profile(speaker_id: u8, seed: u64) -> Arc<SpeakerProfile> {
    let weights = tiny_weights();
    Arc::new(
        SpeakerProfile::from_seed(speaker_id, seed, weights.hidden_size(), weights.device())
            .expect("tiny profile builds"),
    )
}
