use anyhow::Result;
use candle_core::Device;
use candle_nn::VarBuilder;
use std::path::Path;
use tracing::info;

use crate::acoustic_codec::AcousticCodec;
use crate::backbone::Backbone;
use crate::config::ModelConfig;
use crate::control::ControlHead;
use crate::diffusion::DiffusionHead;
use crate::semantic_tokenizer::SemanticEncoder;
use crate::speech_connector::SpeechConnector;
use crate::utils::create_checkpoint_varbuilder;

/// Every immutable parameter a session reads.
///
/// Built once per process and shared across sessions behind an `Arc`; nothing
/// in here is mutated after construction.
pub struct ModelWeights {
    pub config: ModelConfig,
    pub codec: AcousticCodec,
    pub semantic: SemanticEncoder,
    pub acoustic_connector: SpeechConnector,
    pub semantic_connector: SpeechConnector,
    pub backbone: Backbone,
    pub control_head: ControlHead,
    pub prediction_head: DiffusionHead,
    device: Device,
}

impl ModelWeights {
    /// Assemble the components from a root VarBuilder.
    pub fn new(vb: VarBuilder, config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let device = vb.device().clone();
        let hidden = config.backbone_config.hidden_size;

        info!("🔧 Building model components on {:?}", device);
        let codec = AcousticCodec::new(vb.clone(), &config)?;
        let semantic = SemanticEncoder::new(vb.pp("semantic_tokenizer.encoder"), &config)?;
        let acoustic_connector = SpeechConnector::new(
            vb.pp("acoustic_connector"),
            config.acoustic_vae_dim,
            hidden,
            "acoustic",
        )?;
        let semantic_connector = SpeechConnector::new(
            vb.pp("semantic_connector"),
            config.semantic_vae_dim,
            hidden,
            "semantic",
        )?;
        let backbone = Backbone::new(vb.pp("language_model"), &config.backbone_config)?;
        let control_head = ControlHead::new(vb.pp("control_head"), hidden)?;
        let prediction_head =
            DiffusionHead::new(vb.pp("prediction_head"), &config.diffusion_head_config, hidden)?;

        info!("✓ Model ready");
        Ok(Self {
            config,
            codec,
            semantic,
            acoustic_connector,
            semantic_connector,
            backbone,
            control_head,
            prediction_head,
            device,
        })
    }

    /// Load `config.json` and every safetensors shard from `model_dir`.
    pub fn load(model_dir: &Path, device: &Device) -> Result<Self> {
        info!("📂 Loading model from {}", model_dir.display());
        let config = ModelConfig::from_file(&model_dir.join("config.json"))?;
        let vb = create_checkpoint_varbuilder(model_dir, device)?;
        Self::new(vb, config)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn hidden_size(&self) -> usize {
        self.config.backbone_config.hidden_size
    }
}
