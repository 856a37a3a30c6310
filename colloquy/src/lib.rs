//! Colloquy: long-form multi-speaker speech synthesis by next-token diffusion.
//!
//! A causal backbone reads the script and a pooled summary of the audio it has
//! produced so far. Each step it decides whether the current utterance goes on
//! and conditions a diffusion head that draws one 7.5 Hz latent frame. At the
//! end the σ-VAE codec decodes the whole latent sequence to 24 kHz audio.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use colloquy::{ModelWeights, Script, Session, SessionConfig, SpeakerProfile, select_device};
//!
//! let device = select_device(None)?;
//! let weights = Arc::new(ModelWeights::load("models/colloquy".as_ref(), &device)?);
//! let voice = SpeakerProfile::from_seed(1, 7, weights.hidden_size(), &device)?;
//!
//! let mut session = Session::new(weights, SessionConfig::default(), vec![Arc::new(voice)])?;
//! let output = session.run(&Script::single(1, "Hello there")?)?;
//! output.audio.save_wav("hello.wav")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod error;

pub mod acoustic_codec;
pub mod audio;
pub mod backbone;
pub mod config;
pub mod control;
pub mod diffusion;
pub mod latent;
pub mod model;
pub mod postprocess;
pub mod rng;
pub mod sampler;
pub mod script;
pub mod semantic_tokenizer;
pub mod session;
pub mod speaker;
pub mod speech_connector;
pub mod streaming_cache;
pub mod tokenizer;

pub(crate) mod utils;
pub(crate) mod vae_decoder;
pub(crate) mod vae_encoder;
pub(crate) mod vae_layers;

#[cfg(test)]
mod testing;

pub use audio::{AudioData, load_wav};
pub use config::{ModelConfig, RetryPolicy, SAMPLE_RATE, SessionConfig};
pub use control::{ControlDecoding, ControlEvent, ControlState};
pub use error::{ColloquyError, Result, SessionFailure};
pub use latent::{LatentFrame, LatentSequence};
pub use model::ModelWeights;
pub use postprocess::{
    DisclaimerMixer, DisclaimerPlacement, PostProcessChain, RequestContext, RequestLogger,
    WatermarkEmbedder, WaveformPostProcessor,
};
pub use script::{Script, ScriptParser, SpeakerLineParser, Utterance};
pub use session::{
    CancellationToken, Session, SessionMetadata, SessionOutput, StepOutcome, TerminationReason,
};
pub use speaker::{SpeakerLibrary, SpeakerProfile};
pub use tokenizer::{ByteTokenizer, HfTokenizer, TextTokenizer};

// Logging and device setup for the CLI
pub use utils::{init_file_logging, init_logging, resolve_voice_path, select_device};
