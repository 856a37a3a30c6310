use anyhow::{Context, Result, anyhow};
use clap::Parser;
use colloquy::{
    ControlDecoding, DisclaimerMixer, DisclaimerPlacement, HfTokenizer, ModelWeights,
    PostProcessChain, RequestContext, RequestLogger, SAMPLE_RATE, Script, ScriptParser, Session,
    SessionConfig, SpeakerLineParser, SpeakerProfile, WatermarkEmbedder, load_wav,
    resolve_voice_path, select_device,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "colloquy")]
#[command(
    author,
    version,
    about = "Long-form multi-speaker dialogue synthesis"
)]
struct Cli {
    /// Checkpoint directory with config.json, *.safetensors and optionally tokenizer.json
    #[arg(short, long)]
    model_dir: PathBuf,

    /// Script file with "Speaker N: text" lines
    #[arg(short, long, conflicts_with = "text")]
    script: Option<PathBuf>,

    /// Single-speaker text to synthesize
    #[arg(short, long)]
    text: Option<String>,

    /// Reference audio for a speaker, as N=path or N=name (repeatable)
    #[arg(short, long = "voice", value_parser = parse_voice)]
    voices: Vec<(u8, String)>,

    /// Output file path
    #[arg(short, long, default_value = "output.wav")]
    output: PathBuf,

    /// CFG (Classifier-Free Guidance) scale for diffusion generation
    #[arg(long, default_value = "1.3")]
    cfg_scale: f32,

    /// Number of diffusion steps per frame
    #[arg(long, default_value = "10")]
    steps: usize,

    /// Random seed for deterministic output
    #[arg(long, default_value = "524242")]
    seed: u64,

    /// Context length in tokens: 4096, 16384, 32768 or 65536
    #[arg(long, default_value = "32768")]
    max_context: usize,

    /// Frames pooled into one context token
    #[arg(long)]
    summary_window: Option<usize>,

    /// Sample control events at this temperature instead of taking the argmax
    #[arg(long)]
    control_temperature: Option<f32>,

    /// Spoken notice appended to the output
    #[arg(long)]
    disclaimer: Option<PathBuf>,

    /// Key for the provenance watermark
    #[arg(long)]
    watermark_key: Option<String>,

    /// CUDA device ordinal
    #[arg(long)]
    cuda: Option<usize>,

    /// Write tracing logs to logs/ instead of stderr
    #[arg(long)]
    tracing: bool,
}

fn parse_voice(s: &str) -> std::result::Result<(u8, String), String> {
    let (id, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected N=path, got '{}'", s))?;
    let id: u8 = id
        .trim()
        .parse()
        .map_err(|e| format!("invalid speaker id '{}': {}", id, e))?;
    Ok((id, path.trim().to_string()))
}

fn load_script(cli: &Cli) -> Result<(Script, String)> {
    match (&cli.script, &cli.text) {
        (Some(path), _) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read script {}", path.display()))?;
            Ok((SpeakerLineParser::new()?.parse(&raw)?, raw))
        }
        (None, Some(text)) => Ok((Script::single(1, text.clone())?, text.clone())),
        (None, None) => Err(anyhow!("Provide --script or --text")),
    }
}

fn build_profiles(
    cli: &Cli,
    weights: &ModelWeights,
    script: &Script,
) -> Result<Vec<Arc<SpeakerProfile>>> {
    let voices: BTreeMap<u8, &str> = cli.voices.iter().map(|(id, p)| (*id, p.as_str())).collect();
    let script_dir = cli.script.as_deref().and_then(Path::parent);
    let mut rng = colloquy::rng::SessionRng::new(cli.seed);

    script
        .speakers()
        .into_iter()
        .map(|id| {
            let profile = match voices.get(&id) {
                Some(voice) => {
                    let path = resolve_voice_path(voice, script_dir)?;
                    info!("Speaker {}: {}", id, path.display());
                    let audio = load_wav(&path, SAMPLE_RATE)?;
                    SpeakerProfile::from_reference_audio(weights, id, &audio, &mut rng)?
                }
                None => {
                    warn!("⚠️  No voice for speaker {}, using a seeded preset", id);
                    SpeakerProfile::from_seed(
                        id,
                        cli.seed.wrapping_add(id as u64),
                        weights.hidden_size(),
                        weights.device(),
                    )?
                }
            };
            Ok(Arc::new(profile))
        })
        .collect()
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.tracing {
        let log_path = colloquy::init_file_logging(Path::new("logs"), "colloquy")?;
        eprintln!("Logging to {}", log_path.display());
    } else {
        colloquy::init_logging("info")?;
    }

    info!("Colloquy Dialogue Synthesis");
    info!("────────────────────────────────────────────");

    let (script, raw_text) = load_script(&cli)?;
    info!(
        "Script: {} utterance(s), speakers {:?}",
        script.len(),
        script.speakers()
    );

    let device = select_device(cli.cuda)?;
    let weights = Arc::new(ModelWeights::load(&cli.model_dir, &device)?);
    let profiles = build_profiles(&cli, &weights, &script)?;

    let mut config = SessionConfig {
        max_context_tokens: cli.max_context,
        sampler_steps: cli.steps,
        guidance_weight: cli.cfg_scale,
        seed: cli.seed,
        ..SessionConfig::default()
    };
    if let Some(window) = cli.summary_window {
        config.summary_window = window;
    }
    if let Some(temperature) = cli.control_temperature {
        config.control_decoding = ControlDecoding::Sampled { temperature };
    }

    let mut session = Session::new(weights, config, profiles)?;
    let tokenizer_path = cli.model_dir.join("tokenizer.json");
    if tokenizer_path.exists() {
        session = session.with_tokenizer(Arc::new(HfTokenizer::from_file(&tokenizer_path)?))?;
    } else {
        warn!("⚠️  No tokenizer.json in {}, using byte tokens", cli.model_dir.display());
    }

    let output = match session.run(&script) {
        Ok(output) => output,
        Err(failure) => {
            if !failure.partial.audio.is_empty() {
                failure.partial.audio.save_wav(&cli.output)?;
                warn!(
                    "⚠️  Saved {:.1}s of partial audio to {}",
                    failure.partial.audio.duration_secs(),
                    cli.output.display()
                );
            }
            return Err(failure.into_error().into());
        }
    };

    let mut chain = PostProcessChain::new();
    if let Some(path) = &cli.disclaimer {
        let clip = load_wav(path, SAMPLE_RATE)?;
        chain = chain.with(DisclaimerMixer::new(clip, DisclaimerPlacement::Append, 0.5));
    }
    if let Some(key) = &cli.watermark_key {
        chain = chain.with(WatermarkEmbedder::new(key, WatermarkEmbedder::DEFAULT_STRENGTH));
    }
    chain = chain.with(RequestLogger);

    let request = RequestContext {
        request_text: raw_text,
        seed: cli.seed,
    };
    let audio = chain.apply(output.audio, &request)?;
    audio.save_wav(&cli.output)?;

    let meta = &output.metadata;
    info!("────────────────────────────────────────────");
    info!(
        "Finished ({}): {} frames, {} context tokens",
        meta.termination_reason, meta.total_frames, meta.context_tokens_used
    );
    info!(
        "Saved: {} ({:.1}s audio)",
        cli.output.display(),
        audio.duration_secs()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_voice() {
        assert_eq!(parse_voice("2=voices/alice.wav").unwrap(), (2, "voices/alice.wav".to_string()));
        assert!(parse_voice("alice.wav").is_err());
        assert!(parse_voice("x=alice.wav").is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["colloquy", "--model-dir", "m", "--text", "hi"]).unwrap();
        assert_eq!(cli.cfg_scale, 1.3);
        assert_eq!(cli.steps, 10);
        assert_eq!(cli.seed, 524242);
        assert_eq!(cli.max_context, 32768);
        assert!(cli.voices.is_empty());

        let cli = Cli::try_parse_from([
            "colloquy", "-m", "m", "-s", "dialog.txt", "--voice", "1=a.wav", "--voice", "2=b",
        ])
        .unwrap();
        assert_eq!(cli.voices.len(), 2);
        assert!(Cli::try_parse_from(["colloquy", "-m", "m", "-s", "a", "-t", "b"]).is_err());
    }
}
