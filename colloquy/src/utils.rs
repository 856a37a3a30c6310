use anyhow::{Error as AnyErr, Result};
use candle_core::{D, DType, Device, Tensor};
use candle_nn::VarBuilder;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Resolve a reference-audio path from user input.
///
/// Accepts an existing path (absolute, relative to the working directory or
/// relative to `script_dir`) or a bare voice name looked up as `<name>.wav`
/// in the `voices/` folders next to the script and in the working directory.
pub fn resolve_voice_path(voice_input: &str, script_dir: Option<&Path>) -> Result<PathBuf> {
    let voice_path = Path::new(voice_input);

    if voice_path.is_absolute() {
        if voice_path.exists() {
            return Ok(voice_path.to_path_buf());
        }
        return Err(AnyErr::msg(format!(
            "Voice file not found at absolute path: {}",
            voice_input
        )));
    }

    if voice_path.exists() {
        debug!("Voice resolved as relative path: {:?}", voice_path);
        return Ok(voice_path.to_path_buf());
    }

    if let Some(script_dir) = script_dir {
        let relative_to_script = script_dir.join(voice_path);
        if relative_to_script.exists() {
            debug!("Voice resolved relative to script dir: {:?}", relative_to_script);
            return Ok(relative_to_script);
        }
    }

    let voice_name = if voice_input.ends_with(".wav") {
        voice_input.to_string()
    } else {
        format!("{}.wav", voice_input)
    };

    let mut search_dirs: Vec<PathBuf> = Vec::new();
    if let Some(script_dir) = script_dir {
        search_dirs.push(script_dir.join("voices"));
    }
    search_dirs.push(PathBuf::from("./voices"));

    for dir in &search_dirs {
        let candidate = dir.join(&voice_name);
        if candidate.exists() {
            debug!("Voice '{}' resolved to: {:?}", voice_input, candidate);
            return Ok(candidate);
        }
    }

    let searched: Vec<String> = search_dirs.iter().map(|d| d.display().to_string()).collect();
    Err(AnyErr::msg(format!(
        "Voice '{}' not found. Searched:\n  - As path: {}\n  - In directories: {}",
        voice_input,
        voice_input,
        searched.join(", ")
    )))
}

/// Device selection with CUDA and Metal support, falling back to CPU.
pub fn select_device(cuda_device: Option<usize>) -> Result<Device> {
    if let Some(ordinal) = cuda_device {
        match Device::new_cuda(ordinal) {
            Ok(device) => {
                info!("Using CUDA device {}", ordinal);
                return Ok(device);
            }
            Err(e) => info!("CUDA not available: {}, trying Metal...", e),
        }
    }
    match Device::new_metal(0) {
        Ok(device) => {
            info!("Using Metal device");
            Ok(device)
        }
        Err(_) => {
            info!("Using CPU device");
            Ok(Device::Cpu)
        }
    }
}

/// Sinusoidal timestep features `[batch, dim]`, cosine half first.
pub fn timestep_embedding(timesteps: &Tensor, dim: usize) -> Result<Tensor> {
    let device = timesteps.device();
    let half_dim = dim / 2;
    let emb_scale = -(10000.0_f32.ln()) / half_dim as f32;
    let positions = Tensor::arange(0f32, half_dim as f32, device)?;
    let emb = positions.affine(emb_scale as f64, 0.0)?.exp()?;
    let emb = timesteps
        .to_dtype(DType::F32)?
        .unsqueeze(D::Minus1)?
        .broadcast_mul(&emb.unsqueeze(0)?)?;
    Ok(Tensor::cat(&[&emb.cos()?, &emb.sin()?], D::Minus1)?)
}

/// One-line tensor summary for debug logs.
///
/// Example: "shape=[1, 5, 896], mean=0.003293, std=0.365257, min=-4.322391, max=5.308450"
pub fn tensor_stats(t: &Tensor) -> String {
    let shape = format!("{:?}", t.dims());
    let values = match t
        .flatten_all()
        .and_then(|f| f.to_dtype(DType::F32))
        .and_then(|f| f.to_vec1::<f32>())
    {
        Ok(v) => v,
        Err(e) => return format!("shape={}, error computing stats: {}", shape, e),
    };
    if values.is_empty() {
        return format!("shape={}, empty", shape);
    }

    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    let min = values.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);

    format!(
        "shape={}, mean={:.6}, std={:.6}, min={:.6}, max={:.6}",
        shape,
        mean,
        var.sqrt(),
        min,
        max
    )
}

/// Build a VarBuilder over every `*.safetensors` shard in `model_dir`.
///
/// Checkpoints nest everything under `model.`; that prefix is stripped so
/// component paths read `language_model.*`, `acoustic_tokenizer.*` and so on.
/// BF16 tensors are widened to F32.
pub fn create_checkpoint_varbuilder<'a>(
    model_dir: &Path,
    device: &'a Device,
) -> Result<VarBuilder<'a>> {
    let mut shard_files: Vec<PathBuf> = std::fs::read_dir(model_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext == "safetensors")
                .unwrap_or(false)
        })
        .collect();
    shard_files.sort();

    if shard_files.is_empty() {
        return Err(AnyErr::msg(format!(
            "No .safetensors files found in {}",
            model_dir.display()
        )));
    }

    let mut all_tensors: HashMap<String, Tensor> = HashMap::new();
    let mut bf16_count = 0;
    for shard_file in &shard_files {
        debug!("Loading shard {:?}", shard_file);
        for (name, tensor) in candle_core::safetensors::load(shard_file, device)? {
            let tensor = if tensor.dtype() == DType::BF16 {
                bf16_count += 1;
                tensor.to_dtype(DType::F32)?
            } else {
                tensor
            };
            let name = match name.strip_prefix("model.") {
                Some(stripped) => stripped.to_string(),
                None => name,
            };
            all_tensors.insert(name, tensor);
        }
    }

    if !all_tensors.keys().any(|k| k.starts_with("acoustic_tokenizer.decoder")) {
        warn!("⚠️  No acoustic decoder weights found in checkpoint");
    }
    debug!(
        "Loaded {} tensors from {} shard(s), converted {} BF16 tensors to F32",
        all_tensors.len(),
        shard_files.len(),
        bf16_count
    );

    Ok(VarBuilder::from_tensors(all_tensors, DType::F32, device))
}

/// Install a stderr subscriber filtered by `RUST_LOG`, falling back to `default_filter`.
pub fn init_logging(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| AnyErr::msg(format!("Failed to install tracing subscriber: {}", e)))
}

/// Route all tracing output to a timestamped log file under `log_dir`.
///
/// Returns the path to the log file.
pub fn init_file_logging(log_dir: &Path, run_name: &str) -> Result<PathBuf> {
    use std::time::{SystemTime, UNIX_EPOCH};
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    std::fs::create_dir_all(log_dir)?;
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let log_path = log_dir.join(format!("{}_{}.log", run_name, timestamp));
    let log_file = File::create(&log_path)?;

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::new(&filter))
        .with(fmt::layer().with_writer(log_file).with_ansi(false))
        .try_init()
        .map_err(|e| AnyErr::msg(format!("Failed to install tracing subscriber: {}", e)))?;

    Ok(log_path)
}
