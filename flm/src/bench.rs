//! Benchmark driver.
//!
//! Measures TTFT, prefill throughput and decode throughput at doubling
//! context lengths (1k, 2k, 4k, ...), several iterations each, and writes
//! the aggregate statistics to a date-stamped CSV.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use flm_engine::catalog::ModelCatalog;
use flm_engine::meta::ChatMeta;
use flm_engine::{CancelHandle, EngineRuntime, LmInput};
use flm_npu::{DeviceManager, NpuGeneration, PowerMode};

const CSV_HEADER: &str = "context_length_k,ttft_avg_s,ttft_std_s,ttft_min_s,ttft_max_s,prefill_avg_toks_per_s,prefill_std_toks_per_s,prefill_min_toks_per_s,prefill_max_toks_per_s,decoding_avg_toks_per_s,decoding_std_toks_per_s,decoding_min_toks_per_s,decoding_max_toks_per_s";

/// Tokens decoded per measurement run.
const DECODE_TOKENS: usize = 128;

const DEFAULT_INPUT_TEXT: &str = "The runtime schedules work across a grid of \
compute tiles, streaming weights and activations through the shim DMA engines \
while the key and value caches grow one position per generated token. Each \
layer alternates between attention and the feed-forward block, and the \
scheduler keeps the accelerator busy by overlapping transfers with compute. \
Measuring this pipeline end to end needs prompts long enough to exercise the \
sliding windows, so this paragraph repeats until the target context length is \
reached. ";

#[derive(Debug, Clone, Copy, Default)]
struct Stat {
    avg: f32,
    std: f32,
    min: f32,
    max: f32,
}

fn stat_of(data: &[f32]) -> Stat {
    if data.is_empty() {
        return Stat::default();
    }
    let mut min = data[0];
    let mut max = data[0];
    let mut sum = 0f32;
    for &v in data {
        sum += v;
        min = min.min(v);
        max = max.max(v);
    }
    let avg = sum / data.len() as f32;
    let var = data.iter().map(|v| (v - avg) * (v - avg)).sum::<f32>() / data.len() as f32;
    Stat {
        avg,
        std: var.sqrt(),
        min,
        max,
    }
}

fn sanitize_for_filename(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn cpu_name() -> String {
    let Ok(info) = std::fs::read_to_string("/proc/cpuinfo") else {
        return String::new();
    };
    info.lines()
        .find(|line| line.starts_with("model name"))
        .and_then(|line| line.split(':').nth(1))
        .map(|name| name.trim().to_string())
        .unwrap_or_default()
}

struct BenchConfig {
    max_length: usize,
    input_text: String,
    iterations: usize,
}

fn load_config(path: Option<&Path>) -> Result<BenchConfig, String> {
    let Some(path) = path else {
        return Ok(BenchConfig {
            max_length: 32_768,
            input_text: DEFAULT_INPUT_TEXT.repeat(8),
            iterations: 8,
        });
    };
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| format!("bad benchmark config: {e}"))?;
    Ok(BenchConfig {
        max_length: value["max_length"].as_u64().unwrap_or(32_768) as usize,
        input_text: value["input_text"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_INPUT_TEXT.repeat(8)),
        iterations: value["iterations"].as_u64().unwrap_or(8) as usize,
    })
}

pub fn run(catalog: Arc<ModelCatalog>, tag: &str, prompt: Option<&Path>) -> Result<(), String> {
    let config = load_config(prompt)?;
    let max_length = config.max_length.max(8192).next_power_of_two();
    let stages = (max_length / 1024).ilog2() as usize + 1;

    let device = DeviceManager::new(0, NpuGeneration::Npu2, PowerMode::Performance, false)
        .map(Arc::new)
        .map_err(|e| format!("cannot open the NPU device: {e}"))?;
    let mut runtime = EngineRuntime::new(device, catalog, Some(max_length + DECODE_TOKENS));
    let model = runtime.ensure_loaded(tag).map_err(|e| e.to_string())?;
    let (unit_tokens, unit_text) = model.prepare_benchmark(&config.input_text).map_err(|e| e.to_string())?;
    println!(
        "Starting benchmark with {stages} stages, {} iterations ({unit_tokens} tokens per 1k unit)...",
        config.iterations
    );

    let mut ttft = vec![Vec::new(); stages];
    let mut prefill = vec![Vec::new(); stages];
    let mut decode = vec![Vec::new(); stages];
    let cancel = CancelHandle::new();

    for iteration in 0..config.iterations {
        // Heaviest stage first, so memory limits surface immediately.
        for stage in (0..stages).rev() {
            let repeats = 1usize << stage;
            println!("Benchmark stage {}k, iteration {}...", repeats, iteration + 1);
            let text = unit_text.repeat(repeats);

            model.clear_context();
            let mut meta = ChatMeta::default();
            let input = LmInput {
                prompt: Some(text),
                messages: Vec::new(),
            };
            let inserted = model
                .insert(&mut meta, &input, &cancel)
                .map_err(|e| e.to_string())?;
            if !inserted {
                println!("  stage {}k does not fit the context window, skipped", repeats);
                continue;
            }
            let mut sink = |_piece: &str| true;
            model
                .generate(&mut meta, DECODE_TOKENS, &mut sink, &cancel)
                .map_err(|e| e.to_string())?;

            ttft[stage].push(meta.ttft_secs() as f32);
            prefill[stage].push(meta.prefill_speed_tps() as f32);
            decode[stage].push(meta.decoding_speed_tps() as f32);
        }
    }

    let ttft: Vec<Stat> = ttft.iter().map(|v| stat_of(v)).collect();
    let prefill: Vec<Stat> = prefill.iter().map(|v| stat_of(v)).collect();
    let decode: Vec<Stat> = decode.iter().map(|v| stat_of(v)).collect();

    print_results(&ttft, &prefill, &decode);
    let path = write_csv(tag, &ttft, &prefill, &decode)?;
    println!("Results written to {path}");
    Ok(())
}

fn print_results(ttft: &[Stat], prefill: &[Stat], decode: &[Stat]) {
    println!("=== Benchmark Results ===");
    println!(
        "{:>15} | {:>21} | {:>26} | {:>26}",
        "Context Length", "TTFT (s)", "Prefill Speed (tok/s)", "Decoding Speed (tok/s)"
    );
    println!("{}", "-".repeat(100));
    for stage in 0..decode.len() {
        println!(
            "{:>14}k | {:>9.3} ± {:>9.3} | {:>11.2} ± {:>12.2} | {:>11.2} ± {:>12.2}",
            1 << stage,
            ttft[stage].avg,
            ttft[stage].std,
            prefill[stage].avg,
            prefill[stage].std,
            decode[stage].avg,
            decode[stage].std,
        );
    }
    println!("{}", "-".repeat(100));
}

fn write_csv(
    tag: &str,
    ttft: &[Stat],
    prefill: &[Stat],
    decode: &[Stat],
) -> Result<String, String> {
    let date = chrono::Local::now().format("%Y%m%d");
    let cpu = sanitize_for_filename(&cpu_name());
    let mut filename = format!("bench_{}_{date}", sanitize_for_filename(tag));
    if !cpu.is_empty() {
        filename.push('_');
        filename.push_str(&cpu);
    }
    filename.push_str(".csv");

    let mut out =
        std::fs::File::create(&filename).map_err(|e| format!("cannot write {filename}: {e}"))?;
    let mut emit = |line: String| -> Result<(), String> {
        writeln!(out, "{line}").map_err(|e| e.to_string())
    };
    emit(CSV_HEADER.to_string())?;
    for stage in 0..decode.len() {
        emit(format!(
            "{},{:.6},{:.6},{:.6},{:.6},{:.2},{:.2},{:.2},{:.2},{:.2},{:.2},{:.2},{:.2}",
            1 << stage,
            ttft[stage].avg,
            ttft[stage].std,
            ttft[stage].min,
            ttft[stage].max,
            prefill[stage].avg,
            prefill[stage].std,
            prefill[stage].min,
            prefill[stage].max,
            decode[stage].avg,
            decode[stage].std,
            decode[stage].min,
            decode[stage].max,
        ))?;
    }
    Ok(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_of() {
        let stat = stat_of(&[1.0, 2.0, 3.0, 4.0]);
        assert!((stat.avg - 2.5).abs() < 1e-6);
        assert_eq!(stat.min, 1.0);
        assert_eq!(stat.max, 4.0);
        // Population standard deviation.
        assert!((stat.std - 1.118_034).abs() < 1e-5);
        assert_eq!(stat_of(&[]).avg, 0.0);
    }

    #[test]
    fn test_filename_sanitizer() {
        assert_eq!(sanitize_for_filename("llama3.2:1b"), "llama3.2_1b");
        assert_eq!(sanitize_for_filename("a b/c"), "a_b_c");
    }

    #[test]
    fn test_csv_header_fields() {
        assert_eq!(CSV_HEADER.split(',').count(), 13);
        assert!(CSV_HEADER.starts_with("context_length_k,ttft_avg_s"));
    }

    #[test]
    fn test_default_config_stages() {
        let config = load_config(None).unwrap();
        assert_eq!(config.max_length, 32_768);
        assert_eq!(config.iterations, 8);
        let max = config.max_length.max(8192).next_power_of_two();
        assert_eq!((max / 1024).ilog2() as usize + 1, 6); // 1k..32k
    }
}
