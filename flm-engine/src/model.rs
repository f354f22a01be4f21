//! The streaming token generator.
//!
//! [`AutoModel`] is a tagged variant over the supported model families; each
//! variant owns its configuration and drives the device through the shared
//! [`LmCore`]. The capability surface is small: load, insert (prefill),
//! generate (decode), clear context, history, configure.
//!
//! Prefill processes the prompt in chunks matching the compiled sequence
//! width; decode runs one token at a time, polls the cancellation handle at
//! every step, and pushes decoded fragments into a caller-provided sink.
//! A sink refusing a fragment is treated like a cancellation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use half::bf16;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use flm_npu::{
    BoRef, Buffer, CmdState, DeviceManager, DmaDirection, NpuApp, NpuError, Tile,
};

use crate::archive::WeightArchive;
use crate::cancel::CancelHandle;
use crate::config::LmConfig;
use crate::error::EngineError;
use crate::kv::KvCache;
use crate::meta::{ChatMeta, StopReason};
use crate::sampler::{Sampler, SamplerParams};
use crate::template::{apply_chat_template, ChatFamily, Message};
use crate::{version, Result};

/// Compiled width of the prefill sequence.
pub const PREFILL_CHUNK: usize = 128;

/// Device-side region alignment for packed weights.
const WEIGHT_ALIGN: usize = 64;

/// Uniform request input: either a raw prompt or a chat message list.
#[derive(Debug, Clone, Default)]
pub struct LmInput {
    pub prompt: Option<String>,
    pub messages: Vec<Message>,
}

/// Receives decoded text fragments during generation. Returning `false`
/// signals back-pressure failure and stops the run.
pub trait TokenSink {
    fn push(&mut self, text: &str) -> bool;
}

impl<F: FnMut(&str) -> bool> TokenSink for F {
    fn push(&mut self, text: &str) -> bool {
        self(text)
    }
}

/// Split a token list into prefill chunks of the compiled width.
pub fn prefill_chunks(ids: &[u32], width: usize) -> Vec<&[u32]> {
    ids.chunks(width.max(1)).collect()
}

/// The shared execution state behind every family variant.
pub struct LmCore {
    tag: String,
    dir: PathBuf,
    config: LmConfig,
    family: ChatFamily,
    device: Arc<DeviceManager>,
    tokenizer: Tokenizer,

    embed_table: Buffer<bf16>,
    weights: Buffer<u8>,
    /// Per-layer (byte offset, byte length) into `weights`.
    layer_regions: Vec<(usize, usize)>,
    /// LM head region inside `weights`, or a dedicated buffer when the head
    /// is tied to the embedding table.
    head_region: Option<(usize, usize)>,
    tied_head: Option<Buffer<bf16>>,

    x_io: Buffer<bf16>,
    logits_buf: Buffer<bf16>,
    layer_app: NpuApp,
    lm_head_app: NpuApp,
    kv: KvCache,

    history: Vec<u32>,
    generated_ids: Vec<u32>,
    response_text: String,
    counts: HashMap<u32, u32>,
    pending: Option<u32>,
    sampler: Sampler,
    stop_ids: Vec<u32>,
    enable_think: bool,
    system_prompt: String,
}

impl LmCore {
    fn load(
        tag: &str,
        dir: &Path,
        device: Arc<DeviceManager>,
        ctx_len: Option<usize>,
    ) -> Result<Self> {
        let config = LmConfig::from_pretrained(dir)?;
        version::check_model_compatible(&config.flm_version)?;
        let family = ChatFamily::from_model_type(&config.model_type);

        let tokenizer = Tokenizer::from_file(dir.join("tokenizer.json"))
            .map_err(|e| EngineError::Tokenizer(e.to_string()))?;

        let max_len = match ctx_len {
            Some(len) => len.max(512),
            None => 4096,
        };

        let layer_ctx = device.register_binary(&config.layer_bin(dir))?;
        let head_ctx = device.register_binary(&config.lm_head_bin(dir))?;
        let layer_app = device.create_app(&layer_ctx);
        let lm_head_app = device.create_app(&head_ctx);

        let mut archive = WeightArchive::open(&find_weight_file(dir)?)?;

        let vocab = config.vocab_size as usize;
        let hidden = config.hidden_size as usize;

        // Embedding lookup table stays on the host.
        let embed_name = find_embed_tensor(&mut archive)?;
        let mut embed_table: Buffer<bf16> = Buffer::host(vocab * hidden)?;
        if archive.tensor_meta(&embed_name)?.is_quantized() {
            archive.dequantize(&embed_name, &mut embed_table)?;
        } else {
            archive.load(&embed_name, &mut embed_table)?;
        }

        // Everything else is packed into one DMA-visible region, quantized
        // matmul weights in the tile-interleaved order.
        let plan = WeightPlan::build(&mut archive, &config, &embed_name)?;
        let mut weights: Buffer<u8> = device.alloc_buffer(plan.total_bytes.max(WEIGHT_ALIGN))?;
        for placed in &plan.placed {
            let mut staging: Buffer<u8> = Buffer::host(placed.len)?;
            if placed.quantized {
                archive.load_quantized_matmul(&placed.name, &mut staging, placed.columns)?;
            } else {
                archive.load(&placed.name, &mut staging)?;
            }
            weights.copy_bytes_at(placed.offset, staging.as_bytes())?;
        }
        weights.sync_to_device()?;

        let tied_head = if plan.head_region.is_none() {
            let mut tied: Buffer<bf16> = device.alloc_buffer(vocab * hidden)?;
            tied.copy_from_slice(embed_table.as_slice())?;
            tied.sync_to_device()?;
            Some(tied)
        } else {
            None
        };

        // KV cache lives in device memory; the layer sequences stream the
        // live window in and the fresh rows out.
        let heads = config.num_key_value_heads as usize;
        let head_dim = config.head_dim as usize;
        let mut kv_buffers = Vec::with_capacity(config.num_hidden_layers as usize);
        for _ in 0..config.num_hidden_layers {
            let k: Buffer<bf16> = device.alloc_buffer(heads * max_len * head_dim)?;
            let v: Buffer<bf16> = device.alloc_buffer(heads * max_len * head_dim)?;
            kv_buffers.push((k, v));
        }
        let kv = KvCache::from_parts(&config, max_len, kv_buffers)?;

        let x_io: Buffer<bf16> = device.alloc_buffer(PREFILL_CHUNK * hidden)?;
        let logits_buf: Buffer<bf16> = device.alloc_buffer(vocab)?;

        let mut stop_ids = config.eos_token_ids.clone();
        for marker in family.stop_strings() {
            if let Some(id) = tokenizer.token_to_id(marker) {
                if !stop_ids.contains(&id) {
                    stop_ids.push(id);
                }
            }
        }

        info!(
            target: "flm::engine",
            tag,
            model_type = %config.model_type,
            layers = config.num_hidden_layers,
            max_len,
            stop_tokens = stop_ids.len(),
            "model loaded"
        );

        Ok(Self {
            tag: tag.to_string(),
            dir: dir.to_path_buf(),
            config,
            family,
            device,
            tokenizer,
            embed_table,
            weights,
            layer_regions: plan.layer_regions,
            head_region: plan.head_region,
            tied_head,
            x_io,
            logits_buf,
            layer_app,
            lm_head_app,
            kv,
            history: Vec::new(),
            generated_ids: Vec::new(),
            response_text: String::new(),
            counts: HashMap::new(),
            pending: None,
            sampler: Sampler::new(SamplerParams::default()),
            stop_ids,
            enable_think: false,
            system_prompt: String::new(),
        })
    }

    fn render_input(&self, input: &LmInput) -> Result<String> {
        if !input.messages.is_empty() {
            let mut messages = input.messages.clone();
            if !self.system_prompt.is_empty()
                && !messages.iter().any(|m| m.role == "system")
            {
                messages.insert(0, Message::new("system", &self.system_prompt));
            }
            return Ok(apply_chat_template(self.family, &messages, self.enable_think));
        }
        input
            .prompt
            .clone()
            .ok_or_else(|| EngineError::InvalidRequest("request carries no prompt".into()))
    }

    fn encode(&self, text: &str, add_special: bool) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, add_special)
            .map_err(|e| EngineError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode_piece(&self, id: u32) -> Result<String> {
        self.tokenizer
            .decode(&[id], false)
            .map_err(|e| EngineError::Tokenizer(e.to_string()))
    }

    /// Copy embedding rows for `ids` into the staging buffer and push them
    /// to the device.
    fn embed_into(&mut self, ids: &[u32]) -> Result<()> {
        let hidden = self.config.hidden_size as usize;
        for (i, &id) in ids.iter().enumerate() {
            let row = id as usize * hidden;
            let src = &self.embed_table.as_slice()[row..row + hidden];
            self.x_io.as_mut_slice()[i * hidden..(i + 1) * hidden].copy_from_slice(src);
        }
        self.x_io.sync_to_device()
            .map_err(EngineError::Npu)
    }

    /// Runtime-parameter prelude; the families disagree on which registers
    /// the microcode watches.
    fn rtp_prelude(&mut self, layer: usize, pos: usize) {
        let kv_read = if self.config.is_sliding(layer as u32) {
            (pos + 1).min(self.kv.window().max(1))
        } else {
            pos + 1
        };
        let slot = self.kv.write_slot(layer, pos);
        let config = &self.config;
        let family = self.family;
        let seq = self.layer_app.seq_mut();
        seq.rtp_write(Tile::core(0, 0), config.addr_qk, pos as u32);
        seq.rtp_write(Tile::core(0, 0), config.addr_kv, kv_read as u32);
        match family {
            ChatFamily::Gemma => {
                // Ring layers need the physical write slot.
                seq.rtp_write(Tile::core(0, 0), config.addr_kk, slot as u32);
            }
            ChatFamily::Qwen | ChatFamily::Harmony => {
                seq.rtp_write(Tile::core(0, 0), config.addr_l_begin_mha, 0);
                seq.rtp_write(Tile::core(0, 0), config.addr_l_end_mha, kv_read as u32);
            }
            ChatFamily::Llama => {}
        }
    }

    /// Rebuild the per-layer sequence for the current position and launch it.
    fn run_layer(&mut self, layer: usize, pos: usize, n_tokens: usize) -> Result<()> {
        let hidden = self.config.hidden_size as usize;
        let heads = self.config.num_key_value_heads as usize;
        let head_dim = self.config.head_dim as usize;
        let max_len = self.kv.max_len();
        let sliding = self.config.is_sliding(layer as u32);
        let kv_read = if sliding {
            (pos + 1).min(self.kv.window().max(1))
        } else {
            pos + 1
        };
        let slot = self.kv.write_slot(layer, pos);
        let (w_off, w_len) = self.layer_regions[layer];

        self.layer_app.seq_mut().clear_cmds();
        self.rtp_prelude(layer, pos);
        let seq = self.layer_app.seq_mut();

        // Activations in.
        seq.dma_memcpy_nd(
            2,
            0,
            DmaDirection::MM2S,
            Tile::shim(0),
            1,
            0,
            [0, 0, 0, 0],
            [1, 1, 1, (n_tokens * hidden) as u32],
            [1, 1, 1, 1],
            None,
            false,
        )?;
        // Layer weights in.
        seq.dma_memcpy_nd(
            1,
            1,
            DmaDirection::MM2S,
            Tile::shim(1),
            2,
            0,
            [0, 0, 0, w_off as u32],
            [1, 1, 1, w_len as u32],
            [1, 1, 1, 1],
            None,
            false,
        )?;
        // Live KV window in.
        let kv_elems = (kv_read * heads * head_dim) as u32;
        seq.dma_memcpy_nd(
            2,
            2,
            DmaDirection::MM2S,
            Tile::shim(2),
            3,
            1,
            [0, 0, 0, 0],
            [1, 1, 1, kv_elems],
            [1, 1, 1, 1],
            None,
            false,
        )?;
        seq.dma_memcpy_nd(
            2,
            3,
            DmaDirection::MM2S,
            Tile::shim(3),
            4,
            1,
            [0, 0, 0, 0],
            [1, 1, 1, kv_elems],
            [1, 1, 1, 1],
            None,
            false,
        )?;
        // Fresh K/V rows out, one block per head strided by the length axis.
        for (arg, bd) in [(2u32, 5u32), (3, 6)] {
            seq.dma_memcpy_nd(
                2,
                arg,
                DmaDirection::S2MM,
                Tile::shim(arg),
                bd,
                0,
                [0, 0, 0, (slot * head_dim) as u32],
                [n_tokens as u32, 1, heads as u32, head_dim as u32],
                [head_dim as u32, 1, (max_len * head_dim) as u32, 1],
                None,
                true,
            )?;
        }
        // Activations out.
        seq.dma_memcpy_nd(
            2,
            0,
            DmaDirection::S2MM,
            Tile::shim(0),
            7,
            1,
            [0, 0, 0, 0],
            [1, 1, 1, (n_tokens * hidden) as u32],
            [1, 1, 1, 1],
            None,
            true,
        )?;
        seq.dma_wait(Tile::shim(2), DmaDirection::S2MM, 0);
        seq.dma_wait(Tile::shim(3), DmaDirection::S2MM, 0);
        seq.dma_wait(Tile::shim(0), DmaDirection::S2MM, 1);

        let args = [
            self.x_io.bo()?,
            self.weights.bo()?,
            self.kv.k(layer).bo()?,
            self.kv.v(layer).bo()?,
        ];
        launch_checked(&mut self.layer_app, &args)
    }

    fn run_layers(&mut self, pos: usize, n_tokens: usize) -> Result<()> {
        for layer in 0..self.kv.num_layers() {
            self.run_layer(layer, pos, n_tokens)?;
        }
        Ok(())
    }

    /// Project the final hidden state to logits and pull them back.
    fn lm_head(&mut self) -> Result<Vec<f32>> {
        let hidden = self.config.hidden_size as usize;
        let vocab = self.config.vocab_size as usize;

        let head_arg: BoRef;
        let (head_off, head_len) = match (self.head_region, &self.tied_head) {
            (Some((off, len)), _) => {
                head_arg = self.weights.bo()?;
                (off, len)
            }
            (None, Some(tied)) => {
                head_arg = tied.bo()?;
                (0, vocab * hidden * 2)
            }
            (None, None) => {
                return Err(EngineError::Archive("no LM head weights".into()));
            }
        };

        let seq = self.lm_head_app.seq_mut();
        seq.clear_cmds();
        seq.dma_memcpy_nd(
            2,
            0,
            DmaDirection::MM2S,
            Tile::shim(0),
            1,
            0,
            [0, 0, 0, 0],
            [1, 1, 1, hidden as u32],
            [1, 1, 1, 1],
            None,
            false,
        )?;
        seq.dma_memcpy_nd(
            1,
            1,
            DmaDirection::MM2S,
            Tile::shim(1),
            2,
            0,
            [0, 0, 0, head_off as u32],
            [1, 1, 1, head_len as u32],
            [1, 1, 1, 1],
            None,
            false,
        )?;
        seq.dma_memcpy_nd(
            2,
            2,
            DmaDirection::S2MM,
            Tile::shim(2),
            3,
            0,
            [0, 0, 0, 0],
            [1, 1, 1, vocab as u32],
            [1, 1, 1, 1],
            None,
            true,
        )?;
        seq.dma_wait(Tile::shim(2), DmaDirection::S2MM, 0);

        let args = [self.x_io.bo()?, head_arg, self.logits_buf.bo()?];
        launch_checked(&mut self.lm_head_app, &args)?;

        self.logits_buf.sync_from_device()?;
        Ok(self
            .logits_buf
            .as_slice()
            .iter()
            .map(|v| v.to_f32())
            .collect())
    }

    fn note_token(&mut self, id: u32) {
        self.history.push(id);
        *self.counts.entry(id).or_insert(0) += 1;
    }

    fn insert(&mut self, meta: &mut ChatMeta, input: &LmInput, cancel: &CancelHandle) -> Result<bool> {
        let text = self.render_input(input)?;
        let ids = self.encode(&text, input.messages.is_empty())?;
        if ids.is_empty() {
            return Err(EngineError::InvalidRequest("prompt encoded to no tokens".into()));
        }
        // The final prompt token stays pending; its forward pass is the
        // first decode step.
        if !self.kv.can_insert(ids.len()) {
            return Ok(false);
        }

        let start = Instant::now();
        let (prefix, last) = ids.split_at(ids.len() - 1);
        for chunk in prefill_chunks(prefix, PREFILL_CHUNK) {
            if cancel.cancelled() {
                meta.stop_reason = StopReason::Cancelled;
                break;
            }
            let pos = self.kv.cur_len();
            self.embed_into(chunk)?;
            self.run_layers(pos, chunk.len())?;
            self.kv.advance(chunk.len())?;
        }
        for &id in prefix {
            self.note_token(id);
        }
        self.note_token(last[0]);
        self.pending = Some(last[0]);
        meta.prompt_tokens = ids.len() as u32;
        meta.prefill_duration = start.elapsed().as_nanos() as u64;
        debug!(
            target: "flm::engine",
            tokens = ids.len(),
            ns = meta.prefill_duration,
            "prefill done"
        );
        Ok(true)
    }

    fn generate(
        &mut self,
        meta: &mut ChatMeta,
        limit: usize,
        sink: &mut dyn TokenSink,
        cancel: &CancelHandle,
    ) -> Result<()> {
        let start = Instant::now();
        self.generated_ids.clear();
        self.response_text.clear();
        meta.stop_reason = StopReason::EndOfSequence;

        let mut produced = 0usize;
        while produced < limit {
            if cancel.cancelled() {
                meta.stop_reason = StopReason::Cancelled;
                break;
            }
            let Some(pending) = self.pending.take() else {
                break;
            };
            if !self.kv.can_insert(1) {
                meta.stop_reason = StopReason::MaxContextReached;
                break;
            }
            let pos = self.kv.cur_len();
            self.embed_into(&[pending])?;
            self.run_layers(pos, 1)?;
            self.kv.advance(1)?;

            let mut logits = self.lm_head()?;
            let token = {
                let history = &self.history;
                let counts = &self.counts;
                self.sampler.sample(&mut logits, history, counts)
            };
            if self.stop_ids.contains(&token) {
                meta.stop_reason = StopReason::EndOfSequence;
                break;
            }
            self.note_token(token);
            self.generated_ids.push(token);
            self.pending = Some(token);
            produced += 1;

            let piece = self.decode_piece(token)?;
            self.response_text.push_str(&piece);
            if !sink.push(&piece) {
                meta.stop_reason = StopReason::Cancelled;
                break;
            }
        }
        if produced == limit {
            meta.stop_reason = StopReason::LengthLimit;
        }
        meta.generated_tokens = produced as u32;
        meta.decoding_duration = start.elapsed().as_nanos() as u64;
        debug!(
            target: "flm::engine",
            tokens = produced,
            reason = meta.stop_reason.as_str(),
            "decode done"
        );
        Ok(())
    }

    /// Prefill a text and mean-pool the final hidden state into a fixed-size
    /// vector. Clears the context afterwards.
    fn embed(&mut self, text: &str) -> Result<Vec<f32>> {
        let hidden = self.config.hidden_size as usize;
        let ids = self.encode(text, true)?;
        if ids.is_empty() {
            return Err(EngineError::InvalidRequest("text encoded to no tokens".into()));
        }
        if !self.kv.can_insert(ids.len()) {
            return Err(EngineError::MaxContextReached);
        }
        let mut last_chunk = 0usize;
        for chunk in prefill_chunks(&ids, PREFILL_CHUNK) {
            let pos = self.kv.cur_len();
            self.embed_into(chunk)?;
            self.run_layers(pos, chunk.len())?;
            self.kv.advance(chunk.len())?;
            last_chunk = chunk.len();
        }
        self.x_io.sync_from_device()?;
        let mut pooled = vec![0f32; hidden];
        let rows = self.x_io.as_slice();
        for row in 0..last_chunk {
            for (i, slot) in pooled.iter_mut().enumerate() {
                *slot += rows[row * hidden + i].to_f32();
            }
        }
        for slot in pooled.iter_mut() {
            *slot /= last_chunk as f32;
        }
        self.clear_context();
        Ok(pooled)
    }

    fn clear_context(&mut self) {
        self.kv.clear();
        self.history.clear();
        self.generated_ids.clear();
        self.response_text.clear();
        self.counts.clear();
        self.pending = None;
    }
}

fn launch_checked(app: &mut NpuApp, args: &[BoRef]) -> Result<()> {
    let state = app.launch(args)?;
    if state != CmdState::Completed {
        return Err(EngineError::Npu(NpuError::DeviceLaunchFailure(state)));
    }
    Ok(())
}

/// Find the quantized weight archive in a model directory.
fn find_weight_file(dir: &Path) -> Result<PathBuf> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("q4nx") {
            return Ok(path);
        }
    }
    Err(EngineError::Archive(format!(
        "no .q4nx weight archive in {}",
        dir.display()
    )))
}

fn find_embed_tensor(archive: &mut WeightArchive) -> Result<String> {
    const CANDIDATES: &[&str] = &[
        "model.embed_tokens.weight",
        "embed_tokens.weight",
        "tok_embeddings.weight",
    ];
    for name in CANDIDATES {
        if archive.tensor_meta(name).is_ok() {
            return Ok((*name).to_string());
        }
    }
    Err(EngineError::Archive("no embedding table in archive".into()))
}

struct PlacedTensor {
    name: String,
    offset: usize,
    len: usize,
    quantized: bool,
    columns: usize,
}

/// Device placement for every non-embedding tensor: layer regions are
/// contiguous so one DMA streams a whole layer.
struct WeightPlan {
    placed: Vec<PlacedTensor>,
    layer_regions: Vec<(usize, usize)>,
    head_region: Option<(usize, usize)>,
    total_bytes: usize,
}

impl WeightPlan {
    fn build(archive: &mut WeightArchive, config: &LmConfig, embed_name: &str) -> Result<Self> {
        let layers = config.num_hidden_layers as usize;
        let mut names: Vec<String> = archive.names().map(str::to_string).collect();
        names.sort();

        let mut placed = Vec::new();
        let mut layer_regions = vec![(0usize, 0usize); layers];
        let mut head_region = None;
        let mut cursor = 0usize;

        let place = |archive: &mut WeightArchive,
                         name: &str,
                         cursor: &mut usize,
                         placed: &mut Vec<PlacedTensor>|
         -> Result<(usize, usize)> {
            let meta = archive.tensor_meta(name)?.clone();
            let len = meta.byte_len();
            let offset = (*cursor + WEIGHT_ALIGN - 1) / WEIGHT_ALIGN * WEIGHT_ALIGN;
            let columns = meta.shape.last().copied().unwrap_or(0);
            placed.push(PlacedTensor {
                name: name.to_string(),
                offset,
                len,
                quantized: meta.is_quantized() && meta.shape.len() == 2,
                columns,
            });
            *cursor = offset + len;
            Ok((offset, len))
        };

        for layer in 0..layers {
            let prefix = format!("model.layers.{layer}.");
            let begin = (cursor + WEIGHT_ALIGN - 1) / WEIGHT_ALIGN * WEIGHT_ALIGN;
            let mut any = false;
            for name in names.iter().filter(|n| n.starts_with(&prefix)) {
                place(archive, name, &mut cursor, &mut placed)?;
                any = true;
            }
            if !any {
                return Err(EngineError::Archive(format!(
                    "archive holds no tensors for layer {layer}"
                )));
            }
            layer_regions[layer] = (begin, cursor - begin);
        }

        if names.iter().any(|n| n == "lm_head.weight") {
            head_region = Some(place(archive, "lm_head.weight", &mut cursor, &mut placed)?);
        }

        // Remaining tensors (final norm and friends) ride after the layers.
        for name in names.iter() {
            if name == embed_name
                || name == "lm_head.weight"
                || name.starts_with("model.layers.")
            {
                continue;
            }
            place(archive, name, &mut cursor, &mut placed)?;
        }

        Ok(Self {
            placed,
            layer_regions,
            head_region,
            total_bytes: cursor,
        })
    }
}

/// Family wrappers: the tagged variant each owns its core (and with it, its
/// config and sequence builders).
pub struct LlamaLm(LmCore);
pub struct GemmaLm(LmCore);
pub struct QwenLm(LmCore);
pub struct HarmonyLm(LmCore);

/// Dynamic dispatch over the supported model families.
pub enum AutoModel {
    Llama(LlamaLm),
    Gemma(GemmaLm),
    Qwen(QwenLm),
    Harmony(HarmonyLm),
}

impl AutoModel {
    /// Load a model directory onto the device.
    pub fn load(
        tag: &str,
        dir: &Path,
        device: Arc<DeviceManager>,
        ctx_len: Option<usize>,
    ) -> Result<Self> {
        let core = LmCore::load(tag, dir, device, ctx_len)?;
        Ok(match core.family {
            ChatFamily::Llama => Self::Llama(LlamaLm(core)),
            ChatFamily::Gemma => Self::Gemma(GemmaLm(core)),
            ChatFamily::Qwen => Self::Qwen(QwenLm(core)),
            ChatFamily::Harmony => Self::Harmony(HarmonyLm(core)),
        })
    }

    fn core(&self) -> &LmCore {
        match self {
            Self::Llama(m) => &m.0,
            Self::Gemma(m) => &m.0,
            Self::Qwen(m) => &m.0,
            Self::Harmony(m) => &m.0,
        }
    }

    fn core_mut(&mut self) -> &mut LmCore {
        match self {
            Self::Llama(m) => &mut m.0,
            Self::Gemma(m) => &mut m.0,
            Self::Qwen(m) => &mut m.0,
            Self::Harmony(m) => &mut m.0,
        }
    }

    pub fn tag(&self) -> &str {
        &self.core().tag
    }

    pub fn config(&self) -> &LmConfig {
        &self.core().config
    }

    pub fn family(&self) -> ChatFamily {
        self.core().family
    }

    pub fn model_dir(&self) -> &Path {
        &self.core().dir
    }

    pub fn device(&self) -> &Arc<DeviceManager> {
        &self.core().device
    }

    pub fn max_context(&self) -> usize {
        self.core().kv.max_len()
    }

    pub fn context_len(&self) -> usize {
        self.core().kv.cur_len()
    }

    /// Tokenize and prefill the request. Returns false when the prompt does
    /// not fit the compiled context window.
    pub fn insert(
        &mut self,
        meta: &mut ChatMeta,
        input: &LmInput,
        cancel: &CancelHandle,
    ) -> Result<bool> {
        self.core_mut().insert(meta, input, cancel)
    }

    /// Decode up to `limit` tokens into the sink.
    pub fn generate(
        &mut self,
        meta: &mut ChatMeta,
        limit: usize,
        sink: &mut dyn TokenSink,
        cancel: &CancelHandle,
    ) -> Result<()> {
        self.core_mut().generate(meta, limit, sink, cancel)
    }

    /// Fixed-size embedding vector for a text.
    pub fn embed(&mut self, text: &str) -> Result<Vec<f32>> {
        self.core_mut().embed(text)
    }

    /// Reset the logical context; backing memory is untouched.
    pub fn clear_context(&mut self) {
        self.core_mut().clear_context();
    }

    /// The decoded response text and the generated token ids.
    pub fn history(&self) -> (String, Vec<u32>) {
        let core = self.core();
        (core.response_text.clone(), core.generated_ids.clone())
    }

    pub fn sampler_params_mut(&mut self) -> &mut SamplerParams {
        &mut self.core_mut().sampler.params
    }

    /// Loosely-typed knobs: `enable_think`, `system_prompt`.
    pub fn configure(&mut self, key: &str, value: &serde_json::Value) {
        let core = self.core_mut();
        match key {
            "enable_think" => core.enable_think = value.as_bool().unwrap_or(false),
            "system_prompt" => {
                core.system_prompt = value.as_str().unwrap_or_default().to_string();
            }
            other => debug!(target: "flm::engine", "ignoring unknown parameter `{other}`"),
        }
    }

    /// Trim a text to a ~1k-token unit the benchmark repeats per stage.
    pub fn prepare_benchmark(&self, text: &str) -> Result<(usize, String)> {
        let core = self.core();
        let ids = core.encode(text, false)?;
        let take = ids.len().min(1024);
        let trimmed = core
            .tokenizer
            .decode(&ids[..take], true)
            .map_err(|e| EngineError::Tokenizer(e.to_string()))?;
        Ok((take, trimmed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefill_chunking() {
        let ids: Vec<u32> = (0..300).collect();
        let chunks = prefill_chunks(&ids, 128);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 128);
        assert_eq!(chunks[2].len(), 44);
        assert!(prefill_chunks(&[], 128).is_empty());
    }

    #[test]
    fn test_sink_closure_adapter() {
        let mut seen = String::new();
        let mut sink = |piece: &str| {
            seen.push_str(piece);
            seen.len() < 4
        };
        assert!(TokenSink::push(&mut sink, "ab"));
        assert!(!TokenSink::push(&mut sink, "cd"));
        assert_eq!(seen, "abcd");
    }
}
