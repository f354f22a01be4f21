//! Request routing and endpoint handlers.
//!
//! Accelerator-exclusive routes (generate, chat, completions, embeddings,
//! transcriptions) pass through the admission gate before their handler
//! runs; everything else is handled inline. Generation itself runs on a
//! blocking thread and streams chunks back through the session's socket.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use flm_engine::meta::ChatMeta;
use flm_engine::template::{ChatFamily, Message};
use flm_engine::{asr, CancelHandle, EngineError, LmInput, SamplerParams, FLM_VERSION};

use crate::filter::ChannelCollector;
use crate::gate::DeferredTask;
use crate::http::{self, HttpRequest, HttpResponse};
use crate::multipart;
use crate::ollama::OllamaStream;
use crate::openai::{system_fingerprint, stream_id, OpenAiMode, OpenAiStream};
use crate::state::{BlockingChunkSender, ServerState, SharedStream};

/// Exhaustive route set for the core surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Generate,
    Chat,
    Embeddings,
    Tags,
    Ps,
    Version,
    Show,
    Cancel,
    OpenAiModels,
    OpenAiChat,
    OpenAiCompletions,
    OpenAiEmbeddings,
    Transcriptions,
    NotFound,
}

pub fn route(method: &str, path: &str) -> Route {
    match (method, path) {
        ("POST", "/api/generate") => Route::Generate,
        ("POST", "/api/chat") => Route::Chat,
        ("POST", "/api/embeddings") => Route::Embeddings,
        ("GET", "/api/tags") => Route::Tags,
        ("GET", "/api/ps") => Route::Ps,
        ("GET", "/api/version") => Route::Version,
        ("POST", "/api/show") => Route::Show,
        ("POST", "/api/cancel") => Route::Cancel,
        ("GET", "/v1/models") => Route::OpenAiModels,
        ("POST", "/v1/chat/completions") => Route::OpenAiChat,
        ("POST", "/v1/completions") => Route::OpenAiCompletions,
        ("POST", "/v1/embeddings") => Route::OpenAiEmbeddings,
        ("POST", "/v1/audio/transcriptions") => Route::Transcriptions,
        _ => Route::NotFound,
    }
}

/// Routes that must hold the accelerator gate.
pub fn requires_npu(route: Route) -> bool {
    matches!(
        route,
        Route::Generate
            | Route::Chat
            | Route::Embeddings
            | Route::OpenAiChat
            | Route::OpenAiCompletions
            | Route::OpenAiEmbeddings
            | Route::Transcriptions
    )
}

fn engine_error_status(err: &EngineError) -> u16 {
    match err {
        EngineError::InvalidRequest(_)
        | EngineError::ModelNotFound(_)
        | EngineError::ModelIncompatible { .. }
        | EngineError::Tokenizer(_) => 400,
        _ => 500,
    }
}

async fn write_response(stream: &SharedStream, cors: bool, res: &HttpResponse) {
    let mut guard = stream.lock().await;
    if let Err(err) = http::write_all(&mut guard, &http::encode_response(res, cors)).await {
        debug!(target: "flm::server", %err, "response write failed");
    }
}

/// Route a parsed request, enforcing accelerator exclusivity. Returns true
/// when the connection must close afterwards.
pub async fn dispatch(state: Arc<ServerState>, stream: SharedStream, req: HttpRequest) -> bool {
    let cors = state.config.cors;
    let keep = req.keep_alive();

    if req.method == "OPTIONS" {
        // Preflight: headers only, immediately.
        if cors {
            write_response(&stream, true, &HttpResponse::empty(200)).await;
            return !keep;
        }
        write_response(&stream, false, &HttpResponse::error(404, "Not Found")).await;
        return !keep;
    }

    let matched = route(&req.method, &req.path);
    if matched == Route::NotFound {
        write_response(&stream, cors, &HttpResponse::error(404, "Not Found")).await;
        return !keep;
    }

    if !requires_npu(matched) {
        return run_handler(state, stream, req, matched).await;
    }

    if state.gate.try_acquire() {
        let close = run_handler(state.clone(), stream, req, matched).await;
        if let Some(next) = state.gate.release_and_pop() {
            tokio::spawn(next());
        }
        return close;
    }

    // Gate held: defer the whole handler, response written out-of-line.
    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<bool>();
    let task_state = state.clone();
    let task_stream = stream.clone();
    let task: DeferredTask = Box::new(move || {
        Box::pin(async move {
            let close = run_handler(task_state.clone(), task_stream, req, matched).await;
            if let Some(next) = task_state.gate.release_and_pop() {
                tokio::spawn(next());
            }
            let _ = done_tx.send(close);
        })
    });

    if state.gate.try_enqueue(task) {
        // The session waits here; request N+1 is not read until this
        // deferred response is fully written.
        done_rx.await.unwrap_or(true)
    } else {
        let message = format!(
            "NPU is in use and request queue is full (limit: {}). Please try again later.",
            state.gate.max_queue()
        );
        warn!(target: "flm::server", "{message}");
        write_response(&stream, cors, &HttpResponse::error(503, &message)).await;
        !keep
    }
}

async fn run_handler(
    state: Arc<ServerState>,
    stream: SharedStream,
    req: HttpRequest,
    matched: Route,
) -> bool {
    match matched {
        Route::Tags => handle_tags(state, stream, req).await,
        Route::Ps => handle_ps(state, stream, req).await,
        Route::Version => handle_version(state, stream, req).await,
        Route::Show => handle_show(state, stream, req).await,
        Route::Cancel => handle_cancel(state, stream, req).await,
        Route::OpenAiModels => handle_openai_models(state, stream, req).await,
        Route::Generate => handle_generate(state, stream, req).await,
        Route::Chat => handle_chat(state, stream, req).await,
        Route::Embeddings => handle_embeddings(state, stream, req, false).await,
        Route::OpenAiEmbeddings => handle_embeddings(state, stream, req, true).await,
        Route::OpenAiChat => handle_openai_generation(state, stream, req, OpenAiMode::Chat).await,
        Route::OpenAiCompletions => {
            handle_openai_generation(state, stream, req, OpenAiMode::Completion).await
        }
        Route::Transcriptions => handle_transcriptions(state, stream, req).await,
        Route::NotFound => true,
    }
}

fn parse_json_body(req: &HttpRequest) -> Result<Value, ()> {
    if req.body.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_slice(&req.body).map_err(|_| ())
}

/// Messages may carry plain string content or the structured array form;
/// text items are concatenated.
fn parse_messages(value: &Value) -> Result<Vec<Message>, String> {
    let raw = value
        .as_array()
        .ok_or_else(|| "messages must be an array".to_string())?;
    let mut out = Vec::with_capacity(raw.len());
    for item in raw {
        let role = item["role"]
            .as_str()
            .ok_or_else(|| "message missing role".to_string())?;
        let content = match &item["content"] {
            Value::String(text) => text.clone(),
            Value::Array(parts) => {
                let mut text = String::new();
                for part in parts {
                    if part["type"] == "text" {
                        text.push_str(part["text"].as_str().unwrap_or(""));
                    }
                }
                text
            }
            _ => return Err("message missing content".to_string()),
        };
        out.push(Message::new(role, &content));
    }
    Ok(out)
}

/// Sampling knobs with the handler defaults applied.
fn sampler_from(options: &Value) -> SamplerParams {
    SamplerParams {
        temperature: options["temperature"].as_f64().unwrap_or(0.6) as f32,
        top_p: options["top_p"].as_f64().unwrap_or(0.9) as f32,
        top_k: options["top_k"].as_u64().unwrap_or(5) as usize,
        repetition_penalty: options["repeat_penalty"]
            .as_f64()
            .or_else(|| options["repetition_penalty"].as_f64())
            .unwrap_or(1.1) as f32,
        frequency_penalty: options["frequency_penalty"].as_f64().unwrap_or(0.0) as f32,
    }
}

fn requested_tag(state: &ServerState, body: &Value) -> Option<String> {
    if let Some(tag) = body["model"].as_str().or_else(|| body["name"].as_str()) {
        return Some(tag.to_string());
    }
    if !state.config.default_model.is_empty() {
        return Some(state.config.default_model.clone());
    }
    state.loaded_tag.lock().clone()
}

async fn handle_tags(state: Arc<ServerState>, stream: SharedStream, req: HttpRequest) -> bool {
    let body = state.catalog.ollama_models_json();
    write_response(&stream, state.config.cors, &HttpResponse::json(200, &body)).await;
    !req.keep_alive()
}

async fn handle_openai_models(
    state: Arc<ServerState>,
    stream: SharedStream,
    req: HttpRequest,
) -> bool {
    let body = state
        .catalog
        .openai_models_json(chrono::Utc::now().timestamp());
    write_response(&stream, state.config.cors, &HttpResponse::json(200, &body)).await;
    !req.keep_alive()
}

async fn handle_version(state: Arc<ServerState>, stream: SharedStream, req: HttpRequest) -> bool {
    let body = json!({ "version": FLM_VERSION });
    write_response(&stream, state.config.cors, &HttpResponse::json(200, &body)).await;
    !req.keep_alive()
}

async fn handle_ps(state: Arc<ServerState>, stream: SharedStream, req: HttpRequest) -> bool {
    let mut models = Vec::new();
    if let Some(tag) = state.loaded_tag.lock().clone() {
        if let Ok((canonical, entry)) = state.catalog.model_info(&tag) {
            models.push(json!({
                "name": canonical,
                "model": canonical,
                "details": {
                    "family": entry.details.family,
                    "parameter_size": entry.details.parameter_size,
                    "quantization_level": entry.details.quantization_level,
                }
            }));
        }
    }
    let body = json!({ "models": models });
    write_response(&stream, state.config.cors, &HttpResponse::json(200, &body)).await;
    !req.keep_alive()
}

async fn handle_show(state: Arc<ServerState>, stream: SharedStream, req: HttpRequest) -> bool {
    let keep = req.keep_alive();
    let cors = state.config.cors;
    let Ok(body) = parse_json_body(&req) else {
        write_response(&stream, cors, &HttpResponse::error(400, "Invalid JSON")).await;
        return !keep;
    };
    let Some(tag) = requested_tag(&state, &body) else {
        write_response(&stream, cors, &HttpResponse::error(400, "missing model tag")).await;
        return !keep;
    };
    match state.catalog.model_info(&tag) {
        Ok((canonical, entry)) => {
            let mut response = json!({
                "name": canonical,
                "details": {
                    "family": entry.details.family,
                    "parameter_size": entry.details.parameter_size,
                    "quantization_level": entry.details.quantization_level,
                },
                "flm_min_version": entry.flm_min_version,
            });
            // Architecture parameters ride along once the archive is local.
            if let Ok(dir) = state.catalog.model_dir(&canonical) {
                if let Ok(raw) = std::fs::read_to_string(dir.join("config.json")) {
                    if let Ok(config) = serde_json::from_str::<Value>(&raw) {
                        response["model_info"] = config;
                    }
                }
            }
            write_response(&stream, cors, &HttpResponse::json(200, &response)).await;
        }
        Err(err) => {
            write_response(
                &stream,
                cors,
                &HttpResponse::error(engine_error_status(&err), &err.to_string()),
            )
            .await;
        }
    }
    !keep
}

async fn handle_cancel(state: Arc<ServerState>, stream: SharedStream, req: HttpRequest) -> bool {
    let keep = req.keep_alive();
    let cors = state.config.cors;
    let Ok(body) = parse_json_body(&req) else {
        write_response(&stream, cors, &HttpResponse::error(400, "Invalid JSON")).await;
        return !keep;
    };
    let Some(request_id) = body["request_id"].as_str() else {
        write_response(&stream, cors, &HttpResponse::error(400, "missing request_id")).await;
        return !keep;
    };
    let cancelled = state.cancel_request(request_id);
    debug!(target: "flm::server", request_id, cancelled, "cancel requested");
    let body = json!({ "cancelled": cancelled });
    write_response(&stream, cors, &HttpResponse::json(200, &body)).await;
    !keep
}

/// Request-scope bookkeeping shared by the generation handlers.
struct RequestScope {
    state: Arc<ServerState>,
    request_id: String,
    pub cancel: CancelHandle,
}

impl RequestScope {
    fn begin(state: &Arc<ServerState>, body: &Value) -> Self {
        let request_id = body["request_id"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| state.next_request_id());
        let cancel = CancelHandle::new();
        state.register_request(&request_id, cancel.clone());
        Self {
            state: state.clone(),
            request_id,
            cancel,
        }
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        self.state.unregister_request(&self.request_id);
    }
}

type BlockingOutcome = Result<Option<Value>, (u16, String)>;

async fn finish_blocking(
    state: &Arc<ServerState>,
    stream: &SharedStream,
    keep: bool,
    outcome: Result<BlockingOutcome, tokio::task::JoinError>,
) -> bool {
    let cors = state.config.cors;
    match outcome {
        Ok(Ok(Some(body))) => {
            write_response(stream, cors, &HttpResponse::json(200, &body)).await;
            !keep
        }
        // Streaming path: the terminator is out, close the connection.
        Ok(Ok(None)) => true,
        Ok(Err((status, message))) => {
            error!(target: "flm::server", status, %message, "request failed");
            write_response(stream, cors, &HttpResponse::error(status, &message)).await;
            !keep
        }
        Err(join_err) => {
            error!(target: "flm::server", %join_err, "handler task failed");
            write_response(stream, cors, &HttpResponse::error(500, "internal error")).await;
            !keep
        }
    }
}

async fn handle_generate(state: Arc<ServerState>, stream: SharedStream, req: HttpRequest) -> bool {
    let keep = req.keep_alive();
    let cors = state.config.cors;
    let Ok(body) = parse_json_body(&req) else {
        write_response(&stream, cors, &HttpResponse::error(400, "Invalid JSON")).await;
        return !keep;
    };
    let Some(prompt) = body["prompt"].as_str().map(str::to_string) else {
        write_response(&stream, cors, &HttpResponse::error(400, "missing prompt")).await;
        return !keep;
    };
    let Some(tag) = requested_tag(&state, &body) else {
        write_response(&stream, cors, &HttpResponse::error(400, "missing model tag")).await;
        return !keep;
    };
    let stream_mode = body["stream"].as_bool().unwrap_or(false);
    let think = body["think"].as_bool().unwrap_or(false);
    let limit = body["max_tokens"]
        .as_u64()
        .or_else(|| body["options"]["num_predict"].as_u64())
        .unwrap_or(4096) as usize;
    let params = sampler_from(&body["options"]);

    let scope = RequestScope::begin(&state, &body);
    let cancel = scope.cancel.clone();
    let handle = Handle::current();
    let task_state = state.clone();
    let task_stream = stream.clone();

    let outcome = tokio::task::spawn_blocking(move || -> BlockingOutcome {
        let load_start = Instant::now();
        let mut engine = task_state.engine.lock();
        let model = engine
            .ensure_loaded(&tag)
            .map_err(|e| (engine_error_status(&e), e.to_string()))?;
        let model_name = model.tag().to_string();
        let harmony = model.family() == ChatFamily::Harmony;
        *task_state.loaded_tag.lock() = Some(model_name.clone());

        model.clear_context();
        *model.sampler_params_mut() = params;
        model.configure("enable_think", &json!(think));

        let mut meta = ChatMeta {
            load_duration: load_start.elapsed().as_nanos() as u64,
            ..Default::default()
        };
        let total_start = Instant::now();
        let input = LmInput {
            prompt: Some(prompt),
            messages: Vec::new(),
        };
        let inserted = model
            .insert(&mut meta, &input, &cancel)
            .map_err(|e| (engine_error_status(&e), e.to_string()))?;
        if !inserted {
            return Err((400, "Max length reached".into()));
        }

        if stream_mode {
            let sender = BlockingChunkSender::new(
                handle,
                task_stream,
                "application/x-ndjson",
                task_state.config.cors,
            );
            let mut sink = OllamaStream::new(&model_name, false, harmony, sender);
            if let Err(err) = model.generate(&mut meta, limit, &mut sink, &cancel) {
                // Headers are already out: report inside the stream.
                error!(target: "flm::server", %err, "generation failed mid-stream");
                sink.fail(&err.to_string());
                return Ok(None);
            }
            meta.total_duration = total_start.elapsed().as_nanos() as u64;
            let (_, context) = model.history();
            sink.finalize_generate(&meta, &context);
            Ok(None)
        } else {
            let mut collector = ChannelCollector::new(harmony);
            model
                .generate(&mut meta, limit, &mut collector, &cancel)
                .map_err(|e| (engine_error_status(&e), e.to_string()))?;
            collector.finalize();
            meta.total_duration = total_start.elapsed().as_nanos() as u64;
            let (_, context) = model.history();
            Ok(Some(json!({
                "model": model_name,
                "response": collector.content,
                "thinking": collector.thinking,
                "context": context,
                "done": true,
                "done_reason": meta.stop_reason.as_str(),
                "prompt_eval_count": meta.prompt_tokens,
                "eval_count": meta.generated_tokens,
                "total_duration": meta.total_duration,
                "load_duration": meta.load_duration,
                "prompt_eval_duration": meta.prefill_duration,
                "eval_duration": meta.decoding_duration,
            })))
        }
    })
    .await;

    drop(scope);
    finish_blocking(&state, &stream, keep, outcome).await
}

async fn handle_chat(state: Arc<ServerState>, stream: SharedStream, req: HttpRequest) -> bool {
    let keep = req.keep_alive();
    let cors = state.config.cors;
    let Ok(body) = parse_json_body(&req) else {
        write_response(&stream, cors, &HttpResponse::error(400, "Invalid JSON")).await;
        return !keep;
    };
    let messages = match parse_messages(&body["messages"]) {
        Ok(messages) => messages,
        Err(reason) => {
            write_response(&stream, cors, &HttpResponse::error(400, &reason)).await;
            return !keep;
        }
    };
    let Some(tag) = requested_tag(&state, &body) else {
        write_response(&stream, cors, &HttpResponse::error(400, "missing model tag")).await;
        return !keep;
    };
    let stream_mode = body["stream"].as_bool().unwrap_or(false);
    let think = body["think"].as_bool().unwrap_or(false);
    let limit = body["options"]["num_predict"].as_u64().unwrap_or(4096) as usize;
    let params = sampler_from(&body["options"]);

    let scope = RequestScope::begin(&state, &body);
    let cancel = scope.cancel.clone();
    let handle = Handle::current();
    let task_state = state.clone();
    let task_stream = stream.clone();

    let outcome = tokio::task::spawn_blocking(move || -> BlockingOutcome {
        let load_start = Instant::now();
        let mut engine = task_state.engine.lock();
        let model = engine
            .ensure_loaded(&tag)
            .map_err(|e| (engine_error_status(&e), e.to_string()))?;
        let model_name = model.tag().to_string();
        let harmony = model.family() == ChatFamily::Harmony;
        *task_state.loaded_tag.lock() = Some(model_name.clone());

        model.clear_context();
        *model.sampler_params_mut() = params;
        model.configure("enable_think", &json!(think));

        let mut meta = ChatMeta {
            load_duration: load_start.elapsed().as_nanos() as u64,
            ..Default::default()
        };
        let total_start = Instant::now();
        let input = LmInput {
            prompt: None,
            messages,
        };
        let inserted = model
            .insert(&mut meta, &input, &cancel)
            .map_err(|e| (engine_error_status(&e), e.to_string()))?;
        if !inserted {
            return Err((400, "Max length reached".into()));
        }

        if stream_mode {
            let sender = BlockingChunkSender::new(
                handle,
                task_stream,
                "application/x-ndjson",
                task_state.config.cors,
            );
            let mut sink = OllamaStream::new(&model_name, true, harmony, sender);
            if let Err(err) = model.generate(&mut meta, limit, &mut sink, &cancel) {
                error!(target: "flm::server", %err, "generation failed mid-stream");
                sink.fail(&err.to_string());
                return Ok(None);
            }
            meta.total_duration = total_start.elapsed().as_nanos() as u64;
            sink.finalize_chat(&meta);
            Ok(None)
        } else {
            let mut collector = ChannelCollector::new(harmony);
            model
                .generate(&mut meta, limit, &mut collector, &cancel)
                .map_err(|e| (engine_error_status(&e), e.to_string()))?;
            collector.finalize();
            meta.total_duration = total_start.elapsed().as_nanos() as u64;
            Ok(Some(json!({
                "model": model_name,
                "message": {
                    "role": "assistant",
                    "content": collector.content,
                    "thinking": collector.thinking,
                },
                "done": true,
                "done_reason": meta.stop_reason.as_str(),
                "prompt_eval_count": meta.prompt_tokens,
                "eval_count": meta.generated_tokens,
                "total_duration": meta.total_duration,
                "load_duration": meta.load_duration,
                "prompt_eval_duration": meta.prefill_duration,
                "eval_duration": meta.decoding_duration,
            })))
        }
    })
    .await;

    drop(scope);
    finish_blocking(&state, &stream, keep, outcome).await
}

async fn handle_openai_generation(
    state: Arc<ServerState>,
    stream: SharedStream,
    req: HttpRequest,
    mode: OpenAiMode,
) -> bool {
    let keep = req.keep_alive();
    let cors = state.config.cors;
    let Ok(body) = parse_json_body(&req) else {
        write_response(&stream, cors, &HttpResponse::error(400, "Invalid JSON")).await;
        return !keep;
    };
    let input = match mode {
        OpenAiMode::Chat => match parse_messages(&body["messages"]) {
            Ok(messages) => LmInput {
                prompt: None,
                messages,
            },
            Err(reason) => {
                write_response(&stream, cors, &HttpResponse::error(400, &reason)).await;
                return !keep;
            }
        },
        OpenAiMode::Completion => match body["prompt"].as_str() {
            Some(prompt) => LmInput {
                prompt: Some(prompt.to_string()),
                messages: Vec::new(),
            },
            None => {
                write_response(&stream, cors, &HttpResponse::error(400, "missing prompt")).await;
                return !keep;
            }
        },
    };
    let Some(tag) = requested_tag(&state, &body) else {
        write_response(&stream, cors, &HttpResponse::error(400, "missing model tag")).await;
        return !keep;
    };
    let stream_mode = body["stream"].as_bool().unwrap_or(false);
    let limit = body["max_tokens"]
        .as_u64()
        .or_else(|| body["max_completion_tokens"].as_u64())
        .unwrap_or(4096) as usize;
    let params = sampler_from(&body);

    let scope = RequestScope::begin(&state, &body);
    let cancel = scope.cancel.clone();
    let handle = Handle::current();
    let task_state = state.clone();
    let task_stream = stream.clone();

    let outcome = tokio::task::spawn_blocking(move || -> BlockingOutcome {
        let load_start = Instant::now();
        let mut engine = task_state.engine.lock();
        let model = engine
            .ensure_loaded(&tag)
            .map_err(|e| (engine_error_status(&e), e.to_string()))?;
        let model_name = model.tag().to_string();
        let harmony = model.family() == ChatFamily::Harmony;
        *task_state.loaded_tag.lock() = Some(model_name.clone());

        model.clear_context();
        *model.sampler_params_mut() = params;

        let mut meta = ChatMeta {
            load_duration: load_start.elapsed().as_nanos() as u64,
            ..Default::default()
        };
        let total_start = Instant::now();
        let inserted = model
            .insert(&mut meta, &input, &cancel)
            .map_err(|e| (engine_error_status(&e), e.to_string()))?;
        if !inserted {
            return Err((400, "Max length reached".into()));
        }

        if stream_mode {
            let sender = BlockingChunkSender::new(
                handle,
                task_stream,
                "text/event-stream",
                task_state.config.cors,
            );
            let mut sink = OpenAiStream::new(&model_name, mode, harmony, sender);
            if let Err(err) = model.generate(&mut meta, limit, &mut sink, &cancel) {
                error!(target: "flm::server", %err, "generation failed mid-stream");
                sink.fail(&err.to_string());
                return Ok(None);
            }
            meta.total_duration = total_start.elapsed().as_nanos() as u64;
            sink.finalize(&meta);
            Ok(None)
        } else {
            let mut collector = ChannelCollector::new(harmony);
            model
                .generate(&mut meta, limit, &mut collector, &cancel)
                .map_err(|e| (engine_error_status(&e), e.to_string()))?;
            collector.finalize();
            meta.total_duration = total_start.elapsed().as_nanos() as u64;
            let created = chrono::Utc::now().timestamp();
            let usage = OpenAiStream::<BlockingChunkSender>::usage_json(&meta);
            let body = match mode {
                OpenAiMode::Chat => json!({
                    "id": stream_id(mode),
                    "object": "chat.completion",
                    "created": created,
                    "model": model_name,
                    "system_fingerprint": system_fingerprint(),
                    "choices": [{
                        "index": 0,
                        "message": {
                            "role": "assistant",
                            "content": collector.content,
                            "reasoning_content": collector.thinking,
                        },
                        "finish_reason": meta.stop_reason.as_str(),
                    }],
                    "usage": usage,
                }),
                OpenAiMode::Completion => json!({
                    "id": stream_id(mode),
                    "object": "text_completion",
                    "created": created,
                    "model": model_name,
                    "system_fingerprint": system_fingerprint(),
                    "choices": [{
                        "text": collector.content,
                        "index": 0,
                        "logprobs": null,
                        "finish_reason": meta.stop_reason.as_str(),
                    }],
                    "usage": usage,
                }),
            };
            Ok(Some(body))
        }
    })
    .await;

    drop(scope);
    finish_blocking(&state, &stream, keep, outcome).await
}

async fn handle_embeddings(
    state: Arc<ServerState>,
    stream: SharedStream,
    req: HttpRequest,
    openai_shape: bool,
) -> bool {
    let keep = req.keep_alive();
    let cors = state.config.cors;
    let Ok(body) = parse_json_body(&req) else {
        write_response(&stream, cors, &HttpResponse::error(400, "Invalid JSON")).await;
        return !keep;
    };
    let text = body["prompt"]
        .as_str()
        .or_else(|| body["input"].as_str())
        .or_else(|| body["input"].as_array().and_then(|a| a.first()).and_then(Value::as_str))
        .map(str::to_string);
    let Some(text) = text else {
        write_response(&stream, cors, &HttpResponse::error(400, "missing input text")).await;
        return !keep;
    };
    let Some(tag) = requested_tag(&state, &body) else {
        write_response(&stream, cors, &HttpResponse::error(400, "missing model tag")).await;
        return !keep;
    };

    let task_state = state.clone();
    let outcome = tokio::task::spawn_blocking(move || -> BlockingOutcome {
        let mut engine = task_state.engine.lock();
        let model = engine
            .ensure_loaded(&tag)
            .map_err(|e| (engine_error_status(&e), e.to_string()))?;
        let model_name = model.tag().to_string();
        *task_state.loaded_tag.lock() = Some(model_name.clone());
        let vector = model
            .embed(&text)
            .map_err(|e| (engine_error_status(&e), e.to_string()))?;
        let body = if openai_shape {
            json!({
                "object": "list",
                "data": [{
                    "object": "embedding",
                    "embedding": vector,
                    "index": 0,
                }],
                "model": model_name,
            })
        } else {
            json!({ "embedding": vector })
        };
        Ok(Some(body))
    })
    .await;

    finish_blocking(&state, &stream, keep, outcome).await
}

async fn handle_transcriptions(
    state: Arc<ServerState>,
    stream: SharedStream,
    req: HttpRequest,
) -> bool {
    let keep = req.keep_alive();
    let cors = state.config.cors;
    let Some(boundary) = multipart::boundary_from_content_type(req.content_type()) else {
        write_response(
            &stream,
            cors,
            &HttpResponse::error(400, "expected multipart/form-data"),
        )
        .await;
        return !keep;
    };
    let parts = multipart::parse_multipart(&req.body, &boundary);
    let Some(file) = parts.get("file").cloned() else {
        write_response(&stream, cors, &HttpResponse::error(400, "missing file part")).await;
        return !keep;
    };

    let task_state = state.clone();
    let outcome = tokio::task::spawn_blocking(move || -> BlockingOutcome {
        let pcm = asr::decode_wav(&file.content)
            .map_err(|e| (engine_error_status(&e), e.to_string()))?;
        let mut engine = task_state.engine.lock();
        let whisper = engine
            .ensure_whisper()
            .map_err(|e| (engine_error_status(&e), e.to_string()))?;
        let mut meta = ChatMeta::default();
        let text = whisper
            .transcribe(&pcm, &mut meta)
            .map_err(|e| (engine_error_status(&e), e.to_string()))?;
        Ok(Some(json!({ "text": text })))
    })
    .await;

    finish_blocking(&state, &stream, keep, outcome).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_table() {
        assert_eq!(route("POST", "/api/generate"), Route::Generate);
        assert_eq!(route("POST", "/api/chat"), Route::Chat);
        assert_eq!(route("GET", "/api/tags"), Route::Tags);
        assert_eq!(route("GET", "/api/ps"), Route::Ps);
        assert_eq!(route("GET", "/api/version"), Route::Version);
        assert_eq!(route("POST", "/api/show"), Route::Show);
        assert_eq!(route("POST", "/api/cancel"), Route::Cancel);
        assert_eq!(route("GET", "/v1/models"), Route::OpenAiModels);
        assert_eq!(route("POST", "/v1/chat/completions"), Route::OpenAiChat);
        assert_eq!(route("POST", "/v1/completions"), Route::OpenAiCompletions);
        assert_eq!(route("POST", "/v1/embeddings"), Route::OpenAiEmbeddings);
        assert_eq!(
            route("POST", "/v1/audio/transcriptions"),
            Route::Transcriptions
        );
        // Method mismatches miss.
        assert_eq!(route("GET", "/api/chat"), Route::NotFound);
        assert_eq!(route("POST", "/api/tags"), Route::NotFound);
    }

    #[test]
    fn test_npu_exclusive_routes() {
        for exclusive in [
            Route::Generate,
            Route::Chat,
            Route::Embeddings,
            Route::OpenAiChat,
            Route::OpenAiCompletions,
            Route::OpenAiEmbeddings,
            Route::Transcriptions,
        ] {
            assert!(requires_npu(exclusive), "{exclusive:?}");
        }
        for shared in [Route::Tags, Route::Ps, Route::Version, Route::Show, Route::Cancel] {
            assert!(!requires_npu(shared), "{shared:?}");
        }
    }

    #[test]
    fn test_message_parsing_accepts_both_shapes() {
        let value = json!([
            { "role": "user", "content": "hi" },
            { "role": "user", "content": [
                { "type": "text", "text": "part one " },
                { "type": "image_url", "image_url": { "url": "ignored" } },
                { "type": "text", "text": "part two" },
            ]},
        ]);
        let messages = parse_messages(&value).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hi");
        assert_eq!(messages[1].content, "part one part two");
        assert!(parse_messages(&json!("nope")).is_err());
        assert!(parse_messages(&json!([{ "role": "user" }])).is_err());
    }

    #[test]
    fn test_sampler_defaults_match_handlers() {
        let params = sampler_from(&json!({}));
        assert_eq!(params.temperature, 0.6);
        assert_eq!(params.top_p, 0.9);
        assert_eq!(params.top_k, 5);
        assert_eq!(params.repetition_penalty, 1.1);
        assert_eq!(params.frequency_penalty, 0.0);

        let params = sampler_from(&json!({
            "temperature": 0.0,
            "top_k": 1,
            "repetition_penalty": 1.5,
            "frequency_penalty": 0.25,
        }));
        assert_eq!(params.temperature, 0.0);
        assert_eq!(params.top_k, 1);
        assert_eq!(params.repetition_penalty, 1.5);
        assert_eq!(params.frequency_penalty, 0.25);
    }
}
