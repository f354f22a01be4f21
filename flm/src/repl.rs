//! Interactive chat loop.
//!
//! A thin line-based front-end over the engine: slash commands for session
//! control, everything else becomes the next user turn. Output flows
//! through the same UTF-8 gate and channel filter the server uses, with
//! reasoning content wrapped in `<think>` markers on the terminal.

use std::io::{BufRead, Write};
use std::sync::Arc;

use tracing::warn;

use flm_engine::catalog::ModelCatalog;
use flm_engine::meta::ChatMeta;
use flm_engine::template::{ChatFamily, Message};
use flm_engine::{CancelHandle, EngineRuntime, LmInput, TokenSink};
use flm_npu::DeviceManager;
use flm_server::filter::{Channel, HarmonyFilter, Utf8Gate};

const HELP: &str = "\
Commands:
  /set <param> <value>   set temperature, top_k, top_p, repeat_penalty,
                         frequency_penalty or system
  /think on|off          toggle the reasoning channel
  /show                  show model configuration
  /status                show context usage
  /history               print the conversation so far
  /save <file>           save the conversation
  /load <file>           load a conversation
  /clear                 clear the context
  /bye                   exit
  /?                     this help";

/// Streams generation output to the terminal.
struct StdoutSink {
    utf8: Utf8Gate,
    harmony: Option<HarmonyFilter>,
    thinking_open: bool,
}

impl StdoutSink {
    fn new(harmony: bool) -> Self {
        Self {
            utf8: Utf8Gate::new(),
            harmony: harmony.then(HarmonyFilter::new),
            thinking_open: false,
        }
    }

    fn write_fragment(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        let mut out = std::io::stdout().lock();
        match self.harmony.as_mut() {
            Some(filter) => match filter.classify(fragment) {
                Channel::Template => {}
                Channel::Reasoning => {
                    if !self.thinking_open {
                        let _ = write!(out, "<think>\n");
                        self.thinking_open = true;
                    }
                    let _ = write!(out, "{fragment}");
                }
                Channel::Response => {
                    if self.thinking_open {
                        let _ = write!(out, "\n</think>\n\n");
                        self.thinking_open = false;
                    }
                    let _ = write!(out, "{fragment}");
                }
            },
            None => {
                let _ = write!(out, "{fragment}");
            }
        }
        let _ = out.flush();
    }

    fn finish(&mut self) {
        let tail = self.utf8.finalize();
        self.write_fragment(&tail);
        if self.thinking_open {
            let mut out = std::io::stdout().lock();
            let _ = write!(out, "\n</think>\n");
            let _ = out.flush();
            self.thinking_open = false;
        }
    }
}

impl TokenSink for StdoutSink {
    fn push(&mut self, text: &str) -> bool {
        let ready = self.utf8.push(text.as_bytes());
        self.write_fragment(&ready);
        true
    }
}

pub fn run(
    catalog: Arc<ModelCatalog>,
    device: Arc<DeviceManager>,
    tag: &str,
    ctx_len: Option<usize>,
    asr: bool,
) -> Result<(), String> {
    let mut runtime = EngineRuntime::new(device, catalog, ctx_len);
    if asr {
        if let Err(err) = runtime.ensure_whisper() {
            warn!("speech model unavailable: {err}");
        }
    }
    runtime.ensure_loaded(tag).map_err(|e| e.to_string())?;

    let mut messages: Vec<Message> = Vec::new();
    let mut system_prompt = String::new();
    let mut think = false;
    println!("Type /? for help");

    let stdin = std::io::stdin();
    let mut empty_count = 0u32;
    loop {
        print!(">>> ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).map_err(|e| e.to_string())? == 0 {
            break; // EOF
        }
        let line = line.trim();
        if line.is_empty() {
            empty_count += 1;
            if empty_count > 2 {
                println!("Type /? for help");
                empty_count = 0;
            }
            continue;
        }
        empty_count = 0;

        if let Some(command) = line.strip_prefix('/') {
            let mut parts = command.split_whitespace();
            let name = parts.next().unwrap_or_default();
            let rest: Vec<&str> = parts.collect();
            match name {
                "bye" => break,
                "clear" => {
                    messages.clear();
                    if let Some(model) = runtime.model() {
                        model.clear_context();
                    }
                    println!("Context cleared.");
                }
                "show" => {
                    if let Some(model) = runtime.model() {
                        print!("{}", model.config().summary());
                    }
                }
                "status" => {
                    if let Some(model) = runtime.model() {
                        println!(
                            "context: {} / {} tokens, {} turns",
                            model.context_len(),
                            model.max_context(),
                            messages.len()
                        );
                    }
                }
                "history" => {
                    for msg in &messages {
                        println!("[{}] {}", msg.role, msg.content);
                    }
                }
                "think" => {
                    think = rest.first().map(|v| *v == "on").unwrap_or(!think);
                    println!("thinking {}", if think { "on" } else { "off" });
                }
                "set" => match (rest.first().copied(), rest.get(1..)) {
                    (Some("system"), Some(words)) => {
                        system_prompt = words.join(" ");
                        println!("system prompt set");
                    }
                    (Some(param), Some([value])) => {
                        apply_set(&mut runtime, param, *value);
                    }
                    _ => println!("usage: /set <param> <value>"),
                },
                "save" => match rest.first() {
                    Some(path) => {
                        let body = serde_json::to_string_pretty(&messages)
                            .map_err(|e| e.to_string())?;
                        match std::fs::write(path, body) {
                            Ok(()) => println!("saved to {path}"),
                            Err(err) => println!("save failed: {err}"),
                        }
                    }
                    None => println!("usage: /save <file>"),
                },
                "load" => match rest.first() {
                    Some(path) => match std::fs::read_to_string(path) {
                        Ok(raw) => match serde_json::from_str(&raw) {
                            Ok(loaded) => {
                                messages = loaded;
                                println!("loaded {} turns", messages.len());
                            }
                            Err(err) => println!("load failed: {err}"),
                        },
                        Err(err) => println!("load failed: {err}"),
                    },
                    None => println!("usage: /load <file>"),
                },
                "?" | "help" => println!("{HELP}"),
                other => println!("unknown command /{other}; try /?"),
            }
            continue;
        }

        // A user turn: replay the whole conversation into a fresh context.
        messages.push(Message::new("user", line));
        let model = runtime.ensure_loaded(tag).map_err(|e| e.to_string())?;
        model.clear_context();
        model.configure("enable_think", &serde_json::json!(think));
        model.configure("system_prompt", &serde_json::json!(system_prompt));
        let harmony = model.family() == ChatFamily::Harmony;

        let mut meta = ChatMeta::default();
        let cancel = CancelHandle::new();
        let input = LmInput {
            prompt: None,
            messages: messages.clone(),
        };
        let mut sink = StdoutSink::new(harmony);
        let turn = match model.insert(&mut meta, &input, &cancel) {
            Ok(false) => {
                println!("[context full; /clear to continue]");
                Ok(())
            }
            Ok(true) => model.generate(&mut meta, 4096, &mut sink, &cancel),
            Err(err) => Err(err),
        };
        sink.finish();
        println!();
        match turn {
            Ok(()) => {
                let (response, _) = model.history();
                messages.push(Message::new("assistant", &response));
            }
            Err(err) => {
                messages.pop();
                eprintln!("[ERROR] {err}");
            }
        }
    }
    Ok(())
}

fn apply_set(runtime: &mut EngineRuntime, param: &str, value: &str) {
    let Some(model) = runtime.model() else {
        println!("no model loaded");
        return;
    };
    let params = model.sampler_params_mut();
    let applied = match param {
        "temperature" => value.parse().map(|v| params.temperature = v).is_ok(),
        "top_k" => value.parse().map(|v| params.top_k = v).is_ok(),
        "top_p" => value.parse().map(|v| params.top_p = v).is_ok(),
        "repeat_penalty" => value.parse().map(|v| params.repetition_penalty = v).is_ok(),
        "frequency_penalty" => value.parse().map(|v| params.frequency_penalty = v).is_ok(),
        _ => {
            println!("unknown parameter `{param}`");
            return;
        }
    };
    if applied {
        println!("{param} set to {value}");
    } else {
        println!("cannot parse `{value}` for {param}");
    }
}
