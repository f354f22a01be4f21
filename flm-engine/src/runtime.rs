//! Engine runtime: the loaded-model slot shared by the server, the REPL and
//! the benchmark driver.
//!
//! One model per process instance. `ensure_loaded` swaps the slot when the
//! requested tag differs from what is resident, pulling the archive first if
//! it is missing on disk.

use std::sync::Arc;

use tracing::info;

use flm_npu::{DeviceManager, NpuGeneration, PowerMode};

use crate::asr::Whisper;
use crate::catalog::ModelCatalog;
use crate::download::ModelDownloader;
use crate::model::AutoModel;
use crate::Result;

/// Catalog tag of the bundled transcription model.
pub const WHISPER_TAG: &str = "whisper-v3:turbo";

/// The device handle, either opened eagerly (REPL, bench) or on the first
/// model load (server).
enum DeviceSlot {
    Open(Arc<DeviceManager>),
    Deferred {
        device_id: u32,
        generation: NpuGeneration,
        power_mode: PowerMode,
        preemption: bool,
    },
}

pub struct EngineRuntime {
    device: DeviceSlot,
    catalog: Arc<ModelCatalog>,
    downloader: ModelDownloader,
    ctx_len: Option<usize>,
    model: Option<AutoModel>,
    whisper: Option<Whisper>,
}

impl EngineRuntime {
    pub fn new(
        device: Arc<DeviceManager>,
        catalog: Arc<ModelCatalog>,
        ctx_len: Option<usize>,
    ) -> Self {
        let downloader = ModelDownloader::new(catalog.clone());
        Self {
            device: DeviceSlot::Open(device),
            catalog,
            downloader,
            ctx_len,
            model: None,
            whisper: None,
        }
    }

    /// Runtime whose device opens on the first model load.
    pub fn deferred(
        power_mode: PowerMode,
        preemption: bool,
        catalog: Arc<ModelCatalog>,
        ctx_len: Option<usize>,
    ) -> Self {
        let downloader = ModelDownloader::new(catalog.clone());
        Self {
            device: DeviceSlot::Deferred {
                device_id: 0,
                generation: NpuGeneration::Npu2,
                power_mode,
                preemption,
            },
            catalog,
            downloader,
            ctx_len,
            model: None,
            whisper: None,
        }
    }

    fn device(&mut self) -> Result<Arc<DeviceManager>> {
        let (device_id, generation, power_mode, preemption) = match &self.device {
            DeviceSlot::Open(manager) => return Ok(manager.clone()),
            DeviceSlot::Deferred {
                device_id,
                generation,
                power_mode,
                preemption,
            } => (*device_id, *generation, *power_mode, *preemption),
        };
        let manager = Arc::new(DeviceManager::new(
            device_id, generation, power_mode, preemption,
        )?);
        self.device = DeviceSlot::Open(manager.clone());
        Ok(manager)
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn downloader(&self) -> &ModelDownloader {
        &self.downloader
    }

    pub fn loaded_tag(&self) -> Option<String> {
        self.model.as_ref().map(|m| m.tag().to_string())
    }

    pub fn model(&mut self) -> Option<&mut AutoModel> {
        self.model.as_mut()
    }

    /// Load (or swap to) the model behind `tag`, downloading it first when
    /// absent.
    pub fn ensure_loaded(&mut self, tag: &str) -> Result<&mut AutoModel> {
        let canonical = self.catalog.rectify_tag(tag)?;
        let resident = self
            .model
            .as_ref()
            .map(|m| m.tag() == canonical)
            .unwrap_or(false);
        if !resident {
            if !self.downloader.is_downloaded(&canonical) {
                self.downloader.pull(&canonical, false)?;
            }
            let dir = self.catalog.model_dir(&canonical)?;
            let device = self.device()?;
            info!(target: "flm::engine", tag = %canonical, "loading model");
            // Drop the previous model before loading the next one; the
            // runtime holds a single model per process.
            self.model = None;
            let loaded = AutoModel::load(&canonical, &dir, device, self.ctx_len)?;
            return Ok(self.model.insert(loaded));
        }
        match self.model.as_mut() {
            Some(model) => Ok(model),
            None => Err(crate::EngineError::ModelNotFound(canonical)),
        }
    }

    /// Load the transcription model on first use.
    pub fn ensure_whisper(&mut self) -> Result<&mut Whisper> {
        if self.whisper.is_none() {
            if !self.downloader.is_downloaded(WHISPER_TAG) {
                self.downloader.pull(WHISPER_TAG, false)?;
            }
            let dir = self.catalog.model_dir(WHISPER_TAG)?;
            let device = self.device()?;
            let loaded = Whisper::load(&dir, device)?;
            return Ok(self.whisper.insert(loaded));
        }
        match self.whisper.as_mut() {
            Some(whisper) => Ok(whisper),
            None => Err(crate::EngineError::ModelNotFound(WHISPER_TAG.into())),
        }
    }
}
