//! Model loading and background removal
//!
//! The [`InferenceEngine`] owns the single active model. Loading and
//! inference both go through the same lock, so a load never races an
//! in-flight `remove_background` call. Both calls block for seconds and are
//! meant to run on a blocking worker thread, not on the async runtime.
//!
//! Status queries (`loaded_model`, `device`) read a separate cell that is
//! only written while the model lock is held, so they return immediately
//! even during a long inference.

pub mod birefnet;
pub mod isnet;
pub mod pipeline;

use crate::error::{BgError, Result};
use crate::models::download::missing_files;
use crate::models::registry::{self, ModelDescriptor, ModelId, Variant};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

/// A segmentation network behind one of the two pipelines
pub trait SegmentationNet: Send {
    /// Run the network on a `(1, 3, 1024, 1024)` input
    ///
    /// Returns the map the pipeline post-processes, shaped `(1, C, H, W)`;
    /// only the first channel is used.
    fn forward(&mut self, input: &Tensor) -> candle_core::Result<Tensor>;

    /// Device input tensors must be placed on
    fn device(&self) -> &Device;
}

/// Builds networks from a model directory
pub trait NetworkLoader: Send + Sync {
    fn open(
        &self,
        descriptor: &ModelDescriptor,
        model_dir: &Path,
        device: &Device,
    ) -> Result<Box<dyn SegmentationNet>>;
}

/// Compute device requested in config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

/// Pick the compute device for a preference
///
/// `Auto` prefers CUDA, then Metal, then the CPU.
pub fn select_device(preference: DevicePreference) -> candle_core::Result<Device> {
    match preference {
        DevicePreference::Auto => {
            let device = Device::cuda_if_available(0)?;
            if !device.is_cpu() {
                Ok(device)
            } else if candle_core::utils::metal_is_available() {
                Device::new_metal(0)
            } else {
                Ok(Device::Cpu)
            }
        }
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Cuda => Device::new_cuda(0),
        DevicePreference::Metal => Device::new_metal(0),
    }
}

#[must_use]
pub const fn describe_device(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

/// Loads IS-Net weights with Candle and BiRefNet graphs with ONNX Runtime
#[derive(Debug, Clone)]
pub struct RuntimeLoader {
    intra_threads: usize,
}

impl RuntimeLoader {
    #[must_use]
    pub const fn new(intra_threads: usize) -> Self {
        Self { intra_threads }
    }
}

impl Default for RuntimeLoader {
    fn default() -> Self {
        Self::new(4)
    }
}

impl NetworkLoader for RuntimeLoader {
    fn open(
        &self,
        descriptor: &ModelDescriptor,
        model_dir: &Path,
        device: &Device,
    ) -> Result<Box<dyn SegmentationNet>> {
        let id = descriptor.id;
        let weights = model_dir.join(descriptor.weights);

        match descriptor.variant {
            Variant::Isnet => {
                let config = isnet::IsnetConfig::from_file(id, &model_dir.join("config.json"))?;

                // SAFETY: the model directory is only written by the downloader,
                // which never rewrites a file in place once it passed verification.
                let vb = unsafe {
                    VarBuilder::from_mmaped_safetensors(&[&weights], DType::F32, device)
                }
                .map_err(|e| {
                    BgError::load(id, format!("Failed to map {}: {e}", weights.display()))
                })?;

                let net = isnet::BriaRmbg::new(&config, vb, device.clone())
                    .map_err(|e| BgError::load(id, format!("Incompatible weights: {e}")))?;
                Ok(Box::new(net))
            }
            Variant::BiRefNet => {
                let net = birefnet::BiRefNetOnnx::load(
                    id,
                    &weights,
                    self.intra_threads,
                    !device.is_cpu(),
                )?;
                Ok(Box::new(net))
            }
        }
    }
}

/// The single active model
pub struct LoadedModel {
    id: ModelId,
    variant: Variant,
    net: Box<dyn SegmentationNet>,
}

impl LoadedModel {
    #[must_use]
    pub const fn id(&self) -> ModelId {
        self.id
    }

    fn remove_background(&mut self, path: &Path) -> Result<RgbaImage> {
        let source = image::open(path)
            .map_err(|e| BgError::inference(path, format!("Failed to decode image: {e}")))?;
        let rgb = source.to_rgb8();

        let mask = match self.variant {
            Variant::Isnet => pipeline::isnet_mask(&rgb, self.net.as_mut()),
            Variant::BiRefNet => pipeline::birefnet_mask(&rgb, self.net.as_mut()),
        }
        .map_err(|e| BgError::inference(path, e))?;

        Ok(pipeline::apply_alpha(&source, &mask))
    }
}

/// Holder of the currently loaded model
pub struct InferenceEngine {
    models_dir: PathBuf,
    device: DevicePreference,
    loader: Box<dyn NetworkLoader>,
    active: Mutex<Option<LoadedModel>>,
    /// Id and device of `active`, readable without waiting on it
    status: RwLock<Option<(ModelId, &'static str)>>,
}

impl InferenceEngine {
    /// Create an engine that loads models from `models_dir/<id>`
    pub fn new(
        models_dir: impl Into<PathBuf>,
        device: DevicePreference,
        loader: Box<dyn NetworkLoader>,
    ) -> Self {
        Self {
            models_dir: models_dir.into(),
            device,
            loader,
            active: Mutex::new(None),
            status: RwLock::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<LoadedModel>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Must be called with the `active` lock held
    fn publish(&self, status: Option<(ModelId, &'static str)>) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn status(&self) -> Option<(ModelId, &'static str)> {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load `name`, replacing the current model
    ///
    /// The previous model is released before the new one is built so both
    /// never occupy the device at once. If loading fails no model is loaded.
    pub fn load_model(&self, name: &str) -> Result<()> {
        let descriptor = registry::lookup(name)?;
        let id = descriptor.id;
        let model_dir = self.models_dir.join(id.as_str());

        let mut active = self.lock();
        if let Some(previous) = active.take() {
            self.publish(None);
            tracing::info!("Unloading model {}", previous.id);
            drop(previous);
        }

        let missing = missing_files(descriptor, &model_dir);
        if !missing.is_empty() {
            return Err(BgError::load(
                id,
                format!("missing files in {}: {}", model_dir.display(), missing.join(", ")),
            ));
        }

        let device = select_device(self.device)
            .map_err(|e| BgError::load(id, format!("No usable compute device: {e}")))?;

        tracing::info!(
            "Loading model {} on {}",
            descriptor.display_name,
            describe_device(&device)
        );
        let net = self.loader.open(descriptor, &model_dir, &device)?;
        tracing::debug!("Network for {id} ready, inputs on {}", describe_device(net.device()));

        self.publish(Some((id, describe_device(net.device()))));
        *active = Some(LoadedModel {
            id,
            variant: descriptor.variant,
            net,
        });
        Ok(())
    }

    /// Strip the background of the image at `path` with the loaded model
    pub fn remove_background(&self, path: &Path) -> Result<RgbaImage> {
        let mut active = self.lock();
        let model = active.as_mut().ok_or(BgError::NoModelLoaded)?;
        tracing::debug!("Removing background from {} with {}", path.display(), model.id);
        model.remove_background(path)
    }

    /// Like [`remove_background`](Self::remove_background), but only with model `expected`
    ///
    /// Fails the image instead of running it through another network if the
    /// loaded model was replaced since the caller loaded `expected`.
    pub fn remove_background_with(&self, expected: ModelId, path: &Path) -> Result<RgbaImage> {
        let mut active = self.lock();
        let model = active.as_mut().ok_or(BgError::NoModelLoaded)?;
        if model.id != expected {
            return Err(BgError::inference(
                path,
                format!("model {expected} was replaced by {}", model.id),
            ));
        }
        model.remove_background(path)
    }

    /// Identifier of the loaded model, if any
    #[must_use]
    pub fn loaded_model(&self) -> Option<ModelId> {
        self.status().map(|(id, _)| id)
    }

    /// Compute device of the loaded model, if any
    #[must_use]
    pub fn device(&self) -> Option<&'static str> {
        self.status().map(|(_, device)| device)
    }

    /// Release the loaded model
    pub fn unload(&self) {
        let mut active = self.lock();
        if let Some(previous) = active.take() {
            self.publish(None);
            tracing::info!("Unloading model {}", previous.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::registry::RMBG14;
    use std::sync::mpsc;
    use tempfile::TempDir;

    struct ConstantNet(Device);

    impl SegmentationNet for ConstantNet {
        fn forward(&mut self, _input: &Tensor) -> candle_core::Result<Tensor> {
            Tensor::ones((1, 1, 1024, 1024), DType::F32, &self.0)
        }

        fn device(&self) -> &Device {
            &self.0
        }
    }

    struct ConstantLoader;

    impl NetworkLoader for ConstantLoader {
        fn open(
            &self,
            _descriptor: &ModelDescriptor,
            _model_dir: &Path,
            _device: &Device,
        ) -> Result<Box<dyn SegmentationNet>> {
            Ok(Box::new(ConstantNet(Device::Cpu)))
        }
    }

    /// Blocks inside `forward` until released
    struct GatedNet {
        device: Device,
        entered: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    }

    impl SegmentationNet for GatedNet {
        fn forward(&mut self, _input: &Tensor) -> candle_core::Result<Tensor> {
            self.entered.send(()).ok();
            self.release.recv().ok();
            Tensor::ones((1, 1, 1024, 1024), DType::F32, &self.device)
        }

        fn device(&self) -> &Device {
            &self.device
        }
    }

    struct GatedLoader(Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>);

    impl NetworkLoader for GatedLoader {
        fn open(
            &self,
            _descriptor: &ModelDescriptor,
            _model_dir: &Path,
            _device: &Device,
        ) -> Result<Box<dyn SegmentationNet>> {
            let (entered, release) = self
                .0
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| BgError::Other("gate already used".to_string()))?;
            Ok(Box::new(GatedNet {
                device: Device::Cpu,
                entered,
                release,
            }))
        }
    }

    fn install(dir: &TempDir, id: ModelId) {
        let model_dir = dir.path().join(id.as_str());
        for file in id.descriptor().files {
            let path = model_dir.join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"").unwrap();
        }
    }

    fn sample_image(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("sample.png");
        image::RgbImage::new(4, 3).save(&path).unwrap();
        path
    }

    fn engine(dir: &TempDir) -> InferenceEngine {
        InferenceEngine::new(dir.path(), DevicePreference::Cpu, Box::new(ConstantLoader))
    }

    #[test]
    fn test_select_cpu_device() {
        let device = select_device(DevicePreference::Cpu).unwrap();
        assert!(device.is_cpu());
        assert_eq!(describe_device(&device), "cpu");
    }

    #[test]
    fn test_auto_device_always_resolves() {
        // Falls back to the CPU when neither CUDA nor Metal is usable
        let device = select_device(DevicePreference::Auto).unwrap();
        assert!(["cpu", "cuda", "metal"].contains(&describe_device(&device)));
    }

    #[test]
    fn test_remove_background_without_model() {
        let dir = TempDir::new().unwrap();
        let result = engine(&dir).remove_background(Path::new("missing.png"));
        assert!(matches!(result, Err(BgError::NoModelLoaded)));
    }

    #[test]
    fn test_load_unknown_model() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            engine(&dir).load_model("rmbg99"),
            Err(BgError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_load_with_missing_files_fails() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let err = engine.load_model("rmbg14").unwrap_err();
        assert!(matches!(err, BgError::ModelLoadFailure { .. }));
        assert!(err.to_string().contains("model.safetensors"));
        assert_eq!(engine.loaded_model(), None);
    }

    #[test]
    fn test_load_and_unload() {
        let dir = TempDir::new().unwrap();
        let model_dir = dir.path().join("rmbg14");
        std::fs::create_dir_all(&model_dir).unwrap();
        for file in RMBG14.files {
            std::fs::write(model_dir.join(file), b"").unwrap();
        }

        let engine = engine(&dir);
        engine.load_model("rmbg14").unwrap();
        assert_eq!(engine.loaded_model(), Some(ModelId::Rmbg14));
        assert_eq!(engine.device(), Some("cpu"));

        engine.unload();
        assert_eq!(engine.loaded_model(), None);
        assert_eq!(engine.device(), None);
    }

    #[test]
    fn test_status_readable_during_inference() {
        let dir = TempDir::new().unwrap();
        install(&dir, ModelId::Rmbg14);
        let image = sample_image(&dir);

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let engine = InferenceEngine::new(
            dir.path(),
            DevicePreference::Cpu,
            Box::new(GatedLoader(Mutex::new(Some((entered_tx, release_rx))))),
        );
        engine.load_model("rmbg14").unwrap();

        std::thread::scope(|scope| {
            let worker = scope.spawn(|| engine.remove_background(&image));
            entered_rx.recv().unwrap();

            // The model lock is held by the worker right now
            assert_eq!(engine.loaded_model(), Some(ModelId::Rmbg14));
            assert_eq!(engine.device(), Some("cpu"));

            release_tx.send(()).unwrap();
            let result = worker.join().unwrap().unwrap();
            assert_eq!(result.dimensions(), (4, 3));
        });
    }

    #[test]
    fn test_remove_background_with_replaced_model_fails() {
        let dir = TempDir::new().unwrap();
        install(&dir, ModelId::Rmbg14);
        install(&dir, ModelId::Rmbg20);
        let image = sample_image(&dir);
        let engine = engine(&dir);

        engine.load_model("rmbg14").unwrap();
        assert!(engine.remove_background_with(ModelId::Rmbg14, &image).is_ok());

        engine.load_model("rmbg20").unwrap();
        let err = engine
            .remove_background_with(ModelId::Rmbg14, &image)
            .unwrap_err();
        assert!(matches!(err, BgError::InferenceFailure { .. }));
        assert!(err.to_string().contains("rmbg20"));
    }

    #[test]
    fn test_isnet_config_rejects_multi_channel_output() {
        let dir = TempDir::new().unwrap();
        let model_dir = dir.path().join("rmbg14");
        std::fs::create_dir_all(&model_dir).unwrap();
        for file in RMBG14.files {
            std::fs::write(model_dir.join(file), b"").unwrap();
        }
        std::fs::write(model_dir.join("config.json"), r#"{"in_ch": 3, "out_ch": 2}"#).unwrap();

        let engine = InferenceEngine::new(
            dir.path(),
            DevicePreference::Cpu,
            Box::new(RuntimeLoader::default()),
        );
        let err = engine.load_model("rmbg14").unwrap_err();
        assert!(matches!(err, BgError::ModelLoadFailure { .. }));
    }
}
