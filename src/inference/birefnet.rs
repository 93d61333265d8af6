use super::SegmentationNet;
use crate::error::{BgError, Result};
use crate::models::registry::ModelId;
use candle_core::{Device, Tensor};
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use std::path::Path;

/// BiRefNet exported to ONNX, run through ONNX Runtime
///
/// Tensors cross the boundary on the host, so the candle side always
/// works on the CPU even when the session runs on CUDA.
pub struct BiRefNetOnnx {
    session: Session,
    device: Device,
}

impl BiRefNetOnnx {
    pub fn load(id: ModelId, path: &Path, intra_threads: usize, use_gpu: bool) -> Result<Self> {
        let mut builder = Session::builder()
            .map_err(|e| BgError::load(id, format!("Failed to create ONNX session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| BgError::load(id, format!("Failed to set optimization level: {e}")))?
            .with_intra_threads(intra_threads)
            .map_err(|e| BgError::load(id, format!("Failed to set thread count: {e}")))?;

        if use_gpu {
            builder = builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])
                .map_err(|e| {
                    BgError::load(id, format!("Failed to register CUDA execution provider: {e}"))
                })?;
        }

        let session = builder.commit_from_file(path).map_err(|e| {
            BgError::load(id, format!("Failed to load model from {}: {e}", path.display()))
        })?;

        if session.outputs.is_empty() {
            return Err(BgError::load(id, "ONNX graph has no outputs"));
        }
        for (i, output) in session.outputs.iter().enumerate() {
            tracing::debug!("{id} output[{i}]: '{}'", output.name);
        }

        Ok(Self {
            session,
            device: Device::Cpu,
        })
    }
}

impl SegmentationNet for BiRefNetOnnx {
    fn forward(&mut self, input: &Tensor) -> candle_core::Result<Tensor> {
        let dims = input.dims4()?;
        let data = input.flatten_all()?.to_vec1::<f32>()?;

        let input = ort::value::Tensor::from_array((
            [dims.0, dims.1, dims.2, dims.3],
            data.into_boxed_slice(),
        ))
        .map_err(|e| candle_core::Error::msg(format!("Failed to build input tensor: {e}")))?;

        let outputs = self
            .session
            .run(ort::inputs![input])
            .map_err(|e| candle_core::Error::msg(format!("ONNX inference failed: {e}")))?;

        let head = final_head(outputs.len())?;
        let (shape, values) = outputs[head]
            .try_extract_tensor::<f32>()
            .map_err(|e| candle_core::Error::msg(format!("Unexpected output tensor: {e}")))?;

        let (height, width, map) = image_map(&shape[..], values)?;
        Tensor::from_slice(map, (1, 1, height, width), &self.device)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Index of the output carrying the full-resolution prediction, the last head
fn final_head(outputs: usize) -> candle_core::Result<usize> {
    outputs
        .checked_sub(1)
        .ok_or_else(|| candle_core::Error::msg("ONNX graph produced no outputs"))
}

/// First `(height, width)` plane of an output shaped `[.., height, width]`
fn image_map<'a>(shape: &[i64], values: &'a [f32]) -> candle_core::Result<(usize, usize, &'a [f32])> {
    let not_a_map = || candle_core::Error::msg(format!("Output shape {shape:?} is not an image map"));

    let [.., h, w] = shape else {
        return Err(not_a_map());
    };
    let (height, width) = match (usize::try_from(*h), usize::try_from(*w)) {
        (Ok(height), Ok(width)) if height > 0 && width > 0 => (height, width),
        _ => return Err(not_a_map()),
    };

    let map = values.get(..height * width).ok_or_else(|| {
        candle_core::Error::msg(format!(
            "Output holds {} values for shape {shape:?}",
            values.len()
        ))
    })?;
    Ok((height, width, map))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_head_is_last_output() {
        assert_eq!(final_head(1).unwrap(), 0);
        // Multi-scale exports list coarse heads first
        assert_eq!(final_head(4).unwrap(), 3);
        assert!(final_head(0).is_err());
    }

    #[test]
    fn test_image_map_takes_first_plane() {
        let values: Vec<f32> = (0..12).map(|v| v as f32).collect();

        let (h, w, map) = image_map(&[1, 1, 2, 3], &values[..6]).unwrap();
        assert_eq!((h, w), (2, 3));
        assert_eq!(map, &values[..6]);

        let (h, w, map) = image_map(&[1, 3, 2, 2], &values).unwrap();
        assert_eq!((h, w), (2, 2));
        assert_eq!(map, &[0.0, 1.0, 2.0, 3.0]);

        let (h, w, _) = image_map(&[2, 3], &values[..6]).unwrap();
        assert_eq!((h, w), (2, 3));
    }

    #[test]
    fn test_image_map_rejects_bad_shapes() {
        let values = [0f32; 8];
        assert!(image_map(&[8], &values).is_err());
        assert!(image_map(&[], &values).is_err());
        assert!(image_map(&[1, 1, -1, 4], &values).is_err());
        assert!(image_map(&[1, 1, 0, 4], &values).is_err());
        // Fewer values than the shape promises
        let err = image_map(&[1, 1, 3, 3], &values).unwrap_err();
        assert!(err.to_string().contains("8 values"));
    }
}
