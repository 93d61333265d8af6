//! IS-Net segmentation network (BriaRMBG) on Candle
//!
//! A nested U-structure: every encoder and decoder stage is itself a small
//! U-Net (an RSU block). Parameter names follow the published checkpoint so
//! `model.safetensors` maps without renaming.

use super::pipeline::resize_bilinear;
use super::SegmentationNet;
use crate::error::BgError;
use crate::models::registry::ModelId;
use candle_core::{Device, Module, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, VarBuilder};
use serde::Deserialize;
use std::path::Path;

/// Subset of the checkpoint's `config.json` the network depends on
#[derive(Debug, Clone, Deserialize)]
pub struct IsnetConfig {
    #[serde(default = "default_in_ch")]
    pub in_ch: usize,
    #[serde(default = "default_out_ch")]
    pub out_ch: usize,
}

fn default_in_ch() -> usize {
    3
}

fn default_out_ch() -> usize {
    1
}

impl IsnetConfig {
    /// Read and check the config of model `id`
    pub fn from_file(id: ModelId, path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BgError::load(id, format!("Failed to read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| BgError::load(id, format!("Failed to parse {}: {e}", path.display())))?;

        if config.in_ch != 3 {
            return Err(BgError::load(
                id,
                format!("expected 3 input channels, config has {}", config.in_ch),
            ));
        }
        if config.out_ch != 1 {
            return Err(BgError::load(
                id,
                format!("expected a single output map, config has {}", config.out_ch),
            ));
        }
        Ok(config)
    }
}

/// 3x3 conv, batch norm, ReLU
struct ReBnConv {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ReBnConv {
    fn new(in_ch: usize, out_ch: usize, dilation: usize, vb: VarBuilder) -> Result<Self> {
        let config = Conv2dConfig {
            padding: dilation,
            dilation,
            ..Default::default()
        };
        Ok(Self {
            conv: candle_nn::conv2d(in_ch, out_ch, 3, config, vb.pp("conv_s1"))?,
            bn: candle_nn::batch_norm(out_ch, 1e-5, vb.pp("bn_s1"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.bn.forward_t(&self.conv.forward(x)?, false)?.relu()
    }
}

/// 2x2 max pool with stride 2, rounding odd sizes up
fn pool2x(x: &Tensor) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    let mut x = x.clone();
    if h % 2 == 1 {
        x = x.pad_with_same(2, 0, 1)?;
    }
    if w % 2 == 1 {
        x = x.pad_with_same(3, 0, 1)?;
    }
    x.max_pool2d(2)
}

fn upsample_like(src: &Tensor, target: &Tensor) -> Result<Tensor> {
    let (_, _, h, w) = target.dims4()?;
    resize_bilinear(src, h, w)
}

/// Residual U-block of the given height
///
/// The plain form halves resolution between encoder levels. The dilated
/// form (`RSU4F`) keeps resolution and widens the receptive field with
/// growing dilation instead.
struct Rsu {
    dilated: bool,
    conv_in: ReBnConv,
    encoders: Vec<ReBnConv>,
    decoders: Vec<ReBnConv>,
}

impl Rsu {
    fn new(
        height: usize,
        dilated: bool,
        in_ch: usize,
        mid_ch: usize,
        out_ch: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let rate = |level: usize| if dilated { 1 << (level - 1) } else { 1 };

        let conv_in = ReBnConv::new(in_ch, out_ch, 1, vb.pp("rebnconvin"))?;

        let mut encoders = Vec::with_capacity(height);
        for level in 1..=height {
            let in_ch = if level == 1 { out_ch } else { mid_ch };
            let dilation = if level == height && !dilated {
                2
            } else {
                rate(level)
            };
            encoders.push(ReBnConv::new(
                in_ch,
                mid_ch,
                dilation,
                vb.pp(format!("rebnconv{level}")),
            )?);
        }

        let mut decoders = Vec::with_capacity(height - 1);
        for level in (1..height).rev() {
            let out = if level == 1 { out_ch } else { mid_ch };
            decoders.push(ReBnConv::new(
                mid_ch * 2,
                out,
                rate(level),
                vb.pp(format!("rebnconv{level}d")),
            )?);
        }

        Ok(Self {
            dilated,
            conv_in,
            encoders,
            decoders,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hxin = self.conv_in.forward(x)?;
        let last = self.encoders.len() - 1;

        let mut skips = Vec::with_capacity(last);
        let mut hx = hxin.clone();
        for (level, encoder) in self.encoders[..last].iter().enumerate() {
            let out = encoder.forward(&hx)?;
            hx = if self.dilated || level + 1 == last {
                out.clone()
            } else {
                pool2x(&out)?
            };
            skips.push(out);
        }

        let mut hx = self.encoders[last].forward(&hx)?;
        for (decoder, skip) in self.decoders.iter().zip(skips.iter().rev()) {
            let up = if self.dilated {
                hx
            } else {
                upsample_like(&hx, skip)?
            };
            hx = decoder.forward(&Tensor::cat(&[&up, skip], 1)?)?;
        }

        hx + hxin
    }
}

/// BriaRMBG: IS-Net with a strided stem, six encoder and five decoder stages
pub struct BriaRmbg {
    device: Device,
    conv_in: Conv2d,
    encoders: Vec<Rsu>,
    decoders: Vec<Rsu>,
    side1: Conv2d,
}

impl BriaRmbg {
    pub fn new(config: &IsnetConfig, vb: VarBuilder, device: Device) -> Result<Self> {
        let stem = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let conv_in = candle_nn::conv2d(config.in_ch, 64, 3, stem, vb.pp("conv_in"))?;

        let encoders = vec![
            Rsu::new(7, false, 64, 32, 64, vb.pp("stage1"))?,
            Rsu::new(6, false, 64, 32, 128, vb.pp("stage2"))?,
            Rsu::new(5, false, 128, 64, 256, vb.pp("stage3"))?,
            Rsu::new(4, false, 256, 128, 512, vb.pp("stage4"))?,
            Rsu::new(4, true, 512, 256, 512, vb.pp("stage5"))?,
            Rsu::new(4, true, 512, 256, 512, vb.pp("stage6"))?,
        ];

        let decoders = vec![
            Rsu::new(4, true, 1024, 256, 512, vb.pp("stage5d"))?,
            Rsu::new(4, false, 1024, 128, 256, vb.pp("stage4d"))?,
            Rsu::new(5, false, 512, 64, 128, vb.pp("stage3d"))?,
            Rsu::new(6, false, 256, 32, 64, vb.pp("stage2d"))?,
            Rsu::new(7, false, 128, 16, 64, vb.pp("stage1d"))?,
        ];

        let side = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let side1 = candle_nn::conv2d(64, config.out_ch, 3, side, vb.pp("side1"))?;

        Ok(Self {
            device,
            conv_in,
            encoders,
            decoders,
            side1,
        })
    }
}

impl SegmentationNet for BriaRmbg {
    /// Sigmoid of the finest side output, at input resolution
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let mut hx = self.conv_in.forward(input)?;

        let last = self.encoders.len() - 1;
        let mut skips = Vec::with_capacity(last);
        for (stage, encoder) in self.encoders.iter().enumerate() {
            let out = encoder.forward(&hx)?;
            if stage == last {
                hx = out;
            } else {
                hx = pool2x(&out)?;
                skips.push(out);
            }
        }

        for (decoder, skip) in self.decoders.iter().zip(skips.iter().rev()) {
            let up = upsample_like(&hx, skip)?;
            hx = decoder.forward(&Tensor::cat(&[&up, skip], 1)?)?;
        }

        let side = upsample_like(&self.side1.forward(&hx)?, input)?;
        candle_nn::ops::sigmoid(&side)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use tempfile::TempDir;

    #[test]
    fn test_config_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"model_type": "SegformerForSemanticSegmentation"}"#).unwrap();

        let config = IsnetConfig::from_file(ModelId::Rmbg14, &path).unwrap();
        assert_eq!(config.in_ch, 3);
        assert_eq!(config.out_ch, 1);
    }

    #[test]
    fn test_config_rejects_bad_channels() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        for contents in [r#"{"in_ch": 4, "out_ch": 1}"#, r#"{"in_ch": 3, "out_ch": 2}"#, "not json"] {
            std::fs::write(&path, contents).unwrap();
            let err = IsnetConfig::from_file(ModelId::Rmbg14, &path).unwrap_err();
            assert!(
                matches!(&err, BgError::ModelLoadFailure { model, .. } if model == "rmbg14"),
                "unexpected error for {contents}: {err}"
            );
        }

        let err = IsnetConfig::from_file(ModelId::Rmbg14, &dir.path().join("missing.json"))
            .unwrap_err();
        assert!(matches!(err, BgError::ModelLoadFailure { .. }));
    }

    #[test]
    fn test_pool2x_rounds_up() {
        let x = Tensor::arange(0f32, 15f32, &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 3, 5))
            .unwrap();
        let pooled = pool2x(&x).unwrap();
        assert_eq!(pooled.dims(), &[1, 1, 2, 3]);
        let values = pooled.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(values, vec![6.0, 8.0, 9.0, 11.0, 13.0, 14.0]);
    }

    #[test]
    fn test_rsu_keeps_shape() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let x = Tensor::ones((1, 4, 13, 9), DType::F32, &Device::Cpu).unwrap();

        let plain = Rsu::new(4, false, 4, 2, 6, vb.pp("plain")).unwrap();
        assert_eq!(plain.forward(&x).unwrap().dims(), &[1, 6, 13, 9]);

        let dilated = Rsu::new(4, true, 4, 2, 6, vb.pp("dilated")).unwrap();
        assert_eq!(dilated.forward(&x).unwrap().dims(), &[1, 6, 13, 9]);
    }
}
