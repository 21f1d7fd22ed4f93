use core::f64::consts::SQRT_2;

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Initializer, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Device, Tensor},
};

use super::block::{LayerBlock, LayerBlockConfig};

#[cfg(feature = "pretrained")]
use {
    crate::error::WeightsError,
    crate::weights::{self, CheckpointLayout, WeightsMeta},
    burn::record::{FullPrecisionSettings, Recorder, RecorderError},
    burn_import::pytorch::{LoadArgs, PyTorchFileRecorder},
    std::path::PathBuf,
};

// ResNet-50 residual layer block config
const RESNET50_BLOCKS: [usize; 4] = [3, 4, 6, 3];
// Channel expansion factor of the bottleneck residual blocks
const EXPANSION: usize = 4;

/// ResNet-50 variant used as the FMCIB foundation model trunk.
/// Derived from [torchvision.models.resnet.ResNet](https://github.com/pytorch/vision/blob/main/torchvision/models/resnet.py),
/// with the trunk modifications of [fmcib](https://github.com/AIM-Harvard/foundation-cancer-image-biomarker):
/// configurable input channels, a channel widening factor, a configurable stem
/// stride, biased downsample projections and an optional classification head.
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    relu: Relu,
    maxpool: MaxPool2d,
    layer1: LayerBlock<B>,
    layer2: LayerBlock<B>,
    layer3: LayerBlock<B>,
    layer4: LayerBlock<B>,
    avgpool: AdaptiveAvgPool2d,
    fc: Option<Linear<B>>,
}

impl<B: Backend> ResNet<B> {
    /// Forward pass.
    ///
    /// Returns the classification logits when a head is attached, and the
    /// pooled trunk features otherwise.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let out = self.forward_features(input);

        match &self.fc {
            Some(fc) => fc.forward(out),
            None => out,
        }
    }

    /// Forward pass up to (and including) the global pooling.
    ///
    /// # Shapes
    ///
    /// - input: `[batch, channels, height, width]`
    /// - output: `[batch, features]`
    pub fn forward_features(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        // First block
        let out = self.conv1.forward(input);
        let out = self.bn1.forward(out);
        let out = self.relu.forward(out);
        let out = self.maxpool.forward(out);

        // Residual blocks
        let out = self.layer1.forward(out);
        let out = self.layer2.forward(out);
        let out = self.layer3.forward(out);
        let out = self.layer4.forward(out);

        let out = self.avgpool.forward(out);
        // Reshape [B, C, 1, 1] -> [B, C]
        out.flatten(1, 3)
    }

    /// FMCIB foundation model trunk: a widened, single-channel ResNet-50
    /// without a classification head. The forward pass returns 4096-wide
    /// features.
    ///
    /// # Arguments
    ///
    /// * `device` - Device to create the module on.
    ///
    /// # Returns
    ///
    /// A randomly initialized trunk.
    pub fn fmcib(device: &Device<B>) -> Self {
        ResNetConfig::new().init(device)
    }

    /// Number of output features of the trunk.
    pub fn num_features(&self) -> usize {
        self.layer4.out_channels()
    }

    /// Attach (or re-initialize) the classification head with the specified
    /// number of output classes.
    pub fn with_classes(mut self, num_classes: usize) -> Self {
        let d_input = self.layer4.out_channels();
        let device = self.conv1.weight.device();
        self.fc = Some(LinearConfig::new(d_input, num_classes).init(&device));
        self
    }
}

#[cfg(feature = "pretrained")]
impl<B: Backend> ResNet<B> {
    /// FMCIB foundation model trunk with pre-trained weights.
    ///
    /// The checkpoint is downloaded to the local cache directory on first use.
    ///
    /// # Arguments
    ///
    /// * `weights`: Pre-trained weights to load.
    /// * `device` - Device to create the module on.
    ///
    /// # Returns
    ///
    /// The trunk with pre-trained weights.
    pub fn fmcib_pretrained(
        weights: weights::Fmcib,
        device: &Device<B>,
    ) -> Result<Self, WeightsError> {
        let weights = weights.weights();
        let torch_weights = weights.download()?;

        Self::fmcib_from_file(torch_weights, weights.layout, device)
    }

    /// FMCIB foundation model trunk with pre-trained weights loaded from a
    /// local PyTorch checkpoint.
    ///
    /// Checkpoint entries with no counterpart in the trunk (e.g., projection
    /// head parameters saved by a training harness) are ignored.
    ///
    /// # Arguments
    ///
    /// * `path`: Path to the checkpoint file.
    /// * `layout`: How model parameters are keyed inside the checkpoint.
    /// * `device` - Device to create the module on.
    ///
    /// # Returns
    ///
    /// The trunk with the checkpoint weights.
    pub fn fmcib_from_file(
        path: PathBuf,
        layout: CheckpointLayout,
        device: &Device<B>,
    ) -> Result<Self, WeightsError> {
        log::info!("Loading FMCIB trunk weights from {}", path.display());
        let record = Self::load_weights_record(path, layout, device)?;
        let model = ResNet::<B>::fmcib(device).load_record(record);

        Ok(model)
    }

    /// Load pre-trained PyTorch weights as a record.
    fn load_weights_record(
        path: PathBuf,
        layout: CheckpointLayout,
        device: &Device<B>,
    ) -> Result<ResNetRecord<B>, RecorderError> {
        // Select the parameters sub-dictionary and strip training-harness
        // prefixes from the keys
        let load_args = match layout {
            CheckpointLayout::Trunk => LoadArgs::new(path).with_top_level_key("trunk_state_dict"),
            CheckpointLayout::TrainingHarness => LoadArgs::new(path)
                .with_top_level_key("state_dict")
                // Map model.backbone.* -> *
                .with_key_remap("^model\\.backbone\\.(.+)", "$1")
                // Map module.* -> *
                .with_key_remap("^module\\.(.+)", "$1"),
        };

        let load_args = load_args
            // Map *.downsample.0.* -> *.downsample.conv.*
            .with_key_remap("(.+)\\.downsample\\.0\\.(.+)", "$1.downsample.conv.$2")
            // Map *.downsample.1.* -> *.downsample.bn.*
            .with_key_remap("(.+)\\.downsample\\.1\\.(.+)", "$1.downsample.bn.$2")
            // Map layer[i].[j].* -> layer[i].blocks.[j].*
            .with_key_remap("(layer[1-4])\\.([0-9]+)\\.(.+)", "$1.blocks.$2.$3");
        let record = PyTorchFileRecorder::<FullPrecisionSettings>::new().load(load_args, device)?;

        Ok(record)
    }
}

/// [ResNet](ResNet) configuration.
///
/// The defaults are the FMCIB trunk: a single input channel, a widening
/// factor of 2, a stem stride of 2, biased downsample projections and no
/// classification head.
pub struct ResNetConfig {
    in_channels: usize,
    widen_factor: usize,
    conv1_stride: usize,
    bias_downsample: bool,
    num_classes: Option<usize>,
}

impl Default for ResNetConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ResNetConfig {
    /// Create a new instance of the ResNet [config](ResNetConfig).
    pub fn new() -> Self {
        Self {
            in_channels: 1,
            widen_factor: 2,
            conv1_stride: 2,
            bias_downsample: true,
            num_classes: None,
        }
    }

    /// Set the number of input channels.
    pub fn with_in_channels(mut self, in_channels: usize) -> Self {
        self.in_channels = in_channels;
        self
    }

    /// Set the channel widening factor.
    pub fn with_widen_factor(mut self, widen_factor: usize) -> Self {
        self.widen_factor = widen_factor;
        self
    }

    /// Set the stride of the stem convolution.
    pub fn with_conv1_stride(mut self, conv1_stride: usize) -> Self {
        self.conv1_stride = conv1_stride;
        self
    }

    /// Set whether the downsample projections carry a bias.
    pub fn with_bias_downsample(mut self, bias_downsample: bool) -> Self {
        self.bias_downsample = bias_downsample;
        self
    }

    /// Set the number of output classes of the head, or `None` for a bare
    /// trunk returning pooled features.
    pub fn with_num_classes(mut self, num_classes: Option<usize>) -> Self {
        self.num_classes = num_classes;
        self
    }

    /// Initialize a new [ResNet](ResNet) module.
    pub fn init<B: Backend>(self, device: &Device<B>) -> ResNet<B> {
        assert!(self.widen_factor > 0, "Widening factor should be non-zero");
        assert!(self.conv1_stride > 0, "Stem stride should be non-zero");

        let stem_channels = 64 * self.widen_factor;

        // 7x7 conv, 64 * widen_factor, /2
        let conv1 = Conv2dConfig::new([self.in_channels, stem_channels], [7, 7])
            .with_stride([self.conv1_stride, self.conv1_stride])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .with_initializer(Initializer::KaimingNormal {
                gain: SQRT_2, // recommended value for ReLU
                fan_out_only: true,
            });
        let bn1 = BatchNormConfig::new(stem_channels);

        // 3x3 maxpool, /2
        let maxpool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1));

        // Residual blocks
        let b = self.bias_downsample;
        let outs: [usize; 4] = core::array::from_fn(|i| 64 * (1 << i) * EXPANSION * self.widen_factor);
        let layer1 = LayerBlockConfig::new(RESNET50_BLOCKS[0], stem_channels, outs[0], 1, b);
        let layer2 = LayerBlockConfig::new(RESNET50_BLOCKS[1], outs[0], outs[1], 2, b);
        let layer3 = LayerBlockConfig::new(RESNET50_BLOCKS[2], outs[1], outs[2], 2, b);
        let layer4 = LayerBlockConfig::new(RESNET50_BLOCKS[3], outs[2], outs[3], 2, b);

        // Average pooling [B, C, H, W] -> [B, C, 1, 1]
        let avgpool = AdaptiveAvgPool2dConfig::new([1, 1]);

        // Output layer, absent on the bare trunk
        let fc = self
            .num_classes
            .map(|num_classes| LinearConfig::new(outs[3], num_classes));

        ResNet {
            conv1: conv1.init(device),
            bn1: bn1.init(device),
            relu: Relu::new(),
            maxpool: maxpool.init(),
            layer1: layer1.init(device),
            layer2: layer2.init(device),
            layer3: layer3.init(device),
            layer4: layer4.init(device),
            avgpool: avgpool.init(),
            fc: fc.map(|fc| fc.init(device)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn fmcib_trunk_outputs_4096_features() {
        let device = Default::default();
        let model: ResNet<B> = ResNet::fmcib(&device);

        assert_eq!(model.num_features(), 4096);

        let input = Tensor::<B, 4>::zeros([1, 1, 32, 32], &device);
        let out = model.forward(input);

        assert_eq!(out.dims(), [1, 4096]);
    }

    #[test]
    fn config_controls_trunk_width() {
        let device = Default::default();
        let model: ResNet<B> = ResNetConfig::new()
            .with_in_channels(3)
            .with_widen_factor(1)
            .init(&device);

        assert_eq!(model.num_features(), 2048);

        let input = Tensor::<B, 4>::zeros([2, 3, 32, 32], &device);
        let out = model.forward(input);

        assert_eq!(out.dims(), [2, 2048]);
    }

    #[test]
    fn head_outputs_class_logits() {
        let device = Default::default();
        let model: ResNet<B> = ResNetConfig::new()
            .with_widen_factor(1)
            .with_num_classes(Some(10))
            .init(&device);

        let input = Tensor::<B, 4>::zeros([1, 1, 32, 32], &device);
        let out = model.forward(input);

        assert_eq!(out.dims(), [1, 10]);
    }

    #[test]
    fn with_classes_attaches_head_to_trunk() {
        let device = Default::default();
        let model: ResNet<B> = ResNetConfig::new().with_widen_factor(1).init(&device);
        let model = model.with_classes(7);

        let input = Tensor::<B, 4>::zeros([1, 1, 32, 32], &device);
        let out = model.forward(input);

        assert_eq!(out.dims(), [1, 7]);
    }

    #[test]
    fn stem_stride_controls_resolution() {
        let device = Default::default();
        let model: ResNet<B> = ResNetConfig::new()
            .with_widen_factor(1)
            .with_conv1_stride(1)
            .init(&device);

        let input = Tensor::<B, 4>::zeros([1, 1, 32, 32], &device);
        let out = model.forward_features(input);

        assert_eq!(out.dims(), [1, 2048]);
    }
}
