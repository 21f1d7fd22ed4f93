use core::f64::consts::SQRT_2;

use alloc::vec::Vec;

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Device, Tensor},
};

/// Expansion factor of the bottleneck residual block.
const EXPANSION: usize = 4;

fn conv_initializer() -> Initializer {
    Initializer::KaimingNormal {
        gain: SQRT_2, // recommended value for ReLU
        fan_out_only: true,
    }
}

/// ResNet bottleneck residual block implementation.
/// Derived from [torchvision.models.resnet.Bottleneck](https://github.com/pytorch/vision/blob/main/torchvision/models/resnet.py)
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv3: Conv2d<B>,
    bn3: BatchNorm<B, 2>,
    relu: Relu,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> Bottleneck<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = input.clone();

        // Conv block
        let out = self.conv1.forward(input);
        let out = self.bn1.forward(out);
        let out = self.relu.forward(out);
        let out = self.conv2.forward(out);
        let out = self.bn2.forward(out);
        let out = self.relu.forward(out);
        let out = self.conv3.forward(out);
        let out = self.bn3.forward(out);

        // Skip connection
        let out = {
            match &self.downsample {
                Some(downsample) => out + downsample.forward(identity),
                None => out + identity,
            }
        };

        // Activation
        self.relu.forward(out)
    }

    /// Number of output channels of the block.
    pub(crate) fn out_channels(&self) -> usize {
        self.conv3.weight.dims()[0]
    }
}

/// [Bottleneck block](Bottleneck) configuration.
pub struct BottleneckConfig {
    conv1: Conv2dConfig,
    bn1: BatchNormConfig,
    conv2: Conv2dConfig,
    bn2: BatchNormConfig,
    conv3: Conv2dConfig,
    bn3: BatchNormConfig,
    downsample: Option<DownsampleConfig>,
}

impl BottleneckConfig {
    /// Create a new instance of the bottleneck block [config](BottleneckConfig).
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        bias_downsample: bool,
    ) -> Self {
        // Intermediate (compressed) channels of the bottleneck
        let planes = out_channels / EXPANSION;

        // conv1x1
        let conv1 = Conv2dConfig::new([in_channels, planes], [1, 1])
            .with_stride([1, 1])
            .with_padding(PaddingConfig2d::Explicit(0, 0))
            .with_bias(false);
        let bn1 = BatchNormConfig::new(planes);
        // conv3x3
        let conv2 = Conv2dConfig::new([planes, planes], [3, 3])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false);
        let bn2 = BatchNormConfig::new(planes);
        // conv1x1
        let conv3 = Conv2dConfig::new([planes, out_channels], [1, 1])
            .with_stride([1, 1])
            .with_padding(PaddingConfig2d::Explicit(0, 0))
            .with_bias(false);
        let bn3 = BatchNormConfig::new(out_channels);

        // Skip connection projection when the resolution or channels change
        let downsample = {
            if in_channels != out_channels || stride != 1 {
                Some(DownsampleConfig::new(
                    in_channels,
                    out_channels,
                    stride,
                    bias_downsample,
                ))
            } else {
                None
            }
        };

        Self {
            conv1,
            bn1,
            conv2,
            bn2,
            conv3,
            bn3,
            downsample,
        }
    }

    /// Initialize a new [bottleneck block](Bottleneck) module.
    pub fn init<B: Backend>(self, device: &Device<B>) -> Bottleneck<B> {
        Bottleneck {
            conv1: self.conv1.with_initializer(conv_initializer()).init(device),
            bn1: self.bn1.init(device),
            conv2: self.conv2.with_initializer(conv_initializer()).init(device),
            bn2: self.bn2.init(device),
            conv3: self.conv3.with_initializer(conv_initializer()).init(device),
            bn3: self.bn3.init(device),
            relu: Relu::new(),
            downsample: self.downsample.map(|d| d.init(device)),
        }
    }
}

/// Downsample layer applies a 1x1 conv to reduce the resolution [H, W] and adjust the number of channels.
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> Downsample<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.conv.forward(input);
        self.bn.forward(out)
    }
}

/// [Downsample](Downsample) configuration.
pub struct DownsampleConfig {
    conv: Conv2dConfig,
    bn: BatchNormConfig,
}

impl DownsampleConfig {
    /// Create a new instance of the downsample [config](DownsampleConfig).
    pub fn new(in_channels: usize, out_channels: usize, stride: usize, bias: bool) -> Self {
        // conv1x1 (default padding = valid)
        let conv = Conv2dConfig::new([in_channels, out_channels], [1, 1])
            .with_stride([stride, stride])
            .with_bias(bias);
        let bn = BatchNormConfig::new(out_channels);

        Self { conv, bn }
    }

    /// Initialize a new [downsample](Downsample) module.
    pub fn init<B: Backend>(self, device: &Device<B>) -> Downsample<B> {
        Downsample {
            conv: self.conv.with_initializer(conv_initializer()).init(device),
            bn: self.bn.init(device),
        }
    }
}

/// Collection of sequential bottleneck blocks.
#[derive(Module, Debug)]
pub struct LayerBlock<B: Backend> {
    blocks: Vec<Bottleneck<B>>,
}

impl<B: Backend> LayerBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut out = input;
        for block in &self.blocks {
            out = block.forward(out);
        }
        out
    }

    /// Number of output channels of the layer.
    pub(crate) fn out_channels(&self) -> usize {
        self.blocks
            .last()
            .expect("Layer should contain at least one block")
            .out_channels()
    }
}

/// [Residual layer block](LayerBlock) configuration.
pub struct LayerBlockConfig {
    num_blocks: usize,
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    bias_downsample: bool,
}

impl LayerBlockConfig {
    /// Create a new instance of the layer block [config](LayerBlockConfig).
    pub fn new(
        num_blocks: usize,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        bias_downsample: bool,
    ) -> Self {
        Self {
            num_blocks,
            in_channels,
            out_channels,
            stride,
            bias_downsample,
        }
    }

    /// Initialize a new [layer block](LayerBlock) module.
    pub fn init<B: Backend>(self, device: &Device<B>) -> LayerBlock<B> {
        let blocks = (0..self.num_blocks)
            .map(|b| {
                if b == 0 {
                    // First block uses the specified stride
                    BottleneckConfig::new(
                        self.in_channels,
                        self.out_channels,
                        self.stride,
                        self.bias_downsample,
                    )
                    .init(device)
                } else {
                    // Other blocks use a stride of 1
                    BottleneckConfig::new(
                        self.out_channels,
                        self.out_channels,
                        1,
                        self.bias_downsample,
                    )
                    .init(device)
                }
            })
            .collect();

        LayerBlock { blocks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn bottleneck_projects_skip_connection_on_channel_change() {
        let device = Default::default();

        let block: Bottleneck<B> = BottleneckConfig::new(16, 32, 1, true).init(&device);
        assert!(block.downsample.is_some());

        let block: Bottleneck<B> = BottleneckConfig::new(32, 32, 1, true).init(&device);
        assert!(block.downsample.is_none());

        let block: Bottleneck<B> = BottleneckConfig::new(32, 32, 2, true).init(&device);
        assert!(block.downsample.is_some());
    }

    #[test]
    fn bottleneck_forward_shape() {
        let device = Default::default();
        let block: Bottleneck<B> = BottleneckConfig::new(16, 32, 2, true).init(&device);

        let input = Tensor::<B, 4>::zeros([2, 16, 8, 8], &device);
        let out = block.forward(input);

        assert_eq!(out.dims(), [2, 32, 4, 4]);
    }

    #[test]
    fn downsample_bias_follows_config() {
        let device = Default::default();

        let downsample: Downsample<B> = DownsampleConfig::new(16, 32, 2, true).init(&device);
        assert!(downsample.conv.bias.is_some());

        let downsample: Downsample<B> = DownsampleConfig::new(16, 32, 2, false).init(&device);
        assert!(downsample.conv.bias.is_none());
    }

    #[test]
    fn layer_block_forward_shape() {
        let device = Default::default();
        let layer: LayerBlock<B> = LayerBlockConfig::new(3, 16, 32, 2, true).init(&device);

        assert_eq!(layer.blocks.len(), 3);
        assert_eq!(layer.out_channels(), 32);

        let input = Tensor::<B, 4>::zeros([1, 16, 8, 8], &device);
        let out = layer.forward(input);

        assert_eq!(out.dims(), [1, 32, 4, 4]);
    }
}
