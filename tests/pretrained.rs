//! Integration test for the pre-trained FMCIB trunk.
//!
//! Run with: `cargo test --features pretrained -- --ignored`

#![cfg(feature = "pretrained")]

use burn::backend::NdArray;
use burn::tensor::Tensor;

use fmcib_burn::{weights::Fmcib, ResNet};

type B = NdArray<f32>;

#[test]
#[ignore] // Requires checkpoint download; run with: cargo test --features pretrained -- --ignored
fn pretrained_trunk_produces_finite_features() {
    let device = Default::default();
    let model: ResNet<B> = ResNet::fmcib_pretrained(Fmcib::FoundationV1, &device)
        .expect("Failed to load pre-trained weights");

    assert_eq!(model.num_features(), 4096);

    let input = Tensor::<B, 4>::ones([1, 1, 96, 96], &device);
    let features = model.forward(input);

    assert_eq!(features.dims(), [1, 4096]);

    let data = features.to_data();
    let values = data.as_slice::<f32>().unwrap();
    assert!(values.iter().all(|v| v.is_finite()));
}
