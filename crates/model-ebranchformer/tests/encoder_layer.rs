//! End-to-end checks of a single E-Branchformer layer.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use model_ebranchformer::{EBranchformerConfig, EBranchformerEncoderLayer, LayerCache, SelfAttentionCache};

fn layer_config() -> EBranchformerConfig {
    EBranchformerConfig {
        output_size: 256,
        attention_heads: 4,
        causal: true,
        cgmlp_conv_kernel: 3,
        cgmlp_linear_units: 512,
        linear_units: 1024,
        num_blocks: 1,
        ..EBranchformerConfig::base()
    }
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

#[test]
fn test_layer_forward_shapes_and_caches() {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let layer = EBranchformerEncoderLayer::from_config(&layer_config(), 0, vb).unwrap();

    let x = Tensor::randn(0f32, 1f32, (2, 10, 256), &dev).unwrap();
    let pos_emb = Tensor::randn(0f32, 1f32, (1, 10, 256), &dev).unwrap();
    let mask = Tensor::ones((2, 10, 10), DType::U8, &dev).unwrap();

    let out = layer
        .forward(&x, Some(&mask), &pos_emb, LayerCache::default(), false)
        .unwrap();

    assert_eq!(out.xs.dims(), &[2, 10, 256]);
    assert_eq!(out.mask.as_ref().unwrap().dims(), mask.dims());

    let cnn = out.cache.cnn.as_ref().expect("causal cgMLP returns a conv cache");
    assert_eq!(cnn.dims(), &[2, 256, 2]);

    let cross = out.cache.cross_att.as_ref().expect("inference returns a cross cache");
    assert_eq!(cross.key.dim(2).unwrap(), 10);
    assert_eq!(cross.value.dim(2).unwrap(), 10);

    match out.cache.self_att.as_ref() {
        Some(SelfAttentionCache::Packed(packed)) => assert_eq!(packed.0.dims(), &[2, 4, 10, 128]),
        other => panic!("unexpected self-attention cache {other:?}"),
    }
}

#[test]
fn test_layer_without_mask_matches_all_valid_mask() {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let cfg = EBranchformerConfig::small();
    let layer = EBranchformerEncoderLayer::from_config(&cfg, 0, vb).unwrap();

    let x = Tensor::randn(0f32, 1f32, (2, 6, 32), &dev).unwrap();
    let pos_emb = Tensor::randn(0f32, 1f32, (1, 6, 32), &dev).unwrap();
    let ones = Tensor::ones((2, 1, 6), DType::U8, &dev).unwrap();

    let a = layer.forward(&x, None, &pos_emb, LayerCache::default(), false).unwrap();
    let b = layer
        .forward(&x, Some(&ones), &pos_emb, LayerCache::default(), false)
        .unwrap();
    assert!(max_abs_diff(&a.xs, &b.xs) < 1e-5);
    assert!(a.mask.is_none());
}

#[test]
fn test_layer_threads_streaming_caches() {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let cfg = EBranchformerConfig::small();
    let layer = EBranchformerEncoderLayer::from_config(&cfg, 0, vb).unwrap();

    let first = Tensor::randn(0f32, 1f32, (1, 4, 32), &dev).unwrap();
    let pos = Tensor::randn(0f32, 1f32, (1, 4, 32), &dev).unwrap();
    let out = layer.forward(&first, None, &pos, LayerCache::default(), false).unwrap();
    assert_eq!(out.cache.self_att.as_ref().unwrap().seq_len(), 4);

    let second = Tensor::randn(0f32, 1f32, (1, 3, 32), &dev).unwrap();
    let pos = Tensor::randn(0f32, 1f32, (1, 7, 32), &dev).unwrap();
    let cache = LayerCache {
        cross_att: None,
        ..out.cache
    };
    let out = layer.forward(&second, None, &pos, cache, false).unwrap();
    assert_eq!(out.xs.dims(), &[1, 3, 32]);
    assert_eq!(out.cache.self_att.as_ref().unwrap().seq_len(), 7);
    assert_eq!(out.cache.cnn.as_ref().unwrap().dims(), &[1, 32, 4]);
    assert_eq!(out.cache.fusion.as_ref().unwrap().dims(), &[1, 64, 2]);
}
