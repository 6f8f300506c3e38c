//! Integration tests for capture, rewrite and freeze.
//!
//! These tests drive the compiler through its public API only and compare
//! compiled results against eager execution of the same callable.

use std::sync::Arc;

use diffjit_core::{DType, MemoryFormat, Result};
use diffjit_jit::{
    capture, CallArgs, Forward, GraphCompiler, JitConfig, JitError, ParamStore, RewriteOptions,
    RewritePipeline, Value,
};
use diffjit_tensor::{creation, Tensor};

// =============================================================================
// Helpers
// =============================================================================

fn mlp_params(hidden: usize, seed: u64) -> Arc<ParamStore> {
    let params = Arc::new(ParamStore::new());
    params.register("w", creation::uniform_seeded(&[hidden, hidden], -0.1, 0.1, seed));
    params.register("b", creation::uniform_seeded(&[hidden], -0.1, 0.1, seed + 1));
    params
}

/// relu(x @ w^T + b), written the way an unfused model spells it.
fn mlp(params: &Arc<ParamStore>) -> Arc<dyn Forward> {
    let params = Arc::clone(params);
    Arc::new(move |args: &CallArgs| -> Result<Value> {
        let w = params.require("w")?;
        let b = params.require("b")?;
        let x = args.tensor(0)?;
        Ok(Value::Tensor(x.matmul(&w.transpose(0, 1)?)?.add(&b)?.relu()?))
    })
}

fn conv_block_params() -> Arc<ParamStore> {
    let params = Arc::new(ParamStore::new());
    params.register("conv.w", creation::uniform_seeded(&[4, 4, 3, 3], -0.2, 0.2, 11));
    params.register("conv.b", creation::uniform_seeded(&[4], -0.1, 0.1, 12));
    params.register("norm.w", creation::ones(&[4]));
    params.register("norm.b", creation::zeros(&[4]));
    params
}

/// A residual conv block followed by group norm and SiLU.
fn conv_block(params: &Arc<ParamStore>) -> Arc<dyn Forward> {
    let params = Arc::clone(params);
    Arc::new(move |args: &CallArgs| -> Result<Value> {
        let x = args.tensor(0)?;
        let w = params.require("conv.w")?;
        let b = params.require("conv.b")?;
        let gw = params.require("norm.w")?;
        let gb = params.require("norm.b")?;
        let h = x.conv2d(&w, Some(&b), 1, 1)?.add(x)?.relu()?;
        let h = h.contiguous()?.group_norm(2, Some((&gw, &gb)), 1e-5)?.silu()?;
        Ok(Value::Tensor(h))
    })
}

fn eager(f: &Arc<dyn Forward>, args: &CallArgs) -> Tensor {
    f.call(args).unwrap().into_tensor().unwrap()
}

// =============================================================================
// Equivalence
// =============================================================================

/// Test 1: Compiled MLP matches eager execution
#[test]
fn test_compiled_mlp_matches_eager() {
    let params = mlp_params(128, 1);
    let f = mlp(&params);
    let compiler = GraphCompiler::default();

    for (rows, seed) in [(1, 3), (4, 4)] {
        let x = creation::uniform_seeded(&[rows, 128], -1.0, 1.0, seed);
        let args = CallArgs::from_tensors([x]);
        let artifact = compiler.compile(f.as_ref(), &args, &params, false).unwrap();
        assert_eq!(artifact.graph().count_ops("fused_linear"), 1);

        let expected = eager(&f, &args);
        let got = artifact.run(&args).unwrap().into_tensor().unwrap();
        assert_eq!(got.shape(), expected.shape());
        assert!(got.allclose(&expected, 1e-5, 1e-6));
    }
    println!("compiled mlp matches eager");
}

/// Test 2: Conv block with every rewrite enabled matches eager execution
#[test]
fn test_conv_block_all_rewrites() {
    let params = conv_block_params();
    let f = conv_block(&params);
    let options = RewriteOptions {
        memory_format: Some(MemoryFormat::ChannelsLast),
        fuse_group_norm_silu: true,
        ..RewriteOptions::default()
    };
    let compiler = GraphCompiler::new(JitConfig::new().rewrite(options));

    let x = creation::uniform_seeded(&[1, 4, 6, 6], -1.0, 1.0, 21);
    let args = CallArgs::from_tensors([x]);
    let artifact = compiler.compile(f.as_ref(), &args, &params, false).unwrap();
    let graph = artifact.graph();
    assert_eq!(graph.count_ops("fused_conv2d"), 1);
    assert_eq!(graph.count_ops("fused_group_norm_silu"), 1);
    assert_eq!(graph.count_ops("contiguous"), 0);

    let expected = eager(&f, &args);
    let got = artifact.run(&args).unwrap().into_tensor().unwrap();
    assert!(got.allclose(&expected, 1e-5, 1e-5));
}

/// Test 3: Reduced-precision GEMMs stay within a looser tolerance
#[test]
fn test_lowp_gemm_tolerance() {
    let params = mlp_params(64, 5);
    let f = mlp(&params);
    let options = RewriteOptions {
        prefer_lowp_gemm: true,
        ..RewriteOptions::default()
    };
    let compiler = GraphCompiler::new(JitConfig::new().rewrite(options));

    let x = creation::uniform_seeded(&[2, 64], -1.0, 1.0, 6);
    let args = CallArgs::from_tensors([x]);
    let artifact = compiler.compile(f.as_ref(), &args, &params, false).unwrap();
    assert_eq!(artifact.graph().count_ops("fused_linear"), 1);

    let expected = eager(&f, &args);
    let got = artifact.run(&args).unwrap().into_tensor().unwrap();
    assert!(got.allclose(&expected, 1e-2, 1e-2));
}

/// Test 4: Structured arguments and return values survive compilation
#[test]
fn test_structured_call_contract() {
    let params = Arc::new(ParamStore::new());
    let f: Arc<dyn Forward> = Arc::new(|args: &CallArgs| -> Result<Value> {
        let x = args.tensor(0)?;
        let scale = args.get_kwarg("scale").and_then(Value::as_float).unwrap_or(1.0);
        let bias = args
            .get_kwarg("bias")
            .and_then(Value::as_tensor)
            .cloned()
            .unwrap_or_else(|| creation::zeros(x.shape()));
        let y = x.mul_scalar(scale)?.add(&bias)?;
        let mut out = std::collections::BTreeMap::new();
        out.insert("sample".to_string(), Value::Tensor(y.relu()?));
        out.insert("scale".to_string(), Value::Float(scale));
        Ok(Value::Tuple(vec![Value::Dict(out), Value::Tensor(y)]))
    });

    let x = Tensor::from_vec(vec![-1.0, 2.0], &[2]).unwrap();
    let bias = Tensor::from_vec(vec![0.5, 0.5], &[2]).unwrap();
    let args = CallArgs::from_tensors([x])
        .kwarg("scale", 2.0)
        .kwarg("bias", bias);

    let compiler = GraphCompiler::default();
    let artifact = compiler.compile(f.as_ref(), &args, &params, false).unwrap();
    let Value::Tuple(items) = artifact.run(&args).unwrap() else {
        panic!("expected a tuple");
    };
    let Value::Dict(out) = &items[0] else {
        panic!("expected a dict");
    };
    assert_eq!(out["sample"].as_tensor().unwrap().to_vec(), vec![0.0, 4.5]);
    assert_eq!(out["scale"].as_float(), Some(2.0));
    assert_eq!(items[1].as_tensor().unwrap().to_vec(), vec![-1.5, 4.5]);
}

// =============================================================================
// Rewrite Pipeline
// =============================================================================

/// Test 5: Running the rewrite pipeline twice changes nothing
#[test]
fn test_pipeline_idempotent() {
    let params = conv_block_params();
    let f = conv_block(&params);
    let options = RewriteOptions {
        memory_format: Some(MemoryFormat::ChannelsLast),
        prefer_lowp_gemm: true,
        fuse_group_norm_silu: true,
        memory_efficient_attention: true,
        ..RewriteOptions::default()
    };
    let pipeline = RewritePipeline::from_options(&options);

    let x = creation::uniform_seeded(&[1, 4, 5, 5], -1.0, 1.0, 31);
    let captured = capture(f.as_ref(), &CallArgs::from_tensors([x]), &params).unwrap();
    let once = pipeline.run(captured).unwrap();
    let twice = pipeline.run(once.clone()).unwrap();
    assert_eq!(once.fingerprint(), twice.fingerprint());

    let mlp_params = mlp_params(16, 41);
    let g = mlp(&mlp_params);
    let x = creation::uniform_seeded(&[3, 16], -1.0, 1.0, 42);
    let captured = capture(g.as_ref(), &CallArgs::from_tensors([x]), &mlp_params).unwrap();
    let once = pipeline.run(captured).unwrap();
    let twice = pipeline.run(once.clone()).unwrap();
    assert_eq!(once.fingerprint(), twice.fingerprint());
}

/// Test 6: Passes run in the documented order
#[test]
fn test_pipeline_order() {
    let options = RewriteOptions {
        memory_format: Some(MemoryFormat::ChannelsLast),
        prefer_lowp_gemm: true,
        fuse_group_norm_silu: true,
        memory_efficient_attention: true,
        ..RewriteOptions::default()
    };
    let names = RewritePipeline::from_options(&options).names();
    let position = |name: &str| names.iter().position(|n| *n == name).unwrap();
    assert!(position("fuse_linear") < position("convert_conv_layout"));
    assert!(position("convert_conv_layout") < position("fuse_conv"));
    assert!(position("fuse_conv") < position("prefer_lowp_gemm"));
    assert_eq!(names.last(), Some(&"eliminate_dead_ops"));
}

// =============================================================================
// Freeze
// =============================================================================

/// Test 7: A frozen artifact without preserved parameters keeps no caller tensors alive
#[test]
fn test_freeze_releases_caller_tensors() {
    let params = mlp_params(8, 51);
    let f = mlp(&params);
    let compiler = GraphCompiler::new(JitConfig::new().preserve_parameters(false));

    let x = creation::uniform_seeded(&[2, 8], -1.0, 1.0, 52);
    let args = CallArgs::from_tensors([x.clone()]);
    let old_w = params.require("w").unwrap();
    let weak_w = old_w.downgrade();
    let weak_x = x.downgrade();

    let artifact = compiler.compile(f.as_ref(), &args, &params, false).unwrap();
    let before = artifact.run(&args).unwrap().into_tensor().unwrap();
    assert!(!artifact.retains_parameters());

    params.set("w", creation::zeros(&[8, 8])).unwrap();
    drop(old_w);
    drop(args);
    drop(x);
    assert!(!weak_w.is_alive());
    assert!(!weak_x.is_alive());

    // The frozen graph still computes with the captured weight values.
    let x2 = creation::uniform_seeded(&[2, 8], -1.0, 1.0, 52);
    let after = artifact
        .run(&CallArgs::from_tensors([x2]))
        .unwrap()
        .into_tensor()
        .unwrap();
    assert!(after.allclose(&before, 1e-6, 1e-6));
}

/// Test 8: Preserved parameters follow updates in the store
#[test]
fn test_preserved_parameters_track_updates() {
    let params = mlp_params(4, 61);
    let f = mlp(&params);
    let compiler = GraphCompiler::default();
    let x = creation::uniform_seeded(&[1, 4], -1.0, 1.0, 62);
    let args = CallArgs::from_tensors([x]);
    let artifact = compiler.compile(f.as_ref(), &args, &params, false).unwrap();
    assert!(artifact.retains_parameters());

    params.set("w", creation::zeros(&[4, 4])).unwrap();
    params.set("b", creation::ones(&[4])).unwrap();
    let y = artifact.run(&args).unwrap().into_tensor().unwrap();
    assert_eq!(y.to_vec(), vec![1.0; 4]);
}

/// Test 9: Arguments that disagree with the compiled signature are rejected
#[test]
fn test_artifact_rejects_other_signatures() {
    let params = mlp_params(4, 71);
    let f = mlp(&params);
    let compiler = GraphCompiler::default();
    let x = creation::zeros(&[1, 4]);
    let artifact = compiler
        .compile(f.as_ref(), &CallArgs::from_tensors([x]), &params, false)
        .unwrap();

    let wrong_shape = CallArgs::from_tensors([creation::zeros(&[2, 4])]);
    assert!(matches!(
        artifact.run(&wrong_shape),
        Err(JitError::SignatureMismatch(_))
    ));
    let wrong_dtype =
        CallArgs::from_tensors([creation::full(&[1, 4], 0.0, DType::F16, diffjit_core::Device::Cpu)]);
    assert!(matches!(
        artifact.run(&wrong_dtype),
        Err(JitError::SignatureMismatch(_))
    ));
}
