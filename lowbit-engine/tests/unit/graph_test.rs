use super::*;
use crate::kernels::CpuFeatures;
use crate::kv_cache::KvType;
use crate::model::Weight;
use lowbit_quant::ModelHeader;

fn arena_tensor(name: &str, dims: &[usize], region: Region, offset: usize, epoch: u32) -> Tensor {
    let layout = Layout::f32(dims);
    let span = Span { region, offset, len: layout.n_elements(), epoch };
    Tensor { name: name.to_string(), layout, storage: Storage::Arena(span) }
}

fn compute(op: Op, output: Option<TensorId>) -> Step {
    Step::Compute(Node { op, output })
}

fn embed(output: TensorId) -> Step {
    compute(Op::GetRows { weight: 0, tokens: vec![1, 2] }, Some(output))
}

fn tiny_model() -> Model {
    let header = ModelHeader {
        arch: 1,
        n_vocab: 16,
        n_embd: 8,
        n_head: 2,
        n_head_kv: 1,
        n_layer: 3,
        n_rot: 4,
        n_ctx: 16,
        n_ff: 16,
        ftype: 0,
        alibi_bias_max: 8.0,
        clip_qkv: 0.0,
        norm_eps: 1e-5,
        rope_theta: 10000.0,
    };
    let values = |dims: &[usize], seed: f32| -> Vec<f32> {
        (0..dims.iter().product::<usize>()).map(|i| ((i as f32 + seed) * 0.37).sin() * 0.5).collect()
    };
    let mut weights = vec![
        Weight::f32("token_embd.weight", &[8, 16], values(&[8, 16], 0.0)),
        Weight::f32("output_norm.weight", &[8], vec![1.0; 8]),
    ];
    for i in 0..3 {
        let seed = i as f32 * 10.0;
        for (name, dims) in [
            ("attn_q.weight", [8, 8]),
            ("attn_k.weight", [8, 4]),
            ("attn_v.weight", [8, 4]),
            ("attn_output.weight", [8, 8]),
            ("ffn_gate.weight", [8, 16]),
            ("ffn_up.weight", [8, 16]),
            ("ffn_down.weight", [16, 8]),
        ] {
            weights.push(Weight::f32(&format!("blk.{i}.{name}"), &dims, values(&dims, seed + dims[1] as f32)));
        }
        weights.push(Weight::f32(&format!("blk.{i}.attn_norm.weight"), &[8], vec![1.0; 8]));
        weights.push(Weight::f32(&format!("blk.{i}.ffn_norm.weight"), &[8], vec![1.0; 8]));
    }
    let vocab = (0..16).map(|i| format!("t{i}").into_bytes()).collect();
    Model::from_parts(header, vocab, weights).unwrap()
}

#[test]
fn test_validate_rejects_forward_reference() {
    let tensors = vec![
        arena_tensor("a", &[4, 2], Region::Scratch0, 0, 0),
        arena_tensor("b", &[4, 2], Region::Scratch0, 8, 0),
    ];
    let steps = vec![compute(Op::Gelu { input: 0 }, Some(1)), embed(0)];
    let graph = Graph::new(tensors, steps, 2, 0, 1);

    let err = graph.validate(None).unwrap_err();

    assert!(matches!(err, EvalError::InvalidGraph(ref msg) if msg.contains("before it is produced")), "{err}");
}

#[test]
fn test_validate_rejects_read_after_recycle() {
    let tensors = vec![
        arena_tensor("inp", &[4, 2], Region::Scratch0, 0, 0),
        arena_tensor("out", &[4, 2], Region::Scratch0, 0, 1),
    ];
    let steps = vec![embed(0), Step::Recycle(Region::Scratch0), compute(Op::Gelu { input: 0 }, Some(1))];
    let graph = Graph::new(tensors, steps, 2, 0, 1);

    let err = graph.validate(None).unwrap_err();

    assert!(matches!(err, EvalError::Clobbered(ref name) if name == "inp"), "{err}");
}

#[test]
fn test_validate_accepts_reads_across_regions() {
    let tensors = vec![
        arena_tensor("inp", &[4, 2], Region::Scratch1, 0, 0),
        arena_tensor("out", &[4, 2], Region::Scratch0, 0, 1),
    ];
    let steps = vec![embed(0), Step::Recycle(Region::Scratch0), compute(Op::Gelu { input: 0 }, Some(1))];
    let graph = Graph::new(tensors, steps, 2, 0, 1);

    assert!(graph.validate(None).is_ok());
}

#[test]
fn test_validate_requires_contiguous_inputs() {
    let mut tensors = vec![arena_tensor("base", &[4, 2], Region::Scratch0, 0, 0)];
    // every other element of each row
    tensors.push(Tensor {
        name: "strided".to_string(),
        layout: Layout { ty: ElementType::F32, ne: [2, 2, 1, 1], nb: [8, 16, 32, 32] },
        storage: Storage::View { base: 0, offset: 0 },
    });
    tensors.push(arena_tensor("out", &[2, 2], Region::Scratch0, 8, 0));

    let gelu = Graph::new(tensors.clone(), vec![embed(0), compute(Op::Gelu { input: 1 }, Some(2))], 2, 0, 2);
    assert!(matches!(gelu.validate(None), Err(EvalError::InvalidGraph(_))));

    let cont = Graph::new(tensors, vec![embed(0), compute(Op::Cont { input: 1 }, Some(2))], 2, 0, 2);
    assert!(cont.validate(None).is_ok());
}

#[test]
fn test_validate_orders_attention_after_store() {
    let tensors = vec![
        arena_tensor("q", &[4, 1, 2], Region::Scratch0, 0, 0),
        arena_tensor("kq", &[2, 2, 1], Region::Scratch0, 8, 0),
    ];
    let scores = Op::AttnScores { q: 0, layer: 0, n_kv: 2, scale: 0.5 };
    let kv = KvCache::new(KvType::F32, 1, 8, 4);

    let early = Graph::new(tensors.clone(), vec![embed(0), compute(scores.clone(), Some(1))], 2, 0, 1);
    let err = early.validate(Some(&kv)).unwrap_err();
    assert!(matches!(err, EvalError::InvalidGraph(ref msg) if msg.contains("before storing")), "{err}");

    let store = Op::KvStore { layer: 0, k: 0, v: 0, n_past: 0 };
    let ordered = Graph::new(tensors, vec![embed(0), compute(store, None), compute(scores, Some(1))], 2, 0, 1);
    assert!(ordered.validate(Some(&kv)).is_ok());
}

#[test]
fn test_validate_requires_kv_cache_for_attention() {
    let tensors = vec![arena_tensor("k", &[4, 2], Region::Scratch0, 0, 0)];
    let steps = vec![embed(0), compute(Op::KvStore { layer: 0, k: 0, v: 0, n_past: 0 }, None)];
    let graph = Graph::new(tensors, steps, 2, 0, 0);

    assert!(matches!(graph.validate(None), Err(EvalError::MissingKvCache)));
}

#[test]
fn test_validate_rejects_context_overflow() {
    let tensors = vec![arena_tensor("k", &[4, 2], Region::Scratch0, 0, 0)];
    let steps = vec![embed(0), compute(Op::KvStore { layer: 0, k: 0, v: 0, n_past: 7 }, None)];
    let graph = Graph::new(tensors, steps, 2, 7, 0);
    let kv = KvCache::new(KvType::F32, 1, 8, 4);

    let err = graph.validate(Some(&kv)).unwrap_err();

    assert!(matches!(err, EvalError::ContextOverflow { n_past: 7, n_tokens: 2, n_ctx: 8 }), "{err}");
}

#[test]
fn test_builder_plans_layers_in_alternating_regions() {
    let model = tiny_model();
    let mut arena = Arena::new(None);
    let mut builder = GraphBuilder::new(&model, &mut arena, 0, 3);
    let output = model.adapter.build(&mut builder, &[1, 2, 3]).unwrap();
    let graph = builder.finish(output);

    let recycled: Vec<Region> =
        graph.steps().iter().filter_map(|s| if let Step::Recycle(r) = s { Some(*r) } else { None }).collect();
    assert_eq!(recycled, vec![Region::Scratch0, Region::Scratch1, Region::Scratch0]);

    let region_of = |name: &str| match graph.tensors()[graph.find(name).unwrap()].storage {
        Storage::Arena(span) => span.region,
        Storage::View { .. } => panic!("{name} is a view"),
    };
    assert_eq!(region_of("inp_embd"), Region::Scratch1);
    assert_eq!(region_of("l_out.1"), Region::Scratch1);
    assert_eq!(region_of("result_output"), Region::NoBound);
    assert_eq!(graph.tensors()[graph.output()].ne(), [16, 3, 1, 1]);

    let kv = KvCache::new(KvType::F32, 3, 16, model.kv_dim());
    assert!(graph.validate(Some(&kv)).is_ok());
}

#[test]
fn test_execute_stores_keys_without_advancing_cache() {
    let model = tiny_model();
    let registry = KernelRegistry::with_features(CpuFeatures::default());
    let scheduler = Scheduler::new(2).unwrap();
    let mut kv = KvCache::new(KvType::F32, 3, 16, model.kv_dim());
    let mut arena = Arena::new(None);

    let mut builder = GraphBuilder::new(&model, &mut arena, 0, 2);
    let output = model.adapter.build(&mut builder, &[4, 5]).unwrap();
    let graph = builder.finish(output);
    graph.validate(Some(&kv)).unwrap();
    arena.commit();

    let ctx = ExecContext { model: &model, kernels: &registry, scheduler: &scheduler, n_threads: 2 };
    graph.execute(&ctx, &mut arena, &mut kv).unwrap();

    assert_eq!(kv.n(), 0);
    let mut key = vec![0.0; model.kv_dim()];
    kv.read_key(2, 1, &mut key);
    assert!(key.iter().any(|&k| k != 0.0));

    let Storage::Arena(span) = graph.tensors()[graph.output()].storage else { unreachable!() };
    let logits = arena.slice(&span);
    assert_eq!(logits.len(), 2 * 16);
    assert!(logits.iter().all(|l| l.is_finite()));
}

#[test]
fn test_causal_mask_zeroes_future_positions() {
    let model = tiny_model();
    let registry = KernelRegistry::with_features(CpuFeatures::default());
    let scheduler = Scheduler::new(1).unwrap();
    let mut kv = KvCache::new(KvType::F32, 3, 16, model.kv_dim());
    let mut arena = Arena::new(None);

    let mut builder = GraphBuilder::new(&model, &mut arena, 0, 4);
    let output = model.adapter.build(&mut builder, &[1, 7, 3, 9]).unwrap();
    let graph = builder.finish(output);
    arena.commit();
    let ctx = ExecContext { model: &model, kernels: &registry, scheduler: &scheduler, n_threads: 1 };
    graph.execute(&ctx, &mut arena, &mut kv).unwrap();

    // the last layer's probabilities are still live
    let id = graph.find("kq_soft_max.2").unwrap();
    let Storage::Arena(span) = graph.tensors()[id].storage else { unreachable!() };
    let probs = arena.slice(&span);
    let n_kv = 4;
    for (row, p) in probs.chunks_exact(n_kv).enumerate() {
        let t = row % 4;
        assert!(p[t + 1..].iter().all(|&x| x == 0.0), "row {row}: {p:?}");
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }
}
