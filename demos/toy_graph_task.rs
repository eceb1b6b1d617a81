//! Toy graph-building task.
//!
//! Stories have two sentences: "A ." introduces an entity, then "B near A ."
//! introduces a second one with a `near` edge pointing back at the first.
//! The query "where B" is answered with A.
//!
//! Run with `RUST_LOG=debug` to see the assembled pipeline.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use ggtnn::{Batch, GraphTargets, Model, ModelConfig, Trainer};

const PAD: u32 = 0;
const NEAR: u32 = 4;
const WHERE: u32 = 5;
const NAMES: [&str; 3] = ["alice", "bob", "carol"];

/// Word id of entity `e` (entities are words 1..=3 and nodes 0..=2).
fn word(e: usize) -> u32 {
    e as u32 + 1
}

fn build_batch(config: &ModelConfig, dev: &Device) -> Batch {
    let pairs: Vec<(usize, usize)> = (0..3).flat_map(|a| (0..3).filter(move |&b| b != a).map(move |b| (a, b))).collect();
    let n = pairs.len();
    let s = 2;
    let pad = config.pad_graph_size(s);
    let ids = config.num_node_ids;

    let mut input = Vec::new();
    let mut query = Vec::new();
    let mut answer = vec![0f32; n * 3];
    let mut new_ids = vec![0f32; n * s * ids];
    let mut edges = vec![0f32; n * s * pad * pad];
    for (i, &(a, b)) in pairs.iter().enumerate() {
        input.extend([word(a), PAD, PAD, word(b), NEAR, word(a)]);
        query.extend([WHERE, word(b)]);
        answer[i * 3 + a] = 1.0;
        new_ids[(i * s) * ids + a] = 1.0;
        new_ids[(i * s + 1) * ids + b] = 1.0;
        // after sentence 2: node 1 (b) -> node 0 (a)
        edges[((i * s + 1) * pad + 1) * pad] = 1.0;
    }

    let graph = GraphTargets {
        num_new_nodes: Tensor::ones((n, s), DType::U32, dev).unwrap(),
        new_node_strengths: Tensor::ones((n, s, 1), DType::F32, dev).unwrap(),
        new_node_ids: Tensor::from_vec(new_ids, (n, s, 1, ids), dev).unwrap(),
        edges: Tensor::from_vec(edges, (n, s, pad, pad, 1), dev).unwrap(),
    };
    Batch::new(
        Tensor::from_vec(input, (n, s, 3), dev).unwrap(),
        Tensor::from_vec(query, (n, 2), dev).unwrap(),
    )
    .with_output(Tensor::from_vec(answer, (n, 1, 3), dev).unwrap())
    .with_graph(graph)
}

fn main() {
    env_logger::init();
    let dev = Device::Cpu;
    let config = ModelConfig::default()
        .with_vocab(6, 3)
        .with_graph_spec(3, 12, 1)
        .with_repr_size(16)
        .with_new_nodes_per_iter(1)
        .with_word_node_mapping(BTreeMap::from([(word(0), 0), (word(1), 1), (word(2), 2)]))
        .with_learning_rate(0.01);
    let batch = build_batch(&config, &dev);

    let model = Model::new(config, &dev).unwrap();
    let mut trainer = Trainer::adam(model).unwrap();
    for step in 0..300 {
        let (loss, info) = trainer.train(&batch).unwrap();
        if step % 50 == 0 {
            println!("step {step:>3}: loss={loss:.4} {info:?}");
        }
        if step == 200 {
            trainer.set_learning_rate(0.003);
        }
    }

    let eval = trainer.eval(&batch, true).unwrap();
    println!("eval loss={:.4} accuracy={:?}", eval.loss, eval.accuracy);

    let model = trainer.into_model();
    let inference = model.infer(&batch.input_words, &batch.query_words, 1, true).unwrap();
    let answers = inference.output.unwrap().squeeze(1).unwrap().argmax(1).unwrap().to_vec1::<u32>().unwrap();
    let queried = batch.query_words.narrow(1, 1, 1).unwrap().squeeze(1).unwrap().to_vec1::<u32>().unwrap();
    for (q, a) in queried.iter().zip(&answers) {
        println!("where is {}? near {}", NAMES[*q as usize - 1], NAMES[*a as usize]);
    }
    let last = inference.timeline.steps.last().unwrap();
    println!("final graph strengths: {:?}", last.node_strengths().to_vec2::<f32>().unwrap());
}
