//! Node matching under slot permutations.
//!
//! Three proposal slots are scored against a ground truth with two real nodes
//! listed in a different order. The best-ordering loss and the
//! repetition-corrected log-sum-exp loss are printed side by side.

use candle_core::{Device, Tensor};
use ggtnn::matching::{node_matching_loss, permutations};

fn main() {
    let dev = Device::Cpu;

    // proposals: slot 0 looks like id 2, slot 1 is empty, slot 2 looks like id 0
    let strengths = Tensor::new(&[[0.9f32, 0.1, 0.8]], &dev).unwrap();
    let ids = Tensor::new(&[[[0.1f32, 0.1, 0.8], [0.3, 0.4, 0.3], [0.7, 0.2, 0.1]]], &dev).unwrap();

    // ground truth: id 0, id 2, then an empty slot
    let truth_strengths = Tensor::new(&[[1.0f32, 1.0, 0.0]], &dev).unwrap();
    let truth_ids = Tensor::new(&[[[1.0f32, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0, 0.0]]], &dev).unwrap();

    let best = node_matching_loss(&strengths, &ids, &truth_strengths, &truth_ids, &[2], true).unwrap();
    let summed = node_matching_loss(&strengths, &ids, &truth_strengths, &truth_ids, &[2], false).unwrap();

    let lls = best.perm_ll.squeeze(0).unwrap().to_vec1::<f32>().unwrap();
    for (perm, ll) in permutations(3).iter().zip(&lls) {
        println!("truth slots {perm:?} -> log-likelihood {ll:.4}");
    }
    println!("best-ordering loss:      {:.4}", best.loss.to_vec1::<f32>().unwrap()[0]);
    println!("all-orderings loss:      {:.4}", summed.loss.to_vec1::<f32>().unwrap()[0]);
}
