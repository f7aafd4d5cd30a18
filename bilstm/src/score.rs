use burn::tensor::{activation::log_softmax, backend::Backend, Data, Int, Shape, Tensor};

use crate::error::{Error, Result};

/// A single item has neither a next nor a previous neighbour to score.
pub const MIN_SEQUENCE_LEN: usize = 2;

/// Bidirectional next-item loss of one outfit.
///
/// `features` holds one embedding per item `[n, d]` and `hiddens` the matching
/// bidirectional states `[n, 2d]`, forward half first. The forward state of
/// item `i` is scored against the embedding of item `i + 1`, the last one
/// against an all-zero end row. The backward state of item `i` is scored
/// against item `i - 1`, the first one against a zero start row. Candidates
/// are the items of the outfit itself plus that zero row.
///
/// Returns `-mean(fw) - mean(bw)` as a one-element tensor.
pub fn compatibility_loss<B: Backend>(features: Tensor<B, 2>, hiddens: Tensor<B, 2>) -> Result<Tensor<B, 1>> {
    let [n, d] = features.dims();
    let [hidden_rows, width] = hiddens.dims();

    if n < MIN_SEQUENCE_LEN {
        return Err(Error::TooFewImages { retained: n, required: MIN_SEQUENCE_LEN });
    }
    if hidden_rows != n || width != 2 * d {
        return Err(Error::ShapeMismatch(format!(
            "hidden states {:?} do not pair with features {:?}",
            [hidden_rows, width],
            [n, d]
        )));
    }

    let device = features.device();
    let fw_hiddens = hiddens.clone().slice([0..n, 0..d]);
    let bw_hiddens = hiddens.slice([0..n, d..width]);

    let x_fw = Tensor::<B, 2>::zeros([n + 1, d], &device).slice_assign([0..n, 0..d], features.clone());
    let x_bw = Tensor::<B, 2>::zeros([n + 1, d], &device).slice_assign([1..n + 1, 0..d], features);

    // [n, n + 1]
    let fw_logprob = log_softmax(fw_hiddens.matmul(x_fw.transpose()), 1);
    let bw_logprob = log_softmax(bw_hiddens.matmul(x_bw.transpose()), 1);

    let fw_loss = diagonal(fw_logprob, 1).mean().neg();
    let bw_loss = diagonal(bw_logprob, 0).mean().neg();

    Ok(fw_loss + bw_loss)
}

/// Row `i` of the result is `x[i, i + offset]`.
fn diagonal<B: Backend>(x: Tensor<B, 2>, offset: usize) -> Tensor<B, 2> {
    let [rows, _] = x.dims();
    let indices: Vec<i64> = (0..rows).map(|i| (i + offset) as i64).collect();
    let indices = Tensor::<B, 2, Int>::from_data(
        Data::new(indices, Shape::new([rows, 1])).convert(),
        &x.device(),
    );
    x.gather(1, indices)
}
