use ferrite_seqout::output::AlignmentCost;
use ferrite_seqout::{
    Labels, LayerInputs, LossType, Mask, OutputHead, OutputLayerConfig, Result, SourceLayer, Targets, Tensor3,
    XavierInit,
};

/// Aligns every frame to the class with the same index as its time step,
/// the way a forced aligner with a fixed path would.
struct DiagonalAlignment;

impl AlignmentCost for DiagonalAlignment {
    fn cost(&self, _target: &str, probs: &Tensor3, lengths: &[usize]) -> Result<(Vec<f64>, Tensor3)> {
        let mut grad = Tensor3::zeros(probs.time, probs.batch, probs.classes);
        let mut errors = vec![0.0; probs.batch];
        for (b, &len) in lengths.iter().enumerate() {
            for t in 0..len.min(probs.time) {
                let y = t % probs.classes;
                errors[b] -= probs.cell(t, b)[y].max(1e-38).ln();
                let cell = grad.cell_mut(t, b);
                cell.copy_from_slice(probs.cell(t, b));
                cell[y] -= 1.0;
            }
        }
        Ok((errors, grad))
    }
}

fn main() -> Result<()> {
    let features = Tensor3::from_nested(vec![
        vec![vec![0.9, 0.1]],
        vec![vec![0.8, 0.3]],
        vec![vec![0.2, 0.7]],
        vec![vec![0.1, 0.9]],
    ])?;
    // classes {a, b, blank}; frame labels a a b b, transcript a b
    let frames = Labels::from_rows(vec![vec![0], vec![0], vec![1], vec![1]])?;
    let transcript = Labels::from_rows(vec![vec![0], vec![1], vec![-1], vec![-1]])?;
    let mask = Mask::ones(4, 1);
    let source = SourceLayer::dense("encoder", features);
    let mut init = XavierInit::default();

    for loss in [LossType::Ctc, LossType::CeCtc, LossType::Ctc2, LossType::Sprint] {
        let config = OutputLayerConfig::new("output", 3, loss);
        let labels = if loss == LossType::Ctc { transcript.clone() } else { frames.clone() };
        let inputs = LayerInputs::new(vec![source.clone()], mask.clone(), Targets::Labels(labels))
            .with_alignment(Box::new(DiagonalAlignment));
        let head = OutputHead::build(&config, inputs, &mut init)?;
        let cost = head.cost()?;
        let overridden = cost.known_grads.as_ref().map_or(0, |k| k.len());
        let grad = head.gradient(&cost)?;
        println!(
            "{loss}: cost = {:.4}, overrides = {overridden}, |grad| = {:.4}, errors = {}",
            cost.value,
            grad[0].data.iter().map(|g| g * g).sum::<f64>().sqrt(),
            head.errors()?
        );
        if let Some(priors) = &cost.priors {
            println!("  summed posteriors: {priors:.3?}");
        }
    }
    Ok(())
}
