use ferrite_seqout::{
    Labels, LayerInputs, LossType, Mask, OutputHead, OutputLayerConfig, Result, SourceLayer, Targets, Tensor3,
    XavierInit,
};

fn main() -> Result<()> {
    // two sequences of four frames; the second one is only three frames long
    let features = Tensor3::from_nested(vec![
        vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]],
        vec![vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]],
        vec![vec![0.0, 0.0, 1.0], vec![1.0, 0.0, 0.0]],
        vec![vec![1.0, 0.0, 0.0], vec![0.0, 0.0, 0.0]],
    ])?;
    let labels = Labels::from_rows(vec![vec![0, 1], vec![1, 2], vec![2, 0], vec![0, -1]])?;
    let mask = Mask::from_lengths(4, &[4, 3]);
    let source = SourceLayer::dense("features", features);

    let config = OutputLayerConfig::new("output", 3, LossType::Ce);
    let mut init = XavierInit::default();
    let inputs = || LayerInputs::new(vec![source.clone()], mask.clone(), Targets::Labels(labels.clone()));

    let first = OutputHead::build(&config, inputs(), &mut init)?;
    let mut bias = first.base().pre.bias.clone();
    let mut weights = first.base().pre.weights.clone();

    let lr = 0.5;
    let epochs = 200;

    for epoch in 0..epochs {
        let head = OutputHead::build(&config, inputs().with_params(bias.clone(), weights.clone()), &mut init)?;
        let cost = head.cost()?;
        let grads = head.gradient(&cost)?;
        let step = head.base().backward(&grads[0])?;

        for (b, g) in bias.iter_mut().zip(step.bias.iter()) {
            *b -= lr * g;
        }
        for (w, g) in weights.iter_mut().zip(step.weights.iter()) {
            w.add_scaled(g, -lr);
        }

        if epoch % 50 == 0 {
            println!("Epoch {epoch}: cost = {:.6}, errors = {}", cost.value, head.errors()?);
        }
    }

    let head = OutputHead::build(&config, inputs().with_params(bias, weights), &mut init)?;
    println!("Predictions at valid frames: {:?}", head.y_pred());
    println!("Entropy: {:.4}", head.entropy());
    Ok(())
}
