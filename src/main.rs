// The binary only lists what the library offers.
// Run the demos with:
//   cargo run --example framewise
//   cargo run --example sequence
use ferrite_seqout::LossType;

fn main() {
    println!("ferrite-seqout: masked, time-major output layers for sequence labelling.");
    let ids: Vec<&str> = LossType::ALL.iter().map(|l| l.as_str()).collect();
    println!("Loss identifiers: {}", ids.join(", "));
    println!("Run `cargo run --example framewise` or `cargo run --example sequence`.");
}
