use serde::{Serialize, Deserialize};

use crate::error::Result;
use crate::loss::loss_type::LossType;

/// Which output strategy a layer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerClass {
    /// Framewise losses: ce, entropy, sse, priori.
    #[default]
    Softmax,
    /// Mean cross-entropy over the decoder streams of the sources.
    Decoder,
    /// Sequence losses: ctc, ce_ctc, ctc2, sprint, sprint_smoothed.
    Sequence,
}

/// A fully serializable description of one output layer.
///
/// Every field except `name`, `n_out` and `loss` has a default, so minimal
/// JSON like `{"name": "output", "n_out": 10, "loss": "ce"}` loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputLayerConfig {
    /// Layer name; also used to name the created weights.
    pub name: String,
    #[serde(default)]
    pub layer_class: LayerClass,
    /// Number of output classes.
    pub n_out: usize,
    pub loss: LossType,
    /// Drop every time step at or beyond this index; 0 keeps everything.
    #[serde(default)]
    pub time_limit: usize,
    /// Symmetric clip applied to the gradient flowing through z.
    #[serde(default)]
    pub grad_clip_z: Option<f64>,
    /// Gradient at z is discarded where |z| exceeds this bound.
    #[serde(default)]
    pub grad_discard_out_of_bound_z: Option<f64>,
    /// Name of a layer whose output is taken verbatim as z.
    #[serde(default)]
    pub copy_input: Option<String>,
    /// Scale applied together with per-source masks.
    #[serde(default = "default_mass")]
    pub mass: f64,
    /// Number of parallel output copies collapsed by the consensus combiner.
    #[serde(default = "default_depth")]
    pub depth: usize,
    /// Target identifier handed to the forced-alignment procedure.
    #[serde(default = "default_target")]
    pub target: String,
    /// Weight of `log_prior` in the smoothing cross-entropy (sprint_smoothed).
    #[serde(default)]
    pub prior_scale: f64,
    /// Per-class log prior (sprint_smoothed).
    #[serde(default)]
    pub log_prior: Option<Vec<f64>>,
    /// Smoothing weight of the cross-entropy term (sprint_smoothed).
    #[serde(default)]
    pub ce_smoothing: f64,
}

fn default_mass() -> f64 {
    1.0
}

fn default_depth() -> usize {
    1
}

fn default_target() -> String {
    "classes".to_string()
}

impl OutputLayerConfig {
    /// A config with every optional field at its default.
    pub fn new(name: impl Into<String>, n_out: usize, loss: LossType) -> Self {
        let layer_class = match loss {
            LossType::Decode => LayerClass::Decoder,
            l if l.is_sequence_level() => LayerClass::Sequence,
            _ => LayerClass::Softmax,
        };
        OutputLayerConfig {
            name: name.into(),
            layer_class,
            n_out,
            loss,
            time_limit: 0,
            grad_clip_z: None,
            grad_discard_out_of_bound_z: None,
            copy_input: None,
            mass: default_mass(),
            depth: default_depth(),
            target: default_target(),
            prior_scale: 0.0,
            log_prior: None,
            ce_smoothing: 0.0,
        }
    }

    /// Serializes the config to a pretty-printed JSON file.
    pub fn save_json(&self, path: &str) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Deserializes an `OutputLayerConfig` from a JSON file.
    pub fn load_json(path: &str) -> Result<OutputLayerConfig> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_fills_defaults() {
        let cfg: OutputLayerConfig =
            serde_json::from_str(r#"{"name": "output", "n_out": 5, "loss": "ce"}"#).unwrap();
        assert_eq!(cfg, OutputLayerConfig::new("output", 5, LossType::Ce));
        assert_eq!(cfg.mass, 1.0);
        assert_eq!(cfg.target, "classes");
    }

    #[test]
    fn unknown_loss_fails_to_load() {
        let res = serde_json::from_str::<OutputLayerConfig>(r#"{"name": "o", "n_out": 2, "loss": "hinge"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn loss_picks_a_layer_class() {
        assert_eq!(OutputLayerConfig::new("o", 3, LossType::Ctc).layer_class, LayerClass::Sequence);
        assert_eq!(OutputLayerConfig::new("o", 3, LossType::Decode).layer_class, LayerClass::Decoder);
        assert_eq!(OutputLayerConfig::new("o", 3, LossType::Sse).layer_class, LayerClass::Softmax);
    }

    #[test]
    fn save_and_load_round_trip() {
        let mut cfg = OutputLayerConfig::new("out", 4, LossType::SprintSmoothed);
        cfg.ce_smoothing = 0.3;
        cfg.log_prior = Some(vec![-1.0; 4]);
        let path = std::env::temp_dir().join("ferrite_seqout_layer_config.json");
        let path = path.to_string_lossy().to_string();
        cfg.save_json(&path).unwrap();
        assert_eq!(OutputLayerConfig::load_json(&path).unwrap(), cfg);
        let _ = std::fs::remove_file(&path);
    }
}
