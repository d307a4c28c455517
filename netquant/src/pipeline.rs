//! End-to-end quantization of an ncnn model: load, plan, quantize weights, write.
use std::path::Path;

use anyhow::Context;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    calibration::CalibrationTable,
    error::QuantizeError,
    graph::{keys, loader::load_model, Graph, OpKind, Storage, Weight},
    layers::Options,
    propagation::ScalePlan,
    quantization::WeightQuantizer,
    serializer::{save, SaveOptions, SaveSummary},
    tensor::Tensor,
};

/// Softmax parameter telling the runtime to apply its axis fix.
const SOFTMAX_FIXBUG: u32 = 1;

#[derive(Debug, Clone, Default)]
pub struct QuantizeOptions {
    pub kernels: Options,
    pub save: SaveOptions,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuantizeReport {
    /// Weighted operators converted to int8.
    pub quantized: usize,
    pub split_factors: usize,
    pub layers: usize,
    pub blobs: usize,
    pub bin_bytes: usize,
    #[serde(skip)]
    pub plan: ScalePlan,
}

/// Derive the scale plan of `graph` and apply it in place.
pub fn quantize_graph(
    graph: &mut Graph,
    table: &CalibrationTable,
    quantizer: &WeightQuantizer,
) -> Result<(ScalePlan, usize), QuantizeError> {
    for name in table.activation_names() {
        if graph.find_op(name).is_none() && graph.find_blob(name).is_none() {
            warn!(entry = %name, "calibration entry matches no operator");
        }
    }
    let plan = ScalePlan::build(graph, table)?;
    let quantized = apply_plan(graph, &plan, quantizer)?;
    Ok((plan, quantized))
}

fn raw_i32(values: Vec<i32>) -> Result<Weight, QuantizeError> {
    Ok(Weight::new(Tensor::from_vec_1d(values)?, Storage::RawI32))
}

/// Set the int8 markers of every operator and attach the scale blocks the runtime reads
/// after the regular weights. Returns the number of weighted operators quantized.
pub fn apply_plan(
    graph: &mut Graph,
    plan: &ScalePlan,
    quantizer: &WeightQuantizer,
) -> Result<usize, QuantizeError> {
    let mut quantized = 0;
    for id in 0..graph.ops().len() {
        let op = graph.op_mut(id);
        if op.kind.int8_capable() {
            op.params.set(keys::INT8, 1);
        }
        match op.kind {
            OpKind::Input => {
                if let Some(result) = plan.op(id).and_then(|p| p.result_fixed.as_ref()) {
                    let ints = result.to_ints();
                    op.params.set(keys::OUTPUT_SCALE_COUNT, ints.len() as i32);
                    op.weights.push(raw_i32(ints)?);
                }
            }
            OpKind::Split => {
                if let Some(factor) = plan.split_factor(id) {
                    op.params.set(keys::FACTOR, 1);
                    op.weights.push(raw_i32(factor.to_ints().to_vec())?);
                }
            }
            OpKind::Clip => {
                if let Some(scales) = plan.clip_scales(id) {
                    op.params.set(keys::FACTOR, scales.to_vec());
                }
            }
            OpKind::Softmax => {
                if op.params.get_int(0, 0) != 0 {
                    op.params.set(SOFTMAX_FIXBUG, 1);
                }
            }
            kind if kind.has_quantizable_weights() => {
                let Some(p) = plan.op(id).filter(|p| p.is_quantized()) else {
                    continue;
                };
                let (Some(input), Some(result)) = (p.input, p.result_fixed.as_ref()) else {
                    continue;
                };
                let term = quantizer.quantize(op, p.weight_scales.len(), &p.weight_scales, input)?;
                let outputs = p.output_fixed.to_ints();
                op.params.set(keys::OUTPUT_SCALE_COUNT, outputs.len() as i32);
                op.weights.push(raw_i32(result.to_ints())?);
                op.weights.push(raw_i32(outputs)?);
                info!(
                    op = %op.name,
                    kind = %op.kind,
                    ?term,
                    input,
                    output = ?p.output.values(),
                    "quantized"
                );
                quantized += 1;
            }
            _ => {}
        }
    }
    Ok(quantized)
}

/// Quantize the model at `param`/`bin` with the calibration table at `table` and write
/// the result to `out_param`/`out_bin`.
pub fn quantize_model(
    param: impl AsRef<Path>,
    bin: impl AsRef<Path>,
    table: impl AsRef<Path>,
    out_param: impl AsRef<Path>,
    out_bin: impl AsRef<Path>,
    opts: &QuantizeOptions,
) -> anyhow::Result<QuantizeReport> {
    let (param, bin) = (param.as_ref(), bin.as_ref());
    let mut graph = load_model(param, bin)?;
    info!(
        param = %param.display(),
        layers = graph.ops().len(),
        blobs = graph.blobs().len(),
        "loaded model"
    );
    let table = CalibrationTable::from_path(table)?;
    info!(entries = table.len(), "loaded calibration table");

    let quantizer = WeightQuantizer::new(opts.kernels.clone());
    let (plan, quantized) = quantize_graph(&mut graph, &table, &quantizer)
        .with_context(|| format!("quantizing {}", param.display()))?;
    let SaveSummary {
        layers,
        blobs,
        bin_bytes,
    } = save(&graph, out_param, out_bin, &opts.save)?;
    Ok(QuantizeReport {
        quantized,
        split_factors: plan.splits.len(),
        layers,
        blobs,
        bin_bytes,
        plan,
    })
}

#[cfg(test)]
mod test {
    use std::{fs, path::PathBuf};

    use tempfile::TempDir;

    use super::*;
    use crate::{
        graph::{OpId, Operator},
        layers::Layer,
        overrides::OverrideTable,
        quantization::FixedPoint,
        tensor::ElemType,
        testing::{graph, param_text, synthetic_bin, RESIDUAL, RESIDUAL_SCALES},
    };

    struct Fixture {
        _dir: TempDir,
        param: PathBuf,
        bin: PathBuf,
        table: PathBuf,
        out_param: PathBuf,
        out_bin: PathBuf,
    }

    fn fixture(layers: &str, scales: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let f = Fixture {
            _dir: dir,
            param: root.join("in.param"),
            bin: root.join("in.bin"),
            table: root.join("calib.table"),
            out_param: root.join("out.param"),
            out_bin: root.join("out.bin"),
        };
        fs::write(&f.param, param_text(layers)).unwrap();
        fs::write(&f.bin, synthetic_bin(&graph(layers))).unwrap();
        fs::write(&f.table, scales).unwrap();
        f
    }

    fn run(f: &Fixture) -> (QuantizeReport, Graph) {
        let report = quantize_model(
            &f.param,
            &f.bin,
            &f.table,
            &f.out_param,
            &f.out_bin,
            &QuantizeOptions::default(),
        )
        .unwrap();
        (report, load_model(&f.out_param, &f.out_bin).unwrap())
    }

    fn op<'a>(g: &'a Graph, name: &str) -> &'a Operator {
        g.op(g.find_op(name).unwrap())
    }

    fn ints(op: &Operator, i: usize) -> Vec<i32> {
        op.weights[i].data.to_packed::<i32>().unwrap()
    }

    fn encoded(scales: &[f32]) -> Vec<i32> {
        FixedPoint::encode(scales).unwrap().to_ints()
    }

    const SHARED: &str = "Input            data     0 1 data 0=4 1=4 2=1
Convolution      conv0    1 1 data c0 0=2 1=1 5=1 6=2
Split            split    1 2 c0 s0 s1
Convolution      conv1    1 1 s0 o1 0=2 1=1 5=1 6=4
Convolution      conv2    1 1 s1 o2 0=2 1=1 6=4";

    const SHARED_SCALES: &str = "data 10.0
conv0 10.0
conv0_param_0 100.0 100.0
conv1 4.0
conv1_param_0 50.0 50.0
conv2 4.0
conv2_param_0 50.0 50.0
";

    #[test]
    fn split_into_convolutions_shares_one_output_scale() {
        let f = fixture(SHARED, SHARED_SCALES);
        let (report, g) = run(&f);
        assert_eq!(report.quantized, 3);
        assert_eq!(report.split_factors, 0);
        assert_eq!(report.layers, 5);

        let conv0 = op(&g, "conv0");
        assert_eq!(conv0.params.get_int(keys::INT8, 0), 2);
        assert_eq!(conv0.params.get_int(keys::OUTPUT_SCALE_COUNT, 0), 2);
        assert_eq!(conv0.weights.len(), 4);
        assert_eq!(conv0.weights[0].data.elem_type(), Some(ElemType::I8));
        assert_eq!(conv0.weights[1].data.elem_type(), Some(ElemType::I32));
        // one shared scale, the input scale of both branches
        assert_eq!(ints(conv0, 3), encoded(&[4.0]));
        assert_eq!(ints(conv0, 2), encoded(&[4.0 / 1000.0, 4.0 / 1000.0]));

        // no bias: weight-only quantization
        let conv2 = op(&g, "conv2");
        assert_eq!(conv2.params.get_int(keys::INT8, 0), 1);
        assert_eq!(conv2.weights.len(), 3);

        let data = op(&g, "data");
        assert_eq!(data.params.get_int(keys::INT8, 0), 1);
        assert_eq!(ints(data, 0), encoded(&[10.0]));
        let split = op(&g, "split");
        assert_eq!(split.params.get_int(keys::FACTOR, 0), 0);
        assert!(split.weights.is_empty());
    }

    #[test]
    fn residual_branches_get_two_scales_and_a_split_factor() {
        let f = fixture(RESIDUAL, RESIDUAL_SCALES);
        let (report, g) = run(&f);
        assert_eq!(report.split_factors, 1);

        let conv0 = op(&g, "conv0");
        assert_eq!(conv0.params.get_int(keys::OUTPUT_SCALE_COUNT, 0), 3);
        assert_eq!(ints(conv0, 3), encoded(&[2.0, 3.0]));
        // both channels use max(2, 3)
        assert_eq!(ints(conv0, 2), encoded(&[3.0 / 1000.0, 3.0 / 500.0]));

        let split = op(&g, "split");
        assert_eq!(split.params.get_int(keys::FACTOR, 0), 1);
        assert_eq!(ints(split, 0), vec![0, 171, -8]);
        assert_eq!(op(&g, "add").params.get_int(keys::INT8, 0), 1);
        assert_eq!(op(&g, "prob").params.get_int(1, 0), 1);
    }

    #[test]
    fn reloaded_operators_run_their_int8_paths() {
        let f = fixture(RESIDUAL, RESIDUAL_SCALES);
        let (_, g) = run(&f);
        let id: OpId = g.find_op("split").unwrap();
        let layer = Layer::from_operator(&g, id, &OverrideTable::default())
            .unwrap()
            .unwrap();
        let Layer::Split(split) = &layer else {
            panic!("expected a Split, got {layer}");
        };
        assert!(split.use_int8_inference);
        let input = Tensor::from_vec_1d(vec![30i8, -60, 127]).unwrap();
        let tops = layer.forward(&[input.clone()], &Options::default()).unwrap();
        // 2/3 as 171 * 2^-8, shifted with floor semantics
        assert_eq!(tops[0].data::<i8>().unwrap(), &[20, -41, 84]);
        assert_eq!(tops[1], input);
    }

    #[test]
    fn clips_receive_their_input_scale() {
        let layers = "Input            data     0 1 data 0=4 1=4 2=1
Convolution      conv0    1 1 data c0 0=1 1=1 6=1
Clip             relu6    1 1 c0 r 0=0.0 1=6.0
Convolution      conv1    1 1 r o 0=1 1=1 6=1";
        let f = fixture(layers, "conv0 10.0\nconv0_param_0 1.0\nconv1 21.0\nconv1_param_0 1.0\n");
        let (_, g) = run(&f);
        let clip = op(&g, "relu6");
        assert_eq!(clip.params.get_ints(keys::FACTOR), Some(vec![168, -3]));
        let Some(Layer::Clip(clip)) =
            Layer::from_operator(&g, g.find_op("relu6").unwrap(), &OverrideTable::default())
                .unwrap()
        else {
            panic!("expected a Clip");
        };
        // 6 * 168 >> 3 saturates
        assert_eq!(clip.int8_bounds().unwrap(), (0, 126));
    }

    #[test]
    fn missing_weight_scales_abort_the_run() {
        let f = fixture(SHARED, "conv0 10.0\nconv1 4.0\nconv2 4.0\n");
        let err = quantize_model(
            &f.param,
            &f.bin,
            &f.table,
            &f.out_param,
            &f.out_bin,
            &QuantizeOptions::default(),
        )
        .unwrap_err();
        assert_eq!(crate::error::exit_code(&err), -1);
        assert!(err.chain().any(|e| matches!(
            e.downcast_ref::<QuantizeError>(),
            Some(QuantizeError::MissingCalibrationEntry { .. })
        )));
        assert!(!f.out_param.exists());
    }
}
