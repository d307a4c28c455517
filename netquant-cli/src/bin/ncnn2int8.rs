use std::{fs, path::PathBuf, process::ExitCode};

use anyhow::Context as _;
use clap::{error::ErrorKind, Parser};
use netquant::{error::exit_code, quantize_model, Options, QuantizeOptions, SaveOptions, StorageType};
use tracing::info;
use utils::{human_bytes, setup_logging};

/// Quantize a float ncnn model to int8 using a calibration table.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// The float model graph (.param).
    in_param: PathBuf,

    /// The float model weights (.bin).
    in_bin: PathBuf,

    /// Where to write the quantized graph.
    out_param: PathBuf,

    /// Where to write the quantized weights.
    out_bin: PathBuf,

    /// The calibration table, one `<name> <scale>...` entry per line.
    calibration_table: PathBuf,

    /// Worker threads for the per-channel kernels (0 uses all cores).
    #[arg(long, env = "NETQUANT_THREADS", default_value = "0")]
    threads: usize,

    /// Store the float weights left unquantized as fp16.
    #[arg(long)]
    fp16: bool,

    /// Write the derived scales as JSON to this path.
    #[arg(long)]
    dump_scales: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

fn run(args: Args) -> anyhow::Result<()> {
    let opts = QuantizeOptions {
        kernels: Options::default()
            .with_threads(args.threads)
            .context("configuring the kernel thread pool")?,
        save: SaveOptions {
            storage: if args.fp16 {
                StorageType::Fp16
            } else {
                StorageType::Fp32
            },
        },
    };
    info!(threads = opts.kernels.threads(), storage = ?opts.save.storage, "starting");
    let report = quantize_model(
        &args.in_param,
        &args.in_bin,
        &args.calibration_table,
        &args.out_param,
        &args.out_bin,
        &opts,
    )?;
    if let Some(path) = &args.dump_scales {
        let json = report.plan.to_json().context("serializing the scale plan")?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "scale plan written");
    }
    info!(
        quantized = report.quantized,
        split_factors = report.split_factors,
        layers = report.layers,
        blobs = report.blobs,
        weights = %human_bytes(report.bin_bytes as u64),
        "quantization done"
    );
    Ok(())
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(exit_status(-1)),
            };
        }
    };
    if let Err(e) = setup_logging(args.json_logs) {
        eprintln!("{e}");
        return ExitCode::from(exit_status(-1));
    }
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_status(exit_code(&e)))
        }
    }
}

/// The low byte of a negative status, as the shell reports it.
fn exit_status(code: i32) -> u8 {
    code as u8
}

#[cfg(test)]
mod test {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn arguments_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn five_positionals_are_required() {
        assert!(Args::try_parse_from(["ncnn2int8", "a", "b", "c", "d"]).is_err());
        assert!(Args::try_parse_from(["ncnn2int8", "a", "b", "c", "d", "e", "f"]).is_err());
        let args = Args::try_parse_from(["ncnn2int8", "a", "b", "c", "d", "e", "--fp16"]).unwrap();
        assert!(args.fp16);
        assert_eq!(args.calibration_table, PathBuf::from("e"));
    }

    #[test]
    fn negative_codes_wrap_like_the_shell() {
        assert_eq!(exit_status(-1), 255);
        assert_eq!(exit_status(-100), 156);
    }

    #[test]
    fn missing_inputs_fail() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let args = Args::try_parse_from([
            "ncnn2int8".into(),
            missing.clone().into_os_string(),
            missing.clone().into_os_string(),
            dir.path().join("out.param").into_os_string(),
            dir.path().join("out.bin").into_os_string(),
            missing.into_os_string(),
        ])
        .unwrap();
        let err = run(args).unwrap_err();
        assert_eq!(exit_code(&err), -1);
    }
}
