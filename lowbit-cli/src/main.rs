use std::path::Path;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{error, info};
use lowbit_engine::{InferenceConfigBuilder, run_inference};
use lowbit_quant::{
    ComputeType, DEFAULT_INCLUDE, QuantAlgorithm, QuantConfig, ScaleDtype, TensorFilter, quantize_model,
};

/// Define the quantize subcommand.
fn quantize_subcommand() -> Command {
    Command::new("quantize")
        .about("Quantize the weights of a model file")
        .arg(Arg::new("INPUT").help("Source model file (f32/f16 weights)").required(true).index(1))
        .arg(Arg::new("OUTPUT").help("Destination model file").required(true).index(2))
        .arg(
            Arg::new("bits")
                .short('b')
                .long("bits")
                .value_name("INT")
                .help("Bits per weight: 4, 5 or 8 [default: 4]")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(Arg::new("alg").long("alg").value_name("STRING").help("Algorithm: sym|asym [default: sym]"))
        .arg(
            Arg::new("block-size")
                .long("block-size")
                .value_name("INT")
                .help("Values per quantization block [default: 32]")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(Arg::new("scale-dtype").long("scale-dtype").value_name("STRING").help("Scale dtype: fp16|fp32|bf16 [default: fp16]"))
        .arg(
            Arg::new("compute-type")
                .long("compute-type")
                .value_name("STRING")
                .help("Compute type: native|int8|fp32|bf16 [default: native]"),
        )
        .arg(
            Arg::new("nthread")
                .short('t')
                .long("nthread")
                .value_name("INT")
                .help("Quantization threads [default: all cores]")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("include")
                .long("include")
                .value_name("REGEX")
                .help("Quantize tensors whose whole name matches [default: .*weight]")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("exclude")
                .long("exclude")
                .value_name("REGEX")
                .help("Copy tensors whose whole name matches unchanged")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON quantization config; flags override its values"),
        )
}

/// Define the generate subcommand.
fn generate_subcommand() -> Command {
    Command::new("generate")
        .about("Generate text with a quantized model")
        .arg(Arg::new("MODEL").help("Model file").required(true).index(1))
        .arg(Arg::new("prompt").short('p').long("prompt").value_name("STRING").help("Input prompt").required(true))
        .arg(
            Arg::new("n-predict")
                .short('n')
                .long("n-predict")
                .value_name("INT")
                .help("Number of tokens to generate [default: 128]")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("temperature")
                .long("temperature")
                .value_name("FLOAT")
                .help("Temperature for sampling in [0, inf], 0 is greedy [default: 0.8]")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("top-k")
                .long("top-k")
                .value_name("INT")
                .help("Top-k candidates, 0 keeps all [default: 40]")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("top-p")
                .long("top-p")
                .value_name("FLOAT")
                .help("Top-p for nucleus sampling in [0,1] [default: 0.95]")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("repeat-penalty")
                .long("repeat-penalty")
                .value_name("FLOAT")
                .help("Penalty for recently seen tokens [default: 1.1]")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("repeat-last-n")
                .long("repeat-last-n")
                .value_name("INT")
                .help("Window of recent tokens to penalize [default: 64]")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Random seed")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .long("threads")
                .value_name("INT")
                .help("Worker threads [default: all cores]")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("ctx")
                .short('c')
                .long("ctx")
                .value_name("INT")
                .help("Context window size, (default) = model n_ctx")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("batch")
                .short('b')
                .long("batch")
                .value_name("INT")
                .help("Prompt tokens per decode call [default: 8]")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(Arg::new("vocab").long("vocab").value_name("FILE").help("JSON vocabulary {token: id}"))
        .arg(Arg::new("no-mmap").long("no-mmap").help("Copy weights instead of mapping the file").action(ArgAction::SetTrue))
        .arg(Arg::new("kv-f16").long("kv-f16").help("Store the KV cache in f16").action(ArgAction::SetTrue))
}

fn parse_opt<T>(matches: &ArgMatches, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    matches
        .get_one::<String>(name)
        .map(|value| value.parse::<T>().with_context(|| format!("Invalid --{name} '{value}'")))
        .transpose()
}

/// Run the quantize command with the provided arguments
fn run_quantize_command(matches: &ArgMatches) -> Result<()> {
    let input = matches.get_one::<String>("INPUT").context("INPUT is required")?;
    let output = matches.get_one::<String>("OUTPUT").context("OUTPUT is required")?;

    let base = matches.get_one::<String>("config").map(|path| QuantConfig::from_json_file(Path::new(path))).transpose()?;
    let config = QuantConfig::builder()
        .base(base)
        .bits(matches.get_one::<u32>("bits").copied())
        .alg(parse_opt::<QuantAlgorithm>(matches, "alg")?)
        .block_size(matches.get_one::<usize>("block-size").copied())
        .scale_dtype(parse_opt::<ScaleDtype>(matches, "scale-dtype")?)
        .compute_type(parse_opt::<ComputeType>(matches, "compute-type")?)
        .nthread(matches.get_one::<usize>("nthread").copied())
        .build()?;

    let include: Vec<&str> = match matches.get_many::<String>("include") {
        Some(values) => values.map(String::as_str).collect(),
        None => vec![DEFAULT_INCLUDE],
    };
    let exclude: Vec<&str> = matches.get_many::<String>("exclude").map(|v| v.map(String::as_str).collect()).unwrap_or_default();
    let filter = TensorFilter::new(&include, &exclude)?;

    let input_path = Path::new(input);
    if !input_path.exists() {
        anyhow::bail!("Model file does not exist: {input}");
    }

    let report = quantize_model(input_path, Path::new(output), &filter, &config)?;
    info!("Quantized {} of {} tensors", report.n_quantized, report.n_tensors);

    Ok(())
}

/// Run the generate command with the provided arguments
fn run_generate_command(matches: &ArgMatches) -> Result<()> {
    let config = InferenceConfigBuilder::default()
        .model_path(matches.get_one::<String>("MODEL"))
        .vocab_path(matches.get_one::<String>("vocab"))
        .prompt(matches.get_one::<String>("prompt"))
        .n_predict(matches.get_one::<usize>("n-predict").copied())
        .temperature(matches.get_one::<f32>("temperature").copied())
        .top_k(matches.get_one::<usize>("top-k").copied())
        .top_p(matches.get_one::<f32>("top-p").copied())
        .repeat_penalty(matches.get_one::<f32>("repeat-penalty").copied())
        .repeat_last_n(matches.get_one::<usize>("repeat-last-n").copied())
        .seed(matches.get_one::<u64>("seed").copied())
        .n_threads(matches.get_one::<usize>("threads").copied())
        .ctx_length(matches.get_one::<usize>("ctx").copied())
        .n_batch(matches.get_one::<usize>("batch").copied())
        .use_mmap(Some(!matches.get_flag("no-mmap")))
        .kv_f16(Some(matches.get_flag("kv-f16")))
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;

    run_inference(config).map_err(|e| anyhow::anyhow!("Inference failed: {e:#}"))?;

    Ok(())
}

fn execute_commands() -> Result<()> {
    // Initialize logger with clean format (no timestamp/module prefix)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = Command::new("lowbit")
        .about("lowbit: quantize transformer models and run them on the CPU")
        .subcommand(quantize_subcommand())
        .subcommand(generate_subcommand())
        .get_matches();

    match matches.subcommand() {
        Some(("quantize", matches)) => run_quantize_command(matches),
        Some(("generate", matches)) => run_generate_command(matches),
        _ => anyhow::bail!("No subcommand specified. Use -h to print help information."),
    }
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}
