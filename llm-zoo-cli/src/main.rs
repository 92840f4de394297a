#[cfg(test)]
#[path = "../tests/unit/main_test.rs"]
mod main_test;

use std::io::{self, Write};
use std::ops::ControlFlow;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use llm_zoo_inference::{
    GenerationEvent, GenerationSession, InferenceConfig, InferenceConfigBuilder, create_generator, estimate_memory_mb,
    load_model,
};
use log::{error, info};

fn model_path_arg() -> Arg {
    Arg::new("MODEL_PATH")
        .help("Path to the model directory (containing config.json and *.safetensors)")
        .required(true)
        .index(1)
        .value_parser(clap::value_parser!(PathBuf))
}

fn config_path_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .value_name("PATH")
        .help("Directory holding model.json, (default) = model path")
        .value_parser(clap::value_parser!(PathBuf))
}

fn context_arg() -> Arg {
    Arg::new("context")
        .short('c')
        .long("context")
        .value_name("INT")
        .help("Context window size, (default) = model context size")
        .value_parser(clap::value_parser!(usize))
}

/// Define the info subcommand.
fn info_subcommand() -> Command {
    Command::new("info")
        .about("Print the model configuration, parameter count and memory estimate")
        .arg(model_path_arg())
        .arg(config_path_arg())
        .arg(
            Arg::new("load")
                .long("load")
                .help("Load every tensor instead of only counting parameters")
                .action(ArgAction::SetTrue),
        )
}

/// Define the generate subcommand.
fn generate_subcommand() -> Command {
    Command::new("generate")
        .about("Generate token ids continuing the given input token ids")
        .arg(model_path_arg())
        .arg(config_path_arg())
        .arg(context_arg())
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("IDS")
                .help("Comma separated input token ids, (default) = end-of-text token"),
        )
        .arg(
            Arg::new("length")
                .short('n')
                .long("length")
                .value_name("INT")
                .help("Maximum number of generated tokens [default: 25]")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("topk")
                .short('k')
                .long("topk")
                .value_name("INT")
                .help("Number of best candidates to sample from [default: 40]")
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
}

fn parse_tokens(input: &str) -> Result<Vec<usize>> {
    input
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| token.parse::<usize>().with_context(|| format!("Invalid token id: {token}")))
        .collect()
}

fn base_config(matches: &ArgMatches) -> InferenceConfigBuilder {
    InferenceConfig::builder()
        .model_path(matches.get_one::<PathBuf>("MODEL_PATH").map(PathBuf::as_path))
        .config_path(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))
}

/// Run the info command with the provided arguments
fn run_info_command(matches: &ArgMatches) -> Result<()> {
    let config = base_config(matches).calculation_only(Some(!matches.get_flag("load"))).build()?;

    let stack = load_model(&config)?;
    let parameter_count = stack.parameter_count();

    info!("📁 Model path: {}", config.model_path.display());
    info!("🧩 Architecture: {}", stack.config().transformer_type);
    info!("🔢 Parameters: {parameter_count}");
    info!("💾 Estimated memory: {} MB", estimate_memory_mb(parameter_count));

    Ok(())
}

fn generate_config(matches: &ArgMatches) -> Result<InferenceConfig> {
    Ok(base_config(matches)
        .context_size(matches.get_one::<usize>("context").copied())
        .length_limit(matches.get_one::<usize>("length").copied())
        .top_k(matches.get_one::<usize>("topk").copied())
        .seed(matches.get_one::<u64>("seed").copied())
        .build()?)
}

/// Streams one generation event: a dot per replayed input token, the id of each generated one.
fn print_event(out: &mut impl Write, event: GenerationEvent) -> io::Result<()> {
    match event {
        GenerationEvent::Progress { .. } => write!(out, ".")?,
        GenerationEvent::Token { token, .. } => write!(out, " {token}")?,
    }
    out.flush()
}

/// Run the generate command with the provided arguments
fn run_generate_command(matches: &ArgMatches) -> Result<()> {
    let config = generate_config(matches)?;

    let input = match matches.get_one::<String>("input") {
        Some(input) => parse_tokens(input)?,
        None => Vec::new(),
    };

    let mut generator = create_generator(&config)?;
    let mut session = GenerationSession::default();
    let mut stdout = io::stdout();
    let mut write_error = None;

    let tokens = generator.process(&mut session, &input, |event| match print_event(&mut stdout, event) {
        Ok(()) => ControlFlow::Continue(()),
        Err(err) => {
            write_error = Some(err);
            ControlFlow::Break(())
        }
    })?;

    if let Some(err) = write_error {
        return Err(err).context("Failed to write generated tokens");
    }
    writeln!(stdout)?;
    info!("Generated {} tokens, session position {}", tokens.len(), session.position);

    Ok(())
}

fn execute_commands() -> Result<()> {
    // Initialize logger with clean format (no timestamp/module prefix)
    env_logger::Builder::from_default_env()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let matches = Command::new("llm-zoo")
        .about("LLM zoo: an educational inference engine for decoder-only transformer models")
        .subcommand(info_subcommand())
        .subcommand(generate_subcommand())
        .get_matches();

    match matches.subcommand() {
        Some(("info", matches)) => run_info_command(matches),
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
