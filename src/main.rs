mod demo;

use std::io::IsTerminal;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use nagare::{Data, DataCatalog, Graph, LoggingConfig, Mode, Runner, logging, process};

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ModeArg {
    Thread,
    Process,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Thread => Mode::Thread,
            ModeArg::Process => Mode::Process,
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log filter, e.g. `info` or `nagare=debug`.
    #[arg(long, global = true, default_value = "info")]
    log: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the fan-out/fan-in demo pipeline.
    Run(RunArgs),
    /// Print the demo pipeline as a Mermaid diagram.
    Graph,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long, value_enum, default_value = "thread")]
    mode: ModeArg,

    #[arg(long)]
    max_workers: Option<usize>,

    /// Value fed to every free input.
    #[arg(long, default_value_t = 1)]
    value: i64,

    /// Only run these tasks and everything downstream of them.
    #[arg(long, value_delimiter = ',')]
    from_tasks: Vec<String>,

    /// Make these tasks fail.
    #[arg(long, value_delimiter = ',')]
    fail: Vec<String>,

    /// Print outputs, or the resume suggestion on failure, as JSON.
    #[arg(long)]
    json: bool,

    /// Print a Mermaid diagram of task timings after the run.
    #[arg(long)]
    mermaid: bool,
}

fn main() -> anyhow::Result<()> {
    let registry = demo::registry();
    if let Some(result) = process::serve_if_worker(&registry) {
        return Ok(result?);
    }

    let args = Args::parse();

    logging::init(&LoggingConfig {
        filter: args.log.clone(),
        ansi: std::io::stderr().is_terminal(),
        progress: std::io::stderr().is_terminal(),
    })?;

    match args.command {
        Command::Graph => {
            let pipeline = demo::fan_out_fan_in(&registry, &[])?;
            print!("{}", pipeline.to_mermaid());
            Ok(())
        }
        Command::Run(run) => run_demo(registry, run),
    }
}

fn run_demo(registry: nagare::Registry, args: RunArgs) -> anyhow::Result<()> {
    let mut pipeline = demo::fan_out_fan_in(&registry, &args.fail)?;
    if !args.from_tasks.is_empty() {
        pipeline = pipeline.from_tasks(args.from_tasks.as_slice())?;
    }

    // Every artifact of the demo carries the same value, so a resumed run can
    // be fed with it too.
    let catalog = DataCatalog::new();
    catalog.add_feed_dict(
        pipeline
            .inputs()
            .into_iter()
            .map(|name| (name, Data::new(args.value))),
    );

    let mode = Mode::from(args.mode);
    let mut builder = Runner::builder().mode(mode).registry(registry);
    if let Some(max_workers) = args.max_workers {
        builder = builder.max_workers(max_workers);
    }
    let runner = builder.build()?;

    eprintln!(
        "Running {} tasks in {} mode with {} worker(s).",
        style(pipeline.len()).red(),
        style(mode).blue(),
        runner.workers_for(&pipeline)
    );

    let (outputs, diagnostics) = match runner.run_with_diagnostics(&pipeline, Arc::new(catalog)) {
        Ok(result) => result,
        Err(e) => {
            if args.json
                && let Some(resume) = e.resume()
            {
                println!("{}", serde_json::to_string_pretty(resume)?);
            }
            return Err(e.into());
        }
    };

    let mut names: Vec<&String> = outputs.keys().collect();
    names.sort();

    if args.json {
        let values: serde_json::Map<String, serde_json::Value> = names
            .into_iter()
            .map(|name| {
                let value = outputs[name]
                    .get::<i64>()
                    .map(|v| serde_json::Value::from(*v))
                    .unwrap_or(serde_json::Value::Null);
                (name.clone(), value)
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&values)?);
    } else {
        for name in names {
            match outputs[name].get::<i64>() {
                Ok(value) => println!("{name} = {value}"),
                Err(_) => println!("{name} = {:?}", outputs[name]),
            }
        }
    }

    if args.mermaid {
        print!("{}", diagnostics.render_mermaid(&pipeline));
    }

    Ok(())
}
