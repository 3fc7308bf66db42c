use clap::{Args, Parser, Subcommand};
use megatron_launch::Result;
use megatron_launch::cmdline::{CompileOptions, compile, render_command};
use megatron_launch::config::{
    ConfigType, ConfigValue, TrainConfig, ValidationRules, build, load_baseline,
    load_train_config, parse_overrides, render_base_config,
};
use megatron_launch::container::{Container, ContainerOutcome};
use megatron_launch::job::{CancelToken, Slurm, WatchOptions, Watcher, install_signal_handlers};
use megatron_launch::logging;
use megatron_launch::schema::{Schema, load_schema};
use megatron_launch::submit::{SubmitOptions, SubmitOutcome, Submitter, load_template, render_script};
use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use tracing::warn;

#[derive(Parser)]
#[command(name = "mlaunch")]
#[command(about = "Compile Megatron training configs and submit them to SLURM", long_about = None)]
struct Cli {
    /// Debug-level logging (RUST_LOG still wins).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Commands,
}

/// How the config type is derived from the argument schema.
#[derive(Args)]
struct TypeArgs {
    /// Argument schema (JSON).
    #[arg(long)]
    schema: String,

    /// Schema fields left out of the config.
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,

    /// Default overrides, `name=value`.
    #[arg(long = "override")]
    overrides: Vec<String>,
}

impl TypeArgs {
    fn load(&self) -> Result<(Schema, ConfigType)> {
        let schema = load_schema(&self.schema)?;
        let excluded: BTreeSet<String> = self.exclude.iter().cloned().collect();
        let overrides = parse_overrides(&self.overrides)?;
        let ty = build(&schema, &excluded, &overrides)?;
        Ok((schema, ty))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the training command line for a config.
    Compile {
        #[command(flatten)]
        ty: TypeArgs,

        #[arg(long)]
        config: String,

        /// Diff reference; schema defaults when omitted.
        #[arg(long)]
        baseline: Option<String>,

        /// Emit `null` for null fields instead of skipping them.
        #[arg(long)]
        no_skip_none: bool,

        #[arg(long, value_delimiter = ',')]
        ignore: Vec<String>,
    },

    /// Render the batch script, write it out and optionally submit it.
    Submit {
        #[command(flatten)]
        ty: TypeArgs,

        #[arg(long)]
        config: String,

        #[arg(long)]
        baseline: Option<String>,

        #[arg(long, default_value = "slurm_template")]
        template_dir: String,

        /// Print the script only.
        #[arg(long)]
        debug: bool,

        /// Submit with sbatch.
        #[arg(long)]
        run: bool,

        /// Follow the job's output after submitting.
        #[arg(long, requires = "run")]
        show_log: bool,
    },

    /// Run `submit` inside a container image, then submit from the host.
    Container {
        #[arg(long)]
        image: String,

        #[arg(long, default_value = "singularity")]
        apptainer_cmd: String,

        /// Environment prefix for the command in the container.
        #[arg(long, default_value = "PYTHONPATH=src:Megatron-LM")]
        env: String,

        /// Launcher binary inside the image.
        #[arg(long, default_value = "mlaunch")]
        inner: String,

        /// Stop after printing the submission line.
        #[arg(long)]
        no_run: bool,

        #[arg(long, conflicts_with = "no_run")]
        show_log: bool,

        /// Arguments for `submit` inside the container.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Follow a job's output file.
    Log { job_id: String },

    /// Write the annotated defaults file.
    BaseConfig {
        #[command(flatten)]
        ty: TypeArgs,

        #[arg(short = 'o', long)]
        out: String,
    },
}

fn load_config(
    ty: &ConfigType,
    config: &str,
    baseline: Option<&str>,
) -> Result<(TrainConfig, ConfigValue)> {
    let train = load_train_config(config, ty, &ValidationRules::megatron())?;
    let baseline = match baseline {
        Some(path) => load_baseline(path, ty)?,
        None => ty.defaults(),
    };
    Ok((train, baseline))
}

fn follow(job_id: &str) -> Result<()> {
    let token = CancelToken::new();
    install_signal_handlers(token.clone())?;
    let mut watcher = Watcher::new(&Slurm, job_id, WatchOptions::default(), token, io::stdout());
    let outcome = watcher.run()?;
    std::process::exit(outcome.exit_code());
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.cmd {
        Commands::Compile {
            ty,
            config,
            baseline,
            no_skip_none,
            ignore,
        } => {
            let (schema, ty) = ty.load()?;
            let (train, baseline) = load_config(&ty, &config, baseline.as_deref())?;
            let options = CompileOptions {
                skip_none: !no_skip_none,
                ..CompileOptions::default()
            }
            .ignoring(ignore);
            let tokens = compile(&train.megatron, &baseline, &schema, &options);
            println!("{}", render_command(&train.entrypoint, &tokens));
        }

        Commands::Submit {
            ty,
            config,
            baseline,
            template_dir,
            debug,
            run,
            show_log,
        } => {
            let (schema, ty) = ty.load()?;
            let (train, baseline) = load_config(&ty, &config, baseline.as_deref())?;
            let tokens = compile(&train.megatron, &baseline, &schema, &CompileOptions::default());
            let template = load_template(Path::new(&template_dir), &train.slurm.template)?;
            let script = render_script(&train, &template, &tokens);

            let outcome = Submitter::default().submit(
                &train,
                &script,
                SubmitOptions { debug, run },
                &mut io::stdout(),
            )?;
            if show_log && let SubmitOutcome::Submitted { job_id, .. } = outcome {
                match job_id {
                    Some(id) => follow(&id)?,
                    None => warn!("no job id in sbatch output, not following"),
                }
            }
        }

        Commands::Container {
            image,
            apptainer_cmd,
            env,
            inner,
            no_run,
            show_log,
            args,
        } => {
            let container = Container {
                runtime: vec![apptainer_cmd],
                image,
                env,
            };
            let mut argv = vec![inner, "submit".to_string()];
            argv.extend(args);
            let outcome = container.run(&argv, &Submitter::default(), no_run)?;
            match outcome {
                ContainerOutcome::NoSubmitLine => warn!("nothing to submit"),
                ContainerOutcome::Prepared { line } => {
                    println!("Prepared: {}", line.argv.join(" "));
                }
                ContainerOutcome::Submitted { job_id, .. } if show_log => match job_id {
                    Some(id) => follow(&id)?,
                    None => warn!("no job id in sbatch output, not following"),
                },
                ContainerOutcome::Submitted { .. } => {}
            }
        }

        Commands::Log { job_id } => follow(&job_id)?,

        Commands::BaseConfig { ty, out } => {
            let (schema, ty) = ty.load()?;
            let text = render_base_config(&ty, &schema)?;
            std::fs::write(&out, text)?;
            println!("Wrote {}", out);
        }
    }

    Ok(())
}
