use std::thread::scope;

use clap::{AppSettings, Parser};
use crossbeam_channel::bounded;
use crossbeam_utils::atomic::AtomicCell;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, error, info, warn};
use rayon::prelude::*;

use imdiff::{
    selection::SourceSelectorName,
    sim::{PlantedTransient, SurveyConfig, SyntheticSurvey},
    skymap::PatchIndex,
    DataId, DataRef, ImageDifferenceConfig, ImageDifferenceError, ImageDifferenceResult,
    ImageDifferenceTask, MemoryRepository,
};

#[derive(Parser)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_long_args = true)]
struct Args {
    /// Seed of the synthetic survey.
    #[clap(long, default_value = "20140301")]
    seed: u64,

    /// The number of visits to simulate.
    #[clap(long, default_value = "3")]
    visits: u32,

    /// The number of sensors per visit.
    #[clap(long, default_value = "2")]
    ccds: u32,

    /// Coadd patches to leave out of the survey, as x,y.
    #[clap(long, multiple_values(true))]
    missing_patches: Vec<PatchIndex>,

    /// Prefix of the template datasets.
    #[clap(long, default_value = "deep")]
    coadd_name: String,

    /// The kernel-source selector: catalog, secondMoment or diacatalog.
    #[clap(long, default_value = "diacatalog")]
    selector: SourceSelectorName,

    /// Convolve the science exposure instead of the template.
    #[clap(long)]
    convolve_science: bool,

    /// Skip pre-convolution of the science exposure; smooth at detection
    /// instead.
    #[clap(long)]
    no_pre_convolve: bool,

    /// Keep positive and negative diaSources separate.
    #[clap(long)]
    no_merge: bool,

    /// Skip association with the src and reference catalogs.
    #[clap(long)]
    no_match: bool,

    /// Grow footprints by this many pixels before merging.
    #[clap(long, default_value = "2")]
    grow_footprint: i32,

    /// diaSource association radius \[arcsec\].
    #[clap(long, default_value = "0.5")]
    match_radius: f64,

    /// Keep footprint pixel values in the persisted diaSources.
    #[clap(long)]
    heavy_footprints: bool,

    /// Persist the warped, PSF-matched template.
    #[clap(long)]
    write_matched_exp: bool,

    /// The number of threads to process visits with. The default is one per
    /// core.
    #[clap(short = 'j', long)]
    num_threads: Option<usize>,

    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv). The default is to print only high-level information.
    #[clap(short, long, parse(from_occurrences))]
    verbosity: u8,

    /// Disable progress bars.
    #[clap(long)]
    no_progress_bars: bool,
}

impl Args {
    fn task_config(&self) -> ImageDifferenceConfig {
        let mut config = ImageDifferenceConfig {
            coadd_name: self.coadd_name.clone(),
            do_pre_convolve: !self.no_pre_convolve,
            do_merge: !self.no_merge,
            do_match_sources: !self.no_match,
            do_write_matched_exp: self.write_matched_exp,
            do_write_heavy_footprints_in_sources: self.heavy_footprints,
            convolve_template: !self.convolve_science,
            grow_footprint: self.grow_footprint,
            dia_source_match_radius: self.match_radius,
            ..Default::default()
        };
        config.source_selector.name = self.selector;
        config
    }

    fn survey_config(&self) -> SurveyConfig {
        SurveyConfig {
            seed: self.seed,
            coadd_name: self.coadd_name.clone(),
            n_visits: self.visits,
            n_ccds: self.ccds,
            missing_patches: self.missing_patches.clone(),
            ..Default::default()
        }
    }
}

type Outcome = (DataId, Result<ImageDifferenceResult, ImageDifferenceError>);

fn main() {
    let args = Args::parse();
    setup_logging(args.verbosity);

    if let Some(n) = args.num_threads {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build_global()
        {
            warn!("Couldn't set the number of threads: {e}");
        }
    }

    let task = match ImageDifferenceTask::new(args.task_config()) {
        Ok(t) => t,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    info!("Template: {}Coadd", task.config().coadd_name);
    info!("Kernel-source selector: {}", task.config().source_selector.name);

    let repo = MemoryRepository::new();
    let truth = SyntheticSurvey::new(args.survey_config()).build(&repo);

    let (tx, rx) = bounded::<Outcome>(5);
    let error = AtomicCell::new(false);
    let multi_progress = MultiProgress::with_draw_target(if args.no_progress_bars {
        ProgressDrawTarget::hidden()
    } else {
        ProgressDrawTarget::stdout()
    });
    let progress = multi_progress.add(
        ProgressBar::new(truth.data_ids.len() as _)
            .with_style(
                ProgressStyle::default_bar()
                    .template("{msg:17}: [{wide_bar:.blue}] {pos:2}/{len:2} sensors ({elapsed_precise}<{eta_precise})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            )
            .with_position(0)
            .with_message("Differencing"),
    );
    progress.tick();

    let task = &task;
    let repo = &repo;
    let data_ids = &truth.data_ids;
    let mut n_failed = 0;
    let mut n_recovered = 0;
    scope(|s| {
        s.spawn(move || {
            data_ids.par_iter().for_each_with(tx, |tx, data_id| {
                debug!("Working on {data_id}");
                let outcome = task.run(&DataRef::new(repo, data_id));
                // The reporter only goes away once every sender is dropped.
                if tx.send((data_id.clone(), outcome)).is_err() {
                    error!("Reporter hung up before {data_id} was reported");
                }
            });
        });

        s.spawn(|| {
            for (data_id, outcome) in rx.iter() {
                match outcome {
                    Ok(res) => {
                        let planted: Vec<&PlantedTransient> = truth
                            .transients
                            .iter()
                            .filter(|t| t.data_id == data_id)
                            .collect();
                        let found = recovered(&res, &planted);
                        n_recovered += found;
                        info!(
                            "{data_id}: {} diaSources, {found} / {} planted transients recovered",
                            res.metadata.n_dia_sources.unwrap_or(0),
                            planted.len()
                        );
                    }
                    Err(e) => {
                        error!("{data_id} failed: {e}");
                        error.store(true);
                        n_failed += 1;
                    }
                }
                progress.inc(1);
            }
            progress.finish();
        });
    });

    info!(
        "Processed {} / {} sensors; recovered {n_recovered} / {} planted transients",
        data_ids.len() - n_failed,
        data_ids.len(),
        truth.transients.len()
    );
    if error.load() {
        std::process::exit(1);
    }
}

/// How many of `planted` have a diaSource within two pixels.
fn recovered(res: &ImageDifferenceResult, planted: &[&PlantedTransient]) -> usize {
    let Some(sources) = &res.sources else {
        return 0;
    };
    planted
        .iter()
        .filter(|t| {
            sources.records.iter().any(|r| {
                r.position().map_or(false, |(x, y)| {
                    (x - t.pixel.0).powi(2) + (y - t.pixel.1).powi(2) <= 4.0
                })
            })
        })
        .count()
}

/// `-v` flags raise the level of this crate's own messages; dependencies only
/// ever report warnings. `RUST_LOG` is applied last and wins.
fn setup_logging(verbosity: u8) {
    let mut builder = env_logger::Builder::new();
    builder
        .target(env_logger::Target::Stdout)
        .format_target(false)
        .filter_level(log::LevelFilter::Warn)
        .filter_module(env!("CARGO_CRATE_NAME"), crate_log_level(verbosity));
    if verbosity >= 3 {
        // Name the stage module behind each line, e.g. imdiff::template.
        builder.format(|buf, record| {
            use std::io::Write;

            let timestamp = buf.timestamp();
            let level = record.level();
            let target = record.target();
            let line = record.line().unwrap_or(0);
            let message = record.args();

            writeln!(buf, "[{timestamp} {level} {target}:{line}] {message}")
        });
    }
    builder.parse_default_env();
    builder.init();
}

fn crate_log_level(verbosity: u8) -> log::LevelFilter {
    match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}
