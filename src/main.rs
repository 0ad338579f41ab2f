// OBS clock drift - Main Entry Point
// Licensed under AGPL v3

use clap::Parser;
use obs_clockdrift::config::Config;
use obs_clockdrift::drift::{ClockDrift, StationStatus};
use obs_clockdrift::output::{CsvOutput, JsonOutput, OutputHandler};
use obs_clockdrift::params::{load_parameter_file, ProcessingParameters};
use obs_clockdrift::station::load_station_file;
use obs_clockdrift::trace::JsonTraceLoader;
use tracing::{info, warn};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command-line arguments
    let config = Config::parse();

    // Initialize logging
    init_logging(config.verbose);

    if config.threads > 0 {
        rayon::ThreadPoolBuilder::new().num_threads(config.threads).build_global()?;
    }

    let stations = load_station_file(&config.stations)?;
    info!(
        stations = stations.len(),
        references = stations.iter().filter(|s| s.is_reference()).count(),
        "Loaded station table"
    );

    let bands = match &config.params {
        Some(path) => load_parameter_file(path)?,
        None => vec![ProcessingParameters::default()],
    };
    for (i, band) in bands.iter().enumerate() {
        info!(band = i, freqmin = band.freqmin, freqmax = band.freqmax, ref_vel = band.ref_vel, "Processing band");
    }

    let mut drift = ClockDrift::from_directory(
        stations,
        bands,
        &config.data_dir,
        &config.extension,
        config.reference_time,
        Box::new(JsonTraceLoader),
    )?
    .with_weighting(config.weighting)
    .with_max_residual(config.max_residual)
    .with_selection(config.selection());

    if config.seed_from_pairs {
        let seeded = drift.seed_from_pairs()?;
        info!(seeded, "A priori drift seeded from station pairs");
    }

    let reports = drift.run(config.iterations, config.tolerance)?;
    if !reports.last().map_or(false, |r| r.converged) {
        warn!(iterations = reports.len(), "Drift estimates did not converge");
    }

    for station in drift.stations.iter().filter(|s| s.needs_correction) {
        match drift.station_status(&station.code)? {
            StationStatus::Resolved(curve) => info!(
                station = %station.code,
                rate = curve.rate,
                offset = curve.offset,
                "Clock drift (s/day, s)"
            ),
            StationStatus::Excluded => warn!(station = %station.code, "Excluded by data selection; no drift estimated"),
            StationStatus::Unresolved => warn!(station = %station.code, "Not connected to a reference station"),
            StationStatus::Reference | StationStatus::Pending => {}
        }
    }

    if let Some(path) = &config.output {
        JsonOutput::new(path).write_results(&drift)?;
        info!(file = %path.display(), "Wrote results");
    }
    if let Some(path) = &config.write_csv {
        CsvOutput::new(path)?.write_results(&drift)?;
        info!(file = %path.display(), "Wrote observation table");
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::fmt::format::FmtSpan;

    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_span_events(if verbose {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    if verbose {
        subscriber.with_max_level(tracing::Level::DEBUG).init();
        info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber.with_max_level(tracing::Level::INFO).init();
    }
}
