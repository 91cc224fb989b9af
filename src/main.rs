use std::{process, time::Duration};

use tagcache::{application::error::AppError, config, demo, infra::telemetry};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    let report = error.report();
    if dispatcher::has_been_set() {
        error!(error = %error, chain = ?report.messages, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, chain = ?report.messages, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Counter(config::CounterArgs::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Counter(_) => run_counter(settings).await,
        config::Command::Prefetch(args) => run_prefetch(settings, args).await,
    }
}

async fn run_counter(settings: config::Settings) -> Result<(), AppError> {
    let report = demo::run_counter(settings.cache, &settings.demo).await?;
    info!(
        initial = %report.initial,
        after_increments = %report.after_increments,
        after_decrement = %report.after_decrement,
        refetches_observed = report.refetches_observed,
        posts_refetched = report.posts_refetched,
        "Counter demo finished"
    );
    Ok(())
}

async fn run_prefetch(
    settings: config::Settings,
    args: config::PrefetchArgs,
) -> Result<(), AppError> {
    if args.max_age_seconds == 0 {
        return Err(AppError::validation(
            "--max-age-seconds must be greater than zero",
        ));
    }

    let max_age = Duration::from_secs(args.max_age_seconds);
    let steps = demo::run_prefetch(settings.cache, &settings.demo, max_age).await?;
    for step in &steps {
        let outcome = match step.admission {
            Some(admission) if admission.is_started() => "fetched",
            Some(_) => "served from cache",
            None => "skipped",
        };
        info!(step = step.label, outcome, "Prefetch demo step");
    }
    Ok(())
}
