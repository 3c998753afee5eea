#![deny(clippy::unwrap_used)]

use bikemon::acquisition::{Acquirer, CodeOutcome, FirstMatch, FirstMatchPolicy, WindowPolicy};
use bikemon::aggregate::{AveragedReading, Reading};
use bikemon::codebook::CodeBook;
use bikemon::connection::PortSettings;
use bikemon::eventlog::{CodeEvent, EventLog};
use bikemon::health::{parse_purchase_date, HealthModel, LinearModel, ModelInput};
use bikemon::proto::sample::{SensorFormat, SensorParser};
use bikemon::proto::{ProtoError, Result};
use bikemon::scheduler::{AutoRefresh, Scheduler};
use bikemon::{
    DEFAULT_BAUDRATE, DEFAULT_MAX_RETRIES, DEFAULT_READ_TIMEOUT, DEFAULT_SETTLE_DELAY,
    DEFAULT_TTY, DEFAULT_WINDOW,
};
use byteorder::{LittleEndian, WriteBytesExt};
use chrono::Local;
use clap::{arg, command, value_parser};
use std::fmt;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Copy, Clone)]
pub enum OutputFormat {
    Text,
    Json,
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Json => f.write_str("json"),
            Self::Csv => f.write_str("csv"),
        }
    }
}

impl clap::ValueEnum for OutputFormat {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Text, Self::Json, Self::Csv]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(match self {
            Self::Text => clap::builder::PossibleValue::new("text"),
            Self::Json => clap::builder::PossibleValue::new("json"),
            Self::Csv => clap::builder::PossibleValue::new("csv"),
        })
    }
}

const NO_CODE: &str = "No valid error code received.";

#[tokio::main]
async fn main() {
    let matches = command!() // requires `cargo` feature
        .arg(
            arg!(
                -p --device <PORT> "Serial port of the ESP32"
            )
            .default_value(DEFAULT_TTY)
            .required(false)
            .value_parser(value_parser!(PathBuf)),
        )
        .arg(arg!(
            -d --debug ... "Turn debugging information on"
        ))
        .arg(
            arg!(
                -b --baudrate <BAUDRATE> "Baudrate"
            )
            .default_value(DEFAULT_BAUDRATE.to_string())
            .value_parser(value_parser!(u32)),
        )
        .arg(
            arg!(
                -t --timeout <MS> "Read timeout per line in milliseconds"
            )
            .default_value(DEFAULT_READ_TIMEOUT.as_millis().to_string())
            .value_parser(value_parser!(u64).range(1..)),
        )
        .subcommand(
            clap::Command::new("code")
                .about("Read a diagnostic trouble code")
                .arg(
                    arg!(--"codes" <CSV> "Code table with 'Error Code' and 'Description' columns")
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--"log" <PATH> "Append recognized codes to this file")
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--"refresh" <MS> "Read again this many milliseconds after each read")
                        .value_parser(value_parser!(u64).range(1..)),
                )
                .arg(
                    arg!(--"retries" <N> "Line reads before giving up")
                        .default_value(DEFAULT_MAX_RETRIES.to_string())
                        .value_parser(value_parser!(u32).range(1..)),
                )
                .arg(
                    arg!(--"settle" <MS> "Wait after opening the port")
                        .default_value(DEFAULT_SETTLE_DELAY.as_millis().to_string())
                        .value_parser(value_parser!(u64)),
                )
                .arg(
                    arg!(--"format" <fmt> "Output format")
                        .value_parser(value_parser!(OutputFormat)),
                ),
        )
        .subcommand(
            clap::Command::new("sample")
                .about("Average battery readings over a time window")
                .arg(
                    arg!(--"duration" <SECONDS> "Window length")
                        .default_value(DEFAULT_WINDOW.as_secs().to_string())
                        .value_parser(value_parser!(u64).range(1..)),
                )
                .arg(
                    arg!(--"style" <STYLE> "Sensor line layout")
                        .value_parser(value_parser!(SensorFormat)),
                )
                .arg(arg!(--"marker" <TEXT> "Only consider lines containing this text"))
                .arg(
                    arg!(--"format" <fmt> "Output format")
                        .value_parser(value_parser!(OutputFormat)),
                )
                .arg(
                    arg!(
                        --"fifo" <FIFO>
                        "Write the means as f64 values (LE) to FIFO file, order is [V][A][T]"
                    )
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            clap::Command::new("predict")
                .about("Estimate battery health")
                .arg(
                    arg!(--"model" <JSON> "Trained model")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--"initial-voltage" <VOLTS> "Voltage of the battery when new")
                        .required(true)
                        .value_parser(value_parser!(f64)),
                )
                .arg(arg!(--"purchase-date" <DATE> "Purchase date (YYYY-MM-DD)").required(true))
                .arg(
                    arg!(--"duration" <SECONDS> "Window length")
                        .default_value(DEFAULT_WINDOW.as_secs().to_string())
                        .value_parser(value_parser!(u64).range(1..)),
                )
                .arg(
                    arg!(--"style" <STYLE> "Sensor line layout")
                        .value_parser(value_parser!(SensorFormat)),
                )
                .arg(arg!(--"marker" <TEXT> "Only consider lines containing this text")),
        )
        .subcommand(
            clap::Command::new("history").about("Show logged codes").arg(
                arg!(<log> "Log file written by 'code --log'").value_parser(value_parser!(PathBuf)),
            ),
        )
        .subcommand_required(true)
        .get_matches();

    init_tracing(matches.get_count("debug"));

    if let Err(e) = handle_args(&matches).await {
        let port = matches
            .get_one::<PathBuf>("device")
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        match e {
            ProtoError::Serial(err) => {
                if err.kind() == tokio_serial::ErrorKind::NoDevice
                    || matches!(err.kind(), tokio_serial::ErrorKind::Io(ErrorKind::NotFound))
                {
                    eprintln!("{}: File not found", port);
                } else {
                    eprintln!("Serial error: {} [device: {}]", err, port);
                }
            }
            ProtoError::Io(err) => {
                if err.kind() == ErrorKind::NotFound {
                    eprintln!("File not found: {}", err);
                } else {
                    eprintln!("I/O Error: {} [device: {}]", err, port);
                }
            }
            ProtoError::Busy(path) => {
                eprintln!("{}: port is in use, close other programs reading it", path);
            }
            ProtoError::InvalidSettings(msg) => {
                eprintln!("Invalid settings: {}", msg);
            }
            ProtoError::Abort => {
                eprintln!("Lost connection to device, aborting!");
            }
            ProtoError::Csv(err) => {
                eprintln!("Reading CSV failed: {}", err);
            }
            ProtoError::Json(err) => {
                eprintln!("Reading JSON failed: {}", err);
            }
            ProtoError::Model(msg) => {
                eprintln!("{}", msg);
            }
        }
        exit(-1);
    }
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("bikemon={level},bikemoncmd={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn handle_args(matches: &clap::ArgMatches) -> Result<()> {
    let baud_rate = matches
        .get_one::<u32>("baudrate")
        .unwrap_or(&DEFAULT_BAUDRATE);
    let read_timeout = matches
        .get_one::<u64>("timeout")
        .map(|ms| Duration::from_millis(*ms))
        .unwrap_or(DEFAULT_READ_TIMEOUT);

    let port_path = matches
        .get_one::<PathBuf>("device")
        .ok_or(ProtoError::InvalidSettings("no device given"))?;
    let settings =
        PortSettings::new(port_path.to_string_lossy(), *baud_rate).with_read_timeout(read_timeout);
    settings.validate()?;
    debug!(?settings, "Port settings");

    let acquirer = Acquirer::serial(settings);
    let scheduler = Scheduler::new();

    match matches.subcommand() {
        Some(("code", args)) => read_code(acquirer, &scheduler, args).await,
        Some(("sample", args)) => sample(acquirer, &scheduler, args).await,
        Some(("predict", args)) => predict(acquirer, &scheduler, args).await,
        Some(("history", args)) => {
            if let Some(path) = args.get_one::<PathBuf>("log") {
                for event in EventLog::new(path).events()? {
                    println!("{}", event);
                }
            }
            Ok(())
        }
        _ => Err(std::io::Error::new(
            ErrorKind::Unsupported,
            "Unsupported command line argument",
        )
        .into()),
    }
}

/// State of the code dashboard, changed only by completed reads.
struct CodeDashboard<W: Write> {
    codebook: CodeBook,
    log: Option<EventLog>,
    format: OutputFormat,
    out: W,
    csv_header_written: bool,
}

impl<W: Write> CodeDashboard<W> {
    fn new(codebook: CodeBook, log: Option<EventLog>, format: OutputFormat, out: W) -> Self {
        Self {
            codebook,
            log,
            format,
            out,
            csv_header_written: false,
        }
    }

    fn apply(&mut self, outcome: CodeOutcome) -> Result<()> {
        match outcome {
            FirstMatch::Matched(sample) => {
                let event = CodeEvent::new(&sample, self.codebook.describe(&sample.code));
                if let Some(log) = &self.log {
                    log.append(&event)?;
                }
                self.print_record(&event)
            }
            FirstMatch::TimedOut => self.no_code(),
        }
    }

    /// Shown for timed out and failed reads alike.
    fn no_code(&mut self) -> Result<()> {
        match self.format {
            OutputFormat::Text => {
                writeln!(self.out, "-- {}", NO_CODE)?;
                Ok(())
            }
            _ => self.print_record(&CodeEvent {
                timestamp: Local::now(),
                code: String::new(),
                description: NO_CODE.to_string(),
            }),
        }
    }

    fn print_record(&mut self, event: &CodeEvent) -> Result<()> {
        match self.format {
            OutputFormat::Json if event.code.is_empty() => writeln!(
                self.out,
                "{}",
                serde_json::json!({
                    "timestamp": event.timestamp,
                    "code": null,
                    "description": event.description,
                })
            )?,
            OutputFormat::Json => writeln!(self.out, "{}", serde_json::to_string(event)?)?,
            OutputFormat::Text => writeln!(self.out, "{}", event)?,
            OutputFormat::Csv => {
                let mut wtr = csv::WriterBuilder::new()
                    .has_headers(!self.csv_header_written)
                    .from_writer(&mut self.out);
                wtr.serialize(event)?;
                wtr.flush()?;
                self.csv_header_written = true;
            }
        }
        self.out.flush()?;
        Ok(())
    }
}

async fn read_code(
    acquirer: Acquirer,
    scheduler: &Scheduler,
    args: &clap::ArgMatches,
) -> Result<()> {
    let codebook = match args.get_one::<PathBuf>("codes") {
        Some(path) => CodeBook::from_path(path)?,
        None => CodeBook::default(),
    };
    let policy = FirstMatchPolicy {
        settle_delay: args
            .get_one::<u64>("settle")
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or(DEFAULT_SETTLE_DELAY),
        max_retries: *args.get_one::<u32>("retries").unwrap_or(&DEFAULT_MAX_RETRIES),
    };
    let mut dashboard = CodeDashboard::new(
        codebook,
        args.get_one::<PathBuf>("log").map(EventLog::new),
        *args
            .get_one::<OutputFormat>("format")
            .unwrap_or(&OutputFormat::Text),
        std::io::stdout(),
    );

    eprintln!("Listening on: {}\n", acquirer.settings().path);

    let Some(interval) = args.get_one::<u64>("refresh") else {
        let outcome = scheduler
            .spawn(async move { acquirer.read_code(&policy).await })
            .await?;
        return dashboard.apply(outcome);
    };

    let mut refreshing =
        AutoRefresh::new(Duration::from_millis(*interval)).spawn(scheduler, move || {
            let acquirer = acquirer.clone();
            async move { acquirer.read_code(&policy).await }
        });

    loop {
        tokio::select! {
            result = refreshing.next() => match result {
                Some(Ok(outcome)) => dashboard.apply(outcome)?,
                Some(Err(e)) => {
                    warn!(error = %e, "Read failed");
                    dashboard.no_code()?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if refreshing.is_enabled() => {
                eprintln!("Stopping after the current read...");
                refreshing.disable();
            }
        }
    }
    Ok(())
}

fn sensor_parser(args: &clap::ArgMatches) -> SensorParser {
    let parser = match args.get_one::<SensorFormat>("style") {
        Some(SensorFormat::FreeForm) => SensorParser::free_form(),
        Some(SensorFormat::Auto) => SensorParser::new(SensorFormat::Auto, None),
        Some(SensorFormat::Delimited) | None => SensorParser::delimited(),
    };
    match args.get_one::<String>("marker") {
        Some(marker) => parser.with_marker(Some(marker.clone())),
        None => parser,
    }
}

async fn averaged(
    acquirer: Acquirer,
    scheduler: &Scheduler,
    args: &clap::ArgMatches,
) -> Result<Option<AveragedReading>> {
    let parser = sensor_parser(args);
    let duration = args
        .get_one::<u64>("duration")
        .map(|s| Duration::from_secs(*s))
        .unwrap_or(DEFAULT_WINDOW);
    let policy = WindowPolicy::new(duration);

    eprintln!(
        "Reading sensor data from {} for {} seconds...",
        acquirer.settings().path,
        duration.as_secs()
    );
    let reading = scheduler
        .spawn(async move { acquirer.sample_average(&parser, &policy).await })
        .await?;

    Ok(match reading {
        Reading::Averaged(reading) => Some(reading),
        Reading::NoData => None,
    })
}

async fn sample(acquirer: Acquirer, scheduler: &Scheduler, args: &clap::ArgMatches) -> Result<()> {
    let Some(reading) = averaged(acquirer, scheduler, args).await? else {
        println!("--- NO DATA ---");
        exit(-2);
    };

    let format = args
        .get_one::<OutputFormat>("format")
        .unwrap_or(&OutputFormat::Text);
    match format {
        OutputFormat::Text => println!("{:#}", reading),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reading)?),
        OutputFormat::Csv => {
            let mut wtr = csv::Writer::from_writer(std::io::stdout());
            wtr.serialize(reading)?;
            wtr.flush()?;
        }
    }

    if let Some(path) = args.get_one::<PathBuf>("fifo") {
        let mut binout = OpenOptions::new().write(true).open(path)?;
        binout.write_f64::<LittleEndian>(reading.mean_voltage)?;
        binout.write_f64::<LittleEndian>(reading.mean_current)?;
        binout.write_f64::<LittleEndian>(reading.mean_temperature)?;
        binout.flush()?;
    }
    Ok(())
}

async fn predict(acquirer: Acquirer, scheduler: &Scheduler, args: &clap::ArgMatches) -> Result<()> {
    let model = match args.get_one::<PathBuf>("model") {
        Some(path) => LinearModel::from_path(path)?,
        None => return Err(ProtoError::Model("No model given".to_string())),
    };
    let initial_voltage = *args
        .get_one::<f64>("initial-voltage")
        .ok_or_else(|| ProtoError::Model("No initial voltage given".to_string()))?;
    let purchase_date = parse_purchase_date(
        args.get_one::<String>("purchase-date")
            .map(String::as_str)
            .unwrap_or_default(),
    )?;

    let Some(reading) = averaged(acquirer, scheduler, args).await? else {
        println!("Failed to read data from ESP32");
        exit(-2);
    };

    let input = ModelInput::new(
        &reading,
        initial_voltage,
        purchase_date,
        Local::now().date_naive(),
    )?;
    let estimate = model.predict(&input)?;

    println!("{:#}", reading);
    println!("{}", estimate);
    println!(
        "Voltage Drop: {:.2} V over {} days",
        input.voltage_drop, input.days_used
    );
    Ok(())
}
