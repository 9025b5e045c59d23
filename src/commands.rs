use std::io::BufReader;
use std::path::PathBuf;

use tracing::info;

use crate::codec::encode_hex;
use crate::{catalog, connection, device};

#[derive(clap::Parser)]
#[group(id = "commands::CatalogArgs")]
pub struct CatalogArgs {
    /// Path of the DataPointType catalog (controller models).
    #[arg(long, default_value = "ecnDataPointType.xml")]
    pub data_point_types: PathBuf,
    /// Path of the EventType catalog (register descriptors).
    #[arg(long, default_value = "ecnEventType.xml")]
    pub event_types: PathBuf,
}

#[derive(thiserror::Error, Debug)]
pub enum SetupError {
    #[error(transparent)]
    Connect(#[from] connection::Error),
    #[error("could not identify the attached device")]
    Identify(#[source] device::Error),
    #[error("could not open the catalog at {1:?}")]
    OpenCatalog(#[source] std::io::Error, PathBuf),
    #[error(transparent)]
    Catalog(#[from] catalog::Error),
}

/// Connects, reads the system device identifier and loads the catalogs.
async fn open_device(
    conn: &connection::Args,
    catalogs: &CatalogArgs,
) -> Result<device::Device, SetupError> {
    let mut dev = device::Device::connect(conn).await?;
    let ident = dev.identify().await.map_err(SetupError::Identify)?;
    info!(message = "device identified", ident = %encode_hex(&ident));
    let dp_file = std::fs::File::open(&catalogs.data_point_types)
        .map_err(|e| SetupError::OpenCatalog(e, catalogs.data_point_types.clone()))?;
    let et_file = std::fs::File::open(&catalogs.event_types)
        .map_err(|e| SetupError::OpenCatalog(e, catalogs.event_types.clone()))?;
    let data_point =
        catalog::load(BufReader::new(dp_file), BufReader::new(et_file), ident)?;
    info!(
        message = "data point matched",
        id = %data_point.id,
        event_types = data_point.event_types.len(),
    );
    dev.set_data_point(data_point);
    Ok(dev)
}

fn runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}

pub mod events {
    use super::*;
    use crate::datapoint::EventType;
    use crate::output;

    /// List the event types of the attached device.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        catalogs: CatalogArgs,
        #[clap(flatten)]
        output: output::Args,
        /// Case-insensitive substring matched against names and
        /// descriptions.
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the runtime")]
        Runtime(#[source] std::io::Error),
        #[error(transparent)]
        Setup(#[from] SetupError),
        #[error(transparent)]
        Output(#[from] output::Error),
    }

    fn is_match(name: &str, et: &EventType, pattern: &str) -> bool {
        let pattern = pattern.to_uppercase();
        name.to_uppercase().contains(&pattern)
            || et.description.to_uppercase().contains(&pattern)
    }

    pub fn run(args: Args) -> Result<(), Error> {
        runtime().map_err(Error::Runtime)?.block_on(run_inner(args))
    }

    async fn run_inner(args: Args) -> Result<(), Error> {
        let dev = open_device(&args.connection, &args.catalogs).await?;
        let mut out = args.output.to_output()?;
        out.table_headers(vec![
            "Name", "Address", "Mode", "Block", "Conversion", "Unit", "Description",
        ]);
        for (name, et) in &dev.data_point().event_types {
            if let Some(pattern) = &args.filter {
                if !is_match(name, et, pattern) {
                    continue;
                }
            }
            out.result(
                || {
                    let mode = format!(
                        "{}{}",
                        if et.read_kind.is_some() { "R" } else { "-" },
                        if et.write_kind.is_some() { "W" } else { "-" },
                    );
                    vec![
                        name.clone(),
                        format!("{:#06x}", et.address),
                        mode,
                        et.block_length.to_string(),
                        format!("{:?}", et.conversion),
                        et.unit.clone(),
                        et.description.clone(),
                    ]
                },
                || et,
            )?;
        }
        out.commit()?;
        dev.close();
        Ok(())
    }
}

pub mod read {
    use super::*;
    use crate::codec::Value;
    use crate::output;

    /// Read one or more event types and print their decoded values.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        catalogs: CatalogArgs,
        #[clap(flatten)]
        output: output::Args,
        /// Event type names, as listed by `events`.
        #[arg(required = true)]
        names: Vec<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the runtime")]
        Runtime(#[source] std::io::Error),
        #[error(transparent)]
        Setup(#[from] SetupError),
        #[error(transparent)]
        Output(#[from] output::Error),
        #[error("could not read `{1}`")]
        Read(#[source] device::Error, String),
    }

    #[derive(serde::Serialize)]
    struct Reading<'a> {
        name: &'a str,
        value: &'a Value,
        unit: &'a str,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        runtime().map_err(Error::Runtime)?.block_on(run_inner(args))
    }

    async fn run_inner(args: Args) -> Result<(), Error> {
        let dev = open_device(&args.connection, &args.catalogs).await?;
        let mut out = args.output.to_output()?;
        out.table_headers(vec!["Name", "Value", "Unit"]);
        for name in &args.names {
            let value = dev.vread(name).await.map_err(|e| Error::Read(e, name.clone()))?;
            let unit = dev
                .data_point()
                .event_types
                .get(name)
                .map(|et| et.unit.as_str())
                .unwrap_or("");
            out.result(
                || vec![name.clone(), value.to_string(), unit.to_string()],
                || Reading { name, value: &value, unit },
            )?;
        }
        out.commit()?;
        dev.close();
        Ok(())
    }
}

pub mod write {
    use super::*;
    use crate::codec;

    /// Write a value to one event type.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        catalogs: CatalogArgs,
        /// Event type name, as listed by `events`.
        name: String,
        /// The value, in the shape the event type's conversion expects
        /// (number, duration, timestamp or `now`, or hex bytes).
        value: String,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the runtime")]
        Runtime(#[source] std::io::Error),
        #[error(transparent)]
        Setup(#[from] SetupError),
        #[error(transparent)]
        Device(#[from] device::Error),
        #[error(transparent)]
        Value(#[from] codec::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        runtime().map_err(Error::Runtime)?.block_on(run_inner(args))
    }

    async fn run_inner(args: Args) -> Result<(), Error> {
        let dev = open_device(&args.connection, &args.catalogs).await?;
        let codec = dev
            .data_point()
            .event_types
            .get(&args.name)
            .ok_or_else(|| device::Error::NotFound(args.name.clone()))?
            .codec;
        let value = codec::parse_value(codec, &args.value)?;
        dev.vwrite(&args.name, &value).await?;
        info!(message = "written", name = %args.name, value = %value);
        dev.close();
        Ok(())
    }
}

pub mod raw {
    use super::*;
    use crate::protocol::{Command, CommandKind};

    /// Read raw bytes from a register address, without the catalogs.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        /// Register address, e.g. `0x00f8`.
        address: String,
        /// Number of bytes to read.
        #[arg(default_value = "1")]
        length: u8,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the runtime")]
        Runtime(#[source] std::io::Error),
        #[error(transparent)]
        Connect(#[from] connection::Error),
        #[error("`{0}` is not a register address")]
        Address(String),
        #[error(transparent)]
        Command(#[from] crate::protocol::CommandError),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        runtime().map_err(Error::Runtime)?.block_on(run_inner(args))
    }

    async fn run_inner(args: Args) -> Result<(), Error> {
        let address = args
            .address
            .strip_prefix("0x")
            .or_else(|| args.address.strip_prefix("0X"))
            .map_or_else(|| args.address.parse().ok(), |hex| u16::from_str_radix(hex, 16).ok())
            .ok_or_else(|| Error::Address(args.address.clone()))?;
        let dev = device::Device::connect(&args.connection).await?;
        let result = dev
            .raw_cmd(Command::read(CommandKind::P300Read, address, args.length))
            .await;
        if let Some(error) = result.error {
            return Err(error.into());
        }
        println!("{}", encode_hex(&result.body));
        dev.close();
        Ok(())
    }
}
