use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use aspects::protocol::encode_neighbours;
use aspects::{
    DataType, DistanceType, IndexEngine, IndexInfo, Params, SchemaStream, Session, SessionConfig,
    VectorDB, VectorStream, WireReader,
};

#[derive(Parser)]
#[command(name = "aspects")]
#[command(about = "Vector index engine speaking the packed stream protocol over stdio")]
#[command(group(ArgGroup::new("mode").required(true).args(["init", "train", "search", "host"])))]
struct Cli {
    /// Create a new index in --output
    #[arg(long)]
    init: bool,

    /// Read a vector stream from stdin and train the index in --input
    #[arg(long)]
    train: bool,

    /// Read a vector stream from stdin and write the neighbours to stdout
    #[arg(long)]
    search: bool,

    /// Serve back-to-back commands over stdin/stdout
    #[arg(long)]
    host: bool,

    /// With --init, read a schema stream from stdin
    #[arg(short, long)]
    schema: bool,

    /// Directory of an existing index
    #[arg(long)]
    input: Option<PathBuf>,

    /// Directory for a new index (must exist)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Neighbours per query
    #[arg(short = 'k', long = "neighbours", default_value = "10")]
    neighbours: u32,

    /// Id size in bytes for a new index
    #[arg(long, default_value = "8")]
    id_size: u32,

    /// Dimensions for a new index; 0 derives them from the schema
    #[arg(long, default_value = "0")]
    num_dims: u32,

    #[arg(long, value_enum, default_value = "float")]
    data_type: DataTypeArg,

    #[arg(long, value_enum, default_value = "cosine")]
    distance_type: DistanceTypeArg,

    /// Threads executing host-mode commands (default: available cores)
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long, default_value = "200")]
    ef_construction: usize,

    #[arg(long, default_value = "50")]
    ef_search: usize,
}

#[derive(Clone, Copy, ValueEnum)]
enum DataTypeArg {
    Float,
    Double,
}

impl From<DataTypeArg> for DataType {
    fn from(arg: DataTypeArg) -> Self {
        match arg {
            DataTypeArg::Float => DataType::Float,
            DataTypeArg::Double => DataType::Double,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum DistanceTypeArg {
    Manhattan,
    Euclidean,
    Dotproduct,
    Cosine,
}

impl From<DistanceTypeArg> for DistanceType {
    fn from(arg: DistanceTypeArg) -> Self {
        match arg {
            DistanceTypeArg::Manhattan => DistanceType::Manhattan,
            DistanceTypeArg::Euclidean => DistanceType::Euclidean,
            DistanceTypeArg::Dotproduct => DistanceType::DotProduct,
            DistanceTypeArg::Cosine => DistanceType::Cosine,
        }
    }
}

impl Cli {
    fn params(&self) -> Params {
        Params {
            ef_construction: self.ef_construction,
            ef_search: self.ef_search,
        }
    }

    fn input_dir(&self) -> Result<&PathBuf> {
        match &self.input {
            Some(dir) => Ok(dir),
            None => bail!("--input <dir> is required"),
        }
    }
}

fn init(cli: &Cli) -> Result<()> {
    let Some(dir) = &cli.output else {
        bail!("--output <dir> is required with --init");
    };
    let schema = if cli.schema {
        let mut reader = WireReader::new(BufReader::new(io::stdin()));
        SchemaStream::decode(&mut reader).context("failed to read schema stream")?
    } else {
        SchemaStream::default()
    };
    let info = IndexInfo {
        id_size: cli.id_size,
        num_dims: cli.num_dims,
        data_type: cli.data_type.into(),
        distance_type: cli.distance_type.into(),
        schema,
    };
    VectorDB::<12, 24>::create_with_params(dir, info, cli.params())?;
    Ok(())
}

fn train(cli: &Cli) -> Result<()> {
    let db = VectorDB::<12, 24>::open_with_params(cli.input_dir()?, cli.params())?;
    let mut reader = WireReader::new(BufReader::new(io::stdin()));
    let vectors = VectorStream::decode(&mut reader).context("failed to read vector stream")?;
    let count = vectors.len();
    db.train(vectors)?;
    db.save()?;
    tracing::info!(count, "trained");
    Ok(())
}

fn search(cli: &Cli) -> Result<()> {
    let db = VectorDB::<12, 24>::open_with_params(cli.input_dir()?, cli.params())?;
    let mut reader = WireReader::new(BufReader::new(io::stdin()));
    let queries = VectorStream::decode(&mut reader).context("failed to read vector stream")?;
    let neighbours = db.search(&queries, cli.neighbours)?;
    let mut out = BufWriter::new(io::stdout());
    encode_neighbours(&neighbours, &mut out)?;
    out.flush()?;
    Ok(())
}

fn host(cli: &Cli) -> Result<()> {
    let db = VectorDB::<12, 24>::open_with_params(cli.input_dir()?, cli.params())?;
    let config = cli
        .workers
        .map(SessionConfig::with_workers)
        .unwrap_or_default();
    let summary = Session::new(&db, config)?.run(
        BufReader::new(io::stdin()),
        BufWriter::new(io::stdout()),
    )?;
    tracing::info!(commands = summary.commands, "host session finished");
    Ok(())
}

fn main() -> ExitCode {
    // stdout carries the protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = if cli.init {
        init(&cli)
    } else if cli.train {
        train(&cli)
    } else if cli.search {
        search(&cli)
    } else {
        host(&cli)
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("fatal: {err:#}");
            ExitCode::FAILURE
        }
    }
}
