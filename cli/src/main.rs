use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{debug, info};
use oxigraph::io::{RdfFormat, RdfParser};
use oxigraph::model::Triple;
use rdfpool::io::SPARQL;
use rdfpool::{ConcurrentWriter, OxigraphSessionFactory, ReadOptions, ResultIter, WriterConfig};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "rdfpool")]
#[command(about = "Load and query RDF data through a buffered, pooled writer")]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Verbose mode - sets the RUST_LOG level to info, defaults to warning level
    #[clap(long, short, action, default_value = "false", global = true)]
    verbose: bool,
    /// Debug mode - sets the RUST_LOG level to debug, defaults to warning level
    #[clap(long, action, default_value = "false", global = true)]
    debug: bool,
    /// JSON file with writer settings; missing fields take their defaults
    #[clap(long, short, global = true)]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse an RDF file and write its triples into a store
    Load {
        /// The file to load
        file: PathBuf,
        /// Directory of an on-disk store; an in-memory store is used if omitted
        #[clap(long, short)]
        store: Option<PathBuf>,
        /// Input format (ttl, nt, xml); guessed from the file extension if omitted
        #[clap(long, short)]
        format: Option<String>,
    },
    /// Run a SPARQL SELECT or ASK query and print the rows
    Query {
        /// The query text
        query: String,
        /// Directory of an on-disk store
        #[clap(long, short)]
        store: Option<PathBuf>,
        /// Print at most this many rows
        #[clap(long, short)]
        limit: Option<usize>,
        /// Suppress duplicate rows
        #[clap(long, action, default_value = "false")]
        distinct: bool,
    },
    /// Print the effective writer configuration
    Config {
        /// Also write it as JSON to this file
        #[clap(long)]
        file: Option<PathBuf>,
    },
}

fn rdf_format(file: &Path, format: Option<&str>) -> Result<RdfFormat> {
    let name = match format {
        Some(name) => name.to_string(),
        None => file
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("ttl")
            .to_string(),
    };
    match name.as_str() {
        "ttl" | "turtle" | "n3" => Ok(RdfFormat::Turtle),
        "nt" | "ntriples" => Ok(RdfFormat::NTriples),
        "xml" | "rdf" => Ok(RdfFormat::RdfXml),
        other => Err(anyhow!("Unsupported RDF format: {}", other)),
    }
}

fn open_factory(store: Option<&Path>) -> Result<Arc<OxigraphSessionFactory>> {
    let factory = match store {
        Some(path) => OxigraphSessionFactory::open(path)?,
        None => OxigraphSessionFactory::in_memory()?,
    };
    Ok(Arc::new(factory))
}

fn load(config: WriterConfig, file: &Path, store: Option<&Path>, format: Option<&str>) -> Result<()> {
    let format = rdf_format(file, format)?;
    let factory = open_factory(store)?;
    let chunk_size = config.auto_flush_size;
    let writer = ConcurrentWriter::new(factory.clone(), config)?;

    let reader = BufReader::new(std::fs::File::open(file)?);
    let mut chunk: Vec<Triple> = Vec::with_capacity(chunk_size);
    let mut count = 0;
    for quad in RdfParser::from_format(format).for_reader(reader) {
        let quad = quad?;
        chunk.push(Triple::new(quad.subject, quad.predicate, quad.object));
        count += 1;
        if chunk.len() >= chunk_size {
            writer.add(std::mem::take(&mut chunk), false)?;
        }
    }
    writer.add(chunk, false)?;
    // close only logs a failed final flush
    let flushed = writer.flush_buffer()?;
    debug!("Final flush wrote {} updates", flushed);
    writer.close()?;
    info!("Read {} triples from {}", count, file.display());
    println!(
        "Loaded {} triples from {} ({} in store)",
        count,
        file.display(),
        factory.len()?
    );
    Ok(())
}

fn query(
    config: WriterConfig,
    text: &str,
    store: Option<&Path>,
    limit: Option<usize>,
    distinct: bool,
) -> Result<()> {
    let factory = open_factory(store)?;
    let writer = ConcurrentWriter::new(factory, config)?;
    let mut options = ReadOptions::new();
    if let Some(limit) = limit {
        options = options.with_limit(limit);
    }
    if distinct {
        options = options.distinct();
    }
    let mut rows = writer.find_tuples(SPARQL, text, options)?;
    let mut printed = 0;
    for row in rows.by_ref() {
        println!("{}", row?);
        printed += 1;
    }
    rows.close()?;
    info!("Printed {} rows", printed);
    writer.close()?;
    Ok(())
}

fn main() -> Result<()> {
    let cmd = Cli::parse();

    rdfpool::init_logging();
    let log_level = if cmd.verbose { "info" } else { "warn" };
    let log_level = if cmd.debug { "debug" } else { log_level };
    if std::env::var("RDFPOOL_LOG").is_err() {
        std::env::set_var("RUST_LOG", log_level);
    }
    env_logger::init();

    let config = match &cmd.config {
        Some(path) => WriterConfig::from_file(path)?,
        None => WriterConfig::default(),
    };
    if cmd.verbose || cmd.debug {
        config.print();
    }

    match cmd.command {
        Commands::Load {
            file,
            store,
            format,
        } => load(config, &file, store.as_deref(), format.as_deref()),
        Commands::Query {
            query: text,
            store,
            limit,
            distinct,
        } => query(config, &text, store.as_deref(), limit, distinct),
        Commands::Config { file } => {
            config.print();
            if let Some(file) = file {
                config.save_to_file(&file)?;
                println!("Wrote configuration to {}", file.display());
            }
            Ok(())
        }
    }
}
