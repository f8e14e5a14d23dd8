use std::sync::Arc;

use clap::Subcommand;
use svcql_core::cache::ExecutorCache;
use svcql_core::config::host::describe_settings;
use svcql_core::protocol::RowStreamReader;
use svcql_core::types::Parameters;
use svcql_error::Result;

use crate::args::{QueryArgs, ServeArgs};
use crate::server::{QueryHandler, Server};
use crate::services::ServiceCatalog;

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a single query and print the results.
    Query(QueryArgs),
    /// Serve the query and remote control protocols over TCP.
    Serve(ServeArgs),
    /// List the host settings read from properties files.
    Settings,
}

impl Commands {
    pub fn run(self) -> Result<()> {
        match self {
            Commands::Query(args) => run_query(args),
            Commands::Serve(args) => run_serve(args),
            Commands::Settings => {
                for (name, description) in describe_settings() {
                    println!("{name:<24} {description}");
                }
                Ok(())
            }
        }
    }
}

fn run_query(args: QueryArgs) -> Result<()> {
    let catalog = ServiceCatalog::load(&args.config.services)?;
    let cache = Arc::new(ExecutorCache::new(args.config.cache_config()));
    let handler = QueryHandler::new(catalog, args.config.execution_config()?, cache);

    let parameters: Parameters = args.params.into_iter().collect();
    let bytes = handler.execute(&args.sql, args.row_limit, &parameters, Vec::new())?;

    let mut reader = RowStreamReader::new(bytes.as_slice());
    reader.read_preamble()?;
    let result = reader.read_to_end()?;
    if let Some(schema) = &result.schema {
        println!("{}", schema.names().collect::<Vec<_>>().join("\t"));
    }
    for row in &result.rows {
        let values: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        println!("{}", values.join("\t"));
    }
    Ok(())
}

fn run_serve(args: ServeArgs) -> Result<()> {
    let catalog = ServiceCatalog::load(&args.config.services)?;
    let cache = Arc::new(ExecutorCache::new(args.config.cache_config()));
    let handler = Arc::new(QueryHandler::new(
        catalog,
        args.config.execution_config()?,
        cache,
    ));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("svcql_server")
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let server = Server::bind(handler, &args.listen).await?;
        server.serve().await
    })
}
